//! Tunables for a box controller and its disk buffer.

use serde::{Deserialize, Serialize};

pub use mdbox_storage::StorageCacheConfig;

use crate::box_controller::{DEFAULT_MAX_DEPTH, DEFAULT_SPLIT_THRESHOLD};
use crate::Error;

/// How much memory the disk buffer may hold before it starts writing boxes
/// back to the backing file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Size in bytes of one value of a box payload on disk.  Must be
    /// positive.
    pub value_size_bytes: usize,

    /// Number of values the write buffer may hold before it evicts.  Must be
    /// positive.
    pub write_buffer_entries: usize,

    /// How the backing file interacts with the operating system's cache.
    pub storage_cache: StorageCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            value_size_bytes: 8,
            write_buffer_entries: 1 << 20,
            storage_cache: StorageCacheConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.value_size_bytes == 0 {
            return Err(Error::invalid(
                "value_size_bytes",
                "the size of a cached value must be positive",
            ));
        }
        if self.write_buffer_entries == 0 {
            return Err(Error::invalid(
                "write_buffer_entries",
                "a zero-sized write buffer cannot coalesce any writes",
            ));
        }
        Ok(())
    }
}

/// Splitting policy for a dataset's box tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxControllerConfig {
    /// A leaf holding more than this many values may split.
    pub split_threshold: usize,

    /// Boxes at this depth never split.
    pub max_depth: usize,

    /// Children per dimension when a box splits.  Either one entry, applied
    /// to every dimension, or one entry per dimension.
    pub split_into: Vec<usize>,

    /// Whether modified boxes are staged in the write buffer.
    pub use_write_buffer: bool,

    pub cache: CacheConfig,
}

impl Default for BoxControllerConfig {
    fn default() -> Self {
        Self {
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            max_depth: DEFAULT_MAX_DEPTH,
            split_into: vec![1],
            use_write_buffer: true,
            cache: CacheConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BoxControllerConfig, CacheConfig, StorageCacheConfig};
    use crate::Error;

    #[test]
    fn partial_json_takes_defaults() {
        let config: BoxControllerConfig = serde_json::from_str(
            r#"{"split_threshold": 50, "cache": {"write_buffer_entries": 64, "storage_cache": "direct_io"}}"#,
        )
        .unwrap();
        assert_eq!(config.split_threshold, 50);
        assert_eq!(config.max_depth, 1000);
        assert_eq!(config.split_into, vec![1]);
        assert_eq!(config.cache.value_size_bytes, 8);
        assert_eq!(config.cache.write_buffer_entries, 64);
        assert_eq!(config.cache.storage_cache, StorageCacheConfig::DirectIo);
    }

    #[test]
    fn validation_names_the_field() {
        let config = CacheConfig {
            value_size_bytes: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidArgument { name: "value_size_bytes", .. })
        ));

        let config = CacheConfig {
            write_buffer_entries: 0,
            ..CacheConfig::default()
        };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("write_buffer_entries"));
    }
}
