//! Encoding of box payloads into fixed-size on-disk values.

use std::mem::size_of;

use crate::Error;

/// The in-memory contents of a box.
///
/// A payload is a sequence of values that each occupy exactly `value_size`
/// bytes on disk, where `value_size` is the disk buffer's configured value
/// size.  A payload type that cannot be laid out at that size refuses to
/// encode.
pub trait Payload: Send + Sync + Sized + 'static {
    /// Number of values in the payload.
    fn num_values(&self) -> usize;

    /// Appends exactly `num_values() * value_size` bytes to `out`.
    fn encode(&self, value_size: usize, out: &mut Vec<u8>) -> Result<(), Error>;

    /// Reconstructs a payload from bytes written by [Payload::encode].
    fn decode(bytes: &[u8], value_size: usize) -> Result<Self, Error>;
}

fn check_value_size(expected: usize, value_size: usize) -> Result<(), Error> {
    if expected == value_size {
        Ok(())
    } else {
        Err(Error::invalid(
            "value_size_bytes",
            format!("payload values are {expected} bytes but the disk buffer stores {value_size}-byte values"),
        ))
    }
}

fn check_multiple(len: usize, value_size: usize) -> Result<(), Error> {
    if len % value_size == 0 {
        Ok(())
    } else {
        Err(Error::invalid(
            "payload",
            format!("{len} bytes is not a whole number of {value_size}-byte values"),
        ))
    }
}

macro_rules! scalar_payload {
    ($($t:ty),*) => {
        $(
            impl Payload for Vec<$t> {
                fn num_values(&self) -> usize {
                    self.len()
                }

                fn encode(&self, value_size: usize, out: &mut Vec<u8>) -> Result<(), Error> {
                    check_value_size(size_of::<$t>(), value_size)?;
                    out.reserve(self.len() * value_size);
                    for value in self {
                        out.extend_from_slice(&value.to_le_bytes());
                    }
                    Ok(())
                }

                fn decode(bytes: &[u8], value_size: usize) -> Result<Self, Error> {
                    check_value_size(size_of::<$t>(), value_size)?;
                    check_multiple(bytes.len(), value_size)?;
                    Ok(bytes
                        .chunks_exact(value_size)
                        .map(|chunk| <$t>::from_le_bytes(chunk.try_into().unwrap()))
                        .collect())
                }
            }
        )*
    };
}

scalar_payload!(u32, u64, i32, i64, f32, f64);

/// Fixed-width records of `N` single-precision fields, for example an
/// event's signal, error, and coordinates.
impl<const N: usize> Payload for Vec<[f32; N]> {
    fn num_values(&self) -> usize {
        self.len()
    }

    fn encode(&self, value_size: usize, out: &mut Vec<u8>) -> Result<(), Error> {
        check_value_size(N * size_of::<f32>(), value_size)?;
        out.reserve(self.len() * value_size);
        for record in self {
            for field in record {
                out.extend_from_slice(&field.to_le_bytes());
            }
        }
        Ok(())
    }

    fn decode(bytes: &[u8], value_size: usize) -> Result<Self, Error> {
        check_value_size(N * size_of::<f32>(), value_size)?;
        check_multiple(bytes.len(), value_size)?;
        Ok(bytes
            .chunks_exact(value_size)
            .map(|chunk| {
                let mut record = [0.0; N];
                for (field, bytes) in record.iter_mut().zip(chunk.chunks_exact(size_of::<f32>())) {
                    *field = f32::from_le_bytes(bytes.try_into().unwrap());
                }
                record
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::Payload;
    use crate::Error;

    #[test]
    fn scalars_use_little_endian() {
        let mut out = Vec::new();
        vec![1u32, 0x0102_0304].encode(4, &mut out).unwrap();
        assert_eq!(out, vec![1, 0, 0, 0, 4, 3, 2, 1]);
        assert_eq!(Vec::<u32>::decode(&out, 4).unwrap(), vec![1, 0x0102_0304]);
    }

    #[test]
    fn mismatched_value_size_is_rejected() {
        let mut out = Vec::new();
        assert!(matches!(
            vec![1.0f64].encode(4, &mut out),
            Err(Error::InvalidArgument { name: "value_size_bytes", .. })
        ));
        assert!(Vec::<f64>::decode(&[0; 12], 8).is_err());
    }

    #[test]
    fn records() {
        let events = vec![[1.0f32, 0.5, -2.0], [3.0, 0.25, 4.0]];
        let mut out = Vec::new();
        events.encode(12, &mut out).unwrap();
        assert_eq!(out.len(), 24);
        assert_eq!(Vec::<[f32; 3]>::decode(&out, 12).unwrap(), events);
    }
}
