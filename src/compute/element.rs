//! Byte encoding of buffer elements in device memory.
//!
//! Device memory is untyped; every element type that can live in an
//! [`AcceleratedBuffer`](crate::buffer::AcceleratedBuffer) knows its size
//! and little-endian encoding.

pub trait DeviceElement: Copy + Default + Send + Sync + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;

    fn write_le(&self, out: &mut [u8]);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_device_element {
    ($($t:ty),*) => {
        $(
            impl DeviceElement for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn write_le(&self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_device_element!(u8, u16, u32, u64, i32, i64, f32, f64);

impl DeviceElement for bool {
    const SIZE: usize = 1;

    #[inline]
    fn write_le(&self, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Encode a slice into a fresh byte vector.
pub fn encode_slice<T: DeviceElement>(values: &[T]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * T::SIZE];
    for (chunk, v) in out.chunks_exact_mut(T::SIZE).zip(values) {
        v.write_le(chunk);
    }
    out
}

/// Decode `bytes` into `out`, which must hold exactly `bytes.len() / SIZE` elements.
pub fn decode_into<T: DeviceElement>(bytes: &[u8], out: &mut [T]) {
    for (chunk, v) in bytes.chunks_exact(T::SIZE).zip(out.iter_mut()) {
        *v = T::read_le(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_f32() {
        let values = [1.5f32, -2.25, 0.0, f32::MAX];
        let bytes = encode_slice(&values);
        assert_eq!(bytes.len(), 16);
        let mut back = [0f32; 4];
        decode_into(&bytes, &mut back);
        assert_eq!(back, values);
    }

    #[test]
    fn test_bool_is_one_byte() {
        let bytes = encode_slice(&[true, false, true]);
        assert_eq!(bytes, vec![1, 0, 1]);
    }
}
