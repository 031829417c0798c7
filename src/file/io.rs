//! Little-endian scalar encoding helpers for PE structures.
//!
//! Every field of the PE/COFF format is stored little-endian. This module provides the
//! [`crate::file::io::PeIO`] trait, implemented for the integer types that occur in PE headers,
//! together with bounds-checked free functions to decode and encode them from byte buffers.
//!
//! # Key Components
//!
//! - [`crate::file::io::PeIO`] - Conversion between a scalar and its fixed-size byte array
//! - [`crate::file::io::read_le`] / [`crate::file::io::read_le_at`] - Bounds-checked decoding
//! - [`crate::file::io::write_le`] / [`crate::file::io::write_le_at`] - Bounds-checked encoding
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use peimage::file::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 6];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 0x5A4D_u16)?;
//! write_le_at(&mut data, &mut offset, 0x80_u32)?;
//!
//! let mut offset = 0;
//! assert_eq!(read_le_at::<u16>(&data, &mut offset)?, 0x5A4D);
//! assert_eq!(read_le_at::<u32>(&data, &mut offset)?, 0x80);
//! # Ok::<(), peimage::Error>(())
//! ```
//!
//! # Error Handling
//!
//! All functions return [`crate::Error::OutOfBounds`] if there are insufficient bytes in the
//! buffer to complete the operation.

use crate::Result;

/// Trait for scalar types that can be decoded from and encoded to little-endian bytes.
///
/// The associated `Bytes` type is the fixed-size array representation of the scalar
/// (e.g. `[u8; 4]` for `u32`).
pub trait PeIO: Sized + Copy {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_pe_io {
    ($($ty:ty),*) => {
        $(
            impl PeIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_pe_io!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Safely reads a value of type `T` in little-endian byte order from the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le<T: PeIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at a specific offset.
///
/// On success the offset is advanced by the size of `T`; on failure it is left untouched.
///
/// # Arguments
///
/// * `data` - The byte buffer to read from
/// * `offset` - Mutable reference to the offset position (will be advanced after reading)
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at<T: PeIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };

    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Safely writes a value of type `T` in little-endian byte order to the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_le<T: PeIO>(data: &mut [u8], value: T) -> Result<()> {
    let mut offset = 0_usize;
    write_le_at(data, &mut offset, value)
}

/// Safely writes a value of type `T` in little-endian byte order at a specific offset.
///
/// On success the offset is advanced by the size of `T`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_le_at<T: PeIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();

    let Some(end) = offset.checked_add(bytes.len()) else {
        return Err(out_of_bounds_error!());
    };

    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_le_scalars() {
        assert_eq!(read_le::<u8>(&TEST_BUFFER).unwrap(), 0x01);
        assert_eq!(read_le::<u16>(&TEST_BUFFER).unwrap(), 0x0201);
        assert_eq!(read_le::<u32>(&TEST_BUFFER).unwrap(), 0x0403_0201);
        assert_eq!(read_le::<u64>(&TEST_BUFFER).unwrap(), 0x0807_0605_0403_0201);
        assert_eq!(read_le::<i8>(&[0xFF]).unwrap(), -1);
    }

    #[test]
    fn read_le_at_advances() {
        let mut offset = 2;
        assert_eq!(read_le_at::<u16>(&TEST_BUFFER, &mut offset).unwrap(), 0x0403);
        assert_eq!(offset, 4);
        assert_eq!(read_le_at::<u32>(&TEST_BUFFER, &mut offset).unwrap(), 0x0807_0605);
        assert_eq!(offset, 8);
    }

    #[test]
    fn read_le_out_of_bounds_keeps_offset() {
        let mut offset = 6;
        let result = read_le_at::<u32>(&TEST_BUFFER, &mut offset);
        assert!(matches!(result, Err(crate::Error::OutOfBounds { .. })));
        assert_eq!(offset, 6);

        let mut offset = usize::MAX;
        assert!(read_le_at::<u8>(&TEST_BUFFER, &mut offset).is_err());
    }

    #[test]
    fn write_le_at_advances() {
        let mut data = [0u8; 8];
        let mut offset = 0;
        write_le_at(&mut data, &mut offset, 0x0201_u16).unwrap();
        write_le_at(&mut data, &mut offset, 0x0605_0403_u32).unwrap();
        assert_eq!(offset, 6);
        assert_eq!(data, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x00, 0x00]);

        assert!(write_le_at(&mut data, &mut offset, 0_u32).is_err());
        assert_eq!(offset, 6);
    }

    #[test]
    fn write_le_start() {
        let mut data = [0u8; 2];
        write_le(&mut data, 0x5A4D_u16).unwrap();
        assert_eq!(&data, b"MZ");
        assert!(write_le(&mut data, 0_u64).is_err());
    }
}
