//! Endian-safe primitive readers for PE and metadata parsing.
//!
//! This module provides the [`LeRead`] trait for safe reading of primitive
//! integer types from byte slices. All multi-byte fields of a CLI image are
//! little-endian on disk, so every read goes through these helpers to stay
//! correct on big-endian hosts.

use crate::{Error::OutOfBounds, Result};

/// Trait for types that can be read from a byte buffer with an explicit
/// byte order.
///
/// Implemented for the unsigned integer widths that occur in PE headers and
/// metadata streams. Reads never sign-extend.
pub trait LeRead: Sized {
    #[allow(missing_docs)]
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]>;

    /// Read `Self` from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
    /// Read `Self` from a byte buffer in big-endian
    fn from_be_bytes(bytes: Self::Bytes) -> Self;
}

impl LeRead for u8 {
    type Bytes = [u8; 1];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        u8::from_le_bytes(bytes)
    }

    fn from_be_bytes(bytes: Self::Bytes) -> Self {
        u8::from_be_bytes(bytes)
    }
}

impl LeRead for u16 {
    type Bytes = [u8; 2];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        u16::from_le_bytes(bytes)
    }

    fn from_be_bytes(bytes: Self::Bytes) -> Self {
        u16::from_be_bytes(bytes)
    }
}

impl LeRead for u32 {
    type Bytes = [u8; 4];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        u32::from_le_bytes(bytes)
    }

    fn from_be_bytes(bytes: Self::Bytes) -> Self {
        u32::from_be_bytes(bytes)
    }
}

impl LeRead for u64 {
    type Bytes = [u8; 8];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        u64::from_le_bytes(bytes)
    }

    fn from_be_bytes(bytes: Self::Bytes) -> Self {
        u64::from_be_bytes(bytes)
    }
}

/// Safely read T in little-endian from the start of a data stream.
///
/// ## Arguments
/// * 'data' - The data buffer / stream to read from
///
/// # Errors
/// Returns [`OutOfBounds`] if the buffer is shorter than `size_of::<T>()`.
pub fn read_le<T: LeRead>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely read T from an offset in little-endian from a data stream.
///
/// ## Arguments
/// * 'data'    - The data buffer / stream to read from
/// * 'offset'  - An offset to read from, will be advanced by the amount of bytes read
///
/// # Errors
/// Returns [`OutOfBounds`] if the requested span exceeds the buffer.
pub fn read_le_at<T: LeRead>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };

    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Safely read 4 or 2 bytes from an offset in little-endian from a data stream.
///
/// Metadata heap and table indexes come in two widths; which one applies is
/// decided by the heap-sizes byte of the tables stream.
///
/// ## Arguments
/// * 'data'        - The data buffer / stream to read from
/// * 'offset'      - An offset to read from, will be advanced by the amount of bytes read
/// * `is_wide`     - Indicates if 4 or 2 bytes should be read
///
/// # Errors
/// Returns [`OutOfBounds`] if the requested span exceeds the buffer.
pub fn read_le_at_dyn(data: &[u8], offset: &mut usize, is_wide: bool) -> Result<u32> {
    let res = if is_wide {
        read_le_at::<u32>(data, offset)?
    } else {
        u32::from(read_le_at::<u16>(data, offset)?)
    };

    Ok(res)
}
