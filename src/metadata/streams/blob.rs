//! Blob heap (`#Blob`) access.
//!
//! Blobs carry binary payloads such as signatures, hash values, and public
//! keys. Each entry is prefixed with its size in a variable-width encoding:
//!
//! * first byte `0bbbbbbb` - the blob holds `bbbbbbb` bytes
//! * first bytes `10bbbbbb x` - the blob holds `(bbbbbb << 8) + x` bytes
//! * first bytes `110bbbbb x y z` - the blob holds
//!   `(bbbbb << 24) + (x << 16) + (y << 8) + z` bytes
//!
//! # Reference
//! - [ECMA-335 II.24.2.4](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{Error::OutOfBounds, Result};

/// View over the `#Blob` heap.
pub struct Blob<'a> {
    data: &'a [u8],
}

impl<'a> Blob<'a> {
    /// Create a `Blob` view from the heap bytes
    ///
    /// # Arguments
    /// * 'data'    - The byte slice of the heap
    ///
    /// # Errors
    /// Returns an error if the heap is empty or does not begin with the
    /// mandatory null entry
    pub fn from(data: &'a [u8]) -> Result<Blob<'a>> {
        if data.is_empty() || data[0] != 0 {
            return Err(malformed_error!("Invalid memory for #Blob heap"));
        }

        Ok(Blob { data })
    }

    /// Get the payload of the blob starting at the given heap offset
    ///
    /// ## Arguments
    /// * 'index' - The offset within the heap (comes from metadata tables)
    ///
    /// # Errors
    /// Returns an error if the index is out of bounds or the size prefix is
    /// not a valid encoding
    pub fn get(&self, index: usize) -> Result<&'a [u8]> {
        if index >= self.data.len() {
            return Err(OutOfBounds);
        }

        let first = self.data[index];
        let (skip, len) = if first & 0x80 == 0 {
            (1_usize, first as usize)
        } else if first & 0xC0 == 0x80 {
            if index + 1 >= self.data.len() {
                return Err(OutOfBounds);
            }
            (2, ((first & 0x3F) as usize) << 8 | self.data[index + 1] as usize)
        } else if first & 0xE0 == 0xC0 {
            if index + 3 >= self.data.len() {
                return Err(OutOfBounds);
            }
            (
                4,
                ((first & 0x1F) as usize) << 24
                    | (self.data[index + 1] as usize) << 16
                    | (self.data[index + 2] as usize) << 8
                    | self.data[index + 3] as usize,
            )
        } else {
            return Err(malformed_error!("Invalid blob index - {}", index));
        };

        let Some(data_start) = index.checked_add(skip) else {
            return Err(OutOfBounds);
        };

        let Some(data_end) = data_start.checked_add(len) else {
            return Err(OutOfBounds);
        };

        if data_end > self.data.len() {
            return Err(OutOfBounds);
        }

        Ok(&self.data[data_start..data_end])
    }
}
