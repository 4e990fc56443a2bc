//! String heap (`#Strings`) access.
//!
//! Stores the identifier strings other metadata tables reference by offset:
//! assembly names, module names, type and member names.
//!
//! # Reference
//! - [ECMA-335 II.24.2.3](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use std::{ffi::CStr, str};

use crate::{Error::OutOfBounds, Result};

/// View over the `#Strings` heap.
///
/// Offsets into this heap come from metadata table columns; entry 0 is
/// always the empty string, so a valid heap starts with a null byte.
pub struct Strings<'a> {
    data: &'a [u8],
}

impl<'a> Strings<'a> {
    /// Create a `Strings` view from the heap bytes
    ///
    /// # Arguments
    /// * 'data'    - The byte slice of the heap
    ///
    /// # Errors
    /// Returns an error if the heap is empty or does not begin with the
    /// mandatory null entry
    pub fn from(data: &'a [u8]) -> Result<Strings<'a>> {
        if data.is_empty() || data[0] != 0 {
            return Err(malformed_error!("Provided #Strings heap is empty"));
        }

        Ok(Strings { data })
    }

    /// Get the string starting at the given heap offset
    ///
    /// ## Arguments
    /// * 'index' - The offset within the heap (comes from metadata tables)
    ///
    /// # Errors
    /// Returns an error if the index is out of bounds, the string is not
    /// terminated, or the bytes are not valid UTF-8
    pub fn get(&self, index: usize) -> Result<&'a str> {
        if index >= self.data.len() {
            return Err(OutOfBounds);
        }

        match CStr::from_bytes_until_nul(&self.data[index..]) {
            Ok(result) => match result.to_str() {
                Ok(result) => Ok(result),
                Err(_) => Err(malformed_error!("Invalid string at index - {}", index)),
            },
            Err(_) => Err(malformed_error!("Invalid string at index - {}", index)),
        }
    }
}
