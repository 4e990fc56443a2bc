//! Cursor-based byte stream parser for header and metadata decoding.
//!
//! The [`Parser`] type provides methods for reading primitive values,
//! seeking, aligning, and reading bounded null-terminated strings. It is
//! used by the PE header parser and the metadata root parser.
//!
//! # Example
//!
//! ```rust,no_run
//! use cilimage::Parser;
//! let data = [0x01, 0x02, 0x03, 0x04];
//! let mut parser = Parser::new(&data);
//! let value = parser.read_le::<u16>()?;
//! assert_eq!(value, 0x0201);
//! # Ok::<(), cilimage::Error>(())
//! ```

use crate::{
    file::io::{read_le_at, LeRead},
    Error::OutOfBounds,
    Result,
};

/// A bounds-checked cursor over a byte slice.
///
/// `Parser` maintains an internal position and validates every read against
/// the end of the data, so that truncated or hostile images produce an
/// error instead of a wild read. Strings are read against an explicit upper
/// bound so a missing terminator cannot walk into unparsed memory.
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new `Parser` from a byte slice
    ///
    /// ## Arguments
    /// * 'data' - The byte slice to read from
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the data
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the parser has no data
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if there is more data to parse
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Get the current position of the parser
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Move current position to N
    ///
    /// ## Arguments
    /// * 'pos' - The position to move the cursor to
    ///
    /// # Errors
    /// Returns [`OutOfBounds`] if position is beyond the data length
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(OutOfBounds);
        }

        self.position = pos;
        Ok(())
    }

    /// Move the position forward by N
    ///
    /// ## Arguments
    /// * 'step' - Amount of bytes to skip
    ///
    /// # Errors
    /// Returns [`OutOfBounds`] if advancing by step would exceed the data length
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        let Some(target) = self.position.checked_add(step) else {
            return Err(OutOfBounds);
        };

        if target > self.data.len() {
            return Err(OutOfBounds);
        }

        self.position = target;
        Ok(())
    }

    /// Align the position up to the next multiple of `alignment`
    ///
    /// # Errors
    /// Returns [`OutOfBounds`] if aligning would exceed the data length
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = (alignment - (self.position % alignment)) % alignment;
        if self.position + padding > self.data.len() {
            return Err(OutOfBounds);
        }
        self.position += padding;
        Ok(())
    }

    /// Read a type T from the current position in little-endian, and advance accordingly
    ///
    /// # Errors
    /// Returns [`OutOfBounds`] if reading would exceed the data length
    pub fn read_le<T: LeRead>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Read exactly `len` bytes and advance past them
    ///
    /// ## Arguments
    /// * 'len' - Amount of bytes to read
    ///
    /// # Errors
    /// Returns [`OutOfBounds`] if reading would exceed the data length
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let Some(end) = self.position.checked_add(len) else {
            return Err(OutOfBounds);
        };

        if end > self.data.len() {
            return Err(OutOfBounds);
        }

        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Reads an ASCII null-terminated string with an explicit length bound.
    ///
    /// The cursor advances past the terminator. If no terminator is found
    /// within `max` bytes of the current position (or before the end of the
    /// data), the read fails instead of walking further.
    ///
    /// ## Arguments
    /// * 'max' - The largest number of bytes the string may span, terminator included
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no terminator is found within the bound
    pub fn read_string_bounded(&mut self, max: usize) -> Result<String> {
        let limit = std::cmp::min(self.position.saturating_add(max), self.data.len());

        let mut end = self.position;
        while end < limit && self.data[end] != 0 {
            end += 1;
        }

        if end >= limit {
            return Err(malformed_error!(
                "Unterminated string at offset {}",
                self.position
            ));
        }

        let bytes = &self.data[self.position..end];
        self.position = end + 1;

        String::from_utf8(bytes.to_vec())
            .map_err(|_| malformed_error!("Invalid string at offset {}", end))
    }
}
