//! GUID heap (`#GUID`) access.
//!
//! A sequence of 16-byte module identifiers. Indexes from metadata tables
//! are 1-based; index 0 means "no GUID". The first entry of the heap is the
//! module version identifier (MVID) of the image.
//!
//! # Reference
//! - [ECMA-335 II.24.2.5](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{Error::OutOfBounds, Result};

/// View over the `#GUID` heap.
pub struct Guid<'a> {
    data: &'a [u8],
}

impl<'a> Guid<'a> {
    /// Create a `Guid` view from the heap bytes
    ///
    /// # Arguments
    /// * 'data'    - The byte slice of the heap
    ///
    /// # Errors
    /// Returns an error if the heap cannot hold a single GUID
    pub fn from(data: &'a [u8]) -> Result<Guid<'a>> {
        if data.len() < 16 {
            return Err(malformed_error!("Data for #GUID heap is too small"));
        }

        Ok(Guid { data })
    }

    /// Returns the GUID at the specified 1-based index
    ///
    /// ## Arguments
    /// * 'index' - The index of the GUID (comes from metadata tables)
    ///
    /// # Errors
    /// Returns an error if the index is zero or past the end of the heap
    pub fn get(&self, index: usize) -> Result<uguid::Guid> {
        if index < 1 {
            return Err(OutOfBounds);
        }

        let offset = (index - 1) * 16;
        let Some(end) = offset.checked_add(16) else {
            return Err(OutOfBounds);
        };

        if end > self.data.len() {
            return Err(OutOfBounds);
        }

        let mut buffer = [0u8; 16];
        buffer.copy_from_slice(&self.data[offset..end]);

        Ok(uguid::Guid::from_bytes(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let data: [u8; 32] = [
            0x8e, 0x90, 0x37, 0xd4, 0xe6, 0x65, 0x7c, 0x48,
            0x97, 0x35, 0x7b, 0xdf, 0xf6, 0x99, 0xbe, 0xa5,
            0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA,
            0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA,
        ];

        let guids = Guid::from(&data).unwrap();

        assert_eq!(
            guids.get(1).unwrap(),
            uguid::guid!("d437908e-65e6-487c-9735-7bdff699bea5")
        );
        assert_eq!(
            guids.get(2).unwrap(),
            uguid::guid!("AAAAAAAA-AAAA-AAAA-AAAA-AAAAAAAAAAAA")
        );
        assert!(matches!(guids.get(3), Err(OutOfBounds)));
        assert!(matches!(guids.get(0), Err(OutOfBounds)));
    }

    #[test]
    fn heap_too_small() {
        let data = [0u8; 10];

        if Guid::from(&data).is_ok() {
            panic!("This should not be valid!")
        }
    }

    #[test]
    fn canonical_string_shape() {
        let data = [0x11u8; 16];
        let guids = Guid::from(&data).unwrap();
        let text = guids.get(1).unwrap().to_string();

        assert_eq!(text.len(), 36);
        for position in [8, 13, 18, 23] {
            assert_eq!(text.as_bytes()[position], b'-');
        }
    }
}
