//! Metadata root header and stream directory.
//!
//! The metadata root is the entry point for reading CLI metadata. It starts
//! with the `BSJB` signature, carries the metadata version string, and
//! enumerates the named streams (`#~`/`#-`, `#Strings`, `#US`, `#Blob`,
//! `#GUID`) as offset/size pairs relative to the root itself. Stream names
//! outside the known set are skipped with a diagnostic; `#-` is the
//! uncompressed variant of the tables stream and is treated like `#~` with
//! a marker recorded.
//!
//! # Reference
//! - [ECMA-335 II.24.2.1](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use log::{info, warn};

use crate::{file::parser::Parser, Error::OutOfBounds, Result};

/// Magic signature for physical metadata: "BSJB"
pub const METADATA_SIGNATURE: u32 = 0x424A_5342;

/// Longest stream name accepted, terminator included.
const MAX_STREAM_NAME: usize = 32;

/// An offset/size pair locating one metadata stream.
///
/// The offset is relative to the metadata root; the image layer rebases it
/// onto the raw file data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSlice {
    /// Offset of the stream, relative to the metadata root
    pub offset: u32,
    /// Size of the stream in bytes
    pub size: u32,
}

impl StreamSlice {
    /// Returns `true` when the slice has been assigned from a stream header.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.size != 0
    }
}

/// The parsed metadata root: version information plus the located streams.
pub struct MetadataRoot {
    /// Metadata format major version
    pub version_major: u16,
    /// Metadata format minor version
    pub version_minor: u16,
    /// The version string, truncated at the first null byte
    pub version: String,
    /// The `#~` or `#-` tables stream
    pub tables: StreamSlice,
    /// The `#Strings` heap
    pub strings: StreamSlice,
    /// The `#US` user-string heap
    pub user_strings: StreamSlice,
    /// The `#Blob` heap
    pub blob: StreamSlice,
    /// The `#GUID` heap
    pub guid: StreamSlice,
    /// Set when the tables stream was named `#-`
    pub uncompressed: bool,
}

impl MetadataRoot {
    /// Reads a `MetadataRoot` from the raw metadata region.
    ///
    /// ## Arguments
    /// * 'data' - The metadata region, starting at the `BSJB` signature
    ///
    /// # Errors
    /// Returns an error if the signature is missing, the version string or
    /// any stream header runs past the region, or a stream points outside
    /// the region.
    pub fn read(data: &[u8]) -> Result<MetadataRoot> {
        let mut parser = Parser::new(data);

        let signature = parser.read_le::<u32>()?;
        if signature != METADATA_SIGNATURE {
            return Err(malformed_error!(
                "Metadata signature does not match - {:#x}",
                signature
            ));
        }

        let version_major = parser.read_le::<u16>()?;
        parser.advance_by(2)?; // reserved
        let version_minor = parser.read_le::<u16>()?;
        parser.advance_by(2)?; // reserved

        let version_string_len = parser.read_le::<u32>()? as usize;
        let version_bytes = parser.read_bytes(version_string_len)?;
        let terminated = version_bytes
            .iter()
            .position(|b| *b == 0)
            .map_or(version_bytes, |nul| &version_bytes[..nul]);
        let version = String::from_utf8_lossy(terminated).into_owned();

        parser.align(4)?;
        parser.advance_by(2)?; // flags, reserved
        let stream_count = parser.read_le::<u16>()?;

        let mut root = MetadataRoot {
            version_major,
            version_minor,
            version,
            tables: StreamSlice::default(),
            strings: StreamSlice::default(),
            user_strings: StreamSlice::default(),
            blob: StreamSlice::default(),
            guid: StreamSlice::default(),
            uncompressed: false,
        };

        for _ in 0..stream_count {
            let offset = parser.read_le::<u32>()?;
            let size = parser.read_le::<u32>()?;
            let name = parser.read_string_bounded(MAX_STREAM_NAME)?;

            match u32::checked_add(offset, size) {
                Some(end) => {
                    if end as usize > data.len() {
                        return Err(OutOfBounds);
                    }
                }
                None => {
                    return Err(malformed_error!(
                        "Stream '{}' offset and size cause integer overflow - {} + {}",
                        name,
                        offset,
                        size
                    ))
                }
            }

            let slice = StreamSlice { offset, size };
            match name.as_str() {
                "#~" => root.tables = slice,
                "#-" => {
                    root.tables = slice;
                    root.uncompressed = true;
                    info!("Image has the non-standard uncompressed metadata stream #-");
                }
                "#Strings" => root.strings = slice,
                "#US" => root.user_strings = slice,
                "#Blob" => root.blob = slice,
                "#GUID" => root.guid = slice,
                _ => warn!("Unknown metadata stream name: {}", name),
            }

            parser.align(4)?;
        }

        if root.guid.size < 16 {
            return Err(malformed_error!(
                "#GUID heap too small for a module identifier - {} bytes",
                root.guid.size
            ));
        }

        Ok(root)
    }
}
