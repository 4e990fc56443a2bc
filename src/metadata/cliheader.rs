//! CLI runtime header parsing.
//!
//! The CLI header sits at the start of the data directory slot reserved for
//! the runtime and points at the metadata root, the managed resources, the
//! strong-name signature, and a set of further directories. The trailing
//! directories are required to be zero by the file format; images produced
//! by some toolchains violate that, so non-zero values are logged and
//! tolerated rather than rejected.
//!
//! # Reference
//! - [ECMA-335 II.25.3.3](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use log::warn;

use crate::{file::parser::Parser, pe::DataDirectory, Error::OutOfBounds, Result};

/// Size in bytes of the CLI header record read from the image.
pub const CLI_HEADER_SIZE: usize = 136;

/// The CLI runtime header.
///
/// Contains the metadata data-directory entry, entry-point token, flags,
/// runtime version, and further directory entries that must all be zero.
pub struct CliHeader {
    /// Size of the header in bytes
    pub size: u32,
    /// The minimum major runtime version required to run this image
    pub runtime_major: u16,
    /// The minor portion of the required runtime version
    pub runtime_minor: u16,
    /// Location of the metadata root
    pub metadata: DataDirectory,
    /// Runtime flags for this image
    pub flags: u32,
    /// Token of the entry-point method, or zero
    pub entry_point_token: u32,
    /// Location of the managed resource blob
    pub resources: DataDirectory,
    /// Location of the strong-name signature
    pub strong_name: DataDirectory,
    /// Must be zero
    pub code_manager_table: DataDirectory,
    /// Location of the vtable fixup array
    pub vtable_fixups: DataDirectory,
    /// Must be zero
    pub export_address_table_jumps: DataDirectory,
    /// Must be zero
    pub eeinfo_table: DataDirectory,
    /// Must be zero
    pub helper_table: DataDirectory,
    /// Must be zero
    pub dynamic_info: DataDirectory,
    /// Must be zero
    pub delay_load_info: DataDirectory,
    /// Must be zero
    pub module_image: DataDirectory,
    /// Must be zero
    pub external_fixups: DataDirectory,
    /// Must be zero
    pub ridmap: DataDirectory,
    /// Must be zero
    pub debug_map: DataDirectory,
    /// Must be zero
    pub ip_map: DataDirectory,
}

impl CliHeader {
    /// Read a `CliHeader` from a sequence of bytes.
    ///
    /// ## Arguments
    /// * 'data' - The byte slice from which this object shall be created
    ///
    /// # Errors
    /// Returns [`OutOfBounds`] if the data is too short for the full record.
    pub fn read(data: &[u8]) -> Result<CliHeader> {
        if data.len() < CLI_HEADER_SIZE {
            return Err(OutOfBounds);
        }

        let mut parser = Parser::new(data);

        let header = CliHeader {
            size: parser.read_le::<u32>()?,
            runtime_major: parser.read_le::<u16>()?,
            runtime_minor: parser.read_le::<u16>()?,
            metadata: DataDirectory::read(&mut parser)?,
            flags: parser.read_le::<u32>()?,
            entry_point_token: parser.read_le::<u32>()?,
            resources: DataDirectory::read(&mut parser)?,
            strong_name: DataDirectory::read(&mut parser)?,
            code_manager_table: DataDirectory::read(&mut parser)?,
            vtable_fixups: DataDirectory::read(&mut parser)?,
            export_address_table_jumps: DataDirectory::read(&mut parser)?,
            eeinfo_table: DataDirectory::read(&mut parser)?,
            helper_table: DataDirectory::read(&mut parser)?,
            dynamic_info: DataDirectory::read(&mut parser)?,
            delay_load_info: DataDirectory::read(&mut parser)?,
            module_image: DataDirectory::read(&mut parser)?,
            external_fixups: DataDirectory::read(&mut parser)?,
            ridmap: DataDirectory::read(&mut parser)?,
            debug_map: DataDirectory::read(&mut parser)?,
            ip_map: DataDirectory::read(&mut parser)?,
        };

        if header.eeinfo_table.rva != 0
            || header.helper_table.rva != 0
            || header.dynamic_info.rva != 0
            || header.delay_load_info.rva != 0
            || header.module_image.rva != 0
            || header.external_fixups.rva != 0
            || header.ridmap.rva != 0
            || header.debug_map.rva != 0
            || header.ip_map.rva != 0
        {
            warn!("CLI header fields which should be zero are not zero");
        }

        Ok(header)
    }
}
