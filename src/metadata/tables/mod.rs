//! Metadata table descriptors from the `#~`/`#-` stream.
//!
//! The tables stream begins with an 8-byte header (reserved, schema major
//! and minor, the heap-sizes byte, reserved), two 64-bit bit-vectors
//! (`valid` and `sorted`), and one 32-bit row count for each set bit of
//! `valid`. Bits 0/1/2 of the heap-sizes byte widen the string, GUID and
//! blob heap indexes from two bytes to four.
//!
//! Table ids above [`TABLE_LAST`] are disallowed by the format; a set bit
//! up there is reported and skipped without consuming a row count, so the
//! first row of the first table always sits at `24 + 4 * k`, where `k` is
//! the number of row counts actually read.
//!
//! # Reference
//! - [ECMA-335 II.24.2.6](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

pub mod schema;

use log::warn;
use strum::IntoEnumIterator;

use crate::{
    file::io::{read_le, read_le_at},
    Error::OutOfBounds,
    Result,
};

/// The highest legal table index in the `valid` bit-vector.
pub const TABLE_LAST: usize = 0x2D;
/// Number of slots in the per-table descriptor array.
pub const TABLE_MAX: usize = 64;

/// Flag value in the File table marking a row without metadata.
pub const FILE_CONTAINS_NO_METADATA: u32 = 0x0001;

/// Identifiers of the metadata tables defined by the standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TableId {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    Constant = 0x0B,
    CustomAttribute = 0x0C,
    FieldMarshal = 0x0D,
    DeclSecurity = 0x0E,
    ClassLayout = 0x0F,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    ImplMap = 0x1C,
    FieldRva = 0x1D,
    EncLog = 0x1E,
    EncMap = 0x1F,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOs = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOs = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
}

/// Descriptor of one metadata table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableInfo {
    /// Number of rows in the table
    pub rows: u32,
    /// Size of one row in bytes, as computed from the schema
    pub row_size: u32,
    /// Offset of the first row, relative to the tables stream
    pub base: u32,
}

/// The decoded tables stream: schema version, bit-vectors, heap index
/// widths and the per-table descriptors.
pub struct TableSet {
    /// Major version of the table schema
    pub major_version: u8,
    /// Minor version of the table schema
    pub minor_version: u8,
    /// Bit-vector of present tables
    pub valid: u64,
    /// Bit-vector of sorted tables
    pub sorted: u64,
    /// String heap indexes are 4 bytes wide
    pub wide_string: bool,
    /// GUID heap indexes are 4 bytes wide
    pub wide_guid: bool,
    /// Blob heap indexes are 4 bytes wide
    pub wide_blob: bool,
    /// Per-table descriptors, indexed by table id
    pub tables: [TableInfo; TABLE_MAX],
    /// Offset of the first table row, relative to the tables stream
    pub tables_base: u32,
}

impl TableSet {
    /// Decode the tables stream header and compute the table layout.
    ///
    /// ## Arguments
    /// * 'data' - The complete `#~` or `#-` stream
    ///
    /// # Errors
    /// Returns an error if the stream is too short, no table is present,
    /// or the declared rows do not fit within the stream.
    pub fn decode(data: &[u8]) -> Result<TableSet> {
        if data.len() < 24 {
            return Err(OutOfBounds);
        }

        let heap_sizes = data[6];
        let valid = read_le::<u64>(&data[8..])?;
        let sorted = read_le::<u64>(&data[16..])?;

        if valid == 0 {
            return Err(malformed_error!("No valid rows in any of the tables"));
        }

        let mut set = TableSet {
            major_version: data[4],
            minor_version: data[5],
            valid,
            sorted,
            wide_string: heap_sizes & 0x01 != 0,
            wide_guid: heap_sizes & 0x02 != 0,
            wide_blob: heap_sizes & 0x04 != 0,
            tables: [TableInfo::default(); TABLE_MAX],
            tables_base: 0,
        };

        let mut cursor = 24_usize;
        let mut consumed = 0_u32;
        for table in 0..TABLE_MAX {
            if valid & (1_u64 << table) == 0 {
                continue;
            }
            if table > TABLE_LAST {
                warn!("bits in valid must be zero above 0x2d (II - 23.1.6)");
                continue;
            }

            set.tables[table].rows = read_le_at::<u32>(data, &mut cursor)?;
            consumed += 1;
        }

        set.tables_base = 24 + 4 * consumed;
        // the row-count cursor and the computed base must agree
        debug_assert_eq!(cursor, set.tables_base as usize);

        let mut running = u64::from(set.tables_base);
        for table_id in TableId::iter() {
            let rows = set.tables[table_id as usize].rows;
            if rows == 0 {
                continue;
            }

            let row_size = schema::row_size(table_id, &set);
            let info = &mut set.tables[table_id as usize];
            info.row_size = row_size;
            info.base = u32::try_from(running)
                .map_err(|_| malformed_error!("Table data exceeds stream bounds"))?;
            running += u64::from(row_size) * u64::from(rows);
        }

        if running > data.len() as u64 {
            return Err(malformed_error!(
                "Declared table rows extend past the tables stream - {} > {}",
                running,
                data.len()
            ));
        }

        Ok(set)
    }

    #[cfg(test)]
    /// Special constructor for unit-tests
    ///
    /// ## Arguments
    /// * 'valid_tables' - A slice of tuples providing (table_id, row_count) of the valid tables
    pub(crate) fn new_test(valid_tables: &[(TableId, u32)]) -> TableSet {
        let mut set = TableSet {
            major_version: 2,
            minor_version: 0,
            valid: 0,
            sorted: 0,
            wide_string: false,
            wide_guid: false,
            wide_blob: false,
            tables: [TableInfo::default(); TABLE_MAX],
            tables_base: 24,
        };

        for (id, rows) in valid_tables {
            set.valid |= 1_u64 << (*id as usize);
            set.tables[*id as usize].rows = *rows;
        }
        set.tables_base = 24 + 4 * set.valid.count_ones();

        set
    }

    /// Returns the descriptor for a table.
    ///
    /// ## Arguments
    /// * 'id' - The table to look up
    #[must_use]
    pub fn info(&self, id: TableId) -> &TableInfo {
        &self.tables[id as usize]
    }

    /// Returns the number of rows in a table, zero when absent.
    ///
    /// ## Arguments
    /// * 'id' - The table to look up
    #[must_use]
    pub fn rows(&self, id: TableId) -> u32 {
        self.tables[id as usize].rows
    }
}
