//! Column layouts and the row-column decoder.
//!
//! The physical width of a table row depends on the sizes of everything it
//! references: string/GUID/blob heap indexes widen with the heap-sizes
//! byte, plain table indexes widen when the target table exceeds 65535
//! rows, and coded indexes widen when the largest member table no longer
//! fits beside the tag bits. This module holds the per-table column
//! layouts, computes row sizes from a decoded [`TableSet`], and decodes a
//! single cell to its raw value.
//!
//! Higher metadata layers build typed rows on top of [`row_col`]; the
//! loader itself uses it to pull the assembly and module names, module
//! references, File-table flags and the public-key blob index.
//!
//! # Reference
//! - [ECMA-335 II.22 and II.24.2.6](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{
    file::io::{read_le_at, read_le_at_dyn},
    metadata::tables::{TableId, TableSet},
    Result,
};

/// One column of a metadata table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// Fixed-width field of 2 or 4 bytes
    Fixed(u8),
    /// Index into the `#Strings` heap
    Str,
    /// Index into the `#GUID` heap
    Guid,
    /// Index into the `#Blob` heap
    Blob,
    /// Plain index into one table
    Table(TableId),
    /// Tagged index into one of several tables
    Coded(CodedIndex),
}

/// The coded-index families of the table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CodedIndex {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
}

impl CodedIndex {
    /// Number of tag bits occupied by the table selector.
    #[must_use]
    pub fn tag_bits(self) -> u32 {
        match self {
            CodedIndex::CustomAttributeType | CodedIndex::MemberRefParent => 3,
            CodedIndex::HasCustomAttribute => 5,
            CodedIndex::HasFieldMarshal
            | CodedIndex::HasSemantics
            | CodedIndex::MethodDefOrRef
            | CodedIndex::MemberForwarded
            | CodedIndex::TypeOrMethodDef => 1,
            _ => 2,
        }
    }

    /// The tables this family can point into.
    #[must_use]
    pub fn members(self) -> &'static [TableId] {
        use TableId::*;
        match self {
            CodedIndex::TypeDefOrRef => &[TypeDef, TypeRef, TypeSpec],
            CodedIndex::HasConstant => &[Field, Param, Property],
            CodedIndex::HasCustomAttribute => &[
                MethodDef,
                Field,
                TypeRef,
                TypeDef,
                Param,
                InterfaceImpl,
                MemberRef,
                Module,
                DeclSecurity,
                Property,
                Event,
                StandAloneSig,
                ModuleRef,
                TypeSpec,
                Assembly,
                AssemblyRef,
                File,
                ExportedType,
                ManifestResource,
                GenericParam,
                GenericParamConstraint,
                MethodSpec,
            ],
            CodedIndex::HasFieldMarshal => &[Field, Param],
            CodedIndex::HasDeclSecurity => &[TypeDef, MethodDef, Assembly],
            CodedIndex::MemberRefParent => &[TypeDef, TypeRef, ModuleRef, MethodDef, TypeSpec],
            CodedIndex::HasSemantics => &[Event, Property],
            CodedIndex::MethodDefOrRef => &[MethodDef, MemberRef],
            CodedIndex::MemberForwarded => &[Field, MethodDef],
            CodedIndex::Implementation => &[File, AssemblyRef, ExportedType],
            CodedIndex::CustomAttributeType => &[MethodDef, MemberRef],
            CodedIndex::ResolutionScope => &[Module, ModuleRef, AssemblyRef, TypeRef],
            CodedIndex::TypeOrMethodDef => &[TypeDef, MethodDef],
        }
    }

    /// Whether this coded index needs 4 bytes given the table cardinalities.
    #[must_use]
    pub fn is_wide(self, set: &TableSet) -> bool {
        let max_rows = self
            .members()
            .iter()
            .map(|id| set.tables[*id as usize].rows)
            .max()
            .unwrap_or(0);

        u64::from(max_rows) >= 1_u64 << (16 - self.tag_bits())
    }
}

/// The column layout of a table.
///
/// ## Arguments
/// * 'id' - The table whose layout is requested
#[must_use]
pub fn columns(id: TableId) -> &'static [Column] {
    use CodedIndex::*;
    use Column::*;
    use TableId as T;

    match id {
        T::Module => &[Fixed(2), Str, Guid, Guid, Guid],
        T::TypeRef => &[Coded(ResolutionScope), Str, Str],
        T::TypeDef => &[
            Fixed(4),
            Str,
            Str,
            Coded(TypeDefOrRef),
            Table(T::Field),
            Table(T::MethodDef),
        ],
        T::FieldPtr => &[Table(T::Field)],
        T::Field => &[Fixed(2), Str, Blob],
        T::MethodPtr => &[Table(T::MethodDef)],
        T::MethodDef => &[Fixed(4), Fixed(2), Fixed(2), Str, Blob, Table(T::Param)],
        T::ParamPtr => &[Table(T::Param)],
        T::Param => &[Fixed(2), Fixed(2), Str],
        T::InterfaceImpl => &[Table(T::TypeDef), Coded(TypeDefOrRef)],
        T::MemberRef => &[Coded(MemberRefParent), Str, Blob],
        T::Constant => &[Fixed(2), Coded(HasConstant), Blob],
        T::CustomAttribute => &[
            Coded(HasCustomAttribute),
            Coded(CustomAttributeType),
            Blob,
        ],
        T::FieldMarshal => &[Coded(HasFieldMarshal), Blob],
        T::DeclSecurity => &[Fixed(2), Coded(HasDeclSecurity), Blob],
        T::ClassLayout => &[Fixed(2), Fixed(4), Table(T::TypeDef)],
        T::FieldLayout => &[Fixed(4), Table(T::Field)],
        T::StandAloneSig => &[Blob],
        T::EventMap => &[Table(T::TypeDef), Table(T::Event)],
        T::EventPtr => &[Table(T::Event)],
        T::Event => &[Fixed(2), Str, Coded(TypeDefOrRef)],
        T::PropertyMap => &[Table(T::TypeDef), Table(T::Property)],
        T::PropertyPtr => &[Table(T::Property)],
        T::Property => &[Fixed(2), Str, Blob],
        T::MethodSemantics => &[Fixed(2), Table(T::MethodDef), Coded(HasSemantics)],
        T::MethodImpl => &[
            Table(T::TypeDef),
            Coded(MethodDefOrRef),
            Coded(MethodDefOrRef),
        ],
        T::ModuleRef => &[Str],
        T::TypeSpec => &[Blob],
        T::ImplMap => &[Fixed(2), Coded(MemberForwarded), Str, Table(T::ModuleRef)],
        T::FieldRva => &[Fixed(4), Table(T::Field)],
        T::EncLog => &[Fixed(4), Fixed(4)],
        T::EncMap => &[Fixed(4)],
        T::Assembly => &[
            Fixed(4),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(4),
            Blob,
            Str,
            Str,
        ],
        T::AssemblyProcessor => &[Fixed(4)],
        T::AssemblyOs => &[Fixed(4), Fixed(4), Fixed(4)],
        T::AssemblyRef => &[
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(4),
            Blob,
            Str,
            Str,
            Blob,
        ],
        T::AssemblyRefProcessor => &[Fixed(4), Table(T::AssemblyRef)],
        T::AssemblyRefOs => &[Fixed(4), Fixed(4), Fixed(4), Table(T::AssemblyRef)],
        T::File => &[Fixed(4), Str, Blob],
        T::ExportedType => &[Fixed(4), Fixed(4), Str, Str, Coded(Implementation)],
        T::ManifestResource => &[Fixed(4), Fixed(4), Str, Coded(Implementation)],
        T::NestedClass => &[Table(T::TypeDef), Table(T::TypeDef)],
        T::GenericParam => &[Fixed(2), Fixed(2), Coded(TypeOrMethodDef), Str],
        T::MethodSpec => &[Coded(MethodDefOrRef), Blob],
        T::GenericParamConstraint => &[Table(T::GenericParam), Coded(TypeDefOrRef)],
    }
}

/// Column index of the name string in the Module table.
pub const MODULE_NAME: usize = 1;
/// Column index of the name string in the ModuleRef table.
pub const MODULEREF_NAME: usize = 0;
/// Column index of the flags field in the File table.
pub const FILE_FLAGS: usize = 0;
/// Column index of the name string in the File table.
pub const FILE_NAME: usize = 1;
/// Column index of the public-key blob in the Assembly table.
pub const ASSEMBLY_PUBLIC_KEY: usize = 6;
/// Column index of the name string in the Assembly table.
pub const ASSEMBLY_NAME: usize = 7;

fn column_size(column: Column, set: &TableSet) -> u32 {
    match column {
        Column::Fixed(size) => u32::from(size),
        Column::Str => {
            if set.wide_string {
                4
            } else {
                2
            }
        }
        Column::Guid => {
            if set.wide_guid {
                4
            } else {
                2
            }
        }
        Column::Blob => {
            if set.wide_blob {
                4
            } else {
                2
            }
        }
        Column::Table(target) => {
            if set.tables[target as usize].rows > u32::from(u16::MAX) {
                4
            } else {
                2
            }
        }
        Column::Coded(coded) => {
            if coded.is_wide(set) {
                4
            } else {
                2
            }
        }
    }
}

/// Size in bytes of one row of `id`, given the decoded table cardinalities
/// and heap index widths.
///
/// ## Arguments
/// * 'id'  - The table whose row size is requested
/// * 'set' - The decoded table set supplying cardinalities and widths
#[must_use]
pub fn row_size(id: TableId, set: &TableSet) -> u32 {
    columns(id).iter().map(|c| column_size(*c, set)).sum()
}

/// Decodes one cell of a table row to its raw value.
///
/// Fixed fields yield their integer value; heap and table columns yield
/// the undecoded index. Rows are 0-based.
///
/// ## Arguments
/// * 'heap' - The complete tables stream
/// * 'set'  - The decoded table set
/// * 'id'   - The table to read from
/// * 'row'  - The 0-based row index
/// * 'col'  - The column index within the row
///
/// # Errors
/// Returns an error if the row or column does not exist or the cell lies
/// outside the stream.
pub fn row_col(heap: &[u8], set: &TableSet, id: TableId, row: u32, col: usize) -> Result<u32> {
    let info = &set.tables[id as usize];
    if row >= info.rows {
        return Err(malformed_error!(
            "Row {} out of range for table {:?} with {} rows",
            row,
            id,
            info.rows
        ));
    }

    let layout = columns(id);
    if col >= layout.len() {
        return Err(malformed_error!(
            "Column {} out of range for table {:?}",
            col,
            id
        ));
    }

    let mut offset = info.base as usize + (info.row_size as usize) * (row as usize);
    for column in &layout[..col] {
        offset += column_size(*column, set) as usize;
    }

    match layout[col] {
        Column::Fixed(2) => Ok(u32::from(read_le_at::<u16>(heap, &mut offset)?)),
        Column::Fixed(_) => read_le_at::<u32>(heap, &mut offset),
        other => read_le_at_dyn(heap, &mut offset, column_size(other, set) == 4),
    }
}
