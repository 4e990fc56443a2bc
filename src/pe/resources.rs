//! Native PE resource directory walking.
//!
//! The `.rsrc` section holds a three-level tree: level 0 branches per
//! resource type, level 1 per named resource item, level 2 per language.
//! Each directory entry carries two 32-bit fields whose high bit
//! distinguishes a name string from a numeric ID, and a subdirectory from a
//! leaf. The walk here is depth-first and returns the first matching data
//! entry.
//!
//! Name matching at level 1 is a known gap: every entry is accepted there.
//! The caller-supplied name is threaded through the walk so a future
//! comparison has a place to live.

use crate::{file::io::read_le_at, Result};

/// High bit of a directory entry field: name-string / subdirectory marker.
const ENTRY_HIGH_BIT: u32 = 0x8000_0000;

/// Size in bytes of a resource directory header.
const DIRECTORY_HEADER_SIZE: usize = 16;
/// Size in bytes of one directory entry.
const DIRECTORY_ENTRY_SIZE: usize = 8;

/// A leaf of the resource tree, describing where the resource data lives.
///
/// All fields are converted from their on-disk little-endian form; the
/// returned value is an independent copy, detached from the image data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDataEntry {
    /// RVA of the resource data
    pub data_rva: u32,
    /// Size of the resource data in bytes
    pub size: u32,
    /// Code page used to decode the data
    pub codepage: u32,
    /// Reserved, normally zero
    pub reserved: u32,
}

struct DirEntry {
    name: u32,
    child: u32,
}

impl DirEntry {
    fn is_string(&self) -> bool {
        self.name & ENTRY_HIGH_BIT != 0
    }

    fn is_dir(&self) -> bool {
        self.child & ENTRY_HIGH_BIT != 0
    }

    fn id(&self) -> u32 {
        self.name & !ENTRY_HIGH_BIT
    }

    fn offset(&self) -> usize {
        (self.child & !ENTRY_HIGH_BIT) as usize
    }
}

fn read_entry(root: &[u8], offset: usize) -> Result<DirEntry> {
    let mut cursor = offset;
    Ok(DirEntry {
        name: read_le_at::<u32>(root, &mut cursor)?,
        child: read_le_at::<u32>(root, &mut cursor)?,
    })
}

fn entry_count(root: &[u8], dir_offset: usize) -> Result<usize> {
    let mut cursor = dir_offset + 12;
    let named = read_le_at::<u16>(root, &mut cursor)? as usize;
    let ids = read_le_at::<u16>(root, &mut cursor)? as usize;
    Ok(named + ids)
}

/// Searches the resource tree for a data entry matching `res_id` and
/// `lang_id`.
///
/// Level 0 matches numeric entries against `res_id`. Level 1 accepts every
/// entry (`_name` is reserved for a future string comparison). Level 2
/// matches numeric entries against `lang_id`, with `lang_id == 0` meaning
/// "any language"; string entries are rejected there.
///
/// ## Arguments
/// * 'root'    - The mapped resource directory, starting at the directory header
/// * 'res_id'  - The numeric resource type to look for
/// * 'lang_id' - The language to look for, or 0 for any
/// * '_name'   - Optional resource name, currently unused
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] when the tree structure runs past
/// the mapped directory data.
pub fn walk_resource_tree(
    root: &[u8],
    res_id: u32,
    lang_id: u32,
    _name: Option<&str>,
) -> Result<Option<ResourceDataEntry>> {
    let entries = entry_count(root, 0)?;

    for i in 0..entries {
        let entry = read_entry(root, DIRECTORY_HEADER_SIZE + i * DIRECTORY_ENTRY_SIZE)?;
        if let Some(found) = walk_entry(root, res_id, lang_id, _name, &entry, 0)? {
            return Ok(Some(found));
        }
    }

    Ok(None)
}

fn walk_entry(
    root: &[u8],
    res_id: u32,
    lang_id: u32,
    name: Option<&str>,
    entry: &DirEntry,
    level: u32,
) -> Result<Option<ResourceDataEntry>> {
    match level {
        0 => {
            if entry.is_string() || entry.id() != res_id {
                return Ok(None);
            }
        }
        1 => {
            // every entry matches; `name` is the seam for a future string compare
            let _ = name;
        }
        2 => {
            if entry.is_string() || (entry.id() != lang_id && lang_id != 0) {
                return Ok(None);
            }
        }
        _ => {
            return Err(malformed_error!(
                "Resource tree deeper than three levels at entry {:#x}",
                entry.child
            ))
        }
    }

    if entry.is_dir() {
        let dir_offset = entry.offset();
        let entries = entry_count(root, dir_offset)?;

        for i in 0..entries {
            let sub = read_entry(
                root,
                dir_offset + DIRECTORY_HEADER_SIZE + i * DIRECTORY_ENTRY_SIZE,
            )?;
            if let Some(found) = walk_entry(root, res_id, lang_id, name, &sub, level + 1)? {
                return Ok(Some(found));
            }
        }

        Ok(None)
    } else {
        let mut cursor = entry.offset();
        Ok(Some(ResourceDataEntry {
            data_rva: read_le_at::<u32>(root, &mut cursor)?,
            size: read_le_at::<u32>(root, &mut cursor)?,
            codepage: read_le_at::<u32>(root, &mut cursor)?,
            reserved: read_le_at::<u32>(root, &mut cursor)?,
        }))
    }
}
