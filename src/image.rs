//! The image entity: a loaded CLI image and its random-access surface.
//!
//! An [`Image`] owns the raw bytes of one managed-code file together with
//! everything parsed out of them: the PE headers and section table, the
//! CLI header, the metadata root with its heap slices, and the decoded
//! table descriptors. All derived locations are stored as offsets into the
//! raw data; accessors hand out bounded slices.
//!
//! Images are created through [`crate::ImageRegistry`], which also owns
//! their lifecycle. The entity itself is immutable after construction,
//! with three deliberate exceptions: the lazily published child module and
//! file references, the assembly back-pointer set by the assembly layer,
//! and the name rewrite performed by debug teardown.

use std::{
    any::Any,
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, OnceLock, RwLock,
    },
};

use crossbeam_skiplist::SkipMap;

use crate::{
    file::{io::read_le_at, Backend, Memory, Physical, Shared},
    metadata::{
        cliheader::{CliHeader, CLI_HEADER_SIZE},
        root::MetadataRoot,
        streams::{Blob, Guid, Strings},
        tables::{schema, TableId, TableInfo, TableSet},
    },
    pe::{
        resources::{walk_resource_tree, ResourceDataEntry},
        PeInfo, DIR_CERTIFICATE, DIR_RESOURCE,
    },
    Error::Empty,
    Result,
};

/// Opaque handle to the assembly owning an image.
///
/// The assembly layer lives above this crate; the loader only stores the
/// handle, copies it into child modules, and lets callers compare it with
/// [`Arc::ptr_eq`]. It is never inspected.
pub type AssemblyHandle = Arc<dyn Any + Send + Sync>;

/// Opaque entry of a per-image cache.
///
/// The caches anchor collaborator-owned values (resolved methods, classes,
/// fields, wrappers, signatures) on the image lifetime; the loader creates
/// the maps empty and clears them at teardown.
pub type CacheEntry = Arc<dyn Any + Send + Sync>;

/// The auxiliary caches anchored on an image.
///
/// Contents are maintained by the metadata and runtime layers; keys are
/// metadata tokens (or hashes, for the signature cache).
pub struct ImageCaches {
    /// Resolved method cache
    pub methods: SkipMap<u32, CacheEntry>,
    /// Resolved class cache
    pub classes: SkipMap<u32, CacheEntry>,
    /// Resolved field cache
    pub fields: SkipMap<u32, CacheEntry>,
    /// Wrapper method cache
    pub wrappers: SkipMap<u32, CacheEntry>,
    /// Decoded signature cache
    pub signatures: SkipMap<u32, CacheEntry>,
}

impl ImageCaches {
    fn new() -> ImageCaches {
        ImageCaches {
            methods: SkipMap::new(),
            classes: SkipMap::new(),
            fields: SkipMap::new(),
            wrappers: SkipMap::new(),
            signatures: SkipMap::new(),
        }
    }

    pub(crate) fn clear(&self) {
        while self.methods.pop_front().is_some() {}
        while self.classes.pop_front().is_some() {}
        while self.fields.pop_front().is_some() {}
        while self.wrappers.pop_front().is_some() {}
        while self.signatures.pop_front().is_some() {}
    }
}

/// An offset/size pair locating a metadata heap within the raw data.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HeapSlice {
    offset: u32,
    size: u32,
}

pub(crate) struct MetadataInfo {
    version_major: u16,
    version_minor: u16,
    version: String,
    guid: String,
    uncompressed: bool,
    heap_tables: HeapSlice,
    heap_strings: HeapSlice,
    heap_us: HeapSlice,
    heap_blob: HeapSlice,
    heap_guid: HeapSlice,
    tables: TableSet,
    assembly_name: Option<String>,
    module_name: Option<String>,
}

/// A loaded CLI image.
///
/// Obtain instances through [`crate::ImageRegistry`]. The entity is
/// immutable after construction, with three deliberate exceptions: the
/// lazily published child module and file references, the assembly
/// back-pointer set by the assembly layer, and the name rewrite performed
/// by debug teardown.
pub struct Image {
    name: RwLock<String>,
    ref_only: bool,
    dynamic: bool,
    data: Box<dyn Backend>,
    file_backed: bool,
    ref_count: AtomicU32,
    pe: Option<PeInfo>,
    section_ptrs: Vec<OnceLock<u32>>,
    cli: Option<CliHeader>,
    md: Option<MetadataInfo>,
    pub(crate) modules: Vec<OnceLock<Option<Arc<Image>>>>,
    pub(crate) files: Vec<OnceLock<Option<Arc<Image>>>>,
    assembly: RwLock<Option<AssemblyHandle>>,
    caches: ImageCaches,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.name())
            .field("ref_only", &self.ref_only)
            .field("dynamic", &self.dynamic)
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Open and fully parse an image from a file on disk.
    pub(crate) fn open_file(
        path: &Path,
        name: String,
        ref_only: bool,
        care_about_cli: bool,
    ) -> Result<Image> {
        let backend = Physical::new(path)?;
        Image::load(Box::new(backend), name, ref_only, true, care_about_cli)
    }

    /// Open and fully parse an image from an owned buffer copy.
    pub(crate) fn open_memory(data: Vec<u8>, name: String, ref_only: bool) -> Result<Image> {
        Image::load(Box::new(Memory::new(data)), name, ref_only, false, true)
    }

    /// Open and fully parse an image borrowing a caller-retained buffer.
    pub(crate) fn open_shared(data: Arc<[u8]>, name: String, ref_only: bool) -> Result<Image> {
        Image::load(Box::new(Shared::new(data)), name, ref_only, false, true)
    }

    /// Creates an unparsed dynamic image skeleton.
    ///
    /// Dynamic images are produced in-process by an emit layer; the loader
    /// records the flag and skips all parsing. The returned image is not
    /// registered in any cache.
    ///
    /// ## Arguments
    /// * 'name' - The display name of the dynamic image
    #[must_use]
    pub fn new_dynamic(name: &str) -> Arc<Image> {
        Arc::new(Image {
            name: RwLock::new(name.to_string()),
            ref_only: false,
            dynamic: true,
            data: Box::new(Memory::new(Vec::new())),
            file_backed: false,
            ref_count: AtomicU32::new(1),
            pe: None,
            section_ptrs: Vec::new(),
            cli: None,
            md: None,
            modules: Vec::new(),
            files: Vec::new(),
            assembly: RwLock::new(None),
            caches: ImageCaches::new(),
        })
    }

    fn load(
        data: Box<dyn Backend>,
        name: String,
        ref_only: bool,
        file_backed: bool,
        care_about_cli: bool,
    ) -> Result<Image> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let pe = PeInfo::parse(data.data())?;
        let section_count = pe.sections.len();

        let mut cli = None;
        let mut md = None;
        let mut modules = Vec::new();
        let mut files = Vec::new();

        if care_about_cli {
            let cli_dir = pe.cli_directory();
            if cli_dir.rva == 0 {
                return Err(malformed_error!("Image has no CLI header directory"));
            }

            let cli_offset = pe
                .rva_to_offset(cli_dir.rva)
                .ok_or_else(|| malformed_error!("CLI header RVA {:#x} unmapped", cli_dir.rva))?;
            let header = CliHeader::read(data.data_slice(cli_offset as usize, CLI_HEADER_SIZE)?)?;

            let md_offset = pe.rva_to_offset(header.metadata.rva).ok_or_else(|| {
                malformed_error!("Metadata RVA {:#x} unmapped", header.metadata.rva)
            })?;
            let raw_md = data.data_slice(md_offset as usize, header.metadata.size as usize)?;
            let root = MetadataRoot::read(raw_md)?;

            if !root.tables.is_present() {
                return Err(malformed_error!("Image has no metadata tables stream"));
            }

            let rebase = |slice: crate::metadata::root::StreamSlice| HeapSlice {
                offset: md_offset + slice.offset,
                size: slice.size,
            };

            let tables_heap =
                &raw_md[root.tables.offset as usize..(root.tables.offset + root.tables.size) as usize];
            let tables = TableSet::decode(tables_heap)?;

            let guid_heap =
                &raw_md[root.guid.offset as usize..(root.guid.offset + root.guid.size) as usize];
            let guid = Guid::from(guid_heap)?.get(1)?.to_string();

            let mut assembly_name = None;
            let mut module_name = None;
            if root.strings.is_present() {
                let strings_heap = &raw_md[root.strings.offset as usize
                    ..(root.strings.offset + root.strings.size) as usize];
                let strings = Strings::from(strings_heap)?;

                // modules don't have an assembly table row
                if tables.rows(TableId::Assembly) > 0 {
                    let index = schema::row_col(
                        tables_heap,
                        &tables,
                        TableId::Assembly,
                        0,
                        schema::ASSEMBLY_NAME,
                    )?;
                    assembly_name = Some(strings.get(index as usize)?.to_string());
                }

                if tables.rows(TableId::Module) > 0 {
                    let index = schema::row_col(
                        tables_heap,
                        &tables,
                        TableId::Module,
                        0,
                        schema::MODULE_NAME,
                    )?;
                    module_name = Some(strings.get(index as usize)?.to_string());
                }
            }

            modules = (0..tables.rows(TableId::ModuleRef))
                .map(|_| OnceLock::new())
                .collect();
            files = (0..tables.rows(TableId::File))
                .map(|_| OnceLock::new())
                .collect();

            md = Some(MetadataInfo {
                version_major: root.version_major,
                version_minor: root.version_minor,
                version: root.version,
                guid,
                uncompressed: root.uncompressed,
                heap_tables: rebase(root.tables),
                heap_strings: rebase(root.strings),
                heap_us: rebase(root.user_strings),
                heap_blob: rebase(root.blob),
                heap_guid: rebase(root.guid),
                tables,
                assembly_name,
                module_name,
            });
            cli = Some(header);
        }

        Ok(Image {
            name: RwLock::new(name),
            ref_only,
            dynamic: false,
            data,
            file_backed,
            ref_count: AtomicU32::new(1),
            pe: Some(pe),
            section_ptrs: (0..section_count).map(|_| OnceLock::new()).collect(),
            cli,
            md,
            modules,
            files,
            assembly: RwLock::new(None),
            caches: ImageCaches::new(),
        })
    }

    /// The image name: the canonical path for file-backed images, a
    /// `data-<addr>` marker for buffer-backed ones.
    #[must_use]
    pub fn name(&self) -> String {
        read_lock!(self.name).clone()
    }

    /// The filename holding the image. Same as [`Image::name`].
    #[must_use]
    pub fn filename(&self) -> String {
        self.name()
    }

    /// The assembly name from the Assembly table, absent for netmodules.
    #[must_use]
    pub fn assembly_name(&self) -> Option<&str> {
        self.md.as_ref()?.assembly_name.as_deref()
    }

    /// The module name from the Module table.
    #[must_use]
    pub fn module_name(&self) -> Option<&str> {
        self.md.as_ref()?.module_name.as_deref()
    }

    /// The module version identifier, formatted as the canonical
    /// hex-dashed string.
    #[must_use]
    pub fn guid(&self) -> Option<&str> {
        self.md.as_ref().map(|md| md.guid.as_str())
    }

    /// The metadata version string, e.g. `v4.0.30319`.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.md.as_ref().map(|md| md.version.as_str())
    }

    /// The metadata format version pair.
    #[must_use]
    pub fn md_version(&self) -> Option<(u16, u16)> {
        self.md
            .as_ref()
            .map(|md| (md.version_major, md.version_minor))
    }

    /// `true` when the tables stream was the uncompressed `#-` variant.
    #[must_use]
    pub fn uncompressed_metadata(&self) -> bool {
        self.md.as_ref().is_some_and(|md| md.uncompressed)
    }

    /// `true` when this image was opened for inspection only.
    #[must_use]
    pub fn ref_only(&self) -> bool {
        self.ref_only
    }

    /// `true` when this image was produced in-process by an emit layer.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// `true` when the image holds an open file mapping.
    #[must_use]
    pub fn file_backed(&self) -> bool {
        self.file_backed
    }

    /// `true` when the image owns its raw data allocation.
    #[must_use]
    pub fn owns_raw_data(&self) -> bool {
        self.data.owns_data()
    }

    /// The complete raw data of the image.
    #[must_use]
    pub fn raw_data(&self) -> &[u8] {
        self.data.data()
    }

    /// Increases the reference count of the image.
    pub fn addref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// The current reference count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn release(&self) -> u32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn mark_unloaded(&self) {
        let mut name = write_lock!(self.name);
        let renamed = format!("{} - UNLOADED", *name);
        *name = renamed;
    }

    /// The assembly handle owning this image, once the assembly layer has
    /// attached one.
    #[must_use]
    pub fn assembly(&self) -> Option<AssemblyHandle> {
        read_lock!(self.assembly).clone()
    }

    /// Attaches the owning assembly handle. Called by the assembly layer;
    /// the loader copies the handle into child modules it opens.
    pub fn set_assembly(&self, assembly: AssemblyHandle) {
        *write_lock!(self.assembly) = Some(assembly);
    }

    /// The auxiliary caches anchored on this image.
    #[must_use]
    pub fn caches(&self) -> &ImageCaches {
        &self.caches
    }

    /// Number of module references this image carries.
    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Returns the already-loaded child module at the 1-based index, if
    /// loading has happened and succeeded. Never triggers loading.
    ///
    /// ## Arguments
    /// * 'idx' - The 1-based ModuleRef row index
    #[must_use]
    pub fn module(&self, idx: usize) -> Option<Arc<Image>> {
        if idx == 0 || idx > self.modules.len() {
            return None;
        }
        self.modules[idx - 1].get().cloned().flatten()
    }

    // ------------------------------------------------------------------
    // section index / RVA mapping
    // ------------------------------------------------------------------

    /// Converts an RVA to a file offset through the section table.
    ///
    /// ## Arguments
    /// * 'rva' - The relative virtual address to translate
    #[must_use]
    pub fn rva_to_offset(&self, rva: u32) -> Option<u32> {
        self.pe.as_ref()?.rva_to_offset(rva)
    }

    /// Makes sure the section with the given index is mapped.
    ///
    /// The section's pointer into the raw data is computed on first access
    /// and republished for later calls. Returns `false` when the index is
    /// out of range or the section raw data lies outside the image.
    ///
    /// ## Arguments
    /// * 'idx' - The zero-based section index
    pub fn ensure_section_idx(&self, idx: usize) -> bool {
        let Some(pe) = self.pe.as_ref() else {
            return false;
        };
        if idx >= pe.sections.len() {
            return false;
        }
        if self.section_ptrs[idx].get().is_some() {
            return true;
        }

        let section = &pe.sections[idx];
        let end = u64::from(section.raw_data_ptr) + u64::from(section.raw_data_size);
        if end > self.data.len() as u64 {
            return false;
        }

        // the MEM_WRITE flag is recorded in the section header; nothing is
        // patched, so it is not enforced here
        let _ = self.section_ptrs[idx].set(section.raw_data_ptr);
        true
    }

    /// Makes sure the section with the given name is mapped.
    ///
    /// ## Arguments
    /// * 'name' - The section name, e.g. `.text`
    pub fn ensure_section(&self, name: &str) -> bool {
        let Some(pe) = self.pe.as_ref() else {
            return false;
        };

        for (idx, section) in pe.sections.iter().enumerate() {
            if section.name_str() == name {
                return self.ensure_section_idx(idx);
            }
        }
        false
    }

    /// Maps an RVA to the bytes behind it.
    ///
    /// Returns a slice starting at the mapped address and running to the
    /// end of the containing section's raw data, or `None` when no section
    /// covers the address.
    ///
    /// ## Arguments
    /// * 'rva' - The relative virtual address to map
    #[must_use]
    pub fn rva_map(&self, rva: u32) -> Option<&[u8]> {
        let pe = self.pe.as_ref()?;
        let idx = pe.section_for_rva(rva)?;
        if !self.ensure_section_idx(idx) {
            return None;
        }

        let section = &pe.sections[idx];
        let into = rva - section.virtual_address;
        let start = section.raw_data_ptr as usize + into as usize;
        let len = (section.raw_data_size - into) as usize;
        self.data.data_slice(start, len).ok()
    }

    // ------------------------------------------------------------------
    // metadata heaps and tables
    // ------------------------------------------------------------------

    fn heap(&self, slice: HeapSlice) -> Option<&[u8]> {
        if slice.size == 0 {
            return None;
        }
        self.data
            .data_slice(slice.offset as usize, slice.size as usize)
            .ok()
    }

    /// The raw bytes of the tables stream (`#~`/`#-`).
    #[must_use]
    pub fn heap_tables(&self) -> Option<&[u8]> {
        self.heap(self.md.as_ref()?.heap_tables)
    }

    /// The raw bytes of the `#Strings` heap.
    #[must_use]
    pub fn heap_strings(&self) -> Option<&[u8]> {
        self.heap(self.md.as_ref()?.heap_strings)
    }

    /// The raw bytes of the `#US` heap.
    #[must_use]
    pub fn heap_us(&self) -> Option<&[u8]> {
        self.heap(self.md.as_ref()?.heap_us)
    }

    /// The raw bytes of the `#Blob` heap.
    #[must_use]
    pub fn heap_blob(&self) -> Option<&[u8]> {
        self.heap(self.md.as_ref()?.heap_blob)
    }

    /// The raw bytes of the `#GUID` heap.
    #[must_use]
    pub fn heap_guid(&self) -> Option<&[u8]> {
        self.heap(self.md.as_ref()?.heap_guid)
    }

    /// Typed view over the `#Strings` heap.
    #[must_use]
    pub fn strings(&self) -> Option<Strings<'_>> {
        Strings::from(self.heap_strings()?).ok()
    }

    /// Typed view over the `#Blob` heap.
    #[must_use]
    pub fn blob(&self) -> Option<Blob<'_>> {
        Blob::from(self.heap_blob()?).ok()
    }

    /// Typed view over the `#GUID` heap.
    #[must_use]
    pub fn guids(&self) -> Option<Guid<'_>> {
        Guid::from(self.heap_guid()?).ok()
    }

    /// The decoded table set, absent for images opened without CLI data.
    #[must_use]
    pub fn tables(&self) -> Option<&TableSet> {
        self.md.as_ref().map(|md| &md.tables)
    }

    /// The descriptor of one table.
    ///
    /// ## Arguments
    /// * 'id' - The table to look up
    #[must_use]
    pub fn table_info(&self, id: TableId) -> Option<&TableInfo> {
        self.md.as_ref().map(|md| md.tables.info(id))
    }

    /// The number of rows in one table, zero when absent.
    ///
    /// ## Arguments
    /// * 'id' - The table to look up
    #[must_use]
    pub fn table_rows(&self, id: TableId) -> u32 {
        self.md.as_ref().map_or(0, |md| md.tables.rows(id))
    }

    /// Absolute file offset of the first table row.
    #[must_use]
    pub fn tables_base(&self) -> Option<u32> {
        let md = self.md.as_ref()?;
        Some(md.heap_tables.offset + md.tables.tables_base)
    }

    /// Decodes one cell of a metadata table row to its raw value.
    ///
    /// This is the primitive decoder the metadata layer builds typed rows
    /// on; rows are 0-based.
    ///
    /// ## Arguments
    /// * 'id'  - The table to read from
    /// * 'row' - The 0-based row index
    /// * 'col' - The column index within the row
    ///
    /// # Errors
    /// Returns an error if the image carries no metadata or the cell does
    /// not exist.
    pub fn table_row_col(&self, id: TableId, row: u32, col: usize) -> Result<u32> {
        let md = self
            .md
            .as_ref()
            .ok_or_else(|| malformed_error!("Image has no metadata tables"))?;
        let heap = self
            .heap(md.heap_tables)
            .ok_or(crate::Error::OutOfBounds)?;

        schema::row_col(heap, &md.tables, id, row, col)
    }

    // ------------------------------------------------------------------
    // query surface
    // ------------------------------------------------------------------

    /// The metadata token of the entry-point method, zero when absent.
    #[must_use]
    pub fn entry_point(&self) -> u32 {
        self.cli.as_ref().map_or(0, |cli| cli.entry_point_token)
    }

    /// Fetches a managed resource blob at `offset` within the resource
    /// region.
    ///
    /// The blob is stored with a 32-bit length prefix; the returned slice
    /// is the payload with the prefix stripped. Returns `None` when the
    /// image has no resources, the prefix cannot be read within the
    /// region, or the payload would run past the mapped section.
    ///
    /// ## Arguments
    /// * 'offset' - Offset of the blob within the resource region
    #[must_use]
    pub fn resource(&self, offset: u32) -> Option<&[u8]> {
        let cli = self.cli.as_ref()?;
        if cli.resources.rva == 0 {
            return None;
        }

        let prefix_end = offset.checked_add(4)?;
        if prefix_end > cli.resources.size {
            return None;
        }

        let region = self.rva_map(cli.resources.rva)?;
        let mut cursor = offset as usize;
        let size = read_le_at::<u32>(region, &mut cursor).ok()? as usize;

        region.get(cursor..cursor.checked_add(size)?)
    }

    /// The strong-name signature blob, when the image carries one.
    #[must_use]
    pub fn strong_name(&self) -> Option<&[u8]> {
        let directory = &self.cli.as_ref()?.strong_name;
        if directory.rva == 0 || directory.size == 0 {
            return None;
        }

        let region = self.rva_map(directory.rva)?;
        region.get(..directory.size as usize)
    }

    /// File position and size of the strong-name signature blob, when the
    /// image carries one.
    #[must_use]
    pub fn strong_name_position(&self) -> Option<(u32, u32)> {
        let directory = &self.cli.as_ref()?.strong_name;
        if directory.rva == 0 || directory.size == 0 {
            return None;
        }

        let offset = self.rva_to_offset(directory.rva)?;
        Some((offset, directory.size))
    }

    /// The public key from the single Assembly row, when one is recorded.
    ///
    /// Returns `None` when the image has no Assembly row, more than one,
    /// or a zero public-key token.
    #[must_use]
    pub fn public_key(&self) -> Option<&[u8]> {
        let md = self.md.as_ref()?;
        if md.tables.rows(TableId::Assembly) != 1 {
            return None;
        }

        let heap = self.heap(md.heap_tables)?;
        let token = schema::row_col(
            heap,
            &md.tables,
            TableId::Assembly,
            0,
            schema::ASSEMBLY_PUBLIC_KEY,
        )
        .ok()?;
        if token == 0 {
            return None;
        }

        self.blob()?.get(token as usize).ok()
    }

    /// `true` iff the certificate data directory is populated.
    ///
    /// The 8-byte threshold skips the non-ASN.1 pre-header an Authenticode
    /// entry always starts with.
    #[must_use]
    pub fn has_authenticode_entry(&self) -> bool {
        let Some(pe) = self.pe.as_ref() else {
            return false;
        };
        let directory = pe.directories[DIR_CERTIFICATE];
        directory.rva != 0 && directory.size > 8
    }

    /// Searches the native PE resource tree for a data entry.
    ///
    /// ## Arguments
    /// * 'res_id'  - The numeric resource type to look for
    /// * 'lang_id' - The language to look for, or 0 for any
    /// * 'name'    - Optional resource name; reserved, names are not yet compared
    #[must_use]
    pub fn lookup_resource(
        &self,
        res_id: u32,
        lang_id: u32,
        name: Option<&str>,
    ) -> Option<ResourceDataEntry> {
        let pe = self.pe.as_ref()?;
        let directory = pe.directories[DIR_RESOURCE];
        if directory.rva == 0 {
            return None;
        }

        let root = self.rva_map(directory.rva)?;
        walk_resource_tree(root, res_id, lang_id, name).ok().flatten()
    }
}
