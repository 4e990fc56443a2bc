//! The process-wide image cache and lifecycle management.
//!
//! [`ImageRegistry`] keeps four keyed tables - path and GUID, each split by
//! the ref-only flag - behind a single lock. The lock is held only around
//! lookup, insertion and removal, never across file I/O or parsing: an
//! open that misses the cache parses outside the lock and re-enters it to
//! insert, discarding its work when another thread won the race. Insertion
//! into the cache is the publication point; an image found in a table is
//! always fully constructed.
//!
//! Reference counts are atomics on the image itself. The registry holds
//! one reference per cached image; [`ImageRegistry::close`] decrements and,
//! on the transition to zero, removes the image from its tables, rebuilds
//! the GUID table (several images may share a GUID), and tears the image
//! down: caches first, then each loaded child exactly once. Setting
//! `CILIMAGE_DEBUG_UNLOAD` in the environment before the registry is
//! created switches teardown to rename-and-retain, which keeps dangling
//! references inspectable.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use log::info;

use crate::{
    image::Image,
    metadata::tables::{schema, TableId, FILE_CONTAINS_NO_METADATA},
    Error, Result,
};

#[derive(Default)]
struct RegistryTables {
    by_path: HashMap<String, Arc<Image>>,
    by_path_refonly: HashMap<String, Arc<Image>>,
    by_guid: HashMap<String, Arc<Image>>,
    by_guid_refonly: HashMap<String, Arc<Image>>,
    graveyard: Vec<Arc<Image>>,
}

impl RegistryTables {
    fn tables_for(
        &mut self,
        ref_only: bool,
    ) -> (
        &mut HashMap<String, Arc<Image>>,
        &mut HashMap<String, Arc<Image>>,
    ) {
        if ref_only {
            (&mut self.by_path_refonly, &mut self.by_guid_refonly)
        } else {
            (&mut self.by_path, &mut self.by_guid)
        }
    }

    fn rebuild_guid_table(&mut self, ref_only: bool) {
        let (paths, guids) = self.tables_for(ref_only);

        for image in paths.values() {
            if let Some(guid) = image.guid() {
                if !guids.contains_key(guid) {
                    guids.insert(guid.to_string(), image.clone());
                }
            }
        }
    }
}

/// The image cache: deduplicates images by canonical path and by metadata
/// GUID, with reference-counted lifetimes.
///
/// A registry would normally be process-wide, but nothing in it is global:
/// unit tests instantiate private registries freely.
///
/// # Examples
///
/// ```rust,no_run
/// use cilimage::ImageRegistry;
/// use std::path::Path;
///
/// let registry = ImageRegistry::new();
/// let image = registry.open(Path::new("program.exe"))?;
/// println!("entry point token: {:#010x}", image.entry_point());
/// registry.close(&image);
/// # Ok::<(), cilimage::Error>(())
/// ```
///
/// # Thread Safety
///
/// All operations may be called from any thread at any time. When two
/// threads open the same canonical path concurrently, exactly one of them
/// parses; both receive references to the same image.
pub struct ImageRegistry {
    inner: Mutex<RegistryTables>,
    debug_unload: bool,
}

impl ImageRegistry {
    /// Creates an empty registry.
    ///
    /// The `CILIMAGE_DEBUG_UNLOAD` environment variable is sampled here;
    /// when present, closed images are renamed and retained instead of
    /// torn down.
    #[must_use]
    pub fn new() -> ImageRegistry {
        ImageRegistry {
            inner: Mutex::new(RegistryTables::default()),
            debug_unload: std::env::var_os("CILIMAGE_DEBUG_UNLOAD").is_some(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_debug_unload() -> ImageRegistry {
        ImageRegistry {
            inner: Mutex::new(RegistryTables::default()),
            debug_unload: true,
        }
    }

    /// Opens an image by path, fully parsed and cached.
    ///
    /// ## Arguments
    /// * 'path' - The image file to open
    ///
    /// # Errors
    /// Returns [`Error::Io`] when the file cannot be resolved or read and
    /// [`Error::Malformed`] when it is not a valid CLI image.
    pub fn open(&self, path: &Path) -> Result<Arc<Image>> {
        self.open_full(path, false)
    }

    /// Opens an image by path with an explicit ref-only flag.
    ///
    /// Ref-only images live in their own cache partition; opening the same
    /// path ref-only and normally yields two distinct images.
    ///
    /// ## Arguments
    /// * 'path'     - The image file to open
    /// * 'ref_only' - Load for inspection only
    ///
    /// # Errors
    /// Same conditions as [`ImageRegistry::open`].
    pub fn open_full(&self, path: &Path, ref_only: bool) -> Result<Arc<Image>> {
        let canonical = std::fs::canonicalize(path)?;
        let key = canonical.to_string_lossy().into_owned();

        {
            let mut tables = lock!(self.inner);
            let (paths, _) = tables.tables_for(ref_only);
            if let Some(existing) = paths.get(&key) {
                existing.addref();
                return Ok(existing.clone());
            }
        }

        // loading happens outside the lock so concurrent lookups don't
        // stall; if several threads race on the same path, all but the
        // registration winner discard their copy
        let image = Arc::new(Image::open_file(&canonical, key, ref_only, true)?);
        Ok(self.register(image))
    }

    /// Opens a PE file without CLI parsing and without caching.
    ///
    /// Only the headers and the section table are read; metadata accessors
    /// on the result return empty values. Used for native version-info
    /// probing.
    ///
    /// ## Arguments
    /// * 'path' - The image file to open
    ///
    /// # Errors
    /// Same conditions as [`ImageRegistry::open`].
    pub fn pe_file_open(&self, path: &Path) -> Result<Arc<Image>> {
        let canonical = std::fs::canonicalize(path)?;
        let key = canonical.to_string_lossy().into_owned();

        Ok(Arc::new(Image::open_file(&canonical, key, false, false)?))
    }

    /// Opens an image from a caller buffer, copying it.
    ///
    /// The image owns the copy; mutating or freeing the original buffer
    /// afterwards has no effect on it.
    ///
    /// ## Arguments
    /// * 'data'     - The image bytes
    /// * 'ref_only' - Load for inspection only
    ///
    /// # Errors
    /// Returns [`Error::Empty`] for an empty buffer, otherwise the same
    /// conditions as [`ImageRegistry::open`].
    pub fn open_from_data(&self, data: &[u8], ref_only: bool) -> Result<Arc<Image>> {
        if data.is_empty() {
            return Err(Error::Empty);
        }

        let name = format!("data-{:p}", data.as_ptr());
        let image = Arc::new(Image::open_memory(data.to_vec(), name, ref_only)?);
        Ok(self.register(image))
    }

    /// Opens an image borrowing a caller-retained buffer, without copying.
    ///
    /// ## Arguments
    /// * 'data'     - The shared image bytes, kept alive by the caller
    /// * 'ref_only' - Load for inspection only
    ///
    /// # Errors
    /// Returns [`Error::Empty`] for an empty buffer, otherwise the same
    /// conditions as [`ImageRegistry::open`].
    pub fn open_from_data_shared(&self, data: Arc<[u8]>, ref_only: bool) -> Result<Arc<Image>> {
        if data.is_empty() {
            return Err(Error::Empty);
        }

        let name = format!("data-{:p}", data.as_ptr());
        let image = Arc::new(Image::open_shared(data, name, ref_only)?);
        Ok(self.register(image))
    }

    fn register(&self, image: Arc<Image>) -> Arc<Image> {
        let ref_only = image.ref_only();
        let name = image.name();

        let mut tables = lock!(self.inner);
        let (paths, guids) = tables.tables_for(ref_only);

        if let Some(existing) = paths.get(&name) {
            // somebody else beat us to it
            existing.addref();
            let winner = existing.clone();
            drop(tables);
            self.close(&image);
            return winner;
        }

        paths.insert(name, image.clone());
        if let Some(assembly_name) = image.assembly_name() {
            if !paths.contains_key(assembly_name) {
                paths.insert(assembly_name.to_string(), image.clone());
            }
        }
        if let Some(guid) = image.guid() {
            guids.insert(guid.to_string(), image.clone());
        }

        image
    }

    /// Pure cache lookup by name, no loading.
    ///
    /// The name is either a canonical path or an assembly name alias.
    ///
    /// ## Arguments
    /// * 'name'     - The cache key to look up
    /// * 'ref_only' - Which cache partition to search
    #[must_use]
    pub fn loaded(&self, name: &str, ref_only: bool) -> Option<Arc<Image>> {
        let mut tables = lock!(self.inner);
        tables.tables_for(ref_only).0.get(name).cloned()
    }

    /// Pure cache lookup by GUID string, no loading.
    ///
    /// ## Arguments
    /// * 'guid'     - The 36-character GUID string to look up
    /// * 'ref_only' - Which cache partition to search
    #[must_use]
    pub fn loaded_by_guid(&self, guid: &str, ref_only: bool) -> Option<Arc<Image>> {
        let mut tables = lock!(self.inner);
        tables.tables_for(ref_only).1.get(guid).cloned()
    }

    /// Releases one reference to an image.
    ///
    /// When the count reaches zero the image is removed from the cache
    /// tables (only if the stored entry is this very image, guarding the
    /// open-in-progress race), the GUID table is rebuilt, and the image is
    /// torn down: auxiliary caches cleared, each loaded child closed once.
    /// The raw buffer and any file mapping are released when the last
    /// reference to the image value itself goes away.
    ///
    /// ## Arguments
    /// * 'image' - The image to release
    pub fn close(&self, image: &Arc<Image>) {
        if image.release() > 0 {
            return;
        }

        info!("Unloading image {}", image.name());

        let retained = {
            let mut tables = lock!(self.inner);
            let name = image.name();
            let ref_only = image.ref_only();

            let (paths, guids) = tables.tables_for(ref_only);
            if paths
                .get(&name)
                .is_some_and(|entry| Arc::ptr_eq(entry, image))
            {
                // not the case when discarding an open-race loser
                paths.remove(&name);
                if let Some(guid) = image.guid() {
                    guids.remove(guid);
                }
            }
            if let Some(assembly_name) = image.assembly_name() {
                if paths
                    .get(assembly_name)
                    .is_some_and(|entry| Arc::ptr_eq(entry, image))
                {
                    paths.remove(assembly_name);
                }
            }

            // several images can share a GUID; restore one for any guid
            // this removal orphaned
            tables.rebuild_guid_table(ref_only);

            if self.debug_unload {
                image.mark_unloaded();
                tables.graveyard.push(image.clone());
                true
            } else {
                false
            }
        };

        if retained {
            return;
        }

        image.caches().clear();
        for cell in image.modules.iter().chain(image.files.iter()) {
            if let Some(Some(child)) = cell.get() {
                self.close(child);
            }
        }
    }

    /// Loads the child module with the 1-based index `idx` from `image`.
    ///
    /// The ModuleRef row supplies the child name. The name is admitted
    /// when the File table has a row carrying metadata with that name, or
    /// unconditionally when the File table is empty. The child is opened
    /// through this registry from the parent's directory and inherits the
    /// parent's assembly handle. The result - including a failure - is
    /// published once; repeated calls return the first outcome.
    ///
    /// ## Arguments
    /// * 'image' - The parent image
    /// * 'idx'   - The 1-based ModuleRef row index
    #[must_use]
    pub fn load_module(&self, image: &Arc<Image>, idx: usize) -> Option<Arc<Image>> {
        if idx == 0 || idx > image.module_count() {
            return None;
        }

        let cell = &image.modules[idx - 1];
        if let Some(result) = cell.get() {
            return result.clone();
        }

        let loaded = self.load_module_image(image, idx);
        match cell.set(loaded.clone()) {
            Ok(()) => loaded,
            Err(lost) => {
                // another thread published first; drop the duplicate
                if let Some(duplicate) = lost {
                    self.close(&duplicate);
                }
                cell.get().and_then(Clone::clone)
            }
        }
    }

    fn load_module_image(&self, image: &Arc<Image>, idx: usize) -> Option<Arc<Image>> {
        let name_index = image
            .table_row_col(TableId::ModuleRef, (idx - 1) as u32, schema::MODULEREF_NAME)
            .ok()?;
        let strings = image.strings()?;
        let name = strings.get(name_index as usize).ok()?;

        // if there is no file table, we try to load the module
        let file_rows = image.table_rows(TableId::File);
        let mut valid = file_rows == 0;
        for row in 0..file_rows {
            let flags = image
                .table_row_col(TableId::File, row, schema::FILE_FLAGS)
                .ok()?;
            if flags == FILE_CONTAINS_NO_METADATA {
                continue;
            }

            let file_name_index = image
                .table_row_col(TableId::File, row, schema::FILE_NAME)
                .ok()?;
            if strings.get(file_name_index as usize).ok() == Some(name) {
                valid = true;
                break;
            }
        }
        if !valid {
            return None;
        }

        let parent_name = image.name();
        let path = Path::new(&parent_name).parent()?.join(name);
        let child = self.open_full(&path, image.ref_only()).ok()?;
        if let Some(assembly) = image.assembly() {
            child.set_assembly(assembly);
        }

        Some(child)
    }

    /// Loads the image behind the File-table row `fileidx` (1-based).
    ///
    /// The child is opened through this registry from the parent's
    /// directory; the parent's assembly handle is propagated to the child
    /// and into any modules the child has already loaded. The result is
    /// published once, like [`ImageRegistry::load_module`].
    ///
    /// ## Arguments
    /// * 'image'   - The parent image
    /// * 'fileidx' - The 1-based File row index
    #[must_use]
    pub fn load_file_for_image(&self, image: &Arc<Image>, fileidx: usize) -> Option<Arc<Image>> {
        if fileidx == 0 || fileidx > image.files.len() {
            return None;
        }

        let cell = &image.files[fileidx - 1];
        if let Some(result) = cell.get() {
            return result.clone();
        }

        let loaded = self.load_file_image(image, fileidx);
        match cell.set(loaded.clone()) {
            Ok(()) => loaded,
            Err(lost) => {
                if let Some(duplicate) = lost {
                    self.close(&duplicate);
                }
                cell.get().and_then(Clone::clone)
            }
        }
    }

    fn load_file_image(&self, image: &Arc<Image>, fileidx: usize) -> Option<Arc<Image>> {
        let name_index = image
            .table_row_col(TableId::File, (fileidx - 1) as u32, schema::FILE_NAME)
            .ok()?;
        let name = image.strings()?.get(name_index as usize).ok()?.to_string();

        let parent_name = image.name();
        let path = Path::new(&parent_name).parent()?.join(&name);
        let child = self.open(&path).ok()?;

        if let Some(assembly) = image.assembly() {
            child.set_assembly(assembly.clone());
            for idx in 1..=child.module_count() {
                if let Some(module) = child.module(idx) {
                    if module.assembly().is_none() {
                        module.set_assembly(assembly.clone());
                    }
                }
            }
        }

        Some(child)
    }
}

impl Default for ImageRegistry {
    fn default() -> Self {
        ImageRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_lookups() {
        let registry = ImageRegistry::new();

        assert!(registry.loaded("nothing.dll", false).is_none());
        assert!(registry.loaded("nothing.dll", true).is_none());
        assert!(registry
            .loaded_by_guid("00000000-0000-0000-0000-000000000000", false)
            .is_none());
    }

    #[test]
    fn open_missing_file_is_io_error() {
        let registry = ImageRegistry::new();

        let result = registry.open(Path::new("/nonexistent/image.exe"));
        match result {
            Err(Error::Io(_)) => {}
            other => panic!("expected an Io error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn open_from_data_rejects_empty() {
        let registry = ImageRegistry::new();

        assert!(matches!(
            registry.open_from_data(&[], false),
            Err(Error::Empty)
        ));
    }

    #[test]
    fn close_uncached_image_is_safe() {
        let registry = ImageRegistry::new();
        let image = Image::new_dynamic("never-registered");

        // one logical reference, never inserted into any table
        registry.close(&image);
        assert!(registry.loaded("never-registered", false).is_none());
    }

    #[test]
    fn debug_unload_renames_instead_of_tearing_down() {
        let registry = ImageRegistry::with_debug_unload();
        let image = Image::new_dynamic("phantom");

        registry.close(&image);
        assert_eq!(image.name(), "phantom - UNLOADED");
    }
}
