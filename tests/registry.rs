//! Cache behavior: deduplication, reference counts, partitions, module
//! graph loading.

mod common;

use std::sync::Arc;

use cilimage::{AssemblyHandle, ImageRegistry};
use common::ImageBuilder;

fn write_image(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn same_path_is_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = ImageBuilder::new("dedup.exe").assembly("dedup").build();
    let path = write_image(&dir, "dedup.exe", &bytes);

    let registry = ImageRegistry::new();
    let first = registry.open(&path).unwrap();
    assert_eq!(first.ref_count(), 1);

    let second = registry.open(&path).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.ref_count(), 2);

    registry.close(&second);
    assert_eq!(first.ref_count(), 1);

    // still reachable; a pure lookup takes no reference
    let looked_up = registry.loaded(&first.name(), false).unwrap();
    assert!(Arc::ptr_eq(&looked_up, &first));
    assert_eq!(first.ref_count(), 1);

    registry.close(&first);
    assert!(registry.loaded(&first.name(), false).is_none());
}

#[test]
fn relative_and_absolute_paths_share_an_image() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = ImageBuilder::new("canon.exe").assembly("canon").build();
    let path = write_image(&dir, "canon.exe", &bytes);

    let registry = ImageRegistry::new();
    let direct = registry.open(&path).unwrap();

    // a path with a redundant `.` segment resolves to the same image
    let dotted = dir.path().join(".").join("canon.exe");
    let indirect = registry.open(&dotted).unwrap();

    assert!(Arc::ptr_eq(&direct, &indirect));
}

#[test]
fn assembly_name_alias_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = ImageBuilder::new("alias.exe").assembly("AliasLib").build();
    let path = write_image(&dir, "alias.exe", &bytes);

    let registry = ImageRegistry::new();
    let image = registry.open(&path).unwrap();

    let by_alias = registry.loaded("AliasLib", false).unwrap();
    assert!(Arc::ptr_eq(&by_alias, &image));

    // removing the image clears the alias too
    registry.close(&image);
    assert!(registry.loaded("AliasLib", false).is_none());
}

#[test]
fn guid_table_lookup_and_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let mvid = [0x42_u8; 16];
    let guid = "42424242-4242-4242-4242-424242424242";

    let a = ImageBuilder::new("a.exe").assembly("a").mvid(mvid).build();
    let b = ImageBuilder::new("b.exe").assembly("b").mvid(mvid).build();
    let path_a = write_image(&dir, "a.exe", &a);
    let path_b = write_image(&dir, "b.exe", &b);

    let registry = ImageRegistry::new();
    let image_a = registry.open(&path_a).unwrap();
    let image_b = registry.open(&path_b).unwrap();

    // both share the GUID; the table holds the later registration
    let hit = registry.loaded_by_guid(guid, false).unwrap();
    assert!(Arc::ptr_eq(&hit, &image_b));

    // closing the current holder must leave the other reachable
    registry.close(&image_b);
    let hit = registry.loaded_by_guid(guid, false).unwrap();
    assert!(Arc::ptr_eq(&hit, &image_a));

    registry.close(&image_a);
    assert!(registry.loaded_by_guid(guid, false).is_none());
}

#[test]
fn ref_only_partition_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = ImageBuilder::new("iso.exe").assembly("iso").build();
    let path = write_image(&dir, "iso.exe", &bytes);

    let registry = ImageRegistry::new();
    let normal = registry.open_full(&path, false).unwrap();
    let refonly = registry.open_full(&path, true).unwrap();

    assert!(!Arc::ptr_eq(&normal, &refonly));
    assert!(!normal.ref_only());
    assert!(refonly.ref_only());

    // each partition resolves to its own image
    let name = normal.name();
    assert!(Arc::ptr_eq(&registry.loaded(&name, false).unwrap(), &normal));
    assert!(Arc::ptr_eq(&registry.loaded(&name, true).unwrap(), &refonly));

    // closing one does not affect the other
    registry.close(&refonly);
    assert!(registry.loaded(&name, true).is_none());
    assert!(registry.loaded(&name, false).is_some());
}

#[test]
fn two_thread_open_race() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = ImageBuilder::new("race.exe").assembly("race").build();
    let path = write_image(&dir, "race.exe", &bytes);

    let registry = Arc::new(ImageRegistry::new());

    for _ in 0..16 {
        let registry_a = registry.clone();
        let registry_b = registry.clone();
        let path_a = path.clone();
        let path_b = path.clone();

        let thread_a = std::thread::spawn(move || registry_a.open(&path_a).unwrap());
        let thread_b = std::thread::spawn(move || registry_b.open(&path_b).unwrap());

        let image_a = thread_a.join().unwrap();
        let image_b = thread_b.join().unwrap();

        // both threads see the same image; exactly one of them parsed
        assert!(Arc::ptr_eq(&image_a, &image_b));
        assert_eq!(image_a.ref_count(), 2);

        registry.close(&image_a);
        assert_eq!(image_b.ref_count(), 1);

        registry.close(&image_b);
        assert!(registry.loaded(&image_a.name(), false).is_none());
    }
}

#[test]
fn module_loading() {
    let dir = tempfile::tempdir().unwrap();

    let module_a = ImageBuilder::new("mod_a.netmodule").build();
    let module_b = ImageBuilder::new("mod_b.netmodule").build();
    write_image(&dir, "mod_a.netmodule", &module_a);
    write_image(&dir, "mod_b.netmodule", &module_b);

    let primary_bytes = ImageBuilder::new("multi.exe")
        .assembly("multi")
        .module_ref("mod_a.netmodule")
        .module_ref("mod_b.netmodule")
        .file("mod_a.netmodule", 0)
        .file("mod_b.netmodule", 0)
        .build();
    let path = write_image(&dir, "multi.exe", &primary_bytes);

    let registry = ImageRegistry::new();
    let primary = registry.open(&path).unwrap();
    assert_eq!(primary.module_count(), 2);

    let assembly: AssemblyHandle = Arc::new("assembly of multi".to_string());
    primary.set_assembly(assembly.clone());

    for idx in 1..=primary.module_count() {
        let module = registry.load_module(&primary, idx).unwrap();
        assert!(module.module_name().unwrap().starts_with("mod_"));
        assert!(module.assembly_name().is_none());

        // children share the parent's assembly
        let child_assembly = module.assembly().unwrap();
        assert!(Arc::ptr_eq(&child_assembly, &assembly));

        // idempotence: the exact image comes back again
        let again = registry.load_module(&primary, idx).unwrap();
        assert!(Arc::ptr_eq(&module, &again));
    }

    // out-of-range indexes
    assert!(registry.load_module(&primary, 0).is_none());
    assert!(registry.load_module(&primary, 3).is_none());
}

#[test]
fn module_ref_must_be_in_file_table() {
    let dir = tempfile::tempdir().unwrap();

    // the referenced module exists on disk, but the File table lists it
    // without metadata, so it must not be loaded
    let stray = ImageBuilder::new("stray.netmodule").build();
    write_image(&dir, "stray.netmodule", &stray);

    let primary_bytes = ImageBuilder::new("strict.exe")
        .assembly("strict")
        .module_ref("stray.netmodule")
        .file("stray.netmodule", 1) // FILE_CONTAINS_NO_METADATA
        .file("data.bin", 1)
        .build();
    let path = write_image(&dir, "strict.exe", &primary_bytes);

    let registry = ImageRegistry::new();
    let primary = registry.open(&path).unwrap();

    assert!(registry.load_module(&primary, 1).is_none());
    // the failure is remembered, not retried
    assert!(registry.load_module(&primary, 1).is_none());
    assert!(primary.module(1).is_none());
}

#[test]
fn module_ref_with_empty_file_table_loads() {
    let dir = tempfile::tempdir().unwrap();

    let child = ImageBuilder::new("free.netmodule").build();
    write_image(&dir, "free.netmodule", &child);

    let primary_bytes = ImageBuilder::new("open.exe")
        .assembly("open")
        .module_ref("free.netmodule")
        .build();
    let path = write_image(&dir, "open.exe", &primary_bytes);

    let registry = ImageRegistry::new();
    let primary = registry.open(&path).unwrap();

    // an empty File table accepts every module reference
    let module = registry.load_module(&primary, 1).unwrap();
    assert_eq!(module.module_name(), Some("free.netmodule"));
}

#[test]
fn load_file_for_image_propagates_assembly() {
    let dir = tempfile::tempdir().unwrap();

    let child = ImageBuilder::new("part.netmodule").build();
    write_image(&dir, "part.netmodule", &child);

    let primary_bytes = ImageBuilder::new("split.exe")
        .assembly("split")
        .file("part.netmodule", 0)
        .build();
    let path = write_image(&dir, "split.exe", &primary_bytes);

    let registry = ImageRegistry::new();
    let primary = registry.open(&path).unwrap();

    let assembly: AssemblyHandle = Arc::new(0x5117_u32);
    primary.set_assembly(assembly.clone());

    let file_image = registry.load_file_for_image(&primary, 1).unwrap();
    assert_eq!(file_image.module_name(), Some("part.netmodule"));
    assert!(Arc::ptr_eq(&file_image.assembly().unwrap(), &assembly));

    let again = registry.load_file_for_image(&primary, 1).unwrap();
    assert!(Arc::ptr_eq(&file_image, &again));

    assert!(registry.load_file_for_image(&primary, 0).is_none());
    assert!(registry.load_file_for_image(&primary, 2).is_none());
}

#[test]
fn closing_parent_closes_children_once() {
    let dir = tempfile::tempdir().unwrap();

    let child = ImageBuilder::new("leaf.netmodule").build();
    write_image(&dir, "leaf.netmodule", &child);

    let primary_bytes = ImageBuilder::new("parent.exe")
        .assembly("parent")
        .module_ref("leaf.netmodule")
        .build();
    let path = write_image(&dir, "parent.exe", &primary_bytes);

    let registry = ImageRegistry::new();
    let primary = registry.open(&path).unwrap();
    let module = registry.load_module(&primary, 1).unwrap();

    // the parent carries the module's single reference
    assert_eq!(module.ref_count(), 1);
    let module_name = module.name();

    // closing the parent tears the child down exactly once
    registry.close(&primary);
    assert!(registry.loaded(&module_name, false).is_none());
    assert!(registry.loaded(&primary.name(), false).is_none());
}

#[test]
fn data_backed_images_are_cached_by_marker_name() {
    let registry = ImageRegistry::new();
    let bytes = ImageBuilder::new("mem.exe").assembly("mem").build();

    let image = registry.open_from_data(&bytes, false).unwrap();
    assert!(image.name().starts_with("data-"));

    let hit = registry.loaded(&image.name(), false).unwrap();
    assert!(Arc::ptr_eq(&hit, &image));

    // also reachable through the assembly-name alias and the GUID
    assert!(registry.loaded("mem", false).is_some());
    assert!(registry
        .loaded_by_guid("11111111-1111-1111-1111-111111111111", false)
        .is_some());
}
