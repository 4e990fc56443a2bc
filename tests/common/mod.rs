#![allow(dead_code)]

//! Crafted minimal CLI images for end-to-end tests.
//!
//! The builder assembles a complete, byte-exact PE/COFF image with CLI
//! metadata: DOS stub, PE headers, one `.text` section holding the CLI
//! header, optional strong-name and managed-resource regions, and the
//! metadata streams; optionally a `.rsrc` section with a three-level
//! resource tree. Offsets are computed, not hard-coded, so the layouts
//! stay valid as the content grows.

/// RVA of the `.text` section.
pub const TEXT_RVA: u32 = 0x2000;
/// File offset of the `.text` section raw data.
pub const TEXT_RAW: u32 = 0x200;
/// RVA of the `.rsrc` section, when present.
pub const RSRC_RVA: u32 = 0x3000;

/// Offset of the metadata root within the file for a minimal build
/// (no strong name, no managed resources).
pub const MINIMAL_METADATA_OFFSET: usize = 0x290;

const FILE_ALIGN: usize = 0x200;

fn align4(value: usize) -> usize {
    (value + 3) & !3
}

fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

struct StringsHeap {
    data: Vec<u8>,
}

impl StringsHeap {
    fn new() -> StringsHeap {
        StringsHeap { data: vec![0] }
    }

    fn intern(&mut self, value: &str) -> u32 {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        offset
    }
}

fn w16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn w32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Builder for minimal managed images.
pub struct ImageBuilder {
    module_name: String,
    assembly_name: Option<String>,
    mvid: [u8; 16],
    public_key: Option<Vec<u8>>,
    module_refs: Vec<String>,
    files: Vec<(String, u32)>,
    strong_name: Option<Vec<u8>>,
    managed_resources: Option<Vec<u8>>,
    native_resources: bool,
    entry_point: u32,
}

impl ImageBuilder {
    pub fn new(module_name: &str) -> ImageBuilder {
        ImageBuilder {
            module_name: module_name.to_string(),
            assembly_name: None,
            mvid: [0x11; 16],
            public_key: None,
            module_refs: Vec::new(),
            files: Vec::new(),
            strong_name: None,
            managed_resources: None,
            native_resources: false,
            entry_point: 0x0600_0001,
        }
    }

    pub fn assembly(mut self, name: &str) -> ImageBuilder {
        self.assembly_name = Some(name.to_string());
        self
    }

    pub fn mvid(mut self, mvid: [u8; 16]) -> ImageBuilder {
        self.mvid = mvid;
        self
    }

    pub fn public_key(mut self, key: &[u8]) -> ImageBuilder {
        self.public_key = Some(key.to_vec());
        self
    }

    pub fn module_ref(mut self, name: &str) -> ImageBuilder {
        self.module_refs.push(name.to_string());
        self
    }

    pub fn file(mut self, name: &str, flags: u32) -> ImageBuilder {
        self.files.push((name.to_string(), flags));
        self
    }

    pub fn strong_name(mut self, blob: &[u8]) -> ImageBuilder {
        self.strong_name = Some(blob.to_vec());
        self
    }

    pub fn managed_resources(mut self, region: &[u8]) -> ImageBuilder {
        self.managed_resources = Some(region.to_vec());
        self
    }

    pub fn native_version_resource(mut self) -> ImageBuilder {
        self.native_resources = true;
        self
    }

    pub fn entry_point(mut self, token: u32) -> ImageBuilder {
        self.entry_point = token;
        self
    }

    pub fn build(self) -> Vec<u8> {
        // ---- heaps -------------------------------------------------
        let mut strings = StringsHeap::new();
        let module_name_idx = strings.intern(&self.module_name);
        let typedef_name_idx = strings.intern("<Module>");
        let assembly_name_idx = self.assembly_name.as_deref().map(|n| strings.intern(n));
        let module_ref_idxs: Vec<u32> =
            self.module_refs.iter().map(|n| strings.intern(n)).collect();
        let file_idxs: Vec<(u32, u32)> = self
            .files
            .iter()
            .map(|(n, flags)| (strings.intern(n), *flags))
            .collect();

        let mut blob_heap = vec![0u8];
        let public_key_idx = self.public_key.as_ref().map(|key| {
            let offset = blob_heap.len() as u32;
            assert!(key.len() < 0x80);
            blob_heap.push(key.len() as u8);
            blob_heap.extend_from_slice(key);
            offset
        });

        let guid_heap = self.mvid.to_vec();
        let us_heap = vec![0u8];

        // ---- table rows --------------------------------------------
        let mut module_rows = Vec::new();
        w16(&mut module_rows, 0); // generation
        w16(&mut module_rows, module_name_idx as u16);
        w16(&mut module_rows, 1); // mvid
        w16(&mut module_rows, 0); // encid
        w16(&mut module_rows, 0); // encbaseid

        let mut typedef_rows = Vec::new();
        w32(&mut typedef_rows, 0); // flags
        w16(&mut typedef_rows, typedef_name_idx as u16);
        w16(&mut typedef_rows, 0); // namespace
        w16(&mut typedef_rows, 0); // extends
        w16(&mut typedef_rows, 1); // field list
        w16(&mut typedef_rows, 1); // method list

        let mut moduleref_rows = Vec::new();
        for idx in &module_ref_idxs {
            w16(&mut moduleref_rows, *idx as u16);
        }

        let mut assembly_rows = Vec::new();
        if let Some(name_idx) = assembly_name_idx {
            w32(&mut assembly_rows, 0x8004); // SHA1
            w16(&mut assembly_rows, 1); // version 1.0.0.0
            w16(&mut assembly_rows, 0);
            w16(&mut assembly_rows, 0);
            w16(&mut assembly_rows, 0);
            w32(
                &mut assembly_rows,
                if public_key_idx.is_some() { 0x0001 } else { 0 },
            );
            w16(&mut assembly_rows, public_key_idx.unwrap_or(0) as u16);
            w16(&mut assembly_rows, name_idx as u16);
            w16(&mut assembly_rows, 0); // culture
        }

        let mut file_rows = Vec::new();
        for (name_idx, flags) in &file_idxs {
            w32(&mut file_rows, *flags);
            w16(&mut file_rows, *name_idx as u16);
            w16(&mut file_rows, 0); // hash
        }

        // (table id, row count, row bytes), ascending id order
        let tables: Vec<(usize, u32, &[u8])> = vec![
            (0x00, 1, &module_rows),
            (0x02, 1, &typedef_rows),
            (0x1A, module_ref_idxs.len() as u32, &moduleref_rows),
            (0x20, u32::from(assembly_name_idx.is_some()), &assembly_rows),
            (0x26, file_idxs.len() as u32, &file_rows),
        ];

        let mut tables_stream = vec![0u8; 24];
        tables_stream[4] = 2; // schema major
        let mut valid = 0u64;
        for (id, rows, _) in &tables {
            if *rows > 0 {
                valid |= 1 << id;
            }
        }
        tables_stream[8..16].copy_from_slice(&valid.to_le_bytes());
        for (_, rows, _) in &tables {
            if *rows > 0 {
                w32(&mut tables_stream, *rows);
            }
        }
        for (_, rows, bytes) in &tables {
            if *rows > 0 {
                tables_stream.extend_from_slice(bytes);
            }
        }

        // ---- metadata region ---------------------------------------
        let version = b"v4.0.30319\0\0";
        let mut md = Vec::new();
        w32(&mut md, 0x424A_5342); // BSJB
        w16(&mut md, 1);
        w16(&mut md, 0); // reserved half
        w16(&mut md, 1);
        w16(&mut md, 0); // reserved half
        w32(&mut md, version.len() as u32);
        md.extend_from_slice(version);
        w16(&mut md, 0); // flags

        let streams: Vec<(&[u8], &[u8])> = vec![
            (b"#~\0", &tables_stream),
            (b"#Strings\0", &strings.data),
            (b"#US\0", &us_heap),
            (b"#GUID\0", &guid_heap),
            (b"#Blob\0", &blob_heap),
        ];

        w16(&mut md, streams.len() as u16);

        // stream headers are fixed-size once the names are known, so the
        // data offsets can be computed up front
        let headers_len: usize = streams.iter().map(|(name, _)| 8 + align4(name.len())).sum();
        let mut data_offset = md.len() + headers_len;
        let mut placed = Vec::new();
        for (name, content) in &streams {
            data_offset = align4(data_offset);
            w32(&mut md, data_offset as u32);
            w32(&mut md, content.len() as u32);
            md.extend_from_slice(name);
            while md.len() % 4 != 0 {
                md.push(0);
            }
            placed.push((data_offset, *content));
            data_offset += content.len();
        }
        for (offset, content) in placed {
            md.resize(offset, 0);
            md.extend_from_slice(content);
        }

        // ---- .text section -----------------------------------------
        let mut text = vec![0u8; 0x90]; // CLI header slot
        let strong_name_off = self.strong_name.as_ref().map(|blob| {
            let offset = text.len();
            text.extend_from_slice(blob);
            text.resize(align4(text.len()), 0);
            offset
        });
        let resources_off = self.managed_resources.as_ref().map(|region| {
            let offset = text.len();
            text.extend_from_slice(region);
            text.resize(align4(text.len()), 0);
            offset
        });
        let md_off = text.len();
        text.extend_from_slice(&md);

        // CLI header fields
        let mut cli = Vec::new();
        w32(&mut cli, 72); // cb
        w16(&mut cli, 2);
        w16(&mut cli, 5); // runtime version
        w32(&mut cli, TEXT_RVA + md_off as u32);
        w32(&mut cli, md.len() as u32);
        w32(&mut cli, 1); // flags: ILONLY
        w32(&mut cli, self.entry_point);
        match (resources_off, self.managed_resources.as_ref()) {
            (Some(offset), Some(region)) => {
                w32(&mut cli, TEXT_RVA + offset as u32);
                w32(&mut cli, region.len() as u32);
            }
            _ => {
                w32(&mut cli, 0);
                w32(&mut cli, 0);
            }
        }
        match (strong_name_off, self.strong_name.as_ref()) {
            (Some(offset), Some(blob)) => {
                w32(&mut cli, TEXT_RVA + offset as u32);
                w32(&mut cli, blob.len() as u32);
            }
            _ => {
                w32(&mut cli, 0);
                w32(&mut cli, 0);
            }
        }
        text[..cli.len()].copy_from_slice(&cli);

        let text_raw_size = align_to(text.len(), FILE_ALIGN);

        // ---- .rsrc section -----------------------------------------
        let rsrc = if self.native_resources {
            Some(build_version_resource())
        } else {
            None
        };

        // ---- assemble the file -------------------------------------
        let section_count: u16 = 1 + u16::from(rsrc.is_some());
        let mut out = vec![0u8; 0x200];
        out[0] = b'M';
        out[1] = b'Z';
        out[60..64].copy_from_slice(&0x80u32.to_le_bytes());

        let pe = 0x80;
        out[pe..pe + 4].copy_from_slice(b"PE\0\0");
        out[pe + 4..pe + 6].copy_from_slice(&0x14Cu16.to_le_bytes());
        out[pe + 6..pe + 8].copy_from_slice(&section_count.to_le_bytes());
        out[pe + 20..pe + 22].copy_from_slice(&224u16.to_le_bytes());
        out[pe + 22..pe + 24].copy_from_slice(&0x0102u16.to_le_bytes());

        let opt = pe + 24;
        out[opt..opt + 2].copy_from_slice(&0x10Bu16.to_le_bytes());
        out[opt + 2] = 8; // linker version
        out[opt + 16..opt + 20].copy_from_slice(&self.entry_point.to_le_bytes());
        out[opt + 28..opt + 32].copy_from_slice(&0x0040_0000u32.to_le_bytes());
        out[opt + 32..opt + 36].copy_from_slice(&0x1000u32.to_le_bytes());
        out[opt + 36..opt + 40].copy_from_slice(&(FILE_ALIGN as u32).to_le_bytes());
        out[opt + 40..opt + 42].copy_from_slice(&4u16.to_le_bytes()); // os major
        out[opt + 60..opt + 64].copy_from_slice(&0x200u32.to_le_bytes()); // headers size
        out[opt + 68..opt + 70].copy_from_slice(&3u16.to_le_bytes()); // subsystem
        out[opt + 92..opt + 96].copy_from_slice(&16u32.to_le_bytes());

        let dirs = opt + 96;
        if let Some(rsrc_data) = &rsrc {
            out[dirs + 2 * 8..dirs + 2 * 8 + 4].copy_from_slice(&RSRC_RVA.to_le_bytes());
            out[dirs + 2 * 8 + 4..dirs + 2 * 8 + 8]
                .copy_from_slice(&(rsrc_data.len() as u32).to_le_bytes());
        }
        out[dirs + 14 * 8..dirs + 14 * 8 + 4].copy_from_slice(&TEXT_RVA.to_le_bytes());
        out[dirs + 14 * 8 + 4..dirs + 14 * 8 + 8].copy_from_slice(&72u32.to_le_bytes());

        fn write_section(
            out: &mut [u8],
            sect: usize,
            name: &[u8],
            rva: u32,
            rsize: u32,
            raw: u32,
            flags: u32,
        ) {
            out[sect..sect + name.len()].copy_from_slice(name);
            out[sect + 8..sect + 12].copy_from_slice(&rsize.to_le_bytes());
            out[sect + 12..sect + 16].copy_from_slice(&rva.to_le_bytes());
            out[sect + 16..sect + 20].copy_from_slice(&rsize.to_le_bytes());
            out[sect + 20..sect + 24].copy_from_slice(&raw.to_le_bytes());
            out[sect + 36..sect + 40].copy_from_slice(&flags.to_le_bytes());
        }

        let sect = dirs + 128;
        write_section(
            &mut out,
            sect,
            b".text",
            TEXT_RVA,
            text_raw_size as u32,
            TEXT_RAW,
            0x6000_0020,
        );

        let rsrc_raw = TEXT_RAW as usize + text_raw_size;
        if let Some(rsrc_data) = &rsrc {
            let rsrc_size = align_to(rsrc_data.len(), FILE_ALIGN);
            write_section(
                &mut out,
                sect + 40,
                b".rsrc",
                RSRC_RVA,
                rsrc_size as u32,
                rsrc_raw as u32,
                0x4000_0040,
            );
        }

        out.resize(TEXT_RAW as usize, 0);
        out.extend_from_slice(&text);
        out.resize(TEXT_RAW as usize + text_raw_size, 0);
        if let Some(rsrc_data) = &rsrc {
            out.extend_from_slice(rsrc_data);
            out.resize(align_to(out.len(), FILE_ALIGN), 0);
        }

        out
    }
}

/// A three-level resource tree with a version-info entry: type 16, one
/// anonymous item, language 1033 (en-US).
fn build_version_resource() -> Vec<u8> {
    let mut data = vec![0u8; 0x100];

    let put_u32 = |data: &mut [u8], offset: usize, value: u32| {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    };
    let put_u16 = |data: &mut [u8], offset: usize, value: u16| {
        data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    };

    // level 0: one ID entry, type 16 (RT_VERSION)
    put_u16(&mut data, 14, 1);
    put_u32(&mut data, 16, 16);
    put_u32(&mut data, 20, 0x8000_0030);

    // level 1: one anonymous item
    put_u16(&mut data, 0x30 + 14, 1);
    put_u32(&mut data, 0x30 + 16, 1);
    put_u32(&mut data, 0x30 + 20, 0x8000_0060);

    // level 2: language 1033, leaf at 0x90
    put_u16(&mut data, 0x60 + 14, 1);
    put_u32(&mut data, 0x60 + 16, 1033);
    put_u32(&mut data, 0x60 + 20, 0x90);

    // data entry pointing at the payload below
    put_u32(&mut data, 0x90, RSRC_RVA + 0xC0);
    put_u32(&mut data, 0x94, 0x20);
    put_u32(&mut data, 0x98, 1252);

    // payload
    for (i, byte) in data[0xC0..0xE0].iter_mut().enumerate() {
        *byte = i as u8;
    }

    data
}
