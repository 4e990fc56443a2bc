// Copyright 2025-2026 The cilimage contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![allow(dead_code)]

//! # cilimage
//!
//! A loader and random-access reader for CLI (Common Language
//! Infrastructure) managed-code images stored in the extended PE/COFF file
//! format. Given a file path or an in-memory buffer, `cilimage` validates
//! the container, parses the PE headers, indexes the section table,
//! resolves the CLI header and metadata root, enumerates the named
//! metadata heaps, and decodes the compressed table descriptors - then
//! exposes random access over the result: RVA translation, table row
//! counts and raw cells, resource tree lookups, strong-name and public-key
//! locations, and recursive loading of referenced modules.
//!
//! # Architecture
//!
//! - **File layer** - memory-mapped or in-memory backing stores behind the
//!   [`file::Backend`] trait, with endian-safe primitive readers
//! - **PE layer** - hand-validated headers and section table for 32-bit
//!   CLI images, plus the native resource directory walk
//! - **Metadata layer** - the CLI header, the `BSJB` metadata root, the
//!   named heaps and the table descriptors with a row-column decoder
//! - **Image layer** - the [`Image`] entity with its query surface
//! - **Cache layer** - the [`ImageRegistry`] deduplicating images by
//!   canonical path and metadata GUID with reference-counted lifetimes
//!
//! # Usage Examples
//!
//! ```rust,no_run
//! use cilimage::{ImageRegistry, TableId};
//! use std::path::Path;
//!
//! let registry = ImageRegistry::new();
//! let image = registry.open(Path::new("program.exe"))?;
//!
//! println!("assembly: {:?}", image.assembly_name());
//! println!("mvid: {:?}", image.guid());
//! println!("methods: {}", image.table_rows(TableId::MethodDef));
//!
//! // load every referenced module next to the primary image
//! for idx in 1..=image.module_count() {
//!     if let Some(module) = registry.load_module(&image, idx) {
//!         println!("module: {}", module.name());
//!     }
//! }
//!
//! registry.close(&image);
//! # Ok::<(), cilimage::Error>(())
//! ```
//!
//! Buffer-backed loading works the same way:
//!
//! ```rust,no_run
//! use cilimage::ImageRegistry;
//!
//! let bytes = std::fs::read("program.exe")?;
//! let registry = ImageRegistry::new();
//! let image = registry.open_from_data(&bytes, false)?;
//! println!("entry point: {:#010x}", image.entry_point());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Error Handling
//!
//! All fallible operations return [`Result<T, Error>`](Result). Parse
//! failures carry their source location; I/O failures wrap the OS error
//! unchanged. The coarse [`OpenStatus`] classification with its fixed
//! `strerror` mapping is derived from any error for callers that only
//! distinguish "system error" from "invalid image".
//!
//! # Thread Safety
//!
//! All public types are [`std::marker::Send`] and [`std::marker::Sync`].
//! Any operation may be invoked on any image from any thread; the registry
//! lock is never held across parsing or file I/O.
//!
//! # Standards
//!
//! The on-disk format follows the **ECMA-335 specification** (6th
//! edition), Partition II, and the Microsoft PE/COFF specification.
//! PE32+ (64-bit) images and non-x86 machine identifiers are rejected.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

mod cache;
mod image;

/// Raw data backends and primitive readers.
pub mod file;

/// CLI metadata parsing: runtime header, metadata root, heaps and tables.
pub mod metadata;

/// PE/COFF container parsing and the native resource directory.
pub mod pe;

/// `cilimage` Result type.
///
/// A type alias for `std::result::Result<T, Error>` where the error type
/// is always [`crate::Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `cilimage` Error type.
///
/// See [`error::Error`] for the variants and [`OpenStatus`] for the coarse
/// classification open callers consume.
pub use error::Error;

/// Coarse open-status classification with the fixed `strerror` mapping.
pub use error::OpenStatus;

/// The loaded-image entity and its random-access query surface.
pub use image::{AssemblyHandle, CacheEntry, Image, ImageCaches};

/// The image cache with reference-counted image lifetimes.
pub use cache::ImageRegistry;

/// Low-level cursor parser over byte slices.
pub use file::parser::Parser;

/// Metadata table identifiers and descriptors.
pub use metadata::tables::{TableId, TableInfo, TableSet};

/// The PE resource tree leaf record.
pub use pe::resources::ResourceDataEntry;
