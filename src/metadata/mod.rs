//! CLI metadata parsing: the runtime header, the metadata root, the named
//! heaps and the table descriptors.
//!
//! The modules here turn the byte region behind the CLI data directory into
//! the structures the [`crate::Image`] entity hangs on to: the
//! [`cliheader::CliHeader`], the [`root::MetadataRoot`] with its stream
//! directory, typed [`streams`] views, and the [`tables::TableSet`] with
//! its row-column decoder in [`tables::schema`].

pub mod cliheader;
pub mod root;
pub mod streams;
pub mod tables;
