//! Typed views over the metadata heaps.
//!
//! The image stores each heap as an offset/size pair into the raw data;
//! these types wrap the resulting byte slices with the access rules of the
//! individual heap formats:
//!
//! - [`Strings`] - null-terminated UTF-8 identifier strings (`#Strings`)
//! - [`Blob`] - length-prefixed binary blobs (`#Blob`)
//! - [`Guid`] - 16-byte module identifiers (`#GUID`)
//!
//! The `#US` heap is exposed as a raw slice only; user-string decoding
//! belongs to the metadata layer.

mod blob;
mod guid;
mod strings;

pub use blob::Blob;
pub use guid::Guid;
pub use strings::Strings;
