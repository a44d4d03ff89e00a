//! Runtime ASN.1 engine.
//!
//! A [`Schema`](schema::Schema) is parsed once from a textual ASN.1 module and
//! shared read-only. Decoding binds a DER image to a [`ValueTree`](tree::ValueTree)
//! whose nodes keep byte-accurate `(offset, header, length)` triples into the
//! image; encoding walks a tree back into a fresh image and rebinds every node
//! to it. The [`path`] module addresses decoded trees with dotted path
//! expressions.

#[macro_use]
mod debug_log;

pub mod ber;
pub mod decode;
pub mod encode;
mod error;
pub mod path;
pub mod schema;
pub mod tag;
pub mod tree;

pub use error::{Asn1Error, Result};
pub use tag::{Tag, TagClass};
