//! Protocol Buffers wire-format core.
//!
//! Messages live in [`Arena`]s and are described at runtime by [`MiniTable`]s,
//! built from compact mini-descriptor strings. The codec parses and
//! serializes the binary wire format against those tables:
//!
//! ```
//! use pbcore::{Arena, DecodeOptions, EncodeOptions, Message, Value};
//!
//! // message { optional int32 a = 1; }
//! let table = pbcore::build_mini_table("$(").unwrap();
//! let arena = Arena::new();
//! let msg = Message::parse(&arena, table, &[0x08, 0x96, 0x01], None, &DecodeOptions::default()).unwrap();
//! assert_eq!(msg.get(1), Some(Value::I32(150)));
//! assert_eq!(msg.serialize(&EncodeOptions::default()).unwrap(), [0x08, 0x96, 0x01]);
//! ```

pub mod arena;
pub mod base;
pub mod containers;
pub mod status;
pub mod wire;

pub mod utils;

pub mod builder;
pub mod mini_descriptor;
pub mod options;
pub mod tables;

pub mod decoding;
pub mod encoding;
pub mod fast;

pub mod io;
pub mod map;
pub mod message;

#[cfg(test)]
mod test;

pub use arena::{Arena, set_block_allocator};
pub use base::Object;
pub use builder::MiniTableBuilder;
pub use io::{parse_length_prefixed, serialize_length_prefixed};
pub use map::{MapInsert, MapIter};
pub use message::{Message, Value};
pub use mini_descriptor::{MiniDescriptorEncoder, build_enum, build_extension, build_mini_table, modifier};
pub use options::{ArenaConfig, DecodeOptions, EncodeOptions};
pub use status::{ErrorCode, ErrorKind, Result, Status};
pub use tables::{
    ExtensionRegistry, FieldType, MiniTable, MiniTableEnum, MiniTableExtension, MiniTableField,
};

/// Parses `bytes` into `msg`, merging with its current contents.
pub fn parse(
    msg: &Message<'_>,
    bytes: &[u8],
    registry: Option<&ExtensionRegistry>,
    options: &DecodeOptions,
) -> Result<()> {
    msg.merge_bytes(bytes, registry, options)
}

/// Serializes `msg` into `out`, which must hold at least
/// [`compute_size`] bytes. Returns the byte count written.
pub fn serialize(msg: &Message<'_>, options: &EncodeOptions, out: &mut [u8]) -> Result<usize> {
    msg.serialize_into(out, options)
}

pub fn serialize_to_vec(msg: &Message<'_>, options: &EncodeOptions) -> Result<Vec<u8>> {
    msg.serialize(options)
}

pub fn compute_size(msg: &Message<'_>, options: &EncodeOptions) -> Result<usize> {
    msg.compute_size(options)
}

/// Merges `src` into `dst`: singular fields are overwritten, repeated fields
/// appended and sub-messages merged recursively.
pub fn merge(dst: &Message<'_>, src: &Message<'_>, registry: Option<&ExtensionRegistry>) -> Result<()> {
    dst.merge_from(src, registry)
}

pub fn clear(msg: &Message<'_>) {
    msg.clear()
}

pub fn equal(a: &Message<'_>, b: &Message<'_>) -> bool {
    a.equal(b)
}
