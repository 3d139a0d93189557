#![no_main]

use std::sync::OnceLock;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pbcore::{Arena, DecodeOptions, FieldType, Message, MiniDescriptorEncoder, MiniTable, modifier};

#[derive(Arbitrary, Debug)]
struct ChunkedInput {
    data: Vec<u8>,
    chunk_sizes: Vec<u8>,
    check_required: bool,
    allow_unlinked: bool,
    discard_unknown: bool,
    max_depth: u8,
}

fn table() -> &'static MiniTable {
    static TABLE: OnceLock<&'static MiniTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::Int32, 1, modifier::REQUIRED).unwrap();
        e.put_field(FieldType::Message, 2, 0).unwrap();
        e.put_field(FieldType::Message, 3, modifier::REPEATED).unwrap();
        e.put_field(FieldType::Bytes, 4, modifier::REPEATED).unwrap();
        let table = pbcore::build_mini_table(e.as_str()).unwrap();
        // Field 3 stays unlinked.
        table.link_message(2, table).unwrap();
        table
    })
}

fuzz_target!(|input: ChunkedInput| {
    let options = DecodeOptions::default()
        .check_required(input.check_required)
        .allow_unlinked(input.allow_unlinked)
        .discard_unknown(input.discard_unknown)
        .max_depth(input.max_depth as u32);

    // Each chunk is a separate top-level merge into the same message.
    let arena = Arena::new();
    let Ok(msg) = Message::new(&arena, table()) else {
        return;
    };
    let mut pos = 0;
    let mut chunk_idx = 0;
    while pos < input.data.len() {
        let size = input.chunk_sizes.get(chunk_idx).copied().unwrap_or(16).max(1) as usize;
        let end = (pos + size).min(input.data.len());
        if msg.merge_bytes(&input.data[pos..end], None, &options).is_err() {
            return;
        }
        pos = end;
        chunk_idx += 1;
    }
    let _ = msg.is_initialized();
    let _ = msg.serialize(&Default::default());
});
