#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use pbcore::{Arena, DecodeOptions, EncodeOptions, FieldType, Message, MiniDescriptorEncoder, MiniTable, modifier};

fn table() -> &'static MiniTable {
    static TABLE: OnceLock<&'static MiniTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(modifier::MSG_VALIDATE_UTF8 | modifier::MSG_EXTENDABLE);
        e.put_field(FieldType::Int32, 1, 0).unwrap();
        e.put_field(FieldType::String, 2, modifier::VALIDATE_UTF8).unwrap();
        e.put_field(FieldType::Message, 3, 0).unwrap();
        e.put_field(FieldType::Message, 4, modifier::REPEATED).unwrap();
        e.put_field(FieldType::SInt64, 5, modifier::REPEATED | modifier::PACKED).unwrap();
        e.put_field(FieldType::Fixed32, 6, modifier::REPEATED).unwrap();
        e.put_field(FieldType::Group, 7, 0).unwrap();
        e.put_field(FieldType::Bytes, 8, 0).unwrap();
        let table = pbcore::build_mini_table(e.as_str()).unwrap();
        for number in [3, 4, 7] {
            table.link_message(number, table).unwrap();
        }
        table
    })
}

fuzz_target!(|data: &[u8]| {
    // Whatever parses must serialize, and parse back to an equal message.
    let arena = Arena::new();
    let Ok(msg) = Message::parse(&arena, table(), data, None, &DecodeOptions::default()) else {
        return;
    };
    let bytes = msg.serialize(&EncodeOptions::default()).unwrap();
    assert_eq!(msg.compute_size(&EncodeOptions::default()).unwrap(), bytes.len());
    let back = Message::parse(&arena, table(), &bytes, None, &DecodeOptions::default()).unwrap();
    assert!(back.equal(&msg));
});
