//! End-to-end behavior through the public API.

use std::sync::OnceLock;

use proptest::prelude::*;

use crate::arena::Arena;
use crate::builder::MiniTableBuilder;
use crate::message::{Message, Value};
use crate::mini_descriptor::{MiniDescriptorEncoder, build_extension, build_mini_table, modifier};
use crate::options::{DecodeOptions, EncodeOptions};
use crate::status::{ErrorCode, ErrorKind};
use crate::tables::{ExtensionRegistry, FieldType, MiniTable, MiniTableEnum, MiniTableExtension};
use crate::wire::{MAX_FIELD_NUMBER, MAX_VARINT_LEN, encode_varint};

fn table(msg_modifiers: u32, fields: &[(FieldType, u32, u32)]) -> &'static MiniTable {
    let mut e = MiniDescriptorEncoder::new();
    e.start_message(msg_modifiers);
    for &(field_type, number, modifiers) in fields {
        e.put_field(field_type, number, modifiers).unwrap();
    }
    build_mini_table(e.as_str()).unwrap()
}

fn int32_table() -> &'static MiniTable {
    table(0, &[(FieldType::Int32, 1, 0)])
}

fn parse<'m>(arena: &'m Arena<'m>, t: &'static MiniTable, bytes: &[u8]) -> crate::Result<Message<'m>> {
    Message::parse(arena, t, bytes, None, &DecodeOptions::default())
}

fn serialize(m: &Message<'_>) -> Vec<u8> {
    m.serialize(&EncodeOptions::default()).unwrap()
}

fn varint(n: u64, out: &mut Vec<u8>) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let len = encode_varint(n, &mut buf);
    out.extend_from_slice(&buf[..len]);
}

#[test]
fn scalar_round_trip() {
    let t = table(
        modifier::MSG_VALIDATE_UTF8,
        &[
            (FieldType::Int32, 1, 0),
            (FieldType::String, 2, modifier::VALIDATE_UTF8),
            (FieldType::Bool, 3, 0),
        ],
    );
    let arena = Arena::new();
    let m = Message::new(&arena, t).unwrap();
    m.set(1, Value::I32(150)).unwrap();
    m.set(2, Value::Bytes(b"hi")).unwrap();
    m.set(3, Value::Bool(true)).unwrap();
    let expected = [0x08, 0x96, 0x01, 0x12, 0x02, 0x68, 0x69, 0x18, 0x01];
    assert_eq!(serialize(&m), expected);
    assert_eq!(m.compute_size(&EncodeOptions::default()).unwrap(), expected.len());

    let back = parse(&arena, t, &expected).unwrap();
    assert!(back.equal(&m));
    assert_eq!(back.get(2).and_then(|v| v.as_str()), Some("hi"));
    assert_eq!(serialize(&back), expected);
}

#[test]
fn packed_repeated() {
    let t = table(0, &[(FieldType::Int32, 1, modifier::REPEATED | modifier::PACKED)]);
    let arena = Arena::new();
    let m = Message::new(&arena, t).unwrap();
    for x in [1, 150, 3] {
        m.push(1, Value::I32(x)).unwrap();
    }
    let packed = [0x0a, 0x04, 0x01, 0x96, 0x01, 0x03];
    assert_eq!(serialize(&m), packed);

    let from_packed = parse(&arena, t, &packed).unwrap();
    let from_unpacked = parse(&arena, t, &[0x08, 0x01, 0x08, 0x96, 0x01, 0x08, 0x03]).unwrap();
    assert!(from_packed.equal(&m));
    assert!(from_unpacked.equal(&m));
    assert_eq!(from_unpacked.repeated(1), [Value::I32(1), Value::I32(150), Value::I32(3)]);
}

#[test]
fn sub_message() {
    let inner = int32_table();
    let outer = table(0, &[(FieldType::Message, 1, 0)]);
    outer.link_message(1, inner).unwrap();
    let arena = Arena::new();
    let m = Message::new(&arena, outer).unwrap();
    m.mutable_message(1).unwrap().set(1, Value::I32(5)).unwrap();
    assert_eq!(serialize(&m), [0x0a, 0x02, 0x08, 0x05]);

    let back = parse(&arena, outer, &[0x0a, 0x02, 0x08, 0x05]).unwrap();
    assert!(back.has(1));
    let child = back.get(1).and_then(|v| v.as_message()).unwrap();
    assert_eq!(child.get(1), Some(Value::I32(5)));
}

#[test]
fn unknown_fields_survive() {
    let input = [0x08, 0x2a, 0x15, 0x00, 0x00, 0x80, 0x3f];
    let arena = Arena::new();
    let m = parse(&arena, int32_table(), &input).unwrap();
    assert_eq!(m.get(1), Some(Value::I32(42)));
    assert_eq!(m.unknown_fields(), &[0x15, 0x00, 0x00, 0x80, 0x3f]);
    assert_eq!(serialize(&m), input);

    assert!(m.discard_unknown(8));
    assert_eq!(serialize(&m), [0x08, 0x2a]);
}

fn int_map_table() -> &'static MiniTable {
    let mut e = MiniDescriptorEncoder::new();
    e.encode_map(FieldType::Int32, FieldType::Int32, 0, 0).unwrap();
    let entry = build_mini_table(e.as_str()).unwrap();
    let mut e = MiniDescriptorEncoder::new();
    e.start_message(0);
    e.put_field(FieldType::Message, 1, modifier::REPEATED).unwrap();
    MiniTableBuilder::from_mini_descriptor(e.as_str())
        .unwrap()
        .map_entry(1, entry)
        .unwrap()
        .build()
        .unwrap()
}

#[test]
fn map_determinism() {
    let t = int_map_table();
    let arena = Arena::new();
    let m = Message::new(&arena, t).unwrap();
    for (k, v) in [(2, 20), (1, 10), (3, 30)] {
        m.map_insert(1, Value::I32(k), Value::I32(v)).unwrap();
    }
    let deterministic = m.serialize(&EncodeOptions::default().deterministic(true)).unwrap();
    assert_eq!(
        deterministic,
        [
            0x0a, 0x04, 0x08, 0x01, 0x10, 0x0a, //
            0x0a, 0x04, 0x08, 0x02, 0x10, 0x14, //
            0x0a, 0x04, 0x08, 0x03, 0x10, 0x1e,
        ]
    );

    let any_order = serialize(&m);
    assert_eq!(any_order.len(), deterministic.len());
    let back = parse(&arena, t, &any_order).unwrap();
    assert_eq!(back.map_len(1), 3);
    assert_eq!(back.map_get(1, Value::I32(3)), Some(Value::I32(30)));
    assert!(back.equal(&m));
}

#[test]
fn required_missing() {
    let t = table(0, &[(FieldType::Int32, 1, modifier::REQUIRED)]);
    let arena = Arena::new();
    let strict = DecodeOptions::default().check_required(true);
    let err = Message::parse(&arena, t, &[], None, &strict).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingRequired);
    assert_eq!(err.kind(), ErrorKind::MissingRequired);

    let m = parse(&arena, t, &[]).unwrap();
    assert!(!m.has(1));
    assert!(!m.is_initialized());
    assert!(Message::parse(&arena, t, &[0x08, 0x00], None, &strict).is_ok());
}

#[test]
fn map_entry_with_closed_enum_reject_goes_to_unknown() {
    let values: &'static MiniTableEnum = Box::leak(Box::new(MiniTableEnum::from_values([0, 1, 2])));
    let mut e = MiniDescriptorEncoder::new();
    e.encode_map(FieldType::Int32, FieldType::Enum, 0, modifier::CLOSED_ENUM).unwrap();
    let entry = build_mini_table(e.as_str()).unwrap();
    entry.link_enum(2, values).unwrap();
    let mut e = MiniDescriptorEncoder::new();
    e.start_message(0);
    e.put_field(FieldType::Message, 3, modifier::REPEATED).unwrap();
    let t = MiniTableBuilder::from_mini_descriptor(e.as_str())
        .unwrap()
        .map_entry(3, entry)
        .unwrap()
        .build()
        .unwrap();

    let good = [0x1a, 0x04, 0x08, 0x01, 0x10, 0x02];
    let bad = [0x1a, 0x04, 0x08, 0x02, 0x10, 0x09];
    let input = [good, bad].concat();
    let arena = Arena::new();
    let m = parse(&arena, t, &input).unwrap();
    assert_eq!(m.map_len(3), 1);
    assert_eq!(m.map_get(3, Value::I32(1)), Some(Value::I32(2)));
    assert_eq!(m.map_get(3, Value::I32(2)), None);
    assert_eq!(m.unknown_fields(), &bad);
    assert_eq!(serialize(&m), input);
}

fn message_set() -> (&'static MiniTable, &'static MiniTableExtension) {
    let set = build_mini_table("&").unwrap();
    let mut e = MiniDescriptorEncoder::new();
    e.encode_extension(FieldType::Message, 1000, 0).unwrap();
    let ext = build_extension(e.as_str(), set).unwrap().leak();
    ext.link_message(int32_table()).unwrap();
    (set, ext)
}

#[test]
fn message_set_items() {
    let (set, ext) = message_set();
    let mut registry = ExtensionRegistry::new();
    registry.add(ext).unwrap();
    let options = DecodeOptions::default();
    let arena = Arena::new();

    // group 1 { type_id = 1000; message = { a: 5 } }
    let item = [0x0b, 0x10, 0xe8, 0x07, 0x1a, 0x02, 0x08, 0x05, 0x0c];
    let m = Message::parse(&arena, set, &item, Some(&registry), &options).unwrap();
    let payload = m.get_extension(ext).and_then(|v| v.as_message()).unwrap();
    assert_eq!(payload.get(1), Some(Value::I32(5)));
    assert!(m.unknown_fields().is_empty());
    assert_eq!(serialize(&m), item);

    let payload_first = [0x0b, 0x1a, 0x02, 0x08, 0x05, 0x10, 0xe8, 0x07, 0x0c];
    let swapped = Message::parse(&arena, set, &payload_first, Some(&registry), &options).unwrap();
    assert!(swapped.equal(&m));
    assert_eq!(serialize(&swapped), item);

    let built = Message::new(&arena, set).unwrap();
    let child = Message::new(&arena, ext.sub_message().unwrap()).unwrap();
    child.set(1, Value::I32(5)).unwrap();
    built.set_extension(ext, Value::Message(child)).unwrap();
    assert_eq!(built.compute_size(&EncodeOptions::default()).unwrap(), item.len());
    assert_eq!(serialize(&built), item);
}

#[test]
fn unregistered_message_set_item_is_kept_whole() {
    let (set, ext) = message_set();
    let arena = Arena::new();
    let payload_first = [0x0b, 0x1a, 0x02, 0x08, 0x05, 0x10, 0xe8, 0x07, 0x0c];
    let m = parse(&arena, set, &payload_first).unwrap();
    assert!(!m.has_extension(ext));
    assert_eq!(m.unknown_fields(), &payload_first);
    assert_eq!(serialize(&m), payload_first);

    // Registered later, the retained item still parses.
    let mut registry = ExtensionRegistry::new();
    registry.add(ext).unwrap();
    let reparsed = Message::parse(&arena, set, &serialize(&m), Some(&registry), &DecodeOptions::default()).unwrap();
    assert!(reparsed.has_extension(ext));
}

#[test]
fn two_byte_and_five_byte_tags() {
    let t = table(0, &[(FieldType::Int32, 1, 0), (FieldType::Int32, 16, 0)]);
    let arena = Arena::new();
    let input = [0x08, 0x07, 0x80, 0x01, 0x09];
    let m = parse(&arena, t, &input).unwrap();
    assert_eq!(m.get(16), Some(Value::I32(9)));
    assert_eq!(serialize(&m), input);

    let t = table(0, &[(FieldType::UInt32, MAX_FIELD_NUMBER, 0)]);
    let input = [0xf8, 0xff, 0xff, 0xff, 0x0f, 0x01];
    let m = parse(&arena, t, &input).unwrap();
    assert_eq!(m.get(MAX_FIELD_NUMBER), Some(Value::U32(1)));
    assert_eq!(serialize(&m), input);
}

#[test]
fn varint_length_limits() {
    let t = table(0, &[(FieldType::UInt64, 1, 0)]);
    let arena = Arena::new();
    let mut ten = vec![0x08];
    ten.extend_from_slice(&[0xff; 9]);
    ten.push(0x01);
    let m = parse(&arena, t, &ten).unwrap();
    assert_eq!(m.get(1), Some(Value::U64(u64::MAX)));
    assert_eq!(serialize(&m), ten);

    let mut eleven = vec![0x08];
    eleven.extend_from_slice(&[0x80; 10]);
    eleven.push(0x00);
    let err = parse(&arena, t, &eleven).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);
}

#[test]
fn utf8_validation() {
    let t = table(modifier::MSG_VALIDATE_UTF8, &[(FieldType::String, 2, modifier::VALIDATE_UTF8)]);
    let arena = Arena::new();
    let m = parse(&arena, t, &[0x12, 0x00]).unwrap();
    assert_eq!(m.get(2), Some(Value::Bytes(b"")));
    let err = parse(&arena, t, &[0x12, 0x01, 0x80]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadUtf8);

    // Without validation the same bytes are accepted as-is.
    let lax = table(0, &[(FieldType::String, 2, 0)]);
    let m = parse(&arena, lax, &[0x12, 0x01, 0x80]).unwrap();
    assert_eq!(m.get(2), Some(Value::Bytes(&[0x80])));
}

#[test]
fn truncated_inputs_fail() {
    let t = table(0, &[(FieldType::Fixed64, 1, 0), (FieldType::Bytes, 2, 0)]);
    let arena = Arena::new();
    for input in [&[0x09, 0x01, 0x02][..], &[0x12, 0x05, 0x61], &[0x08], &[0x0b]] {
        let err = parse(&arena, t, input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed, "{input:?}");
    }
}

#[test]
fn insufficient_buffer_is_reported() {
    let arena = Arena::new();
    let m = parse(&arena, int32_table(), &[0x08, 0x96, 0x01]).unwrap();
    let mut small = [0u8; 2];
    let err = crate::serialize(&m, &EncodeOptions::default(), &mut small).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientBuffer);
    let mut exact = [0u8; 3];
    assert_eq!(crate::serialize(&m, &EncodeOptions::default(), &mut exact).unwrap(), 3);
}

#[test]
fn merge_matches_concatenation() {
    let t = table(
        0,
        &[
            (FieldType::Int32, 1, 0),
            (FieldType::SInt64, 2, modifier::REPEATED),
            (FieldType::Bytes, 3, 0),
        ],
    );
    let arena = Arena::new();
    let a = parse(&arena, t, &[0x08, 0x01, 0x10, 0x03, 0x1a, 0x01, 0x61]).unwrap();
    let b = parse(&arena, t, &[0x08, 0x02, 0x10, 0x05]).unwrap();

    let merged = Message::new(&arena, t).unwrap();
    crate::merge(&merged, &a, None).unwrap();
    crate::merge(&merged, &b, None).unwrap();

    let mut both = serialize(&a);
    both.extend(serialize(&b));
    let concatenated = parse(&arena, t, &both).unwrap();
    assert!(crate::equal(&merged, &concatenated));
    assert_eq!(merged.get(1), Some(Value::I32(2)));
    assert_eq!(merged.repeated(2), [Value::I64(-2), Value::I64(-3)]);
    assert_eq!(merged.get(3), Some(Value::Bytes(b"a")));

    crate::clear(&merged);
    assert!(crate::equal(&merged, &Message::new(&arena, t).unwrap()));
}

#[test]
fn arena_usage_is_linear_in_input() {
    let t = table(0, &[(FieldType::Bytes, 1, modifier::REPEATED)]);
    let mut input = Vec::new();
    for _ in 0..1000 {
        input.extend_from_slice(&[0x0a, 0x03, 1, 2, 3]);
    }
    let arena = Arena::new();
    let m = parse(&arena, t, &input).unwrap();
    assert_eq!(m.repeated_len(1), 1000);
    assert!(arena.space_allocated() < 64 * input.len());
}

#[test]
fn deep_nesting_is_rejected_quickly() {
    let t = table(0, &[(FieldType::Message, 1, 0)]);
    t.link_message(1, t).unwrap();
    // 200 levels of field 1 wrapping nothing.
    let mut input: Vec<u8> = Vec::new();
    for _ in 0..200 {
        let mut outer = vec![0x0a];
        varint(input.len() as u64, &mut outer);
        outer.extend_from_slice(&input);
        input = outer;
    }
    let arena = Arena::new();
    let err = parse(&arena, t, &input).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MaxDepthExceeded);
    let deep = DecodeOptions::default().max_depth(300);
    assert!(Message::parse(&arena, t, &input, None, &deep).is_ok());
}

#[test]
fn length_prefixed_stream() {
    let t = int32_table();
    let arena = Arena::new();
    let mut out = Vec::new();
    for x in [1, -1] {
        let m = Message::new(&arena, t).unwrap();
        m.set(1, Value::I32(x)).unwrap();
        crate::serialize_length_prefixed(&m, &EncodeOptions::default(), &mut out).unwrap();
    }
    let (first, used) = crate::parse_length_prefixed(&arena, t, &out, None, &DecodeOptions::default()).unwrap();
    let (second, rest) = crate::parse_length_prefixed(&arena, t, &out[used..], None, &DecodeOptions::default()).unwrap();
    assert_eq!(used + rest, out.len());
    assert_eq!(first.get(1), Some(Value::I32(1)));
    assert_eq!(second.get(1), Some(Value::I32(-1)));
}

fn mixed_table() -> &'static MiniTable {
    static TABLE: OnceLock<&'static MiniTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        table(
            modifier::MSG_VALIDATE_UTF8,
            &[
                (FieldType::Int32, 1, 0),
                (FieldType::String, 2, modifier::VALIDATE_UTF8),
                (FieldType::Bool, 3, 0),
                (FieldType::SInt64, 4, modifier::REPEATED | modifier::PACKED),
                (FieldType::Bytes, 5, 0),
                (FieldType::Double, 6, 0),
                (FieldType::Fixed32, 7, modifier::REPEATED),
                (FieldType::UInt64, 20, 0),
            ],
        )
    })
}

#[derive(Debug, Clone)]
struct Sample {
    a: Option<i32>,
    b: Option<String>,
    c: Option<bool>,
    d: Vec<i64>,
    e: Option<Vec<u8>>,
    f: Option<f64>,
    g: Vec<u32>,
    h: Option<u64>,
}

fn sample() -> impl Strategy<Value = Sample> {
    (
        any::<Option<i32>>(),
        any::<Option<String>>(),
        any::<Option<bool>>(),
        proptest::collection::vec(any::<i64>(), 0..8),
        proptest::option::of(proptest::collection::vec(any::<u8>(), 0..32)),
        any::<Option<f64>>(),
        proptest::collection::vec(any::<u32>(), 0..8),
        any::<Option<u64>>(),
    )
        .prop_map(|(a, b, c, d, e, f, g, h)| Sample { a, b, c, d, e, f, g, h })
}

fn build<'m>(arena: &'m Arena<'m>, s: &Sample) -> Message<'m> {
    let m = Message::new(arena, mixed_table()).unwrap();
    if let Some(a) = s.a {
        m.set(1, Value::I32(a)).unwrap();
    }
    if let Some(b) = &s.b {
        m.set(2, Value::Bytes(b.as_bytes())).unwrap();
    }
    if let Some(c) = s.c {
        m.set(3, Value::Bool(c)).unwrap();
    }
    for &d in &s.d {
        m.push(4, Value::I64(d)).unwrap();
    }
    if let Some(e) = &s.e {
        m.set(5, Value::Bytes(e)).unwrap();
    }
    if let Some(f) = s.f {
        m.set(6, Value::F64(f)).unwrap();
    }
    for &g in &s.g {
        m.push(7, Value::U32(g)).unwrap();
    }
    if let Some(h) = s.h {
        m.set(20, Value::U64(h)).unwrap();
    }
    m
}

proptest! {
    #[test]
    fn round_trip(s in sample()) {
        let arena = Arena::new();
        let m = build(&arena, &s);
        let bytes = serialize(&m);
        prop_assert_eq!(m.compute_size(&EncodeOptions::default()).unwrap(), bytes.len());
        let back = parse(&arena, mixed_table(), &bytes).unwrap();
        prop_assert!(back.equal(&m));
        prop_assert_eq!(serialize(&back), bytes);
    }

    #[test]
    fn deterministic_output_is_a_function_of_content(s in sample()) {
        let options = EncodeOptions::default().deterministic(true);
        let a = Arena::new();
        let b = Arena::new();
        let first = build(&a, &s).serialize(&options).unwrap();
        let second = build(&b, &s).serialize(&options).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn packed_and_unpacked_agree(values in proptest::collection::vec(any::<u32>(), 0..16)) {
        let t = table(0, &[(FieldType::UInt32, 1, modifier::REPEATED | modifier::PACKED)]);
        let mut unpacked = Vec::new();
        let mut body = Vec::new();
        for &v in &values {
            unpacked.push(0x08);
            varint(v as u64, &mut unpacked);
            varint(v as u64, &mut body);
        }
        let mut packed = vec![0x0a];
        varint(body.len() as u64, &mut packed);
        packed.extend_from_slice(&body);

        let arena = Arena::new();
        let a = parse(&arena, t, &unpacked).unwrap();
        let b = parse(&arena, t, &packed).unwrap();
        prop_assert!(a.equal(&b));
        prop_assert_eq!(a.repeated_len(1), values.len());
    }

    #[test]
    fn arbitrary_input_never_panics(input in proptest::collection::vec(any::<u8>(), 0..96)) {
        let t = table(
            0,
            &[
                (FieldType::Int32, 1, 0),
                (FieldType::Bytes, 2, 0),
                (FieldType::Fixed64, 3, modifier::REPEATED),
                (FieldType::SInt32, 4, modifier::REPEATED | modifier::PACKED),
            ],
        );
        let arena = Arena::new();
        if let Ok(m) = parse(&arena, t, &input) {
            let bytes = serialize(&m);
            let back = parse(&arena, t, &bytes).unwrap();
            prop_assert!(back.equal(&m));
        }
    }
}
