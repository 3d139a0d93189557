//! Two-pass wire writer.
//!
//! The size pass walks the whole tree once, validates it, and caches every
//! message's encoded size in its header. The write pass then emits forward
//! into a buffer of exactly that size, reading child sizes from the cache.

use core::ptr::NonNull;

use crate::base::{Object, TaggedPtr};
use crate::builder::{MAP_KEY_OFFSET, MAP_VALUE_OFFSET};
use crate::containers::{Array, InlineString, StringView};
use crate::decoding::Subs;
use crate::map::Slot;
use crate::options::EncodeOptions;
use crate::status::{ErrorCode, Result};
use crate::tables::{FieldRep, FieldType, MiniTable, MiniTableField};
use crate::wire::{WireType, WriteCursor, tag_size, varint_size, zigzag_encode, zigzag_encode32};

// Message-set item framing: start group 1, type id (2, varint), message
// (3, LEN), end group 1.
const ITEM_START: u8 = 0x0b;
const ITEM_TYPE_ID: u8 = 0x10;
const ITEM_MESSAGE: u8 = 0x1a;
const ITEM_END: u8 = 0x0c;

/// Encoded size of `obj`, caching the sizes of every message in the tree.
pub(crate) fn compute_size(obj: Object, table: &'static MiniTable, options: &EncodeOptions) -> Result<usize> {
    Sizer::walk(options).message(obj, table)
}

/// Serializes into `out`, returning the number of bytes written. Nothing is
/// written when `out` is too small.
pub(crate) fn encode(obj: Object, table: &'static MiniTable, options: &EncodeOptions, out: &mut [u8]) -> Result<usize> {
    let size = compute_size(obj, table, options)?;
    if out.len() < size {
        return Err(crate::status!(
            ErrorCode::InsufficientBuffer,
            "need {size} bytes, have {}",
            out.len()
        ));
    }
    let mut writer = Writer {
        cur: WriteCursor::new(&mut out[..size]),
        options,
    };
    writer.message(obj, table)?;
    debug_assert_eq!(writer.cur.pos(), size);
    Ok(size)
}

pub(crate) fn encode_to_vec(obj: Object, table: &'static MiniTable, options: &EncodeOptions) -> Result<Vec<u8>> {
    let size = compute_size(obj, table, options)?;
    let mut out = vec![0u8; size];
    let mut writer = Writer {
        cur: WriteCursor::new(&mut out),
        options,
    };
    writer.message(obj, table)?;
    debug_assert_eq!(writer.cur.pos(), size);
    Ok(out)
}

#[inline]
fn load(obj: Object, offset: usize, width: usize) -> u64 {
    match width {
        1 => obj.get::<u8>(offset) as u64,
        4 => obj.get::<u32>(offset) as u64,
        _ => obj.get::<u64>(offset),
    }
}

#[inline]
fn element(array: &Array, i: usize) -> u64 {
    match array.elem_size() {
        1 => array.as_slice::<u8>()[i] as u64,
        4 => array.as_slice::<u32>()[i] as u64,
        _ => array.as_slice::<u64>()[i],
    }
}

/// Varint payload of a scalar stored as `bits`. Negative `int32` and enum
/// values are sign extended to ten bytes.
#[inline]
fn varint_value(field_type: FieldType, bits: u64) -> u64 {
    match field_type {
        FieldType::Int32 | FieldType::Enum => bits as u32 as i32 as i64 as u64,
        FieldType::SInt32 => zigzag_encode32(bits as u32 as i32) as u64,
        FieldType::SInt64 => zigzag_encode(bits as i64),
        _ => bits,
    }
}

#[inline]
fn scalar_size(field_type: FieldType, bits: u64) -> usize {
    match field_type.wire_type() {
        WireType::I32 => 4,
        WireType::I64 => 8,
        _ => varint_size(varint_value(field_type, bits)),
    }
}

fn packed_payload(field: &MiniTableField, array: &Array) -> usize {
    let field_type = field.field_type();
    match field_type.wire_type() {
        WireType::I32 => 4 * array.len(),
        WireType::I64 => 8 * array.len(),
        _ => (0..array.len())
            .map(|i| scalar_size(field_type, element(array, i)))
            .sum(),
    }
}

fn string_bytes<'b>(obj: Object, field: &MiniTableField) -> &'b [u8] {
    if field.is_inlined() {
        let s = unsafe { &*(obj.ptr_at(field.offset()) as *const InlineString) };
        unsafe { s.as_bytes() }
    } else {
        unsafe { obj.get::<StringView>(field.offset()).as_bytes() }
    }
}

// Presence for emission. Fields without explicit presence are written when
// their value differs from zero.
fn should_emit(obj: Object, field: &MiniTableField, always: bool) -> bool {
    if always {
        return true;
    }
    if field.has_presence() {
        return obj.has_field(field);
    }
    match field.rep() {
        FieldRep::String | FieldRep::Bytes => !string_bytes(obj, field).is_empty(),
        FieldRep::Message => !obj.sub(field.offset()).is_null(),
        _ => load(obj, field.offset(), field.elem_size()) != 0,
    }
}

/// Runs `f` on a 48-byte map entry object holding `key` and `value`.
fn with_entry<R>(key: Slot, value: Slot, f: impl FnOnce(Object) -> R) -> R {
    let mut buf = [0u64; 6];
    let k = MAP_KEY_OFFSET as usize / 8;
    let v = MAP_VALUE_OFFSET as usize / 8;
    buf[k..k + 2].copy_from_slice(&key);
    buf[v..v + 2].copy_from_slice(&value);
    f(Object::from_ptr(NonNull::from(&mut buf).cast()))
}

enum Body<'b> {
    Message(Object, &'static MiniTable),
    Raw(&'b [u8]),
    Empty,
}

fn body<'b>(slot: TaggedPtr, sub: Option<&'static MiniTable>, number: u32) -> Result<Body<'b>> {
    if let Some(raw) = slot.raw_bytes() {
        return Ok(Body::Raw(raw));
    }
    match (slot.object(), sub) {
        (None, _) => Ok(Body::Empty),
        (Some(obj), Some(sub)) => Ok(Body::Message(obj, sub)),
        (Some(_), None) => Err(crate::status!(ErrorCode::UnlinkedSubMessage, "field {number}")),
    }
}

struct Sizer<'o> {
    options: &'o EncodeOptions,
    depth: u32,
    // Read child sizes from the cache instead of walking them.
    cached: bool,
}

impl<'o> Sizer<'o> {
    fn walk(options: &'o EncodeOptions) -> Self {
        Sizer {
            options,
            depth: options.max_depth,
            cached: false,
        }
    }

    fn cached(options: &'o EncodeOptions) -> Self {
        Sizer {
            options,
            depth: options.max_depth,
            cached: true,
        }
    }

    fn message(&mut self, obj: Object, table: &'static MiniTable) -> Result<usize> {
        if self.cached {
            return Ok(obj.cached_size() as usize);
        }
        if self.depth == 0 {
            return Err(ErrorCode::MaxDepthExceeded.into());
        }
        if self.options.check_required
            && obj.required_bits(table.required_count()) & table.required_mask() != table.required_mask()
        {
            return Err(ErrorCode::MissingRequired.into());
        }
        self.depth -= 1;
        let mut size = 0;
        let subs = Subs::Table(table);
        for field in table.fields() {
            size += self.field(obj, subs, field, false)?;
        }
        for entry in obj.extensions() {
            let slot = entry.value_object();
            let ext = entry.ext;
            size += if table.is_message_set() {
                let n = self.body(body(slot.sub(0), ext.sub_message(), ext.number())?)?;
                4 + varint_size(ext.number() as u64) + varint_size(n as u64) + n
            } else {
                self.field(slot, Subs::Ext(ext), ext.field(), true)?
            };
        }
        if !self.options.skip_unknown {
            size += obj.unknown().len();
        }
        self.depth += 1;
        if size > i32::MAX as usize {
            return Err(crate::status!(ErrorCode::MessageTooLarge, "{size} bytes"));
        }
        obj.set_cached_size(size as u32);
        Ok(size)
    }

    fn body(&mut self, body: Body<'_>) -> Result<usize> {
        match body {
            Body::Message(obj, table) => self.message(obj, table),
            Body::Raw(raw) => Ok(raw.len()),
            Body::Empty => Ok(0),
        }
    }

    // Size of a sub-message frame around a body of `n` bytes.
    #[inline]
    fn frame(field: &MiniTableField, n: usize) -> usize {
        let tag = tag_size(field.number());
        if field.is_group() { 2 * tag + n } else { tag + varint_size(n as u64) + n }
    }

    fn field(&mut self, obj: Object, subs: Subs, field: &MiniTableField, always: bool) -> Result<usize> {
        if field.is_map() {
            return self.map(obj, subs, field);
        }
        if field.is_repeated() {
            return self.repeated(obj, subs, field);
        }
        if !should_emit(obj, field, always) {
            return Ok(0);
        }
        let tag = tag_size(field.number());
        Ok(match field.rep() {
            FieldRep::String | FieldRep::Bytes => {
                let len = string_bytes(obj, field).len();
                tag + varint_size(len as u64) + len
            }
            FieldRep::Message => {
                let n = self.body(body(obj.sub(field.offset()), subs.message(field), field.number())?)?;
                Self::frame(field, n)
            }
            _ => tag + scalar_size(field.field_type(), load(obj, field.offset(), field.elem_size())),
        })
    }

    fn repeated(&mut self, obj: Object, subs: Subs, field: &MiniTableField) -> Result<usize> {
        let Some(array) = obj.array(field.offset()) else {
            return Ok(0);
        };
        let array = unsafe { array.as_ref() };
        if array.is_empty() {
            return Ok(0);
        }
        let tag = tag_size(field.number());
        let mut size = 0;
        match field.rep() {
            FieldRep::String | FieldRep::Bytes => {
                for view in array.as_slice::<StringView>() {
                    size += tag + varint_size(view.len() as u64) + view.len();
                }
            }
            FieldRep::Message => {
                let sub = subs.message(field);
                for &slot in array.as_slice::<TaggedPtr>() {
                    let n = self.body(body(slot, sub, field.number())?)?;
                    size += Self::frame(field, n);
                }
            }
            _ => {
                let payload = packed_payload(field, array);
                size = if field.is_packed() {
                    tag + varint_size(payload as u64) + payload
                } else {
                    tag * array.len() + payload
                };
            }
        }
        Ok(size)
    }

    fn map(&mut self, obj: Object, subs: Subs, field: &MiniTableField) -> Result<usize> {
        let Some(map) = obj.map(field.offset()) else {
            return Ok(0);
        };
        let map = unsafe { map.as_ref() };
        if map.is_empty() {
            return Ok(0);
        }
        let entry_table = subs.message(field).ok_or(ErrorCode::UnlinkedSubMessage)?;
        let tag = tag_size(field.number());
        let mut size = 0;
        for (key, value) in map.iter() {
            let n = self.entry(entry_table, key, value)?;
            size += tag + varint_size(n as u64) + n;
        }
        Ok(size)
    }

    fn entry(&mut self, entry_table: &'static MiniTable, key: Slot, value: Slot) -> Result<usize> {
        with_entry(key, value, |entry| -> Result<usize> {
            let subs = Subs::Table(entry_table);
            let mut n = 0;
            for field in entry_table.fields() {
                n += self.field(entry, subs, field, true)?;
            }
            Ok(n)
        })
    }
}

struct Writer<'b, 'o> {
    cur: WriteCursor<'b>,
    options: &'o EncodeOptions,
}

impl Writer<'_, '_> {
    fn message(&mut self, obj: Object, table: &'static MiniTable) -> Result<()> {
        let subs = Subs::Table(table);
        for field in table.fields() {
            self.field(obj, subs, field, false)?;
        }
        for entry in obj.extensions() {
            let slot = entry.value_object();
            let ext = entry.ext;
            if table.is_message_set() {
                self.cur.write_slice(&[ITEM_START, ITEM_TYPE_ID]);
                self.cur.write_varint(ext.number() as u64);
                self.cur.write_slice(&[ITEM_MESSAGE]);
                self.len_body(body(slot.sub(0), ext.sub_message(), ext.number())?)?;
                self.cur.write_slice(&[ITEM_END]);
            } else {
                self.field(slot, Subs::Ext(ext), ext.field(), true)?;
            }
        }
        if !self.options.skip_unknown {
            self.cur.write_slice(obj.unknown());
        }
        Ok(())
    }

    // Length prefix plus body.
    fn len_body(&mut self, body: Body<'_>) -> Result<()> {
        match body {
            Body::Message(obj, table) => {
                self.cur.write_varint(obj.cached_size() as u64);
                self.message(obj, table)
            }
            Body::Raw(raw) => {
                self.cur.write_varint(raw.len() as u64);
                self.cur.write_slice(raw);
                Ok(())
            }
            Body::Empty => {
                self.cur.write_varint(0);
                Ok(())
            }
        }
    }

    fn sub_message(&mut self, field: &MiniTableField, body: Body<'_>) -> Result<()> {
        let number = field.number();
        if !field.is_group() {
            self.cur.write_tag(number, WireType::Len);
            return self.len_body(body);
        }
        self.cur.write_tag(number, WireType::StartGroup);
        match body {
            Body::Message(obj, table) => self.message(obj, table)?,
            Body::Raw(raw) => self.cur.write_slice(raw),
            Body::Empty => {}
        }
        self.cur.write_tag(number, WireType::EndGroup);
        Ok(())
    }

    #[inline]
    fn scalar(&mut self, field_type: FieldType, bits: u64) {
        match field_type.wire_type() {
            WireType::I32 => self.cur.write_fixed32(bits as u32),
            WireType::I64 => self.cur.write_fixed64(bits),
            _ => self.cur.write_varint(varint_value(field_type, bits)),
        }
    }

    fn bytes(&mut self, number: u32, bytes: &[u8]) {
        self.cur.write_tag(number, WireType::Len);
        self.cur.write_varint(bytes.len() as u64);
        self.cur.write_slice(bytes);
    }

    fn field(&mut self, obj: Object, subs: Subs, field: &MiniTableField, always: bool) -> Result<()> {
        if field.is_map() {
            return self.map(obj, subs, field);
        }
        if field.is_repeated() {
            return self.repeated(obj, subs, field);
        }
        if !should_emit(obj, field, always) {
            return Ok(());
        }
        let number = field.number();
        match field.rep() {
            FieldRep::String | FieldRep::Bytes => self.bytes(number, string_bytes(obj, field)),
            FieldRep::Message => {
                let body = body(obj.sub(field.offset()), subs.message(field), number)?;
                self.sub_message(field, body)?;
            }
            _ => {
                let field_type = field.field_type();
                self.cur.write_tag(number, field_type.wire_type());
                self.scalar(field_type, load(obj, field.offset(), field.elem_size()));
            }
        }
        Ok(())
    }

    fn repeated(&mut self, obj: Object, subs: Subs, field: &MiniTableField) -> Result<()> {
        let Some(array) = obj.array(field.offset()) else {
            return Ok(());
        };
        let array = unsafe { array.as_ref() };
        if array.is_empty() {
            return Ok(());
        }
        let number = field.number();
        match field.rep() {
            FieldRep::String | FieldRep::Bytes => {
                for view in array.as_slice::<StringView>() {
                    self.bytes(number, unsafe { view.as_bytes() });
                }
            }
            FieldRep::Message => {
                let sub = subs.message(field);
                for &slot in array.as_slice::<TaggedPtr>() {
                    self.sub_message(field, body(slot, sub, number)?)?;
                }
            }
            _ => {
                let field_type = field.field_type();
                if field.is_packed() {
                    let payload = packed_payload(field, array);
                    self.cur.write_tag(number, WireType::Len);
                    self.cur.write_varint(payload as u64);
                    for i in 0..array.len() {
                        self.scalar(field_type, element(array, i));
                    }
                } else {
                    for i in 0..array.len() {
                        self.cur.write_tag(number, field_type.wire_type());
                        self.scalar(field_type, element(array, i));
                    }
                }
            }
        }
        Ok(())
    }

    fn map(&mut self, obj: Object, subs: Subs, field: &MiniTableField) -> Result<()> {
        let Some(map) = obj.map(field.offset()) else {
            return Ok(());
        };
        let map = unsafe { map.as_ref() };
        if map.is_empty() {
            return Ok(());
        }
        let entry_table = subs.message(field).ok_or(ErrorCode::UnlinkedSubMessage)?;
        if self.options.deterministic {
            for (key, value) in map.sorted() {
                self.entry(field.number(), entry_table, key, value)?;
            }
        } else {
            for (key, value) in map.iter() {
                self.entry(field.number(), entry_table, key, value)?;
            }
        }
        Ok(())
    }

    fn entry(&mut self, number: u32, entry_table: &'static MiniTable, key: Slot, value: Slot) -> Result<()> {
        let n = Sizer::cached(self.options).entry(entry_table, key, value)?;
        self.cur.write_tag(number, WireType::Len);
        self.cur.write_varint(n as u64);
        with_entry(key, value, |entry| -> Result<()> {
            let subs = Subs::Table(entry_table);
            for field in entry_table.fields() {
                self.field(entry, subs, field, true)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::decoding::decode;
    use crate::mini_descriptor::{MiniDescriptorEncoder, build_mini_table, modifier};
    use crate::options::DecodeOptions;

    fn round_trip(table: &'static MiniTable, input: &[u8]) -> Vec<u8> {
        let arena = Arena::new();
        let obj = Object::new_in(&arena, table).unwrap();
        decode(input, obj, table, &arena, None, &DecodeOptions::default()).unwrap();
        encode_to_vec(obj, table, &EncodeOptions::default()).unwrap()
    }

    #[test]
    fn negative_int32_takes_ten_bytes() {
        let t = build_mini_table("$(").unwrap();
        let arena = Arena::new();
        let obj = Object::new_in(&arena, t).unwrap();
        let f = t.find_field(1).unwrap();
        obj.set(f.offset(), -1i32);
        obj.mark_present(f);
        let out = encode_to_vec(obj, t, &EncodeOptions::default()).unwrap();
        assert_eq!(out, [0x08, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
        assert_eq!(compute_size(obj, t, &EncodeOptions::default()).unwrap(), 11);
    }

    #[test]
    fn implicit_presence_skips_zero() {
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::Int64, 1, modifier::PROTO3_SINGULAR).unwrap();
        e.put_field(FieldType::Bytes, 2, modifier::PROTO3_SINGULAR).unwrap();
        let t = build_mini_table(e.as_str()).unwrap();
        let arena = Arena::new();
        let obj = Object::new_in(&arena, t).unwrap();
        assert!(encode_to_vec(obj, t, &EncodeOptions::default()).unwrap().is_empty());
        assert_eq!(round_trip(t, &[0x08, 0x00, 0x08, 0x03]), [0x08, 0x03]);
    }

    #[test]
    fn unknown_bytes_come_last() {
        let t = build_mini_table("$(").unwrap();
        // Unknown field 2 before known field 1.
        assert_eq!(round_trip(t, &[0x10, 0x01, 0x08, 0x05]), [0x08, 0x05, 0x10, 0x01]);

        let arena = Arena::new();
        let obj = Object::new_in(&arena, t).unwrap();
        decode(&[0x10, 0x01], obj, t, &arena, None, &DecodeOptions::default()).unwrap();
        let skip = EncodeOptions::default().skip_unknown(true);
        assert!(encode_to_vec(obj, t, &skip).unwrap().is_empty());
    }

    #[test]
    fn insufficient_buffer() {
        let t = build_mini_table("$(").unwrap();
        let arena = Arena::new();
        let obj = Object::new_in(&arena, t).unwrap();
        decode(&[0x08, 0x96, 0x01], obj, t, &arena, None, &DecodeOptions::default()).unwrap();
        let mut small = [0u8; 2];
        let err = encode(obj, t, &EncodeOptions::default(), &mut small).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InsufficientBuffer);
        assert_eq!(small, [0, 0]);
        let mut exact = [0u8; 3];
        assert_eq!(encode(obj, t, &EncodeOptions::default(), &mut exact).unwrap(), 3);
        assert_eq!(exact, [0x08, 0x96, 0x01]);
    }

    #[test]
    fn groups_round_trip() {
        // message M { optional group G = 1 { optional int32 a = 2; } }
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::Group, 1, 0).unwrap();
        let outer = build_mini_table(e.as_str()).unwrap();
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::Int32, 2, 0).unwrap();
        let inner = build_mini_table(e.as_str()).unwrap();
        outer.link_message(1, inner).unwrap();
        let input = [0x0b, 0x10, 0x07, 0x0c];
        assert_eq!(round_trip(outer, &input), input);
    }

    #[test]
    fn missing_required_refused_on_request() {
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::Int32, 1, modifier::REQUIRED).unwrap();
        let t = build_mini_table(e.as_str()).unwrap();
        let arena = Arena::new();
        let obj = Object::new_in(&arena, t).unwrap();
        assert!(encode_to_vec(obj, t, &EncodeOptions::default()).is_ok());
        let strict = EncodeOptions::default().check_required(true);
        assert_eq!(
            encode_to_vec(obj, t, &strict).unwrap_err().code(),
            ErrorCode::MissingRequired
        );
    }

    #[test]
    fn deterministic_maps_sort_by_key() {
        let mut e = MiniDescriptorEncoder::new();
        e.encode_map(FieldType::Int32, FieldType::Int32, 0, 0).unwrap();
        let entry = build_mini_table(e.as_str()).unwrap();
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::Message, 1, modifier::REPEATED).unwrap();
        let t = crate::builder::MiniTableBuilder::from_mini_descriptor(e.as_str())
            .unwrap()
            .map_entry(1, entry)
            .unwrap()
            .build()
            .unwrap();
        let input = [
            0x0a, 0x04, 0x08, 0x02, 0x10, 0x14, //
            0x0a, 0x04, 0x08, 0x01, 0x10, 0x0a, //
            0x0a, 0x04, 0x08, 0x03, 0x10, 0x1e,
        ];
        let arena = Arena::new();
        let obj = Object::new_in(&arena, t).unwrap();
        decode(&input, obj, t, &arena, None, &DecodeOptions::default()).unwrap();
        let out = encode_to_vec(obj, t, &EncodeOptions::default().deterministic(true)).unwrap();
        assert_eq!(
            out,
            [
                0x0a, 0x04, 0x08, 0x01, 0x10, 0x0a, //
                0x0a, 0x04, 0x08, 0x02, 0x10, 0x14, //
                0x0a, 0x04, 0x08, 0x03, 0x10, 0x1e,
            ]
        );
        let loose = encode_to_vec(obj, t, &EncodeOptions::default()).unwrap();
        assert_eq!(loose.len(), out.len());
    }

    #[test]
    fn map_entries_write_default_key_and_value() {
        let mut e = MiniDescriptorEncoder::new();
        e.encode_map(FieldType::String, FieldType::Int32, 0, 0).unwrap();
        let entry = build_mini_table(e.as_str()).unwrap();
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::Message, 1, modifier::REPEATED).unwrap();
        let t = crate::builder::MiniTableBuilder::from_mini_descriptor(e.as_str())
            .unwrap()
            .map_entry(1, entry)
            .unwrap()
            .build()
            .unwrap();
        // An empty entry gets key "" and value 0.
        assert_eq!(round_trip(t, &[0x0a, 0x00]), [0x0a, 0x04, 0x0a, 0x00, 0x10, 0x00]);
    }
}
