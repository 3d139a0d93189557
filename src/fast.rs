//! Fast field dispatch.
//!
//! Every mini-table lazily builds a 32-slot table indexed by bits 3..8 of the
//! first tag byte. A slot holds the field whose expected tag lands there plus a
//! decoder function monomorphized over the value shape, the cardinality, the
//! tag width and (for strings) aliasing. A function that meets anything it
//! does not handle returns [`FastResult::Fallback`] before touching the
//! message, and the generic path takes over from the tag.

use crate::arena::Arena;
use crate::base::{Object, TaggedPtr};
use crate::containers::StringView;
use crate::decoding::{Decoder, Frame};
use crate::status::{ErrorCode, Result, Status};
use crate::tables::{FieldType, MiniTable, MiniTableField};
use crate::wire::{ReadCursor, WireType, make_tag, zigzag_decode, zigzag_decode32};

pub(crate) enum FastResult {
    Continue,
    Fallback,
}

pub(crate) type FastFn =
    fn(&mut Decoder<'_, '_>, &mut Frame, &'static MiniTableField, u16) -> Result<FastResult>;

#[derive(Clone, Copy)]
struct FastEntry {
    // Expected tag bytes, little endian; one-byte tags use the low byte only.
    tag: u16,
    field: Option<&'static MiniTableField>,
    // Indexed by whether strings alias the input.
    funcs: [FastFn; 2],
}

const EMPTY: FastEntry = FastEntry {
    tag: 0,
    field: None,
    funcs: [fallback, fallback],
};

pub struct FastTable {
    slots: [FastEntry; 32],
}

const SINGULAR: u8 = 0;
const OPTIONAL: u8 = 1;
const ONEOF: u8 = 3;

// Largest field number with a tag of at most two bytes.
const MAX_FAST_NUMBER: u32 = 2047;

const SIZE_CLASSES: [usize; 4] = [64, 128, 192, 256];

fn fallback(_: &mut Decoder<'_, '_>, _: &mut Frame, _: &'static MiniTableField, _: u16) -> Result<FastResult> {
    Ok(FastResult::Fallback)
}

/// Offers the next field to the fast table of `frame`. Returns whether a field
/// was consumed; on `false` the cursor is where it was.
#[inline]
pub(crate) fn dispatch(d: &mut Decoder<'_, '_>, frame: &mut Frame) -> Result<bool> {
    let Some(first) = d.cur.peek_byte() else {
        return Ok(false);
    };
    let entry = &frame.table.fast_table().slots[slot_index(first)];
    let Some(field) = entry.field else {
        return Ok(false);
    };
    let start = d.cur.pos();
    match (entry.funcs[d.aliasing() as usize])(d, frame, field, entry.tag)? {
        FastResult::Continue => Ok(true),
        FastResult::Fallback => {
            d.cur.set_pos(start);
            Ok(false)
        }
    }
}

#[inline(always)]
fn slot_index(first: u8) -> usize {
    ((first & 0xf8) >> 3) as usize
}

#[inline(always)]
fn encode_tag(tag: u32) -> u16 {
    if tag < 0x80 {
        tag as u16
    } else {
        ((tag & 0x7f) | 0x80) as u16 | (((tag >> 7) as u16) << 8)
    }
}

#[inline(always)]
fn take_tag<const TAG_LEN: usize>(cur: &mut ReadCursor<'_>, expected: u16) -> bool {
    let peek = cur.peek_u16();
    let got = if TAG_LEN == 1 { peek & 0xff } else { peek };
    if got != expected {
        return false;
    }
    cur.advance(TAG_LEN);
    true
}

impl FastTable {
    pub(crate) fn build(table: &'static MiniTable) -> FastTable {
        let mut slots = [EMPTY; 32];
        for field in table.fields() {
            if field.number() > MAX_FAST_NUMBER {
                continue;
            }
            let Some(funcs) = select(table, field) else {
                continue;
            };
            let wire_type = if field.is_repeated() && field.is_packed() {
                WireType::Len
            } else {
                field.wire_type()
            };
            let tag = encode_tag(make_tag(field.number(), wire_type));
            let slot = &mut slots[slot_index(tag as u8)];
            if slot.field.is_none() {
                *slot = FastEntry {
                    tag,
                    field: Some(field),
                    funcs,
                };
            }
        }
        FastTable { slots }
    }

    #[cfg(test)]
    fn covers(&self, number: u32) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.field.is_some_and(|f| f.number() == number))
    }
}

fn select(table: &MiniTable, field: &MiniTableField) -> Option<[FastFn; 2]> {
    if field.number() < 16 {
        select_for::<1>(table, field)
    } else {
        select_for::<2>(table, field)
    }
}

fn select_for<const T: usize>(table: &MiniTable, field: &MiniTableField) -> Option<[FastFn; 2]> {
    if field.is_map() || field.is_extension() || field.is_lazy() || field.is_inlined() {
        return None;
    }
    let f: FastFn = match field.field_type() {
        FieldType::Bool => scalar_fns::<Bool, T>(field),
        FieldType::Int32 | FieldType::UInt32 => scalar_fns::<Varint32, T>(field),
        FieldType::Int64 | FieldType::UInt64 => scalar_fns::<Varint64, T>(field),
        FieldType::SInt32 => scalar_fns::<ZigZag32, T>(field),
        FieldType::SInt64 => scalar_fns::<ZigZag64, T>(field),
        FieldType::Fixed32 | FieldType::SFixed32 | FieldType::Float => scalar_fns::<Fixed32, T>(field),
        FieldType::Fixed64 | FieldType::SFixed64 | FieldType::Double => scalar_fns::<Fixed64, T>(field),
        FieldType::String => return Some(string_fns::<true, T>(field)),
        FieldType::Bytes => return Some(string_fns::<false, T>(field)),
        FieldType::Message => message_fns::<T>(table, field),
        // Closed enums need validation and groups need the end tag match.
        FieldType::Enum | FieldType::Group => return None,
    };
    Some([f, f])
}

fn card(field: &MiniTableField) -> u8 {
    if field.oneof_case_offset().is_some() {
        ONEOF
    } else if field.has_bit().is_some() {
        OPTIONAL
    } else {
        SINGULAR
    }
}

fn scalar_fns<S: FastScalar, const T: usize>(field: &MiniTableField) -> FastFn {
    if field.is_repeated() {
        return if field.is_packed() { packed::<S, T> } else { repeated::<S, T> };
    }
    match card(field) {
        SINGULAR => scalar::<S, SINGULAR, T>,
        OPTIONAL => scalar::<S, OPTIONAL, T>,
        _ => scalar::<S, ONEOF, T>,
    }
}

fn string_fns<const V: bool, const T: usize>(field: &MiniTableField) -> [FastFn; 2] {
    if field.is_repeated() {
        return [repeated_string::<V, false, T>, repeated_string::<V, true, T>];
    }
    match card(field) {
        SINGULAR => [string::<V, false, SINGULAR, T>, string::<V, true, SINGULAR, T>],
        OPTIONAL => [string::<V, false, OPTIONAL, T>, string::<V, true, OPTIONAL, T>],
        _ => [string::<V, false, ONEOF, T>, string::<V, true, ONEOF, T>],
    }
}

fn message_fns<const T: usize>(table: &MiniTable, field: &MiniTableField) -> FastFn {
    let class = table
        .sub_message(field)
        .and_then(|sub| SIZE_CLASSES.iter().position(|&c| sub.size() <= c))
        .map_or(0, |i| SIZE_CLASSES[i]);
    match class {
        64 => message_card::<64, T>(field),
        128 => message_card::<128, T>(field),
        192 => message_card::<192, T>(field),
        256 => message_card::<256, T>(field),
        _ => message_card::<0, T>(field),
    }
}

fn message_card<const C: usize, const T: usize>(field: &MiniTableField) -> FastFn {
    if field.is_repeated() {
        return repeated_message::<C, T>;
    }
    match card(field) {
        SINGULAR => message::<C, SINGULAR, T>,
        OPTIONAL => message::<C, OPTIONAL, T>,
        _ => message::<C, ONEOF, T>,
    }
}

/// One primitive wire shape and its storage type.
trait FastScalar {
    type Slot: Copy;
    // Fixed encoded width, zero for varints.
    const WIDTH: usize;
    fn read(cur: &mut ReadCursor<'_>) -> core::result::Result<Self::Slot, ErrorCode>;
}

struct Bool;
struct Varint32;
struct Varint64;
struct ZigZag32;
struct ZigZag64;
struct Fixed32;
struct Fixed64;

impl FastScalar for Bool {
    type Slot = u8;
    const WIDTH: usize = 0;
    #[inline(always)]
    fn read(cur: &mut ReadCursor<'_>) -> core::result::Result<u8, ErrorCode> {
        Ok((cur.read_varint()? != 0) as u8)
    }
}

impl FastScalar for Varint32 {
    type Slot = u32;
    const WIDTH: usize = 0;
    #[inline(always)]
    fn read(cur: &mut ReadCursor<'_>) -> core::result::Result<u32, ErrorCode> {
        Ok(cur.read_varint()? as u32)
    }
}

impl FastScalar for Varint64 {
    type Slot = u64;
    const WIDTH: usize = 0;
    #[inline(always)]
    fn read(cur: &mut ReadCursor<'_>) -> core::result::Result<u64, ErrorCode> {
        cur.read_varint()
    }
}

impl FastScalar for ZigZag32 {
    type Slot = i32;
    const WIDTH: usize = 0;
    #[inline(always)]
    fn read(cur: &mut ReadCursor<'_>) -> core::result::Result<i32, ErrorCode> {
        Ok(zigzag_decode32(cur.read_varint()? as u32))
    }
}

impl FastScalar for ZigZag64 {
    type Slot = i64;
    const WIDTH: usize = 0;
    #[inline(always)]
    fn read(cur: &mut ReadCursor<'_>) -> core::result::Result<i64, ErrorCode> {
        Ok(zigzag_decode(cur.read_varint()?))
    }
}

impl FastScalar for Fixed32 {
    type Slot = u32;
    const WIDTH: usize = 4;
    #[inline(always)]
    fn read(cur: &mut ReadCursor<'_>) -> core::result::Result<u32, ErrorCode> {
        cur.read_fixed32()
    }
}

impl FastScalar for Fixed64 {
    type Slot = u64;
    const WIDTH: usize = 8;
    #[inline(always)]
    fn read(cur: &mut ReadCursor<'_>) -> core::result::Result<u64, ErrorCode> {
        cur.read_fixed64()
    }
}

#[inline(always)]
fn store<const CARD: u8, V: Copy>(obj: Object, field: &MiniTableField, value: V) {
    if CARD == ONEOF {
        obj.switch_oneof(field);
    }
    obj.set(field.offset(), value);
    if CARD != SINGULAR {
        obj.mark_present(field);
    }
}

fn scalar<S: FastScalar, const CARD: u8, const T: usize>(
    d: &mut Decoder<'_, '_>,
    frame: &mut Frame,
    field: &'static MiniTableField,
    tag: u16,
) -> Result<FastResult> {
    if !take_tag::<T>(&mut d.cur, tag) {
        return Ok(FastResult::Fallback);
    }
    let value = S::read(&mut d.cur)?;
    store::<CARD, _>(frame.obj, field, value);
    Ok(FastResult::Continue)
}

fn repeated<S: FastScalar, const T: usize>(
    d: &mut Decoder<'_, '_>,
    frame: &mut Frame,
    field: &'static MiniTableField,
    tag: u16,
) -> Result<FastResult> {
    if !take_tag::<T>(&mut d.cur, tag) {
        return Ok(FastResult::Fallback);
    }
    let value = S::read(&mut d.cur)?;
    let array = frame.obj.get_or_create_array(d.arena, field)?;
    if !unsafe { &mut *array.as_ptr() }.push(d.arena, value) {
        return Err(Status::out_of_memory());
    }
    Ok(FastResult::Continue)
}

fn packed<S: FastScalar, const T: usize>(
    d: &mut Decoder<'_, '_>,
    frame: &mut Frame,
    field: &'static MiniTableField,
    tag: u16,
) -> Result<FastResult> {
    if !take_tag::<T>(&mut d.cur, tag) {
        return Ok(FastResult::Fallback);
    }
    let size = d.cur.read_size()?;
    if S::WIDTH != 0 && size % S::WIDTH != 0 {
        return Ok(FastResult::Fallback);
    }
    let array = frame.obj.get_or_create_array(d.arena, field)?;
    let array = unsafe { &mut *array.as_ptr() };
    if S::WIDTH != 0 && !array.reserve(d.arena, array.len() + size / S::WIDTH) {
        return Err(Status::out_of_memory());
    }
    let saved = d.cur.limit();
    d.cur.set_limit(d.cur.pos() + size);
    while !d.cur.at_limit() {
        let value = S::read(&mut d.cur)?;
        if !array.push(d.arena, value) {
            return Err(Status::out_of_memory());
        }
    }
    d.cur.set_limit(saved);
    Ok(FastResult::Continue)
}

#[inline(always)]
fn read_view<const VALIDATE: bool, const ALIAS: bool>(
    d: &mut Decoder<'_, '_>,
    field: &MiniTableField,
) -> Result<StringView> {
    let size = d.cur.read_size()?;
    let bytes = d.cur.read_bytes(size)?;
    if VALIDATE && core::str::from_utf8(bytes).is_err() {
        return Err(crate::status!(ErrorCode::BadUtf8, "field {}", field.number()));
    }
    if ALIAS {
        Ok(StringView::from_raw(bytes.as_ptr(), bytes.len()))
    } else {
        StringView::copy_in(d.arena, bytes).ok_or(Status::out_of_memory())
    }
}

fn string<const VALIDATE: bool, const ALIAS: bool, const CARD: u8, const T: usize>(
    d: &mut Decoder<'_, '_>,
    frame: &mut Frame,
    field: &'static MiniTableField,
    tag: u16,
) -> Result<FastResult> {
    if !take_tag::<T>(&mut d.cur, tag) {
        return Ok(FastResult::Fallback);
    }
    let view = read_view::<VALIDATE, ALIAS>(d, field)?;
    store::<CARD, _>(frame.obj, field, view);
    Ok(FastResult::Continue)
}

fn repeated_string<const VALIDATE: bool, const ALIAS: bool, const T: usize>(
    d: &mut Decoder<'_, '_>,
    frame: &mut Frame,
    field: &'static MiniTableField,
    tag: u16,
) -> Result<FastResult> {
    if !take_tag::<T>(&mut d.cur, tag) {
        return Ok(FastResult::Fallback);
    }
    let view = read_view::<VALIDATE, ALIAS>(d, field)?;
    let array = frame.obj.get_or_create_array(d.arena, field)?;
    if !unsafe { &mut *array.as_ptr() }.push(d.arena, view) {
        return Err(Status::out_of_memory());
    }
    Ok(FastResult::Continue)
}

// A size class rounds the allocation up so small children share one bump
// path; zero means the exact table size.
#[inline(always)]
fn alloc_child<const CLASS: usize>(arena: &Arena<'_>, sub: &MiniTable) -> Result<Object> {
    if CLASS == 0 {
        return Object::new_in(arena, sub);
    }
    arena
        .alloc_zeroed(CLASS, 8)
        .map(Object::from_ptr)
        .ok_or(Status::out_of_memory())
}

fn message<const CLASS: usize, const CARD: u8, const T: usize>(
    d: &mut Decoder<'_, '_>,
    frame: &mut Frame,
    field: &'static MiniTableField,
    tag: u16,
) -> Result<FastResult> {
    let Some(sub) = frame.table.sub_message(field) else {
        return Ok(FastResult::Fallback);
    };
    let target = frame.obj;
    let existing = if CARD == ONEOF && !target.has_field(field) {
        TaggedPtr::NULL
    } else {
        target.sub(field.offset())
    };
    if existing.is_raw() || !take_tag::<T>(&mut d.cur, tag) {
        return Ok(FastResult::Fallback);
    }
    let size = d.cur.read_size()?;
    let child = match existing.object() {
        Some(obj) => {
            if CARD == OPTIONAL {
                target.mark_present(field);
            }
            obj
        }
        None => {
            let obj = alloc_child::<CLASS>(d.arena, sub)?;
            store::<CARD, _>(target, field, TaggedPtr::from_object(obj));
            obj
        }
    };
    d.push_message(frame, child, sub, size)?;
    Ok(FastResult::Continue)
}

fn repeated_message<const CLASS: usize, const T: usize>(
    d: &mut Decoder<'_, '_>,
    frame: &mut Frame,
    field: &'static MiniTableField,
    tag: u16,
) -> Result<FastResult> {
    let Some(sub) = frame.table.sub_message(field) else {
        return Ok(FastResult::Fallback);
    };
    if !take_tag::<T>(&mut d.cur, tag) {
        return Ok(FastResult::Fallback);
    }
    let size = d.cur.read_size()?;
    let child = alloc_child::<CLASS>(d.arena, sub)?;
    let array = frame.obj.get_or_create_array(d.arena, field)?;
    if !unsafe { &mut *array.as_ptr() }.push(d.arena, TaggedPtr::from_object(child)) {
        return Err(Status::out_of_memory());
    }
    d.push_message(frame, child, sub, size)?;
    Ok(FastResult::Continue)
}
