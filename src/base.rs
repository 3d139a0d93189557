//! Raw message storage.
//!
//! A message is a zeroed arena block laid out by its [`MiniTable`]:
//!
//! ```text
//! [0..8)   pointer to MessageInternal (unknown bytes, extensions), or null
//! [8..12)  cached serialized size
//! [12..)   has-bits, then field slots
//! ```

use core::ptr::NonNull;

use crate::arena::Arena;
use crate::containers::Array;
use crate::map::Map;
use crate::status::{Result, Status};
use crate::tables::{MiniTable, MiniTableExtension, MiniTableField};

pub const HEADER_SIZE: usize = 12;

const INTERNAL_OFFSET: usize = 0;
const CACHED_SIZE_OFFSET: usize = 8;

/// One extension value. `value` is laid out like a one-field message whose
/// field sits at offset zero.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ExtEntry {
    pub(crate) ext: &'static MiniTableExtension,
    pub(crate) value: [u64; 2],
}

impl ExtEntry {
    /// The value slot seen as an object, for reuse of the field accessors.
    #[inline]
    pub(crate) fn slot(entry: NonNull<ExtEntry>) -> Object {
        let offset = core::mem::offset_of!(ExtEntry, value);
        Object(unsafe { entry.cast::<u8>().add(offset) })
    }

    #[inline]
    pub(crate) fn value_object(&self) -> Object {
        Object(NonNull::from(&self.value).cast())
    }
}

#[repr(C)]
pub(crate) struct MessageInternal {
    pub(crate) unknown: Array,
    // Sorted by extension number.
    pub(crate) extensions: Array,
}

/// Untyped handle to message storage.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Object(NonNull<u8>);

impl Object {
    pub fn new_in(arena: &Arena<'_>, table: &MiniTable) -> Result<Object> {
        arena
            .alloc_zeroed(table.size(), 8)
            .map(Object)
            .ok_or(Status::out_of_memory())
    }

    #[inline]
    pub(crate) fn from_ptr(ptr: NonNull<u8>) -> Object {
        Object(ptr)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline(always)]
    pub(crate) fn ptr_at(self, offset: usize) -> *mut u8 {
        unsafe { self.0.as_ptr().add(offset) }
    }

    #[inline(always)]
    pub(crate) fn get<T: Copy>(self, offset: usize) -> T {
        unsafe { (self.ptr_at(offset) as *const T).read_unaligned() }
    }

    #[inline(always)]
    pub(crate) fn set<T: Copy>(self, offset: usize, value: T) {
        unsafe { (self.ptr_at(offset) as *mut T).write_unaligned(value) }
    }

    #[inline(always)]
    pub(crate) fn zero(self, offset: usize, len: usize) {
        unsafe { self.ptr_at(offset).write_bytes(0, len) }
    }

    #[inline(always)]
    pub fn has_bit(self, bit: u32) -> bool {
        self.get::<u8>(bit as usize / 8) & (1 << (bit % 8)) != 0
    }

    #[inline(always)]
    pub fn set_has_bit(self, bit: u32) {
        let offset = bit as usize / 8;
        self.set(offset, self.get::<u8>(offset) | 1 << (bit % 8));
    }

    #[inline(always)]
    pub fn clear_has_bit(self, bit: u32) {
        let offset = bit as usize / 8;
        self.set(offset, self.get::<u8>(offset) & !(1 << (bit % 8)));
    }

    /// Has-bits of the first `count` required fields, as a mask.
    pub(crate) fn required_bits(self, count: usize) -> u64 {
        let base = HEADER_SIZE;
        let mut bits = 0u64;
        for i in 0..count.div_ceil(8) {
            bits |= (self.get::<u8>(base + i) as u64) << (8 * i);
        }
        bits
    }

    #[inline(always)]
    pub fn oneof_case(self, case_offset: usize) -> u32 {
        self.get(case_offset)
    }

    #[inline(always)]
    pub fn set_oneof_case(self, case_offset: usize, number: u32) {
        self.set(case_offset, number)
    }

    #[inline]
    pub fn cached_size(self) -> u32 {
        self.get(CACHED_SIZE_OFFSET)
    }

    #[inline]
    pub(crate) fn set_cached_size(self, size: u32) {
        self.set(CACHED_SIZE_OFFSET, size)
    }

    /// Whether `field` is present: has-bit set, or oneof case selecting it.
    /// Fields without explicit presence report `false`.
    #[inline]
    pub fn has_field(self, field: &MiniTableField) -> bool {
        if let Some(bit) = field.has_bit() {
            self.has_bit(bit)
        } else if let Some(case) = field.oneof_case_offset() {
            self.oneof_case(case) == field.number()
        } else {
            false
        }
    }

    #[inline]
    pub(crate) fn mark_present(self, field: &MiniTableField) {
        if let Some(bit) = field.has_bit() {
            self.set_has_bit(bit);
        } else if let Some(case) = field.oneof_case_offset() {
            self.set_oneof_case(case, field.number());
        }
    }

    /// Clears presence and zeroes the slot of `field`. For oneofs this only
    /// applies when `field` is the active member.
    pub(crate) fn clear_field(self, field: &MiniTableField) {
        if let Some(bit) = field.has_bit() {
            self.clear_has_bit(bit);
        } else if let Some(case) = field.oneof_case_offset() {
            if self.oneof_case(case) != field.number() {
                return;
            }
            self.set_oneof_case(case, 0);
        }
        let width = if field.is_repeated() || field.is_map() { 8 } else { field.elem_size() };
        self.zero(field.offset(), width);
    }

    /// Prepares the shared slot of a oneof for member `field`, zeroing it when
    /// another member was active.
    #[inline]
    pub(crate) fn switch_oneof(self, field: &MiniTableField) {
        if let Some(case) = field.oneof_case_offset() {
            if self.oneof_case(case) != field.number() {
                self.zero(field.offset(), field.elem_size());
                self.set_oneof_case(case, field.number());
            }
        }
    }

    #[inline]
    pub(crate) fn internal(self) -> Option<NonNull<MessageInternal>> {
        NonNull::new(self.get::<*mut MessageInternal>(INTERNAL_OFFSET))
    }

    pub(crate) fn ensure_internal(self, arena: &Arena<'_>) -> Result<NonNull<MessageInternal>> {
        if let Some(internal) = self.internal() {
            return Ok(internal);
        }
        let internal = arena.alloc::<MessageInternal>().ok_or(Status::out_of_memory())?;
        unsafe {
            internal.as_ptr().write(MessageInternal {
                unknown: Array::empty(1),
                extensions: Array::empty(core::mem::size_of::<ExtEntry>()),
            })
        };
        self.set(INTERNAL_OFFSET, internal.as_ptr());
        Ok(internal)
    }

    /// Retained unknown-field bytes, in arrival order.
    pub(crate) fn unknown<'b>(self) -> &'b [u8] {
        match self.internal() {
            Some(internal) => unsafe { (*internal.as_ptr()).unknown.as_bytes() },
            None => &[],
        }
    }

    pub(crate) fn append_unknown(self, arena: &Arena<'_>, bytes: &[u8]) -> Result<()> {
        let internal = self.ensure_internal(arena)?;
        let unknown = unsafe { &mut (*internal.as_ptr()).unknown };
        if !unknown.extend_from_bytes(arena, bytes) {
            return Err(Status::out_of_memory());
        }
        Ok(())
    }

    pub(crate) fn clear_unknown(self) {
        if let Some(internal) = self.internal() {
            unsafe { (*internal.as_ptr()).unknown.clear() };
        }
    }

    pub(crate) fn extensions<'b>(self) -> &'b [ExtEntry] {
        match self.internal() {
            Some(internal) => unsafe { (*internal.as_ptr()).extensions.as_slice::<ExtEntry>() },
            None => &[],
        }
    }

    pub(crate) fn find_extension(self, number: u32) -> Option<usize> {
        self.extensions()
            .binary_search_by_key(&number, |e| e.ext.number())
            .ok()
    }

    /// Returns the entry for `ext`, inserting a zeroed one in number order.
    pub(crate) fn get_or_create_extension(
        self,
        arena: &Arena<'_>,
        ext: &'static MiniTableExtension,
    ) -> Result<NonNull<ExtEntry>> {
        let internal = self.ensure_internal(arena)?;
        let exts = unsafe { &mut (*internal.as_ptr()).extensions };
        let pos = match exts
            .as_slice::<ExtEntry>()
            .binary_search_by_key(&ext.number(), |e| e.ext.number())
        {
            Ok(pos) => pos,
            Err(pos) => {
                let entry = ExtEntry { ext, value: [0; 2] };
                if !exts.insert(arena, pos, entry) {
                    return Err(Status::out_of_memory());
                }
                pos
            }
        };
        Ok(NonNull::from(&mut exts.as_mut_slice::<ExtEntry>()[pos]))
    }

    pub(crate) fn remove_extension(self, number: u32) -> bool {
        let (Some(internal), Some(pos)) = (self.internal(), self.find_extension(number)) else {
            return false;
        };
        unsafe { (*internal.as_ptr()).extensions.remove(pos) };
        true
    }

    #[inline]
    pub(crate) fn array(self, offset: usize) -> Option<NonNull<Array>> {
        NonNull::new(self.get::<*mut Array>(offset))
    }

    /// The array of repeated `field`, created empty on first use.
    pub(crate) fn get_or_create_array(
        self,
        arena: &Arena<'_>,
        field: &MiniTableField,
    ) -> Result<NonNull<Array>> {
        if let Some(array) = self.array(field.offset()) {
            return Ok(array);
        }
        let array = Array::new_in(arena, field.elem_size(), 0).ok_or(Status::out_of_memory())?;
        self.set(field.offset(), array.as_ptr());
        Ok(array)
    }

    #[inline]
    pub(crate) fn map(self, offset: usize) -> Option<NonNull<Map>> {
        NonNull::new(self.get::<*mut Map>(offset))
    }

    /// The map of `field`, created empty on first use. `entry` is the map
    /// entry table giving key and value types.
    pub(crate) fn get_or_create_map(
        self,
        arena: &Arena<'_>,
        field: &MiniTableField,
        entry: &MiniTable,
    ) -> Result<NonNull<Map>> {
        if let Some(map) = self.map(field.offset()) {
            return Ok(map);
        }
        let (key, value) = match entry.fields() {
            [key, value] => (key.field_type(), value.field_type()),
            _ => return Err(crate::status!(crate::status::ErrorCode::InvalidDescriptor, "bad map entry")),
        };
        let map = Map::new_in(arena, key, value).ok_or(Status::out_of_memory())?;
        self.set(field.offset(), map.as_ptr());
        Ok(map)
    }

    #[inline]
    pub(crate) fn sub(self, offset: usize) -> TaggedPtr {
        self.get(offset)
    }

    /// Zeroes every field slot, has-bit and oneof case, and drops unknown
    /// bytes and extensions. The storage itself stays in the arena.
    pub(crate) fn clear(self, table: &MiniTable) {
        if let Some(internal) = self.internal() {
            unsafe {
                (*internal.as_ptr()).unknown.clear();
                (*internal.as_ptr()).extensions.clear();
            }
        }
        self.set_cached_size(0);
        self.zero(HEADER_SIZE, table.size() - HEADER_SIZE);
    }
}

/// Sub-message slot: null, a message object, or (low bit set) a raw payload.
///
/// Raw payloads belong to unlinked or lazy fields. They are stored as an
/// empty-table object whose unknown buffer holds the payload bytes; for groups
/// only the body between the group tags is kept.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct TaggedPtr(usize);

const RAW_TAG: usize = 1;

impl TaggedPtr {
    pub const NULL: TaggedPtr = TaggedPtr(0);

    #[inline]
    pub(crate) fn from_object(obj: Object) -> Self {
        TaggedPtr(obj.as_ptr() as usize)
    }

    #[inline]
    pub(crate) fn from_raw_holder(obj: Object) -> Self {
        TaggedPtr(obj.as_ptr() as usize | RAW_TAG)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_raw(self) -> bool {
        self.0 & RAW_TAG != 0
    }

    #[inline]
    pub(crate) fn object(self) -> Option<Object> {
        if self.is_raw() {
            return None;
        }
        NonNull::new(self.0 as *mut u8).map(Object)
    }

    #[inline]
    pub(crate) fn raw_holder(self) -> Option<Object> {
        if !self.is_raw() {
            return None;
        }
        NonNull::new((self.0 & !RAW_TAG) as *mut u8).map(Object)
    }

    /// Payload bytes of a raw slot.
    pub(crate) fn raw_bytes<'b>(self) -> Option<&'b [u8]> {
        self.raw_holder().map(Object::unknown)
    }

    /// Builds a raw slot holding `payload`.
    pub(crate) fn new_raw(arena: &Arena<'_>, payload: &[u8]) -> Result<TaggedPtr> {
        let holder = Object::new_in(arena, MiniTable::empty())?;
        holder.ensure_internal(arena)?;
        holder.append_unknown(arena, payload)?;
        Ok(TaggedPtr::from_raw_holder(holder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FieldSpec, MiniTableBuilder, TableKind};
    use crate::tables::FieldType;

    fn table() -> &'static MiniTable {
        let mut b = MiniTableBuilder::new(TableKind::Message);
        b.fields.push(FieldSpec::new(1, FieldType::Int32, false));
        b.fields.push(FieldSpec::new(2, FieldType::Int64, false));
        b.build().unwrap()
    }

    #[test]
    fn has_bits_and_slots() {
        let arena = Arena::new();
        let t = table();
        let obj = Object::new_in(&arena, t).unwrap();
        let f = t.find_field(2).unwrap();
        assert!(!obj.has_field(f));
        obj.set::<i64>(f.offset(), -5);
        obj.mark_present(f);
        assert!(obj.has_field(f));
        assert_eq!(obj.get::<i64>(f.offset()), -5);
        assert!(!obj.has_field(t.find_field(1).unwrap()));
        obj.clear_field(f);
        assert!(!obj.has_field(f));
        assert_eq!(obj.get::<i64>(f.offset()), 0);
    }

    #[test]
    fn unknown_bytes_accumulate() {
        let arena = Arena::new();
        let obj = Object::new_in(&arena, table()).unwrap();
        assert!(obj.unknown().is_empty());
        obj.append_unknown(&arena, &[0x18, 0x01]).unwrap();
        obj.append_unknown(&arena, &[0x20, 0x02]).unwrap();
        assert_eq!(obj.unknown(), &[0x18, 0x01, 0x20, 0x02]);
        obj.clear_unknown();
        assert!(obj.unknown().is_empty());
    }

    #[test]
    fn raw_slots_hold_payload() {
        let arena = Arena::new();
        let raw = TaggedPtr::new_raw(&arena, &[0x08, 0x05]).unwrap();
        assert!(raw.is_raw());
        assert!(raw.object().is_none());
        assert_eq!(raw.raw_bytes(), Some(&[0x08u8, 0x05][..]));
        let obj = Object::new_in(&arena, table()).unwrap();
        let linked = TaggedPtr::from_object(obj);
        assert_eq!(linked.object(), Some(obj));
        assert!(TaggedPtr::NULL.is_null());
    }
}
