//! Typed handle over message storage.
//!
//! A [`Message`] pairs an [`Object`] with its mini-table and the arena it
//! lives in. Field access goes by field number and moves values in and out as
//! [`Value`]s, checked against the declared field type.

use core::fmt;
use core::ptr::NonNull;

use tracing::debug;

use crate::arena::Arena;
use crate::base::{ExtEntry, HEADER_SIZE, Object, TaggedPtr};
use crate::containers::{Array, InlineString, StringView};
use crate::decoding::{self, Subs};
use crate::encoding;
use crate::map::{Map, MapInsert, MapIter, Slot};
use crate::options::{DEFAULT_MAX_DEPTH, DecodeOptions, EncodeOptions};
use crate::status::{ErrorCode, Result, Status};
use crate::tables::{ExtensionRegistry, FieldRep, FieldType, MiniTable, MiniTableExtension, MiniTableField};

/// A field value moved in or out of a message.
#[derive(Clone, Copy, PartialEq)]
pub enum Value<'m> {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// String or bytes.
    Bytes(&'m [u8]),
    Message(Message<'m>),
    /// Payload of a sub-message whose table is not linked yet, or of a lazy
    /// field not promoted yet.
    Unlinked(&'m [u8]),
}

impl<'m> Value<'m> {
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::U32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Value::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'m [u8]> {
        match *self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'m str> {
        self.as_bytes().and_then(|b| core::str::from_utf8(b).ok())
    }

    pub fn as_message(&self) -> Option<Message<'m>> {
        match *self {
            Value::Message(m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v:?}"),
            Value::F64(v) => write!(f, "{v:?}"),
            Value::Bytes(b) => match core::str::from_utf8(b) {
                Ok(s) => write!(f, "{s:?}"),
                Err(_) => write!(f, "{b:?}"),
            },
            Value::Message(m) => fmt::Debug::fmt(m, f),
            Value::Unlinked(b) => write!(f, "<unlinked {} bytes>", b.len()),
        }
    }
}

fn scalar_bits(field_type: FieldType, value: &Value<'_>) -> Option<u64> {
    Some(match (field_type, *value) {
        (FieldType::Bool, Value::Bool(v)) => v as u64,
        (FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 | FieldType::Enum, Value::I32(v)) => {
            v as u32 as u64
        }
        (FieldType::UInt32 | FieldType::Fixed32, Value::U32(v)) => v as u64,
        (FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64, Value::I64(v)) => v as u64,
        (FieldType::UInt64 | FieldType::Fixed64, Value::U64(v)) => v,
        (FieldType::Float, Value::F32(v)) => v.to_bits() as u64,
        (FieldType::Double, Value::F64(v)) => v.to_bits(),
        _ => return None,
    })
}

fn scalar_value<'m>(field_type: FieldType, bits: u64) -> Value<'m> {
    match field_type {
        FieldType::Bool => Value::Bool(bits != 0),
        FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 | FieldType::Enum => Value::I32(bits as u32 as i32),
        FieldType::UInt32 | FieldType::Fixed32 => Value::U32(bits as u32),
        FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => Value::I64(bits as i64),
        FieldType::UInt64 | FieldType::Fixed64 => Value::U64(bits),
        FieldType::Float => Value::F32(f32::from_bits(bits as u32)),
        FieldType::Double => Value::F64(f64::from_bits(bits)),
        FieldType::String | FieldType::Bytes | FieldType::Message | FieldType::Group => Value::Bytes(&[]),
    }
}

fn type_error(field: &MiniTableField, value: &Value<'_>) -> Status {
    crate::status!(
        ErrorCode::InvalidDescriptor,
        "field {} of type {:?} cannot hold {:?}",
        field.number(),
        field.field_type(),
        value
    )
}

#[inline]
fn load_bits(obj: Object, offset: usize, width: usize) -> u64 {
    match width {
        1 => obj.get::<u8>(offset) as u64,
        4 => obj.get::<u32>(offset) as u64,
        _ => obj.get::<u64>(offset),
    }
}

fn slot_object(slot: &mut Slot) -> Object {
    Object::from_ptr(NonNull::from(slot).cast())
}

/// Handle to one message in an arena.
#[derive(Clone, Copy)]
pub struct Message<'m> {
    obj: Object,
    table: &'static MiniTable,
    arena: &'m Arena<'m>,
}

impl PartialEq for Message<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl<'m> Message<'m> {
    /// Allocates an empty message of type `table`.
    pub fn new(arena: &'m Arena<'m>, table: &'static MiniTable) -> Result<Self> {
        let obj = Object::new_in(arena, table)?;
        Ok(Message { obj, table, arena })
    }

    /// # Safety
    ///
    /// `obj` must be a message of type `table` allocated in `arena`, or in an
    /// arena fused with it.
    pub unsafe fn from_object(obj: Object, table: &'static MiniTable, arena: &'m Arena<'m>) -> Self {
        Message { obj, table, arena }
    }

    pub fn object(&self) -> Object {
        self.obj
    }

    pub fn table(&self) -> &'static MiniTable {
        self.table
    }

    pub fn arena(&self) -> &'m Arena<'m> {
        self.arena
    }

    /// Parses `bytes` into a new message.
    pub fn parse(
        arena: &'m Arena<'m>,
        table: &'static MiniTable,
        bytes: &[u8],
        registry: Option<&ExtensionRegistry>,
        options: &DecodeOptions,
    ) -> Result<Self> {
        let msg = Message::new(arena, table)?;
        msg.merge_bytes(bytes, registry, options)?;
        Ok(msg)
    }

    /// Parses `bytes` into this message, merging with what it holds.
    pub fn merge_bytes(&self, bytes: &[u8], registry: Option<&ExtensionRegistry>, options: &DecodeOptions) -> Result<()> {
        decoding::decode(bytes, self.obj, self.table, self.arena, registry, options).inspect_err(|e| {
            debug!(code = ?e.code(), len = bytes.len(), "decode failed: {e}");
        })
    }

    pub fn compute_size(&self, options: &EncodeOptions) -> Result<usize> {
        encoding::compute_size(self.obj, self.table, options)
    }

    pub fn serialize(&self, options: &EncodeOptions) -> Result<Vec<u8>> {
        encoding::encode_to_vec(self.obj, self.table, options).inspect_err(|e| {
            debug!(code = ?e.code(), "encode failed: {e}");
        })
    }

    /// Serializes into `out`, returning the byte count.
    pub fn serialize_into(&self, out: &mut [u8], options: &EncodeOptions) -> Result<usize> {
        encoding::encode(self.obj, self.table, options, out).inspect_err(|e| {
            debug!(code = ?e.code(), capacity = out.len(), "encode failed: {e}");
        })
    }

    /// Merges `src` into this message through the wire format. Extensions of
    /// `src` survive only when `registry` knows them.
    pub fn merge_from(&self, src: &Message<'_>, registry: Option<&ExtensionRegistry>) -> Result<()> {
        if !core::ptr::eq(self.table, src.table) {
            return Err(crate::status!(ErrorCode::InvalidDescriptor, "merge between different types"));
        }
        let bytes = src.serialize(&EncodeOptions::default())?;
        let options = DecodeOptions::default().allow_unlinked(true);
        self.merge_bytes(&bytes, registry, &options)
    }

    /// Resets every field, unknown byte and extension.
    pub fn clear(&self) {
        self.obj.clear(self.table);
    }

    /// Structural equality: both messages serialize to the same bytes in
    /// deterministic mode, unknown fields included.
    pub fn equal(&self, other: &Message<'_>) -> bool {
        if !core::ptr::eq(self.table, other.table) {
            return false;
        }
        let options = EncodeOptions::default().deterministic(true);
        match (self.serialize(&options), other.serialize(&options)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    fn field(&self, number: u32) -> Result<&'static MiniTableField> {
        self.table
            .find_field(number)
            .ok_or_else(|| crate::status!(ErrorCode::InvalidFieldNumber, "no field {number}"))
    }

    fn subs(&self) -> Subs {
        Subs::Table(self.table)
    }

    /// Whether field `number` is set. Repeated and map fields count as set
    /// when non-empty; fields without presence when non-zero.
    pub fn has(&self, number: u32) -> bool {
        let Ok(field) = self.field(number) else {
            return false;
        };
        has_value(self.obj, field)
    }

    /// Number of the active member of the oneof containing `number`.
    pub fn which_oneof(&self, number: u32) -> Option<u32> {
        let case = self.field(number).ok()?.oneof_case_offset()?;
        match self.obj.oneof_case(case) {
            0 => None,
            n => Some(n),
        }
    }

    /// Value of singular field `number`. Unset fields read as zero values;
    /// unset sub-messages read as `None`.
    pub fn get(&self, number: u32) -> Option<Value<'m>> {
        let field = self.field(number).ok()?;
        if field.is_repeated() || field.is_map() {
            return None;
        }
        if field.oneof_case_offset().is_some() && !self.obj.has_field(field) {
            return match field.rep() {
                FieldRep::Message => None,
                _ => Some(zero_value(field)),
            };
        }
        load_value(self.arena, self.obj, self.subs(), field)
    }

    pub fn set(&self, number: u32, value: Value<'_>) -> Result<()> {
        let field = self.field(number)?;
        if field.is_repeated() || field.is_map() {
            return Err(type_error(field, &value));
        }
        self.store_value(self.obj, self.subs(), field, value)
    }

    pub fn clear_field(&self, number: u32) -> Result<()> {
        let field = self.field(number)?;
        self.obj.clear_field(field);
        Ok(())
    }

    /// Sub-message `number`, created empty when unset. A raw payload is
    /// parsed first when the sub-table is linked.
    pub fn mutable_message(&self, number: u32) -> Result<Message<'m>> {
        let field = self.field(number)?;
        if !field.is_sub_message() || field.is_repeated() || field.is_map() {
            return Err(crate::status!(ErrorCode::InvalidDescriptor, "field {number} is not a singular message"));
        }
        let sub = self.table.sub_message(field).ok_or_else(|| {
            crate::status!(ErrorCode::UnlinkedSubMessage, "field {number}")
        })?;
        let slot = if self.obj.has_field(field) || field.oneof_case_offset().is_none() {
            self.obj.sub(field.offset())
        } else {
            TaggedPtr::NULL
        };
        let child = match (slot.object(), slot.raw_bytes()) {
            (Some(obj), _) => obj,
            (None, raw) => {
                let obj = Object::new_in(self.arena, sub)?;
                if let Some(raw) = raw {
                    self.parse_raw(raw, obj, sub)?;
                }
                self.obj.switch_oneof(field);
                self.obj.set(field.offset(), TaggedPtr::from_object(obj));
                obj
            }
        };
        self.obj.mark_present(field);
        Ok(Message {
            obj: child,
            table: sub,
            arena: self.arena,
        })
    }

    /// Points sub-message field `number` at `child`, fusing the arenas when
    /// they differ.
    ///
    /// Fails with [`ErrorCode::ArenaFuseRefused`] (kind
    /// [`ErrorKind::OutOfMemory`](crate::ErrorKind::OutOfMemory)) when either
    /// arena was built on a caller-supplied block or the two use different
    /// block allocators; the field is left untouched then.
    pub fn set_message(&self, number: u32, child: &Message<'_>) -> Result<()> {
        let field = self.field(number)?;
        if !field.is_sub_message() || field.is_repeated() || field.is_map() {
            return Err(crate::status!(ErrorCode::InvalidDescriptor, "field {number} is not a singular message"));
        }
        self.adopt(child, self.table.sub_message(field))?;
        self.obj.switch_oneof(field);
        self.obj.set(field.offset(), TaggedPtr::from_object(child.obj));
        self.obj.mark_present(field);
        Ok(())
    }

    fn adopt(&self, child: &Message<'_>, sub: Option<&'static MiniTable>) -> Result<()> {
        if !sub.is_some_and(|sub| core::ptr::eq(sub, child.table)) {
            return Err(crate::status!(ErrorCode::InvalidDescriptor, "sub-message type mismatch"));
        }
        if !self.arena.is_fused(child.arena) && !self.arena.fuse(child.arena) {
            return Err(crate::status!(ErrorCode::ArenaFuseRefused, "field arenas differ"));
        }
        Ok(())
    }

    fn parse_raw(&self, raw: &[u8], obj: Object, sub: &'static MiniTable) -> Result<()> {
        let options = DecodeOptions::default().allow_unlinked(true);
        decoding::decode(raw, obj, sub, self.arena, None, &options)
    }

    /// Parses retained raw payloads of sub-message field `number` now that
    /// its table is linked. Returns how many payloads were promoted.
    pub fn promote(&self, number: u32) -> Result<usize> {
        let field = self.field(number)?;
        let sub = self.table.sub_message(field).ok_or_else(|| {
            crate::status!(ErrorCode::UnlinkedSubMessage, "field {number}")
        })?;
        if field.is_repeated() {
            let Some(array) = self.obj.array(field.offset()) else {
                return Ok(0);
            };
            let mut promoted = 0;
            for slot in unsafe { &mut *array.as_ptr() }.as_mut_slice::<TaggedPtr>() {
                if let Some(raw) = slot.raw_bytes() {
                    let obj = Object::new_in(self.arena, sub)?;
                    self.parse_raw(raw, obj, sub)?;
                    *slot = TaggedPtr::from_object(obj);
                    promoted += 1;
                }
            }
            return Ok(promoted);
        }
        if !self.obj.has_field(field) && field.has_presence() {
            return Ok(0);
        }
        match self.obj.sub(field.offset()).raw_bytes() {
            Some(_) => self.mutable_message(number).map(|_| 1),
            None => Ok(0),
        }
    }

    fn store_value(&self, obj: Object, subs: Subs, field: &MiniTableField, value: Value<'_>) -> Result<()> {
        match field.rep() {
            FieldRep::Message => {
                let ptr = match value {
                    Value::Message(child) => {
                        self.adopt(&child, subs.message(field))?;
                        TaggedPtr::from_object(child.obj)
                    }
                    Value::Unlinked(raw) => TaggedPtr::new_raw(self.arena, raw)?,
                    _ => return Err(type_error(field, &value)),
                };
                obj.switch_oneof(field);
                obj.set(field.offset(), ptr);
            }
            FieldRep::String | FieldRep::Bytes => {
                let bytes = self.check_bytes(field, &value)?;
                obj.switch_oneof(field);
                if field.is_inlined() {
                    let s = InlineString::new(self.arena, bytes, false).ok_or(Status::out_of_memory())?;
                    obj.set(field.offset(), s);
                } else {
                    let view = StringView::copy_in(self.arena, bytes).ok_or(Status::out_of_memory())?;
                    obj.set(field.offset(), view);
                }
            }
            _ => {
                let bits = scalar_bits(field.field_type(), &value).ok_or_else(|| type_error(field, &value))?;
                obj.switch_oneof(field);
                decoding::write_scalar(obj, field.offset(), field.elem_size(), bits);
            }
        }
        obj.mark_present(field);
        Ok(())
    }

    fn check_bytes<'v>(&self, field: &MiniTableField, value: &Value<'v>) -> Result<&'v [u8]> {
        let Value::Bytes(bytes) = *value else {
            return Err(type_error(field, value));
        };
        if field.field_type() == FieldType::String && core::str::from_utf8(bytes).is_err() {
            return Err(crate::status!(ErrorCode::BadUtf8, "field {}", field.number()));
        }
        Ok(bytes)
    }

    // Converts `value` to the slot encoding used by arrays and maps.
    fn to_slot(&self, field_type: FieldType, sub: Option<&'static MiniTable>, value: &Value<'_>, copy: bool) -> Result<Slot> {
        let mut slot = [0u64; 2];
        let cell = slot_object(&mut slot);
        match (field_type, *value) {
            (FieldType::Message | FieldType::Group, Value::Message(child)) => {
                self.adopt(&child, sub)?;
                cell.set(0, TaggedPtr::from_object(child.obj));
            }
            (FieldType::Message | FieldType::Group, Value::Unlinked(raw)) => {
                cell.set(0, TaggedPtr::new_raw(self.arena, raw)?);
            }
            (FieldType::String | FieldType::Bytes, Value::Bytes(bytes)) => {
                if field_type == FieldType::String && core::str::from_utf8(bytes).is_err() {
                    return Err(ErrorCode::BadUtf8.into());
                }
                let view = if copy {
                    StringView::copy_in(self.arena, bytes).ok_or(Status::out_of_memory())?
                } else {
                    StringView::from_raw(bytes.as_ptr(), bytes.len())
                };
                cell.set(0, view);
            }
            (_, value) => {
                slot[0] = scalar_bits(field_type, &value).ok_or_else(|| {
                    crate::status!(ErrorCode::InvalidDescriptor, "{field_type:?} cannot hold {value:?}")
                })?;
            }
        }
        Ok(slot)
    }

    // Repeated fields.

    pub fn repeated_len(&self, number: u32) -> usize {
        let Ok(field) = self.field(number) else {
            return 0;
        };
        if !field.is_repeated() {
            return 0;
        }
        self.obj
            .array(field.offset())
            .map_or(0, |a| unsafe { a.as_ref() }.len())
    }

    pub fn get_repeated(&self, number: u32, i: usize) -> Option<Value<'m>> {
        let field = self.field(number).ok()?;
        if !field.is_repeated() {
            return None;
        }
        let array = unsafe { &*self.obj.array(field.offset())?.as_ptr() };
        element_value(self.arena, array, self.subs(), field, i)
    }

    pub fn repeated(&self, number: u32) -> Vec<Value<'m>> {
        (0..self.repeated_len(number))
            .filter_map(|i| self.get_repeated(number, i))
            .collect()
    }

    pub fn push(&self, number: u32, value: Value<'_>) -> Result<()> {
        let field = self.field(number)?;
        if !field.is_repeated() {
            return Err(type_error(field, &value));
        }
        self.push_value(self.obj, self.subs(), field, value)
    }

    fn push_value(&self, obj: Object, subs: Subs, field: &MiniTableField, value: Value<'_>) -> Result<()> {
        let slot = self.to_slot(field.field_type(), subs.message(field), &value, true)?;
        let array = obj.get_or_create_array(self.arena, field)?;
        let array = unsafe { &mut *array.as_ptr() };
        let pushed = match array.elem_size() {
            1 => array.push(self.arena, slot[0] as u8),
            4 => array.push(self.arena, slot[0] as u32),
            8 => array.push(self.arena, slot[0]),
            _ => array.push(self.arena, slot),
        };
        if !pushed {
            return Err(Status::out_of_memory());
        }
        Ok(())
    }

    /// Appends a new empty element to repeated message field `number`.
    pub fn add_message(&self, number: u32) -> Result<Message<'m>> {
        let field = self.field(number)?;
        let sub = self.table.sub_message(field);
        let (true, Some(sub)) = (field.is_repeated() && field.is_sub_message(), sub) else {
            return Err(crate::status!(ErrorCode::InvalidDescriptor, "field {number} is not a linked repeated message"));
        };
        let child = Message::new(self.arena, sub)?;
        self.push_value(self.obj, self.subs(), field, Value::Message(child))?;
        Ok(child)
    }

    /// Overwrites element `i` of repeated field `number`.
    pub fn set_repeated(&self, number: u32, i: usize, value: Value<'_>) -> Result<()> {
        let field = self.field(number)?;
        let array = match (field.is_repeated(), self.obj.array(field.offset())) {
            (true, Some(array)) => unsafe { &mut *array.as_ptr() },
            _ => return Err(type_error(field, &value)),
        };
        if i >= array.len() {
            return Err(crate::status!(ErrorCode::InvalidFieldNumber, "index {i} out of range"));
        }
        let slot = self.to_slot(field.field_type(), self.table.sub_message(field), &value, true)?;
        match array.elem_size() {
            1 => array.set(i, slot[0] as u8),
            4 => array.set(i, slot[0] as u32),
            8 => array.set(i, slot[0]),
            _ => array.set(i, slot),
        };
        Ok(())
    }

    pub fn truncate_repeated(&self, number: u32, len: usize) {
        if let Ok(field) = self.field(number) {
            if let (true, Some(array)) = (field.is_repeated(), self.obj.array(field.offset())) {
                unsafe { &mut *array.as_ptr() }.truncate(len);
            }
        }
    }

    // Maps.

    fn map_parts(&self, number: u32) -> Result<(&'static MiniTableField, &'static MiniTable)> {
        let field = self.field(number)?;
        if !field.is_map() {
            return Err(crate::status!(ErrorCode::InvalidDescriptor, "field {number} is not a map"));
        }
        let entry = self
            .table
            .sub_message(field)
            .ok_or(ErrorCode::UnlinkedSubMessage)?;
        Ok((field, entry))
    }

    fn map(&self, number: u32) -> Option<(&'m Map, &'static MiniTable)> {
        let (field, entry) = self.map_parts(number).ok()?;
        let map = self.obj.map(field.offset())?;
        Some((unsafe { &*map.as_ptr() }, entry))
    }

    pub fn map_len(&self, number: u32) -> usize {
        self.map(number).map_or(0, |(m, _)| m.len())
    }

    pub fn map_get(&self, number: u32, key: Value<'_>) -> Option<Value<'m>> {
        let (map, entry) = self.map(number)?;
        let key = self.to_slot(map.key_type(), None, &key, false).ok()?;
        let value = map.get(&key)?;
        Some(entry_value(self.arena, entry, value))
    }

    pub fn map_insert(&self, number: u32, key: Value<'_>, value: Value<'_>) -> Result<MapInsert> {
        let (field, entry) = self.map_parts(number)?;
        let [key_field, value_field] = entry.fields() else {
            return Err(ErrorCode::InvalidDescriptor.into());
        };
        let map = self.obj.get_or_create_map(self.arena, field, entry)?;
        let key = self.to_slot(key_field.field_type(), None, &key, true)?;
        let value = self.to_slot(value_field.field_type(), entry.sub_message(value_field), &value, true)?;
        unsafe { &mut *map.as_ptr() }.insert(self.arena, key, value)
    }

    pub fn map_delete(&self, number: u32, key: Value<'_>) -> bool {
        let Ok((field, _)) = self.map_parts(number) else {
            return false;
        };
        let Some(map) = self.obj.map(field.offset()) else {
            return false;
        };
        let map = unsafe { &mut *map.as_ptr() };
        match self.to_slot(map.key_type(), None, &key, false) {
            Ok(key) => map.delete(&key).is_some(),
            Err(_) => false,
        }
    }

    /// Starts an iteration over map field `number`; see [`Message::map_next`].
    pub fn map_begin(&self, number: u32) -> Option<MapIter> {
        self.map(number).map(|(m, _)| m.begin())
    }

    /// Next entry of the iteration `iter`.
    ///
    /// # Panics
    ///
    /// When the map was rehashed by an insertion after `iter` began.
    pub fn map_next(&self, number: u32, iter: &mut MapIter) -> Option<(Value<'m>, Value<'m>)> {
        let (map, entry) = self.map(number)?;
        let (key, value) = map.next(iter)?;
        Some((entry_key(entry, key), entry_value(self.arena, entry, value)))
    }

    pub fn map_entries(&self, number: u32) -> Vec<(Value<'m>, Value<'m>)> {
        let Some((map, entry)) = self.map(number) else {
            return Vec::new();
        };
        map.iter()
            .map(|(k, v)| (entry_key(entry, k), entry_value(self.arena, entry, v)))
            .collect()
    }

    // Unknown fields.

    pub fn unknown_fields(&self) -> &'m [u8] {
        self.obj.unknown()
    }

    /// Appends raw wire bytes to the unknown-field buffer.
    pub fn add_unknown(&self, bytes: &[u8]) -> Result<()> {
        self.obj.append_unknown(self.arena, bytes)
    }

    /// Drops unknown fields here and in every sub-message down to
    /// `max_depth` levels. Returns `false` when the tree is deeper.
    pub fn discard_unknown(&self, max_depth: u32) -> bool {
        walk(self.obj, self.table, max_depth, &mut |obj, _| {
            obj.clear_unknown();
            true
        })
    }

    // Extensions.

    fn check_extension(&self, ext: &MiniTableExtension) -> Result<()> {
        if !core::ptr::eq(ext.extendee(), self.table) {
            return Err(crate::status!(
                ErrorCode::InvalidDescriptor,
                "extension {} does not extend this type",
                ext.number()
            ));
        }
        Ok(())
    }

    fn extension_slot(&self, ext: &MiniTableExtension) -> Option<Object> {
        let i = self.obj.find_extension(ext.number())?;
        Some(self.obj.extensions()[i].value_object())
    }

    pub fn has_extension(&self, ext: &MiniTableExtension) -> bool {
        self.obj.find_extension(ext.number()).is_some()
    }

    pub fn get_extension(&self, ext: &'static MiniTableExtension) -> Option<Value<'m>> {
        let slot = self.extension_slot(ext)?;
        if ext.field().is_repeated() {
            return None;
        }
        load_value(self.arena, slot, Subs::Ext(ext), ext.field())
    }

    pub fn set_extension(&self, ext: &'static MiniTableExtension, value: Value<'_>) -> Result<()> {
        self.check_extension(ext)?;
        if ext.field().is_repeated() {
            return Err(type_error(ext.field(), &value));
        }
        let entry = self.obj.get_or_create_extension(self.arena, ext)?;
        self.store_value(ExtEntry::slot(entry), Subs::Ext(ext), ext.field(), value)
    }

    pub fn push_extension(&self, ext: &'static MiniTableExtension, value: Value<'_>) -> Result<()> {
        self.check_extension(ext)?;
        if !ext.field().is_repeated() {
            return Err(type_error(ext.field(), &value));
        }
        let entry = self.obj.get_or_create_extension(self.arena, ext)?;
        self.push_value(ExtEntry::slot(entry), Subs::Ext(ext), ext.field(), value)
    }

    pub fn extension_len(&self, ext: &'static MiniTableExtension) -> usize {
        match self.extension_slot(ext) {
            Some(slot) if ext.field().is_repeated() => slot.array(0).map_or(0, |a| unsafe { a.as_ref() }.len()),
            Some(_) => 1,
            None => 0,
        }
    }

    pub fn get_repeated_extension(&self, ext: &'static MiniTableExtension, i: usize) -> Option<Value<'m>> {
        let slot = self.extension_slot(ext)?;
        let array = unsafe { &*slot.array(0)?.as_ptr() };
        element_value(self.arena, array, Subs::Ext(ext), ext.field(), i)
    }

    pub fn clear_extension(&self, ext: &MiniTableExtension) -> bool {
        self.obj.remove_extension(ext.number())
    }

    /// Present extensions in ascending number order. Repeated extensions
    /// yield their first element.
    pub fn extensions(&self) -> impl Iterator<Item = (&'static MiniTableExtension, Value<'m>)> + 'm {
        let arena = self.arena;
        self.obj.extensions().iter().filter_map(move |entry| {
            let ext = entry.ext;
            let slot = entry.value_object();
            let value = if ext.field().is_repeated() {
                let array = unsafe { &*slot.array(0)?.as_ptr() };
                element_value(arena, array, Subs::Ext(ext), ext.field(), 0)
            } else {
                load_value(arena, slot, Subs::Ext(ext), ext.field())
            };
            value.map(|v| (ext, v))
        })
    }

    // Whole-tree operations.

    /// Whether every required field in the tree is set.
    pub fn is_initialized(&self) -> bool {
        walk(self.obj, self.table, DEFAULT_MAX_DEPTH, &mut |obj, table| {
            obj.required_bits(table.required_count()) & table.required_mask() == table.required_mask()
        })
    }

    /// Required fields of this message (not its sub-messages) that are unset,
    /// as a mask over required-field indices.
    pub fn missing_required(&self) -> u64 {
        let mask = self.table.required_mask();
        !self.obj.required_bits(self.table.required_count()) & mask
    }

    /// Copies the whole tree into `arena`.
    pub fn deep_clone<'a>(&self, arena: &'a Arena<'a>) -> Result<Message<'a>> {
        let obj = clone_object(arena, self.obj, self.table, DEFAULT_MAX_DEPTH)?;
        Ok(Message {
            obj,
            table: self.table,
            arena,
        })
    }
}

fn zero_value<'m>(field: &MiniTableField) -> Value<'m> {
    match field.rep() {
        FieldRep::String | FieldRep::Bytes => Value::Bytes(&[]),
        _ => scalar_value(field.field_type(), 0),
    }
}

fn has_value(obj: Object, field: &MiniTableField) -> bool {
    if field.is_map() {
        return obj.map(field.offset()).is_some_and(|m| !unsafe { m.as_ref() }.is_empty());
    }
    if field.is_repeated() {
        return obj.array(field.offset()).is_some_and(|a| !unsafe { a.as_ref() }.is_empty());
    }
    if field.has_presence() {
        return obj.has_field(field);
    }
    match field.rep() {
        FieldRep::Message => !obj.sub(field.offset()).is_null(),
        FieldRep::String | FieldRep::Bytes => !string_at(obj, field).is_empty(),
        _ => load_bits(obj, field.offset(), field.elem_size()) != 0,
    }
}

fn string_at<'m>(obj: Object, field: &MiniTableField) -> &'m [u8] {
    if field.is_inlined() {
        let s = unsafe { &*(obj.ptr_at(field.offset()) as *const InlineString) };
        unsafe { s.as_bytes() }
    } else {
        unsafe { obj.get::<StringView>(field.offset()).as_bytes() }
    }
}

fn message_value<'m>(arena: &'m Arena<'m>, slot: TaggedPtr, sub: Option<&'static MiniTable>) -> Option<Value<'m>> {
    if let Some(raw) = slot.raw_bytes() {
        return Some(Value::Unlinked(raw));
    }
    let obj = slot.object()?;
    let table = sub?;
    Some(Value::Message(Message { obj, table, arena }))
}

fn load_value<'m>(arena: &'m Arena<'m>, obj: Object, subs: Subs, field: &MiniTableField) -> Option<Value<'m>> {
    Some(match field.rep() {
        FieldRep::Message => return message_value(arena, obj.sub(field.offset()), subs.message(field)),
        FieldRep::String | FieldRep::Bytes => Value::Bytes(string_at(obj, field)),
        _ => scalar_value(field.field_type(), load_bits(obj, field.offset(), field.elem_size())),
    })
}

fn element_value<'m>(arena: &'m Arena<'m>, array: &Array, subs: Subs, field: &MiniTableField, i: usize) -> Option<Value<'m>> {
    if i >= array.len() {
        return None;
    }
    Some(match field.rep() {
        FieldRep::Message => return message_value(arena, array.get::<TaggedPtr>(i)?, subs.message(field)),
        FieldRep::String | FieldRep::Bytes => Value::Bytes(unsafe { array.get::<StringView>(i)?.as_bytes() }),
        _ => {
            let bits = match array.elem_size() {
                1 => array.get::<u8>(i)? as u64,
                4 => array.get::<u32>(i)? as u64,
                _ => array.get::<u64>(i)?,
            };
            scalar_value(field.field_type(), bits)
        }
    })
}

fn slot_value<'m>(arena: &'m Arena<'m>, field_type: FieldType, slot: Slot, sub: Option<&'static MiniTable>) -> Value<'m> {
    let mut slot = slot;
    let cell = slot_object(&mut slot);
    match field_type {
        FieldType::Message | FieldType::Group => {
            message_value(arena, cell.get::<TaggedPtr>(0), sub).unwrap_or(Value::Unlinked(&[]))
        }
        FieldType::String | FieldType::Bytes => Value::Bytes(unsafe { cell.get::<StringView>(0).as_bytes() }),
        _ => scalar_value(field_type, slot[0]),
    }
}

fn entry_key<'m>(entry: &'static MiniTable, key: Slot) -> Value<'m> {
    let field_type = entry.fields()[0].field_type();
    let mut slot = key;
    let cell = slot_object(&mut slot);
    match field_type {
        FieldType::String | FieldType::Bytes => Value::Bytes(unsafe { cell.get::<StringView>(0).as_bytes() }),
        _ => scalar_value(field_type, slot[0]),
    }
}

fn entry_value<'m>(arena: &'m Arena<'m>, entry: &'static MiniTable, value: Slot) -> Value<'m> {
    let field = &entry.fields()[1];
    slot_value(arena, field.field_type(), value, entry.sub_message(field))
}

/// Visits every message object in the tree below and including `obj`,
/// stopping at raw payloads. Returns `false` when `visit` does or when the tree
/// is deeper than `depth`.
fn walk(obj: Object, table: &'static MiniTable, depth: u32, visit: &mut impl FnMut(Object, &'static MiniTable) -> bool) -> bool {
    if depth == 0 || !visit(obj, table) {
        return false;
    }
    let subs = Subs::Table(table);
    for field in table.fields() {
        if !walk_field(obj, subs, field, depth, visit) {
            return false;
        }
    }
    for entry in obj.extensions() {
        if !walk_field(entry.value_object(), Subs::Ext(entry.ext), entry.ext.field(), depth, visit) {
            return false;
        }
    }
    true
}

fn walk_field(
    obj: Object,
    subs: Subs,
    field: &MiniTableField,
    depth: u32,
    visit: &mut impl FnMut(Object, &'static MiniTable) -> bool,
) -> bool {
    if field.is_map() {
        let (Some(map), Some(entry)) = (obj.map(field.offset()), subs.message(field)) else {
            return true;
        };
        let value_field = &entry.fields()[1];
        let Some(sub) = entry.sub_message(value_field).filter(|_| value_field.is_sub_message()) else {
            return true;
        };
        for (_, mut value) in unsafe { map.as_ref() }.iter() {
            if let Some(child) = slot_object(&mut value).get::<TaggedPtr>(0).object() {
                if !walk(child, sub, depth - 1, visit) {
                    return false;
                }
            }
        }
        return true;
    }
    if !field.is_sub_message() {
        return true;
    }
    let Some(sub) = subs.message(field) else {
        return true;
    };
    if field.is_repeated() {
        let Some(array) = obj.array(field.offset()) else {
            return true;
        };
        for slot in unsafe { array.as_ref() }.as_slice::<TaggedPtr>() {
            if let Some(child) = slot.object() {
                if !walk(child, sub, depth - 1, visit) {
                    return false;
                }
            }
        }
        return true;
    }
    if field.oneof_case_offset().is_some() && !obj.has_field(field) {
        return true;
    }
    match obj.sub(field.offset()).object() {
        Some(child) => walk(child, sub, depth - 1, visit),
        None => true,
    }
}

fn clone_object(arena: &Arena<'_>, src: Object, table: &'static MiniTable, depth: u32) -> Result<Object> {
    if depth == 0 {
        return Err(ErrorCode::MaxDepthExceeded.into());
    }
    let dst = Object::new_in(arena, table)?;
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.ptr_at(HEADER_SIZE),
            dst.ptr_at(HEADER_SIZE),
            table.size() - HEADER_SIZE,
        )
    };
    let subs = Subs::Table(table);
    for field in table.fields() {
        if field.oneof_case_offset().is_some() && !src.has_field(field) {
            continue;
        }
        clone_field(arena, src, dst, subs, field, depth)?;
    }
    let unknown = src.unknown();
    if !unknown.is_empty() {
        dst.append_unknown(arena, unknown)?;
    }
    for entry in src.extensions() {
        let copy = dst.get_or_create_extension(arena, entry.ext)?;
        let slot = ExtEntry::slot(copy);
        slot.set(0, entry.value);
        clone_field(arena, entry.value_object(), slot, Subs::Ext(entry.ext), entry.ext.field(), depth)?;
    }
    Ok(dst)
}

fn clone_tagged(arena: &Arena<'_>, slot: TaggedPtr, sub: Option<&'static MiniTable>, depth: u32) -> Result<TaggedPtr> {
    if let Some(raw) = slot.raw_bytes() {
        return TaggedPtr::new_raw(arena, raw);
    }
    match (slot.object(), sub) {
        (Some(obj), Some(sub)) => Ok(TaggedPtr::from_object(clone_object(arena, obj, sub, depth - 1)?)),
        (Some(_), None) => Err(ErrorCode::UnlinkedSubMessage.into()),
        (None, _) => Ok(TaggedPtr::NULL),
    }
}

fn clone_view(arena: &Arena<'_>, view: StringView) -> Result<StringView> {
    StringView::copy_in(arena, unsafe { view.as_bytes() }).ok_or(Status::out_of_memory())
}

// `dst` starts as a byte copy of `src`; this replaces every pointer in the
// field with a copy owned by `arena`.
fn clone_field(arena: &Arena<'_>, src: Object, dst: Object, subs: Subs, field: &MiniTableField, depth: u32) -> Result<()> {
    let offset = field.offset();
    if field.is_map() {
        let Some(map) = src.map(offset) else {
            return Ok(());
        };
        let map = unsafe { map.as_ref() };
        dst.set(offset, core::ptr::null_mut::<Map>());
        let entry = subs.message(field).ok_or(ErrorCode::UnlinkedSubMessage)?;
        let copy = unsafe { &mut *dst.get_or_create_map(arena, field, entry)?.as_ptr() };
        let value_field = &entry.fields()[1];
        let value_sub = entry.sub_message(value_field);
        for (mut key, mut value) in map.iter() {
            if matches!(map.key_type(), FieldType::String | FieldType::Bytes) {
                let cell = slot_object(&mut key);
                cell.set(0, clone_view(arena, cell.get(0))?);
            }
            let cell = slot_object(&mut value);
            match map.value_type() {
                FieldType::String | FieldType::Bytes => cell.set(0, clone_view(arena, cell.get(0))?),
                FieldType::Message | FieldType::Group => {
                    cell.set(0, clone_tagged(arena, cell.get(0), value_sub, depth)?)
                }
                _ => {}
            }
            copy.insert(arena, key, value)?;
        }
        return Ok(());
    }
    if field.is_repeated() {
        let Some(array) = src.array(offset) else {
            return Ok(());
        };
        let array = unsafe { array.as_ref() };
        dst.set(offset, core::ptr::null_mut::<Array>());
        let copy = unsafe { &mut *dst.get_or_create_array(arena, field)?.as_ptr() };
        match field.rep() {
            FieldRep::String | FieldRep::Bytes => {
                for &view in array.as_slice::<StringView>() {
                    if !copy.push(arena, clone_view(arena, view)?) {
                        return Err(Status::out_of_memory());
                    }
                }
            }
            FieldRep::Message => {
                let sub = subs.message(field);
                for &slot in array.as_slice::<TaggedPtr>() {
                    if !copy.push(arena, clone_tagged(arena, slot, sub, depth)?) {
                        return Err(Status::out_of_memory());
                    }
                }
            }
            _ => {
                if !copy.extend_from_bytes(arena, array.as_bytes()) {
                    return Err(Status::out_of_memory());
                }
            }
        }
        return Ok(());
    }
    match field.rep() {
        FieldRep::Message => dst.set(offset, clone_tagged(arena, src.sub(offset), subs.message(field), depth)?),
        FieldRep::String | FieldRep::Bytes if field.is_inlined() => {
            let s = InlineString::new(arena, string_at(src, field), false).ok_or(Status::out_of_memory())?;
            dst.set(offset, s);
        }
        FieldRep::String | FieldRep::Bytes => dst.set(offset, clone_view(arena, src.get(offset))?),
        _ => {}
    }
    Ok(())
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Key<'t>(&'t MiniTable, u32);
        impl fmt::Debug for Key<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0.field_name(self.1) {
                    Some(name) => f.write_str(name),
                    None => write!(f, "{}", self.1),
                }
            }
        }
        struct List<T>(Vec<T>);
        impl<T: fmt::Debug> fmt::Debug for List<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_list().entries(&self.0).finish()
            }
        }

        let mut out = f.debug_map();
        for field in self.table.fields() {
            let number = field.number();
            if !has_value(self.obj, field) {
                continue;
            }
            let key = Key(self.table, number);
            if field.is_map() {
                out.entry(&key, &List(self.map_entries(number)));
            } else if field.is_repeated() {
                out.entry(&key, &List(self.repeated(number)));
            } else if let Some(value) = self.get(number) {
                out.entry(&key, &value);
            }
        }
        for entry in self.obj.extensions() {
            let number = entry.ext.number();
            out.entry(&format_args!("[{number}]"), &self.extension_len(entry.ext));
        }
        let unknown = self.unknown_fields();
        if !unknown.is_empty() {
            out.entry(&"<unknown>", &unknown.len());
        }
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MiniTableBuilder;
    use crate::mini_descriptor::{MiniDescriptorEncoder, build_extension, build_mini_table, modifier};

    fn scalars() -> &'static MiniTable {
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(modifier::MSG_VALIDATE_UTF8);
        e.put_field(FieldType::Int32, 1, 0).unwrap();
        e.put_field(FieldType::String, 2, modifier::VALIDATE_UTF8).unwrap();
        e.put_field(FieldType::Bool, 3, 0).unwrap();
        e.put_field(FieldType::Double, 4, modifier::REPEATED).unwrap();
        MiniTableBuilder::from_mini_descriptor(e.as_str())
            .unwrap()
            .field_name(1, "a")
            .field_name(2, "b")
            .build()
            .unwrap()
    }

    #[test]
    fn typed_access() {
        let arena = Arena::new();
        let t = scalars();
        let m = Message::new(&arena, t).unwrap();
        assert!(!m.has(1));
        assert_eq!(m.get(1), Some(Value::I32(0)));
        m.set(1, Value::I32(150)).unwrap();
        m.set(2, Value::Bytes(b"hi")).unwrap();
        assert!(m.has(1));
        assert_eq!(m.get(1).and_then(|v| v.as_i32()), Some(150));
        assert_eq!(m.get(2).and_then(|v| v.as_str()), Some("hi"));
        assert!(m.set(1, Value::U64(1)).is_err());
        assert_eq!(
            m.set(2, Value::Bytes(&[0x80])).unwrap_err().code(),
            ErrorCode::BadUtf8
        );
        m.clear_field(1).unwrap();
        assert!(!m.has(1));
        assert!(m.get(99).is_none());
    }

    #[test]
    fn repeated_access() {
        let arena = Arena::new();
        let m = Message::new(&arena, scalars()).unwrap();
        m.push(4, Value::F64(1.5)).unwrap();
        m.push(4, Value::F64(-2.0)).unwrap();
        assert_eq!(m.repeated_len(4), 2);
        assert_eq!(m.get_repeated(4, 1), Some(Value::F64(-2.0)));
        m.set_repeated(4, 0, Value::F64(3.0)).unwrap();
        assert_eq!(m.repeated(4), vec![Value::F64(3.0), Value::F64(-2.0)]);
        m.truncate_repeated(4, 1);
        assert_eq!(m.repeated_len(4), 1);
        assert!(m.push(1, Value::I32(1)).is_err());
    }

    #[test]
    fn equality_clone_and_debug() {
        let arena = Arena::new();
        let m = Message::new(&arena, scalars()).unwrap();
        m.set(1, Value::I32(7)).unwrap();
        m.set(2, Value::Bytes(b"x")).unwrap();
        m.add_unknown(&[0x50, 0x01]).unwrap();

        let other = Arena::new();
        let copy = m.deep_clone(&other).unwrap();
        assert!(m.equal(&copy));
        assert_eq!(copy.unknown_fields(), &[0x50, 0x01]);
        copy.set(1, Value::I32(8)).unwrap();
        assert!(!m.equal(&copy));
        assert_eq!(m.get(1), Some(Value::I32(7)));

        let text = format!("{m:?}");
        assert!(text.contains("a: 7"), "{text}");
        assert!(text.contains("b: \"x\""), "{text}");
    }

    fn outer_inner() -> (&'static MiniTable, &'static MiniTable) {
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::Int32, 1, modifier::REQUIRED).unwrap();
        let inner = build_mini_table(e.as_str()).unwrap();
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::Message, 1, 0).unwrap();
        e.put_field(FieldType::Message, 2, modifier::REPEATED).unwrap();
        let outer = build_mini_table(e.as_str()).unwrap();
        (outer, inner)
    }

    #[test]
    fn sub_messages_and_promotion() {
        let (outer, inner) = outer_inner();
        let arena = Arena::new();
        let options = DecodeOptions::default().allow_unlinked(true);
        let m = Message::parse(&arena, outer, &[0x0a, 0x02, 0x08, 0x05], None, &options).unwrap();
        assert_eq!(m.get(1), Some(Value::Unlinked(&[0x08, 0x05])));
        assert!(m.mutable_message(1).is_err());

        outer.link_message(1, inner).unwrap();
        outer.link_message(2, inner).unwrap();
        assert_eq!(m.promote(1).unwrap(), 1);
        let child = m.get(1).and_then(|v| v.as_message()).unwrap();
        assert_eq!(child.get(1), Some(Value::I32(5)));
        assert!(m.is_initialized());

        let added = m.add_message(2).unwrap();
        assert!(!m.is_initialized());
        assert_eq!(added.missing_required(), 1);
        added.set(1, Value::I32(1)).unwrap();
        assert!(m.is_initialized());
        assert_eq!(m.serialize(&EncodeOptions::default()).unwrap(), [0x0a, 0x02, 0x08, 0x05, 0x12, 0x02, 0x08, 0x01]);
    }

    #[test]
    fn set_message_fuses_arenas() {
        let (outer, inner) = outer_inner();
        let _ = outer.link_message(1, inner);
        let _ = outer.link_message(2, inner);
        let a = Arena::new();
        let b = Arena::new();
        let parent = Message::new(&a, outer).unwrap();
        let child = Message::new(&b, inner).unwrap();
        child.set(1, Value::I32(9)).unwrap();
        parent.set_message(1, &child).unwrap();
        assert!(a.is_fused(&b));
        assert!(parent.set_message(1, &parent).is_err());

        let mut buffer = [0u8; 1024];
        let fixed = Arena::with_initial_block(&mut buffer);
        let pinned = Message::new(&fixed, inner).unwrap();
        let other = Message::new(&a, outer).unwrap();
        let err = other.set_message(1, &pinned).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ArenaFuseRefused);
        assert_eq!(err.kind(), crate::ErrorKind::OutOfMemory);
        assert!(!other.has(1));
        assert!(!a.is_fused(&fixed));
    }

    #[test]
    fn merge_concatenates_repeated() {
        let arena = Arena::new();
        let t = scalars();
        let a = Message::new(&arena, t).unwrap();
        a.set(1, Value::I32(1)).unwrap();
        a.push(4, Value::F64(1.0)).unwrap();
        let b = Message::new(&arena, t).unwrap();
        b.set(3, Value::Bool(true)).unwrap();
        b.push(4, Value::F64(2.0)).unwrap();
        b.merge_from(&a, None).unwrap();
        assert_eq!(b.get(1), Some(Value::I32(1)));
        assert_eq!(b.get(3), Some(Value::Bool(true)));
        assert_eq!(b.repeated(4), vec![Value::F64(2.0), Value::F64(1.0)]);
    }

    #[test]
    fn maps() {
        let mut e = MiniDescriptorEncoder::new();
        e.encode_map(FieldType::String, FieldType::Int64, 0, 0).unwrap();
        let entry = build_mini_table(e.as_str()).unwrap();
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::Message, 1, modifier::REPEATED).unwrap();
        let t = MiniTableBuilder::from_mini_descriptor(e.as_str())
            .unwrap()
            .map_entry(1, entry)
            .unwrap()
            .build()
            .unwrap();
        let arena = Arena::new();
        let m = Message::new(&arena, t).unwrap();
        assert_eq!(m.map_insert(1, Value::Bytes(b"k"), Value::I64(1)).unwrap(), MapInsert::Inserted);
        assert_eq!(m.map_insert(1, Value::Bytes(b"k"), Value::I64(2)).unwrap(), MapInsert::Replaced);
        assert_eq!(m.map_get(1, Value::Bytes(b"k")), Some(Value::I64(2)));
        assert_eq!(m.map_len(1), 1);
        let mut iter = m.map_begin(1).unwrap();
        assert_eq!(m.map_next(1, &mut iter), Some((Value::Bytes(b"k"), Value::I64(2))));
        assert_eq!(m.map_next(1, &mut iter), None);
        assert!(m.map_delete(1, Value::Bytes(b"k")));
        assert_eq!(m.map_len(1), 0);
    }

    #[test]
    fn extensions() {
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(modifier::MSG_EXTENDABLE);
        e.put_field(FieldType::Int32, 1, 0).unwrap();
        let t = build_mini_table(e.as_str()).unwrap();
        let mut e = MiniDescriptorEncoder::new();
        e.encode_extension(FieldType::UInt64, 100, 0).unwrap();
        let ext = build_extension(e.as_str(), t).unwrap().leak();
        let mut e = MiniDescriptorEncoder::new();
        e.encode_extension(FieldType::SInt32, 101, modifier::REPEATED).unwrap();
        let rep = build_extension(e.as_str(), t).unwrap().leak();

        let arena = Arena::new();
        let m = Message::new(&arena, t).unwrap();
        m.set_extension(ext, Value::U64(5)).unwrap();
        m.push_extension(rep, Value::I32(-1)).unwrap();
        m.push_extension(rep, Value::I32(2)).unwrap();
        assert!(m.has_extension(ext));
        assert_eq!(m.get_extension(ext), Some(Value::U64(5)));
        assert_eq!(m.extension_len(rep), 2);
        assert_eq!(m.get_repeated_extension(rep, 0), Some(Value::I32(-1)));
        let numbers: Vec<u32> = m.extensions().map(|(e, _)| e.number()).collect();
        assert_eq!(numbers, [100, 101]);

        let bytes = m.serialize(&EncodeOptions::default()).unwrap();
        let mut registry = ExtensionRegistry::new();
        registry.add_all(&[ext, rep]).unwrap();
        let back = Message::parse(&arena, t, &bytes, Some(&registry), &DecodeOptions::default()).unwrap();
        assert!(back.equal(&m));
        let plain = Message::parse(&arena, t, &bytes, None, &DecodeOptions::default()).unwrap();
        assert!(!plain.has_extension(ext));
        assert_eq!(plain.unknown_fields(), &bytes[..]);

        assert!(m.clear_extension(ext));
        assert!(!m.has_extension(ext));
    }
}
