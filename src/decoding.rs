//! Wire-format reader.
//!
//! Parsing runs one loop over the input with an explicit stack of frames, one
//! per open sub-message or group, so nesting depth is bounded by the stack
//! rather than by the native call stack. Each field is first offered to the
//! fast dispatch table of its message; anything the fast path declines goes
//! through the generic path below.

use core::ptr::NonNull;

use crate::arena::Arena;
use crate::base::{ExtEntry, Object, TaggedPtr};
use crate::containers::{InlineString, StringView};
use crate::map::Map;
use crate::options::DecodeOptions;
use crate::status::{ErrorCode, Result, Status};
use crate::tables::{
    ExtensionRegistry, FieldRep, FieldType, MiniTable, MiniTableEnum, MiniTableExtension,
    MiniTableField,
};
use crate::utils::Stack;
use crate::wire::{
    MAX_VARINT_LEN, ReadCursor, WireType, encode_varint, make_tag, zigzag_decode, zigzag_decode32,
};

/// Where sub-tables of a field come from: the message's own table, or the
/// extension the field belongs to.
#[derive(Clone, Copy)]
pub(crate) enum Subs {
    Table(&'static MiniTable),
    Ext(&'static MiniTableExtension),
}

impl Subs {
    #[inline]
    pub(crate) fn message(self, field: &MiniTableField) -> Option<&'static MiniTable> {
        match self {
            Subs::Table(table) => table.sub_message(field),
            Subs::Ext(ext) => ext.sub_message(),
        }
    }

    #[inline]
    fn enumeration(self, field: &MiniTableField) -> Option<&'static MiniTableEnum> {
        match self {
            Subs::Table(table) => table.sub_enum(field),
            Subs::Ext(ext) => ext.sub_enum(),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) enum FrameKind {
    Message,
    // `start` is where the entry's tag began; `invalid` marks an entry whose
    // value was an unknown closed-enum number.
    MapEntry {
        map: NonNull<Map>,
        start: usize,
        invalid: bool,
    },
}

#[derive(Clone, Copy)]
pub(crate) struct Frame {
    pub(crate) obj: Object,
    pub(crate) table: &'static MiniTable,
    // Limit of the enclosing range, restored when a length-delimited frame ends.
    saved_limit: usize,
    // Field number of an open group, zero for length-delimited frames.
    group: u32,
    kind: FrameKind,
}

impl Frame {
    fn root(obj: Object, table: &'static MiniTable, limit: usize) -> Self {
        Frame {
            obj,
            table,
            saved_limit: limit,
            group: 0,
            kind: FrameKind::Message,
        }
    }
}

pub(crate) struct Decoder<'d, 'x> {
    pub(crate) cur: ReadCursor<'d>,
    pub(crate) arena: &'x Arena<'x>,
    options: DecodeOptions,
    registry: Option<&'x ExtensionRegistry>,
    stack: Stack<Frame>,
    missing_required: bool,
}

/// Parses `buf` into `obj`, merging with whatever `obj` already holds.
pub(crate) fn decode(
    buf: &[u8],
    obj: Object,
    table: &'static MiniTable,
    arena: &Arena<'_>,
    registry: Option<&ExtensionRegistry>,
    options: &DecodeOptions,
) -> Result<()> {
    let mut decoder = Decoder::new(buf, arena, registry, *options, options.max_depth as usize);
    decoder.run(obj, table)?;
    if options.check_required && decoder.missing_required {
        return Err(ErrorCode::MissingRequired.into());
    }
    Ok(())
}

#[inline]
pub(crate) fn write_scalar(obj: Object, offset: usize, width: usize, value: u64) {
    match width {
        1 => obj.set(offset, value as u8),
        4 => obj.set(offset, value as u32),
        _ => obj.set(offset, value),
    }
}

#[inline]
pub(crate) fn push_scalar(array: &mut crate::containers::Array, arena: &Arena<'_>, value: u64) -> bool {
    match array.elem_size() {
        1 => array.push(arena, value as u8),
        4 => array.push(arena, value as u32),
        _ => array.push(arena, value),
    }
}

/// Reads one value of `field_type` as the bits stored in its slot.
#[inline]
pub(crate) fn read_scalar(cur: &mut ReadCursor<'_>, field_type: FieldType) -> core::result::Result<u64, ErrorCode> {
    Ok(match field_type {
        FieldType::Bool => (cur.read_varint()? != 0) as u64,
        FieldType::Int32 | FieldType::UInt32 | FieldType::Enum => cur.read_varint()? as u32 as u64,
        FieldType::Int64 | FieldType::UInt64 => cur.read_varint()?,
        FieldType::SInt32 => zigzag_decode32(cur.read_varint()? as u32) as u32 as u64,
        FieldType::SInt64 => zigzag_decode(cur.read_varint()?) as u64,
        FieldType::Fixed32 | FieldType::SFixed32 | FieldType::Float => cur.read_fixed32()? as u64,
        FieldType::Fixed64 | FieldType::SFixed64 | FieldType::Double => cur.read_fixed64()?,
        FieldType::String | FieldType::Bytes | FieldType::Message | FieldType::Group => {
            return Err(ErrorCode::InvalidWireType);
        }
    })
}

fn fixed_width(field_type: FieldType) -> Option<usize> {
    match field_type.wire_type() {
        WireType::I32 => Some(4),
        WireType::I64 => Some(8),
        _ => None,
    }
}

/// Whether a value arriving with `wire_type` can be stored in `field`.
fn wire_compatible(field: &MiniTableField, wire_type: WireType) -> bool {
    wire_type == field.wire_type()
        || (wire_type == WireType::Len && field.is_repeated() && field.field_type().is_packable())
}

impl<'d, 'x> Decoder<'d, 'x> {
    pub(crate) fn new(
        buf: &'d [u8],
        arena: &'x Arena<'_>,
        registry: Option<&'x ExtensionRegistry>,
        options: DecodeOptions,
        max_depth: usize,
    ) -> Self {
        Decoder {
            cur: ReadCursor::new(buf),
            arena,
            options,
            registry,
            stack: Stack::with_limit(max_depth),
            missing_required: false,
        }
    }

    #[inline]
    pub(crate) fn aliasing(&self) -> bool {
        self.options.aliasing()
    }

    fn run(&mut self, obj: Object, table: &'static MiniTable) -> Result<()> {
        let mut frame = Frame::root(obj, table, self.cur.limit());
        loop {
            if self.cur.at_limit() {
                if frame.group != 0 {
                    return Err(crate::status!(
                        ErrorCode::MismatchedEndGroup,
                        "group {} not closed",
                        frame.group
                    ));
                }
                if self.stack.is_empty() {
                    break;
                }
                frame = self.pop(frame)?;
                continue;
            }
            if crate::fast::dispatch(self, &mut frame)? {
                continue;
            }
            let tag_start = self.cur.pos();
            let tag = self.cur.read_tag()?;
            let number = tag >> 3;
            let wire_type = WireType::from_tag(tag).ok_or(ErrorCode::InvalidWireType)?;
            if number == 0 {
                return Err(ErrorCode::InvalidFieldNumber.into());
            }
            if wire_type == WireType::EndGroup {
                if frame.group != number || self.stack.is_empty() {
                    return Err(crate::status!(
                        ErrorCode::MismatchedEndGroup,
                        "unexpected end of group {number}"
                    ));
                }
                frame = self.pop(frame)?;
                continue;
            }
            let table = frame.table;
            match table.find_field(number) {
                Some(field) => {
                    let target = frame.obj;
                    self.field(&mut frame, target, Subs::Table(table), field, wire_type, tag_start)?;
                }
                None => self.extension_or_unknown(&mut frame, number, wire_type, tag_start)?,
            }
        }
        self.finish(frame, None)
    }

    /// Enters `child`, saving `frame` on the stack.
    #[inline]
    pub(crate) fn push(&mut self, frame: &mut Frame, child: Frame) -> Result<()> {
        self.stack.push(*frame).ok_or(ErrorCode::MaxDepthExceeded)?;
        *frame = child;
        Ok(())
    }

    /// Enters a length-delimited sub-message of `size` bytes at the cursor.
    #[inline]
    pub(crate) fn push_message(
        &mut self,
        frame: &mut Frame,
        obj: Object,
        table: &'static MiniTable,
        size: usize,
    ) -> Result<()> {
        let child = Frame {
            obj,
            table,
            saved_limit: self.cur.limit(),
            group: 0,
            kind: FrameKind::Message,
        };
        self.push(frame, child)?;
        self.cur.set_limit(self.cur.pos() + size);
        Ok(())
    }

    fn pop(&mut self, child: Frame) -> Result<Frame> {
        let parent = self.stack.pop().ok_or(ErrorCode::MismatchedEndGroup)?;
        if child.group == 0 {
            self.cur.set_limit(child.saved_limit);
        }
        self.finish(child, Some(&parent))?;
        Ok(parent)
    }

    // Work done when a frame's input is complete: the required check, or for
    // map entries the insertion into the map.
    fn finish(&mut self, frame: Frame, parent: Option<&Frame>) -> Result<()> {
        match frame.kind {
            FrameKind::Message => {
                let table = frame.table;
                if table.required_count() > 0
                    && frame.obj.required_bits(table.required_count()) & table.required_mask()
                        != table.required_mask()
                {
                    self.missing_required = true;
                }
                Ok(())
            }
            FrameKind::MapEntry { map, start, invalid } => {
                if invalid {
                    if let Some(parent) = parent {
                        let bytes = &self.cur.data()[start..self.cur.pos()];
                        self.add_unknown(parent, bytes)?;
                    }
                    return Ok(());
                }
                self.insert_entry(map, frame.obj, frame.table)
            }
        }
    }

    fn insert_entry(&mut self, map: NonNull<Map>, entry: Object, table: &'static MiniTable) -> Result<()> {
        let [_, value_field] = table.fields() else {
            return Err(ErrorCode::InvalidDescriptor.into());
        };
        if value_field.is_sub_message() && entry.sub(value_field.offset()).is_null() {
            if let Some(sub) = table.sub_message(value_field) {
                let value = Object::new_in(self.arena, sub)?;
                entry.set(value_field.offset(), TaggedPtr::from_object(value));
            }
        }
        let key = entry.get::<[u64; 2]>(crate::builder::MAP_KEY_OFFSET as usize);
        let value = entry.get::<[u64; 2]>(crate::builder::MAP_VALUE_OFFSET as usize);
        unsafe { (*map.as_ptr()).insert(self.arena, key, value) }?;
        Ok(())
    }

    fn add_unknown(&self, frame: &Frame, bytes: &[u8]) -> Result<()> {
        if self.options.discard_unknown || matches!(frame.kind, FrameKind::MapEntry { .. }) {
            return Ok(());
        }
        frame.obj.append_unknown(self.arena, bytes)
    }

    fn field(
        &mut self,
        frame: &mut Frame,
        target: Object,
        subs: Subs,
        field: &'static MiniTableField,
        wire_type: WireType,
        tag_start: usize,
    ) -> Result<()> {
        if field.is_map() {
            return self.map_entry(frame, target, subs, field, wire_type, tag_start);
        }
        match field.rep() {
            FieldRep::Message => self.sub_message(frame, target, subs, field, wire_type, tag_start),
            FieldRep::String | FieldRep::Bytes => self.string(frame, target, field, wire_type, tag_start),
            _ => self.scalar(frame, target, subs, field, wire_type, tag_start),
        }
    }

    fn scalar(
        &mut self,
        frame: &mut Frame,
        target: Object,
        subs: Subs,
        field: &'static MiniTableField,
        wire_type: WireType,
        tag_start: usize,
    ) -> Result<()> {
        let field_type = field.field_type();
        if wire_type == field.wire_type() {
            let value = read_scalar(&mut self.cur, field_type)?;
            return self.store_scalar(frame, target, subs, field, value);
        }
        if wire_type != WireType::Len || !field.is_repeated() {
            return self.unknown(frame, field.number(), wire_type, tag_start);
        }

        // Packed run.
        let size = self.cur.read_size()?;
        if let Some(width) = fixed_width(field_type) {
            if size % width != 0 {
                return Err(crate::status!(
                    ErrorCode::TruncatedInput,
                    "packed field {} has {size} bytes",
                    field.number()
                ));
            }
        }
        let end = self.cur.pos() + size;
        let saved = self.cur.limit();
        self.cur.set_limit(end);
        let array = target.get_or_create_array(self.arena, field)?;
        if let Some(width) = fixed_width(field_type) {
            let array = unsafe { &mut *array.as_ptr() };
            if !array.reserve(self.arena, array.len() + size / width) {
                return Err(Status::out_of_memory());
            }
        }
        while !self.cur.at_limit() {
            let value = read_scalar(&mut self.cur, field_type)?;
            self.store_scalar(frame, target, subs, field, value)?;
        }
        self.cur.set_limit(saved);
        Ok(())
    }

    fn store_scalar(
        &mut self,
        frame: &mut Frame,
        target: Object,
        subs: Subs,
        field: &MiniTableField,
        value: u64,
    ) -> Result<()> {
        if field.is_closed_enum() {
            if let Some(validator) = subs.enumeration(field) {
                if !validator.check_value(value as u32 as i32) {
                    return self.enum_to_unknown(frame, field.number(), value);
                }
            }
        }
        if field.is_repeated() {
            let array = target.get_or_create_array(self.arena, field)?;
            if !push_scalar(unsafe { &mut *array.as_ptr() }, self.arena, value) {
                return Err(Status::out_of_memory());
            }
        } else {
            target.switch_oneof(field);
            write_scalar(target, field.offset(), field.elem_size(), value);
            target.mark_present(field);
        }
        Ok(())
    }

    // Unrecognized closed-enum values are kept as unknown varint fields of the
    // message being parsed.
    fn enum_to_unknown(&mut self, frame: &mut Frame, number: u32, value: u64) -> Result<()> {
        if let FrameKind::MapEntry { invalid, .. } = &mut frame.kind {
            *invalid = true;
            return Ok(());
        }
        let mut buf = [0u8; 2 * MAX_VARINT_LEN];
        let mut varint = [0u8; MAX_VARINT_LEN];
        let n = encode_varint(make_tag(number, WireType::Varint) as u64, &mut varint);
        buf[..n].copy_from_slice(&varint[..n]);
        let m = encode_varint(value as u32 as u64, &mut varint);
        buf[n..n + m].copy_from_slice(&varint[..m]);
        self.add_unknown(frame, &buf[..n + m])
    }

    #[inline]
    pub(crate) fn make_view(&self, bytes: &[u8]) -> Result<StringView> {
        if self.aliasing() {
            return Ok(StringView::from_raw(bytes.as_ptr(), bytes.len()));
        }
        StringView::copy_in(self.arena, bytes).ok_or(Status::out_of_memory())
    }

    fn string(
        &mut self,
        frame: &mut Frame,
        target: Object,
        field: &'static MiniTableField,
        wire_type: WireType,
        tag_start: usize,
    ) -> Result<()> {
        if wire_type != WireType::Len {
            return self.unknown(frame, field.number(), wire_type, tag_start);
        }
        let size = self.cur.read_size()?;
        let bytes = self.cur.read_bytes(size)?;
        if field.field_type() == FieldType::String && core::str::from_utf8(bytes).is_err() {
            return Err(crate::status!(ErrorCode::BadUtf8, "field {}", field.number()));
        }
        if field.is_repeated() {
            let view = self.make_view(bytes)?;
            let array = target.get_or_create_array(self.arena, field)?;
            if !unsafe { &mut *array.as_ptr() }.push(self.arena, view) {
                return Err(Status::out_of_memory());
            }
            return Ok(());
        }
        target.switch_oneof(field);
        if field.is_inlined() {
            let s = InlineString::new(self.arena, bytes, self.aliasing()).ok_or(Status::out_of_memory())?;
            target.set(field.offset(), s);
        } else {
            let view = self.make_view(bytes)?;
            target.set(field.offset(), view);
        }
        target.mark_present(field);
        Ok(())
    }

    fn sub_message(
        &mut self,
        frame: &mut Frame,
        target: Object,
        subs: Subs,
        field: &'static MiniTableField,
        wire_type: WireType,
        tag_start: usize,
    ) -> Result<()> {
        if wire_type != field.wire_type() {
            return self.unknown(frame, field.number(), wire_type, tag_start);
        }
        let group = field.is_group();
        let sub = subs.message(field);
        if sub.is_none() && !self.options.allow_unlinked {
            return Err(crate::status!(
                ErrorCode::UnlinkedSubMessage,
                "field {}",
                field.number()
            ));
        }
        match sub {
            Some(sub) if !field.is_lazy() => {
                let child = self.child_object(target, field, sub)?;
                if group {
                    let child_frame = Frame {
                        obj: child,
                        table: sub,
                        saved_limit: self.cur.limit(),
                        group: field.number(),
                        kind: FrameKind::Message,
                    };
                    self.push(frame, child_frame)
                } else {
                    let size = self.cur.read_size()?;
                    self.push_message(frame, child, sub, size)
                }
            }
            _ => {
                let payload = if group {
                    self.group_body(field.number())?
                } else {
                    let size = self.cur.read_size()?;
                    self.cur.read_bytes(size)?
                };
                self.store_raw(target, subs, field, payload)
            }
        }
    }

    /// The message a sub-message field parses into: a new array element, the
    /// existing value (merge), or a fresh object.
    pub(crate) fn child_object(
        &mut self,
        target: Object,
        field: &MiniTableField,
        sub: &'static MiniTable,
    ) -> Result<Object> {
        if field.is_repeated() {
            let obj = Object::new_in(self.arena, sub)?;
            let array = target.get_or_create_array(self.arena, field)?;
            if !unsafe { &mut *array.as_ptr() }.push(self.arena, TaggedPtr::from_object(obj)) {
                return Err(Status::out_of_memory());
            }
            return Ok(obj);
        }
        target.switch_oneof(field);
        let slot = target.sub(field.offset());
        target.mark_present(field);
        if let Some(obj) = slot.object() {
            return Ok(obj);
        }
        let obj = Object::new_in(self.arena, sub)?;
        if let Some(raw) = slot.raw_bytes() {
            self.nested(raw, obj, sub)?;
        }
        target.set(field.offset(), TaggedPtr::from_object(obj));
        Ok(obj)
    }

    fn store_raw(&mut self, target: Object, subs: Subs, field: &MiniTableField, payload: &[u8]) -> Result<()> {
        if field.is_repeated() {
            let raw = TaggedPtr::new_raw(self.arena, payload)?;
            let array = target.get_or_create_array(self.arena, field)?;
            if !unsafe { &mut *array.as_ptr() }.push(self.arena, raw) {
                return Err(Status::out_of_memory());
            }
            return Ok(());
        }
        target.switch_oneof(field);
        let slot = target.sub(field.offset());
        target.mark_present(field);
        if let Some(holder) = slot.raw_holder() {
            return holder.append_unknown(self.arena, payload);
        }
        if let Some(obj) = slot.object() {
            // Already materialized; a linked table parses the new bytes in.
            return match subs.message(field) {
                Some(sub) => self.nested(payload, obj, sub),
                None => obj.append_unknown(self.arena, payload),
            };
        }
        target.set(field.offset(), TaggedPtr::new_raw(self.arena, payload)?);
        Ok(())
    }

    /// Parses `buf` into `obj` with the depth left below the current frame.
    /// Group payloads are bodies without the enclosing group tags, so they
    /// parse the same way.
    pub(crate) fn nested(&mut self, buf: &[u8], obj: Object, table: &'static MiniTable) -> Result<()> {
        let used = self.stack.len() + 1;
        if used > self.stack.limit() {
            return Err(ErrorCode::MaxDepthExceeded.into());
        }
        let registry = self.registry;
        let mut nested = Decoder::new(buf, self.arena, registry, self.options, self.stack.limit() - used);
        nested.run(obj, table)?;
        self.missing_required |= nested.missing_required;
        Ok(())
    }

    fn map_entry(
        &mut self,
        frame: &mut Frame,
        target: Object,
        subs: Subs,
        field: &'static MiniTableField,
        wire_type: WireType,
        tag_start: usize,
    ) -> Result<()> {
        if wire_type != WireType::Len {
            return self.unknown(frame, field.number(), wire_type, tag_start);
        }
        let entry_table = subs.message(field).ok_or(ErrorCode::UnlinkedSubMessage)?;
        let map = target.get_or_create_map(self.arena, field, entry_table)?;
        let size = self.cur.read_size()?;
        let entry = Object::new_in(self.arena, entry_table)?;
        let child = Frame {
            obj: entry,
            table: entry_table,
            saved_limit: self.cur.limit(),
            group: 0,
            kind: FrameKind::MapEntry {
                map,
                start: tag_start,
                invalid: false,
            },
        };
        self.push(frame, child)?;
        self.cur.set_limit(self.cur.pos() + size);
        Ok(())
    }

    fn extension_or_unknown(
        &mut self,
        frame: &mut Frame,
        number: u32,
        wire_type: WireType,
        tag_start: usize,
    ) -> Result<()> {
        let table = frame.table;
        if table.is_message_set() && number == 1 && wire_type == WireType::StartGroup {
            return self.message_set_item(frame, tag_start);
        }
        if table.is_extendable() {
            if let Some(ext) = self.registry.and_then(|r| r.lookup(table, number)) {
                if wire_compatible(&ext.field, wire_type) {
                    let entry = frame.obj.get_or_create_extension(self.arena, ext)?;
                    let slot = ExtEntry::slot(entry);
                    return self.field(frame, slot, Subs::Ext(ext), &ext.field, wire_type, tag_start);
                }
            }
        }
        self.unknown(frame, number, wire_type, tag_start)
    }

    // Message-set item: a group holding `type_id` (2) and `message` (3), in
    // either order. The first occurrence of each wins.
    fn message_set_item(&mut self, frame: &mut Frame, tag_start: usize) -> Result<()> {
        let mut type_id: Option<u32> = None;
        let mut payload: Option<&'d [u8]> = None;
        loop {
            if self.cur.at_limit() {
                return Err(crate::status!(ErrorCode::MismatchedEndGroup, "message set item not closed"));
            }
            let tag = self.cur.read_tag()?;
            let number = tag >> 3;
            let wire_type = WireType::from_tag(tag).ok_or(ErrorCode::InvalidWireType)?;
            match (number, wire_type) {
                (0, _) => return Err(ErrorCode::InvalidFieldNumber.into()),
                (1, WireType::EndGroup) => break,
                (_, WireType::EndGroup) => return Err(ErrorCode::MismatchedEndGroup.into()),
                (2, WireType::Varint) => {
                    let id = self.cur.read_varint()? as u32;
                    type_id.get_or_insert(id);
                }
                (3, WireType::Len) => {
                    let size = self.cur.read_size()?;
                    let bytes = self.cur.read_bytes(size)?;
                    payload.get_or_insert(bytes);
                }
                (n, WireType::StartGroup) => {
                    self.skip_group(n)?;
                }
                (_, other) => self.skip_value(other)?,
            }
        }
        let (Some(type_id), Some(payload)) = (type_id, payload) else {
            return Ok(());
        };
        let ext = self
            .registry
            .and_then(|r| r.lookup(frame.table, type_id))
            .filter(|ext| ext.field.is_sub_message() && !ext.field.is_repeated());
        let Some(ext) = ext else {
            let bytes = &self.cur.data()[tag_start..self.cur.pos()];
            return self.add_unknown(frame, bytes);
        };
        let sub = ext.sub_message();
        if sub.is_none() && !self.options.allow_unlinked {
            return Err(crate::status!(ErrorCode::UnlinkedSubMessage, "extension {type_id}"));
        }
        let entry = frame.obj.get_or_create_extension(self.arena, ext)?;
        let slot = ExtEntry::slot(entry);
        match sub {
            Some(sub) if !ext.field.is_lazy() => {
                let child = self.child_object(slot, &ext.field, sub)?;
                self.nested(payload, child, sub)
            }
            _ => self.store_raw(slot, Subs::Ext(ext), &ext.field, payload),
        }
    }

    fn skip_value(&mut self, wire_type: WireType) -> Result<()> {
        match wire_type {
            WireType::Varint => {
                self.cur.read_varint()?;
            }
            WireType::I64 => self.cur.skip(8)?,
            WireType::I32 => self.cur.skip(4)?,
            WireType::Len => {
                let size = self.cur.read_size()?;
                self.cur.skip(size)?;
            }
            WireType::StartGroup | WireType::EndGroup => return Err(ErrorCode::InvalidWireType.into()),
        }
        Ok(())
    }

    /// Skips to the end of group `number`, whose start tag was just read.
    /// Returns the position of the matching end tag.
    fn skip_group(&mut self, number: u32) -> Result<usize> {
        let mut open = vec![number];
        loop {
            if self.cur.at_limit() {
                return Err(crate::status!(ErrorCode::MismatchedEndGroup, "group {number} not closed"));
            }
            let tag_start = self.cur.pos();
            let tag = self.cur.read_tag()?;
            let n = tag >> 3;
            let wire_type = WireType::from_tag(tag).ok_or(ErrorCode::InvalidWireType)?;
            if n == 0 {
                return Err(ErrorCode::InvalidFieldNumber.into());
            }
            match wire_type {
                WireType::EndGroup => {
                    if open.last() != Some(&n) {
                        return Err(ErrorCode::MismatchedEndGroup.into());
                    }
                    open.pop();
                    if open.is_empty() {
                        return Ok(tag_start);
                    }
                }
                WireType::StartGroup => {
                    if self.stack.len() + open.len() >= self.stack.limit() {
                        return Err(ErrorCode::MaxDepthExceeded.into());
                    }
                    open.push(n);
                }
                other => self.skip_value(other)?,
            }
        }
    }

    /// Body of group `number` between its tags; the cursor ends past the end
    /// tag.
    fn group_body(&mut self, number: u32) -> Result<&'d [u8]> {
        let start = self.cur.pos();
        let end = self.skip_group(number)?;
        Ok(&self.cur.data()[start..end])
    }

    fn unknown(&mut self, frame: &mut Frame, number: u32, wire_type: WireType, tag_start: usize) -> Result<()> {
        if wire_type == WireType::StartGroup {
            self.skip_group(number)?;
        } else {
            self.skip_value(wire_type)?;
        }
        let bytes = &self.cur.data()[tag_start..self.cur.pos()];
        self.add_unknown(frame, bytes)
    }
}
