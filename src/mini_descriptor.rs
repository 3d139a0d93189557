//! The mini-descriptor format: a compact printable encoding of a message,
//! enum or extension layout, from which mini-tables are built at runtime.
//!
//! A descriptor starts with a version character (`$` message, `%` map entry,
//! `&` message set, `#` extension, `!` enum). Message bodies hold one
//! character per field (type and cardinality), base92 varints for modifiers
//! and gaps in the field numbering, and an optional trailing run of oneofs.

use tracing::debug;

use crate::builder::{FieldSpec, MiniTableBuilder, Presence, TableKind};
use crate::status::{ErrorCode, Result, Status};
use crate::tables::{
    FLAG_ALTERNATE, FLAG_EXTENSION, FieldType, MiniTable, MiniTableEnum, MiniTableExtension,
    MiniTableSub,
};
use crate::wire::MAX_FIELD_NUMBER;

/// Modifiers accepted by [`MiniDescriptorEncoder`].
pub mod modifier {
    pub const REPEATED: u32 = 1;
    pub const PACKED: u32 = 2;
    pub const CLOSED_ENUM: u32 = 4;
    pub const PROTO3_SINGULAR: u32 = 8;
    pub const REQUIRED: u32 = 16;
    pub const VALIDATE_UTF8: u32 = 32;

    pub const MSG_VALIDATE_UTF8: u32 = 1;
    pub const MSG_DEFAULT_PACKED: u32 = 2;
    pub const MSG_EXTENDABLE: u32 = 4;
}

const VERSION_MESSAGE: u8 = b'$';
const VERSION_MAP: u8 = b'%';
const VERSION_MESSAGE_SET: u8 = b'&';
const VERSION_EXTENSION: u8 = b'#';
const VERSION_ENUM: u8 = b'!';

const MAX_FIELD: u8 = b'I';
const MIN_MODIFIER: u8 = b'L';
const MAX_MODIFIER: u8 = b'[';
const END: u8 = b'^';
const MIN_SKIP: u8 = b'_';
const MAX_SKIP: u8 = b'~';
const ONEOF_SEPARATOR: u8 = b'~';
const FIELD_SEPARATOR: u8 = b'|';
const MIN_ONEOF_FIELD: u8 = b' ';
const MAX_ONEOF_FIELD: u8 = b'b';
const MAX_ENUM_MASK: u8 = b'A';

// Field modifiers as they appear on the wire.
const FLIP_PACKED: u32 = 1;
const IS_REQUIRED: u32 = 2;
const IS_PROTO3_SINGULAR: u32 = 4;
const FLIP_VALIDATE_UTF8: u32 = 8;

const REPEATED_BASE: u8 = 20;
const OPEN_ENUM: u8 = 12;
const CLOSED_ENUM: u8 = 18;

const BASE92: &[u8; 92] =
    b" !#$%&()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[]^_`abcdefghijklmnopqrstuvwxyz{|}~";

const FROM_BASE92: [i8; 128] = {
    let mut table = [-1i8; 128];
    let mut i = 0;
    while i < BASE92.len() {
        table[BASE92[i] as usize] = i as i8;
        i += 1;
    }
    table
};

#[inline]
pub fn to_base92(value: u8) -> u8 {
    BASE92[value as usize]
}

#[inline]
pub fn from_base92(ch: u8) -> Option<u8> {
    match FROM_BASE92.get(ch as usize) {
        Some(&v) if v >= 0 => Some(v as u8),
        _ => None,
    }
}

fn log2_ceil(x: u32) -> u32 {
    if x <= 1 { 0 } else { 32 - (x - 1).leading_zeros() }
}

const ENCODED_TO_TYPE: [FieldType; 19] = [
    FieldType::Double,
    FieldType::Float,
    FieldType::Fixed32,
    FieldType::Fixed64,
    FieldType::SFixed32,
    FieldType::SFixed64,
    FieldType::Int32,
    FieldType::UInt32,
    FieldType::SInt32,
    FieldType::Int64,
    FieldType::UInt64,
    FieldType::SInt64,
    FieldType::Enum,
    FieldType::Bool,
    FieldType::Bytes,
    FieldType::String,
    FieldType::Group,
    FieldType::Message,
    FieldType::Enum,
];

fn type_to_encoded(field_type: FieldType, closed_enum: bool) -> u8 {
    match field_type {
        FieldType::Double => 0,
        FieldType::Float => 1,
        FieldType::Fixed32 => 2,
        FieldType::Fixed64 => 3,
        FieldType::SFixed32 => 4,
        FieldType::SFixed64 => 5,
        FieldType::Int32 => 6,
        FieldType::UInt32 => 7,
        FieldType::SInt32 => 8,
        FieldType::Int64 => 9,
        FieldType::UInt64 => 10,
        FieldType::SInt64 => 11,
        FieldType::Enum if closed_enum => CLOSED_ENUM,
        FieldType::Enum => OPEN_ENUM,
        FieldType::Bool => 13,
        FieldType::Bytes => 14,
        FieldType::String => 15,
        FieldType::Group => 16,
        FieldType::Message => 17,
    }
}

macro_rules! invalid {
    ($($arg:tt)+) => {
        Status::with_message(ErrorCode::InvalidDescriptor, format_args!($($arg)+))
    };
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OneofState {
    NotStarted,
    Started,
    EmittedField,
}

/// Writes mini-descriptors. Calls must follow the shape of the descriptor
/// being produced: fields in ascending number order, oneofs after all fields,
/// enum values ascending.
pub struct MiniDescriptorEncoder {
    out: String,
    msg_modifiers: u32,
    last_field: u32,
    oneof: OneofState,
    enum_mask: u64,
    enum_base: u64,
    enum_prev: Option<u32>,
}

impl Default for MiniDescriptorEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MiniDescriptorEncoder {
    pub fn new() -> Self {
        MiniDescriptorEncoder {
            out: String::new(),
            msg_modifiers: 0,
            last_field: 0,
            oneof: OneofState::NotStarted,
            enum_mask: 0,
            enum_base: 0,
            enum_prev: None,
        }
    }

    fn put(&mut self, value: u8) {
        self.out.push(to_base92(value) as char);
    }

    fn put_raw(&mut self, ch: u8) {
        self.out.push(ch as char);
    }

    fn put_varint(&mut self, mut value: u32, min: u8, max: u8) {
        let lo = from_base92(min).unwrap_or(0);
        let hi = from_base92(max).unwrap_or(0);
        let shift = log2_ceil((hi - lo) as u32 + 1);
        let mask = (1u32 << shift) - 1;
        loop {
            self.put((value & mask) as u8 + lo);
            value >>= shift;
            if value == 0 {
                break;
            }
        }
    }

    fn put_modifier(&mut self, modifier: u32) {
        if modifier != 0 {
            self.put_varint(modifier, MIN_MODIFIER, MAX_MODIFIER);
        }
    }

    fn reset(&mut self, msg_modifiers: u32) {
        self.msg_modifiers = msg_modifiers;
        self.last_field = 0;
        self.oneof = OneofState::NotStarted;
    }

    pub fn start_message(&mut self, msg_modifiers: u32) {
        self.reset(msg_modifiers);
        self.put_raw(VERSION_MESSAGE);
        self.put_modifier(msg_modifiers);
    }

    pub fn put_field(&mut self, field_type: FieldType, number: u32, modifiers: u32) -> Result<()> {
        if number == 0 || number <= self.last_field || number > MAX_FIELD_NUMBER {
            return Err(invalid!("field {number} out of order"));
        }
        if self.oneof != OneofState::NotStarted {
            return Err(invalid!("field {number} after oneofs"));
        }
        if self.last_field + 1 != number {
            self.put_varint(number - self.last_field, MIN_SKIP, MAX_SKIP);
        }
        self.last_field = number;

        let repeated = modifiers & modifier::REPEATED != 0;
        let mut encoded = type_to_encoded(field_type, modifiers & modifier::CLOSED_ENUM != 0);
        if repeated {
            encoded += REPEATED_BASE;
        }
        self.put(encoded);

        let mut encoded_modifiers = 0;
        if repeated && field_type.is_packable() {
            let packed = modifiers & modifier::PACKED != 0;
            let default_packed = self.msg_modifiers & modifier::MSG_DEFAULT_PACKED != 0;
            if packed != default_packed {
                encoded_modifiers |= FLIP_PACKED;
            }
        }
        if field_type == FieldType::String {
            let field_validates = modifiers & modifier::VALIDATE_UTF8 != 0;
            let message_validates = self.msg_modifiers & modifier::MSG_VALIDATE_UTF8 != 0;
            if field_validates != message_validates {
                if message_validates {
                    return Err(invalid!("field {number} cannot opt out of UTF-8 validation"));
                }
                encoded_modifiers |= FLIP_VALIDATE_UTF8;
            }
        }
        if modifiers & modifier::PROTO3_SINGULAR != 0 {
            encoded_modifiers |= IS_PROTO3_SINGULAR;
        }
        if modifiers & modifier::REQUIRED != 0 {
            encoded_modifiers |= IS_REQUIRED;
        }
        self.put_modifier(encoded_modifiers);
        Ok(())
    }

    pub fn start_oneof(&mut self) {
        if self.oneof == OneofState::NotStarted {
            self.put_raw(END);
        } else {
            self.put_raw(ONEOF_SEPARATOR);
        }
        self.oneof = OneofState::Started;
    }

    pub fn put_oneof_field(&mut self, number: u32) -> Result<()> {
        match self.oneof {
            OneofState::NotStarted => return Err(invalid!("oneof field {number} outside a oneof")),
            OneofState::EmittedField => self.put_raw(FIELD_SEPARATOR),
            OneofState::Started => {}
        }
        self.put_varint(number, MIN_ONEOF_FIELD, MAX_ONEOF_FIELD);
        self.oneof = OneofState::EmittedField;
        Ok(())
    }

    pub fn start_enum(&mut self) {
        self.put_raw(VERSION_ENUM);
        self.enum_mask = 0;
        self.enum_base = 0;
        self.enum_prev = None;
    }

    fn flush_enum_mask(&mut self) {
        self.put(self.enum_mask as u8);
        self.enum_mask = 0;
        self.enum_base += 5;
    }

    /// Adds one enum value. Values must ascend when read as unsigned.
    pub fn put_enum_value(&mut self, value: u32) -> Result<()> {
        if self.enum_prev.is_some_and(|prev| value <= prev) {
            return Err(invalid!("enum value {value} out of order"));
        }
        self.enum_prev = Some(value);
        let mut delta = value as u64 - self.enum_base;
        if delta >= 5 && self.enum_mask != 0 {
            self.flush_enum_mask();
            delta -= 5;
        }
        if delta >= 5 {
            self.put_varint(delta as u32, MIN_SKIP, MAX_SKIP);
            self.enum_base += delta;
            delta = 0;
        }
        self.enum_mask |= 1 << delta;
        Ok(())
    }

    pub fn end_enum(&mut self) {
        if self.enum_mask != 0 {
            self.flush_enum_mask();
        }
    }

    pub fn encode_map(
        &mut self,
        key_type: FieldType,
        value_type: FieldType,
        key_modifiers: u32,
        value_modifiers: u32,
    ) -> Result<()> {
        self.reset(0);
        self.put_raw(VERSION_MAP);
        self.put_field(key_type, 1, key_modifiers)?;
        self.put_field(value_type, 2, value_modifiers)
    }

    pub fn encode_message_set(&mut self) {
        self.reset(0);
        self.put_raw(VERSION_MESSAGE_SET);
    }

    pub fn encode_extension(&mut self, field_type: FieldType, number: u32, modifiers: u32) -> Result<()> {
        self.reset(0);
        self.put_raw(VERSION_EXTENSION);
        self.put_field(field_type, number, modifiers)
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    pub fn finish(self) -> String {
        self.out
    }
}

struct Parser<'d> {
    data: &'d [u8],
    pos: usize,
}

impl<'d> Parser<'d> {
    fn new(data: &'d [u8]) -> Self {
        Parser { data, pos: 0 }
    }

    fn next(&mut self) -> Option<u8> {
        let ch = self.data.get(self.pos).copied()?;
        self.pos += 1;
        Some(ch)
    }

    fn varint(&mut self, first: u8, min: u8, max: u8) -> Result<u32> {
        let lo = from_base92(min).unwrap_or(0) as u32;
        let hi = from_base92(max).unwrap_or(0) as u32;
        let bits_per_char = log2_ceil(hi - lo);
        let mut value = 0u32;
        let mut shift = 0u32;
        let mut ch = first;
        loop {
            let digit = from_base92(ch).ok_or_else(|| invalid!("invalid char: {:?}", ch as char))? as u32;
            value |= (digit - lo) << shift;
            match self.data.get(self.pos) {
                Some(&next) if (min..=max).contains(&next) => {
                    self.pos += 1;
                    ch = next;
                    shift += bits_per_char;
                    if shift >= 32 {
                        return Err(invalid!("overlong varint"));
                    }
                }
                _ => return Ok(value),
            }
        }
    }

    fn field(&self, ch: u8, number: u32, msg_modifiers: u32) -> Result<FieldSpec> {
        let value = from_base92(ch).ok_or_else(|| invalid!("invalid char: {:?}", ch as char))?;
        let (encoded, repeated) = if value >= REPEATED_BASE {
            (value - REPEATED_BASE, true)
        } else {
            (value, false)
        };
        let Some(&declared) = ENCODED_TO_TYPE.get(encoded as usize) else {
            return Err(invalid!("invalid field type: {encoded}"));
        };
        let (field_type, mut flags) = if encoded == OPEN_ENUM {
            (FieldType::Int32, FLAG_ALTERNATE)
        } else if declared == FieldType::String && msg_modifiers & modifier::MSG_VALIDATE_UTF8 == 0 {
            (FieldType::Bytes, FLAG_ALTERNATE)
        } else {
            (declared, 0)
        };
        let mut spec = FieldSpec::new(number, field_type, repeated);
        if spec.is_packable() && msg_modifiers & modifier::MSG_DEFAULT_PACKED != 0 {
            flags |= crate::tables::FLAG_PACKED;
        }
        spec.flags = flags;
        Ok(spec)
    }

    fn modify_field(spec: &mut FieldSpec, modifiers: u32) -> Result<()> {
        let number = spec.number;
        if modifiers & FLIP_PACKED != 0 {
            if !spec.is_packable() {
                return Err(invalid!("cannot flip packed on unpackable field {number}"));
            }
            spec.toggle_packed();
        }
        if modifiers & FLIP_VALIDATE_UTF8 != 0 {
            if spec.field_type != FieldType::Bytes || !spec.is_alternate() {
                return Err(invalid!("cannot flip ValidateUtf8 on field {number}"));
            }
            spec.field_type = FieldType::String;
            spec.flags &= !FLAG_ALTERNATE;
        }
        let singular = modifiers & IS_PROTO3_SINGULAR != 0;
        let required = modifiers & IS_REQUIRED != 0;
        if (singular || required) && spec.presence != Presence::HasBit {
            return Err(invalid!("invalid modifier(s) for repeated field {number}"));
        }
        if singular && required {
            return Err(invalid!("field {number} cannot be both singular and required"));
        }
        if singular && spec.field_type.is_sub_message() {
            return Err(invalid!("field {number} cannot be a singular submessage"));
        }
        if singular {
            spec.presence = Presence::None;
        }
        if required {
            spec.presence = Presence::Required;
        }
        Ok(())
    }

    // Shared by messages and extensions. Extensions hold exactly one field and
    // accept no message modifiers or oneofs.
    fn fields(&mut self, builder: &mut MiniTableBuilder, extension: bool) -> Result<()> {
        let mut msg_modifiers = 0u32;
        let mut last_number = 0u32;
        while let Some(ch) = self.next() {
            match ch {
                b' '..=MAX_FIELD => {
                    if extension && !builder.fields.is_empty() {
                        return Err(invalid!("extension with more than one field"));
                    }
                    last_number = last_number
                        .checked_add(1)
                        .filter(|n| *n <= MAX_FIELD_NUMBER)
                        .ok_or_else(|| invalid!("field number overflow"))?;
                    let spec = self.field(ch, last_number, msg_modifiers)?;
                    builder.fields.push(spec);
                }
                MIN_MODIFIER..=MAX_MODIFIER => {
                    let modifiers = self.varint(ch, MIN_MODIFIER, MAX_MODIFIER)?;
                    match builder.fields.last_mut() {
                        Some(last) => Self::modify_field(last, modifiers)?,
                        None if extension => {
                            return Err(invalid!("extensions cannot have message modifiers"));
                        }
                        None => {
                            msg_modifiers = modifiers;
                            builder.extendable = modifiers & modifier::MSG_EXTENDABLE != 0;
                        }
                    }
                }
                END => {
                    if extension {
                        return Err(invalid!("extensions cannot have oneofs"));
                    }
                    return self.oneofs(builder);
                }
                MIN_SKIP..=MAX_SKIP => {
                    let skip = self.varint(ch, MIN_SKIP, MAX_SKIP)?;
                    if skip == 0 {
                        return Err(invalid!("zero skip"));
                    }
                    last_number = last_number
                        .checked_add(skip - 1)
                        .filter(|n| *n < MAX_FIELD_NUMBER)
                        .ok_or_else(|| invalid!("field number overflow"))?;
                }
                _ => return Err(invalid!("invalid char: {:?}", ch as char)),
            }
        }
        Ok(())
    }

    fn oneofs(&mut self, builder: &mut MiniTableBuilder) -> Result<()> {
        let mut members: Vec<usize> = Vec::new();
        while let Some(ch) = self.next() {
            match ch {
                FIELD_SEPARATOR => {}
                ONEOF_SEPARATOR => push_oneof(builder, std::mem::take(&mut members))?,
                MIN_ONEOF_FIELD..=MAX_ONEOF_FIELD => {
                    let number = self.varint(ch, MIN_ONEOF_FIELD, MAX_ONEOF_FIELD)?;
                    let index = builder
                        .fields
                        .iter()
                        .position(|f| f.number == number)
                        .ok_or_else(|| {
                            invalid!("couldn't add field number {number} to oneof, no such field number")
                        })?;
                    let spec = &mut builder.fields[index];
                    if spec.presence != Presence::HasBit {
                        return Err(invalid!(
                            "cannot add repeated, required, or singular field {number} to oneof"
                        ));
                    }
                    spec.presence = Presence::Oneof(builder.oneofs.len());
                    members.push(index);
                }
                _ => return Err(invalid!("invalid char in oneof: {:?}", ch as char)),
            }
        }
        push_oneof(builder, members)
    }
}

fn push_oneof(builder: &mut MiniTableBuilder, members: Vec<usize>) -> Result<()> {
    if members.is_empty() {
        return Err(invalid!("empty oneof"));
    }
    builder.oneofs.push(members);
    Ok(())
}

fn log_rejection(status: &Status) {
    debug!(error = %status, "mini-descriptor rejected");
}

impl MiniTableBuilder {
    /// Parses a message, map entry or message set mini-descriptor. An empty
    /// descriptor describes a message without fields.
    pub fn from_mini_descriptor(data: &str) -> Result<MiniTableBuilder> {
        let mut parser = Parser::new(data.as_bytes());
        let result = match parser.next() {
            None => Ok(MiniTableBuilder::new(TableKind::Message)),
            Some(VERSION_MESSAGE) => {
                let mut builder = MiniTableBuilder::new(TableKind::Message);
                parser.fields(&mut builder, false).map(|_| builder)
            }
            Some(VERSION_MAP) => {
                let mut builder = MiniTableBuilder::new(TableKind::MapEntry);
                parser.fields(&mut builder, false).map(|_| builder)
            }
            Some(VERSION_MESSAGE_SET) => {
                if data.len() > 1 {
                    Err(invalid!("invalid message set encode length: {}", data.len() - 1))
                } else {
                    Ok(MiniTableBuilder::new(TableKind::MessageSet))
                }
            }
            Some(other) => Err(invalid!("invalid message version: {:?}", other as char)),
        };
        result.inspect_err(log_rejection)
    }
}

/// Builds a message table from its mini-descriptor. Sub-message and enum
/// slots start unlinked.
pub fn build_mini_table(data: &str) -> Result<&'static MiniTable> {
    MiniTableBuilder::from_mini_descriptor(data)?
        .build()
        .inspect_err(log_rejection)
}

pub fn build_enum(data: &str) -> Result<MiniTableEnum> {
    let mut parser = Parser::new(data.as_bytes());
    let result = (|| {
        match parser.next() {
            None => return Ok(MiniTableEnum::default()),
            Some(VERSION_ENUM) => {}
            Some(other) => return Err(invalid!("invalid enum version: {:?}", other as char)),
        }
        let mut values = Vec::new();
        let mut base = 0u64;
        while let Some(ch) = parser.next() {
            match ch {
                b' '..=MAX_ENUM_MASK => {
                    let mask = from_base92(ch).ok_or_else(|| invalid!("invalid char: {:?}", ch as char))?;
                    for i in 0..5 {
                        if mask & (1 << i) != 0 {
                            let value = u32::try_from(base + i)
                                .map_err(|_| invalid!("enum value overflow"))?;
                            values.push(value as i32);
                        }
                    }
                    base += 5;
                }
                MIN_SKIP..=MAX_SKIP => {
                    base += parser.varint(ch, MIN_SKIP, MAX_SKIP)? as u64;
                }
                _ => return Err(invalid!("unexpected character: {:?}", ch as char)),
            }
        }
        Ok(MiniTableEnum::from_values(values))
    })();
    result.inspect_err(log_rejection)
}

/// Builds an extension of `extendee` from a `#` mini-descriptor.
pub fn build_extension(data: &str, extendee: &'static MiniTable) -> Result<MiniTableExtension> {
    let result = (|| {
        let mut parser = Parser::new(data.as_bytes());
        if parser.next() != Some(VERSION_EXTENSION) {
            return Err(invalid!("invalid extension version"));
        }
        let mut builder = MiniTableBuilder::new(TableKind::Message);
        parser.fields(&mut builder, true)?;
        let [spec] = builder.fields.as_slice() else {
            return Err(invalid!("extension must declare one field"));
        };
        if extendee.is_message_set() && (!spec.field_type.is_sub_message() || spec.repeated) {
            return Err(invalid!("message set extensions must be singular messages"));
        }
        let card = if spec.repeated {
            crate::tables::Cardinality::Repeated
        } else {
            crate::tables::Cardinality::Optional
        };
        let mut field = crate::tables::MiniTableField::new(spec.number, spec.field_type, card);
        field.flags = spec.flags | FLAG_EXTENSION;
        let sub = if spec.field_type.is_sub_message() {
            field.sub_index = 0;
            MiniTableSub::message()
        } else {
            if spec.field_type == FieldType::Enum {
                field.sub_index = 0;
            }
            MiniTableSub::enumeration()
        };
        Ok(MiniTableExtension {
            field,
            extendee,
            sub,
        })
    })();
    result.inspect_err(log_rejection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{Cardinality, SubKind};

    #[test]
    fn base92_alphabet() {
        assert_eq!(BASE92.len(), 92);
        for (i, &ch) in BASE92.iter().enumerate() {
            assert_eq!(from_base92(ch), Some(i as u8));
            assert_eq!(to_base92(i as u8), ch);
        }
        assert_eq!(from_base92(b'"'), None);
        assert_eq!(from_base92(b'\''), None);
        assert_eq!(from_base92(b'\\'), None);
        assert_eq!(from_base92(b'\n'), None);
    }

    #[test]
    fn scalar_message_descriptor() {
        // int32 a = 1; string b = 2; bool c = 3; proto3-style validation.
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(modifier::MSG_VALIDATE_UTF8);
        e.put_field(FieldType::Int32, 1, 0).unwrap();
        e.put_field(FieldType::String, 2, modifier::VALIDATE_UTF8).unwrap();
        e.put_field(FieldType::Bool, 3, 0).unwrap();
        let desc = e.finish();
        assert_eq!(desc, "$M(1/");

        let t = build_mini_table(&desc).unwrap();
        assert_eq!(t.field_count(), 3);
        assert_eq!(t.dense_below(), 3);
        assert_eq!(t.find_field(1).unwrap().field_type(), FieldType::Int32);
        assert_eq!(t.find_field(2).unwrap().field_type(), FieldType::String);
        assert_eq!(t.find_field(3).unwrap().field_type(), FieldType::Bool);
    }

    #[test]
    fn skips_and_modifiers() {
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        e.put_field(FieldType::Int32, 1, modifier::REQUIRED).unwrap();
        e.put_field(FieldType::Int32, 10, modifier::REPEATED | modifier::PACKED).unwrap();
        e.put_field(FieldType::String, 100, 0).unwrap();
        e.put_field(FieldType::Message, 536_870_911, 0).unwrap();
        let desc = e.finish();

        let t = build_mini_table(&desc).unwrap();
        assert_eq!(t.dense_below(), 1);
        assert_eq!(t.required_count(), 1);
        let f10 = t.find_field(10).unwrap();
        assert!(f10.is_repeated() && f10.is_packed());
        let f100 = t.find_field(100).unwrap();
        assert_eq!(f100.field_type(), FieldType::Bytes);
        assert!(f100.is_alternate());
        assert!(t.find_field(536_870_911).unwrap().is_sub_message());
    }

    #[test]
    fn oneofs_parse() {
        let mut e = MiniDescriptorEncoder::new();
        e.start_message(0);
        for n in 1..=4 {
            e.put_field(FieldType::Int64, n, 0).unwrap();
        }
        e.start_oneof();
        e.put_oneof_field(1).unwrap();
        e.put_oneof_field(3).unwrap();
        e.start_oneof();
        e.put_oneof_field(4).unwrap();
        let desc = e.finish();
        assert!(desc.contains('^') && desc.contains('~') && desc.contains('|'));

        let t = build_mini_table(&desc).unwrap();
        let (f1, f3, f4) = (t.find_field(1).unwrap(), t.find_field(3).unwrap(), t.find_field(4).unwrap());
        assert_eq!(f1.card(), Cardinality::Oneof);
        assert_eq!(f1.presence, f3.presence);
        assert_ne!(f1.presence, f4.presence);
        assert_eq!(t.find_field(2).unwrap().card(), Cardinality::Optional);
    }

    #[test]
    fn rejects_invalid_descriptors() {
        assert!(build_mini_table("x").is_err());
        assert!(build_mini_table("$\\").is_err());
        assert!(build_mini_table("$\"").is_err());
        assert!(build_mini_table("$^").is_err());
        // Oneof naming an absent field.
        assert!(build_mini_table("$(^#").is_err());
        // Flip packed on an unpackable (singular) field: modifier 1 is 'M'.
        assert!(build_mini_table("$(M").is_err());
        // Required plus singular: modifier 6 is 'R'.
        assert!(build_mini_table("$(R").is_err());
        // Message sets carry no fields.
        assert!(build_mini_table("&(").is_err());
        assert!(build_mini_table("&").unwrap().is_message_set());
        assert_eq!(build_mini_table("").unwrap().field_count(), 0);
    }

    #[test]
    fn overlong_varint() {
        // Skip chars carry five bits each; eight of them exceed 32 bits.
        assert!(build_mini_table("$~~~~~~~~(").is_err());
    }

    #[test]
    fn map_entries() {
        let mut e = MiniDescriptorEncoder::new();
        e.encode_map(FieldType::Int32, FieldType::Int32, 0, 0).unwrap();
        let t = build_mini_table(&e.finish()).unwrap();
        assert!(t.is_map_entry());

        let mut e = MiniDescriptorEncoder::new();
        e.encode_map(FieldType::String, FieldType::Message, 0, 0).unwrap();
        assert!(build_mini_table(e.as_str()).is_ok());

        let mut e = MiniDescriptorEncoder::new();
        e.encode_map(FieldType::Float, FieldType::Int32, 0, 0).unwrap();
        assert!(build_mini_table(e.as_str()).is_err());

        let mut e = MiniDescriptorEncoder::new();
        e.encode_map(FieldType::Int32, FieldType::Group, 0, 0).unwrap();
        assert!(build_mini_table(e.as_str()).is_err());
    }

    #[test]
    fn enum_round_trip() {
        let values = [0u32, 1, 2, 7, 64, 1000, 0xffff_ffff];
        let mut e = MiniDescriptorEncoder::new();
        e.start_enum();
        for v in values {
            e.put_enum_value(v).unwrap();
        }
        e.end_enum();
        let desc = e.finish();
        let parsed = build_enum(&desc).unwrap();
        let got: Vec<u32> = parsed.values().map(|v| v as u32).collect();
        assert_eq!(got, values);
        assert!(!parsed.check_value(3));

        let mut e = MiniDescriptorEncoder::new();
        e.start_enum();
        e.put_enum_value(5).unwrap();
        assert!(e.put_enum_value(5).is_err());
    }

    #[test]
    fn extensions() {
        let extendee = build_mini_table("$P").unwrap();
        assert!(extendee.is_extendable());

        let mut e = MiniDescriptorEncoder::new();
        e.encode_extension(FieldType::Int32, 100, modifier::REPEATED).unwrap();
        let ext = build_extension(e.as_str(), extendee).unwrap();
        assert_eq!(ext.number(), 100);
        assert!(ext.field().is_extension());
        assert!(ext.field().is_repeated());

        let set = build_mini_table("&").unwrap();
        let mut e = MiniDescriptorEncoder::new();
        e.encode_extension(FieldType::Int32, 4, 0).unwrap();
        assert!(build_extension(e.as_str(), set).is_err());
        let mut e = MiniDescriptorEncoder::new();
        e.encode_extension(FieldType::Message, 4, 0).unwrap();
        let ext = build_extension(e.as_str(), set).unwrap();
        assert_eq!(ext.field().type_card().sub_kind(), SubKind::Eager);
    }
}
