//! Mini-tables: the compact runtime description of a message type that drives
//! field access, parsing and serialization.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use tracing::warn;

use crate::fast::FastTable;
use crate::status::{ErrorCode, Result};
use crate::wire::WireType;

/// Declared type of a field, numbered as in `descriptor.proto`. `Enum` is a
/// closed enum; open enums are carried as `Int32` with the alternate flag.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Double = 1,
    Float = 2,
    Int64 = 3,
    UInt64 = 4,
    Int32 = 5,
    Fixed64 = 6,
    Fixed32 = 7,
    Bool = 8,
    String = 9,
    Group = 10,
    Message = 11,
    Bytes = 12,
    UInt32 = 13,
    Enum = 14,
    SFixed32 = 15,
    SFixed64 = 16,
    SInt32 = 17,
    SInt64 = 18,
}

impl FieldType {
    pub fn wire_type(self) -> WireType {
        match self {
            FieldType::Double | FieldType::Fixed64 | FieldType::SFixed64 => WireType::I64,
            FieldType::Float | FieldType::Fixed32 | FieldType::SFixed32 => WireType::I32,
            FieldType::String | FieldType::Bytes | FieldType::Message => WireType::Len,
            FieldType::Group => WireType::StartGroup,
            FieldType::Int64
            | FieldType::UInt64
            | FieldType::Int32
            | FieldType::Bool
            | FieldType::UInt32
            | FieldType::Enum
            | FieldType::SInt32
            | FieldType::SInt64 => WireType::Varint,
        }
    }

    /// Scalar types whose repeated form may use the packed encoding.
    pub fn is_packable(self) -> bool {
        !matches!(
            self,
            FieldType::String | FieldType::Bytes | FieldType::Message | FieldType::Group
        )
    }

    pub fn is_sub_message(self) -> bool {
        matches!(self, FieldType::Message | FieldType::Group)
    }

    /// Storage width of one value; string-like and message slots excluded.
    pub(crate) fn scalar_rep(self) -> FieldRep {
        match self {
            FieldType::Bool => FieldRep::Fixed8,
            FieldType::Double
            | FieldType::Fixed64
            | FieldType::SFixed64
            | FieldType::Int64
            | FieldType::UInt64
            | FieldType::SInt64 => FieldRep::Fixed64,
            FieldType::String => FieldRep::String,
            FieldType::Bytes => FieldRep::Bytes,
            FieldType::Message | FieldType::Group => FieldRep::Message,
            _ => FieldRep::Fixed32,
        }
    }

    pub(crate) fn is_signed(self) -> bool {
        matches!(
            self,
            FieldType::Int32
                | FieldType::Int64
                | FieldType::SInt32
                | FieldType::SInt64
                | FieldType::SFixed32
                | FieldType::SFixed64
                | FieldType::Enum
        )
    }

    pub fn from_u8(v: u8) -> Option<FieldType> {
        Some(match v {
            1 => FieldType::Double,
            2 => FieldType::Float,
            3 => FieldType::Int64,
            4 => FieldType::UInt64,
            5 => FieldType::Int32,
            6 => FieldType::Fixed64,
            7 => FieldType::Fixed32,
            8 => FieldType::Bool,
            9 => FieldType::String,
            10 => FieldType::Group,
            11 => FieldType::Message,
            12 => FieldType::Bytes,
            13 => FieldType::UInt32,
            14 => FieldType::Enum,
            15 => FieldType::SFixed32,
            16 => FieldType::SFixed64,
            17 => FieldType::SInt32,
            18 => FieldType::SInt64,
            _ => return None,
        })
    }
}

/// Storage representation of a field slot (or of one array element).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldRep {
    Fixed8 = 0,
    // Reserved; no declared type maps to it.
    Fixed16 = 1,
    Fixed32 = 2,
    Fixed64 = 3,
    Bytes = 4,
    String = 5,
    Message = 6,
    Map = 7,
}

impl FieldRep {
    pub fn size(self) -> usize {
        match self {
            FieldRep::Fixed8 => 1,
            FieldRep::Fixed16 => 2,
            FieldRep::Fixed32 => 4,
            FieldRep::Fixed64 | FieldRep::Message | FieldRep::Map => 8,
            FieldRep::Bytes | FieldRep::String => 16,
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    /// Implicit presence: set when non-default.
    Singular = 0,
    /// Explicit presence through a has-bit.
    Optional = 1,
    Repeated = 2,
    Oneof = 3,
}

/// Per-representation refinement sharing the top three bits of a [`TypeCard`].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubKind {
    Unsigned = 0,
    Signed = 1,
    Eager = 2,
    Lazy = 3,
    Group = 4,
    View = 5,
    Inlined = 6,
}

/// rep (3 bits) | cardinality (2 bits) | subkind (3 bits).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TypeCard(u8);

impl TypeCard {
    pub const fn new(rep: FieldRep, card: Cardinality, sub: SubKind) -> Self {
        TypeCard(rep as u8 | (card as u8) << 3 | (sub as u8) << 5)
    }

    pub fn rep(self) -> FieldRep {
        match self.0 & 7 {
            0 => FieldRep::Fixed8,
            1 => FieldRep::Fixed16,
            2 => FieldRep::Fixed32,
            3 => FieldRep::Fixed64,
            4 => FieldRep::Bytes,
            5 => FieldRep::String,
            6 => FieldRep::Message,
            _ => FieldRep::Map,
        }
    }

    pub fn card(self) -> Cardinality {
        match (self.0 >> 3) & 3 {
            0 => Cardinality::Singular,
            1 => Cardinality::Optional,
            2 => Cardinality::Repeated,
            _ => Cardinality::Oneof,
        }
    }

    pub fn sub_kind(self) -> SubKind {
        match self.0 >> 5 {
            0 => SubKind::Unsigned,
            1 => SubKind::Signed,
            2 => SubKind::Eager,
            3 => SubKind::Lazy,
            4 => SubKind::Group,
            5 => SubKind::View,
            _ => SubKind::Inlined,
        }
    }

    pub(crate) fn with_sub_kind(self, sub: SubKind) -> Self {
        TypeCard((self.0 & 0x1f) | (sub as u8) << 5)
    }
}

impl fmt::Debug for TypeCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}/{:?}", self.rep(), self.card(), self.sub_kind())
    }
}

pub const NO_SUB: u16 = u16::MAX;

pub(crate) const FLAG_PACKED: u8 = 1;
pub(crate) const FLAG_EXTENSION: u8 = 2;
pub(crate) const FLAG_ALTERNATE: u8 = 4;

/// One field entry.
///
/// `presence` is positive for a has-bit (a bit index counted from the start of
/// the message), negative for a oneof (`!case_offset`), zero for none.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MiniTableField {
    pub(crate) number: u32,
    pub(crate) offset: u16,
    pub(crate) presence: i16,
    pub(crate) sub_index: u16,
    pub(crate) descriptor_type: FieldType,
    pub(crate) flags: u8,
    pub(crate) type_card: TypeCard,
}

impl MiniTableField {
    pub(crate) fn new(number: u32, descriptor_type: FieldType, card: Cardinality) -> Self {
        let rep = descriptor_type.scalar_rep();
        let sub = match rep {
            FieldRep::Message if descriptor_type == FieldType::Group => SubKind::Group,
            FieldRep::Message => SubKind::Eager,
            FieldRep::Bytes | FieldRep::String => SubKind::View,
            _ if descriptor_type.is_signed() => SubKind::Signed,
            _ => SubKind::Unsigned,
        };
        MiniTableField {
            number,
            offset: 0,
            presence: 0,
            sub_index: NO_SUB,
            descriptor_type,
            flags: 0,
            type_card: TypeCard::new(rep, card, sub),
        }
    }

    #[inline]
    pub fn number(&self) -> u32 {
        self.number
    }

    #[inline]
    pub fn field_type(&self) -> FieldType {
        self.descriptor_type
    }

    #[inline]
    pub fn type_card(&self) -> TypeCard {
        self.type_card
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    #[inline]
    pub fn wire_type(&self) -> WireType {
        self.descriptor_type.wire_type()
    }

    #[inline]
    pub fn card(&self) -> Cardinality {
        self.type_card.card()
    }

    #[inline]
    pub fn rep(&self) -> FieldRep {
        self.type_card.rep()
    }

    #[inline]
    pub fn is_repeated(&self) -> bool {
        self.card() == Cardinality::Repeated && self.rep() != FieldRep::Map
    }

    #[inline]
    pub fn is_map(&self) -> bool {
        self.rep() == FieldRep::Map
    }

    #[inline]
    pub fn is_packed(&self) -> bool {
        self.flags & FLAG_PACKED != 0
    }

    #[inline]
    pub fn is_extension(&self) -> bool {
        self.flags & FLAG_EXTENSION != 0
    }

    #[inline]
    pub fn is_alternate(&self) -> bool {
        self.flags & FLAG_ALTERNATE != 0
    }

    #[inline]
    pub fn is_sub_message(&self) -> bool {
        self.descriptor_type.is_sub_message()
    }

    #[inline]
    pub fn is_closed_enum(&self) -> bool {
        self.descriptor_type == FieldType::Enum
    }

    #[inline]
    pub fn is_group(&self) -> bool {
        self.descriptor_type == FieldType::Group
    }

    #[inline]
    pub fn is_lazy(&self) -> bool {
        self.type_card.sub_kind() == SubKind::Lazy
    }

    #[inline]
    pub fn is_inlined(&self) -> bool {
        self.type_card.sub_kind() == SubKind::Inlined
    }

    /// Whether the field tracks explicit presence (has-bit or oneof).
    #[inline]
    pub fn has_presence(&self) -> bool {
        self.presence != 0
    }

    #[inline]
    pub(crate) fn has_bit(&self) -> Option<u32> {
        (self.presence > 0).then_some(self.presence as u32)
    }

    #[inline]
    pub(crate) fn oneof_case_offset(&self) -> Option<usize> {
        (self.presence < 0).then_some(!self.presence as usize)
    }

    #[inline]
    pub(crate) fn sub_index(&self) -> Option<usize> {
        (self.sub_index != NO_SUB).then_some(self.sub_index as usize)
    }

    /// Width of one stored element: the whole slot for singular fields, one
    /// array element for repeated ones.
    pub(crate) fn elem_size(&self) -> usize {
        self.rep().size()
    }
}

/// Closed-enum validator.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MiniTableEnum {
    pub(crate) mask: u64,
    pub(crate) values: Box<[u32]>,
}

impl MiniTableEnum {
    pub fn from_values(values: impl IntoIterator<Item = i32>) -> Self {
        let mut mask = 0u64;
        let mut rest = Vec::new();
        for v in values {
            let v = v as u32;
            if v < 64 {
                mask |= 1 << v;
            } else {
                rest.push(v);
            }
        }
        rest.sort_unstable();
        rest.dedup();
        MiniTableEnum {
            mask,
            values: rest.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn check_value(&self, value: i32) -> bool {
        let v = value as u32;
        if v < 64 {
            return self.mask & (1 << v) != 0;
        }
        self.values.binary_search(&v).is_ok()
    }

    /// Every accepted value, ascending as unsigned.
    pub fn values(&self) -> impl Iterator<Item = i32> + '_ {
        (0..64u32)
            .filter(|i| self.mask & (1 << i) != 0)
            .chain(self.values.iter().copied())
            .map(|v| v as i32)
    }
}

/// Slot linking a field to its sub-message table or enum validator. Empty
/// slots are placeholders that can be linked once, later.
#[derive(Debug)]
pub enum MiniTableSub {
    Message(OnceLock<&'static MiniTable>),
    Enum(OnceLock<&'static MiniTableEnum>),
}

impl MiniTableSub {
    pub fn message() -> Self {
        MiniTableSub::Message(OnceLock::new())
    }

    pub fn enumeration() -> Self {
        MiniTableSub::Enum(OnceLock::new())
    }

    pub fn message_table(&self) -> Option<&'static MiniTable> {
        match self {
            MiniTableSub::Message(slot) => slot.get().copied(),
            MiniTableSub::Enum(_) => None,
        }
    }

    pub fn enum_table(&self) -> Option<&'static MiniTableEnum> {
        match self {
            MiniTableSub::Enum(slot) => slot.get().copied(),
            MiniTableSub::Message(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtMode {
    NonExtendable,
    Extendable,
    /// Extendable, and extensions use the message-set item encoding.
    MessageSet,
    MapEntry,
}

pub struct MiniTable {
    pub(crate) fields: Box<[MiniTableField]>,
    pub(crate) subs: Box<[MiniTableSub]>,
    pub(crate) size: u16,
    pub(crate) required_count: u8,
    pub(crate) dense_below: u32,
    pub(crate) ext: ExtMode,
    pub(crate) fast: OnceLock<FastTable>,
    names: OnceLock<Box<[(u32, Box<str>)]>>,
}

static EMPTY: OnceLock<&'static MiniTable> = OnceLock::new();

impl MiniTable {
    pub(crate) fn new(
        mut fields: Vec<MiniTableField>,
        subs: Vec<MiniTableSub>,
        size: u16,
        required_count: u8,
        ext: ExtMode,
    ) -> Self {
        fields.sort_by_key(|f| f.number);
        let dense_below = fields
            .iter()
            .enumerate()
            .take_while(|(i, f)| f.number == *i as u32 + 1)
            .count() as u32;
        MiniTable {
            fields: fields.into_boxed_slice(),
            subs: subs.into_boxed_slice(),
            size,
            required_count,
            dense_below,
            ext,
            fast: OnceLock::new(),
            names: OnceLock::new(),
        }
    }

    /// Moves the table to static storage. Tables are immutable once built and
    /// shared freely between threads and messages.
    pub fn leak(self) -> &'static MiniTable {
        Box::leak(Box::new(self))
    }

    /// Table with no fields, used as the layout of raw payload holders.
    pub fn empty() -> &'static MiniTable {
        EMPTY.get_or_init(|| {
            MiniTable::new(
                Vec::new(),
                Vec::new(),
                crate::base::HEADER_SIZE.next_multiple_of(8) as u16,
                0,
                ExtMode::NonExtendable,
            )
            .leak()
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    #[inline]
    pub fn fields(&self) -> &[MiniTableField] {
        &self.fields
    }

    #[inline]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn required_count(&self) -> usize {
        self.required_count as usize
    }

    #[inline]
    pub fn dense_below(&self) -> u32 {
        self.dense_below
    }

    #[inline]
    pub fn ext_mode(&self) -> ExtMode {
        self.ext
    }

    pub fn is_extendable(&self) -> bool {
        matches!(self.ext, ExtMode::Extendable | ExtMode::MessageSet)
    }

    pub fn is_message_set(&self) -> bool {
        self.ext == ExtMode::MessageSet
    }

    pub fn is_map_entry(&self) -> bool {
        self.ext == ExtMode::MapEntry
    }

    /// Index of the field with the given number. Numbers in the dense prefix
    /// index directly; the rest are found by binary search.
    #[inline]
    pub fn field_index(&self, number: u32) -> Option<usize> {
        let i = number.wrapping_sub(1);
        if i < self.dense_below {
            return Some(i as usize);
        }
        let rest = &self.fields[self.dense_below as usize..];
        rest.binary_search_by_key(&number, |f| f.number)
            .ok()
            .map(|j| j + self.dense_below as usize)
    }

    #[inline]
    pub fn find_field(&self, number: u32) -> Option<&MiniTableField> {
        self.field_index(number).map(|i| &self.fields[i])
    }

    pub(crate) fn sub(&self, field: &MiniTableField) -> Option<&MiniTableSub> {
        field.sub_index().and_then(|i| self.subs.get(i))
    }

    /// Linked sub-message table of `field`, if any.
    #[inline]
    pub fn sub_message(&self, field: &MiniTableField) -> Option<&'static MiniTable> {
        self.sub(field).and_then(MiniTableSub::message_table)
    }

    #[inline]
    pub fn sub_enum(&self, field: &MiniTableField) -> Option<&'static MiniTableEnum> {
        self.sub(field).and_then(MiniTableSub::enum_table)
    }

    /// Links the sub-message table of field `number`. Each slot links once.
    pub fn link_message(&self, number: u32, sub: &'static MiniTable) -> Result<()> {
        let field = self.find_field(number).ok_or(ErrorCode::InvalidDescriptor)?;
        if !field.is_sub_message() && !field.is_map() {
            return Err(crate::status!(
                ErrorCode::InvalidDescriptor,
                "field {number} is not a message"
            ));
        }
        if field.is_map() && !sub.is_map_entry() {
            return Err(crate::status!(
                ErrorCode::InvalidDescriptor,
                "map field {number} needs a map entry table"
            ));
        }
        match self.sub(field) {
            Some(MiniTableSub::Message(slot)) => slot.set(sub).map_err(|_| {
                crate::status!(ErrorCode::InvalidDescriptor, "field {number} already linked")
            }),
            _ => Err(ErrorCode::InvalidDescriptor.into()),
        }
    }

    pub fn link_enum(&self, number: u32, sub: &'static MiniTableEnum) -> Result<()> {
        let field = self.find_field(number).ok_or(ErrorCode::InvalidDescriptor)?;
        match self.sub(field) {
            Some(MiniTableSub::Enum(slot)) if field.is_closed_enum() => slot.set(sub).map_err(|_| {
                crate::status!(ErrorCode::InvalidDescriptor, "field {number} already linked")
            }),
            _ => Err(crate::status!(
                ErrorCode::InvalidDescriptor,
                "field {number} is not a closed enum"
            )),
        }
    }

    /// Attaches field names used by `Debug` output. Only the first call has
    /// an effect.
    pub fn set_field_names<'s>(&self, names: impl IntoIterator<Item = (u32, &'s str)>) -> bool {
        let mut names: Vec<(u32, Box<str>)> =
            names.into_iter().map(|(n, s)| (n, Box::from(s))).collect();
        names.sort_by_key(|(n, _)| *n);
        self.names.set(names.into_boxed_slice()).is_ok()
    }

    pub fn field_name(&self, number: u32) -> Option<&str> {
        let names = self.names.get()?;
        names
            .binary_search_by_key(&number, |(n, _)| *n)
            .ok()
            .map(|i| &*names[i].1)
    }

    pub(crate) fn fast_table(&'static self) -> &'static FastTable {
        self.fast.get_or_init(|| FastTable::build(self))
    }

    /// Bit indices of the required fields, lowest first.
    pub(crate) fn required_mask(&self) -> u64 {
        match self.required_count {
            0 => 0,
            64 => u64::MAX,
            n => (1u64 << n) - 1,
        }
    }
}

impl fmt::Debug for MiniTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiniTable")
            .field("size", &self.size)
            .field("required_count", &self.required_count)
            .field("dense_below", &self.dense_below)
            .field("ext", &self.ext)
            .field("fields", &self.fields)
            .finish()
    }
}

/// An extension field and the message type it extends.
#[derive(Debug)]
pub struct MiniTableExtension {
    pub(crate) field: MiniTableField,
    pub(crate) extendee: &'static MiniTable,
    pub(crate) sub: MiniTableSub,
}

impl MiniTableExtension {
    pub fn number(&self) -> u32 {
        self.field.number
    }

    pub fn field(&self) -> &MiniTableField {
        &self.field
    }

    pub fn extendee(&self) -> &'static MiniTable {
        self.extendee
    }

    pub fn sub_message(&self) -> Option<&'static MiniTable> {
        self.sub.message_table()
    }

    pub fn sub_enum(&self) -> Option<&'static MiniTableEnum> {
        self.sub.enum_table()
    }

    pub fn link_message(&self, sub: &'static MiniTable) -> Result<()> {
        match &self.sub {
            MiniTableSub::Message(slot) if self.field.is_sub_message() => slot
                .set(sub)
                .map_err(|_| crate::status!(ErrorCode::InvalidDescriptor, "extension already linked")),
            _ => Err(crate::status!(ErrorCode::InvalidDescriptor, "extension is not a message")),
        }
    }

    pub fn link_enum(&self, sub: &'static MiniTableEnum) -> Result<()> {
        match &self.sub {
            MiniTableSub::Enum(slot) if self.field.is_closed_enum() => slot
                .set(sub)
                .map_err(|_| crate::status!(ErrorCode::InvalidDescriptor, "extension already linked")),
            _ => Err(crate::status!(ErrorCode::InvalidDescriptor, "extension is not a closed enum")),
        }
    }

    pub fn leak(self) -> &'static MiniTableExtension {
        Box::leak(Box::new(self))
    }
}

/// Extensions known to a decode, keyed by (extended table, field number).
#[derive(Default)]
pub struct ExtensionRegistry {
    entries: HashMap<(usize, u32), &'static MiniTableExtension, ahash::RandomState>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `ext`. A second extension for the same extendee and number is
    /// rejected and leaves the registry unchanged.
    pub fn add(&mut self, ext: &'static MiniTableExtension) -> Result<()> {
        let key = (ext.extendee as *const MiniTable as usize, ext.number());
        if self.entries.contains_key(&key) {
            warn!(number = ext.number(), "duplicate extension registration");
            return Err(crate::status!(
                ErrorCode::InvalidDescriptor,
                "extension {} already registered",
                ext.number()
            ));
        }
        self.entries.insert(key, ext);
        Ok(())
    }

    /// Registers all of `exts`, stopping at the first duplicate.
    pub fn add_all(&mut self, exts: &[&'static MiniTableExtension]) -> Result<()> {
        exts.iter().try_for_each(|ext| self.add(ext))
    }

    #[inline]
    pub fn lookup(&self, extendee: &MiniTable, number: u32) -> Option<&'static MiniTableExtension> {
        self.entries
            .get(&(extendee as *const MiniTable as usize, number))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(numbers: &[u32]) -> MiniTable {
        let fields = numbers
            .iter()
            .map(|&n| MiniTableField::new(n, FieldType::Int32, Cardinality::Singular))
            .collect();
        MiniTable::new(fields, Vec::new(), 16, 0, ExtMode::NonExtendable)
    }

    #[test]
    fn dense_prefix_and_lookup() {
        let t = table(&[3, 1, 2, 5, 100]);
        assert_eq!(t.dense_below(), 3);
        assert_eq!(t.find_field(2).map(|f| f.number()), Some(2));
        assert_eq!(t.find_field(5).map(|f| f.number()), Some(5));
        assert_eq!(t.find_field(100).map(|f| f.number()), Some(100));
        assert!(t.find_field(4).is_none());
        assert!(t.find_field(0).is_none());
        assert!(t.find_field(u32::MAX).is_none());
    }

    #[test]
    fn type_card_packs_three_axes() {
        let card = TypeCard::new(FieldRep::Message, Cardinality::Oneof, SubKind::Lazy);
        assert_eq!(card.rep(), FieldRep::Message);
        assert_eq!(card.card(), Cardinality::Oneof);
        assert_eq!(card.sub_kind(), SubKind::Lazy);
        assert_eq!(card.with_sub_kind(SubKind::Group).sub_kind(), SubKind::Group);
        assert_eq!(card.with_sub_kind(SubKind::Group).card(), Cardinality::Oneof);
    }

    #[test]
    fn enum_validator() {
        let e = MiniTableEnum::from_values([0, 1, 63, 64, 1000, -1]);
        assert!(e.check_value(0));
        assert!(e.check_value(63));
        assert!(e.check_value(64));
        assert!(e.check_value(-1));
        assert!(!e.check_value(2));
        assert!(!e.check_value(999));
        assert_eq!(e.values().collect::<Vec<_>>(), vec![0, 1, 63, 64, 1000, -1]);
    }

    #[test]
    fn registry_rejects_duplicates() {
        let extendee = table(&[1]).leak();
        let ext = |n| {
            MiniTableExtension {
                field: MiniTableField::new(n, FieldType::Int32, Cardinality::Optional),
                extendee,
                sub: MiniTableSub::message(),
            }
            .leak()
        };
        let mut registry = ExtensionRegistry::new();
        assert!(registry.add(ext(100)).is_ok());
        assert!(registry.add(ext(100)).is_err());
        assert!(registry.add(ext(101)).is_ok());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(extendee, 101).map(|e| e.number()), Some(101));
        assert!(registry.lookup(MiniTable::empty(), 101).is_none());
    }

    #[test]
    fn field_names() {
        let t = table(&[1, 2]);
        assert!(t.set_field_names([(2, "b"), (1, "a")]));
        assert!(!t.set_field_names([(1, "z")]));
        assert_eq!(t.field_name(1), Some("a"));
        assert_eq!(t.field_name(2), Some("b"));
        assert_eq!(t.field_name(3), None);
    }
}
