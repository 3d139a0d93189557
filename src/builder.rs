//! Layout of message storage: turns a list of field declarations into a
//! [`MiniTable`] with offsets, has-bits and oneof case slots assigned.

use std::sync::OnceLock;

use crate::base::HEADER_SIZE;
use crate::status::{ErrorCode, Result};
use crate::tables::{
    Cardinality, ExtMode, FLAG_ALTERNATE, FLAG_PACKED, FieldRep, FieldType, MiniTable,
    MiniTableField, MiniTableSub, NO_SUB, SubKind, TypeCard,
};

/// Offsets of the key and value slots inside a map entry object.
pub(crate) const MAP_KEY_OFFSET: u16 = 16;
pub(crate) const MAP_VALUE_OFFSET: u16 = 32;
pub(crate) const MAP_ENTRY_SIZE: u16 = 48;

const MAX_REQUIRED: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Presence {
    None,
    HasBit,
    Required,
    Oneof(usize),
}

#[derive(Clone, Debug)]
pub(crate) struct FieldSpec {
    pub(crate) number: u32,
    pub(crate) field_type: FieldType,
    pub(crate) repeated: bool,
    pub(crate) presence: Presence,
    pub(crate) flags: u8,
}

impl FieldSpec {
    pub(crate) fn new(number: u32, field_type: FieldType, repeated: bool) -> Self {
        FieldSpec {
            number,
            field_type,
            repeated,
            presence: if repeated { Presence::None } else { Presence::HasBit },
            flags: 0,
        }
    }

    pub(crate) fn is_packable(&self) -> bool {
        self.repeated && self.field_type.is_packable()
    }

    pub(crate) fn toggle_packed(&mut self) {
        self.flags ^= FLAG_PACKED;
    }

    pub(crate) fn is_alternate(&self) -> bool {
        self.flags & FLAG_ALTERNATE != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TableKind {
    Message,
    MapEntry,
    MessageSet,
}

// Storage slots, in placement order: ascending alignment.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Slot {
    OneByte = 0,
    FourByte = 1,
    StringView = 2,
    EightByte = 3,
}

impl Slot {
    fn size(self) -> usize {
        match self {
            Slot::OneByte => 1,
            Slot::FourByte => 4,
            Slot::StringView => 16,
            Slot::EightByte => 8,
        }
    }

    fn align(self) -> usize {
        match self {
            Slot::OneByte => 1,
            Slot::FourByte => 4,
            Slot::StringView | Slot::EightByte => 8,
        }
    }

    fn of(spec: &FieldSpec) -> Slot {
        if spec.repeated {
            return Slot::EightByte;
        }
        match spec.field_type.scalar_rep() {
            FieldRep::Fixed8 => Slot::OneByte,
            FieldRep::Fixed16 | FieldRep::Fixed32 => Slot::FourByte,
            FieldRep::Bytes | FieldRep::String => Slot::StringView,
            FieldRep::Fixed64 | FieldRep::Message | FieldRep::Map => Slot::EightByte,
        }
    }
}

/// Collects field declarations and layout hints, then assigns storage.
///
/// Usually obtained from a mini-descriptor via
/// [`MiniTableBuilder::from_mini_descriptor`].
#[derive(Debug)]
pub struct MiniTableBuilder {
    pub(crate) kind: TableKind,
    pub(crate) fields: Vec<FieldSpec>,
    pub(crate) oneofs: Vec<Vec<usize>>,
    pub(crate) extendable: bool,
    lazy: Vec<u32>,
    inlined: Vec<u32>,
    maps: Vec<(u32, &'static MiniTable)>,
    names: Vec<(u32, String)>,
}

impl MiniTableBuilder {
    pub(crate) fn new(kind: TableKind) -> Self {
        MiniTableBuilder {
            kind,
            fields: Vec::new(),
            oneofs: Vec::new(),
            extendable: false,
            lazy: Vec::new(),
            inlined: Vec::new(),
            maps: Vec::new(),
            names: Vec::new(),
        }
    }

    fn spec(&self, number: u32) -> Result<&FieldSpec> {
        self.fields
            .iter()
            .find(|f| f.number == number)
            .ok_or_else(|| crate::status!(ErrorCode::InvalidDescriptor, "no field {number}"))
    }

    /// Keeps the payload of message field `number` as raw bytes on parse until
    /// it is first accessed mutably.
    pub fn lazy(mut self, number: u32) -> Result<Self> {
        let spec = self.spec(number)?;
        if spec.field_type != FieldType::Message {
            return Err(crate::status!(
                ErrorCode::InvalidDescriptor,
                "field {number} cannot be lazy"
            ));
        }
        self.lazy.push(number);
        Ok(self)
    }

    /// Stores short values of singular string field `number` inside the
    /// message instead of behind a pointer.
    pub fn inlined(mut self, number: u32) -> Result<Self> {
        let spec = self.spec(number)?;
        if spec.repeated || !matches!(spec.field_type, FieldType::String | FieldType::Bytes) {
            return Err(crate::status!(
                ErrorCode::InvalidDescriptor,
                "field {number} cannot be inlined"
            ));
        }
        self.inlined.push(number);
        Ok(self)
    }

    /// Turns repeated message field `number` into a map with the given entry
    /// type.
    pub fn map_entry(mut self, number: u32, entry: &'static MiniTable) -> Result<Self> {
        let spec = self.spec(number)?;
        if !spec.repeated || spec.field_type != FieldType::Message || !entry.is_map_entry() {
            return Err(crate::status!(
                ErrorCode::InvalidDescriptor,
                "field {number} cannot hold a map"
            ));
        }
        self.maps.push((number, entry));
        Ok(self)
    }

    pub fn field_name(mut self, number: u32, name: &str) -> Self {
        self.names.push((number, name.to_owned()));
        self
    }

    pub fn build(self) -> Result<&'static MiniTable> {
        self.build_owned().map(MiniTable::leak)
    }

    pub(crate) fn build_owned(self) -> Result<MiniTable> {
        match self.kind {
            TableKind::MessageSet => Ok(MiniTable::new(
                Vec::new(),
                Vec::new(),
                HEADER_SIZE.next_multiple_of(8) as u16,
                0,
                ExtMode::MessageSet,
            )),
            TableKind::MapEntry => self.build_map_entry(),
            TableKind::Message => self.build_message(),
        }
    }

    fn build_message(self) -> Result<MiniTable> {
        let (mut fields, subs) = self.base_fields();

        // Required fields take the lowest has-bits so a single mask checks them.
        let mut next_bit = (HEADER_SIZE * 8) as u32;
        let mut required = 0u32;
        for (field, spec) in fields.iter_mut().zip(&self.fields) {
            if spec.presence == Presence::Required {
                field.presence = presence_bit(next_bit)?;
                next_bit += 1;
                required += 1;
            }
        }
        if required > MAX_REQUIRED {
            return Err(crate::status!(ErrorCode::InvalidDescriptor, "too many required fields"));
        }
        for (field, spec) in fields.iter_mut().zip(&self.fields) {
            if spec.presence == Presence::HasBit {
                field.presence = presence_bit(next_bit)?;
                next_bit += 1;
            }
        }
        let mut base = (next_bit as usize).div_ceil(8);

        let mut counts = [0usize; 4];
        for spec in &self.fields {
            if !matches!(spec.presence, Presence::Oneof(_)) {
                counts[Slot::of(spec) as usize] += 1;
            }
        }
        let oneof_slots: Vec<Slot> = self
            .oneofs
            .iter()
            .map(|members| {
                members
                    .iter()
                    .map(|&i| Slot::of(&self.fields[i]))
                    .max_by_key(|slot| slot.size())
                    .unwrap_or(Slot::OneByte)
            })
            .collect();
        for slot in &oneof_slots {
            counts[Slot::FourByte as usize] += 1;
            counts[*slot as usize] += 1;
        }

        let mut next_offset = [0usize; 4];
        for slot in [Slot::OneByte, Slot::FourByte, Slot::StringView, Slot::EightByte] {
            let count = counts[slot as usize];
            if count > 0 {
                base = base.next_multiple_of(slot.align());
                next_offset[slot as usize] = base;
                base += slot.size() * count;
            }
        }
        if base > u16::MAX as usize {
            return Err(crate::status!(
                ErrorCode::InvalidDescriptor,
                "message size {base} exceeds {}",
                u16::MAX
            ));
        }
        let mut place = |slot: Slot| {
            let offset = next_offset[slot as usize];
            next_offset[slot as usize] += slot.size();
            offset as u16
        };

        for (field, spec) in fields.iter_mut().zip(&self.fields) {
            if !matches!(spec.presence, Presence::Oneof(_)) {
                field.offset = place(Slot::of(spec));
            }
        }
        for (members, slot) in self.oneofs.iter().zip(oneof_slots) {
            let case_offset = place(Slot::FourByte);
            let data_offset = place(slot);
            if case_offset > i16::MAX as u16 {
                return Err(crate::status!(ErrorCode::InvalidDescriptor, "oneof case offset overflow"));
            }
            for &i in members {
                fields[i].offset = data_offset;
                fields[i].presence = !(case_offset as i16);
            }
        }

        let size = base.next_multiple_of(8) as u16;
        let ext = if self.extendable {
            ExtMode::Extendable
        } else {
            ExtMode::NonExtendable
        };
        let table = MiniTable::new(fields, subs, size, required as u8, ext);
        self.finish(table)
    }

    fn build_map_entry(self) -> Result<MiniTable> {
        if self.fields.len() != 2 {
            return Err(crate::status!(
                ErrorCode::InvalidDescriptor,
                "{} fields in map",
                self.fields.len()
            ));
        }
        if !self.oneofs.is_empty() {
            return Err(crate::status!(ErrorCode::InvalidDescriptor, "map entry cannot have oneof"));
        }
        validate_entry_field(&self.fields[0], 1)?;
        validate_entry_field(&self.fields[1], 2)?;
        let (mut fields, subs) = self.base_fields();
        for (field, offset) in fields.iter_mut().zip([MAP_KEY_OFFSET, MAP_VALUE_OFFSET]) {
            field.offset = offset;
            field.presence = 0;
            field.type_card = TypeCard::new(field.rep(), Cardinality::Singular, field.type_card.sub_kind());
        }
        let table = MiniTable::new(fields, subs, MAP_ENTRY_SIZE, 0, ExtMode::MapEntry);
        self.finish(table)
    }

    // Field entries without storage assigned, plus their sub slots: message
    // subs first, then enum validators.
    fn base_fields(&self) -> (Vec<MiniTableField>, Vec<MiniTableSub>) {
        let msg_count = self.fields.iter().filter(|f| f.field_type.is_sub_message()).count();
        let mut next_msg = 0u16;
        let mut next_enum = msg_count as u16;
        let mut subs: Vec<MiniTableSub> = Vec::new();
        let mut enums: Vec<MiniTableSub> = Vec::new();
        let fields = self
            .fields
            .iter()
            .map(|spec| {
                let card = match spec.presence {
                    _ if spec.repeated => Cardinality::Repeated,
                    Presence::None => Cardinality::Singular,
                    Presence::HasBit | Presence::Required => Cardinality::Optional,
                    Presence::Oneof(_) => Cardinality::Oneof,
                };
                let mut field = MiniTableField::new(spec.number, spec.field_type, card);
                field.flags = spec.flags;
                field.sub_index = if spec.field_type.is_sub_message() {
                    subs.push(MiniTableSub::message());
                    next_msg += 1;
                    next_msg - 1
                } else if spec.field_type == FieldType::Enum {
                    enums.push(MiniTableSub::enumeration());
                    next_enum += 1;
                    next_enum - 1
                } else {
                    NO_SUB
                };
                field
            })
            .collect();
        subs.extend(enums);
        (fields, subs)
    }

    fn finish(self, mut table: MiniTable) -> Result<MiniTable> {
        for number in &self.lazy {
            set_sub_kind(&mut table, *number, SubKind::Lazy);
        }
        for number in &self.inlined {
            set_sub_kind(&mut table, *number, SubKind::Inlined);
        }
        for (number, entry) in &self.maps {
            let index = table.field_index(*number).ok_or(ErrorCode::InvalidDescriptor)?;
            let field = &mut table.fields[index];
            field.type_card = TypeCard::new(FieldRep::Map, Cardinality::Repeated, SubKind::Eager);
            let sub = field.sub_index as usize;
            table.subs[sub] = MiniTableSub::Message(OnceLock::from(*entry));
        }
        if !self.names.is_empty() {
            table.set_field_names(self.names.iter().map(|(n, s)| (*n, s.as_str())));
        }
        Ok(table)
    }
}

fn presence_bit(bit: u32) -> Result<i16> {
    i16::try_from(bit)
        .map_err(|_| crate::status!(ErrorCode::InvalidDescriptor, "too many has-bits"))
}

fn set_sub_kind(table: &mut MiniTable, number: u32, sub: SubKind) {
    if let Some(index) = table.field_index(number) {
        let field = &mut table.fields[index];
        field.type_card = field.type_card.with_sub_kind(sub);
    }
}

fn validate_entry_field(spec: &FieldSpec, expected: u32) -> Result<()> {
    let name = if expected == 1 { "key" } else { "val" };
    if spec.number != expected {
        return Err(crate::status!(
            ErrorCode::InvalidDescriptor,
            "map {name} did not have expected number ({expected} vs {})",
            spec.number
        ));
    }
    if spec.repeated || matches!(spec.presence, Presence::Oneof(_)) {
        return Err(crate::status!(
            ErrorCode::InvalidDescriptor,
            "map {name} cannot be repeated or map, or be in oneof"
        ));
    }
    let bad = if expected == 1 {
        // Alternate bytes is a string, alternate int32 an open enum.
        match spec.field_type {
            FieldType::Float
            | FieldType::Double
            | FieldType::Message
            | FieldType::Group
            | FieldType::Enum => true,
            FieldType::Bytes => !spec.is_alternate(),
            FieldType::Int32 => spec.is_alternate(),
            _ => false,
        }
    } else {
        spec.field_type == FieldType::Group
    };
    if bad {
        return Err(crate::status!(
            ErrorCode::InvalidDescriptor,
            "map {name} cannot have type {:?}",
            spec.field_type
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(number: u32, field_type: FieldType) -> FieldSpec {
        FieldSpec::new(number, field_type, false)
    }

    #[test]
    fn required_fields_take_lowest_bits() {
        let mut b = MiniTableBuilder::new(TableKind::Message);
        b.fields.push(spec(1, FieldType::Int32));
        let mut req = spec(2, FieldType::Int64);
        req.presence = Presence::Required;
        b.fields.push(req);
        let t = b.build_owned().unwrap();
        assert_eq!(t.required_count(), 1);
        assert_eq!(t.find_field(2).unwrap().presence, (HEADER_SIZE * 8) as i16);
        assert_eq!(t.find_field(1).unwrap().presence, (HEADER_SIZE * 8) as i16 + 1);
    }

    #[test]
    fn slots_are_aligned_and_disjoint() {
        let mut b = MiniTableBuilder::new(TableKind::Message);
        b.fields.push(spec(1, FieldType::Bool));
        b.fields.push(spec(2, FieldType::Double));
        b.fields.push(spec(3, FieldType::String));
        b.fields.push(spec(4, FieldType::Int32));
        b.fields.push(FieldSpec::new(5, FieldType::Int32, true));
        let t = b.build_owned().unwrap();
        let mut ranges: Vec<(usize, usize)> = t
            .fields()
            .iter()
            .map(|f| {
                let size = if f.is_repeated() { 8 } else { f.rep().size() };
                assert_eq!(f.offset() % size.min(8), 0, "field {}", f.number());
                (f.offset(), f.offset() + size)
            })
            .collect();
        ranges.sort();
        assert!(ranges[0].0 >= HEADER_SIZE);
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
        assert_eq!(t.size() % 8, 0);
        assert!(ranges.last().unwrap().1 <= t.size());
    }

    #[test]
    fn oneof_members_share_storage() {
        let mut b = MiniTableBuilder::new(TableKind::Message);
        for (n, ty) in [(1, FieldType::Int32), (2, FieldType::String), (3, FieldType::Int64)] {
            let mut s = spec(n, ty);
            if n != 3 {
                s.presence = Presence::Oneof(0);
            }
            b.fields.push(s);
        }
        b.oneofs.push(vec![0, 1]);
        let t = b.build_owned().unwrap();
        let (a, s) = (t.find_field(1).unwrap(), t.find_field(2).unwrap());
        assert_eq!(a.offset(), s.offset());
        assert_eq!(a.presence, s.presence);
        assert!(a.oneof_case_offset().is_some());
        assert_eq!(a.card(), Cardinality::Oneof);
        assert_ne!(a.oneof_case_offset(), Some(t.find_field(3).unwrap().offset()));
    }

    #[test]
    fn map_entry_layout() {
        let mut b = MiniTableBuilder::new(TableKind::MapEntry);
        b.fields.push(spec(1, FieldType::Int32));
        b.fields.push(spec(2, FieldType::Message));
        let t = b.build_owned().unwrap();
        assert!(t.is_map_entry());
        assert_eq!(t.size(), MAP_ENTRY_SIZE as usize);
        assert_eq!(t.find_field(1).unwrap().offset(), MAP_KEY_OFFSET as usize);
        assert_eq!(t.find_field(2).unwrap().offset(), MAP_VALUE_OFFSET as usize);
        assert!(!t.find_field(2).unwrap().has_presence());

        let mut b = MiniTableBuilder::new(TableKind::MapEntry);
        b.fields.push(spec(1, FieldType::Double));
        b.fields.push(spec(2, FieldType::Int32));
        assert!(b.build_owned().is_err());
    }

    #[test]
    fn hints_reject_wrong_kinds() {
        let mut b = MiniTableBuilder::new(TableKind::Message);
        b.fields.push(spec(1, FieldType::Int32));
        b.fields.push(spec(2, FieldType::Message));
        let b = b.lazy(2).unwrap();
        assert!(b.inlined(1).is_err());
    }
}
