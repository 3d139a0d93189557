//! Arena hash map backing map fields.
//!
//! Keys and values are kept in the same 16-byte slot encoding a map entry
//! message uses at its key and value offsets, so decoded entries move into the
//! map by copying slots. Entries live in insertion order in one array; a
//! power-of-two index of `u32` positions (0 = empty) finds them by hash.
//! Deleted entries stay behind as tombstones until the next rehash.

use core::cmp::Ordering;
use core::ptr::NonNull;
use std::sync::OnceLock;

use crate::arena::Arena;
use crate::containers::{Array, StringView};
use crate::status::{Result, Status};
use crate::tables::{FieldRep, FieldType};

pub(crate) type Slot = [u64; 2];

#[repr(C)]
#[derive(Clone, Copy)]
struct Entry {
    key: Slot,
    value: Slot,
    hash: u64,
    live: u64,
}

const ENTRY_SIZE: usize = core::mem::size_of::<Entry>();
const MIN_INDEX: usize = 8;

fn hasher() -> &'static ahash::RandomState {
    static STATE: OnceLock<ahash::RandomState> = OnceLock::new();
    STATE.get_or_init(|| {
        ahash::RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        )
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapInsert {
    Inserted,
    Replaced,
}

/// Iteration token. Survives insertions and deletions that do not rehash.
#[derive(Clone, Copy, Debug)]
pub struct MapIter {
    pos: usize,
    version: u32,
}

#[repr(C)]
pub struct Map {
    entries: Array,
    index: Array,
    live: usize,
    version: u32,
    key_type: FieldType,
    value_type: FieldType,
}

impl Map {
    pub(crate) fn new_in(arena: &Arena<'_>, key_type: FieldType, value_type: FieldType) -> Option<NonNull<Map>> {
        let map = arena.alloc::<Map>()?;
        unsafe {
            map.as_ptr().write(Map {
                entries: Array::empty(ENTRY_SIZE),
                index: Array::empty(4),
                live: 0,
                version: 0,
                key_type,
                value_type,
            })
        };
        Some(map)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn key_type(&self) -> FieldType {
        self.key_type
    }

    pub fn value_type(&self) -> FieldType {
        self.value_type
    }

    fn string_keys(&self) -> bool {
        matches!(self.key_type.scalar_rep(), FieldRep::String | FieldRep::Bytes)
    }

    fn key_bytes<'b>(&self, key: &'b Slot) -> &'b [u8] {
        if self.string_keys() {
            let view: StringView = unsafe { core::ptr::read_unaligned(key.as_ptr() as *const StringView) };
            unsafe { view.as_bytes() }
        } else {
            let bytes: &[u8; 16] = unsafe { &*(key as *const Slot as *const [u8; 16]) };
            &bytes[..8]
        }
    }

    fn hash(&self, key: &Slot) -> u64 {
        hasher().hash_one(self.key_bytes(key))
    }

    fn entry(&self, pos: usize) -> Entry {
        self.entries.as_slice::<Entry>()[pos]
    }

    fn find(&self, key: &Slot, hash: u64) -> Option<usize> {
        let slots = self.index.as_slice::<u32>();
        if slots.is_empty() {
            return None;
        }
        let mask = slots.len() - 1;
        let mut i = hash as usize & mask;
        loop {
            let pos = slots[i] as usize;
            if pos == 0 {
                return None;
            }
            let entry = self.entry(pos - 1);
            if entry.live != 0 && entry.hash == hash && self.key_bytes(&entry.key) == self.key_bytes(key) {
                return Some(pos - 1);
            }
            i = (i + 1) & mask;
        }
    }

    pub(crate) fn get(&self, key: &Slot) -> Option<Slot> {
        self.find(key, self.hash(key)).map(|pos| self.entry(pos).value)
    }

    /// Inserts or replaces the value for `key`.
    pub(crate) fn insert(&mut self, arena: &Arena<'_>, key: Slot, value: Slot) -> Result<MapInsert> {
        let hash = self.hash(&key);
        if let Some(pos) = self.find(&key, hash) {
            self.entries.as_mut_slice::<Entry>()[pos].value = value;
            return Ok(MapInsert::Replaced);
        }
        if (self.entries.len() + 1) * 4 > self.index.len() * 3 {
            self.rehash(arena)?;
        }
        let pos = self.entries.len();
        let entry = Entry {
            key,
            value,
            hash,
            live: 1,
        };
        if !self.entries.push(arena, entry) {
            return Err(Status::out_of_memory());
        }
        self.place(hash, pos as u32 + 1);
        self.live += 1;
        Ok(MapInsert::Inserted)
    }

    fn place(&mut self, hash: u64, pos: u32) {
        let slots = self.index.as_mut_slice::<u32>();
        let mask = slots.len() - 1;
        let mut i = hash as usize & mask;
        while slots[i] != 0 {
            i = (i + 1) & mask;
        }
        slots[i] = pos;
    }

    // Drops tombstones and rebuilds the index for the live entries. Bumps the
    // version, which invalidates outstanding iterators.
    fn rehash(&mut self, arena: &Arena<'_>) -> Result<()> {
        let capacity = ((self.live + 1) * 2).next_power_of_two().max(MIN_INDEX);
        let mut entries = Array::empty(ENTRY_SIZE);
        if !entries.reserve(arena, capacity * 3 / 4) {
            return Err(Status::out_of_memory());
        }
        for entry in self.entries.as_slice::<Entry>() {
            if entry.live != 0 {
                entries.push(arena, *entry);
            }
        }
        let mut index = Array::empty(4);
        if !index.resize(arena, capacity) {
            return Err(Status::out_of_memory());
        }
        self.entries = entries;
        self.index = index;
        let hashes: Vec<u64> = self.entries.as_slice::<Entry>().iter().map(|e| e.hash).collect();
        for (pos, hash) in hashes.into_iter().enumerate() {
            self.place(hash, pos as u32 + 1);
        }
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    pub(crate) fn delete(&mut self, key: &Slot) -> Option<Slot> {
        let pos = self.find(key, self.hash(key))?;
        let entry = &mut self.entries.as_mut_slice::<Entry>()[pos];
        entry.live = 0;
        self.live -= 1;
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        for slot in self.index.as_mut_slice::<u32>() {
            *slot = 0;
        }
        self.live = 0;
    }

    pub fn begin(&self) -> MapIter {
        MapIter {
            pos: 0,
            version: self.version,
        }
    }

    /// Advances `iter` to the next live entry.
    ///
    /// # Panics
    ///
    /// When the map was rehashed after `iter` was created.
    pub(crate) fn next(&self, iter: &mut MapIter) -> Option<(Slot, Slot)> {
        assert_eq!(iter.version, self.version, "map rehashed during iteration");
        let entries = self.entries.as_slice::<Entry>();
        while iter.pos < entries.len() {
            let entry = entries[iter.pos];
            iter.pos += 1;
            if entry.live != 0 {
                return Some((entry.key, entry.value));
            }
        }
        None
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Slot, Slot)> + '_ {
        self.entries
            .as_slice::<Entry>()
            .iter()
            .filter(|e| e.live != 0)
            .map(|e| (e.key, e.value))
    }

    /// Live entries ordered by key: bytewise for strings, numerically for
    /// integers.
    pub(crate) fn sorted(&self) -> Vec<(Slot, Slot)> {
        let mut entries: Vec<(Slot, Slot)> = self.iter().collect();
        entries.sort_by(|a, b| self.compare_keys(&a.0, &b.0));
        entries
    }

    fn compare_keys(&self, a: &Slot, b: &Slot) -> Ordering {
        let signed = self.key_type.is_signed();
        match self.key_type.scalar_rep() {
            FieldRep::String | FieldRep::Bytes => self.key_bytes(a).cmp(self.key_bytes(b)),
            FieldRep::Fixed8 => (a[0] as u8).cmp(&(b[0] as u8)),
            FieldRep::Fixed64 if signed => (a[0] as i64).cmp(&(b[0] as i64)),
            FieldRep::Fixed64 => a[0].cmp(&b[0]),
            _ if signed => (a[0] as u32 as i32).cmp(&(b[0] as u32 as i32)),
            _ => (a[0] as u32).cmp(&(b[0] as u32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_key(v: i32) -> Slot {
        [v as u32 as u64, 0]
    }

    fn new_map(arena: &Arena<'_>, key: FieldType) -> &'static mut Map {
        unsafe { &mut *Map::new_in(arena, key, FieldType::Int32).unwrap().as_ptr() }
    }

    #[test]
    fn insert_replace_delete() {
        let arena = Arena::new();
        let map = new_map(&arena, FieldType::Int32);
        assert_eq!(map.insert(&arena, int_key(1), [10, 0]), Ok(MapInsert::Inserted));
        assert_eq!(map.insert(&arena, int_key(2), [20, 0]), Ok(MapInsert::Inserted));
        assert_eq!(map.insert(&arena, int_key(1), [11, 0]), Ok(MapInsert::Replaced));
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&int_key(1)), Some([11, 0]));
        assert_eq!(map.delete(&int_key(1)), Some([11, 0]));
        assert_eq!(map.get(&int_key(1)), None);
        assert_eq!(map.delete(&int_key(1)), None);
        assert_eq!(map.len(), 1);
        assert_eq!(map.insert(&arena, int_key(1), [12, 0]), Ok(MapInsert::Inserted));
        assert_eq!(map.get(&int_key(1)), Some([12, 0]));
    }

    #[test]
    fn many_entries_survive_rehash() {
        let arena = Arena::new();
        let map = new_map(&arena, FieldType::Int64);
        for i in 0..1000u64 {
            map.insert(&arena, [i, 0], [i * 2, 0]).unwrap();
        }
        for i in (0..1000u64).step_by(2) {
            map.delete(&[i, 0]);
        }
        assert_eq!(map.len(), 500);
        for i in 0..1000u64 {
            assert_eq!(map.get(&[i, 0]).is_some(), i % 2 == 1, "key {i}");
        }
    }

    #[test]
    fn string_keys_compare_by_content() {
        let arena = Arena::new();
        let map = new_map(&arena, FieldType::String);
        let key = |s: &[u8]| -> Slot {
            let view = StringView::copy_in(&arena, s).unwrap();
            unsafe { core::mem::transmute::<StringView, Slot>(view) }
        };
        map.insert(&arena, key(b"b"), [2, 0]).unwrap();
        map.insert(&arena, key(b"a"), [1, 0]).unwrap();
        assert_eq!(map.get(&key(b"a")), Some([1, 0]));
        let order: Vec<u64> = map.sorted().iter().map(|(_, v)| v[0]).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn sorted_orders_signed_keys() {
        let arena = Arena::new();
        let map = new_map(&arena, FieldType::SInt32);
        for k in [3, -1, 2, -7] {
            map.insert(&arena, int_key(k), [k as u64, 0]).unwrap();
        }
        let keys: Vec<i32> = map.sorted().iter().map(|(k, _)| k[0] as u32 as i32).collect();
        assert_eq!(keys, vec![-7, -1, 2, 3]);
    }

    #[test]
    fn iteration_survives_non_growing_mutation() {
        let arena = Arena::new();
        let map = new_map(&arena, FieldType::Int32);
        for k in 1..=3 {
            map.insert(&arena, int_key(k), [0, 0]).unwrap();
        }
        let mut iter = map.begin();
        assert!(map.next(&mut iter).is_some());
        map.delete(&int_key(2));
        map.insert(&arena, int_key(1), [5, 0]).unwrap();
        let rest: Vec<_> = core::iter::from_fn(|| map.next(&mut iter)).collect();
        assert_eq!(rest.len(), 1);
    }

    #[test]
    #[should_panic(expected = "map rehashed during iteration")]
    fn rehash_invalidates_iterators() {
        let arena = Arena::new();
        let map = new_map(&arena, FieldType::Int32);
        map.insert(&arena, int_key(0), [0, 0]).unwrap();
        let mut iter = map.begin();
        for k in 1..100 {
            map.insert(&arena, int_key(k), [0, 0]).unwrap();
        }
        map.next(&mut iter);
    }
}
