use core::fmt::Debug;
use core::mem;
use core::ptr::{self, NonNull};

use crate::arena::Arena;

const ARRAY_ALIGN: usize = 8;

/// Growable vector of fixed-width elements living in an arena.
///
/// The element width is fixed at creation and comes from the mini-table
/// (1, 4, 8 or 16 bytes). Growth doubles the capacity; old buffers are simply
/// left behind in the arena.
#[repr(C)]
pub struct Array {
    data: *mut u8,
    len: usize,
    cap: usize,
    elem_size: usize,
}

impl Array {
    pub(crate) const fn empty(elem_size: usize) -> Self {
        Array {
            data: ptr::null_mut(),
            len: 0,
            cap: 0,
            elem_size,
        }
    }

    /// Allocates an empty array header in `arena`.
    pub(crate) fn new_in(arena: &Arena<'_>, elem_size: usize, capacity: usize) -> Option<NonNull<Array>> {
        let header = arena.alloc::<Array>()?;
        let mut array = Array::empty(elem_size);
        if capacity > 0 && !array.reserve(arena, capacity) {
            return None;
        }
        unsafe { header.as_ptr().write(array) };
        Some(header)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Makes room for at least `min_cap` elements.
    pub(crate) fn reserve(&mut self, arena: &Arena<'_>, min_cap: usize) -> bool {
        if min_cap <= self.cap {
            return true;
        }
        let new_cap = min_cap.max(self.cap * 2).max(4);
        let Some(new_bytes) = new_cap.checked_mul(self.elem_size) else {
            return false;
        };
        let old_bytes = self.cap * self.elem_size;
        let data = match NonNull::new(self.data) {
            Some(old) => arena.realloc(old, old_bytes, new_bytes, ARRAY_ALIGN),
            None => arena.alloc_raw(new_bytes, ARRAY_ALIGN),
        };
        let Some(data) = data else {
            return false;
        };
        self.data = data.as_ptr();
        self.cap = new_cap;
        true
    }

    /// Resizes to `len` elements; new elements are zeroed.
    pub(crate) fn resize(&mut self, arena: &Arena<'_>, len: usize) -> bool {
        if !self.reserve(arena, len) {
            return false;
        }
        if len > self.len {
            unsafe {
                self.data
                    .add(self.len * self.elem_size)
                    .write_bytes(0, (len - self.len) * self.elem_size)
            };
        }
        self.len = len;
        true
    }

    #[inline]
    fn slot(&self, i: usize) -> *mut u8 {
        debug_assert!(i < self.cap);
        unsafe { self.data.add(i * self.elem_size) }
    }

    pub fn push<T: Copy>(&mut self, arena: &Arena<'_>, value: T) -> bool {
        assert_eq!(mem::size_of::<T>(), self.elem_size, "element width mismatch");
        if self.len == self.cap && !self.reserve(arena, self.len + 1) {
            return false;
        }
        unsafe { (self.slot(self.len) as *mut T).write_unaligned(value) };
        self.len += 1;
        true
    }

    pub fn get<T: Copy>(&self, i: usize) -> Option<T> {
        assert_eq!(mem::size_of::<T>(), self.elem_size, "element width mismatch");
        (i < self.len).then(|| unsafe { (self.slot(i) as *const T).read_unaligned() })
    }

    pub fn set<T: Copy>(&mut self, i: usize, value: T) -> bool {
        assert_eq!(mem::size_of::<T>(), self.elem_size, "element width mismatch");
        if i >= self.len {
            return false;
        }
        unsafe { (self.slot(i) as *mut T).write_unaligned(value) };
        true
    }

    /// Inserts `value` at `i`, shifting the tail up.
    pub(crate) fn insert<T: Copy>(&mut self, arena: &Arena<'_>, i: usize, value: T) -> bool {
        debug_assert!(i <= self.len);
        if !self.push(arena, value) {
            return false;
        }
        let tail = (self.len - 1 - i) * self.elem_size;
        unsafe {
            ptr::copy(self.slot(i), self.slot(i).add(self.elem_size), tail);
            (self.slot(i) as *mut T).write_unaligned(value);
        }
        true
    }

    pub(crate) fn remove(&mut self, i: usize) {
        debug_assert!(i < self.len);
        let tail = (self.len - 1 - i) * self.elem_size;
        unsafe { ptr::copy(self.slot(i).add(self.elem_size), self.slot(i), tail) };
        self.len -= 1;
    }

    /// Elements as a typed slice. The buffer is 8-byte aligned.
    pub fn as_slice<T: Copy>(&self) -> &[T] {
        assert_eq!(mem::size_of::<T>(), self.elem_size, "element width mismatch");
        if self.len == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.data as *const T, self.len) }
    }

    pub(crate) fn as_mut_slice<T: Copy>(&mut self) -> &mut [T] {
        assert_eq!(mem::size_of::<T>(), self.elem_size, "element width mismatch");
        if self.len == 0 {
            return &mut [];
        }
        unsafe { core::slice::from_raw_parts_mut(self.data as *mut T, self.len) }
    }

    /// The raw element bytes.
    pub fn as_bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.data, self.len * self.elem_size) }
    }

    pub(crate) fn extend_from_bytes(&mut self, arena: &Arena<'_>, bytes: &[u8]) -> bool {
        debug_assert_eq!(bytes.len() % self.elem_size, 0);
        let n = bytes.len() / self.elem_size;
        if !self.reserve(arena, self.len + n) {
            return false;
        }
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.slot(self.len), bytes.len()) };
        self.len += n;
        true
    }

    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Debug for Array {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Array")
            .field("len", &self.len)
            .field("elem_size", &self.elem_size)
            .finish()
    }
}

/// Pointer and length of string or bytes data owned by an arena (or, when
/// aliasing, by the parse input).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StringView {
    ptr: *const u8,
    len: usize,
}

impl StringView {
    pub const EMPTY: StringView = StringView {
        ptr: ptr::null(),
        len: 0,
    };

    #[inline]
    pub(crate) fn from_raw(ptr: *const u8, len: usize) -> Self {
        StringView { ptr, len }
    }

    /// Copies `bytes` into `arena`.
    pub(crate) fn copy_in(arena: &Arena<'_>, bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return Some(StringView::EMPTY);
        }
        let ptr = arena.copy_bytes(bytes)?;
        Some(StringView::from_raw(ptr.as_ptr(), bytes.len()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The memory the view points to must outlive `'b`.
    #[inline]
    pub(crate) unsafe fn as_bytes<'b>(self) -> &'b [u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }
}

const INLINE_CAPACITY: usize = 15;
const OUT_OF_LINE: u8 = 0x80;

/// String storage that keeps up to 15 bytes inside the message itself.
///
/// Inline: bytes in `[0..len]`, length in byte 15. Out of line: pointer in
/// `[0..8]`, `u32` length in `[8..12]`, byte 15 is `0x80`.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct InlineString([u8; 16]);

impl InlineString {
    pub(crate) fn new(arena: &Arena<'_>, bytes: &[u8], alias: bool) -> Option<Self> {
        let mut raw = [0u8; 16];
        if bytes.len() <= INLINE_CAPACITY {
            raw[..bytes.len()].copy_from_slice(bytes);
            raw[15] = bytes.len() as u8;
            return Some(InlineString(raw));
        }
        let len = u32::try_from(bytes.len()).ok()?;
        let ptr = if alias {
            bytes.as_ptr()
        } else {
            arena.copy_bytes(bytes)?.as_ptr() as *const u8
        };
        raw[..8].copy_from_slice(&(ptr as u64).to_le_bytes());
        raw[8..12].copy_from_slice(&len.to_le_bytes());
        raw[15] = OUT_OF_LINE;
        Some(InlineString(raw))
    }

    #[inline]
    pub fn is_inline(&self) -> bool {
        self.0[15] & OUT_OF_LINE == 0
    }

    /// # Safety
    ///
    /// Out-of-line data must outlive `'b`.
    pub(crate) unsafe fn as_bytes<'b>(&'b self) -> &'b [u8] {
        if self.is_inline() {
            let len = (self.0[15] as usize).min(INLINE_CAPACITY);
            return &self.0[..len];
        }
        let mut ptr = [0u8; 8];
        ptr.copy_from_slice(&self.0[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.0[8..12]);
        let ptr = u64::from_le_bytes(ptr) as usize as *const u8;
        unsafe { core::slice::from_raw_parts(ptr, u32::from_le_bytes(len) as usize) }
    }
}
