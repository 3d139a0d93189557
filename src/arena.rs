use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::alloc::Layout;
use std::sync::OnceLock;

use tracing::{debug, trace};

use crate::options::ArenaConfig;

// Arena allocates memory for messages, arrays, maps and strings, which is then
// freed all at once. Allocation takes `&self` so that a message handle can keep
// a shared reference to its arena while still growing its containers. An arena
// is not thread safe; two threads may use two distinct arenas.
//
// Arenas can be fused. Fused arenas form a union-find tree whose root holds the
// reference count of the whole group; memory of any member is only returned to
// the block allocator once every handle in the group has been dropped.
pub struct Arena<'a> {
    cursor: Cell<*mut u8>,
    end: Cell<*mut u8>,
    state: NonNull<ArenaState>,
    _initial: PhantomData<&'a mut [u8]>,
}

/// Process-wide block allocator: `(old_ptr, old_size, new_size) -> new_ptr`.
///
/// A null `old_ptr` requests a fresh block, `new_size == 0` frees `old_ptr`.
/// Returned blocks must be aligned to 16 bytes. Returning null signals
/// exhaustion, which surfaces as an out-of-memory status.
pub type BlockAllocFn = fn(*mut u8, usize, usize) -> *mut u8;

const BLOCK_ALIGN: usize = 16;

static BLOCK_ALLOC: OnceLock<BlockAllocFn> = OnceLock::new();

/// Registers the block allocator used by arenas created afterwards. Only the
/// first registration takes effect.
pub fn set_block_allocator(alloc: BlockAllocFn) -> bool {
    BLOCK_ALLOC.set(alloc).is_ok()
}

fn block_allocator() -> BlockAllocFn {
    BLOCK_ALLOC.get().copied().unwrap_or(system_block_alloc)
}

fn system_block_alloc(old: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    unsafe {
        if new_size == 0 {
            if !old.is_null() {
                std::alloc::dealloc(old, Layout::from_size_align_unchecked(old_size, BLOCK_ALIGN));
            }
            return ptr::null_mut();
        }
        let Ok(layout) = Layout::from_size_align(new_size, BLOCK_ALIGN) else {
            return ptr::null_mut();
        };
        if old.is_null() {
            std::alloc::alloc(layout)
        } else {
            std::alloc::realloc(
                old,
                Layout::from_size_align_unchecked(old_size, BLOCK_ALIGN),
                new_size,
            )
        }
    }
}

// Mem block is a block of contiguous memory allocated from the block allocator.
// Cleanup records are stacked downwards from the end of the block.
#[repr(C)]
struct MemBlock {
    next: *mut MemBlock,
    size: usize,
    cleanups: usize,
}

const BLOCK_HEADER: usize = align_up(core::mem::size_of::<MemBlock>(), BLOCK_ALIGN);

#[repr(C)]
struct Cleanup {
    data: *mut u8,
    func: unsafe fn(*mut u8),
}

const CLEANUP_SIZE: usize = core::mem::size_of::<Cleanup>();

// Allocations at least this much smaller than the remaining space get a
// dedicated block so the current block keeps serving small requests.
const SIGNIFICANT_SPACE_THRESHOLD: usize = 512;

struct ArenaState {
    // Tagged: low bit set means `count << 1 | 1` (this is a root), otherwise a
    // pointer to the parent state.
    parent_or_count: AtomicUsize,
    // Singly linked list of fused members, only meaningful from the root.
    next: AtomicPtr<ArenaState>,
    tail: AtomicPtr<ArenaState>,
    blocks: Cell<*mut MemBlock>,
    current: Cell<*mut MemBlock>,
    initial: *mut MemBlock,
    last_block_size: Cell<usize>,
    config: ArenaConfig,
    alloc: BlockAllocFn,
}

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[inline]
fn is_count(tagged: usize) -> bool {
    tagged & 1 == 1
}

#[inline]
fn ref_count(tagged: usize) -> usize {
    tagged >> 1
}

#[inline]
fn tagged_count(count: usize) -> usize {
    (count << 1) | 1
}

impl Arena<'static> {
    /// Creates an empty arena drawing blocks from the registered allocator.
    pub fn new() -> Self {
        Self::with_config(ArenaConfig::default())
    }

    pub fn with_config(config: ArenaConfig) -> Self {
        Self::with_allocator(config, block_allocator())
    }

    /// Creates an arena with its own block allocator, bypassing the process
    /// registration.
    pub fn with_allocator(config: ArenaConfig, alloc: BlockAllocFn) -> Self {
        Arena::from_state(ArenaState::new(config, alloc, ptr::null_mut()), ptr::null_mut(), ptr::null_mut())
    }
}

impl Default for Arena<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Arena<'a> {
    /// Creates an arena that serves allocations from `buffer` first. The buffer
    /// stays owned by the caller, so such an arena refuses to fuse.
    pub fn with_initial_block(buffer: &'a mut [u8]) -> Self {
        let config = ArenaConfig::default();
        let start = buffer.as_mut_ptr();
        let addr = start as usize;
        let aligned = align_up(addr, BLOCK_ALIGN);
        let usable = (addr + buffer.len()).saturating_sub(aligned) & !(BLOCK_ALIGN - 1);
        if usable < BLOCK_HEADER + BLOCK_ALIGN {
            let state = ArenaState::new(config, block_allocator(), ptr::null_mut());
            // Too small to carry a header; still owned by the caller.
            unsafe { (*state.as_ptr()).initial = NonNull::<MemBlock>::dangling().as_ptr() };
            return Arena::from_state(state, ptr::null_mut(), ptr::null_mut());
        }
        unsafe {
            let block = start.add(aligned - addr) as *mut MemBlock;
            block.write(MemBlock {
                next: ptr::null_mut(),
                size: usable,
                cleanups: 0,
            });
            let state = ArenaState::new(config, block_allocator(), block);
            (*state.as_ptr()).blocks.set(block);
            (*state.as_ptr()).current.set(block);
            let cursor = (block as *mut u8).add(BLOCK_HEADER);
            let end = (block as *mut u8).add(usable);
            Arena::from_state(state, cursor, end)
        }
    }

    fn from_state(state: NonNull<ArenaState>, cursor: *mut u8, end: *mut u8) -> Self {
        Arena {
            cursor: Cell::new(cursor),
            end: Cell::new(end),
            state,
            _initial: PhantomData,
        }
    }

    #[inline]
    fn state(&self) -> &ArenaState {
        unsafe { self.state.as_ref() }
    }

    /// Allocate uninitialized memory for type T
    pub fn alloc<T>(&self) -> Option<NonNull<T>> {
        let layout = Layout::new::<T>();
        self.alloc_raw(layout.size(), layout.align()).map(NonNull::cast)
    }

    /// Allocate zeroed memory with given size and alignment
    pub fn alloc_zeroed(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc_raw(size, align)?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Some(ptr)
    }

    /// Copies `bytes` into arena memory.
    pub fn copy_bytes(&self, bytes: &[u8]) -> Option<NonNull<u8>> {
        let ptr = self.alloc_raw(bytes.len(), 1)?;
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Some(ptr)
    }

    /// Allocate raw memory with given size and alignment (uninitialized).
    /// Returns `None` without touching the arena when the block allocator fails.
    #[inline]
    pub fn alloc_raw(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let cursor = self.cursor.get();
        if !cursor.is_null() {
            let cursor_addr = cursor as usize;
            let aligned_addr = align_up(cursor_addr, align);
            let end_addr = self.end.get() as usize;
            if aligned_addr <= end_addr && end_addr - aligned_addr >= size {
                let aligned = cursor.wrapping_add(aligned_addr - cursor_addr);
                self.cursor.set(aligned.wrapping_add(size));
                return NonNull::new(aligned);
            }
        }
        self.alloc_outlined(size, align)
    }

    /// Resizes an allocation. The region grows or shrinks in place when it is
    /// the most recent allocation of this arena, otherwise the contents are
    /// copied into a fresh region.
    pub fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        let p = ptr.as_ptr();
        if p.wrapping_add(old_size) == self.cursor.get() {
            let end_addr = self.end.get() as usize;
            if new_size <= old_size || end_addr - (p as usize) >= new_size {
                self.cursor.set(p.wrapping_add(new_size));
                return Some(ptr);
            }
        } else if new_size <= old_size {
            return Some(ptr);
        }
        let new_ptr = self.alloc_raw(new_size, align)?;
        unsafe { ptr::copy_nonoverlapping(p, new_ptr.as_ptr(), old_size.min(new_size)) };
        Some(new_ptr)
    }

    /// Returns the tail of the most recent allocation to the arena.
    pub fn shrink_last(&self, ptr: NonNull<u8>, old_size: usize, new_size: usize) {
        let p = ptr.as_ptr();
        if new_size <= old_size && p.wrapping_add(old_size) == self.cursor.get() {
            self.cursor.set(p.wrapping_add(new_size));
        }
    }

    /// Runs `func(data)` when the arena group is released, before its blocks
    /// are freed.
    pub fn register_cleanup(&self, data: *mut u8, func: unsafe fn(*mut u8)) -> bool {
        let cursor = self.cursor.get();
        if cursor.is_null() || (self.end.get() as usize) - (cursor as usize) < CLEANUP_SIZE {
            if !self.allocate_new_block(CLEANUP_SIZE) {
                return false;
            }
        }
        let state = self.state();
        let block = state.current.get();
        let end = self.end.get().wrapping_sub(CLEANUP_SIZE);
        unsafe {
            (end as *mut Cleanup).write(Cleanup { data, func });
            (*block).cleanups += 1;
        }
        self.end.set(end);
        true
    }

    /// Bytes obtained from the block allocator by every arena fused with this one.
    pub fn space_allocated(&self) -> usize {
        let mut total = 0;
        unsafe {
            let (root, _) = find_root(self.state.as_ptr());
            let mut member = root;
            while !member.is_null() {
                let mut block = (*member).blocks.get();
                while !block.is_null() {
                    if block != (*member).initial {
                        total += (*block).size;
                    }
                    block = (*block).next;
                }
                member = (*member).next.load(Ordering::Acquire);
            }
        }
        total
    }

    /// Fuses the lifetimes of two arenas. Memory of either arena stays valid
    /// until both (and everything fused to them) have been dropped.
    ///
    /// Arenas that were given an initial block by the caller, or that use
    /// different block allocators, refuse to fuse; no state changes then.
    pub fn fuse(&self, other: &Arena<'_>) -> bool {
        let a = self.state.as_ptr();
        let b = other.state.as_ptr();
        if a == b {
            return true;
        }
        unsafe {
            if !(*a).initial.is_null() || !(*b).initial.is_null() {
                debug!("arena fuse refused: initial block");
                return false;
            }
            if (*a).alloc as usize != (*b).alloc as usize {
                debug!("arena fuse refused: different block allocators");
                return false;
            }
            let mut ref_delta = 0usize;
            loop {
                let (mut r1, mut c1) = find_root(a);
                let (mut r2, mut c2) = find_root(b);
                if r1 == r2 {
                    fixup_refs(r1, ref_delta);
                    return true;
                }
                // Union by reference count, ties broken by address so two
                // racing fuses pick the same root.
                if ref_count(c2) > ref_count(c1) || (ref_count(c2) == ref_count(c1) && r2 < r1) {
                    core::mem::swap(&mut r1, &mut r2);
                    core::mem::swap(&mut c1, &mut c2);
                }
                let r2_refs = c2 & !1;
                if (*r1)
                    .parent_or_count
                    .compare_exchange(c1, c1 + r2_refs, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                if (*r2)
                    .parent_or_count
                    .compare_exchange(c2, r1 as usize, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    ref_delta += r2_refs;
                    continue;
                }
                let tail = (*r1).tail.load(Ordering::Acquire);
                (*tail).next.store(r2, Ordering::Release);
                (*r1).tail.store((*r2).tail.load(Ordering::Acquire), Ordering::Release);
                fixup_refs(r1, ref_delta);
                debug!(refs = ref_count(c1 + r2_refs), "arenas fused");
                return true;
            }
        }
    }

    /// Whether both arenas belong to the same fused group.
    pub fn is_fused(&self, other: &Arena<'_>) -> bool {
        unsafe { find_root(self.state.as_ptr()).0 == find_root(other.state.as_ptr()).0 }
    }

    /// Number of live handles keeping this arena group alive.
    pub fn ref_count(&self) -> usize {
        unsafe { ref_count(find_root(self.state.as_ptr()).1) }
    }

    #[cold]
    #[inline(never)]
    fn alloc_outlined(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let cursor = self.cursor.get();
        let available = if cursor.is_null() {
            0
        } else {
            (self.end.get() as usize).saturating_sub(cursor as usize)
        };
        if available >= SIGNIFICANT_SPACE_THRESHOLD {
            // Significant free space left, which implies this is a large
            // allocation. Give it a block of its own and keep the current one.
            return self.alloc_dedicated(size, align);
        }
        if !self.allocate_new_block(size + align) {
            return None;
        }
        self.alloc_raw(size, align)
    }

    fn new_block(&self, size: usize) -> *mut MemBlock {
        let state = self.state();
        let ptr = (state.alloc)(ptr::null_mut(), 0, size) as *mut MemBlock;
        if ptr.is_null() {
            return ptr;
        }
        unsafe {
            ptr.write(MemBlock {
                next: state.blocks.get(),
                size,
                cleanups: 0,
            });
        }
        state.blocks.set(ptr);
        ptr
    }

    // Blocks grow geometrically up to the configured maximum, but are always
    // large enough for the request that triggered them.
    fn allocate_new_block(&self, request: usize) -> bool {
        let state = self.state();
        let last = state.last_block_size.get();
        let growth = if last == 0 {
            state.config.initial_block_size
        } else {
            (last * 2).min(state.config.max_block_size)
        };
        let Some(needed) = request.checked_add(BLOCK_HEADER + BLOCK_ALIGN) else {
            return false;
        };
        let size = align_up(needed.max(growth), BLOCK_ALIGN);
        let block = self.new_block(size);
        if block.is_null() {
            return false;
        }
        trace!(size, "arena block allocated");
        state.current.set(block);
        state.last_block_size.set(size);
        unsafe {
            self.cursor.set((block as *mut u8).add(BLOCK_HEADER));
            self.end.set((block as *mut u8).add(size));
        }
        true
    }

    fn alloc_dedicated(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let total = size.checked_add(BLOCK_HEADER + align)?;
        let block = self.new_block(align_up(total, BLOCK_ALIGN));
        if block.is_null() {
            return None;
        }
        trace!(size, "arena dedicated block allocated");
        let data = unsafe { (block as *mut u8).add(BLOCK_HEADER) };
        let offset = align_up(data as usize, align) - data as usize;
        NonNull::new(data.wrapping_add(offset))
    }
}

impl ArenaState {
    fn new(config: ArenaConfig, alloc: BlockAllocFn, initial: *mut MemBlock) -> NonNull<ArenaState> {
        let state = Box::new(ArenaState {
            parent_or_count: AtomicUsize::new(tagged_count(1)),
            next: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            blocks: Cell::new(ptr::null_mut()),
            current: Cell::new(ptr::null_mut()),
            initial,
            last_block_size: Cell::new(0),
            config,
            alloc,
        });
        let ptr = NonNull::from(Box::leak(state));
        unsafe { (*ptr.as_ptr()).tail.store(ptr.as_ptr(), Ordering::Relaxed) };
        ptr
    }
}

// Walks to the root, splitting the path so later walks are shorter.
unsafe fn find_root(mut state: *mut ArenaState) -> (*mut ArenaState, usize) {
    unsafe {
        let mut poc = (*state).parent_or_count.load(Ordering::Acquire);
        while !is_count(poc) {
            let next = poc as *mut ArenaState;
            let next_poc = (*next).parent_or_count.load(Ordering::Acquire);
            if !is_count(next_poc) {
                (*state).parent_or_count.store(next_poc, Ordering::Release);
            }
            state = next;
            poc = next_poc;
        }
        (state, poc)
    }
}

unsafe fn fixup_refs(mut root: *mut ArenaState, delta: usize) {
    if delta == 0 {
        return;
    }
    unsafe {
        loop {
            let (r, poc) = find_root(root);
            if (*r)
                .parent_or_count
                .compare_exchange(poc, poc - delta, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            root = r;
        }
    }
}

unsafe fn free_group(root: *mut ArenaState) {
    unsafe {
        let mut member = root;
        while !member.is_null() {
            let mut block = (*member).blocks.get();
            while !block.is_null() {
                let top = (block as *mut u8).add((*block).size) as *mut Cleanup;
                for i in 1..=(*block).cleanups {
                    let cleanup = top.sub(i).read();
                    (cleanup.func)(cleanup.data);
                }
                block = (*block).next;
            }
            member = (*member).next.load(Ordering::Acquire);
        }
        let mut member = root;
        let mut freed = 0usize;
        while !member.is_null() {
            let next = (*member).next.load(Ordering::Acquire);
            let mut block = (*member).blocks.get();
            while !block.is_null() {
                let next_block = (*block).next;
                if block != (*member).initial {
                    freed += (*block).size;
                    ((*member).alloc)(block as *mut u8, (*block).size, 0);
                }
                block = next_block;
            }
            drop(Box::from_raw(member));
            member = next;
        }
        trace!(freed, "arena group released");
    }
}

impl Drop for Arena<'_> {
    fn drop(&mut self) {
        unsafe {
            let state = self.state.as_ptr();
            loop {
                let (root, poc) = find_root(state);
                if ref_count(poc) == 1 {
                    free_group(root);
                    return;
                }
                if (*root)
                    .parent_or_count
                    .compare_exchange(poc, poc - 2, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            }
        }
    }
}

// Safety: the arena owns its state; moving the handle to another thread is
// fine, sharing it is not (allocation mutates through `Cell`).
unsafe impl Send for Arena<'_> {}
