//! Per-block slab metadata and the packed atomic state word.
//!
//! Every backing block starts with a [SlabHeader]; objects are laid out
//! after it. The header is out-of-band with respect to object payload: the
//! allocator never stores bookkeeping inside payload bytes it has handed
//! out. Free objects, however, *are* dead payload, and the index of the
//! next free object is threaded through them (an intrusive free list).
//!
//! All mutable per-slab state lives in one `AtomicU64`:
//!
//! ```text
//! [ generation:23 | frozen:1 | in_use:16 | free_head:24 ]
//! ```
//!
//! Packing the free-list head together with the counters lets a single
//! compare-and-swap update both, which is what makes a foreign core's free
//! lock-free with respect to the owning core's fast path. The free-list
//! head is a compact object index rather than a pointer so the whole unit
//! fits in a word; the generation counter increments on every successful
//! CAS and defeats ABA on the intrusive stack.

use std::{
    mem::{self, size_of},
    ptr::{self, NonNull},
    sync::atomic::Ordering,
};

use crate::{
    loom_testing::*,
    page_provider::{block_size, BackingBlock, NodeId, MAX_ORDER, SLAB_ALIGN},
    util::roundto,
};

/// Intrusive free-list link, stored inside free-object payload
type LinkWord = AtomicU32;
const LINK_SZ: usize = size_of::<LinkWord>();
const LINK_ALIGN: usize = mem::align_of::<LinkWord>();

/// Sentinel index meaning "no free object"
pub(crate) const HEAD_NONE: u32 = 0xFF_FFFF;
const HEAD_MASK: u64 = 0xFF_FFFF;
const IN_USE_SHIFT: u32 = 24;
const IN_USE_MASK: u64 = 0xFFFF << IN_USE_SHIFT;
const FROZEN_BIT: u64 = 1 << 40;
const GEN_SHIFT: u32 = 41;
const GEN_MASK: u64 = (1 << 23) - 1;

/// Hard cap on objects per slab (in_use is a 16-bit field)
pub(crate) const MAX_OBJECTS_PER_SLAB: u32 = 0xFFFF;

/// Written to [SlabHeader::magic]; checked on every pointer→metadata
/// resolution so that frees of unrecognized pointers are caught
const SLAB_MAGIC: u64 = 0x51AB_CAC4_E0B1_EC75;

/// One decoded snapshot of a slab's packed state word
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlabState(u64);

impl SlabState {
    pub(crate) fn pack(generation: u64, frozen: bool, in_use: u32, free_head: u32) -> Self {
        debug_assert!(in_use <= MAX_OBJECTS_PER_SLAB);
        debug_assert!(free_head <= HEAD_NONE);
        let mut x = ((generation & GEN_MASK) << GEN_SHIFT)
            | ((in_use as u64) << IN_USE_SHIFT)
            | (free_head as u64);
        if frozen {
            x |= FROZEN_BIT;
        }
        Self(x)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    pub(crate) fn generation(self) -> u64 {
        (self.0 >> GEN_SHIFT) & GEN_MASK
    }

    pub(crate) fn frozen(self) -> bool {
        self.0 & FROZEN_BIT != 0
    }

    pub(crate) fn in_use(self) -> u32 {
        ((self.0 & IN_USE_MASK) >> IN_USE_SHIFT) as u32
    }

    pub(crate) fn free_head(self) -> Option<u32> {
        let head = (self.0 & HEAD_MASK) as u32;
        if head == HEAD_NONE {
            None
        } else {
            Some(head)
        }
    }

    pub(crate) fn next_generation(self) -> u64 {
        (self.generation() + 1) & GEN_MASK
    }
}

impl std::fmt::Debug for SlabState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabState")
            .field("generation", &self.generation())
            .field("frozen", &self.frozen())
            .field("in_use", &self.in_use())
            .field("free_head", &self.free_head())
            .finish()
    }
}

/// What a successful free-list push observed
#[derive(Clone, Copy, Debug)]
pub(crate) struct PushOutcome {
    /// The slab was frozen at the instant of the push (list transitions
    /// are then the owning core's business, not ours)
    pub frozen: bool,
    /// This push created the slab's first free object
    pub was_full: bool,
    /// This push dropped in_use to zero
    pub now_empty: bool,
}

/// Result of a single bounded fast-path pop attempt
#[derive(Clone, Copy, Debug)]
pub(crate) enum PopOnce {
    Got(u32),
    Empty,
    /// CAS lost against a concurrent update of the same word
    Raced,
}

/// Object geometry shared by every slab of a cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ObjectLayout {
    pub object_size: usize,
    pub align: usize,
    /// Distance between consecutive objects
    pub stride: usize,
    /// Offset of the intrusive link within an object slot.
    ///
    /// Zero (reusing dead payload) unless a constructor is configured, in
    /// which case the link is placed after the object so constructed state
    /// survives free/alloc cycles.
    pub link_offset: usize,
    /// Offset of object 0 from the block base (header plus padding)
    pub first_obj_offset: usize,
}

impl ObjectLayout {
    pub(crate) fn compute(object_size: usize, align: usize, has_ctor: bool) -> Self {
        assert!(object_size > 0, "zero-sized object cache");
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let align = align.max(LINK_ALIGN);

        let link_offset = if has_ctor {
            roundto(object_size, LINK_ALIGN)
        } else {
            0
        };
        let stride_min = if has_ctor {
            link_offset + LINK_SZ
        } else {
            object_size.max(LINK_SZ)
        };
        let stride = roundto(stride_min, align);
        let first_obj_offset = roundto(size_of::<SlabHeader>(), align);

        Self {
            object_size,
            align,
            stride,
            link_offset,
            first_obj_offset,
        }
    }

    /// How many objects a block of the given order yields
    pub(crate) fn objects_in(&self, order: u8) -> u32 {
        let sz = block_size(order);
        if sz <= self.first_obj_offset {
            return 0;
        }
        let n = (sz - self.first_obj_offset) / self.stride;
        (n as u64).min(MAX_OBJECTS_PER_SLAB as u64) as u32
    }

    /// Smallest order that yields at least one object
    pub(crate) fn min_viable_order(&self) -> Option<u8> {
        (0..=MAX_ORDER).find(|&o| self.objects_in(o) >= 1)
    }

    /// Bytes left over after the last whole object in a block of `order`.
    /// Only meaningful at viable orders.
    pub(crate) fn slack_in(&self, order: u8) -> usize {
        let objects = self.objects_in(order) as usize;
        block_size(order) - self.first_obj_offset - objects * self.stride
    }

    /// Smallest order that holds at least four objects while wasting less
    /// than 1/16 of the block on slack; failing that, the smallest order
    /// holding four objects, capped at [MAX_ORDER]
    pub(crate) fn preferred_order(&self) -> Option<u8> {
        let min = self.min_viable_order()?;
        let fits = |o: &u8| self.objects_in(*o) >= 4;
        let tight = |o: u8| self.slack_in(o) * 16 < block_size(o);
        Some(
            (min..=MAX_ORDER)
                .find(|o| fits(o) && tight(*o))
                .or_else(|| (min..=MAX_ORDER).find(fits))
                .unwrap_or(MAX_ORDER),
        )
    }
}

/// Packed (order, objects-per-slab) pair, readable as one word
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct OrderObjects(u32);

impl OrderObjects {
    pub(crate) fn new(order: u8, objects: u32) -> Self {
        debug_assert!(objects <= MAX_OBJECTS_PER_SLAB);
        Self(((order as u32) << 16) | objects)
    }

    pub(crate) fn order(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub(crate) fn objects(self) -> u32 {
        self.0 & 0xFFFF
    }
}

impl std::fmt::Debug for OrderObjects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OrderObjects(order={}, objects={})", self.order(), self.objects())
    }
}

/// Per-block bookkeeping, stored at the base of the backing block.
///
/// All fields other than `state`, the list links, and `magic` are
/// immutable after [format](Self::format). The list links (`next`/`prev`,
/// `on_partial`) are atomics only so the type is `Sync`; they are mutated
/// exclusively by whichever container currently owns the slab (a core's
/// slot, or a node list under its lock).
#[repr(C)]
pub(crate) struct SlabHeader {
    magic: AtomicU64,
    state: AtomicU64,
    pub(crate) order: u8,
    pub(crate) node: NodeId,
    pub(crate) total_objects: u32,
    stride: u32,
    first_obj_offset: u32,
    link_offset: u32,
    /// Next slab in a node partial list or a core's overflow list
    pub(crate) next: AtomicUsize,
    /// Previous slab in a node partial list
    pub(crate) prev: AtomicUsize,
    /// Nonzero iff on a node partial list; mutated only under that node's lock
    pub(crate) on_partial: AtomicU32,
}

impl SlabHeader {
    /// Write a fresh header into `block` and thread the full free chain
    /// through the object slots.
    ///
    /// Runs `ctor` once per object. Returns the header with `in_use == 0`
    /// and every object on the free list; `frozen` is set per the caller
    /// (a slab headed straight for a core slot starts frozen).
    ///
    /// # Safety
    ///
    /// `block` must be live, unaliased, and sized/aligned per the
    /// [PageProvider](crate::page_provider::PageProvider) contract.
    pub(crate) unsafe fn format<'a>(
        block: &BackingBlock,
        layout: &ObjectLayout,
        ctor: Option<fn(NonNull<u8>)>,
        frozen: bool,
    ) -> &'a SlabHeader {
        let total = layout.objects_in(block.order);
        debug_assert!(total >= 1);

        let hdr_ptr = block.base.as_ptr() as *mut SlabHeader;
        ptr::write(
            hdr_ptr,
            SlabHeader {
                magic: AtomicU64::new(SLAB_MAGIC),
                state: AtomicU64::new(
                    SlabState::pack(0, frozen, 0, 0).raw(),
                ),
                order: block.order,
                node: block.node,
                total_objects: total,
                stride: layout.stride as u32,
                first_obj_offset: layout.first_obj_offset as u32,
                link_offset: layout.link_offset as u32,
                next: AtomicUsize::new(0),
                prev: AtomicUsize::new(0),
                on_partial: AtomicU32::new(0),
            },
        );
        let hdr = &*hdr_ptr;

        for i in 0..total {
            let obj = hdr.object_addr(i);
            let next = if i + 1 < total { i + 1 } else { HEAD_NONE };
            ptr::write(
                obj.as_ptr().add(layout.link_offset) as *mut LinkWord,
                LinkWord::new(next),
            );
            if let Some(ctor) = ctor {
                ctor(obj);
            }
        }

        hdr
    }

    /// Scrub the magic and reconstruct the [BackingBlock] so the memory
    /// can go back to the provider. Catches (some) frees into released
    /// blocks after the fact.
    pub(crate) fn retire(&self) -> BackingBlock {
        self.magic.store(0, Ordering::Relaxed);
        BackingBlock {
            // safety contract: the header sits at the block base
            base: unsafe { NonNull::new_unchecked(self.base()) },
            order: self.order,
            node: self.node,
        }
    }

    fn base(&self) -> *mut u8 {
        self as *const SlabHeader as *mut u8
    }

    /// Constant-time pointer→metadata resolution: mask the address down to
    /// the block base. Panics if the result does not carry a live slab
    /// header (free of a foreign or unrecognized pointer is a fatal misuse).
    ///
    /// # Safety
    ///
    /// `ptr` must point into a block obtained from this allocator's page
    /// provider, and the block must still be live.
    pub(crate) unsafe fn from_object<'a>(ptr: NonNull<u8>) -> &'a SlabHeader {
        let base = (ptr.as_ptr() as usize) & !(SLAB_ALIGN - 1);
        let hdr = &*(base as *const SlabHeader);
        if hdr.magic.load(Ordering::Relaxed) != SLAB_MAGIC {
            panic!("free of pointer not belonging to a live slab");
        }
        hdr
    }

    pub(crate) fn object_addr(&self, idx: u32) -> NonNull<u8> {
        debug_assert!(idx < self.total_objects);
        let off = self.first_obj_offset as usize + idx as usize * self.stride as usize;
        debug_assert!(off < block_size(self.order));
        // safety: in bounds of the block per the asserts above
        unsafe { NonNull::new_unchecked(self.base().add(off)) }
    }

    /// Inverse of [object_addr](Self::object_addr); panics on addresses
    /// that are inside the block but not on an object boundary
    pub(crate) fn index_of(&self, ptr: NonNull<u8>) -> u32 {
        let off = (ptr.as_ptr() as usize).wrapping_sub(self.base() as usize);
        if off < self.first_obj_offset as usize {
            panic!("free of pointer inside slab metadata");
        }
        let rel = off - self.first_obj_offset as usize;
        let idx = rel / self.stride as usize;
        if rel % self.stride as usize != 0 || idx >= self.total_objects as usize {
            panic!("free of pointer not on an object boundary");
        }
        idx as u32
    }

    /// The link word threaded through a free object's slot
    unsafe fn link_at(&self, idx: u32) -> &LinkWord {
        let p = self.object_addr(idx).as_ptr().add(self.link_offset as usize);
        &*(p as *const LinkWord)
    }

    pub(crate) fn state(&self) -> SlabState {
        SlabState(self.state.load(Ordering::Acquire))
    }

    /// One bounded attempt to pop the head of the free list.
    ///
    /// The generation bump in the same CAS guards against the classic ABA
    /// (head popped and re-pushed with a different link while we slept).
    pub(crate) fn try_pop_once(&self) -> PopOnce {
        let cur = self.state();
        let head = match cur.free_head() {
            Some(x) => x,
            None => return PopOnce::Empty,
        };
        // safety: head came from the state word, so it indexes a free slot
        let next = unsafe { self.link_at(head).load(Ordering::Relaxed) };
        let new = SlabState::pack(cur.next_generation(), cur.frozen(), cur.in_use() + 1, next);
        // order: acquire the link stores of whichever push published `head`;
        // failures reload via state() so relaxed is fine there
        match self.state.compare_exchange_weak(
            cur.raw(),
            new.raw(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => PopOnce::Got(head),
            Err(_) => PopOnce::Raced,
        }
    }

    /// Pop until success or the list is observed empty
    pub(crate) fn pop_spin(&self) -> Option<u32> {
        loop {
            match self.try_pop_once() {
                PopOnce::Got(x) => return Some(x),
                PopOnce::Empty => return None,
                PopOnce::Raced => spin_hint(),
            }
        }
    }

    /// One bounded attempt to push `idx`; used by the owning core's
    /// free fast path before it falls back to the slow path
    pub(crate) fn try_push_once(&self, idx: u32) -> Option<PushOutcome> {
        self.try_push_at(idx, self.state())
    }

    /// One attempt to push `idx` against the caller's snapshot `cur`.
    ///
    /// The slow path decides whether to hold the node lock across the
    /// push based on `cur`; CASing against that exact snapshot keeps the
    /// lock decision and the observed transition consistent.
    pub(crate) fn try_push_at(&self, idx: u32, cur: SlabState) -> Option<PushOutcome> {
        self.push_prepare(idx, cur);
        match self.state.compare_exchange_weak(
            cur.raw(),
            self.push_new_state(idx, cur).raw(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => Some(self.push_outcome(cur)),
            Err(_) => None,
        }
    }

    /// Store the link for a pending push of `idx` against snapshot `cur`.
    /// An in_use underflow is a double free and is fatal.
    fn push_prepare(&self, idx: u32, cur: SlabState) {
        if cur.in_use() == 0 {
            panic!("object double free (slab in_use underflow)");
        }
        #[cfg(loom)]
        unsafe {
            // payload bytes were clobbered while the object was live; the
            // link must be re-initialized in place before loom will model it
            let p = self.object_addr(idx).as_ptr().add(self.link_offset as usize);
            ptr::write(p as *mut LinkWord, LinkWord::new(HEAD_NONE));
        }
        let next = cur.free_head().unwrap_or(HEAD_NONE);
        // safety: idx is ours to link; the object is dead payload from here on
        unsafe { self.link_at(idx).store(next, Ordering::Relaxed) };
    }

    fn push_new_state(&self, idx: u32, cur: SlabState) -> SlabState {
        SlabState::pack(cur.next_generation(), cur.frozen(), cur.in_use() - 1, idx)
    }

    fn push_outcome(&self, before: SlabState) -> PushOutcome {
        PushOutcome {
            frozen: before.frozen(),
            was_full: before.free_head().is_none(),
            now_empty: before.in_use() == 1,
        }
    }

    /// Freeze the slab (exclusive core ownership). Caller must hold its
    /// node's lock if the slab is reachable through the node list.
    pub(crate) fn set_frozen(&self) -> SlabState {
        loop {
            let cur = self.state();
            debug_assert!(!cur.frozen());
            let new = SlabState::pack(
                cur.next_generation(),
                true,
                cur.in_use(),
                cur.free_head().unwrap_or(HEAD_NONE),
            );
            match self.state.compare_exchange_weak(
                cur.raw(),
                new.raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return new,
                Err(_) => spin_hint(),
            }
        }
    }

    /// Unfreeze on deactivation. Caller must hold the owning node's lock so
    /// that classification races with foreign frees serialize there.
    pub(crate) fn clear_frozen(&self) -> SlabState {
        loop {
            let cur = self.state();
            debug_assert!(cur.frozen());
            let new = SlabState::pack(
                cur.next_generation(),
                false,
                cur.in_use(),
                cur.free_head().unwrap_or(HEAD_NONE),
            );
            match self.state.compare_exchange_weak(
                cur.raw(),
                new.raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return new,
                Err(_) => spin_hint(),
            }
        }
    }

    pub(crate) fn free_objects(&self) -> u32 {
        let st = self.state();
        self.total_objects - st.in_use()
    }

    /// Walk the free chain (only sound when no concurrent mutators exist,
    /// i.e. at quiescence); yields each free index
    pub(crate) fn walk_free_list(&self, mut f: impl FnMut(u32)) {
        let mut cur = self.state().free_head();
        let mut steps = 0;
        while let Some(idx) = cur {
            assert!(idx < self.total_objects, "free list index out of range");
            steps += 1;
            assert!(
                steps <= self.total_objects,
                "free list cycle detected"
            );
            f(idx);
            // safety: quiescent; idx indexes a free slot
            let next = unsafe { self.link_at(idx).load(Ordering::Relaxed) };
            cur = if next == HEAD_NONE { None } else { Some(next) };
        }
    }
}

impl std::fmt::Debug for SlabHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabHeader")
            .field("@addr", &(self as *const _))
            .field("order", &self.order)
            .field("node", &self.node)
            .field("total_objects", &self.total_objects)
            .field("state", &self.state())
            .field("on_partial", &(self.on_partial.load(Ordering::Relaxed) != 0))
            .finish()
    }
}
