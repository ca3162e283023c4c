//! Concurrency-safe object-cache allocator.
//!
//! A [Cache] carves fixed-size objects out of power-of-two backing blocks
//! ("slabs") obtained from a [PageProvider], and hands them out with a
//! lock-free per-core fast path. The design follows the classic
//! per-core-active-slab scheme:
//!
//! * each core owns one *frozen* active slab it allocates from without any
//!   lock, via a single CAS on the slab's packed (generation, counters,
//!   free-list head) word;
//! * each NUMA node keeps a short-held locked list of unfrozen, partially
//!   used slabs that refills exhausted cores;
//! * any core may free an object belonging to any other core's slab; such
//!   foreign frees splice into the owning slab's word with a CAS loop and
//!   never touch the owning core's slot.
//!
//! A second, array-cache strategy ([Strategy::Magazine]) keeps a small
//! per-core array of object addresses refilled and flushed in batches; it
//! honors the same create/alloc/free/destroy contract and is selected at
//! construction time.
//!
//! Callers interact through per-core shard handles ([CoreHandle]), handed
//! out from a 64-bit id bitfield; holding a handle is what grants the
//! unlocked fast path for that core id.

use std::{
    cell::{Cell, UnsafeCell},
    fmt::Debug,
    marker::PhantomData,
    mem,
    ptr::NonNull,
    sync::atomic::Ordering,
};

use tracing::Level;

use crate::{
    loom_testing::*,
    page_provider::{NodeId, PageProvider, MAX_ORDER},
    util::UsizePtr,
};

pub(crate) mod slab;
mod magazine;
#[cfg(test)]
mod tests;

use magazine::Magazine;
use slab::{ObjectLayout, OrderObjects, PopOnce, SlabHeader};

/// Absolute maximum number of per-core slots.
///
/// Not dynamic for the same reason as in any per-cpu array scheme: the
/// cache hands out references into the slot array, so the backing store
/// must never move. Limited to 64 so a u64 atomic bitfield can allocate
/// core ids.
pub const MAX_CORES: usize = 64;
const _: () = assert!(MAX_CORES <= 64);

/// How many times the fast path retries a raced CAS before taking the
/// slow path
const FAST_RETRIES: usize = 4;

/// Allocation failure. The page provider could not supply a block at any
/// attempted order; not fatal to the cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocError {
    OutOfMemory,
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "page provider exhausted at every order"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Which per-core front end the cache uses (both honor the same contract)
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Strategy {
    /// One frozen active slab per core plus a frozen overflow list
    PerCoreSlab,
    /// Per-core bounded array of objects, refilled/flushed in batches
    Magazine,
}

/// Creation-time configuration of a [Cache].
///
/// [for_object_size](Self::for_object_size) derives the tuning knobs the
/// way the original slab allocators do; every field can be overridden
/// before the cache is created.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub object_size: usize,
    pub align: usize,
    /// Run once per object when a slab is formatted. With a constructor
    /// present, the intrusive free link is placed after the object so
    /// constructed state survives free/alloc cycles.
    pub ctor: Option<fn(NonNull<u8>)>,
    /// Per-node floor of partial slabs kept around instead of being
    /// released when they become empty
    pub min_partial: usize,
    /// Budget of free objects a core may hold in its partial-overflow
    /// list (or magazine) before flushing back to the node lists
    pub overflow_objects: usize,
    /// Block order requested first for new slabs
    pub preferred_order: u8,
    /// Smallest block order to fall back to before reporting OutOfMemory
    pub min_order: u8,
    /// 0 never borrows partial slabs from remote nodes (growth instead);
    /// 100 always prefers a non-empty remote list over growth. Advisory.
    pub remote_borrow_ratio: u32,
    pub strategy: Strategy,
}

impl CacheConfig {
    pub fn for_object_size(object_size: usize) -> Self {
        let layout = ObjectLayout::compute(object_size, mem::align_of::<u64>(), false);
        let min_order = match layout.min_viable_order() {
            Some(x) => x,
            None => panic!("object too large for any backing-block order"),
        };
        let preferred_order = layout.preferred_order().unwrap_or(MAX_ORDER);
        // min_partial = ilog2(size)/2 clamped to [5, 10]; the overflow
        // budget shrinks as objects grow
        let min_partial = (object_size.max(2).ilog2() as usize / 2).clamp(5, 10);
        let overflow_objects = if object_size >= 4096 {
            2
        } else if object_size >= 1024 {
            6
        } else if object_size >= 256 {
            13
        } else {
            30
        };
        Self {
            object_size,
            align: mem::align_of::<u64>(),
            ctor: None,
            min_partial,
            overflow_objects,
            preferred_order,
            min_order,
            remote_borrow_ratio: 100,
            strategy: Strategy::PerCoreSlab,
        }
    }
}

/// Reconstruct a header reference from an address stored in a list/slot.
///
/// # Safety
///
/// `addr` must be the base of a live, formatted slab owned by this cache.
unsafe fn hdr<'a>(addr: usize) -> &'a SlabHeader {
    &*(addr as *const SlabHeader)
}

/// Intrusive doubly-linked list of unfrozen partial slabs plus the
/// registry of every live slab owned by one node. Only ever touched with
/// the node lock held; slab link fields are atomics purely for `Sync`.
struct PartialList {
    head: usize,
    tail: usize,
    len: usize,
    /// Every live slab on this node, including Full ones the partial list
    /// does not track. Needed so destroy and validation are total.
    registry: Vec<usize>,
}

impl PartialList {
    fn new() -> Self {
        Self {
            head: 0,
            tail: 0,
            len: 0,
            registry: Vec::new(),
        }
    }

    fn push_tail(&mut self, s: &SlabHeader) {
        debug_assert_eq!(s.on_partial.load(Ordering::Relaxed), 0);
        let addr = s as *const SlabHeader as usize;
        s.prev.store(self.tail, Ordering::Relaxed);
        s.next.store(0, Ordering::Relaxed);
        if self.tail != 0 {
            // safety: tail is a live slab on this list
            unsafe { hdr(self.tail) }.next.store(addr, Ordering::Relaxed);
        } else {
            self.head = addr;
        }
        self.tail = addr;
        s.on_partial.store(1, Ordering::Relaxed);
        self.len += 1;
    }

    fn push_head(&mut self, s: &SlabHeader) {
        debug_assert_eq!(s.on_partial.load(Ordering::Relaxed), 0);
        let addr = s as *const SlabHeader as usize;
        s.prev.store(0, Ordering::Relaxed);
        s.next.store(self.head, Ordering::Relaxed);
        if self.head != 0 {
            // safety: head is a live slab on this list
            unsafe { hdr(self.head) }.prev.store(addr, Ordering::Relaxed);
        } else {
            self.tail = addr;
        }
        self.head = addr;
        s.on_partial.store(1, Ordering::Relaxed);
        self.len += 1;
    }

    fn unlink(&mut self, s: &SlabHeader) {
        debug_assert_ne!(s.on_partial.load(Ordering::Relaxed), 0);
        let addr = s as *const SlabHeader as usize;
        let prev = s.prev.load(Ordering::Relaxed);
        let next = s.next.load(Ordering::Relaxed);
        if prev != 0 {
            // safety: neighbors on the list are live slabs
            unsafe { hdr(prev) }.next.store(next, Ordering::Relaxed);
        } else {
            debug_assert_eq!(self.head, addr);
            self.head = next;
        }
        if next != 0 {
            // safety: neighbors on the list are live slabs
            unsafe { hdr(next) }.prev.store(prev, Ordering::Relaxed);
        } else {
            debug_assert_eq!(self.tail, addr);
            self.tail = prev;
        }
        s.on_partial.store(0, Ordering::Relaxed);
        self.len -= 1;
    }

    fn pop_head(&mut self) -> Option<usize> {
        if self.head == 0 {
            return None;
        }
        let addr = self.head;
        // safety: head is a live slab on this list
        self.unlink(unsafe { hdr(addr) });
        Some(addr)
    }

    fn registry_remove(&mut self, s: &SlabHeader) {
        let addr = s as *const SlabHeader as usize;
        match self.registry.iter().position(|&x| x == addr) {
            Some(i) => {
                self.registry.swap_remove(i);
            }
            None => panic!("slab missing from its node registry"),
        }
    }
}

/// One NUMA node's share of the cache
struct NodePartial {
    partial: Mutex<PartialList>,
    /// Slab count for statistics; the registry under the lock is the
    /// authoritative set
    nr_slabs: AtomicUsize,
}

impl NodePartial {
    fn new() -> Self {
        Self {
            partial: Mutex::new(PartialList::new()),
            nr_slabs: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PartialList> {
        match self.partial.lock() {
            Ok(x) => x,
            Err(_) => panic!("node partial list lock poisoned"),
        }
    }
}

/// Per-core slab front end: the active slab plus the frozen overflow list.
/// Mutated only by the core that owns the slot; foreign cores interact
/// with the slabs' own atomic words instead.
struct SlabSlot {
    /// Address of the current active (frozen) slab, or 0
    active: Cell<usize>,
    /// Head of the singly-linked list of frozen overflow slabs, via
    /// `SlabHeader::next`
    overflow: Cell<usize>,
    /// Approximate count of free objects parked on the overflow list
    overflow_objects: Cell<usize>,
}

impl SlabSlot {
    fn new() -> Self {
        Self {
            active: Cell::new(0),
            overflow: Cell::new(0),
            overflow_objects: Cell::new(0),
        }
    }
}

enum CoreFront {
    Slab(SlabSlot),
    Magazine(Magazine),
}

/// Storage for one core id. The `front` is owner-mutated only; the
/// defrag tick drives the advisory remote-borrow policy.
struct CoreSlot {
    front: CoreFront,
    defrag_tick: Cell<u32>,
}

impl CoreSlot {
    fn new(cfg: &CacheConfig) -> Self {
        let front = match cfg.strategy {
            Strategy::PerCoreSlab => CoreFront::Slab(SlabSlot::new()),
            Strategy::Magazine => CoreFront::Magazine(Magazine::new(cfg)),
        };
        Self {
            front,
            defrag_tick: Cell::new(0),
        }
    }
}

/// Object-cache allocator for one object size/class.
///
/// Destroying the cache (by value) requires every object to have been
/// freed first; violating that is reported as a fatal misuse.
pub struct Cache<P: PageProvider> {
    cfg: CacheConfig,
    layout: ObjectLayout,
    /// Preferred (order, objects-per-slab)
    oo: OrderObjects,
    /// Minimum fallback (order, objects-per-slab)
    min_oo: OrderObjects,
    provider: P,
    nodes: Box<[NodePartial]>,
    slots: Box<[CoreSlot]>,
    /// Bitfield: bit n set iff a [CoreHandle] for slot n is outstanding
    /// (or a quiescent guard holds all bits)
    core_inuse: AtomicU64,
}

// safety: the Cells inside slots are mutated only through the CoreHandle
// that owns the slot's bit in core_inuse; everything else is atomics,
// locks, or immutable
unsafe impl<P: PageProvider + Sync> Sync for Cache<P> {}
unsafe impl<P: PageProvider + Send> Send for Cache<P> {}

impl<P: PageProvider> Debug for Cache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("@addr", &(self as *const _))
            .field("object_size", &self.cfg.object_size)
            .field("strategy", &self.cfg.strategy)
            .field("core_inuse", &self.core_inuse.load(Ordering::Relaxed))
            .finish()
    }
}

impl<P: PageProvider> Cache<P> {
    pub fn new(cfg: CacheConfig, provider: P) -> Self {
        assert!(cfg.remote_borrow_ratio <= 100);
        assert!(cfg.preferred_order <= MAX_ORDER && cfg.min_order <= MAX_ORDER);
        let layout = ObjectLayout::compute(cfg.object_size, cfg.align, cfg.ctor.is_some());
        let min_viable = match layout.min_viable_order() {
            Some(x) => x,
            None => panic!("object too large for any backing-block order"),
        };
        let min_order = cfg.min_order.max(min_viable);
        let preferred = cfg.preferred_order.clamp(min_order, MAX_ORDER);
        let oo = OrderObjects::new(preferred, layout.objects_in(preferred));
        let min_oo = OrderObjects::new(min_order, layout.objects_in(min_order));

        let num_nodes = provider.num_nodes();
        assert!(num_nodes >= 1);
        let nodes = (0..num_nodes)
            .map(|_| NodePartial::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let slots = (0..MAX_CORES)
            .map(|_| CoreSlot::new(&cfg))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        tracing::event!(
            Level::TRACE,
            object_size = cfg.object_size,
            stride = layout.stride,
            oo = ?oo,
            min_oo = ?min_oo,
            "cache created"
        );

        Self {
            cfg,
            layout,
            oo,
            min_oo,
            provider,
            nodes,
            slots,
            core_inuse: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Claim a per-core shard of the cache.
    ///
    /// Panics if all [MAX_CORES] slots are taken or a quiescent guard
    /// exists.
    pub fn core(&self) -> CoreHandle<'_, P> {
        // order: synchronize-with the release of whichever drop made this
        // core id reallocatable; unrelated releases in between form part
        // of the release sequence via the RmW updates
        let mut old_inuse = self.core_inuse.load(Ordering::Relaxed);
        let core;
        loop {
            let next = old_inuse.trailing_ones();
            if next as usize >= MAX_CORES {
                panic!("no core slots available, or cache is quiesced");
            }
            match self.core_inuse.compare_exchange_weak(
                old_inuse,
                old_inuse | (1 << next),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    core = next as usize;
                    break;
                }
                Err(x) => old_inuse = x,
            }
        }
        CoreHandle {
            cache: self,
            core,
            _not_sync: PhantomData,
        }
    }

    /// Try to claim the whole cache for quiescent inspection. Succeeds
    /// only when no core handles are outstanding.
    pub fn try_quiesce(&self) -> Option<QuiescentGuard<'_, P>> {
        // order: synchronize-with the handle drop that zeroed the last bit
        match self
            .core_inuse
            .compare_exchange(0, u64::MAX, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Some(QuiescentGuard(self, PhantomData)),
            Err(_) => None,
        }
    }

    /// Tear the cache down. All objects must have been freed; destroying
    /// with outstanding allocations is a fatal misuse.
    pub fn destroy(self) {
        drop(self);
    }

    // ---- slab acquisition ----

    /// Get a fresh slab from the page provider, preferred order first,
    /// falling back one order at a time to the minimum
    fn new_slab(&self, node: NodeId, frozen: bool) -> Result<&SlabHeader, AllocError> {
        let mut order = self.oo.order();
        let block = loop {
            match self.provider.allocate_block(order, node) {
                Some(b) => break b,
                None => {
                    if order == self.min_oo.order() {
                        return Err(AllocError::OutOfMemory);
                    }
                    tracing::event!(Level::TRACE, order, "order fallback");
                    order -= 1;
                }
            }
        };
        // safety: the block is fresh and exclusively ours per the provider
        // contract
        let slab = unsafe { SlabHeader::format(&block, &self.layout, self.cfg.ctor, frozen) };
        let node_part = &self.nodes[slab.node.0 as usize];
        node_part.lock().registry.push(slab as *const SlabHeader as usize);
        node_part.nr_slabs.fetch_add(1, Ordering::Relaxed);
        tracing::event!(
            Level::TRACE,
            ptr = ?UsizePtr::from(slab),
            order = slab.order,
            node = slab.node.0,
            objects = slab.total_objects,
            "slab allocated"
        );
        Ok(slab)
    }

    /// Hand a slab's backing block back to the provider. The caller must
    /// already have removed it from its node registry (and any list).
    fn release_slab(&self, slab: &SlabHeader) {
        let node_part = &self.nodes[slab.node.0 as usize];
        node_part.nr_slabs.fetch_sub(1, Ordering::Relaxed);
        tracing::event!(
            Level::TRACE,
            ptr = ?UsizePtr::from(slab),
            node = slab.node.0,
            "slab released"
        );
        let block = slab.retire();
        // safety: the slab is empty and unreachable from every container
        unsafe { self.provider.release_block(block) };
    }

    /// Unfreeze a slab a core no longer wants and classify it:
    /// Full (untracked), Partial (node list), empty-reserve, or released.
    ///
    /// The frozen bit is cleared while holding the node lock so that
    /// foreign frees racing with deactivation serialize on that lock.
    fn unfreeze_and_classify(&self, slab: &SlabHeader) {
        let node_part = &self.nodes[slab.node.0 as usize];
        let mut list = node_part.lock();
        let st = slab.clear_frozen();
        if st.in_use() == 0 {
            if list.len >= self.cfg.min_partial {
                list.registry_remove(slab);
                drop(list);
                self.release_slab(slab);
            } else {
                // kept as an empty reserve to satisfy min_partial
                list.push_tail(slab);
            }
        } else if st.free_head().is_none() {
            // Full: tracked by the registry only
        } else if st.in_use() * 2 >= slab.total_objects {
            // nearly full: reuse it soon to fill it the rest of the way
            list.push_head(slab);
        } else {
            list.push_tail(slab);
        }
    }

    /// Foreign-core (or post-retry) free path: splice the object back into
    /// its slab and perform any list transition that falls out.
    ///
    /// A push that would trigger a list transition (first free object of
    /// a Full slab, or the last outstanding object) takes the node lock
    /// *before* its CAS. The caller's object keeps `in_use` nonzero until
    /// the push lands, so the header cannot be released before the CAS;
    /// holding the lock from before the CAS until the transition is done
    /// means a concurrent freer cannot release the slab in between either.
    pub(crate) fn free_slow(&self, slab: &SlabHeader, idx: u32) {
        let node_part = &self.nodes[slab.node.0 as usize];
        let mut list: Option<MutexGuard<'_, PartialList>> = None;
        let outcome = loop {
            let cur = slab.state();
            let transition =
                !cur.frozen() && (cur.free_head().is_none() || cur.in_use() == 1);
            if transition && list.is_none() {
                list = Some(node_part.lock());
                // the state may have moved while we waited; re-read
                continue;
            }
            if !transition && list.is_some() {
                list = None;
            }
            match slab.try_push_at(idx, cur) {
                Some(outcome) => break outcome,
                None => spin_hint(),
            }
        };
        if outcome.frozen || (!outcome.was_full && !outcome.now_empty) {
            // the owning core observes the new free object on next use or
            // at deactivation; no list transition to perform
            debug_assert!(list.is_none());
            return;
        }
        let trace_span = tracing::span!(Level::TRACE, "cache::free_transition");
        let _span_enter = trace_span.enter();

        // the transition-triggering CAS succeeded with this lock held, so
        // nothing can have frozen or released the slab since
        let mut list = match list {
            Some(x) => x,
            None => unreachable!(),
        };
        if slab.on_partial.load(Ordering::Relaxed) == 0 {
            tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(slab), "full -> partial");
            list.push_tail(slab);
        }
        if outcome.now_empty && list.len > self.cfg.min_partial {
            tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(slab), "partial -> released");
            list.unlink(slab);
            list.registry_remove(slab);
            drop(list);
            // no objects outstanding and unreachable: safe to release
            self.release_slab(slab);
        }
    }

    // ---- per-core-slab strategy ----

    fn percore_alloc(
        &self,
        slot: &CoreSlot,
        front: &SlabSlot,
        node: NodeId,
        core: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let active = front.active.get();
        if active != 0 {
            // safety: the active slab is frozen and owned by this slot
            let slab = unsafe { hdr(active) };
            // retries are for lost CAS races only; an observed-empty slab
            // goes straight to the slow path
            for _ in 0..FAST_RETRIES {
                match slab.try_pop_once() {
                    PopOnce::Got(idx) => return Ok(slab.object_addr(idx)),
                    PopOnce::Empty => break,
                    PopOnce::Raced => spin_hint(),
                }
            }
        }
        self.percore_alloc_slow(slot, front, node, core)
    }

    fn percore_alloc_slow(
        &self,
        slot: &CoreSlot,
        front: &SlabSlot,
        node: NodeId,
        core: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let trace_span = tracing::span!(Level::TRACE, "cache::alloc_slow", core, node = node.0);
        let _span_enter = trace_span.enter();

        loop {
            let slab = if let Some(s) = self.pop_overflow(front) {
                s
            } else if let Some(s) = self.refill_from_nodes(slot, front, node) {
                s
            } else {
                self.new_slab(node, true)?
            };
            self.install_active(front, slab);

            // the new active slab is frozen and had free objects when
            // installed; foreign frees only ever add more, so this pop can
            // race but not run dry
            loop {
                match slab.try_pop_once() {
                    PopOnce::Got(idx) => {
                        tracing::event!(
                            Level::TRACE,
                            ptr = ?UsizePtr(slab.object_addr(idx).as_ptr() as usize),
                            "slow path satisfied"
                        );
                        return Ok(slab.object_addr(idx));
                    }
                    PopOnce::Empty => break,
                    PopOnce::Raced => spin_hint(),
                }
            }
        }
    }

    /// Make `slab` (frozen, with free objects) the slot's active slab,
    /// deactivating the previous one
    fn install_active(&self, front: &SlabSlot, slab: &SlabHeader) {
        let old = front.active.replace(slab as *const SlabHeader as usize);
        if old != 0 {
            // safety: the old active slab was owned by this slot
            let old = unsafe { hdr(old) };
            if old.free_objects() > 0 {
                self.put_overflow(front, old);
            } else {
                self.unfreeze_and_classify(old);
            }
        }
    }

    /// Park a still-frozen slab with free objects on the overflow list,
    /// flushing the list back to the nodes first if the budget is exceeded
    fn put_overflow(&self, front: &SlabSlot, slab: &SlabHeader) {
        let free = slab.free_objects() as usize;
        if front.overflow_objects.get() + free > self.cfg.overflow_objects {
            self.flush_overflow(front);
        }
        slab.next.store(front.overflow.get(), Ordering::Relaxed);
        front.overflow.set(slab as *const SlabHeader as usize);
        front.overflow_objects.set(front.overflow_objects.get() + free);
    }

    fn pop_overflow(&self, front: &SlabSlot) -> Option<&SlabHeader> {
        let head = front.overflow.get();
        if head == 0 {
            return None;
        }
        // safety: overflow slabs are frozen and owned by this slot
        let slab = unsafe { hdr(head) };
        front.overflow.set(slab.next.load(Ordering::Relaxed));
        front
            .overflow_objects
            .set(front.overflow_objects.get().saturating_sub(slab.free_objects() as usize));
        Some(slab)
    }

    /// Unfreeze every overflow slab back to its node
    fn flush_overflow(&self, front: &SlabSlot) {
        let mut cur = front.overflow.replace(0);
        front.overflow_objects.set(0);
        while cur != 0 {
            // safety: overflow slabs are frozen and owned by this slot
            let slab = unsafe { hdr(cur) };
            cur = slab.next.load(Ordering::Relaxed);
            self.unfreeze_and_classify(slab);
        }
    }

    /// Refill the slot from the node partial lists: requesting node first,
    /// then other nodes (nearest first) per the remote-borrow policy
    fn refill_from_nodes(
        &self,
        slot: &CoreSlot,
        front: &SlabSlot,
        node: NodeId,
    ) -> Option<&SlabHeader> {
        if let Some(s) = self.refill_from(front, node) {
            return Some(s);
        }
        if !self.should_borrow_remote(slot) {
            return None;
        }
        let n = self.nodes.len() as i64;
        let from = node.0 as i64;
        for d in 1..n {
            for cand in [from - d, from + d] {
                if cand < 0 || cand >= n {
                    continue;
                }
                if let Some(s) = self.refill_from(front, NodeId(cand as u32)) {
                    tracing::event!(Level::TRACE, from = node.0, borrowed = cand, "remote borrow");
                    return Some(s);
                }
            }
        }
        None
    }

    fn should_borrow_remote(&self, slot: &CoreSlot) -> bool {
        let t = slot.defrag_tick.get();
        slot.defrag_tick.set(t.wrapping_add(1));
        (t % 100) < self.cfg.remote_borrow_ratio
    }

    /// Take slabs off one node's partial list: the first is returned to
    /// become the active slab, the rest are parked on the overflow list
    /// until roughly half the overflow budget is in hand
    fn refill_from(&self, front: &SlabSlot, node: NodeId) -> Option<&SlabHeader> {
        let node_part = &self.nodes[node.0 as usize];
        let mut list = node_part.lock();
        let mut first = None;
        let mut acquired = 0usize;
        while let Some(addr) = list.pop_head() {
            // safety: the list holds live slabs owned by this node
            let slab = unsafe { hdr(addr) };
            // freezing under the lock: foreign frees that saw the slab
            // unfrozen serialize on this lock before touching the list
            slab.set_frozen();
            let free = slab.free_objects() as usize;
            acquired += free;
            if first.is_none() {
                first = Some(addr);
            } else {
                slab.next.store(front.overflow.get(), Ordering::Relaxed);
                front.overflow.set(addr);
                front
                    .overflow_objects
                    .set(front.overflow_objects.get() + free);
            }
            if acquired > self.cfg.overflow_objects / 2 {
                break;
            }
        }
        // safety: as above
        first.map(|addr| unsafe { hdr(addr) })
    }

    /// Return every slab a slot holds to the node lists (handle drop)
    fn flush_slab_front(&self, front: &SlabSlot) {
        let active = front.active.replace(0);
        if active != 0 {
            // safety: the active slab was owned by this slot
            self.unfreeze_and_classify(unsafe { hdr(active) });
        }
        self.flush_overflow(front);
    }
}

impl<P: PageProvider> Drop for Cache<P> {
    fn drop(&mut self) {
        // core handles borrow the cache, so none are live here and every
        // slab is registered with its node
        let mut outstanding = 0usize;
        for node in self.nodes.iter() {
            let list = node.lock();
            for &addr in &list.registry {
                // safety: registry entries are live slabs
                outstanding += unsafe { hdr(addr) }.state().in_use() as usize;
            }
        }
        if outstanding != 0 {
            // the free-list invariants can no longer be trusted; leak the
            // blocks rather than hand corrupted memory back
            if !std::thread::panicking() {
                panic!("cache destroyed with {} objects still allocated", outstanding);
            }
            return;
        }
        for node in self.nodes.iter() {
            let registry = {
                let mut list = node.lock();
                list.head = 0;
                list.tail = 0;
                list.len = 0;
                mem::take(&mut list.registry)
            };
            for addr in registry {
                // safety: all empty, unreachable from any container
                let slab = unsafe { hdr(addr) };
                node.nr_slabs.fetch_sub(1, Ordering::Relaxed);
                let block = slab.retire();
                unsafe { self.provider.release_block(block) };
            }
        }
    }
}

/// Handle to one per-core shard of a [Cache].
///
/// At most one handle exists per core id; whoever holds it has exclusive
/// access to that slot's unlocked state. Dropping the handle flushes the
/// slot back to the node lists and recycles the core id.
pub struct CoreHandle<'cache, P: PageProvider> {
    cache: &'cache Cache<P>,
    core: usize,
    /// prevent this type from being `Sync`
    _not_sync: PhantomData<UnsafeCell<()>>,
}

impl<'cache, P: PageProvider> Debug for CoreHandle<'cache, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreHandle")
            .field("core", &self.core)
            .finish()
    }
}

impl<'cache, P: PageProvider> CoreHandle<'cache, P> {
    pub fn core_id(&self) -> usize {
        self.core
    }

    pub fn cache(&self) -> &'cache Cache<P> {
        self.cache
    }

    /// Allocate one object, preferring memory on `node`.
    ///
    /// The returned memory is uninitialized unless the cache has a
    /// constructor, in which case it retains constructed (or
    /// last-freed) state.
    pub fn alloc(&self, node: NodeId) -> Result<NonNull<u8>, AllocError> {
        assert!((node.0 as usize) < self.cache.nodes.len());
        let slot = &self.cache.slots[self.core];
        match &slot.front {
            CoreFront::Slab(front) => self.cache.percore_alloc(slot, front, node, self.core),
            CoreFront::Magazine(mag) => self.cache.magazine_alloc(slot, mag, node),
        }
    }

    /// Free one object. May be called from any core's handle, including
    /// for objects another core allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [alloc](Self::alloc) on this cache, must
    /// not already have been freed, and no references into the object may
    /// outlive this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let slab = SlabHeader::from_object(ptr);
        let idx = slab.index_of(ptr);
        let slot = &self.cache.slots[self.core];
        match &slot.front {
            CoreFront::Slab(front) => {
                if front.active.get() == slab as *const SlabHeader as usize {
                    // fast path: our own active slab; the CAS revalidates
                    // the generation for us
                    for _ in 0..FAST_RETRIES {
                        if let Some(outcome) = slab.try_push_once(idx) {
                            debug_assert!(outcome.frozen);
                            return;
                        }
                    }
                }
                self.cache.free_slow(slab, idx);
            }
            CoreFront::Magazine(mag) => self.cache.magazine_free(mag, ptr),
        }
    }
}

impl<'cache, P: PageProvider> Drop for CoreHandle<'cache, P> {
    fn drop(&mut self) {
        let slot = &self.cache.slots[self.core];
        match &slot.front {
            CoreFront::Slab(front) => self.cache.flush_slab_front(front),
            CoreFront::Magazine(mag) => self.cache.flush_magazine(mag),
        }
        // order: all manipulation of slot-owned data must stick before the
        // core id becomes reallocatable
        self.cache
            .core_inuse
            .fetch_and(!(1 << self.core), Ordering::Release);
    }
}

/// Aggregate statistics readable at quiescence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub slabs: usize,
    pub partial_slabs: usize,
    pub total_objects: usize,
    pub in_use: usize,
}

/// Exclusive, quiescent view of a [Cache]; see [Cache::try_quiesce].
///
/// While the guard lives, no core handles can be created, so walking
/// slabs and free lists is race-free.
pub struct QuiescentGuard<'cache, P: PageProvider>(
    &'cache Cache<P>,
    /// prevent this type from being `Sync`
    PhantomData<UnsafeCell<()>>,
);

impl<'cache, P: PageProvider> Drop for QuiescentGuard<'cache, P> {
    fn drop(&mut self) {
        // order: inspection must complete before handles reappear
        self.0.core_inuse.store(0, Ordering::Release);
    }
}

impl<'cache, P: PageProvider> QuiescentGuard<'cache, P> {
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            slabs: 0,
            partial_slabs: 0,
            total_objects: 0,
            in_use: 0,
        };
        for node in self.0.nodes.iter() {
            let list = node.lock();
            stats.slabs += list.registry.len();
            stats.partial_slabs += list.len;
            for &addr in &list.registry {
                // safety: registry entries are live slabs; we are quiesced
                let slab = unsafe { hdr(addr) };
                stats.total_objects += slab.total_objects as usize;
                stats.in_use += slab.state().in_use() as usize;
            }
        }
        stats
    }

    pub fn partial_len(&self, node: NodeId) -> usize {
        self.0.nodes[node.0 as usize].lock().len
    }

    /// Walk every slab and check the structural invariants: free-list
    /// integrity, counter conservation, and list exclusivity. Panics on
    /// violation; returns the stats it gathered.
    pub fn validate(&self) -> CacheStats {
        use rustc_hash::FxHashSet;

        for node in self.0.nodes.iter() {
            let list = node.lock();
            assert_eq!(
                node.nr_slabs.load(Ordering::Relaxed),
                list.registry.len(),
                "slab counter out of sync with registry"
            );
            let registry: FxHashSet<usize> = list.registry.iter().copied().collect();
            assert_eq!(registry.len(), list.registry.len(), "slab registered twice");

            // walk the partial list and cross-check membership flags
            let mut on_list = FxHashSet::default();
            let mut cur = list.head;
            let mut prev = 0usize;
            while cur != 0 {
                assert!(registry.contains(&cur), "listed slab not in registry");
                assert!(on_list.insert(cur), "slab linked twice into partial list");
                // safety: registry entries are live slabs; we are quiesced
                let slab = unsafe { hdr(cur) };
                assert_eq!(slab.prev.load(Ordering::Relaxed), prev, "list back-link broken");
                assert_ne!(slab.on_partial.load(Ordering::Relaxed), 0);
                prev = cur;
                cur = slab.next.load(Ordering::Relaxed);
            }
            assert_eq!(list.tail, prev, "list tail out of sync");
            assert_eq!(on_list.len(), list.len, "list length out of sync");

            for &addr in &list.registry {
                // safety: as above
                let slab = unsafe { hdr(addr) };
                let st = slab.state();
                assert!(!st.frozen(), "frozen slab at quiescence");
                assert!(st.in_use() <= slab.total_objects, "in_use out of range");

                let mut free_seen = FxHashSet::default();
                slab.walk_free_list(|idx| {
                    assert!(free_seen.insert(idx), "object on free list twice");
                });
                assert_eq!(
                    free_seen.len() as u32,
                    slab.total_objects - st.in_use(),
                    "free list length disagrees with in_use"
                );

                if st.in_use() < slab.total_objects {
                    assert!(
                        on_list.contains(&addr),
                        "slab with free objects untracked by partial list"
                    );
                } else {
                    assert!(!on_list.contains(&addr), "full slab on partial list");
                }
            }
        }
        self.stats()
    }
}
