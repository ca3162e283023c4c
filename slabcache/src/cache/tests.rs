use super::*;
use crate::page_provider::{NodeId, PageProvider, SystemPageProvider};
#[cfg(not(loom))]
use super::slab::{SlabHeader, SlabState, HEAD_NONE};
#[cfg(not(loom))]
use std::mem::size_of;

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[test]
fn types_are_send_sync() {
    assert_send::<Cache<SystemPageProvider>>();
    assert_sync::<Cache<SystemPageProvider>>();
    assert_send::<CoreHandle<'_, SystemPageProvider>>();
    assert_send::<QuiescentGuard<'_, SystemPageProvider>>();
}

/// Provider with a block budget and an order ceiling, for exhaustion and
/// order-fallback tests
struct BudgetedProvider {
    inner: SystemPageProvider,
    blocks_left: AtomicUsize,
    max_order: u8,
}

impl BudgetedProvider {
    fn new(num_nodes: usize, blocks: usize, max_order: u8) -> Self {
        Self {
            inner: SystemPageProvider::new(num_nodes),
            blocks_left: AtomicUsize::new(blocks),
            max_order,
        }
    }
}

unsafe impl PageProvider for BudgetedProvider {
    fn num_nodes(&self) -> usize {
        self.inner.num_nodes()
    }

    fn allocate_block(&self, order: u8, node: NodeId) -> Option<crate::page_provider::BackingBlock> {
        if order > self.max_order {
            return None;
        }
        self.blocks_left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| x.checked_sub(1))
            .ok()?;
        self.inner.allocate_block(order, node)
    }

    unsafe fn release_block(&self, block: crate::page_provider::BackingBlock) {
        self.blocks_left.fetch_add(1, Ordering::Relaxed);
        self.inner.release_block(block)
    }
}

#[cfg(not(loom))]
#[test]
fn slab_state_packing() {
    let st = SlabState::pack(1234, true, 77, 5);
    assert_eq!(st.generation(), 1234);
    assert!(st.frozen());
    assert_eq!(st.in_use(), 77);
    assert_eq!(st.free_head(), Some(5));

    let st = SlabState::pack(0, false, 0, HEAD_NONE);
    assert!(!st.frozen());
    assert_eq!(st.free_head(), None);

    // generation must wrap within its field without clobbering neighbors
    let st = SlabState::pack(st.next_generation(), false, 1, 0);
    let wrapped = SlabState::pack((1 << 23) - 1, true, 2, 3);
    assert_eq!(wrapped.next_generation(), 0);
    assert_eq!(st.in_use(), 1);
}

#[cfg(not(loom))]
#[test]
fn object_layout_basics() {
    let layout = slab::ObjectLayout::compute(24, 8, false);
    // link shares the object's first word when there is no constructor
    assert_eq!(layout.link_offset, 0);
    assert_eq!(layout.stride % 8, 0);
    assert!(layout.stride >= 24);
    assert!(layout.first_obj_offset >= size_of::<SlabHeader>());

    // with a constructor the link lives after the object
    let layout = slab::ObjectLayout::compute(24, 8, true);
    assert!(layout.link_offset >= 24);
    assert!(layout.stride >= layout.link_offset + 4);

    let small = slab::ObjectLayout::compute(16, 8, false);
    let per_page = small.objects_in(0);
    assert!(per_page >= 100, "expected dense packing, got {}", per_page);
    assert!(small.objects_in(1) > per_page);
}

#[cfg(not(loom))]
#[test]
fn config_derivation() {
    let cfg = CacheConfig::for_object_size(64);
    assert_eq!(cfg.overflow_objects, 30);
    assert_eq!(cfg.min_partial, 5);
    assert_eq!(cfg.strategy, Strategy::PerCoreSlab);

    let cfg = CacheConfig::for_object_size(4096);
    assert_eq!(cfg.overflow_objects, 2);
    assert_eq!(cfg.min_partial, 6);
    assert!(cfg.preferred_order >= cfg.min_order);
}

#[cfg(not(loom))]
#[test]
fn core_id_handout_and_recycling() {
    let cache = Cache::new(CacheConfig::for_object_size(64), SystemPageProvider::new(1));
    let h0 = cache.core();
    let h1 = cache.core();
    assert_eq!(h0.core_id(), 0);
    assert_eq!(h1.core_id(), 1);
    assert!(cache.try_quiesce().is_none());
    drop(h0);
    let h2 = cache.core();
    assert_eq!(h2.core_id(), 0);
    drop(h1);
    drop(h2);
    assert!(cache.try_quiesce().is_some());
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
#[should_panic(expected = "quiesced")]
fn quiesce_blocks_core_handout() {
    let cache = Cache::new(CacheConfig::for_object_size(64), SystemPageProvider::new(1));
    let _guard = cache.try_quiesce().unwrap();
    let _ = cache.core();
}

#[cfg(not(loom))]
#[test]
fn alloc_free_basic() {
    let cache = Cache::new(CacheConfig::for_object_size(64), SystemPageProvider::new(1));
    let h = cache.core();

    let a = h.alloc(NodeId(0)).unwrap();
    let b = h.alloc(NodeId(0)).unwrap();
    let c = h.alloc(NodeId(0)).unwrap();
    // sequential allocations out of a fresh slab walk it in stride order
    let stride = cache.layout.stride;
    assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + stride);
    assert_eq!(c.as_ptr() as usize, b.as_ptr() as usize + stride);

    // the memory must actually be ours to write
    for p in [a, b, c] {
        unsafe { p.as_ptr().write_bytes(0xa5, 64) };
    }

    unsafe {
        h.free(b);
        h.free(a);
        h.free(c);
    }
    drop(h);

    let guard = cache.try_quiesce().unwrap();
    let stats = guard.validate();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.slabs, 1);
    drop(guard);

    assert_eq!(cache.provider().blocks_allocated(), 1);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn freed_object_is_reused_first() {
    let cache = Cache::new(CacheConfig::for_object_size(64), SystemPageProvider::new(1));
    let h = cache.core();
    let a = h.alloc(NodeId(0)).unwrap();
    let _b = h.alloc(NodeId(0)).unwrap();
    unsafe { h.free(a) };
    // LIFO free list: the most recently freed slot comes back first
    let c = h.alloc(NodeId(0)).unwrap();
    assert_eq!(a, c);
    unsafe {
        h.free(_b);
        h.free(c);
    }
    drop(h);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn ctor_runs_once_and_state_survives_free() {
    fn init(p: std::ptr::NonNull<u8>) {
        // safety: called on a fresh, writable object slot
        unsafe { (p.as_ptr() as *mut u64).write(0xfeed_face) };
    }
    let mut cfg = CacheConfig::for_object_size(64);
    cfg.ctor = Some(init);
    let cache = Cache::new(cfg, SystemPageProvider::new(1));
    let h = cache.core();

    let a = h.alloc(NodeId(0)).unwrap();
    // safety: a is a valid 64-byte object
    assert_eq!(unsafe { (a.as_ptr() as *const u64).read() }, 0xfeed_face);
    unsafe { (a.as_ptr() as *mut u64).write(77) };
    unsafe { h.free(a) };
    // the free link lives outside the payload, so the caller's last state
    // is still there on reallocation
    let b = h.alloc(NodeId(0)).unwrap();
    assert_eq!(b, a);
    assert_eq!(unsafe { (b.as_ptr() as *const u64).read() }, 77);

    unsafe { h.free(b) };
    drop(h);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn exhausted_slab_gets_second_block() {
    let cache = Cache::new(CacheConfig::for_object_size(256), SystemPageProvider::new(1));
    let h = cache.core();
    let per_slab = cache.oo.objects() as usize;

    let mut held = Vec::new();
    for _ in 0..per_slab {
        held.push(h.alloc(NodeId(0)).unwrap());
    }
    assert_eq!(cache.provider().blocks_allocated(), 1);
    held.push(h.alloc(NodeId(0)).unwrap());
    assert_eq!(cache.provider().blocks_allocated(), 2);

    for p in held {
        unsafe { h.free(p) };
    }
    drop(h);
    let guard = cache.try_quiesce().unwrap();
    assert_eq!(guard.validate().in_use, 0);
    drop(guard);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn out_of_memory_is_reported_and_recoverable() {
    let mut cfg = CacheConfig::for_object_size(512);
    cfg.preferred_order = 0;
    cfg.min_order = 0;
    let cache = Cache::new(cfg, BudgetedProvider::new(1, 1, MAX_ORDER));
    let h = cache.core();

    let mut held = Vec::new();
    loop {
        match h.alloc(NodeId(0)) {
            Ok(p) => held.push(p),
            Err(AllocError::OutOfMemory) => break,
        }
    }
    assert_eq!(held.len(), cache.oo.objects() as usize);

    // freeing one object makes the cache usable again without new blocks
    let p = held.pop().unwrap();
    unsafe { h.free(p) };
    let q = h.alloc(NodeId(0)).unwrap();
    assert_eq!(q, p);
    held.push(q);

    for p in held {
        unsafe { h.free(p) };
    }
    drop(h);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn order_fallback_when_large_blocks_unavailable() {
    let mut cfg = CacheConfig::for_object_size(64);
    cfg.preferred_order = 3;
    cfg.min_order = 0;
    // provider refuses anything bigger than a single page
    let cache = Cache::new(cfg, BudgetedProvider::new(1, usize::MAX / 2, 0));
    let h = cache.core();

    let p = h.alloc(NodeId(0)).unwrap();
    // safety: p came from alloc on this cache
    let slab = unsafe { SlabHeader::from_object(p) };
    assert_eq!(slab.order, 0);

    unsafe { h.free(p) };
    drop(h);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn remote_free_into_frozen_slab_defers_transitions() {
    let cache = Cache::new(CacheConfig::for_object_size(64), SystemPageProvider::new(1));
    let h1 = cache.core();
    let h2 = cache.core();

    let mut held = Vec::new();
    for _ in 0..20 {
        held.push(h1.alloc(NodeId(0)).unwrap());
    }
    // safety: held[0] came from alloc on this cache
    let slab = unsafe { SlabHeader::from_object(held[0]) };
    assert!(slab.state().frozen());

    // foreign frees while the owner has the slab frozen must not touch
    // the node lists
    for p in held.drain(..10) {
        unsafe { h2.free(p) };
    }
    let st = slab.state();
    assert!(st.frozen());
    assert_eq!(st.in_use(), 10);
    assert_eq!(slab.on_partial.load(Ordering::Relaxed), 0);

    // deactivation observes the foreign frees and classifies Partial
    drop(h1);
    assert!(!slab.state().frozen());
    assert_eq!(slab.on_partial.load(Ordering::Relaxed), 1);

    for p in held {
        unsafe { h2.free(p) };
    }
    drop(h2);
    let guard = cache.try_quiesce().unwrap();
    let stats = guard.validate();
    assert_eq!(stats.in_use, 0);
    drop(guard);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn remote_borrow_ratio_zero_grows_instead() {
    let mut cfg = CacheConfig::for_object_size(64);
    cfg.remote_borrow_ratio = 0;
    let cache = Cache::new(cfg, SystemPageProvider::new(2));
    let h = cache.core();
    let x = h.alloc(NodeId(1)).unwrap();
    drop(h); // node 1 now has a partial slab with plenty of free objects

    let h = cache.core();
    let before = cache.provider().blocks_allocated();
    let y = h.alloc(NodeId(0)).unwrap();
    // safety: y came from alloc on this cache
    assert_eq!(unsafe { SlabHeader::from_object(y) }.node, NodeId(0));
    assert_eq!(cache.provider().blocks_allocated(), before + 1);

    unsafe {
        h.free(x);
        h.free(y);
    }
    drop(h);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn remote_borrow_ratio_full_prefers_remote_partial() {
    let mut cfg = CacheConfig::for_object_size(64);
    cfg.remote_borrow_ratio = 100;
    let cache = Cache::new(cfg, SystemPageProvider::new(2));
    let h = cache.core();
    let x = h.alloc(NodeId(1)).unwrap();
    drop(h);

    let h = cache.core();
    let before = cache.provider().blocks_allocated();
    let y = h.alloc(NodeId(0)).unwrap();
    // borrowed from node 1 instead of growing node 0
    assert_eq!(unsafe { SlabHeader::from_object(y) }.node, NodeId(1));
    assert_eq!(cache.provider().blocks_allocated(), before);

    unsafe {
        h.free(x);
        h.free(y);
    }
    drop(h);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn empty_slabs_kept_as_min_partial_reserve() {
    let mut cfg = CacheConfig::for_object_size(512);
    cfg.min_partial = 2;
    let cache = Cache::new(cfg, SystemPageProvider::new(1));
    let h = cache.core();
    let per_slab = cache.oo.objects() as usize;

    let mut held = Vec::new();
    for _ in 0..per_slab * 3 {
        held.push(h.alloc(NodeId(0)).unwrap());
    }
    assert_eq!(cache.provider().blocks_allocated(), 3);

    for p in held {
        unsafe { h.free(p) };
    }
    drop(h);

    let guard = cache.try_quiesce().unwrap();
    let stats = guard.validate();
    assert_eq!(stats.in_use, 0);
    // empty slabs above the reserve floor went back to the provider
    assert_eq!(stats.slabs, 2);
    assert_eq!(guard.partial_len(NodeId(0)), 2);
    drop(guard);
    assert_eq!(cache.provider().blocks_released(), 1);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn emptied_untracked_slab_released_without_reserve() {
    // two objects per slab: two foreign frees walk it Full -> Partial ->
    // Released with the reserve floor at zero
    let mut cfg = CacheConfig::for_object_size(1600);
    cfg.preferred_order = 0;
    cfg.min_order = 0;
    cfg.min_partial = 0;
    let cache = Cache::new(cfg, SystemPageProvider::new(1));
    assert_eq!(cache.oo.objects(), 2);
    let h1 = cache.core();
    let h2 = cache.core();
    let a = h1.alloc(NodeId(0)).unwrap();
    let b = h1.alloc(NodeId(0)).unwrap();
    drop(h1); // slab deactivates Full: unfrozen, untracked

    unsafe {
        h2.free(a); // first free object: Full -> Partial
        h2.free(b); // last outstanding object: Partial -> Released
    }
    assert_eq!(cache.provider().blocks_released(), 1);
    drop(h2);

    let guard = cache.try_quiesce().unwrap();
    let stats = guard.validate();
    assert_eq!(stats.slabs, 0);
    assert_eq!(stats.in_use, 0);
    drop(guard);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn exhausted_slab_pops_report_empty() {
    let provider = SystemPageProvider::new(1);
    let block = provider.allocate_block(0, NodeId(0)).unwrap();
    let layout = slab::ObjectLayout::compute(512, 8, false);
    // safety: the block is fresh and exclusively ours
    let slab = unsafe { SlabHeader::format(&block, &layout, None, true) };
    let mut got = 0u32;
    loop {
        match slab.try_pop_once() {
            slab::PopOnce::Got(_) => got += 1,
            slab::PopOnce::Empty => break,
            slab::PopOnce::Raced => panic!("uncontended pop raced"),
        }
    }
    assert_eq!(got, slab.total_objects);
    // empty is a stable verdict, not a retriable race
    assert!(matches!(slab.try_pop_once(), slab::PopOnce::Empty));
    // safety: the header is unreachable from any container
    unsafe { provider.release_block(slab.retire()) };
}

#[cfg(not(loom))]
#[test]
fn preferred_order_bounds_slack() {
    let l = slab::ObjectLayout::compute(64, 8, false);
    assert_eq!(l.preferred_order(), Some(0));
    // two objects per page is below the minimum batch; order 1 holds five
    // with almost no slack
    let l = slab::ObjectLayout::compute(1600, 8, false);
    assert_eq!(l.preferred_order(), Some(1));

    for size in [32usize, 192, 700, 3000] {
        let l = slab::ObjectLayout::compute(size, 8, false);
        let o = l.preferred_order().unwrap();
        assert!(l.objects_in(o) >= 4, "size {}: too few objects", size);
        if l.slack_in(o) * 16 >= crate::page_provider::block_size(o) {
            // only the capped fallback may exceed the slack bound, and
            // only when every smaller order holds too few objects
            assert!((0..o).all(|x| l.objects_in(x) < 4), "size {}", size);
        }
    }
}

#[cfg(not(loom))]
#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal() {
    let cache = Cache::new(CacheConfig::for_object_size(64), SystemPageProvider::new(1));
    let h = cache.core();
    let p = h.alloc(NodeId(0)).unwrap();
    unsafe {
        h.free(p);
        h.free(p);
    }
}

#[cfg(not(loom))]
#[test]
#[should_panic(expected = "inside slab metadata")]
fn free_into_metadata_is_fatal() {
    let cache = Cache::new(CacheConfig::for_object_size(64), SystemPageProvider::new(1));
    let h = cache.core();
    let p = h.alloc(NodeId(0)).unwrap();
    // points into the slab header region of the same block
    let base = (p.as_ptr() as usize) & !(crate::page_provider::SLAB_ALIGN - 1);
    let bogus = unsafe { std::ptr::NonNull::new_unchecked((base + 8) as *mut u8) };
    unsafe { h.free(bogus) };
}

#[cfg(not(loom))]
#[test]
#[should_panic(expected = "object boundary")]
fn misaligned_free_is_fatal() {
    let cache = Cache::new(CacheConfig::for_object_size(64), SystemPageProvider::new(1));
    let h = cache.core();
    let p = h.alloc(NodeId(0)).unwrap();
    let bogus = unsafe { std::ptr::NonNull::new_unchecked(p.as_ptr().add(1)) };
    unsafe { h.free(bogus) };
}

#[cfg(not(loom))]
#[test]
#[should_panic(expected = "still allocated")]
fn destroy_with_outstanding_objects_is_fatal() {
    let cache = Cache::new(CacheConfig::for_object_size(64), SystemPageProvider::new(1));
    {
        let h = cache.core();
        let _leaked = h.alloc(NodeId(0)).unwrap();
    }
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn two_thread_producer_consumer() {
    let cache = Cache::new(CacheConfig::for_object_size(64), SystemPageProvider::new(1));
    let (tx, rx) = std::sync::mpsc::sync_channel::<usize>(64);

    std::thread::scope(|scope| {
        let cache = &cache;
        scope.spawn(move || {
            let h = cache.core();
            for i in 0..10_000u64 {
                let p = h.alloc(NodeId(0)).unwrap();
                // safety: p is a valid 64-byte object
                unsafe { (p.as_ptr() as *mut u64).write(i) };
                tx.send(p.as_ptr() as usize).unwrap();
            }
        });
        scope.spawn(move || {
            let h = cache.core();
            let mut expected = 0u64;
            while let Ok(addr) = rx.recv() {
                // safety: addr was just produced by the other thread and
                // is not referenced anywhere else
                unsafe {
                    let p = std::ptr::NonNull::new_unchecked(addr as *mut u8);
                    assert_eq!((p.as_ptr() as *const u64).read(), expected);
                    h.free(p);
                }
                expected += 1;
            }
            assert_eq!(expected, 10_000);
        });
    });

    let guard = cache.try_quiesce().unwrap();
    let stats = guard.validate();
    assert_eq!(stats.in_use, 0);
    drop(guard);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn magazine_basic_and_lifo_reuse() {
    let mut cfg = CacheConfig::for_object_size(64);
    cfg.strategy = Strategy::Magazine;
    let cache = Cache::new(cfg, SystemPageProvider::new(1));
    let h = cache.core();

    let a = h.alloc(NodeId(0)).unwrap();
    unsafe { a.as_ptr().write_bytes(0x5a, 64) };
    unsafe { h.free(a) };
    // frees land in the magazine and come straight back
    let b = h.alloc(NodeId(0)).unwrap();
    assert_eq!(a, b);
    unsafe { h.free(b) };
    drop(h);

    let guard = cache.try_quiesce().unwrap();
    assert_eq!(guard.validate().in_use, 0);
    drop(guard);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn magazine_flushes_batches_and_balances() {
    let mut cfg = CacheConfig::for_object_size(256);
    cfg.strategy = Strategy::Magazine;
    let cache = Cache::new(cfg, SystemPageProvider::new(1));
    let h = cache.core();

    // churn well past the magazine limit to force refills and flushes
    let mut held = Vec::new();
    for round in 0..8 {
        for _ in 0..100 {
            held.push(h.alloc(NodeId(0)).unwrap());
        }
        let keep = if round % 2 == 0 { 25 } else { 0 };
        while held.len() > keep {
            let p = held.pop().unwrap();
            unsafe { h.free(p) };
        }
    }
    for p in held.drain(..) {
        unsafe { h.free(p) };
    }
    drop(h);

    let guard = cache.try_quiesce().unwrap();
    let stats = guard.validate();
    assert_eq!(stats.in_use, 0);
    drop(guard);
    cache.destroy();
}

#[cfg(not(loom))]
#[test]
fn magazine_two_threads() {
    let mut cfg = CacheConfig::for_object_size(64);
    cfg.strategy = Strategy::Magazine;
    let cache = Cache::new(cfg, SystemPageProvider::new(1));
    let (tx, rx) = std::sync::mpsc::sync_channel::<usize>(64);

    std::thread::scope(|scope| {
        let cache = &cache;
        scope.spawn(move || {
            let h = cache.core();
            for _ in 0..5_000 {
                let p = h.alloc(NodeId(0)).unwrap();
                tx.send(p.as_ptr() as usize).unwrap();
            }
        });
        scope.spawn(move || {
            let h = cache.core();
            while let Ok(addr) = rx.recv() {
                // safety: ownership of the object was just handed over
                unsafe { h.free(std::ptr::NonNull::new_unchecked(addr as *mut u8)) };
            }
        });
    });

    let guard = cache.try_quiesce().unwrap();
    assert_eq!(guard.validate().in_use, 0);
    drop(guard);
    cache.destroy();
}

#[cfg(loom)]
mod loom_models {
    use super::*;
    use loom::thread;

    fn small_cfg() -> CacheConfig {
        // few objects per slab keeps the state space tractable
        let mut cfg = CacheConfig::for_object_size(1024);
        cfg.preferred_order = 0;
        cfg.min_order = 0;
        cfg
    }

    #[test]
    fn core_ids_unique_under_race() {
        loom::model(|| {
            let cache: &'static Cache<SystemPageProvider> = Box::leak(Box::new(Cache::new(
                small_cfg(),
                SystemPageProvider::new(1),
            )));
            let t1 = thread::spawn(move || cache.core().core_id());
            let t2 = thread::spawn(move || cache.core().core_id());
            let a = t1.join().unwrap();
            let b = t2.join().unwrap();
            assert_ne!(a, b);
        });
    }

    #[test]
    fn foreign_free_races_owner_alloc() {
        loom::model(|| {
            let cache: &'static Cache<SystemPageProvider> = Box::leak(Box::new(Cache::new(
                small_cfg(),
                SystemPageProvider::new(1),
            )));
            let h0 = cache.core();
            let p = h0.alloc(NodeId(0)).unwrap();
            let addr = p.as_ptr() as usize;

            let t = thread::spawn(move || {
                let h1 = cache.core();
                // safety: the object is live and this is its only owner
                unsafe {
                    h1.free(std::ptr::NonNull::new_unchecked(addr as *mut u8));
                }
            });

            // the owner's pop contends on the same slab word as the
            // foreign push
            let q = h0.alloc(NodeId(0)).unwrap();
            t.join().unwrap();
            // safety: q is live and owned here
            unsafe { h0.free(q) };
            drop(h0);

            let guard = cache.try_quiesce().unwrap();
            let stats = guard.validate();
            assert_eq!(stats.in_use, 0);
        });
    }

    #[test]
    fn racing_frees_release_emptied_slab() {
        loom::model(|| {
            // two objects per slab and no reserve floor: the two racing
            // foreign frees drive it Full -> Partial -> Released, and the
            // transition taking the node lock must not let the other
            // freer touch the header after the release
            let mut cfg = CacheConfig::for_object_size(1600);
            cfg.preferred_order = 0;
            cfg.min_order = 0;
            cfg.min_partial = 0;
            let cache: &'static Cache<SystemPageProvider> = Box::leak(Box::new(Cache::new(
                cfg,
                SystemPageProvider::new(1),
            )));
            let h0 = cache.core();
            let a = h0.alloc(NodeId(0)).unwrap().as_ptr() as usize;
            let b = h0.alloc(NodeId(0)).unwrap().as_ptr() as usize;
            drop(h0); // slab deactivates Full: unfrozen, untracked

            let free_one = |addr: usize| {
                thread::spawn(move || {
                    let h = cache.core();
                    // safety: each thread frees a distinct live object
                    unsafe {
                        h.free(std::ptr::NonNull::new_unchecked(addr as *mut u8));
                    }
                })
            };
            let t1 = free_one(a);
            let t2 = free_one(b);
            t1.join().unwrap();
            t2.join().unwrap();

            let guard = cache.try_quiesce().unwrap();
            let stats = guard.validate();
            assert_eq!(stats.slabs, 0);
            assert_eq!(stats.in_use, 0);
            assert_eq!(
                cache.provider().blocks_released(),
                cache.provider().blocks_allocated()
            );
        });
    }

    #[test]
    fn concurrent_foreign_frees_conserve_objects() {
        loom::model(|| {
            let cache: &'static Cache<SystemPageProvider> = Box::leak(Box::new(Cache::new(
                small_cfg(),
                SystemPageProvider::new(1),
            )));
            let h0 = cache.core();
            let a = h0.alloc(NodeId(0)).unwrap().as_ptr() as usize;
            let b = h0.alloc(NodeId(0)).unwrap().as_ptr() as usize;
            drop(h0); // slab goes to the node partial list unfrozen

            let free_one = |addr: usize| {
                thread::spawn(move || {
                    let h = cache.core();
                    // safety: each thread frees a distinct live object
                    unsafe {
                        h.free(std::ptr::NonNull::new_unchecked(addr as *mut u8));
                    }
                })
            };
            let t1 = free_one(a);
            let t2 = free_one(b);
            t1.join().unwrap();
            t2.join().unwrap();

            let guard = cache.try_quiesce().unwrap();
            let stats = guard.validate();
            assert_eq!(stats.in_use, 0);
        });
    }
}
