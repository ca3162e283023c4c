//! Array-cache front end: a bounded per-core array of ready object
//! addresses, refilled from and flushed to the node partial lists a
//! batch at a time. Slabs are never frozen under this strategy; every
//! slab-level transition happens under the owning node's lock.

use std::{cell::RefCell, ptr::NonNull};

use tracing::Level;

use super::{hdr, slab::SlabHeader, AllocError, Cache, CoreSlot};
use crate::{
    page_provider::{NodeId, PageProvider},
    util::UsizePtr,
};

/// Per-core object array. Owner-mutated only, like [super::SlabSlot].
pub(super) struct Magazine {
    /// Object addresses ready to hand out; index 0 is the oldest
    objs: RefCell<Vec<usize>>,
    /// Objects moved per refill or flush
    batch: usize,
    /// Array capacity; a free when full flushes one batch first
    limit: usize,
}

impl Magazine {
    pub(super) fn new(cfg: &super::CacheConfig) -> Self {
        let batch = cfg.overflow_objects.max(1);
        let limit = batch * 2;
        Self {
            objs: RefCell::new(Vec::with_capacity(limit)),
            batch,
            limit,
        }
    }
}

impl<P: PageProvider> Cache<P> {
    pub(super) fn magazine_alloc(
        &self,
        slot: &CoreSlot,
        mag: &Magazine,
        node: NodeId,
    ) -> Result<NonNull<u8>, AllocError> {
        if let Some(addr) = mag.objs.borrow_mut().pop() {
            // safety: addresses in the magazine came from live slabs
            return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
        }
        self.magazine_refill(slot, mag, node)?;
        let addr = mag
            .objs
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| panic!("magazine refill produced no objects"));
        // safety: as above
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Fill the magazine up to one batch: requesting node's partial list
    /// first, then remote nodes per the borrow policy, then a fresh slab
    fn magazine_refill(
        &self,
        slot: &CoreSlot,
        mag: &Magazine,
        node: NodeId,
    ) -> Result<(), AllocError> {
        let trace_span = tracing::span!(Level::TRACE, "cache::magazine_refill", node = node.0);
        let _span_enter = trace_span.enter();

        if self.magazine_refill_from(mag, node) > 0 {
            return Ok(());
        }
        if self.should_borrow_remote(slot) {
            let n = self.nodes.len() as i64;
            let from = node.0 as i64;
            for d in 1..n {
                for cand in [from - d, from + d] {
                    if cand < 0 || cand >= n {
                        continue;
                    }
                    if self.magazine_refill_from(mag, NodeId(cand as u32)) > 0 {
                        tracing::event!(
                            Level::TRACE,
                            from = node.0,
                            borrowed = cand,
                            "remote borrow"
                        );
                        return Ok(());
                    }
                }
            }
        }

        // grow: one fresh (unfrozen) slab, drained straight into the
        // magazine before anyone else can reach it
        let slab = self.new_slab(node, false)?;
        let mut objs = mag.objs.borrow_mut();
        let mut got = 0;
        while got < mag.batch {
            match slab.pop_spin() {
                Some(idx) => {
                    objs.push(slab.object_addr(idx).as_ptr() as usize);
                    got += 1;
                }
                None => break,
            }
        }
        drop(objs);
        if slab.free_objects() > 0 {
            let mut list = self.nodes[slab.node.0 as usize].lock();
            list.push_tail(slab);
        }
        Ok(())
    }

    /// Pop up to one batch of objects off `node`'s partial slabs, front
    /// of the list first, unlinking each slab that runs dry. Returns how
    /// many objects were obtained.
    fn magazine_refill_from(&self, mag: &Magazine, node: NodeId) -> usize {
        let node_part = &self.nodes[node.0 as usize];
        let mut list = node_part.lock();
        let mut objs = mag.objs.borrow_mut();
        let mut got = 0;
        while got < mag.batch {
            let head = list.head;
            if head == 0 {
                break;
            }
            // safety: the list holds live slabs owned by this node
            let slab = unsafe { hdr(head) };
            match slab.pop_spin() {
                Some(idx) => {
                    objs.push(slab.object_addr(idx).as_ptr() as usize);
                    got += 1;
                    // a slab popped empty leaves the list; a racing free
                    // that refills it re-inserts via the full-to-partial
                    // transition, which serializes on this lock
                    if slab.state().free_head().is_none() {
                        list.unlink(slab);
                    }
                }
                None => list.unlink(slab),
            }
        }
        got
    }

    /// Free into the magazine, flushing the oldest batch back to the
    /// slabs when the array is at capacity
    pub(super) fn magazine_free(&self, mag: &Magazine, ptr: NonNull<u8>) {
        let mut objs = mag.objs.borrow_mut();
        if objs.len() >= mag.limit {
            tracing::event!(
                Level::TRACE,
                batch = mag.batch,
                "magazine full, flushing"
            );
            let flushed: Vec<usize> = objs.drain(..mag.batch).collect();
            drop(objs);
            for addr in flushed {
                self.magazine_free_one(addr);
            }
            objs = mag.objs.borrow_mut();
        }
        objs.push(ptr.as_ptr() as usize);
    }

    fn magazine_free_one(&self, addr: usize) {
        // safety: magazine entries came from live slabs of this cache
        let ptr = unsafe { NonNull::new_unchecked(addr as *mut u8) };
        let slab = unsafe { SlabHeader::from_object(ptr) };
        let idx = slab.index_of(ptr);
        self.free_slow(slab, idx);
    }

    /// Return every magazine object to its slab (handle drop)
    pub(super) fn flush_magazine(&self, mag: &Magazine) {
        let objs: Vec<usize> = mag.objs.borrow_mut().drain(..).collect();
        if !objs.is_empty() {
            tracing::event!(
                Level::TRACE,
                count = objs.len(),
                mag = ?UsizePtr::from(mag),
                "magazine drained"
            );
        }
        for addr in objs {
            self.magazine_free_one(addr);
        }
    }
}
