//! Interface to the lower-level contiguous-page provider.
//!
//! The cache layer never manages raw pages itself. It asks a
//! [PageProvider] for power-of-two-sized backing blocks, carves objects
//! out of them, and eventually hands the blocks back. Providers tag each
//! block with the NUMA node it came from; allocation failure is a normal,
//! retriable condition (the cache falls back to smaller orders before
//! reporting out-of-memory).
//!
//! Blocks are required to be aligned to [SLAB_ALIGN]. This is what makes
//! the page→metadata mapping constant-time: any address inside a block can
//! be masked down to the block base, where the out-of-band slab metadata
//! lives.

use std::{alloc, alloc::Layout, ptr::NonNull, sync::atomic::Ordering};

use crate::loom_testing::*;

/// log2 of the size of the smallest allocation unit handed out by a provider
pub const PAGE_SHIFT: usize = 12; // 4 K
/// Size in bytes of the smallest allocation unit
pub const PAGE_SZ: usize = 1 << PAGE_SHIFT;
/// Largest supported block order (a block spans `PAGE_SZ << order` bytes)
pub const MAX_ORDER: u8 = 10;
/// Alignment of every backing block.
///
/// Equal to the size of a max-order block, so that masking any interior
/// address with `!(SLAB_ALIGN - 1)` yields the block base regardless of the
/// block's actual order.
pub const SLAB_ALIGN: usize = PAGE_SZ << MAX_ORDER; // 4 M

/// Size in bytes of a block of the given order
pub const fn block_size(order: u8) -> usize {
    PAGE_SZ << order
}

/// Identifies a NUMA node (a locality domain)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub u32);

/// One contiguous backing block obtained from a [PageProvider]
#[derive(Debug)]
pub struct BackingBlock {
    /// Base address; aligned to [SLAB_ALIGN]
    pub base: NonNull<u8>,
    /// The block spans `PAGE_SZ << order` bytes
    pub order: u8,
    /// Node the block's memory belongs to
    pub node: NodeId,
}

/// Source/sink of backing blocks.
///
/// # Safety
///
/// Implementations must return blocks that are valid for reads and writes
/// over their whole span, aligned to [SLAB_ALIGN], and not handed out twice
/// before being released.
pub unsafe trait PageProvider {
    /// Number of NUMA nodes this provider spans. Node ids are `0..num_nodes`.
    fn num_nodes(&self) -> usize;

    /// Obtain a block of `PAGE_SZ << order` bytes, preferably on `node`.
    ///
    /// `None` is a normal, retriable failure.
    fn allocate_block(&self, order: u8, node: NodeId) -> Option<BackingBlock>;

    /// Return a block previously obtained from [allocate_block](Self::allocate_block).
    ///
    /// # Safety
    ///
    /// No live references into the block may remain.
    unsafe fn release_block(&self, block: BackingBlock);
}

/// [PageProvider] backed by the host heap.
///
/// NUMA nodes are emulated: blocks are tagged with the requested node id
/// but all come from the same heap. That is sufficient for exercising the
/// cache's node-placement logic; a real provider would bind memory to the
/// node it reports.
pub struct SystemPageProvider {
    num_nodes: usize,
    blocks_allocated: AtomicUsize,
    blocks_released: AtomicUsize,
}

impl SystemPageProvider {
    pub fn new(num_nodes: usize) -> Self {
        assert!(num_nodes >= 1);
        Self {
            num_nodes,
            blocks_allocated: AtomicUsize::new(0),
            blocks_released: AtomicUsize::new(0),
        }
    }

    /// Total number of blocks handed out so far
    pub fn blocks_allocated(&self) -> usize {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    /// Total number of blocks returned so far
    pub fn blocks_released(&self) -> usize {
        self.blocks_released.load(Ordering::Relaxed)
    }

    fn layout_for(order: u8) -> Layout {
        // cannot fail: block_size is a nonzero power of two <= SLAB_ALIGN
        match Layout::from_size_align(block_size(order), SLAB_ALIGN) {
            Ok(x) => x,
            Err(_) => unreachable!(),
        }
    }
}

unsafe impl PageProvider for SystemPageProvider {
    fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    fn allocate_block(&self, order: u8, node: NodeId) -> Option<BackingBlock> {
        assert!(order <= MAX_ORDER);
        assert!((node.0 as usize) < self.num_nodes);
        // safety: layout has nonzero size
        let p = unsafe { alloc::alloc_zeroed(Self::layout_for(order)) };
        let base = NonNull::new(p)?;
        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
        Some(BackingBlock { base, order, node })
    }

    unsafe fn release_block(&self, block: BackingBlock) {
        self.blocks_released.fetch_add(1, Ordering::Relaxed);
        alloc::dealloc(block.base.as_ptr(), Self::layout_for(block.order));
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn block_alignment_and_counters() {
        let provider = SystemPageProvider::new(2);
        let block = provider.allocate_block(1, NodeId(1)).unwrap();
        assert_eq!(block.base.as_ptr() as usize & (SLAB_ALIGN - 1), 0);
        assert_eq!(block.order, 1);
        assert_eq!(block.node, NodeId(1));
        assert_eq!(provider.blocks_allocated(), 1);
        assert_eq!(provider.blocks_released(), 0);
        unsafe { provider.release_block(block) };
        assert_eq!(provider.blocks_released(), 1);
    }

    #[test]
    fn block_sizes() {
        assert_eq!(block_size(0), PAGE_SZ);
        assert_eq!(block_size(3), PAGE_SZ * 8);
        assert_eq!(block_size(MAX_ORDER), SLAB_ALIGN);
    }
}
