//! Concurrency-safe fixed-size object cache.
//!
//! Objects of one size class are carved out of power-of-two backing
//! blocks obtained from a pluggable [page provider](page_provider).
//! Allocation and free are lock-free in the common case: each core works
//! out of its own *frozen* slab whose free list and counters live in a
//! single generation-tagged atomic word, and cross-core frees CAS that
//! same word without ever touching another core's state. Per-NUMA-node
//! locked lists of partial slabs back the per-core fast path.
//!
//! See [cache::Cache] for the main entry point and the module docs of
//! [cache] for the design.

pub mod cache;
pub mod page_provider;
pub mod util;

pub(crate) mod loom_testing;
