//! paged-slots: a generational slot allocator that stores values in
//! lazily allocated, fixed-size pages and hands out stable, typed handles.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: long-lived, frequently created and destroyed objects (GPU
//!   resource wrappers, entity-like records, cached handles) addressed by
//!   small opaque keys instead of pointers, with stale keys detected and
//!   memory tracking the live count rather than the historical peak.
//! - Layers:
//!   - `key`: packs (generation, index) into one integer (`RawKey`) and
//!     wraps it in a value-typed `SlotKey<T, R>`.
//!   - `page`: `PageTable` backs each page with memory from an injected
//!     `PageAllocator` while it has live slots and frees it on the last
//!     release.
//!   - `free_list`: reserved indices waiting for reuse, already stamped
//!     with the generation their next occupant gets.
//!   - `PagedSlotAllocator<T, R, A, PAGE_SIZE>`: the slot table plus the
//!     insert/get/remove/clear state machine.
//!
//! Constraints
//! - Single owner: mutation needs `&mut self`; no internal locking. Wrap
//!   the allocator in a lock to share it across threads.
//! - No per-value heap allocation; values are written in place in pages
//!   and never move while live.
//! - Keys are plain data. A key resolves iff the slot table holds exactly
//!   that key; generation 0 never resolves.
//! - Capacity grows one page of indices at a time and only when the free
//!   list is empty. A page whose values are all removed keeps its index
//!   range but gives its memory back immediately.
//! - One page must fit in the key's index space. If pages do not divide it
//!   evenly, the trailing partial page is never reserved.
//!
//! Slot lifecycle
//! - Unreserved -> free (seeded at generation 1 when its page is reserved)
//!   -> live (insert) -> free at generation + 1 (remove) -> ... -> retired.
//! - Removal unlinks the slot before the value is handed back, so a value's
//!   `Drop` runs against a consistent allocator.
//! - Removing through a stale key is a no-op, so best-effort cleanup does
//!   not need to track liveness.
//!
//! Overflow semantics
//! - When a slot at the key type's `MAX_GENERATION` is removed, its index is
//!   retired instead of wrapping to a generation an old key might still
//!   carry. Retirements are counted in `Stats::overflows` and logged at
//!   warn level. Pick a wider `RawKey` (`u128`) if a workload can
//!   realistically saturate 32-bit generations on one index.
//!
//! Notes and non-goals
//! - No serialization, no type erasure, no ordering guarantee for `iter`.
//! - No content-ID cache, reference counting or process-wide singleton;
//!   compose those on top using the public operations.
//! - `clear` restarts the index space, so keys from before a `clear` must
//!   be discarded by the caller.

mod free_list;
pub mod key;
pub mod page;
mod paged_slot_allocator;
mod paged_slot_allocator_proptest;

// Public surface
pub use free_list::ReuseOrder;
pub use key::{RawKey, SlotKey};
pub use page::{AllocError, Global, PageAllocator};
pub use paged_slot_allocator::{PagedSlotAllocator, Stats};
