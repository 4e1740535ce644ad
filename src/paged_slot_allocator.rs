//! PagedSlotAllocator: generational slots stored in lazily backed pages.

use crate::free_list::{FreeList, ReuseOrder};
use crate::key::{RawKey, SlotKey};
use crate::page::{AllocError, Global, PageAllocator, PageTable};
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::{Index, IndexMut};
use core::ptr;

/// Monotonic counters describing page traffic and retirements.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Pages requested from the page allocator.
    pub page_allocations: u64,
    /// Pages returned to the page allocator.
    pub page_deallocations: u64,
    /// Removals that found the generation saturated and retired the index.
    pub overflows: u64,
}

/// Handle-based store of `T`s, packed `PAGE_SIZE / size_of::<T>()` to a page.
///
/// - `insert` returns a `SlotKey` that resolves until that value is removed.
/// - Stale keys (removed, or from before the index was reused) resolve to
///   nothing, and removing through them is a no-op.
/// - Values never move while live, and page memory is only held for pages
///   with at least one live value.
///
/// Mutation takes `&mut self`; there is no internal synchronization.
pub struct PagedSlotAllocator<
    T,
    R: RawKey = u64,
    A: PageAllocator = Global,
    const PAGE_SIZE: usize = 4096,
> {
    slot_table: Vec<R>,
    free_list: FreeList<R>,
    pages: PageTable<T, A, PAGE_SIZE>,
    len: usize,
    retired: usize,
    overflows: u64,
    _owns: PhantomData<T>,
}

// SAFETY: the allocator uniquely owns its values and pages; the raw page
// pointers are never shared outside of borrows of `self`.
unsafe impl<T, R, A, const PAGE_SIZE: usize> Send for PagedSlotAllocator<T, R, A, PAGE_SIZE>
where
    T: Send,
    R: RawKey,
    A: PageAllocator + Send,
{
}

// SAFETY: `&self` only hands out `&T`.
unsafe impl<T, R, A, const PAGE_SIZE: usize> Sync for PagedSlotAllocator<T, R, A, PAGE_SIZE>
where
    T: Sync,
    R: RawKey,
    A: PageAllocator + Sync,
{
}

impl<T> PagedSlotAllocator<T> {
    pub fn new() -> Self {
        Self::with_allocator(Global)
    }

    pub fn with_reuse_order(order: ReuseOrder) -> Self {
        Self::with_allocator_and_reuse_order(Global, order)
    }
}

impl<T, R, A, const PAGE_SIZE: usize> Default for PagedSlotAllocator<T, R, A, PAGE_SIZE>
where
    R: RawKey,
    A: PageAllocator + Default,
{
    fn default() -> Self {
        Self::with_allocator(A::default())
    }
}

impl<T, R, A, const PAGE_SIZE: usize> PagedSlotAllocator<T, R, A, PAGE_SIZE>
where
    R: RawKey,
    A: PageAllocator,
{
    /// Number of values stored in one page.
    ///
    /// One page must fit in the key's index space. When it does not divide
    /// that space evenly, the trailing partial page is never reserved.
    pub const VALUES_PER_PAGE: usize = {
        let n = PageTable::<T, A, PAGE_SIZE>::VALUES_PER_PAGE;
        assert!(
            (n - 1) as u64 <= R::MAX_INDEX,
            "one page holds more values than the key type can index"
        );
        n
    };

    pub fn with_allocator(allocator: A) -> Self {
        Self::with_allocator_and_reuse_order(allocator, ReuseOrder::default())
    }

    pub fn with_allocator_and_reuse_order(allocator: A, order: ReuseOrder) -> Self {
        // Force the page geometry checks for this instantiation.
        let _ = Self::VALUES_PER_PAGE;
        Self {
            slot_table: Vec::new(),
            free_list: FreeList::new(order),
            pages: PageTable::new(allocator),
            len: 0,
            retired: 0,
            overflows: 0,
            _owns: PhantomData,
        }
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of reserved indices (live, free and retired).
    pub fn capacity(&self) -> usize {
        self.slot_table.len()
    }

    /// Number of pages currently backed by memory.
    pub fn allocated_pages(&self) -> usize {
        self.pages.allocated_pages()
    }

    /// Number of indices retired by generation overflow since the last
    /// `clear`.
    pub fn retired(&self) -> usize {
        self.retired
    }

    pub fn reuse_order(&self) -> ReuseOrder {
        self.free_list.order()
    }

    pub fn allocator(&self) -> &A {
        self.pages.allocator()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            page_allocations: self.pages.allocations(),
            page_deallocations: self.pages.deallocations(),
            overflows: self.overflows,
        }
    }

    /// Store `value` and return its key.
    ///
    /// Aborts through `std::alloc::handle_alloc_error` if a page cannot be
    /// allocated and panics if the key type's index space is exhausted.
    pub fn insert(&mut self, value: T) -> SlotKey<T, R> {
        self.insert_with(|_| value)
    }

    /// Store the value built by `f`, which receives the key the value will
    /// live under. Failure behaviour is that of `insert`.
    pub fn insert_with<F>(&mut self, f: F) -> SlotKey<T, R>
    where
        F: FnOnce(SlotKey<T, R>) -> T,
    {
        match self.try_insert_with(f) {
            Ok(key) => key,
            Err(AllocError::OutOfMemory { layout }) => std::alloc::handle_alloc_error(layout),
            Err(AllocError::IndexSpaceExhausted) => {
                panic!("PagedSlotAllocator: slot index space exhausted")
            }
        }
    }

    /// Fallible `insert`. On error the allocator is unchanged and `value`
    /// is dropped.
    pub fn try_insert(&mut self, value: T) -> Result<SlotKey<T, R>, AllocError> {
        self.try_insert_with(|_| value)
    }

    /// Fallible `insert_with`. `f` runs before anything is committed, so a
    /// panic in `f` leaves the allocator unchanged.
    pub fn try_insert_with<F>(&mut self, f: F) -> Result<SlotKey<T, R>, AllocError>
    where
        F: FnOnce(SlotKey<T, R>) -> T,
    {
        if self.free_list.is_empty() {
            self.grow()?;
        }
        let raw = self.free_list.peek().ok_or(AllocError::IndexSpaceExhausted)?;
        let (generation, index) = raw.decode();
        debug_assert!(generation != 0, "free list holds a null generation");
        let key = SlotKey::from_raw(raw);
        let value = f(key);

        let index = index as usize;
        let slot = self.pages.acquire(index)?;
        self.free_list.pop();
        // SAFETY: `acquire` returned in-bounds, suitably aligned storage for
        // a slot that holds no value (it was on the free list).
        unsafe { slot.as_ptr().write(value) };
        self.slot_table[index] = raw;
        self.len += 1;
        Ok(key)
    }

    /// Reserve one more page worth of indices and seed them into the free
    /// list at generation 1.
    fn grow(&mut self) -> Result<(), AllocError> {
        let start = self.slot_table.len();
        let end = start + Self::VALUES_PER_PAGE;
        if (end - 1) as u64 > R::MAX_INDEX {
            return Err(AllocError::IndexSpaceExhausted);
        }
        self.pages.reserve_page();
        self.slot_table.resize(end, R::NULL);
        self.free_list.seed(start as u64..end as u64);
        log::trace!(
            "reserved indices {}..{} (page {})",
            start,
            end,
            self.pages.reserved_pages() - 1
        );
        Ok(())
    }

    /// Slot-table index for `key` if it refers to a live value.
    #[inline]
    fn live_index(&self, key: SlotKey<T, R>) -> Option<usize> {
        let (generation, index) = key.to_raw().decode();
        if generation == 0 {
            return None;
        }
        let index = usize::try_from(index).ok()?;
        (*self.slot_table.get(index)? == key.to_raw()).then_some(index)
    }

    pub fn contains_key(&self, key: SlotKey<T, R>) -> bool {
        self.live_index(key).is_some()
    }

    pub fn get(&self, key: SlotKey<T, R>) -> Option<&T> {
        let index = self.live_index(key)?;
        let slot = self.pages.slot(index)?;
        // SAFETY: live slots hold an initialized value; the shared borrow of
        // `self` prevents removal for the lifetime of the reference.
        Some(unsafe { &*slot.as_ptr() })
    }

    pub fn get_mut(&mut self, key: SlotKey<T, R>) -> Option<&mut T> {
        let index = self.live_index(key)?;
        let slot = self.pages.slot(index)?;
        // SAFETY: as in `get`, with exclusivity from `&mut self`.
        Some(unsafe { &mut *slot.as_ptr() })
    }

    /// Remove the value behind `key` and return it.
    ///
    /// A stale, null or foreign key is ignored and yields `None`.
    pub fn remove(&mut self, key: SlotKey<T, R>) -> Option<T> {
        let index = self.live_index(key)?;
        let slot = self.pages.slot(index)?;
        // SAFETY: the slot is live; marking it free below ensures the value
        // is not read or dropped again.
        let value = unsafe { slot.as_ptr().read() };
        self.slot_table[index] = R::NULL;
        self.len -= 1;
        self.pages.release(index);

        let generation = key.generation();
        if generation < R::MAX_GENERATION {
            self.free_list.push(R::encode(generation + 1, index as u64));
        } else {
            self.retired += 1;
            self.overflows += 1;
            log::warn!(
                "slot {} reached generation {} and was retired ({} retired)",
                index,
                generation,
                self.retired
            );
        }
        Some(value)
    }

    /// Drop every value and release every page. The index space restarts
    /// at generation 1, so keys issued before `clear` must not be kept.
    pub fn clear(&mut self) {
        let slot_table = mem::take(&mut self.slot_table);
        let dropped = self.len;
        self.free_list.clear();
        self.len = 0;
        self.retired = 0;

        // Pages are released even if a destructor panics; values not yet
        // dropped at that point are leaked.
        struct ReleaseAll<'a, T, A: PageAllocator, const P: usize>(&'a mut PageTable<T, A, P>);
        impl<T, A: PageAllocator, const P: usize> Drop for ReleaseAll<'_, T, A, P> {
            fn drop(&mut self) {
                self.0.release_all();
            }
        }

        let pages = ReleaseAll(&mut self.pages);
        let released = pages.0.allocated_pages();
        for (index, raw) in slot_table.iter().enumerate() {
            if *raw == R::NULL {
                continue;
            }
            if let Some(slot) = pages.0.slot(index) {
                // SAFETY: the slot table recorded this slot as live, and the
                // table was taken, so no path can reach the value again.
                unsafe { ptr::drop_in_place(slot.as_ptr()) };
            }
        }
        drop(pages);
        if dropped > 0 || released > 0 {
            log::debug!("cleared {} values, released {} pages", dropped, released);
        }
    }

    /// Live entries in index order. The order is not part of the contract.
    pub fn iter(&self) -> impl Iterator<Item = (SlotKey<T, R>, &T)> + '_ {
        let pages = &self.pages;
        self.slot_table
            .iter()
            .enumerate()
            .filter(|(_, raw)| **raw != R::NULL)
            .filter_map(move |(index, &raw)| {
                let slot = pages.slot(index)?;
                // SAFETY: live slot; borrowed for as long as `self` is.
                Some((SlotKey::from_raw(raw), unsafe { &*slot.as_ptr() }))
            })
    }

    /// Live entries with mutable access. The order is not part of the
    /// contract.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotKey<T, R>, &mut T)> + '_ {
        let pages = &self.pages;
        self.slot_table
            .iter()
            .enumerate()
            .filter(|(_, raw)| **raw != R::NULL)
            .filter_map(move |(index, &raw)| {
                let slot = pages.slot(index)?;
                // SAFETY: each live index is visited once, so the mutable
                // references are disjoint; `&mut self` is held throughout.
                Some((SlotKey::from_raw(raw), unsafe { &mut *slot.as_ptr() }))
            })
    }

    pub fn keys(&self) -> impl Iterator<Item = SlotKey<T, R>> + '_ {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.iter().map(|(_, value)| value)
    }

    /// Check the structural invariants. Test-only.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let vpp = Self::VALUES_PER_PAGE;
        assert_eq!(self.slot_table.len() % vpp, 0);
        assert_eq!(self.slot_table.len() / vpp, self.pages.reserved_pages());

        let live = self.slot_table.iter().filter(|r| **r != R::NULL).count();
        assert_eq!(live, self.len);

        let mut used_total = 0;
        for (page_index, (backed, used)) in self.pages.used_slots().enumerate() {
            assert_eq!(backed, used > 0, "page {} backing/used mismatch", page_index);
            let live_in_page = self.slot_table[page_index * vpp..(page_index + 1) * vpp]
                .iter()
                .filter(|r| **r != R::NULL)
                .count();
            assert_eq!(used, live_in_page, "page {} used_slots", page_index);
            used_total += used;
        }
        assert_eq!(used_total, self.len);

        let mut seen = std::collections::HashSet::new();
        for raw in self.free_list.iter() {
            let (generation, index) = raw.decode();
            assert!(generation >= 1);
            assert!(seen.insert(index), "index {} twice on the free list", index);
            assert_eq!(self.slot_table[index as usize], R::NULL);
        }
        assert_eq!(self.len + self.free_list.len() + self.retired, self.slot_table.len());
    }
}

impl<T, R, A, const PAGE_SIZE: usize> Drop for PagedSlotAllocator<T, R, A, PAGE_SIZE>
where
    R: RawKey,
    A: PageAllocator,
{
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T, R, A, const PAGE_SIZE: usize> Index<SlotKey<T, R>>
    for PagedSlotAllocator<T, R, A, PAGE_SIZE>
where
    R: RawKey,
    A: PageAllocator,
{
    type Output = T;

    fn index(&self, key: SlotKey<T, R>) -> &T {
        match self.get(key) {
            Some(value) => value,
            None => panic!("invalid SlotKey {:?}", key),
        }
    }
}

impl<T, R, A, const PAGE_SIZE: usize> IndexMut<SlotKey<T, R>>
    for PagedSlotAllocator<T, R, A, PAGE_SIZE>
where
    R: RawKey,
    A: PageAllocator,
{
    fn index_mut(&mut self, key: SlotKey<T, R>) -> &mut T {
        match self.get_mut(key) {
            Some(value) => value,
            None => panic!("invalid SlotKey {:?}", key),
        }
    }
}

impl<T, R, A, const PAGE_SIZE: usize> fmt::Debug for PagedSlotAllocator<T, R, A, PAGE_SIZE>
where
    R: RawKey,
    A: PageAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedSlotAllocator")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("values_per_page", &Self::VALUES_PER_PAGE)
            .field("allocated_pages", &self.allocated_pages())
            .field("retired", &self.retired)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Value whose drops are counted through a shared cell.
    struct Tracked {
        id: u32,
        drops: Rc<Cell<usize>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    /// Invariant: a fresh key has generation 1 and resolves to its value.
    #[test]
    fn insert_then_get() {
        let mut a: PagedSlotAllocator<String> = PagedSlotAllocator::new();
        let k = a.insert("hello".to_string());
        assert_eq!(k.generation(), 1);
        assert_eq!(k.index(), 0);
        assert_eq!(a.get(k).map(String::as_str), Some("hello"));
        assert_eq!(a[k], "hello");
        assert!(a.contains_key(k));
        assert_eq!(a.len(), 1);
        assert!(!a.is_empty());
        a.assert_invariants();
    }

    /// Invariant: get_mut and IndexMut update the stored value in place.
    #[test]
    fn mutate_in_place() {
        let mut a: PagedSlotAllocator<i64> = PagedSlotAllocator::new();
        let k = a.insert(10);
        *a.get_mut(k).unwrap() += 5;
        a[k] *= 2;
        assert_eq!(a.get(k), Some(&30));
    }

    /// Invariant: the null key and out-of-range keys never resolve.
    #[test]
    fn null_and_out_of_range_keys() {
        let mut a: PagedSlotAllocator<u32> = PagedSlotAllocator::new();
        assert!(a.get(SlotKey::null()).is_none());
        let _k = a.insert(1);
        assert!(a.get(SlotKey::null()).is_none());
        assert!(a.remove(SlotKey::null()).is_none());
        let far = SlotKey::from_raw(<u64 as RawKey>::encode(1, 1_000_000));
        assert!(a.get(far).is_none());
        assert!(a.remove(far).is_none());
        assert_eq!(a.len(), 1);
        a.assert_invariants();
    }

    /// Invariant: removing returns the value, invalidates the key and a
    /// second remove is a no-op.
    #[test]
    fn remove_is_idempotent() {
        let mut a: PagedSlotAllocator<String> = PagedSlotAllocator::new();
        let k = a.insert("x".to_string());
        let other = a.insert("y".to_string());
        assert_eq!(a.remove(k), Some("x".to_string()));
        assert!(a.get(k).is_none());
        assert_eq!(a.remove(k), None);
        assert_eq!(a.len(), 1);
        assert_eq!(a.get(other).map(String::as_str), Some("y"));
        a.assert_invariants();
    }

    /// Invariant: with LIFO reuse the freed index comes back first with a
    /// bumped generation, and the old key does not alias the new value.
    #[test]
    fn lifo_reuse_bumps_generation() {
        let mut a: PagedSlotAllocator<&'static str> = PagedSlotAllocator::new();
        let _k0 = a.insert("a");
        let k1 = a.insert("b");
        let _k2 = a.insert("c");
        a.remove(k1);
        let k3 = a.insert("d");
        assert_eq!(k3.index(), k1.index());
        assert_eq!(k3.generation(), 2);
        assert_ne!(k1, k3);
        assert!(a.get(k1).is_none());
        assert_eq!(a.get(k3), Some(&"d"));
    }

    /// Invariant: with FIFO reuse, the remaining seeded indices are handed
    /// out before a freed one.
    #[test]
    fn fifo_reuse_defers_freed_index() {
        let mut a: PagedSlotAllocator<u64> = PagedSlotAllocator::with_reuse_order(ReuseOrder::Fifo);
        let k0 = a.insert(0);
        a.remove(k0);
        let k1 = a.insert(1);
        assert_eq!(k1.index(), 1);
        assert_eq!(a.reuse_order(), ReuseOrder::Fifo);
        a.assert_invariants();
    }

    /// Invariant: capacity grows in whole pages and only when the free list
    /// is empty.
    #[test]
    fn growth_is_page_granular() {
        let mut a: PagedSlotAllocator<u64, u64, Global, 64> =
            PagedSlotAllocator::with_allocator(Global);
        assert_eq!(PagedSlotAllocator::<u64, u64, Global, 64>::VALUES_PER_PAGE, 8);
        assert_eq!(a.capacity(), 0);
        let keys: Vec<_> = (0..8).map(|i| a.insert(i)).collect();
        assert_eq!(a.capacity(), 8);
        a.insert(8);
        assert_eq!(a.capacity(), 16);
        for k in keys {
            a.remove(k);
        }
        // freed indices satisfy the next inserts without growing
        for i in 0..8 {
            a.insert(i);
        }
        assert_eq!(a.capacity(), 16);
        a.assert_invariants();
    }

    /// Invariant: the destructor runs once on clear and once on drop, never
    /// for values already removed.
    #[test]
    fn drops_run_exactly_once() {
        let drops = Rc::new(Cell::new(0));
        let mut a: PagedSlotAllocator<Tracked> = PagedSlotAllocator::new();
        let keys: Vec<_> = (0..10)
            .map(|id| a.insert(Tracked { id, drops: drops.clone() }))
            .collect();
        let removed = a.remove(keys[3]).unwrap();
        assert_eq!(removed.id, 3);
        drop(removed);
        assert_eq!(drops.get(), 1);

        a.clear();
        assert_eq!(drops.get(), 10);
        assert_eq!(a.len(), 0);
        assert_eq!(a.capacity(), 0);
        assert_eq!(a.allocated_pages(), 0);

        a.insert(Tracked { id: 99, drops: drops.clone() });
        drop(a);
        assert_eq!(drops.get(), 11);
    }

    /// Invariant: insert_with passes the key the value ends up under.
    #[test]
    fn insert_with_sees_own_key() {
        let mut a: PagedSlotAllocator<(SlotKey<()>, u8)> = PagedSlotAllocator::new();
        let _ = a.insert((SlotKey::null(), 0));
        let k = a.insert_with(|k| (SlotKey::from_raw(k.to_raw()), 1));
        assert_eq!(a.get(k).unwrap().0.to_raw(), k.to_raw());
    }

    /// Invariant: a panicking constructor leaves the allocator untouched.
    #[test]
    fn panicking_constructor_changes_nothing() {
        let mut a: PagedSlotAllocator<u32> = PagedSlotAllocator::new();
        let k = a.insert(1);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            a.insert_with(|_| panic!("constructor failed"));
        }));
        assert!(res.is_err());
        assert_eq!(a.len(), 1);
        assert_eq!(a.get(k), Some(&1));
        let k2 = a.insert(2);
        assert_eq!(k2.index(), 1);
        assert_eq!(k2.generation(), 1);
        a.assert_invariants();
    }

    /// Invariant: iteration visits each live value once and skips removed
    /// slots; iter_mut writes are visible through get.
    #[test]
    fn iteration_visits_live_values() {
        let mut a: PagedSlotAllocator<u32, u64, Global, 32> =
            PagedSlotAllocator::with_allocator(Global);
        let keys: Vec<_> = (0..20).map(|i| a.insert(i)).collect();
        for k in keys.iter().step_by(3) {
            a.remove(*k);
        }
        let mut seen: Vec<u32> = a.values().copied().collect();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..20).filter(|i| i % 3 != 0).collect();
        assert_eq!(seen, expected);
        assert_eq!(a.keys().count(), a.len());

        for (_, v) in a.iter_mut() {
            *v += 100;
        }
        assert_eq!(a.get(keys[1]), Some(&101));
        for (k, v) in a.iter() {
            assert_eq!(a.get(k), Some(v));
        }
    }

    /// Invariant: an index whose generation saturates is retired and never
    /// handed out again.
    #[test]
    fn saturated_generation_retires_index() {
        let mut a: PagedSlotAllocator<u64, u32, Global, 64> =
            PagedSlotAllocator::with_allocator(Global);
        let mut k = a.insert(0);
        assert_eq!(k.index(), 0);
        while k.generation() < <u32 as RawKey>::MAX_GENERATION {
            a.remove(k);
            k = a.insert(k.generation());
            assert_eq!(k.index(), 0);
        }
        assert_eq!(a.stats().overflows, 0);
        a.remove(k);
        assert_eq!(a.stats().overflows, 1);
        assert_eq!(a.retired(), 1);
        assert!(a.get(k).is_none());
        a.assert_invariants();

        for i in 0..100 {
            let k = a.insert(i);
            assert_ne!(k.index(), 0);
        }
        a.assert_invariants();
    }

    #[test]
    fn debug_summarises_state() {
        let mut a: PagedSlotAllocator<u8> = PagedSlotAllocator::new();
        a.insert(7);
        let s = format!("{:?}", a);
        assert!(s.contains("len: 1"));
        assert!(s.contains("values_per_page: 4096"));
    }

    #[test]
    #[should_panic(expected = "invalid SlotKey")]
    fn index_with_stale_key_panics() {
        let mut a: PagedSlotAllocator<u8> = PagedSlotAllocator::new();
        let k = a.insert(7);
        a.remove(k);
        let _v: u8 = a[k];
    }
}
