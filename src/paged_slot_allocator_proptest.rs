#![cfg(test)]

// Property tests for PagedSlotAllocator kept inside the crate so they can
// check internal page and free-list accounting.

use crate::free_list::ReuseOrder;
use crate::key::{RawKey, SlotKey};
use crate::page::Global;
use crate::paged_slot_allocator::PagedSlotAllocator;
use proptest::prelude::*;
use slotmap::{DefaultKey, SlotMap};
use std::collections::BTreeSet;

// Small pages so a few dozen values span several of them.
type Sut = PagedSlotAllocator<i32, u64, Global, 32>;
type Key = SlotKey<i32, u64>;

// Index-based operations shrink well: indices shrink toward earlier live
// entries and op lists shrink in length.
#[derive(Clone, Debug)]
enum Op {
    Insert(i32),
    Remove(usize),
    RemoveStale(usize),
    Get(usize),
    GetStale(usize),
    Mutate(usize, i32),
    Iterate,
    Clear,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => any::<i32>().prop_map(Op::Insert),
        4 => any::<usize>().prop_map(Op::Remove),
        1 => any::<usize>().prop_map(Op::RemoveStale),
        2 => any::<usize>().prop_map(Op::Get),
        1 => any::<usize>().prop_map(Op::GetStale),
        2 => (any::<usize>(), any::<i32>()).prop_map(|(i, d)| Op::Mutate(i, d)),
        1 => Just(Op::Iterate),
        1 => Just(Op::Clear),
    ]
}

fn arb_order() -> impl Strategy<Value = ReuseOrder> {
    prop_oneof![Just(ReuseOrder::Lifo), Just(ReuseOrder::Fifo)]
}

// Property: state-machine equivalence against slotmap::SlotMap.
// Invariants exercised across random operation sequences:
// - `len` parity with the model after every operation.
// - Live keys resolve to the model's value; stale keys never resolve, even
//   after their index has been reused.
// - Removing a stale key is a no-op.
// - `iter` yields exactly the live key set.
// - Page accounting, slot-table and free-list invariants hold after every op.
proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine(
        order in arb_order(),
        ops in proptest::collection::vec(arb_op(), 1..200),
    ) {
        let mut sut = Sut::with_allocator_and_reuse_order(Global, order);
        let mut model: SlotMap<DefaultKey, i32> = SlotMap::new();
        let mut live: Vec<(Key, DefaultKey)> = Vec::new();
        let mut stale: Vec<Key> = Vec::new();

        for op in ops {
            match op {
                Op::Insert(v) => {
                    let k = sut.insert(v);
                    prop_assert!(!k.is_null());
                    prop_assert!(live.iter().all(|(lk, _)| *lk != k), "key handed out twice");
                    let mk = model.insert(v);
                    live.push((k, mk));
                }
                Op::Remove(i) => {
                    if !live.is_empty() {
                        let (k, mk) = live.swap_remove(i % live.len());
                        let got = sut.remove(k);
                        prop_assert_eq!(got, model.remove(mk));
                        stale.push(k);
                    }
                }
                Op::RemoveStale(i) => {
                    if !stale.is_empty() {
                        let before = sut.len();
                        prop_assert_eq!(sut.remove(stale[i % stale.len()]), None);
                        prop_assert_eq!(sut.len(), before);
                    }
                }
                Op::Get(i) => {
                    if !live.is_empty() {
                        let (k, mk) = live[i % live.len()];
                        prop_assert_eq!(sut.get(k), model.get(mk));
                    }
                }
                Op::GetStale(i) => {
                    if !stale.is_empty() {
                        prop_assert!(sut.get(stale[i % stale.len()]).is_none());
                    }
                }
                Op::Mutate(i, d) => {
                    if !live.is_empty() {
                        let (k, mk) = live[i % live.len()];
                        let v = sut.get_mut(k).expect("live key resolves");
                        *v = v.wrapping_add(d);
                        let mv = model.get_mut(mk).expect("model entry present");
                        *mv = mv.wrapping_add(d);
                        prop_assert_eq!(sut.get(k), model.get(mk));
                    }
                }
                Op::Iterate => {
                    let s_keys: BTreeSet<u64> = sut.keys().map(|k| k.to_raw()).collect();
                    let l_keys: BTreeSet<u64> = live.iter().map(|(k, _)| k.to_raw()).collect();
                    prop_assert_eq!(s_keys, l_keys);
                }
                Op::Clear => {
                    sut.clear();
                    model.clear();
                    live.clear();
                    // The index space restarts after clear, so older keys
                    // are no longer guaranteed stale.
                    stale.clear();
                    prop_assert_eq!(sut.allocated_pages(), 0);
                }
            }

            for &k in &stale {
                prop_assert!(sut.get(k).is_none());
                prop_assert!(!sut.contains_key(k));
            }
            prop_assert_eq!(sut.len(), model.len());
            prop_assert_eq!(sut.is_empty(), model.is_empty());
            sut.assert_invariants();
        }

        let stats = sut.stats();
        prop_assert!(stats.page_deallocations <= stats.page_allocations);
        prop_assert_eq!(
            stats.page_allocations - stats.page_deallocations,
            sut.allocated_pages() as u64
        );
    }
}

// Property: with a 16/16-bit key and a handful of slots, heavy churn drives
// generations into saturation. Retired indices never come back, and the
// overflow counter matches the number of retired indices.
proptest! {
    #![proptest_config(ProptestConfig { cases: 8, .. ProptestConfig::default() })]
    #[test]
    fn prop_overflow_retires_for_good(start in 0u64..4, churn in 1usize..4) {
        type Tiny = PagedSlotAllocator<u64, u32, Global, 32>;
        let mut sut = Tiny::with_allocator(Global);

        // Occupy every index of the first page so later inserts only reuse
        // freed slots or grow.
        let mut keys: Vec<SlotKey<u64, u32>> = (0..Tiny::VALUES_PER_PAGE as u64)
            .map(|i| sut.insert(i))
            .collect();
        let target = keys.remove(start as usize);
        let target_index = target.index();
        sut.remove(target);

        // Cycle the target slot through every generation it has left.
        let mut k = sut.insert(0);
        prop_assert_eq!(k.index(), target_index);
        while k.generation() < <u32 as RawKey>::MAX_GENERATION {
            sut.remove(k);
            k = sut.insert(0);
            prop_assert_eq!(k.index(), target_index);
        }
        sut.remove(k);
        prop_assert_eq!(sut.stats().overflows, 1);
        prop_assert_eq!(sut.retired(), 1);

        for i in 0..(churn * Tiny::VALUES_PER_PAGE) {
            let k = sut.insert(i as u64);
            prop_assert_ne!(k.index(), target_index);
        }
        sut.assert_invariants();
    }
}
