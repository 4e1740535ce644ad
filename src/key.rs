//! Key codec: packs a (generation, index) pair into one opaque integer.
//!
//! The raw integer is the only thing stored in the slot table and the free
//! list. `SlotKey<T, R>` wraps it with a phantom value type so a key minted
//! by an allocator of `Foo`s does not type-check against one holding `Bar`s.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

/// Integer type a key is packed into.
///
/// The low `INDEX_BITS` hold the slot index and the remaining high bits
/// hold the generation. Generation `0` is reserved: `NULL` and every slot
/// table entry that is not live decode to it, and no insertion ever hands
/// out a key with generation `0`.
pub trait RawKey: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Number of low bits holding the index.
    const INDEX_BITS: u32;
    /// The sentinel key; decodes to `(0, 0)`.
    const NULL: Self;
    /// Largest generation the key can carry.
    const MAX_GENERATION: u64;
    /// Largest index the key can carry.
    const MAX_INDEX: u64;

    /// Packs `generation` and `index`. Both must be within range.
    fn encode(generation: u64, index: u64) -> Self;

    /// Unpacks into `(generation, index)`.
    fn decode(self) -> (u64, u64);
}

macro_rules! impl_raw_key {
    ($raw:ty, $half:ty) => {
        impl RawKey for $raw {
            const INDEX_BITS: u32 = <$half>::BITS;
            const NULL: Self = 0;
            const MAX_GENERATION: u64 = <$half>::MAX as u64;
            const MAX_INDEX: u64 = <$half>::MAX as u64;

            #[inline]
            fn encode(generation: u64, index: u64) -> Self {
                debug_assert!(generation <= Self::MAX_GENERATION);
                debug_assert!(index <= Self::MAX_INDEX);
                ((generation as $raw) << Self::INDEX_BITS) | (index as $raw)
            }

            #[inline]
            fn decode(self) -> (u64, u64) {
                let generation = (self >> Self::INDEX_BITS) as u64;
                let index = (self & (<$half>::MAX as $raw)) as u64;
                (generation, index)
            }
        }
    };
}

// 16-bit generation / 16-bit index: compact handles for small pools.
impl_raw_key!(u32, u16);
// 32-bit generation / 32-bit index: the default.
impl_raw_key!(u64, u32);
// 64-bit generation / 64-bit index: effectively never overflows.
impl_raw_key!(u128, u64);

/// Opaque, typed handle to a value stored in a `PagedSlotAllocator<T, R>`.
///
/// Keys are plain data: copying one does not keep the value alive, and a
/// key whose slot was removed simply stops resolving.
pub struct SlotKey<T, R: RawKey = u64> {
    raw: R,
    _value: PhantomData<fn() -> T>,
}

impl<T, R: RawKey> SlotKey<T, R> {
    /// The key that never resolves.
    #[inline]
    pub const fn null() -> Self {
        Self::from_raw(R::NULL)
    }

    /// Rebuild a key from its raw representation, e.g. one read back from
    /// a GPU buffer. An arbitrary value is harmless: it either matches a
    /// live slot exactly or resolves to nothing.
    #[inline]
    pub const fn from_raw(raw: R) -> Self {
        Self {
            raw,
            _value: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn new(generation: u64, index: u64) -> Self {
        Self::from_raw(R::encode(generation, index))
    }

    #[inline]
    pub fn to_raw(self) -> R {
        self.raw
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.generation() == 0
    }

    #[inline]
    pub fn generation(self) -> u64 {
        self.raw.decode().0
    }

    #[inline]
    pub fn index(self) -> u64 {
        self.raw.decode().1
    }
}

impl<T, R: RawKey> Clone for SlotKey<T, R> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, R: RawKey> Copy for SlotKey<T, R> {}

impl<T, R: RawKey> PartialEq for SlotKey<T, R> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T, R: RawKey> Eq for SlotKey<T, R> {}

impl<T, R: RawKey> Hash for SlotKey<T, R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T, R: RawKey> Default for SlotKey<T, R> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T, R: RawKey> fmt::Debug for SlotKey<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (generation, index) = self.raw.decode();
        write!(f, "SlotKey({}v{})", index, generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Invariant: generation occupies the high half and index the low half.
    #[test]
    fn default_key_layout() {
        let raw = <u64 as RawKey>::encode(3, 7);
        assert_eq!(raw, (3u64 << 32) | 7);
        assert_eq!(raw.decode(), (3, 7));
    }

    /// Invariant: extreme field values survive encoding for every width.
    #[test]
    fn extremes_are_preserved() {
        let r = <u32 as RawKey>::encode(u16::MAX as u64, u16::MAX as u64);
        assert_eq!(r, u32::MAX);
        assert_eq!(r.decode(), (u16::MAX as u64, u16::MAX as u64));

        let r = <u64 as RawKey>::encode(u32::MAX as u64, 0);
        assert_eq!(r.decode(), (u32::MAX as u64, 0));

        let r = <u128 as RawKey>::encode(u64::MAX, u64::MAX);
        assert_eq!(r, u128::MAX);
        assert_eq!(r.decode(), (u64::MAX, u64::MAX));
    }

    /// Invariant: the null key decodes to generation 0 and is recognised as
    /// null; any key with a non-zero generation is not.
    #[test]
    fn null_key() {
        let k: SlotKey<String> = SlotKey::null();
        assert!(k.is_null());
        assert_eq!(k.to_raw(), 0);
        assert_eq!(k, SlotKey::default());

        let k: SlotKey<String> = SlotKey::new(1, 0);
        assert!(!k.is_null());
        assert_eq!(k.index(), 0);
        assert_eq!(k.generation(), 1);
    }

    /// Invariant: keys are equal iff both generation and index match.
    #[test]
    fn equality_uses_both_fields() {
        let a: SlotKey<u8> = SlotKey::new(1, 5);
        let b: SlotKey<u8> = SlotKey::new(2, 5);
        let c: SlotKey<u8> = SlotKey::new(1, 6);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, SlotKey::from_raw(a.to_raw()));

        let set: HashSet<_> = [a, b, c, a].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn debug_shows_index_and_generation() {
        let k: SlotKey<u8, u32> = SlotKey::new(4, 9);
        assert_eq!(format!("{:?}", k), "SlotKey(9v4)");
    }
}
