#![cfg_attr(not(feature = "std"), no_std)]
//! orus-mm — memory and handle toolkit backing the Orus object heap.
//!
//! - [`GenArena<T>`]: generational-handle arena, one per heap object kind.
//!   Handles stay stable for the lifetime of the element they name, are
//!   invalidated (not reused) once removed, and carry a residency tag that
//!   ties each handle to the one arena that minted it.
//! - [`StrInterner`]: djb2-hashed string interner backing the VM-global
//!   string intern table.
//!
//! `no_std` with `alloc`; enable `std` for the default build.

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(not(feature = "std"))]
use alloc::{
    borrow::ToOwned,
    string::{String, ToString},
    vec,
    vec::Vec,
};
#[cfg(feature = "std")]
use std::{string::String, vec::Vec};

use core::{
    fmt,
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU32, Ordering},
};

// ───────────────────────── Generational handles ─────────────────────────

/// Process-wide counter handing out distinct residency tags to each
/// [`GenArena`] as it's constructed, so a [`Handle`] minted by one arena can
/// be told apart from a same-shaped handle minted by another.
static NEXT_RESIDENCY: AtomicU32 = AtomicU32::new(1);

fn next_residency() -> u32 {
    NEXT_RESIDENCY.fetch_add(1, Ordering::Relaxed)
}

/// A handle into a [`GenArena`] slot. Besides the slot index and its
/// generation at the time of allocation, every handle also carries the
/// *residency* of the arena that minted it: `orus-core`'s `Heap` holds eight
/// same-shaped arenas (arrays, enums, errors, upvalues, ...) behind handles
/// that are not otherwise distinguishable by type, so without a residency
/// check a stray array handle fed to the enum arena's `get` would silently
/// read whatever slot happens to share its index rather than being rejected.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, Default)]
pub struct Handle {
    idx: u32,
    gen: u32,
    residency: u32,
}
impl Handle {
    /// Builds a handle with no residency tag (`residency` 0 never matches a
    /// real arena's tag, which starts at 1); useful for tests and for
    /// serialized handles crossing a boundary where residency can't be
    /// meaningfully checked.
    pub const fn new(idx: u32, gen: u32) -> Self {
        Self { idx, gen, residency: 0 }
    }
    fn in_arena(idx: u32, gen: u32, residency: u32) -> Self {
        Self { idx, gen, residency }
    }
    pub fn index(self) -> u32 {
        self.idx
    }
    pub fn generation(self) -> u32 {
        self.gen
    }
}
impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h#{}@{}/{}", self.idx, self.gen, self.residency)
    }
}
impl PartialEq for Handle {
    fn eq(&self, o: &Self) -> bool {
        self.idx == o.idx && self.gen == o.gen && self.residency == o.residency
    }
}
impl Eq for Handle {}
impl Hash for Handle {
    fn hash<H: Hasher>(&self, h: &mut H) {
        self.idx.hash(h);
        self.gen.hash(h);
        self.residency.hash(h);
    }
}

#[derive(Clone, Debug)]
struct Slot<T> {
    gen: u32,
    val: Option<T>,
}

/// Generational-handle arena; the object heap is built from one of these per
/// object kind (strings, arrays, enum instances, closures, upvalues, errors).
/// Every arena is minted with its own residency tag (see [`Handle`]), so
/// handles don't cross between a `Heap`'s distinct per-kind arenas even
/// though they share the exact same `idx`/`gen` shape.
#[derive(Clone, Debug)]
pub struct GenArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: u32,
    residency: u32,
}

impl<T> Default for GenArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GenArena<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), len: 0, residency: next_residency() }
    }
    pub fn with_capacity(n: usize) -> Self {
        let mut a = Self::new();
        a.slots.reserve(n);
        a
    }
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
    pub fn len(&self) -> usize {
        self.len as usize
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// This arena's residency tag, for callers that want to assert a handle
    /// belongs here before storing it (e.g. across a serialization boundary).
    pub fn residency(&self) -> u32 {
        self.residency
    }

    fn resident(&self, h: Handle) -> bool {
        h.residency == self.residency
    }

    pub fn insert(&mut self, v: T) -> Handle {
        if let Some(idx) = self.free.pop() {
            let s = &mut self.slots[idx as usize];
            debug_assert!(s.val.is_none());
            s.val = Some(v);
            self.len += 1;
            Handle::in_arena(idx, s.gen, self.residency)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot { gen: 0, val: Some(v) });
            self.len += 1;
            Handle::in_arena(idx, 0, self.residency)
        }
    }
    pub fn contains(&self, h: Handle) -> bool {
        self.get(h).is_some()
    }
    pub fn get(&self, h: Handle) -> Option<&T> {
        if !self.resident(h) {
            return None;
        }
        self.slots
            .get(h.idx as usize)
            .and_then(|s| (s.gen == h.gen).then_some(()))
            .and_then(|_| self.slots[h.idx as usize].val.as_ref())
    }
    pub fn get_mut(&mut self, h: Handle) -> Option<&mut T> {
        if !self.resident(h) {
            return None;
        }
        if let Some(s) = self.slots.get_mut(h.idx as usize) {
            if s.gen == h.gen {
                return s.val.as_mut();
            }
        }
        None
    }
    /// Removes and returns the element, bumping the slot's generation so any
    /// stale handle into it becomes permanently invalid.
    pub fn remove(&mut self, h: Handle) -> Option<T> {
        if !self.resident(h) {
            return None;
        }
        if let Some(s) = self.slots.get_mut(h.idx as usize) {
            if s.gen == h.gen {
                self.len -= 1;
                s.gen = s.gen.wrapping_add(1);
                self.free.push(h.idx);
                return s.val.take();
            }
        }
        None
    }
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        let residency = self.residency;
        self.slots
            .iter()
            .enumerate()
            .filter_map(move |(i, s)| s.val.as_ref().map(|v| (Handle::in_arena(i as u32, s.gen, residency), v)))
    }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        let residency = self.residency;
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(move |(i, s)| s.val.as_mut().map(|v| (Handle::in_arena(i as u32, s.gen, residency), v)))
    }
}

// ─────────────────────────── String interner ─────────────────────────────

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);
impl Symbol {
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// djb2 hash over raw bytes, used both for the interner's bucket index and as
/// the cheap pre-check before a full content comparison.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(b));
    }
    hash
}

/// Hash-bucketed interner keyed by djb2 hash, length, then content — matching
/// the lookup discipline the VM-global intern table uses for `ObjString`.
#[derive(Clone, Debug, Default)]
pub struct StrInterner {
    strings: Vec<String>,
    buckets: Vec<Vec<u32>>,
}
impl StrInterner {
    pub fn new() -> Self {
        Self { strings: Vec::new(), buckets: vec![Vec::new(); 64] }
    }

    fn bucket_of(&self, hash: u32) -> usize {
        (hash as usize) % self.buckets.len()
    }

    pub fn intern<S: AsRef<str>>(&mut self, s: S) -> Symbol {
        let s = s.as_ref();
        let hash = djb2_hash(s.as_bytes());
        let bucket = self.bucket_of(hash);
        for &idx in &self.buckets[bucket] {
            if self.strings[idx as usize] == s {
                return Symbol(idx);
            }
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_owned());
        self.buckets[bucket].push(idx);
        Symbol(idx)
    }

    pub fn find<S: AsRef<str>>(&self, s: S) -> Option<Symbol> {
        let s = s.as_ref();
        let hash = djb2_hash(s.as_bytes());
        let bucket = self.bucket_of(hash);
        self.buckets[bucket]
            .iter()
            .find(|&&idx| self.strings[idx as usize] == s)
            .map(|&idx| Symbol(idx))
    }

    pub fn resolve(&self, sym: Symbol) -> &str {
        self.strings.get(sym.0 as usize).map(|s| s.as_str()).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn arena_handles_invalidate() {
        let mut a = GenArena::<i32>::new();
        let h = a.insert(7);
        assert_eq!(a.get(h), Some(&7));
        let _ = a.remove(h).unwrap();
        assert!(a.get(h).is_none());
        let h2 = a.insert(8);
        assert_ne!(h, h2);
    }

    #[test]
    fn handles_do_not_cross_arenas() {
        let mut arrays = GenArena::<&str>::new();
        let mut enums = GenArena::<&str>::new();
        let from_arrays = arrays.insert("array-slot-0");
        let _ = enums.insert("enum-slot-0");
        assert!(arrays.get(from_arrays).is_some());
        assert!(enums.get(from_arrays).is_none());
        assert!(enums.remove(from_arrays).is_none());
    }

    #[test]
    fn intern_basic() {
        let mut i = StrInterner::new();
        let a = i.intern("hello");
        let b = i.intern("world");
        let c = i.intern("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(i.resolve(a), "hello");
    }

    #[test]
    fn intern_find_without_inserting() {
        let mut i = StrInterner::new();
        assert!(i.find("ghost").is_none());
        let sym = i.intern("ghost");
        assert_eq!(i.find("ghost"), Some(sym));
    }

    #[test]
    fn intern_hash_collision_still_resolves_distinct_strings() {
        let mut i = StrInterner::new();
        let mut seen = Vec::new();
        for n in 0..200 {
            let s = format!("sym{n}");
            seen.push((s.clone(), i.intern(s)));
        }
        for (s, sym) in seen {
            assert_eq!(i.resolve(sym), s);
        }
    }
}
