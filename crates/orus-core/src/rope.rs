//! Ref-counted immutable string rope: leaf/concat/substring nodes, lazy
//! flattening, and the djb2-hashed intern table.

#[cfg(feature = "std")]
use std::{cell::RefCell, rc::Rc, string::String, string::ToString, vec::Vec};

#[cfg(not(feature = "std"))]
use alloc::{rc::Rc, string::String, string::ToString, vec::Vec};
#[cfg(not(feature = "std"))]
use core::cell::RefCell;

use orus_mm::djb2_hash;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One node of the rope tree.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug)]
pub enum RopeNode {
    /// A flat run of bytes.
    Leaf {
        /// UTF-8 payload.
        data: Rc<String>,
        /// Cached byte length, equal to `data.len()`.
        len: u32,
        /// `true` when `data` is known to be pure ASCII (enables O(1) char indexing).
        is_ascii: bool,
        /// `true` when this leaf's buffer is shared with the global intern table.
        is_interned: bool,
    },
    /// The concatenation of two ropes, without copying either side.
    Concat {
        /// Left child.
        left: Rc<RopeNode>,
        /// Right child.
        right: Rc<RopeNode>,
        /// `left.len() + right.len()`, cached for O(1) `length()`.
        total_len: u32,
        /// `1 + max(left.depth(), right.depth())`.
        depth: u32,
    },
    /// A view into a Leaf's bytes; bases are always `Leaf`, never `Concat`.
    Substring {
        /// The leaf this view is taken from.
        base: Rc<RopeNode>,
        /// Byte offset into `base`.
        start: u32,
        /// Byte length of the view.
        len: u32,
    },
}

impl RopeNode {
    /// O(1): `Leaf`/`Substring` store their length directly, `Concat` caches it.
    pub fn len(&self) -> u32 {
        match self {
            RopeNode::Leaf { len, .. } => *len,
            RopeNode::Concat { total_len, .. } => *total_len,
            RopeNode::Substring { len, .. } => *len,
        }
    }

    /// `true` when this node holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tree depth; used only to decide when `Concat` should eagerly flatten
    /// to keep access patterns close to O(log n).
    pub fn depth(&self) -> u32 {
        match self {
            RopeNode::Leaf { .. } | RopeNode::Substring { .. } => 1,
            RopeNode::Concat { depth, .. } => *depth,
        }
    }

    /// Linear copy of this node's bytes into a fresh `String`.
    pub fn flatten(&self) -> String {
        let mut out = String::with_capacity(self.len() as usize);
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut String) {
        match self {
            RopeNode::Leaf { data, .. } => out.push_str(data),
            RopeNode::Concat { left, right, .. } => {
                left.flatten_into(out);
                right.flatten_into(out);
            }
            RopeNode::Substring { base, start, len } => {
                let full = base.flatten();
                let start = *start as usize;
                let end = start + *len as usize;
                out.push_str(&full[start..end]);
            }
        }
    }

    /// O(depth): descend to the leaf containing byte index `i`.
    pub fn char_at(&self, i: u32) -> Option<char> {
        match self {
            RopeNode::Leaf { data, .. } => data[i as usize..].chars().next(),
            RopeNode::Concat { left, right, .. } => {
                if i < left.len() {
                    left.char_at(i)
                } else {
                    right.char_at(i - left.len())
                }
            }
            RopeNode::Substring { base, start, .. } => base.char_at(start + i),
        }
    }
}

/// Builds a `Concat` node, recording `total_len` and `depth` without copying
/// either child's bytes.
pub fn rope_concat(left: Rc<RopeNode>, right: Rc<RopeNode>) -> Rc<RopeNode> {
    let total_len = left.len() + right.len();
    let depth = 1 + left.depth().max(right.depth());
    Rc::new(RopeNode::Concat { left, right, total_len, depth })
}

/// Builds a `Substring` view. Per the rope invariant, `base` must already be
/// a `Leaf` — callers flatten first if they hold a `Concat`.
pub fn rope_substring(base: Rc<RopeNode>, start: u32, len: u32) -> Rc<RopeNode> {
    debug_assert!(matches!(*base, RopeNode::Leaf { .. }));
    Rc::new(RopeNode::Substring { base, start, len })
}

/// Thin alias kept for call sites that think in terms of "the rope", not its
/// node type.
pub type Rope = Rc<RopeNode>;

/// The heap string object: an immutable rope plus a lazily materialized flat
/// buffer cache.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug)]
pub struct ObjString {
    rope: Rope,
    chars: RefCell<Option<Rc<String>>>,
}

impl ObjString {
    /// Builds an owning leaf from a fresh `String`.
    pub fn from_owned(s: String) -> Self {
        let is_ascii = s.is_ascii();
        let len = s.len() as u32;
        let data = Rc::new(s);
        let rope = Rc::new(RopeNode::Leaf { data: data.clone(), len, is_ascii, is_interned: false });
        ObjString { rope, chars: RefCell::new(Some(data)) }
    }

    /// Builds a string view directly over an existing rope (used for concat
    /// results and interned leaves).
    pub fn from_rope(rope: Rope) -> Self {
        ObjString { rope, chars: RefCell::new(None) }
    }

    /// O(1): cached total length.
    pub fn len(&self) -> u32 {
        self.rope.len()
    }
    /// `true` when empty.
    pub fn is_empty(&self) -> bool {
        self.rope.is_empty()
    }

    /// `rope_concat` without flattening either operand.
    pub fn concat(&self, other: &ObjString) -> ObjString {
        ObjString::from_rope(rope_concat(self.rope.clone(), other.rope.clone()))
    }

    /// A `Substring` view; flattens first if the base isn't already a `Leaf`.
    pub fn substring(&self, start: u32, len: u32) -> ObjString {
        let base = match &*self.rope {
            RopeNode::Leaf { .. } => self.rope.clone(),
            _ => {
                let flat = self.rope.flatten();
                let is_ascii = flat.is_ascii();
                let flat_len = flat.len() as u32;
                Rc::new(RopeNode::Leaf {
                    data: Rc::new(flat),
                    len: flat_len,
                    is_ascii,
                    is_interned: false,
                })
            }
        };
        ObjString::from_rope(rope_substring(base, start, len))
    }

    /// O(depth) character access.
    pub fn char_at(&self, i: u32) -> Option<char> {
        self.rope.char_at(i)
    }

    /// Linear flatten to an owned `String`, independent of the `chars` cache.
    pub fn flatten_str(&self) -> String {
        self.rope.flatten()
    }

    /// Flattens once (if needed) into `chars`, an `Rc<String>` cache kept
    /// alongside `rope` rather than replacing it, so repeated calls return
    /// the same buffer identity without mutating the rope structure itself.
    pub fn string_get_chars(&self) -> Rc<String> {
        if let Some(cached) = self.chars.borrow().as_ref() {
            return cached.clone();
        }
        let flat = Rc::new(self.rope.flatten());
        *self.chars.borrow_mut() = Some(flat.clone());
        flat
    }
}

/// djb2-hash + length + content-checked intern table. Shared process-wide;
/// callers must confine access to a single thread (see the VM's concurrency
/// model).
#[derive(Default)]
pub struct InternTable {
    buckets: Vec<Vec<Rope>>,
}

impl InternTable {
    /// Creates an empty table with a fixed bucket count.
    pub fn new() -> Self {
        InternTable { buckets: (0..256).map(|_| Vec::new()).collect() }
    }

    fn bucket_of(&self, hash: u32) -> usize {
        (hash as usize) % self.buckets.len()
    }

    /// Returns the existing interned rope for `s`, or allocates and marks a
    /// new one `is_interned = true`.
    pub fn intern(&mut self, s: &str) -> Rope {
        let hash = djb2_hash(s.as_bytes());
        let bucket = self.bucket_of(hash);
        for existing in &self.buckets[bucket] {
            if let RopeNode::Leaf { data, .. } = &**existing {
                if data.as_str() == s && data.len() == s.len() {
                    return existing.clone();
                }
            }
        }
        let is_ascii = s.is_ascii();
        let len = s.len() as u32;
        let data = Rc::new(s.to_string());
        let rope = Rc::new(RopeNode::Leaf { data, len, is_ascii, is_interned: true });
        self.buckets[bucket].push(rope.clone());
        rope
    }

    /// Number of distinct interned strings.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
    /// `true` when nothing has been interned yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn concat_length_matches_sum_of_children() {
        let a = ObjString::from_owned("hello ".to_string());
        let b = ObjString::from_owned("world".to_string());
        let c = a.concat(&b);
        assert_eq!(c.len(), a.len() + b.len());
        assert_eq!(c.flatten_str(), "hello world");
    }

    #[test]
    fn substring_matches_flatten_slice() {
        let s = ObjString::from_owned("hello world".to_string());
        let sub = s.substring(6, 5);
        assert_eq!(sub.flatten_str(), s.flatten_str()[6..11]);
    }

    #[test]
    fn string_get_chars_is_idempotent() {
        let a = ObjString::from_owned("x".to_string());
        let b = ObjString::from_owned("y".to_string());
        let c = a.concat(&b);
        let first = c.string_get_chars();
        let second = c.string_get_chars();
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn concat_depth_is_one_plus_max_child_depth() {
        let a = ObjString::from_owned("a".to_string());
        let b = ObjString::from_owned("b".to_string());
        let ab = a.concat(&b);
        let c = ObjString::from_owned("c".to_string());
        let abc = ab.concat(&c);
        assert_eq!(abc.rope.depth(), 1 + ab.rope.depth().max(c.rope.depth()));
    }

    #[test]
    fn intern_table_dedupes_by_content() {
        let mut table = InternTable::new();
        let a = table.intern("shared");
        let b = table.intern("shared");
        assert!(Rc::ptr_eq(&a, &b));
        let c = table.intern("other");
        assert!(!Rc::ptr_eq(&a, &c));
    }

    proptest::proptest! {
        /// `concat`'s cached `total_len` always matches the byte length of
        /// what flattening actually produces, for any two operands.
        #[test]
        fn concat_len_matches_flattened_byte_length(a in "[ -~]{0,64}", b in "[ -~]{0,64}") {
            let oa = ObjString::from_owned(a.clone());
            let ob = ObjString::from_owned(b.clone());
            let combined = oa.concat(&ob);
            assert_eq!(combined.len() as usize, a.len() + b.len());
            assert_eq!(combined.flatten_str(), format!("{a}{b}"));
        }

        /// A `substring` view's length and content always match the
        /// requested byte range, regardless of how the range is chosen.
        #[test]
        fn substring_len_matches_requested_byte_range(
            s in "[ -~]{1,64}",
            start in 0usize..64,
            take in 0usize..64,
        ) {
            let start = start.min(s.len());
            let take = take.min(s.len() - start);
            let obj = ObjString::from_owned(s.clone());
            let sub = obj.substring(start as u32, take as u32);
            assert_eq!(sub.len() as usize, take);
            assert_eq!(sub.flatten_str(), s[start..start + take]);
        }
    }
}
