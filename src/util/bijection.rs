//! Two-way map with separate lookups for each direction.
//!
//! Both directions are explicit (`forward` / `reverse`) so the map stays
//! unambiguous even when both sides have the same type.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bijection<A: Ord + Clone, B: Ord + Clone> {
    forward: BTreeMap<A, B>,
    reverse: BTreeMap<B, A>,
}

impl<A: Ord + Clone, B: Ord + Clone> Default for Bijection<A, B> {
    fn default() -> Self {
        Self {
            forward: BTreeMap::new(),
            reverse: BTreeMap::new(),
        }
    }
}

impl<A: Ord + Clone, B: Ord + Clone> Bijection<A, B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair. Any existing pair sharing either key is removed first.
    pub fn insert(&mut self, a: A, b: B) {
        if let Some(old_b) = self.forward.remove(&a) {
            self.reverse.remove(&old_b);
        }
        if let Some(old_a) = self.reverse.remove(&b) {
            self.forward.remove(&old_a);
        }
        self.forward.insert(a.clone(), b.clone());
        self.reverse.insert(b, a);
    }

    pub fn forward(&self, a: &A) -> Option<&B> {
        self.forward.get(a)
    }

    pub fn reverse(&self, b: &B) -> Option<&A> {
        self.reverse.get(b)
    }

    pub fn contains_forward(&self, a: &A) -> bool {
        self.forward.contains_key(a)
    }

    pub fn contains_reverse(&self, b: &B) -> bool {
        self.reverse.contains_key(b)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    /// Pairs in forward-key order.
    pub fn iter(&self) -> impl Iterator<Item = (&A, &B)> {
        self.forward.iter()
    }
}
