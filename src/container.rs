//! Postings containers and set-algebraic query operations.
//!
//! A [`ReferenceContainer`] holds all references for one term, sorted by
//! document key with no duplicate keys. Besides insertion and merge it
//! implements the query-time set algebra: conjunctive join with a proximity
//! bound, and destructive exclusion.
//!
//! Join and exclude each exist in two variants and the cheaper one is chosen
//! per call from estimated cost: a linear enumeration over both sorted entry
//! sequences (`10 * (high + low - 1)` steps) or a probe of every entry of the
//! smaller container against the larger (`12 * log2(high) * low` steps).
//! Postings lists range from one entry to millions, so a fixed algorithm
//! would be pathological at one of the extremes.

use ahash::AHashSet;

use crate::error::Result;
use crate::reference::{Reference, ReferenceCodec};

/// A set of document keys, used to filter or exclude postings.
pub type DocumentSet = AHashSet<Vec<u8>>;

/// The postings list for one term: a sorted set of references keyed by
/// document key.
#[derive(Debug, Clone)]
pub struct ReferenceContainer<R: Reference> {
    term_key: Vec<u8>,
    entries: Vec<R>,
}

impl<R: Reference> ReferenceContainer<R> {
    /// Create an empty container for `term_key`.
    pub fn new(term_key: Vec<u8>) -> Self {
        ReferenceContainer {
            term_key,
            entries: Vec::new(),
        }
    }

    /// Create an empty container with preallocated space.
    pub fn with_capacity(term_key: Vec<u8>, capacity: usize) -> Self {
        ReferenceContainer {
            term_key,
            entries: Vec::with_capacity(capacity),
        }
    }

    /// The term key this container belongs to. Empty for join results,
    /// which span several terms.
    pub fn term_key(&self) -> &[u8] {
        &self.term_key
    }

    /// Number of references in the container.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the container holds no references.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate references in document-key order.
    pub fn iter(&self) -> std::slice::Iter<'_, R> {
        self.entries.iter()
    }

    /// Drop all references, keeping the term key.
    pub fn clear(&mut self) {
        self.entries = Vec::new();
    }

    fn position_of(&self, doc_key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|e| e.doc_key().cmp(doc_key))
    }

    /// Insert without a duplicate check; the caller guarantees the document
    /// key is not yet present. Used for bulk construction.
    pub fn add(&mut self, reference: R) {
        match self.position_of(reference.doc_key()) {
            Ok(pos) | Err(pos) => self.entries.insert(pos, reference),
        }
    }

    /// Get the reference for a document key.
    pub fn get_reference(&self, doc_key: &[u8]) -> Option<&R> {
        self.position_of(doc_key).ok().map(|pos| &self.entries[pos])
    }

    /// Remove and return the reference for a document key.
    pub fn remove_reference(&mut self, doc_key: &[u8]) -> Option<R> {
        match self.position_of(doc_key) {
            Ok(pos) => Some(self.entries.remove(pos)),
            Err(_) => None,
        }
    }

    /// Insert-or-replace with recency resolution. Returns true if the
    /// stored entry changed: the document was new, or the incoming
    /// reference is more recent than the stored one. On a timestamp tie the
    /// existing entry is kept.
    pub fn put_recent(&mut self, reference: R) -> bool {
        match self.position_of(reference.doc_key()) {
            Ok(pos) => {
                if self.entries[pos].is_older(&reference) {
                    self.entries[pos] = reference;
                    true
                } else {
                    false
                }
            }
            Err(pos) => {
                self.entries.insert(pos, reference);
                true
            }
        }
    }

    /// Put every entry of `other` with recency resolution. Returns the
    /// number of stored entries that changed.
    pub fn put_all_recent(&mut self, other: &Self) -> usize {
        let mut changed = 0;
        for r in other.iter() {
            if self.put_recent(r.clone()) {
                changed += 1;
            }
        }
        changed
    }

    /// Union of two containers, keeping the most recent reference per
    /// shared document key. Both inputs are left untouched.
    pub fn merge(&self, other: &Self) -> Self {
        let mut result = ReferenceContainer::with_capacity(
            self.term_key.clone(),
            self.len() + other.len(),
        );
        let mut a = self.entries.iter().peekable();
        let mut b = other.entries.iter().peekable();
        loop {
            match (a.peek(), b.peek()) {
                (Some(ra), Some(rb)) => match ra.doc_key().cmp(rb.doc_key()) {
                    std::cmp::Ordering::Less => result.entries.push(a.next().unwrap().clone()),
                    std::cmp::Ordering::Greater => result.entries.push(b.next().unwrap().clone()),
                    std::cmp::Ordering::Equal => {
                        let ra = a.next().unwrap();
                        let rb = b.next().unwrap();
                        // most recent wins; ties keep the left (existing) side
                        if ra.is_older(rb) {
                            result.entries.push(rb.clone());
                        } else {
                            result.entries.push(ra.clone());
                        }
                    }
                },
                (Some(_), None) => result.entries.push(a.next().unwrap().clone()),
                (None, Some(_)) => result.entries.push(b.next().unwrap().clone()),
                (None, None) => break,
            }
        }
        result
    }

    /// Delete entries by document key; returns the number removed.
    pub fn remove_entries(&mut self, doc_keys: &DocumentSet) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !doc_keys.contains(e.doc_key()));
        before - self.entries.len()
    }

    /// A copy restricted to the given document keys.
    pub fn filtered(&self, filter: &DocumentSet) -> Self {
        let mut result = ReferenceContainer::new(self.term_key.clone());
        for r in self.iter() {
            if filter.contains(r.doc_key()) {
                result.entries.push(r.clone());
            }
        }
        result
    }

    /// Serialize all entries as a flat sequence of fixed-width rows.
    pub fn to_rows<C>(&self, codec: &C) -> Result<Vec<u8>>
    where
        C: ReferenceCodec<Ref = R>,
    {
        let mut out = Vec::with_capacity(self.len() * codec.row_width());
        for r in self.iter() {
            codec.encode(r, &mut out)?;
        }
        Ok(out)
    }

    /// Rebuild a container from a flat row sequence produced by `to_rows`.
    pub fn from_rows<C>(codec: &C, term_key: Vec<u8>, rows: &[u8]) -> Result<Self>
    where
        C: ReferenceCodec<Ref = R>,
    {
        let width = codec.row_width();
        if rows.len() % width != 0 {
            return Err(crate::error::RwIndexError::serialization(format!(
                "payload of {} bytes is not a multiple of the row width {}",
                rows.len(),
                width
            )));
        }
        let mut entries = Vec::with_capacity(rows.len() / width);
        for row in rows.chunks_exact(width) {
            entries.push(codec.decode(row)?);
        }
        // rows are written in doc-key order, but rows from foreign dumps
        // may not be; restore the invariant when violated
        let sorted = entries
            .windows(2)
            .all(|w| w[0].doc_key() < w[1].doc_key());
        if !sorted {
            entries.sort_unstable_by(|a, b| a.doc_key().cmp(b.doc_key()));
            entries.dedup_by(|a, b| a.doc_key() == b.doc_key());
        }
        Ok(ReferenceContainer {
            term_key,
            entries,
        })
    }
}

// bit length, the step estimate of one binary-search probe
fn log2(x: usize) -> usize {
    (usize::BITS - x.leading_zeros()) as usize
}

fn probe_is_cheaper(len_a: usize, len_b: usize) -> bool {
    let high = len_a.max(len_b);
    let low = len_a.min(len_b);
    let steps_enum = 10 * (high + low - 1);
    let steps_probe = 12 * log2(high) * low;
    steps_enum > steps_probe
}

impl<R: Reference> ReferenceContainer<R> {
    /// Conjunctive join: the intersection by document key, restricted to
    /// documents whose combined position distance after joining both
    /// references is at most `max_distance`. Either input being empty
    /// yields an empty result.
    ///
    /// The result spans two terms and carries an empty term key.
    pub fn join(&self, other: &Self, max_distance: u64) -> Self {
        if self.is_empty() || other.is_empty() {
            return ReferenceContainer::new(Vec::new());
        }
        if probe_is_cheaper(self.len(), other.len()) {
            if self.len() < other.len() {
                Self::join_by_probe(self, other, max_distance)
            } else {
                Self::join_by_probe(other, self, max_distance)
            }
        } else {
            Self::join_by_enumeration(self, other, max_distance)
        }
    }

    fn join_by_probe(small: &Self, large: &Self, max_distance: u64) -> Self {
        let mut conj = ReferenceContainer::new(Vec::new());
        for r1 in small.iter() {
            if let Some(r2) = large.get_reference(r1.doc_key()) {
                let mut joined = r1.clone();
                joined.join(r2);
                if joined.distance() <= max_distance {
                    conj.entries.push(joined);
                }
            }
        }
        conj
    }

    fn join_by_enumeration(a: &Self, b: &Self, max_distance: u64) -> Self {
        let mut conj = ReferenceContainer::new(Vec::new());
        let mut ia = 0;
        let mut ib = 0;
        while ia < a.entries.len() && ib < b.entries.len() {
            let ra = &a.entries[ia];
            let rb = &b.entries[ib];
            match ra.doc_key().cmp(rb.doc_key()) {
                std::cmp::Ordering::Less => ia += 1,
                std::cmp::Ordering::Greater => ib += 1,
                std::cmp::Ordering::Equal => {
                    let mut joined = ra.clone();
                    joined.join(rb);
                    if joined.distance() <= max_distance {
                        conj.entries.push(joined);
                    }
                    ia += 1;
                    ib += 1;
                }
            }
        }
        conj
    }

    /// Join many containers. The two currently-smallest results are joined
    /// repeatedly; the moment any input or intermediate result is empty the
    /// whole conjunction is empty and the method returns immediately.
    pub fn join_many(containers: Vec<Self>, max_distance: u64) -> Self {
        if containers.is_empty() || containers.iter().any(|c| c.is_empty()) {
            return ReferenceContainer::new(Vec::new());
        }
        let mut ordered = containers;
        ordered.sort_by_key(|c| c.len());

        let mut iter = ordered.into_iter();
        let mut result = iter.next().unwrap();
        for next in iter {
            result = result.join(&next, max_distance);
            if result.is_empty() {
                return result;
            }
        }
        result
    }

    /// Destructive set-difference: remove from `self` every document key
    /// also present in `other`. Returns the number of entries removed.
    /// Uses the same dual-algorithm cost selection as `join`, on key
    /// presence only.
    pub fn exclude(&mut self, other: &Self) -> usize {
        if self.is_empty() || other.is_empty() {
            return 0;
        }
        if probe_is_cheaper(self.len(), other.len()) {
            self.exclude_by_probe(other)
        } else {
            self.exclude_by_enumeration(other)
        }
    }

    fn exclude_by_probe(&mut self, other: &Self) -> usize {
        let before = self.entries.len();
        if self.len() < other.len() {
            self.entries.retain(|e| other.get_reference(e.doc_key()).is_none());
        } else {
            for r in other.iter() {
                self.remove_reference(r.doc_key());
            }
        }
        before - self.entries.len()
    }

    fn exclude_by_enumeration(&mut self, other: &Self) -> usize {
        let before = self.entries.len();
        let mut ib = 0;
        self.entries.retain(|e| {
            while ib < other.entries.len() && other.entries[ib].doc_key() < e.doc_key() {
                ib += 1;
            }
            !(ib < other.entries.len() && other.entries[ib].doc_key() == e.doc_key())
        });
        before - self.entries.len()
    }

    /// Exclude several containers in sequence; an empty pivot short-circuits.
    pub fn exclude_many(&mut self, others: &[Self]) -> usize {
        let mut removed = 0;
        for other in others {
            if self.is_empty() {
                break;
            }
            removed += self.exclude(other);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::WordReference;

    fn key(s: &str) -> Vec<u8> {
        let mut k = s.as_bytes().to_vec();
        k.resize(12, b'_');
        k
    }

    fn reference(doc: &str, positions: Vec<u32>, modified: i64) -> WordReference {
        WordReference::new(key(doc), positions, modified).unwrap()
    }

    fn container(term: &str, docs: &[(&str, u32)]) -> ReferenceContainer<WordReference> {
        let mut c = ReferenceContainer::new(key(term));
        for (doc, pos) in docs {
            c.add(reference(doc, vec![*pos], 100));
        }
        c
    }

    fn doc_keys(c: &ReferenceContainer<WordReference>) -> Vec<Vec<u8>> {
        c.iter().map(|r| r.doc_key().to_vec()).collect()
    }

    #[test]
    fn test_add_keeps_doc_key_order() {
        let c = container("t", &[("c", 1), ("a", 1), ("b", 1)]);
        assert_eq!(doc_keys(&c), vec![key("a"), key("b"), key("c")]);
    }

    #[test]
    fn test_put_recent() {
        let mut c = ReferenceContainer::new(key("t"));
        assert!(c.put_recent(reference("a", vec![1], 100)));

        // older reference does not replace
        assert!(!c.put_recent(reference("a", vec![2], 50)));
        assert_eq!(c.get_reference(&key("a")).unwrap().last_modified(), 100);

        // tie keeps the existing entry
        assert!(!c.put_recent(reference("a", vec![3], 100)));
        assert_eq!(c.get_reference(&key("a")).unwrap().positions(), &[1]);

        // newer reference replaces
        assert!(c.put_recent(reference("a", vec![4], 200)));
        assert_eq!(c.get_reference(&key("a")).unwrap().positions(), &[4]);
    }

    #[test]
    fn test_merge_no_duplicates_and_recency() {
        let mut a = ReferenceContainer::new(key("t"));
        a.add(reference("x", vec![1], 100));
        a.add(reference("y", vec![1], 100));
        let mut b = ReferenceContainer::new(key("t"));
        b.add(reference("x", vec![2], 200));
        b.add(reference("z", vec![1], 100));

        let m = a.merge(&b);
        assert_eq!(m.len(), 3);
        assert_eq!(m.get_reference(&key("x")).unwrap().last_modified(), 200);

        // no two entries share a document key
        let keys = doc_keys(&m);
        let mut deduped = keys.clone();
        deduped.dedup();
        assert_eq!(keys, deduped);
    }

    #[test]
    fn test_remove_entries() {
        let mut c = container("t", &[("a", 1), ("b", 1), ("c", 1)]);
        let mut doomed = DocumentSet::default();
        doomed.insert(key("a"));
        doomed.insert(key("c"));
        doomed.insert(key("nothere"));
        assert_eq!(c.remove_entries(&doomed), 2);
        assert_eq!(doc_keys(&c), vec![key("b")]);
    }

    #[test]
    fn test_join_intersection_unbounded() {
        let a = container("t1", &[("a", 1), ("b", 1), ("c", 1)]);
        let b = container("t2", &[("b", 5), ("c", 9), ("d", 2)]);
        let j = a.join(&b, u64::MAX);
        assert_eq!(doc_keys(&j), vec![key("b"), key("c")]);
    }

    #[test]
    fn test_join_distance_bound() {
        // "web" holds A@[10], "search" holds A@[12]: distance 2
        let mut a = ReferenceContainer::new(key("web"));
        a.add(reference("A", vec![10], 100));
        let mut b = ReferenceContainer::new(key("search"));
        b.add(reference("A", vec![12], 100));

        let j = a.join(&b, 5);
        assert_eq!(j.len(), 1);
        assert_eq!(j.get_reference(&key("A")).unwrap().distance(), 2);

        let j = a.join(&b, 1);
        assert!(j.is_empty());
    }

    #[test]
    fn test_join_empty_short_circuit() {
        let a = container("t1", &[("a", 1)]);
        let empty = ReferenceContainer::<WordReference>::new(key("t2"));
        assert!(a.join(&empty, u64::MAX).is_empty());
        assert!(empty.join(&a, u64::MAX).is_empty());
    }

    #[test]
    fn test_join_probe_and_enumeration_agree() {
        // sizes 2 vs 1000 select the probe variant; 900 vs 1000 select
        // enumeration; both must produce the same intersection
        let mut big = ReferenceContainer::new(key("big"));
        let mut mid = ReferenceContainer::new(key("mid"));
        for i in 0..1000u32 {
            big.add(reference(&format!("d{i:04}"), vec![i], 100));
            if i < 900 {
                mid.add(reference(&format!("d{i:04}"), vec![i + 1], 100));
            }
        }
        let mut tiny = ReferenceContainer::new(key("tiny"));
        tiny.add(reference("d0004", vec![7], 100));
        tiny.add(reference("d0500", vec![501], 100));

        assert!(probe_is_cheaper(tiny.len(), big.len()));
        assert!(!probe_is_cheaper(mid.len(), big.len()));

        let j1 = tiny.join(&big, u64::MAX);
        assert_eq!(doc_keys(&j1), vec![key("d0004"), key("d0500")]);

        let j2 = mid.join(&big, u64::MAX);
        assert_eq!(j2.len(), 900);
    }

    #[test]
    fn test_join_many_aborts_on_empty() {
        let a = container("t1", &[("a", 1), ("b", 1)]);
        let b = container("t2", &[("c", 1)]);
        let joined = ReferenceContainer::join_many(vec![a.clone(), b], u64::MAX);
        assert!(joined.is_empty());

        let empty = ReferenceContainer::<WordReference>::new(key("t3"));
        let joined = ReferenceContainer::join_many(vec![a, empty], u64::MAX);
        assert!(joined.is_empty());
    }

    #[test]
    fn test_join_many_three_way() {
        let a = container("t1", &[("a", 1), ("b", 2), ("c", 3)]);
        let b = container("t2", &[("b", 3), ("c", 4), ("d", 5)]);
        let c = container("t3", &[("c", 5), ("b", 4)]);
        let joined = ReferenceContainer::join_many(vec![a, b, c], u64::MAX);
        assert_eq!(doc_keys(&joined), vec![key("b"), key("c")]);
    }

    #[test]
    fn test_exclude() {
        let mut pivot = container("t1", &[("a", 1), ("b", 1), ("c", 1)]);
        let excl = container("t2", &[("b", 2), ("x", 2)]);
        assert_eq!(pivot.exclude(&excl), 1);
        assert_eq!(doc_keys(&pivot), vec![key("a"), key("c")]);

        // excluding an empty container is a no-op
        let empty = ReferenceContainer::<WordReference>::new(key("t3"));
        assert_eq!(pivot.exclude(&empty), 0);
        assert_eq!(pivot.len(), 2);
    }

    #[test]
    fn test_exclude_probe_and_enumeration_agree() {
        let mut big1 = ReferenceContainer::new(key("p1"));
        let mut big2 = ReferenceContainer::new(key("p2"));
        for i in 0..500u32 {
            big1.add(reference(&format!("d{i:04}"), vec![i], 100));
            big2.add(reference(&format!("d{i:04}"), vec![i], 100));
        }
        let mut small = ReferenceContainer::new(key("e"));
        small.add(reference("d0100", vec![1], 100));
        small.add(reference("d0200", vec![1], 100));

        // probe path
        assert_eq!(big1.exclude(&small), 2);
        // enumeration path
        let mut near = ReferenceContainer::new(key("e2"));
        for i in 0..400u32 {
            near.add(reference(&format!("d{i:04}"), vec![i], 100));
        }
        assert!(!probe_is_cheaper(big2.len(), near.len()));
        assert_eq!(big2.exclude(&near), 400);
        assert_eq!(big2.len(), 100);
    }

    #[test]
    fn test_exclude_many_short_circuits() {
        let mut pivot = container("t1", &[("a", 1)]);
        let e1 = container("e1", &[("a", 1)]);
        let e2 = container("e2", &[("b", 1)]);
        assert_eq!(pivot.exclude_many(&[e1, e2]), 1);
        assert!(pivot.is_empty());
    }

    #[test]
    fn test_filtered() {
        let c = container("t", &[("a", 1), ("b", 1)]);
        let mut filter = DocumentSet::default();
        filter.insert(key("b"));
        let f = c.filtered(&filter);
        assert_eq!(doc_keys(&f), vec![key("b")]);
    }

    #[test]
    fn test_rows_round_trip() {
        use crate::reference::WordCodec;

        let codec = WordCodec::default();
        let mut c = ReferenceContainer::new(key("t"));
        c.add(reference("a", vec![1, 5], 100));
        c.add(reference("b", vec![2], 200));

        let rows = c.to_rows(&codec).unwrap();
        assert_eq!(rows.len(), 2 * codec.row_width());

        let back =
            ReferenceContainer::from_rows(&codec, key("t"), &rows).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.get_reference(&key("a")).unwrap().positions(), &[1, 5]);
        assert_eq!(back.get_reference(&key("b")).unwrap().last_modified(), 200);
    }
}
