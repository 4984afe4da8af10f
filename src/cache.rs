//! RAM tier of the store: a mutable map from term key to container.
//!
//! The cache absorbs all writes. It is unordered while live (a hash map
//! guarded by one lock) and only sorted once, at dump time, when its whole
//! content is written out as a new segment file.
//!
//! Capacity is bounded by reference count. A write that crosses a
//! configured bound is still taken; the capacity error only signals the
//! owning cell that a flush to disk is due.

use std::path::{Path, PathBuf};

use ahash::AHashMap;
use log::debug;
use parking_lot::RwLock;

use crate::container::{DocumentSet, ReferenceContainer};
use crate::error::{Result, RwIndexError};
use crate::order::SharedKeyOrder;
use crate::reference::{Reference, ReferenceCodec};
use crate::segment::SegmentWriter;

/// In-memory write buffer holding one container per term.
#[derive(Debug)]
pub struct ReferenceContainerCache<C: ReferenceCodec> {
    codec: C,
    order: SharedKeyOrder,
    term_key_len: usize,
    /// Maximum number of references held across all containers, if bounded.
    max_references: Option<usize>,
    map: RwLock<AHashMap<Vec<u8>, ReferenceContainer<C::Ref>>>,
    reference_count: RwLock<usize>,
}

impl<C: ReferenceCodec> ReferenceContainerCache<C> {
    /// Create an empty cache. `max_references` bounds the total number of
    /// references held; `None` means unbounded.
    pub fn new(
        codec: C,
        order: SharedKeyOrder,
        term_key_len: usize,
        max_references: Option<usize>,
    ) -> Self {
        ReferenceContainerCache {
            codec,
            order,
            term_key_len,
            max_references,
            map: RwLock::new(AHashMap::new()),
            reference_count: RwLock::new(0),
        }
    }

    fn check_key(&self, term_key: &[u8]) -> Result<()> {
        if term_key.len() != self.term_key_len {
            return Err(RwIndexError::index(format!(
                "term key has {} bytes, cache expects {}",
                term_key.len(),
                self.term_key_len
            )));
        }
        // the all-zero key marks deleted records in segment files
        if term_key.iter().all(|&b| b == 0) {
            return Err(RwIndexError::index("the all-zero term key is reserved"));
        }
        Ok(())
    }

    /// Number of terms currently buffered.
    pub fn term_count(&self) -> usize {
        self.map.read().len()
    }

    /// Total number of references across all buffered containers.
    pub fn reference_count(&self) -> usize {
        *self.reference_count.read()
    }

    /// Whether the cache holds no terms.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Merge a container into the cache under its term key, with recency
    /// resolution for documents present on both sides.
    pub fn add(&self, container: ReferenceContainer<C::Ref>) -> Result<()> {
        if container.is_empty() {
            return Ok(());
        }
        self.check_key(container.term_key())?;
        // a malformed document key would only surface at dump time and
        // fail the whole segment write, so refuse it here
        for r in container.iter() {
            if r.doc_key().len() != self.codec.doc_key_len() {
                return Err(RwIndexError::index(format!(
                    "document key has {} bytes, codec expects {}",
                    r.doc_key().len(),
                    self.codec.doc_key_len()
                )));
            }
        }

        let mut map = self.map.write();
        let mut count = self.reference_count.write();

        let added = match map.get_mut(container.term_key()) {
            Some(existing) => {
                let before = existing.len();
                existing.put_all_recent(&container);
                existing.len() - before
            }
            None => {
                let added = container.len();
                map.insert(container.term_key().to_vec(), container);
                added
            }
        };

        if let Some(max) = self.max_references {
            if *count + added > max {
                // roll back is not needed for correctness, the data stays
                // merged; the refusal only signals that a flush is due
                *count += added;
                return Err(RwIndexError::capacity(format!(
                    "cache holds {} references, bound is {max}",
                    *count
                )));
            }
        }
        *count += added;
        Ok(())
    }

    /// Add a single reference under a term key.
    pub fn add_reference(&self, term_key: &[u8], reference: C::Ref) -> Result<()> {
        let mut container = ReferenceContainer::new(term_key.to_vec());
        container.add(reference);
        self.add(container)
    }

    /// Whether the cache holds a container for `term_key`.
    pub fn has(&self, term_key: &[u8]) -> bool {
        self.map.read().contains_key(term_key)
    }

    /// Number of references buffered for `term_key`.
    pub fn count(&self, term_key: &[u8]) -> usize {
        self.map.read().get(term_key).map_or(0, |c| c.len())
    }

    /// Clone of the buffered container for `term_key`, if any.
    pub fn get(&self, term_key: &[u8]) -> Option<ReferenceContainer<C::Ref>> {
        self.map.read().get(term_key).cloned()
    }

    /// Like `get`, but restricted to the given document keys.
    pub fn get_filtered(
        &self,
        term_key: &[u8],
        filter: &DocumentSet,
    ) -> Option<ReferenceContainer<C::Ref>> {
        self.map.read().get(term_key).map(|c| c.filtered(filter))
    }

    /// Rough estimate of the memory held by buffered references, in bytes.
    pub fn used_memory(&self) -> usize {
        self.reference_count() * self.codec.row_width()
            + self.term_count() * self.term_key_len
    }

    /// Remove and return the container for `term_key`.
    pub fn delete(&self, term_key: &[u8]) -> Option<ReferenceContainer<C::Ref>> {
        let mut map = self.map.write();
        let removed = map.remove(term_key);
        if let Some(c) = &removed {
            *self.reference_count.write() -= c.len();
        }
        removed
    }

    /// Remove one document's reference from one term. Returns whether a
    /// reference was removed. An emptied container is dropped.
    pub fn remove_reference(&self, term_key: &[u8], doc_key: &[u8]) -> bool {
        let mut map = self.map.write();
        let Some(container) = map.get_mut(term_key) else {
            return false;
        };
        let removed = container.remove_reference(doc_key).is_some();
        if removed {
            *self.reference_count.write() -= 1;
            if container.is_empty() {
                map.remove(term_key);
            }
        }
        removed
    }

    /// Remove the given documents from one term's buffered container. An
    /// emptied container is dropped. Returns the number of references
    /// removed.
    pub fn remove(&self, term_key: &[u8], doc_keys: &DocumentSet) -> usize {
        if doc_keys.is_empty() {
            return 0;
        }
        let mut map = self.map.write();
        let Some(container) = map.get_mut(term_key) else {
            return 0;
        };
        let removed = container.remove_entries(doc_keys);
        if container.is_empty() {
            map.remove(term_key);
        }
        *self.reference_count.write() -= removed;
        removed
    }

    /// Snapshot of all buffered term keys sorted by the store's order.
    pub fn sorted_term_keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self.map.read().keys().cloned().collect();
        keys.sort_by(|a, b| self.order.compare(a, b));
        keys
    }

    /// Drop all buffered content.
    pub fn clear(&self) {
        self.map.write().clear();
        *self.reference_count.write() = 0;
    }

    /// Write the whole cache content as a new segment file at `target`.
    /// Terms are written in the store's key order. A `destructive` dump
    /// drains the cache term by term so memory is reclaimed while writing;
    /// a non-destructive dump leaves the cache readable until the caller
    /// clears it after mounting the segment. Returns the final segment
    /// path, or `None` when the cache was empty and no file was written.
    pub fn dump(
        &self,
        target: &Path,
        buffer_size: usize,
        destructive: bool,
    ) -> Result<Option<PathBuf>> {
        let keys = self.sorted_term_keys();
        if keys.is_empty() {
            return Ok(None);
        }
        debug!(
            "dumping {} terms ({} references) to {}",
            keys.len(),
            self.reference_count(),
            target.display()
        );

        let mut writer =
            SegmentWriter::create(target, self.term_key_len, self.order.clone(), buffer_size)?;
        let mut rows = Vec::new();
        for key in keys {
            let container = if destructive {
                self.delete(&key)
            } else {
                self.get(&key)
            };
            let Some(container) = container else {
                continue;
            };
            rows.clear();
            for reference in container.iter() {
                self.codec.encode(reference, &mut rows)?;
            }
            writer.add(&key, &rows)?;
        }
        Ok(Some(writer.finish()?))
    }

    /// Iterate cloned containers in the store's term-key order, starting
    /// at the first key at or after `start`. With `wrap_around` the
    /// sequence continues from the smallest key after the last one, so
    /// every buffered term is visited exactly once.
    pub fn iterate(
        &self,
        start: Option<&[u8]>,
        wrap_around: bool,
    ) -> impl Iterator<Item = ReferenceContainer<C::Ref>> + '_ {
        let mut keys = self.sorted_term_keys();
        if let Some(start) = start {
            let pos = keys.partition_point(|k| self.order.compare(k, start).is_lt());
            if wrap_around {
                keys.rotate_left(pos);
            } else {
                keys.drain(..pos);
            }
        }
        keys.into_iter().filter_map(move |k| self.get(&k))
    }
}
