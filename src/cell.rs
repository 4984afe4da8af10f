//! The store facade: one RAM cache and one segment stack behind a single
//! postings interface.
//!
//! Writes land in the cache; reads union the cache, any caches currently
//! being dumped, and the segment stack, resolving duplicate documents by
//! recency. Maintenance is piggybacked on the write path: every Nth
//! insertion (or after a cooldown) the cell checks whether the cache should
//! be flushed to disk and whether the segment stack has grown enough to
//! deserve compaction. All heavy disk work is delegated to the background
//! dispatcher; a flush only swaps the cache object and hands the full one
//! over, so writers are never blocked on disk.

use std::mem;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

/// A cache handed to the dispatcher whose dump has not finished yet. The
/// cache stays readable here until the resulting segment is mounted; the
/// flag is raised by the dispatcher when the dump failed and the data only
/// exists in this cache.
struct FlushEntry<C: ReferenceCodec> {
    cache: Arc<ReferenceContainerCache<C>>,
    failed: Arc<AtomicBool>,
}

impl<C: ReferenceCodec> Clone for FlushEntry<C> {
    fn clone(&self) -> Self {
        FlushEntry {
            cache: self.cache.clone(),
            failed: self.failed.clone(),
        }
    }
}

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::array::{ArrayConfig, ReferenceContainerArray};
use crate::cache::ReferenceContainerCache;
use crate::container::{DocumentSet, ReferenceContainer};
use crate::dispatcher::IODispatcher;
use crate::error::{Result, RwIndexError};
use crate::order::SharedKeyOrder;
use crate::reference::ReferenceCodec;

/// Configuration for an [`IndexCell`].
#[derive(Debug, Clone)]
pub struct IndexCellConfig {
    /// Fixed width of term keys, in bytes.
    pub term_key_len: usize,
    /// Cache reference count above which a flush is scheduled.
    pub max_ram_references: usize,
    /// Preferred size for merged segment files, in bytes.
    pub target_file_size: u64,
    /// Hard ceiling for merged segment files, in bytes.
    pub max_file_size: u64,
    /// Segment count above which compaction starts.
    pub max_segments: usize,
    /// Run the maintenance check every this many insertions.
    pub cleanup_check_interval: u64,
    /// Also run the maintenance check after this much time.
    pub cleanup_cycle: Duration,
    /// Flush a non-empty cache that has not been dumped for this long.
    pub dump_cycle: Duration,
    /// Bound of the dispatcher's dump queue.
    pub dump_queue_capacity: usize,
    /// Bound of the dispatcher's merge queue.
    pub merge_queue_capacity: usize,
    /// Segment stack configuration.
    pub array: ArrayConfig,
}

impl Default for IndexCellConfig {
    fn default() -> Self {
        IndexCellConfig {
            term_key_len: 12,
            max_ram_references: 100_000,
            target_file_size: 64 * 1024 * 1024,
            max_file_size: 256 * 1024 * 1024,
            max_segments: 50,
            cleanup_check_interval: 1000,
            cleanup_cycle: Duration::from_secs(60),
            dump_cycle: Duration::from_secs(600),
            dump_queue_capacity: 2,
            merge_queue_capacity: 4,
            array: ArrayConfig::default(),
        }
    }
}

/// A complete postings store over one directory.
pub struct IndexCell<C: ReferenceCodec> {
    codec: C,
    order: SharedKeyOrder,
    config: IndexCellConfig,
    cache: RwLock<Arc<ReferenceContainerCache<C>>>,
    flushing: Mutex<Vec<FlushEntry<C>>>,
    array: Arc<ReferenceContainerArray<C>>,
    dispatcher: IODispatcher<C>,
    add_count: AtomicU64,
    last_cleanup: Mutex<Instant>,
    last_dump: Mutex<Instant>,
    closed: AtomicBool,
}

impl<C: ReferenceCodec> IndexCell<C> {
    /// Open a store in `directory`, mounting any segment files left by a
    /// previous run and starting the background dispatcher.
    pub fn open(
        directory: &Path,
        codec: C,
        order: SharedKeyOrder,
        config: IndexCellConfig,
    ) -> Result<Self> {
        let array = Arc::new(ReferenceContainerArray::open(
            directory,
            codec.clone(),
            order.clone(),
            config.term_key_len,
            config.array.clone(),
        )?);
        let dispatcher = IODispatcher::start(
            codec.clone(),
            order.clone(),
            config.term_key_len,
            config.dump_queue_capacity,
            config.merge_queue_capacity,
        )?;
        let cache = Arc::new(ReferenceContainerCache::new(
            codec.clone(),
            order.clone(),
            config.term_key_len,
            Some(config.max_ram_references),
        ));
        Ok(IndexCell {
            codec,
            order,
            config,
            cache: RwLock::new(cache),
            flushing: Mutex::new(Vec::new()),
            array,
            dispatcher,
            add_count: AtomicU64::new(0),
            last_cleanup: Mutex::new(Instant::now()),
            last_dump: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(RwIndexError::invalid_operation("the store is closed"));
        }
        Ok(())
    }

    fn new_cache(&self) -> Arc<ReferenceContainerCache<C>> {
        Arc::new(ReferenceContainerCache::new(
            self.codec.clone(),
            self.order.clone(),
            self.config.term_key_len,
            Some(self.config.max_ram_references),
        ))
    }

    /// Add a container of references. Duplicate documents already buffered
    /// for the same term are resolved by recency. A cache that reports its
    /// capacity bound still took the data; the signal schedules a flush.
    pub fn add(&self, container: ReferenceContainer<C::Ref>) -> Result<()> {
        self.ensure_open()?;
        // bind before matching so the read guard is released first
        let added = self.cache.read().add(container);
        match added {
            Ok(()) => {}
            Err(RwIndexError::CapacityExceeded(msg)) => {
                debug!("cache reports {msg}, flushing");
                self.flush()?;
            }
            Err(e) => return Err(e),
        }
        self.maybe_cleanup()
    }

    /// Add a single reference under a term key.
    pub fn add_reference(&self, term_key: &[u8], reference: C::Ref) -> Result<()> {
        let mut container = ReferenceContainer::new(term_key.to_vec());
        container.add(reference);
        self.add(container)
    }

    /// Whether any tier holds references for `term_key`.
    pub fn has(&self, term_key: &[u8]) -> bool {
        if self.cache.read().has(term_key) {
            return true;
        }
        if self.flushing.lock().iter().any(|f| f.cache.has(term_key)) {
            return true;
        }
        self.array.has(term_key)
    }

    /// Number of references stored for `term_key`, summed over all tiers.
    /// An upper bound: a document updated in RAM but not yet merged on
    /// disk is counted once per tier.
    pub fn count(&self, term_key: &[u8]) -> usize {
        let mut total = self.cache.read().count(term_key);
        total += self
            .flushing
            .lock()
            .iter()
            .map(|f| f.cache.count(term_key))
            .sum::<usize>();
        total + self.array.count(term_key)
    }

    /// The full container for `term_key`, merged across all tiers with
    /// recency resolution. RAM entries win ties against disk entries.
    pub fn get(&self, term_key: &[u8]) -> Result<Option<ReferenceContainer<C::Ref>>> {
        let mut result = self.cache.read().get(term_key);
        for entry in self.flushing.lock().iter() {
            if let Some(c) = entry.cache.get(term_key) {
                result = Some(match result {
                    Some(acc) => acc.merge(&c),
                    None => c,
                });
            }
        }
        if let Some(disk) = self.array.get(term_key)? {
            result = Some(match result {
                Some(acc) => acc.merge(&disk),
                None => disk,
            });
        }
        Ok(result)
    }

    /// Like [`get`](Self::get), restricted to documents in `filter`.
    pub fn get_filtered(
        &self,
        term_key: &[u8],
        filter: &DocumentSet,
    ) -> Result<Option<ReferenceContainer<C::Ref>>> {
        Ok(self.get(term_key)?.map(|c| c.filtered(filter)))
    }

    /// Block until every flushed cache has landed as a mounted segment.
    /// Removals must not race a dump that may already have written the
    /// doomed records, so they settle the disk tier first. A flush whose
    /// dump failed never lands; it is reported instead of waited for.
    fn await_flushes(&self) -> Result<()> {
        loop {
            self.prune_flushing();
            {
                let flushing = self.flushing.lock();
                if flushing.is_empty() {
                    return Ok(());
                }
                if flushing.iter().any(|f| f.failed.load(AtomicOrdering::SeqCst)) {
                    return Err(RwIndexError::storage(
                        "a background dump failed, its data is still buffered in RAM",
                    ));
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Remove the given documents from one term, in RAM and on disk.
    /// Returns the number of references removed.
    pub fn remove(&self, term_key: &[u8], doc_keys: &DocumentSet) -> Result<usize> {
        self.ensure_open()?;
        self.await_flushes()?;
        let mut removed = self.cache.read().remove(term_key, doc_keys);
        removed += self.array.remove(term_key, doc_keys)?;
        Ok(removed)
    }

    /// Drop a term entirely, in RAM and on disk. Returns the number of
    /// references removed.
    pub fn delete(&self, term_key: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.await_flushes()?;
        let mut removed = self
            .cache
            .read()
            .delete(term_key)
            .map_or(0, |c| c.len());
        removed += self.array.delete(term_key)?;
        Ok(removed)
    }

    /// All term keys present in any tier, in the store's order.
    pub fn term_keys(&self) -> Vec<Vec<u8>> {
        let mut keys = self.cache.read().sorted_term_keys();
        for entry in self.flushing.lock().iter() {
            keys.extend(entry.cache.sorted_term_keys());
        }
        keys.extend(self.array.term_keys());
        keys.sort_by(|a, b| self.order.compare(a, b));
        keys.dedup();
        keys
    }

    /// Number of distinct terms across all tiers. Scans every tier's key
    /// set, so this is not a cheap call.
    pub fn size(&self) -> usize {
        self.term_keys().len()
    }

    /// Iterate containers in term-key order, starting at the first key at
    /// or after `start` (or the smallest key). With `wrap_around` the
    /// iteration continues from the smallest key after the last one, so
    /// every term is visited exactly once.
    pub fn iterate(&self, start: Option<&[u8]>, wrap_around: bool) -> CellIter<'_, C> {
        let mut keys = self.term_keys();
        if let Some(start) = start {
            let pos = keys.partition_point(|k| self.order.compare(k, start).is_lt());
            if wrap_around {
                keys.rotate_left(pos);
            } else {
                keys.drain(..pos);
            }
        }
        CellIter {
            cell: self,
            keys,
            pos: 0,
        }
    }

    /// Fetch the containers for a conjunction of terms, each restricted to
    /// `filter` when one is given. Returns an empty vector as soon as any
    /// term has no surviving references, since the intersection is then
    /// known to be empty.
    pub fn search_conjunction(
        &self,
        term_keys: &[Vec<u8>],
        filter: Option<&DocumentSet>,
    ) -> Result<Vec<ReferenceContainer<C::Ref>>> {
        let mut containers = Vec::with_capacity(term_keys.len());
        for key in term_keys {
            let found = match filter {
                Some(filter) => self.get_filtered(key, filter)?,
                None => self.get(key)?,
            };
            match found {
                Some(c) if !c.is_empty() => containers.push(c),
                _ => return Ok(Vec::new()),
            }
        }
        Ok(containers)
    }

    /// Conjunction search with proximity: documents containing all terms
    /// whose merged position spread stays within `max_distance`
    /// (`u64::MAX` for no bound). The result carries an empty term key.
    pub fn search_join(
        &self,
        term_keys: &[Vec<u8>],
        filter: Option<&DocumentSet>,
        max_distance: u64,
    ) -> Result<ReferenceContainer<C::Ref>> {
        let containers = self.search_conjunction(term_keys, filter)?;
        if containers.is_empty() {
            return Ok(ReferenceContainer::new(Vec::new()));
        }
        Ok(ReferenceContainer::join_many(containers, max_distance))
    }

    /// Swap in a fresh cache and schedule the full one for dumping. The
    /// swapped-out cache stays readable until its segment is mounted.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let old = {
            let mut cache = self.cache.write();
            if cache.is_empty() {
                return Ok(());
            }
            mem::replace(&mut *cache, self.new_cache())
        };
        debug!(
            "flushing cache with {} terms ({} references)",
            old.term_count(),
            old.reference_count()
        );
        let entry = FlushEntry {
            cache: old.clone(),
            failed: Arc::new(AtomicBool::new(false)),
        };
        self.flushing.lock().push(entry.clone());
        self.dispatcher
            .submit_dump(old, self.array.clone(), entry.failed)?;
        *self.last_dump.lock() = Instant::now();
        self.prune_flushing();
        Ok(())
    }

    /// Drop flushed caches whose dump has completed. A successful dump
    /// clears its cache after mounting the segment, so an emptied cache is
    /// the completion signal. A failed dump leaves its cache non-empty;
    /// that entry is kept so the data stays readable.
    fn prune_flushing(&self) {
        self.flushing.lock().retain(|f| !f.cache.is_empty());
    }

    fn maybe_cleanup(&self) -> Result<()> {
        let n = self.add_count.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        let due_by_count = n % self.config.cleanup_check_interval == 0;
        let due_by_time = {
            let last = self.last_cleanup.lock();
            last.elapsed() >= self.config.cleanup_cycle
        };
        if !due_by_count && !due_by_time {
            return Ok(());
        }
        *self.last_cleanup.lock() = Instant::now();
        self.prune_flushing();

        let cache_full = self.cache.read().reference_count() >= self.config.max_ram_references;
        let dump_due = {
            let last = self.last_dump.lock();
            last.elapsed() >= self.config.dump_cycle && !self.cache.read().is_empty()
        };
        if cache_full || dump_due {
            self.flush()?;
        }
        if self.array.segment_count() > self.config.max_segments {
            self.shrink()?;
        }
        Ok(())
    }

    /// Schedule merges until the segment count is acceptable or the merge
    /// queue is too busy. The more jobs are already queued, the less
    /// aggressive the selection gets.
    fn shrink(&self) -> Result<()> {
        let target = self.config.target_file_size;
        let max = self.config.max_file_size;
        let mut term = 10;
        while term > 0 && self.array.segment_count() > self.config.max_segments {
            term -= 1;
            if self.dispatcher.merge_queue_len() < 3 {
                if let Some((a, b)) = self.array.unmount_best_match(2.0, target) {
                    self.dispatcher.submit_merge(a, b, self.array.clone())?;
                    continue;
                }
            }
            if self.dispatcher.merge_queue_len() < 2 {
                if let Some((a, b)) = self.array.unmount_smallest_pair(target) {
                    self.dispatcher.submit_merge(a, b, self.array.clone())?;
                    continue;
                }
            }
            if self.dispatcher.merge_queue_len() < 1 {
                if let Some((a, b)) = self.array.unmount_best_match(2.0, max) {
                    self.dispatcher.submit_merge(a, b, self.array.clone())?;
                    continue;
                }
            }
            if self.dispatcher.merge_queue_len() < 1 {
                if let Some(oldest) = self.array.unmount_oldest() {
                    self.dispatcher.submit_rewrite(oldest, self.array.clone())?;
                }
            }
            break;
        }
        Ok(())
    }

    /// Drop everything: the cache, pending flushes and all segment files.
    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.await_flushes()?;
        // a queued merge holds unmounted segments and would mount its
        // output into the emptied stack once it runs
        while self.dispatcher.pending_merges() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.cache.read().clear();
        self.array.clear()
    }

    /// Close the store: stop the dispatcher (draining its queues) and dump
    /// any remaining RAM content synchronously. Further writes fail with an
    /// invalid-operation error; reads keep working against the mounted
    /// segments.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, AtomicOrdering::SeqCst) {
            return Ok(());
        }
        self.dispatcher.terminate()?;
        self.prune_flushing();
        // a dump that failed in the background left its data in the
        // flushing list; retry it synchronously before letting go
        let leftovers: Vec<FlushEntry<C>> = self.flushing.lock().clone();
        for entry in leftovers {
            if entry.cache.is_empty() {
                continue;
            }
            let target = self.array.new_segment_path();
            if let Some(path) =
                entry.cache.dump(&target, self.array.write_buffer_size(), false)?
            {
                self.array.mount(&path)?;
                entry.cache.clear();
            }
        }
        self.prune_flushing();
        let cache = self.cache.read().clone();
        if !cache.is_empty() {
            let target = self.array.new_segment_path();
            if let Some(path) = cache.dump(&target, self.array.write_buffer_size(), false)? {
                self.array.mount(&path)?;
                cache.clear();
            }
        }
        info!(
            "store closed with {} segment files",
            self.array.segment_count()
        );
        Ok(())
    }

    /// Number of references currently buffered in RAM.
    pub fn ram_reference_count(&self) -> usize {
        let mut total = self.cache.read().reference_count();
        total += self
            .flushing
            .lock()
            .iter()
            .map(|f| f.cache.reference_count())
            .sum::<usize>();
        total
    }

    /// Number of mounted segment files.
    pub fn segment_count(&self) -> usize {
        self.array.segment_count()
    }

    /// Total size of all segment files in bytes.
    pub fn total_file_size(&self) -> u64 {
        self.array.total_file_size()
    }
}

impl<C: ReferenceCodec> Drop for IndexCell<C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("failed to close store: {e}");
        }
    }
}

/// Term-ordered container iterator over a whole store.
pub struct CellIter<'a, C: ReferenceCodec> {
    cell: &'a IndexCell<C>,
    keys: Vec<Vec<u8>>,
    pos: usize,
}

impl<C: ReferenceCodec> Iterator for CellIter<'_, C> {
    type Item = Result<ReferenceContainer<C::Ref>>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.keys.len() {
            let key = &self.keys[self.pos];
            self.pos += 1;
            match self.cell.get(key) {
                Ok(Some(container)) => return Some(Ok(container)),
                // the term vanished since the key snapshot, skip it
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::NaturalOrder;
    use crate::reference::{Reference, WordCodec, WordReference};
    use tempfile::TempDir;

    const KEY_LEN: usize = 12;

    fn key(s: &str) -> Vec<u8> {
        let mut k = s.as_bytes().to_vec();
        k.resize(KEY_LEN, b'_');
        k
    }

    fn cell(dir: &Path) -> IndexCell<WordCodec> {
        IndexCell::open(
            dir,
            WordCodec::default(),
            NaturalOrder::shared(),
            IndexCellConfig::default(),
        )
        .unwrap()
    }

    fn reference(doc: &str, positions: Vec<u32>, modified: i64) -> WordReference {
        WordReference::new(key(doc), positions, modified).unwrap()
    }

    #[test]
    fn test_get_merges_ram_and_disk() {
        let dir = TempDir::new().unwrap();
        let cell = cell(dir.path());

        cell.add_reference(&key("term"), reference("A", vec![1], 100)).unwrap();
        cell.add_reference(&key("term"), reference("B", vec![1], 100)).unwrap();
        cell.flush().unwrap();
        // newer version of A plus a fresh document, RAM only
        cell.add_reference(&key("term"), reference("A", vec![2], 200)).unwrap();
        cell.add_reference(&key("term"), reference("C", vec![1], 100)).unwrap();

        let c = cell.get(&key("term")).unwrap().unwrap();
        assert_eq!(c.len(), 3);
        assert_eq!(c.get_reference(&key("A")).unwrap().last_modified(), 200);
        assert!(cell.has(&key("term")));
        assert!(cell.get(&key("missing")).unwrap().is_none());

        let mut docs = DocumentSet::default();
        docs.insert(key("A"));
        docs.insert(key("C"));
        let c = cell.get_filtered(&key("term"), &docs).unwrap().unwrap();
        assert_eq!(c.len(), 2);
        assert!(c.get_reference(&key("B")).is_none());
    }

    #[test]
    fn test_remove_and_delete_span_tiers() {
        let dir = TempDir::new().unwrap();
        let cell = cell(dir.path());

        cell.add_reference(&key("term"), reference("A", vec![1], 100)).unwrap();
        cell.add_reference(&key("term"), reference("B", vec![1], 100)).unwrap();
        cell.flush().unwrap();
        cell.add_reference(&key("term"), reference("C", vec![1], 100)).unwrap();

        let mut docs = DocumentSet::default();
        docs.insert(key("A"));
        docs.insert(key("C"));
        assert_eq!(cell.remove(&key("term"), &docs).unwrap(), 2);

        let c = cell.get(&key("term")).unwrap().unwrap();
        assert_eq!(c.len(), 1);
        assert!(c.get_reference(&key("B")).is_some());

        assert_eq!(cell.delete(&key("term")).unwrap(), 1);
        assert!(!cell.has(&key("term")));
    }

    #[test]
    fn test_iterate_in_term_order() {
        let dir = TempDir::new().unwrap();
        let cell = cell(dir.path());

        cell.add_reference(&key("delta"), reference("A", vec![1], 100)).unwrap();
        cell.add_reference(&key("alpha"), reference("A", vec![1], 100)).unwrap();
        cell.flush().unwrap();
        cell.add_reference(&key("mu"), reference("A", vec![1], 100)).unwrap();

        let terms: Vec<Vec<u8>> = cell
            .iterate(None, false)
            .map(|c| c.unwrap().term_key().to_vec())
            .collect();
        assert_eq!(terms, vec![key("alpha"), key("delta"), key("mu")]);

        let terms: Vec<Vec<u8>> = cell
            .iterate(Some(&key("delta")), false)
            .map(|c| c.unwrap().term_key().to_vec())
            .collect();
        assert_eq!(terms, vec![key("delta"), key("mu")]);

        let terms: Vec<Vec<u8>> = cell
            .iterate(Some(&key("delta")), true)
            .map(|c| c.unwrap().term_key().to_vec())
            .collect();
        assert_eq!(terms, vec![key("delta"), key("mu"), key("alpha")]);
    }

    #[test]
    fn test_search_conjunction_short_circuits() {
        let dir = TempDir::new().unwrap();
        let cell = cell(dir.path());

        cell.add_reference(&key("t1"), reference("A", vec![1], 100)).unwrap();
        cell.add_reference(&key("t2"), reference("A", vec![5], 100)).unwrap();

        let found = cell
            .search_conjunction(&[key("t1"), key("t2")], None)
            .unwrap();
        assert_eq!(found.len(), 2);

        let found = cell
            .search_conjunction(&[key("t1"), key("missing"), key("t2")], None)
            .unwrap();
        assert!(found.is_empty());

        // a filter that rules out every document empties the intersection
        let mut docs = DocumentSet::default();
        docs.insert(key("B"));
        let found = cell
            .search_conjunction(&[key("t1"), key("t2")], Some(&docs))
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_search_join_with_proximity() {
        let dir = TempDir::new().unwrap();
        let cell = cell(dir.path());

        // doc A has the terms close together, doc B far apart
        cell.add_reference(&key("t1"), reference("A", vec![10], 100)).unwrap();
        cell.add_reference(&key("t2"), reference("A", vec![12], 100)).unwrap();
        cell.add_reference(&key("t1"), reference("B", vec![10], 100)).unwrap();
        cell.add_reference(&key("t2"), reference("B", vec![90], 100)).unwrap();
        cell.flush().unwrap();

        let joined = cell
            .search_join(&[key("t1"), key("t2")], None, u64::MAX)
            .unwrap();
        assert_eq!(joined.len(), 2);

        let joined = cell.search_join(&[key("t1"), key("t2")], None, 5).unwrap();
        assert_eq!(joined.len(), 1);
        assert!(joined.get_reference(&key("A")).is_some());

        let joined = cell
            .search_join(&[key("t1"), key("missing")], None, u64::MAX)
            .unwrap();
        assert!(joined.is_empty());

        // restricting to doc B leaves only the far-apart document
        let mut docs = DocumentSet::default();
        docs.insert(key("B"));
        let joined = cell
            .search_join(&[key("t1"), key("t2")], Some(&docs), u64::MAX)
            .unwrap();
        assert_eq!(joined.len(), 1);
        assert!(joined.get_reference(&key("B")).is_some());
    }

    #[test]
    fn test_close_dumps_remaining_ram() {
        let dir = TempDir::new().unwrap();
        {
            let cell = cell(dir.path());
            cell.add_reference(&key("term"), reference("A", vec![1], 100)).unwrap();
            cell.close().unwrap();
            // writes are refused after close
            assert!(cell
                .add_reference(&key("term"), reference("B", vec![1], 100))
                .is_err());
            // reads keep working
            assert_eq!(cell.count(&key("term")), 1);
        }
        let cell = cell(dir.path());
        let c = cell.get(&key("term")).unwrap().unwrap();
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_failed_dump_keeps_data_readable() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("store");
        let cell = cell(&store_dir);
        cell.add_reference(&key("term"), reference("A", vec![1], 100)).unwrap();

        // the dump target directory vanishes before the dump runs
        std::fs::remove_dir_all(&store_dir).unwrap();
        cell.flush().unwrap();
        loop {
            let failed = cell
                .flushing
                .lock()
                .iter()
                .any(|f| f.failed.load(AtomicOrdering::SeqCst));
            if failed {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // the flushed snapshot is still served from RAM
        assert!(cell.has(&key("term")));
        assert_eq!(cell.get(&key("term")).unwrap().unwrap().len(), 1);
        assert_eq!(cell.ram_reference_count(), 1);
        // operations that need the disk tier settled surface the failure
        assert!(cell.delete(&key("term")).is_err());
        // close retries the dump synchronously and reports the error
        assert!(cell.close().is_err());
    }

    #[test]
    fn test_clear_outlives_pending_merges() {
        let dir = TempDir::new().unwrap();
        let config = IndexCellConfig {
            cleanup_check_interval: 1,
            max_segments: 1,
            ..IndexCellConfig::default()
        };
        {
            let cell = IndexCell::open(
                dir.path(),
                WordCodec::default(),
                NaturalOrder::shared(),
                config.clone(),
            )
            .unwrap();
            // enough generations that maintenance queues merge jobs
            for round in 0..4 {
                cell.add_reference(
                    &key("term"),
                    reference(&format!("d{round}"), vec![1], 100),
                )
                .unwrap();
                cell.flush().unwrap();
            }
            cell.clear().unwrap();
            assert_eq!(cell.size(), 0);
            assert_eq!(cell.segment_count(), 0);
            cell.close().unwrap();
        }

        // no merge output resurfaces on reopen
        let cell = IndexCell::open(
            dir.path(),
            WordCodec::default(),
            NaturalOrder::shared(),
            config,
        )
        .unwrap();
        assert_eq!(cell.size(), 0);
        assert_eq!(cell.segment_count(), 0);
    }

    #[test]
    fn test_clear_drops_everything() {
        let dir = TempDir::new().unwrap();
        let cell = cell(dir.path());
        cell.add_reference(&key("t1"), reference("A", vec![1], 100)).unwrap();
        cell.flush().unwrap();
        cell.add_reference(&key("t2"), reference("B", vec![1], 100)).unwrap();

        cell.clear().unwrap();
        assert_eq!(cell.size(), 0);
        assert_eq!(cell.segment_count(), 0);
        assert!(!cell.has(&key("t1")));
    }

    #[test]
    fn test_size_counts_distinct_terms() {
        let dir = TempDir::new().unwrap();
        let cell = cell(dir.path());
        cell.add_reference(&key("t1"), reference("A", vec![1], 100)).unwrap();
        cell.add_reference(&key("t2"), reference("A", vec![1], 100)).unwrap();
        cell.flush().unwrap();
        // t1 appears in both tiers, counted once
        cell.add_reference(&key("t1"), reference("B", vec![1], 100)).unwrap();

        assert_eq!(cell.size(), 2);
    }
}
