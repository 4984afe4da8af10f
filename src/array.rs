//! Disk tier of the store: an ordered stack of mounted segment files.
//!
//! Segments are kept oldest to newest, the order their file names encode.
//! A term may appear in many segments; reads union all of them with recency
//! resolution. The stack itself only changes by whole files: a dump mounts
//! a new segment, a merge unmounts two and mounts their merged result, so a
//! concurrent reader sees either the input pair or the merged file, never a
//! partial state.
//!
//! Point reads carry a soft wall-clock budget. A store with very many
//! segments answers `get` and `count` best-effort: when the budget runs out
//! the partial result is returned and a warning is logged. Compaction
//! exists to keep the segment count low enough that the budget never
//! matters.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{info, warn};
use parking_lot::RwLock;

use crate::container::{DocumentSet, ReferenceContainer};
use crate::error::{Result, RwIndexError};
use crate::order::SharedKeyOrder;
use crate::reference::ReferenceCodec;
use crate::segment::Segment;

const SEGMENT_EXTENSION: &str = "seg";

/// Configuration for the segment stack.
#[derive(Debug, Clone)]
pub struct ArrayConfig {
    /// File name prefix for segments created by this store.
    pub prefix: String,
    /// Soft wall-clock budget for one `get`/`count` scan over the stack.
    pub scan_budget: Duration,
    /// Buffer size for segment writers, in bytes.
    pub write_buffer_size: usize,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        ArrayConfig {
            prefix: "index".to_string(),
            scan_budget: Duration::from_millis(3000),
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// The mounted segment stack of one store.
#[derive(Debug)]
pub struct ReferenceContainerArray<C: ReferenceCodec> {
    codec: C,
    order: SharedKeyOrder,
    term_key_len: usize,
    directory: PathBuf,
    config: ArrayConfig,
    /// Oldest first, sorted by file name.
    segments: RwLock<Vec<Arc<Segment>>>,
    sequence: AtomicU64,
}

impl<C: ReferenceCodec> ReferenceContainerArray<C> {
    /// Open the stack in `directory`, mounting every segment file found
    /// there. Leftover `.part` files from interrupted writes are removed.
    pub fn open(
        directory: &Path,
        codec: C,
        order: SharedKeyOrder,
        term_key_len: usize,
        config: ArrayConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(directory)?;

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(directory)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&config.prefix) {
                continue;
            }
            if name.ends_with(".part") {
                // interrupted write, the final file never appeared
                warn!("removing leftover partial segment {}", path.display());
                std::fs::remove_file(&path)?;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut segments = Vec::with_capacity(paths.len());
        for path in &paths {
            segments.push(Arc::new(Segment::open(path, term_key_len, order.clone())?));
        }
        info!(
            "mounted {} segment files from {}",
            segments.len(),
            directory.display()
        );

        Ok(ReferenceContainerArray {
            codec,
            order,
            term_key_len,
            directory: directory.to_path_buf(),
            config,
            segments: RwLock::new(segments),
            sequence: AtomicU64::new(0),
        })
    }

    /// The directory holding this stack's files.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// A fresh, unique path for the next segment file. File names sort by
    /// creation time, which keeps the mount order meaningful.
    pub fn new_segment_path(&self) -> PathBuf {
        let seq = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
        self.directory.join(format!(
            "{}-{stamp}-{seq:04}.{SEGMENT_EXTENSION}",
            self.config.prefix
        ))
    }

    /// Buffer size segment writers for this stack should use.
    pub fn write_buffer_size(&self) -> usize {
        self.config.write_buffer_size
    }

    /// Mount a finished segment file into the stack.
    pub fn mount(&self, path: &Path) -> Result<()> {
        let segment = Arc::new(Segment::open(path, self.term_key_len, self.order.clone())?);
        let mut segments = self.segments.write();
        segments.push(segment);
        segments.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(())
    }

    /// Number of mounted segments.
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Total size of all mounted files in bytes, holes included.
    pub fn total_file_size(&self) -> u64 {
        self.segments.read().iter().map(|s| s.file_size()).sum()
    }

    fn snapshot(&self) -> Vec<Arc<Segment>> {
        self.segments.read().clone()
    }

    /// Whether any mounted segment holds a record for `term_key`.
    pub fn has(&self, term_key: &[u8]) -> bool {
        self.snapshot().iter().any(|s| s.has(term_key))
    }

    /// Number of references stored for `term_key` across all segments,
    /// computed from record lengths without decoding any payload.
    /// Best effort under the scan budget.
    pub fn count(&self, term_key: &[u8]) -> usize {
        let start = Instant::now();
        let row = self.codec.row_width() as u64;
        let mut total = 0;
        for segment in self.snapshot() {
            if let Some(len) = segment.data_len(term_key) {
                total += (len / row) as usize;
            }
            if start.elapsed() > self.config.scan_budget {
                warn!("count scan exceeded its time budget, result is partial");
                break;
            }
        }
        total
    }

    /// Union of all stored containers for `term_key`, duplicate documents
    /// resolved by recency. Best effort under the scan budget.
    pub fn get(&self, term_key: &[u8]) -> Result<Option<ReferenceContainer<C::Ref>>> {
        let start = Instant::now();
        let mut result: Option<ReferenceContainer<C::Ref>> = None;
        for segment in self.snapshot() {
            if let Some(data) = segment.get(term_key)? {
                let container =
                    ReferenceContainer::from_rows(&self.codec, term_key.to_vec(), &data)?;
                result = Some(match result {
                    Some(acc) => acc.merge(&container),
                    None => container,
                });
            }
            if start.elapsed() > self.config.scan_budget {
                warn!("get scan exceeded its time budget, result is partial");
                break;
            }
        }
        Ok(result)
    }

    /// Delete a term from every segment, leaving holes. Returns the number
    /// of references removed.
    pub fn delete(&self, term_key: &[u8]) -> Result<usize> {
        let row = self.codec.row_width() as u64;
        let mut removed = 0;
        for segment in self.snapshot() {
            if let Some(len) = segment.data_len(term_key) {
                if segment.delete(term_key)? {
                    removed += (len / row) as usize;
                }
            }
        }
        Ok(removed)
    }

    /// Remove the given documents from a term's record in every segment,
    /// shrinking each record in place. Returns the number of references
    /// removed.
    pub fn remove(&self, term_key: &[u8], doc_keys: &DocumentSet) -> Result<usize> {
        if doc_keys.is_empty() {
            return Ok(0);
        }
        let row = self.codec.row_width() as u64;
        let mut removed = 0;
        for segment in self.snapshot() {
            if !segment.has(term_key) {
                continue;
            }
            let codec = self.codec.clone();
            let key = term_key.to_vec();
            let freed = segment.reduce(term_key, |data| {
                let container = ReferenceContainer::<C::Ref>::from_rows(&codec, key, &data)?;
                let mut kept = container.clone();
                kept.remove_entries(doc_keys);
                if kept.len() == container.len() {
                    // nothing removed, keep the record untouched
                    return Ok(Some(data));
                }
                if kept.is_empty() {
                    return Ok(None);
                }
                Ok(Some(kept.to_rows(&codec)?))
            })?;
            removed += (freed / row) as usize;
        }
        Ok(removed)
    }

    /// All term keys present in any segment, sorted by the store's order,
    /// deduplicated.
    pub fn term_keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for segment in self.snapshot() {
            keys.extend(segment.keys());
        }
        keys.sort_by(|a, b| self.order.compare(a, b));
        keys.dedup();
        keys
    }

    /// Unmount the best merge pair: the two segments with a file size
    /// ratio of at most `max_ratio` whose combined size is largest while
    /// staying at or below `max_total`. Both segments are removed from the
    /// stack and handed to the caller for merging.
    pub fn unmount_best_match(
        &self,
        max_ratio: f64,
        max_total: u64,
    ) -> Option<(Arc<Segment>, Arc<Segment>)> {
        let mut segments = self.segments.write();
        if segments.len() < 2 {
            return None;
        }
        let mut best: Option<(usize, usize, u64)> = None;
        for i in 0..segments.len() {
            for j in (i + 1)..segments.len() {
                let a = segments[i].file_size();
                let b = segments[j].file_size();
                let (small, large) = if a < b { (a, b) } else { (b, a) };
                if small == 0 || large as f64 / small as f64 > max_ratio {
                    continue;
                }
                let total = a + b;
                if total > max_total {
                    continue;
                }
                if best.is_none_or(|(_, _, t)| total > t) {
                    best = Some((i, j, total));
                }
            }
        }
        let (i, j) = best.map(|(i, j, _)| (i, j))?;
        let second = segments.remove(j);
        let first = segments.remove(i);
        Some((first, second))
    }

    /// Unmount the two smallest segments whose combined size is at or
    /// below `max_total`.
    pub fn unmount_smallest_pair(&self, max_total: u64) -> Option<(Arc<Segment>, Arc<Segment>)> {
        let mut segments = self.segments.write();
        if segments.len() < 2 {
            return None;
        }
        let mut order: Vec<usize> = (0..segments.len()).collect();
        order.sort_by_key(|&i| segments[i].file_size());
        let (i, j) = (order[0], order[1]);
        if segments[i].file_size() + segments[j].file_size() > max_total {
            return None;
        }
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        let second = segments.remove(j);
        let first = segments.remove(i);
        Some((first, second))
    }

    /// Unmount the oldest segment for a standalone rewrite that drops its
    /// holes. Returns `None` when the stack is empty.
    pub fn unmount_oldest(&self) -> Option<Arc<Segment>> {
        let mut segments = self.segments.write();
        if segments.is_empty() {
            return None;
        }
        Some(segments.remove(0))
    }

    /// Put an unmounted segment back, used when a planned merge is
    /// abandoned before it ran.
    pub fn remount(&self, segment: Arc<Segment>) {
        let mut segments = self.segments.write();
        segments.push(segment);
        segments.sort_by(|a, b| a.path().cmp(b.path()));
    }

    /// Unmount everything and delete the backing files.
    pub fn clear(&self) -> Result<()> {
        let mut segments = self.segments.write();
        for segment in segments.drain(..) {
            let path = segment.path().to_path_buf();
            let segment = Arc::try_unwrap(segment).map_err(|_| {
                RwIndexError::invalid_operation("cannot clear while a segment is in use")
            })?;
            drop(segment);
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::NaturalOrder;
    use crate::reference::{Reference, WordCodec, WordReference};
    use crate::segment::SegmentWriter;
    use tempfile::TempDir;

    const KEY_LEN: usize = 12;

    fn key(s: &str) -> Vec<u8> {
        let mut k = s.as_bytes().to_vec();
        k.resize(KEY_LEN, b'_');
        k
    }

    fn array(dir: &Path) -> ReferenceContainerArray<WordCodec> {
        ReferenceContainerArray::open(
            dir,
            WordCodec::default(),
            NaturalOrder::shared(),
            KEY_LEN,
            ArrayConfig::default(),
        )
        .unwrap()
    }

    fn write_segment(
        array: &ReferenceContainerArray<WordCodec>,
        records: &[(&str, &[(&str, u32, i64)])],
    ) {
        let codec = WordCodec::default();
        let path = array.new_segment_path();
        let mut writer =
            SegmentWriter::create(&path, KEY_LEN, NaturalOrder::shared(), 8192).unwrap();
        // the writer requires ascending keys
        let mut records = records.to_vec();
        records.sort_by_key(|(term, _)| key(term));
        for (term, docs) in records {
            let mut container = ReferenceContainer::new(key(term));
            for (doc, pos, modified) in docs {
                container.add(WordReference::new(key(doc), vec![*pos], *modified).unwrap());
            }
            writer.add(&key(term), &container.to_rows(&codec).unwrap()).unwrap();
        }
        writer.finish().unwrap();
        array.mount(&path).unwrap();
    }

    #[test]
    fn test_get_unions_segments_with_recency() {
        let dir = TempDir::new().unwrap();
        let array = array(dir.path());
        write_segment(&array, &[("term", &[("A", 1, 100), ("B", 1, 100)])]);
        write_segment(&array, &[("term", &[("A", 2, 200), ("C", 1, 100)])]);

        assert_eq!(array.segment_count(), 2);
        assert!(array.has(&key("term")));
        assert_eq!(array.count(&key("term")), 4);

        let c = array.get(&key("term")).unwrap().unwrap();
        assert_eq!(c.len(), 3);
        assert_eq!(c.get_reference(&key("A")).unwrap().last_modified(), 200);
        assert!(array.get(&key("missing")).unwrap().is_none());
    }

    #[test]
    fn test_delete_across_segments() {
        let dir = TempDir::new().unwrap();
        let array = array(dir.path());
        write_segment(&array, &[("term", &[("A", 1, 100)])]);
        write_segment(&array, &[("term", &[("B", 1, 100)]), ("other", &[("A", 1, 100)])]);

        assert_eq!(array.delete(&key("term")).unwrap(), 2);
        assert!(!array.has(&key("term")));
        assert!(array.has(&key("other")));
        assert_eq!(array.delete(&key("term")).unwrap(), 0);
    }

    #[test]
    fn test_remove_documents_reduces_records() {
        let dir = TempDir::new().unwrap();
        let array = array(dir.path());
        write_segment(&array, &[("term", &[("A", 1, 100), ("B", 1, 100)])]);
        write_segment(&array, &[("term", &[("A", 2, 200)])]);

        let mut docs = DocumentSet::default();
        docs.insert(key("A"));
        assert_eq!(array.remove(&key("term"), &docs).unwrap(), 2);

        let c = array.get(&key("term")).unwrap().unwrap();
        assert_eq!(c.len(), 1);
        assert!(c.get_reference(&key("B")).is_some());
    }

    #[test]
    fn test_term_keys_merged_sorted() {
        let dir = TempDir::new().unwrap();
        let array = array(dir.path());
        write_segment(&array, &[("beta", &[("A", 1, 100)]), ("delta", &[("A", 1, 100)])]);
        write_segment(&array, &[("alpha", &[("A", 1, 100)]), ("beta", &[("A", 1, 100)])]);

        assert_eq!(array.term_keys(), vec![key("alpha"), key("beta"), key("delta")]);
    }

    #[test]
    fn test_reopen_mounts_existing_segments() {
        let dir = TempDir::new().unwrap();
        {
            let array = array(dir.path());
            write_segment(&array, &[("term", &[("A", 1, 100)])]);
        }
        let array = array(dir.path());
        assert_eq!(array.segment_count(), 1);
        assert_eq!(array.count(&key("term")), 1);
    }

    #[test]
    fn test_unmount_best_match_respects_ratio_and_total() {
        let dir = TempDir::new().unwrap();
        let array = array(dir.path());
        // one large segment and two small ones of identical size
        write_segment(
            &array,
            &[(
                "big",
                &[
                    ("A", 1, 100),
                    ("B", 1, 100),
                    ("C", 1, 100),
                    ("D", 1, 100),
                    ("E", 1, 100),
                    ("F", 1, 100),
                    ("G", 1, 100),
                    ("H", 1, 100),
                ],
            )],
        );
        write_segment(&array, &[("s1", &[("A", 1, 100)])]);
        write_segment(&array, &[("s2", &[("B", 1, 100)])]);

        let total = array.total_file_size();
        let (a, b) = array.unmount_best_match(2.0, total).unwrap();
        // the large file pairs with nothing at ratio 2.0, the two small
        // files are the only admissible pair
        assert_eq!(a.file_size(), b.file_size());
        assert_eq!(array.segment_count(), 1);

        array.remount(a);
        array.remount(b);
        assert!(array.unmount_best_match(2.0, 1).is_none());
        assert_eq!(array.segment_count(), 3);
    }

    #[test]
    fn test_unmount_smallest_pair_and_oldest() {
        let dir = TempDir::new().unwrap();
        let array = array(dir.path());
        write_segment(&array, &[("a", &[("A", 1, 100), ("B", 1, 100)])]);
        write_segment(&array, &[("b", &[("A", 1, 100)])]);
        write_segment(&array, &[("c", &[("A", 1, 100)])]);

        let (x, y) = array.unmount_smallest_pair(u64::MAX).unwrap();
        assert!(x.has(&key("b")) || x.has(&key("c")));
        assert!(y.has(&key("b")) || y.has(&key("c")));
        assert_eq!(array.segment_count(), 1);

        let oldest = array.unmount_oldest().unwrap();
        assert!(oldest.has(&key("a")));
        assert!(array.unmount_oldest().is_none());
    }

    #[test]
    fn test_clear_removes_files() {
        let dir = TempDir::new().unwrap();
        let array = array(dir.path());
        write_segment(&array, &[("term", &[("A", 1, 100)])]);
        array.clear().unwrap();
        assert_eq!(array.segment_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
