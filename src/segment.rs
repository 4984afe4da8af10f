//! Immutable sorted segment files.
//!
//! A segment is a write-once file holding `(term_key, payload)` records in
//! ascending term-key order. The payload is a flat row export of one
//! container (see [`ReferenceContainer::to_rows`]), readable without any
//! in-memory structures, which keeps segment merges streaming.
//!
//! File layout (big-endian):
//!
//! ```text
//! header:  magic u32 | version u32 | key_len u32 | reserved u32
//! record:  alloc u32 | term_key [key_len] | data_len u32 | crc32 u32
//!          | data [data_len] | pad [alloc - key_len - 8 - data_len]
//! ```
//!
//! `alloc` is the number of bytes the record occupies after its own length
//! field. A record whose term key is all zero bytes is a hole: the record
//! was deleted in place and its bytes stay dead until the segment is merged
//! away. `reduce` shrinks a payload inside its original allocation the same
//! way, so point deletions never rewrite the file.
//!
//! Writers stream to a `.part` file and atomically rename it into place on
//! `finish`; a crash never leaves a half-written segment under a live name.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use log::warn;
use parking_lot::{Mutex, RwLock};

use crate::container::ReferenceContainer;
use crate::error::{Result, RwIndexError};
use crate::order::SharedKeyOrder;
use crate::reference::ReferenceCodec;

const MAGIC: u32 = 0x5257_4953; // "RWIS"
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;
const PART_SUFFIX: &str = "part";

fn is_hole(key: &[u8]) -> bool {
    key.iter().all(|&b| b == 0)
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(PART_SUFFIX);
    target.with_file_name(name)
}

#[derive(Debug, Clone, Copy)]
struct RecordHandle {
    /// Offset of the record's `alloc` field.
    offset: u64,
    alloc: u32,
    data_len: u32,
}

/// A mounted segment file: read access by term key, plus in-place deletion.
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    key_len: usize,
    file_size: u64,
    file: Mutex<File>,
    /// Sorted by the store's term-key order.
    index: RwLock<Vec<(Vec<u8>, RecordHandle)>>,
    order: SharedKeyOrder,
}

impl Segment {
    /// Mount an existing segment file. The whole file is scanned once to
    /// build the in-memory key index; holes are skipped.
    pub fn open(path: &Path, key_len: usize, order: SharedKeyOrder) -> Result<Segment> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();

        let mut reader = BufReader::new(file.try_clone()?);
        let magic = reader.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(RwIndexError::storage(format!(
                "{} is not a segment file",
                path.display()
            )));
        }
        let version = reader.read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(RwIndexError::storage(format!(
                "unsupported segment version {version}"
            )));
        }
        let file_key_len = reader.read_u32::<BigEndian>()? as usize;
        if file_key_len != key_len {
            return Err(RwIndexError::storage(format!(
                "segment {} has key length {file_key_len}, store expects {key_len}",
                path.display()
            )));
        }
        let _reserved = reader.read_u32::<BigEndian>()?;

        let mut index = Vec::new();
        let mut offset = HEADER_LEN;
        let mut key = vec![0u8; key_len];
        while offset < file_size {
            let alloc = reader.read_u32::<BigEndian>()?;
            // an allocation must at least cover its key
            if (alloc as usize) < key_len {
                return Err(RwIndexError::storage(format!(
                    "corrupt record header at offset {offset} in {}",
                    path.display()
                )));
            }
            reader.read_exact(&mut key)?;
            if is_hole(&key) {
                reader.seek_relative((alloc as usize - key_len) as i64)?;
            } else {
                let data_len = reader.read_u32::<BigEndian>()?;
                let _crc = reader.read_u32::<BigEndian>()?;
                if (data_len as usize) + key_len + 8 > alloc as usize {
                    return Err(RwIndexError::storage(format!(
                        "corrupt record header at offset {offset} in {}",
                        path.display()
                    )));
                }
                index.push((
                    key.clone(),
                    RecordHandle {
                        offset,
                        alloc,
                        data_len,
                    },
                ));
                reader.seek_relative((alloc as usize - key_len - 8) as i64)?;
            }
            offset += 4 + alloc as u64;
        }

        index.sort_by(|(a, _), (b, _)| order.compare(a, b));

        Ok(Segment {
            path: path.to_path_buf(),
            key_len,
            file_size,
            file: Mutex::new(file),
            index: RwLock::new(index),
            order,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the backing file in bytes, including holes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Number of live (non-hole) records.
    pub fn entry_count(&self) -> usize {
        self.index.read().len()
    }

    fn find(&self, key: &[u8]) -> Option<RecordHandle> {
        let index = self.index.read();
        index
            .binary_search_by(|(k, _)| self.order.compare(k, key))
            .ok()
            .map(|pos| index[pos].1)
    }

    /// Whether the segment holds a record for `key`.
    pub fn has(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    /// Payload length for `key`, answered from the in-memory index without
    /// touching the disk.
    pub fn data_len(&self, key: &[u8]) -> Option<u64> {
        self.find(key).map(|h| h.data_len as u64)
    }

    /// Read the payload for `key`. The record checksum is validated.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(handle) = self.find(key) else {
            return Ok(None);
        };
        let mut header = vec![0u8; self.key_len + 8];
        let mut data = vec![0u8; handle.data_len as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(handle.offset + 4))?;
            file.read_exact(&mut header)?;
            file.read_exact(&mut data)?;
        }
        let crc = BigEndian::read_u32(&header[self.key_len + 4..]);
        if crc32fast::hash(&data) != crc {
            return Err(RwIndexError::storage(format!(
                "checksum mismatch for record at offset {} in {}",
                handle.offset,
                self.path.display()
            )));
        }
        Ok(Some(data))
    }

    /// Delete the record for `key` in place by zeroing its term key,
    /// leaving a hole until the segment is merged away. Returns whether a
    /// record was deleted.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut index = self.index.write();
        let Ok(pos) = index.binary_search_by(|(k, _)| self.order.compare(k, key)) else {
            return Ok(false);
        };
        let handle = index[pos].1;
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(handle.offset + 4))?;
            file.write_all(&vec![0u8; self.key_len])?;
            file.flush()?;
        }
        index.remove(pos);
        Ok(true)
    }

    /// Rewrite the payload for `key` in place. The rewrite function
    /// receives the current payload; returning `None` (or an empty payload)
    /// deletes the record. The new payload must not be larger than the old
    /// one. Returns the number of payload bytes freed.
    pub fn reduce<F>(&self, key: &[u8], rewrite: F) -> Result<u64>
    where
        F: FnOnce(Vec<u8>) -> Result<Option<Vec<u8>>>,
    {
        let Some(old) = self.get(key)? else {
            return Ok(0);
        };
        let old_len = old.len() as u64;
        let new = rewrite(old)?;
        let new = match new {
            Some(data) if !data.is_empty() => data,
            _ => {
                self.delete(key)?;
                return Ok(old_len);
            }
        };
        if new.len() as u64 > old_len {
            return Err(RwIndexError::invalid_operation(
                "reduce may only shrink a record payload",
            ));
        }

        let mut index = self.index.write();
        let Ok(pos) = index.binary_search_by(|(k, _)| self.order.compare(k, key)) else {
            return Ok(0);
        };
        let handle = &mut index[pos].1;
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(handle.offset + 4 + self.key_len as u64))?;
            file.write_u32::<BigEndian>(new.len() as u32)?;
            file.write_u32::<BigEndian>(crc32fast::hash(&new))?;
            file.write_all(&new)?;
            file.flush()?;
        }
        handle.data_len = new.len() as u32;
        Ok(old_len - new.len() as u64)
    }

    /// Snapshot of all live term keys, in the store's term-key order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.index.read().iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Streaming writer for a new segment file. Records must be added in
/// ascending term-key order; the file appears under its final name only
/// after a successful `finish`.
pub struct SegmentWriter {
    target: PathBuf,
    part: PathBuf,
    writer: BufWriter<File>,
    key_len: usize,
    order: SharedKeyOrder,
    last_key: Option<Vec<u8>>,
    records: usize,
    finished: bool,
}

impl SegmentWriter {
    /// Start writing a segment that will be renamed to `target` on finish.
    pub fn create(
        target: &Path,
        key_len: usize,
        order: SharedKeyOrder,
        buffer_size: usize,
    ) -> Result<SegmentWriter> {
        let part = part_path(target);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part)?;
        let mut writer = BufWriter::with_capacity(buffer_size.max(4096), file);
        writer.write_u32::<BigEndian>(MAGIC)?;
        writer.write_u32::<BigEndian>(VERSION)?;
        writer.write_u32::<BigEndian>(key_len as u32)?;
        writer.write_u32::<BigEndian>(0)?;
        Ok(SegmentWriter {
            target: target.to_path_buf(),
            part,
            writer,
            key_len,
            order,
            last_key: None,
            records: 0,
            finished: false,
        })
    }

    /// Append one record. Keys must arrive strictly ascending in the
    /// store's term-key order; empty payloads are skipped.
    pub fn add(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        if key.len() != self.key_len {
            return Err(RwIndexError::index(format!(
                "term key has {} bytes, segment expects {}",
                key.len(),
                self.key_len
            )));
        }
        if is_hole(key) {
            return Err(RwIndexError::index("the all-zero term key is reserved"));
        }
        if data.is_empty() {
            return Ok(());
        }
        if let Some(last) = &self.last_key {
            if self.order.compare(key, last) != std::cmp::Ordering::Greater {
                return Err(RwIndexError::index(
                    "segment records must be added in ascending term-key order",
                ));
            }
        }
        let alloc = (self.key_len + 8 + data.len()) as u32;
        self.writer.write_u32::<BigEndian>(alloc)?;
        self.writer.write_all(key)?;
        self.writer.write_u32::<BigEndian>(data.len() as u32)?;
        self.writer.write_u32::<BigEndian>(crc32fast::hash(data))?;
        self.writer.write_all(data)?;
        self.last_key = Some(key.to_vec());
        self.records += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Flush, sync and atomically rename the `.part` file to its final
    /// name. Returns the final path.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        std::fs::rename(&self.part, &self.target)?;
        self.finished = true;
        Ok(self.target.clone())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        // an aborted writer must not leave a stray .part file behind
        if !self.finished {
            let _ = std::fs::remove_file(&self.part);
        }
    }
}

/// Sequential record reader used by streaming merges. Yields live records
/// in file order (which is term-key order), skipping holes.
pub struct SegmentCursor {
    reader: BufReader<File>,
    key_len: usize,
    offset: u64,
    file_size: u64,
}

impl SegmentCursor {
    /// Open a cursor over a segment file.
    pub fn open(path: &Path, key_len: usize) -> Result<SegmentCursor> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(HEADER_LEN))?;
        Ok(SegmentCursor {
            reader,
            key_len,
            offset: HEADER_LEN,
            file_size,
        })
    }

    /// Read the next live record, or `None` at end of file.
    pub fn next_record(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        while self.offset < self.file_size {
            let alloc = self.reader.read_u32::<BigEndian>()?;
            if (alloc as usize) < self.key_len {
                return Err(RwIndexError::storage(format!(
                    "corrupt record header at offset {}",
                    self.offset
                )));
            }
            let mut key = vec![0u8; self.key_len];
            self.reader.read_exact(&mut key)?;
            self.offset += 4 + alloc as u64;
            if is_hole(&key) {
                self.reader
                    .seek_relative((alloc as usize - self.key_len) as i64)?;
                continue;
            }
            let data_len = self.reader.read_u32::<BigEndian>()? as usize;
            let crc = self.reader.read_u32::<BigEndian>()?;
            if self.key_len + 8 + data_len > alloc as usize {
                return Err(RwIndexError::storage(format!(
                    "corrupt record header at offset {}",
                    self.offset
                )));
            }
            let mut data = vec![0u8; data_len];
            self.reader.read_exact(&mut data)?;
            let pad = alloc as usize - self.key_len - 8 - data_len;
            if pad > 0 {
                self.reader.seek_relative(pad as i64)?;
            }
            if crc32fast::hash(&data) != crc {
                return Err(RwIndexError::storage(format!(
                    "checksum mismatch while scanning segment record for key {key:02x?}"
                )));
            }
            return Ok(Some((key, data)));
        }
        Ok(None)
    }
}

/// Stream-merge two segment files into `target`. Records present in both
/// inputs are decoded, merged with recency resolution and re-encoded;
/// everything else is copied as-is. Holes are left behind. The inputs are
/// not modified; the target only appears once fully written.
pub fn merge_segment_files<C>(
    codec: &C,
    order: &SharedKeyOrder,
    a: &Path,
    b: &Path,
    target: &Path,
    key_len: usize,
    buffer_size: usize,
) -> Result<PathBuf>
where
    C: ReferenceCodec,
{
    let mut cursor_a = SegmentCursor::open(a, key_len)?;
    let mut cursor_b = SegmentCursor::open(b, key_len)?;
    let mut writer = SegmentWriter::create(target, key_len, order.clone(), buffer_size)?;

    let mut ra = cursor_a.next_record()?;
    let mut rb = cursor_b.next_record()?;
    loop {
        match (&ra, &rb) {
            (Some((ka, da)), Some((kb, db))) => match order.compare(ka, kb) {
                std::cmp::Ordering::Less => {
                    writer.add(ka, da)?;
                    ra = cursor_a.next_record()?;
                }
                std::cmp::Ordering::Greater => {
                    writer.add(kb, db)?;
                    rb = cursor_b.next_record()?;
                }
                std::cmp::Ordering::Equal => {
                    let ca = ReferenceContainer::<C::Ref>::from_rows(codec, ka.clone(), da)?;
                    let cb = ReferenceContainer::<C::Ref>::from_rows(codec, kb.clone(), db)?;
                    let merged = ca.merge(&cb);
                    writer.add(ka, &merged.to_rows(codec)?)?;
                    ra = cursor_a.next_record()?;
                    rb = cursor_b.next_record()?;
                }
            },
            (Some((ka, da)), None) => {
                writer.add(ka, da)?;
                ra = cursor_a.next_record()?;
            }
            (None, Some((kb, db))) => {
                writer.add(kb, db)?;
                rb = cursor_b.next_record()?;
            }
            (None, None) => break,
        }
    }
    writer.finish()
}

/// Rewrite a single segment file into `target`, dropping holes and
/// reclaiming padding left by in-place reductions.
pub fn rewrite_segment_file(
    order: &SharedKeyOrder,
    source: &Path,
    target: &Path,
    key_len: usize,
    buffer_size: usize,
) -> Result<PathBuf> {
    let mut cursor = SegmentCursor::open(source, key_len)?;
    let mut writer = SegmentWriter::create(target, key_len, order.clone(), buffer_size)?;
    while let Some((key, data)) = cursor.next_record()? {
        writer.add(&key, &data)?;
    }
    if writer.records() == 0 {
        warn!(
            "rewrite of {} produced an empty segment",
            source.display()
        );
    }
    writer.finish()
}
