//! Postings references and their binary row codec.
//!
//! A [`Reference`] is one posting: the occurrence record of a term inside a
//! single document (document key, term positions, last-modified timestamp).
//! The storage layers never depend on a concrete reference layout; they are
//! generic over the [`Reference`] trait plus an injected [`ReferenceCodec`]
//! that encodes a reference to a fixed-width binary row and back.
//!
//! Fixed-width rows matter: a serialized container is a flat sequence of
//! rows, so the number of references in a segment payload is
//! `payload_len / row_width` and can be computed without decoding anything.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Result, RwIndexError};

/// One posting: a document's occurrence record for a term.
pub trait Reference: Clone + Send + Sync + std::fmt::Debug {
    /// The fixed-width document key.
    fn doc_key(&self) -> &[u8];

    /// Last-modified timestamp of the document (milliseconds since epoch).
    fn last_modified(&self) -> i64;

    /// Term positions within the document, ascending. Never empty for a
    /// stored reference.
    fn positions(&self) -> &[u32];

    /// Sum of gaps between consecutive positions; 0 for a single position.
    fn distance(&self) -> u64 {
        let p = self.positions();
        p.windows(2).map(|w| w[1].abs_diff(w[0]) as u64).sum()
    }

    /// Combine another reference for the same document into this one:
    /// position lists are merged (kept sorted) and the more recent
    /// timestamp wins.
    fn join(&mut self, other: &Self);

    /// Recency comparison used by put-recent semantics. Ties are not older,
    /// so on a tie the existing entry is kept.
    fn is_older(&self, other: &Self) -> bool {
        self.last_modified() < other.last_modified()
    }
}

/// Encodes and decodes a [`Reference`] to and from a fixed-width binary row.
///
/// The codec decouples containers and segment files from a concrete
/// reference layout. All rows produced by one codec instance have the same
/// width, and the document key is the row prefix.
pub trait ReferenceCodec: Clone + Send + Sync + 'static {
    /// The reference type this codec handles.
    type Ref: Reference;

    /// Fixed width of a document key, in bytes.
    fn doc_key_len(&self) -> usize;

    /// Fixed width of one encoded row, in bytes.
    fn row_width(&self) -> usize;

    /// Append the encoded row for `reference` to `out`.
    fn encode(&self, reference: &Self::Ref, out: &mut Vec<u8>) -> Result<()>;

    /// Decode one row. `row` must be exactly `row_width()` bytes.
    fn decode(&self, row: &[u8]) -> Result<Self::Ref>;
}

/// The standard word reference: document key, sorted term positions and a
/// last-modified timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordReference {
    doc_key: Vec<u8>,
    last_modified: i64,
    positions: Vec<u32>,
}

impl WordReference {
    /// Create a new word reference. `positions` must be non-empty; they are
    /// sorted on construction.
    pub fn new(doc_key: Vec<u8>, mut positions: Vec<u32>, last_modified: i64) -> Result<Self> {
        if positions.is_empty() {
            return Err(RwIndexError::index(
                "a stored reference must have at least one position",
            ));
        }
        positions.sort_unstable();
        Ok(WordReference {
            doc_key,
            last_modified,
            positions,
        })
    }
}

impl Reference for WordReference {
    fn doc_key(&self) -> &[u8] {
        &self.doc_key
    }

    fn last_modified(&self) -> i64 {
        self.last_modified
    }

    fn positions(&self) -> &[u32] {
        &self.positions
    }

    fn join(&mut self, other: &Self) {
        self.positions.extend_from_slice(&other.positions);
        self.positions.sort_unstable();
        self.positions.dedup();
        self.last_modified = self.last_modified.max(other.last_modified);
    }
}

/// Fixed-width row codec for [`WordReference`].
///
/// Row layout (big-endian):
/// `doc_key | last_modified: i64 | position_count: u16 | positions: u32 * max_positions`.
/// Positions beyond `max_positions` are dropped on encode; the retained
/// prefix keeps the smallest positions, which preserves proximity
/// information for short position lists.
#[derive(Debug, Clone)]
pub struct WordCodec {
    doc_key_len: usize,
    max_positions: usize,
}

impl WordCodec {
    /// Create a codec for document keys of `doc_key_len` bytes, storing at
    /// most `max_positions` positions per row.
    pub fn new(doc_key_len: usize, max_positions: usize) -> Self {
        assert!(doc_key_len > 0);
        assert!(max_positions > 0 && max_positions <= u16::MAX as usize);
        WordCodec {
            doc_key_len,
            max_positions,
        }
    }
}

impl Default for WordCodec {
    fn default() -> Self {
        // 12-byte keys, up to 8 positions per row
        WordCodec::new(12, 8)
    }
}

impl ReferenceCodec for WordCodec {
    type Ref = WordReference;

    fn doc_key_len(&self) -> usize {
        self.doc_key_len
    }

    fn row_width(&self) -> usize {
        self.doc_key_len + 8 + 2 + 4 * self.max_positions
    }

    fn encode(&self, reference: &WordReference, out: &mut Vec<u8>) -> Result<()> {
        if reference.doc_key.len() != self.doc_key_len {
            return Err(RwIndexError::serialization(format!(
                "document key has {} bytes, codec expects {}",
                reference.doc_key.len(),
                self.doc_key_len
            )));
        }
        out.extend_from_slice(&reference.doc_key);

        let mut buf = [0u8; 8];
        BigEndian::write_i64(&mut buf, reference.last_modified);
        out.extend_from_slice(&buf);

        let count = reference.positions.len().min(self.max_positions);
        BigEndian::write_u16(&mut buf[..2], count as u16);
        out.extend_from_slice(&buf[..2]);

        for &pos in reference.positions.iter().take(self.max_positions) {
            BigEndian::write_u32(&mut buf[..4], pos);
            out.extend_from_slice(&buf[..4]);
        }
        // pad unused position slots so every row has the same width
        for _ in count..self.max_positions {
            out.extend_from_slice(&[0u8; 4]);
        }
        Ok(())
    }

    fn decode(&self, row: &[u8]) -> Result<WordReference> {
        if row.len() != self.row_width() {
            return Err(RwIndexError::serialization(format!(
                "row has {} bytes, codec expects {}",
                row.len(),
                self.row_width()
            )));
        }
        let doc_key = row[..self.doc_key_len].to_vec();
        let mut offset = self.doc_key_len;

        let last_modified = BigEndian::read_i64(&row[offset..offset + 8]);
        offset += 8;

        let count = BigEndian::read_u16(&row[offset..offset + 2]) as usize;
        offset += 2;
        if count == 0 || count > self.max_positions {
            return Err(RwIndexError::serialization(format!(
                "row carries invalid position count {count}"
            )));
        }

        let mut positions = Vec::with_capacity(count);
        for i in 0..count {
            positions.push(BigEndian::read_u32(&row[offset + 4 * i..offset + 4 * i + 4]));
        }

        WordReference::new(doc_key, positions, last_modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Vec<u8> {
        let mut k = s.as_bytes().to_vec();
        k.resize(12, b'_');
        k
    }

    #[test]
    fn test_reference_requires_positions() {
        assert!(WordReference::new(key("A"), vec![], 100).is_err());
        assert!(WordReference::new(key("A"), vec![1], 100).is_ok());
    }

    #[test]
    fn test_distance() {
        let r = WordReference::new(key("A"), vec![10], 0).unwrap();
        assert_eq!(r.distance(), 0);

        let r = WordReference::new(key("A"), vec![10, 14, 20], 0).unwrap();
        assert_eq!(r.distance(), 10);

        // positions are sorted on construction
        let r = WordReference::new(key("A"), vec![20, 10], 0).unwrap();
        assert_eq!(r.positions(), &[10, 20]);
        assert_eq!(r.distance(), 10);
    }

    #[test]
    fn test_join_merges_positions_and_recency() {
        let mut a = WordReference::new(key("A"), vec![10], 100).unwrap();
        let b = WordReference::new(key("A"), vec![12], 200).unwrap();
        a.join(&b);
        assert_eq!(a.positions(), &[10, 12]);
        assert_eq!(a.last_modified(), 200);
        assert_eq!(a.distance(), 2);
    }

    #[test]
    fn test_is_older() {
        let a = WordReference::new(key("A"), vec![1], 100).unwrap();
        let b = WordReference::new(key("A"), vec![1], 200).unwrap();
        assert!(a.is_older(&b));
        assert!(!b.is_older(&a));
        // a tie keeps the existing entry
        assert!(!a.is_older(&a));
    }

    #[test]
    fn test_codec_round_trip() {
        let codec = WordCodec::default();
        let r = WordReference::new(key("doc1"), vec![3, 9, 27], 1234567).unwrap();

        let mut row = Vec::new();
        codec.encode(&r, &mut row).unwrap();
        assert_eq!(row.len(), codec.row_width());

        let decoded = codec.decode(&row).unwrap();
        assert_eq!(decoded, r);
    }

    #[test]
    fn test_codec_caps_positions() {
        let codec = WordCodec::new(12, 2);
        let r = WordReference::new(key("doc1"), vec![1, 2, 3, 4], 0).unwrap();

        let mut row = Vec::new();
        codec.encode(&r, &mut row).unwrap();
        let decoded = codec.decode(&row).unwrap();
        assert_eq!(decoded.positions(), &[1, 2]);
    }

    #[test]
    fn test_codec_rejects_wrong_key_width() {
        let codec = WordCodec::default();
        let r = WordReference::new(b"short".to_vec(), vec![1], 0).unwrap();
        let mut row = Vec::new();
        assert!(codec.encode(&r, &mut row).is_err());
    }

    #[test]
    fn test_codec_rejects_wrong_row_width() {
        let codec = WordCodec::default();
        assert!(codec.decode(&[0u8; 10]).is_err());
    }
}
