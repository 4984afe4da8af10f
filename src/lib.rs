//! # rwindex
//!
//! A log-structured reverse word index (postings) storage engine.
//!
//! ## Features
//!
//! - RAM write buffer with background dumps to immutable segment files
//! - Streaming segment merges with recency resolution per document
//! - Cost-based conjunction and exclusion over postings lists
//! - Proximity joins over term positions
//! - Pluggable term-key ordering and reference row codecs
//!
//! ## Example
//!
//! ```no_run
//! use rwindex::cell::{IndexCell, IndexCellConfig};
//! use rwindex::order::NaturalOrder;
//! use rwindex::reference::{WordCodec, WordReference};
//!
//! # fn main() -> rwindex::error::Result<()> {
//! let cell = IndexCell::open(
//!     std::path::Path::new("/tmp/rwindex"),
//!     WordCodec::default(),
//!     NaturalOrder::shared(),
//!     IndexCellConfig::default(),
//! )?;
//!
//! let term = b"rust________".to_vec();
//! let doc = b"doc-00000001".to_vec();
//! cell.add_reference(&term, WordReference::new(doc, vec![3, 7], 1_700_000_000_000)?)?;
//!
//! let container = cell.get(&term)?.unwrap();
//! assert_eq!(container.len(), 1);
//! cell.close()?;
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod cache;
pub mod cell;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod order;
pub mod reference;
pub mod segment;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
