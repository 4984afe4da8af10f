//! Pluggable byte-key ordering.
//!
//! All term keys of one store are compared with a single [`KeyOrder`]. The
//! RAM cache, every segment file and every merge use the same order object;
//! merge correctness depends on the order being identical everywhere, so the
//! order is injected once at store construction and shared via `Arc`.

use std::cmp::Ordering;
use std::sync::Arc;

/// A total order over fixed-width byte keys.
pub trait KeyOrder: Send + Sync + std::fmt::Debug {
    /// Compare two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// A stable identifier for this order. Two stores (or a store and its
    /// segment files) can only be merged when their signatures are equal.
    fn signature(&self) -> &'static str;
}

/// Shared handle to a key order.
pub type SharedKeyOrder = Arc<dyn KeyOrder>;

/// Plain lexicographic byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl KeyOrder for NaturalOrder {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn signature(&self) -> &'static str {
        "nb"
    }
}

impl NaturalOrder {
    /// Create a shared handle to the natural order.
    pub fn shared() -> SharedKeyOrder {
        Arc::new(NaturalOrder)
    }
}
