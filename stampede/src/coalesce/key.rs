//! Keys accepted by the coalescer.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// A key grouping requests that should share one computation.
///
/// Keys are opaque to the coalescer apart from [`is_blank`](Self::is_blank),
/// which rejects keys that cannot identify any work. Implement it for custom
/// key types (for example a composite `(tenant, id)` struct) when some values
/// are meaningless; the default accepts every value.
pub trait CoalesceKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {
    /// Returns true if this key is empty and must be rejected.
    fn is_blank(&self) -> bool {
        false
    }
}

impl CoalesceKey for String {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

impl CoalesceKey for &'static str {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

impl CoalesceKey for Arc<str> {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

impl CoalesceKey for u64 {}
