use serde_json::{Map, Value};
use std::sync::Arc;

/// An immutable fact/data snapshot. Refreshers publish a brand new `Arc` on
/// every successful gather; nothing ever mutates a snapshot in place, so
/// handing the same `Arc` to every worker is equivalent to a deep copy
/// without the allocation cost of one.
pub type Snapshot = Arc<Map<String, Value>>;

pub fn empty_snapshot() -> Snapshot {
    Arc::new(Map::new())
}
