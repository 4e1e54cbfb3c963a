//! # Stratum State
//!
//! Per-key state persistence. Every backend honours the same contract:
//! `get`, `set` (atomic per key), `delete`, `list(prefix)` and
//! `count(prefix)`. No cross-key transactions are offered.

pub mod fs;
pub mod sqlite;
pub mod store;

pub use fs::FileSystemStateStore;
pub use sqlite::SqliteStateStore;
pub use store::{InMemoryStateStore, StateEntry, StateStore};
