//! Elide: transactional lock elision and a mostly wait-free concurrent
//! hash map built on it.
//!
//! The crate has two layers. [`transact`] brackets a critical section that
//! runs as a hardware transaction when the CPU supports it and under its
//! [`SpinLock`] when it does not, with the two kinds of entry composing
//! correctly. [`HashMap`] layers a bucketed hash table on top: at most one
//! modifier per bucket, fully concurrent readers, and non-blocking
//! operations across distinct buckets even under contention.
//!
//! # Key Features
//!
//! - **Opportunistic HTM**: critical sections elide their lock on TSX
//!   hardware and commit atomically; aborts fall back to the lock, so
//!   progress never depends on the transaction succeeding
//! - **Per-Bucket Isolation**: bucket records are cache-line padded and
//!   independently locked; disjoint-bucket workloads scale with cores
//! - **Pessimism Where It Belongs**: allocation and destruction are kept
//!   out of the speculative path by construction
//!
//! # Example
//!
//! ```rust
//! use elide::HashMap;
//!
//! let map = HashMap::new();
//!
//! let (_, inserted) = map.insert("answer", 42);
//! assert!(inserted);
//!
//! // Duplicate keys keep the first value.
//! let (_, inserted) = map.insert("answer", 0);
//! assert!(!inserted);
//! assert_eq!(map.get(&"answer"), Some(42));
//!
//! if let Some(cursor) = map.find(&"answer") {
//!     map.erase(cursor);
//! }
//! assert_eq!(map.len(), 0);
//! ```

#![warn(missing_docs)]

mod hashmap;
mod htm;
mod spinlock;
mod transact;
mod utils;

pub use hashmap::{Cursor, HashMap, Iter, ReserveError};
pub use htm::{htm_available, htm_disabled, set_htm_disabled};
pub use spinlock::{SpinGuard, SpinLock};
pub use transact::{transact, transact_if, Entered, Fallback};
