//! Lock-free concurrent hash map using the Harris/Michael algorithm with
//! karst memory reclamation.
//!
//! A fixed number of buckets, each an ordered lock-free linked list. No
//! resizing, no locks anywhere: inserts, lookups, erases and iteration are
//! all lock-free, and erased nodes are handed to a pluggable reclamation
//! scheme instead of being freed under readers.
//!
//! Less cache-friendly than open-addressing maps, but fully generic over
//! key and value types and honest about progress: every operation
//! completes in a bounded number of its own steps plus interference.
//!
//! # Example
//!
//! ```rust
//! use karst::Hazard;
//! use karst_map::HashMap;
//!
//! let map: HashMap<u64, String, Hazard, 64> = HashMap::new();
//! assert!(map.insert(1, "one".into()));
//! assert!(!map.insert(1, "uno".into())); // never overwrites
//! assert!(map.contains(&1));
//!
//! let found = map.find(&1);
//! assert_eq!(found.value().map(String::as_str), Some("one"));
//! drop(found);
//!
//! assert!(map.remove(&1));
//! assert!(!map.contains(&1));
//! ```

#![warn(missing_docs)]

mod map;

pub use map::{Cursor, HashMap, Iter};
