//! Test doubles for the store contracts.
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! pruner = { path = "../pruner", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use pruner::testing::{MemoryStore, MemoryStoreConfig, Node};
//!
//! let store = MemoryStore::from_json(
//!     serde_json::json!({"users": {"alice": 1, "bob": 2}}),
//!     MemoryStoreConfig::default().with_write_size_limit(64),
//! );
//! ```

mod memory;

pub use memory::{MemoryStore, MemoryStoreConfig, Node, StoreCall};
pub use crate::store::MockDeleteTransport;
