//! Persistence layer
//!
//! - `store`: the document store trait and dotted-path merge helpers
//! - `memory`: in-process store
//! - `cache`: in-memory copies of the collections with write-through

pub mod cache;
pub mod memory;
pub mod store;

pub use cache::Cache;
pub use memory::MemoryStore;
pub use store::{collections, doc_ids, DocumentStore, Fields};
