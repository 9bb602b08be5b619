//! Persistence: repository backends for world state, snapshots and summaries.
//!
//! # Invariants
//! - Snapshot and summary records are append-only and never rewritten.
//! - Every file record is hash-chained and verifiable.
//! - A store with an unknown schema version is never opened.

pub mod memory;
pub mod store;

pub use memory::InMemoryRepository;
pub use store::{FileRepository, StoreError};
