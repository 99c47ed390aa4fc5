//! soma-state: embedded state store for Soma.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for the inventory tree (repositories, buckets, groups, clusters,
//! nodes), the job ledger, checks, check instances and the versioned
//! deployment payloads the lifecycle engine drives.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns
//! and implement [`Record`], which names their table and key. Multi-row
//! state changes run inside [`StateStore::write`] so they either commit as
//! a whole or not at all.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod digest;
pub mod error;
pub mod status;
pub mod store;
pub mod tables;
pub mod types;

pub use digest::json_digest;
pub use error::{StateError, StateResult};
pub use status::{DeploymentStatus, DeploymentTask, FeedbackResult};
pub use store::{StateStore, WriteTxn};
pub use types::*;
