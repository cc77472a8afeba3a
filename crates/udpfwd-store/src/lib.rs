//! Relay rule persistence
//!
//! The registry hands the full rule list to a [`RuleStore`] after every
//! mutation; the daemon reloads it on startup.

mod file;
mod memory;

pub use file::{decode_records, encode_records, FileRuleStore};
pub use memory::MemoryRuleStore;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use udpfwd_proto::RelayRule;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access records file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Record store unavailable: {0}")]
    Unavailable(String),
}

/// Persisted snapshot of the active relay rules
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Replace the stored rule list with `rules`.
    async fn store(&self, rules: &[RelayRule]) -> Result<(), StoreError>;

    /// Load the stored rule list. A store that was never written is empty.
    async fn load(&self) -> Result<Vec<RelayRule>, StoreError>;
}
