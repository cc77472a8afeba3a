//! In-memory rule store

use crate::{RuleStore, StoreError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use udpfwd_proto::RelayRule;

/// Keeps the last stored snapshot in memory
///
/// Writes can be made to fail with [`MemoryRuleStore::set_fail_writes`].
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: Mutex<Vec<RelayRule>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<RelayRule>) -> Self {
        Self {
            rules: Mutex::new(rules),
            ..Self::default()
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Last stored snapshot
    pub fn snapshot(&self) -> Vec<RelayRule> {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn store(&self, rules: &[RelayRule]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        *self.rules.lock().unwrap_or_else(PoisonError::into_inner) = rules.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<RelayRule>, StoreError> {
        Ok(self.snapshot())
    }
}
