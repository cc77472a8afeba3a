//! Relay registry
//!
//! Owns every running [`UdpRelay`], keyed by rule identity, and keeps at most
//! one relay per frontend port. Each mutation holds the write lock for its
//! whole check-and-mutate sequence, and the rule list is persisted before the
//! lock is released so the store always matches the in-memory state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use udpfwd_proto::RelayRule;
use udpfwd_relay::{RelayConfig, RelayError, Resolver, UdpRelay};
use udpfwd_store::{RuleStore, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("port {port} already occupied")]
    PortConflict { port: u16 },

    #[error("failed to create relay: {0}")]
    Create(#[source] RelayError),

    #[error("failed to update records: {0}")]
    Persist(#[source] StoreError),

    #[error("relay {0} does not exist")]
    NotFound(String),
}

#[derive(Default)]
struct RegistryState {
    /// rule identity -> relay
    relays: HashMap<String, UdpRelay>,
    occupied_ports: HashSet<u16>,
}

impl RegistryState {
    fn insert(&mut self, identity: String, relay: UdpRelay) {
        self.occupied_ports.insert(relay.rule().port);
        self.relays.insert(identity, relay);
    }

    fn remove(&mut self, identity: &str) -> Option<UdpRelay> {
        let relay = self.relays.remove(identity)?;
        self.occupied_ports.remove(&relay.rule().port);
        Some(relay)
    }

    fn rules(&self) -> Vec<RelayRule> {
        let mut rules: Vec<RelayRule> = self
            .relays
            .values()
            .map(|relay| relay.rule().clone())
            .collect();
        rules.sort_by_key(|rule| rule.port);
        rules
    }
}

/// Set of active relays with persisted state
pub struct RelayRegistry {
    state: RwLock<RegistryState>,
    store: Arc<dyn RuleStore>,
    resolver: Arc<dyn Resolver>,
    relay_config: RelayConfig,
}

impl RelayRegistry {
    pub fn new(
        store: Arc<dyn RuleStore>,
        resolver: Arc<dyn Resolver>,
        relay_config: RelayConfig,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            store,
            resolver,
            relay_config,
        }
    }

    /// Register and start a relay for `rule`.
    ///
    /// Re-adding an identical rule succeeds without creating anything.
    pub async fn add(&self, rule: RelayRule) -> Result<bool, RegistryError> {
        let identity = rule.identity();
        let mut state = self.state.write().await;

        if state.occupied_ports.contains(&rule.port) {
            if state.relays.contains_key(&identity) {
                debug!("Relay {} already active", identity);
                return Ok(true);
            }
            return Err(RegistryError::PortConflict { port: rule.port });
        }

        let relay = UdpRelay::bind(rule, self.relay_config.clone(), self.resolver.clone())
            .await
            .map_err(RegistryError::Create)?;
        state.insert(identity.clone(), relay);

        if let Err(e) = self.store.store(&state.rules()).await {
            warn!("Rolling back relay {}: {}", identity, e);
            if let Some(relay) = state.remove(&identity) {
                relay.close().await;
            }
            return Err(RegistryError::Persist(e));
        }

        if let Some(relay) = state.relays.get(&identity) {
            relay.start();
        }
        info!("Relay {} added", identity);

        Ok(true)
    }

    /// Stop and unregister the relay for `rule`.
    ///
    /// If persisting fails the relay stays removed.
    pub async fn remove(&self, rule: &RelayRule) -> Result<bool, RegistryError> {
        let identity = rule.identity();
        let mut state = self.state.write().await;

        let relay = state
            .remove(&identity)
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;
        close_contained(&identity, relay).await;

        self.store
            .store(&state.rules())
            .await
            .map_err(RegistryError::Persist)?;
        info!("Relay {} removed", identity);

        Ok(true)
    }

    /// Re-add previously persisted rules, logging the ones that fail.
    ///
    /// Returns how many rules are active afterwards.
    pub async fn restore(&self, rules: Vec<RelayRule>) -> usize {
        for rule in rules {
            let identity = rule.identity();
            if let Err(e) = self.add(rule).await {
                error!("Failed to restore relay {}: {}", identity, e);
            }
        }
        self.len().await
    }

    pub async fn exists(&self, rule: &RelayRule) -> bool {
        self.state.read().await.relays.contains_key(&rule.identity())
    }

    pub async fn is_port_occupied(&self, port: u16) -> bool {
        self.state.read().await.occupied_ports.contains(&port)
    }

    /// Identities of all registered relays, in no particular order
    pub async fn list(&self) -> Vec<String> {
        self.state.read().await.relays.keys().cloned().collect()
    }

    /// Registered rules, sorted by frontend port
    pub async fn rules(&self) -> Vec<RelayRule> {
        self.state.read().await.rules()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.relays.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every relay. Used at shutdown; nothing is persisted.
    pub async fn close(&self) {
        let state = self.state.write().await;
        for relay in state.relays.values() {
            relay.close().await;
        }
        info!("Closed {} relays", state.relays.len());
    }
}

/// Close `relay` on its own task so a failure during teardown stays local.
async fn close_contained(identity: &str, relay: UdpRelay) {
    let teardown = tokio::spawn(async move { relay.close().await });
    if let Err(e) = teardown.await {
        error!("Teardown of relay {} failed: {}", identity, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use udpfwd_relay::SystemResolver;
    use udpfwd_store::MemoryRuleStore;

    fn test_registry(store: Arc<MemoryRuleStore>) -> RelayRegistry {
        let config = RelayConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..RelayConfig::default()
        };
        RelayRegistry::new(store, Arc::new(SystemResolver), config)
    }

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_state_keeps_ports_in_sync() {
        let store = Arc::new(MemoryRuleStore::new());
        let registry = test_registry(store);
        let port = free_port();
        let rule = RelayRule::new(port, "svc", 53);

        registry.add(rule.clone()).await.unwrap();
        assert!(registry.is_port_occupied(port).await);
        assert_eq!(registry.list().await, vec![rule.identity()]);

        registry.remove(&rule).await.unwrap();
        assert!(!registry.is_port_occupied(port).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_rules_sorted_by_port() {
        let store = Arc::new(MemoryRuleStore::new());
        let registry = test_registry(store.clone());
        let mut ports = vec![free_port(), free_port(), free_port()];
        ports.sort_unstable();
        ports.dedup();

        for port in ports.iter().rev() {
            registry.add(RelayRule::new(*port, "svc", 1)).await.unwrap();
        }

        let stored: Vec<u16> = store.snapshot().iter().map(|rule| rule.port).collect();
        assert_eq!(stored, ports);
        assert_eq!(registry.rules().await, store.snapshot());

        registry.close().await;
    }
}
