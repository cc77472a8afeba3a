//! Connection tracking for UDP flows
//!
//! Maps a client address to the backend socket dialed for it. Every entry
//! carries a flow id so that a reply task only ever removes its own entry.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::UdpSocket;
use tracing::trace;

/// Client identity used as the connection-tracking key
///
/// The IP is stored as two 64-bit halves of its IPv6 form. IPv4 addresses use
/// the IPv4-mapped layout (`::ffff:a.b.c.d`) and are tagged with their family,
/// so keys differ whenever the address, its family or the port differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    ip_high: u64,
    ip_low: u64,
    port: u16,
    ipv4: bool,
}

impl FlowKey {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for FlowKey {
    fn from(addr: SocketAddr) -> Self {
        let (v6, ipv4) = match addr.ip() {
            IpAddr::V4(v4) => (v4.to_ipv6_mapped(), true),
            IpAddr::V6(v6) => (v6, false),
        };
        let bits = u128::from(v6);
        Self {
            ip_high: (bits >> 64) as u64,
            ip_low: bits as u64,
            port: addr.port(),
            ipv4,
        }
    }
}

struct FlowEntry {
    id: u64,
    backend: Arc<UdpSocket>,
}

/// Outcome of [`ConnTrack::insert`]
pub(crate) enum Insert {
    /// The socket was stored under a fresh flow id
    Inserted(u64),
    /// Another socket was already tracked for the key and was kept
    Existing(Arc<UdpSocket>),
}

/// Connection-tracking table of one relay
#[derive(Default)]
pub(crate) struct ConnTrack {
    flows: Mutex<HashMap<FlowKey, FlowEntry>>,
    next_flow_id: AtomicU64,
}

impl ConnTrack {
    fn flows(&self) -> MutexGuard<'_, HashMap<FlowKey, FlowEntry>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self, key: &FlowKey) -> Option<Arc<UdpSocket>> {
        self.flows().get(key).map(|entry| entry.backend.clone())
    }

    pub(crate) fn insert(&self, key: FlowKey, backend: Arc<UdpSocket>) -> Insert {
        let mut flows = self.flows();
        if let Some(entry) = flows.get(&key) {
            return Insert::Existing(entry.backend.clone());
        }
        let id = self.next_flow_id.fetch_add(1, Ordering::Relaxed);
        flows.insert(key, FlowEntry { id, backend });
        trace!("Tracking flow {} for {:?}", id, key);
        Insert::Inserted(id)
    }

    /// Remove the entry for `key` if it still belongs to flow `id`.
    pub(crate) fn remove(&self, key: &FlowKey, id: u64) -> bool {
        let mut flows = self.flows();
        match flows.get(key) {
            Some(entry) if entry.id == id => {
                flows.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.flows().len()
    }
}
