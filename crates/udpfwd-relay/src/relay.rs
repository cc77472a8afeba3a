//! UDP relay implementation
//!
//! One forwarding task reads the frontend socket. Each client flow gets its
//! own backend socket, dialed to a freshly resolved address, and a reply task
//! that copies backend datagrams back to the client until the flow has been
//! idle for the configured timeout.

use crate::conntrack::{ConnTrack, FlowKey, Insert};
use crate::resolver::Resolver;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use udpfwd_proto::RelayRule;

/// Idle period after which a flow's reply task exits and its state is dropped
pub const UDP_CONN_TRACK_TIMEOUT: Duration = Duration::from_secs(90);

/// Largest datagram a UDP socket can hand back (IPv6 payloads may exceed
/// the IPv4 limit of 65507)
pub const UDP_BUF_SIZE: usize = 65535;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind udp {address}:{port}: {source}")]
    Bind {
        address: IpAddr,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the frontend socket binds to
    pub bind_ip: IpAddr,
    /// Flow idle timeout
    pub idle_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            idle_timeout: UDP_CONN_TRACK_TIMEOUT,
        }
    }
}

/// Forwards datagrams between one frontend port and a resolved backend
pub struct UdpRelay {
    rule: RelayRule,
    local_addr: SocketAddr,
    idle_timeout: Duration,
    /// Frontend socket, moved into the forwarding task by `start`
    listener: Mutex<Option<UdpSocket>>,
    conntrack: Arc<ConnTrack>,
    resolver: Arc<dyn Resolver>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl UdpRelay {
    /// Bind the frontend socket for `rule`.
    ///
    /// The backend is not resolved here; resolution happens per flow.
    pub async fn bind(
        rule: RelayRule,
        config: RelayConfig,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self, RelayError> {
        let bind_addr = SocketAddr::new(config.bind_ip, rule.port);
        let listener = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                address: config.bind_ip,
                port: rule.port,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        debug!("Bound relay socket {} for {}", local_addr, rule);

        Ok(Self {
            rule,
            local_addr,
            idle_timeout: config.idle_timeout,
            listener: Mutex::new(Some(listener)),
            conntrack: Arc::new(ConnTrack::default()),
            resolver,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn rule(&self) -> &RelayRule {
        &self.rule
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of flows currently tracked
    pub fn active_flows(&self) -> usize {
        self.conntrack.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Spawn the forwarding loop.
    ///
    /// Returns `false` if the relay was already started or has been closed.
    pub fn start(&self) -> bool {
        let listener = match self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(listener) => listener,
            None => return false,
        };
        if self.shutdown.is_cancelled() {
            return false;
        }

        let forward = ForwardLoop {
            rule: self.rule.clone(),
            listener: Arc::new(listener),
            idle_timeout: self.idle_timeout,
            conntrack: self.conntrack.clone(),
            resolver: self.resolver.clone(),
            shutdown: self.shutdown.clone(),
            tasks: self.tasks.clone(),
        };
        self.tasks.spawn(forward.run());
        true
    }

    /// Stop forwarding and wait until every task has released its socket.
    pub async fn close(&self) {
        self.shutdown.cancel();
        drop(
            self.listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.tasks.close();
        self.tasks.wait().await;
        debug!("Relay {} closed", self.rule);
    }
}

impl Drop for UdpRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct ForwardLoop {
    rule: RelayRule,
    listener: Arc<UdpSocket>,
    idle_timeout: Duration,
    conntrack: Arc<ConnTrack>,
    resolver: Arc<dyn Resolver>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ForwardLoop {
    async fn run(self) {
        info!(
            "Starting relay on udp/{} for service {} udp/{}",
            self.rule.port, self.rule.service, self.rule.target_port
        );

        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            let (read, from) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.listener.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(
                            "Stopping relay on udp/{} for service {} udp/{} ({})",
                            self.rule.port, self.rule.service, self.rule.target_port, e
                        );
                        break;
                    }
                },
            };

            let backend = match self.backend_for(from).await {
                Some(backend) => backend,
                None => continue,
            };

            if let Err(e) = send_all(&backend, &buf[..read], None).await {
                warn!(
                    "Can't relay a datagram to {} udp/{}: {}",
                    self.rule.service, self.rule.target_port, e
                );
            }
        }

        info!("Relay on udp/{} stopped", self.rule.port);
    }

    /// Backend socket for the client at `from`, creating the flow on first sight.
    async fn backend_for(&self, from: SocketAddr) -> Option<Arc<UdpSocket>> {
        let key = FlowKey::from(from);
        if let Some(backend) = self.conntrack.get(&key) {
            return Some(backend);
        }

        // Lookups can stall for seconds; close must not wait for them
        let resolved = tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            result = self.resolver.resolve(&self.rule.service) => result,
        };
        let ip = match resolved {
            Ok(ip) => ip,
            Err(e) => {
                warn!("Can't resolve backend for {}: {}", self.rule, e);
                return None;
            }
        };

        let backend_addr = SocketAddr::new(ip, self.rule.target_port);
        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            result = connect_backend(backend_addr) => result,
        };
        let backend = match connected {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(
                    "Can't relay a datagram to {} udp/{} ({}): {}",
                    self.rule.service, self.rule.target_port, backend_addr, e
                );
                return None;
            }
        };

        let flow_id = match self.conntrack.insert(key, backend.clone()) {
            Insert::Inserted(id) => id,
            Insert::Existing(existing) => return Some(existing),
        };

        debug!("New flow {} -> {} on udp/{}", from, backend_addr, self.rule.port);

        let reply = ReplyLoop {
            flow: FlowGuard {
                conntrack: self.conntrack.clone(),
                key,
                id: flow_id,
            },
            client: from,
            backend: backend.clone(),
            listener: self.listener.clone(),
            idle_timeout: self.idle_timeout,
            shutdown: self.shutdown.clone(),
        };
        self.tasks.spawn(reply.run());

        Some(backend)
    }
}

/// Removes the flow's tracking entry when its reply task ends
struct FlowGuard {
    conntrack: Arc<ConnTrack>,
    key: FlowKey,
    id: u64,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        if self.conntrack.remove(&self.key, self.id) {
            debug!("Flow {} released", self.id);
        }
    }
}

struct ReplyLoop {
    flow: FlowGuard,
    client: SocketAddr,
    backend: Arc<UdpSocket>,
    listener: Arc<UdpSocket>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl ReplyLoop {
    async fn run(self) {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            let deadline = Instant::now() + self.idle_timeout;
            let read = loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    result = tokio::time::timeout_at(deadline, self.backend.recv(&mut buf)) => match result {
                        Ok(Ok(read)) => break read,
                        // ICMP port unreachable from a backend that is not
                        // listening yet; keep waiting on the same deadline
                        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                        Ok(Err(e)) => {
                            debug!("Flow {} read error: {}", self.flow.id, e);
                            return;
                        }
                        Err(_) => {
                            debug!("Flow {} from {} idle, expiring", self.flow.id, self.client);
                            return;
                        }
                    },
                }
            };

            if let Err(e) = send_all(&self.listener, &buf[..read], Some(self.client)).await {
                debug!("Flow {} can't reply to {}: {}", self.flow.id, self.client, e);
                return;
            }
        }
    }
}

/// Open a socket connected to `addr` from the wildcard address of its family.
async fn connect_backend(addr: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

/// Write the whole payload, looping on short writes.
///
/// With `target` the socket is used unconnected (`send_to`).
async fn send_all(socket: &UdpSocket, payload: &[u8], target: Option<SocketAddr>) -> io::Result<()> {
    let mut written = 0;
    while written < payload.len() {
        let n = match target {
            Some(addr) => socket.send_to(&payload[written..], addr).await?,
            None => socket.send(&payload[written..]).await?,
        };
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        written += n;
    }
    Ok(())
}
