//! Relay forwarding tests over loopback sockets

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};
use udpfwd_proto::RelayRule;
use udpfwd_relay::{RelayConfig, RelayError, ResolveError, Resolver, UdpRelay};

/// Resolves every name to loopback and counts lookups
#[derive(Default)]
struct CountingResolver {
    lookups: AtomicUsize,
}

impl CountingResolver {
    fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for CountingResolver {
    async fn resolve(&self, _service: &str) -> Result<IpAddr, ResolveError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

struct FailingResolver;

#[async_trait]
impl Resolver for FailingResolver {
    async fn resolve(&self, service: &str) -> Result<IpAddr, ResolveError> {
        Err(ResolveError::NoAddress {
            service: service.to_string(),
        })
    }
}

/// Never answers within any test's lifetime
struct StalledResolver {
    started: tokio::sync::Notify,
}

#[async_trait]
impl Resolver for StalledResolver {
    async fn resolve(&self, _service: &str) -> Result<IpAddr, ResolveError> {
        self.started.notify_one();
        sleep(Duration::from_secs(30)).await;
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

fn loopback_config(idle_timeout: Duration) -> RelayConfig {
    RelayConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        idle_timeout,
    }
}

/// Spawn a backend that echoes every datagram, returning its address
async fn spawn_echo_backend() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

async fn start_relay(
    backend_port: u16,
    resolver: Arc<dyn Resolver>,
    idle_timeout: Duration,
) -> UdpRelay {
    let rule = RelayRule::new(0, "echo.test", backend_port);
    let relay = UdpRelay::bind(rule, loopback_config(idle_timeout), resolver)
        .await
        .unwrap();
    assert!(relay.start());
    relay
}

async fn round_trip(client: &UdpSocket, relay: SocketAddr, payload: &[u8]) -> Vec<u8> {
    client.send_to(payload, relay).await.unwrap();
    let mut buf = vec![0u8; 65535];
    let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("reply timed out")
        .unwrap();
    assert_eq!(from, relay);
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn test_forwards_datagram_and_reply() {
    let backend = spawn_echo_backend().await;
    let resolver = Arc::new(CountingResolver::default());
    let relay = start_relay(backend.port(), resolver.clone(), Duration::from_secs(30)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let reply = round_trip(&client, relay.local_addr(), b"ping").await;

    assert_eq!(reply, b"ping");
    assert_eq!(resolver.lookups(), 1);
    assert_eq!(relay.active_flows(), 1);

    relay.close().await;
}

#[tokio::test]
async fn test_same_client_reuses_flow() {
    let backend = spawn_echo_backend().await;
    let resolver = Arc::new(CountingResolver::default());
    let relay = start_relay(backend.port(), resolver.clone(), Duration::from_secs(30)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(round_trip(&client, relay.local_addr(), b"one").await, b"one");
    assert_eq!(round_trip(&client, relay.local_addr(), b"two").await, b"two");
    assert_eq!(resolver.lookups(), 1);
    assert_eq!(relay.active_flows(), 1);

    let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(round_trip(&other, relay.local_addr(), b"three").await, b"three");
    assert_eq!(resolver.lookups(), 2);
    assert_eq!(relay.active_flows(), 2);

    relay.close().await;
}

#[tokio::test]
async fn test_large_datagram_is_forwarded_whole() {
    let backend = spawn_echo_backend().await;
    let resolver = Arc::new(CountingResolver::default());
    let relay = start_relay(backend.port(), resolver, Duration::from_secs(30)).await;

    let payload: Vec<u8> = (0..8000u32).map(|i| (i % 251) as u8).collect();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(round_trip(&client, relay.local_addr(), &payload).await, payload);

    relay.close().await;
}

#[tokio::test]
async fn test_idle_flow_expires_and_resolves_again() {
    let backend = spawn_echo_backend().await;
    let resolver = Arc::new(CountingResolver::default());
    let relay = start_relay(backend.port(), resolver.clone(), Duration::from_millis(200)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    round_trip(&client, relay.local_addr(), b"first").await;
    assert_eq!(relay.active_flows(), 1);

    sleep(Duration::from_millis(600)).await;
    assert_eq!(relay.active_flows(), 0);

    assert_eq!(round_trip(&client, relay.local_addr(), b"second").await, b"second");
    assert_eq!(resolver.lookups(), 2);
    assert_eq!(relay.active_flows(), 1);

    relay.close().await;
}

#[tokio::test]
async fn test_resolution_failure_drops_datagram() {
    let backend = spawn_echo_backend().await;
    let relay = start_relay(backend.port(), Arc::new(FailingResolver), Duration::from_secs(30)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"lost", relay.local_addr()).await.unwrap();

    let mut buf = [0u8; 16];
    let reply = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "no reply expected without a backend");
    assert_eq!(relay.active_flows(), 0);

    relay.close().await;
}

#[tokio::test]
async fn test_refused_backend_keeps_flow_until_timeout() {
    // Reserve a port with nothing listening on it
    let port = {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap().port()
    };
    let resolver = Arc::new(CountingResolver::default());
    let relay = start_relay(port, resolver, Duration::from_millis(500)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"anyone?", relay.local_addr()).await.unwrap();

    sleep(Duration::from_millis(150)).await;
    assert_eq!(relay.active_flows(), 1);

    sleep(Duration::from_millis(900)).await;
    assert_eq!(relay.active_flows(), 0);

    relay.close().await;
}

#[tokio::test]
async fn test_close_releases_all_sockets() {
    let backend = spawn_echo_backend().await;
    let resolver = Arc::new(CountingResolver::default());
    let relay = start_relay(backend.port(), resolver, Duration::from_secs(30)).await;
    let relay_addr = relay.local_addr();

    for _ in 0..3 {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        round_trip(&client, relay_addr, b"hello").await;
    }
    assert_eq!(relay.active_flows(), 3);

    timeout(Duration::from_secs(2), relay.close())
        .await
        .expect("close must not hang");

    assert!(relay.is_closed());
    assert_eq!(relay.active_flows(), 0);

    // The frontend port is free again
    UdpSocket::bind(relay_addr).await.unwrap();
}

#[tokio::test]
async fn test_close_does_not_wait_for_pending_resolution() {
    let resolver = Arc::new(StalledResolver {
        started: tokio::sync::Notify::new(),
    });
    let relay = start_relay(9, resolver.clone(), Duration::from_secs(30)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", relay.local_addr()).await.unwrap();
    timeout(Duration::from_secs(2), resolver.started.notified())
        .await
        .expect("lookup never started");

    timeout(Duration::from_secs(1), relay.close())
        .await
        .expect("close blocked on a pending lookup");
    assert_eq!(relay.active_flows(), 0);
}

#[tokio::test]
async fn test_bind_conflict() {
    let holder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = holder.local_addr().unwrap().port();

    let rule = RelayRule::new(port, "echo.test", 9);
    let result = UdpRelay::bind(
        rule,
        loopback_config(Duration::from_secs(30)),
        Arc::new(CountingResolver::default()),
    )
    .await;

    match result {
        Err(RelayError::Bind { port: p, .. }) => assert_eq!(p, port),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("bind should fail while the port is held"),
    }
}
