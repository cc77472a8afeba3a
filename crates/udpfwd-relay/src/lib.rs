//! UDP relay engine
//!
//! A [`UdpRelay`] owns one frontend UDP socket and forwards every datagram it
//! receives to `service:target_port`, where `service` is resolved through a
//! [`Resolver`] the first time a client flow is seen. Replies from the backend
//! are sent back to the originating client. Idle flows are reclaimed after
//! [`RelayConfig::idle_timeout`].

mod conntrack;
mod relay;
mod resolver;

pub use conntrack::FlowKey;
pub use relay::{RelayConfig, RelayError, UdpRelay, UDP_BUF_SIZE, UDP_CONN_TRACK_TIMEOUT};
pub use resolver::{ResolveError, Resolver, SystemResolver};
