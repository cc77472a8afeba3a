//! Relay rule definitions
//!
//! This crate defines the forwarding rule shared by the relay engine, the
//! registry, the record store and the control-plane API, together with its
//! two textual encodings:
//!
//! - identity: `<port>:<service>:<targetPort>` (registry key, list output)
//! - record line: `<port> <service>:<targetPort>` (on-disk format)

pub mod rule;

pub use rule::{ParseRuleError, RelayRule};
