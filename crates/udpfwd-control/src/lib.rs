//! Control plane for relay orchestration
pub mod registry;

pub use registry::{RegistryError, RelayRegistry};
