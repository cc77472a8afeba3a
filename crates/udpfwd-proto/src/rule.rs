//! Relay rule type and its textual encodings

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Errors produced when parsing or validating a relay rule
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseRuleError {
    #[error("empty line")]
    Empty,

    #[error("expected 2 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid service and target port: {0}")]
    InvalidTarget(String),

    #[error("invalid target port: {0}")]
    InvalidTargetPort(String),

    #[error("service name is empty")]
    EmptyService,

    #[error("invalid service name: {0}")]
    InvalidService(String),
}

/// A forwarding rule: frontend UDP port -> `service:target_port`
///
/// The service is a DNS name resolved again for every new client flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct RelayRule {
    /// Frontend UDP port
    pub port: u16,
    /// Backend service name
    pub service: String,
    /// Backend UDP port
    pub target_port: u16,
}

impl RelayRule {
    pub fn new(port: u16, service: impl Into<String>, target_port: u16) -> Self {
        Self {
            port,
            service: service.into(),
            target_port,
        }
    }

    /// Registry key, `<port>:<service>:<targetPort>`
    pub fn identity(&self) -> String {
        format!("{}:{}:{}", self.port, self.service, self.target_port)
    }

    /// On-disk line, `<port> <service>:<targetPort>` (no trailing newline)
    pub fn record_line(&self) -> String {
        format!("{} {}:{}", self.port, self.service, self.target_port)
    }

    /// Parse a single record line as written by [`RelayRule::record_line`].
    ///
    /// Surrounding whitespace is ignored.
    pub fn parse_record(line: &str) -> Result<Self, ParseRuleError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseRuleError::Empty);
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(ParseRuleError::FieldCount(fields.len()));
        }

        let port: u16 = fields[0]
            .parse()
            .map_err(|_| ParseRuleError::InvalidPort(fields[0].to_string()))?;

        let (service, target_port) = match fields[1].split_once(':') {
            Some((service, target_port)) if !target_port.contains(':') => (service, target_port),
            _ => return Err(ParseRuleError::InvalidTarget(fields[1].to_string())),
        };

        let target_port: u16 = target_port
            .parse()
            .map_err(|_| ParseRuleError::InvalidTargetPort(target_port.to_string()))?;

        let rule = Self::new(port, service, target_port);
        rule.validate()?;
        Ok(rule)
    }

    /// Check that both ports are fixed and the service name can round-trip
    /// through both encodings.
    pub fn validate(&self) -> Result<(), ParseRuleError> {
        // Port 0 would bind an ephemeral port or dial nothing
        if self.port == 0 {
            return Err(ParseRuleError::InvalidPort(self.port.to_string()));
        }
        if self.target_port == 0 {
            return Err(ParseRuleError::InvalidTargetPort(self.target_port.to_string()));
        }
        if self.service.is_empty() {
            return Err(ParseRuleError::EmptyService);
        }
        if self
            .service
            .chars()
            .any(|c| c == ':' || c.is_whitespace() || c.is_control())
        {
            return Err(ParseRuleError::InvalidService(self.service.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for RelayRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.port, self.service, self.target_port)
    }
}
