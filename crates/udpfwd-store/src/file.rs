//! Line-based records file
//!
//! One rule per line: `<port> <service>:<targetPort>`.

use crate::{RuleStore, StoreError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use udpfwd_proto::RelayRule;

/// Rule store backed by a plain text file
#[derive(Debug, Clone)]
pub struct FileRuleStore {
    path: PathBuf,
}

impl FileRuleStore {
    /// Create a store at `path`, creating its parent directory if needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Encode rules in the records file format.
pub fn encode_records(rules: &[RelayRule]) -> String {
    let mut data = String::new();
    for rule in rules {
        data.push_str(&rule.record_line());
        data.push('\n');
    }
    data
}

/// Decode the records file format, skipping lines that do not parse.
pub fn decode_records(data: &str) -> Vec<RelayRule> {
    let mut rules = Vec::new();
    for (index, line) in data.trim().lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match RelayRule::parse_record(line) {
            Ok(rule) => rules.push(rule),
            Err(e) => warn!("Skipping record line {} ({:?}): {}", index + 1, line, e),
        }
    }
    rules
}

#[async_trait]
impl RuleStore for FileRuleStore {
    async fn store(&self, rules: &[RelayRule]) -> Result<(), StoreError> {
        let data = encode_records(rules);

        // Write a sibling file and rename it over the records file
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp_path, data.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        debug!("Stored {} records in {:?}", rules.len(), self.path);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<RelayRule>, StoreError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No records file at {:?}, starting empty", self.path);
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let rules = decode_records(&data);
        debug!("Loaded {} records from {:?}", rules.len(), self.path);
        Ok(rules)
    }
}
