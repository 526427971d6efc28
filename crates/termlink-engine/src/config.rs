//! Engine configuration and the endpoint display-name map

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use termlink_proto::EndpointId;
use thiserror::Error;

/// Timing and policy knobs for the polling engine and discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tick period between poll cycles in normal operation
    pub poll_interval_ms: u64,
    /// Tick period while draining alarms before a disruptive operation
    pub drain_interval_ms: u64,
    /// Per-attempt response timeout
    pub attempt_timeout_ms: u64,
    /// Attempts before an unreachable event id is dropped from its queue
    pub max_attempts: u32,
    /// Capacity of each priority queue
    pub queue_capacity: usize,
    /// Heartbeat period offered when registering as event receiver, in
    /// tenths of a second
    pub heartbeat_decisecs: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            drain_interval_ms: 50,
            attempt_timeout_ms: 1_000,
            max_attempts: 3,
            queue_capacity: 256,
            heartbeat_decisecs: 0x78,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Deadline armed on every outstanding request: the terminus gets the
    /// full retry budget worth of time before the attempt is abandoned.
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(u64::from(self.max_attempts + 1) * self.attempt_timeout_ms)
    }
}

/// How an endpoint's configured name decorates sensor/effecter names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameDecoration {
    pub text: String,
    /// Prepend when true, append when false
    pub prefix: bool,
}

impl NameDecoration {
    pub fn apply(&self, base: &str) -> String {
        if self.prefix {
            format!("{}{}", self.text, base)
        } else {
            format!("{}{}", base, self.text)
        }
    }
}

#[derive(Debug, Deserialize)]
struct NameMapEntry {
    endpoint: EndpointId,
    name: String,
    #[serde(default = "default_prefix")]
    prefix: bool,
}

fn default_prefix() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct NameMapFile {
    endpoints: Vec<NameMapEntry>,
}

/// Endpoint → display-name mapping, loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct NameMap {
    entries: HashMap<EndpointId, NameDecoration>,
}

impl NameMap {
    /// Load the mapping from a JSON file of the form
    /// `{"endpoints": [{"endpoint": 1, "name": "S0_", "prefix": true}]}`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        let file: NameMapFile = serde_json::from_str(&raw)?;
        let mut entries = HashMap::new();
        for entry in file.endpoints {
            if entry.name.is_empty() {
                tracing::warn!(endpoint = entry.endpoint, "empty name mapping ignored");
                continue;
            }
            entries.insert(
                entry.endpoint,
                NameDecoration {
                    text: entry.name,
                    prefix: entry.prefix,
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn get(&self, endpoint: EndpointId) -> Option<&NameDecoration> {
        self.entries.get(&endpoint)
    }

    #[doc(hidden)]
    pub fn insert(&mut self, endpoint: EndpointId, decoration: NameDecoration) {
        self.entries.insert(endpoint, decoration);
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("failed to parse name map: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoration_prefix_and_suffix() {
        let prefix = NameDecoration {
            text: "S0_".into(),
            prefix: true,
        };
        let suffix = NameDecoration {
            text: "_S1".into(),
            prefix: false,
        };
        assert_eq!(prefix.apply("Temp"), "S0_Temp");
        assert_eq!(suffix.apply("Temp"), "Temp_S1");
    }

    #[test]
    fn name_map_parses_entries() {
        let raw = r#"{"endpoints":[
            {"endpoint": 1, "name": "S0_"},
            {"endpoint": 2, "name": "_S1", "prefix": false}
        ]}"#;
        let file: NameMapFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.endpoints.len(), 2);
        assert!(file.endpoints[0].prefix);
        assert!(!file.endpoints[1].prefix);
    }

    #[test]
    fn request_deadline_covers_retry_budget() {
        let config = EngineConfig {
            attempt_timeout_ms: 100,
            max_attempts: 3,
            ..Default::default()
        };
        assert_eq!(config.request_deadline(), Duration::from_millis(400));
    }
}
