//! Configuration loading and session tunables.
//!
//! The config file is an ordered JSON array of endpoint records, each
//! naming the nodes to read or probe and how often. A missing file is an
//! empty configuration; a malformed one aborts startup before any session
//! runs.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::action::{ActionKind, ActionSpec};
use crate::error::ConfigError;
use crate::transport::CURRENT_TIME_NODE;

/// One node entry inside an endpoint record.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeEntry {
    /// Protocol-level node reference in string form.
    pub id: String,
    /// Seconds between executions; zero (the default) means one-shot.
    #[serde(default)]
    pub interval: u64,
}

/// One endpoint record: where to connect and what to schedule there.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EndpointConfig {
    pub endpoint_url: String,
    #[serde(default = "default_true")]
    pub use_security: bool,
    #[serde(default)]
    pub read: Vec<NodeEntry>,
    #[serde(default)]
    pub test: Vec<NodeEntry>,
}

fn default_true() -> bool {
    true
}

impl EndpointConfig {
    /// Action specs in execution order: reads first, then tests, each in
    /// file order.
    pub fn action_specs(&self) -> Vec<ActionSpec> {
        let entry = |kind: ActionKind, e: &NodeEntry| {
            ActionSpec::new(kind, e.id.clone(), Duration::from_secs(e.interval))
        };
        self.read
            .iter()
            .map(|e| entry(ActionKind::Read, e))
            .chain(self.test.iter().map(|e| entry(ActionKind::Test, e)))
            .collect()
    }
}

/// The full configuration: an ordered list of endpoint records.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ClientConfig {
    pub endpoints: Vec<EndpointConfig>,
}

impl ClientConfig {
    /// Load the config file. An absent file is not an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, starting empty");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Unreadable {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_str(&raw).map_err(|e| ConfigError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Append the built-in connectivity probe: a recurring `Test` of the
    /// well-known current-time node against the default endpoint,
    /// optionally duplicated on a security-disabled variant.
    pub fn with_default_probe(
        mut self,
        endpoint_url: &str,
        use_security: bool,
        interval: Duration,
        insecure_variant: bool,
    ) -> Self {
        let probe = |secure: bool| EndpointConfig {
            endpoint_url: endpoint_url.to_string(),
            use_security: secure,
            read: Vec::new(),
            test: vec![NodeEntry {
                id: CURRENT_TIME_NODE.to_string(),
                interval: interval.as_secs(),
            }],
        };

        self.endpoints.push(probe(use_security));
        if insecure_variant && use_security {
            self.endpoints.push(probe(false));
        }
        self
    }
}

/// Timing and health tunables shared by every session control loop.
#[derive(Debug, Clone)]
pub struct SessionTunables {
    /// Base connect timeout, scaled by the backoff multiplier.
    pub session_timeout_base: Duration,
    /// Cap on the backoff multiplier.
    pub backoff_max: u32,
    /// Missed keep-alives tolerated before the connection is replaced.
    pub keep_alive_threshold: u32,
    /// Fixed control-loop poll interval.
    pub poll_interval: Duration,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            session_timeout_base: Duration::from_secs(5),
            backoff_max: 10,
            keep_alive_threshold: 3,
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl SessionTunables {
    /// Connect timeout for the next attempt after `failures` consecutive
    /// failed attempts: `base * min(failures + 1, backoff_max)`. Grows
    /// linearly, then stays flat at the cap.
    pub fn attempt_timeout(&self, failures: u32) -> Duration {
        self.session_timeout_base * (failures + 1).min(self.backoff_max.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn absent_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load(&dir.path().join("missing.json")).unwrap();
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn malformed_file_is_fatal() {
        let (_dir, path) = write_config("{ not json");
        let err = ClientConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn parses_endpoint_records_with_defaults() {
        let (_dir, path) = write_config(
            r#"[
                {
                    "endpointUrl": "opc.tcp://plant-7:4840",
                    "read": [ { "id": "ns=2;s=Level", "interval": 10 } ],
                    "test": [ { "id": "i=2258" } ]
                },
                {
                    "endpointUrl": "opc.tcp://plant-8:4840",
                    "useSecurity": false
                }
            ]"#,
        );

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.endpoints.len(), 2);

        let first = &config.endpoints[0];
        assert!(first.use_security, "security defaults to on");
        let specs = first.action_specs();
        assert_eq!(
            specs,
            vec![
                ActionSpec::new(ActionKind::Read, "ns=2;s=Level", Duration::from_secs(10)),
                ActionSpec::new(ActionKind::Test, "i=2258", Duration::ZERO),
            ]
        );

        assert!(!config.endpoints[1].use_security);
        assert!(config.endpoints[1].action_specs().is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let (_dir, path) = write_config(
            r#"[ { "endpointUrl": "opc.tcp://x:4840", "nodes": [] } ]"#,
        );
        assert!(matches!(
            ClientConfig::load(&path).unwrap_err(),
            ConfigError::Malformed { .. }
        ));
    }

    #[test]
    fn default_probe_synthesis() {
        let config = ClientConfig::default().with_default_probe(
            "opc.tcp://localhost:4840",
            true,
            Duration::from_secs(30),
            true,
        );

        assert_eq!(config.endpoints.len(), 2);
        assert!(config.endpoints[0].use_security);
        assert!(!config.endpoints[1].use_security);
        for ep in &config.endpoints {
            assert_eq!(ep.endpoint_url, "opc.tcp://localhost:4840");
            assert_eq!(ep.test, vec![NodeEntry { id: CURRENT_TIME_NODE.into(), interval: 30 }]);
        }
    }

    #[test]
    fn default_probe_without_insecure_variant() {
        let config = ClientConfig::default().with_default_probe(
            "opc.tcp://localhost:4840",
            false,
            Duration::from_secs(30),
            true,
        );
        // Security already off: no separate insecure duplicate.
        assert_eq!(config.endpoints.len(), 1);
        assert!(!config.endpoints[0].use_security);
    }

    #[test]
    fn backoff_is_monotone_and_bounded() {
        let tunables = SessionTunables {
            session_timeout_base: Duration::from_secs(10),
            backoff_max: 5,
            ..Default::default()
        };

        let mut last = Duration::ZERO;
        for failures in 0..20 {
            let timeout = tunables.attempt_timeout(failures);
            assert!(timeout >= last, "backoff must not shrink");
            assert!(timeout <= Duration::from_secs(50), "backoff must stay capped");
            last = timeout;
        }
        assert_eq!(tunables.attempt_timeout(0), Duration::from_secs(10));
        assert_eq!(tunables.attempt_timeout(1), Duration::from_secs(20));
        assert_eq!(tunables.attempt_timeout(4), Duration::from_secs(50));
        assert_eq!(tunables.attempt_timeout(100), Duration::from_secs(50));
    }
}
