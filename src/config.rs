//! Orchestrator and server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// How the aggregator treats a field that only some replicas report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFieldPolicy {
    /// Aggregate each field over the replicas that carry it.
    #[default]
    Skip,
    /// Fail the step when any replica lacks a field another replica reports.
    Reject,
}

/// Limits and policies for the step orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum wait for the step gate. `None` waits indefinitely.
    pub gate_timeout_ms: Option<u64>,
    /// Maximum wall-clock time for one replica fan-out.
    pub replica_timeout_ms: u64,
    /// Aggregation policy for fields missing from some replicas.
    pub missing_fields: MissingFieldPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gate_timeout_ms: Some(30_000),
            replica_timeout_ms: 60_000,
            missing_fields: MissingFieldPolicy::Skip,
        }
    }
}

impl OrchestratorConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// - `InvalidConfig` if `gate_timeout_ms` is `Some(0)` or `replica_timeout_ms` is 0.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.gate_timeout_ms == Some(0) {
            return Err(ValidationError::InvalidConfig {
                reason: "gate_timeout_ms must be > 0 when set".to_string(),
            });
        }
        if self.replica_timeout_ms == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "replica_timeout_ms must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Gate acquisition timeout.
    #[must_use]
    pub fn gate_timeout(&self) -> Option<Duration> {
        self.gate_timeout_ms.map(Duration::from_millis)
    }

    /// Replica fan-out timeout.
    #[must_use]
    pub const fn replica_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_timeout_ms)
    }
}

/// Configuration of the HTTP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind: SocketAddr,
    /// Upper bound on one `/step` or `/rewind` request, gate wait included.
    pub request_timeout_ms: u64,
    /// Maximum number of sessions holding an active model.
    pub max_sessions: usize,
    /// Orchestrator limits.
    pub orchestrator: OrchestratorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 9899)),
            request_timeout_ms: 120_000,
            max_sessions: 256,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validate the configuration, including the nested orchestrator limits.
    ///
    /// # Errors
    /// - `InvalidConfig` if `request_timeout_ms` or `max_sessions` is 0, or the
    ///   orchestrator section is invalid.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.request_timeout_ms == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "request_timeout_ms must be > 0".to_string(),
            });
        }
        if self.max_sessions == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "max_sessions must be > 0".to_string(),
            });
        }
        self.orchestrator.validate()
    }

    /// Parse a JSON configuration document. Absent keys take their defaults.
    ///
    /// # Errors
    /// - `InvalidConfig` if the document is not valid JSON or fails [`Self::validate`].
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("invalid server config JSON: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
