//! Engine configuration
//!
//! [`AgentConfig`] is validated fail-closed at construction: a config that
//! would misbehave at runtime (zero capacity, zero threads) never exists as
//! a value. Build one with [`AgentConfig::builder`].

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Worker-pool and memory bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// Upper bound on pool workers
    pub max_threads: usize,

    /// Upper bound on resident memory, in megabytes
    pub max_memory_mb: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_threads: 8,
            max_memory_mb: 512,
        }
    }
}

/// Observability knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    /// Whether the metrics interceptor records counters
    pub metrics_enabled: bool,

    /// Log level name handed to the subscriber, e.g. `"info"`
    pub log_level: String,

    /// Interval between metric snapshots, in seconds
    pub metrics_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: "info".to_string(),
            metrics_interval_secs: 60,
        }
    }
}

/// Validated engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Cap on simultaneously active runs; admission fails fast beyond it
    pub max_concurrent_flows: usize,

    /// Resource bounds
    pub resource: ResourceConfig,

    /// Observability knobs
    pub monitoring: MonitoringConfig,

    /// Free-form labels attached to emitted metrics and logs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl AgentConfig {
    /// Start building a config; [`AgentConfigBuilder::build`] validates
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_flows == 0 {
            return Err(FlowError::Configuration(
                "maxConcurrentFlows must be > 0".to_string(),
            ));
        }
        if self.resource.max_threads == 0 {
            return Err(FlowError::Configuration(
                "resource.maxThreads must be > 0".to_string(),
            ));
        }
        if self.resource.max_memory_mb == 0 {
            return Err(FlowError::Configuration(
                "resource.maxMemoryMb must be > 0".to_string(),
            ));
        }
        if self.monitoring.metrics_interval_secs == 0 {
            return Err(FlowError::Configuration(
                "monitoring.metricsIntervalSecs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_flows: 16,
            resource: ResourceConfig::default(),
            monitoring: MonitoringConfig::default(),
            labels: HashMap::new(),
        }
    }
}

/// Builder for [`AgentConfig`]
#[derive(Debug, Default, Clone)]
pub struct AgentConfigBuilder {
    config: AgentConfigState,
}

#[derive(Debug, Clone)]
struct AgentConfigState {
    max_concurrent_flows: usize,
    resource: ResourceConfig,
    monitoring: MonitoringConfig,
    labels: HashMap<String, String>,
}

impl Default for AgentConfigState {
    fn default() -> Self {
        let defaults = AgentConfig::default();
        Self {
            max_concurrent_flows: defaults.max_concurrent_flows,
            resource: defaults.resource,
            monitoring: defaults.monitoring,
            labels: defaults.labels,
        }
    }
}

impl AgentConfigBuilder {
    /// Cap on simultaneously active runs
    pub fn max_concurrent_flows(mut self, n: usize) -> Self {
        self.config.max_concurrent_flows = n;
        self
    }

    /// Worker-pool size
    pub fn max_threads(mut self, n: usize) -> Self {
        self.config.resource.max_threads = n;
        self
    }

    /// Memory bound in megabytes
    pub fn max_memory_mb(mut self, n: usize) -> Self {
        self.config.resource.max_memory_mb = n;
        self
    }

    /// Enable or disable the metrics interceptor
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.config.monitoring.metrics_enabled = enabled;
        self
    }

    /// Subscriber log level name
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.monitoring.log_level = level.into();
        self
    }

    /// Metric snapshot interval
    pub fn metrics_interval_secs(mut self, secs: u64) -> Self {
        self.config.monitoring.metrics_interval_secs = secs;
        self
    }

    /// Attach one label
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.labels.insert(key.into(), value.into());
        self
    }

    /// Validate and produce the config; fails closed on any bad bound
    pub fn build(self) -> Result<AgentConfig> {
        let config = AgentConfig {
            max_concurrent_flows: self.config.max_concurrent_flows,
            resource: self.config.resource,
            monitoring: self.config.monitoring,
            labels: self.config.labels,
        };
        config.validate()?;
        Ok(config)
    }
}
