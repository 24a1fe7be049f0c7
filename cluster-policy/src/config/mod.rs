/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Engine configuration loading.
//!
//! The expected YAML structure is (every key optional):
//! ```yaml
//! strategy: energy_aware_bin_pack
//! idle_grace_period_us: 200000
//! container_task_limit: 16
//! vm_memory_overhead_mb: 8
//! max_offload_attempts: 3
//! high_priority_provisioning: true
//! drain_on_periodic_check: true
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::types::Time;

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Idle time after which an empty machine is powered down (200 ms).
pub const DEFAULT_IDLE_GRACE_PERIOD_US: Time = 200_000;

/// Maximum number of tasks a single container may hold.
pub const DEFAULT_CONTAINER_TASK_LIMIT: usize = 16;

/// Memory charged to a host for every attached container, in MB.
pub const DEFAULT_VM_MEMORY_OVERHEAD_MB: u64 = 8;

/// Offload attempts per placement call before the task is given up on.
pub const DEFAULT_MAX_OFFLOAD_ATTEMPTS: u32 = 3;

fn default_idle_grace_period_us() -> Time {
    DEFAULT_IDLE_GRACE_PERIOD_US
}

fn default_container_task_limit() -> usize {
    DEFAULT_CONTAINER_TASK_LIMIT
}

fn default_vm_memory_overhead_mb() -> u64 {
    DEFAULT_VM_MEMORY_OVERHEAD_MB
}

fn default_max_offload_attempts() -> u32 {
    DEFAULT_MAX_OFFLOAD_ATTEMPTS
}

fn default_true() -> bool {
    true
}

// ── Strategy ──────────────────────────────────────────────────────────────────

/// Placement/power strategy pair selected by configuration.
///
/// See [`crate::placement::strategy`] for what each one does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    LeastLoaded,
    EnergyAwareBinPack,
    HighPerformanceFirst,
    AdaptiveIdleConsolidation,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::LeastLoaded => "least_loaded",
            Strategy::EnergyAwareBinPack => "energy_aware_bin_pack",
            Strategy::HighPerformanceFirst => "high_performance_first",
            Strategy::AdaptiveIdleConsolidation => "adaptive_idle_consolidation",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "least_loaded" => Ok(Strategy::LeastLoaded),
            "energy_aware_bin_pack" => Ok(Strategy::EnergyAwareBinPack),
            "high_performance_first" => Ok(Strategy::HighPerformanceFirst),
            "adaptive_idle_consolidation" => Ok(Strategy::AdaptiveIdleConsolidation),
            other => Err(EngineError::UnknownStrategy(other.to_string())),
        }
    }
}

// ── EngineConfig ──────────────────────────────────────────────────────────────

/// Tunables of the policy engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub strategy: Strategy,

    /// Minimum time a machine must sit at zero load before it is powered down.
    #[serde(default = "default_idle_grace_period_us")]
    pub idle_grace_period_us: Time,

    #[serde(default = "default_container_task_limit")]
    pub container_task_limit: usize,

    /// Must match the collaborator's per-container memory charge.
    #[serde(default = "default_vm_memory_overhead_mb")]
    pub vm_memory_overhead_mb: u64,

    #[serde(default = "default_max_offload_attempts")]
    pub max_offload_attempts: u32,

    /// Let SLA0 tasks wake a fresh machine rather than share a busy one.
    #[serde(default = "default_true")]
    pub high_priority_provisioning: bool,

    /// Retry deferred tasks on every periodic check, not only on completions
    /// and wake-ups.
    #[serde(default = "default_true")]
    pub drain_on_periodic_check: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            idle_grace_period_us: DEFAULT_IDLE_GRACE_PERIOD_US,
            container_task_limit: DEFAULT_CONTAINER_TASK_LIMIT,
            vm_memory_overhead_mb: DEFAULT_VM_MEMORY_OVERHEAD_MB,
            max_offload_attempts: DEFAULT_MAX_OFFLOAD_ATTEMPTS,
            high_priority_provisioning: true,
            drain_on_periodic_check: true,
        }
    }
}

impl EngineConfig {
    /// Parses and validates the YAML file at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, the YAML is malformed or
    /// contains unknown keys, or a value fails [`validate`](Self::validate).
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading engine configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        let config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        debug!(?config, "engine configuration parsed");
        info!(
            strategy = %config.strategy,
            grace_us = config.idle_grace_period_us,
            container_limit = config.container_task_limit,
            offload_attempts = config.max_offload_attempts,
            "engine configuration loaded"
        );

        Ok(config)
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        if self.container_task_limit == 0 {
            return Err(EngineError::InvalidConfig {
                field: "container_task_limit",
                reason: "a container must accept at least one task".to_string(),
            });
        }
        if self.max_offload_attempts > 16 {
            return Err(EngineError::InvalidConfig {
                field: "max_offload_attempts",
                reason: format!("{} exceeds the maximum of 16", self.max_offload_attempts),
            });
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper: write a YAML string to a temp file and return it.
    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn empty_document_uses_defaults() {
        let f = yaml_tempfile("{}\n");
        let cfg = EngineConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.idle_grace_period_us, 200_000);
        assert_eq!(cfg.max_offload_attempts, 3);
    }

    #[test]
    fn load_full_yaml() {
        let yaml = r#"
strategy: energy_aware_bin_pack
idle_grace_period_us: 50000
container_task_limit: 4
vm_memory_overhead_mb: 16
max_offload_attempts: 2
high_priority_provisioning: false
drain_on_periodic_check: false
"#;
        let f = yaml_tempfile(yaml);
        let cfg = EngineConfig::load_from_file(f.path()).unwrap();

        assert_eq!(cfg.strategy, Strategy::EnergyAwareBinPack);
        assert_eq!(cfg.idle_grace_period_us, 50_000);
        assert_eq!(cfg.container_task_limit, 4);
        assert_eq!(cfg.vm_memory_overhead_mb, 16);
        assert_eq!(cfg.max_offload_attempts, 2);
        assert!(!cfg.high_priority_provisioning);
        assert!(!cfg.drain_on_periodic_check);
    }

    #[test]
    fn unknown_strategy_in_yaml_is_rejected() {
        let f = yaml_tempfile("strategy: round_robin\n");
        assert!(EngineConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let f = yaml_tempfile("grace: 10\n");
        assert!(EngineConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn zero_container_limit_fails_validation() {
        let f = yaml_tempfile("container_task_limit: 0\n");
        let err = EngineConfig::load_from_file(f.path()).unwrap_err();
        assert!(
            format!("{err:#}").contains("container_task_limit"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn missing_file_returns_error() {
        let result = EngineConfig::load_from_file(Path::new("/nonexistent/engine.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn strategy_parses_every_name() {
        for s in [
            Strategy::LeastLoaded,
            Strategy::EnergyAwareBinPack,
            Strategy::HighPerformanceFirst,
            Strategy::AdaptiveIdleConsolidation,
        ] {
            assert_eq!(s.as_str().parse::<Strategy>().unwrap(), s);
        }
        assert!(matches!(
            "nonsense".parse::<Strategy>(),
            Err(EngineError::UnknownStrategy(_))
        ));
    }
}
