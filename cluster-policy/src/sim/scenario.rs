/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Replay scenario files.
//!
//! ```yaml
//! wake_latency_us: 50000
//! check_interval_us: 100000
//! machines:
//!   - count: 4
//!     cpu: x86
//!     memory_mb: 16384
//!   - count: 2
//!     cpu: arm
//!     memory_mb: 8192
//!     powered_on: false
//! tasks:
//!   - arrival_us: 0
//!     runtime_us: 300000
//!     cpu: x86
//!     vm: linux
//!     memory_mb: 512
//!     sla: sla1
//!     count: 10
//!     spacing_us: 1000
//! ```

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::backend::memory::{MachineSpec, TaskSpec, DEFAULT_MEMORY_WARNING_THRESHOLD};
use crate::types::{CpuType, SlaClass, Time, VmType};

fn default_wake_latency_us() -> Time {
    50_000
}

fn default_check_interval_us() -> Time {
    100_000
}

fn default_memory_warning_threshold() -> f64 {
    DEFAULT_MEMORY_WARNING_THRESHOLD
}

fn default_count() -> u32 {
    1
}

/// A run of identical machines.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MachineGroup {
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(flatten)]
    pub spec: MachineSpec,
}

/// A run of identical tasks arriving `spacing_us` apart.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskGroup {
    pub arrival_us: Time,
    pub runtime_us: Time,
    pub cpu: CpuType,
    pub vm: VmType,
    pub memory_mb: u64,
    #[serde(default)]
    pub sla: SlaClass,
    /// Relative to arrival; derived from the SLA class when absent.
    #[serde(default)]
    pub deadline_us: Option<Time>,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub spacing_us: Time,
}

/// Deadline slack granted per SLA class, as a multiple of the runtime.
pub fn default_deadline(sla: SlaClass, runtime_us: Time) -> Time {
    let factor = match sla {
        SlaClass::Sla0 => 1.2,
        SlaClass::Sla1 => 1.5,
        SlaClass::Sla2 => 2.0,
        SlaClass::Sla3 => return Time::MAX,
    };
    (runtime_us as f64 * factor) as Time
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default = "default_wake_latency_us")]
    pub wake_latency_us: Time,
    #[serde(default = "default_check_interval_us")]
    pub check_interval_us: Time,
    #[serde(default = "default_memory_warning_threshold")]
    pub memory_warning_threshold: f64,
    /// Hard stop; events after it are dropped. Without it the run ends once
    /// all work has settled.
    #[serde(default)]
    pub end_us: Option<Time>,
    pub machines: Vec<MachineGroup>,
    #[serde(default)]
    pub tasks: Vec<TaskGroup>,
}

impl Scenario {
    /// Parses and validates the YAML file at `path`.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading scenario from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open scenario file: {}", path.display()))?;
        let scenario = Self::from_yaml(&content)
            .with_context(|| format!("Invalid scenario file: {}", path.display()))?;

        info!(
            machines = scenario.machine_specs().len(),
            tasks = scenario.task_specs().len(),
            "scenario loaded"
        );
        Ok(scenario)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let scenario: Scenario = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        scenario.validate()?;
        debug!(?scenario, "scenario parsed");
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<()> {
        if self.machines.iter().all(|g| g.count == 0) {
            bail!("scenario defines no machines");
        }
        if self.check_interval_us == 0 {
            bail!("check_interval_us must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.memory_warning_threshold) {
            bail!(
                "memory_warning_threshold {} is outside [0, 1]",
                self.memory_warning_threshold
            );
        }
        for (i, g) in self.machines.iter().enumerate() {
            if g.spec.memory_mb == 0 || g.spec.cores == 0 {
                bail!("machine group {}: memory_mb and cores must be non-zero", i);
            }
        }
        Ok(())
    }

    /// One spec per machine, in id order.
    pub fn machine_specs(&self) -> Vec<MachineSpec> {
        self.machines
            .iter()
            .flat_map(|g| std::iter::repeat(g.spec.clone()).take(g.count as usize))
            .collect()
    }

    /// One spec per task, ordered by arrival (stable for equal arrivals).
    pub fn task_specs(&self) -> Vec<TaskSpec> {
        let mut specs: Vec<TaskSpec> = self
            .tasks
            .iter()
            .flat_map(|g| {
                (0..g.count).map(move |i| TaskSpec {
                    cpu: g.cpu,
                    vm_type: g.vm,
                    memory_mb: g.memory_mb,
                    sla: g.sla,
                    arrival_us: g
                        .arrival_us
                        .saturating_add(Time::from(i).saturating_mul(g.spacing_us)),
                    runtime_us: g.runtime_us,
                    deadline_us: g
                        .deadline_us
                        .unwrap_or_else(|| default_deadline(g.sla, g.runtime_us)),
                })
            })
            .collect();
        specs.sort_by_key(|t| t.arrival_us);
        specs
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    const SAMPLE: &str = r#"
wake_latency_us: 20000
machines:
  - count: 2
    cpu: x86
    memory_mb: 4096
  - cpu: arm
    memory_mb: 2048
    powered_on: false
tasks:
  - arrival_us: 500
    runtime_us: 1000
    cpu: x86
    vm: linux
    memory_mb: 256
    sla: sla0
    count: 3
    spacing_us: 100
  - arrival_us: 0
    runtime_us: 1000
    cpu: arm
    vm: linux_rt
    memory_mb: 128
    deadline_us: 5000
"#;

    #[test]
    fn load_expands_groups() {
        let f = yaml_tempfile(SAMPLE);
        let s = Scenario::load_from_file(f.path()).unwrap();
        assert_eq!(s.wake_latency_us, 20_000);
        assert_eq!(s.check_interval_us, 100_000);

        let machines = s.machine_specs();
        assert_eq!(machines.len(), 3);
        assert!(machines[0].powered_on);
        assert!(!machines[2].powered_on);
        assert_eq!(machines[2].cpu, CpuType::Arm);
        assert_eq!(machines[0].cores, 8);
    }

    #[test]
    fn tasks_are_sorted_by_arrival_with_derived_deadlines() {
        let s = Scenario::from_yaml(SAMPLE).unwrap();
        let tasks = s.task_specs();
        let arrivals: Vec<Time> = tasks.iter().map(|t| t.arrival_us).collect();
        assert_eq!(arrivals, vec![0, 500, 600, 700]);
        assert_eq!(tasks[0].deadline_us, 5_000);
        assert_eq!(tasks[0].sla, SlaClass::Sla2);
        assert_eq!(tasks[1].deadline_us, 1_200);
    }

    #[test]
    fn huge_spacing_clamps_arrivals() {
        let yaml = "machines:\n  - cpu: x86\n    memory_mb: 1024\ntasks:\n  - arrival_us: 0\n    runtime_us: 1\n    cpu: x86\n    vm: linux\n    memory_mb: 1\n    count: 3\n    spacing_us: 18446744073709551615\n";
        let s = Scenario::from_yaml(yaml).unwrap();
        let arrivals: Vec<Time> = s.task_specs().iter().map(|t| t.arrival_us).collect();
        assert_eq!(arrivals, vec![0, Time::MAX, Time::MAX]);
    }

    #[test]
    fn scenario_without_machines_is_rejected() {
        let err = Scenario::from_yaml("machines: []\n").unwrap_err();
        assert!(format!("{err:#}").contains("no machines"));
    }

    #[test]
    fn unknown_task_key_is_rejected() {
        let yaml = "machines:\n  - cpu: x86\n    memory_mb: 1\ntasks:\n  - arrival_us: 0\n    runtime_us: 1\n    cpu: x86\n    vm: linux\n    memory_mb: 1\n    priority: 3\n";
        assert!(Scenario::from_yaml(yaml).is_err());
    }

    #[test]
    fn missing_file_returns_error() {
        assert!(Scenario::load_from_file(Path::new("/nonexistent/scenario.yaml")).is_err());
    }

    #[test]
    fn best_effort_tasks_never_miss_deadlines() {
        assert_eq!(default_deadline(SlaClass::Sla3, 10), Time::MAX);
        assert_eq!(default_deadline(SlaClass::Sla1, 1_000), 1_500);
    }
}
