/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Core data structures shared by every part of the policy engine.
//!
//! Two kinds of types live here:
//!
//! ```text
//! collaborator ──(TaskRequirements / MachineInfo / VmInfo)──►  engine
//!                  ↑ read-only descriptors                      ↑ owns ClusterState cache
//! ```
//!
//! * Identifiers ([`MachineId`], [`VmId`], [`TaskId`]) are `Copy` newtypes so a
//!   machine id can never be passed where a task id is expected.
//! * Enums ([`CpuType`], [`VmType`], [`SlaClass`], [`PowerState`]) replace the
//!   bare integer constants of the simulator interface.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Simulated time in microseconds.
pub type Time = u64;

// ── Identifiers ───────────────────────────────────────────────────────────────

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<u32> for $name {
            fn from(v: u32) -> Self {
                $name(v)
            }
        }
    };
}

id_type!(
    /// Physical machine identifier, dense from `0` to `machine_count - 1`.
    MachineId,
    "m"
);
id_type!(
    /// Container (VM) identifier, allocated by the collaborator.
    VmId,
    "vm"
);
id_type!(
    /// Task identifier, allocated by the collaborator.
    TaskId,
    "t"
);

// ── CPU and container types ───────────────────────────────────────────────────

/// Instruction-set family of a machine. A task only runs on a matching CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuType {
    Arm,
    Power,
    Riscv,
    X86,
}

impl fmt::Display for CpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CpuType::Arm => "arm",
            CpuType::Power => "power",
            CpuType::Riscv => "riscv",
            CpuType::X86 => "x86",
        };
        f.write_str(s)
    }
}

/// Guest OS flavour of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmType {
    Linux,
    LinuxRt,
    Win,
    Aix,
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmType::Linux => "linux",
            VmType::LinuxRt => "linux_rt",
            VmType::Win => "win",
            VmType::Aix => "aix",
        };
        f.write_str(s)
    }
}

// ── SLA and priority ──────────────────────────────────────────────────────────

/// Service-level class of a task. `Sla0` is the most urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SlaClass {
    Sla0,
    Sla1,
    #[default]
    Sla2,
    /// Best effort: never counted as violated.
    Sla3,
}

impl SlaClass {
    /// Every class, in report order.
    pub const ALL: [SlaClass; 4] = [SlaClass::Sla0, SlaClass::Sla1, SlaClass::Sla2, SlaClass::Sla3];

    /// Position of this class in [`SlaClass::ALL`].
    pub fn index(self) -> usize {
        match self {
            SlaClass::Sla0 => 0,
            SlaClass::Sla1 => 1,
            SlaClass::Sla2 => 2,
            SlaClass::Sla3 => 3,
        }
    }

    /// High-priority tasks may wake a fresh machine instead of sharing a busy one.
    pub fn is_high_priority(self) -> bool {
        self == SlaClass::Sla0
    }

    /// Priority handed to the collaborator when the task is added to a container.
    pub fn task_priority(self) -> TaskPriority {
        match self {
            SlaClass::Sla0 => TaskPriority::High,
            SlaClass::Sla1 => TaskPriority::Mid,
            SlaClass::Sla2 | SlaClass::Sla3 => TaskPriority::Low,
        }
    }
}

impl fmt::Display for SlaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SLA{}", self.index())
    }
}

/// Run-queue priority inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    High,
    Mid,
    Low,
}

// ── Power ─────────────────────────────────────────────────────────────────────

/// Power state of a machine as seen by the engine.
///
/// The collaborator only ever reports `Active`, `WakingUp` or `Off`;
/// `IdlePending` is engine bookkeeping for an active machine whose idle timer
/// is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    Active,
    WakingUp,
    IdlePending,
    Off,
}

impl PowerState {
    /// `true` if tasks can be started on the machine right now.
    pub fn is_running(self) -> bool {
        matches!(self, PowerState::Active | PowerState::IdlePending)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::Active => "active",
            PowerState::WakingUp => "waking_up",
            PowerState::IdlePending => "idle_pending",
            PowerState::Off => "off",
        };
        f.write_str(s)
    }
}

/// Power transition requested from the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCommand {
    PowerOn,
    PowerOff,
}

/// Per-core DVFS level. `P0` is the fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CorePerformance {
    #[default]
    P0,
    P1,
    P2,
    P3,
}

impl CorePerformance {
    pub const MAX: CorePerformance = CorePerformance::P0;
}

// ── Task lifecycle ────────────────────────────────────────────────────────────

/// Where a live task currently sits inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a machine to finish waking up (held by a PendingWake).
    Pending,
    /// Sitting in the deferral queue.
    Deferred,
    /// Running in a container.
    Assigned,
}

// ── Collaborator descriptors ──────────────────────────────────────────────────

/// Placement requirements of a task, queried once on arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequirements {
    pub id: TaskId,
    pub cpu: CpuType,
    pub vm_type: VmType,
    pub memory_mb: u64,
    pub sla: SlaClass,
}

/// Snapshot of one machine as reported by the collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineInfo {
    pub id: MachineId,
    pub cpu: CpuType,
    pub cores: u32,
    /// Per-core throughput at `P0`.
    pub mips: u64,
    pub memory_mb: u64,
    pub memory_used_mb: u64,
    pub power: PowerState,
    pub active_tasks: usize,
    pub active_vms: usize,
}

/// Snapshot of one container as reported by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub id: VmId,
    pub vm_type: VmType,
    pub cpu: CpuType,
    /// `None` until the container is attached.
    pub host: Option<MachineId>,
    pub tasks: Vec<TaskId>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
