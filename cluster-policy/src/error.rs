/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for the policy engine.
//!
//! Four types model the four failure layers:
//!
//! * [`PlacementFailure`]: why a single task could not be placed right now
//!   (carried inside [`PlacementOutcome`](crate::engine::PlacementOutcome),
//!   never raised).
//! * [`BackendError`]: a collaborator query or command was refused.
//! * [`EngineError`]: invalid configuration handed to the engine.
//! * [`InvariantViolation`]: a consistency check on the cluster context
//!   failed (tests and debug tooling only).
//!
//! Event handlers never propagate any of these: a refused command is logged
//! and the task falls back to the deferral queue so the event loop keeps
//! running.

use thiserror::Error;

use crate::types::{CpuType, MachineId, TaskId, VmId};

// ── Placement ─────────────────────────────────────────────────────────────────

/// Reason a task was not placed during one placement call.
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementFailure {
    /// No machine in the whole cluster has the required CPU type.
    ///
    /// Permanent: the task stays deferred and is reported as an SLA violation.
    NoCompatibleMachine { cpu: CpuType },

    /// Compatible machines exist but none has room for the task right now.
    InsufficientCapacity { required_mb: u64, largest_free_mb: u64 },

    /// Offloading other tasks did not make room within the attempt budget.
    OffloadExhausted { attempts: u32 },

    /// The collaborator refused a command while committing the decision.
    CommandRejected(BackendError),
}

impl PlacementFailure {
    /// `true` for failures that are reported as forced SLA violations.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PlacementFailure::NoCompatibleMachine { .. } | PlacementFailure::OffloadExhausted { .. }
        )
    }
}

impl std::fmt::Display for PlacementFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementFailure::NoCompatibleMachine { cpu } => {
                write!(f, "no machine in the cluster has CPU type {}", cpu)
            }

            PlacementFailure::InsufficientCapacity {
                required_mb,
                largest_free_mb,
            } => write!(
                f,
                "task requires {}MB but the largest compatible free slot is {}MB",
                required_mb, largest_free_mb
            ),

            PlacementFailure::OffloadExhausted { attempts } => write!(
                f,
                "offload made no room after {} attempt(s)",
                attempts
            ),

            PlacementFailure::CommandRejected(e) => write!(f, "command rejected: {}", e),
        }
    }
}

// ── Collaborator ──────────────────────────────────────────────────────────────

/// Error returned by a [`ClusterBackend`](crate::backend::ClusterBackend)
/// query or command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("unknown machine {0}")]
    UnknownMachine(MachineId),

    #[error("unknown container {0}")]
    UnknownVm(VmId),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("machine {machine} is not powered on")]
    MachineNotActive { machine: MachineId },

    #[error("machine {machine} still hosts containers")]
    MachineBusy { machine: MachineId },

    #[error("container {vm} is not attached to any machine")]
    VmNotAttached { vm: VmId },

    #[error("container {vm} is already attached to machine {machine}")]
    VmAlreadyAttached { vm: VmId, machine: MachineId },

    #[error("container {vm} ({vm_cpu}) cannot run on machine {machine} ({machine_cpu})")]
    CpuMismatch {
        vm: VmId,
        vm_cpu: CpuType,
        machine: MachineId,
        machine_cpu: CpuType,
    },

    #[error("task {task} needs {required_mb}MB but machine {machine} has {available_mb}MB free")]
    MemoryOvercommit {
        task: TaskId,
        machine: MachineId,
        required_mb: u64,
        available_mb: u64,
    },

    #[error("container {vm} needs {required_mb}MB but machine {machine} has {available_mb}MB free")]
    VmDoesNotFit {
        vm: VmId,
        machine: MachineId,
        required_mb: u64,
        available_mb: u64,
    },

    #[error("task {task} is not running in container {vm}")]
    TaskNotInVm { task: TaskId, vm: VmId },

    #[error("core {core} does not exist on machine {machine}")]
    CoreOutOfRange { machine: MachineId, core: u32 },
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Invalid engine configuration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The strategy name is not recognised.
    #[error("unknown placement strategy: '{0}' (valid: least_loaded, energy_aware_bin_pack, high_performance_first, adaptive_idle_consolidation)")]
    UnknownStrategy(String),

    /// A numeric setting is out of range.
    #[error("invalid value for '{field}': {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

// ── Consistency checks ────────────────────────────────────────────────────────

/// A broken invariant detected by
/// [`ClusterContext::check_invariants`](crate::engine::ClusterContext::check_invariants).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("machine {machine} uses {used_mb}MB of {capacity_mb}MB")]
    MemoryExceeded {
        machine: MachineId,
        used_mb: u64,
        capacity_mb: u64,
    },

    #[error("container {vm} holds {tasks} tasks (limit {limit})")]
    ContainerOverLimit { vm: VmId, tasks: usize, limit: usize },

    #[error("task {task} is both deferred and assigned")]
    DeferredAndAssigned { task: TaskId },

    #[error("task {task} is held by a pending wake but is also deferred or assigned")]
    PendingAndPlaced { task: TaskId },

    #[error("live task {task} is neither deferred, pending nor assigned")]
    Orphaned { task: TaskId },

    #[error("pending wake references machine {machine} which is not waking up")]
    WakeForIdleMachine { machine: MachineId },

    #[error("machine {machine} has an idle timer but load {load}")]
    IdleTimerWithLoad { machine: MachineId, load: usize },

    #[error("machine {machine} load {recorded} does not match {actual} assigned tasks")]
    LoadMismatch {
        machine: MachineId,
        recorded: usize,
        actual: usize,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_failure_mentions_both_sizes() {
        let msg = PlacementFailure::InsufficientCapacity {
            required_mb: 9000,
            largest_free_mb: 4096,
        }
        .to_string();
        assert!(msg.contains("9000MB"), "{msg}");
        assert!(msg.contains("4096MB"), "{msg}");
    }

    #[test]
    fn only_unreachable_and_exhausted_are_permanent() {
        assert!(PlacementFailure::NoCompatibleMachine { cpu: CpuType::Arm }.is_permanent());
        assert!(PlacementFailure::OffloadExhausted { attempts: 3 }.is_permanent());
        assert!(!PlacementFailure::InsufficientCapacity {
            required_mb: 1,
            largest_free_mb: 0
        }
        .is_permanent());
        assert!(
            !PlacementFailure::CommandRejected(BackendError::UnknownVm(VmId(1))).is_permanent()
        );
    }

    #[test]
    fn backend_error_formats_ids() {
        let e = BackendError::MemoryOvercommit {
            task: TaskId(4),
            machine: MachineId(2),
            required_mb: 512,
            available_mb: 100,
        };
        assert_eq!(
            e.to_string(),
            "task t4 needs 512MB but machine m2 has 100MB free"
        );
    }
}
