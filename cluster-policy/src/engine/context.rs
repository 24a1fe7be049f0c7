/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The single owned bag of engine state.

use std::collections::BTreeMap;

use crate::deferral::DeferralQueue;
use crate::error::InvariantViolation;
use crate::power::WakeBook;
use crate::tracker::ClusterState;
use crate::types::{PowerState, TaskId, TaskRequirements, TaskState, Time};

/// What the engine remembers about a live task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub requirements: TaskRequirements,
    pub state: TaskState,
    pub arrived_at: Time,
    /// Already reported to the collaborator as an SLA violation.
    pub sla_flagged: bool,
}

/// Counters kept for tests and the shutdown log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub arrived: u64,
    pub completed: u64,
    pub placed: u64,
    pub deferred: u64,
    pub provisioned: u64,
    pub joined_wakes: u64,
    pub redeferred_wakes: u64,
    pub offload_attempts: u64,
    pub offload_moves: u64,
    pub forced_violations: u64,
    pub powered_down: u64,
}

/// Tracker, deferral queue, wake book and task table in one place.
///
/// Handlers borrow it mutably for the duration of one event; the decision
/// functions in [`crate::placement`], [`crate::power`] and [`crate::offload`]
/// only ever see shared references to its parts.
#[derive(Debug, Default)]
pub struct ClusterContext {
    pub state: ClusterState,
    pub deferred: DeferralQueue,
    pub wakes: WakeBook,
    pub tasks: BTreeMap<TaskId, TaskRecord>,
    pub stats: EngineStats,
}

impl ClusterContext {
    pub fn new(vm_overhead_mb: u64) -> Self {
        Self {
            state: ClusterState::new(vm_overhead_mb),
            ..Self::default()
        }
    }

    pub fn task(&self, task: TaskId) -> Option<&TaskRecord> {
        self.tasks.get(&task)
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.tasks.get(&task).map(|r| r.state)
    }

    pub(crate) fn set_task_state(&mut self, task: TaskId, state: TaskState) {
        if let Some(r) = self.tasks.get_mut(&task) {
            r.state = state;
        }
    }

    /// Verifies the capacity, single-home and wake invariants.
    ///
    /// Returns the first violation found; machines, containers and tasks are
    /// visited in id order.
    pub fn check_invariants(&self, container_task_limit: usize) -> Result<(), InvariantViolation> {
        for m in self.state.machines() {
            if m.memory_used_mb > m.memory_capacity_mb {
                return Err(InvariantViolation::MemoryExceeded {
                    machine: m.id,
                    used_mb: m.memory_used_mb,
                    capacity_mb: m.memory_capacity_mb,
                });
            }
            let actual = self.state.tasks_on(m.id).len();
            if m.load != actual {
                return Err(InvariantViolation::LoadMismatch {
                    machine: m.id,
                    recorded: m.load,
                    actual,
                });
            }
            if m.idle_since.is_some() && m.load > 0 {
                return Err(InvariantViolation::IdleTimerWithLoad {
                    machine: m.id,
                    load: m.load,
                });
            }
        }

        for vm in self.state.vms() {
            if vm.tasks.len() > container_task_limit {
                return Err(InvariantViolation::ContainerOverLimit {
                    vm: vm.id,
                    tasks: vm.tasks.len(),
                    limit: container_task_limit,
                });
            }
        }

        for w in self.wakes.iter() {
            let waking = self
                .state
                .machine(w.machine)
                .is_some_and(|m| m.power == PowerState::WakingUp);
            if !waking {
                return Err(InvariantViolation::WakeForIdleMachine { machine: w.machine });
            }
        }

        for &task in self.tasks.keys() {
            let deferred = self.deferred.contains(task);
            let assigned = self.state.is_assigned(task);
            let pending = self.wakes.contains_task(task);
            match (deferred, assigned, pending) {
                (true, true, _) => return Err(InvariantViolation::DeferredAndAssigned { task }),
                (_, _, true) if deferred || assigned => {
                    return Err(InvariantViolation::PendingAndPlaced { task })
                }
                (false, false, false) => return Err(InvariantViolation::Orphaned { task }),
                _ => {}
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::PendingWake;
    use crate::tracker::tests::info;
    use crate::types::{CpuType, MachineId, SlaClass, VmId, VmType};

    fn record(id: u32) -> TaskRecord {
        TaskRecord {
            requirements: TaskRequirements {
                id: TaskId(id),
                cpu: CpuType::X86,
                vm_type: VmType::Linux,
                memory_mb: 10,
                sla: SlaClass::Sla2,
            },
            state: TaskState::Deferred,
            arrived_at: 0,
            sla_flagged: false,
        }
    }

    fn ctx() -> ClusterContext {
        let mut c = ClusterContext::new(8);
        c.state
            .register_machine(&info(0, CpuType::X86, 1024, PowerState::Active), 0);
        c.state.add_vm(VmId(0), VmType::Linux, CpuType::X86, MachineId(0));
        c
    }

    #[test]
    fn consistent_context_passes() {
        let mut c = ctx();
        c.tasks.insert(TaskId(1), record(1));
        c.deferred.push_back(TaskId(1));
        c.tasks.insert(TaskId(2), record(2));
        c.state.record_assignment(TaskId(2), 10, VmId(0), MachineId(0));
        assert_eq!(c.check_invariants(16), Ok(()));
    }

    #[test]
    fn deferred_and_assigned_is_reported() {
        let mut c = ctx();
        c.tasks.insert(TaskId(1), record(1));
        c.deferred.push_back(TaskId(1));
        c.state.record_assignment(TaskId(1), 10, VmId(0), MachineId(0));
        assert_eq!(
            c.check_invariants(16),
            Err(InvariantViolation::DeferredAndAssigned { task: TaskId(1) })
        );
    }

    #[test]
    fn orphaned_task_is_reported() {
        let mut c = ctx();
        c.tasks.insert(TaskId(3), record(3));
        assert_eq!(
            c.check_invariants(16),
            Err(InvariantViolation::Orphaned { task: TaskId(3) })
        );
    }

    #[test]
    fn container_limit_is_checked() {
        let mut c = ctx();
        for t in 0..3 {
            c.tasks.insert(TaskId(t), record(t));
            c.state.record_assignment(TaskId(t), 10, VmId(0), MachineId(0));
        }
        assert!(matches!(
            c.check_invariants(2),
            Err(InvariantViolation::ContainerOverLimit { tasks: 3, limit: 2, .. })
        ));
    }

    #[test]
    fn wake_for_running_machine_is_reported() {
        let mut c = ctx();
        c.tasks.insert(TaskId(1), record(1));
        c.wakes.record(PendingWake {
            machine: MachineId(0),
            vm: VmId(5),
            vm_type: VmType::Linux,
            task: TaskId(1),
            memory_mb: 10,
            recorded_at: 0,
        });
        assert_eq!(
            c.check_invariants(16),
            Err(InvariantViolation::WakeForIdleMachine { machine: MachineId(0) })
        );
    }
}
