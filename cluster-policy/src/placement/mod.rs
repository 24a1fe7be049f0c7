/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Placement Policy: where a task should run.
//!
//! [`decide`] is a pure function of the tracker, the wake book and the
//! selected [`PlacementPolicy`]; it never issues commands. The engine commits
//! the returned [`Decision`] against the collaborator.
//!
//! # Algorithm
//!
//! 1. Keep machines whose CPU type matches the task (minus an optional
//!    machines excluded during offload: every origin already tried).
//! 2. Drop machines where `used + overhead + task` would exceed capacity.
//!    Joining an existing container skips the overhead term.
//! 3. Among running machines: a container with zero tasks is taken first,
//!    otherwise the best machine by [`PlacementPolicy::rank_active`], reusing
//!    one of its containers or opening a new one.
//! 4. Otherwise join a machine that is already waking up, then provision a
//!    powered-off machine ranked by [`PlacementPolicy::rank_offline`].
//! 5. With no machine of the CPU type at all the result is
//!    [`Decision::NoCompatibleMachine`].
//!
//! A high-priority task (or a strategy that
//! [prefers fresh machines](PlacementPolicy::prefers_fresh_machine)) first
//! looks for an empty running machine or a powered-off one before sharing a
//! busy machine.

pub mod strategy;

pub use strategy::{
    policies, AdaptiveIdleConsolidation, EnergyAwareBinPack, HighPerformanceFirst, LeastLoaded,
};

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::config::EngineConfig;
use crate::power::WakeBook;
use crate::tracker::{ClusterState, MachineEntry, VmEntry};
use crate::types::{MachineId, PowerState, TaskRequirements, VmId};

// ── Policy interface ──────────────────────────────────────────────────────────

/// Placement half of a strategy pair.
///
/// Orderings return `Less` when `a` is the better candidate. Implementations
/// must end with a tie-break on machine id so decisions are deterministic.
pub trait PlacementPolicy {
    fn name(&self) -> &'static str;

    /// Ranks two running machines that can both take the task.
    fn rank_active(&self, a: &MachineEntry, b: &MachineEntry) -> Ordering;

    /// Ranks two powered-off machines as provisioning targets.
    fn rank_offline(&self, a: &MachineEntry, b: &MachineEntry) -> Ordering {
        a.id.cmp(&b.id)
    }

    /// Start a fresh machine for every task instead of sharing busy ones.
    fn prefers_fresh_machine(&self) -> bool {
        false
    }

    /// Give an empty container its first task before ranking machines.
    fn prefers_idle_container(&self) -> bool {
        true
    }
}

// ── Decision ──────────────────────────────────────────────────────────────────

/// One placement request.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub task: &'a TaskRequirements,
    /// Machines that must not be chosen (offload origins).
    pub exclude: Option<&'a BTreeSet<MachineId>>,
    /// Whether waking machines may be joined and powered-off ones woken.
    pub allow_provision: bool,
}

impl<'a> Request<'a> {
    pub fn new(task: &'a TaskRequirements) -> Self {
        Self {
            task,
            exclude: None,
            allow_provision: true,
        }
    }

    /// Re-placement of a task moved off an offload origin: running machines
    /// outside `origins` only.
    pub fn relocation(task: &'a TaskRequirements, origins: &'a BTreeSet<MachineId>) -> Self {
        Self {
            task,
            exclude: Some(origins),
            allow_provision: false,
        }
    }

    fn excludes(&self, machine: MachineId) -> bool {
        self.exclude.is_some_and(|set| set.contains(&machine))
    }
}

/// What the engine should do with the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Add the task to an existing, attached container.
    Reuse { vm: VmId, machine: MachineId },
    /// Create a container on a running machine and add the task to it.
    NewContainer { machine: MachineId },
    /// The machine is already waking up; park the task behind it, sharing
    /// `vm` when a pending container has room.
    JoinWake { machine: MachineId, vm: Option<VmId> },
    /// Wake a powered-off machine.
    Provision { machine: MachineId },
    /// Compatible machines exist but none can take the task right now.
    NoCapacity { largest_free_mb: u64 },
    /// No machine in the cluster has the task's CPU type.
    NoCompatibleMachine,
}

impl Decision {
    /// `true` for decisions that place the task on a running machine.
    pub fn is_immediate(&self) -> bool {
        matches!(self, Decision::Reuse { .. } | Decision::NewContainer { .. })
    }
}

// ── decide ────────────────────────────────────────────────────────────────────

/// Chooses a target for `req` without touching any state.
pub fn decide(
    state: &ClusterState,
    wakes: &WakeBook,
    policy: &dyn PlacementPolicy,
    config: &EngineConfig,
    req: Request<'_>,
) -> Decision {
    let task = req.task;
    if !state.has_cpu_type(task.cpu) {
        return Decision::NoCompatibleMachine;
    }

    let candidates: Vec<&MachineEntry> = state
        .machines()
        .filter(|m| m.cpu == task.cpu && !req.excludes(m.id))
        .collect();
    let running: Vec<&MachineEntry> = candidates
        .iter()
        .copied()
        .filter(|m| m.power.is_running())
        .collect();

    // An empty container is never "busy", whatever the strategy.
    if policy.prefers_idle_container() {
        if let Some(d) = idle_container(state, &running, policy, config, task) {
            return d;
        }
    }

    let fresh_first = policy.prefers_fresh_machine()
        || (config.high_priority_provisioning && task.sla.is_high_priority());
    if fresh_first {
        let empty: Vec<&MachineEntry> = running.iter().copied().filter(|m| m.load == 0).collect();
        if let Some(d) = best_running(state, &empty, policy, config, task) {
            return d;
        }
        if req.allow_provision {
            if let Some(d) = best_offline(state, &candidates, policy, task) {
                return d;
            }
        }
    }

    if let Some(d) = best_running(state, &running, policy, config, task) {
        return d;
    }

    if req.allow_provision {
        if let Some(d) = join_waking(state, wakes, &candidates, config, task) {
            return d;
        }
        if let Some(d) = best_offline(state, &candidates, policy, task) {
            return d;
        }
    }

    let largest_free_mb = candidates
        .iter()
        .map(|m| match m.power {
            PowerState::Off => m.memory_capacity_mb,
            PowerState::WakingUp => m
                .memory_available_mb()
                .saturating_sub(wakes.reserved_memory(m.id, state.vm_overhead_mb())),
            _ => m.memory_available_mb(),
        })
        .max()
        .unwrap_or(0);
    Decision::NoCapacity { largest_free_mb }
}

/// A container of the right kind on `machine` that can take one more task.
fn reusable_container<'s>(
    state: &'s ClusterState,
    machine: &MachineEntry,
    config: &EngineConfig,
    task: &TaskRequirements,
) -> Option<&'s VmEntry> {
    if machine.memory_used_mb.saturating_add(task.memory_mb) > machine.memory_capacity_mb {
        return None;
    }
    machine
        .vms
        .iter()
        .filter_map(|id| state.vm(*id))
        .filter(|vm| vm.vm_type == task.vm_type && vm.cpu == task.cpu)
        .filter(|vm| vm.tasks.len() < config.container_task_limit)
        .min_by_key(|vm| (vm.tasks.len(), vm.id))
}

fn fits_new_container(state: &ClusterState, machine: &MachineEntry, task: &TaskRequirements) -> bool {
    machine
        .memory_used_mb
        .saturating_add(state.vm_overhead_mb())
        .saturating_add(task.memory_mb)
        <= machine.memory_capacity_mb
}

/// Where `task` would go on `machine` if it fits there at all.
pub fn fit_on(
    state: &ClusterState,
    machine: &MachineEntry,
    config: &EngineConfig,
    task: &TaskRequirements,
) -> Option<Decision> {
    if !machine.power.is_running() || machine.cpu != task.cpu {
        return None;
    }
    if let Some(vm) = reusable_container(state, machine, config, task) {
        return Some(Decision::Reuse {
            vm: vm.id,
            machine: machine.id,
        });
    }
    fits_new_container(state, machine, task).then_some(Decision::NewContainer {
        machine: machine.id,
    })
}

fn idle_container(
    state: &ClusterState,
    running: &[&MachineEntry],
    policy: &dyn PlacementPolicy,
    config: &EngineConfig,
    task: &TaskRequirements,
) -> Option<Decision> {
    running
        .iter()
        .filter_map(|m| {
            let vm = reusable_container(state, m, config, task)?;
            vm.tasks.is_empty().then_some((*m, vm.id))
        })
        .min_by(|(a, _), (b, _)| policy.rank_active(a, b))
        .map(|(m, vm)| Decision::Reuse { vm, machine: m.id })
}

fn best_running(
    state: &ClusterState,
    running: &[&MachineEntry],
    policy: &dyn PlacementPolicy,
    config: &EngineConfig,
    task: &TaskRequirements,
) -> Option<Decision> {
    running
        .iter()
        .filter_map(|m| fit_on(state, m, config, task).map(|d| (*m, d)))
        .min_by(|(a, _), (b, _)| policy.rank_active(a, b))
        .map(|(_, d)| d)
}

fn join_waking(
    state: &ClusterState,
    wakes: &WakeBook,
    candidates: &[&MachineEntry],
    config: &EngineConfig,
    task: &TaskRequirements,
) -> Option<Decision> {
    let overhead = state.vm_overhead_mb();
    candidates
        .iter()
        .filter(|m| m.power == PowerState::WakingUp)
        .find_map(|m| {
            let reserved = m.memory_used_mb + wakes.reserved_memory(m.id, overhead);
            let vm = wakes.joinable_vm(m.id, task.vm_type, config.container_task_limit);
            let extra = if vm.is_some() { 0 } else { overhead };
            (reserved.saturating_add(extra).saturating_add(task.memory_mb) <= m.memory_capacity_mb)
                .then_some(Decision::JoinWake { machine: m.id, vm })
        })
}

fn best_offline(
    state: &ClusterState,
    candidates: &[&MachineEntry],
    policy: &dyn PlacementPolicy,
    task: &TaskRequirements,
) -> Option<Decision> {
    candidates
        .iter()
        .filter(|m| m.power == PowerState::Off)
        .filter(|m| state.vm_overhead_mb().saturating_add(task.memory_mb) <= m.memory_capacity_mb)
        .min_by(|a, b| policy.rank_offline(a, b))
        .map(|m| Decision::Provision { machine: m.id })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
