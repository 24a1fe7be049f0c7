/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Cluster State Tracker: the engine's authoritative view of machines,
//! containers and task assignments.
//!
//! Every mutation of load, memory and power bookkeeping goes through
//! [`ClusterState`], so the invariants hold in one place:
//!
//! * a task is assigned to at most one container;
//! * a machine's `load` equals the number of tasks assigned to its containers;
//! * a machine's idle timer is set if and only if its load is zero and it is
//!   powered on (`IdlePending`).
//!
//! All maps are `BTreeMap` so iteration, and therefore every placement
//! decision built on it, is deterministic.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::types::{CpuType, MachineId, MachineInfo, PowerState, TaskId, Time, VmId, VmType};

// ── Entries ───────────────────────────────────────────────────────────────────

/// Cached view of one machine.
#[derive(Debug, Clone)]
pub struct MachineEntry {
    pub id: MachineId,
    pub cpu: CpuType,
    pub cores: u32,
    pub mips: u64,
    pub memory_capacity_mb: u64,
    /// Task memory plus container overhead charged by the engine.
    pub memory_used_mb: u64,
    pub power: PowerState,
    /// Set while the machine is `IdlePending`.
    pub idle_since: Option<Time>,
    /// Energy consumed so far (kWh), refreshed on periodic checks.
    pub energy_kwh: f64,
    pub load: usize,
    pub vms: BTreeSet<VmId>,
}

impl MachineEntry {
    pub fn memory_available_mb(&self) -> u64 {
        self.memory_capacity_mb.saturating_sub(self.memory_used_mb)
    }

    /// Fraction of memory in use; `1.0` for a machine with no memory.
    pub fn memory_pressure(&self) -> f64 {
        if self.memory_capacity_mb == 0 {
            1.0
        } else {
            self.memory_used_mb as f64 / self.memory_capacity_mb as f64
        }
    }

    pub fn capacity_mips(&self) -> u64 {
        self.mips.saturating_mul(u64::from(self.cores))
    }
}

/// Cached view of one container.
#[derive(Debug, Clone)]
pub struct VmEntry {
    pub id: VmId,
    pub vm_type: VmType,
    pub cpu: CpuType,
    pub host: MachineId,
    pub tasks: BTreeSet<TaskId>,
}

/// Where a task runs and how much memory it was charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub vm: VmId,
    pub machine: MachineId,
    pub memory_mb: u64,
}

// ── ClusterState ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ClusterState {
    machines: BTreeMap<MachineId, MachineEntry>,
    vms: BTreeMap<VmId, VmEntry>,
    assignments: BTreeMap<TaskId, Assignment>,
    vm_overhead_mb: u64,
}

impl ClusterState {
    pub fn new(vm_overhead_mb: u64) -> Self {
        Self {
            vm_overhead_mb,
            ..Self::default()
        }
    }

    pub fn vm_overhead_mb(&self) -> u64 {
        self.vm_overhead_mb
    }

    /// Starts tracking a machine from its collaborator descriptor.
    ///
    /// A powered-on machine starts `IdlePending` with its timer armed at
    /// `now`, so capacity nobody uses is consolidated after the grace period.
    pub fn register_machine(&mut self, info: &MachineInfo, now: Time) {
        let (power, idle_since) = match info.power {
            PowerState::Active | PowerState::IdlePending => (PowerState::IdlePending, Some(now)),
            other => (other, None),
        };
        self.machines.insert(
            info.id,
            MachineEntry {
                id: info.id,
                cpu: info.cpu,
                cores: info.cores,
                mips: info.mips,
                memory_capacity_mb: info.memory_mb,
                memory_used_mb: 0,
                power,
                idle_since,
                energy_kwh: 0.0,
                load: 0,
                vms: BTreeSet::new(),
            },
        );
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn machine(&self, id: MachineId) -> Option<&MachineEntry> {
        self.machines.get(&id)
    }

    pub fn machines(&self) -> impl Iterator<Item = &MachineEntry> {
        self.machines.values()
    }

    pub fn vm(&self, id: VmId) -> Option<&VmEntry> {
        self.vms.get(&id)
    }

    pub fn vms(&self) -> impl Iterator<Item = &VmEntry> {
        self.vms.values()
    }

    /// Number of tasks running on `machine`; `0` for unknown machines.
    pub fn load(&self, machine: MachineId) -> usize {
        self.machines.get(&machine).map_or(0, |m| m.load)
    }

    /// Free memory on `machine` in MB; `0` for unknown machines.
    pub fn memory_available(&self, machine: MachineId) -> u64 {
        self.machines
            .get(&machine)
            .map_or(0, MachineEntry::memory_available_mb)
    }

    pub fn containers_on(&self, machine: MachineId) -> Vec<VmId> {
        self.machines
            .get(&machine)
            .map(|m| m.vms.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn assignment(&self, task: TaskId) -> Option<&Assignment> {
        self.assignments.get(&task)
    }

    pub fn is_assigned(&self, task: TaskId) -> bool {
        self.assignments.contains_key(&task)
    }

    pub fn assignments(&self) -> impl Iterator<Item = (&TaskId, &Assignment)> {
        self.assignments.iter()
    }

    /// Tasks running on `machine` with the memory each was charged.
    pub fn tasks_on(&self, machine: MachineId) -> Vec<(TaskId, Assignment)> {
        self.assignments
            .iter()
            .filter(|(_, a)| a.machine == machine)
            .map(|(t, a)| (*t, *a))
            .collect()
    }

    /// `true` if at least one tracked machine has `cpu`, whatever its power state.
    pub fn has_cpu_type(&self, cpu: CpuType) -> bool {
        self.machines.values().any(|m| m.cpu == cpu)
    }

    // ── Containers ───────────────────────────────────────────────────────────

    /// Records a container attached to `host`, charging its memory overhead.
    pub fn add_vm(&mut self, vm: VmId, vm_type: VmType, cpu: CpuType, host: MachineId) {
        let Some(machine) = self.machines.get_mut(&host) else {
            warn!(vm = %vm, machine = %host, "container attached to untracked machine, ignored");
            return;
        };
        machine.vms.insert(vm);
        machine.memory_used_mb += self.vm_overhead_mb;
        self.vms.insert(
            vm,
            VmEntry {
                id: vm,
                vm_type,
                cpu,
                host,
                tasks: BTreeSet::new(),
            },
        );
        debug!(vm = %vm, machine = %host, "container tracked");
    }

    /// Stops tracking a container. Tasks still recorded on it are released.
    pub fn remove_vm(&mut self, vm: VmId, now: Time) -> Option<VmEntry> {
        let tasks: Vec<TaskId> = self.vms.get(&vm)?.tasks.iter().copied().collect();
        if !tasks.is_empty() {
            warn!(vm = %vm, tasks = tasks.len(), "removing container that still has tasks");
            for task in tasks {
                self.release(task, now);
            }
        }
        let entry = self.vms.remove(&vm)?;
        if let Some(machine) = self.machines.get_mut(&entry.host) {
            machine.vms.remove(&vm);
            machine.memory_used_mb = machine.memory_used_mb.saturating_sub(self.vm_overhead_mb);
        }
        Some(entry)
    }

    /// Moves a container to `new_host` after a migration, carrying its tasks'
    /// load and memory with it.
    pub fn rehost_vm(&mut self, vm: VmId, new_host: MachineId, now: Time) -> bool {
        if !self.machines.contains_key(&new_host) {
            return false;
        }
        let Some(entry) = self.vms.get_mut(&vm) else {
            return false;
        };
        let old_host = entry.host;
        if old_host == new_host {
            return true;
        }
        entry.host = new_host;
        let tasks: Vec<TaskId> = entry.tasks.iter().copied().collect();

        let mut moved_memory = self.vm_overhead_mb;
        for task in &tasks {
            if let Some(a) = self.assignments.get_mut(task) {
                a.machine = new_host;
                moved_memory += a.memory_mb;
            }
        }

        if let Some(old) = self.machines.get_mut(&old_host) {
            old.vms.remove(&vm);
            old.memory_used_mb = old.memory_used_mb.saturating_sub(moved_memory);
            old.load = old.load.saturating_sub(tasks.len());
            if old.load == 0 && old.power.is_running() {
                old.power = PowerState::IdlePending;
                old.idle_since = Some(now);
            }
        }
        if let Some(new) = self.machines.get_mut(&new_host) {
            new.vms.insert(vm);
            new.memory_used_mb += moved_memory;
            new.load += tasks.len();
            if new.load > 0 && new.power == PowerState::IdlePending {
                new.power = PowerState::Active;
                new.idle_since = None;
            }
        }
        true
    }

    // ── Assignments ──────────────────────────────────────────────────────────

    /// Records `task` running in `vm` on `machine`.
    ///
    /// Clears the machine's idle timer (abort-idle). Returns `false` and
    /// changes nothing if the task is already assigned or the container is
    /// unknown.
    pub fn record_assignment(
        &mut self,
        task: TaskId,
        memory_mb: u64,
        vm: VmId,
        machine: MachineId,
    ) -> bool {
        if let Some(existing) = self.assignments.get(&task) {
            warn!(task = %task, vm = %existing.vm, "task already assigned, ignoring second assignment");
            return false;
        }
        let Some(vm_entry) = self.vms.get_mut(&vm) else {
            warn!(task = %task, vm = %vm, "assignment to untracked container, ignored");
            return false;
        };
        vm_entry.tasks.insert(task);

        if let Some(m) = self.machines.get_mut(&machine) {
            m.load += 1;
            m.memory_used_mb += memory_mb;
            if m.idle_since.take().is_some() {
                debug!(machine = %machine, task = %task, "idle timer cleared by assignment");
            }
            if m.power == PowerState::IdlePending {
                m.power = PowerState::Active;
            }
        }

        self.assignments.insert(
            task,
            Assignment {
                vm,
                machine,
                memory_mb,
            },
        );
        true
    }

    /// Records that `task` finished. A task the tracker never saw is logged
    /// and ignored.
    pub fn record_completion(&mut self, task: TaskId, now: Time) -> Option<Assignment> {
        let released = self.release(task, now);
        if released.is_none() {
            warn!(task = %task, "completion for untracked task, ignored");
        }
        released
    }

    /// Removes `task`'s assignment, arming the host's idle timer if its load
    /// drops to zero.
    pub fn release(&mut self, task: TaskId, now: Time) -> Option<Assignment> {
        let a = self.assignments.remove(&task)?;
        if let Some(vm) = self.vms.get_mut(&a.vm) {
            vm.tasks.remove(&task);
        }
        if let Some(m) = self.machines.get_mut(&a.machine) {
            m.load = m.load.saturating_sub(1);
            m.memory_used_mb = m.memory_used_mb.saturating_sub(a.memory_mb);
            if m.load == 0 && m.power.is_running() {
                m.power = PowerState::IdlePending;
                m.idle_since = Some(now);
                debug!(machine = %a.machine, at = now, "idle timer armed");
            }
        }
        Some(a)
    }

    // ── Power bookkeeping ────────────────────────────────────────────────────

    /// Sets the power state, keeping the idle timer consistent with it.
    pub fn set_power(&mut self, machine: MachineId, power: PowerState, now: Time) {
        let Some(m) = self.machines.get_mut(&machine) else {
            return;
        };
        match power {
            PowerState::Active | PowerState::IdlePending if m.load == 0 => {
                m.power = PowerState::IdlePending;
                m.idle_since = Some(now);
            }
            PowerState::Active | PowerState::IdlePending => {
                m.power = PowerState::Active;
                m.idle_since = None;
            }
            PowerState::WakingUp | PowerState::Off => {
                m.power = power;
                m.idle_since = None;
            }
        }
    }

    /// Aborts an idle countdown without changing load.
    pub fn cancel_idle(&mut self, machine: MachineId) {
        if let Some(m) = self.machines.get_mut(&machine) {
            m.idle_since = None;
            if m.power == PowerState::IdlePending {
                m.power = PowerState::Active;
            }
        }
    }

    pub fn set_energy(&mut self, machine: MachineId, energy_kwh: f64) {
        if let Some(m) = self.machines.get_mut(&machine) {
            m.energy_kwh = energy_kwh;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn info(id: u32, cpu: CpuType, memory_mb: u64, power: PowerState) -> MachineInfo {
        MachineInfo {
            id: MachineId(id),
            cpu,
            cores: 8,
            mips: 1_000,
            memory_mb,
            memory_used_mb: 0,
            power,
            active_tasks: 0,
            active_vms: 0,
        }
    }

    fn state_with_vm() -> ClusterState {
        let mut s = ClusterState::new(8);
        s.register_machine(&info(0, CpuType::X86, 1024, PowerState::Active), 0);
        s.add_vm(VmId(0), VmType::Linux, CpuType::X86, MachineId(0));
        s
    }

    #[test]
    fn powered_machines_start_idle_pending() {
        let mut s = ClusterState::new(8);
        s.register_machine(&info(0, CpuType::X86, 1024, PowerState::Active), 5);
        s.register_machine(&info(1, CpuType::X86, 1024, PowerState::Off), 5);
        let on = s.machine(MachineId(0)).unwrap();
        assert_eq!(on.power, PowerState::IdlePending);
        assert_eq!(on.idle_since, Some(5));
        let off = s.machine(MachineId(1)).unwrap();
        assert_eq!(off.power, PowerState::Off);
        assert_eq!(off.idle_since, None);
    }

    #[test]
    fn container_overhead_counts_against_memory() {
        let s = state_with_vm();
        assert_eq!(s.memory_available(MachineId(0)), 1016);
        assert_eq!(s.containers_on(MachineId(0)), vec![VmId(0)]);
    }

    #[test]
    fn assignment_updates_load_memory_and_clears_idle_timer() {
        let mut s = state_with_vm();
        assert!(s.record_assignment(TaskId(1), 100, VmId(0), MachineId(0)));

        let m = s.machine(MachineId(0)).unwrap();
        assert_eq!(m.load, 1);
        assert_eq!(m.memory_used_mb, 108);
        assert_eq!(m.power, PowerState::Active);
        assert_eq!(m.idle_since, None);
        assert!(s.vm(VmId(0)).unwrap().tasks.contains(&TaskId(1)));
    }

    #[test]
    fn double_assignment_is_rejected() {
        let mut s = state_with_vm();
        assert!(s.record_assignment(TaskId(1), 100, VmId(0), MachineId(0)));
        assert!(!s.record_assignment(TaskId(1), 100, VmId(0), MachineId(0)));
        assert_eq!(s.load(MachineId(0)), 1);
    }

    #[test]
    fn completion_of_last_task_arms_idle_timer() {
        let mut s = state_with_vm();
        s.record_assignment(TaskId(1), 100, VmId(0), MachineId(0));
        s.record_assignment(TaskId(2), 50, VmId(0), MachineId(0));

        s.record_completion(TaskId(1), 40);
        assert_eq!(s.machine(MachineId(0)).unwrap().idle_since, None);

        let a = s.record_completion(TaskId(2), 90).unwrap();
        assert_eq!(a.memory_mb, 50);
        let m = s.machine(MachineId(0)).unwrap();
        assert_eq!(m.load, 0);
        assert_eq!(m.memory_used_mb, 8);
        assert_eq!(m.power, PowerState::IdlePending);
        assert_eq!(m.idle_since, Some(90));
    }

    #[test]
    fn stale_completion_is_a_no_op() {
        let mut s = state_with_vm();
        assert!(s.record_completion(TaskId(42), 10).is_none());
        assert_eq!(s.load(MachineId(0)), 0);
    }

    #[test]
    fn unknown_machine_queries_return_zero() {
        let s = ClusterState::new(8);
        assert_eq!(s.load(MachineId(9)), 0);
        assert_eq!(s.memory_available(MachineId(9)), 0);
        assert!(s.containers_on(MachineId(9)).is_empty());
    }

    #[test]
    fn remove_vm_refunds_overhead() {
        let mut s = state_with_vm();
        assert!(s.remove_vm(VmId(0), 0).is_some());
        assert_eq!(s.memory_available(MachineId(0)), 1024);
        assert!(s.vm(VmId(0)).is_none());
    }

    #[test]
    fn rehost_moves_load_and_memory() {
        let mut s = state_with_vm();
        s.register_machine(&info(1, CpuType::X86, 1024, PowerState::Active), 0);
        s.record_assignment(TaskId(1), 100, VmId(0), MachineId(0));

        assert!(s.rehost_vm(VmId(0), MachineId(1), 70));

        let old = s.machine(MachineId(0)).unwrap();
        assert_eq!((old.load, old.memory_used_mb), (0, 0));
        assert_eq!(old.idle_since, Some(70));
        let new = s.machine(MachineId(1)).unwrap();
        assert_eq!((new.load, new.memory_used_mb), (1, 108));
        assert_eq!(new.power, PowerState::Active);
        assert_eq!(s.assignment(TaskId(1)).unwrap().machine, MachineId(1));
    }

    #[test]
    fn set_power_keeps_timer_consistent() {
        let mut s = ClusterState::new(8);
        s.register_machine(&info(0, CpuType::Arm, 512, PowerState::Off), 0);
        s.set_power(MachineId(0), PowerState::WakingUp, 10);
        assert_eq!(s.machine(MachineId(0)).unwrap().idle_since, None);
        s.set_power(MachineId(0), PowerState::Active, 20);
        let m = s.machine(MachineId(0)).unwrap();
        assert_eq!(m.power, PowerState::IdlePending);
        assert_eq!(m.idle_since, Some(20));
    }
}
