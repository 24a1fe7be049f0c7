/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! In-memory collaborator: machines, containers, tasks, energy and SLA meters.
//!
//! `MemoryCluster` plays the part of the external simulator for the replay
//! driver and the tests. Overcommitting memory, attaching a container to a
//! machine that is not powered on and powering down a machine that still
//! hosts containers are all refused with a [`BackendError`].
//!
//! Asynchrony is exposed through three outboxes the driver drains after every
//! event: wake requests, task starts and memory warnings.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use super::ClusterBackend;
use crate::config::DEFAULT_VM_MEMORY_OVERHEAD_MB;
use crate::error::BackendError;
use crate::types::{
    CorePerformance, CpuType, MachineId, MachineInfo, PowerCommand, PowerState, SlaClass, TaskId,
    TaskPriority, TaskRequirements, Time, VmId, VmInfo, VmType,
};

/// Memory utilisation above which a memory warning is raised.
pub const DEFAULT_MEMORY_WARNING_THRESHOLD: f64 = 0.95;

const JOULES_PER_KWH: f64 = 3_600_000.0;

// ── Specs ─────────────────────────────────────────────────────────────────────

fn default_cores() -> u32 {
    8
}

fn default_mips() -> u64 {
    1_000
}

fn default_idle_watts() -> f64 {
    120.0
}

fn default_busy_watts() -> f64 {
    300.0
}

fn default_powered_on() -> bool {
    true
}

/// Static description of one machine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MachineSpec {
    pub cpu: CpuType,
    #[serde(default = "default_cores")]
    pub cores: u32,
    pub memory_mb: u64,
    #[serde(default = "default_mips")]
    pub mips: u64,
    #[serde(default = "default_idle_watts")]
    pub idle_watts: f64,
    #[serde(default = "default_busy_watts")]
    pub busy_watts: f64,
    /// Whether the machine is already on at t=0.
    #[serde(default = "default_powered_on")]
    pub powered_on: bool,
}

impl MachineSpec {
    pub fn new(cpu: CpuType, memory_mb: u64) -> Self {
        Self {
            cpu,
            cores: default_cores(),
            memory_mb,
            mips: default_mips(),
            idle_watts: default_idle_watts(),
            busy_watts: default_busy_watts(),
            powered_on: true,
        }
    }

    pub fn powered_off(mut self) -> Self {
        self.powered_on = false;
        self
    }
}

/// Static description of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub cpu: CpuType,
    pub vm_type: VmType,
    pub memory_mb: u64,
    pub sla: SlaClass,
    pub arrival_us: Time,
    pub runtime_us: Time,
    /// Relative to arrival.
    pub deadline_us: Time,
}

/// A task started (or restarted) running; it finishes at `finish_at` unless
/// it is removed first, which bumps its epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStart {
    pub task: TaskId,
    pub epoch: u64,
    pub finish_at: Time,
}

// ── Internal state ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Machine {
    spec: MachineSpec,
    power: PowerState,
    memory_used_mb: u64,
    vms: BTreeSet<VmId>,
    cores: Vec<CorePerformance>,
    energy_joules: f64,
    warned: bool,
}

impl Machine {
    fn running_tasks(&self, vms: &BTreeMap<VmId, Vm>) -> usize {
        self.vms
            .iter()
            .filter_map(|id| vms.get(id))
            .map(|vm| vm.tasks.len())
            .sum()
    }

    fn watts(&self, running: usize) -> f64 {
        match self.power {
            PowerState::Off => 0.0,
            PowerState::WakingUp => self.spec.busy_watts,
            PowerState::Active | PowerState::IdlePending => {
                let util = (running as f64 / self.spec.cores.max(1) as f64).min(1.0);
                let speed = if self.cores.is_empty() {
                    1.0
                } else {
                    self.cores.iter().map(|p| perf_factor(*p)).sum::<f64>() / self.cores.len() as f64
                };
                self.spec.idle_watts + (self.spec.busy_watts - self.spec.idle_watts) * util * speed
            }
        }
    }
}

fn perf_factor(level: CorePerformance) -> f64 {
    match level {
        CorePerformance::P0 => 1.0,
        CorePerformance::P1 => 0.8,
        CorePerformance::P2 => 0.6,
        CorePerformance::P3 => 0.4,
    }
}

#[derive(Debug)]
struct Vm {
    vm_type: VmType,
    cpu: CpuType,
    host: Option<MachineId>,
    tasks: BTreeSet<TaskId>,
}

#[derive(Debug)]
struct TaskEntry {
    spec: TaskSpec,
    vm: Option<VmId>,
    remaining_us: Time,
    run_started: Option<Time>,
    epoch: u64,
    finished: bool,
    violated: bool,
}

// ── MemoryCluster ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MemoryCluster {
    machines: Vec<Machine>,
    vms: BTreeMap<VmId, Vm>,
    tasks: BTreeMap<TaskId, TaskEntry>,
    next_vm: u32,
    now: Time,
    vm_overhead_mb: u64,
    warning_threshold: f64,
    wake_requests: Vec<MachineId>,
    started: Vec<TaskStart>,
    memory_warnings: Vec<MachineId>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            machines: Vec::new(),
            vms: BTreeMap::new(),
            tasks: BTreeMap::new(),
            next_vm: 0,
            now: 0,
            vm_overhead_mb: DEFAULT_VM_MEMORY_OVERHEAD_MB,
            warning_threshold: DEFAULT_MEMORY_WARNING_THRESHOLD,
            wake_requests: Vec::new(),
            started: Vec::new(),
            memory_warnings: Vec::new(),
        }
    }

    pub fn with_vm_overhead(mut self, overhead_mb: u64) -> Self {
        self.vm_overhead_mb = overhead_mb;
        self
    }

    pub fn with_memory_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold;
        self
    }

    pub fn add_machine(&mut self, spec: MachineSpec) -> MachineId {
        let id = MachineId(self.machines.len() as u32);
        let power = if spec.powered_on {
            PowerState::Active
        } else {
            PowerState::Off
        };
        let cores = vec![CorePerformance::P0; spec.cores as usize];
        self.machines.push(Machine {
            spec,
            power,
            memory_used_mb: 0,
            vms: BTreeSet::new(),
            cores,
            energy_joules: 0.0,
            warned: false,
        });
        id
    }

    pub fn register_task(&mut self, id: TaskId, spec: TaskSpec) {
        self.tasks.insert(
            id,
            TaskEntry {
                remaining_us: spec.runtime_us,
                spec,
                vm: None,
                run_started: None,
                epoch: 0,
                finished: false,
                violated: false,
            },
        );
    }

    pub fn now(&self) -> Time {
        self.now
    }

    /// Moves the clock forward, integrating every machine's power draw.
    pub fn advance_to(&mut self, now: Time) {
        if now <= self.now {
            return;
        }
        let dt_s = (now - self.now) as f64 / 1_000_000.0;
        for i in 0..self.machines.len() {
            let running = self.machines[i].running_tasks(&self.vms);
            let watts = self.machines[i].watts(running);
            self.machines[i].energy_joules += watts * dt_s;
        }
        self.now = now;
    }

    /// Completes a wake started by `PowerOn`. Returns `false` if the machine
    /// was not waking up.
    pub fn finish_wake(&mut self, machine: MachineId) -> bool {
        match self.machines.get_mut(machine.0 as usize) {
            Some(m) if m.power == PowerState::WakingUp => {
                m.power = PowerState::Active;
                true
            }
            _ => false,
        }
    }

    pub fn take_wake_requests(&mut self) -> Vec<MachineId> {
        std::mem::take(&mut self.wake_requests)
    }

    pub fn take_started(&mut self) -> Vec<TaskStart> {
        std::mem::take(&mut self.started)
    }

    pub fn take_memory_warnings(&mut self) -> Vec<MachineId> {
        std::mem::take(&mut self.memory_warnings)
    }

    /// `true` if `task` is still running in the run that produced `epoch`.
    pub fn is_running(&self, task: TaskId, epoch: u64) -> bool {
        self.tasks
            .get(&task)
            .is_some_and(|t| t.epoch == epoch && t.vm.is_some() && !t.finished)
    }

    pub fn is_finished(&self, task: TaskId) -> bool {
        self.tasks.get(&task).is_some_and(|t| t.finished)
    }

    pub fn is_violated(&self, task: TaskId) -> bool {
        self.tasks.get(&task).is_some_and(|t| t.violated)
    }

    /// Host machine of a running task.
    pub fn task_host(&self, task: TaskId) -> Option<MachineId> {
        let vm = self.tasks.get(&task)?.vm?;
        self.vms.get(&vm)?.host
    }

    pub fn power_state(&self, machine: MachineId) -> Option<PowerState> {
        self.machines.get(machine.0 as usize).map(|m| m.power)
    }

    pub fn core_performance(&self, machine: MachineId, core: u32) -> Option<CorePerformance> {
        self.machines
            .get(machine.0 as usize)?
            .cores
            .get(core as usize)
            .copied()
    }

    /// Finishes a running task at the current time, recording a violation if
    /// it missed its deadline.
    pub fn complete_task(&mut self, task: TaskId) -> Result<(), BackendError> {
        let vm = self
            .tasks
            .get(&task)
            .ok_or(BackendError::UnknownTask(task))?
            .vm
            .ok_or(BackendError::UnknownTask(task))?;
        self.detach_task(vm, task)?;

        let now = self.now;
        let entry = self
            .tasks
            .get_mut(&task)
            .ok_or(BackendError::UnknownTask(task))?;
        entry.finished = true;
        entry.remaining_us = 0;
        let due = entry.spec.arrival_us.saturating_add(entry.spec.deadline_us);
        if entry.spec.sla != SlaClass::Sla3 && now > due {
            entry.violated = true;
        }
        Ok(())
    }

    /// Live-migrates an attached container, with its running tasks, to
    /// `machine`. Tasks keep running; the engine learns about the move from
    /// `on_migration_complete`.
    pub fn migrate_vm(&mut self, vm_id: VmId, machine: MachineId) -> Result<(), BackendError> {
        let overhead = self.vm_overhead_mb;
        let vm = self.vms.get(&vm_id).ok_or(BackendError::UnknownVm(vm_id))?;
        let from = vm.host.ok_or(BackendError::VmNotAttached { vm: vm_id })?;
        if from == machine {
            return Ok(());
        }
        let vm_cpu = vm.cpu;
        let footprint = vm
            .tasks
            .iter()
            .filter_map(|t| self.tasks.get(t))
            .fold(overhead, |acc, t| acc.saturating_add(t.spec.memory_mb));

        let threshold = self.warning_threshold;
        let target = self.machine_mut(machine)?;
        if !target.power.is_running() {
            return Err(BackendError::MachineNotActive { machine });
        }
        if target.spec.cpu != vm_cpu {
            return Err(BackendError::CpuMismatch {
                vm: vm_id,
                vm_cpu,
                machine,
                machine_cpu: target.spec.cpu,
            });
        }
        let available = target.spec.memory_mb.saturating_sub(target.memory_used_mb);
        if footprint > available {
            return Err(BackendError::VmDoesNotFit {
                vm: vm_id,
                machine,
                required_mb: footprint,
                available_mb: available,
            });
        }
        target.vms.insert(vm_id);
        target.memory_used_mb += footprint;
        let warn = !target.warned && target.memory_used_mb as f64 > threshold * target.spec.memory_mb as f64;
        if warn {
            target.warned = true;
            self.memory_warnings.push(machine);
        }

        let source = self.machine_mut(from)?;
        source.vms.remove(&vm_id);
        source.memory_used_mb = source.memory_used_mb.saturating_sub(footprint);
        if (source.memory_used_mb as f64) < threshold * source.spec.memory_mb as f64 {
            source.warned = false;
        }
        if let Some(vm) = self.vms.get_mut(&vm_id) {
            vm.host = Some(machine);
        }
        Ok(())
    }

    fn machine_mut(&mut self, machine: MachineId) -> Result<&mut Machine, BackendError> {
        self.machines
            .get_mut(machine.0 as usize)
            .ok_or(BackendError::UnknownMachine(machine))
    }

    /// Takes `task` out of `vm`, freeing its memory and banking its progress.
    fn detach_task(&mut self, vm_id: VmId, task: TaskId) -> Result<(), BackendError> {
        let vm = self.vms.get_mut(&vm_id).ok_or(BackendError::UnknownVm(vm_id))?;
        if !vm.tasks.remove(&task) {
            return Err(BackendError::TaskNotInVm { task, vm: vm_id });
        }
        let host = vm.host;
        let now = self.now;

        let entry = self
            .tasks
            .get_mut(&task)
            .ok_or(BackendError::UnknownTask(task))?;
        let memory = entry.spec.memory_mb;
        if let Some(started) = entry.run_started.take() {
            entry.remaining_us = entry.remaining_us.saturating_sub(now - started);
        }
        entry.vm = None;
        entry.epoch += 1;

        if let Some(host) = host {
            let threshold = self.warning_threshold;
            let m = self.machine_mut(host)?;
            m.memory_used_mb = m.memory_used_mb.saturating_sub(memory);
            if (m.memory_used_mb as f64) < threshold * m.spec.memory_mb as f64 {
                m.warned = false;
            }
        }
        Ok(())
    }
}

impl ClusterBackend for MemoryCluster {
    fn machine_count(&self) -> u32 {
        self.machines.len() as u32
    }

    fn machine_info(&self, machine: MachineId) -> Result<MachineInfo, BackendError> {
        let m = self
            .machines
            .get(machine.0 as usize)
            .ok_or(BackendError::UnknownMachine(machine))?;
        Ok(MachineInfo {
            id: machine,
            cpu: m.spec.cpu,
            cores: m.spec.cores,
            mips: m.spec.mips,
            memory_mb: m.spec.memory_mb,
            memory_used_mb: m.memory_used_mb,
            power: m.power,
            active_tasks: m.running_tasks(&self.vms),
            active_vms: m.vms.len(),
        })
    }

    fn vm_info(&self, vm: VmId) -> Result<VmInfo, BackendError> {
        let v = self.vms.get(&vm).ok_or(BackendError::UnknownVm(vm))?;
        Ok(VmInfo {
            id: vm,
            vm_type: v.vm_type,
            cpu: v.cpu,
            host: v.host,
            tasks: v.tasks.iter().copied().collect(),
        })
    }

    fn task_requirements(&self, task: TaskId) -> Result<TaskRequirements, BackendError> {
        let t = self.tasks.get(&task).ok_or(BackendError::UnknownTask(task))?;
        Ok(TaskRequirements {
            id: task,
            cpu: t.spec.cpu,
            vm_type: t.spec.vm_type,
            memory_mb: t.spec.memory_mb,
            sla: t.spec.sla,
        })
    }

    fn machine_energy(&self, machine: MachineId) -> f64 {
        self.machines
            .get(machine.0 as usize)
            .map(|m| m.energy_joules / JOULES_PER_KWH)
            .unwrap_or(0.0)
    }

    fn cluster_energy(&self) -> f64 {
        self.machines.iter().map(|m| m.energy_joules).sum::<f64>() / JOULES_PER_KWH
    }

    fn sla_report(&self, class: SlaClass) -> f64 {
        let (total, violated) = self
            .tasks
            .values()
            .filter(|t| t.spec.sla == class)
            .fold((0usize, 0usize), |(n, v), t| (n + 1, v + usize::from(t.violated)));
        if total == 0 {
            0.0
        } else {
            violated as f64 * 100.0 / total as f64
        }
    }

    fn create_vm(&mut self, vm_type: VmType, cpu: CpuType) -> Result<VmId, BackendError> {
        let id = VmId(self.next_vm);
        self.next_vm += 1;
        self.vms.insert(
            id,
            Vm {
                vm_type,
                cpu,
                host: None,
                tasks: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    fn attach_vm(&mut self, vm_id: VmId, machine: MachineId) -> Result<(), BackendError> {
        let overhead = self.vm_overhead_mb;
        let vm = self.vms.get(&vm_id).ok_or(BackendError::UnknownVm(vm_id))?;
        if let Some(host) = vm.host {
            return Err(BackendError::VmAlreadyAttached { vm: vm_id, machine: host });
        }
        let vm_cpu = vm.cpu;

        let m = self.machine_mut(machine)?;
        if !m.power.is_running() {
            return Err(BackendError::MachineNotActive { machine });
        }
        if m.spec.cpu != vm_cpu {
            return Err(BackendError::CpuMismatch {
                vm: vm_id,
                vm_cpu,
                machine,
                machine_cpu: m.spec.cpu,
            });
        }
        m.vms.insert(vm_id);
        m.memory_used_mb += overhead;

        if let Some(vm) = self.vms.get_mut(&vm_id) {
            vm.host = Some(machine);
        }
        Ok(())
    }

    fn add_task(
        &mut self,
        vm_id: VmId,
        task: TaskId,
        _priority: TaskPriority,
    ) -> Result<(), BackendError> {
        let host = self
            .vms
            .get(&vm_id)
            .ok_or(BackendError::UnknownVm(vm_id))?
            .host
            .ok_or(BackendError::VmNotAttached { vm: vm_id })?;
        let memory = self
            .tasks
            .get(&task)
            .ok_or(BackendError::UnknownTask(task))?
            .spec
            .memory_mb;

        let threshold = self.warning_threshold;
        let m = self.machine_mut(host)?;
        if !m.power.is_running() {
            return Err(BackendError::MachineNotActive { machine: host });
        }
        let available = m.spec.memory_mb.saturating_sub(m.memory_used_mb);
        if memory > available {
            return Err(BackendError::MemoryOvercommit {
                task,
                machine: host,
                required_mb: memory,
                available_mb: available,
            });
        }
        m.memory_used_mb += memory;
        let warn = !m.warned && m.memory_used_mb as f64 > threshold * m.spec.memory_mb as f64;
        if warn {
            m.warned = true;
        }

        if let Some(vm) = self.vms.get_mut(&vm_id) {
            vm.tasks.insert(task);
        }
        let now = self.now;
        if let Some(entry) = self.tasks.get_mut(&task) {
            debug_assert!(entry.vm.is_none(), "task {task} added twice");
            entry.vm = Some(vm_id);
            entry.run_started = Some(now);
            entry.epoch += 1;
            self.started.push(TaskStart {
                task,
                epoch: entry.epoch,
                finish_at: now.saturating_add(entry.remaining_us),
            });
        }
        if warn {
            self.memory_warnings.push(host);
        }
        Ok(())
    }

    fn remove_task(&mut self, vm: VmId, task: TaskId) -> Result<(), BackendError> {
        self.detach_task(vm, task)
    }

    fn shutdown_vm(&mut self, vm_id: VmId) -> Result<(), BackendError> {
        let tasks: Vec<TaskId> = self
            .vms
            .get(&vm_id)
            .ok_or(BackendError::UnknownVm(vm_id))?
            .tasks
            .iter()
            .copied()
            .collect();
        for task in tasks {
            self.detach_task(vm_id, task)?;
        }

        let overhead = self.vm_overhead_mb;
        if let Some(vm) = self.vms.remove(&vm_id) {
            if let Some(host) = vm.host {
                let m = self.machine_mut(host)?;
                m.vms.remove(&vm_id);
                m.memory_used_mb = m.memory_used_mb.saturating_sub(overhead);
            }
        }
        Ok(())
    }

    fn set_power_state(
        &mut self,
        machine: MachineId,
        command: PowerCommand,
    ) -> Result<(), BackendError> {
        let m = self.machine_mut(machine)?;
        match command {
            PowerCommand::PowerOn => {
                if m.power == PowerState::Off {
                    m.power = PowerState::WakingUp;
                    self.wake_requests.push(machine);
                }
            }
            PowerCommand::PowerOff => {
                if !m.vms.is_empty() {
                    return Err(BackendError::MachineBusy { machine });
                }
                m.power = PowerState::Off;
                m.memory_used_mb = 0;
                m.warned = false;
                self.wake_requests.retain(|&id| id != machine);
            }
        }
        Ok(())
    }

    fn set_core_performance(
        &mut self,
        machine: MachineId,
        core: u32,
        level: CorePerformance,
    ) -> Result<(), BackendError> {
        let m = self.machine_mut(machine)?;
        if m.power == PowerState::Off {
            return Err(BackendError::MachineNotActive { machine });
        }
        let slot = m
            .cores
            .get_mut(core as usize)
            .ok_or(BackendError::CoreOutOfRange { machine, core })?;
        *slot = level;
        Ok(())
    }

    fn flag_sla_violation(&mut self, task: TaskId) {
        if let Some(entry) = self.tasks.get_mut(&task) {
            if entry.spec.sla != SlaClass::Sla3 {
                entry.violated = true;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
