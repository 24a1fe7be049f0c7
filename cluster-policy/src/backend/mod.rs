/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Outbound command/query surface consumed by the engine.
//!
//! The machine and container state machines, energy metering and SLA
//! accounting all live behind [`ClusterBackend`]. The engine only reads
//! descriptors and issues commands; it never assumes a command took effect
//! until the backend returns `Ok`.
//!
//! [`memory::MemoryCluster`] is an in-process implementation used by the
//! replay driver and the tests.

pub mod memory;

use crate::error::BackendError;
use crate::types::{
    CorePerformance, CpuType, MachineId, MachineInfo, PowerCommand, SlaClass, TaskId,
    TaskPriority, TaskRequirements, VmId, VmInfo, VmType,
};

/// Collaborator owning the physical/virtual machine model.
pub trait ClusterBackend {
    // ── Queries ──────────────────────────────────────────────────────────────

    /// Number of machines; ids are `0..machine_count()`.
    fn machine_count(&self) -> u32;

    fn machine_info(&self, machine: MachineId) -> Result<MachineInfo, BackendError>;

    fn vm_info(&self, vm: VmId) -> Result<VmInfo, BackendError>;

    fn task_requirements(&self, task: TaskId) -> Result<TaskRequirements, BackendError>;

    /// Energy consumed by one machine so far, in kWh.
    fn machine_energy(&self, machine: MachineId) -> f64;

    /// Energy consumed by the whole cluster so far, in kWh.
    fn cluster_energy(&self) -> f64;

    /// Percentage of tasks of `class` whose SLA was violated.
    fn sla_report(&self, class: SlaClass) -> f64;

    // ── Commands ─────────────────────────────────────────────────────────────

    fn create_vm(&mut self, vm_type: VmType, cpu: CpuType) -> Result<VmId, BackendError>;

    fn attach_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), BackendError>;

    fn add_task(
        &mut self,
        vm: VmId,
        task: TaskId,
        priority: TaskPriority,
    ) -> Result<(), BackendError>;

    fn remove_task(&mut self, vm: VmId, task: TaskId) -> Result<(), BackendError>;

    fn shutdown_vm(&mut self, vm: VmId) -> Result<(), BackendError>;

    fn set_power_state(
        &mut self,
        machine: MachineId,
        command: PowerCommand,
    ) -> Result<(), BackendError>;

    fn set_core_performance(
        &mut self,
        machine: MachineId,
        core: u32,
        level: CorePerformance,
    ) -> Result<(), BackendError>;

    /// Mark `task` as violating its SLA regardless of when it completes.
    fn flag_sla_violation(&mut self, task: TaskId);
}
