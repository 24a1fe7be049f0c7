/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Event-driven policy engine.
//!
//! [`Scheduler`] owns the [`ClusterContext`], the selected strategy pair and
//! the collaborator, and exposes one method per inbound event. Handlers run
//! to completion, never return errors and never panic on collaborator
//! refusals: a refused command is logged and the affected task falls back to
//! the deferral queue.
//!
//! ```text
//!  on_new_task ──► place ──► decide ──► Reuse / NewContainer ──► Assigned
//!                    │                  JoinWake / Provision ──► ProvisionPending
//!                    │                  NoCapacity ──► offload (≤ N attempts)
//!                    │                  NoCompatibleMachine ──► Failed
//!                    └──► Deferred / Failed ──► DeferralQueue
//!
//!  on_task_complete / on_migration_complete ──► drain deferral queue
//!  on_machine_ready ──► drain wake records ──► same-CPU deferred ──► drain
//!  on_periodic_check ──► energy cache, missed wakes, drain, idle power-down
//! ```

pub mod context;
pub mod summary;

pub use context::{ClusterContext, EngineStats, TaskRecord};
pub use summary::Summary;

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::backend::ClusterBackend;
use crate::config::EngineConfig;
use crate::error::{BackendError, EngineError, InvariantViolation, PlacementFailure};
use crate::offload;
use crate::placement::{self, Decision, PlacementPolicy, Request};
use crate::power::{self, PendingWake, PowerPolicy};
use crate::types::{
    CorePerformance, CpuType, MachineId, PowerCommand, PowerState, SlaClass, TaskId,
    TaskRequirements, TaskState, Time, VmId,
};

// ── Placement result ──────────────────────────────────────────────────────────

/// Result of one placement call.
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementOutcome {
    /// Running in `vm` on `machine`.
    Assigned { vm: VmId, machine: MachineId },
    /// Parked behind the wake-up of `machine`; `vm` is attached when it is
    /// ready.
    ProvisionPending { machine: MachineId, vm: VmId },
    /// Transient failure: the task waits in the deferral queue.
    Deferred { reason: PlacementFailure },
    /// Permanent failure: the task is deferred *and* reported as an SLA
    /// violation.
    Failed { reason: PlacementFailure },
}

impl From<PlacementFailure> for PlacementOutcome {
    fn from(reason: PlacementFailure) -> Self {
        if reason.is_permanent() {
            PlacementOutcome::Failed { reason }
        } else {
            PlacementOutcome::Deferred { reason }
        }
    }
}

impl PlacementOutcome {
    pub fn is_placed(&self) -> bool {
        matches!(
            self,
            PlacementOutcome::Assigned { .. } | PlacementOutcome::ProvisionPending { .. }
        )
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

pub struct Scheduler<B: ClusterBackend> {
    backend: B,
    config: EngineConfig,
    ctx: ClusterContext,
    placement: Box<dyn PlacementPolicy>,
    power: Box<dyn PowerPolicy>,
    /// Set while an offload is moving tasks. Only observable by a backend
    /// that calls back into the engine from inside a command; such a nested
    /// memory warning or offload is dropped.
    offloading: bool,
}

impl<B: ClusterBackend> Scheduler<B> {
    /// Validates `config` and builds the strategy pair it selects.
    pub fn new(backend: B, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let (placement, power) = placement::policies(config.strategy);
        info!(
            strategy = %config.strategy,
            placement = placement.name(),
            power = power.name(),
            grace_us = config.idle_grace_period_us,
            container_task_limit = config.container_task_limit,
            "policy engine configured"
        );
        Ok(Self {
            ctx: ClusterContext::new(config.vm_memory_overhead_mb),
            backend,
            config,
            placement,
            power,
            offloading: false,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn context(&self) -> &ClusterContext {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        self.ctx.stats
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.ctx.check_invariants(self.config.container_task_limit)
    }

    // ── Inbound events ───────────────────────────────────────────────────────

    /// Discovers every machine from the collaborator.
    pub fn on_init(&mut self) {
        let count = self.backend.machine_count();
        for id in 0..count {
            let machine = MachineId(id);
            match self.backend.machine_info(machine) {
                Ok(info) => {
                    debug!(
                        machine = %machine,
                        cpu = %info.cpu,
                        memory_mb = info.memory_mb,
                        power = %info.power,
                        "machine registered"
                    );
                    self.ctx.state.register_machine(&info, 0);
                }
                Err(e) => warn!(machine = %machine, error = %e, "machine descriptor unavailable, skipped"),
            }
        }
        self.refresh_energy();
        let powered = self
            .ctx
            .state
            .machines()
            .filter(|m| m.power.is_running())
            .count();
        info!(machines = count, powered, "cluster discovered");
    }

    /// Places a newly arrived task. Returns `None` when the arrival had to be
    /// ignored (unknown or duplicate task).
    pub fn on_new_task(&mut self, now: Time, task: TaskId) -> Option<PlacementOutcome> {
        let requirements = match self.backend.task_requirements(task) {
            Ok(r) => r,
            Err(e) => {
                warn!(task = %task, error = %e, "task requirements unavailable, arrival ignored");
                return None;
            }
        };
        if self.ctx.tasks.contains_key(&task) {
            warn!(task = %task, "duplicate arrival ignored");
            return None;
        }

        self.ctx.stats.arrived += 1;
        self.ctx.tasks.insert(
            task,
            TaskRecord {
                requirements: requirements.clone(),
                state: TaskState::Deferred,
                arrived_at: now,
                sla_flagged: false,
            },
        );

        let outcome = self.place(now, &requirements, true);
        if !outcome.is_placed() {
            self.ctx.stats.deferred += 1;
        }
        debug!(task = %task, sla = %requirements.sla, outcome = ?outcome, "arrival handled");
        self.settle(task, &outcome, false);
        Some(outcome)
    }

    /// Releases a finished task and retries the deferral queue.
    pub fn on_task_complete(&mut self, now: Time, task: TaskId) {
        if self.ctx.state.record_completion(task, now).is_none() {
            return;
        }
        self.ctx.tasks.remove(&task);
        self.ctx.stats.completed += 1;
        debug!(task = %task, at = now, "task completed");
        self.drain_deferred(now);
    }

    pub fn on_periodic_check(&mut self, now: Time) {
        self.refresh_energy();
        self.resolve_missed_wakes(now);
        if self.config.drain_on_periodic_check {
            self.drain_deferred(now);
        }
        let expired = power::idle_expired(
            &self.ctx.state,
            &self.ctx.wakes,
            self.power.as_ref(),
            self.config.idle_grace_period_us,
            now,
        );
        for machine in expired {
            self.power_down(now, machine);
        }
    }

    /// Moves a container to the host the collaborator now reports for it.
    pub fn on_migration_complete(&mut self, now: Time, vm: VmId) {
        if self.ctx.state.vm(vm).is_none() {
            warn!(vm = %vm, "migration completed for untracked container, ignored");
            return;
        }
        let host = match self.backend.vm_info(vm) {
            Ok(info) => info.host,
            Err(e) => {
                warn!(vm = %vm, error = %e, "container descriptor unavailable, migration ignored");
                return;
            }
        };
        let Some(host) = host else {
            warn!(vm = %vm, "migrated container reports no host, ignored");
            return;
        };
        if self.ctx.state.rehost_vm(vm, host, now) {
            info!(vm = %vm, machine = %host, "container migrated");
            self.drain_deferred(now);
        } else {
            warn!(vm = %vm, machine = %host, "migration target is not tracked, ignored");
        }
    }

    /// Completes the wake protocol for `machine`.
    ///
    /// Every wake record for the machine is resolved here, in record order:
    /// attached and assigned, or pushed onto the deferral queue. Deferred
    /// tasks of the machine's CPU type are then tried on it before a general
    /// drain.
    pub fn on_machine_ready(&mut self, now: Time, machine: MachineId) {
        let Some(entry) = self.ctx.state.machine(machine) else {
            warn!(machine = %machine, "ready event for untracked machine, ignored");
            return;
        };
        let (cpu, cores, was) = (entry.cpu, entry.cores, entry.power);
        if was != PowerState::WakingUp {
            debug!(machine = %machine, state = %was, "ready event for machine that was not waking up");
        }

        self.ctx.state.set_power(machine, PowerState::Active, now);
        let level = self.power.activation_performance();
        self.set_cores(machine, cores, level);
        info!(
            machine = %machine,
            pending = self.ctx.wakes.for_machine(machine).count(),
            "machine ready"
        );

        self.drain_wakes(now, machine);
        self.drain_onto(now, machine, cpu);
        self.drain_deferred(now);
    }

    /// Relieves memory pressure by moving one task off a congested machine.
    pub fn on_memory_warning(&mut self, now: Time, machine: MachineId) {
        if self.offloading {
            debug!(machine = %machine, "memory warning during offload, ignored");
            return;
        }
        let Some(entry) = self.ctx.state.machine(machine) else {
            warn!(machine = %machine, "memory warning for untracked machine, ignored");
            return;
        };
        let origin = if entry.load > 0 && entry.memory_pressure() < 1.0 {
            Some(machine)
        } else {
            offload::most_pressured(&self.ctx.state, entry.cpu, &BTreeSet::new(), 0)
        };
        let Some(origin) = origin else {
            debug!(machine = %machine, "no machine worth offloading from");
            return;
        };

        self.offloading = true;
        self.ctx.stats.offload_attempts += 1;
        let origins = BTreeSet::from([origin]);
        let moved = self.relieve(now, origin, &origins, &mut BTreeSet::new());
        self.offloading = false;
        if !moved {
            debug!(machine = %origin, "memory warning: no task could be moved");
        }
    }

    /// Escalates a task that is about to miss its deadline.
    ///
    /// A deferred task jumps to the head of the queue and is retried at once;
    /// a running task gets its host's cores raised to maximum performance.
    pub fn on_sla_warning(&mut self, now: Time, task: TaskId) {
        let Some((state, requirements)) = self
            .ctx
            .task(task)
            .map(|r| (r.state, r.requirements.clone()))
        else {
            debug!(task = %task, "SLA warning for unknown or finished task");
            return;
        };
        match state {
            TaskState::Deferred => {
                self.ctx.deferred.remove(task);
                let outcome = self.place(now, &requirements, true);
                info!(task = %task, placed = outcome.is_placed(), "SLA warning: deferred task retried");
                self.settle(task, &outcome, true);
            }
            TaskState::Assigned => {
                if let Some(a) = self.ctx.state.assignment(task).copied() {
                    let cores = self.ctx.state.machine(a.machine).map_or(0, |m| m.cores);
                    self.set_cores(a.machine, cores, CorePerformance::MAX);
                    info!(task = %task, machine = %a.machine, "SLA warning: host boosted");
                }
            }
            TaskState::Pending => {
                debug!(task = %task, "SLA warning for task waiting on a wake");
            }
        }
    }

    /// Reports unplaced tasks, tears the cluster down and returns the summary.
    pub fn on_shutdown(&mut self, now: Time) -> Summary {
        let unplaced: Vec<TaskId> = self
            .ctx
            .tasks
            .iter()
            .filter(|(_, r)| matches!(r.state, TaskState::Deferred | TaskState::Pending))
            .map(|(t, _)| *t)
            .collect();
        for &task in &unplaced {
            self.flag_violation(task);
        }
        if !unplaced.is_empty() {
            warn!(tasks = unplaced.len(), "unplaced tasks reported as SLA violations");
        }

        // Containers parked behind wakes were created but never attached.
        let parked: BTreeSet<VmId> = self.ctx.wakes.take_all().into_iter().map(|w| w.vm).collect();
        for vm in parked {
            self.discard_vm(vm);
        }
        let vms: Vec<VmId> = self.ctx.state.vms().map(|v| v.id).collect();
        for vm in vms {
            self.discard_vm(vm);
            self.ctx.state.remove_vm(vm, now);
        }
        let machines: Vec<MachineId> = self
            .ctx
            .state
            .machines()
            .filter(|m| m.power != PowerState::Off)
            .map(|m| m.id)
            .collect();
        for machine in machines {
            match self.backend.set_power_state(machine, PowerCommand::PowerOff) {
                Ok(()) => self.ctx.state.set_power(machine, PowerState::Off, now),
                Err(e) => warn!(machine = %machine, error = %e, "power-off at shutdown refused"),
            }
        }
        self.ctx.deferred.take_all();

        let summary = Summary {
            sla_violation_pct: SlaClass::ALL.map(|class| self.backend.sla_report(class)),
            energy_kwh: self.backend.cluster_energy(),
            finished_at: now,
            unplaced: unplaced.len(),
            stats: self.ctx.stats,
        };
        info!(
            at = now,
            energy_kwh = summary.energy_kwh,
            unplaced = summary.unplaced,
            placed = summary.stats.placed,
            provisioned = summary.stats.provisioned,
            offload_moves = summary.stats.offload_moves,
            powered_down = summary.stats.powered_down,
            "shutdown complete"
        );
        summary
    }

    // ── Placement ────────────────────────────────────────────────────────────

    fn decide(&self, req: Request<'_>) -> Decision {
        placement::decide(
            &self.ctx.state,
            &self.ctx.wakes,
            self.placement.as_ref(),
            &self.config,
            req,
        )
    }

    fn place(&mut self, now: Time, req: &TaskRequirements, allow_offload: bool) -> PlacementOutcome {
        match self.decide(Request::new(req)) {
            Decision::NoCapacity { largest_free_mb }
                if allow_offload && !self.offloading && self.config.max_offload_attempts > 0 =>
            {
                self.offload_for(now, req, largest_free_mb)
            }
            decision => self.apply(now, req, decision),
        }
    }

    /// Commits `decision`, turning a refused command into a deferral.
    fn apply(&mut self, now: Time, req: &TaskRequirements, decision: Decision) -> PlacementOutcome {
        match self.try_apply(now, req, decision) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task = %req.id, error = %e, "placement command refused, deferring");
                PlacementFailure::CommandRejected(e).into()
            }
        }
    }

    fn try_apply(
        &mut self,
        now: Time,
        req: &TaskRequirements,
        decision: Decision,
    ) -> Result<PlacementOutcome, BackendError> {
        match decision {
            Decision::Reuse { vm, machine } => {
                self.assign(req, vm, machine)?;
                Ok(PlacementOutcome::Assigned { vm, machine })
            }
            Decision::NewContainer { machine } => {
                let vm = self.backend.create_vm(req.vm_type, req.cpu)?;
                if let Err(e) = self.backend.attach_vm(vm, machine) {
                    self.discard_vm(vm);
                    return Err(e);
                }
                self.ctx.state.add_vm(vm, req.vm_type, req.cpu, machine);
                self.assign(req, vm, machine)?;
                Ok(PlacementOutcome::Assigned { vm, machine })
            }
            Decision::JoinWake { machine, vm } => {
                let vm = match vm {
                    Some(vm) => vm,
                    None => self.backend.create_vm(req.vm_type, req.cpu)?,
                };
                self.record_wake(now, req, machine, vm);
                self.ctx.stats.joined_wakes += 1;
                debug!(task = %req.id, machine = %machine, vm = %vm, "joined pending wake");
                Ok(PlacementOutcome::ProvisionPending { machine, vm })
            }
            Decision::Provision { machine } => {
                let vm = self.backend.create_vm(req.vm_type, req.cpu)?;
                if let Err(e) = self.backend.set_power_state(machine, PowerCommand::PowerOn) {
                    self.discard_vm(vm);
                    return Err(e);
                }
                self.ctx.state.set_power(machine, PowerState::WakingUp, now);
                self.record_wake(now, req, machine, vm);
                self.ctx.stats.provisioned += 1;
                info!(task = %req.id, machine = %machine, vm = %vm, "waking machine");
                Ok(PlacementOutcome::ProvisionPending { machine, vm })
            }
            Decision::NoCapacity { largest_free_mb } => Ok(PlacementFailure::InsufficientCapacity {
                required_mb: req.memory_mb,
                largest_free_mb,
            }
            .into()),
            Decision::NoCompatibleMachine => {
                Ok(PlacementFailure::NoCompatibleMachine { cpu: req.cpu }.into())
            }
        }
    }

    fn assign(&mut self, req: &TaskRequirements, vm: VmId, machine: MachineId) -> Result<(), BackendError> {
        self.backend.add_task(vm, req.id, req.sla.task_priority())?;
        self.ctx.state.record_assignment(req.id, req.memory_mb, vm, machine);
        self.ctx.stats.placed += 1;
        debug!(task = %req.id, vm = %vm, machine = %machine, "task assigned");
        Ok(())
    }

    fn record_wake(&mut self, now: Time, req: &TaskRequirements, machine: MachineId, vm: VmId) {
        self.ctx.wakes.record(PendingWake {
            machine,
            vm,
            vm_type: req.vm_type,
            task: req.id,
            memory_mb: req.memory_mb,
            recorded_at: now,
        });
    }

    /// Books `outcome` for `task`: task state, deferral queue and SLA flag.
    fn settle(&mut self, task: TaskId, outcome: &PlacementOutcome, at_front: bool) {
        match outcome {
            PlacementOutcome::Assigned { .. } => self.ctx.set_task_state(task, TaskState::Assigned),
            PlacementOutcome::ProvisionPending { .. } => {
                self.ctx.set_task_state(task, TaskState::Pending)
            }
            PlacementOutcome::Deferred { .. } => self.defer(task, at_front),
            PlacementOutcome::Failed { reason } => {
                if self.flag_violation(task) {
                    warn!(task = %task, reason = %reason, "placement failed, SLA violation reported");
                }
                self.defer(task, at_front);
            }
        }
    }

    fn defer(&mut self, task: TaskId, at_front: bool) {
        if at_front {
            self.ctx.deferred.push_front(task);
        } else {
            self.ctx.deferred.push_back(task);
        }
        self.ctx.set_task_state(task, TaskState::Deferred);
    }

    /// Reports `task` as violating its SLA once. Returns `true` the first time.
    fn flag_violation(&mut self, task: TaskId) -> bool {
        let Some(record) = self.ctx.tasks.get_mut(&task) else {
            return false;
        };
        if record.sla_flagged {
            return false;
        }
        record.sla_flagged = true;
        self.backend.flag_sla_violation(task);
        self.ctx.stats.forced_violations += 1;
        true
    }

    /// Re-scans the whole deferral queue in FIFO order. Tasks that still do
    /// not fit go back in the same relative order.
    fn drain_deferred(&mut self, now: Time) {
        if self.ctx.deferred.is_empty() {
            return;
        }
        let queued = self.ctx.deferred.take_all();
        let total = queued.len();
        let mut placed = 0usize;
        for task in queued {
            let Some((requirements, arrived_at)) = self
                .ctx
                .task(task)
                .map(|r| (r.requirements.clone(), r.arrived_at))
            else {
                warn!(task = %task, "deferred task has no record, dropped");
                continue;
            };
            let outcome = self.place(now, &requirements, false);
            if outcome.is_placed() {
                placed += 1;
                debug!(task = %task, waited_us = now.saturating_sub(arrived_at), "deferred task placed");
            }
            self.settle(task, &outcome, false);
        }
        if placed > 0 {
            debug!(placed, remaining = total - placed, "deferral queue drained");
        }
    }

    /// Tries deferred tasks of `cpu` on the freshly woken `machine` only.
    fn drain_onto(&mut self, now: Time, machine: MachineId, cpu: CpuType) {
        let matching: Vec<TaskId> = self
            .ctx
            .deferred
            .iter()
            .filter(|t| self.ctx.task(*t).is_some_and(|r| r.requirements.cpu == cpu))
            .collect();
        for task in matching {
            let Some(requirements) = self.ctx.task(task).map(|r| r.requirements.clone()) else {
                continue;
            };
            let Some(entry) = self.ctx.state.machine(machine) else {
                return;
            };
            let Some(decision) = placement::fit_on(&self.ctx.state, entry, &self.config, &requirements)
            else {
                continue;
            };
            self.ctx.deferred.remove(task);
            let outcome = self.apply(now, &requirements, decision);
            self.settle(task, &outcome, true);
        }
    }

    // ── Offload ──────────────────────────────────────────────────────────────

    /// Makes room for `req` by moving tasks off congested machines, at most
    /// `max_offload_attempts` origins per call.
    ///
    /// Origins too small to ever hold `req` are never tried. Within one call
    /// a victim never lands on an origin already tried and no task is moved
    /// twice.
    fn offload_for(&mut self, now: Time, req: &TaskRequirements, largest_free_mb: u64) -> PlacementOutcome {
        self.offloading = true;
        let min_capacity_mb = self.config.vm_memory_overhead_mb.saturating_add(req.memory_mb);
        let mut tried = BTreeSet::new();
        let mut moved = BTreeSet::new();
        let mut attempts = 0u32;
        let outcome = loop {
            if attempts >= self.config.max_offload_attempts {
                break PlacementFailure::OffloadExhausted { attempts }.into();
            }
            let Some(origin) =
                offload::most_pressured(&self.ctx.state, req.cpu, &tried, min_capacity_mb)
            else {
                break if attempts == 0 {
                    PlacementFailure::InsufficientCapacity {
                        required_mb: req.memory_mb,
                        largest_free_mb,
                    }
                    .into()
                } else {
                    PlacementFailure::OffloadExhausted { attempts }.into()
                };
            };
            tried.insert(origin);
            attempts += 1;
            self.ctx.stats.offload_attempts += 1;
            debug!(task = %req.id, origin = %origin, attempt = attempts, "offload attempt");

            if !self.relieve(now, origin, &tried, &mut moved) {
                continue;
            }
            let decision = self.decide(Request::new(req));
            if !matches!(decision, Decision::NoCapacity { .. }) {
                break self.apply(now, req, decision);
            }
        };
        self.offloading = false;
        outcome
    }

    /// Moves the first task on `origin` that fits on a running machine outside
    /// `origins`. Tasks in `moved` stay put; the moved task is added to it.
    fn relieve(
        &mut self,
        now: Time,
        origin: MachineId,
        origins: &BTreeSet<MachineId>,
        moved: &mut BTreeSet<TaskId>,
    ) -> bool {
        for (victim, a) in offload::victims(&self.ctx.state, origin) {
            if moved.contains(&victim) {
                continue;
            }
            let Some(requirements) = self.ctx.task(victim).map(|r| r.requirements.clone()) else {
                continue;
            };
            let decision = self.decide(Request::relocation(&requirements, origins));
            if !decision.is_immediate() {
                continue;
            }
            if let Err(e) = self.backend.remove_task(a.vm, victim) {
                warn!(task = %victim, vm = %a.vm, error = %e, "offload: task removal refused");
                continue;
            }
            self.ctx.state.release(victim, now);
            moved.insert(victim);

            let outcome = self.apply(now, &requirements, decision);
            match &outcome {
                PlacementOutcome::Assigned { machine, .. } => {
                    info!(task = %victim, from = %origin, to = %machine, "task offloaded");
                    self.ctx.stats.offload_moves += 1;
                }
                _ => warn!(task = %victim, from = %origin, "offloaded task could not be re-placed, deferring"),
            }
            self.settle(victim, &outcome, true);
            return true;
        }
        false
    }

    // ── Power ────────────────────────────────────────────────────────────────

    /// Resolves every wake record for `machine`.
    fn drain_wakes(&mut self, now: Time, machine: MachineId) {
        let records = self.ctx.wakes.take_for(machine);
        let mut attached: BTreeSet<VmId> = BTreeSet::new();
        let mut refused: BTreeSet<VmId> = BTreeSet::new();

        for w in records {
            let Some(requirements) = self.ctx.task(w.task).map(|r| r.requirements.clone()) else {
                warn!(task = %w.task, machine = %machine, "wake record for unknown task, dropped");
                continue;
            };
            if !attached.contains(&w.vm) && !refused.contains(&w.vm) {
                match self.backend.attach_vm(w.vm, machine) {
                    Ok(()) => {
                        self.ctx.state.add_vm(w.vm, w.vm_type, requirements.cpu, machine);
                        attached.insert(w.vm);
                    }
                    Err(e) => {
                        warn!(vm = %w.vm, machine = %machine, error = %e, "attach after wake refused");
                        refused.insert(w.vm);
                    }
                }
            }

            if attached.contains(&w.vm) && self.fits_in(w.vm, machine, w.memory_mb) {
                match self.assign(&requirements, w.vm, machine) {
                    Ok(()) => {
                        self.ctx.set_task_state(w.task, TaskState::Assigned);
                        debug!(
                            task = %w.task,
                            machine = %machine,
                            waited_us = now.saturating_sub(w.recorded_at),
                            "pending task assigned after wake"
                        );
                        continue;
                    }
                    Err(e) => warn!(task = %w.task, error = %e, "add after wake refused"),
                }
            }
            warn!(task = %w.task, machine = %machine, "pending task no longer fits, re-deferred");
            self.ctx.stats.redeferred_wakes += 1;
            self.defer(w.task, false);
        }

        for vm in refused {
            self.discard_vm(vm);
        }
    }

    fn fits_in(&self, vm: VmId, machine: MachineId, memory_mb: u64) -> bool {
        let room = self
            .ctx
            .state
            .machine(machine)
            .is_some_and(|m| m.memory_used_mb.saturating_add(memory_mb) <= m.memory_capacity_mb);
        let slot = self
            .ctx
            .state
            .vm(vm)
            .is_some_and(|v| v.tasks.len() < self.config.container_task_limit);
        room && slot
    }

    /// Collaborator-reported Active machines that we still think are waking
    /// up: their ready event was lost.
    fn resolve_missed_wakes(&mut self, now: Time) {
        let waking: Vec<MachineId> = self
            .ctx
            .state
            .machines()
            .filter(|m| m.power == PowerState::WakingUp)
            .map(|m| m.id)
            .collect();
        for machine in waking {
            match self.backend.machine_info(machine) {
                Ok(info) if info.power.is_running() => {
                    warn!(machine = %machine, "machine is up without a ready event, resolving its wakes");
                    self.on_machine_ready(now, machine);
                }
                Ok(_) => {}
                Err(e) => warn!(machine = %machine, error = %e, "machine descriptor unavailable"),
            }
        }
    }

    /// Powers `machine` down after re-verifying it is really idle.
    fn power_down(&mut self, now: Time, machine: MachineId) {
        let info = match self.backend.machine_info(machine) {
            Ok(info) => info,
            Err(e) => {
                warn!(machine = %machine, error = %e, "machine descriptor unavailable, power-down skipped");
                return;
            }
        };
        let containers = self.ctx.state.containers_on(machine);
        let loaded = containers
            .iter()
            .filter_map(|vm| self.ctx.state.vm(*vm))
            .any(|vm| !vm.tasks.is_empty());
        if self.ctx.state.load(machine) > 0 || info.active_tasks > 0 || loaded {
            warn!(
                machine = %machine,
                active_tasks = info.active_tasks,
                "idle machine busy at check time, countdown restarted"
            );
            self.ctx.state.set_power(machine, PowerState::Active, now);
            return;
        }

        for vm in containers {
            if let Err(e) = self.backend.shutdown_vm(vm) {
                warn!(vm = %vm, machine = %machine, error = %e, "container shutdown refused, power-down aborted");
                return;
            }
            self.ctx.state.remove_vm(vm, now);
        }
        match self.backend.set_power_state(machine, PowerCommand::PowerOff) {
            Ok(()) => {
                self.ctx.state.set_power(machine, PowerState::Off, now);
                self.ctx.stats.powered_down += 1;
                info!(machine = %machine, at = now, "idle machine powered down");
            }
            Err(e) => warn!(machine = %machine, error = %e, "power-off refused"),
        }
    }

    fn set_cores(&mut self, machine: MachineId, cores: u32, level: CorePerformance) {
        for core in 0..cores {
            if let Err(e) = self.backend.set_core_performance(machine, core, level) {
                warn!(machine = %machine, core, error = %e, "core performance change refused");
                return;
            }
        }
    }

    fn refresh_energy(&mut self) {
        let ids: Vec<MachineId> = self.ctx.state.machines().map(|m| m.id).collect();
        for id in ids {
            let energy = self.backend.machine_energy(id);
            self.ctx.state.set_energy(id, energy);
        }
    }

    fn discard_vm(&mut self, vm: VmId) {
        if let Err(e) = self.backend.shutdown_vm(vm) {
            debug!(vm = %vm, error = %e, "container shutdown refused");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MachineSpec, MemoryCluster, TaskSpec};
    use crate::types::VmType;

    fn spec(memory_mb: u64, sla: SlaClass) -> TaskSpec {
        TaskSpec {
            cpu: CpuType::X86,
            vm_type: VmType::Linux,
            memory_mb,
            sla,
            arrival_us: 0,
            runtime_us: 1_000,
            deadline_us: 10_000,
        }
    }

    /// Scheduler over `machines`, with tasks `0..tasks.len()` registered.
    fn scheduler(machines: Vec<MachineSpec>, tasks: &[(u64, SlaClass)]) -> Scheduler<MemoryCluster> {
        scheduler_with(EngineConfig::default(), machines, tasks)
    }

    fn scheduler_with(
        config: EngineConfig,
        machines: Vec<MachineSpec>,
        tasks: &[(u64, SlaClass)],
    ) -> Scheduler<MemoryCluster> {
        let mut cluster = MemoryCluster::new();
        for m in machines {
            cluster.add_machine(m);
        }
        for (i, &(mem, sla)) in tasks.iter().enumerate() {
            cluster.register_task(TaskId(i as u32), spec(mem, sla));
        }
        let mut s = Scheduler::new(cluster, config).unwrap();
        s.on_init();
        s
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig {
            container_task_limit: 0,
            ..EngineConfig::default()
        };
        assert!(Scheduler::new(MemoryCluster::new(), config).is_err());
    }

    #[test]
    fn arrival_on_running_machine_is_assigned() {
        let mut s = scheduler(vec![MachineSpec::new(CpuType::X86, 1024)], &[(100, SlaClass::Sla1)]);
        let outcome = s.on_new_task(0, TaskId(0)).unwrap();
        assert!(matches!(outcome, PlacementOutcome::Assigned { machine: MachineId(0), .. }));
        assert_eq!(s.context().task_state(TaskId(0)), Some(TaskState::Assigned));
        assert_eq!(s.backend().task_host(TaskId(0)), Some(MachineId(0)));
        s.check_invariants().unwrap();
    }

    #[test]
    fn arrival_on_powered_off_cluster_wakes_a_machine() {
        let mut s = scheduler(
            vec![MachineSpec::new(CpuType::X86, 1024).powered_off()],
            &[(100, SlaClass::Sla1), (50, SlaClass::Sla2)],
        );
        let first = s.on_new_task(0, TaskId(0)).unwrap();
        assert!(matches!(first, PlacementOutcome::ProvisionPending { machine: MachineId(0), .. }));
        let second = s.on_new_task(5, TaskId(1)).unwrap();
        assert!(matches!(second, PlacementOutcome::ProvisionPending { .. }));
        assert_eq!(s.backend_mut().take_wake_requests(), vec![MachineId(0)]);
        assert_eq!(s.stats().provisioned, 1);
        assert_eq!(s.stats().joined_wakes, 1);
        s.check_invariants().unwrap();

        assert!(s.backend_mut().finish_wake(MachineId(0)));
        s.on_machine_ready(50, MachineId(0));
        assert!(s.context().wakes.is_empty());
        assert_eq!(s.context().task_state(TaskId(0)), Some(TaskState::Assigned));
        assert_eq!(s.context().task_state(TaskId(1)), Some(TaskState::Assigned));
        assert_eq!(s.context().state.containers_on(MachineId(0)).len(), 1);
        s.check_invariants().unwrap();
    }

    #[test]
    fn pending_task_that_no_longer_fits_is_redeferred() {
        let mut s = scheduler(
            vec![
                MachineSpec::new(CpuType::X86, 720),
                MachineSpec::new(CpuType::X86, 1300).powered_off(),
            ],
            &[(700, SlaClass::Sla2), (400, SlaClass::Sla2), (800, SlaClass::Sla2)],
        );
        let (m0, m1) = (MachineId(0), MachineId(1));
        assert!(matches!(
            s.on_new_task(0, TaskId(0)).unwrap(),
            PlacementOutcome::Assigned { machine: MachineId(0), .. }
        ));
        assert!(matches!(
            s.on_new_task(1, TaskId(1)).unwrap(),
            PlacementOutcome::ProvisionPending { machine: MachineId(1), .. }
        ));
        assert!(matches!(
            s.on_new_task(2, TaskId(2)).unwrap(),
            PlacementOutcome::ProvisionPending { machine: MachineId(1), .. }
        ));
        assert_eq!(s.stats().joined_wakes, 1);

        // While m1 boots, t0's container lands on it and eats the room
        // reserved for t2.
        assert!(s.backend_mut().finish_wake(m1));
        s.backend_mut().migrate_vm(VmId(0), m1).unwrap();
        s.on_migration_complete(20, VmId(0));
        assert_eq!(s.context().state.machine(m1).unwrap().memory_used_mb, 708);
        assert_eq!(s.context().state.load(m0), 0);

        s.on_machine_ready(30, m1);
        assert_eq!(s.context().task_state(TaskId(1)), Some(TaskState::Assigned));
        assert_eq!(s.backend().task_host(TaskId(1)), Some(m1));
        assert_eq!(s.context().task_state(TaskId(2)), Some(TaskState::Deferred));
        assert!(s.context().deferred.contains(TaskId(2)));
        assert_eq!(s.stats().redeferred_wakes, 1);
        assert!(s.context().wakes.is_empty());
        s.check_invariants().unwrap();
    }

    #[test]
    fn migration_moves_load_and_memory_to_new_host() {
        let mut s = scheduler(
            vec![MachineSpec::new(CpuType::X86, 1000), MachineSpec::new(CpuType::X86, 1000)],
            &[(300, SlaClass::Sla2), (300, SlaClass::Sla2)],
        );
        let (m0, m1) = (MachineId(0), MachineId(1));
        s.on_new_task(0, TaskId(0));
        s.on_new_task(1, TaskId(1));
        assert_eq!(s.backend().task_host(TaskId(1)), Some(m1));

        s.backend_mut().migrate_vm(VmId(1), m0).unwrap();
        s.on_migration_complete(10, VmId(1));

        let old = s.context().state.machine(m1).unwrap();
        assert_eq!(old.load, 0);
        assert_eq!(old.memory_used_mb, 0);
        assert_eq!(old.power, PowerState::IdlePending);
        assert_eq!(old.idle_since, Some(10));
        let new = s.context().state.machine(m0).unwrap();
        assert_eq!(new.load, 2);
        assert_eq!(new.memory_used_mb, 616);
        assert_eq!(s.context().state.assignment(TaskId(1)).unwrap().machine, m0);
        assert_eq!(s.context().state.vm(VmId(1)).unwrap().host, m0);
        s.check_invariants().unwrap();
    }

    #[test]
    fn migration_of_unknown_container_is_ignored() {
        let mut s = scheduler(vec![MachineSpec::new(CpuType::X86, 1000)], &[(300, SlaClass::Sla2)]);
        s.on_new_task(0, TaskId(0));
        s.on_migration_complete(10, VmId(99));
        let m0 = s.context().state.machine(MachineId(0)).unwrap();
        assert_eq!(m0.load, 1);
        assert_eq!(m0.memory_used_mb, 308);
        assert_eq!(m0.idle_since, None);
        s.check_invariants().unwrap();
    }

    #[test]
    fn migration_drains_deferred_tasks() {
        let config = EngineConfig {
            max_offload_attempts: 0,
            ..EngineConfig::default()
        };
        let mut s = scheduler_with(
            config,
            vec![MachineSpec::new(CpuType::X86, 1000), MachineSpec::new(CpuType::X86, 1000)],
            &[(300, SlaClass::Sla2), (300, SlaClass::Sla2), (900, SlaClass::Sla2)],
        );
        s.on_new_task(0, TaskId(0));
        s.on_new_task(1, TaskId(1));
        let outcome = s.on_new_task(2, TaskId(2)).unwrap();
        assert!(matches!(outcome, PlacementOutcome::Deferred { .. }), "{outcome:?}");

        s.backend_mut().migrate_vm(VmId(1), MachineId(0)).unwrap();
        s.on_migration_complete(10, VmId(1));
        assert_eq!(s.context().task_state(TaskId(2)), Some(TaskState::Assigned));
        assert_eq!(s.backend().task_host(TaskId(2)), Some(MachineId(1)));
        assert!(s.context().deferred.is_empty());
        s.check_invariants().unwrap();
    }

    #[test]
    fn unknown_cpu_type_fails_and_flags_once() {
        let mut s = scheduler(vec![MachineSpec::new(CpuType::Arm, 1024)], &[(10, SlaClass::Sla1)]);
        let outcome = s.on_new_task(0, TaskId(0)).unwrap();
        assert!(matches!(outcome, PlacementOutcome::Failed { .. }));
        assert!(s.backend().is_violated(TaskId(0)));
        assert!(s.context().deferred.contains(TaskId(0)));

        s.on_periodic_check(100);
        assert_eq!(s.stats().forced_violations, 1);
        s.check_invariants().unwrap();
    }

    #[test]
    fn completion_drains_deferred_task() {
        let mut s = scheduler(
            vec![MachineSpec::new(CpuType::X86, 600)],
            &[(500, SlaClass::Sla2), (500, SlaClass::Sla2)],
        );
        s.on_new_task(0, TaskId(0));
        // The only origin cannot shed its task anywhere: one attempt, then give up.
        let outcome = s.on_new_task(1, TaskId(1)).unwrap();
        assert_eq!(
            outcome,
            PlacementOutcome::Failed {
                reason: PlacementFailure::OffloadExhausted { attempts: 1 }
            }
        );
        assert!(s.context().deferred.contains(TaskId(1)));
        s.check_invariants().unwrap();

        s.backend_mut().advance_to(1_000);
        s.backend_mut().complete_task(TaskId(0)).unwrap();
        s.on_task_complete(1_000, TaskId(0));
        assert_eq!(s.context().task_state(TaskId(1)), Some(TaskState::Assigned));
        assert!(s.context().deferred.is_empty());
        s.check_invariants().unwrap();
    }

    #[test]
    fn stale_completion_is_ignored() {
        let mut s = scheduler(vec![MachineSpec::new(CpuType::X86, 600)], &[]);
        s.on_task_complete(10, TaskId(77));
        assert_eq!(s.stats().completed, 0);
    }

    #[test]
    fn offload_makes_room_on_congested_machine() {
        let mut s = scheduler(
            vec![MachineSpec::new(CpuType::X86, 1000), MachineSpec::new(CpuType::X86, 1000)],
            &[
                (400, SlaClass::Sla2),
                (500, SlaClass::Sla2),
                (400, SlaClass::Sla2),
                (500, SlaClass::Sla2),
            ],
        );
        for t in 0..3 {
            s.on_new_task(t, TaskId(t as u32));
        }
        // m0: t0 + t2 (808 MB), m1: t1 (508 MB); t3 fits nowhere as-is.
        assert_eq!(s.context().state.load(MachineId(0)), 2);

        let outcome = s.on_new_task(10, TaskId(3)).unwrap();
        assert!(
            matches!(outcome, PlacementOutcome::Assigned { machine: MachineId(0), .. }),
            "{outcome:?}"
        );
        assert_eq!(s.context().state.assignment(TaskId(0)).unwrap().machine, MachineId(1));
        assert_eq!(s.stats().offload_attempts, 1);
        assert_eq!(s.stats().offload_moves, 1);
        s.check_invariants().unwrap();
    }

    #[test]
    fn sla_warning_boosts_host_cores() {
        let mut s = scheduler(vec![MachineSpec::new(CpuType::X86, 1024)], &[(10, SlaClass::Sla0)]);
        s.on_new_task(0, TaskId(0));
        s.backend_mut()
            .set_core_performance(MachineId(0), 3, CorePerformance::P3)
            .unwrap();
        s.on_sla_warning(5, TaskId(0));
        assert_eq!(
            s.backend().core_performance(MachineId(0), 3),
            Some(CorePerformance::P0)
        );
    }

    #[test]
    fn sla_warning_moves_deferred_task_to_front() {
        let mut s = scheduler(
            vec![MachineSpec::new(CpuType::X86, 600)],
            &[(500, SlaClass::Sla2), (500, SlaClass::Sla2), (500, SlaClass::Sla1)],
        );
        s.on_new_task(0, TaskId(0));
        s.on_new_task(1, TaskId(1));
        s.on_new_task(2, TaskId(2));
        s.on_sla_warning(3, TaskId(2));
        assert_eq!(s.context().deferred.iter().next(), Some(TaskId(2)));
        s.check_invariants().unwrap();
    }

    #[test]
    fn memory_warning_moves_one_task() {
        let mut s = scheduler(
            vec![MachineSpec::new(CpuType::X86, 1000), MachineSpec::new(CpuType::X86, 1000)],
            &[(600, SlaClass::Sla2), (300, SlaClass::Sla2), (100, SlaClass::Sla2)],
        );
        s.on_new_task(0, TaskId(0)); // m0
        s.on_new_task(1, TaskId(1)); // m1
        s.on_new_task(2, TaskId(2)); // m0 (tie, lowest id)
        assert_eq!(s.context().state.load(MachineId(0)), 2);

        s.on_memory_warning(5, MachineId(0));
        assert_eq!(s.context().state.assignment(TaskId(0)).unwrap().machine, MachineId(1));
        assert_eq!(s.context().state.load(MachineId(0)), 1);
        s.check_invariants().unwrap();
    }

    #[test]
    fn memory_warning_during_offload_is_dropped() {
        let mut s = scheduler(
            vec![MachineSpec::new(CpuType::X86, 1000), MachineSpec::new(CpuType::X86, 1000)],
            &[(600, SlaClass::Sla2), (300, SlaClass::Sla2), (100, SlaClass::Sla2)],
        );
        for t in 0..3 {
            s.on_new_task(t, TaskId(t as u32));
        }

        s.offloading = true;
        s.on_memory_warning(5, MachineId(0));
        assert_eq!(s.context().state.load(MachineId(0)), 2);
        assert_eq!(s.stats().offload_attempts, 0);
        assert_eq!(s.stats().offload_moves, 0);

        s.offloading = false;
        s.on_memory_warning(6, MachineId(0));
        assert_eq!(s.context().state.load(MachineId(0)), 1);
        assert_eq!(s.stats().offload_moves, 1);
    }

    #[test]
    fn permanent_failures_become_failed_outcomes() {
        assert!(matches!(
            PlacementOutcome::from(PlacementFailure::NoCompatibleMachine { cpu: CpuType::Arm }),
            PlacementOutcome::Failed { .. }
        ));
        assert!(matches!(
            PlacementOutcome::from(PlacementFailure::InsufficientCapacity {
                required_mb: 10,
                largest_free_mb: 0
            }),
            PlacementOutcome::Deferred { .. }
        ));
    }

    #[test]
    fn shutdown_reports_unplaced_and_powers_everything_off() {
        let mut s = scheduler(
            vec![MachineSpec::new(CpuType::X86, 600)],
            &[(500, SlaClass::Sla1), (500, SlaClass::Sla1)],
        );
        s.on_new_task(0, TaskId(0));
        s.on_new_task(1, TaskId(1));
        let summary = s.on_shutdown(100);
        assert_eq!(summary.unplaced, 1);
        assert!((summary.violation_pct(SlaClass::Sla1) - 50.0).abs() < 1e-9);
        assert_eq!(s.backend().power_state(MachineId(0)), Some(PowerState::Off));
        assert!(s.context().state.vms().next().is_none());
    }
}
