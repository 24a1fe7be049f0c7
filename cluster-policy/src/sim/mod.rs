/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Discrete-event replay driver.
//!
//! [`Simulation`] plays the part of the external clock: it owns a
//! [`Scheduler`] over a [`MemoryCluster`], delivers events in time order and
//! turns the collaborator's outboxes (wake requests, task starts, memory
//! warnings) into future events.
//!
//! Events with equal timestamps are delivered in the order they were queued.

pub mod scenario;

pub use scenario::{MachineGroup, Scenario, TaskGroup};

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::backend::memory::{MemoryCluster, TaskSpec};
use crate::backend::ClusterBackend;
use crate::config::EngineConfig;
use crate::engine::{Scheduler, Summary};
use crate::types::{MachineId, PowerState, SlaClass, TaskId, Time};

/// One inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event {
    TaskArrival(TaskId),
    /// Only delivered if the task is still in the run identified by `epoch`.
    TaskCompletion { task: TaskId, epoch: u64 },
    MachineReady(MachineId),
    MemoryWarning(MachineId),
    /// Halfway to the task's deadline.
    SlaCheck(TaskId),
    PeriodicCheck,
}

pub struct Simulation {
    scheduler: Scheduler<MemoryCluster>,
    tasks: Vec<TaskSpec>,
    queue: BinaryHeap<Reverse<(Time, u64, Event)>>,
    seq: u64,
    now: Time,
    wake_latency_us: Time,
    check_interval_us: Time,
    end_us: Option<Time>,
    /// Periodic checks stop after this time once nothing else is queued.
    horizon: Time,
}

impl Simulation {
    pub fn new(scenario: &Scenario, config: EngineConfig) -> Result<Self> {
        let grace = config.idle_grace_period_us;
        let mut cluster = MemoryCluster::new()
            .with_vm_overhead(config.vm_memory_overhead_mb)
            .with_memory_warning_threshold(scenario.memory_warning_threshold);
        for spec in scenario.machine_specs() {
            cluster.add_machine(spec);
        }

        let tasks = scenario.task_specs();
        for (i, spec) in tasks.iter().enumerate() {
            cluster.register_task(TaskId(i as u32), spec.clone());
        }
        let last_finish = tasks
            .iter()
            .map(|t| t.arrival_us.saturating_add(t.runtime_us))
            .max()
            .unwrap_or(0);
        let horizon = last_finish
            .saturating_add(grace)
            .saturating_add(scenario.check_interval_us.saturating_mul(2));

        let scheduler = Scheduler::new(cluster, config).context("Invalid engine configuration")?;

        let mut sim = Self {
            scheduler,
            tasks,
            queue: BinaryHeap::new(),
            seq: 0,
            now: 0,
            wake_latency_us: scenario.wake_latency_us,
            check_interval_us: scenario.check_interval_us,
            end_us: scenario.end_us,
            horizon,
        };
        for i in 0..sim.tasks.len() {
            let at = sim.tasks[i].arrival_us;
            sim.push(at, Event::TaskArrival(TaskId(i as u32)));
        }
        Ok(sim)
    }

    pub fn scheduler(&self) -> &Scheduler<MemoryCluster> {
        &self.scheduler
    }

    pub fn now(&self) -> Time {
        self.now
    }

    /// Runs to completion and returns the shutdown summary.
    pub fn run(self) -> Summary {
        self.run_observed(|_, _, _| {})
    }

    /// Like [`run`](Self::run), calling `observe` after every delivered event.
    pub fn run_observed<F>(mut self, mut observe: F) -> Summary
    where
        F: FnMut(Time, &Event, &Scheduler<MemoryCluster>),
    {
        info!(
            tasks = self.tasks.len(),
            machines = self.scheduler.backend().machine_count(),
            "simulation starting"
        );
        self.scheduler.on_init();
        let first_check = self.check_interval_us;
        self.push(first_check, Event::PeriodicCheck);

        while let Some(Reverse((at, _, event))) = self.queue.pop() {
            if self.end_us.is_some_and(|end| at > end) {
                debug!(at, "event past end of run, stopping");
                break;
            }
            self.now = at;
            self.scheduler.backend_mut().advance_to(at);
            self.dispatch(event);
            self.collect_outboxes();
            observe(at, &event, &self.scheduler);
        }

        let end = self.end_us.unwrap_or(self.now);
        self.scheduler.backend_mut().advance_to(end);
        self.scheduler.on_shutdown(end)
    }

    fn push(&mut self, at: Time, event: Event) {
        self.queue.push(Reverse((at, self.seq, event)));
        self.seq += 1;
    }

    fn dispatch(&mut self, event: Event) {
        let now = self.now;
        match event {
            Event::TaskArrival(task) => {
                self.scheduler.on_new_task(now, task);
                if let Some(spec) = self.tasks.get(task.0 as usize) {
                    if spec.sla != SlaClass::Sla3 {
                        let at = spec.arrival_us.saturating_add(spec.deadline_us / 2);
                        self.push(at.max(now), Event::SlaCheck(task));
                    }
                }
            }
            Event::TaskCompletion { task, epoch } => {
                if !self.scheduler.backend().is_running(task, epoch) {
                    return;
                }
                if let Err(e) = self.scheduler.backend_mut().complete_task(task) {
                    warn!(task = %task, error = %e, "completion refused by cluster");
                    return;
                }
                self.scheduler.on_task_complete(now, task);
            }
            Event::MachineReady(machine) => {
                if self.scheduler.backend_mut().finish_wake(machine) {
                    self.scheduler.on_machine_ready(now, machine);
                }
            }
            Event::MemoryWarning(machine) => self.scheduler.on_memory_warning(now, machine),
            Event::SlaCheck(task) => {
                if !self.scheduler.backend().is_finished(task) {
                    self.scheduler.on_sla_warning(now, task);
                }
            }
            Event::PeriodicCheck => {
                self.scheduler.on_periodic_check(now);
                if self.keep_checking() {
                    self.push(now.saturating_add(self.check_interval_us), Event::PeriodicCheck);
                }
            }
        }
    }

    fn collect_outboxes(&mut self) {
        let backend = self.scheduler.backend_mut();
        let wakes = backend.take_wake_requests();
        let started = backend.take_started();
        let warnings = backend.take_memory_warnings();

        for machine in wakes {
            self.push(self.now.saturating_add(self.wake_latency_us), Event::MachineReady(machine));
        }
        for s in started {
            self.push(
                s.finish_at,
                Event::TaskCompletion {
                    task: s.task,
                    epoch: s.epoch,
                },
            );
        }
        for machine in warnings {
            self.push(self.now, Event::MemoryWarning(machine));
        }
    }

    /// Periodic checks continue while other events are queued, or while
    /// there is still power or deferral work to do before the horizon.
    fn keep_checking(&self) -> bool {
        let next = self.now.saturating_add(self.check_interval_us);
        if let Some(end) = self.end_us {
            return next <= end;
        }
        if !self.queue.is_empty() {
            return true;
        }
        let ctx = self.scheduler.context();
        let unsettled = !ctx.deferred.is_empty()
            || !ctx.wakes.is_empty()
            || ctx
                .state
                .machines()
                .any(|m| matches!(m.power, PowerState::IdlePending | PowerState::WakingUp));
        unsettled && next <= self.horizon
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
