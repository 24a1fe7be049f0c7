/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Power Manager: wake bookkeeping and idle-consolidation decisions.
//!
//! ```text
//!  Off ──provision──► WakingUp ──machine ready──► Active ──load = 0──► IdlePending
//!   ▲                                               ▲                     │
//!   └────────────── grace elapsed + re-check ───────┼─────────────────────┘
//!                                                   └── assignment (abort idle)
//! ```
//!
//! A placement made while its machine is still waking up is parked as a
//! [`PendingWake`] in the [`WakeBook`]. All records for a machine are drained,
//! in the order they were made, by the single machine-ready event for it.

use std::collections::{BTreeSet, VecDeque};

use crate::tracker::ClusterState;
use crate::types::{CorePerformance, MachineId, PowerState, TaskId, Time, VmId, VmType};

// ── PendingWake ───────────────────────────────────────────────────────────────

/// A placement decision waiting for `machine` to finish powering on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWake {
    pub machine: MachineId,
    /// Created but not yet attached; attached when the machine is ready.
    pub vm: VmId,
    pub vm_type: VmType,
    pub task: TaskId,
    pub memory_mb: u64,
    pub recorded_at: Time,
}

/// FIFO of every outstanding [`PendingWake`].
#[derive(Debug, Default)]
pub struct WakeBook {
    pending: VecDeque<PendingWake>,
}

impl WakeBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, wake: PendingWake) {
        self.pending.push_back(wake);
    }

    /// Removes and returns every record for `machine`, oldest first.
    pub fn take_for(&mut self, machine: MachineId) -> Vec<PendingWake> {
        let (taken, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|w| w.machine == machine);
        self.pending = kept;
        taken.into()
    }

    /// Removes and returns every record.
    pub fn take_all(&mut self) -> Vec<PendingWake> {
        self.pending.drain(..).collect()
    }

    pub fn for_machine(&self, machine: MachineId) -> impl Iterator<Item = &PendingWake> + '_ {
        self.pending.iter().filter(move |w| w.machine == machine)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingWake> + '_ {
        self.pending.iter()
    }

    pub fn has_machine(&self, machine: MachineId) -> bool {
        self.pending.iter().any(|w| w.machine == machine)
    }

    pub fn contains_task(&self, task: TaskId) -> bool {
        self.pending.iter().any(|w| w.task == task)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Memory already promised on `machine`: pending tasks plus one container
    /// overhead per distinct pending container.
    pub fn reserved_memory(&self, machine: MachineId, vm_overhead_mb: u64) -> u64 {
        let mut vms = BTreeSet::new();
        let mut total = 0;
        for w in self.for_machine(machine) {
            total += w.memory_mb;
            if vms.insert(w.vm) {
                total += vm_overhead_mb;
            }
        }
        total
    }

    /// A pending container on `machine` of `vm_type` with room for one more
    /// task, if any.
    pub fn joinable_vm(&self, machine: MachineId, vm_type: VmType, limit: usize) -> Option<VmId> {
        let mut counts: Vec<(VmId, usize)> = Vec::new();
        for w in self.for_machine(machine).filter(|w| w.vm_type == vm_type) {
            match counts.iter_mut().find(|(vm, _)| *vm == w.vm) {
                Some((_, n)) => *n += 1,
                None => counts.push((w.vm, 1)),
            }
        }
        counts
            .into_iter()
            .find(|(_, n)| *n < limit)
            .map(|(vm, _)| vm)
    }
}

// ── PowerPolicy ───────────────────────────────────────────────────────────────

/// Power half of a strategy pair.
pub trait PowerPolicy {
    fn name(&self) -> &'static str;

    /// Idle time after which an empty machine may be powered down.
    fn grace_period(&self, base_grace: Time, state: &ClusterState) -> Time;

    /// Core performance level applied to a machine when it becomes active.
    fn activation_performance(&self) -> CorePerformance {
        CorePerformance::MAX
    }
}

/// Powers machines down after exactly the configured grace period.
#[derive(Debug, Default)]
pub struct FixedGrace;

impl PowerPolicy for FixedGrace {
    fn name(&self) -> &'static str {
        "fixed_grace"
    }

    fn grace_period(&self, base_grace: Time, _state: &ClusterState) -> Time {
        base_grace
    }
}

/// Scales the grace period with how busy the powered-on part of the cluster
/// is: a busy cluster keeps spare machines warm longer, a quiet one releases
/// them sooner.
#[derive(Debug)]
pub struct AdaptiveGrace {
    pub busy_fraction: f64,
    pub quiet_fraction: f64,
}

impl Default for AdaptiveGrace {
    fn default() -> Self {
        Self {
            busy_fraction: 0.75,
            quiet_fraction: 0.25,
        }
    }
}

impl AdaptiveGrace {
    /// Fraction of powered-on machines that are running at least one task.
    pub fn busy_ratio(state: &ClusterState) -> f64 {
        let (on, busy) = state
            .machines()
            .filter(|m| m.power.is_running())
            .fold((0usize, 0usize), |(on, busy), m| {
                (on + 1, busy + usize::from(m.load > 0))
            });
        if on == 0 {
            0.0
        } else {
            busy as f64 / on as f64
        }
    }
}

impl PowerPolicy for AdaptiveGrace {
    fn name(&self) -> &'static str {
        "adaptive_grace"
    }

    fn grace_period(&self, base_grace: Time, state: &ClusterState) -> Time {
        let ratio = Self::busy_ratio(state);
        if ratio >= self.busy_fraction {
            base_grace.saturating_mul(2)
        } else if ratio <= self.quiet_fraction {
            base_grace / 2
        } else {
            base_grace
        }
    }
}

/// Machines whose idle timer has run for at least the policy's grace period,
/// still carry zero load and have no wake records outstanding.
pub fn idle_expired(
    state: &ClusterState,
    wakes: &WakeBook,
    policy: &dyn PowerPolicy,
    base_grace: Time,
    now: Time,
) -> Vec<MachineId> {
    let grace = policy.grace_period(base_grace, state);
    state
        .machines()
        .filter(|m| m.power == PowerState::IdlePending && m.load == 0)
        .filter(|m| {
            m.idle_since
                .is_some_and(|since| now.saturating_sub(since) >= grace)
        })
        .filter(|m| !wakes.has_machine(m.id))
        .map(|m| m.id)
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::tests::info;
    use crate::types::CpuType;

    fn wake(machine: u32, vm: u32, task: u32, memory_mb: u64) -> PendingWake {
        PendingWake {
            machine: MachineId(machine),
            vm: VmId(vm),
            vm_type: VmType::Linux,
            task: TaskId(task),
            memory_mb,
            recorded_at: 0,
        }
    }

    #[test]
    fn take_for_preserves_record_order() {
        let mut book = WakeBook::new();
        book.record(wake(1, 0, 10, 1));
        book.record(wake(2, 1, 11, 1));
        book.record(wake(1, 0, 12, 1));

        let taken: Vec<TaskId> = book.take_for(MachineId(1)).into_iter().map(|w| w.task).collect();
        assert_eq!(taken, vec![TaskId(10), TaskId(12)]);
        assert_eq!(book.len(), 1);
        assert!(!book.has_machine(MachineId(1)));
        assert!(book.contains_task(TaskId(11)));
    }

    #[test]
    fn reserved_memory_charges_each_container_once() {
        let mut book = WakeBook::new();
        book.record(wake(1, 0, 10, 100));
        book.record(wake(1, 0, 11, 50));
        book.record(wake(1, 3, 12, 10));
        assert_eq!(book.reserved_memory(MachineId(1), 8), 100 + 50 + 10 + 2 * 8);
        assert_eq!(book.reserved_memory(MachineId(2), 8), 0);
    }

    #[test]
    fn joinable_vm_respects_limit_and_type() {
        let mut book = WakeBook::new();
        book.record(wake(1, 0, 10, 1));
        book.record(wake(1, 0, 11, 1));
        assert_eq!(book.joinable_vm(MachineId(1), VmType::Linux, 3), Some(VmId(0)));
        assert_eq!(book.joinable_vm(MachineId(1), VmType::Linux, 2), None);
        assert_eq!(book.joinable_vm(MachineId(1), VmType::Win, 3), None);
    }

    fn state(loads: &[usize]) -> ClusterState {
        let mut s = ClusterState::new(0);
        for (i, &load) in loads.iter().enumerate() {
            let id = i as u32;
            s.register_machine(&info(id, CpuType::X86, 4096, PowerState::Active), 0);
            s.add_vm(VmId(id), VmType::Linux, CpuType::X86, MachineId(id));
            for t in 0..load {
                s.record_assignment(TaskId(id * 100 + t as u32), 1, VmId(id), MachineId(id));
            }
        }
        s
    }

    #[test]
    fn adaptive_grace_scales_with_busy_ratio() {
        let policy = AdaptiveGrace::default();
        assert_eq!(policy.grace_period(1_000, &state(&[1, 1, 1, 0])), 2_000);
        assert_eq!(policy.grace_period(1_000, &state(&[1, 0, 0, 0])), 500);
        assert_eq!(policy.grace_period(1_000, &state(&[1, 1, 0, 0])), 1_000);
    }

    #[test]
    fn idle_expired_waits_for_grace() {
        let s = state(&[0, 1]);
        let book = WakeBook::new();
        assert!(idle_expired(&s, &book, &FixedGrace, 100, 99).is_empty());
        assert_eq!(idle_expired(&s, &book, &FixedGrace, 100, 100), vec![MachineId(0)]);
    }

    #[test]
    fn idle_expired_skips_machines_with_pending_wakes() {
        let s = state(&[0]);
        let mut book = WakeBook::new();
        book.record(wake(0, 9, 1, 1));
        assert!(idle_expired(&s, &book, &FixedGrace, 0, 1_000).is_empty());
    }
}
