/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Offload/Rebalance selection.
//!
//! Only the choice of origin and victim lives here; moving the task is done
//! by the engine, which owns the collaborator and the attempt budget.
//!
//! The origin is the most memory-pressured machine whose used/capacity ratio
//! is *strictly below* 1.0. A machine that is already full is skipped: the
//! engine relieves congested hosts, not saturated ones. When offloading on
//! behalf of a task, machines too small to ever hold it are skipped as well.

use std::collections::BTreeSet;

use crate::tracker::{Assignment, ClusterState};
use crate::types::{CpuType, MachineId, TaskId};

/// Running machine of `cpu` with the highest memory pressure below 100 %
/// that still hosts at least one task and has at least `min_capacity_mb` of
/// memory. Machines in `tried` are skipped; ties go to the lowest id.
pub fn most_pressured(
    state: &ClusterState,
    cpu: CpuType,
    tried: &BTreeSet<MachineId>,
    min_capacity_mb: u64,
) -> Option<MachineId> {
    state
        .machines()
        .filter(|m| m.cpu == cpu && m.power.is_running() && m.load > 0)
        .filter(|m| m.memory_capacity_mb >= min_capacity_mb)
        .filter(|m| !tried.contains(&m.id))
        .map(|m| (m.id, m.memory_pressure()))
        .filter(|(_, ratio)| *ratio < 1.0)
        .fold(None, |best: Option<(MachineId, f64)>, (id, ratio)| match best {
            Some((_, r)) if r >= ratio => best,
            _ => Some((id, ratio)),
        })
        .map(|(id, _)| id)
}

/// Tasks on `origin` in the order they should be tried as victims: largest
/// memory first, so one move frees as much as possible.
pub fn victims(state: &ClusterState, origin: MachineId) -> Vec<(TaskId, Assignment)> {
    let mut tasks = state.tasks_on(origin);
    tasks.sort_by(|(ta, a), (tb, b)| b.memory_mb.cmp(&a.memory_mb).then(ta.cmp(tb)));
    tasks
}

// ── Tests ─────────────────────────────────────────────────────────────────────
