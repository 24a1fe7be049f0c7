/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The strategy table.
//!
//! | Strategy | Running machines | Powered-off machines | Power policy |
//! |---|---|---|---|
//! | `least_loaded` | fewest tasks | lowest id | fixed grace |
//! | `energy_aware_bin_pack` | fewest tasks, then least energy used | least energy used | fixed grace |
//! | `high_performance_first` | most MIPS; wakes a fresh machine per task | most MIPS | fixed grace |
//! | `adaptive_idle_consolidation` | most tasks that still fit (packing) | lowest id | adaptive grace |

use std::cmp::Ordering;

use super::PlacementPolicy;
use crate::config::Strategy;
use crate::power::{AdaptiveGrace, FixedGrace, PowerPolicy};
use crate::tracker::MachineEntry;

/// Builds the placement/power pair for `strategy`.
pub fn policies(strategy: Strategy) -> (Box<dyn PlacementPolicy>, Box<dyn PowerPolicy>) {
    match strategy {
        Strategy::LeastLoaded => (Box::new(LeastLoaded), Box::new(FixedGrace)),
        Strategy::EnergyAwareBinPack => (Box::new(EnergyAwareBinPack), Box::new(FixedGrace)),
        Strategy::HighPerformanceFirst => (Box::new(HighPerformanceFirst), Box::new(FixedGrace)),
        Strategy::AdaptiveIdleConsolidation => (
            Box::new(AdaptiveIdleConsolidation),
            Box::new(AdaptiveGrace::default()),
        ),
    }
}

#[derive(Debug, Default)]
pub struct LeastLoaded;

impl PlacementPolicy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn rank_active(&self, a: &MachineEntry, b: &MachineEntry) -> Ordering {
        a.load.cmp(&b.load).then(a.id.cmp(&b.id))
    }
}

/// Least-loaded, with ties (and wake-ups) going to the machine that has
/// consumed the least energy so far.
#[derive(Debug, Default)]
pub struct EnergyAwareBinPack;

impl PlacementPolicy for EnergyAwareBinPack {
    fn name(&self) -> &'static str {
        "energy_aware_bin_pack"
    }

    fn rank_active(&self, a: &MachineEntry, b: &MachineEntry) -> Ordering {
        a.load
            .cmp(&b.load)
            .then(a.energy_kwh.total_cmp(&b.energy_kwh))
            .then(a.id.cmp(&b.id))
    }

    fn rank_offline(&self, a: &MachineEntry, b: &MachineEntry) -> Ordering {
        a.energy_kwh
            .total_cmp(&b.energy_kwh)
            .then(a.id.cmp(&b.id))
    }
}

/// Trades energy for latency: every task gets the fastest idle machine
/// available, waking one if needed.
#[derive(Debug, Default)]
pub struct HighPerformanceFirst;

impl PlacementPolicy for HighPerformanceFirst {
    fn name(&self) -> &'static str {
        "high_performance_first"
    }

    fn rank_active(&self, a: &MachineEntry, b: &MachineEntry) -> Ordering {
        b.capacity_mips()
            .cmp(&a.capacity_mips())
            .then(a.load.cmp(&b.load))
            .then(a.id.cmp(&b.id))
    }

    fn rank_offline(&self, a: &MachineEntry, b: &MachineEntry) -> Ordering {
        b.capacity_mips()
            .cmp(&a.capacity_mips())
            .then(a.id.cmp(&b.id))
    }

    fn prefers_fresh_machine(&self) -> bool {
        true
    }
}

/// Packs tasks onto the busiest machine that still has room so the rest of
/// the cluster drains to zero and can be powered down.
#[derive(Debug, Default)]
pub struct AdaptiveIdleConsolidation;

impl PlacementPolicy for AdaptiveIdleConsolidation {
    fn name(&self) -> &'static str {
        "adaptive_idle_consolidation"
    }

    fn rank_active(&self, a: &MachineEntry, b: &MachineEntry) -> Ordering {
        b.load.cmp(&a.load).then(a.id.cmp(&b.id))
    }

    // An empty container on an otherwise idle machine would keep that
    // machine awake.
    fn prefers_idle_container(&self) -> bool {
        false
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
