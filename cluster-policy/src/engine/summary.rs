/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::fmt;

use super::EngineStats;
use crate::types::{SlaClass, Time};

/// End-of-run report. Percentages and energy come from the collaborator's
/// meters; the engine only forwards them.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    /// Indexed by [`SlaClass::index`].
    pub sla_violation_pct: [f64; 4],
    pub energy_kwh: f64,
    pub finished_at: Time,
    /// Tasks that were still deferred or waiting on a wake at shutdown.
    pub unplaced: usize,
    pub stats: EngineStats,
}

impl Summary {
    pub fn violation_pct(&self, class: SlaClass) -> f64 {
        self.sla_violation_pct[class.index()]
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SLA violation report")?;
        for class in SlaClass::ALL {
            writeln!(f, "{}: {:.2}%", class, self.violation_pct(class))?;
        }
        writeln!(f, "Total Energy {:.6} KW-Hour", self.energy_kwh)?;
        write!(
            f,
            "Simulation run finished in {:.3} seconds",
            self.finished_at as f64 / 1_000_000.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lists_every_class_and_energy() {
        let s = Summary {
            sla_violation_pct: [0.0, 12.5, 0.0, 0.0],
            energy_kwh: 1.5,
            finished_at: 2_500_000,
            unplaced: 0,
            stats: EngineStats::default(),
        };
        let text = s.to_string();
        assert!(text.contains("SLA1: 12.50%"), "{text}");
        assert!(text.contains("SLA3: 0.00%"), "{text}");
        assert!(text.contains("Total Energy 1.500000 KW-Hour"), "{text}");
        assert!(text.ends_with("2.500 seconds"), "{text}");
    }
}
