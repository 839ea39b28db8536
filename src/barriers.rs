use anyhow::{Result, anyhow};
use bitvec::prelude::*;
use rand::Rng;

use crate::rng::SimRng;

/// Direction of travel along the chromosome. `Rev` moves 3'→5' (towards
/// `start`), `Fwd` moves 5'→3' (towards `end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rev,
    Fwd,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Rev => Direction::Fwd,
            Direction::Fwd => Direction::Rev,
        }
    }
}

// ── Extrusion barrier ────────────────────────────────────────────────────────

/// A DNA-bound element (CTCF-like) that blocks extrusion units approaching
/// from its major direction while occupied.
///
/// Occupancy evolves as a two-state Markov chain: an occupied barrier stays
/// occupied with probability `occupied_self_prob`, a vacant one stays vacant
/// with probability `not_occupied_self_prob`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtrusionBarrier {
    pub pos: u64,
    pub occupied_self_prob: f64,
    pub not_occupied_self_prob: f64,
    pub major_direction: Direction,
}

impl ExtrusionBarrier {
    pub fn new(
        pos: u64,
        occupied_self_prob: f64,
        not_occupied_self_prob: f64,
        major_direction: Direction,
    ) -> Result<Self> {
        for (name, p) in [
            ("occupied_self_prob", occupied_self_prob),
            ("not_occupied_self_prob", not_occupied_self_prob),
        ] {
            if !(0.0..=1.0).contains(&p) || !p.is_finite() {
                return Err(anyhow!(
                    "barrier at {}: {} must be in [0, 1], got {}",
                    pos,
                    name,
                    p
                ));
            }
        }
        Ok(Self {
            pos,
            occupied_self_prob,
            not_occupied_self_prob,
            major_direction,
        })
    }

    /// Build a barrier from a parsed BED-like record. `strand` '+' maps to a
    /// fwd-blocking barrier, '-' to rev-blocking; anything else is rejected
    /// ('.'-stranded records carry no orientation and cannot block).
    ///
    /// `occupancy` is the stationary occupancy probability;
    /// `occupied_self_prob` is derived from it and `not_occupied_self_prob`
    /// through detailed balance unless `occupied_self_override` is non-zero.
    pub fn from_record(
        pos: u64,
        strand: char,
        occupancy: f64,
        occupied_self_override: f64,
        not_occupied_self_prob: f64,
    ) -> Result<Self> {
        let major_direction = match strand {
            '+' => Direction::Fwd,
            '-' => Direction::Rev,
            _ => {
                return Err(anyhow!(
                    "barrier at {}: invalid strand '{}' (expected '+' or '-')",
                    pos,
                    strand
                ));
            }
        };
        if !(0.0..=1.0).contains(&occupancy) || !occupancy.is_finite() {
            return Err(anyhow!(
                "barrier at {}: occupancy must be in [0, 1], got {}",
                pos,
                occupancy
            ));
        }
        let occupied_self_prob = if occupied_self_override != 0.0 {
            occupied_self_override
        } else {
            Self::occupied_self_prob_from_occupancy(occupancy, not_occupied_self_prob)
        };
        Self::new(pos, occupied_self_prob, not_occupied_self_prob, major_direction)
    }

    /// Solve the detailed-balance relation
    /// `occ * (1 - p_oo) = (1 - occ) * (1 - p_nn)` for `p_oo`, clamped to
    /// `[0, 1]`. Occupancy 0 and 1 degenerate to never/always occupied.
    pub fn occupied_self_prob_from_occupancy(occupancy: f64, not_occupied_self_prob: f64) -> f64 {
        if occupancy <= 0.0 {
            return 0.0;
        }
        if occupancy >= 1.0 {
            return 1.0;
        }
        let p = 1.0 - (1.0 - not_occupied_self_prob) * (1.0 - occupancy) / occupancy;
        p.clamp(0.0, 1.0)
    }

    /// Stationary probability of being occupied.
    pub fn stationary_occupancy(&self) -> f64 {
        let to_occ = 1.0 - self.not_occupied_self_prob;
        let to_vac = 1.0 - self.occupied_self_prob;
        if to_occ + to_vac == 0.0 {
            // Both states absorbing; split the difference.
            return 0.5;
        }
        to_occ / (to_occ + to_vac)
    }

    pub fn minor_direction(&self) -> Direction {
        self.major_direction.opposite()
    }
}

// ── Occupancy state machine ──────────────────────────────────────────────────

/// Advance one barrier's occupancy by one epoch.
pub fn next_occupancy_state(barrier: &ExtrusionBarrier, occupied: bool, rng: &mut SimRng) -> bool {
    let u: f64 = rng.random();
    if occupied {
        u < barrier.occupied_self_prob
    } else {
        !(u < barrier.not_occupied_self_prob)
    }
}

/// Sample initial occupancy states from each barrier's stationary
/// distribution.
pub fn sample_initial_occupancy(barriers: &[ExtrusionBarrier], mask: &mut BitVec, rng: &mut SimRng) {
    mask.clear();
    mask.resize(barriers.len(), false);
    for (i, b) in barriers.iter().enumerate() {
        mask.set(i, rng.random::<f64>() < b.stationary_occupancy());
    }
}

/// Advance the whole occupancy bitmap by one epoch.
pub fn evolve_occupancy(barriers: &[ExtrusionBarrier], mask: &mut BitVec, rng: &mut SimRng) {
    debug_assert_eq!(barriers.len(), mask.len());
    for (i, b) in barriers.iter().enumerate() {
        let next = next_occupancy_state(b, mask[i], rng);
        mask.set(i, next);
    }
}
