use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use bitvec::prelude::*;
use rand::Rng;
use rand::distr::weighted::WeightedIndex;
use rand::distr::{Bernoulli, Distribution};
use rand_distr::Normal;

use crate::barriers::{
    Direction, ExtrusionBarrier, evolve_occupancy, sample_initial_occupancy,
};
use crate::config::{Config, StoppingCondition};
use crate::genome::{Chromosome, Genome};
use crate::lefs::Lef;
use crate::matrix::ContactMatrix;
use crate::rng::{GenExtremeValue, SimRng, task_rng};

// ── Collision codes ──────────────────────────────────────────────────────────

/// What blocked an extrusion unit in the current epoch.
///
/// Values `0..nbarriers` name a barrier; `nbarriers..nbarriers + nlefs` a
/// primary (head-on) collision with the opposing unit of that LEF;
/// `nbarriers + nlefs..` a secondary (same-direction) collision with that
/// LEF. The two sentinels sit at the top of the range.
pub type Collision = usize;

pub const NO_COLLISION: Collision = usize::MAX;
pub const REACHED_CHROM_BOUNDARY: Collision = usize::MAX - 1;

#[inline]
pub fn is_lef_bar_collision(c: Collision, nbarriers: usize) -> bool {
    c < nbarriers
}

#[inline]
pub fn is_primary_lef_lef_collision(c: Collision, nbarriers: usize, nlefs: usize) -> bool {
    c >= nbarriers && c < nbarriers + nlefs
}

#[inline]
pub fn is_secondary_lef_lef_collision(c: Collision, nbarriers: usize, nlefs: usize) -> bool {
    c >= nbarriers + nlefs && c < REACHED_CHROM_BOUNDARY
}

// ── Task & state ─────────────────────────────────────────────────────────────

/// One unit of work: simulate a single cell (replicate) of one chromosome.
#[derive(Debug, Clone, Copy)]
pub struct Task<'a> {
    pub id: usize,
    pub chrom: &'a Chromosome,
    pub cell_id: usize,
    /// Post-burn-in epochs to run; `u64::MAX` when targeting a contact count.
    pub target_epochs: u64,
    /// Contacts this task should register; `u64::MAX` when targeting epochs.
    pub target_contacts: u64,
    pub num_lefs: usize,
    pub barriers: &'a [ExtrusionBarrier],
    pub seed: u64,
}

/// Task fields plus the preallocated scratch buffers one worker reuses
/// across tasks.
pub struct State<'a> {
    pub id: usize,
    pub chrom: &'a Chromosome,
    pub cell_id: usize,
    pub target_epochs: u64,
    pub target_contacts: u64,
    pub num_lefs: usize,
    pub barriers: &'a [ExtrusionBarrier],
    pub seed: u64,

    pub lefs: Vec<Lef>,
    pub rev_ranks: Vec<usize>,
    pub fwd_ranks: Vec<usize>,
    pub rev_moves: Vec<u64>,
    pub fwd_moves: Vec<u64>,
    pub rev_collisions: Vec<Collision>,
    pub fwd_collisions: Vec<Collision>,
    pub idx_buff: Vec<usize>,
    pub epoch_buff: Vec<u64>,
    pub unloader_affinity: Vec<f64>,
    pub binding_mask: BitVec,
    pub barrier_mask: BitVec,
    pub rng: SimRng,

    pub epoch: u64,
    pub num_registered_contacts: u64,
}

impl<'a> State<'a> {
    pub fn from_task(task: Task<'a>) -> Self {
        let mut state = Self {
            id: task.id,
            chrom: task.chrom,
            cell_id: task.cell_id,
            target_epochs: task.target_epochs,
            target_contacts: task.target_contacts,
            num_lefs: task.num_lefs,
            barriers: task.barriers,
            seed: task.seed,
            lefs: Vec::new(),
            rev_ranks: Vec::new(),
            fwd_ranks: Vec::new(),
            rev_moves: Vec::new(),
            fwd_moves: Vec::new(),
            rev_collisions: Vec::new(),
            fwd_collisions: Vec::new(),
            idx_buff: Vec::new(),
            epoch_buff: Vec::new(),
            unloader_affinity: Vec::new(),
            binding_mask: BitVec::new(),
            barrier_mask: BitVec::new(),
            rng: task_rng(task.seed, task.chrom.id as u64, task.cell_id as u64),
            epoch: 0,
            num_registered_contacts: 0,
        };
        state.resize_buffers();
        state.reset_buffers();
        state
    }

    /// Rebind this state to a new task, reusing the buffers.
    pub fn assign(&mut self, task: Task<'a>) {
        self.id = task.id;
        self.chrom = task.chrom;
        self.cell_id = task.cell_id;
        self.target_epochs = task.target_epochs;
        self.target_contacts = task.target_contacts;
        self.num_lefs = task.num_lefs;
        self.barriers = task.barriers;
        self.seed = task.seed;
        self.rng = task_rng(task.seed, task.chrom.id as u64, task.cell_id as u64);
        self.resize_buffers();
        self.reset_buffers();
    }

    fn resize_buffers(&mut self) {
        let n = self.num_lefs;
        self.lefs.resize(n, Lef::default());
        self.rev_ranks.resize(n, 0);
        self.fwd_ranks.resize(n, 0);
        self.rev_moves.resize(n, 0);
        self.fwd_moves.resize(n, 0);
        self.rev_collisions.resize(n, NO_COLLISION);
        self.fwd_collisions.resize(n, NO_COLLISION);
        self.idx_buff.resize(n, 0);
        self.epoch_buff.resize(n, 0);
        self.unloader_affinity.resize(n, 0.0);
        self.binding_mask.resize(n, false);
        self.barrier_mask.resize(self.barriers.len(), false);
    }

    fn reset_buffers(&mut self) {
        self.lefs.iter_mut().for_each(Lef::reset);
        for (i, r) in self.rev_ranks.iter_mut().enumerate() {
            *r = i;
        }
        self.fwd_ranks.copy_from_slice(&self.rev_ranks);
        self.rev_moves.fill(0);
        self.fwd_moves.fill(0);
        self.rev_collisions.fill(NO_COLLISION);
        self.fwd_collisions.fill(NO_COLLISION);
        self.idx_buff.fill(0);
        self.epoch_buff.fill(0);
        self.unloader_affinity.fill(0.0);
        self.binding_mask.fill(false);
        self.barrier_mask.fill(false);
        self.epoch = 0;
        self.num_registered_contacts = 0;
    }
}

/// Shared progress counters updated by the kernel with relaxed ordering.
#[derive(Debug, Default)]
pub struct Counters {
    /// Extrusion events (bound LEFs stepped) since the last progress poll.
    pub extrusion_events: AtomicU64,
    /// Progress ticks: epochs in iteration mode, contacts in density mode.
    pub ticks: AtomicU64,
}

// ── Simulation ───────────────────────────────────────────────────────────────

/// The loop-extrusion simulator: configuration, genome, and the cached
/// distributions every task draws from.
pub struct Simulation {
    config: Config,
    genome: Genome,
    rev_move_dist: Option<Normal<f64>>,
    fwd_move_dist: Option<Normal<f64>>,
    contact_sampling_dist: Bernoulli,
    noise_dist: Option<GenExtremeValue>,
}

impl Simulation {
    pub fn new(config: Config, genome: Genome) -> Result<Self> {
        config.validate()?;
        if genome.is_empty() {
            return Err(anyhow!("the genome contains no chromosomes"));
        }
        let rev_move_dist = if config.rev_extrusion_speed_std > 0.0 {
            Some(Normal::new(
                config.rev_extrusion_speed as f64,
                config.rev_extrusion_speed_std,
            )?)
        } else {
            None
        };
        let fwd_move_dist = if config.fwd_extrusion_speed_std > 0.0 {
            Some(Normal::new(
                config.fwd_extrusion_speed as f64,
                config.fwd_extrusion_speed_std,
            )?)
        } else {
            None
        };
        let contact_sampling_dist = Bernoulli::new(1.0 / config.contact_sampling_interval as f64)?;
        let noise_dist = if config.randomize_contact_registration {
            Some(GenExtremeValue::new(
                config.genextreme_mu,
                config.genextreme_sigma,
                config.genextreme_xi,
            )?)
        } else {
            None
        };
        Ok(Self {
            config,
            genome,
            rev_move_dist,
            fwd_move_dist,
            contact_sampling_dist,
            noise_dist,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn genome(&self) -> &Genome {
        &self.genome
    }

    // ── Binding & ranking ────────────────────────────────────────────────────

    /// Bind every free LEF whose bit is set in `mask` at a uniformly random
    /// position (zero-length loop), then re-rank all units.
    pub fn bind_lefs(
        chrom: &Chromosome,
        lefs: &mut [Lef],
        rev_ranks: &mut [usize],
        fwd_ranks: &mut [usize],
        mask: &BitVec,
        rng: &mut SimRng,
        current_epoch: u64,
    ) {
        for (i, lef) in lefs.iter_mut().enumerate() {
            if !lef.bound && mask[i] {
                let pos = rng.random_range(chrom.start..chrom.end);
                lef.bind_at(pos, current_epoch);
            }
        }
        Self::rank_lefs(lefs, rev_ranks, fwd_ranks, false);
    }

    /// Sort the rank permutations by unit position. Ties are broken by
    /// binding epoch (ascending for rev units, descending for fwd units) so
    /// exact overlaps behave deterministically: a zero-length loop nests
    /// inside the loop it landed on.
    pub fn rank_lefs(
        lefs: &[Lef],
        rev_ranks: &mut [usize],
        fwd_ranks: &mut [usize],
        init_buffers: bool,
    ) {
        if init_buffers {
            for (i, r) in rev_ranks.iter_mut().enumerate() {
                *r = i;
            }
            fwd_ranks.copy_from_slice(rev_ranks);
        }
        // Positions barely change between epochs, so the adaptive stable
        // sort runs in near-linear time on these buffers.
        rev_ranks.sort_by(|&a, &b| {
            lefs[a]
                .rev_unit
                .pos
                .cmp(&lefs[b].rev_unit.pos)
                .then(lefs[a].binding_epoch.cmp(&lefs[b].binding_epoch))
        });
        fwd_ranks.sort_by(|&a, &b| {
            lefs[a]
                .fwd_unit
                .pos
                .cmp(&lefs[b].fwd_unit.pos)
                .then(lefs[b].binding_epoch.cmp(&lefs[a].binding_epoch))
        });
    }

    // ── Move generation ──────────────────────────────────────────────────────

    fn generate_rev_move(&self, chrom: &Chromosome, pos: u64, rng: &mut SimRng) -> u64 {
        debug_assert!(pos >= chrom.start);
        let headroom = pos - chrom.start;
        match &self.rev_move_dist {
            None => (self.config.rev_extrusion_speed).min(headroom),
            Some(dist) => {
                let draw = dist.sample(rng).round();
                (draw.max(0.0) as u64).min(headroom)
            }
        }
    }

    fn generate_fwd_move(&self, chrom: &Chromosome, pos: u64, rng: &mut SimRng) -> u64 {
        debug_assert!(pos < chrom.end);
        let headroom = (chrom.end - 1) - pos;
        match &self.fwd_move_dist {
            None => (self.config.fwd_extrusion_speed).min(headroom),
            Some(dist) => {
                let draw = dist.sample(rng).round();
                (draw.max(0.0) as u64).min(headroom)
            }
        }
    }

    /// Draw moves for every bound LEF (free LEFs get zero), then optionally
    /// stop consecutive same-direction units from bypassing each other.
    pub fn generate_moves(
        &self,
        chrom: &Chromosome,
        lefs: &[Lef],
        rev_ranks: &[usize],
        fwd_ranks: &[usize],
        rev_moves: &mut [u64],
        fwd_moves: &mut [u64],
        rng: &mut SimRng,
        adjust_moves: bool,
    ) {
        debug_assert_eq!(lefs.len(), rev_moves.len());
        debug_assert_eq!(lefs.len(), fwd_moves.len());
        for (i, lef) in lefs.iter().enumerate() {
            rev_moves[i] = if lef.bound {
                self.generate_rev_move(chrom, lef.rev_unit.pos, rng)
            } else {
                0
            };
            fwd_moves[i] = if lef.bound {
                self.generate_fwd_move(chrom, lef.fwd_unit.pos, rng)
            } else {
                0
            };
        }
        if adjust_moves {
            Self::adjust_moves_of_consecutive_units(
                chrom, lefs, rev_ranks, fwd_ranks, rev_moves, fwd_moves,
            );
        }
    }

    /// Keep consecutive same-direction units from crossing: when the unit in
    /// front would be overtaken, its move is raised so the pair ends one bp
    /// apart, approximating the trailing unit pushing the leading one.
    pub fn adjust_moves_of_consecutive_units(
        chrom: &Chromosome,
        lefs: &[Lef],
        rev_ranks: &[usize],
        fwd_ranks: &[usize],
        rev_moves: &mut [u64],
        fwd_moves: &mut [u64],
    ) {
        let n = lefs.len();
        if n < 2 {
            return;
        }
        for i in 0..n - 1 {
            // Rev units in 3'→5' order: the leading unit is the one closer
            // to the 5' end.
            let idx1 = rev_ranks[n - 2 - i];
            let idx2 = rev_ranks[n - 1 - i];
            if lefs[idx1].bound && lefs[idx2].bound {
                let pos1 = lefs[idx1].rev_unit.pos - rev_moves[idx1];
                let pos2 = lefs[idx2].rev_unit.pos - rev_moves[idx2];
                if pos2 <= pos1 {
                    let target = pos2.saturating_sub(1).max(chrom.start);
                    rev_moves[idx1] = lefs[idx1].rev_unit.pos - target;
                }
            }

            // Mirror image for fwd units in 5'→3' order.
            let idx3 = fwd_ranks[i];
            let idx4 = fwd_ranks[i + 1];
            if lefs[idx3].bound && lefs[idx4].bound {
                let pos3 = lefs[idx3].fwd_unit.pos + fwd_moves[idx3];
                let pos4 = lefs[idx4].fwd_unit.pos + fwd_moves[idx4];
                if pos3 >= pos4 {
                    let target = (pos3 + 1).min(chrom.end - 1);
                    fwd_moves[idx4] = target - lefs[idx4].fwd_unit.pos;
                }
            }
        }
    }

    // ── Collision detection & resolution ─────────────────────────────────────

    /// Flag units that reach the chromosome boundary this epoch, clamping
    /// their move to land exactly on it. Returns the number of rev units at
    /// the 5' end and fwd units at the 3' end.
    pub fn detect_units_at_chrom_boundaries(
        chrom: &Chromosome,
        lefs: &[Lef],
        rev_ranks: &[usize],
        fwd_ranks: &[usize],
        rev_moves: &mut [u64],
        fwd_moves: &mut [u64],
        rev_collisions: &mut [Collision],
        fwd_collisions: &mut [Collision],
    ) -> (usize, usize) {
        let mut num_rev_at_5prime = 0;
        for &idx in rev_ranks {
            let lef = &lefs[idx];
            if !lef.bound {
                continue;
            }
            if lef.rev_unit.pos - rev_moves[idx] <= chrom.start {
                rev_collisions[idx] = REACHED_CHROM_BOUNDARY;
                rev_moves[idx] = lef.rev_unit.pos - chrom.start;
                num_rev_at_5prime += 1;
            } else {
                // Units are ranked by position and cannot cross, so the
                // first unit clear of the boundary ends the scan.
                break;
            }
        }

        let mut num_fwd_at_3prime = 0;
        for &idx in fwd_ranks.iter().rev() {
            let lef = &lefs[idx];
            if !lef.bound {
                continue;
            }
            if lef.fwd_unit.pos + fwd_moves[idx] >= chrom.end - 1 {
                fwd_collisions[idx] = REACHED_CHROM_BOUNDARY;
                fwd_moves[idx] = (chrom.end - 1) - lef.fwd_unit.pos;
                num_fwd_at_3prime += 1;
            } else {
                break;
            }
        }
        (num_rev_at_5prime, num_fwd_at_3prime)
    }

    /// Record, for each moving unit, the first occupied barrier it would
    /// run into this epoch. Only barriers blocking in the unit's direction
    /// count; each encounter may be bypassed with the configured
    /// probability, drawn independently. A unit never scans past the
    /// adjacent same-direction unit: the barrier belongs to whichever unit
    /// reaches it first, trailing units pile up behind it instead.
    #[allow(clippy::too_many_arguments)]
    pub fn detect_lef_bar_collisions(
        &self,
        lefs: &[Lef],
        rev_ranks: &[usize],
        fwd_ranks: &[usize],
        rev_moves: &[u64],
        fwd_moves: &[u64],
        barriers: &[ExtrusionBarrier],
        barrier_mask: &BitVec,
        rev_collisions: &mut [Collision],
        fwd_collisions: &mut [Collision],
        rng: &mut SimRng,
    ) {
        debug_assert_eq!(barriers.len(), barrier_mask.len());
        let p_bypass = self.config.probability_of_extrusion_unit_bypass;

        // Rev units, 5'→3': the unit ahead (towards 5') claims barriers
        // first.
        let mut ahead_pos: Option<u64> = None;
        for &i in rev_ranks {
            if !lefs[i].bound {
                continue;
            }
            let pos = lefs[i].rev_unit.pos;
            if rev_collisions[i] == NO_COLLISION && rev_moves[i] > 0 {
                let lo = pos - rev_moves[i];
                let hi = barriers.partition_point(|b| b.pos < pos);
                for k in (0..hi).rev() {
                    if barriers[k].pos < lo {
                        break;
                    }
                    if ahead_pos.is_some_and(|p| barriers[k].pos <= p) {
                        break;
                    }
                    if !barrier_mask[k] || barriers[k].major_direction != Direction::Rev {
                        continue;
                    }
                    if p_bypass > 0.0 && rng.random_bool(p_bypass) {
                        continue;
                    }
                    rev_collisions[i] = k;
                    break;
                }
            }
            ahead_pos = Some(pos);
        }

        // Fwd units, 3'→5': the unit ahead (towards 3') claims barriers
        // first.
        let mut ahead_pos: Option<u64> = None;
        for &i in fwd_ranks.iter().rev() {
            if !lefs[i].bound {
                continue;
            }
            let pos = lefs[i].fwd_unit.pos;
            if fwd_collisions[i] == NO_COLLISION && fwd_moves[i] > 0 {
                let hi = pos + fwd_moves[i];
                let lo = barriers.partition_point(|b| b.pos <= pos);
                for (k, barrier) in barriers.iter().enumerate().skip(lo) {
                    if barrier.pos > hi {
                        break;
                    }
                    if ahead_pos.is_some_and(|p| barrier.pos >= p) {
                        break;
                    }
                    if !barrier_mask[k] || barrier.major_direction != Direction::Fwd {
                        continue;
                    }
                    if p_bypass > 0.0 && rng.random_bool(p_bypass) {
                        continue;
                    }
                    fwd_collisions[i] = k;
                    break;
                }
            }
            ahead_pos = Some(pos);
        }
    }

    /// Meeting point of two facing units closing on each other, by
    /// relative-velocity intersection. Returns the positions the rev and
    /// fwd unit should land on (rev one bp past fwd).
    pub fn compute_lef_lef_collision_pos(
        rev_pos: u64,
        fwd_pos: u64,
        rev_move: u64,
        fwd_move: u64,
    ) -> (u64, u64) {
        debug_assert!(rev_pos >= fwd_pos);
        let relative_speed = rev_move + fwd_move;
        if relative_speed == 0 || rev_pos == fwd_pos {
            return (rev_pos, fwd_pos);
        }
        let time_to_collision = (rev_pos - fwd_pos) as f64 / relative_speed as f64;
        let collision_pos = fwd_pos + (fwd_move as f64 * time_to_collision).round() as u64;
        debug_assert!(collision_pos <= rev_pos);
        if collision_pos == fwd_pos {
            (collision_pos + 1, collision_pos)
        } else {
            (collision_pos, collision_pos - 1)
        }
    }

    /// Record head-on collisions between adjacent rev/fwd unit pairs whose
    /// corrected trajectories meet. Each unit's slot encodes the opposing
    /// LEF as `nbarriers + lef`.
    pub fn detect_primary_lef_lef_collisions(
        &self,
        lefs: &[Lef],
        barriers: &[ExtrusionBarrier],
        rev_ranks: &[usize],
        fwd_ranks: &[usize],
        rev_moves: &[u64],
        fwd_moves: &[u64],
        rev_collisions: &mut [Collision],
        fwd_collisions: &mut [Collision],
    ) {
        let n = lefs.len();
        let nbar = barriers.len();
        if n < 2 {
            return;
        }

        let mut j = 0usize;
        for (k, &fi) in fwd_ranks.iter().enumerate() {
            if !lefs[fi].bound {
                continue;
            }
            let fpos = lefs[fi].fwd_unit.pos;

            // First bound rev unit at or past this fwd unit (its own rev
            // unit only ties at a zero-length loop and is skipped).
            while j < n {
                let ri = rev_ranks[j];
                if !lefs[ri].bound || lefs[ri].rev_unit.pos < fpos || ri == fi {
                    j += 1;
                    continue;
                }
                break;
            }
            if j >= n {
                break;
            }
            let ri = rev_ranks[j];
            let rpos = lefs[ri].rev_unit.pos;

            // If a later fwd unit sits closer to this rev unit, that pair is
            // the adjacent one.
            if let Some(&fi2) = fwd_ranks[k + 1..].iter().find(|&&x| lefs[x].bound) {
                if fi2 != ri && lefs[fi2].fwd_unit.pos <= rpos {
                    continue;
                }
            }

            // Effective moves once an already-recorded barrier stall is
            // accounted for.
            let rc = rev_collisions[ri];
            let rm = if is_lef_bar_collision(rc, nbar) {
                rpos - (barriers[rc].pos + 1).min(rpos)
            } else {
                rev_moves[ri]
            };
            let fc = fwd_collisions[fi];
            let fm = if is_lef_bar_collision(fc, nbar) {
                (barriers[fc].pos - 1).max(fpos) - fpos
            } else {
                fwd_moves[fi]
            };
            // Collide when the trajectories meet or end within the two-pixel
            // standoff the collision positions resolve to.
            if rpos - rm <= fpos + fm + 2 {
                if rev_collisions[ri] == NO_COLLISION {
                    rev_collisions[ri] = nbar + fi;
                }
                if fwd_collisions[fi] == NO_COLLISION {
                    fwd_collisions[fi] = nbar + ri;
                }
            }
        }
    }

    /// Clamp moves of barrier-blocked units so they stop on the approach
    /// side of the barrier.
    pub fn correct_moves_for_lef_bar_collisions(
        lefs: &[Lef],
        barriers: &[ExtrusionBarrier],
        rev_moves: &mut [u64],
        fwd_moves: &mut [u64],
        rev_collisions: &[Collision],
        fwd_collisions: &[Collision],
    ) {
        let nbar = barriers.len();
        for (i, lef) in lefs.iter().enumerate() {
            let rc = rev_collisions[i];
            if is_lef_bar_collision(rc, nbar) {
                let stop = (barriers[rc].pos + 1).min(lef.rev_unit.pos);
                rev_moves[i] = lef.rev_unit.pos - stop;
            }
            let fc = fwd_collisions[i];
            if is_lef_bar_collision(fc, nbar) {
                let stop = (barriers[fc].pos - 1).max(lef.fwd_unit.pos);
                fwd_moves[i] = stop - lef.fwd_unit.pos;
            }
        }
    }

    /// Set the moves of primarily colliding pairs so both units land on the
    /// meeting point; a unit whose partner is stalled elsewhere stops one bp
    /// short of the partner's final position.
    pub fn correct_moves_for_primary_lef_lef_collisions(
        lefs: &[Lef],
        nbarriers: usize,
        rev_moves: &mut [u64],
        fwd_moves: &mut [u64],
        rev_collisions: &[Collision],
        fwd_collisions: &[Collision],
    ) {
        let nlefs = lefs.len();
        for i in 0..nlefs {
            let rc = rev_collisions[i];
            if is_primary_lef_lef_collision(rc, nbarriers, nlefs) {
                let partner = rc - nbarriers;
                let rev_pos = lefs[i].rev_unit.pos;
                let fwd_pos = lefs[partner].fwd_unit.pos;
                let fc = fwd_collisions[partner];
                if is_primary_lef_lef_collision(fc, nbarriers, nlefs) && fc - nbarriers == i {
                    let (rev_stop, fwd_stop) = Self::compute_lef_lef_collision_pos(
                        rev_pos,
                        fwd_pos,
                        rev_moves[i],
                        fwd_moves[partner],
                    );
                    rev_moves[i] = rev_pos - rev_stop.min(rev_pos);
                    fwd_moves[partner] = fwd_stop.max(fwd_pos) - fwd_pos;
                } else {
                    // Partner stalled by a barrier or boundary; stop right
                    // next to where it will end up.
                    let partner_stop = fwd_pos + fwd_moves[partner];
                    let stop = (partner_stop + 1).min(rev_pos);
                    rev_moves[i] = rev_pos - stop;
                }
            }

            let fc = fwd_collisions[i];
            if is_primary_lef_lef_collision(fc, nbarriers, nlefs) {
                let partner = fc - nbarriers;
                let rc_partner = rev_collisions[partner];
                if is_primary_lef_lef_collision(rc_partner, nbarriers, nlefs)
                    && rc_partner - nbarriers == i
                {
                    // Mutual pair, already handled from the rev side.
                    continue;
                }
                let fwd_pos = lefs[i].fwd_unit.pos;
                let partner_stop = lefs[partner].rev_unit.pos - rev_moves[partner];
                let stop = partner_stop.saturating_sub(1).max(fwd_pos);
                fwd_moves[i] = stop - fwd_pos;
            }
        }
    }

    /// Stall trailing same-direction units behind stalled leaders, one bp
    /// back, cascading until a pass changes nothing (at most `num_lefs`
    /// passes).
    pub fn process_secondary_lef_lef_collisions(
        lefs: &[Lef],
        nbarriers: usize,
        rev_ranks: &[usize],
        fwd_ranks: &[usize],
        rev_moves: &mut [u64],
        fwd_moves: &mut [u64],
        rev_collisions: &mut [Collision],
        fwd_collisions: &mut [Collision],
    ) {
        let n = lefs.len();
        if n < 2 {
            return;
        }
        let secondary_base = nbarriers + n;

        for _ in 0..n {
            let mut changed = false;

            // Rev units: the leader is the next unit towards the 5' end.
            for k in 0..n - 1 {
                let lead = rev_ranks[k];
                let trail = rev_ranks[k + 1];
                if !lefs[lead].bound || !lefs[trail].bound {
                    continue;
                }
                if rev_collisions[lead] == NO_COLLISION
                    || rev_collisions[trail] != NO_COLLISION
                {
                    continue;
                }
                let lead_stop = lefs[lead].rev_unit.pos - rev_moves[lead];
                let trail_stop = lefs[trail].rev_unit.pos - rev_moves[trail];
                if trail_stop <= lead_stop {
                    let stop = (lead_stop + 1).min(lefs[trail].rev_unit.pos);
                    rev_moves[trail] = lefs[trail].rev_unit.pos - stop;
                    rev_collisions[trail] = secondary_base + lead;
                    changed = true;
                }
            }

            // Fwd units: the leader is the next unit towards the 3' end.
            for k in (0..n - 1).rev() {
                let trail = fwd_ranks[k];
                let lead = fwd_ranks[k + 1];
                if !lefs[lead].bound || !lefs[trail].bound {
                    continue;
                }
                if fwd_collisions[lead] == NO_COLLISION
                    || fwd_collisions[trail] != NO_COLLISION
                {
                    continue;
                }
                let lead_stop = lefs[lead].fwd_unit.pos + fwd_moves[lead];
                let trail_stop = lefs[trail].fwd_unit.pos + fwd_moves[trail];
                if trail_stop >= lead_stop {
                    let stop = lead_stop.saturating_sub(1).max(lefs[trail].fwd_unit.pos);
                    fwd_moves[trail] = stop - lefs[trail].fwd_unit.pos;
                    fwd_collisions[trail] = secondary_base + lead;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Run every collision pass in the order they depend on each other.
    /// Returns the boundary-unit counts from the first pass.
    #[allow(clippy::too_many_arguments)]
    pub fn process_collisions(
        &self,
        chrom: &Chromosome,
        lefs: &[Lef],
        barriers: &[ExtrusionBarrier],
        barrier_mask: &BitVec,
        rev_ranks: &[usize],
        fwd_ranks: &[usize],
        rev_moves: &mut [u64],
        fwd_moves: &mut [u64],
        rev_collisions: &mut [Collision],
        fwd_collisions: &mut [Collision],
        rng: &mut SimRng,
    ) -> (usize, usize) {
        let boundary_counts = Self::detect_units_at_chrom_boundaries(
            chrom,
            lefs,
            rev_ranks,
            fwd_ranks,
            rev_moves,
            fwd_moves,
            rev_collisions,
            fwd_collisions,
        );
        self.detect_lef_bar_collisions(
            lefs,
            rev_ranks,
            fwd_ranks,
            rev_moves,
            fwd_moves,
            barriers,
            barrier_mask,
            rev_collisions,
            fwd_collisions,
            rng,
        );
        self.detect_primary_lef_lef_collisions(
            lefs,
            barriers,
            rev_ranks,
            fwd_ranks,
            rev_moves,
            fwd_moves,
            rev_collisions,
            fwd_collisions,
        );
        Self::correct_moves_for_lef_bar_collisions(
            lefs,
            barriers,
            rev_moves,
            fwd_moves,
            rev_collisions,
            fwd_collisions,
        );
        Self::correct_moves_for_primary_lef_lef_collisions(
            lefs,
            barriers.len(),
            rev_moves,
            fwd_moves,
            rev_collisions,
            fwd_collisions,
        );
        Self::process_secondary_lef_lef_collisions(
            lefs,
            barriers.len(),
            rev_ranks,
            fwd_ranks,
            rev_moves,
            fwd_moves,
            rev_collisions,
            fwd_collisions,
        );
        boundary_counts
    }

    // ── Extrusion & contact registration ─────────────────────────────────────

    /// Apply the corrected moves. Boundary-flagged units carry moves clamped
    /// to land exactly on the boundary, so every bound LEF is stepped.
    pub fn extrude(lefs: &mut [Lef], rev_moves: &[u64], fwd_moves: &[u64]) {
        for (i, lef) in lefs.iter_mut().enumerate() {
            if !lef.bound {
                continue;
            }
            lef.rev_unit.pos -= rev_moves[i];
            lef.fwd_unit.pos += fwd_moves[i];
            debug_assert!(lef.rev_unit.pos <= lef.fwd_unit.pos);
        }
    }

    /// Register one contact per selected bound LEF at the bin pair spanned
    /// by its two units. Units sitting on the outermost bp of the range are
    /// skipped. Returns the number of contacts registered.
    pub fn register_contacts(
        &self,
        chrom: &Chromosome,
        contacts: &ContactMatrix,
        lefs: &[Lef],
        selected_lef_idx: &[usize],
    ) -> u64 {
        let start_pos = chrom.start + 1;
        let end_pos = chrom.end - 1;
        let mut new_contacts = 0;
        for &i in selected_lef_idx {
            let lef = &lefs[i];
            if lef.bound
                && lef.rev_unit.pos > start_pos
                && lef.rev_unit.pos < end_pos
                && lef.fwd_unit.pos > start_pos
                && lef.fwd_unit.pos < end_pos
            {
                let bin1 = ((lef.rev_unit.pos - start_pos) / self.config.bin_size) as usize;
                let bin2 = ((lef.fwd_unit.pos - start_pos) / self.config.bin_size) as usize;
                contacts.increment(bin1, bin2);
                new_contacts += 1;
            }
        }
        new_contacts
    }

    /// Like [`Self::register_contacts`] but blurs each unit position with
    /// generalized-extreme-value noise first; positions blurred out of the
    /// range are dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn register_contacts_with_noise(
        &self,
        chrom: &Chromosome,
        contacts: &ContactMatrix,
        lefs: &[Lef],
        selected_lef_idx: &[usize],
        noise: &GenExtremeValue,
        rng: &mut SimRng,
    ) -> u64 {
        let start_pos = chrom.start + 1;
        let end_pos = chrom.end - 1;
        let range = (end_pos - start_pos) as f64;
        let mut new_contacts = 0;
        for &i in selected_lef_idx {
            let lef = &lefs[i];
            if lef.bound
                && lef.rev_unit.pos > start_pos
                && lef.rev_unit.pos < end_pos
                && lef.fwd_unit.pos > start_pos
                && lef.fwd_unit.pos < end_pos
            {
                let p1 = (lef.rev_unit.pos - start_pos) as f64 - noise.sample(rng);
                let p2 = (lef.fwd_unit.pos - start_pos) as f64 + noise.sample(rng);
                if p1 < 0.0 || p2 < 0.0 || p1 > range || p2 > range {
                    continue;
                }
                let bin1 = (p1.round() as u64 / self.config.bin_size) as usize;
                let bin2 = (p2.round() as u64 / self.config.bin_size) as usize;
                contacts.increment(bin1, bin2);
                new_contacts += 1;
            }
        }
        new_contacts
    }

    // ── Release & rebind ─────────────────────────────────────────────────────

    /// Release affinity per LEF: 0 for free LEFs, 1 by default, divided by
    /// the soft/hard stall multiplier when one or both units are stalled at
    /// barriers (hard requires a convergent pair).
    pub fn generate_lef_unloader_affinities(
        &self,
        lefs: &[Lef],
        barriers: &[ExtrusionBarrier],
        rev_collisions: &[Collision],
        fwd_collisions: &[Collision],
        lef_unloader_affinity: &mut [f64],
    ) {
        let nbar = barriers.len();
        for (i, lef) in lefs.iter().enumerate() {
            lef_unloader_affinity[i] = if !lef.bound {
                0.0
            } else {
                let rev_stalled = is_lef_bar_collision(rev_collisions[i], nbar);
                let fwd_stalled = is_lef_bar_collision(fwd_collisions[i], nbar);
                if rev_stalled && fwd_stalled {
                    // Only major-direction barriers block, so a double stall
                    // is always a convergent (hard) one.
                    debug_assert_eq!(
                        barriers[rev_collisions[i]].major_direction,
                        Direction::Rev
                    );
                    debug_assert_eq!(
                        barriers[fwd_collisions[i]].major_direction,
                        Direction::Fwd
                    );
                    1.0 / self.config.hard_stall_multiplier
                } else if rev_stalled || fwd_stalled {
                    1.0 / self.config.soft_stall_multiplier
                } else {
                    1.0
                }
            };
        }
    }

    /// Number of LEFs to release this epoch so the mean bound lifetime
    /// matches `average_lef_lifetime` bp of extrusion.
    pub fn num_lefs_to_release(&self, num_bound: usize) -> usize {
        let bp_per_epoch =
            (self.config.rev_extrusion_speed + self.config.fwd_extrusion_speed) as f64;
        let n = (num_bound as f64 * bp_per_epoch / self.config.average_lef_lifetime as f64)
            .round() as usize;
        n.min(num_bound)
    }

    /// Draw (with replacement) the indices of LEFs to release, weighted by
    /// unloader affinity.
    pub fn select_lefs_to_release(
        lef_idx: &mut [usize],
        lef_unloader_affinity: &[f64],
        rng: &mut SimRng,
    ) -> Result<()> {
        let dist = WeightedIndex::new(lef_unloader_affinity.iter().copied())
            .context("failed to build the LEF release distribution")?;
        for slot in lef_idx.iter_mut() {
            *slot = dist.sample(rng);
        }
        Ok(())
    }

    pub fn release_lefs(lefs: &mut [Lef], lef_idx: &[usize]) {
        for &i in lef_idx {
            lefs[i].release();
        }
    }

    // ── Burn-in ──────────────────────────────────────────────────────────────

    /// Draw the epoch at which each LEF first becomes eligible for binding,
    /// sorted descending and shifted so the earliest is zero. With
    /// `skip_burnin` every LEF is eligible immediately.
    pub fn setup_burnin(&self, epoch_buff: &mut [u64], rng: &mut SimRng) {
        if self.config.skip_burnin || epoch_buff.is_empty() {
            epoch_buff.iter_mut().for_each(|e| *e = 0);
            return;
        }
        let max_epoch = 4 * self.config.average_lef_lifetime / self.config.bin_size;
        for e in epoch_buff.iter_mut() {
            *e = rng.random_range(0..=max_epoch);
        }
        epoch_buff.sort_unstable_by(|a, b| b.cmp(a));
        let offset = *epoch_buff.last().unwrap();
        if offset != 0 {
            epoch_buff.iter_mut().for_each(|e| *e -= offset);
        }
    }

    // ── The per-cell epoch loop ──────────────────────────────────────────────

    /// Simulate one cell of one chromosome to its target, accumulating
    /// contacts into the chromosome's matrix.
    pub fn simulate_cell(&self, state: &mut State<'_>, counters: &Counters) -> Result<()> {
        let chrom = state.chrom;
        let contacts =
            chrom.allocate_contacts(self.config.bin_size, self.config.diagonal_width);
        let count_contact_ticks =
            matches!(self.config.stopping_condition(), StoppingCondition::ContactDensity(_));

        self.setup_burnin(&mut state.epoch_buff, &mut state.rng);
        sample_initial_occupancy(state.barriers, &mut state.barrier_mask, &mut state.rng);
        let mut burnin_done = state.epoch_buff.first().is_none_or(|&e| e == 0);
        let mut epochs_after_burnin: u64 = 0;

        // All LEFs take part in contact registration.
        for (i, slot) in state.idx_buff.iter_mut().enumerate() {
            *slot = i;
        }

        loop {
            let epoch = state.epoch;
            evolve_occupancy(state.barriers, &mut state.barrier_mask, &mut state.rng);

            for i in 0..state.num_lefs {
                let eligible = burnin_done || state.epoch_buff[i] <= epoch;
                state.binding_mask.set(i, eligible);
            }
            Self::bind_lefs(
                chrom,
                &mut state.lefs,
                &mut state.rev_ranks,
                &mut state.fwd_ranks,
                &state.binding_mask,
                &mut state.rng,
                epoch,
            );
            if !burnin_done && state.epoch_buff.first().is_none_or(|&e| epoch >= e) {
                burnin_done = true;
            }

            self.generate_moves(
                chrom,
                &state.lefs,
                &state.rev_ranks,
                &state.fwd_ranks,
                &mut state.rev_moves,
                &mut state.fwd_moves,
                &mut state.rng,
                true,
            );

            state.rev_collisions.fill(NO_COLLISION);
            state.fwd_collisions.fill(NO_COLLISION);
            self.process_collisions(
                chrom,
                &state.lefs,
                state.barriers,
                &state.barrier_mask,
                &state.rev_ranks,
                &state.fwd_ranks,
                &mut state.rev_moves,
                &mut state.fwd_moves,
                &mut state.rev_collisions,
                &mut state.fwd_collisions,
                &mut state.rng,
            );

            Self::extrude(&mut state.lefs, &state.rev_moves, &state.fwd_moves);
            let num_bound = state.lefs.iter().filter(|l| l.bound).count();
            counters
                .extrusion_events
                .fetch_add(num_bound as u64, Ordering::Relaxed);

            if burnin_done {
                epochs_after_burnin += 1;
                let sample_now = if self.config.randomize_contact_sampling_interval {
                    self.contact_sampling_dist.sample(&mut state.rng)
                } else {
                    epochs_after_burnin % self.config.contact_sampling_interval == 0
                };
                if sample_now {
                    let new_contacts = match &self.noise_dist {
                        Some(noise) => self.register_contacts_with_noise(
                            chrom,
                            &contacts,
                            &state.lefs,
                            &state.idx_buff,
                            noise,
                            &mut state.rng,
                        ),
                        None => self.register_contacts(
                            chrom,
                            &contacts,
                            &state.lefs,
                            &state.idx_buff,
                        ),
                    };
                    state.num_registered_contacts += new_contacts;
                    if count_contact_ticks {
                        counters.ticks.fetch_add(new_contacts, Ordering::Relaxed);
                    }
                }
                if !count_contact_ticks {
                    counters.ticks.fetch_add(1, Ordering::Relaxed);
                }

                if epochs_after_burnin >= state.target_epochs
                    || state.num_registered_contacts >= state.target_contacts
                {
                    return Ok(());
                }
            }

            self.generate_lef_unloader_affinities(
                &state.lefs,
                state.barriers,
                &state.rev_collisions,
                &state.fwd_collisions,
                &mut state.unloader_affinity,
            );
            let num_to_release = self.num_lefs_to_release(num_bound);
            if num_to_release > 0 {
                let (release_idx, _) = state.idx_buff.split_at_mut(num_to_release);
                Self::select_lefs_to_release(
                    release_idx,
                    &state.unloader_affinity,
                    &mut state.rng,
                )?;
                Self::release_lefs(&mut state.lefs, release_idx);
                // idx_buff doubles as the registration index list; restore it.
                for (i, slot) in state.idx_buff.iter_mut().enumerate() {
                    *slot = i;
                }
            }

            state.epoch += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::ChromSpec;

    fn test_chrom(start: u64, end: u64) -> Chromosome {
        Chromosome::new(
            0,
            &ChromSpec { name: "chrT".into(), start, end, size: end },
        )
        .unwrap()
    }

    fn test_sim(config: Config) -> Simulation {
        let genome =
            Genome::new(&[ChromSpec::whole("chrT", 10_000_000)]).unwrap();
        Simulation::new(config, genome).unwrap()
    }

    fn deterministic_config() -> Config {
        let mut c = Config::default();
        c.rev_extrusion_speed = 3;
        c.rev_extrusion_speed_std = 0.0;
        c.fwd_extrusion_speed = 2;
        c.fwd_extrusion_speed_std = 0.0;
        c
    }

    fn occupied_mask(n: usize) -> BitVec {
        bitvec![1; n]
    }

    #[test]
    fn test_rank_lefs_sorts_by_position() {
        let lefs = vec![Lef::new(50, 60, 0), Lef::new(10, 90, 1), Lef::new(30, 70, 2)];
        let mut rev = vec![0; 3];
        let mut fwd = vec![0; 3];
        Simulation::rank_lefs(&lefs, &mut rev, &mut fwd, true);
        assert_eq!(rev, vec![1, 2, 0]);
        assert_eq!(fwd, vec![0, 2, 1]);
    }

    #[test]
    fn test_rank_lefs_breaks_ties_by_binding_epoch() {
        // Same positions, different binding epochs: rev ties ascend, fwd
        // ties descend.
        let lefs = vec![Lef::new(100, 100, 5), Lef::new(100, 100, 1), Lef::new(100, 100, 3)];
        let mut rev = vec![0; 3];
        let mut fwd = vec![0; 3];
        Simulation::rank_lefs(&lefs, &mut rev, &mut fwd, true);
        assert_eq!(rev, vec![1, 2, 0]);
        assert_eq!(fwd, vec![0, 2, 1]);
    }

    #[test]
    fn test_generate_moves_deterministic_when_std_is_zero() {
        let sim = test_sim(deterministic_config());
        let chrom = test_chrom(0, 1000);
        let lefs = vec![Lef::new(500, 600, 0), Lef::new(0, 999, 0)];
        let mut rev = vec![0, 1];
        let mut fwd = vec![0, 1];
        Simulation::rank_lefs(&lefs, &mut rev, &mut fwd, true);
        let mut rev_moves = vec![0; 2];
        let mut fwd_moves = vec![0; 2];
        let mut rng = task_rng(0, 0, 0);
        sim.generate_moves(
            &chrom, &lefs, &rev, &fwd, &mut rev_moves, &mut fwd_moves, &mut rng, false,
        );
        assert_eq!(rev_moves, vec![3, 0]); // unit at pos 0 cannot move left
        assert_eq!(fwd_moves, vec![2, 0]); // unit at pos 999 cannot move right
    }

    #[test]
    fn test_moves_are_clamped_to_range() {
        let mut config = deterministic_config();
        config.rev_extrusion_speed_std = 500.0;
        config.fwd_extrusion_speed_std = 500.0;
        let sim = test_sim(config);
        let chrom = test_chrom(100, 1100);
        let lefs = vec![Lef::new(150, 1050, 0)];
        let (rev, fwd) = (vec![0], vec![0]);
        let mut rev_moves = vec![0];
        let mut fwd_moves = vec![0];
        let mut rng = task_rng(3, 0, 0);
        for _ in 0..500 {
            sim.generate_moves(
                &chrom, &lefs, &rev, &fwd, &mut rev_moves, &mut fwd_moves, &mut rng, false,
            );
            assert!(rev_moves[0] <= 50);
            assert!(fwd_moves[0] <= 49);
        }
    }

    #[test]
    fn test_adjust_moves_prevents_same_direction_bypass() {
        let chrom = test_chrom(0, 10_000);
        // Two rev units: idx 0 ahead (pos 1000), idx 1 behind (pos 1500).
        // The trailing unit's move would overtake the leading one.
        let lefs = vec![Lef::new(1000, 5000, 0), Lef::new(1500, 6000, 0)];
        let mut rev = vec![0; 2];
        let mut fwd = vec![0; 2];
        Simulation::rank_lefs(&lefs, &mut rev, &mut fwd, true);
        let mut rev_moves = vec![100, 700];
        let mut fwd_moves = vec![0, 0];
        Simulation::adjust_moves_of_consecutive_units(
            &chrom, &lefs, &rev, &fwd, &mut rev_moves, &mut fwd_moves,
        );
        // Leading unit pushed to end one bp ahead of the trailing unit.
        assert_eq!(1000 - rev_moves[0], (1500 - 700) - 1);

        // Mirror for fwd units: idx 0 behind (pos 5000) would overtake idx 1
        // (pos 6000).
        let mut rev_moves = vec![0, 0];
        let mut fwd_moves = vec![1500, 100];
        Simulation::adjust_moves_of_consecutive_units(
            &chrom, &lefs, &rev, &fwd, &mut rev_moves, &mut fwd_moves,
        );
        assert_eq!(6000 + fwd_moves[1], (5000 + 1500) + 1);
    }

    #[test]
    fn test_detect_units_at_boundaries() {
        let chrom = test_chrom(100, 1000);
        let lefs = vec![Lef::new(100, 999, 0), Lef::new(500, 600, 0)];
        let mut rev = vec![0; 2];
        let mut fwd = vec![0; 2];
        Simulation::rank_lefs(&lefs, &mut rev, &mut fwd, true);
        let mut rev_moves = vec![0, 10];
        let mut fwd_moves = vec![0, 10];
        let mut rev_collisions = vec![NO_COLLISION; 2];
        let mut fwd_collisions = vec![NO_COLLISION; 2];
        let (n5, n3) = Simulation::detect_units_at_chrom_boundaries(
            &chrom,
            &lefs,
            &rev,
            &fwd,
            &mut rev_moves,
            &mut fwd_moves,
            &mut rev_collisions,
            &mut fwd_collisions,
        );
        assert_eq!((n5, n3), (1, 1));
        // A unit sitting exactly on the boundary is flagged with a zero move.
        assert_eq!(rev_collisions[0], REACHED_CHROM_BOUNDARY);
        assert_eq!(rev_moves[0], 0);
        assert_eq!(fwd_collisions[0], REACHED_CHROM_BOUNDARY);
        assert_eq!(fwd_moves[0], 0);
        assert_eq!(rev_collisions[1], NO_COLLISION);
        assert_eq!(fwd_collisions[1], NO_COLLISION);
    }

    #[test]
    fn test_barrier_blocks_rev_unit() {
        // Barrier at 50, major direction rev, occupied. A rev unit at 55
        // moving 10 stops at 51 and records barrier index 0.
        let sim = test_sim(deterministic_config());
        let barriers =
            vec![ExtrusionBarrier::new(50, 1.0, 0.0, Direction::Rev).unwrap()];
        let lefs = vec![Lef::new(55, 500, 0)];
        let mut rev_moves = vec![10];
        let mut fwd_moves = vec![0];
        let mut rev_collisions = vec![NO_COLLISION];
        let mut fwd_collisions = vec![NO_COLLISION];
        let mut rng = task_rng(0, 0, 0);
        sim.detect_lef_bar_collisions(
            &lefs,
            &[0],
            &[0],
            &rev_moves,
            &fwd_moves,
            &barriers,
            &occupied_mask(1),
            &mut rev_collisions,
            &mut fwd_collisions,
            &mut rng,
        );
        assert_eq!(rev_collisions[0], 0);
        Simulation::correct_moves_for_lef_bar_collisions(
            &lefs,
            &barriers,
            &mut rev_moves,
            &mut fwd_moves,
            &rev_collisions,
            &fwd_collisions,
        );
        let mut lefs = lefs;
        Simulation::extrude(&mut lefs, &rev_moves, &fwd_moves);
        assert_eq!(lefs[0].rev_unit.pos, 51);
    }

    #[test]
    fn test_unoccupied_or_minor_barriers_do_not_block() {
        let sim = test_sim(deterministic_config());
        let barriers = vec![
            ExtrusionBarrier::new(40, 1.0, 0.0, Direction::Fwd).unwrap(), // minor for rev
            ExtrusionBarrier::new(50, 1.0, 0.0, Direction::Rev).unwrap(), // unoccupied
        ];
        let mut mask = occupied_mask(2);
        mask.set(1, false);
        let lefs = vec![Lef::new(55, 500, 0)];
        let rev_moves = vec![30];
        let fwd_moves = vec![0];
        let mut rev_collisions = vec![NO_COLLISION];
        let mut fwd_collisions = vec![NO_COLLISION];
        let mut rng = task_rng(0, 0, 0);
        sim.detect_lef_bar_collisions(
            &lefs,
            &[0],
            &[0],
            &rev_moves,
            &fwd_moves,
            &barriers,
            &mask,
            &mut rev_collisions,
            &mut fwd_collisions,
            &mut rng,
        );
        assert_eq!(rev_collisions[0], NO_COLLISION);
        assert_eq!(fwd_collisions[0], NO_COLLISION);
    }

    #[test]
    fn test_primary_lef_lef_collision_literal() {
        // rev unit at 100 moving 6 vs opposing fwd unit at 88 moving 4:
        // t = 12/10, collision positions 93 (rev) and 92 (fwd).
        let sim = test_sim(deterministic_config());
        let mut lefs = vec![Lef::new(100, 5000, 0), Lef::new(20, 88, 0)];
        let mut rev = vec![0; 2];
        let mut fwd = vec![0; 2];
        Simulation::rank_lefs(&lefs, &mut rev, &mut fwd, true);
        let mut rev_moves = vec![6, 5];
        let mut fwd_moves = vec![7, 4];
        let mut rev_collisions = vec![NO_COLLISION; 2];
        let mut fwd_collisions = vec![NO_COLLISION; 2];

        sim.detect_primary_lef_lef_collisions(
            &lefs,
            &[],
            &rev,
            &fwd,
            &rev_moves,
            &fwd_moves,
            &mut rev_collisions,
            &mut fwd_collisions,
        );
        // Each unit's slot encodes the opposing LEF (nbarriers = 0).
        assert_eq!(rev_collisions[0], 1);
        assert_eq!(fwd_collisions[1], 0);
        assert_eq!(rev_collisions[1], NO_COLLISION);
        assert_eq!(fwd_collisions[0], NO_COLLISION);

        Simulation::correct_moves_for_primary_lef_lef_collisions(
            &lefs,
            0,
            &mut rev_moves,
            &mut fwd_moves,
            &rev_collisions,
            &fwd_collisions,
        );
        Simulation::extrude(&mut lefs, &rev_moves, &fwd_moves);
        assert_eq!(lefs[0].rev_unit.pos, 93);
        assert_eq!(lefs[1].fwd_unit.pos, 92);
    }

    #[test]
    fn test_collision_pos_arithmetic() {
        assert_eq!(
            Simulation::compute_lef_lef_collision_pos(100, 88, 6, 4),
            (93, 92)
        );
        // Zero fwd speed: rev closes the whole gap, stopping next to fwd.
        assert_eq!(
            Simulation::compute_lef_lef_collision_pos(100, 88, 12, 0),
            (89, 88)
        );
        // Zero rev speed: fwd closes the gap, stopping one bp short.
        assert_eq!(
            Simulation::compute_lef_lef_collision_pos(100, 88, 0, 12),
            (100, 99)
        );
    }

    #[test]
    fn test_distant_pair_does_not_collide() {
        let sim = test_sim(deterministic_config());
        let lefs = vec![Lef::new(1000, 5000, 0), Lef::new(20, 88, 0)];
        let mut rev = vec![0; 2];
        let mut fwd = vec![0; 2];
        Simulation::rank_lefs(&lefs, &mut rev, &mut fwd, true);
        let rev_moves = vec![6, 5];
        let fwd_moves = vec![7, 4];
        let mut rev_collisions = vec![NO_COLLISION; 2];
        let mut fwd_collisions = vec![NO_COLLISION; 2];
        sim.detect_primary_lef_lef_collisions(
            &lefs,
            &[],
            &rev,
            &fwd,
            &rev_moves,
            &fwd_moves,
            &mut rev_collisions,
            &mut fwd_collisions,
        );
        assert!(rev_collisions.iter().all(|&c| c == NO_COLLISION));
        assert!(fwd_collisions.iter().all(|&c| c == NO_COLLISION));
    }

    #[test]
    fn test_secondary_collision_stalls_trailing_unit() {
        // Barrier stalls LEF 0's fwd unit; LEF 1's fwd unit behind it would
        // overtake and must stop one bp short, recording a secondary code.
        let sim = test_sim(deterministic_config());
        let barriers =
            vec![ExtrusionBarrier::new(500, 1.0, 0.0, Direction::Fwd).unwrap()];
        let mut lefs = vec![Lef::new(100, 450, 0), Lef::new(50, 400, 0)];
        let mut rev = vec![0; 2];
        let mut fwd = vec![0; 2];
        Simulation::rank_lefs(&lefs, &mut rev, &mut fwd, true);
        let mut rev_moves = vec![0, 0];
        let mut fwd_moves = vec![100, 200];
        let mut rev_collisions = vec![NO_COLLISION; 2];
        let mut fwd_collisions = vec![NO_COLLISION; 2];
        let mut rng = task_rng(0, 0, 0);

        sim.detect_lef_bar_collisions(
            &lefs,
            &rev,
            &fwd,
            &rev_moves,
            &fwd_moves,
            &barriers,
            &occupied_mask(1),
            &mut rev_collisions,
            &mut fwd_collisions,
            &mut rng,
        );
        assert_eq!(fwd_collisions[0], 0);
        // The trailing unit never claims the barrier; the leader does.
        assert_eq!(fwd_collisions[1], NO_COLLISION);
        Simulation::correct_moves_for_lef_bar_collisions(
            &lefs,
            &barriers,
            &mut rev_moves,
            &mut fwd_moves,
            &rev_collisions,
            &fwd_collisions,
        );
        Simulation::process_secondary_lef_lef_collisions(
            &lefs,
            barriers.len(),
            &rev,
            &fwd,
            &mut rev_moves,
            &mut fwd_moves,
            &mut rev_collisions,
            &mut fwd_collisions,
        );
        // Secondary code: nbarriers + nlefs + leading LEF index.
        assert_eq!(fwd_collisions[1], 1 + 2 + 0);
        Simulation::extrude(&mut lefs, &rev_moves, &fwd_moves);
        assert_eq!(lefs[0].fwd_unit.pos, 499); // stopped by the barrier
        assert_eq!(lefs[1].fwd_unit.pos, 498); // one bp behind the leader
    }

    #[test]
    fn test_unloader_affinity_hard_stall() {
        let sim = test_sim(deterministic_config());
        let barriers = vec![
            ExtrusionBarrier::new(100, 1.0, 0.0, Direction::Rev).unwrap(),
            ExtrusionBarrier::new(200, 1.0, 0.0, Direction::Fwd).unwrap(),
        ];
        let lefs = vec![
            Lef::new(101, 199, 0), // stalled at both convergent barriers
            Lef::new(150, 160, 0), // free-running
            Lef { bound: false, ..Lef::new(0, 0, 0) },
        ];
        let rev_collisions = vec![0, NO_COLLISION, NO_COLLISION];
        let fwd_collisions = vec![1, NO_COLLISION, NO_COLLISION];
        let mut affinities = vec![0.0; 3];
        sim.generate_lef_unloader_affinities(
            &lefs,
            &barriers,
            &rev_collisions,
            &fwd_collisions,
            &mut affinities,
        );
        assert!((affinities[0] - 1.0 / sim.config().hard_stall_multiplier).abs() < 1e-12);
        assert_eq!(affinities[1], 1.0);
        assert_eq!(affinities[2], 0.0);
    }

    #[test]
    fn test_burnin_schedule() {
        let sim = test_sim(Config::default());
        let mut epochs = vec![0u64; 64];
        let mut rng = task_rng(11, 0, 0);
        sim.setup_burnin(&mut epochs, &mut rng);
        // Sorted descending, earliest is exactly zero, all within the window.
        assert!(epochs.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(*epochs.last().unwrap(), 0);
        let max = 4 * sim.config().average_lef_lifetime / sim.config().bin_size;
        assert!(epochs.iter().all(|&e| e <= max));

        let mut skip_config = Config::default();
        skip_config.skip_burnin = true;
        let sim = test_sim(skip_config);
        let mut epochs = vec![9u64; 8];
        sim.setup_burnin(&mut epochs, &mut rng);
        assert!(epochs.iter().all(|&e| e == 0));
    }

    #[test]
    fn test_num_lefs_to_release_matches_lifetime() {
        let mut config = Config::default();
        config.rev_extrusion_speed = 1_000;
        config.fwd_extrusion_speed = 1_000;
        config.average_lef_lifetime = 100_000;
        let sim = test_sim(config);
        // 2 kb per epoch over a 100 kb lifetime: 2% of bound LEFs per epoch.
        assert_eq!(sim.num_lefs_to_release(100), 2);
        assert_eq!(sim.num_lefs_to_release(0), 0);
        assert_eq!(sim.num_lefs_to_release(1), 0);
    }

    fn smoke_test_setup(seed: u64, cell_id: usize) -> (Simulation, Vec<(usize, usize, u32)>) {
        use crate::genome::BarrierRecord;
        let mut config = Config::default();
        config.bin_size = 1_000;
        config.diagonal_width = 20_000;
        config.average_lef_lifetime = 20_000;
        config.rev_extrusion_speed = 500;
        config.rev_extrusion_speed_std = 50.0;
        config.fwd_extrusion_speed = 500;
        config.fwd_extrusion_speed_std = 50.0;
        config.contact_sampling_interval = 5;
        config.simulation_iterations = Some(400);
        config.seed = seed;
        config.num_cells = 1;
        let mut genome = Genome::new(&[ChromSpec::whole("chrT", 200_000)]).unwrap();
        let records = vec![
            BarrierRecord { chrom: "chrT".into(), pos: 60_000, strand: '+', occupancy: 0.9 },
            BarrierRecord { chrom: "chrT".into(), pos: 140_000, strand: '-', occupancy: 0.9 },
        ];
        genome.import_barriers(&records, 0.0, 0.0, 0.7).unwrap();
        let sim = Simulation::new(config, genome).unwrap();

        let chrom = &sim.genome().chromosomes()[0];
        let task = Task {
            id: 0,
            chrom,
            cell_id,
            target_epochs: 400,
            target_contacts: u64::MAX,
            num_lefs: 10,
            barriers: chrom.barriers(),
            seed,
        };
        let mut state = State::from_task(task);
        let counters = Counters::default();
        sim.simulate_cell(&mut state, &counters).unwrap();

        // Post-epoch invariants on every bound LEF.
        for lef in &state.lefs {
            if lef.bound {
                assert!(lef.rev_unit.pos >= chrom.start);
                assert!(lef.rev_unit.pos <= lef.fwd_unit.pos);
                assert!(lef.fwd_unit.pos < chrom.end);
            }
        }
        assert!(counters.ticks.load(Ordering::Relaxed) >= 400);

        let pixels: Vec<_> = chrom.contacts().unwrap().iter_nonzero().collect();
        chrom.deallocate_contacts();
        (sim, pixels)
    }

    #[test]
    fn test_simulate_cell_registers_contacts_and_is_deterministic() {
        let (_, pixels1) = smoke_test_setup(1234, 0);
        assert!(!pixels1.is_empty());
        let (_, pixels2) = smoke_test_setup(1234, 0);
        assert_eq!(pixels1, pixels2);
        let (_, pixels3) = smoke_test_setup(1234, 1);
        assert_ne!(pixels1, pixels3);
    }

    #[test]
    fn test_simulate_cell_stops_at_contact_target() {
        use crate::genome::BarrierRecord;
        let mut config = Config::default();
        config.bin_size = 1_000;
        config.diagonal_width = 10_000;
        config.average_lef_lifetime = 20_000;
        config.rev_extrusion_speed = 500;
        config.fwd_extrusion_speed = 500;
        config.rev_extrusion_speed_std = 0.0;
        config.fwd_extrusion_speed_std = 0.0;
        config.contact_sampling_interval = 2;
        config.target_contact_density = Some(0.5);
        config.skip_burnin = true;
        let mut genome = Genome::new(&[ChromSpec::whole("chrT", 100_000)]).unwrap();
        let records = vec![BarrierRecord {
            chrom: "chrT".into(),
            pos: 50_000,
            strand: '+',
            occupancy: 0.9,
        }];
        genome.import_barriers(&records, 0.0, 0.0, 0.7).unwrap();
        let sim = Simulation::new(config, genome).unwrap();
        let chrom = &sim.genome().chromosomes()[0];
        let task = Task {
            id: 0,
            chrom,
            cell_id: 0,
            target_epochs: u64::MAX,
            target_contacts: 50,
            num_lefs: 8,
            barriers: chrom.barriers(),
            seed: 7,
        };
        let mut state = State::from_task(task);
        sim.simulate_cell(&mut state, &Counters::default()).unwrap();
        assert!(state.num_registered_contacts >= 50);
        let contacts = chrom.contacts().unwrap();
        assert!(contacts.tot_contacts() >= 50);
    }
}
