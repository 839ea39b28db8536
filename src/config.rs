use anyhow::{Result, anyhow};

/// How long to run the simulation of one chromosome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoppingCondition {
    /// Run a fixed number of post-burn-in epochs per cell.
    Epochs(u64),
    /// Run until the contact density (`tot_contacts / npixels`) reaches the
    /// target.
    ContactDensity(f64),
}

/// Simulation parameters. Plain data; construct with `Config::default()`
/// and override what the scenario needs, then call [`Config::validate`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Matrix resolution in bp.
    pub bin_size: u64,
    /// Width of the stored band in bp; `nrows = ceil(diagonal_width / bin_size)`.
    pub diagonal_width: u64,
    /// Independent replicates simulated per chromosome.
    pub num_cells: usize,
    /// LEF density; scaled by simulated chromosome length to give each
    /// task's LEF count.
    pub lefs_per_mbp: f64,
    /// Average number of bp a LEF extrudes before unloading.
    pub average_lef_lifetime: u64,
    pub rev_extrusion_speed: u64,
    pub rev_extrusion_speed_std: f64,
    pub fwd_extrusion_speed: u64,
    pub fwd_extrusion_speed_std: f64,
    /// When non-zero, overrides the per-barrier occupancy from the input
    /// records.
    pub probability_of_extrusion_barrier_block: f64,
    /// When non-zero, overrides the occupied→occupied self-transition
    /// probability instead of deriving it from barrier occupancy.
    pub ctcf_occupied_self_prob: f64,
    pub ctcf_not_occupied_self_prob: f64,
    /// Probability that a unit walks through an occupied blocking barrier.
    pub probability_of_extrusion_unit_bypass: f64,
    /// Release-affinity divisor for LEFs stalled by two convergent barriers.
    pub hard_stall_multiplier: f64,
    /// Release-affinity divisor for LEFs stalled by a single barrier.
    pub soft_stall_multiplier: f64,
    /// Mutually exclusive with `simulation_iterations`.
    pub target_contact_density: Option<f64>,
    pub simulation_iterations: Option<u64>,
    /// Register contacts every n-th epoch (or with probability 1/n per
    /// epoch when randomized).
    pub contact_sampling_interval: u64,
    pub randomize_contact_sampling_interval: bool,
    /// Blur unit positions with generalized-extreme-value noise before
    /// binning.
    pub randomize_contact_registration: bool,
    pub genextreme_mu: f64,
    pub genextreme_sigma: f64,
    pub genextreme_xi: f64,
    pub nthreads: usize,
    pub seed: u64,
    pub skip_burnin: bool,
    pub skip_output: bool,
    /// Emit empty entries for chromosomes without barriers.
    pub write_contacts_for_ko_chroms: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bin_size: 1_000,
            diagonal_width: 3_000_000,
            num_cells: 512,
            lefs_per_mbp: 20.0,
            average_lef_lifetime: 100_000,
            rev_extrusion_speed: 1_000,
            rev_extrusion_speed_std: 50.0,
            fwd_extrusion_speed: 1_000,
            fwd_extrusion_speed_std: 50.0,
            probability_of_extrusion_barrier_block: 0.0,
            ctcf_occupied_self_prob: 0.0,
            ctcf_not_occupied_self_prob: 0.7,
            probability_of_extrusion_unit_bypass: 0.0,
            hard_stall_multiplier: 5.0,
            soft_stall_multiplier: 1.0,
            target_contact_density: None,
            simulation_iterations: None,
            contact_sampling_interval: 20,
            randomize_contact_sampling_interval: false,
            randomize_contact_registration: false,
            genextreme_mu: 0.0,
            genextreme_sigma: 12_500.0,
            genextreme_xi: 0.001,
            nthreads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            seed: 0,
            skip_burnin: false,
            skip_output: false,
            write_contacts_for_ko_chroms: false,
        }
    }
}

impl Config {
    /// Number of band rows of the contact matrices.
    pub fn nrows(&self) -> usize {
        self.diagonal_width.div_ceil(self.bin_size) as usize
    }

    /// The configured stopping condition; defaults to 200 epochs when
    /// neither knob is set.
    pub fn stopping_condition(&self) -> StoppingCondition {
        match (self.target_contact_density, self.simulation_iterations) {
            (Some(d), _) => StoppingCondition::ContactDensity(d),
            (None, Some(n)) => StoppingCondition::Epochs(n),
            (None, None) => StoppingCondition::Epochs(200),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bin_size == 0 {
            return Err(anyhow!("bin_size must be positive"));
        }
        if self.diagonal_width < self.bin_size {
            return Err(anyhow!(
                "diagonal_width ({}) must be at least one bin ({})",
                self.diagonal_width,
                self.bin_size
            ));
        }
        if self.num_cells == 0 {
            return Err(anyhow!("num_cells must be positive"));
        }
        if !(self.lefs_per_mbp.is_finite() && self.lefs_per_mbp > 0.0) {
            return Err(anyhow!("lefs_per_mbp must be positive"));
        }
        if self.average_lef_lifetime == 0 {
            return Err(anyhow!("average_lef_lifetime must be positive"));
        }
        if self.rev_extrusion_speed == 0 && self.fwd_extrusion_speed == 0 {
            return Err(anyhow!("at least one extrusion speed must be positive"));
        }
        for (name, std) in [
            ("rev_extrusion_speed_std", self.rev_extrusion_speed_std),
            ("fwd_extrusion_speed_std", self.fwd_extrusion_speed_std),
        ] {
            if !(std.is_finite() && std >= 0.0) {
                return Err(anyhow!("{} must be finite and non-negative, got {}", name, std));
            }
        }
        for (name, p) in [
            (
                "probability_of_extrusion_barrier_block",
                self.probability_of_extrusion_barrier_block,
            ),
            ("ctcf_occupied_self_prob", self.ctcf_occupied_self_prob),
            ("ctcf_not_occupied_self_prob", self.ctcf_not_occupied_self_prob),
            (
                "probability_of_extrusion_unit_bypass",
                self.probability_of_extrusion_unit_bypass,
            ),
        ] {
            if !(0.0..=1.0).contains(&p) || !p.is_finite() {
                return Err(anyhow!("{} must be in [0, 1], got {}", name, p));
            }
        }
        for (name, m) in [
            ("hard_stall_multiplier", self.hard_stall_multiplier),
            ("soft_stall_multiplier", self.soft_stall_multiplier),
        ] {
            if !(m.is_finite() && m > 0.0) {
                return Err(anyhow!("{} must be positive, got {}", name, m));
            }
        }
        if self.target_contact_density.is_some() && self.simulation_iterations.is_some() {
            return Err(anyhow!(
                "target_contact_density and simulation_iterations are mutually exclusive"
            ));
        }
        if let Some(d) = self.target_contact_density {
            if !(d.is_finite() && d > 0.0) {
                return Err(anyhow!("target_contact_density must be positive, got {}", d));
            }
        }
        if self.contact_sampling_interval == 0 {
            return Err(anyhow!("contact_sampling_interval must be positive"));
        }
        if self.randomize_contact_registration {
            crate::rng::GenExtremeValue::new(
                self.genextreme_mu,
                self.genextreme_sigma,
                self.genextreme_xi,
            )?;
        }
        if self.nthreads == 0 {
            return Err(anyhow!("nthreads must be positive"));
        }
        Ok(())
    }
}
