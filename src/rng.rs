use anyhow::{Result, anyhow};
use rand::Rng;
use rand::SeedableRng;
use rand::distr::Distribution;
use rand_xoshiro::Xoshiro256PlusPlus;

/// PRNG used for every probabilistic choice in the simulation.
///
/// Xoshiro256++ is cheap to seed, has a large enough state for Monte Carlo
/// work, and produces the same stream on every platform, which is what makes
/// per-task substreams reproducible.
pub type SimRng = Xoshiro256PlusPlus;

// ── Seed mixing ──────────────────────────────────────────────────────────────

/// SplitMix64 finalizer. Decorrelates consecutive integers into
/// independent-looking 64-bit values.
#[inline]
pub fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Mix the global seed with a chromosome and cell id into a task seed.
///
/// Identical inputs produce identical streams across runs and platforms;
/// changing any component decorrelates the stream.
#[inline]
pub fn task_seed(seed: u64, chrom_id: u64, cell_id: u64) -> u64 {
    splitmix64(seed ^ splitmix64(chrom_id) ^ splitmix64(cell_id).rotate_left(32))
}

/// Build the PRNG for one `(chromosome, cell)` task.
#[inline]
pub fn task_rng(seed: u64, chrom_id: u64, cell_id: u64) -> SimRng {
    SimRng::seed_from_u64(task_seed(seed, chrom_id, cell_id))
}

// ── Generalized extreme value distribution ───────────────────────────────────

/// Generalized extreme value distribution, sampled by inverse CDF.
///
/// Used to blur extrusion-unit positions when randomized contact
/// registration is enabled. `xi = 0` degenerates to the Gumbel
/// distribution.
#[derive(Debug, Clone, Copy)]
pub struct GenExtremeValue {
    mu: f64,
    sigma: f64,
    xi: f64,
}

impl GenExtremeValue {
    pub fn new(mu: f64, sigma: f64, xi: f64) -> Result<Self> {
        if !mu.is_finite() || !sigma.is_finite() || !xi.is_finite() {
            return Err(anyhow!(
                "GEV parameters must be finite (mu={}, sigma={}, xi={})",
                mu,
                sigma,
                xi
            ));
        }
        if sigma <= 0.0 {
            return Err(anyhow!("GEV sigma must be positive, got {}", sigma));
        }
        Ok(Self { mu, sigma, xi })
    }
}

impl Distribution<f64> for GenExtremeValue {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        // u in (0, 1): 1 - random::<f64>() never returns 0 exactly.
        let u: f64 = 1.0 - rng.random::<f64>();
        let neg_log_u = -u.ln();
        if self.xi == 0.0 {
            self.mu - self.sigma * neg_log_u.ln()
        } else {
            self.mu + self.sigma * (neg_log_u.powf(-self.xi) - 1.0) / self.xi
        }
    }
}
