use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};

use crate::barriers::ExtrusionBarrier;
use crate::matrix::ContactMatrix;

// ── Input records ────────────────────────────────────────────────────────────

/// Already-parsed chromosome record: simulated range `[start, end)` within a
/// sequence of `size` bp. Parsing chrom-sizes/BED files happens upstream.
#[derive(Debug, Clone)]
pub struct ChromSpec {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

impl ChromSpec {
    /// Whole-chromosome range.
    pub fn whole(name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        Self { name, start: 0, end: size, size }
    }
}

/// Already-parsed extrusion-barrier record. `pos` is an absolute genomic
/// coordinate; `strand` follows BED conventions ('+'/'-').
#[derive(Debug, Clone)]
pub struct BarrierRecord {
    pub chrom: String,
    pub pos: u64,
    pub strand: char,
    pub occupancy: f64,
}

/// Genomic interval used for pairwise targeted simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub start: u64,
    pub end: u64,
    pub name: String,
}

// ── Chromosome ───────────────────────────────────────────────────────────────

/// A chromosome with its simulation range, sorted barrier list, optional
/// feature lists, and a lazily allocated contact matrix shared by all the
/// cells simulating it.
#[derive(Debug)]
pub struct Chromosome {
    pub id: usize,
    pub name: String,
    pub size: u64,
    pub start: u64,
    pub end: u64,
    barriers: Vec<ExtrusionBarrier>,
    features: Vec<Vec<Feature>>,
    contacts: Mutex<Option<Arc<ContactMatrix>>>,
}

impl Chromosome {
    pub fn new(id: usize, spec: &ChromSpec) -> Result<Self> {
        if spec.start >= spec.end || spec.end > spec.size {
            return Err(anyhow!(
                "chromosome '{}': invalid range [{}, {}) for size {}",
                spec.name,
                spec.start,
                spec.end,
                spec.size
            ));
        }
        Ok(Self {
            id,
            name: spec.name.clone(),
            size: spec.size,
            start: spec.start,
            end: spec.end,
            barriers: Vec::new(),
            features: Vec::new(),
            contacts: Mutex::new(None),
        })
    }

    #[inline]
    pub fn simulated_size(&self) -> u64 {
        self.end - self.start
    }

    pub fn nbins(&self, bin_size: u64) -> usize {
        self.simulated_size().div_ceil(bin_size) as usize
    }

    pub fn barriers(&self) -> &[ExtrusionBarrier] {
        &self.barriers
    }

    pub fn nbarriers(&self) -> usize {
        self.barriers.len()
    }

    pub fn features(&self) -> &[Vec<Feature>] {
        &self.features
    }

    /// Chromosomes without barriers are knocked out: simulating loop
    /// extrusion on them would only produce noise.
    pub fn ok(&self) -> bool {
        !self.barriers.is_empty()
    }

    fn push_barrier(&mut self, barrier: ExtrusionBarrier) -> Result<()> {
        if barrier.pos < self.start || barrier.pos >= self.end {
            return Err(anyhow!(
                "barrier at {} outside the simulated range {}:{}-{}",
                barrier.pos,
                self.name,
                self.start,
                self.end
            ));
        }
        self.barriers.push(barrier);
        Ok(())
    }

    pub fn add_feature_list(&mut self, mut features: Vec<Feature>) {
        features.sort_by_key(|f| (f.start, f.end));
        self.features.push(features);
    }

    /// Get the contact matrix, allocating it on first use.
    pub fn allocate_contacts(&self, bin_size: u64, diagonal_width: u64) -> Arc<ContactMatrix> {
        let mut guard = self.contacts.lock().unwrap();
        if let Some(m) = guard.as_ref() {
            return Arc::clone(m);
        }
        let ncols = self.nbins(bin_size);
        let nrows = diagonal_width.div_ceil(bin_size) as usize;
        let m = Arc::new(ContactMatrix::new(nrows.min(ncols), ncols));
        *guard = Some(Arc::clone(&m));
        m
    }

    pub fn contacts(&self) -> Option<Arc<ContactMatrix>> {
        self.contacts.lock().unwrap().clone()
    }

    /// Drop the matrix once the writer has flushed it.
    pub fn deallocate_contacts(&self) {
        self.contacts.lock().unwrap().take();
    }
}

// ── Genome ───────────────────────────────────────────────────────────────────

/// The set of chromosomes being simulated.
#[derive(Debug, Default)]
pub struct Genome {
    chromosomes: Vec<Chromosome>,
}

impl Genome {
    pub fn new(specs: &[ChromSpec]) -> Result<Self> {
        let chromosomes = specs
            .iter()
            .enumerate()
            .map(|(id, spec)| Chromosome::new(id, spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { chromosomes })
    }

    /// Attach barrier records to their chromosomes and sort each
    /// chromosome's barriers by position.
    ///
    /// A non-zero `occupancy_override` replaces every record's occupancy
    /// score. Records naming a chromosome that is not part of the genome
    /// are skipped; malformed records (bad strand, bad occupancy, position
    /// outside the simulated range) abort the run. Returns
    /// `(imported, skipped)`.
    pub fn import_barriers(
        &mut self,
        records: &[BarrierRecord],
        occupancy_override: f64,
        occupied_self_override: f64,
        not_occupied_self_prob: f64,
    ) -> Result<(usize, usize)> {
        let mut imported = 0;
        let mut skipped = 0;
        for record in records {
            let Some(chrom) = self
                .chromosomes
                .iter_mut()
                .find(|c| c.name == record.chrom)
            else {
                skipped += 1;
                continue;
            };
            let occupancy = if occupancy_override != 0.0 {
                occupancy_override
            } else {
                record.occupancy
            };
            let barrier = ExtrusionBarrier::from_record(
                record.pos,
                record.strand,
                occupancy,
                occupied_self_override,
                not_occupied_self_prob,
            )
            .map_err(|e| anyhow!("{}: {}", record.chrom, e))?;
            chrom.push_barrier(barrier)?;
            imported += 1;
        }
        for chrom in &mut self.chromosomes {
            chrom.barriers.sort_by_key(|b| b.pos);
        }
        Ok((imported, skipped))
    }

    pub fn chromosomes(&self) -> &[Chromosome] {
        &self.chromosomes
    }

    pub fn chromosomes_mut(&mut self) -> &mut [Chromosome] {
        &mut self.chromosomes
    }

    pub fn len(&self) -> usize {
        self.chromosomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chromosomes.is_empty()
    }

    /// Total simulated length across chromosomes.
    pub fn simulated_size(&self) -> u64 {
        self.chromosomes.iter().map(|c| c.simulated_size()).sum()
    }

    pub fn nbarriers(&self) -> usize {
        self.chromosomes.iter().map(|c| c.nbarriers()).sum()
    }

    pub fn num_ok_chromosomes(&self) -> usize {
        self.chromosomes.iter().filter(|c| c.ok()).count()
    }

    /// Apportion LEFs to chromosomes proportionally to simulated length.
    /// Knocked-out chromosomes get none; every simulated chromosome gets at
    /// least one.
    pub fn lefs_per_chromosome(&self, lefs_per_mbp: f64) -> Vec<usize> {
        self.chromosomes
            .iter()
            .map(|c| {
                if !c.ok() {
                    return 0;
                }
                let n = (lefs_per_mbp * c.simulated_size() as f64 / 1.0e6).round() as usize;
                n.max(1)
            })
            .collect()
    }
}
