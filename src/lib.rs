//! Stochastic simulator of DNA loop extrusion.
//!
//! Loop extrusion factors (LEFs) are modeled as pairs of extrusion units
//! walking along a chromosome in opposite directions until they run into a
//! chromosome boundary, a CTCF-like extrusion barrier, or another unit.
//! Contacts between the two units of each LEF are accumulated into a
//! symmetric banded matrix, producing Hi-C-like contact maps.
//!
//! The crate is organized bottom-up:
//! - `rng`: seedable PRNG with deterministic per-task substreams
//! - `matrix`: thread-safe banded contact matrix
//! - `lefs` / `barriers`: the extrusion factor and barrier models
//! - `genome`: chromosomes, barrier import, LEF apportioning
//! - `config`: simulation parameters
//! - `simulation`: the per-cell extrusion kernel
//! - `pipeline`: worker pool, writer thread, progress reporting

pub mod barriers;
pub mod config;
pub mod genome;
pub mod lefs;
pub mod matrix;
pub mod pipeline;
pub mod rng;
pub mod simulation;

pub use barriers::{Direction, ExtrusionBarrier};
pub use config::{Config, StoppingCondition};
pub use genome::{BarrierRecord, ChromSpec, Chromosome, Feature, Genome};
pub use lefs::{ExtrusionUnit, Lef};
pub use matrix::ContactMatrix;
pub use pipeline::{ContactsWriter, NullWriter, TextPixelWriter};
pub use rng::{GenExtremeValue, SimRng, task_rng, task_seed};
pub use simulation::{
    Collision, Counters, NO_COLLISION, REACHED_CHROM_BOUNDARY, Simulation, State, Task,
};
