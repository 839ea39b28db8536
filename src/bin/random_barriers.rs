use std::fs::File;
use std::io::BufWriter;

use anyhow::Result;
use clap::Parser;
use extrusion_rs::*;
use rand::Rng;
use rand::SeedableRng;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(about = "Loop extrusion on synthetic chromosomes with randomly placed barriers")]
struct Args {
    /// Random seed (random if omitted)
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = 3)]
    num_chroms: usize,
    #[arg(long, default_value_t = 5_000_000)]
    chrom_size: u64,
    #[arg(long, default_value_t = 50)]
    num_barriers: usize,
    #[arg(long, default_value_t = 0.8)]
    barrier_occupancy: f64,
    #[arg(long, default_value_t = 5_000)]
    bin_size: u64,
    #[arg(long, default_value_t = 2_000_000)]
    diagonal_width: u64,
    #[arg(long, default_value_t = 8)]
    num_cells: usize,
    /// Stop once the contact matrices reach this density
    #[arg(long, default_value_t = 1.0)]
    target_contact_density: f64,
    #[arg(long)]
    nthreads: Option<usize>,
    #[arg(long, default_value = "random_barriers.tsv")]
    output: String,
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();
    let seed = args
        .seed
        .unwrap_or_else(|| rand::rng().random_range(1..u64::MAX));

    let mut config = Config::default();
    config.bin_size = args.bin_size;
    config.diagonal_width = args.diagonal_width;
    config.num_cells = args.num_cells;
    config.target_contact_density = Some(args.target_contact_density);
    config.seed = seed;
    if let Some(n) = args.nthreads {
        config.nthreads = n;
    }

    let specs: Vec<ChromSpec> = (0..args.num_chroms)
        .map(|i| ChromSpec::whole(format!("chr{}", i + 1), args.chrom_size))
        .collect();
    let mut genome = Genome::new(&specs)?;

    // Scatter barriers uniformly across the genome with random strands.
    let mut rng = SimRng::seed_from_u64(task_seed(seed, u64::MAX, 0));
    let records: Vec<BarrierRecord> = (0..args.num_barriers * args.num_chroms)
        .map(|_| {
            let chrom = rng.random_range(0..args.num_chroms);
            BarrierRecord {
                chrom: format!("chr{}", chrom + 1),
                pos: rng.random_range(0..args.chrom_size),
                strand: if rng.random_bool(0.5) { '+' } else { '-' },
                occupancy: args.barrier_occupancy,
            }
        })
        .collect();
    let (imported, _) = genome.import_barriers(
        &records,
        config.probability_of_extrusion_barrier_block,
        config.ctcf_occupied_self_prob,
        config.ctcf_not_occupied_self_prob,
    )?;
    eprintln!(
        "Simulating {} chromosomes with {} barriers (seed {})",
        args.num_chroms, imported, seed
    );

    let sim = Simulation::new(config, genome)?;
    let out = BufWriter::new(File::create(&args.output)?);
    let mut writer = TextPixelWriter::new(out, args.bin_size);
    sim.run(&mut writer)?;
    eprintln!("Contacts written to {}", args.output);
    Ok(())
}
