use std::fs::File;
use std::io::BufWriter;

use anyhow::Result;
use clap::Parser;
use extrusion_rs::*;
use rand::Rng;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(about = "Loop extrusion on a synthetic chromosome with evenly spaced convergent barriers")]
struct Args {
    /// Random seed (random if omitted)
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = 10_000_000)]
    chrom_size: u64,
    /// Distance between neighbouring barriers; strands alternate -/+ so
    /// each pair of consecutive barriers forms a convergent TAD-like domain.
    #[arg(long, default_value_t = 1_000_000)]
    barrier_spacing: u64,
    #[arg(long, default_value_t = 0.85)]
    barrier_occupancy: f64,
    #[arg(long, default_value_t = 5_000)]
    bin_size: u64,
    #[arg(long, default_value_t = 2_000_000)]
    diagonal_width: u64,
    #[arg(long, default_value_t = 16)]
    num_cells: usize,
    #[arg(long, default_value_t = 20.0)]
    lefs_per_mbp: f64,
    #[arg(long, default_value_t = 2_000)]
    iterations: u64,
    #[arg(long)]
    nthreads: Option<usize>,
    #[arg(long, default_value = "uniform_barriers.tsv")]
    output: String,
    /// Run the simulation but do not write contacts (profiling aid)
    #[arg(long, default_value_t = false)]
    skip_output: bool,
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
    config.lefs_per_mbp = args.lefs_per_mbp;
    config.simulation_iterations = Some(args.iterations);
    config.seed = seed;
    config.skip_output = args.skip_output;
    if let Some(n) = args.nthreads {
        config.nthreads = n;
    }

    let mut genome = Genome::new(&[ChromSpec::whole("chrS", args.chrom_size)])?;
    let records: Vec<BarrierRecord> = (1..)
        .map(|k| k as u64 * args.barrier_spacing)
        .take_while(|&pos| pos < args.chrom_size)
        .enumerate()
        .map(|(k, pos)| BarrierRecord {
            chrom: "chrS".into(),
            pos,
            strand: if k % 2 == 0 { '-' } else { '+' },
            occupancy: args.barrier_occupancy,
        })
        .collect();
    let (imported, _) = genome.import_barriers(
        &records,
        config.probability_of_extrusion_barrier_block,
        config.ctcf_occupied_self_prob,
        config.ctcf_not_occupied_self_prob,
    )?;
    eprintln!("Simulating 1 chromosome with {} barriers (seed {})", imported, seed);

    let sim = Simulation::new(config, genome)?;
    if args.skip_output {
        sim.run(&mut NullWriter)?;
    } else {
        let out = BufWriter::new(File::create(&args.output)?);
        let mut writer = TextPixelWriter::new(out, args.bin_size);
        sim.run(&mut writer)?;
        eprintln!("Contacts written to {}", args.output);
    }
    Ok(())
}
