use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, bounded};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::StoppingCondition;
use crate::genome::Chromosome;
use crate::matrix::ContactMatrix;
use crate::simulation::{Counters, Simulation, State, Task};

// ── Writer interface ─────────────────────────────────────────────────────────

/// Sink for finished chromosomes. `contacts` is `None` for knocked-out
/// chromosomes so the sink can still emit an empty entry.
pub trait ContactsWriter: Send {
    fn write_chromosome(
        &mut self,
        name: &str,
        start: u64,
        end: u64,
        size: u64,
        contacts: Option<&ContactMatrix>,
    ) -> Result<()>;

    /// Called once after the last chromosome.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes non-zero pixels as `chrom  start1  start2  count` records, one
/// chromosome block after another, with a `#` header line per chromosome.
pub struct TextPixelWriter<W: Write + Send> {
    out: W,
    bin_size: u64,
}

impl<W: Write + Send> TextPixelWriter<W> {
    pub fn new(out: W, bin_size: u64) -> Self {
        Self { out, bin_size }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ContactsWriter for TextPixelWriter<W> {
    fn write_chromosome(
        &mut self,
        name: &str,
        start: u64,
        end: u64,
        size: u64,
        contacts: Option<&ContactMatrix>,
    ) -> Result<()> {
        let tot = contacts.map_or(0, ContactMatrix::tot_contacts);
        writeln!(self.out, "# {}\t{}\t{}\t{}\t{}", name, start, end, size, tot)
            .context("failed to write chromosome header")?;
        if let Some(m) = contacts {
            for (bin1, bin2, count) in m.iter_nonzero() {
                writeln!(
                    self.out,
                    "{}\t{}\t{}\t{}",
                    name,
                    start + bin1 as u64 * self.bin_size,
                    start + bin2 as u64 * self.bin_size,
                    count
                )
                .context("failed to write contact pixel")?;
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.out.flush().context("failed to flush contact output")
    }
}

/// Discards everything; used with `skip_output`.
#[derive(Debug, Default)]
pub struct NullWriter;

impl ContactsWriter for NullWriter {
    fn write_chromosome(
        &mut self,
        _name: &str,
        _start: u64,
        _end: u64,
        _size: u64,
        _contacts: Option<&ContactMatrix>,
    ) -> Result<()> {
        Ok(())
    }
}

// ── Progress queue ───────────────────────────────────────────────────────────

struct ProgressEntry<'a> {
    chrom: &'a Chromosome,
    cells_completed: usize,
}

/// Per-chromosome completion counts, pre-populated in genome order so the
/// writer emits chromosomes deterministically.
struct ProgressQueue<'a> {
    queue: Mutex<VecDeque<ProgressEntry<'a>>>,
    cond: Condvar,
}

impl<'a> ProgressQueue<'a> {
    fn new(entries: VecDeque<ProgressEntry<'a>>) -> Self {
        Self { queue: Mutex::new(entries), cond: Condvar::new() }
    }

    fn complete_cell(&self, chrom_id: usize) {
        let mut queue = self.queue.lock().unwrap();
        if let Some(entry) = queue.iter_mut().find(|e| e.chrom.id == chrom_id) {
            entry.cells_completed += 1;
        }
        self.cond.notify_all();
    }

    fn notify(&self) {
        self.cond.notify_all();
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

impl Simulation {
    /// Per-task contact quota for a matrix of `npixels` band pixels.
    fn target_contacts_per_task(&self, density: f64, npixels: usize) -> u64 {
        let per_chrom = density * npixels as f64;
        ((per_chrom / self.config().num_cells as f64).ceil() as u64).max(1)
    }

    fn plan_tasks(&self) -> (Vec<TaskPlan<'_>>, u64) {
        let config = self.config();
        let lefs_per_chrom = self.genome().lefs_per_chromosome(config.lefs_per_mbp);
        let mut plans = Vec::new();
        let mut tot_ticks = 0u64;
        for chrom in self.genome().chromosomes() {
            if !chrom.ok() {
                continue;
            }
            let ncols = chrom.nbins(config.bin_size);
            let npixels = config.nrows().min(ncols) * ncols;
            let (target_epochs, target_contacts, ticks) = match config.stopping_condition() {
                StoppingCondition::Epochs(n) => (n, u64::MAX, n),
                StoppingCondition::ContactDensity(d) => {
                    let target = self.target_contacts_per_task(d, npixels);
                    (u64::MAX, target, target)
                }
            };
            tot_ticks += ticks.saturating_mul(config.num_cells as u64);
            plans.push(TaskPlan {
                chrom,
                num_lefs: lefs_per_chrom[chrom.id],
                target_epochs,
                target_contacts,
            });
        }
        (plans, tot_ticks)
    }

    /// Run the whole simulation: a bounded task queue feeding a fixed pool
    /// of workers, a writer thread emitting finished chromosomes in genome
    /// order, and a progress thread reporting throughput.
    pub fn run(&self, writer: &mut (dyn ContactsWriter + '_)) -> Result<()> {
        let config = self.config();
        let (plans, tot_ticks) = self.plan_tasks();
        let num_workers = config.nthreads.min(plans.len().max(1) * config.num_cells).max(1);

        // Writer queue in genome order; knocked-out chromosomes are born
        // complete so the writer can emit their empty entries.
        let entries: VecDeque<ProgressEntry<'_>> = self
            .genome()
            .chromosomes()
            .iter()
            .filter(|c| c.ok() || config.write_contacts_for_ko_chroms)
            .map(|chrom| ProgressEntry {
                chrom,
                cells_completed: if chrom.ok() { 0 } else { config.num_cells },
            })
            .collect();
        let progress = ProgressQueue::new(entries);
        let counters = Counters::default();
        let fatal = AtomicBool::new(false);
        let workers_done = AtomicBool::new(false);
        let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        let (task_tx, task_rx) = bounded::<Task<'_>>(num_workers * 2);

        let record_error = |err: anyhow::Error| {
            fatal.store(true, Ordering::Relaxed);
            let mut slot = first_error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
            progress.notify();
        };

        thread::scope(|scope| {
            let writer_handle = scope.spawn(|| {
                if let Err(err) = self.writer_loop(&progress, writer, &fatal, &workers_done) {
                    record_error(err);
                }
            });

            let progress_handle = scope.spawn(|| {
                self.progress_loop(tot_ticks, &counters, &workers_done);
            });

            let worker_handles: Vec<_> = (0..num_workers)
                .map(|_| {
                    let task_rx = task_rx.clone();
                    scope.spawn(|| {
                        if let Err(err) =
                            self.worker_loop(task_rx, &progress, &counters, &fatal)
                        {
                            record_error(err);
                        }
                    })
                })
                .collect();
            drop(task_rx);

            let mut task_id = 0;
            'enqueue: for plan in &plans {
                for cell_id in 0..config.num_cells {
                    let task = Task {
                        id: task_id,
                        chrom: plan.chrom,
                        cell_id,
                        target_epochs: plan.target_epochs,
                        target_contacts: plan.target_contacts,
                        num_lefs: plan.num_lefs,
                        barriers: plan.chrom.barriers(),
                        seed: config.seed,
                    };
                    task_id += 1;
                    // Send fails only once every worker has bailed out.
                    if fatal.load(Ordering::Relaxed) || task_tx.send(task).is_err() {
                        break 'enqueue;
                    }
                }
            }
            drop(task_tx);

            for handle in worker_handles {
                handle.join().expect("worker thread panicked");
            }
            workers_done.store(true, Ordering::Relaxed);
            progress.notify();
            writer_handle.join().expect("writer thread panicked");
            progress_handle.join().expect("progress thread panicked");
        });

        let result = match first_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        result
    }

    fn worker_loop<'a>(
        &'a self,
        task_rx: Receiver<Task<'a>>,
        progress: &ProgressQueue<'a>,
        counters: &Counters,
        fatal: &AtomicBool,
    ) -> Result<()> {
        let mut state: Option<State<'a>> = None;
        for task in task_rx.iter() {
            if fatal.load(Ordering::Relaxed) {
                break;
            }
            let chrom_id = task.chrom.id;
            let mut s = match state.take() {
                Some(mut s) => {
                    s.assign(task);
                    s
                }
                None => State::from_task(task),
            };
            self.simulate_cell(&mut s, counters).with_context(|| {
                format!("simulation failed for '{}' cell {}", s.chrom.name, s.cell_id)
            })?;
            progress.complete_cell(chrom_id);
            state = Some(s);
        }
        Ok(())
    }

    fn writer_loop<'a>(
        &self,
        progress: &ProgressQueue<'a>,
        writer: &mut (dyn ContactsWriter + '_),
        fatal: &AtomicBool,
        workers_done: &AtomicBool,
    ) -> Result<()> {
        loop {
            let finished_chrom: Option<&Chromosome> = {
                let mut queue = progress.queue.lock().unwrap();
                loop {
                    if fatal.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    let front_complete = queue
                        .front()
                        .is_some_and(|e| e.cells_completed >= self.config().num_cells);
                    if front_complete {
                        break Some(queue.pop_front().unwrap().chrom);
                    }
                    if queue.is_empty() && workers_done.load(Ordering::Relaxed) {
                        break None;
                    }
                    let (guard, _) = progress
                        .cond
                        .wait_timeout(queue, Duration::from_millis(100))
                        .unwrap();
                    queue = guard;
                }
            };

            let Some(chrom) = finished_chrom else {
                return writer.finalize();
            };
            if !self.config().skip_output {
                let contacts = chrom.contacts();
                writer
                    .write_chromosome(
                        &chrom.name,
                        chrom.start,
                        chrom.end,
                        chrom.size,
                        contacts.as_deref(),
                    )
                    .with_context(|| format!("failed to write contacts for '{}'", chrom.name))?;
            }
            chrom.deallocate_contacts();
        }
    }

    fn progress_loop(&self, tot_ticks: u64, counters: &Counters, workers_done: &AtomicBool) {
        let bar = ProgressBar::new(tot_ticks);
        if let Ok(style) = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40} {percent:>3}% {msg} (eta {eta})",
        ) {
            bar.set_style(style);
        }
        let poll = Duration::from_millis(500);
        while !workers_done.load(Ordering::Relaxed) {
            thread::sleep(poll);
            bar.set_position(counters.ticks.load(Ordering::Relaxed));
            let events = counters.extrusion_events.swap(0, Ordering::Relaxed);
            bar.set_message(format!(
                "{:.2}M extr/s",
                events as f64 / poll.as_secs_f64() / 1.0e6
            ));
        }
        bar.finish_and_clear();
    }
}

struct TaskPlan<'a> {
    chrom: &'a Chromosome,
    num_lefs: usize,
    target_epochs: u64,
    target_contacts: u64,
}
