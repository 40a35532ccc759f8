use std::thread;
use std::time::Instant;

use clap::Parser;
use eyre::{bail, eyre, Result};
use memfacade::report::{Format, Snapshot};
use memfacade::{DefaultAlloc, SamplingOptions, GUARDED_ALLOC};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

/// Blocks each worker keeps alive before it starts freeing.
const LIVE_BLOCKS: usize = 64;

#[derive(Debug, Parser)]
pub struct RunArgs {
    #[arg(long, default_value_t = 4, help = "Number of worker threads")]
    pub threads: usize,

    #[arg(long, default_value_t = 100_000, help = "Allocations or frees per worker")]
    pub iterations: usize,

    #[arg(long, default_value_t = 4096, help = "Largest allocation in bytes")]
    pub max_size: usize,

    #[arg(
        long,
        help = "Probability that an allocation is sampled into the guarded pool (env: MEMFACADE_SAMPLE_RATE)"
    )]
    pub sample_rate: Option<f64>,

    #[arg(long, default_value_t = 0, help = "Seed for the workload's size and free pattern")]
    pub seed: u64,

    #[arg(long, value_enum, default_value_t = Format::Table, help = "Snapshot output format")]
    pub format: Format,
}

impl RunArgs {
    pub fn run(&self, global: &'static DefaultAlloc) -> Result<()> {
        if self.threads == 0 || self.max_size == 0 {
            bail!("--threads and --max-size must be positive");
        }

        let mut options = SamplingOptions::try_from_env()?;
        if let Some(rate) = self.sample_rate {
            options = options.sample_probability(rate);
        }
        GUARDED_ALLOC.init(&options)?;

        let before = global.tracker().amount();
        let started = Instant::now();
        let workers: Vec<_> = (0..self.threads)
            .map(|index| {
                let (seed, iterations, max_size) = (self.seed + index as u64, self.iterations, self.max_size);
                thread::spawn(move || workload(seed, iterations, max_size))
            })
            .collect();
        for worker in workers {
            worker.join().map_err(|_| eyre!("worker thread panicked"))?;
        }
        info!(
            "{} workers x {} iterations in {:.2?}, net {} bytes",
            self.threads,
            self.iterations,
            started.elapsed(),
            global.tracker().amount() - before
        );

        Snapshot::capture(global).print(self.format)?;
        Ok(())
    }
}

fn workload(seed: u64, iterations: usize, max_size: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<Vec<u8>> = Vec::with_capacity(LIVE_BLOCKS);
    for _ in 0..iterations {
        if live.is_empty() || (live.len() < LIVE_BLOCKS && rng.gen_bool(0.6)) {
            let size = rng.gen_range(1..=max_size);
            let mut block = vec![0u8; size];
            // Touch both ends: guarded blocks fault right past the last byte.
            block[0] = 1;
            block[size - 1] = 1;
            live.push(block);
        } else {
            let index = rng.gen_range(0..live.len());
            live.swap_remove(index);
        }
    }
    debug!("worker {seed} done, {} blocks still live", live.len());
}
