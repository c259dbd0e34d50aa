//! Command-line harness shared by the two variant binaries.
//!
//! The variant is chosen per binary rather than per flag, so the flag surface stays
//! identical for both executables.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Instant;

use clap::Parser;
use log::{info, warn};

use crate::driver::{self, ChunkReader, DriverOptions};
use crate::{
    ChainedTable, TableConfig, DEFAULT_NUM_BUCKETS, DEFAULT_NUM_THREADS, INIT_NUM_LOCKS_RATIO,
};

/// Concurrent chained hash table workload runner.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Input operation file, one `L key value` or `I key value` per line.
    #[arg(short = 'f', default_value = "output.txt")]
    file: PathBuf,

    /// Initial bucket count; values below 1 fall back to the default.
    #[arg(short = 'b', default_value_t = DEFAULT_NUM_BUCKETS as i64)]
    buckets: i64,

    /// Worker thread count; values below 1 fall back to the default.
    #[arg(short = 't', default_value_t = DEFAULT_NUM_THREADS as i64)]
    threads: i64,

    /// Disable resizing.
    #[arg(short = 'r')]
    disable_resize: bool,

    /// Speed-test mode: suppress metric tracking and reporting.
    #[arg(short = 's')]
    speed_test: bool,
}

/// Entry point for a variant binary: parse flags, run the workload, report.
pub fn run_variant<T: ChainedTable>() -> ExitCode {
    env_logger::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let failed = err.use_stderr();
            err.print().ok();
            return if failed {
                ExitCode::FAILURE
            } else {
                // --help and --version land here.
                ExitCode::SUCCESS
            };
        }
    };

    let num_buckets = if cli.buckets < 1 {
        warn!("bucket count must be at least 1, using default {DEFAULT_NUM_BUCKETS}");
        DEFAULT_NUM_BUCKETS
    } else {
        cli.buckets as usize
    };
    let num_threads = if cli.threads < 1 {
        warn!("thread count must be at least 1, using default {DEFAULT_NUM_THREADS}");
        DEFAULT_NUM_THREADS
    } else {
        cli.threads as usize
    };

    let reader = match ChunkReader::open(&cli.file) {
        Ok(reader) => reader,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let config = TableConfig {
        resize_enabled: !cli.disable_resize,
        track_items: !cli.speed_test,
    };
    let num_locks = (num_buckets / INIT_NUM_LOCKS_RATIO).max(1);
    let table = T::with_config(num_buckets, num_locks, config);
    let options = DriverOptions {
        num_threads,
        speed_test: cli.speed_test,
    };

    info!(
        "{} table: {} buckets, {} threads, resizing {}",
        T::VARIANT,
        num_buckets,
        num_threads,
        if config.resize_enabled { "on" } else { "off" }
    );

    let start = Instant::now();
    let metrics = driver::run(&table, reader, &options);
    let elapsed = start.elapsed();

    println!("execution time: {:.6} seconds", elapsed.as_secs_f64());
    if !cli.speed_test {
        println!("total_ops: {}", metrics.total_ops.load(Ordering::Relaxed));
        println!(
            "total_lookups: {}",
            metrics.total_lookups.load(Ordering::Relaxed)
        );
        println!(
            "successful_lookups: {}",
            metrics.successful_lookups.load(Ordering::Relaxed)
        );
        println!(
            "failed_lookups: {}",
            metrics.missed_lookups.load(Ordering::Relaxed)
        );
        println!(
            "total_inserts: {}",
            metrics.total_inserts.load(Ordering::Relaxed)
        );
        println!(
            "failed_matches: {}",
            metrics.failed_matches.load(Ordering::Relaxed)
        );
    }
    ExitCode::SUCCESS
}
