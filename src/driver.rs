//! Batch driver: reads an operation stream in newline-aligned chunks, fans the chunks
//! out to a worker team as parse tasks, and quiesces the team around table resizes.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crossbeam_queue::ArrayQueue;
use log::{debug, warn};
use thiserror::Error;

use crate::{ChainedTable, Team, INVALID_VALUE};

/// Bytes read from the input per chunk task, before newline alignment.
pub const FILE_CHUNK_SIZE: usize = 32 * 1024;

/// Upper bound on chunk tasks outstanding between two quiescent points.
pub const MAX_TASK_POOL: usize = 256;

/// Pure spins before an idle consumer starts yielding the CPU.
const SPIN_BEFORE_YIELD: i32 = 128;

// ================================================================================================
// SETUP ERRORS
// ================================================================================================

/// Failure to set the driver up. Runtime I/O degradation is handled in-stream (logged
/// and treated as end of input), not surfaced here.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("cannot open input file {path}: {source}")]
    OpenInput { path: PathBuf, source: io::Error },
}

// ================================================================================================
// INPUT CHUNKING
// ================================================================================================

/// Streams a file as byte chunks that always end on a line boundary.
pub struct ChunkReader {
    file: File,
}

impl ChunkReader {
    pub fn open(path: &Path) -> Result<Self, DriverError> {
        let file = File::open(path).map_err(|source| DriverError::OpenInput {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { file })
    }

    /// Next chunk, truncated at its last newline with the file cursor rewound past the
    /// cut so no line is ever split across chunks. An empty chunk means end of stream.
    pub fn next_chunk(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        buf.truncate(filled);
        if filled == FILE_CHUNK_SIZE {
            if let Some(pos) = buf.iter().rposition(|&b| b == b'\n') {
                let rewind = (filled - (pos + 1)) as i64;
                self.file.seek(SeekFrom::Current(-rewind))?;
                buf.truncate(pos + 1);
            }
        }
        Ok(buf)
    }
}

// ================================================================================================
// METRICS
// ================================================================================================

/// Global operation counters. Parse tasks tally locally and fold in once per chunk.
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_ops: AtomicU64,
    pub total_lookups: AtomicU64,
    pub successful_lookups: AtomicU64,
    pub missed_lookups: AtomicU64,
    pub total_inserts: AtomicU64,
    /// Lookups that returned a value differing from the one on the input line.
    pub failed_matches: AtomicU64,
}

impl Metrics {
    fn fold(&self, tally: &TaskTally) {
        self.total_ops.fetch_add(tally.total_ops, Ordering::Relaxed);
        self.total_lookups
            .fetch_add(tally.total_lookups, Ordering::Relaxed);
        self.successful_lookups
            .fetch_add(tally.successful_lookups, Ordering::Relaxed);
        self.missed_lookups
            .fetch_add(tally.missed_lookups, Ordering::Relaxed);
        self.total_inserts
            .fetch_add(tally.total_inserts, Ordering::Relaxed);
        self.failed_matches
            .fetch_add(tally.failed_matches, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Default)]
struct TaskTally {
    total_ops: u64,
    total_lookups: u64,
    successful_lookups: u64,
    missed_lookups: u64,
    total_inserts: u64,
    failed_matches: u64,
}

// ================================================================================================
// ROUND LOOP
// ================================================================================================

#[derive(Clone, Copy, Debug)]
pub struct DriverOptions {
    pub num_threads: usize,
    /// Skip all metric accounting and folding.
    pub speed_test: bool,
}

struct Shared<'a, T> {
    table: &'a T,
    team: Team,
    tasks: ArrayQueue<Vec<u8>>,
    /// Rounds whose dispatch phase has closed; consumers use it to tell a transiently
    /// empty pool from a finished one without any flag-reset handshake.
    rounds_dispatched: AtomicU64,
    end_of_file: AtomicBool,
    metrics: Metrics,
    speed_test: bool,
}

/// Run the workload in `reader` against `table` with a team of worker threads.
///
/// Worker 0 doubles as the producer: each round it dispatches up to
/// `MAX_TASK_POOL - 1` chunk tasks, stopping early at end of input or once the table
/// has flagged a resize. The whole team drains the pool, synchronises, performs the
/// resize if one is pending, and synchronises again, so no operation straddles a
/// resize. End of input is declared only by a read that yields zero bytes.
pub fn run<T: ChainedTable>(table: &T, mut reader: ChunkReader, options: &DriverOptions) -> Metrics {
    let shared = Shared {
        table,
        team: Team::new(options.num_threads),
        tasks: ArrayQueue::new(MAX_TASK_POOL),
        rounds_dispatched: AtomicU64::new(0),
        end_of_file: AtomicBool::new(false),
        metrics: Metrics::default(),
        speed_test: options.speed_test,
    };

    thread::scope(|scope| {
        for worker in 1..shared.team.size() {
            let shared = &shared;
            scope.spawn(move || worker_rounds(shared, worker, None));
        }
        worker_rounds(&shared, 0, Some(&mut reader));
    });

    shared.metrics
}

fn worker_rounds<T: ChainedTable>(
    shared: &Shared<'_, T>,
    worker: usize,
    mut reader: Option<&mut ChunkReader>,
) {
    let mut round = 0u64;
    loop {
        if let Some(reader) = reader.as_deref_mut() {
            dispatch_round(shared, reader);
        }
        drain_tasks(shared, round);
        shared.team.wait();

        if shared.table.resize_needed() {
            shared.table.resize(&shared.team, worker);
        }
        shared.team.wait();

        round += 1;
        if shared.end_of_file.load(Ordering::Relaxed) && shared.tasks.is_empty() {
            break;
        }
    }
}

/// Producer half of a round: enqueue chunk tasks until the pool cap is reached, the
/// input runs dry, or a resize is pending, then close the round's dispatch.
fn dispatch_round<T: ChainedTable>(shared: &Shared<'_, T>, reader: &mut ChunkReader) {
    let mut count = 0usize;
    loop {
        let chunk = match reader.next_chunk() {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("read error mid-stream, treating as end of input: {err}");
                Vec::new()
            }
        };
        if chunk.is_empty() {
            shared.end_of_file.store(true, Ordering::Relaxed);
            break;
        }
        let mut chunk = chunk;
        while let Err(rejected) = shared.tasks.push(chunk) {
            chunk = rejected;
            thread::yield_now();
        }
        count += 1;
        if count >= MAX_TASK_POOL - 1 {
            break;
        }
        if shared.table.resize_needed() {
            break;
        }
    }
    debug!("dispatched {count} chunk tasks");
    shared.rounds_dispatched.fetch_add(1, Ordering::Release);
}

/// Consumer half of a round: run parse tasks until the pool is empty and the round's
/// dispatch has closed.
fn drain_tasks<T: ChainedTable>(shared: &Shared<'_, T>, round: u64) {
    let mut spins = 0;
    loop {
        if let Some(chunk) = shared.tasks.pop() {
            run_task(shared, &chunk);
            spins = 0;
        } else if shared.rounds_dispatched.load(Ordering::Acquire) > round {
            break;
        } else {
            delay(&mut spins);
        }
    }
}

/// Parse one chunk line by line and apply its operations against the table.
fn run_task<T: ChainedTable>(shared: &Shared<'_, T>, chunk: &[u8]) {
    let mut tally = TaskTally::default();
    for line in chunk.split(|&b| b == b'\n') {
        let Ok(line) = std::str::from_utf8(line) else {
            continue;
        };
        let Some((op, key, value)) = parse_line(line) else {
            continue;
        };
        tally.total_ops += 1;
        match op {
            b'L' => {
                tally.total_lookups += 1;
                let found = shared.table.lookup(key);
                if !shared.speed_test {
                    if found == INVALID_VALUE {
                        tally.missed_lookups += 1;
                    } else {
                        tally.successful_lookups += 1;
                        if found != value {
                            tally.failed_matches += 1;
                        }
                    }
                }
            }
            b'I' => {
                tally.total_inserts += 1;
                shared.table.insert(key, value);
            }
            // Unknown opcodes count as ops and are otherwise skipped.
            _ => {}
        }
    }
    if !shared.speed_test {
        shared.metrics.fold(&tally);
    }
}

/// Split a line into opcode byte, key, and value. Lines without all three fields or
/// with non-numeric fields yield `None`.
fn parse_line(line: &str) -> Option<(u8, u64, u64)> {
    let mut fields = line.split_ascii_whitespace();
    let op = fields.next()?.bytes().next()?;
    let key = fields.next()?.parse().ok()?;
    let value = fields.next()?.parse().ok()?;
    Some((op, key, value))
}

#[inline(always)]
fn delay(spins: &mut i32) {
    if *spins < SPIN_BEFORE_YIELD {
        *spins += *spins + 1;
        std::hint::spin_loop();
    } else {
        *spins = 0;
        thread::yield_now();
    }
}

// ================================================================================================
// UNIT TESTS
// ================================================================================================
