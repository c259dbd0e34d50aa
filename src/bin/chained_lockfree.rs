//! Workload runner over the lock-free table variant.

use std::process::ExitCode;

use chainmap::cli;
use chainmap::LockFreeTable;

fn main() -> ExitCode {
    cli::run_variant::<LockFreeTable>()
}
