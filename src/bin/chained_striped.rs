//! Workload runner over the striped-lock table variant.

use std::process::ExitCode;

use chainmap::cli;
use chainmap::StripedTable;

fn main() -> ExitCode {
    cli::run_variant::<StripedTable>()
}
