// depgate - main.rs
// Boot runner: seals the runtime identity, then dispatches the subcommand.

use anyhow::Context;
use clap::Parser;
use depgate::cli::{dispatch, Cli};
use depgate::patrol::FATAL_EXIT_CODE;
use std::process::exit;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => Ok(()),
        // Fatal errors carry only the short message; the details are in the
        // incident log.
        Err(e) if e.is_fatal() => {
            eprintln!("depgate: {e}");
            exit(FATAL_EXIT_CODE);
        }
        Err(e) => Err(e).context("depgate command failed"),
    }
}
