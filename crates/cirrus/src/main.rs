//! Cirrus CLI: inspect and clean up deferred multipart commits.

use std::process::ExitCode;

use clap::Parser;

use cirrus::cli::{CliArgs, run};
use cirrus::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
