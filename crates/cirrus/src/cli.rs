//! Maintenance commands for inspecting and cleaning up commit state.

use clap::{Parser, Subcommand};
use object_store::path::Path;
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use cirrus_core::StorageProvider;

use crate::config::CommitterConfig;
use crate::error::{CommitError, StorageSnafu};
use crate::executor::WorkerPool;
use crate::operations::CommitOperations;
use crate::paths::SUCCESS_MARKER;
use crate::retry::RetryPolicy;
use crate::success::SuccessData;

#[derive(Parser, Debug)]
#[command(version, about = "Inspect and clean up deferred multipart commits")]
pub struct CliArgs {
    /// Committer configuration file (YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pending-commit records under a directory
    #[command(subcommand)]
    Pending(PendingCommand),

    /// Multipart uploads under a destination
    #[command(subcommand)]
    Uploads(UploadsCommand),

    /// Success markers
    #[command(subcommand)]
    Success(SuccessCommand),
}

#[derive(Subcommand, Debug)]
pub enum PendingCommand {
    /// List pending commits
    List {
        url: String,
        /// Only look at the directory itself, not below it
        #[arg(long)]
        shallow: bool,
    },
    /// Abort pending commits and delete their records
    Abort {
        url: String,
        #[arg(long)]
        shallow: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum UploadsCommand {
    /// Abort every multipart upload this process knows of under a path
    Abort { url: String },
}

#[derive(Subcommand, Debug)]
pub enum SuccessCommand {
    /// Print the success marker of an output directory
    Show { url: String },
}

impl CliArgs {
    pub fn load_config(&self) -> Result<CommitterConfig, CommitError> {
        match &self.config {
            Some(path) => Ok(CommitterConfig::from_file(path)?),
            None => Ok(CommitterConfig::default()),
        }
    }
}

async fn open(url: &str, config: &CommitterConfig) -> Result<(CommitOperations, Path), CommitError> {
    let provider = StorageProvider::for_url_with_options(url, config.storage_options.clone())
        .await
        .context(StorageSnafu {
            operation: "open store",
            path: url,
        })?;
    let base = provider.base_path().clone();
    let ops = CommitOperations::new(Arc::new(provider), RetryPolicy::from_config(&config.retry));
    Ok((ops, base))
}

/// Run one command, writing its report to stdout.
pub async fn run(args: CliArgs) -> Result<(), CommitError> {
    let config = args.load_config()?;

    match args.command {
        Command::Pending(PendingCommand::List { url, shallow }) => {
            let (ops, dir) = open(&url, &config).await?;
            let (pending, failures) = ops.load_pending(&dir, !shallow, None).await?;
            for commit in &pending.commits {
                println!(
                    "{}\t{}\t{} parts\t{} bytes\t{}",
                    commit.destination_key,
                    commit.upload_id,
                    commit.part_count(),
                    commit.length,
                    commit.filename.as_deref().unwrap_or_default()
                );
            }
            for (path, err) in &failures {
                println!("{path}\tunreadable: {err}");
            }
            info!(
                "{} pending commits, {} unreadable records under {dir}",
                pending.len(),
                failures.len()
            );
            Ok(())
        }
        Command::Pending(PendingCommand::Abort { url, shallow }) => {
            let (ops, dir) = open(&url, &config).await?;
            let pool = WorkerPool::new(config.threads);
            let outcome = ops.abort_all_pending(&dir, !shallow, Some(&pool)).await;
            pool.shutdown();
            let aborted = ops.statistics().snapshot()["commits_aborted"];
            println!("aborted {aborted} pending commits under {dir}");
            outcome.into_result()
        }
        Command::Uploads(UploadsCommand::Abort { url }) => {
            let (ops, dest) = open(&url, &config).await?;
            let count = ops.abort_pending_uploads_under(&dest).await?;
            println!("aborted {count} uploads under {dest}");
            Ok(())
        }
        Command::Success(SuccessCommand::Show { url }) => {
            let (ops, output) = open(&url, &config).await?;
            let marker = output.child(SUCCESS_MARKER);
            let data = SuccessData::load(ops.client().as_ref(), &marker).await?;
            let json = data.to_json()?;
            println!("{}", String::from_utf8_lossy(&json));
            Ok(())
        }
    }
}
