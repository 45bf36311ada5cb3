use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `false` when a command finished but left work incomplete.
async fn try_main() -> anyhow::Result<bool> {
    bookharvest::logging::init().context("init logging")?;

    let cli = bookharvest::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        bookharvest::cli::Command::Ingest(args) => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                tracing::warn!("interrupt received; stopping after the current chapter");
                on_signal.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("second interrupt; exiting now");
                    std::process::exit(130);
                }
            });
            bookharvest::commands::ingest(args, cancel)
                .await
                .context("ingest")
        }
        bookharvest::cli::Command::Manifest {
            command: bookharvest::cli::ManifestCommand::List(args),
        } => {
            bookharvest::commands::manifest_list(args)
                .await
                .context("manifest list")?;
            Ok(true)
        }
        bookharvest::cli::Command::Cache {
            command: bookharvest::cli::CacheCommand::Clear(args),
        } => {
            bookharvest::commands::cache_clear(args)
                .await
                .context("cache clear")?;
            Ok(true)
        }
    }
}
