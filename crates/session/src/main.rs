use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dialog_session::replay::{load_chunks, load_transcript};
use dialog_session::{ReplayError, ReplayInput, SettingsStore, replay};
use tracing_subscriber::EnvFilter;

/// Rebuild a persisted dialog transcript and replay recorded stream chunks on top of it.
#[derive(Parser, Debug)]
#[command(name = "dialog-replay", version)]
struct Cli {
    /// Persisted dialog messages as a JSON array.
    #[arg(value_name = "TRANSCRIPT")]
    transcript: PathBuf,

    /// Newline-delimited raw chunks delivered after the transcript.
    #[arg(long, value_name = "FILE")]
    chunks: Option<PathBuf>,

    /// Dialog id used for subject names.
    #[arg(long = "dialog", default_value = "replay")]
    dialog_id: String,

    /// Serve chunks with a sequence id up to this value through catch-up instead of live.
    #[arg(long, value_name = "SEQ")]
    live_from: Option<i64>,

    /// Settings file; defaults to the user config directory.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "replay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), ReplayError> {
    let store = match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = store.settings();

    let history = load_transcript(&cli.transcript)?;
    let chunks = match &cli.chunks {
        Some(path) => load_chunks(path)?,
        None => Vec::new(),
    };

    let report = replay(
        &settings,
        ReplayInput {
            dialog_id: cli.dialog_id,
            history,
            chunks,
            live_from: cli.live_from,
        },
    )
    .await?;

    println!("{}", report.to_json_pretty()?);
    Ok(())
}
