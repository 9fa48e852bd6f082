use std::{
    io::{self, IsTerminal, Write},
    process::ExitCode,
};

use anyhow::{Context, Result};
use azure_blobstore::{
    azure::AzureBlobBackend,
    blobstore::BlobstoreClient,
    cli::{execute, Cli, Outcome},
    config::AzureStorageConfig,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Logs go to stderr, stdout is reserved for `sign` and `list` output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(io::stderr().is_terminal())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(err) => {
            // Not a log event: the failure is reported whatever RUST_LOG says
            let _ = report_error(&err, &mut io::stderr());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<Outcome> {
    let config = AzureStorageConfig::from_path(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let backend = AzureBlobBackend::new(&config)?;
    let client = BlobstoreClient::new(backend).with_sign_policy(config.sign_policy()?);

    let name = cli.command.name();
    let mut stdout = io::stdout();
    execute(&client, cli.command, &mut stdout)
        .await
        .with_context(|| format!("performing operation {name}"))
}

/// Writes the error and its causes on one line
///
/// A cause whose message is already part of the previous one is skipped, since
/// some errors (reqwest, hyper) include their source in their own message.
fn report_error<W: Write>(err: &anyhow::Error, out: &mut W) -> io::Result<()> {
    let mut line = String::from("Error: ");
    let mut previous = String::new();
    for cause in err.chain() {
        let message = cause.to_string();
        if !previous.ends_with(&message) {
            if !previous.is_empty() {
                line.push_str(": ");
            }
            line.push_str(&message);
        }
        previous = message;
    }
    writeln!(out, "{line}")
}
