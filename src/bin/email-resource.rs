//! Pipeline resource entry point.
//!
//! Reads one JSON document from standard input and writes one to standard
//! output. Logs go to standard error.
//!
//! ```bash
//! email-resource out /tmp/build/src < request.json
//! email-resource check < request.json
//! email-resource in /tmp/build/get < request.json
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use email_dispatch::config::Input;
use email_dispatch::mailbox::{self, MailboxInput};
use email_dispatch::{dispatch, BuildEnvironment, ConfigResolver, Report};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Sends and receives email for build pipelines
#[derive(Parser)]
#[command(name = "email-resource")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message described by standard input
    Out {
        /// Directory that relative paths in `params` resolve against
        source_root: PathBuf,
    },
    /// List the newest message versions in the mailbox
    Check,
    /// Download one message into a directory
    In {
        /// Directory the message files are written to
        destination: PathBuf,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "email_dispatch=debug"
    } else {
        "email_dispatch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn read_stdin() -> Result<String> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read request from standard input")?;
    Ok(raw)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Out { source_root } => out(&source_root).await,
        Commands::Check => check().await,
        Commands::In { destination } => fetch(&destination).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn out(source_root: &Path) -> Result<()> {
    let input: Input =
        serde_json::from_str(&read_stdin()?).context("failed to parse request JSON")?;
    init_tracing(input.params.debug);

    let config = ConfigResolver::new(source_root, &BuildEnvironment).resolve(&input)?;
    let report = Report::new(
        &config.smtp.host,
        &config.content.subject,
        env!("CARGO_PKG_VERSION"),
    );

    match dispatch(&config).await {
        Ok(outcome) => print_json(&report.with_outcome(&outcome)),
        Err(err) => {
            // The pipeline still gets a record of the attempt
            print_json(&report)?;
            Err(err.into())
        }
    }
}

async fn check() -> Result<()> {
    let input: MailboxInput =
        serde_json::from_str(&read_stdin()?).context("failed to parse request JSON")?;
    init_tracing(false);

    let versions = mailbox::check(input.source.imap).await?;
    print_json(&versions)
}

async fn fetch(destination: &Path) -> Result<()> {
    let input: MailboxInput =
        serde_json::from_str(&read_stdin()?).context("failed to parse request JSON")?;
    init_tracing(false);

    let version = input
        .version
        .ok_or_else(|| anyhow!("request has no \"version\" to fetch"))?;
    let report = mailbox::fetch_into(input.source.imap, version, destination).await?;
    print_json(&report)
}
