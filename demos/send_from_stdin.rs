//! Example: Deliver a message described by JSON on standard input.
//!
//! This is the `out` step without the surrounding binary, with
//! span enter/exit events so the session's progress is visible.
//!
//! # Usage
//!
//! ```bash
//! # Set log level (trace shows the SMTP conversation)
//! export RUST_LOG=email_dispatch=debug
//!
//! cargo run --example send_from_stdin -- ./build-output < request.json
//! ```

use email_dispatch::{dispatch, BuildEnvironment, ConfigResolver, Input, Report};
use std::env;
use std::path::PathBuf;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("email_dispatch=info")),
        )
        .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
        .with_writer(std::io::stderr)
        .init();

    let source_root = env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("."), PathBuf::from);

    let input: Input = serde_json::from_reader(std::io::stdin())?;
    let config = ConfigResolver::new(&source_root, &BuildEnvironment).resolve(&input)?;
    tracing::info!(
        smtp_host = %config.smtp.host,
        recipients = config.envelope.recipient_count(),
        "Configuration resolved"
    );

    let report = Report::new(&config.smtp.host, &config.content.subject, "demo");
    match dispatch(&config).await {
        Ok(outcome) => {
            for recipient in outcome.skipped() {
                println!("Skipped {}: {:?}", recipient.address, recipient.status);
            }
            println!("{}", serde_json::to_string_pretty(&report.with_outcome(&outcome))?);
            Ok(())
        }
        Err(e) => {
            println!("Delivery failed");
            println!("  Error: {e}");
            println!("  Category: {}", e.category());
            if let Some(step) = e.step() {
                println!("  Step: {step}");
            }
            Err(e.into())
        }
    }
}
