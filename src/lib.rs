//! # email-dispatch
//!
//! Outbound email dispatch for build pipelines.
//!
//! One JSON document describes an SMTP server, a sender, recipients and the
//! message content (inline or read from files in the build's source tree).
//! This crate resolves it, composes a MIME message, drives an SMTP session
//! by hand and reports what happened:
//!
//! - [`config`]: merge and validate the input into a [`ResolvedConfig`]
//! - [`message`]: build the MIME payload
//! - [`session`] and [`auth`]: greeting, `STARTTLS`, authentication
//! - [`delivery`]: the mail transaction with per-recipient soft failures
//! - [`report`]: the JSON record handed back to the pipeline
//! - [`mailbox`]: the IMAP side used by the `check` and `in` steps
//!
//! ## Features
//!
//! - **`observability`**: Enables OpenTelemetry integration for distributed tracing.
//!   Without this feature, tracing spans are still emitted but require no OTEL dependencies.
//!
//! ## Quick Start
//!
//! ```no_run
//! use email_dispatch::{dispatch, BuildEnvironment, ConfigResolver, Input, Report};
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let input: Input = serde_json::from_reader(std::io::stdin())?;
//!
//! let config = ConfigResolver::new(Path::new("/tmp/build/src"), &BuildEnvironment)
//!     .resolve(&input)?;
//! let outcome = dispatch(&config).await?;
//!
//! let report = Report::new(&config.smtp.host, &config.content.subject, "1.0.0")
//!     .with_outcome(&outcome);
//! println!("{}", serde_json::to_string(&report)?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Composing Without Sending
//!
//! ```
//! use email_dispatch::message::{Attachment, MessageBuilder};
//!
//! let message = MessageBuilder::new()
//!     .from("ci@example.com")
//!     .to(["team@example.com"])
//!     .subject("Nightly build")
//!     .body("All green")
//!     .attachment(Attachment::new("log.txt", b"ok".to_vec()))
//!     .build();
//!
//! assert!(message.boundary().is_some());
//! assert_eq!(message.header("Subject"), Some("Nightly build"));
//! ```
//!
//! ## Error Handling
//!
//! Every failure is an [`Error`] carrying its context. [`Error::step`] names
//! the SMTP step that failed and [`Error::category`] groups errors for logs:
//!
//! ```
//! use email_dispatch::Error;
//!
//! fn describe(error: &Error) -> String {
//!     match error.step() {
//!         Some(step) => format!("{} failed during {step}: {error}", error.category()),
//!         None => format!("{}: {error}", error.category()),
//!     }
//! }
//! ```
//!
//! ## Observability
//!
//! The crate uses `tracing` for instrumentation. All major operations emit spans with
//! structured fields suitable for distributed tracing.
//!
//! ### Span Naming Convention
//!
//! - `config::resolve` - Configuration resolution
//! - `message::compose` - Payload construction
//! - `delivery::dispatch` - One complete delivery
//! - `session::negotiate` / `session::starttls` - Session setup
//! - `auth::authenticate` - SMTP authentication
//! - `connection::dial` / `connection::upgrade_tls` - Transport
//! - `mailbox::connect` / `mailbox::check` / `mailbox::fetch` - IMAP
//!
//! ### Standard Fields
//!
//! - `smtp_host` / `imap_host` - Server hostname
//! - `port` - Server port
//! - `recipients` - Envelope size
//! - `step` / `category` - Where and how a delivery failed
//!
//! SMTP wire traffic is logged at `trace` level with credentials masked.
//!
//! Enable the `observability` feature for OpenTelemetry integration.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
pub mod auth;
pub mod config;
pub mod delivery;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod report;
pub mod session;
pub mod tokens;

// Internal modules
mod connection;

// Re-exports for ergonomic API
pub use auth::{AuthMechanism, Credentials};
pub use config::{ConfigResolver, Input, ResolvedConfig, SmtpSettings, TimeoutConfig, TrustMode};
pub use delivery::{dispatch, DeliveryOutcome, DeliveryStatus, RecipientStatus};
pub use email_address::EmailAddress;
pub use error::{Error, ErrorCategory, Result, Step};
pub use mailbox::{MailboxClient, MailboxConfig};
pub use message::{compose, ComposedMessage, MessageBuilder};
pub use report::{MetadataItem, Report};
pub use session::SmtpSession;
pub use tokens::{BuildEnvironment, TokenSource};
