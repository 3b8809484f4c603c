//! Delivery driver: one message, one SMTP session.
//!
//! ```text
//! Idle → Validated → (SkippedEmptyBody | Composing) → SessionOpen
//!      → Authenticated → Sending → Completed | Failed
//! ```

use crate::config::{Envelope, ResolvedConfig};
use crate::error::{Error, Result};
use crate::message::{compose, ComposedMessage};
use crate::session::SmtpSession;
use tracing::{debug, error, info, instrument, warn};

/// Explanation recorded when an empty body suppresses delivery.
pub const EMPTY_BODY_NOTE: &str = "Message not sent because the message body is empty \
                                   and send_empty_body parameter was set to false.";

/// Driver progress, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Nothing done yet.
    Idle,
    /// Configuration accepted.
    Validated,
    /// Empty body, nothing sent.
    SkippedEmptyBody,
    /// Building the payload.
    Composing,
    /// Connected and greeted.
    SessionOpen,
    /// Authentication done or skipped.
    Authenticated,
    /// Running the mail transaction.
    Sending,
    /// Message accepted by the server.
    Completed,
    /// A fatal error ended the delivery.
    Failed,
}

/// What happened to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientStatus {
    /// Accepted by the server.
    Delivered,
    /// Permanently refused and left out of the transaction.
    Skipped {
        /// The rejection as reported by the server.
        reason: String,
    },
}

/// Per-recipient result, in envelope order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientOutcome {
    /// The recipient address.
    pub address: String,
    /// Whether it was delivered.
    pub status: RecipientStatus,
}

/// How a successful delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The server accepted the message.
    Completed,
    /// The body was empty and no session was opened.
    SkippedEmptyBody,
}

/// Result of a successful [`dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Terminal state.
    pub status: DeliveryStatus,
    /// One entry per envelope recipient.
    pub recipients: Vec<RecipientOutcome>,
    /// Set when `QUIT` failed after the message was accepted.
    pub quit_error: Option<String>,
}

impl DeliveryOutcome {
    fn skipped_empty_body() -> Self {
        Self {
            status: DeliveryStatus::SkippedEmptyBody,
            recipients: Vec::new(),
            quit_error: None,
        }
    }

    /// Addresses the server accepted.
    pub fn delivered(&self) -> impl Iterator<Item = &str> {
        self.recipients
            .iter()
            .filter(|outcome| outcome.status == RecipientStatus::Delivered)
            .map(|outcome| outcome.address.as_str())
    }

    /// Recipients that were soft-rejected.
    pub fn skipped(&self) -> impl Iterator<Item = &RecipientOutcome> {
        self.recipients
            .iter()
            .filter(|outcome| matches!(outcome.status, RecipientStatus::Skipped { .. }))
    }
}

struct Tracker {
    state: DeliveryState,
}

impl Tracker {
    fn advance(&mut self, next: DeliveryState) {
        debug!(from = ?self.state, to = ?next, "Delivery state change");
        self.state = next;
    }
}

/// Composes and delivers the message described by `config`.
///
/// An empty body without `send_empty_body` returns
/// [`DeliveryStatus::SkippedEmptyBody`] without connecting. Recipients
/// refused with a 550-class reply are skipped; any other failure aborts.
///
/// # Errors
///
/// Returns the first fatal error, carrying the failing protocol step.
#[instrument(
    name = "delivery::dispatch",
    skip_all,
    fields(
        smtp_host = %config.smtp.host,
        port = config.smtp.port,
        recipients = config.envelope.recipient_count()
    )
)]
pub async fn dispatch(config: &ResolvedConfig) -> Result<DeliveryOutcome> {
    let mut tracker = Tracker {
        state: DeliveryState::Idle,
    };
    tracker.advance(DeliveryState::Validated);

    if config.content.skips_empty_body() {
        info!("{}", EMPTY_BODY_NOTE);
        tracker.advance(DeliveryState::SkippedEmptyBody);
        return Ok(DeliveryOutcome::skipped_empty_body());
    }

    match run(config, &mut tracker).await {
        Ok(outcome) => {
            tracker.advance(DeliveryState::Completed);
            info!(
                delivered = outcome.delivered().count(),
                skipped = outcome.skipped().count(),
                "Message delivered"
            );
            Ok(outcome)
        }
        Err(err) => {
            let failed_in = tracker.state;
            tracker.advance(DeliveryState::Failed);
            error!(
                state = ?failed_in,
                step = ?err.step(),
                category = %err.category(),
                error = %err,
                "Delivery failed"
            );
            Err(err)
        }
    }
}

async fn run(config: &ResolvedConfig, tracker: &mut Tracker) -> Result<DeliveryOutcome> {
    // Files are read before any connection is opened
    tracker.advance(DeliveryState::Composing);
    let message = compose(config)?;

    tracker.advance(DeliveryState::SessionOpen);
    let session = SmtpSession::negotiate(&config.smtp).await?;
    tracker.advance(DeliveryState::Authenticated);

    tracker.advance(DeliveryState::Sending);
    send(session, &config.envelope, &message).await
}

/// Runs the mail transaction on a negotiated session and closes it.
///
/// # Errors
///
/// Returns [`Error::NoAcceptedRecipients`] when every recipient was
/// soft-rejected, or the first fatal protocol error.
pub async fn send(
    mut session: SmtpSession,
    envelope: &Envelope,
    message: &ComposedMessage,
) -> Result<DeliveryOutcome> {
    session.mail_from(&envelope.sender).await?;

    let mut recipients = Vec::with_capacity(envelope.recipient_count());
    for address in envelope.recipients() {
        let status = match session.rcpt_to(address).await {
            Ok(()) => RecipientStatus::Delivered,
            Err(err) if err.is_soft_rejection() => {
                warn!(recipient = address, error = %err, "Skipping recipient");
                RecipientStatus::Skipped {
                    reason: err.to_string(),
                }
            }
            Err(err) => return Err(err),
        };
        recipients.push(RecipientOutcome {
            address: address.to_string(),
            status,
        });
    }

    if !recipients
        .iter()
        .any(|outcome| outcome.status == RecipientStatus::Delivered)
    {
        return Err(Error::NoAcceptedRecipients);
    }

    session.data(&message.to_bytes()).await?;

    let quit_error = match session.quit().await {
        Ok(()) => None,
        Err(err) => {
            warn!(error = %err, "QUIT failed after the message was accepted");
            Some(err.to_string())
        }
    };

    Ok(DeliveryOutcome {
        status: DeliveryStatus::Completed,
        recipients,
        quit_error,
    })
}
