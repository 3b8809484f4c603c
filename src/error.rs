//! Error types for the email-dispatch crate.
//!
//! All errors implement [`std::error::Error`] and carry the context needed to
//! diagnose them: the configuration field, the file being read, or the SMTP
//! step that failed. See [`Error::category`] for coarse classification and
//! [`Error::is_soft_rejection`] for the one failure the delivery driver
//! recovers from locally.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A step of the SMTP conversation, used to label protocol failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Opening the TCP connection.
    Dial,
    /// Banner, `EHLO` and `HELO`.
    Greeting,
    /// `STARTTLS` and the TLS handshake.
    StartTls,
    /// `AUTH` exchange.
    Authenticate,
    /// `MAIL FROM`.
    MailFrom,
    /// `RCPT TO`.
    RcptTo,
    /// `DATA` and the message payload.
    Data,
    /// `QUIT`.
    Quit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Dial => "dial",
            Step::Greeting => "greeting",
            Step::StartTls => "starttls",
            Step::Authenticate => "authenticate",
            Step::MailFrom => "mail-from",
            Step::RcptTo => "rcpt-to",
            Step::Data => "data",
            Step::Quit => "quit",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while resolving, composing or delivering a message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration errors (detected before any connection is opened)
    // ─────────────────────────────────────────────────────────────────────────
    /// No source root directory was supplied.
    #[error("expected path to build sources as first argument")]
    MissingSourceRoot,

    /// A required configuration field is absent or empty.
    #[error("missing required field {field}")]
    MissingField {
        /// The field (or alternative fields) that must be supplied.
        field: String,
    },

    /// Configuration is present but unusable.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// An address field could not be parsed.
    #[error("invalid email address in {field}: {address}")]
    InvalidAddress {
        /// The configuration field holding the address.
        field: &'static str,
        /// The offending value.
        address: String,
    },

    /// The custom CA bundle did not contain a usable certificate.
    #[error("invalid CA certificate bundle: {message}")]
    InvalidCaCert {
        /// What was wrong with the bundle.
        message: String,
    },

    /// Invalid DNS name for TLS.
    #[error("invalid DNS name for host '{host}'")]
    InvalidDnsName {
        /// The invalid hostname.
        host: String,
        /// The underlying DNS name error.
        #[source]
        source: rustls::client::InvalidDnsNameError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Source file errors
    // ─────────────────────────────────────────────────────────────────────────
    /// A file named by a configuration field could not be read.
    #[error("unable to read source file for {field}: {}", path.display())]
    ReadSource {
        /// The configuration field being resolved.
        field: &'static str,
        /// The resolved path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Composition errors
    // ─────────────────────────────────────────────────────────────────────────
    /// A header line had no `": "` separator.
    #[error("malformed header line (expected \"Name: value\"): {line:?}")]
    MalformedHeader {
        /// The offending line.
        line: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Network errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to establish the TCP connection.
    #[error("failed to connect to {target}")]
    Dial {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The TLS handshake after `STARTTLS` failed.
    #[error("unable to start TLS with {target}")]
    TlsHandshake {
        /// The target host.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Reading from or writing to the session failed.
    #[error("I/O failure during {step}")]
    Io {
        /// The step in progress.
        step: Step,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The server closed the connection mid-conversation.
    #[error("connection closed by server during {step}")]
    ConnectionClosed {
        /// The step in progress.
        step: Step,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Timeout errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Connection timeout.
    #[error("connection timeout to {target} after {timeout:?}")]
    ConnectTimeout {
        /// The target address.
        target: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// A command did not complete in time.
    #[error("timeout during {step} after {timeout:?}")]
    StepTimeout {
        /// The step in progress.
        step: Step,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // SMTP protocol errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The server answered with a reply the step does not accept.
    #[error("{step} failed: server replied {code} {message}")]
    UnexpectedReply {
        /// The step that failed.
        step: Step,
        /// The SMTP reply code.
        code: u16,
        /// The reply text.
        message: String,
    },

    /// The server sent something that is not an SMTP reply.
    #[error("invalid SMTP reply during {step}: {line:?}")]
    InvalidReply {
        /// The step in progress.
        step: Step,
        /// The raw line received.
        line: String,
    },

    /// The server refused the credentials.
    #[error("unable to auth using type {mechanism}: server replied {code} {message}")]
    AuthRejected {
        /// The SASL mechanism in use.
        mechanism: &'static str,
        /// The SMTP reply code.
        code: u16,
        /// The reply text.
        message: String,
    },

    /// The server sent a `LOGIN` challenge that is neither a username nor a password prompt.
    #[error("unexpected LOGIN challenge from server: {prompt:?}")]
    AuthPrompt {
        /// The decoded challenge.
        prompt: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The server refused a recipient.
    #[error("recipient {recipient} rejected: {code} {message}")]
    RecipientRejected {
        /// The refused address.
        recipient: String,
        /// The SMTP reply code.
        code: u16,
        /// The reply text.
        message: String,
    },

    /// Every recipient was refused, so there is nobody to send the data to.
    #[error("no recipient was accepted by the server")]
    NoAcceptedRecipients,

    // ─────────────────────────────────────────────────────────────────────────
    // Mailbox (IMAP) errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to establish the implicit-TLS IMAP connection.
    #[error("failed to establish TLS connection to {target}")]
    TlsConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// IMAP login failed.
    #[error("IMAP login failed for {username}")]
    ImapLogin {
        /// The user name used for login.
        username: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to open the mailbox.
    #[error("failed to open mailbox '{mailbox}'")]
    SelectMailbox {
        /// The mailbox name.
        mailbox: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP fetch failed.
    #[error("IMAP fetch failed for {range}")]
    ImapFetch {
        /// The sequence or UID range that failed.
        range: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP logout failed.
    #[error("IMAP logout failed")]
    ImapLogout {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// A mailbox operation did not complete in time.
    #[error("mailbox {operation} timed out after {timeout:?}")]
    MailboxTimeout {
        /// The IMAP operation in progress.
        operation: &'static str,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// The requested version identifier is not a UID.
    #[error("invalid version identifier {uid:?}")]
    InvalidVersion {
        /// The identifier supplied by the caller.
        uid: String,
    },

    /// The server returned no message for the UID.
    #[error("server didn't return message {uid}")]
    MessageNotFound {
        /// The UID requested.
        uid: u32,
    },

    /// Failed to parse a fetched message.
    #[error("failed to parse email")]
    ParseEmail {
        /// The underlying parse error.
        #[source]
        source: mailparse::MailParseError,
    },

    /// Failed to write a fetched message to disk.
    #[error("unable to write {}", path.display())]
    WriteOutput {
        /// The file or directory being written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Returns `true` for a permanent per-mailbox recipient rejection
    /// (reply codes 550 through 553).
    ///
    /// The delivery driver logs and skips such recipients instead of
    /// aborting the whole delivery.
    #[must_use]
    pub fn is_soft_rejection(&self) -> bool {
        // Wider than a bare 550 match: 551-553 are also permanent mailbox refusals
        matches!(self, Error::RecipientRejected { code, .. } if (550..=553).contains(code))
    }

    /// Returns the SMTP step a protocol failure belongs to, if any.
    #[must_use]
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Dial { .. } | Error::ConnectTimeout { .. } => Some(Step::Dial),
            Error::TlsHandshake { .. } | Error::InvalidCaCert { .. } => Some(Step::StartTls),
            Error::Io { step, .. }
            | Error::ConnectionClosed { step }
            | Error::StepTimeout { step, .. }
            | Error::UnexpectedReply { step, .. }
            | Error::InvalidReply { step, .. } => Some(*step),
            Error::AuthRejected { .. } | Error::AuthPrompt { .. } => Some(Step::Authenticate),
            Error::RecipientRejected { .. } | Error::NoAcceptedRecipients => Some(Step::RcptTo),
            _ => None,
        }
    }

    /// Returns the error category for logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::MissingSourceRoot
            | Error::MissingField { .. }
            | Error::InvalidConfig { .. }
            | Error::InvalidAddress { .. }
            | Error::InvalidCaCert { .. }
            | Error::InvalidDnsName { .. }
            | Error::InvalidVersion { .. } => ErrorCategory::Configuration,

            Error::ReadSource { .. } | Error::WriteOutput { .. } => ErrorCategory::Io,

            Error::MalformedHeader { .. } => ErrorCategory::Composition,

            Error::Dial { .. }
            | Error::TlsHandshake { .. }
            | Error::TlsConnect { .. }
            | Error::Io { .. }
            | Error::ConnectionClosed { .. } => ErrorCategory::Network,

            Error::ConnectTimeout { .. }
            | Error::StepTimeout { .. }
            | Error::MailboxTimeout { .. } => ErrorCategory::Timeout,

            Error::UnexpectedReply { .. }
            | Error::InvalidReply { .. }
            | Error::RecipientRejected { .. }
            | Error::NoAcceptedRecipients => ErrorCategory::Protocol,

            Error::AuthRejected { .. } | Error::AuthPrompt { .. } | Error::ImapLogin { .. } => {
                ErrorCategory::Authentication
            }

            Error::SelectMailbox { .. }
            | Error::ImapFetch { .. }
            | Error::ImapLogout { .. }
            | Error::MessageNotFound { .. }
            | Error::ParseEmail { .. } => ErrorCategory::Mailbox,
        }
    }
}

/// Error categories for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration or validation errors.
    Configuration,
    /// Local file errors.
    Io,
    /// Message composition errors.
    Composition,
    /// Network connectivity errors.
    Network,
    /// Timeout errors.
    Timeout,
    /// SMTP protocol errors.
    Protocol,
    /// Authentication errors.
    Authentication,
    /// IMAP mailbox errors.
    Mailbox,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Io => write!(f, "io"),
            ErrorCategory::Composition => write!(f, "composition"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Authentication => write!(f, "authentication"),
            ErrorCategory::Mailbox => write!(f, "mailbox"),
        }
    }
}
