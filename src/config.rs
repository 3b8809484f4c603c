//! Configuration input and resolution.
//!
//! The pipeline hands over one JSON document with a `source` object (SMTP
//! connection, sender and recipients) and a `params` object (content). Several
//! fields can be given either inline or as a path into the source tree; the
//! [`ConfigResolver`] merges them into a single immutable [`ResolvedConfig`].
//!
//! ```
//! use email_dispatch::config::{ConfigResolver, Input};
//! use std::collections::HashMap;
//! use std::path::Path;
//!
//! let input: Input = serde_json::from_str(r#"{
//!     "source": {
//!         "smtp": { "host": "smtp.example.com", "port": "587", "anonymous": true },
//!         "from": "ci@example.com",
//!         "to": ["team@example.com"]
//!     },
//!     "params": { "subject_text": "Build ${BUILD_ID}", "body_text": "green" }
//! }"#).unwrap();
//!
//! let env = HashMap::from([("BUILD_ID".to_string(), "42".to_string())]);
//! let config = ConfigResolver::new(Path::new("/tmp/build"), &env)
//!     .resolve(&input)
//!     .expect("valid config");
//!
//! assert_eq!(config.content.subject, "Build 42");
//! assert_eq!(config.smtp.server_address(), "smtp.example.com:587");
//! ```

use crate::auth::{AuthMechanism, Credentials};
use crate::connection;
use crate::error::{Error, Result};
use crate::tokens::{substitute, TokenSource};
use email_address::EmailAddress;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Greeting name used when `host_origin` is not configured.
pub const DEFAULT_ORIGIN: &str = "localhost";

// ─────────────────────────────────────────────────────────────────────────────
// Raw input
// ─────────────────────────────────────────────────────────────────────────────

/// The JSON document read from standard input.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Input {
    /// Connection, sender and recipient configuration.
    pub source: Source,
    /// Content configuration.
    pub params: Params,
}

/// The `source` object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Source {
    /// SMTP connection settings.
    pub smtp: SmtpSource,
    /// Sender address.
    pub from: String,
    /// Primary recipients.
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients.
    pub bcc: Vec<String>,
}

/// The `source.smtp` object.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct SmtpSource {
    /// Server hostname.
    pub host: String,
    /// Server port, as a string or a number.
    #[serde(deserialize_with = "port_as_string")]
    pub port: String,
    /// User name for authentication.
    pub username: String,
    /// Password for authentication.
    pub password: String,
    /// Skip authentication even if the server offers it.
    pub anonymous: bool,
    /// Disable certificate validation after `STARTTLS`.
    pub skip_ssl_validation: bool,
    /// PEM bundle of trusted CA certificates.
    pub ca_cert: String,
    /// Name announced in `EHLO`.
    pub host_origin: String,
    /// Use the `LOGIN` mechanism instead of `PLAIN`.
    pub login_auth: bool,
    /// Retry a refused greeting as `localhost`.
    pub greeting_fallback: bool,
    /// Connection timeout in seconds.
    pub connect_timeout: Option<u64>,
    /// Per-command timeout in seconds.
    pub command_timeout: Option<u64>,
}

impl std::fmt::Debug for SmtpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSource")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("anonymous", &self.anonymous)
            .field("skip_ssl_validation", &self.skip_ssl_validation)
            .field("ca_cert", &!self.ca_cert.is_empty())
            .field("host_origin", &self.host_origin)
            .field("login_auth", &self.login_auth)
            .field("greeting_fallback", &self.greeting_fallback)
            .finish_non_exhaustive()
    }
}

/// The `params` object.
///
/// Each `*_text` field is the inline variant of the path field next to it and
/// wins whenever it is non-empty.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Path of the file holding the subject.
    pub subject: String,
    /// Inline subject.
    pub subject_text: String,
    /// Path of the file holding the body.
    pub body: String,
    /// Inline body.
    pub body_text: String,
    /// Deliver even when the body is empty.
    pub send_empty_body: bool,
    /// Path of the file holding extra headers.
    pub headers: String,
    /// Inline extra headers.
    pub headers_text: String,
    /// Path of a file with comma-separated `To` addresses.
    pub to: String,
    /// Inline comma-separated `To` addresses.
    pub to_text: String,
    /// Path of a file with comma-separated `Cc` addresses.
    pub cc: String,
    /// Inline comma-separated `Cc` addresses.
    pub cc_text: String,
    /// Path of a file with comma-separated `Bcc` addresses.
    pub bcc: String,
    /// Inline comma-separated `Bcc` addresses.
    pub bcc_text: String,
    /// Paths of files to attach.
    pub attachments: Vec<String>,
    /// Verbose protocol logging.
    pub debug: bool,
}

pub(crate) fn port_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u64),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Text(text) => text,
        Port::Number(number) => number.to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolved configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Fully merged and validated configuration for one delivery.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Connection settings.
    pub smtp: SmtpSettings,
    /// Sender and recipients.
    pub envelope: Envelope,
    /// Subject, body, headers and attachments.
    pub content: Content,
}

/// How the server certificate is checked after `STARTTLS`.
#[derive(Clone, PartialEq, Eq)]
pub enum TrustMode {
    /// Validate against the bundled web PKI roots.
    SystemRoots,
    /// Trust only certificates chaining to this PEM bundle.
    CustomCa(Vec<u8>),
    /// Accept any certificate.
    SkipValidation,
}

impl std::fmt::Debug for TrustMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustMode::SystemRoots => f.write_str("SystemRoots"),
            TrustMode::CustomCa(pem) => write!(f, "CustomCa({} bytes)", pem.len()),
            TrustMode::SkipValidation => f.write_str("SkipValidation"),
        }
    }
}

/// Timeout configuration for the SMTP session.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout for establishing the TCP connection.
    pub connect: Duration,
    /// Timeout for each command/reply exchange.
    pub command: Duration,
    /// Timeout for transferring the message payload.
    pub data: Duration,
    /// Timeout for `QUIT`.
    pub quit: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            command: Duration::from_secs(60),
            data: Duration::from_secs(300),
            quit: Duration::from_secs(10),
        }
    }
}

/// SMTP connection settings.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Name announced in `EHLO`.
    pub origin: String,
    /// Certificate validation mode.
    pub trust: TrustMode,
    /// Authentication mechanism.
    pub auth: AuthMechanism,
    /// Session timeouts.
    pub timeouts: TimeoutConfig,
    /// Retry a refused greeting as `localhost`.
    pub greeting_fallback: bool,
}

impl SmtpSettings {
    /// Creates settings for an anonymous session with default timeouts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            origin: DEFAULT_ORIGIN.to_string(),
            trust: TrustMode::SystemRoots,
            auth: AuthMechanism::Anonymous,
            timeouts: TimeoutConfig::default(),
            greeting_fallback: false,
        }
    }

    /// Returns the server address as "host:port".
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Sender and recipients, in configured order and without deduplication.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// `From` header value as configured.
    pub from: String,
    /// Bare sender address used for `MAIL FROM`.
    pub sender: String,
    /// Primary recipients.
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients.
    pub bcc: Vec<String>,
}

impl Envelope {
    /// Every recipient across `to`, `cc` and `bcc`, in that order.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(String::as_str)
    }

    /// Total number of recipients.
    #[must_use]
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }
}

/// Message content.
#[derive(Debug, Clone, Default)]
pub struct Content {
    /// Subject line, without surrounding newlines.
    pub subject: String,
    /// Body text.
    pub body: String,
    /// Extra header block, one `Name: value` per line.
    pub headers: String,
    /// Absolute paths of files to attach.
    pub attachments: Vec<PathBuf>,
    /// Deliver even when the body is empty.
    pub send_empty_body: bool,
}

impl Content {
    /// Returns `true` when delivery should be skipped for lack of a body.
    #[must_use]
    pub fn skips_empty_body(&self) -> bool {
        self.body.is_empty() && !self.send_empty_body
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Where the value of a text-or-file field comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource<'a> {
    /// Literal text from the configuration.
    Inline(&'a str),
    /// A path to read, relative to the source root unless absolute.
    FromFile(&'a str),
    /// Neither was given.
    Unset,
}

impl<'a> FieldSource<'a> {
    /// Picks the winning source: non-empty inline text, then a non-empty path.
    #[must_use]
    pub fn select(text: &'a str, path: &'a str) -> Self {
        if !text.is_empty() {
            FieldSource::Inline(text)
        } else if !path.is_empty() {
            FieldSource::FromFile(path)
        } else {
            FieldSource::Unset
        }
    }
}

/// Merges raw [`Input`] into a [`ResolvedConfig`].
pub struct ConfigResolver<'a> {
    source_root: &'a Path,
    tokens: &'a dyn TokenSource,
}

impl<'a> ConfigResolver<'a> {
    /// Creates a resolver reading relative paths from `source_root` and
    /// substituting tokens from `tokens`.
    #[must_use]
    pub fn new(source_root: &'a Path, tokens: &'a dyn TokenSource) -> Self {
        Self {
            source_root,
            tokens,
        }
    }

    /// Validates the input and resolves every field.
    ///
    /// # Errors
    ///
    /// Returns the first failing validation rule, [`Error::InvalidCaCert`]
    /// for an unusable `ca_cert`, or [`Error::ReadSource`] when a referenced
    /// file cannot be read.
    #[instrument(name = "config::resolve", skip_all, fields(smtp_host = %input.source.smtp.host))]
    pub fn resolve(&self, input: &Input) -> Result<ResolvedConfig> {
        let (port, sender) = validate(input, self.source_root)?;
        let smtp = smtp_settings(&input.source.smtp, port)?;
        let params = &input.params;

        let subject = self
            .read_field("subject", FieldSource::select(&params.subject_text, &params.subject))?
            .trim_matches(is_newline)
            .to_string();
        let body = self.read_field("body", FieldSource::select(&params.body_text, &params.body))?;
        let headers = self
            .read_field("headers", FieldSource::select(&params.headers_text, &params.headers))?
            .trim_matches(is_newline)
            .to_string();

        let envelope = Envelope {
            from: input.source.from.clone(),
            sender,
            to: self.resolve_list(
                "to",
                &input.source.to,
                FieldSource::select(&params.to_text, &params.to),
            )?,
            cc: self.resolve_list(
                "cc",
                &input.source.cc,
                FieldSource::select(&params.cc_text, &params.cc),
            )?,
            bcc: self.resolve_list(
                "bcc",
                &input.source.bcc,
                FieldSource::select(&params.bcc_text, &params.bcc),
            )?,
        };

        if envelope.recipient_count() == 0 {
            return Err(missing_recipients());
        }

        let attachments = params
            .attachments
            .iter()
            .map(|path| self.resolve_path(path))
            .collect();

        debug!(
            recipients = envelope.recipient_count(),
            body_len = body.len(),
            "Configuration resolved"
        );

        Ok(ResolvedConfig {
            smtp,
            envelope,
            content: Content {
                subject,
                body,
                headers,
                attachments,
                send_empty_body: params.send_empty_body,
            },
        })
    }

    /// Resolves `path` against the source root unless it is absolute.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.source_root.join(path)
        }
    }

    /// Produces the substituted text for one field.
    fn read_field(&self, field: &'static str, source: FieldSource<'_>) -> Result<String> {
        match source {
            FieldSource::Inline(text) => Ok(substitute(text, self.tokens)),
            FieldSource::FromFile(path) => {
                let path = self.resolve_path(path);
                let bytes = std::fs::read(&path).map_err(|source| Error::ReadSource {
                    field,
                    path: path.clone(),
                    source,
                })?;
                Ok(substitute(&String::from_utf8_lossy(&bytes), self.tokens))
            }
            FieldSource::Unset => Ok(String::new()),
        }
    }

    /// Concatenates the `source` list with the params-sourced list.
    ///
    /// The params text is split on `,` and each element trimmed; empty
    /// elements between consecutive commas are kept.
    fn resolve_list(
        &self,
        field: &'static str,
        configured: &[String],
        source: FieldSource<'_>,
    ) -> Result<Vec<String>> {
        let mut list = configured.to_vec();
        let text = self.read_field(field, source)?;
        if !text.is_empty() {
            list.extend(text.split(',').map(|address| address.trim().to_string()));
        }
        Ok(list)
    }
}

fn is_newline(c: char) -> bool {
    c == '\n' || c == '\r'
}

fn missing(field: &str) -> Error {
    Error::MissingField {
        field: field.to_string(),
    }
}

fn missing_recipients() -> Error {
    missing(r#""source.to" or "params.to". Must specify at least one"#)
}

/// Checks required fields in a fixed order and reports the first failure.
///
/// Returns the parsed port and the bare sender address.
fn validate(input: &Input, source_root: &Path) -> Result<(u16, String)> {
    let source = &input.source;
    let smtp = &source.smtp;
    let params = &input.params;

    if source_root.as_os_str().is_empty() {
        return Err(Error::MissingSourceRoot);
    }
    if smtp.host.is_empty() {
        return Err(missing(r#""source.smtp.host""#));
    }
    if smtp.port.is_empty() {
        return Err(missing(r#""source.smtp.port""#));
    }
    let port = smtp
        .port
        .trim()
        .parse::<u16>()
        .map_err(|_| Error::InvalidConfig {
            message: format!("\"source.smtp.port\" must be a TCP port, got {:?}", smtp.port),
        })?;
    if source.from.is_empty() {
        return Err(missing(r#""source.from""#));
    }
    let sender = bare_address(&source.from)?;

    let has_recipient = !source.to.is_empty()
        || !source.cc.is_empty()
        || !source.bcc.is_empty()
        || [
            &params.to,
            &params.to_text,
            &params.cc,
            &params.cc_text,
            &params.bcc,
            &params.bcc_text,
        ]
        .iter()
        .any(|field| !field.is_empty());
    if !has_recipient {
        return Err(missing_recipients());
    }

    if params.subject.is_empty() && params.subject_text.is_empty() {
        return Err(missing(
            r#""params.subject" or "params.subject_text". Must specify at least one"#,
        ));
    }

    if !smtp.anonymous {
        if smtp.username.is_empty() {
            return Err(missing(
                r#""source.smtp.username" if anonymous specify anonymous: true"#,
            ));
        }
        if smtp.password.is_empty() {
            return Err(missing(
                r#""source.smtp.password" if anonymous specify anonymous: true"#,
            ));
        }
    }

    Ok((port, sender))
}

/// Extracts and validates the address from `addr` or `Name <addr>`.
fn bare_address(from: &str) -> Result<String> {
    let trimmed = from.trim();
    let candidate = match (trimmed.rfind('<'), trimmed.ends_with('>')) {
        (Some(start), true) => &trimmed[start + 1..trimmed.len() - 1],
        _ => trimmed,
    };

    candidate
        .parse::<EmailAddress>()
        .map(|address| format!("{}@{}", address.local_part(), address.domain()))
        .map_err(|_| Error::InvalidAddress {
            field: "source.from",
            address: from.to_string(),
        })
}

/// Builds connection settings. A CA bundle is parsed here so a bad one is
/// reported before any connection is opened.
fn smtp_settings(smtp: &SmtpSource, port: u16) -> Result<SmtpSettings> {
    let trust = if smtp.skip_ssl_validation {
        TrustMode::SkipValidation
    } else if !smtp.ca_cert.is_empty() {
        let pem = smtp.ca_cert.as_bytes().to_vec();
        connection::custom_roots(&pem)?;
        TrustMode::CustomCa(pem)
    } else {
        TrustMode::SystemRoots
    };

    let auth = if smtp.anonymous {
        AuthMechanism::Anonymous
    } else {
        let credentials =
            Credentials::new(&smtp.username, SecretString::from(smtp.password.clone()));
        if smtp.login_auth {
            AuthMechanism::Login(credentials)
        } else {
            AuthMechanism::Plain(credentials)
        }
    };

    let mut timeouts = TimeoutConfig::default();
    if let Some(secs) = smtp.connect_timeout {
        timeouts.connect = Duration::from_secs(secs);
    }
    if let Some(secs) = smtp.command_timeout {
        timeouts.command = Duration::from_secs(secs);
    }

    Ok(SmtpSettings {
        host: smtp.host.clone(),
        port,
        origin: if smtp.host_origin.is_empty() {
            DEFAULT_ORIGIN.to_string()
        } else {
            smtp.host_origin.clone()
        },
        trust,
        auth,
        timeouts,
        greeting_fallback: smtp.greeting_fallback,
    })
}
