//! Mailbox polling for the `check` and `in` steps.
//!
//! A thin async-imap client: [`MailboxClient::check`] lists the newest
//! message UIDs and [`MailboxClient::fetch`] downloads one message, which
//! [`FetchedMessage::save`] writes into the step's output directory.
//!
//! # Example
//!
//! ```no_run
//! use email_dispatch::mailbox::{MailboxClient, MailboxConfig};
//!
//! # async fn example() -> email_dispatch::Result<()> {
//! let config: MailboxConfig = serde_json::from_str(r#"{
//!     "host": "imap.example.com", "port": "993",
//!     "username": "ci", "password": "secret"
//! }"#).expect("valid json");
//!
//! let mut client = MailboxClient::connect(config).await?;
//! for version in client.check().await? {
//!     let message = client.fetch(&version).await?;
//!     println!("{}: {}", version.uid, message.subject);
//! }
//! client.logout().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{port_as_string, TimeoutConfig, TrustMode};
use crate::connection::{self, TlsStream};
use crate::error::{Error, Result};
use crate::message::Attachment;
use crate::report::MetadataItem;
use async_imap::Session;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, instrument, warn};

/// How many of the newest messages `check` reports.
const CHECK_WINDOW: u32 = 4;

type ImapSession = Session<TlsStream>;

/// The `source.imap` object.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// IMAP server hostname.
    pub host: String,
    /// IMAP server port (implicit TLS).
    #[serde(deserialize_with = "port_as_string")]
    pub port: String,
    /// Login user name.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Mailbox to poll, opened read-only.
    pub inbox: String,
    /// Disable certificate validation.
    pub skip_ssl_validation: bool,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: "993".to_string(),
            username: String::new(),
            password: String::new(),
            inbox: "INBOX".to_string(),
            skip_ssl_validation: false,
        }
    }
}

impl std::fmt::Debug for MailboxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("inbox", &self.inbox)
            .field("skip_ssl_validation", &self.skip_ssl_validation)
            .finish()
    }
}

impl MailboxConfig {
    fn validate(&self) -> Result<u16> {
        if self.host.is_empty() {
            return Err(Error::MissingField {
                field: r#""source.imap.host""#.to_string(),
            });
        }
        if self.username.is_empty() {
            return Err(Error::MissingField {
                field: r#""source.imap.username""#.to_string(),
            });
        }
        self.port
            .trim()
            .parse()
            .map_err(|_| Error::InvalidConfig {
                message: format!("\"source.imap.port\" must be a TCP port, got {:?}", self.port),
            })
    }

    fn trust(&self) -> TrustMode {
        if self.skip_ssl_validation {
            TrustMode::SkipValidation
        } else {
            TrustMode::SystemRoots
        }
    }
}

/// The `source` object of the `check` and `in` steps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MailboxSource {
    /// IMAP settings.
    pub imap: MailboxConfig,
}

/// Standard input of the `check` and `in` steps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MailboxInput {
    /// Connection settings.
    pub source: MailboxSource,
    /// Requested or last seen version.
    pub version: Option<Version>,
}

/// A message UID as an opaque version identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Decimal UID.
    pub uid: String,
}

impl Version {
    /// Wraps a UID.
    #[must_use]
    pub fn new(uid: u32) -> Self {
        Self {
            uid: uid.to_string(),
        }
    }

    fn parse_uid(&self) -> Result<u32> {
        self.uid.trim().parse().map_err(|_| Error::InvalidVersion {
            uid: self.uid.clone(),
        })
    }
}

/// Output of the `in` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReport {
    /// The fetched version.
    pub version: Version,
    /// Message metadata.
    pub metadata: Vec<MetadataItem>,
}

/// A downloaded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    /// Message UID.
    pub uid: u32,
    /// `Message-ID` header.
    pub message_id: String,
    /// Decoded subject.
    pub subject: String,
    /// `Date` header, if it could be parsed.
    pub date: Option<DateTime<Utc>>,
    /// First text part.
    pub body: String,
    /// Attached files.
    pub attachments: Vec<Attachment>,
}

impl FetchedMessage {
    /// Parses a raw RFC 5322 message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseEmail`] if the message cannot be parsed.
    pub fn parse(uid: u32, raw: &[u8]) -> Result<Self> {
        let parsed = parse_mail(raw).map_err(|source| Error::ParseEmail { source })?;

        let date = parsed
            .headers
            .get_first_value("Date")
            .and_then(|value| mailparse::dateparse(&value).ok())
            .and_then(|timestamp| DateTime::from_timestamp(timestamp, 0));

        let mut body = None;
        let mut attachments = Vec::new();
        collect_parts(&parsed, &mut body, &mut attachments)
            .map_err(|source| Error::ParseEmail { source })?;

        let body = match body {
            Some(body) => body,
            None => extract_body_text(&parsed).map_err(|source| Error::ParseEmail { source })?,
        };

        Ok(Self {
            uid,
            message_id: parsed.headers.get_first_value("Message-ID").unwrap_or_default(),
            subject: parsed.headers.get_first_value("Subject").unwrap_or_default(),
            date,
            body,
            attachments,
        })
    }

    /// The date in RFC 850 form, or an empty string.
    #[must_use]
    pub fn date_rfc850(&self) -> String {
        self.date
            .map(|date| date.format("%A, %d-%b-%y %H:%M:%S UTC").to_string())
            .unwrap_or_default()
    }

    /// Writes `version`, `subject`, `date`, `body` and `attachments/<name>`
    /// into `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteOutput`] naming the path that failed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let attachments_dir = dir.join("attachments");
        create_dir(&attachments_dir)?;

        write_file(&dir.join("version"), self.message_id.as_bytes())?;
        write_file(&dir.join("subject"), self.subject.as_bytes())?;
        write_file(&dir.join("date"), self.date_rfc850().as_bytes())?;
        write_file(&dir.join("body"), self.body.as_bytes())?;

        for attachment in &self.attachments {
            // Only the base name; a crafted filename must not escape the directory
            let Some(name) = Path::new(&attachment.filename).file_name() else {
                warn!(filename = %attachment.filename, "Skipping attachment without a usable name");
                continue;
            };
            write_file(&attachments_dir.join(name), &attachment.content)?;
        }

        debug!(dir = %dir.display(), attachments = self.attachments.len(), "Message saved");
        Ok(())
    }

    /// `Subject`, `Date` and `Number of Attachments` items.
    #[must_use]
    pub fn metadata(&self) -> Vec<MetadataItem> {
        vec![
            MetadataItem::new("Subject", self.subject.as_str()),
            MetadataItem::new("Date", self.date_rfc850()),
            MetadataItem::new("Number of Attachments", self.attachments.len().to_string()),
        ]
    }
}

/// Walks the MIME tree: the first inline text part becomes the body and
/// every part with an attachment disposition is collected.
fn collect_parts(
    part: &ParsedMail<'_>,
    body: &mut Option<String>,
    attachments: &mut Vec<Attachment>,
) -> std::result::Result<(), mailparse::MailParseError> {
    if !part.subparts.is_empty() {
        for subpart in &part.subparts {
            collect_parts(subpart, body, attachments)?;
        }
        return Ok(());
    }

    let disposition = part.get_content_disposition();
    if disposition.disposition == DispositionType::Attachment {
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned()
            .unwrap_or_else(|| format!("attachment-{}", attachments.len() + 1));
        attachments.push(Attachment::new(filename, part.get_body_raw()?));
    } else if body.is_none() && part.ctype.mimetype.starts_with("text/") {
        *body = Some(part.get_body()?);
    }
    Ok(())
}

/// Extracts text content from a parsed email, handling multipart messages.
fn extract_body_text(
    parsed: &ParsedMail<'_>,
) -> std::result::Result<String, mailparse::MailParseError> {
    if !parsed.subparts.is_empty() {
        // Look for text/plain first, then text/html
        for part in &parsed.subparts {
            let content_type = part.ctype.mimetype.to_lowercase();
            if content_type == "text/plain" || content_type == "text/html" {
                if let Ok(body) = part.get_body() {
                    return Ok(body);
                }
            }
        }

        if let Some(first_part) = parsed.subparts.first() {
            return extract_body_text(first_part);
        }
    }

    parsed.get_body()
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|source| Error::WriteOutput {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents).map_err(|source| Error::WriteOutput {
        path: path.to_path_buf(),
        source,
    })
}

/// Sequence range covering the newest `CHECK_WINDOW` messages.
fn check_range(exists: u32) -> Option<String> {
    if exists == 0 {
        return None;
    }
    let from = exists.saturating_sub(CHECK_WINDOW - 1).max(1);
    Some(format!("{from}:{exists}"))
}

/// An authenticated IMAP session with the inbox examined.
pub struct MailboxClient {
    session: ImapSession,
    config: MailboxConfig,
    timeouts: TimeoutConfig,
    exists: u32,
}

impl std::fmt::Debug for MailboxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxClient")
            .field("config", &self.config)
            .field("exists", &self.exists)
            .finish_non_exhaustive()
    }
}

impl MailboxClient {
    /// Connects with implicit TLS, logs in and opens the inbox read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, connection, login or `EXAMINE` fails.
    #[instrument(
        name = "mailbox::connect",
        skip_all,
        fields(imap_host = %config.host, username = %config.username)
    )]
    pub async fn connect(config: MailboxConfig) -> Result<Self> {
        let port = config.validate()?;
        let timeouts = TimeoutConfig::default();

        let tls_stream = connection::establish_tls_connection(
            &config.host,
            port,
            &config.trust(),
            timeouts.connect,
        )
        .await?;
        debug!("TLS connection established");

        let client = async_imap::Client::new(tls_stream);
        let mut session = tokio::time::timeout(
            timeouts.command,
            client.login(&config.username, &config.password),
        )
        .await
        .map_err(|_| Error::MailboxTimeout {
            operation: "login",
            timeout: timeouts.command,
        })?
        .map_err(|e| Error::ImapLogin {
            username: config.username.clone(),
            source: e.0,
        })?;
        debug!("Authenticated");

        // Read-only: polling never changes flags
        let mailbox = tokio::time::timeout(timeouts.command, session.examine(&config.inbox))
            .await
            .map_err(|_| Error::MailboxTimeout {
                operation: "examine",
                timeout: timeouts.command,
            })?
            .map_err(|source| Error::SelectMailbox {
                mailbox: config.inbox.clone(),
                source,
            })?;
        debug!(exists = mailbox.exists, "Examined mailbox");

        Ok(Self {
            session,
            exists: mailbox.exists,
            config,
            timeouts,
        })
    }

    /// UIDs of the newest messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImapFetch`] if the fetch fails.
    #[instrument(name = "mailbox::check", skip(self), fields(exists = self.exists))]
    pub async fn check(&mut self) -> Result<Vec<Version>> {
        let Some(range) = check_range(self.exists) else {
            return Ok(Vec::new());
        };
        let timeout = self.timeouts.command;

        let fetches = tokio::time::timeout(timeout, async {
            self.session
                .fetch(&range, "UID")
                .await?
                .try_collect::<Vec<_>>()
                .await
        })
        .await
        .map_err(|_| Error::MailboxTimeout {
            operation: "fetch",
            timeout,
        })?
        .map_err(|source| Error::ImapFetch {
            range: range.clone(),
            source,
        })?;

        let mut uids: Vec<u32> = fetches.iter().filter_map(|fetch| fetch.uid).collect();
        uids.sort_unstable();
        debug!(count = uids.len(), "Found versions");

        Ok(uids.into_iter().map(Version::new).collect())
    }

    /// Downloads and parses the message with the version's UID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidVersion`] for a non-numeric UID,
    /// [`Error::MessageNotFound`] if the server returns nothing, or a fetch
    /// or parse error.
    #[instrument(name = "mailbox::fetch", skip_all, fields(uid = %version.uid))]
    pub async fn fetch(&mut self, version: &Version) -> Result<FetchedMessage> {
        let uid = version.parse_uid()?;
        let range = uid.to_string();
        let timeout = self.timeouts.command;

        let fetches = tokio::time::timeout(timeout, async {
            self.session
                .uid_fetch(&range, "BODY.PEEK[]")
                .await?
                .try_collect::<Vec<_>>()
                .await
        })
        .await
        .map_err(|_| Error::MailboxTimeout {
            operation: "fetch",
            timeout,
        })?
        .map_err(|source| Error::ImapFetch {
            range: range.clone(),
            source,
        })?;

        let raw = fetches
            .iter()
            .find_map(|fetch| fetch.body())
            .ok_or(Error::MessageNotFound { uid })?;

        FetchedMessage::parse(uid, raw)
    }

    /// Logs out from the server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImapLogout`] if the command fails.
    #[instrument(name = "mailbox::logout", skip(self))]
    pub async fn logout(mut self) -> Result<()> {
        debug!("Logging out");
        self.session
            .logout()
            .await
            .map_err(|source| Error::ImapLogout { source })
    }
}

/// Runs the `check` step.
///
/// # Errors
///
/// Returns any connection or fetch error.
pub async fn check(config: MailboxConfig) -> Result<Vec<Version>> {
    let mut client = MailboxClient::connect(config).await?;
    let versions = client.check().await;
    if let Err(err) = client.logout().await {
        warn!(error = %err, "Logout failed");
    }
    versions
}

/// Runs the `in` step: fetches `version` and saves it under `destination`.
///
/// # Errors
///
/// Returns any connection, fetch, parse or write error.
pub async fn fetch_into(
    config: MailboxConfig,
    version: Version,
    destination: &Path,
) -> Result<FetchReport> {
    create_dir(destination)?;

    let mut client = MailboxClient::connect(config).await?;
    let fetched = client.fetch(&version).await;
    if let Err(err) = client.logout().await {
        warn!(error = %err, "Logout failed");
    }

    let message = fetched?;
    message.save(destination)?;
    Ok(FetchReport {
        metadata: message.metadata(),
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_check_range() {
        assert_eq!(check_range(0), None);
        assert_eq!(check_range(1).as_deref(), Some("1:1"));
        assert_eq!(check_range(3).as_deref(), Some("1:3"));
        assert_eq!(check_range(4).as_deref(), Some("1:4"));
        assert_eq!(check_range(10).as_deref(), Some("7:10"));
    }

    #[test]
    fn test_input_parsing() {
        let input: MailboxInput = serde_json::from_str(
            r#"{"source": {"imap": {"host": "imap.example.com", "port": 993,
                "username": "ci", "password": "pw"}}, "version": {"uid": "17"}}"#,
        )
        .unwrap();
        assert_eq!(input.source.imap.port, "993");
        assert_eq!(input.source.imap.inbox, "INBOX");
        assert_eq!(input.version, Some(Version::new(17)));
        assert!(!format!("{:?}", input.source.imap).contains("pw"));
    }

    #[test]
    fn test_invalid_version() {
        let version = Version {
            uid: "latest".into(),
        };
        assert!(matches!(version.parse_uid(), Err(Error::InvalidVersion { .. })));
    }

    #[test]
    fn test_parse_simple_message() {
        let raw = b"Message-ID: <abc@example.com>\r\nSubject: Deploy done\r\n\
                    Date: Tue, 1 Jul 2003 10:52:37 +0200\r\n\r\nAll green.";
        let message = FetchedMessage::parse(5, raw).unwrap();

        assert_eq!(message.uid, 5);
        assert_eq!(message.message_id, "<abc@example.com>");
        assert_eq!(message.subject, "Deploy done");
        assert_eq!(message.body, "All green.");
        assert_eq!(message.date_rfc850(), "Tuesday, 01-Jul-03 08:52:37 UTC");
        assert!(message.attachments.is_empty());
    }

    #[test]
    fn test_parse_composed_message_with_attachment() {
        let composed = MessageBuilder::new()
            .from("sender@example.com")
            .to(["a@example.com"])
            .subject("Report")
            .body("See attached")
            .attachment(Attachment::new("report.csv", b"a,b\n1,2\n".to_vec()))
            .build();

        let message = FetchedMessage::parse(9, &composed.to_bytes()).unwrap();
        assert_eq!(message.body.trim_end(), "See attached");
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].filename, "report.csv");
        assert_eq!(message.attachments[0].content, b"a,b\n1,2\n");

        let metadata = message.metadata();
        assert_eq!(metadata[0], MetadataItem::new("Subject", "Report"));
        assert_eq!(metadata[2], MetadataItem::new("Number of Attachments", "1"));
    }

    #[test]
    fn test_save_writes_files() {
        let dir = TempDir::new().unwrap();
        let message = FetchedMessage {
            uid: 1,
            message_id: "<id@example.com>".into(),
            subject: "Hello".into(),
            date: None,
            body: "World".into(),
            attachments: vec![
                Attachment::new("log.txt", b"ok".to_vec()),
                Attachment::new("../escape.txt", b"nope".to_vec()),
            ],
        };

        message.save(dir.path()).unwrap();

        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("version"), "<id@example.com>");
        assert_eq!(read("subject"), "Hello");
        assert_eq!(read("date"), "");
        assert_eq!(read("body"), "World");
        assert_eq!(read("attachments/log.txt"), "ok");
        assert_eq!(read("attachments/escape.txt"), "nope");
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_missing_host_rejected() {
        let config = MailboxConfig::default();
        assert!(matches!(config.validate(), Err(Error::MissingField { .. })));
    }
}
