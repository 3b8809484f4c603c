//! MIME message composition.
//!
//! [`MessageBuilder`] keeps headers and body parts as data and renders the
//! RFC 5322 payload only when asked, so the header block is always followed
//! by exactly one blank line.

use crate::config::ResolvedConfig;
use crate::error::{Error, Result};
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, instrument};

const BOUNDARY_LEN: usize = 32;
const BASE64_LINE: usize = 76;
/// Longest line allowed on the wire, excluding CRLF.
const MAX_LINE: usize = 998;

/// One `Name: value` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header name as written.
    pub name: String,
    /// Unencoded header value.
    pub value: String,
}

impl Header {
    /// Creates a header.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A file attached to the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Base name presented to the recipient.
    pub filename: String,
    /// Raw file content.
    pub content: Vec<u8>,
}

impl Attachment {
    /// Creates an attachment from memory.
    pub fn new(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }

    /// Reads an attachment from disk, naming it by the file's base name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadSource`] if the file cannot be read.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read(path).map_err(|source| Error::ReadSource {
            field: "attachments",
            path: path.to_path_buf(),
            source,
        })?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Ok(Self::new(filename, content))
    }
}

/// One rendered MIME part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    /// Part headers.
    pub headers: Vec<Header>,
    /// Transfer-encoded content with CRLF line endings.
    pub content: String,
}

/// The body of a composed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// A single text part; its headers are merged into the message header block.
    Single(BodyPart),
    /// A `multipart/mixed` body.
    Multipart {
        /// Boundary delimiter, without the leading dashes.
        boundary: String,
        /// Text part followed by one part per attachment.
        parts: Vec<BodyPart>,
    },
}

/// A message ready for the `DATA` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    headers: Vec<Header>,
    body: MessageBody,
}

impl ComposedMessage {
    /// Top-level headers in output order, excluding the MIME entity headers.
    #[must_use]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First header with `name`, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.is(name))
            .map(|header| header.value.as_str())
    }

    /// The body structure.
    #[must_use]
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// The multipart boundary, if the message has attachments.
    #[must_use]
    pub fn boundary(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Single(_) => None,
            MessageBody::Multipart { boundary, .. } => Some(boundary),
        }
    }

    /// Renders the header block, including the MIME entity headers.
    #[must_use]
    pub fn render_headers(&self) -> String {
        let mut out = String::new();
        for header in &self.headers {
            write_header(&mut out, &header.name, &header.value);
        }
        write_header(&mut out, "MIME-Version", "1.0");
        match &self.body {
            MessageBody::Single(part) => {
                for header in &part.headers {
                    write_header(&mut out, &header.name, &header.value);
                }
            }
            MessageBody::Multipart { boundary, .. } => {
                write_header(
                    &mut out,
                    "Content-Type",
                    &format!("multipart/mixed; boundary=\"{boundary}\""),
                );
            }
        }
        out
    }

    /// Renders the full payload with CRLF line endings.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.render_headers();
        out.push_str("\r\n");
        match &self.body {
            MessageBody::Single(part) => out.push_str(&part.content),
            MessageBody::Multipart { boundary, parts } => {
                for part in parts {
                    let _ = write!(out, "--{boundary}\r\n");
                    for header in &part.headers {
                        write_header(&mut out, &header.name, &header.value);
                    }
                    out.push_str("\r\n");
                    out.push_str(&part.content);
                    out.push_str("\r\n");
                }
                let _ = write!(out, "--{boundary}--\r\n");
            }
        }
        out.into_bytes()
    }
}

/// Builder for [`ComposedMessage`].
///
/// `Content-Type` and `MIME-Version` supplied through [`header`](Self::header)
/// are never copied into the output; a `Content-Type` naming `text/html`
/// switches the text part to HTML.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct MessageBuilder {
    from: String,
    to: Vec<String>,
    cc: Vec<String>,
    subject: String,
    headers: Vec<Header>,
    body: String,
    attachments: Vec<Attachment>,
    html: bool,
}

impl MessageBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `From` header.
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    /// Appends `To` addresses.
    pub fn to<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.to.extend(addresses.into_iter().map(Into::into));
        self
    }

    /// Appends `Cc` addresses.
    pub fn cc<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cc.extend(addresses.into_iter().map(Into::into));
        self
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Adds one user header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let header = Header::new(name, value);
        if header.is("Content-Type") {
            if header.value.to_ascii_lowercase().contains("text/html") {
                self.html = true;
            }
            return self;
        }
        if header.is("MIME-Version") {
            return self;
        }
        self.headers.push(header);
        self
    }

    /// Adds every header in a `Name: value` block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedHeader`] for a line without `": "`.
    pub fn headers_text(self, text: &str) -> Result<Self> {
        Ok(parse_header_block(text)?
            .into_iter()
            .fold(self, |builder, header| builder.header(header.name, header.value)))
    }

    /// Sets the body text.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Appends an attachment.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Assembles the message.
    #[must_use]
    pub fn build(self) -> ComposedMessage {
        let mut headers = Vec::with_capacity(self.headers.len() + 4);
        if !self.to.is_empty() {
            headers.push(Header::new("To", self.to.join(", ")));
        }
        headers.push(Header::new("From", self.from));
        if !self.cc.is_empty() {
            headers.push(Header::new("Cc", self.cc.join(", ")));
        }
        headers.extend(self.headers);
        headers.push(Header::new("Subject", self.subject));

        let text = text_part(&self.body, self.html);
        let body = if self.attachments.is_empty() {
            MessageBody::Single(text)
        } else {
            let mut parts = Vec::with_capacity(self.attachments.len() + 1);
            parts.push(text);
            parts.extend(self.attachments.iter().map(attachment_part));
            MessageBody::Multipart {
                boundary: unique_boundary(&parts),
                parts,
            }
        };

        ComposedMessage { headers, body }
    }
}

/// Builds the message described by a resolved configuration.
///
/// Attachment files are read here, before any connection is opened.
///
/// # Errors
///
/// Returns [`Error::MalformedHeader`] for bad header text and
/// [`Error::ReadSource`] for unreadable attachments.
#[instrument(
    name = "message::compose",
    skip_all,
    fields(attachments = config.content.attachments.len())
)]
pub fn compose(config: &ResolvedConfig) -> Result<ComposedMessage> {
    let mut builder = MessageBuilder::new()
        .from(config.envelope.from.as_str())
        .to(config.envelope.to.iter().map(String::as_str))
        .cc(config.envelope.cc.iter().map(String::as_str))
        .subject(config.content.subject.as_str())
        .headers_text(&config.content.headers)?
        .body(config.content.body.as_str());

    for path in &config.content.attachments {
        builder = builder.attachment(Attachment::from_path(path)?);
    }

    let message = builder.build();
    debug!(
        multipart = message.boundary().is_some(),
        headers = message.headers().len(),
        "Message composed"
    );
    Ok(message)
}

/// Parses a `Name: value` header block.
///
/// Blank lines are dropped and lines starting with whitespace continue the
/// previous header.
///
/// # Errors
///
/// Returns [`Error::MalformedHeader`] for any other line without `": "`.
pub fn parse_header_block(text: &str) -> Result<Vec<Header>> {
    let mut headers: Vec<Header> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with([' ', '\t']) {
            if let Some(last) = headers.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
                continue;
            }
        }
        let (name, value) = line.split_once(": ").ok_or_else(|| Error::MalformedHeader {
            line: line.to_string(),
        })?;
        headers.push(Header::new(name.trim(), value.trim()));
    }
    Ok(headers)
}

fn text_part(body: &str, html: bool) -> BodyPart {
    let subtype = if html { "html" } else { "plain" };
    let normalized = normalize_newlines(body);
    let (encoding, content) = if !body.is_ascii() {
        ("base64", wrap_base64(body.as_bytes()))
    } else if normalized.split("\r\n").any(|line| line.len() > MAX_LINE) {
        ("quoted-printable", quoted_printable::encode_to_str(normalized.as_bytes()))
    } else {
        ("7bit", normalized)
    };
    BodyPart {
        headers: vec![
            Header::new("Content-Type", format!("text/{subtype}; charset=UTF-8")),
            Header::new("Content-Transfer-Encoding", encoding),
        ],
        content,
    }
}

fn attachment_part(attachment: &Attachment) -> BodyPart {
    let filename = attachment.filename.replace(['"', '\\'], "_");
    BodyPart {
        headers: vec![
            Header::new(
                "Content-Type",
                format!("application/octet-stream; name=\"{filename}\""),
            ),
            Header::new(
                "Content-Disposition",
                format!("attachment; filename=\"{filename}\""),
            ),
            Header::new("Content-Transfer-Encoding", "base64"),
        ],
        content: wrap_base64(&attachment.content),
    }
}

/// Picks a random boundary that occurs in none of the parts.
fn unique_boundary(parts: &[BodyPart]) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(BOUNDARY_LEN)
            .map(char::from)
            .collect();
        if !parts.iter().any(|part| part.content.contains(&candidate)) {
            return candidate;
        }
    }
}

fn write_header(out: &mut String, name: &str, value: &str) {
    let value = single_line(value);
    let encoded = if is_address_header(name) {
        encode_address_list(&value)
    } else {
        encode_header_value(&value)
    };
    let _ = write!(out, "{name}: {encoded}\r\n");
}

fn is_address_header(name: &str) -> bool {
    ["From", "To", "Cc", "Reply-To", "Sender"]
        .iter()
        .any(|candidate| name.eq_ignore_ascii_case(candidate))
}

/// Encodes only the display names of a mailbox list; addresses stay as written.
fn encode_address_list(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }
    split_mailboxes(value)
        .into_iter()
        .map(|mailbox| {
            let mailbox = mailbox.trim();
            match mailbox.rfind('<') {
                Some(start) if mailbox.ends_with('>') => {
                    let phrase = mailbox[..start].trim().trim_matches('"');
                    let addr = &mailbox[start..];
                    if phrase.is_empty() {
                        addr.to_string()
                    } else {
                        format!("{} {addr}", encode_header_value(phrase))
                    }
                }
                _ => mailbox.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Splits on commas outside double quotes.
fn split_mailboxes(value: &str) -> Vec<&str> {
    let mut mailboxes = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (index, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                mailboxes.push(&value[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    mailboxes.push(&value[start..]);
    mailboxes
}

/// Collapses embedded line breaks so a value stays on one header line.
fn single_line(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// RFC 2047 encoded word for non-ASCII values.
fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!(
            "=?UTF-8?B?{}?=",
            base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
        )
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

fn wrap_base64(data: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    encoded
        .as_bytes()
        .chunks(BASE64_LINE)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("\r\n")
}
