//! SMTP session negotiation and command exchange.
//!
//! [`SmtpSession::negotiate`] dials the server, greets it, upgrades to TLS
//! when `STARTTLS` is advertised and authenticates. The delivery driver then
//! uses the transaction commands and finally [`SmtpSession::quit`]. Dropping
//! a session closes the connection, so every early return releases it.

use crate::config::{SmtpSettings, TimeoutConfig, TrustMode, DEFAULT_ORIGIN};
use crate::connection::{self, BoxedStream};
use crate::error::{Error, Result, Step};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, trace, warn};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, banner not yet accepted.
    Connected,
    /// `EHLO`/`HELO` accepted.
    Greeted,
    /// Channel upgraded with `STARTTLS`.
    Secured,
    /// Credentials accepted.
    Authenticated,
    /// Authentication skipped.
    Anonymous,
    /// `MAIL FROM` accepted.
    TransactionOpen,
    /// `QUIT` sent or connection abandoned.
    Closed,
}

/// One SMTP reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit reply code.
    pub code: u16,
    /// Text of every line, without code and separator.
    pub lines: Vec<String>,
}

impl Reply {
    /// 2xx.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx.
    #[must_use]
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Reply text joined into one line.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }
}

/// Extensions advertised in the `EHLO` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `STARTTLS` offered.
    pub starttls: bool,
    /// `AUTH` mechanisms, upper-cased.
    pub auth: Vec<String>,
    /// Declared maximum message size.
    pub size: Option<u64>,
    /// `8BITMIME` offered.
    pub eight_bit_mime: bool,
}

impl Capabilities {
    /// Parses the extension lines of an `EHLO` reply. The first line is
    /// the server's greeting and is skipped.
    #[must_use]
    pub fn parse(reply: &Reply) -> Self {
        let mut capabilities = Self::default();
        for line in reply.lines.iter().skip(1) {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };
            match keyword.to_ascii_uppercase().as_str() {
                "STARTTLS" => capabilities.starttls = true,
                "AUTH" => capabilities
                    .auth
                    .extend(words.map(str::to_ascii_uppercase)),
                "SIZE" => capabilities.size = words.next().and_then(|s| s.parse().ok()),
                "8BITMIME" => capabilities.eight_bit_mime = true,
                _ => {}
            }
        }
        capabilities
    }

    /// Whether the server offers `AUTH` at all.
    #[must_use]
    pub fn supports_auth(&self) -> bool {
        !self.auth.is_empty()
    }
}

/// A live SMTP conversation.
pub struct SmtpSession {
    stream: BufReader<BoxedStream>,
    host: String,
    origin: String,
    state: SessionState,
    capabilities: Capabilities,
    timeouts: TimeoutConfig,
}

impl std::fmt::Debug for SmtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSession")
            .field("host", &self.host)
            .field("origin", &self.origin)
            .field("state", &self.state)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl SmtpSession {
    /// Wraps an open transport.
    pub(crate) fn new(
        stream: BoxedStream,
        host: impl Into<String>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            stream: BufReader::new(stream),
            host: host.into(),
            origin: DEFAULT_ORIGIN.to_string(),
            state: SessionState::Connected,
            capabilities: Capabilities::default(),
            timeouts,
        }
    }

    /// Dials, greets, secures and authenticates according to `settings`.
    ///
    /// # Errors
    ///
    /// Returns the first failing step; the connection is closed on return.
    #[instrument(
        name = "session::negotiate",
        skip_all,
        fields(smtp_host = %settings.host, port = settings.port)
    )]
    pub async fn negotiate(settings: &SmtpSettings) -> Result<Self> {
        let tcp = connection::dial(&settings.host, settings.port, settings.timeouts.connect).await?;
        let mut session = Self::new(Box::new(tcp), &settings.host, settings.timeouts.clone());

        session.read_greeting().await?;
        session
            .greet(&settings.origin, settings.greeting_fallback)
            .await?;

        if session.capabilities.starttls {
            session = session.starttls(&settings.trust).await?;
        } else {
            debug!("Server does not advertise STARTTLS, continuing in plaintext");
        }

        settings.auth.authenticate(&mut session).await?;
        Ok(session)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Extensions from the most recent `EHLO`.
    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        debug!(from = ?self.state, to = ?state, "Session state change");
        self.state = state;
    }

    /// Reads the `220` banner.
    pub(crate) async fn read_greeting(&mut self) -> Result<()> {
        let reply = self.read_reply(Step::Greeting).await?;
        expect(Step::Greeting, reply, |code| code == 220).map(|_| ())
    }

    /// Sends `EHLO` (falling back to `HELO`) as `origin`. With `fallback`
    /// set, a refused name is retried once as `localhost`.
    pub(crate) async fn greet(&mut self, origin: &str, fallback: bool) -> Result<()> {
        match self.hello(origin).await {
            Err(Error::UnexpectedReply { code, message, .. })
                if fallback && origin != DEFAULT_ORIGIN =>
            {
                warn!(
                    origin,
                    code,
                    message = %message,
                    "Greeting refused, retrying as localhost"
                );
                self.hello(DEFAULT_ORIGIN).await
            }
            Err(err @ Error::UnexpectedReply { .. }) => {
                warn!(origin, "Greeting refused, try setting host_origin");
                Err(err)
            }
            other => other,
        }
    }

    async fn hello(&mut self, origin: &str) -> Result<()> {
        let reply = self.command(Step::Greeting, &format!("EHLO {origin}")).await?;
        if reply.is_positive() {
            self.capabilities = Capabilities::parse(&reply);
            debug!(capabilities = ?self.capabilities, "EHLO accepted");
        } else {
            debug!(code = reply.code, "EHLO refused, trying HELO");
            let reply = self.command(Step::Greeting, &format!("HELO {origin}")).await?;
            expect(Step::Greeting, reply, |code| code == 250)?;
            self.capabilities = Capabilities::default();
        }
        self.origin = origin.to_string();
        self.set_state(SessionState::Greeted);
        Ok(())
    }

    /// Upgrades the channel and repeats `EHLO`.
    #[instrument(name = "session::starttls", skip_all, fields(smtp_host = %self.host))]
    pub(crate) async fn starttls(mut self, trust: &TrustMode) -> Result<Self> {
        let reply = self.command(Step::StartTls, "STARTTLS").await?;
        expect(Step::StartTls, reply, |code| code == 220)?;

        let Self {
            stream,
            host,
            origin,
            timeouts,
            ..
        } = self;
        let tls =
            connection::upgrade_tls(stream.into_inner(), &host, trust, timeouts.command).await?;
        debug!("TLS established");

        let mut session = Self::new(Box::new(tls), host, timeouts);

        // Capabilities may differ once the channel is encrypted
        session.hello(&origin).await?;
        session.set_state(SessionState::Secured);
        Ok(session)
    }

    /// `MAIL FROM:<sender>`.
    pub async fn mail_from(&mut self, sender: &str) -> Result<()> {
        let reply = self.command(Step::MailFrom, &format!("MAIL FROM:<{sender}>")).await?;
        expect(Step::MailFrom, reply, |code| code == 250)?;
        self.set_state(SessionState::TransactionOpen);
        Ok(())
    }

    /// `RCPT TO:<recipient>`.
    ///
    /// # Errors
    ///
    /// A refusal is returned as [`Error::RecipientRejected`] so the caller
    /// can decide whether it is soft.
    pub async fn rcpt_to(&mut self, recipient: &str) -> Result<()> {
        let reply = self.command(Step::RcptTo, &format!("RCPT TO:<{recipient}>")).await?;
        if reply.code == 250 || reply.code == 251 {
            Ok(())
        } else {
            Err(Error::RecipientRejected {
                recipient: recipient.to_string(),
                code: reply.code,
                message: reply.message(),
            })
        }
    }

    /// `DATA`, then the dot-stuffed payload and the terminating `.`.
    pub async fn data(&mut self, payload: &[u8]) -> Result<()> {
        let reply = self.command(Step::Data, "DATA").await?;
        expect(Step::Data, reply, |code| code == 354)?;

        let stuffed = dot_stuff(payload);
        trace!(bytes = stuffed.len(), "C: <message data>");
        let timeout = self.timeouts.data;
        let write = async {
            let stream = self.stream.get_mut();
            stream.write_all(&stuffed).await?;
            stream.write_all(b".\r\n").await?;
            stream.flush().await
        };
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| Error::StepTimeout {
                step: Step::Data,
                timeout,
            })?
            .map_err(|source| Error::Io {
                step: Step::Data,
                source,
            })?;

        let reply = self.read_reply_within(Step::Data, timeout).await?;
        expect(Step::Data, reply, |code| code == 250)?;
        self.set_state(SessionState::Greeted);
        Ok(())
    }

    /// `QUIT`, consuming the session.
    pub async fn quit(mut self) -> Result<()> {
        let timeout = self.timeouts.quit;
        self.send_line(Step::Quit, "QUIT", timeout).await?;
        let reply = self.read_reply_within(Step::Quit, timeout).await?;
        self.set_state(SessionState::Closed);
        expect(Step::Quit, reply, |code| code == 221).map(|_| ())
    }

    /// Sends one command line and reads the reply.
    pub(crate) async fn command(&mut self, step: Step, line: &str) -> Result<Reply> {
        let timeout = self.timeouts.command;
        self.send_line(step, line, timeout).await?;
        self.read_reply_within(step, timeout).await
    }

    /// Like [`command`](Self::command), but the line never reaches the log.
    pub(crate) async fn command_masked(
        &mut self,
        step: Step,
        line: &str,
        shown: &str,
    ) -> Result<Reply> {
        let timeout = self.timeouts.command;
        trace!("C: {shown}");
        self.write_line(step, line, timeout).await?;
        self.read_reply_within(step, timeout).await
    }

    async fn send_line(&mut self, step: Step, line: &str, timeout: Duration) -> Result<()> {
        trace!("C: {line}");
        self.write_line(step, line, timeout).await
    }

    async fn write_line(&mut self, step: Step, line: &str, timeout: Duration) -> Result<()> {
        let write = async {
            let stream = self.stream.get_mut();
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await
        };
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| Error::StepTimeout { step, timeout })?
            .map_err(|source| Error::Io { step, source })
    }

    pub(crate) async fn read_reply(&mut self, step: Step) -> Result<Reply> {
        let timeout = self.timeouts.command;
        self.read_reply_within(step, timeout).await
    }

    /// Reads lines until one has a space after the code.
    async fn read_reply_within(&mut self, step: Step, timeout: Duration) -> Result<Reply> {
        let mut code = None;
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(timeout, self.stream.read_line(&mut line))
                .await
                .map_err(|_| Error::StepTimeout { step, timeout })?
                .map_err(|source| Error::Io { step, source })?;
            if n == 0 {
                self.state = SessionState::Closed;
                return Err(Error::ConnectionClosed { step });
            }

            let line = line.trim_end_matches(['\r', '\n']);
            trace!("S: {line}");

            let (line_code, last, text) = parse_reply_line(line).ok_or_else(|| Error::InvalidReply {
                step,
                line: line.to_string(),
            })?;
            if *code.get_or_insert(line_code) != line_code {
                return Err(Error::InvalidReply {
                    step,
                    line: line.to_string(),
                });
            }
            lines.push(text.to_string());

            if last {
                return Ok(Reply {
                    code: line_code,
                    lines,
                });
            }
        }
    }
}

/// Splits `250-text` / `250 text` / `250` into (code, is-last, text).
fn parse_reply_line(line: &str) -> Option<(u16, bool, &str)> {
    let code = line.get(..3)?;
    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code = code.parse().ok()?;
    match line.as_bytes().get(3) {
        None => Some((code, true, "")),
        Some(b' ') => Some((code, true, &line[4..])),
        Some(b'-') => Some((code, false, &line[4..])),
        Some(_) => None,
    }
}

/// Accepts the reply if `accepted(code)`, otherwise reports it against `step`.
pub(crate) fn expect(step: Step, reply: Reply, accepted: impl Fn(u16) -> bool) -> Result<Reply> {
    if accepted(reply.code) {
        Ok(reply)
    } else {
        Err(Error::UnexpectedReply {
            step,
            code: reply.code,
            message: reply.message(),
        })
    }
}

/// Normalizes line endings to CRLF, doubles leading dots and ensures the
/// payload ends with CRLF.
pub(crate) fn dot_stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 64);
    let mut at_line_start = true;
    let mut prev = 0u8;

    for &byte in payload {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        if byte == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
        prev = byte;
    }

    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn session_over(stream: DuplexStream) -> SmtpSession {
        SmtpSession::new(Box::new(stream), "smtp.example.com", TimeoutConfig::default())
    }

    /// Writes `script` to the client and returns everything the client sent.
    async fn serve(mut server: DuplexStream, script: &'static str) -> String {
        server.write_all(script.as_bytes()).await.unwrap();
        let mut received = Vec::new();
        let _ = server.read_to_end(&mut received).await;
        String::from_utf8(received).unwrap()
    }

    #[test]
    fn test_parse_reply_line() {
        assert_eq!(parse_reply_line("250-SIZE 100"), Some((250, false, "SIZE 100")));
        assert_eq!(parse_reply_line("250 OK"), Some((250, true, "OK")));
        assert_eq!(parse_reply_line("221"), Some((221, true, "")));
        assert_eq!(parse_reply_line("25"), None);
        assert_eq!(parse_reply_line("abc OK"), None);
        assert_eq!(parse_reply_line("250_OK"), None);
    }

    #[test]
    fn test_capabilities_parse() {
        let reply = Reply {
            code: 250,
            lines: vec![
                "mx.example.com greets you".into(),
                "PIPELINING".into(),
                "SIZE 35882577".into(),
                "8BITMIME".into(),
                "STARTTLS".into(),
                "AUTH PLAIN login".into(),
            ],
        };
        let caps = Capabilities::parse(&reply);
        assert!(caps.starttls);
        assert!(caps.eight_bit_mime);
        assert_eq!(caps.size, Some(35_882_577));
        assert_eq!(caps.auth, vec!["PLAIN", "LOGIN"]);
        assert!(caps.supports_auth());
    }

    #[test]
    fn test_dot_stuff() {
        assert_eq!(dot_stuff(b".hidden\r\nok\n..two"), b"..hidden\r\nok\r\n...two\r\n");
        assert_eq!(dot_stuff(b"a.b\r\n.\r\n"), b"a.b\r\n..\r\n");
        assert_eq!(dot_stuff(b""), b"");
    }

    #[test]
    fn test_reply_classes() {
        let reply = Reply {
            code: 354,
            lines: vec!["go ahead".into()],
        };
        assert!(reply.is_intermediate());
        assert!(!reply.is_positive());
        assert!(expect(Step::Data, reply, |c| c == 250).is_err());
    }

    #[tokio::test]
    async fn test_multiline_reply() {
        let (client, server) = duplex(4096);
        let mut session = session_over(client);
        let server = tokio::spawn(serve(server, "250-first\r\n250-second\r\n250 last\r\n"));

        let reply = session.read_reply(Step::Greeting).await.unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines, vec!["first", "second", "last"]);

        drop(session);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_codes_are_invalid() {
        let (client, server) = duplex(4096);
        let mut session = session_over(client);
        let server = tokio::spawn(serve(server, "250-first\r\n251 second\r\n"));

        let err = session.read_reply(Step::Greeting).await.unwrap_err();
        assert!(matches!(err, Error::InvalidReply { step: Step::Greeting, .. }));

        drop(session);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (client, server) = duplex(4096);
        let mut session = session_over(client);
        drop(server);

        let err = session.read_reply(Step::MailFrom).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { step: Step::MailFrom }));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_ehlo_falls_back_to_helo() {
        let (client, server) = duplex(4096);
        let mut session = session_over(client);
        let server = tokio::spawn(serve(
            server,
            "220 ready\r\n502 unrecognized\r\n250 hello\r\n",
        ));

        session.read_greeting().await.unwrap();
        session.greet("ci.example.com", false).await.unwrap();
        assert_eq!(session.state(), SessionState::Greeted);
        assert!(!session.capabilities().starttls);

        drop(session);
        let sent = server.await.unwrap();
        assert_eq!(sent, "EHLO ci.example.com\r\nHELO ci.example.com\r\n");
    }

    #[tokio::test]
    async fn test_refused_greeting_without_fallback() {
        let (client, server) = duplex(4096);
        let mut session = session_over(client);
        let server = tokio::spawn(serve(server, "550 go away\r\n550 still no\r\n"));

        let err = session.greet("ci.example.com", false).await.unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedReply { step: Step::Greeting, code: 550, .. }
        ));

        drop(session);
        let sent = server.await.unwrap();
        assert!(!sent.contains("localhost"));
    }

    #[tokio::test]
    async fn test_refused_greeting_with_fallback() {
        let (client, server) = duplex(4096);
        let mut session = session_over(client);
        let server = tokio::spawn(serve(
            server,
            "550 go away\r\n550 still no\r\n250-hi\r\n250 AUTH PLAIN\r\n",
        ));

        session.greet("ci.example.com", true).await.unwrap();
        assert_eq!(session.capabilities().auth, vec!["PLAIN"]);

        drop(session);
        let sent = server.await.unwrap();
        assert!(sent.ends_with("EHLO localhost\r\n"));
    }

    #[tokio::test]
    async fn test_rcpt_rejection_carries_code() {
        let (client, server) = duplex(4096);
        let mut session = session_over(client);
        let server = tokio::spawn(serve(server, "550 5.1.1 no such user\r\n"));

        let err = session.rcpt_to("bad@example.com").await.unwrap_err();
        assert!(err.is_soft_rejection());
        match err {
            Error::RecipientRejected { recipient, code, message } => {
                assert_eq!(recipient, "bad@example.com");
                assert_eq!(code, 550);
                assert_eq!(message, "5.1.1 no such user");
            }
            other => panic!("expected RecipientRejected, got {other:?}"),
        }

        drop(session);
        assert_eq!(server.await.unwrap(), "RCPT TO:<bad@example.com>\r\n");
    }

    #[tokio::test]
    async fn test_data_transfer() {
        let (client, server) = duplex(4096);
        let mut session = session_over(client);
        let server = tokio::spawn(serve(server, "354 go\r\n250 queued\r\n221 bye\r\n"));

        session.data(b"Subject: x\r\n\r\n.line").await.unwrap();
        session.quit().await.unwrap();

        let sent = server.await.unwrap();
        assert_eq!(sent, "DATA\r\nSubject: x\r\n\r\n..line\r\n.\r\nQUIT\r\n");
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let (client, _server) = duplex(4096);
        let timeouts = TimeoutConfig {
            command: Duration::from_millis(50),
            ..TimeoutConfig::default()
        };
        let mut session = SmtpSession::new(Box::new(client), "smtp.example.com", timeouts);

        let err = session.command(Step::MailFrom, "NOOP").await.unwrap_err();
        assert!(matches!(err, Error::StepTimeout { step: Step::MailFrom, .. }));
    }
}
