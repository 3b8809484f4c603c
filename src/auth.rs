//! SMTP authentication mechanisms.

use crate::error::{Error, Result, Step};
use crate::session::{SessionState, SmtpSession};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use std::sync::LazyLock;
use tracing::{debug, instrument, warn};

static USERNAME_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)user").expect("valid regex"));
static PASSWORD_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)pass").expect("valid regex"));

/// User name and password for SMTP authentication.
///
/// The password is stored as a [`SecretString`] and never printed.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Returns the user name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

/// How the session authenticates.
#[derive(Debug, Clone)]
pub enum AuthMechanism {
    /// No authentication, even if the server offers it.
    Anonymous,
    /// SASL `PLAIN` in a single exchange.
    Plain(Credentials),
    /// The `LOGIN` username/password prompt exchange.
    Login(Credentials),
}

impl AuthMechanism {
    /// Mechanism name as used on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            AuthMechanism::Anonymous => "none",
            AuthMechanism::Plain(_) => "PLAIN",
            AuthMechanism::Login(_) => "LOGIN",
        }
    }

    /// Runs the mechanism on a greeted session.
    ///
    /// Authentication is only attempted when the server advertises `AUTH`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthRejected`] when the server refuses the exchange
    /// and [`Error::AuthPrompt`] for an unexpected `LOGIN` challenge.
    #[instrument(name = "auth::authenticate", skip_all, fields(mechanism = self.name()))]
    pub(crate) async fn authenticate(&self, session: &mut SmtpSession) -> Result<()> {
        let credentials = match self {
            AuthMechanism::Anonymous => {
                debug!("Anonymous mode, skipping authentication");
                session.set_state(SessionState::Anonymous);
                return Ok(());
            }
            AuthMechanism::Plain(credentials) | AuthMechanism::Login(credentials) => credentials,
        };

        if !session.capabilities().supports_auth() {
            warn!(
                username = %credentials.username,
                "Server does not advertise AUTH, continuing unauthenticated"
            );
            session.set_state(SessionState::Anonymous);
            return Ok(());
        }

        match self {
            AuthMechanism::Plain(_) => plain(session, credentials).await?,
            AuthMechanism::Login(_) => login(session, credentials).await?,
            AuthMechanism::Anonymous => {}
        }

        debug!(username = %credentials.username, "Authenticated");
        session.set_state(SessionState::Authenticated);
        Ok(())
    }
}

async fn plain(session: &mut SmtpSession, credentials: &Credentials) -> Result<()> {
    let token = STANDARD.encode(format!(
        "\0{}\0{}",
        credentials.username,
        credentials.password()
    ));
    let mut reply = session
        .command_masked(Step::Authenticate, &format!("AUTH PLAIN {token}"), "AUTH PLAIN ****")
        .await?;

    // Some servers ignore the initial response and ask for it again
    if reply.code == 334 {
        reply = session
            .command_masked(Step::Authenticate, &token, "****")
            .await?;
    }

    accepted("PLAIN", reply.code, reply.message())
}

async fn login(session: &mut SmtpSession, credentials: &Credentials) -> Result<()> {
    let mut reply = session.command(Step::Authenticate, "AUTH LOGIN").await?;

    // Username first, password second; anything else is refused
    let steps: [(&Regex, &str); 2] = [
        (&*USERNAME_PROMPT, credentials.username.as_str()),
        (&*PASSWORD_PROMPT, credentials.password()),
    ];
    for (expected, answer) in steps {
        if reply.code != 334 {
            return accepted("LOGIN", reply.code, reply.message());
        }

        let prompt = decode_challenge(&reply.message());
        if !expected.is_match(&prompt) {
            return Err(Error::AuthPrompt { prompt });
        }
        debug!(prompt = %prompt, "Answering LOGIN challenge");

        reply = session
            .command_masked(Step::Authenticate, &STANDARD.encode(answer), "****")
            .await?;
    }

    if reply.code == 334 {
        return Err(Error::AuthPrompt {
            prompt: decode_challenge(&reply.message()),
        });
    }
    accepted("LOGIN", reply.code, reply.message())
}

fn accepted(mechanism: &'static str, code: u16, message: String) -> Result<()> {
    if code == 235 {
        Ok(())
    } else {
        Err(Error::AuthRejected {
            mechanism,
            code,
            message,
        })
    }
}

/// Decodes a base64 challenge, keeping the raw text if it is not base64.
fn decode_challenge(challenge: &str) -> String {
    STANDARD
        .decode(challenge.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| challenge.to_string())
}
