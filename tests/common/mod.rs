//! Scripted servers for the end-to-end tests.
//!
//! [`FakeSmtp`] listens on `127.0.0.1:0`, answers the subset of SMTP the
//! client speaks and records everything it sees. [`imap::FakeImap`] does
//! the same for the mailbox side.

#![allow(dead_code)]

pub mod imap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Plaintext or TLS, behind one type.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// A self-signed certificate for `localhost` and an acceptor serving it.
pub struct TestCert {
    /// The certificate in PEM, usable as a `ca_cert` bundle.
    pub pem: String,
    pub acceptor: TlsAcceptor,
}

impl TestCert {
    pub fn localhost() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let pem = cert.serialize_pem().unwrap();
        let der = cert.serialize_der().unwrap();
        let key = cert.serialize_private_key_der();

        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![rustls::Certificate(der)], rustls::PrivateKey(key))
            .unwrap();

        Self {
            pem,
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }
}

/// How the server answers.
#[derive(Clone)]
pub struct Behavior {
    /// Recipients refused at `RCPT TO`, with the reply code.
    pub reject: Vec<(String, u16)>,
    /// Advertise `AUTH PLAIN LOGIN`.
    pub advertise_auth: bool,
    /// Accepted user name and password.
    pub credentials: (String, String),
    /// Greeting names refused with 501.
    pub refuse_names: Vec<String>,
    /// Offer `STARTTLS` with this acceptor. `AUTH` is then only
    /// advertised once the channel is secured.
    pub tls: Option<TlsAcceptor>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            reject: Vec::new(),
            advertise_auth: false,
            credentials: ("ci".to_string(), "hunter2".to_string()),
            refuse_names: Vec::new(),
            tls: None,
        }
    }
}

/// One accepted message.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    /// Reverse path from `MAIL FROM`.
    pub from: String,
    /// Accepted forward paths, in order.
    pub recipients: Vec<String>,
    /// Payload with dot-stuffing removed, CRLF line endings.
    pub data: String,
}

/// Everything the server observed.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    /// Accepted TCP connections.
    pub connections: usize,
    /// Names sent with `EHLO` or `HELO`, in order.
    pub greeting_names: Vec<String>,
    /// Every `AUTH` related line, decoded where base64.
    pub auth: Vec<String>,
    /// Whether the last authentication succeeded.
    pub authenticated: bool,
    /// Completed TLS handshakes after `STARTTLS`.
    pub tls_upgrades: usize,
    /// Completed transactions.
    pub deliveries: Vec<Delivery>,
}

/// A running fake server.
pub struct FakeSmtp {
    /// Listening port.
    pub port: u16,
    recorded: Arc<Mutex<Recorded>>,
}

impl FakeSmtp {
    /// Starts a server with the given behavior.
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let recorded = Arc::new(Mutex::new(Recorded::default()));

        let shared = Arc::clone(&recorded);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.lock().unwrap().connections += 1;
                let behavior = behavior.clone();
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = serve(Box::new(stream), &behavior, &shared).await;
                });
            }
        });

        Self { port, recorded }
    }

    /// Snapshot of what has been recorded so far.
    pub fn recorded(&self) -> Recorded {
        self.recorded.lock().unwrap().clone()
    }
}

fn angle_address(line: &str) -> String {
    let start = line.find('<').map_or(0, |i| i + 1);
    let end = line.rfind('>').unwrap_or(line.len());
    line[start..end].to_string()
}

fn decode(text: &str) -> String {
    STANDARD
        .decode(text.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| text.to_string())
}

async fn serve(
    stream: BoxedStream,
    behavior: &Behavior,
    recorded: &Mutex<Recorded>,
) -> std::io::Result<()> {
    let mut stream = BufReader::new(stream);
    stream.get_mut().write_all(b"220 fake.test ESMTP ready\r\n").await?;

    let mut secured = false;
    let mut current = Delivery::default();
    loop {
        let Some(line) = read_line(&mut stream).await? else {
            return Ok(());
        };
        let upper = line.to_ascii_uppercase();

        let reply: String = if upper.starts_with("EHLO ") || upper.starts_with("HELO ") {
            let name = line[5..].trim().to_string();
            let refused = behavior.refuse_names.contains(&name);
            recorded.lock().unwrap().greeting_names.push(name);
            if refused {
                "501 5.5.4 invalid domain name\r\n".into()
            } else if upper.starts_with("EHLO") {
                let mut reply = String::from("250-fake.test\r\n");
                if behavior.tls.is_some() && !secured {
                    reply.push_str("250-STARTTLS\r\n");
                }
                if behavior.advertise_auth && (secured || behavior.tls.is_none()) {
                    reply.push_str("250-AUTH PLAIN LOGIN\r\n");
                }
                reply.push_str("250 8BITMIME\r\n");
                reply
            } else {
                "250 fake.test\r\n".into()
            }
        } else if upper == "STARTTLS" && !secured {
            match &behavior.tls {
                None => "502 5.5.1 STARTTLS not offered\r\n".into(),
                Some(acceptor) => {
                    stream.get_mut().write_all(b"220 2.0.0 ready to start TLS\r\n").await?;
                    let tls: BoxedStream = Box::new(acceptor.accept(stream.into_inner()).await?);
                    recorded.lock().unwrap().tls_upgrades += 1;
                    stream = BufReader::new(tls);
                    secured = true;
                    continue;
                }
            }
        } else if upper.starts_with("AUTH PLAIN") {
            let token = line["AUTH PLAIN".len()..].trim();
            let decoded = decode(token);
            let mut fields = decoded.split('\0').skip(1);
            let user = fields.next().unwrap_or_default().to_string();
            let pass = fields.next().unwrap_or_default().to_string();
            auth_result(behavior, recorded, format!("PLAIN {user} {pass}"), &user, &pass)
        } else if upper == "AUTH LOGIN" {
            stream.get_mut().write_all(b"334 VXNlcm5hbWU6\r\n").await?;
            let user = decode(&read_line(&mut stream).await?.unwrap_or_default());
            stream.get_mut().write_all(b"334 UGFzc3dvcmQ6\r\n").await?;
            let pass = decode(&read_line(&mut stream).await?.unwrap_or_default());
            auth_result(behavior, recorded, format!("LOGIN {user} {pass}"), &user, &pass)
        } else if upper.starts_with("MAIL FROM:") {
            current = Delivery {
                from: angle_address(&line),
                ..Delivery::default()
            };
            "250 2.1.0 ok\r\n".into()
        } else if upper.starts_with("RCPT TO:") {
            let address = angle_address(&line);
            match behavior.reject.iter().find(|(rejected, _)| *rejected == address) {
                Some((_, code)) => format!("{code} rejected {address}\r\n"),
                None => {
                    current.recipients.push(address);
                    "250 2.1.5 ok\r\n".into()
                }
            }
        } else if upper == "DATA" {
            stream.get_mut().write_all(b"354 go ahead\r\n").await?;
            let mut data = String::new();
            while let Some(line) = read_line(&mut stream).await? {
                if line == "." {
                    break;
                }
                let unstuffed = if line.starts_with("..") { &line[1..] } else { line.as_str() };
                data.push_str(unstuffed);
                data.push_str("\r\n");
            }
            current.data = data;
            recorded.lock().unwrap().deliveries.push(std::mem::take(&mut current));
            "250 2.0.0 queued\r\n".into()
        } else if upper == "QUIT" {
            stream.get_mut().write_all(b"221 2.0.0 bye\r\n").await?;
            return Ok(());
        } else if upper == "RSET" || upper == "NOOP" {
            "250 ok\r\n".into()
        } else {
            "502 5.5.2 command not recognized\r\n".into()
        };

        stream.get_mut().write_all(reply.as_bytes()).await?;
    }
}

fn auth_result(
    behavior: &Behavior,
    recorded: &Mutex<Recorded>,
    entry: String,
    user: &str,
    pass: &str,
) -> String {
    let ok = behavior.credentials.0 == user && behavior.credentials.1 == pass;
    let mut recorded = recorded.lock().unwrap();
    recorded.auth.push(entry);
    recorded.authenticated = ok;
    if ok {
        "235 2.7.0 authenticated\r\n".into()
    } else {
        "535 5.7.8 bad credentials\r\n".into()
    }
}

pub(crate) async fn read_line<R>(stream: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}
