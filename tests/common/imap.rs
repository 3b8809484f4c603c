//! A scripted IMAP server over implicit TLS.
//!
//! Holds a fixed list of messages, answers `LOGIN`, `SELECT`/`EXAMINE`,
//! `FETCH <range> UID`, `UID FETCH <uid> <item>` and `LOGOUT`, and records
//! every command with its tag stripped.

use super::{read_line, BoxedStream};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// One stored message: its UID and raw RFC 5322 text.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub uid: u32,
    pub raw: String,
}

/// A running fake server.
pub struct FakeImap {
    /// Listening port.
    pub port: u16,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeImap {
    /// Starts a server holding `messages`, in sequence-number order.
    pub async fn start(acceptor: TlsAcceptor, messages: Vec<StoredMessage>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));

        let shared = Arc::clone(&commands);
        let messages = Arc::new(messages);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let messages = Arc::clone(&messages);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let _ = serve(Box::new(tls), &messages, &shared).await;
                });
            }
        });

        Self { port, commands }
    }

    /// Commands received so far, tags stripped.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

fn sequence_range(range: &str, len: usize) -> Vec<usize> {
    let (from, to) = range.split_once(':').unwrap_or((range, range));
    let from: usize = from.parse().unwrap_or(1);
    let to: usize = to.parse().unwrap_or(len);
    (from.max(1)..=to.min(len)).collect()
}

async fn serve(
    stream: BoxedStream,
    messages: &[StoredMessage],
    commands: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let mut stream = BufReader::new(stream);
    stream
        .get_mut()
        .write_all(b"* OK [CAPABILITY IMAP4rev1] fake.test ready\r\n")
        .await?;

    loop {
        let Some(line) = read_line(&mut stream).await? else {
            return Ok(());
        };
        let Some((tag, command)) = line.split_once(' ') else {
            continue;
        };
        commands.lock().unwrap().push(command.to_string());

        let words: Vec<&str> = command.split_whitespace().collect();
        let verb = words.first().map(|w| w.to_ascii_uppercase()).unwrap_or_default();

        let mut reply = String::new();
        match verb.as_str() {
            "LOGIN" => reply.push_str(&format!("{tag} OK LOGIN completed\r\n")),
            "SELECT" | "EXAMINE" => {
                let access = if verb == "EXAMINE" { "READ-ONLY" } else { "READ-WRITE" };
                reply.push_str(&format!("* {} EXISTS\r\n", messages.len()));
                reply.push_str("* 0 RECENT\r\n");
                reply.push_str("* FLAGS (\\Seen \\Answered)\r\n");
                reply.push_str("* OK [UIDVALIDITY 1] UIDs valid\r\n");
                reply.push_str(&format!("{tag} OK [{access}] {verb} completed\r\n"));
            }
            "FETCH" => {
                let range = words.get(1).copied().unwrap_or_default();
                for seq in sequence_range(range, messages.len()) {
                    let uid = messages[seq - 1].uid;
                    reply.push_str(&format!("* {seq} FETCH (UID {uid})\r\n"));
                }
                reply.push_str(&format!("{tag} OK FETCH completed\r\n"));
            }
            "UID" => {
                let uid: u32 = words.get(2).and_then(|w| w.parse().ok()).unwrap_or_default();
                if let Some(seq) = messages.iter().position(|m| m.uid == uid) {
                    let raw = &messages[seq].raw;
                    reply.push_str(&format!(
                        "* {} FETCH (UID {uid} BODY[] {{{}}}\r\n{raw})\r\n",
                        seq + 1,
                        raw.len()
                    ));
                }
                reply.push_str(&format!("{tag} OK UID FETCH completed\r\n"));
            }
            "LOGOUT" => {
                reply.push_str("* BYE fake.test logging out\r\n");
                reply.push_str(&format!("{tag} OK LOGOUT completed\r\n"));
                stream.get_mut().write_all(reply.as_bytes()).await?;
                return Ok(());
            }
            _ => reply.push_str(&format!("{tag} BAD unknown command\r\n")),
        }

        stream.get_mut().write_all(reply.as_bytes()).await?;
    }
}
