//! `check` and `in` against a local scripted IMAP server.

mod common;

use common::imap::{FakeImap, StoredMessage};
use common::TestCert;
use email_dispatch::mailbox::{self, MailboxConfig, Version};
use tempfile::TempDir;

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn config(port: u16) -> MailboxConfig {
    MailboxConfig {
        host: "localhost".into(),
        port: port.to_string(),
        username: "ci".into(),
        password: "hunter2".into(),
        skip_ssl_validation: true,
        ..MailboxConfig::default()
    }
}

fn stored(uid: u32) -> StoredMessage {
    StoredMessage {
        uid,
        raw: format!(
            "Message-ID: <{uid}@example.com>\r\n\
             From: ci@example.com\r\n\
             To: a@example.com\r\n\
             Subject: Build {uid}\r\n\
             Date: Tue, 01 Jul 2025 10:00:00 +0000\r\n\
             \r\n\
             Build {uid} passed.\r\n"
        ),
    }
}

async fn start(uids: &[u32]) -> FakeImap {
    let messages = uids.iter().copied().map(stored).collect();
    FakeImap::start(TestCert::localhost().acceptor, messages).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Check
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_check_reports_newest_four() {
    let server = start(&[10, 20, 30, 40, 50, 60]).await;

    let versions = mailbox::check(config(server.port)).await.unwrap();
    let expected: Vec<Version> = [30, 40, 50, 60].into_iter().map(Version::new).collect();
    assert_eq!(versions, expected);

    let commands = server.commands();
    assert!(commands.contains(&"FETCH 3:6 UID".to_string()), "{commands:?}");
    assert_eq!(commands.last().map(String::as_str), Some("LOGOUT"));
}

#[tokio::test]
async fn test_check_opens_mailbox_read_only() {
    let server = start(&[7]).await;

    mailbox::check(config(server.port)).await.unwrap();

    let commands = server.commands();
    assert!(commands.iter().any(|c| c.starts_with("EXAMINE ")), "{commands:?}");
    assert!(!commands.iter().any(|c| c.starts_with("SELECT ")), "{commands:?}");
}

#[tokio::test]
async fn test_check_empty_mailbox() {
    let server = start(&[]).await;

    let versions = mailbox::check(config(server.port)).await.unwrap();
    assert!(versions.is_empty());
    assert!(!server.commands().iter().any(|c| c.starts_with("FETCH")));
}

// ─────────────────────────────────────────────────────────────────────────────
// In
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fetch_leaves_message_unseen() {
    let server = start(&[10, 20]).await;
    let dir = TempDir::new().unwrap();

    let report = mailbox::fetch_into(config(server.port), Version::new(20), dir.path())
        .await
        .unwrap();
    assert_eq!(report.version, Version::new(20));

    let commands = server.commands();
    assert!(commands.contains(&"UID FETCH 20 BODY.PEEK[]".to_string()), "{commands:?}");
    // A plain BODY[] fetch would set \Seen
    assert!(!commands.iter().any(|c| c.contains("BODY[]")), "{commands:?}");
    assert!(!commands.iter().any(|c| c.starts_with("SELECT ")), "{commands:?}");

    let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
    assert_eq!(read("version"), "<20@example.com>");
    assert_eq!(read("subject"), "Build 20");
    assert_eq!(read("body").trim_end(), "Build 20 passed.");
}

#[tokio::test]
async fn test_fetch_unknown_uid() {
    let server = start(&[10]).await;
    let dir = TempDir::new().unwrap();

    let err = mailbox::fetch_into(config(server.port), Version::new(99), dir.path())
        .await
        .unwrap_err();
    assert!(matches!(err, email_dispatch::Error::MessageNotFound { uid: 99 }));
}
