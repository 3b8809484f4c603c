//! Example: List and download the newest messages in a mailbox.
//!
//! # Usage
//!
//! ```bash
//! export IMAP_HOST="imap.example.com"
//! export IMAP_USER="your@email.com"
//! export IMAP_PASSWORD="your-app-password"
//! cargo run --example check_mailbox
//! ```

use email_dispatch::{MailboxClient, MailboxConfig};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = MailboxConfig {
        host: env::var("IMAP_HOST")?,
        username: env::var("IMAP_USER")?,
        password: env::var("IMAP_PASSWORD")?,
        ..MailboxConfig::default()
    };

    println!("Connecting to {}...", config.host);
    let mut client = MailboxClient::connect(config).await?;

    let versions = client.check().await?;
    println!("Newest {} message(s):", versions.len());

    for version in &versions {
        let message = client.fetch(version).await?;
        println!("  [{}] {}", version.uid, message.subject);
        for item in message.metadata() {
            println!("      {}: {}", item.name, item.value);
        }
    }

    client.logout().await?;
    println!("Done");
    Ok(())
}
