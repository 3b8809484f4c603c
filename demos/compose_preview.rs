//! Example: Print the exact payload that would be sent, without sending.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example compose_preview -- Cargo.toml
//! ```

use email_dispatch::message::{parse_header_block, Attachment, MessageBuilder};
use std::env;
use std::path::Path;

fn main() -> email_dispatch::Result<()> {
    let mut builder = MessageBuilder::new()
        .from("Build Bot <ci@example.com>")
        .to(["team@example.com", "ops@example.com"])
        .cc(["lead@example.com"])
        .subject("Nightly build ✓")
        .headers_text("X-Build-Id: 42\nX-Pipeline: nightly")?
        .body("All jobs passed.\n.hidden line that needs dot-stuffing\n");

    for path in env::args().skip(1) {
        builder = builder.attachment(Attachment::from_path(Path::new(&path))?);
    }

    let message = builder.build();
    println!("--- headers ---");
    for header in message.headers() {
        println!("{}: {}", header.name, header.value);
    }
    if let Some(boundary) = message.boundary() {
        println!("boundary: {boundary}");
    }

    println!("--- payload ---");
    print!("{}", String::from_utf8_lossy(&message.to_bytes()));

    // Header text from files goes through the same parser
    let extra = parse_header_block("Reply-To: noreply@example.com\n\tcontinued")?;
    println!("--- parsed ---");
    println!("{extra:?}");
    Ok(())
}
