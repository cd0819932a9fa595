//! Interactive client for the hub.
//!
//! Usage:
//!
//! ```bash
//! # Run server
//! cargo run -p hub-server
//!
//! # In another terminal
//! cargo run -p hub-server --example hub_client -- --user alice
//! ```
//!
//! Each line typed is sent as an application envelope: the first word
//! is the kind, the rest is the text payload (`chat hello there`).
//! Incoming envelopes are printed; pings are answered automatically.

use std::error::Error;

use bytes::BytesMut;
use clap::Parser;
use hub_core::{Envelope, EnvelopeKind, UserId};
use hub_protocol::{decode_frame, encode_frame, FrameFormat};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[derive(Parser)]
#[clap(name = "hub-client")]
#[clap(about = "Interactive client for the connection hub")]
struct Cli {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:9000")]
    server: String,

    /// User id announced in the hello
    #[clap(short, long)]
    user: String,

    /// Use newline-delimited JSON instead of length-prefixed frames
    #[clap(long)]
    lines: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let format = if cli.lines {
        FrameFormat::Lines
    } else {
        FrameFormat::LengthPrefixed
    };

    println!("Connecting to {}...", cli.server);
    let stream = TcpStream::connect(&cli.server).await?;
    let (mut read_half, mut write_half) = stream.into_split();
    println!("Connected. Type `<kind> <text>` lines, or 'quit' to leave.\n");

    // Everything written to the socket goes through this channel so the
    // reader can answer pings.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    out_tx.send(Envelope::application("hello", json!(null)).with_user(UserId::new(cli.user.clone())))?;

    let writer = tokio::spawn(async move {
        let mut frame = BytesMut::new();
        while let Some(envelope) = out_rx.recv().await {
            frame.clear();
            if let Err(e) = encode_frame(format, &envelope, &mut frame) {
                eprintln!("encode error: {}", e);
                continue;
            }
            if let Err(e) = write_half.write_all(&frame).await {
                eprintln!("write error: {}", e);
                break;
            }
        }
    });

    let pong_tx = out_tx.clone();
    let reader = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match decode_frame(format, &mut buf) {
                Ok(Some(envelope)) => {
                    if envelope.kind() == &EnvelopeKind::Ping {
                        let _ = pong_tx.send(Envelope::pong_for(&envelope));
                        continue;
                    }
                    println!(
                        "<< [{}] {} {}",
                        envelope.timestamp().format("%H:%M:%S"),
                        envelope.kind().as_str(),
                        envelope.payload()
                    );
                    if envelope.kind() == &EnvelopeKind::Close {
                        break;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    eprintln!("decode error: {}", e);
                    break;
                }
            }

            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    println!("Server closed the connection.");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("read error: {}", e);
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
            let _ = out_tx.send(Envelope::close("client quit"));
            break;
        }

        let (kind, text) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        if out_tx.send(Envelope::application(kind, json!(text))).is_err() {
            break;
        }
        if reader.is_finished() {
            break;
        }
    }

    reader.abort();
    let _ = reader.await;
    drop(out_tx);
    let _ = writer.await;
    println!("Exiting client.");
    Ok(())
}
