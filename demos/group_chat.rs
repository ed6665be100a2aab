//! Minimal terminal front-end for the meshchat library
//!
//! Prompts for a username, joins the mesh through the given bootstrap
//! peers, prints everything the peer observes, and broadcasts each stdin
//! line as a chat message. Ctrl-C leaves the chat cleanly.

use anyhow::{Context, Result};
use clap::Parser;
use meshchat::{Envelope, PeerBuilder, CLOSED_CONNECTION_REQUEST, NEW_CONNECTION_REQUEST};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Decentralized TCP group chat
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local address to listen on
    #[arg(default_value = "127.0.0.1")]
    listen: String,

    /// Local port to listen on (0 picks a free port)
    #[arg(default_value = "0")]
    port: u16,

    /// Bootstrap peers, as host:port
    peers: Vec<String>,

    /// Write a diagnostic log file named after the listen endpoint
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = PeerBuilder::new()
        .with_listen_addr(args.listen)
        .with_listen_port(args.port)
        .with_diagnostics(args.debug);
    for peer in &args.peers {
        builder = builder.add_peer(peer.clone());
    }
    let peer = builder.build().context("invalid peer configuration")?;

    println!("\nEnter your username to start the chat:");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let username = loop {
        match lines.next_line().await? {
            Some(line) if !line.trim().is_empty() => break line.trim().to_string(),
            Some(_) => continue,
            None => return Ok(()),
        }
    };
    peer.set_username(&username);

    peer.add_observer(Arc::new(|envelope: &Envelope| {
        let sender = envelope.username().unwrap_or("?");
        match envelope.kind() {
            Some(NEW_CONNECTION_REQUEST) => println!("<{sender}>: Join the chat"),
            Some(CLOSED_CONNECTION_REQUEST) => println!("<{sender}>: Left the chat"),
            Some(text) => println!("<{sender}>: {text}"),
            None => {},
        }
    }));

    peer.start().await.context("peer startup failed")?;
    println!("Listening on {}", peer.local_endpoint());
    println!("\nType your message and press Enter to send it. Messages from other peers will be displayed below.\n");

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(content) => {
                    let envelope = Envelope::chat(&username, &content);
                    peer.send_to_everyone(envelope.wire()).await?;
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    peer.close().await?;
    Ok(())
}
