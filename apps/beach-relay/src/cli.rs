use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::ServeArgs;
use crate::envelope::Envelope;

#[derive(Parser, Debug)]
#[command(name = "beach-relay", version)]
#[command(about = "Beach signaling relay and debug peer")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server (default when no command is given)
    Serve(ServeArgs),
    /// Join a relay as a peer and relay envelopes between stdin/stdout
    Peer {
        /// Signaling endpoint URL
        #[arg(short, long, default_value = "ws://localhost:8080/rtc")]
        url: String,

        /// Peer id to register under
        #[arg(short, long)]
        id: String,
    },
}

/// Parses `<target_id> <type> [json-data]` typed at the debug peer prompt.
pub fn parse_command(line: &str) -> Result<Option<Envelope>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let mut parts = line.splitn(3, char::is_whitespace);
    let target = parts.next().unwrap_or_default();
    let kind = parts
        .next()
        .filter(|kind| !kind.is_empty())
        .ok_or_else(|| anyhow!("expected `<target_id> <type> [json-data]`"))?;

    let mut envelope = Envelope::new(kind).with_target(target);
    if let Some(raw) = parts.next().map(str::trim).filter(|raw| !raw.is_empty()) {
        let data: Value =
            serde_json::from_str(raw).with_context(|| format!("data is not valid json: {raw}"))?;
        envelope = envelope.with_data(data);
    }
    Ok(Some(envelope))
}

pub async fn run_peer(url: String, peer_id: String) -> Result<()> {
    debug!("Connecting to {} as {}", url, peer_id);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => bail!("Connection to {} failed: {}", url, e),
        Err(_) => bail!("Connection timeout - is the relay running at {}?", url),
    };
    let (mut write, mut read) = ws_stream.split();

    let join_text = json!({ "type": "join", "peer_id": peer_id }).to_string();
    write.send(Message::Text(join_text.into())).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => println!("{}", text.as_str()),
                Some(Ok(Message::Binary(bytes))) => {
                    println!("{}", String::from_utf8_lossy(&bytes));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Relay closed the connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("relay connection failed"),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match parse_command(&line) {
                    Ok(Some(envelope)) => {
                        write.send(Message::Text(envelope.to_json().into())).await?;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("{:#}", e),
                },
                None => stdin_open = false,
            },
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
