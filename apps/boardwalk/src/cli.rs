use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{timeout_at, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use crate::config::DEFAULT_STUN_URL;
use crate::protocol::{MatchedEvent, ServerMessage};

#[derive(Parser, Debug)]
#[command(
    name = "boardwalk",
    author,
    version,
    about = "Anonymous peer matching and WebRTC signaling server"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BOARDWALK_LISTEN_ADDR", default_value = "0.0.0.0:5000")]
    pub listen_addr: String,

    /// Event name used to announce a pairing.
    #[arg(long, env = "BOARDWALK_MATCHED_EVENT", value_enum, default_value_t = MatchedEvent::Matched)]
    pub matched_event: MatchedEvent,

    /// Close connections with no inbound traffic for this long (0, the
    /// default, disables the idle monitor).
    #[arg(long, env = "BOARDWALK_IDLE_TIMEOUT_SECS", default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// How often the idle monitor scans connections.
    #[arg(long, env = "BOARDWALK_IDLE_CHECK_INTERVAL_SECS", default_value_t = 60)]
    pub idle_check_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BOARDWALK_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// STUN urls advertised through /ice-config.
    #[arg(
        long,
        env = "BOARDWALK_STUN_URLS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_URL
    )]
    pub stun_urls: Vec<String>,

    /// TURN urls advertised through /ice-config.
    #[arg(long, env = "BOARDWALK_TURN_URLS", value_delimiter = ',')]
    pub turn_urls: Vec<String>,

    #[arg(long, env = "BOARDWALK_TURN_USERNAME")]
    pub turn_username: Option<String>,

    #[arg(long, env = "BOARDWALK_TURN_CREDENTIAL", hide_env_values = true)]
    pub turn_credential: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect as a client, search, and print events until matched
    Probe {
        /// Signaling endpoint (e.g., ws://localhost:5000/ws)
        #[arg(short, long, default_value = "ws://localhost:5000/ws")]
        url: String,

        /// User id to search with
        #[arg(long, default_value = "probe")]
        user_id: String,

        /// Display name sent in the profile
        #[arg(long, default_value = "probe")]
        username: String,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

/// Searches for a partner and reports what the server says. Returns once a
/// pairing is announced.
pub async fn run_probe(
    url: String,
    user_id: String,
    username: String,
    timeout_secs: u64,
) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);

    let (ws_stream, _) = timeout_at(deadline, connect_async(&url))
        .await
        .map_err(|_| anyhow!("timed out connecting to {url}"))?
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut write, mut read) = ws_stream.split();
    info!(%url, "connected");

    let search = json!({
        "type": "search",
        "userId": user_id,
        "userProfile": { "username": username },
    });
    write
        .send(Message::Text(search.to_string().into()))
        .await
        .context("failed to send search")?;

    loop {
        let frame = timeout_at(deadline, read.next())
            .await
            .map_err(|_| anyhow!("no partner within {timeout_secs}s"))?
            .ok_or_else(|| anyhow!("server closed the connection"))?
            .context("websocket error")?;

        let Message::Text(text) = frame else {
            debug!("ignoring non-text frame");
            continue;
        };
        let event: ServerMessage = match serde_json::from_str(text.as_str()) {
            Ok(event) => event,
            Err(err) => {
                info!(frame = %text.as_str(), error = %err, "unrecognised frame");
                continue;
            }
        };
        match event {
            ServerMessage::Searching => info!("waiting for a partner"),
            ServerMessage::Matched(peer) | ServerMessage::PeerFound(peer) => {
                info!(
                    peer_id = ?peer.peer_id,
                    initiator = peer.is_initiator,
                    "matched"
                );
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            ServerMessage::SkipToNext => info!("partner left"),
            ServerMessage::Pong => debug!("pong"),
        }
    }
}
