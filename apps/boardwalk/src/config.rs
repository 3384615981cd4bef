use std::{net::SocketAddr, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::cli::ServerArgs;
use crate::protocol::MatchedEvent;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub matched_event: MatchedEvent,
    /// `None` disables the idle monitor.
    pub idle_timeout: Option<Duration>,
    pub idle_check_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            matched_event: MatchedEvent::Matched,
            idle_timeout: None,
            idle_check_interval: Duration::from_secs(60),
        }
    }
}

/// ICE servers handed to browsers through `/ice-config`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                username: None,
                credential: None,
            }],
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            shutdown_grace: Duration::from_secs(5),
            signaling: SignalingConfig::default(),
            ice: IceConfig::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid listen address `{0}`")]
    ListenAddr(String),
    #[error("TURN urls require both a username and a credential")]
    TurnCredentials,
    #[error("idle check interval must be greater than zero")]
    IdleCheckInterval,
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = ConfigError;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::ListenAddr(args.listen_addr.clone()))?;

        if args.idle_check_interval_secs == 0 {
            return Err(ConfigError::IdleCheckInterval);
        }

        let mut ice_servers = Vec::new();
        let stun_urls: Vec<String> = args
            .stun_urls
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if !stun_urls.is_empty() {
            ice_servers.push(IceServer {
                urls: stun_urls,
                username: None,
                credential: None,
            });
        }
        if !args.turn_urls.is_empty() {
            match (args.turn_username, args.turn_credential) {
                (Some(username), Some(credential)) => ice_servers.push(IceServer {
                    urls: args.turn_urls,
                    username: Some(username),
                    credential: Some(credential),
                }),
                _ => return Err(ConfigError::TurnCredentials),
            }
        }

        Ok(ServerConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            signaling: SignalingConfig {
                matched_event: args.matched_event,
                idle_timeout: (args.idle_timeout_secs > 0)
                    .then(|| Duration::from_secs(args.idle_timeout_secs)),
                idle_check_interval: Duration::from_secs(args.idle_check_interval_secs),
            },
            ice: IceConfig { ice_servers },
        })
    }
}
