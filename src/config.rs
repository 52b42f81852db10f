//! Command line and environment configuration

use std::net::{IpAddr, SocketAddr};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "duo-rtc")]
#[command(about = "Two-party audio/video calls over a websocket signaling relay")]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the signaling relay
    Server(RelayConfig),
    /// Run one call participant
    Peer(PeerConfig),
}

#[derive(Args, Debug, Clone)]
pub struct RelayConfig {
    /// Address the websocket relay listens on
    #[arg(long, env = "DUO_RTC_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Messages buffered per channel before further forwards to it are dropped
    #[arg(long, env = "DUO_RTC_QUEUE_CAPACITY", default_value_t = 128)]
    pub queue_capacity: usize,

    /// Serve `GET /health` on this address
    #[arg(long, env = "DUO_RTC_HEALTH")]
    pub health: Option<SocketAddr>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            queue_capacity: 128,
            health: None,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct PeerConfig {
    /// Websocket URL of the relay
    #[arg(long, env = "DUO_RTC_SIGNALING_URL", default_value = "ws://127.0.0.1:3000")]
    pub signaling_url: String,

    /// Local address for media; defaults to the first routable interface
    #[arg(long, env = "DUO_RTC_BIND")]
    pub bind: Option<IpAddr>,

    /// Send an offer as soon as media is acquired
    #[arg(long)]
    pub call: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            signaling_url: "ws://127.0.0.1:3000".to_string(),
            bind: None,
            call: false,
        }
    }
}
