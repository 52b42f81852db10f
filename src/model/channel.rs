use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Identifies one connected transport channel on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> ChannelId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        ChannelId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Deref for ChannelId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered channel: where it came from and how to reach it.
#[derive(Debug)]
pub struct ChannelEntry {
    pub id: ChannelId,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    /// Bounded queue drained by the channel's writer task.
    pub tx: mpsc::Sender<Message>,
}

impl ChannelEntry {
    pub fn new(addr: SocketAddr, tx: mpsc::Sender<Message>) -> ChannelEntry {
        ChannelEntry {
            id: ChannelId::next(),
            addr,
            connected_at: Utc::now(),
            tx,
        }
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.connected_at
    }
}
