//! Websocket signaling relay
//!
//! Each connection gets a reader task and a writer task. Readers push
//! [`Propagated`] events into one hub task, which owns the channel list and
//! forwards every frame to all other channels. The hub queue and each
//! channel's outbound queue hold `queue_capacity` messages; a full hub queue
//! stalls the sending reader, a full outbound queue drops the frame for that
//! recipient only.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use anyhow::{anyhow, Context};
use futures_util::{SinkExt, StreamExt};
use rouille::{Request, Response, Server};
use serde_json::json;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, error::TrySendError, Receiver, Sender},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::model::{
    channel::{ChannelEntry, ChannelId},
    propagated::Propagated,
    signal::Signal,
};
use crate::util::select_host_address;

/// The set of connected channels and the broadcast rule.
///
/// Every frame goes to every channel except its sender. There is no notion of
/// rooms or pairing, so this is only a correct call setup while at most two
/// channels are connected.
#[derive(Debug)]
pub struct Relay {
    channels: Vec<ChannelEntry>,
    connections: Arc<AtomicUsize>,
}

impl Relay {
    pub fn new(connections: Arc<AtomicUsize>) -> Relay {
        Relay {
            channels: vec![],
            connections,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn handle(&mut self, propagated: Propagated) {
        match propagated {
            Propagated::Connected(entry) => self.connect(entry),
            Propagated::Frame(from, frame) => {
                self.forward(from, frame);
            }
            Propagated::Disconnected(id) => self.disconnect(id),
        }
    }

    pub fn connect(&mut self, entry: ChannelEntry) {
        info!(
            "New client connected: channel {} from {}",
            entry.id, entry.addr
        );
        self.channels.push(entry);
        self.publish_count();
    }

    pub fn disconnect(&mut self, id: ChannelId) {
        let Some(pos) = self.channels.iter().position(|c| c.id == id) else {
            return;
        };

        let entry = self.channels.remove(pos);
        info!(
            "Client disconnected: channel {} after {}s",
            entry.id,
            entry.uptime().num_seconds()
        );
        self.publish_count();
    }

    /// Hands `frame` to every channel but `from`, returning how many took it.
    ///
    /// A recipient whose queue is full misses this frame; one whose writer is
    /// gone is deregistered. Neither affects the others.
    pub fn forward(&mut self, from: ChannelId, frame: Message) -> usize {
        let kind = match &frame {
            Message::Text(text) => Signal::peek_kind(text)
                .map(|k| k.to_string())
                .unwrap_or_else(|| "opaque message".to_string()),
            _ => "binary message".to_string(),
        };
        info!("{} received from channel {}", kind, from);

        let mut delivered = 0;
        let mut broken = vec![];

        for channel in &self.channels {
            if channel.id == from {
                // Do not propagate to originating channel.
                continue;
            }

            match channel.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Channel {} is not keeping up, dropped {}", channel.id, kind);
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("Channel {} is gone, dropped {}", channel.id, kind);
                    broken.push(channel.id);
                }
            }
        }

        for id in broken {
            self.disconnect(id);
        }

        debug!("{} forwarded to {} channel(s)", kind, delivered);
        delivered
    }

    fn publish_count(&self) {
        self.connections.store(self.channels.len(), Ordering::SeqCst);
        info!("{} client(s) connected", self.channels.len());
    }
}

/// A running relay.
pub struct RelayHandle {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn connection_counter(&self) -> Arc<AtomicUsize> {
        self.connections.clone()
    }

    /// Stops accepting new channels. Existing handlers wind down on their own.
    pub fn abort(&self) {
        self.task.abort();
    }
}

pub async fn main(config: RelayConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding relay to {}", config.listen))?;

    let relay = serve(listener, config.queue_capacity)?;
    let addr = relay.local_addr();

    if let Some(health) = config.health {
        let bound = spawn_health(health, relay.connection_counter())?;
        info!("Health endpoint on http://{}/health", bound);
    }

    let host = if addr.ip().is_unspecified() {
        select_host_address().unwrap_or(addr.ip())
    } else {
        addr.ip()
    };
    info!("Connect peers to ws://{}:{}", host, addr.port());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down relay");
    relay.abort();

    Ok(())
}

/// Starts relaying on `listener`.
///
/// Must be called inside a tokio runtime.
pub fn serve(listener: TcpListener, queue_capacity: usize) -> std::io::Result<RelayHandle> {
    let addr = listener.local_addr()?;
    let connections = Arc::new(AtomicUsize::new(0));
    let capacity = queue_capacity.max(1);
    let (hub_tx, hub_rx) = mpsc::channel(capacity);

    tokio::spawn(run_hub(Relay::new(connections.clone()), hub_rx));
    let task = tokio::spawn(accept_loop(listener, hub_tx, capacity));

    info!("Relay listening on {}", addr);

    Ok(RelayHandle {
        addr,
        connections,
        task,
    })
}

/// Sole owner of the channel set; applies events in arrival order.
async fn run_hub(mut relay: Relay, mut rx: Receiver<Propagated>) {
    while let Some(propagated) = rx.recv().await {
        relay.handle(propagated);
    }
    debug!("Relay hub stopped");
}

async fn accept_loop(listener: TcpListener, hub: Sender<Propagated>, capacity: usize) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(stream, addr, hub.clone(), capacity));
            }
            Err(e) => warn!("Accept failed: {}", e),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Sender<Propagated>,
    capacity: usize,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Websocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(capacity);

    let entry = ChannelEntry::new(addr, tx);
    let id = entry.id;
    if hub.send(Propagated::Connected(entry)).await.is_err() {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                debug!("Send to channel {} failed: {}", id, e);
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                if hub.send(Propagated::Frame(id, msg)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Channel {} read failed: {}", id, e);
                break;
            }
        }
    }

    let _ = hub.send(Propagated::Disconnected(id)).await;
    writer.abort();
}

/// Serves `GET /health` on its own thread.
pub fn spawn_health(addr: SocketAddr, connections: Arc<AtomicUsize>) -> anyhow::Result<SocketAddr> {
    let (tx, rx) = std::sync::mpsc::channel();

    thread::spawn(move || {
        match Server::new(addr, move |request| health_response(request, &connections)) {
            Ok(server) => {
                let _ = tx.send(Ok(server.server_addr()));
                server.run();
            }
            Err(e) => {
                let _ = tx.send(Err(e.to_string()));
            }
        }
    });

    rx.recv()
        .context("health endpoint thread exited")?
        .map_err(|e| anyhow!("starting health endpoint on {addr}: {e}"))
}

fn health_response(request: &Request, connections: &AtomicUsize) -> Response {
    if request.method() != "GET" || request.url() != "/health" {
        return Response::empty_404();
    }

    Response::json(&json!({
        "status": "ok",
        "connections": connections.load(Ordering::SeqCst),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn entry(capacity: usize) -> (ChannelEntry, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 9000));
        (ChannelEntry::new(addr, tx), rx)
    }

    fn relay() -> (Relay, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        (Relay::new(counter.clone()), counter)
    }

    fn text(s: &str) -> Message {
        Message::Text(s.to_string())
    }

    #[test]
    fn frame_reaches_everyone_but_sender() {
        for n in 1..=5 {
            let (mut relay, counter) = relay();
            let mut ids = vec![];
            let mut rxs = vec![];
            for _ in 0..n {
                let (e, rx) = entry(8);
                ids.push(e.id);
                rxs.push(rx);
                relay.connect(e);
            }
            assert_eq!(counter.load(Ordering::SeqCst), n);

            let delivered = relay.forward(ids[0], text(r#"{"event":"offer","data":{}}"#));

            assert_eq!(delivered, n - 1);
            assert!(rxs[0].try_recv().is_err());
            for rx in &mut rxs[1..] {
                assert!(rx.try_recv().is_ok());
            }
        }
    }

    #[test]
    fn two_channel_offer_answer() {
        let (mut relay, _) = relay();
        let (c1, mut rx1) = entry(8);
        let (c2, mut rx2) = entry(8);
        let (id1, id2) = (c1.id, c2.id);
        relay.connect(c1);
        relay.connect(c2);

        let offer = r#"{"type":"offer","sdp":"X"}"#;
        relay.forward(id1, text(offer));
        assert_eq!(rx2.try_recv().unwrap(), text(offer));
        assert!(rx1.try_recv().is_err());

        let answer = r#"{"type":"answer","sdp":"Y"}"#;
        relay.forward(id2, text(answer));
        assert_eq!(rx1.try_recv().unwrap(), text(answer));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn disconnected_channel_gets_nothing() {
        let (mut relay, counter) = relay();
        let (a, _rx_a) = entry(8);
        let (b, mut rx_b) = entry(8);
        let (c, mut rx_c) = entry(8);
        let (a_id, b_id) = (a.id, b.id);
        relay.connect(a);
        relay.connect(b);
        relay.connect(c);

        relay.disconnect(b_id);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert_eq!(relay.forward(a_id, text("hi")), 1);
        assert!(rx_c.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn malformed_frames_pass_through_unchanged() {
        let (mut relay, _) = relay();
        let (a, _rx_a) = entry(8);
        let (b, mut rx_b) = entry(8);
        let a_id = a.id;
        relay.connect(a);
        relay.connect(b);

        relay.forward(a_id, text("{not json"));
        relay.forward(a_id, Message::Binary(vec![1, 2, 3]));

        assert_eq!(rx_b.try_recv().unwrap(), text("{not json"));
        assert_eq!(rx_b.try_recv().unwrap(), Message::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn full_recipient_does_not_block_others() {
        let (mut relay, _) = relay();
        let (a, _rx_a) = entry(8);
        let (slow, mut rx_slow) = entry(1);
        let (fast, mut rx_fast) = entry(8);
        let a_id = a.id;
        relay.connect(a);
        relay.connect(slow);
        relay.connect(fast);

        assert_eq!(relay.forward(a_id, text("1")), 2);
        assert_eq!(relay.forward(a_id, text("2")), 1);

        assert_eq!(rx_fast.try_recv().unwrap(), text("1"));
        assert_eq!(rx_fast.try_recv().unwrap(), text("2"));
        assert_eq!(rx_slow.try_recv().unwrap(), text("1"));
        assert!(rx_slow.try_recv().is_err());
        assert_eq!(relay.len(), 3);
    }

    #[test]
    fn closed_recipient_is_dropped() {
        let (mut relay, counter) = relay();
        let (a, _rx_a) = entry(8);
        let (gone, rx_gone) = entry(8);
        let (alive, mut rx_alive) = entry(8);
        let a_id = a.id;
        relay.connect(a);
        relay.connect(gone);
        relay.connect(alive);
        drop(rx_gone);

        assert_eq!(relay.forward(a_id, text("x")), 1);

        assert!(rx_alive.try_recv().is_ok());
        assert_eq!(relay.len(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn per_sender_order_is_kept() {
        let (mut relay, _) = relay();
        let (a, _rx_a) = entry(16);
        let (b, mut rx_b) = entry(16);
        let a_id = a.id;
        relay.handle(Propagated::Connected(a));
        relay.handle(Propagated::Connected(b));

        for i in 0..10 {
            relay.handle(Propagated::Frame(a_id, text(&i.to_string())));
        }

        for i in 0..10 {
            assert_eq!(rx_b.try_recv().unwrap(), text(&i.to_string()));
        }
    }

    #[test]
    fn unknown_disconnect_is_ignored() {
        let (mut relay, _) = relay();
        let (a, _rx) = entry(1);
        let a_id = a.id;

        relay.disconnect(a_id);
        assert!(relay.is_empty());
    }

    #[tokio::test]
    async fn flooding_channel_waits_for_the_hub() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (hub_tx, mut hub_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let (stream, addr) = listener.accept().await.unwrap();
            handle_connection(stream, addr, hub_tx, 4).await;
        });

        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        for i in 0..20 {
            client.send(text(&i.to_string())).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // Nothing drains the hub, so only the registration fits.
        assert_eq!(hub_rx.len(), 1);
        assert!(matches!(hub_rx.recv().await, Some(Propagated::Connected(_))));

        for i in 0..20 {
            match hub_rx.recv().await {
                Some(Propagated::Frame(_, msg)) => assert_eq!(msg, text(&i.to_string())),
                other => panic!("unexpected hub event: {other:?}"),
            }
        }
    }
}
