//! Transport channel between a participant and the relay
//!
//! A websocket carrying one JSON [`Signal`] per text frame. Inbound messages
//! and the disconnect notification are delivered into the participant's event
//! queue; outbound messages go through a single writer task so they leave in
//! send order.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::model::session::Input;
use crate::model::signal::Signal;

/// Send half of the channel, owned by the negotiation state machine.
#[derive(Debug, Clone)]
pub struct TransportChannel {
    tx: mpsc::UnboundedSender<Signal>,
}

impl TransportChannel {
    /// Wraps an outbound queue. Whoever drains `tx`'s receiver transmits.
    pub fn new(tx: mpsc::UnboundedSender<Signal>) -> TransportChannel {
        TransportChannel { tx }
    }

    /// Connects to the relay at `url`.
    ///
    /// Inbound signals are pushed to `queue` as [`Input::Signal`]; when the
    /// socket goes away [`Input::ChannelClosed`] is pushed once. There is no
    /// reconnect.
    pub async fn connect(
        url: &str,
        queue: mpsc::UnboundedSender<Input>,
    ) -> Result<TransportChannel, ChannelError> {
        let (ws_stream, _) = connect_async(url).await?;
        info!("Connected to relay at {}", url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();
        let (reader_done, mut reader_gone) = oneshot::channel::<()>();
        let closed = Arc::new(AtomicBool::new(false));

        let writer_queue = queue.clone();
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    signal = rx.recv() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                    _ = &mut reader_gone => break,
                };

                let text = match signal.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping outbound {}: {}", signal.kind(), e);
                        continue;
                    }
                };

                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    warn!("Failed to send {} to relay: {}", signal.kind(), e);
                    break;
                }
            }

            let _ = ws_sender.close().await;
            notify_closed(&writer_closed, &writer_queue);
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Signal::decode(&text) {
                        Ok(signal) => {
                            debug!("Received {} from relay", signal.kind());
                            if queue.send(Input::Signal(signal)).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed message from relay: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Relay closed the channel");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay channel error: {}", e);
                        break;
                    }
                }
            }

            drop(reader_done);
            notify_closed(&closed, &queue);
        });

        Ok(TransportChannel { tx })
    }

    /// Queues `signal` for transmission.
    pub fn send(&self, signal: Signal) -> Result<(), ChannelError> {
        self.tx.send(signal).map_err(|_| ChannelError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn notify_closed(closed: &AtomicBool, queue: &mpsc::UnboundedSender<Input>) {
    if !closed.swap(true, Ordering::SeqCst) {
        let _ = queue.send(Input::ChannelClosed);
    }
}
