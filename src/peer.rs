//! Call participant runtime
//!
//! Connects to the relay, builds the str0m backend and drives one
//! [`Negotiator`] from a single event queue. Relay messages, stdin commands
//! and peer-connection events all pass through that queue; UDP datagrams and
//! str0m timeouts are fed straight into the peer connection, and whatever it
//! raises is pumped back into the machine.
//!
//! Commands on stdin, one per line: `call`, `mute`, `hangup`, `share`,
//! `unshare`. End of input hangs up.

use std::time::Instant;

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, watch},
};
use tracing::{info, warn};

use crate::backend::Str0mBackend;
use crate::channel::TransportChannel;
use crate::config::PeerConfig;
use crate::model::session::{CallStatus, Command, Input, Phase};
use crate::negotiation::Negotiator;
use crate::util::select_host_address;

pub async fn main(config: PeerConfig) -> anyhow::Result<()> {
    let (queue, mut events) = mpsc::unbounded_channel::<Input>();

    let channel = TransportChannel::connect(&config.signaling_url, queue.clone())
        .await
        .with_context(|| format!("connecting to relay at {}", config.signaling_url))?;

    let ip = match config.bind {
        Some(ip) => ip,
        None => select_host_address().context("no usable network interface")?,
    };
    let backend = Str0mBackend::bind(ip).await?;
    let socket = backend.socket();

    let (mut negotiator, status) = Negotiator::new(backend, channel);
    tokio::spawn(render_status(status));

    if let Err(e) = negotiator.start() {
        // Controls stay disabled; hang-up or end of input still exits.
        warn!("Call controls disabled: {}", e);
    } else if config.call {
        negotiator.handle(Input::Command(Command::StartCall));
    }

    tokio::spawn(read_commands(queue));

    let mut buf = vec![0; 2000];

    loop {
        let timeout = negotiator.peer().and_then(|p| p.poll_timeout());

        tokio::select! {
            input = events.recv() => match input {
                Some(input) => negotiator.handle(input),
                None => break,
            },

            received = socket.recv_from(&mut buf) => match received {
                Ok((n, source)) => {
                    if let Some(peer) = negotiator.peer_mut() {
                        peer.handle_receive(source, &buf[..n]);
                    }
                }
                Err(e) => warn!("UDP receive failed: {}", e),
            },

            _ = async {
                match timeout {
                    Some(t) => tokio::time::sleep_until(t.into()).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some(peer) = negotiator.peer_mut() {
                    peer.handle_timeout(Instant::now());
                }
            }
        }

        negotiator.pump();

        if negotiator.phase() == Phase::Closed {
            break;
        }
    }

    info!("Call ended");
    Ok(())
}

/// Turns stdin lines into commands. End of input hangs up.
async fn read_commands(queue: mpsc::UnboundedSender<Input>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Reading commands failed: {}", e);
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Some(command) => {
                if queue.send(Input::Command(command)).is_err() {
                    return;
                }
            }
            None => warn!("Unknown command {:?} (call, mute, hangup, share, unshare)", line.trim()),
        }
    }

    let _ = queue.send(Input::Command(Command::HangUp));
}

/// Logs every status change; this is the whole UI of the command line peer.
async fn render_status(mut status: watch::Receiver<CallStatus>) {
    while status.changed().await.is_ok() {
        let s = status.borrow().clone();
        info!(
            "{} | {} | {} | {}",
            if s.connected() { "Connected" } else { "Not Connected" },
            if s.muted { "Muted" } else { "Unmuted" },
            if s.sharing { "Sharing" } else { "Not Sharing" },
            s.phase,
        );
        if let Some(error) = &s.last_error {
            warn!("Last error: {}", error);
        }
    }
}
