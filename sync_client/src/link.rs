//! Server link.
//!
//! The link maintains:
//! - A reliable control stream (handshake, snapshot request, snapshots)
//! - An unreliable datagram socket (update and despawn batches)
//! - An inbox that buffers received messages until the next render frame
//!
//! Network tasks never touch the engine. They push into the inbox, and the
//! frame loop drains it on its own thread, so message handling and frame
//! processing never run concurrently.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Context;
use async_trait::async_trait;
use sync_shared::{
    config::ClientConfig,
    net::{ClientId, NetMsg, ReliableConn, SyncMsg, UnreliableConn, PROTOCOL_VERSION},
    render::VisualBackend,
};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;

/// Link connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Handshake done, no snapshot requested yet.
    Connected,
    /// Snapshot requested; messages are flowing.
    Syncing,
    Disconnected,
}

/// A stream of sync messages. `Ok(None)` means the source closed cleanly.
#[async_trait]
pub trait MessageSource: Send {
    async fn next_message(&mut self) -> anyhow::Result<Option<SyncMsg>>;
}

#[async_trait]
impl MessageSource for ReliableConn {
    async fn next_message(&mut self) -> anyhow::Result<Option<SyncMsg>> {
        loop {
            match self.recv().await? {
                NetMsg::Sync(msg) => return Ok(Some(msg)),
                NetMsg::Disconnect { reason } => {
                    info!(reason = %reason, "Disconnected by server");
                    return Ok(None);
                }
                other => debug!(?other, "Unhandled reliable message"),
            }
        }
    }
}

#[async_trait]
impl MessageSource for UnreliableConn {
    async fn next_message(&mut self) -> anyhow::Result<Option<SyncMsg>> {
        loop {
            match self.recv().await {
                Ok(NetMsg::Sync(msg)) => return Ok(Some(msg)),
                Ok(other) => debug!(?other, "Unexpected UDP message"),
                // A single bad datagram is not fatal.
                Err(e) if e.downcast_ref::<serde_json::Error>().is_some() => {
                    warn!(error = %e, "Dropping undecodable datagram");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Forwards messages from `source` into `tx` until the source closes or the
/// inbox is dropped. Returns the number forwarded.
pub async fn pump<S>(source: &mut S, tx: &mpsc::Sender<SyncMsg>) -> anyhow::Result<usize>
where
    S: MessageSource + ?Sized,
{
    let mut forwarded = 0;
    while let Some(msg) = source.next_message().await? {
        if tx.send(msg).await.is_err() {
            debug!("Inbox dropped, stopping pump");
            break;
        }
        forwarded += 1;
    }
    Ok(forwarded)
}

/// Receiving end of the message channel, drained once per frame.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<SyncMsg>,
    closed: bool,
}

/// Creates a bounded inbox and the sender network tasks push into.
pub fn inbox(capacity: usize) -> (mpsc::Sender<SyncMsg>, Inbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, Inbox { rx, closed: false })
}

impl Inbox {
    /// Applies up to `max` pending messages to `engine`. Returns how many.
    pub fn drain_into<B: VisualBackend>(&mut self, engine: &mut SyncEngine<B>, now: f64, max: usize) -> usize {
        let mut applied = 0;
        while applied < max {
            match self.rx.try_recv() {
                Ok(msg) => {
                    engine.handle_message(msg, now);
                    applied += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        applied
    }

    /// All senders are gone and nothing is left to drain.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Connection to a sync server.
pub struct SyncLink {
    pub client_id: ClientId,
    pub state: LinkState,
    reliable: ReliableConn,
    unreliable: UnreliableConn,
}

impl SyncLink {
    /// Connects to a server and performs the handshake.
    pub async fn connect(cfg: &ClientConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;

        info!(server = %server_addr, player = %cfg.player_name, "Connecting to server");

        // Bind UDP first so we can tell the server where to send batches.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let unreliable = UnreliableConn::connect(bind, server_addr).await?;
        let client_udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let stream = TcpStream::connect(server_addr).await.context("tcp connect")?;
        let mut reliable = ReliableConn::new(stream);

        reliable
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;
        reliable.send(&NetMsg::UdpHello { client_udp_port }).await?;

        let client_id = match reliable.recv().await? {
            NetMsg::Welcome { client_id } => client_id,
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };

        info!(client_id = ?client_id, "Connected to server");

        Ok(Self {
            client_id,
            state: LinkState::Connected,
            reliable,
            unreliable,
        })
    }

    /// Asks for the full snapshot. Only the first call per connection sends
    /// anything; returns whether a request went out.
    pub async fn request_snapshot(&mut self) -> anyhow::Result<bool> {
        if self.state != LinkState::Connected {
            return Ok(false);
        }
        self.reliable.send(&NetMsg::RequestSnapshot).await?;
        self.state = LinkState::Syncing;
        info!("Requested snapshot");
        Ok(true)
    }

    pub fn server_peer(&self) -> anyhow::Result<SocketAddr> {
        self.reliable.peer_addr()
    }

    /// Moves both channels into background tasks feeding `tx`.
    ///
    /// The returned task finishes when the reliable stream closes; the
    /// datagram task is stopped with it.
    pub fn spawn(self, tx: mpsc::Sender<SyncMsg>) -> JoinHandle<anyhow::Result<usize>> {
        let SyncLink {
            client_id,
            mut reliable,
            mut unreliable,
            ..
        } = self;
        tokio::spawn(async move {
            let udp_tx = tx.clone();
            let datagrams = tokio::spawn(async move { pump(&mut unreliable, &udp_tx).await });
            let result = pump(&mut reliable, &tx).await;
            datagrams.abort();
            info!(client_id = ?client_id, "Link closed");
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use sync_shared::{
        config::SyncConfig,
        entity::EntityId,
        net::{DespawnBatch, SnapshotMsg},
        render::HeadlessVisuals,
    };

    struct Scripted(VecDeque<SyncMsg>);

    #[async_trait]
    impl MessageSource for Scripted {
        async fn next_message(&mut self) -> anyhow::Result<Option<SyncMsg>> {
            Ok(self.0.pop_front())
        }
    }

    fn despawn(id: u64) -> SyncMsg {
        SyncMsg::Despawn {
            ids: DespawnBatch::One(id.into()),
        }
    }

    #[tokio::test]
    async fn pump_forwards_until_source_closes() {
        let mut source = Scripted(VecDeque::from(vec![
            SyncMsg::Snapshot(SnapshotMsg::default()),
            despawn(1),
            despawn(2),
        ]));
        let (tx, mut inbox) = inbox(8);
        let forwarded = pump(&mut source, &tx).await.unwrap();
        assert_eq!(forwarded, 3);
        drop(tx);

        let mut engine = SyncEngine::new(SyncConfig::default(), HeadlessVisuals::new());
        assert_eq!(inbox.drain_into(&mut engine, 0.0, 2), 2);
        assert!(!inbox.is_closed());
        assert_eq!(inbox.drain_into(&mut engine, 0.0, 10), 1);
        assert_eq!(inbox.drain_into(&mut engine, 0.0, 10), 0);
        assert!(inbox.is_closed());
        assert!(!engine.contains(EntityId(1)));
    }

    #[tokio::test]
    async fn pump_stops_when_inbox_is_dropped() {
        let mut source = Scripted(VecDeque::from(vec![despawn(1), despawn(2)]));
        let (tx, inbox) = inbox(4);
        drop(inbox);
        assert_eq!(pump(&mut source, &tx).await.unwrap(), 0);
    }
}
