//! Fixtures shared by the integration tests: message builders, a headless
//! engine factory, and a loopback feed server speaking the link protocol.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use anyhow::Context;
use serde_json::{Map, Value};
use sync_client::SyncEngine;
use sync_shared::{
    config::SyncConfig,
    entity::EntityKind,
    net::{
        encode_to_bytes, ClientId, DespawnBatch, NetMsg, ReliableConn, ReliableListener, SnapshotMsg, SyncMsg,
        UpdateBatch, PROTOCOL_VERSION,
    },
    render::HeadlessVisuals,
};
use tokio::net::UdpSocket;
use tracing::info;

/// Backend with every kind's default template loaded.
pub fn headless() -> HeadlessVisuals {
    let mut backend = HeadlessVisuals::new();
    for kind in [
        EntityKind::Enemy,
        EntityKind::Projectile,
        EntityKind::ExpOrb,
        EntityKind::Powerup,
        EntityKind::Clone,
    ] {
        backend.register_template(kind.default_template(), &[1.0, 0.6]);
    }
    backend
}

pub fn engine() -> SyncEngine<HeadlessVisuals> {
    SyncEngine::new(SyncConfig::default(), headless())
}

pub fn engine_with(cfg: SyncConfig) -> SyncEngine<HeadlessVisuals> {
    SyncEngine::new(cfg, headless())
}

/// Runs frames from `from` to `to` (inclusive of `from`) at `dt` steps.
/// Returns the time of the last frame.
pub fn run_frames(engine: &mut SyncEngine<HeadlessVisuals>, from: f64, to: f64, dt: f64) -> f64 {
    let mut now = from;
    let mut last = from;
    while now <= to + 1e-9 {
        engine.frame(now);
        last = now;
        now += dt;
    }
    last
}

/// The object inside `v`, or an empty map.
pub fn payload(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Snapshot whose `entities` are keyed by id.
pub fn snapshot(is_initial: bool, entities: Vec<(u64, Value)>) -> SyncMsg {
    SyncMsg::Snapshot(SnapshotMsg {
        entities: entities.into_iter().map(|(id, v)| (id.to_string(), v)).collect(),
        is_initial,
        ..Default::default()
    })
}

/// Snapshot carrying inline projectile spawns.
pub fn projectile_snapshot(spawns: Vec<Value>) -> SyncMsg {
    SyncMsg::Snapshot(SnapshotMsg {
        projectile_spawns: spawns,
        ..Default::default()
    })
}

/// Update batch with verbose updates only.
pub fn updates(items: Vec<Value>) -> SyncMsg {
    SyncMsg::Update(UpdateBatch {
        updates: items,
        ..Default::default()
    })
}

/// Update batch publishing one shared table.
pub fn shared(class: &str, entries: Vec<(u64, Value)>) -> SyncMsg {
    let table: BTreeMap<String, Value> = entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    SyncMsg::Update(UpdateBatch {
        shared: BTreeMap::from([(class.to_string(), table)]),
        ..Default::default()
    })
}

pub fn despawn(ids: &[u64]) -> SyncMsg {
    SyncMsg::Despawn {
        ids: DespawnBatch::Many(ids.iter().map(|id| Value::from(*id)).collect()),
    }
}

/// Loopback server speaking the link protocol. The TCP listener and the UDP
/// socket share one port, as the client expects.
pub struct FeedServer {
    listener: ReliableListener,
    udp: Arc<UdpSocket>,
}

impl FeedServer {
    pub async fn bind() -> anyhow::Result<Self> {
        let listener = ReliableListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = listener.local_addr()?;
        let udp = UdpSocket::bind(addr).await.context("udp bind")?;
        Ok(Self {
            listener,
            udp: Arc::new(udp),
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one client and completes the handshake.
    pub async fn accept(&self) -> anyhow::Result<FeedSession> {
        let (mut conn, peer) = self.listener.accept().await?;
        match conn.recv().await? {
            NetMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {}
            other => anyhow::bail!("expected Hello, got {other:?}"),
        }
        let port = match conn.recv().await? {
            NetMsg::UdpHello { client_udp_port } => client_udp_port,
            other => anyhow::bail!("expected UdpHello, got {other:?}"),
        };
        let client_id = ClientId::new_unique();
        conn.send(&NetMsg::Welcome { client_id }).await?;
        info!(client_id = ?client_id, peer = %peer, "Feed client joined");
        Ok(FeedSession {
            conn,
            udp: Arc::clone(&self.udp),
            client_udp: SocketAddr::new(peer.ip(), port),
            snapshot_requests: 0,
        })
    }
}

pub struct FeedSession {
    conn: ReliableConn,
    udp: Arc<UdpSocket>,
    client_udp: SocketAddr,
    pub snapshot_requests: u32,
}

impl FeedSession {
    /// Waits for the client's snapshot request.
    pub async fn expect_snapshot_request(&mut self) -> anyhow::Result<()> {
        loop {
            if let NetMsg::RequestSnapshot = self.conn.recv().await? {
                self.snapshot_requests += 1;
                return Ok(());
            }
        }
    }

    pub async fn send_reliable(&mut self, msg: SyncMsg) -> anyhow::Result<()> {
        self.conn.send(&NetMsg::Sync(msg)).await
    }

    pub async fn send_datagram(&self, msg: SyncMsg) -> anyhow::Result<()> {
        let bytes = encode_to_bytes(&NetMsg::Sync(msg))?;
        self.udp.send_to(&bytes, self.client_udp).await.context("udp send")?;
        Ok(())
    }

    pub async fn send_raw_datagram(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.udp.send_to(bytes, self.client_udp).await.context("udp send")?;
        Ok(())
    }

    pub async fn disconnect(mut self, reason: &str) -> anyhow::Result<()> {
        self.conn
            .send(&NetMsg::Disconnect {
                reason: reason.to_string(),
            })
            .await
    }
}
