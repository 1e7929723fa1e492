//! Networking primitives.
//!
//! Goals:
//! - Provide a simple reliable (TCP) and unreliable (UDP) channel.
//! - Provide the snapshot / update / despawn messages the sync engine consumes.
//! - Keep serialization explicit and versionable.
//!
//! Entity payloads inside sync messages stay as raw JSON values. The engine
//! decodes them field by field so one malformed entry never rejects a batch.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
};

use anyhow::{bail, Context};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time,
};
use tracing::warn;

use crate::entity::EntityId;

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Upper bound for one reliable frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const MAX_DATAGRAM_LEN: usize = 64 * 1024;

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn new_unique() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shared component tables: class name -> key -> immutable payload.
///
/// Keys are strings on the wire (JSON object keys) and parsed by the cache.
pub type SharedTables = BTreeMap<String, BTreeMap<String, Value>>;

/// Full state transfer, requested once per (re)connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotMsg {
    pub shared: SharedTables,
    /// Spawn payloads keyed by entity id.
    pub entities: BTreeMap<String, Value>,
    /// Spawn payloads carrying their own `id` field.
    pub projectile_spawns: Vec<Value>,
    pub orb_spawns: Vec<Value>,
    pub is_initial: bool,
}

/// Incremental changes since the previous batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateBatch {
    pub shared: SharedTables,
    /// Newly appeared entities, keyed by id.
    pub entities: BTreeMap<String, Value>,
    /// Compact rows `[id, px, py, pz, vx, vy, vz]`.
    pub projectiles: Vec<Value>,
    /// Compact rows `[id, px, py, pz, vx, vy, vz, (fx, fy, fz)]`.
    pub enemies: Vec<Value>,
    /// Verbose updates `{ id, ...fields }`.
    pub updates: Vec<Value>,
    /// Verbose updates that always teleport.
    pub resyncs: Vec<Value>,
    pub despawns: Vec<Value>,
}

/// A despawn batch: a list of ids or a single id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DespawnBatch {
    Many(Vec<Value>),
    One(Value),
}

impl DespawnBatch {
    /// Valid ids in the batch; malformed entries are skipped.
    pub fn ids(&self) -> Vec<EntityId> {
        match self {
            DespawnBatch::Many(values) => values.iter().filter_map(EntityId::from_value).collect(),
            DespawnBatch::One(value) => EntityId::from_value(value).into_iter().collect(),
        }
    }
}

/// Messages consumed by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncMsg {
    Snapshot(SnapshotMsg),
    Update(UpdateBatch),
    Despawn { ids: DespawnBatch },
}

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
    },
    /// Client announces its UDP port to the server.
    UdpHello {
        client_udp_port: u16,
    },
    Welcome {
        client_id: ClientId,
    },

    // ─── Entity sync ───
    /// Client asks for the full snapshot. Sent once per connection.
    RequestSnapshot,
    Sync(SyncMsg),

    // ─── Disconnect ───
    Disconnect {
        reason: String,
    },
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize msg")?;
        if payload.len() > MAX_FRAME_LEN {
            bail!("frame of {} bytes exceeds limit", payload.len());
        }
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .context("tcp read len")?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            warn!(len, "Oversized frame announced, dropping connection");
            bail!("peer announced {len} byte frame");
        }
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .context("tcp read payload")?;
        let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
        Ok(msg)
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send(&self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = encode_to_bytes(msg)?;
        self.socket.send(&payload).await.context("udp send")?;
        Ok(())
    }

    pub async fn recv(&self) -> anyhow::Result<NetMsg> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let n = self.socket.recv(&mut buf).await.context("udp recv")?;
        decode_from_bytes(&buf[..n])
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        match time::timeout(timeout, self.recv()).await {
            Ok(msg) => msg.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP listener, used by feed servers and tests.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}
