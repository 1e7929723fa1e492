//! Headless sync viewer.
//!
//! Usage:
//!   cargo run -p sync_client --bin sync_viewer -- [--addr 127.0.0.1:40000]
//!     [--config client.json] [--render-hz 60] [--name Player]
//!     [--template <name>]...
//!
//! Connects to a feed server, requests the snapshot once and drives the sync
//! engine against the in-memory backend at the configured frame rate,
//! logging engine counters periodically.

use std::env;
use std::time::{Duration, Instant};

use anyhow::Context;
use sync_client::{inbox, SyncEngine, SyncLink};
use sync_shared::{config::ClientConfig, entity::EntityKind, render::HeadlessVisuals};
use tracing::{info, warn};

/// Messages applied per frame at most; the rest wait for the next frame.
const MAX_MESSAGES_PER_FRAME: usize = 64;

struct Args {
    cfg: ClientConfig,
    templates: Vec<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();

    // The config file is the base layer; flags override it.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = &args[i + 1];
            let text = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
            ClientConfig::from_json_str(&text).with_context(|| format!("parse config {path}"))?
        }
        _ => ClientConfig::default(),
    };
    let mut templates = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--render-hz" if i + 1 < args.len() => {
                cfg.render_hz = args[i + 1].parse().context("parse --render-hz")?;
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--template" if i + 1 < args.len() => {
                templates.push(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(Args { cfg, templates })
}

fn headless_backend(extra: &[String]) -> HeadlessVisuals {
    let mut backend = HeadlessVisuals::new();
    let kinds = [
        EntityKind::Enemy,
        EntityKind::Projectile,
        EntityKind::ExpOrb,
        EntityKind::Powerup,
        EntityKind::Clone,
        EntityKind::Unknown,
    ];
    for kind in kinds {
        backend.register_template(kind.default_template(), &[1.0]);
    }
    for name in extra {
        backend.register_template(name, &[1.0]);
    }
    backend
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let Args { cfg, templates } = parse_args()?;
    info!(server = %cfg.server_addr, render_hz = cfg.render_hz, "Starting viewer");

    let mut link = SyncLink::connect(&cfg).await.context("connect")?;
    link.request_snapshot().await?;

    let (tx, mut inbox) = inbox(1024);
    let link_task = link.spawn(tx);

    let mut engine = SyncEngine::new(cfg.sync.clone(), headless_backend(&templates));
    let frame_interval = Duration::from_secs_f64(1.0 / f64::from(cfg.render_hz.max(1)));
    let started = Instant::now();
    let mut last_report = 0.0;

    loop {
        let now = started.elapsed().as_secs_f64();
        inbox.drain_into(&mut engine, now, MAX_MESSAGES_PER_FRAME);
        engine.frame(now);

        if now - last_report >= 5.0 {
            last_report = now;
            let stats = engine.stats();
            info!(
                live = engine.live_count(),
                queued = engine.queued_count(),
                buffered = engine.buffered_count(),
                spawned = stats.spawns_materialized,
                removed = stats.removals,
                snaps = stats.hard_snaps,
                "Sync status"
            );
        }

        if inbox.is_closed() {
            info!("Server link closed");
            break;
        }
        tokio::time::sleep(frame_interval).await;
    }

    match link_task.await {
        Ok(Ok(forwarded)) => info!(forwarded, "Link finished"),
        Ok(Err(e)) => warn!(error = %e, "Link failed"),
        Err(e) => warn!(error = %e, "Link task panicked"),
    }
    let stats = serde_json::to_string(&engine.stats()).context("serialize stats")?;
    info!(stats = %stats, "Final counters");
    engine.shutdown();
    Ok(())
}
