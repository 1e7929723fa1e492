//! Socket-based integration: feed server -> link -> inbox -> engine.

use std::time::{Duration, Instant};

use serde_json::json;
use sync_client::{inbox, LinkState, SyncLink};
use sync_shared::{config::ClientConfig, entity::EntityId, math::Vec3};
use sync_tests::{despawn, engine, snapshot, updates, FeedServer};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_then_datagrams_reach_the_engine() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let server = FeedServer::bind().await?;
    let cfg = ClientConfig {
        server_addr: server.addr()?.to_string(),
        ..ClientConfig::default()
    };

    let server_handle = tokio::spawn(async move {
        let mut session = server.accept().await?;
        session.expect_snapshot_request().await?;
        session
            .send_reliable(snapshot(
                true,
                vec![
                    (1, json!({ "type": "enemy", "position": [0, 0, 0] })),
                    (2, json!({ "type": "enemy", "position": [5, 0, 0] })),
                ],
            ))
            .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.send_raw_datagram(b"not json").await?;
        session
            .send_datagram(updates(vec![json!({ "id": 1, "resync": true, "position": [40, 0, 0] })]))
            .await?;
        session.send_datagram(despawn(&[2])).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let requests = session.snapshot_requests;
        session.disconnect("test over").await?;
        Ok::<_, anyhow::Error>(requests)
    });

    let mut link = SyncLink::connect(&cfg).await?;
    assert_eq!(link.state, LinkState::Connected);
    assert!(link.request_snapshot().await?);
    assert!(!link.request_snapshot().await?);
    assert_eq!(link.state, LinkState::Syncing);

    let (tx, mut inbox) = inbox(64);
    let link_task = link.spawn(tx);

    let mut engine = engine();
    let started = Instant::now();
    let mut now = 0.0;
    while !inbox.is_closed() && started.elapsed() < Duration::from_secs(5) {
        inbox.drain_into(&mut engine, now, 16);
        engine.frame(now);
        now += 0.02;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(inbox.is_closed(), "link did not close");
    // let the despawned entity finish dying
    for _ in 0..100 {
        engine.frame(now);
        now += 0.02;
    }

    let forwarded = link_task.await??;
    assert_eq!(forwarded, 1, "only the snapshot travels over the reliable stream");
    assert_eq!(server_handle.await??, 1);

    assert!(engine.contains(EntityId(1)));
    assert!(!engine.contains(EntityId(2)));
    let pos = engine.render_position(EntityId(1)).unwrap_or(Vec3::ZERO);
    assert!((pos.x - 40.0).abs() < 1e-4, "got {pos:?}");
    assert!(engine.extension(EntityId(1), "resync").is_some());
    Ok(())
}
