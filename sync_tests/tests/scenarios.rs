//! End-to-end engine scenarios driven through wire messages.

use serde_json::json;
use sync_client::{PlayerId, RemovalReason, SyncEvent, VisualState};
use sync_shared::{config::SyncConfig, entity::EntityId, math::Vec3};
use sync_tests::{despawn, engine, engine_with, projectile_snapshot, run_frames, shared, snapshot, updates};

#[test]
fn projectile_dead_reckons_and_expires_without_server_help() {
    let mut e = engine();
    e.handle_message(
        projectile_snapshot(vec![json!({
            "id": 42, "origin": [0, 0, 0], "velocity": [10, 0, 0], "spawnTime": 0.0, "lifetime": 2.0
        })]),
        0.0,
    );
    e.frame(0.0);
    e.frame(1.0);
    assert_eq!(e.render_position(EntityId(42)), Some(Vec3::new(10.0, 0.0, 0.0)));
    assert_eq!(e.render_velocity(EntityId(42)), Some(Vec3::new(10.0, 0.0, 0.0)));

    e.frame(2.5);
    assert!(!e.contains(EntityId(42)));
    assert!(e.drain_events().contains(&SyncEvent::Removed {
        id: EntityId(42),
        reason: RemovalReason::LocalExpiry,
    }));
}

#[test]
fn update_before_spawn_is_applied_once_spawned() {
    let mut e = engine();
    e.handle_message(updates(vec![json!({ "id": 7, "position": [3, 0, 4] })]), 0.0);
    e.frame(0.0);
    assert!(e.is_buffered(EntityId(7)));
    assert!(!e.contains(EntityId(7)));

    e.handle_message(snapshot(false, vec![(7, json!({ "type": "enemy", "position": [0, 0, 0] }))]), 0.2);
    e.frame(0.2);
    assert_eq!(e.render_position(EntityId(7)), Some(Vec3::new(3.0, 0.0, 4.0)));
    assert_eq!(e.buffered_count(), 0);
    assert_eq!(e.stats().buffered_applied, 1);
}

#[test]
fn update_older_than_ttl_is_dropped() {
    let mut e = engine();
    e.handle_message(updates(vec![json!({ "id": 7, "position": [3, 0, 4] })]), 0.0);
    e.handle_message(snapshot(false, vec![(7, json!({ "type": "enemy", "position": [0, 0, 0] }))]), 0.9);
    e.frame(0.9);
    assert_eq!(e.render_position(EntityId(7)), Some(Vec3::ZERO));
    assert_eq!(e.stats().buffered_applied, 0);
}

#[test]
fn spawn_burst_is_spread_across_frames() {
    let mut e = engine();
    let spawns = (0..100)
        .map(|i| json!({ "id": i, "origin": [0, 0, 0], "velocity": [1, 0, 0], "lifetime": 30.0 }))
        .collect();
    e.handle_message(projectile_snapshot(spawns), 0.0);
    let mut per_frame = Vec::new();
    let mut now = 0.0;
    while e.queued_count() > 0 {
        let before = e.live_count();
        e.frame(now);
        per_frame.push(e.live_count() - before);
        now += 1.0 / 60.0;
    }
    assert_eq!(per_frame.len(), 7);
    assert!(per_frame.iter().all(|n| *n <= 15));
    assert_eq!(e.live_count(), 100);
}

#[test]
fn despawn_before_materialization_never_shows_anything() {
    let mut e = engine();
    e.handle_message(snapshot(false, vec![(5, json!({ "type": "enemy" }))]), 0.0);
    e.handle_message(despawn(&[5]), 0.0);
    run_frames(&mut e, 0.0, 1.0, 0.1);
    assert!(!e.contains(EntityId(5)));
    assert_eq!(e.backend().instance_count(), 0);
}

#[test]
fn pause_is_neutral_for_local_simulation() {
    let mut e = engine();
    e.handle_message(
        projectile_snapshot(vec![json!({
            "id": 1, "origin": [0, 0, 0], "velocity": [10, 0, 0], "spawnTime": 0.0, "lifetime": 2.0
        })]),
        0.0,
    );
    e.frame(0.0);
    e.frame(0.5);
    e.set_global_pause(true, 0.5);
    run_frames(&mut e, 1.0, 10.0, 0.5);
    assert_eq!(e.render_position(EntityId(1)), Some(Vec3::new(5.0, 0.0, 0.0)));

    e.set_global_pause(false, 10.5);
    e.frame(11.0);
    assert_eq!(e.render_position(EntityId(1)), Some(Vec3::new(10.0, 0.0, 0.0)));
    assert!(e.contains(EntityId(1)));
    e.frame(12.6);
    assert!(!e.contains(EntityId(1)));
}

#[test]
fn buffered_updates_survive_a_pause() {
    let mut e = engine();
    e.handle_message(updates(vec![json!({ "id": 9, "position": [2, 0, 0] })]), 0.0);
    e.set_global_pause(true, 0.1);
    run_frames(&mut e, 0.1, 5.0, 0.5);
    e.set_global_pause(false, 5.1);
    e.handle_message(snapshot(false, vec![(9, json!({ "type": "enemy" }))]), 5.2);
    e.frame(5.2);
    assert_eq!(e.render_position(EntityId(9)), Some(Vec3::new(2.0, 0.0, 0.0)));
}

#[test]
fn messages_received_while_paused_take_effect_from_resume() {
    let mut e = engine();
    e.handle_message(snapshot(false, vec![(1, json!({ "type": "enemy", "position": [0, 0, 0] }))]), 0.0);
    run_frames(&mut e, 0.0, 1.0, 0.1);
    e.set_global_pause(true, 1.0);
    run_frames(&mut e, 1.0, 5.0, 0.5);

    e.handle_message(updates(vec![json!({ "id": 1, "position": [2, 0, 0] })]), 5.0);
    e.handle_message(
        projectile_snapshot(vec![json!({ "id": 2, "origin": [0, 0, 0], "velocity": [10, 0, 0], "lifetime": 2.0 })]),
        5.0,
    );
    run_frames(&mut e, 5.5, 9.5, 0.5);
    assert_eq!(e.render_position(EntityId(1)), Some(Vec3::ZERO));
    assert!(e.is_queued(EntityId(2)));

    e.set_global_pause(false, 10.0);
    e.frame(10.0);
    e.frame(10.5);
    assert_eq!(e.render_position(EntityId(1)), Some(Vec3::new(2.0, 0.0, 0.0)));
    e.frame(11.0);
    // local simulation starts at the resume time, not the arrival time
    assert_eq!(e.render_position(EntityId(2)), Some(Vec3::new(10.0, 0.0, 0.0)));
}

#[test]
fn death_fade_runs_during_pause_behind_a_fade_backlog() {
    let cfg = SyncConfig {
        spawn_budget_per_frame: 2000,
        ..SyncConfig::default()
    };
    let mut e = engine_with(cfg);
    let mut entities: Vec<_> = (0..1000).map(|i| (i, json!({ "type": "enemy" }))).collect();
    entities.push((5000, json!({ "type": "enemy" })));
    e.handle_message(snapshot(false, entities), 0.0);
    e.frame(0.0);
    assert_eq!(e.live_count(), 1001);

    e.handle_message(despawn(&[5000]), 0.0);
    e.set_global_pause(true, 0.0);
    run_frames(&mut e, 0.05, 3.0, 0.05);

    assert!(!e.contains(EntityId(5000)));
    assert_eq!(e.stats().watchdog_cleanups, 0);
    // spawn fade-ins stay held until resume
    assert!(e.pending_fade_ops() > 0);
    assert_eq!(e.live_count(), 1000);
}

#[test]
fn player_pause_keeps_entities_animating() {
    let mut e = engine();
    e.handle_message(
        projectile_snapshot(vec![json!({ "id": 1, "origin": [0, 0, 0], "velocity": [1, 0, 0], "spawnTime": 0.0 })]),
        0.0,
    );
    e.set_player_pause(PlayerId(2), true);
    e.frame(0.0);
    e.frame(1.0);
    assert!(!e.is_paused());
    assert_eq!(e.render_position(EntityId(1)), Some(Vec3::new(1.0, 0.0, 0.0)));
}

#[test]
fn death_sequence_finishes_during_global_pause() {
    let mut e = engine();
    e.handle_message(snapshot(false, vec![(3, json!({ "type": "enemy", "position": [1, 0, 0] }))]), 0.0);
    run_frames(&mut e, 0.0, 0.5, 0.1);
    assert_eq!(e.visual_state(EntityId(3)), Some(VisualState::Visible));

    e.handle_message(despawn(&[3]), 1.0);
    e.set_global_pause(true, 1.0);
    run_frames(&mut e, 1.0, 3.0, 0.05);
    assert!(!e.contains(EntityId(3)));
    assert_eq!(e.stats().watchdog_cleanups, 0);
}

#[test]
fn large_corrections_snap_small_ones_glide() {
    let mut e = engine();
    e.handle_message(snapshot(false, vec![(1, json!({ "type": "enemy", "position": [0, 0, 0] }))]), 0.0);
    e.frame(0.0);

    e.handle_message(updates(vec![json!({ "id": 1, "position": [2, 0, 0] })]), 1.0);
    e.frame(1.0);
    assert_eq!(e.render_position(EntityId(1)), Some(Vec3::ZERO));
    e.frame(1.3);
    assert_eq!(e.render_position(EntityId(1)), Some(Vec3::new(2.0, 0.0, 0.0)));

    e.handle_message(updates(vec![json!({ "id": 1, "position": [80, 0, 0] })]), 2.0);
    e.frame(2.0);
    assert_eq!(e.render_position(EntityId(1)), Some(Vec3::new(80.0, 0.0, 0.0)));
    assert_eq!(e.stats().hard_snaps, 1);
}

#[test]
fn shared_archetype_selects_template() {
    let mut e = engine();
    e.backend_mut().register_template("brute", &[1.0]);
    e.handle_message(shared("Archetype", vec![(3, json!({ "model": "brute" }))]), 0.0);
    e.handle_message(snapshot(false, vec![(1, json!({ "type": "enemy", "archetype": 3 }))]), 0.0);
    e.frame(0.0);
    let templates: Vec<_> = e
        .backend()
        .active_instances()
        .map(|(_, inst)| inst.template.clone())
        .collect();
    assert_eq!(templates, vec!["brute".to_string()]);
}

#[test]
fn fade_ops_are_bounded_per_frame() {
    let cfg = SyncConfig {
        spawn_budget_per_frame: 1000,
        ..SyncConfig::default()
    };
    let mut e = engine_with(cfg);
    let entities = (0..1000).map(|i| (i, json!({ "type": "enemy" }))).collect();
    e.handle_message(snapshot(false, entities), 0.0);
    e.frame(0.0);
    assert_eq!(e.live_count(), 1000);
    // two parts per instance
    assert_eq!(e.stats().fade_ops_executed, 750);
    assert_eq!(e.pending_fade_ops(), 1250);
    e.frame(0.016);
    assert_eq!(e.stats().fade_ops_executed, 1500);
}

#[test]
fn released_instances_are_reused_by_later_spawns() {
    let mut e = engine();
    e.handle_message(snapshot(false, vec![(1, json!({ "type": "enemy" }))]), 0.0);
    e.frame(0.0);
    assert!(e.force_remove(EntityId(1)));
    e.handle_message(snapshot(false, vec![(2, json!({ "type": "enemy" }))]), 0.1);
    e.frame(0.1);
    assert_eq!(e.stats().pool_reuses, 1);
    assert_eq!(e.backend().counters.instantiated, 1);
}
