//! Configuration system.
//!
//! Loads sync configuration from JSON strings (file IO left to app).
//! Every field has a default so partial configs are valid.

use serde::{Deserialize, Serialize};

/// Tunables for the synchronization engine. Times are in seconds,
/// distances in world units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Spawn queue entries materialized per frame.
    pub spawn_budget_per_frame: usize,
    /// Consumed head entries tolerated before the spawn queue is compacted.
    pub spawn_compact_threshold: usize,

    /// How long an update for an unknown entity is kept.
    pub update_ttl: f64,
    /// Maximum number of buffered updates.
    pub update_buffer_cap: usize,
    /// Minimum time between expired-update sweeps.
    pub update_sweep_interval: f64,

    pub projectile_interp_window: f64,
    pub fast_enemy_interp_window: f64,
    pub default_interp_window: f64,
    /// Horizontal speed above which an enemy uses the fast window.
    pub fast_enemy_speed: f32,
    /// Positional error beyond which an update teleports instead of interpolating.
    pub hard_snap_distance: f32,
    /// Lifetime for locally simulated entities that do not send one.
    pub default_local_lifetime: f64,

    pub spawn_fade_duration: f64,
    /// Spawns farther than this from the camera start faded out.
    pub near_cull_edge: f32,
    pub cull_radius: f32,
    pub cull_fade_duration: f64,
    pub hit_flash_duration: f64,
    /// Delay between the end of the hit flash and the death fade.
    pub death_buffer_delay: f64,
    pub death_fade_duration: f64,
    /// Grace period after a death fade should have finished before cleanup is forced.
    pub watchdog_slack: f64,
    /// Primitive fade ops executed per frame.
    pub fade_op_budget: usize,

    /// Idle instances kept per template.
    pub pool_cap_per_template: usize,
    /// Interpolated records with no update for this long are removed. `None` disables.
    pub stale_after: Option<f64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            spawn_budget_per_frame: 15,
            spawn_compact_threshold: 64,
            update_ttl: 0.75,
            update_buffer_cap: 512,
            update_sweep_interval: 0.25,
            projectile_interp_window: 0.03,
            fast_enemy_interp_window: 0.05,
            default_interp_window: 0.25,
            fast_enemy_speed: 14.0,
            hard_snap_distance: 12.0,
            default_local_lifetime: 10.0,
            spawn_fade_duration: 0.3,
            near_cull_edge: 180.0,
            cull_radius: 200.0,
            cull_fade_duration: 0.4,
            hit_flash_duration: 0.1,
            death_buffer_delay: 0.15,
            death_fade_duration: 0.35,
            watchdog_slack: 1.0,
            fade_op_budget: 750,
            pool_cap_per_template: 64,
            stale_after: Some(30.0),
        }
    }
}

impl SyncConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Configuration for the viewer binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Frames per second driven through the engine.
    #[serde(default = "default_render_hz")]
    pub render_hz: u32,
    #[serde(default = "default_player_name")]
    pub player_name: String,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_render_hz() -> u32 {
    60
}

fn default_player_name() -> String {
    "Player".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            render_hz: default_render_hz(),
            player_name: default_player_name(),
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_sync_config_keeps_defaults() {
        let cfg = SyncConfig::from_json_str(r#"{ "spawn_budget_per_frame": 4, "stale_after": null }"#).unwrap();
        assert_eq!(cfg.spawn_budget_per_frame, 4);
        assert_eq!(cfg.stale_after, None);
        assert_eq!(cfg.fade_op_budget, 750);
        assert_eq!(cfg.update_ttl, 0.75);
    }

    #[test]
    fn client_config_nests_sync() {
        let cfg = ClientConfig::from_json_str(
            r#"{ "server_addr": "10.0.0.2:40000", "sync": { "cull_radius": 50.0 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.render_hz, 60);
        assert_eq!(cfg.sync.cull_radius, 50.0);
        assert_eq!(cfg.sync.spawn_budget_per_frame, 15);
    }
}
