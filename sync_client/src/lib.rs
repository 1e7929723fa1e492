//! `sync_client`
//!
//! Client-side entity synchronization:
//! - Shared component cache for deduplicated payload data
//! - Throttled spawn queue and update buffer for out-of-order arrival
//! - Interpolation and local simulation of entity motion
//! - Visual lifecycle (spawn fade, distance culling, hit flash, death fade)
//!   driven through a budgeted fade-op queue
//! - Pause compensation and per-template model pooling
//! - Server link feeding an inbox drained by the frame loop

pub mod engine;
pub mod fade;
pub mod interp;
pub mod lifecycle;
pub mod link;
pub mod pause;
pub mod pool;
pub mod record;
pub mod shared_cache;
pub mod spawn_queue;
pub mod stats;
pub mod update_buffer;

pub use engine::{RemovalReason, SyncEngine, SyncEvent};
pub use link::{inbox, Inbox, LinkState, MessageSource, SyncLink};
pub use pause::PlayerId;
pub use record::VisualState;
pub use spawn_queue::SpawnOutcome;
pub use stats::SyncStats;
