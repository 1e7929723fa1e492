//! `sync_shared`
//!
//! Shared vocabulary for client-side entity synchronization.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Tolerant decoding: malformed payload fields degrade, never reject.
//! - Traits at the renderer seam so the engine runs headless.
//! - No `unsafe`.

pub mod config;
pub mod entity;
pub mod math;
pub mod net;
pub mod render;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::entity::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::render::*;
}
