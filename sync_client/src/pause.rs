//! Pause compensation.
//!
//! While the game is globally paused the frame loop only advances work that
//! must finish (death sequences). On resume every stored absolute timestamp is
//! shifted forward by the pause length, so "elapsed since X" computations come
//! out as if the pause never happened. Timestamps taken during the pause (a
//! message still arrives while paused) are moved to the resume time instead.
//!
//! Per-player pauses are tracked but never suppress the engine; other players'
//! entities keep animating.

use std::collections::BTreeSet;

use tracing::info;

/// Stores holding absolute timestamps implement this to be pause-neutral.
pub trait TimeShift {
    fn shift_time(&mut self, span: &PauseSpan);
}

/// A completed global pause `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PauseSpan {
    pub from: f64,
    pub to: f64,
}

impl PauseSpan {
    pub fn duration(&self) -> f64 {
        (self.to - self.from).max(0.0)
    }

    /// How far a timestamp moves on resume: the full pause length for stamps
    /// taken before it, up to the resume time for stamps taken during it.
    ///
    /// Intervals shift as a whole by the offset of their start.
    pub fn offset(&self, stamp: f64) -> f64 {
        (self.to - stamp.max(self.from)).max(0.0)
    }
}

/// Identifies a player for individual pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlayerId(pub u32);

#[derive(Debug, Default)]
pub struct PauseCompensator {
    paused_at: Option<f64>,
    paused_players: BTreeSet<PlayerId>,
}

impl PauseCompensator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Starts a global pause. Returns false if already paused.
    pub fn pause(&mut self, now: f64) -> bool {
        if self.paused_at.is_some() {
            return false;
        }
        self.paused_at = Some(now);
        info!(at = now, "Global pause");
        true
    }

    /// Ends a global pause, returning the span it covered.
    pub fn resume(&mut self, now: f64) -> Option<PauseSpan> {
        let from = self.paused_at.take()?;
        let span = PauseSpan {
            from,
            to: now.max(from),
        };
        info!(duration = span.duration(), "Global resume");
        Some(span)
    }

    /// Records an individual player's pause. Has no effect on the frame loop.
    pub fn set_player_paused(&mut self, player: PlayerId, paused: bool) {
        if paused {
            self.paused_players.insert(player);
        } else {
            self.paused_players.remove(&player);
        }
    }

    pub fn is_player_paused(&self, player: PlayerId) -> bool {
        self.paused_players.contains(&player)
    }
}
