//! Process-wide constants. No configuration-file layer — nothing here
//! is meant to be reloaded at runtime (see DESIGN.md on live reconfiguration).

use std::time::Duration;

/// Default starting rating for a newly-seen player.
pub const DEFAULT_ELO: i32 = 1500;

/// Elo K-factor used by [`crate::player_store`] rating updates.
pub const ELO_K_FACTOR: f64 = 30.0;

/// Clamp bounds for [`crate::player_store::level_of`].
pub const MIN_LEVEL: i32 = 1;
pub const MAX_LEVEL: i32 = 20;

/// Matchmaker scan period.
pub const MATCHMAKER_PERIOD: Duration = Duration::from_secs(5);

/// Clock ticker period.
pub const CLOCK_TICK_PERIOD: Duration = Duration::from_secs(1);

/// How long a waiting client tolerates before a bot opponent is synthesised.
pub const BOT_WAIT_TIME: Duration = Duration::from_secs(15);

/// Skill-band tolerance widening: initial value, per-step increment, and cap.
pub const TOLERANCE_INIT: i32 = 1;
pub const TOLERANCE_STEP: i32 = 1;
pub const TOLERANCE_STEP_PERIOD: Duration = Duration::from_secs(5);
pub const TOLERANCE_MAX: i32 = 4;

/// Bounded engine pool capacity.
pub const ENGINE_POOL_CAPACITY: usize = 5;

/// Time budget handed to the native engine for each bot move.
pub const ENGINE_MOVE_TIME: Duration = Duration::from_secs(1);

/// Bot opponent rating jitter range, applied to the waiting player's own Elo.
pub const BOT_ELO_JITTER: i32 = 100;

/// Prefix marking a session id as a synthetic bot seat rather than a human client.
pub const BOT_SID_PREFIX: &str = "bot_";

/// `(total_seconds, increment_seconds)` time controls selectable at match time.
pub const TIME_CONTROLS: &[(f64, f64)] = &[
    (300.0, 2.0),
    (600.0, 0.0),
    (900.0, 10.0),
    (1800.0, 15.0),
];

pub const DEFAULT_TIME_CONTROL_INDEX: usize = 0;

/// Names drawn from when a synthetic bot opponent needs a display name.
pub const BOT_NAME_POOL: &[&str] = &[
    "Bishop Takes", "Rook Novice", "Endgame Otto", "Zwischenzug",
    "Fianchetto Fred", "Castling Clara", "Pawn Storm", "Zugzwang Zoe",
];
