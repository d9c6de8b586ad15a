//! Player Store (§4.2): maps a persistent `pid` to `{pid, name, elo}`,
//! write-through to a `PersistenceStore`, cached in memory by session
//! id. Grounded on `player.py` / `elo.py` from the original source,
//! with the two bugs called out in spec §9 fixed: `level_of` uses a
//! correct clamp (not the inverted `max(min(x,1),20)` seen in one
//! draft) and `apply_rating` computes both new ratings from the
//! pre-game values before writing either one back.

use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_ELO, ELO_K_FACTOR, MAX_LEVEL, MIN_LEVEL};
use crate::error::PersistenceResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub pid: String,
    pub name: String,
    pub elo: i32,
}

/// The persistence adapter is an external collaborator (§1, §6):
/// `find_one_by_pid`, `upsert`, `delete_by_pid`. This crate ships only
/// an in-memory stand-in; a real document-store client lives outside
/// this crate's scope.
pub trait PersistenceStore: Send + Sync {
    fn find_one_by_pid(&self, pid: &str) -> PersistenceResult<Option<PlayerRecord>>;
    fn upsert(&self, record: PlayerRecord) -> PersistenceResult<()>;
    fn delete_by_pid(&self, pid: &str) -> PersistenceResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, PlayerRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceStore for MemoryStore {
    fn find_one_by_pid(&self, pid: &str) -> PersistenceResult<Option<PlayerRecord>> {
        Ok(self.records.get(pid).map(|r| r.clone()))
    }

    fn upsert(&self, record: PlayerRecord) -> PersistenceResult<()> {
        self.records.insert(record.pid.clone(), record);
        Ok(())
    }

    fn delete_by_pid(&self, pid: &str) -> PersistenceResult<()> {
        self.records.remove(pid);
        Ok(())
    }
}

/// `clamp(floor((elo - 1000) / 100), 1, 20)`. Monotone non-decreasing
/// in `elo`, bounded to `[1, 20]` by construction.
pub fn level_of(elo: i32) -> i32 {
    let raw = (elo - 1000).div_euclid(100);
    raw.clamp(MIN_LEVEL, MAX_LEVEL)
}

/// Elo K=30 expected-score update. Computed from pre-game ratings only
/// — callers must not feed in an already-mutated rating for either
/// side (see [`apply_rating`]).
pub fn calc_elo(my_elo: i32, opp_elo: i32, result: f64, k: f64) -> i32 {
    let expected = 1.0 / (1.0 + 10f64.powf((opp_elo - my_elo) as f64 / 400.0));
    (my_elo as f64 + k * (result - expected)).round() as i32
}

pub struct PlayerStore {
    persistence: Box<dyn PersistenceStore>,
    /// sid -> (pid, name), set by `join`.
    registrations: DashMap<String, (String, String)>,
    /// sid -> cached record.
    cache: DashMap<String, PlayerRecord>,
}

impl PlayerStore {
    pub fn new(persistence: Box<dyn PersistenceStore>) -> Self {
        Self {
            persistence,
            registrations: DashMap::new(),
            cache: DashMap::new(),
        }
    }

    /// Bind a session to a (pid, name) pair, as established by a
    /// `join` event (§4.8). Does not itself touch the persistence
    /// layer — that happens lazily on first [`resolve`].
    pub fn register_session(&self, sid: &str, pid: &str, name: &str) {
        self.registrations
            .insert(sid.to_string(), (pid.to_string(), name.to_string()));
    }

    pub fn forget_session(&self, sid: &str) {
        self.registrations.remove(sid);
        self.cache.remove(sid);
    }

    /// Resolve a session to its player record, creating one with the
    /// default rating on first sight.
    pub fn resolve(&self, sid: &str) -> Option<PlayerRecord> {
        if let Some(cached) = self.cache.get(sid) {
            return Some(cached.clone());
        }

        let (pid, name) = self.registrations.get(sid)?.clone();

        let record = match self.persistence.find_one_by_pid(&pid) {
            Ok(Some(record)) => record,
            Ok(None) => {
                let fresh = PlayerRecord {
                    pid: pid.clone(),
                    name,
                    elo: DEFAULT_ELO,
                };
                if let Err(e) = self.persistence.upsert(fresh.clone()) {
                    warn!("failed to persist new player {pid}: {e}");
                }
                fresh
            }
            Err(e) => {
                warn!("persistence lookup failed for {pid}, using default rating: {e}");
                PlayerRecord {
                    pid: pid.clone(),
                    name,
                    elo: DEFAULT_ELO,
                }
            }
        };

        self.cache.insert(sid.to_string(), record.clone());
        Some(record)
    }

    pub fn level_of_sid(&self, sid: &str) -> Option<i32> {
        self.resolve(sid).map(|r| level_of(r.elo))
    }

    /// Apply a game result to both sides. `score` is the winner's
    /// score from the winner's perspective (`1.0` win, `0.5` draw);
    /// the loser receives `1.0 - score`. Both new ratings are computed
    /// from the pre-game values before either is written — fixes the
    /// source bug where the second computation used the first side's
    /// already-mutated rating.
    pub fn apply_rating(&self, winner_sid: &str, loser_sid: &str, score: f64) {
        let (Some(winner), Some(loser)) = (self.resolve(winner_sid), self.resolve(loser_sid)) else {
            warn!("cannot apply rating: one or both sessions unresolved");
            return;
        };

        let new_winner_elo = calc_elo(winner.elo, loser.elo, score, ELO_K_FACTOR);
        let new_loser_elo = calc_elo(loser.elo, winner.elo, 1.0 - score, ELO_K_FACTOR);

        let updated_winner = PlayerRecord {
            elo: new_winner_elo,
            ..winner
        };
        let updated_loser = PlayerRecord {
            elo: new_loser_elo,
            ..loser
        };

        debug!(
            "rating update: {} {} -> {}, {} {} -> {}",
            updated_winner.pid,
            winner.elo,
            new_winner_elo,
            updated_loser.pid,
            loser.elo,
            new_loser_elo
        );

        if let Err(e) = self.persistence.upsert(updated_winner.clone()) {
            warn!("failed to persist rating update for {}: {e}", updated_winner.pid);
        }
        if let Err(e) = self.persistence.upsert(updated_loser.clone()) {
            warn!("failed to persist rating update for {}: {e}", updated_loser.pid);
        }

        self.cache.insert(winner_sid.to_string(), updated_winner);
        self.cache.insert(loser_sid.to_string(), updated_loser);
    }

    /// Insert a fully-formed record directly, bypassing persistence —
    /// used by the matchmaker to seed a synthetic bot's rating.
    pub fn seed(&self, sid: &str, record: PlayerRecord) {
        self.cache.insert(sid.to_string(), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_of_is_monotone_and_clamped() {
        assert_eq!(level_of(0), MIN_LEVEL);
        assert_eq!(level_of(1000), MIN_LEVEL);
        assert_eq!(level_of(1500), 5);
        assert_eq!(level_of(5000), MAX_LEVEL);
        let mut prev = level_of(800);
        for elo in (800..3000).step_by(17) {
            let lvl = level_of(elo);
            assert!(lvl >= prev);
            assert!((MIN_LEVEL..=MAX_LEVEL).contains(&lvl));
            prev = lvl;
        }
    }

    #[test]
    fn calc_elo_is_zero_sum_from_pregame_values() {
        let r1 = 1500;
        let r2 = 1600;
        for s in [0.0, 0.5, 1.0] {
            let a = calc_elo(r1, r2, s, ELO_K_FACTOR);
            let b = calc_elo(r2, r1, 1.0 - s, ELO_K_FACTOR);
            assert_eq!(a + b, r1 + r2);
        }
    }

    #[test]
    fn scholars_mate_ratings_match_scenario() {
        let store = PlayerStore::new(Box::new(MemoryStore::new()));
        store.register_session("sidA", "pidA", "A");
        store.register_session("sidB", "pidB", "B");
        store.resolve("sidA");
        store.resolve("sidB");
        store.apply_rating("sidB", "sidA", 1.0);
        assert_eq!(store.resolve("sidA").unwrap().elo, 1485);
        assert_eq!(store.resolve("sidB").unwrap().elo, 1515);
    }

    #[test]
    fn resolve_creates_default_rating_on_first_sight() {
        let store = PlayerStore::new(Box::new(MemoryStore::new()));
        store.register_session("sid1", "pid1", "Alice");
        let record = store.resolve("sid1").unwrap();
        assert_eq!(record.elo, DEFAULT_ELO);
        assert_eq!(record.name, "Alice");
    }
}
