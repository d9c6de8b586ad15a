//! Game Session (§4.5): the per-match state machine, the bulk of the
//! behavioural surface. Grounded in `game.py`'s `Game` class
//! (`on_move`, `after_move`, `declare_winner`/`declare_loser`, the
//! draw/takeback proposal dance) and in the `Arc<Mutex<_>>`-per-resource
//! pattern already used by `engine::manager::EngineManager` (which
//! holds `Arc<Mutex<EngineProcess>>` per key) for single-writer
//! mutation under concurrent callers.
//!
//! Two source bugs named in the design notes are fixed here rather
//! than reproduced: termination and negotiation are centralised inside
//! `on_move`/`after_move` instead of left to the caller, and takeback
//! clock accounting is handled in one place alongside the position pop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config;
use crate::dispatcher::Registries;
use crate::engine_pool::EnginePool;
use crate::error::DispatchError;
use crate::player_store::{PlayerRecord, PlayerStore};
use crate::rules::{BoardPosition, TerminalState};
use crate::transport::{Origin, Transport};

/// Stable, symbolic termination reasons (§6). Serialised
/// `SCREAMING_SNAKE_CASE` to match the wire vocabulary in §8's scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    Checkmate,
    OpponentOutOfTime,
    OpponentResigned,
    OpponentLeft,
    Checkmated,
    OutOfTime,
    Resigned,
    Stalemate,
    InsufficientMaterial,
    Consensus,
    /// Not in the original vocabulary (§7 names the reused-reason bug
    /// explicitly and recommends this as the cleaner design).
    InfraFailure,
}

struct Inner {
    players: [String; 2],
    times: [f64; 2],
    increment: f64,
    position: BoardPosition,
    current: usize,
    last_tick: Instant,
    terminated: bool,
    draw_proposer: Option<String>,
    takeback_proposer: Option<String>,
    bot_sid: Option<String>,
}

pub struct GameSession {
    pub game_id: String,
    transport: Arc<dyn Transport>,
    engines: Arc<EnginePool>,
    player_store: Arc<PlayerStore>,
    registries: Arc<Registries>,
    inner: Mutex<Inner>,
}

impl GameSession {
    /// Creates and registers a new game (§4.5 "Creation"). Colour
    /// assignment is randomised, as in `app.py`'s `random.shuffle(pair)`.
    pub async fn create(
        game_id: String,
        mut pair: [String; 2],
        total_time: f64,
        increment: f64,
        bot_sid: Option<String>,
        transport: Arc<dyn Transport>,
        engines: Arc<EnginePool>,
        player_store: Arc<PlayerStore>,
        registries: Arc<Registries>,
    ) -> Arc<Self> {
        pair.shuffle(&mut rand::thread_rng());

        let inner = Inner {
            players: pair.clone(),
            times: [total_time, total_time],
            increment,
            position: BoardPosition::new_position(),
            current: 0,
            last_tick: Instant::now(),
            terminated: false,
            draw_proposer: None,
            takeback_proposer: None,
            bot_sid,
        };

        let game = Arc::new(Self {
            game_id,
            transport,
            engines,
            player_store: player_store.clone(),
            registries,
            inner: Mutex::new(inner),
        });

        game.registries
            .active_games
            .insert(game.game_id.clone(), Arc::clone(&game));

        let default = |sid: &str| PlayerRecord {
            pid: sid.to_string(),
            name: "Unknown".to_string(),
            elo: config::DEFAULT_ELO,
        };
        let white = player_store.resolve(&pair[0]).unwrap_or_else(|| default(&pair[0]));
        let black = player_store.resolve(&pair[1]).unwrap_or_else(|| default(&pair[1]));

        game.transport.send_event(
            &pair[0],
            Origin::Background,
            "game_mode",
            json!({"side": "white", "white_player": white, "black_player": black}),
        );
        game.transport.send_event(
            &pair[1],
            Origin::Background,
            "game_mode",
            json!({"side": "black", "white_player": white, "black_player": black}),
        );

        let first_is_bot = {
            let inner = game.inner.lock().await;
            inner.bot_sid.as_deref() == Some(inner.players[inner.current].as_str())
        };
        if first_is_bot {
            let g = Arc::clone(&game);
            tokio::spawn(async move { g.bot_move().await });
        } else {
            game.transport.send_event(&pair[0], Origin::Background, "go", Value::Null);
        }

        game
    }

    /// `on_move(payload, sid)` (§4.5). `origin` distinguishes a human
    /// client request from a bot's self-submitted move.
    pub async fn on_move(self: &Arc<Self>, sid: &str, mv: Option<&str>, origin: Origin) -> Result<(), DispatchError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.terminated {
                self.transport.send_text(sid, origin, "command error: game is already over");
                return Err(DispatchError::GameTerminated);
            }
            if inner.players[inner.current] != sid {
                self.transport.send_text(sid, origin, "command error: it is not your turn");
                return Err(DispatchError::NotYourTurn);
            }
            let Some(mv) = mv else {
                self.transport.send_text(sid, origin, "command error: move payload missing a move");
                return Err(DispatchError::MissingMove);
            };
            if !inner.position.is_legal(mv) {
                self.transport
                    .send_text(sid, origin, &format!("command error: illegal move {mv}"));
                return Err(DispatchError::IllegalMove(mv.to_string()));
            }

            inner.position.apply(mv);
            let opponent = inner.players[1 - inner.current].clone();
            self.transport
                .send_event(&opponent, origin, "move", json!({"move": mv}));
            inner.times[inner.current] += inner.increment;
        }

        self.after_move(origin).await;
        Ok(())
    }

    async fn after_move(self: &Arc<Self>, origin: Origin) {
        let mut inner = self.inner.lock().await;
        if inner.terminated {
            return;
        }

        let disconnected = (0..2).find(|&i| {
            let sid = inner.players[i].as_str();
            inner.bot_sid.as_deref() != Some(sid) && !self.registries.online.contains_key(sid)
        });
        if let Some(gone) = disconnected {
            let other = 1 - gone;
            drop(inner);
            self.finish(other, gone, Reason::OpponentLeft, None, origin).await;
            return;
        }

        match inner.position.terminal_state() {
            TerminalState::Checkmate => {
                let winner = inner.current;
                let loser = 1 - winner;
                drop(inner);
                self.finish(winner, loser, Reason::Checkmate, Some(Reason::Checkmated), origin)
                    .await;
                return;
            }
            TerminalState::Stalemate => {
                drop(inner);
                self.draw(Reason::Stalemate, origin).await;
                return;
            }
            TerminalState::InsufficientMaterial => {
                drop(inner);
                self.draw(Reason::InsufficientMaterial, origin).await;
                return;
            }
            TerminalState::None => {}
        }

        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_tick).as_secs_f64();
        inner.times[inner.current] = (inner.times[inner.current] - elapsed).max(0.0);
        inner.last_tick = now;
        inner.current = 1 - inner.current;
        let next_sid = inner.players[inner.current].clone();
        let bot_turn = inner.bot_sid.as_deref() == Some(next_sid.as_str());
        drop(inner);

        if bot_turn {
            let game = Arc::clone(self);
            tokio::spawn(async move { game.bot_move().await });
        } else {
            self.transport.send_event(&next_sid, origin, "go", Value::Null);
        }
    }

    /// Bot Move (§4.5): acquires an engine, requests a move, submits
    /// it as a regular `on_move` from the bot's seat, releases the
    /// engine. Runs as its own spawned task so the caller (either a
    /// human move or game creation) never blocks on it.
    async fn bot_move(self: Arc<Self>) {
        let (position, bot_sid) = {
            let inner = self.inner.lock().await;
            if inner.terminated {
                return;
            }
            match &inner.bot_sid {
                Some(sid) => (inner.position.clone(), sid.clone()),
                None => return,
            }
        };

        let skill = self
            .player_store
            .level_of_sid(&bot_sid)
            .unwrap_or(config::MIN_LEVEL);

        let mut handle = match self.engines.acquire(skill).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("game {}: engine acquire failed: {e}", self.game_id);
                self.infra_failure().await;
                return;
            }
        };

        let played = handle.play(&position, config::ENGINE_MOVE_TIME).await;
        self.engines.release(handle).await;

        match played {
            Ok(mv) => {
                let _ = self.on_move(&bot_sid, Some(&mv), Origin::Background).await;
            }
            Err(e) => {
                warn!("game {}: engine play failed: {e}", self.game_id);
                self.infra_failure().await;
            }
        }
    }

    async fn infra_failure(self: &Arc<Self>) {
        self.draw(Reason::InfraFailure, Origin::Background).await;
    }

    /// `on_resign(sid)` (§4.5).
    pub async fn on_resign(self: &Arc<Self>, sid: &str, origin: Origin) -> Result<(), DispatchError> {
        let idx = {
            let inner = self.inner.lock().await;
            if inner.terminated {
                return Err(DispatchError::GameTerminated);
            }
            inner
                .players
                .iter()
                .position(|p| p == sid)
                .ok_or(DispatchError::NoActiveGame)?
        };
        let other = 1 - idx;
        self.finish(other, idx, Reason::OpponentResigned, Some(Reason::Resigned), origin)
            .await;
        Ok(())
    }

    /// `on_draw_proposal(sid)` (§4.5).
    pub async fn on_draw_proposal(self: &Arc<Self>, sid: &str, origin: Origin) -> Result<(), DispatchError> {
        let (opponent, opponent_is_bot) = {
            let mut inner = self.inner.lock().await;
            if inner.terminated {
                return Err(DispatchError::GameTerminated);
            }
            if inner.draw_proposer.is_some() {
                return Err(DispatchError::ProposalPending);
            }
            let idx = inner
                .players
                .iter()
                .position(|p| p == sid)
                .ok_or(DispatchError::NoActiveGame)?;
            inner.draw_proposer = Some(sid.to_string());
            let opponent = inner.players[1 - idx].clone();
            let is_bot = inner.bot_sid.as_deref() == Some(opponent.as_str());
            (opponent, is_bot)
        };

        if opponent_is_bot {
            let game = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = game.on_draw_response(&opponent, true, Origin::Background).await;
            });
        } else {
            self.transport.send_event(&opponent, origin, "draw_request", Value::Null);
        }
        Ok(())
    }

    /// `on_draw_response(sid, accepted)` (§4.5).
    pub async fn on_draw_response(self: &Arc<Self>, sid: &str, accepted: bool, origin: Origin) -> Result<(), DispatchError> {
        let proposer = {
            let mut inner = self.inner.lock().await;
            if inner.terminated {
                return Err(DispatchError::GameTerminated);
            }
            let proposer = inner.draw_proposer.clone().ok_or(DispatchError::Unauthorised)?;
            let proposer_idx = inner
                .players
                .iter()
                .position(|p| p == &proposer)
                .ok_or(DispatchError::Unauthorised)?;
            if inner.players[1 - proposer_idx] != sid {
                return Err(DispatchError::Unauthorised);
            }
            inner.draw_proposer = None;
            proposer
        };

        if accepted {
            self.draw(Reason::Consensus, origin).await;
        } else {
            self.transport.send_event(&proposer, origin, "draw_declined", Value::Null);
        }
        Ok(())
    }

    /// `on_takeback_proposal(sid)` (§4.5).
    pub async fn on_takeback_proposal(self: &Arc<Self>, sid: &str, origin: Origin) -> Result<(), DispatchError> {
        let (opponent, opponent_is_bot) = {
            let mut inner = self.inner.lock().await;
            if inner.terminated {
                return Err(DispatchError::GameTerminated);
            }
            if inner.takeback_proposer.is_some() {
                return Err(DispatchError::ProposalPending);
            }
            if inner.position.move_count() < 1 {
                return Err(DispatchError::InsufficientMoves);
            }
            let idx = inner
                .players
                .iter()
                .position(|p| p == sid)
                .ok_or(DispatchError::NoActiveGame)?;
            inner.takeback_proposer = Some(sid.to_string());
            let opponent = inner.players[1 - idx].clone();
            let is_bot = inner.bot_sid.as_deref() == Some(opponent.as_str());
            (opponent, is_bot)
        };

        if opponent_is_bot {
            let game = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = game.on_takeback_response(&opponent, true, Origin::Background).await;
            });
        } else {
            self.transport
                .send_event(&opponent, origin, "takeback_request", Value::Null);
        }
        Ok(())
    }

    /// `on_takeback_response(sid, accepted)` (§4.5). Clock accounting
    /// and the position pop are handled together here, per the design
    /// note recommending one place for both instead of scattering the
    /// decrement across callers.
    pub async fn on_takeback_response(self: &Arc<Self>, sid: &str, accepted: bool, origin: Origin) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock().await;
        if inner.terminated {
            return Err(DispatchError::GameTerminated);
        }
        let proposer = inner.takeback_proposer.clone().ok_or(DispatchError::Unauthorised)?;
        let proposer_idx = inner
            .players
            .iter()
            .position(|p| p == &proposer)
            .ok_or(DispatchError::Unauthorised)?;
        if inner.players[1 - proposer_idx] != sid {
            return Err(DispatchError::Unauthorised);
        }
        inner.takeback_proposer = None;

        if !accepted {
            drop(inner);
            self.transport.send_event(&proposer, origin, "takeback_declined", Value::Null);
            return Ok(());
        }

        if inner.position.move_count() < 2 {
            drop(inner);
            self.transport.send_event(
                &proposer,
                origin,
                "takeback_declined",
                json!({"reason": "insufficient moves"}),
            );
            return Ok(());
        }

        inner.position.pop();
        inner.position.pop();
        inner.times[0] = (inner.times[0] - inner.increment).max(0.0);
        inner.times[1] = (inner.times[1] - inner.increment).max(0.0);
        inner.last_tick = Instant::now();
        inner.current = proposer_idx;
        let players = inner.players.clone();
        let fen = inner.position.board_fen();
        drop(inner);

        let payload = json!({"fen": fen});
        self.transport
            .send_event(&players[0], origin, "takeback_success", payload.clone());
        self.transport
            .send_event(&players[1], origin, "takeback_success", payload);
        self.transport
            .send_event(&players[proposer_idx], origin, "go", Value::Null);
        Ok(())
    }

    /// `on_peer_disconnect(sid)` (§4.5), invoked directly by the
    /// dispatcher on transport disconnect — distinct from the
    /// disconnection check inside `after_move`.
    pub async fn on_peer_disconnect(self: &Arc<Self>, sid: &str) {
        let idx = {
            let inner = self.inner.lock().await;
            if inner.terminated {
                return;
            }
            match inner.players.iter().position(|p| p == sid) {
                Some(i) => i,
                None => return,
            }
        };
        let other = 1 - idx;
        self.finish(other, idx, Reason::OpponentLeft, None, Origin::Background).await;
    }

    /// Check-and-set `terminated` under one lock. Returns whether this
    /// call is the one that wins the race — at most one of several
    /// concurrent terminal triggers (checkmate, resignation, flag-fall,
    /// disconnect) may proceed to rating and event emission (§5, I3/I5).
    async fn begin_termination(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.terminated {
            return false;
        }
        inner.terminated = true;
        true
    }

    /// Sends `win{reason}` to `winner`, optionally `lost{reason}` to
    /// `loser`, applies the rating update, then terminates. No-op if
    /// the game was already terminated by a concurrent caller.
    async fn finish(
        self: &Arc<Self>,
        winner: usize,
        loser: usize,
        winner_reason: Reason,
        loser_reason: Option<Reason>,
        origin: Origin,
    ) {
        if !self.begin_termination().await {
            return;
        }
        let (winner_sid, loser_sid) = {
            let inner = self.inner.lock().await;
            (inner.players[winner].clone(), inner.players[loser].clone())
        };
        self.transport
            .send_event(&winner_sid, origin, "win", json!({"reason": winner_reason}));
        if let Some(reason) = loser_reason {
            self.transport
                .send_event(&loser_sid, origin, "lost", json!({"reason": reason}));
        }
        self.player_store.apply_rating(&winner_sid, &loser_sid, 1.0);
        self.terminate(origin).await;
    }

    /// Sends `draw{reason}` to both sides, applies the half-point
    /// rating update, then terminates. No-op if the game was already
    /// terminated by a concurrent caller.
    async fn draw(self: &Arc<Self>, reason: Reason, origin: Origin) {
        if !self.begin_termination().await {
            return;
        }
        let (a, b) = {
            let inner = self.inner.lock().await;
            (inner.players[0].clone(), inner.players[1].clone())
        };
        self.transport.send_event(&a, origin, "draw", json!({"reason": reason}));
        self.transport.send_event(&b, origin, "draw", json!({"reason": reason}));
        self.player_store.apply_rating(&a, &b, 0.5);
        self.terminate(origin).await;
    }

    /// `terminate` (§4.5): notifies both seats, deregisters from
    /// `active_games`, hints a lobby return. Bot seats are filtered out
    /// by the transport itself. Only ever reached after
    /// [`Self::begin_termination`] has already won the race, from
    /// `finish`/`draw` — it does not itself guard against re-entry.
    async fn terminate(self: &Arc<Self>, origin: Origin) {
        let (a, b) = {
            let inner = self.inner.lock().await;
            (inner.players[0].clone(), inner.players[1].clone())
        };
        self.transport.send_event(&a, origin, "game_over", Value::Null);
        self.transport.send_event(&b, origin, "game_over", Value::Null);
        self.registries.active_games.remove(&self.game_id);
        self.transport.send_text(&a, origin, "waiting_match");
        self.transport.send_text(&b, origin, "waiting_match");
    }

    /// Tick this game's clock (§4.7 `update_clock`); returns the side
    /// whose clock has fallen below zero, if any.
    pub async fn tick(self: &Arc<Self>) -> Option<(usize, usize)> {
        let mut inner = self.inner.lock().await;
        if inner.terminated {
            return None;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_tick).as_secs_f64();
        inner.times[inner.current] -= elapsed;
        inner.last_tick = now;

        if inner.times[0] < 0.0 || inner.times[1] < 0.0 {
            let loser = if inner.times[0] < 0.0 { 0 } else { 1 };
            return Some((1 - loser, loser));
        }

        let mine = [inner.times[0].max(0.0).floor() as i64, inner.times[1].max(0.0).floor() as i64];
        let players = inner.players.clone();
        drop(inner);
        self.transport.send_event(
            &players[0],
            Origin::Background,
            "timer",
            json!({"mine": mine[0], "opponent": mine[1]}),
        );
        self.transport.send_event(
            &players[1],
            Origin::Background,
            "timer",
            json!({"mine": mine[1], "opponent": mine[0]}),
        );
        None
    }

    /// Terminate on flag-fall, called by the Clock Ticker once `tick`
    /// reports a negative clock.
    pub async fn flag_fall(self: &Arc<Self>, winner: usize, loser: usize) {
        self.finish(winner, loser, Reason::OpponentOutOfTime, Some(Reason::OutOfTime), Origin::Background)
            .await;
    }

    pub async fn contains_sid(&self, sid: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.players.iter().any(|p| p == sid)
    }

    /// The other seated session id, if `sid` is seated in this game.
    pub async fn opponent_of(&self, sid: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        let idx = inner.players.iter().position(|p| p == sid)?;
        Some(inner.players[1 - idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Registries;
    use crate::player_store::MemoryStore;
    use crate::transport::ChannelTransport;
    use std::path::PathBuf;

    fn setup() -> (Arc<ChannelTransport>, Arc<PlayerStore>, Arc<Registries>, Arc<EnginePool>) {
        let transport = Arc::new(ChannelTransport::new());
        let store = Arc::new(PlayerStore::new(Box::new(MemoryStore::new())));
        let registries = Arc::new(Registries::new());
        let engines = Arc::new(EnginePool::new(PathBuf::from("/nonexistent/stockfish")));
        (transport, store, registries, engines)
    }

    async fn online(registries: &Registries, sids: &[&str]) {
        for sid in sids {
            registries.online.insert(sid.to_string(), ());
        }
    }

    #[tokio::test]
    async fn scholars_mate_ends_the_game_and_updates_elo() {
        let (transport, store, registries, engines) = setup();
        store.register_session("sidA", "pidA", "Alice");
        store.register_session("sidB", "pidB", "Bob");
        online(&registries, &["sidA", "sidB"]).await;

        let game = GameSession::create(
            "g1".to_string(),
            ["sidA".to_string(), "sidB".to_string()],
            300.0,
            0.0,
            None,
            transport.clone(),
            engines,
            store.clone(),
            registries.clone(),
        )
        .await;

        let white = {
            let inner = game.inner.lock().await;
            inner.players[0].clone()
        };
        let black = {
            let inner = game.inner.lock().await;
            inner.players[1].clone()
        };

        for (sid, mv) in [(&white, "f2f3"), (&black, "e7e5"), (&white, "g2g4"), (&black, "d8h4")] {
            game.on_move(sid, Some(mv), Origin::Request).await.unwrap();
        }

        assert!(!registries.active_games.contains_key("g1"));
        let winner_log = transport.drain(&black);
        assert!(winner_log.iter().any(|(event, _)| event == "win"));
        let loser_log = transport.drain(&white);
        assert!(loser_log.iter().any(|(event, _)| event == "lost"));

        assert_eq!(store.resolve(&white).unwrap().elo, 1485);
        assert_eq!(store.resolve(&black).unwrap().elo, 1515);
    }

    #[tokio::test]
    async fn wrong_turn_move_is_rejected_without_mutation() {
        let (transport, store, registries, engines) = setup();
        store.register_session("sidA", "pidA", "Alice");
        store.register_session("sidB", "pidB", "Bob");
        online(&registries, &["sidA", "sidB"]).await;

        let game = GameSession::create(
            "g2".to_string(),
            ["sidA".to_string(), "sidB".to_string()],
            300.0,
            0.0,
            None,
            transport,
            engines,
            store,
            registries,
        )
        .await;

        let black = {
            let inner = game.inner.lock().await;
            inner.players[1].clone()
        };
        let err = game.on_move(&black, Some("e7e5"), Origin::Request).await.unwrap_err();
        assert_eq!(err, DispatchError::NotYourTurn);
    }

    #[tokio::test]
    async fn takeback_requires_two_plies() {
        let (transport, store, registries, engines) = setup();
        store.register_session("sidA", "pidA", "Alice");
        store.register_session("sidB", "pidB", "Bob");
        online(&registries, &["sidA", "sidB"]).await;

        let game = GameSession::create(
            "g3".to_string(),
            ["sidA".to_string(), "sidB".to_string()],
            300.0,
            2.0,
            None,
            transport.clone(),
            engines,
            store,
            registries,
        )
        .await;

        let white = {
            let inner = game.inner.lock().await;
            inner.players[0].clone()
        };
        let black = {
            let inner = game.inner.lock().await;
            inner.players[1].clone()
        };

        game.on_move(&white, Some("e2e4"), Origin::Request).await.unwrap();
        game.on_takeback_proposal(&white, Origin::Request).await.unwrap();
        game.on_takeback_response(&black, true, Origin::Request).await.unwrap();
        let log = transport.drain(&white);
        assert!(log.iter().any(|(event, payload)| event == "takeback_declined"
            && payload.get("reason").is_some()));

        game.on_move(&black, Some("e7e5"), Origin::Request).await.unwrap();
        game.on_takeback_proposal(&white, Origin::Request).await.unwrap();
        game.on_takeback_response(&black, true, Origin::Request).await.unwrap();
        {
            let inner = game.inner.lock().await;
            assert_eq!(inner.position.move_count(), 0);
            assert_eq!(inner.current, 0);
        }
    }
}
