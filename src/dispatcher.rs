//! Server Dispatcher (§4.8): routes inbound client events to the
//! right handler, owning the process-wide registries. Grounded in
//! `share.py`'s `running` class (the module-level `online_players`,
//! `waiting_players`, `games` dicts) and the `DashMap`-keyed registry
//! pattern already used in `engine::manager::EngineManager`.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use log::info;

use crate::config;
use crate::engine_pool::EnginePool;
use crate::error::DispatchError;
use crate::game_session::GameSession;
use crate::player_store::PlayerStore;
use crate::transport::{Origin, Transport};

/// `sid -> {join_time, time_control_index}` (§3 "Waiting Entry").
#[derive(Debug, Clone)]
pub struct WaitingEntry {
    pub join_time: Instant,
    pub time_control_index: usize,
}

/// The three process-wide registries named in §2/§3: `online`,
/// `waiting`, `active_games`. A single struct rather than three
/// ambient singletons, per the design note in §9.
pub struct Registries {
    pub online: DashMap<String, ()>,
    pub waiting: DashMap<String, WaitingEntry>,
    pub active_games: DashMap<String, Arc<GameSession>>,
}

impl Registries {
    pub fn new() -> Self {
        Self {
            online: DashMap::new(),
            waiting: DashMap::new(),
            active_games: DashMap::new(),
        }
    }

    /// `{online_count, waiting_count, active_game_count}` (SPEC_FULL §4.8 supplement).
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            online_count: self.online.len(),
            waiting_count: self.waiting.len(),
            active_game_count: self.active_games.len(),
        }
    }

}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Snapshot {
    pub online_count: usize,
    pub waiting_count: usize,
    pub active_game_count: usize,
}

pub struct Dispatcher {
    pub registries: Arc<Registries>,
    player_store: Arc<PlayerStore>,
    transport: Arc<dyn Transport>,
    engines: Arc<EnginePool>,
}

impl Dispatcher {
    pub fn new(
        registries: Arc<Registries>,
        player_store: Arc<PlayerStore>,
        transport: Arc<dyn Transport>,
        engines: Arc<EnginePool>,
    ) -> Self {
        Self {
            registries,
            player_store,
            transport,
            engines,
        }
    }

    async fn game_for(&self, sid: &str) -> Option<Arc<GameSession>> {
        for entry in self.registries.active_games.iter() {
            if entry.value().contains_sid(sid).await {
                return Some(Arc::clone(entry.value()));
            }
        }
        None
    }

    /// `connect`: add to `online`, send welcome text.
    pub fn on_connect(&self, sid: &str) {
        self.registries.online.insert(sid.to_string(), ());
        self.transport.send_text(sid, Origin::Request, "welcome");
        info!("sid {sid} connected");
    }

    /// `disconnect`: remove from `online`/`waiting`; notify any game
    /// containing the sid, then drop its player-store registration —
    /// after the game has had a chance to resolve the player for the
    /// disconnection rating update, since the registration is the
    /// session's only route from sid to pid.
    pub async fn on_disconnect(&self, sid: &str) {
        self.registries.online.remove(sid);
        self.registries.waiting.remove(sid);
        if let Some(game) = self.game_for(sid).await {
            game.on_peer_disconnect(sid).await;
        }
        self.player_store.forget_session(sid);
        info!("sid {sid} disconnected");
    }

    /// `join{pid, name}`: bind the session to a persistent player id.
    pub fn on_join(&self, sid: &str, pid: &str, name: &str) {
        self.player_store.register_session(sid, pid, name);
    }

    /// `match{time_control}`: enqueue for matchmaking unless already
    /// playing.
    pub async fn on_match_request(&self, sid: &str, time_control_index: usize) -> Result<(), DispatchError> {
        if !self.registries.online.contains_key(sid) {
            return Err(DispatchError::NotRegistered);
        }
        if self.game_for(sid).await.is_some() {
            return Ok(());
        }
        if self.registries.waiting.contains_key(sid) {
            return Err(DispatchError::AlreadyQueued);
        }
        let index = if time_control_index < config::TIME_CONTROLS.len() {
            time_control_index
        } else {
            config::DEFAULT_TIME_CONTROL_INDEX
        };
        self.registries.waiting.insert(
            sid.to_string(),
            WaitingEntry {
                join_time: Instant::now(),
                time_control_index: index,
            },
        );
        Ok(())
    }

    /// `move{move}`.
    pub async fn on_move(&self, sid: &str, mv: Option<&str>) -> Result<(), DispatchError> {
        let game = self.game_for(sid).await.ok_or(DispatchError::NoActiveGame)?;
        game.on_move(sid, mv, Origin::Request).await
    }

    /// `resign`.
    pub async fn on_resign(&self, sid: &str) -> Result<(), DispatchError> {
        let game = self.game_for(sid).await.ok_or(DispatchError::NoActiveGame)?;
        game.on_resign(sid, Origin::Request).await
    }

    /// `propose_draw`.
    pub async fn on_draw_proposal(&self, sid: &str) -> Result<(), DispatchError> {
        let game = self.game_for(sid).await.ok_or(DispatchError::NoActiveGame)?;
        game.on_draw_proposal(sid, Origin::Request).await
    }

    /// `draw_response{accepted}`.
    pub async fn on_draw_response(&self, sid: &str, accepted: bool) -> Result<(), DispatchError> {
        let game = self.game_for(sid).await.ok_or(DispatchError::NoActiveGame)?;
        game.on_draw_response(sid, accepted, Origin::Request).await
    }

    /// `propose_takeback`.
    pub async fn on_takeback_proposal(&self, sid: &str) -> Result<(), DispatchError> {
        let game = self.game_for(sid).await.ok_or(DispatchError::NoActiveGame)?;
        game.on_takeback_proposal(sid, Origin::Request).await
    }

    /// `takeback_response{accepted}`.
    pub async fn on_takeback_response(&self, sid: &str, accepted: bool) -> Result<(), DispatchError> {
        let game = self.game_for(sid).await.ok_or(DispatchError::NoActiveGame)?;
        game.on_takeback_response(sid, accepted, Origin::Request).await
    }

    /// `message{...}`: ad-hoc plain text relayed to the sender's
    /// current opponent, if seated in a live game.
    pub async fn on_message(&self, sid: &str, text: &str) {
        let Some(game) = self.game_for(sid).await else {
            return;
        };
        if let Some(opponent) = game.opponent_of(sid).await {
            self.transport.send_text(&opponent, Origin::Request, text);
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.registries.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player_store::MemoryStore;
    use crate::transport::ChannelTransport;
    use std::path::PathBuf;

    fn setup() -> Dispatcher {
        let registries = Arc::new(Registries::new());
        let store = Arc::new(PlayerStore::new(Box::new(MemoryStore::new())));
        let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::new());
        let engines = Arc::new(EnginePool::new(PathBuf::from("/nonexistent/stockfish")));
        Dispatcher::new(registries, store, transport, engines)
    }

    #[tokio::test]
    async fn match_request_requires_connection() {
        let dispatcher = setup();
        let err = dispatcher.on_match_request("sid1", 0).await.unwrap_err();
        assert_eq!(err, DispatchError::NotRegistered);
    }

    #[tokio::test]
    async fn duplicate_match_request_is_rejected() {
        let dispatcher = setup();
        dispatcher.on_connect("sid1");
        dispatcher.on_match_request("sid1", 0).await.unwrap();
        let err = dispatcher.on_match_request("sid1", 0).await.unwrap_err();
        assert_eq!(err, DispatchError::AlreadyQueued);
    }

    #[tokio::test]
    async fn disconnect_clears_online_and_waiting() {
        let dispatcher = setup();
        dispatcher.on_connect("sid1");
        dispatcher.on_match_request("sid1", 0).await.unwrap();
        dispatcher.on_disconnect("sid1").await;
        assert!(!dispatcher.registries.online.contains_key("sid1"));
        assert!(!dispatcher.registries.waiting.contains_key("sid1"));
    }
}
