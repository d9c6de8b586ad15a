pub mod clock_ticker;
pub mod config;
pub mod dispatcher;
pub mod engine_pool;
pub mod error;
pub mod game_session;
pub mod matchmaker;
pub mod player_store;
pub mod rules;
pub mod transport;

use std::sync::Arc;

use log::info;

use dispatcher::{Dispatcher, Registries};
use engine_pool::EnginePool;
use player_store::{MemoryStore, PlayerStore};
use transport::ChannelTransport;

/// Wires up the full server core with the crate's in-memory stand-in
/// implementations of the transport and persistence boundaries (§6).
/// A real deployment would substitute a socket-backed `Transport` and
/// a document-store `PersistenceStore`, but everything downstream of
/// those seams — matchmaking, game sessions, clocks, ratings — is
/// unchanged either way.
pub struct Server {
    pub dispatcher: Arc<Dispatcher>,
    pub registries: Arc<Registries>,
    pub transport: Arc<ChannelTransport>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl Server {
    pub fn new(engine_binary: std::path::PathBuf) -> Self {
        let registries = Arc::new(Registries::new());
        let transport = Arc::new(ChannelTransport::new());
        let player_store = Arc::new(PlayerStore::new(Box::new(MemoryStore::new())));
        let engines = Arc::new(EnginePool::new(engine_binary));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registries),
            Arc::clone(&player_store),
            transport.clone() as Arc<dyn transport::Transport>,
            Arc::clone(&engines),
        ));
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        let mm_registries = Arc::clone(&registries);
        let mm_store = Arc::clone(&player_store);
        let mm_transport = transport.clone() as Arc<dyn transport::Transport>;
        let mm_engines = Arc::clone(&engines);
        let mm_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            matchmaker::run(mm_registries, mm_store, mm_transport, mm_engines, mm_shutdown).await;
        });

        let ct_registries = Arc::clone(&registries);
        let ct_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            clock_ticker::run(ct_registries, ct_shutdown).await;
        });

        info!("server core started");

        Self {
            dispatcher,
            registries,
            transport,
            shutdown_tx,
        }
    }

    /// Signals both background loops to stop at their next tick.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
