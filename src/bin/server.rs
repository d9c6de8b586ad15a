//! Process entry point: initialises logging, builds the server core,
//! and keeps the process alive, logging a periodic registry snapshot.
//! Grounded in the `#[tokio::main]` entry in `lib.rs::run`, stripped
//! of the Tauri/webview wiring this crate has no use for.

use std::path::PathBuf;
use std::time::Duration;

use chessarena_core::Server;
use log::info;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let engine_binary = std::env::var("CHESSARENA_ENGINE_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|_| chessarena_core::engine_pool::select_engine_binary(std::path::Path::new("./engines")));

    let server = Server::new(engine_binary);

    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let snapshot = server.dispatcher.snapshot();
        info!(
            "online={} waiting={} active_games={}",
            snapshot.online_count, snapshot.waiting_count, snapshot.active_game_count
        );
    }
}
