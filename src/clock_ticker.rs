//! Clock Ticker (§4.7): background loop ticking clocks for every
//! active game, broadcasting `timer` snapshots, and declaring
//! flag-fall losses. Grounded in `app.py`'s `update_timers` loop,
//! recast as a `tokio::time::interval` task alongside the Matchmaker.

use std::sync::Arc;

use log::info;

use crate::config;
use crate::dispatcher::Registries;

pub async fn run(registries: Arc<Registries>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(config::CLOCK_TICK_PERIOD);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                tick_once(&registries).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("clock ticker shutting down");
                    return;
                }
            }
        }
    }
}

async fn tick_once(registries: &Arc<Registries>) {
    let games: Vec<_> = registries
        .active_games
        .iter()
        .map(|e| Arc::clone(e.value()))
        .collect();

    for game in games {
        if let Some((winner, loser)) = game.tick().await {
            game.flag_fall(winner, loser).await;
        }
    }
}
