//! Matchmaker (§4.6): background loop pairing waiting sessions by
//! skill-band widening tolerance, falling back to a bot opponent after
//! a wait threshold. Grounded in `app.py`'s `match_players` loop and
//! `share.py`'s `running.waiting_players` scan, recast as a
//! `tokio::time::interval` task in the same `tokio::spawn` idiom as
//! `engine/manager.rs`'s communication-loop tasks.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::info;
use rand::Rng;
use uuid::Uuid;

use crate::config;
use crate::dispatcher::Registries;
use crate::engine_pool::EnginePool;
use crate::game_session::GameSession;
use crate::player_store::{PlayerRecord, PlayerStore};
use crate::transport::{Origin, Transport};

/// Runs the matchmaking scan loop until `shutdown` fires. Intended to
/// be `tokio::spawn`ed once at startup.
pub async fn run(
    registries: Arc<Registries>,
    player_store: Arc<PlayerStore>,
    transport: Arc<dyn Transport>,
    engines: Arc<EnginePool>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(config::MATCHMAKER_PERIOD);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                scan_once(&registries, &player_store, &transport, &engines).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("matchmaker shutting down");
                    return;
                }
            }
        }
    }
}

async fn scan_once(
    registries: &Arc<Registries>,
    player_store: &Arc<PlayerStore>,
    transport: &Arc<dyn Transport>,
    engines: &Arc<EnginePool>,
) {
    let waiting: Vec<(String, Instant, usize)> = registries
        .waiting
        .iter()
        .map(|e| (e.key().clone(), e.value().join_time, e.value().time_control_index))
        .collect();

    let mut slated = std::collections::HashSet::new();

    for (sid, join_time, time_control_index) in &waiting {
        if slated.contains(sid) || !registries.waiting.contains_key(sid) {
            continue;
        }
        let Some(level) = player_store.level_of_sid(sid) else {
            continue;
        };
        let waited = join_time.elapsed();
        let tolerance = (config::TOLERANCE_INIT
            + (waited.as_secs_f64() / config::TOLERANCE_STEP_PERIOD.as_secs_f64()) as i32 * config::TOLERANCE_STEP)
            .min(config::TOLERANCE_MAX);

        let partner = waiting.iter().find(|(other, _, other_tc)| {
            other != sid
                && !slated.contains(other)
                && other_tc == time_control_index
                && player_store
                    .level_of_sid(other)
                    .map(|other_level| (level - other_level).abs() <= tolerance)
                    .unwrap_or(false)
        });

        if let Some((partner_sid, _, _)) = partner {
            slated.insert(sid.clone());
            slated.insert(partner_sid.clone());
            transport.send_text(sid, Origin::Background, "match found");
            transport.send_text(partner_sid, Origin::Background, "match found");
            registries.waiting.remove(sid);
            registries.waiting.remove(partner_sid);
            spawn_game(
                registries,
                player_store,
                transport,
                engines,
                [sid.clone(), partner_sid.clone()],
                *time_control_index,
                None,
            )
            .await;
            continue;
        }

        if waited > config::BOT_WAIT_TIME {
            slated.insert(sid.clone());
            registries.waiting.remove(sid);

            let Some(player) = player_store.resolve(sid) else {
                continue;
            };
            let bot_sid = format!("{}{}", config::BOT_SID_PREFIX, Utc::now().timestamp_millis());
            let name = config::BOT_NAME_POOL[rand::thread_rng().gen_range(0..config::BOT_NAME_POOL.len())];
            let jitter = rand::thread_rng().gen_range(-config::BOT_ELO_JITTER..=config::BOT_ELO_JITTER);
            let bot_record = PlayerRecord {
                pid: bot_sid.clone(),
                name: name.to_string(),
                elo: player.elo + jitter,
            };
            player_store.seed(&bot_sid, bot_record);

            spawn_game(
                registries,
                player_store,
                transport,
                engines,
                [sid.clone(), bot_sid.clone()],
                *time_control_index,
                Some(bot_sid),
            )
            .await;
        }
    }
}

async fn spawn_game(
    registries: &Arc<Registries>,
    player_store: &Arc<PlayerStore>,
    transport: &Arc<dyn Transport>,
    engines: &Arc<EnginePool>,
    pair: [String; 2],
    time_control_index: usize,
    bot_sid: Option<String>,
) {
    let (total_time, increment) = config::TIME_CONTROLS
        .get(time_control_index)
        .copied()
        .unwrap_or(config::TIME_CONTROLS[config::DEFAULT_TIME_CONTROL_INDEX]);

    let game_id = Uuid::new_v4().to_string();
    info!("creating game {game_id} for {:?}", pair);
    let _ = GameSession::create(
        game_id,
        pair,
        total_time,
        increment,
        bot_sid,
        Arc::clone(transport),
        Arc::clone(engines),
        Arc::clone(player_store),
        Arc::clone(registries),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_widens_and_caps() {
        let waited = |secs: u64| std::time::Duration::from_secs(secs);
        let tol = |waited: std::time::Duration| {
            (config::TOLERANCE_INIT
                + (waited.as_secs_f64() / config::TOLERANCE_STEP_PERIOD.as_secs_f64()) as i32 * config::TOLERANCE_STEP)
                .min(config::TOLERANCE_MAX)
        };
        assert_eq!(tol(waited(0)), 1);
        assert_eq!(tol(waited(4)), 1);
        assert_eq!(tol(waited(5)), 2);
        assert_eq!(tol(waited(100)), config::TOLERANCE_MAX);
    }
}
