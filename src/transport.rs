//! Transport Facade (§4.4): the boundary between game logic and
//! whatever carries messages to a real client. Grounded on `share.py`'s
//! `running.send_message`/`send_command` — which skip `bot_`-prefixed
//! session ids and branch on whether the caller is the request thread
//! or a background loop. The thread-name sniffing in the original has
//! no Rust analogue worth keeping; callers state their [`Origin`]
//! explicitly instead.

use dashmap::DashMap;
use log::debug;
use serde_json::Value;

use crate::config::BOT_SID_PREFIX;

/// Where a send originates. A real socket layer would use this to
/// decide whether a reply can go out on the current request/response
/// cycle or must be pushed out-of-band; this crate's own
/// [`ChannelTransport`] doesn't need the distinction, but keeps it so
/// a real transport can be swapped in without changing call sites.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Sent while handling an inbound client event.
    Request,
    /// Sent from a background task (matchmaker, clock ticker, bot move).
    Background,
}

/// Everything the game-logic layer needs from the network layer: push
/// a plain notice, or a structured event, to one session. Synthetic
/// bot seats (`bot_`-prefixed sids) are silently dropped here so every
/// call site can address a bot and a human uniformly.
pub trait Transport: Send + Sync {
    fn send_text(&self, sid: &str, origin: Origin, message: &str);
    fn send_event(&self, sid: &str, origin: Origin, event: &str, payload: Value);
}

fn is_bot(sid: &str) -> bool {
    sid.starts_with(BOT_SID_PREFIX)
}

/// In-memory transport: records every send in a per-session log. Used
/// by tests and by any embedding that wants to poll for outbound
/// messages rather than push them over a socket.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    outbox: DashMap<String, Vec<(String, Value)>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return everything queued for `sid`, in send order.
    pub fn drain(&self, sid: &str) -> Vec<(String, Value)> {
        self.outbox.remove(sid).map(|(_, v)| v).unwrap_or_default()
    }

    fn push(&self, sid: &str, event: &str, payload: Value) {
        self.outbox
            .entry(sid.to_string())
            .or_default()
            .push((event.to_string(), payload));
    }
}

impl Transport for ChannelTransport {
    fn send_text(&self, sid: &str, origin: Origin, message: &str) {
        if is_bot(sid) {
            return;
        }
        debug!("[{origin:?}] -> {sid}: {message}");
        self.push(sid, "message", Value::String(message.to_string()));
    }

    fn send_event(&self, sid: &str, origin: Origin, event: &str, payload: Value) {
        if is_bot(sid) {
            return;
        }
        debug!("[{origin:?}] -> {sid}: {event} {payload}");
        self.push(sid, event, payload);
    }
}

impl std::fmt::Debug for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Request => write!(f, "request"),
            Origin::Background => write!(f, "background"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_sids_never_receive_anything() {
        let transport = ChannelTransport::new();
        transport.send_text("bot_7", Origin::Background, "hello");
        transport.send_event("bot_7", Origin::Background, "move", Value::Null);
        assert!(transport.drain("bot_7").is_empty());
    }

    #[test]
    fn human_sids_queue_in_order() {
        let transport = ChannelTransport::new();
        transport.send_text("sid1", Origin::Request, "first");
        transport.send_event("sid1", Origin::Background, "second", Value::Bool(true));
        let drained = transport.drain("sid1");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, "message");
        assert_eq!(drained[1].0, "second");
        assert!(transport.drain("sid1").is_empty());
    }
}
