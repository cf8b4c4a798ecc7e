//! Status events and script-host callbacks emitted by the query engine.

use std::fmt;

use log::{debug, info};
use shared::NetAddress;

/// Phase label carried by every status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Start,
    Update,
    Ping,
    Query,
    Done,
}

impl QueryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryPhase::Start => "start",
            QueryPhase::Update => "update",
            QueryPhase::Ping => "ping",
            QueryPhase::Query => "query",
            QueryPhase::Done => "done",
        }
    }
}

impl fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

/// Receiver for everything the engine reports outward: query status,
/// script-style callbacks, and NAT-traversal rendezvous results. All but
/// `on_status` default to no-ops so simple hosts stay simple.
pub trait QueryEventSink {
    /// `progress` runs 0..=1 across the ping and query phases.
    fn on_status(&mut self, phase: QueryPhase, message: &str, progress: f32);

    /// Script-host callback channel (`onAddGameType`, `onJoinGameAccept`, ...).
    fn exec(&mut self, _name: &str, _args: &[String]) {}

    /// Hole-punch candidate addresses for an arranged connection.
    /// `is_initiator` is true on the side that asked for the arrangement.
    fn on_arranged_candidates(&mut self, _candidates: &[NetAddress], _is_initiator: bool) {}

    fn on_arranged_rejected(&mut self, _reason: u8) {}

    /// A relay endpoint was allocated; the session layer connects there.
    fn on_relay(&mut self, _relay: NetAddress, _is_host: bool) {}

    /// The relay reports both ends attached.
    fn on_relay_ready(&mut self, _relay: NetAddress) {}
}

/// Sink that forwards everything to the log, used by the CLI.
#[derive(Debug, Default)]
pub struct LogSink;

impl QueryEventSink for LogSink {
    fn on_status(&mut self, phase: QueryPhase, message: &str, progress: f32) {
        info!("[{}] {} ({:.2})", phase, message, progress);
    }

    fn exec(&mut self, name: &str, args: &[String]) {
        debug!("callback {}({})", name, args.join(", "));
    }

    fn on_arranged_candidates(&mut self, candidates: &[NetAddress], is_initiator: bool) {
        info!(
            "Arranged connection candidates ({}): {:?}",
            if is_initiator { "initiator" } else { "host" },
            candidates
        );
    }

    fn on_arranged_rejected(&mut self, reason: u8) {
        info!("Arranged connection rejected (reason {})", reason);
    }

    fn on_relay(&mut self, relay: NetAddress, is_host: bool) {
        info!("Relay allocated at {} (host: {})", relay, is_host);
    }

    fn on_relay_ready(&mut self, relay: NetAddress) {
        info!("Relay at {} is ready", relay);
    }
}
