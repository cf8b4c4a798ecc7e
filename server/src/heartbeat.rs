//! Periodic master-server registration.
//!
//! A game server keeps itself listed by sending `GameHeartbeat` to every
//! configured master every ten seconds. The loop is gated by a sequence
//! counter: `stop` bumps it, which orphans whatever timer is already
//! scheduled; when that timer finally fires it sees a stale sequence
//! and does nothing.

use log::{info, warn};

use shared::config::master_server_list;
use shared::packet::Packet;
use shared::{send_packet, Config, Millis, Transport};

pub const HEARTBEAT_INTERVAL: Millis = 10_000;

/// External authentication oracle; heartbeats only start for servers the
/// host considers authenticated.
pub trait Authenticator {
    fn server_authenticated(&self) -> bool;
}

/// The seq-gated heartbeat loop.
#[derive(Debug, Default)]
pub struct Heartbeat {
    seq: u32,
    next: Option<(Millis, u32)>,
}

impl Heartbeat {
    pub fn new() -> Heartbeat {
        Heartbeat::default()
    }

    /// Starts (or restarts) the loop, sending the first heartbeat
    /// immediately. Returns false when the authentication gate refuses.
    pub fn start(
        &mut self,
        auth: &dyn Authenticator,
        config: &dyn Config,
        transport: &mut dyn Transport,
        now: Millis,
    ) -> bool {
        if !auth.server_authenticated() {
            warn!("Heartbeat not started: server is not authenticated");
            return false;
        }
        self.seq += 1;
        self.beat(self.seq, config, transport, now);
        true
    }

    /// Orphans the scheduled timer; the loop dies when it next fires.
    pub fn stop(&mut self) {
        self.seq += 1;
    }

    /// When the scheduled timer fires, if one is pending. Stale timers
    /// still report a deadline; firing them is how they get discarded.
    pub fn next_deadline(&self) -> Option<Millis> {
        self.next.map(|(due, _)| due)
    }

    /// Fires the pending timer if it is due.
    pub fn advance(&mut self, config: &dyn Config, transport: &mut dyn Transport, now: Millis) {
        if let Some((due, seq)) = self.next {
            if due <= now {
                self.next = None;
                self.beat(seq, config, transport, now);
            }
        }
    }

    fn beat(&mut self, seq: u32, config: &dyn Config, transport: &mut dyn Transport, now: Millis) {
        if seq != self.seq {
            return;
        }
        send_heartbeat(0, config, transport);
        self.next = Some((now + HEARTBEAT_INTERVAL, seq));
    }
}

/// One round of heartbeats to every configured master. `flags` conveys
/// the server flavor to the directory.
pub fn send_heartbeat(flags: u8, config: &dyn Config, transport: &mut dyn Transport) {
    for master in master_server_list(config) {
        info!("Sending heartbeat to master server [{}]", master.address);
        send_packet(
            transport,
            &master.address,
            &Packet::GameHeartbeat { flags, key: 0 },
        );
    }
}
