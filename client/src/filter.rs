//! Active query filter and the pruning rules it applies to responses.

use shared::packet::{
    FILTER_FLAG_DEDICATED, FILTER_FLAG_NOT_PASSWORDED,
};
use shared::ServerInfo;

/// Which kind of query the filter belongs to. Only `Normal` and
/// `OfflineFiltered` queries actually prune; the others collect whatever
/// answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterKind {
    #[default]
    Normal,
    Buddy,
    Offline,
    Favorites,
    OfflineFiltered,
}

/// The active server filter. Sent with master list requests and applied
/// locally at the moment each response is processed, never retroactively.
#[derive(Debug, Clone)]
pub struct ServerFilter {
    pub kind: FilterKind,
    pub game_type: String,
    pub mission_type: String,
    pub query_flags: u8,
    pub min_players: u8,
    pub max_players: u8,
    pub max_bots: u8,
    pub region_mask: u32,
    /// 0 disables the ping cut-off.
    pub max_ping: u32,
    pub filter_flags: u8,
    pub min_cpu: u16,
    pub buddy_list: Vec<u32>,
}

impl Default for ServerFilter {
    fn default() -> ServerFilter {
        ServerFilter {
            kind: FilterKind::Normal,
            game_type: "any".to_string(),
            mission_type: "any".to_string(),
            query_flags: 0,
            min_players: 0,
            max_players: 255,
            max_bots: 16,
            region_mask: 0xFFFF_FFFF,
            max_ping: 0,
            filter_flags: 0,
            min_cpu: 0,
            buddy_list: Vec::new(),
        }
    }
}

impl ServerFilter {
    /// Whether response pruning is active for this query kind.
    pub fn applies(&self) -> bool {
        matches!(self.kind, FilterKind::Normal | FilterKind::OfflineFiltered)
    }

    /// Ping-phase cut-off.
    pub fn rejects_ping(&self, ping: u32) -> bool {
        self.max_ping > 0 && ping > self.max_ping
    }

    /// Runs the info-phase chain against a fully updated record and
    /// returns the first rejection, phrased for the log line
    /// `Server <addr> filtered out by <reason>`.
    pub fn rejects_info(&self, si: &ServerInfo) -> Option<String> {
        if !self.game_type.eq_ignore_ascii_case("any")
            && !si.game_type.eq_ignore_ascii_case(&self.game_type)
        {
            return Some(format!("rules set. ({}:{})", self.game_type, si.game_type));
        }
        if !self.mission_type.eq_ignore_ascii_case("any")
            && !si.mission_type.eq_ignore_ascii_case(&self.mission_type)
        {
            return Some(format!(
                "mission type. ({}:{})",
                self.mission_type, si.mission_type
            ));
        }
        if self.filter_flags & FILTER_FLAG_DEDICATED != 0 && !si.status.is_dedicated() {
            return Some("dedicated flag.".to_string());
        }
        if self.filter_flags & FILTER_FLAG_NOT_PASSWORDED != 0 && si.status.is_passworded() {
            return Some("no-password flag.".to_string());
        }
        if si.num_players < self.min_players || si.num_players > self.max_players {
            return Some("player count.".to_string());
        }
        if si.num_bots > self.max_bots {
            return Some("maximum bot count.".to_string());
        }
        if si.cpu_speed < self.min_cpu {
            return Some("minimum CPU speed.".to_string());
        }
        None
    }
}
