//! Read-only key/value configuration store.
//!
//! The engines never touch files or environment directly; they read
//! string-typed keys through the [`Config`] trait and do all numeric
//! parsing and defaulting at this boundary. [`TableConfig`] is the plain
//! in-memory implementation the binaries fill from CLI flags or a flat
//! JSON object.

use std::collections::HashMap;

use log::{error, warn};

use crate::addr::NetAddress;
use crate::server_info::MasterInfo;

/// Well-known configuration keys.
pub mod keys {
    /// `Server::Master0` .. `Server::Master9`, `"<region>:<host>:<port>"`.
    pub const MASTER_PREFIX: &str = "Server::Master";
    pub const PREF_NET_REGION_MASK: &str = "Pref::Net::RegionMask";

    pub const PREF_SERVER_NAME: &str = "Pref::Server::Name";
    pub const PREF_SERVER_PASSWORD: &str = "Pref::Server::Password";
    pub const PREF_SERVER_INFO: &str = "Pref::Server::Info";
    pub const PREF_SERVER_MAX_PLAYERS: &str = "Pref::Server::MaxPlayers";
    pub const PREF_SERVER_PRIVATE_SLOTS: &str = "Pref::Server::PrivateSlots";
    pub const PREF_SERVER_PORT: &str = "Pref::Server::Port";

    pub const SERVER_GAME_TYPE: &str = "Server::GameType";
    pub const SERVER_MISSION_TYPE: &str = "Server::MissionType";
    pub const SERVER_MISSION_NAME: &str = "Server::MissionName";
    pub const SERVER_SERVER_TYPE: &str = "Server::ServerType";
    pub const SERVER_PLAYER_COUNT: &str = "Server::PlayerCount";
    pub const SERVER_BOT_COUNT: &str = "Server::BotCount";
    pub const SERVER_DEDICATED: &str = "Server::Dedicated";
    pub const SERVER_IS_PRIVATE: &str = "Server::IsPrivate";
    pub const SERVER_GUID_LIST: &str = "Server::GuidList";
    pub const SERVER_REGION_MASK: &str = "Server::RegionMask";
    pub const SERVER_INVITE_CODE: &str = "Server::InviteCode";
    pub const SERVER_STATUS: &str = "Server::Status";
    pub const SERVER_CPU_SPEED: &str = "Server::CpuSpeed";

    pub const FAVORITE_COUNT: &str = "Pref::Client::ServerFavoriteCount";
    /// `Pref::Client::ServerFavorite<i>`, `"<name>\t<address>"`.
    pub const FAVORITE_PREFIX: &str = "Pref::Client::ServerFavorite";
}

/// String-typed configuration reader.
pub trait Config {
    fn get(&self, key: &str) -> Option<&str>;

    fn get_str(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    fn get_u32(&self, key: &str) -> u32 {
        self.get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(0)
    }

    fn get_u16(&self, key: &str) -> u16 {
        self.get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(0)
    }

    fn get_u8(&self, key: &str) -> u8 {
        self.get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(0)
    }

    fn get_bool(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(str::trim),
            Some("1") | Some("true") | Some("True") | Some("TRUE")
        )
    }
}

/// In-memory [`Config`] backed by a string map.
#[derive(Debug, Default, Clone)]
pub struct TableConfig {
    values: HashMap<String, String>,
}

impl TableConfig {
    pub fn new() -> TableConfig {
        TableConfig::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Loads a flat JSON object of scalars. Nested values are skipped
    /// with a warning rather than failing the whole load.
    pub fn from_json_str(text: &str) -> Result<TableConfig, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let mut table = TableConfig::new();
        if let serde_json::Value::Object(map) = value {
            for (key, val) in map {
                match val {
                    serde_json::Value::String(s) => table.set(key, s),
                    serde_json::Value::Bool(b) => table.set(key, b.to_string()),
                    serde_json::Value::Number(n) => table.set(key, n.to_string()),
                    other => warn!("Config key {} has non-scalar value {}, skipped", key, other),
                }
            }
        } else {
            warn!("Config file is not a JSON object, ignored");
        }
        Ok(table)
    }
}

impl Config for TableConfig {
    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Reads the configured master directory entries (`Server::Master0` ..
/// `Server::Master9`). Bad entries and region 0 are rejected with an
/// error log; an empty result is reported but not fatal.
pub fn master_server_list(config: &dyn Config) -> Vec<MasterInfo> {
    let mut masters = Vec::new();
    for i in 0..10 {
        let key = format!("{}{}", keys::MASTER_PREFIX, i);
        let Some(entry) = config.get(&key) else { continue };
        if entry.is_empty() {
            continue;
        }
        let parsed = entry.split_once(':').and_then(|(region, addr)| {
            let region: u32 = region.trim().parse().ok()?;
            let address: NetAddress = addr.parse().ok()?;
            (region != 0).then_some(MasterInfo { address, region })
        });
        match parsed {
            Some(info) => masters.push(info),
            None => error!("Bad master server address: {}", entry),
        }
    }
    if masters.is_empty() {
        error!("No master servers found");
    }
    masters
}

/// Splits a favorite entry (`"<name>\t<address>"`), clipping the name to
/// 24 characters the way the ping responses do.
pub fn parse_favorite(entry: &str) -> Option<(String, NetAddress)> {
    let (name, addr) = entry.split_once('\t')?;
    if name.is_empty() {
        return None;
    }
    let address = addr.parse().ok()?;
    Some((name.chars().take(24).collect(), address))
}
