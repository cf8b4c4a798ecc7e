//! Server-side query responder.
//!
//! Answers the discovery pings, info queries, master info queries and
//! join invites a running game server receives. Every answer is built
//! from a fresh configuration snapshot, echoes the request's `flags` and
//! key field verbatim, and honors the request's string-compression
//! choice.

use log::{debug, info};

use shared::config::{keys, master_server_list};
use shared::packet::{
    Packet, BUILD_VERSION, CURRENT_PROTOCOL_VERSION, MIN_REQUIRED_PROTOCOL_VERSION,
    QUERY_FLAG_OFFLINE, VERSION_TAG,
};
use shared::{Config, NetAddress, ServerStatus};

/// Snapshot of the published server configuration, read per packet so a
/// mid-game mission change is reflected in the very next answer.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub name: String,
    pub game_type: String,
    pub mission_type: String,
    pub mission_name: String,
    pub server_type: String,
    pub info: String,
    pub status: String,
    pub password: String,
    pub invite_code: String,
    pub guid_list: Vec<u32>,
    pub player_count: u8,
    pub bot_count: u8,
    pub max_players: u8,
    pub private_slots: u8,
    pub region_mask: u32,
    pub cpu_speed: u16,
    pub port: u16,
    pub dedicated: bool,
    pub is_private: bool,
}

impl ServerSettings {
    pub fn read(config: &dyn Config) -> ServerSettings {
        ServerSettings {
            name: config.get_str(keys::PREF_SERVER_NAME),
            game_type: config.get_str(keys::SERVER_GAME_TYPE),
            mission_type: config.get_str(keys::SERVER_MISSION_TYPE),
            mission_name: config.get_str(keys::SERVER_MISSION_NAME),
            server_type: config.get_str(keys::SERVER_SERVER_TYPE),
            info: config.get_str(keys::PREF_SERVER_INFO),
            status: config.get_str(keys::SERVER_STATUS),
            password: config.get_str(keys::PREF_SERVER_PASSWORD),
            invite_code: config.get_str(keys::SERVER_INVITE_CODE),
            guid_list: config
                .get_str(keys::SERVER_GUID_LIST)
                .split('\t')
                .filter_map(|guid| guid.trim().parse().ok())
                .collect(),
            player_count: config.get_u8(keys::SERVER_PLAYER_COUNT),
            bot_count: config.get_u8(keys::SERVER_BOT_COUNT),
            max_players: config.get_u8(keys::PREF_SERVER_MAX_PLAYERS),
            private_slots: config.get_u8(keys::PREF_SERVER_PRIVATE_SLOTS),
            region_mask: config.get_u32(keys::SERVER_REGION_MASK),
            cpu_speed: config.get_u16(keys::SERVER_CPU_SPEED),
            port: config.get_u16(keys::PREF_SERVER_PORT),
            dedicated: config.get_bool(keys::SERVER_DEDICATED),
            is_private: config.get_bool(keys::SERVER_IS_PRIVATE),
        }
    }

    /// Joinable slots once the private ones are held back.
    fn open_slots(&self) -> u8 {
        self.max_players.saturating_sub(self.private_slots)
    }

    fn status_byte(&self, include_private: bool) -> u8 {
        let mut status = 0u16;
        if cfg!(target_os = "linux") {
            status |= ServerStatus::LINUX;
        }
        if self.dedicated {
            status |= ServerStatus::DEDICATED;
        }
        if !self.password.is_empty() {
            status |= ServerStatus::PASSWORDED;
        }
        if include_private && self.is_private {
            status |= ServerStatus::PRIVATE;
        }
        status as u8
    }
}

/// The responder proper. `accepting_connections` mirrors whether the
/// hosting game will take new players; when false nothing is answered
/// at all, which keeps closed servers out of every browser.
#[derive(Debug)]
pub struct Responder {
    pub accepting_connections: bool,
}

impl Responder {
    pub fn new() -> Responder {
        Responder {
            accepting_connections: true,
        }
    }

    /// Decodes one datagram and produces the reply to send back to the
    /// sender, if any. Malformed input is dropped silently.
    pub fn handle_datagram(
        &self,
        config: &dyn Config,
        from: &NetAddress,
        data: &[u8],
    ) -> Option<Packet> {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed packet from {}: {}", from, e);
                return None;
            }
        };
        let settings = ServerSettings::read(config);
        match packet {
            Packet::GamePingRequest { flags, key } => self.ping_response(&settings, flags, key),
            Packet::GameInfoRequest { flags, key } => self.info_response(&settings, flags, key),
            Packet::GameMasterInfoRequest { flags, key } => {
                self.master_info_response(config, &settings, from, flags, key)
            }
            Packet::MasterServerJoinInvite { invite_code, .. } => {
                self.join_invite_response(&settings, &invite_code)
            }
            other => {
                debug!(
                    "Ignoring packet type {} from {}",
                    other.type_byte(),
                    from
                );
                None
            }
        }
    }

    fn ping_response(&self, settings: &ServerSettings, flags: u8, key: u32) -> Option<Packet> {
        if !self.accepting_connections {
            return None;
        }
        if settings.server_type.eq_ignore_ascii_case("SinglePlayer") {
            return None;
        }
        if flags & QUERY_FLAG_OFFLINE != 0 {
            return None;
        }
        // Full servers stay out of the ping results entirely.
        if settings.player_count >= settings.open_slots() {
            return None;
        }
        Some(Packet::GamePingResponse {
            flags,
            key,
            version_tag: VERSION_TAG.to_string(),
            protocol_current: CURRENT_PROTOCOL_VERSION,
            protocol_min: MIN_REQUIRED_PROTOCOL_VERSION,
            build_version: BUILD_VERSION,
            name: settings.name.chars().take(24).collect(),
        })
    }

    fn info_response(&self, settings: &ServerSettings, flags: u8, key: u32) -> Option<Packet> {
        if !self.accepting_connections {
            return None;
        }
        if flags & QUERY_FLAG_OFFLINE != 0 {
            return None;
        }
        Some(Packet::GameInfoResponse {
            flags,
            key,
            game_type: settings.game_type.clone(),
            mission_type: settings.mission_type.clone(),
            mission_name: settings.mission_name.clone(),
            status: settings.status_byte(false),
            num_players: settings.player_count,
            max_players: settings.max_players,
            num_bots: settings.bot_count,
            cpu_speed: settings.cpu_speed,
            info_string: settings.info.clone(),
            status_string: settings.status.clone(),
        })
    }

    fn master_info_response(
        &self,
        config: &dyn Config,
        settings: &ServerSettings,
        from: &NetAddress,
        flags: u8,
        key: u32,
    ) -> Option<Packet> {
        if !self.accepting_connections {
            return None;
        }
        let from_master = master_server_list(config)
            .iter()
            .any(|master| same_host(&master.address, from));
        info!(
            "Received info request from {} [{}].",
            if from_master { "a master server" } else { "a machine" },
            from
        );

        let mut guids: Vec<u32> = settings
            .guid_list
            .iter()
            .copied()
            .take(settings.player_count as usize)
            .collect();
        // The list always covers every current player; absent GUIDs are
        // published as zero.
        guids.resize(settings.player_count as usize, 0);

        Some(Packet::GameMasterInfoResponse {
            flags,
            key,
            game_type: settings.game_type.clone(),
            mission_type: settings.mission_type.clone(),
            invite_code: settings.invite_code.clone(),
            max_players: settings.open_slots(),
            region_mask: settings.region_mask,
            version: BUILD_VERSION,
            status: settings.status_byte(true),
            num_bots: settings.bot_count,
            cpu_speed: settings.cpu_speed,
            guids,
        })
    }

    fn join_invite_response(
        &self,
        settings: &ServerSettings,
        invite_code: &str,
    ) -> Option<Packet> {
        if invite_code != settings.invite_code {
            return None;
        }
        // The all-ones host tells the client to use whatever source
        // address this reply arrives from.
        Some(Packet::MasterServerJoinInviteResponse {
            flags: 0,
            key: 0,
            found: true,
            address: NetAddress::Ip {
                host: [255, 255, 255, 255],
                port: settings.port,
            },
        })
    }
}

impl Default for Responder {
    fn default() -> Responder {
        Responder::new()
    }
}

fn same_host(a: &NetAddress, b: &NetAddress) -> bool {
    match (a, b) {
        (NetAddress::Ip { host: ha, .. }, NetAddress::Ip { host: hb, .. }) => ha == hb,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::TableConfig;

    fn test_config() -> TableConfig {
        let mut config = TableConfig::new();
        config.set(keys::PREF_SERVER_NAME, "Sunny's arena with a very long name");
        config.set(keys::SERVER_GAME_TYPE, "CTF");
        config.set(keys::SERVER_MISSION_TYPE, "any");
        config.set(keys::SERVER_MISSION_NAME, "canyon");
        config.set(keys::SERVER_SERVER_TYPE, "MultiPlayer");
        config.set(keys::PREF_SERVER_INFO, "bring a team");
        config.set(keys::SERVER_STATUS, "round 2 of 3");
        config.set(keys::SERVER_PLAYER_COUNT, "3");
        config.set(keys::SERVER_BOT_COUNT, "1");
        config.set(keys::PREF_SERVER_MAX_PLAYERS, "16");
        config.set(keys::PREF_SERVER_PRIVATE_SLOTS, "2");
        config.set(keys::SERVER_REGION_MASK, "2");
        config.set(keys::SERVER_CPU_SPEED, "2400");
        config.set(keys::PREF_SERVER_PORT, "28000");
        config.set(keys::SERVER_DEDICATED, "true");
        config.set(keys::SERVER_GUID_LIST, "1001\t1002");
        config
    }

    fn from_addr() -> NetAddress {
        "192.0.2.77:31000".parse().unwrap()
    }

    fn ping(flags: u8) -> Vec<u8> {
        Packet::GamePingRequest { flags, key: 42 }.encode()
    }

    #[test]
    fn ping_reply_echoes_header_and_clips_name() {
        let responder = Responder::new();
        let reply = responder
            .handle_datagram(&test_config(), &from_addr(), &ping(0))
            .unwrap();
        match reply {
            Packet::GamePingResponse {
                flags,
                key,
                version_tag,
                name,
                build_version,
                ..
            } => {
                assert_eq!(flags, 0);
                assert_eq!(key, 42);
                assert_eq!(version_tag, VERSION_TAG);
                assert_eq!(build_version, BUILD_VERSION);
                assert_eq!(name.chars().count(), 24);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn closed_or_singleplayer_servers_stay_silent() {
        let mut responder = Responder::new();
        responder.accepting_connections = false;
        assert!(responder
            .handle_datagram(&test_config(), &from_addr(), &ping(0))
            .is_none());

        let responder = Responder::new();
        let mut config = test_config();
        config.set(keys::SERVER_SERVER_TYPE, "SinglePlayer");
        assert!(responder
            .handle_datagram(&config, &from_addr(), &ping(0))
            .is_none());
    }

    #[test]
    fn offline_queries_are_ignored_by_online_servers() {
        let responder = Responder::new();
        assert!(responder
            .handle_datagram(&test_config(), &from_addr(), &ping(QUERY_FLAG_OFFLINE))
            .is_none());
        let info = Packet::GameInfoRequest {
            flags: QUERY_FLAG_OFFLINE,
            key: 1,
        }
        .encode();
        assert!(responder
            .handle_datagram(&test_config(), &from_addr(), &info)
            .is_none());
    }

    #[test]
    fn full_servers_do_not_answer_pings() {
        let responder = Responder::new();
        let mut config = test_config();
        // 16 max - 2 private = 14 open slots
        config.set(keys::SERVER_PLAYER_COUNT, "14");
        assert!(responder
            .handle_datagram(&config, &from_addr(), &ping(0))
            .is_none());
        // But info queries still work.
        let info = Packet::GameInfoRequest { flags: 0, key: 1 }.encode();
        assert!(responder
            .handle_datagram(&config, &from_addr(), &info)
            .is_some());
    }

    #[test]
    fn info_reply_carries_the_snapshot() {
        let responder = Responder::new();
        let request = Packet::GameInfoRequest { flags: 0, key: 7 }.encode();
        let reply = responder
            .handle_datagram(&test_config(), &from_addr(), &request)
            .unwrap();
        match reply {
            Packet::GameInfoResponse {
                key,
                game_type,
                mission_name,
                status,
                num_players,
                max_players,
                num_bots,
                cpu_speed,
                info_string,
                status_string,
                ..
            } => {
                assert_eq!(key, 7);
                assert_eq!(game_type, "CTF");
                assert_eq!(mission_name, "canyon");
                assert_eq!(num_players, 3);
                assert_eq!(max_players, 16);
                assert_eq!(num_bots, 1);
                assert_eq!(cpu_speed, 2400);
                assert_eq!(info_string, "bring a team");
                assert_eq!(status_string, "round 2 of 3");
                assert!(ServerStatus::from_wire(status).is_dedicated());
                assert!(!ServerStatus::from_wire(status).is_passworded());
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn passworded_bit_follows_the_password() {
        let responder = Responder::new();
        let mut config = test_config();
        config.set(keys::PREF_SERVER_PASSWORD, "hunter2");
        let request = Packet::GameInfoRequest { flags: 0, key: 1 }.encode();
        let reply = responder
            .handle_datagram(&config, &from_addr(), &request)
            .unwrap();
        match reply {
            Packet::GameInfoResponse { status, .. } => {
                assert!(ServerStatus::from_wire(status).is_passworded());
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn master_info_pads_guids_and_adjusts_slots() {
        let responder = Responder::new();
        let request = Packet::GameMasterInfoRequest { flags: 0, key: 9 }.encode();
        let reply = responder
            .handle_datagram(&test_config(), &from_addr(), &request)
            .unwrap();
        match reply {
            Packet::GameMasterInfoResponse {
                key,
                max_players,
                guids,
                region_mask,
                invite_code,
                ..
            } => {
                assert_eq!(key, 9);
                // 16 max minus 2 private slots
                assert_eq!(max_players, 14);
                // 3 players, 2 published GUIDs, zero-padded
                assert_eq!(guids, vec![1001, 1002, 0]);
                assert_eq!(region_mask, 2);
                assert_eq!(invite_code, "");
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn join_invite_answers_only_matching_codes() {
        let responder = Responder::new();
        let mut config = test_config();
        config.set(keys::SERVER_INVITE_CODE, "SECRET");

        let wrong = Packet::MasterServerJoinInvite {
            flags: 0,
            key: 0,
            invite_code: "WRONG".to_string(),
        }
        .encode();
        assert!(responder
            .handle_datagram(&config, &from_addr(), &wrong)
            .is_none());

        let right = Packet::MasterServerJoinInvite {
            flags: 0,
            key: 0,
            invite_code: "SECRET".to_string(),
        }
        .encode();
        let reply = responder
            .handle_datagram(&config, &from_addr(), &right)
            .unwrap();
        match reply {
            Packet::MasterServerJoinInviteResponse { found, address, .. } => {
                assert!(found);
                // Sentinel host: "use my source address".
                assert_eq!(
                    address,
                    NetAddress::Ip {
                        host: [255, 255, 255, 255],
                        port: 28000
                    }
                );
            }
            other => panic!("unexpected reply {:?}", other),
        }

        // The comparison is a plain string match, so a server with no
        // invite code configured answers an empty-code invite.
        let empty = Packet::MasterServerJoinInvite {
            flags: 0,
            key: 0,
            invite_code: String::new(),
        }
        .encode();
        assert!(responder
            .handle_datagram(&test_config(), &from_addr(), &empty)
            .is_some());
    }

    #[test]
    fn garbage_datagrams_are_dropped() {
        let responder = Responder::new();
        assert!(responder
            .handle_datagram(&test_config(), &from_addr(), &[0xEE, 1, 2])
            .is_none());
        assert!(responder
            .handle_datagram(&test_config(), &from_addr(), &[])
            .is_none());
    }
}
