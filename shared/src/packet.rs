//! The discovery protocol packet family and its binary codec.
//!
//! Every datagram starts with a packet type byte followed by the common
//! header: `flags: u8` and `key: u32`, where the key field packs the
//! requester's session and per-request nonce as
//! `(session << 16) | (key & 0xFFFF)`. Responders echo both verbatim.
//!
//! Fields noted as "tagged" strings honor the request's
//! [`QUERY_FLAG_NO_STRING_COMPRESS`] bit: when the bit is clear they use
//! the compressed framing, otherwise the plain short framing. All other
//! strings are plain short strings except where a long string is called
//! out.

use crate::addr::NetAddress;
use crate::wire::{PacketReader, PacketWriter, WireError};

/// Protocol compatibility tag carried by every ping response.
///
/// Checked as an exact string before anything else in a response is
/// trusted. Bumping the tag is how a release cuts off incompatible
/// generations outright: a server answering with any other tag is
/// dropped from consideration without ever being queried.
pub const VERSION_TAG: &str = "VER1";

/// Protocol revision this build speaks.
///
/// Travels in every ping response beside
/// [`MIN_REQUIRED_PROTOCOL_VERSION`] so both ends can check the other's
/// range: a client ignores servers older than its own floor, and skips
/// servers whose floor is above this value.
pub const CURRENT_PROTOCOL_VERSION: u32 = 12;

/// Oldest protocol revision this build still accepts.
///
/// Kept a few revisions behind [`CURRENT_PROTOCOL_VERSION`] so a fleet
/// can upgrade gradually without every browser going dark at once.
pub const MIN_REQUIRED_PROTOCOL_VERSION: u32 = 9;

/// Build number published in ping and master-info responses.
///
/// Unlike the protocol range this is matched exactly: game content is
/// versioned with the build, so a mismatched server would accept the
/// join and then desync. The browser prunes them at ping time instead.
pub const BUILD_VERSION: u32 = 1510;

// Query flags (the `flags` byte of requests). A request with no bits
// set is an ordinary online query.

/// Set on LAN-only queries; internet-listed servers do not answer them,
/// which keeps offline browsing from lighting up public masters.
pub const QUERY_FLAG_OFFLINE: u8 = 1 << 0;

/// Set when the requester wants plain rather than compressed strings.
///
/// Responders honor the bit per response, so simple tools can speak the
/// protocol without carrying the Huffman table.
pub const QUERY_FLAG_NO_STRING_COMPRESS: u8 = 1 << 1;

// Filter flags (the `filterFlags` byte of list requests). The master
// applies them server-side; the client re-applies them as answers come
// back, since the master's view can be minutes stale.

/// Only servers running without a local player.
pub const FILTER_FLAG_DEDICATED: u8 = 1 << 0;

/// Only servers that can be joined without a password.
pub const FILTER_FLAG_NOT_PASSWORDED: u8 = 1 << 1;

/// Only servers reporting the Linux status bit.
pub const FILTER_FLAG_LINUX: u8 = 1 << 2;

/// Requests the requester's own build only. The bit still travels for
/// the master's benefit, but locally the build check is unconditional.
pub const FILTER_FLAG_CURRENT_VERSION: u8 = 1 << 7;

/// Packet type bytes.
pub mod types {
    pub const GAME_TYPES_REQUEST: u8 = 2;
    pub const GAME_TYPES_RESPONSE: u8 = 4;
    pub const MASTER_SERVER_LIST_REQUEST: u8 = 6;
    pub const MASTER_SERVER_LIST_RESPONSE: u8 = 8;
    pub const GAME_MASTER_INFO_REQUEST: u8 = 10;
    pub const GAME_MASTER_INFO_RESPONSE: u8 = 12;
    pub const GAME_PING_REQUEST: u8 = 14;
    pub const GAME_PING_RESPONSE: u8 = 16;
    pub const GAME_INFO_REQUEST: u8 = 18;
    pub const GAME_INFO_RESPONSE: u8 = 20;
    pub const GAME_HEARTBEAT: u8 = 22;
    pub const MASTER_SERVER_REQUEST_ARRANGED_CONNECTION: u8 = 24;
    pub const MASTER_SERVER_CLIENT_REQUESTED_ARRANGED_CONNECTION: u8 = 26;
    pub const MASTER_SERVER_ACCEPT_ARRANGED_CONNECTION: u8 = 28;
    pub const MASTER_SERVER_ARRANGED_CONNECTION_ACCEPTED: u8 = 30;
    pub const MASTER_SERVER_ARRANGED_CONNECTION_REJECTED: u8 = 32;
    pub const MASTER_SERVER_GAME_PING_REQUEST: u8 = 34;
    pub const MASTER_SERVER_GAME_PING_RESPONSE: u8 = 36;
    pub const MASTER_SERVER_GAME_INFO_REQUEST: u8 = 38;
    pub const MASTER_SERVER_GAME_INFO_RESPONSE: u8 = 40;
    pub const MASTER_SERVER_RELAY_REQUEST: u8 = 42;
    pub const MASTER_SERVER_RELAY_RESPONSE: u8 = 44;
    pub const MASTER_SERVER_RELAY_READY: u8 = 46;
    pub const MASTER_SERVER_JOIN_INVITE: u8 = 48;
    pub const MASTER_SERVER_JOIN_INVITE_RESPONSE: u8 = 50;
}

/// Packs a session generation and request nonce into the wire key field.
///
/// Only the low 16 bits of each survive, which is plenty: the session
/// distinguishes queries from each other and the nonce distinguishes
/// retries within one query. A response echoing a stale combination of
/// either is silently ignored by the requester.
///
/// ```rust
/// use shared::packet::key_field;
///
/// assert_eq!(key_field(3, 0x2A), 0x0003_002A);
/// // Retried requests get fresh nonces under the same session.
/// assert_ne!(key_field(3, 0x2A), key_field(3, 0x2B));
/// ```
pub fn key_field(session: u32, key: u32) -> u32 {
    (session << 16) | (key & 0xFFFF)
}

/// The complete message family of the discovery protocol.
///
/// Every variant carries the shared header fields `flags` and `key`.
/// On requests, `flags` is the query-flag byte and `key` is the
/// requester's `(session << 16) | nonce` correlation field; responses
/// echo both verbatim so the requester can match answers to in-flight
/// probes and discard anything stale.
///
/// ## Message Categories
///
/// ### Directory Traffic
/// `MasterServerListRequest`/`Response` page the server list out of a
/// master; `GameTypesRequest`/`Response` fetch the browse catalogue;
/// `GameHeartbeat` keeps a server registered.
///
/// ### Probing
/// `GamePingRequest`/`Response` measure liveness and round-trip time and
/// gate on protocol compatibility; `GameInfoRequest`/`Response` carry
/// the full descriptive record; `GameMasterInfoRequest`/`Response` is
/// the master's own richer variant with invite code and player GUIDs.
///
/// ### NAT Traversal
/// The `MasterServer*` rendezvous messages broker arranged (hole-punch)
/// connections, relay fallback, and join-by-invite lookups through the
/// masters.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Asks a master for the game/mission type catalogue used to
    /// populate browser filter dropdowns.
    GameTypesRequest {
        flags: u8,
        key: u32,
    },
    /// The catalogue itself. Both lists are advisory display data; an
    /// empty list just leaves the corresponding dropdown bare.
    GameTypesResponse {
        flags: u8,
        key: u32,
        game_types: Vec<String>,
        mission_types: Vec<String>,
    },
    /// Asks a master for the registered-server list, filtered
    /// server-side by every field below.
    MasterServerListRequest {
        flags: u8,
        key: u32,
        /// 255 requests the whole list; anything else re-requests one
        /// page, in which case the filter fields ride along zeroed.
        packet_index: u8,
        /// Exact game type to list, or "any" to skip the check.
        game_type: String,
        /// Exact mission type to list, or "any" to skip the check.
        mission_type: String,
        /// Inclusive player-count window; 0..=255 lists everything.
        min_players: u8,
        max_players: u8,
        /// Bitmask of acceptable regions; all-ones means anywhere.
        region_mask: u32,
        /// Requester's build number, so the master can pre-drop servers
        /// the client would prune at ping time anyway.
        version: u32,
        /// The `FILTER_FLAG_*` bits.
        filter_flags: u8,
        /// Upper bound on bot padding; servers above it are skipped.
        max_bots: u8,
        /// Minimum server CPU speed in MHz, a rough quality floor.
        min_cpu: u16,
        /// Account ids to search for instead of filtering; a non-empty
        /// list turns the request into a buddy search.
        buddy_list: Vec<u32>,
    },
    /// One page of the master's answer. Pages arrive unordered and are
    /// reassembled by index; the requester re-requests missing ones.
    MasterServerListResponse {
        /// Bit 0 set means the enclosed addresses are the requester's
        /// own public endpoint, echoed so it can learn what it looks
        /// like from the internet.
        flags: u8,
        key: u32,
        /// Which page this is, starting at 0.
        packet_index: u8,
        /// Total pages in this answer; fixed by the first page received.
        packet_total: u8,
        /// Registered endpoints, at most a u16 count per page.
        servers: Vec<NetAddress>,
    },
    /// A master (or curious machine) asking a server to describe itself
    /// for directory purposes.
    GameMasterInfoRequest {
        flags: u8,
        key: u32,
    },
    /// The directory-grade self-description. Richer than
    /// `GameInfoResponse` in the fields a master cares about (invite
    /// code, GUIDs) and leaner in the display-only ones.
    GameMasterInfoResponse {
        flags: u8,
        key: u32,
        game_type: String,
        mission_type: String,
        /// Private-match invite code, empty when the server is public.
        invite_code: String,
        /// Joinable slots with the private ones already held back, so
        /// the master never advertises capacity it cannot grant.
        max_players: u8,
        region_mask: u32,
        /// The server's build number.
        version: u32,
        /// Wire status byte, including the private bit.
        status: u8,
        num_bots: u8,
        /// Server CPU speed in MHz.
        cpu_speed: u16,
        /// One entry per current player, zero-padded when fewer GUIDs
        /// are published than players are present.
        guids: Vec<u32>,
    },
    /// Liveness probe. Header-only by design: the cheapest possible
    /// datagram, since up to ten are in flight at once and broadcast
    /// copies hit every server on the segment.
    GamePingRequest {
        flags: u8,
        key: u32,
    },
    /// Answer to a ping. Everything needed to decide whether the server
    /// is worth querying further, before any expensive detail moves.
    GamePingResponse {
        flags: u8,
        key: u32,
        /// Must equal [`VERSION_TAG`] or the server is dropped outright.
        version_tag: String,
        /// The server's protocol revision.
        protocol_current: u32,
        /// The oldest protocol revision the server accepts.
        protocol_min: u32,
        /// The server's build number; matched exactly against ours.
        build_version: u32,
        /// Display name, clipped to 24 characters by the responder.
        name: String,
    },
    /// Detail request, sent only to servers that passed the ping gate.
    GameInfoRequest {
        flags: u8,
        key: u32,
    },
    /// The full descriptive record a browser row is built from. Fields
    /// arrive in filter-chain order so a rejecting client can stop
    /// caring early; the record is either kept whole or removed whole.
    GameInfoResponse {
        flags: u8,
        key: u32,
        game_type: String,
        mission_type: String,
        /// Mission file name; readers strip a trailing ".mis".
        mission_name: String,
        /// Wire status byte (dedicated/passworded/linux bits).
        status: u8,
        num_players: u8,
        max_players: u8,
        num_bots: u8,
        /// Server CPU speed in MHz.
        cpu_speed: u16,
        /// Operator-written description line.
        info_string: String,
        /// Current game status; the one long-string field, since status
        /// text routinely exceeds 255 bytes.
        status_string: String,
    },
    /// Unsolicited keep-alive a server sends its masters every ten
    /// seconds; missing a few just ages the listing out.
    GameHeartbeat {
        /// Conveys the server flavor to the master.
        flags: u8,
        key: u32,
    },
    /// Client asking a master to set up a hole-punched connection to a
    /// server it cannot reach directly.
    MasterServerRequestArrangedConnection {
        flags: u8,
        key: u32,
        target: NetAddress,
    },
    /// Master telling the hosting side that a client wants an arranged
    /// connection, with every address the client might be reachable at.
    MasterServerClientRequestedArrangedConnection {
        flags: u8,
        key: u32,
        /// Master-assigned id for this arrangement attempt.
        client_id: u16,
        candidates: Vec<NetAddress>,
    },
    /// Host's acknowledgement back to the master.
    MasterServerAcceptArrangedConnection {
        flags: u8,
        key: u32,
        client_id: u16,
    },
    /// Master relaying acceptance to the requesting client, with the
    /// host's candidate addresses for the punch.
    MasterServerArrangedConnectionAccepted {
        flags: u8,
        key: u32,
        candidates: Vec<NetAddress>,
    },
    /// Arrangement failed: 0 = no such server, 1 = server rejected.
    MasterServerArrangedConnectionRejected {
        flags: u8,
        key: u32,
        reason: u8,
    },
    /// Ping forwarded via the master so the target server also sends
    /// toward the client, opening its NAT from the inside.
    MasterServerGamePingRequest {
        flags: u8,
        key: u32,
        /// The server the master should poke.
        target: NetAddress,
        /// Header the forwarded ping should carry, preserved end to end
        /// so the reply still correlates with the client's probe.
        peer_flags: u8,
        peer_key: u32,
    },
    /// The target's ping answer, wrapped with its address so the client
    /// knows which probe the relayed reply belongs to.
    MasterServerGamePingResponse {
        flags: u8,
        key: u32,
        target: NetAddress,
        /// The complete relayed packet, nested verbatim.
        inner: Box<Packet>,
    },
    /// Info-query twin of [`Packet::MasterServerGamePingRequest`].
    MasterServerGameInfoRequest {
        flags: u8,
        key: u32,
        target: NetAddress,
        peer_flags: u8,
        peer_key: u32,
    },
    /// Info-response twin of [`Packet::MasterServerGamePingResponse`].
    MasterServerGameInfoResponse {
        flags: u8,
        key: u32,
        target: NetAddress,
        inner: Box<Packet>,
    },
    /// Asks a master to allocate a relay toward `target`, the fallback
    /// when hole punching fails outright.
    MasterServerRelayRequest {
        flags: u8,
        key: u32,
        target: NetAddress,
    },
    /// The allocated relay endpoint. Each side attaches by sending
    /// `MasterServerRelayReady` there with its role in the flags byte.
    MasterServerRelayResponse {
        flags: u8,
        key: u32,
        /// Whether the receiver plays the host role on the relay.
        is_host: bool,
        relay: NetAddress,
    },
    /// Attach/ready signal on the relay itself; from the relay it means
    /// both ends are attached and the session layer can connect.
    MasterServerRelayReady {
        flags: u8,
        key: u32,
    },
    /// Invite-code lookup, sent to every master and broadcast on the
    /// LAN so private matches are joinable either way.
    MasterServerJoinInvite {
        flags: u8,
        key: u32,
        invite_code: String,
    },
    /// Lookup result. `found` false means the code matched nothing.
    MasterServerJoinInviteResponse {
        flags: u8,
        key: u32,
        found: bool,
        /// `255.255.255.255` means "substitute the responder's source
        /// IP": a LAN host does not know its own best address.
        address: NetAddress,
    },
}

fn write_address(w: &mut PacketWriter, addr: &NetAddress) {
    let (host, port) = match addr {
        NetAddress::Ip { host, port } => (*host, *port),
        // The wire only carries IPv4; an IPX endpoint has no master-visible
        // form and encodes as the zero host.
        NetAddress::Ipx { port, .. } => ([0, 0, 0, 0], *port),
    };
    for b in host {
        w.write_u8(b);
    }
    w.write_u16(port);
}

fn read_address(r: &mut PacketReader) -> Result<NetAddress, WireError> {
    let host = [r.read_u8()?, r.read_u8()?, r.read_u8()?, r.read_u8()?];
    let port = r.read_u16()?;
    Ok(NetAddress::Ip { host, port })
}

impl Packet {
    pub fn type_byte(&self) -> u8 {
        use types::*;
        match self {
            Packet::GameTypesRequest { .. } => GAME_TYPES_REQUEST,
            Packet::GameTypesResponse { .. } => GAME_TYPES_RESPONSE,
            Packet::MasterServerListRequest { .. } => MASTER_SERVER_LIST_REQUEST,
            Packet::MasterServerListResponse { .. } => MASTER_SERVER_LIST_RESPONSE,
            Packet::GameMasterInfoRequest { .. } => GAME_MASTER_INFO_REQUEST,
            Packet::GameMasterInfoResponse { .. } => GAME_MASTER_INFO_RESPONSE,
            Packet::GamePingRequest { .. } => GAME_PING_REQUEST,
            Packet::GamePingResponse { .. } => GAME_PING_RESPONSE,
            Packet::GameInfoRequest { .. } => GAME_INFO_REQUEST,
            Packet::GameInfoResponse { .. } => GAME_INFO_RESPONSE,
            Packet::GameHeartbeat { .. } => GAME_HEARTBEAT,
            Packet::MasterServerRequestArrangedConnection { .. } => {
                MASTER_SERVER_REQUEST_ARRANGED_CONNECTION
            }
            Packet::MasterServerClientRequestedArrangedConnection { .. } => {
                MASTER_SERVER_CLIENT_REQUESTED_ARRANGED_CONNECTION
            }
            Packet::MasterServerAcceptArrangedConnection { .. } => {
                MASTER_SERVER_ACCEPT_ARRANGED_CONNECTION
            }
            Packet::MasterServerArrangedConnectionAccepted { .. } => {
                MASTER_SERVER_ARRANGED_CONNECTION_ACCEPTED
            }
            Packet::MasterServerArrangedConnectionRejected { .. } => {
                MASTER_SERVER_ARRANGED_CONNECTION_REJECTED
            }
            Packet::MasterServerGamePingRequest { .. } => MASTER_SERVER_GAME_PING_REQUEST,
            Packet::MasterServerGamePingResponse { .. } => MASTER_SERVER_GAME_PING_RESPONSE,
            Packet::MasterServerGameInfoRequest { .. } => MASTER_SERVER_GAME_INFO_REQUEST,
            Packet::MasterServerGameInfoResponse { .. } => MASTER_SERVER_GAME_INFO_RESPONSE,
            Packet::MasterServerRelayRequest { .. } => MASTER_SERVER_RELAY_REQUEST,
            Packet::MasterServerRelayResponse { .. } => MASTER_SERVER_RELAY_RESPONSE,
            Packet::MasterServerRelayReady { .. } => MASTER_SERVER_RELAY_READY,
            Packet::MasterServerJoinInvite { .. } => MASTER_SERVER_JOIN_INVITE,
            Packet::MasterServerJoinInviteResponse { .. } => MASTER_SERVER_JOIN_INVITE_RESPONSE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        self.write(&mut w);
        w.into_bytes()
    }

    fn write(&self, w: &mut PacketWriter) {
        w.write_u8(self.type_byte());
        match self {
            Packet::GameTypesRequest { flags, key }
            | Packet::GameMasterInfoRequest { flags, key }
            | Packet::GamePingRequest { flags, key }
            | Packet::GameInfoRequest { flags, key }
            | Packet::GameHeartbeat { flags, key }
            | Packet::MasterServerRelayReady { flags, key } => {
                w.write_u8(*flags);
                w.write_u32(*key);
            }
            Packet::GameTypesResponse {
                flags,
                key,
                game_types,
                mission_types,
            } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_u8(game_types.len().min(255) as u8);
                for t in game_types.iter().take(255) {
                    w.write_string8(t);
                }
                w.write_u8(mission_types.len().min(255) as u8);
                for t in mission_types.iter().take(255) {
                    w.write_string8(t);
                }
            }
            Packet::MasterServerListRequest {
                flags,
                key,
                packet_index,
                game_type,
                mission_type,
                min_players,
                max_players,
                region_mask,
                version,
                filter_flags,
                max_bots,
                min_cpu,
                buddy_list,
            } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_u8(*packet_index);
                w.write_string8(game_type);
                w.write_string8(mission_type);
                w.write_u8(*min_players);
                w.write_u8(*max_players);
                w.write_u32(*region_mask);
                w.write_u32(*version);
                w.write_u8(*filter_flags);
                w.write_u8(*max_bots);
                w.write_u16(*min_cpu);
                w.write_u8(buddy_list.len().min(255) as u8);
                for buddy in buddy_list.iter().take(255) {
                    w.write_u32(*buddy);
                }
            }
            Packet::MasterServerListResponse {
                flags,
                key,
                packet_index,
                packet_total,
                servers,
            } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_u8(*packet_index);
                w.write_u8(*packet_total);
                w.write_u16(servers.len().min(u16::MAX as usize) as u16);
                for server in servers.iter().take(u16::MAX as usize) {
                    write_address(w, server);
                }
            }
            Packet::GameMasterInfoResponse {
                flags,
                key,
                game_type,
                mission_type,
                invite_code,
                max_players,
                region_mask,
                version,
                status,
                num_bots,
                cpu_speed,
                guids,
            } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_string8(game_type);
                w.write_string8(mission_type);
                w.write_string8(invite_code);
                w.write_u8(*max_players);
                w.write_u32(*region_mask);
                w.write_u32(*version);
                w.write_u8(*status);
                w.write_u8(*num_bots);
                w.write_u16(*cpu_speed);
                w.write_u8(guids.len().min(255) as u8);
                for guid in guids.iter().take(255) {
                    w.write_u32(*guid);
                }
            }
            Packet::GamePingResponse {
                flags,
                key,
                version_tag,
                protocol_current,
                protocol_min,
                build_version,
                name,
            } => {
                let tagged = *flags & QUERY_FLAG_NO_STRING_COMPRESS == 0;
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_string(version_tag, tagged);
                w.write_u32(*protocol_current);
                w.write_u32(*protocol_min);
                w.write_u32(*build_version);
                w.write_string(name, tagged);
            }
            Packet::GameInfoResponse {
                flags,
                key,
                game_type,
                mission_type,
                mission_name,
                status,
                num_players,
                max_players,
                num_bots,
                cpu_speed,
                info_string,
                status_string,
            } => {
                let tagged = *flags & QUERY_FLAG_NO_STRING_COMPRESS == 0;
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_string(game_type, tagged);
                w.write_string(mission_type, tagged);
                w.write_string(mission_name, tagged);
                w.write_u8(*status);
                w.write_u8(*num_players);
                w.write_u8(*max_players);
                w.write_u8(*num_bots);
                w.write_u16(*cpu_speed);
                w.write_string(info_string, tagged);
                w.write_string16(status_string);
            }
            Packet::MasterServerRequestArrangedConnection { flags, key, target }
            | Packet::MasterServerRelayRequest { flags, key, target } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                write_address(w, target);
            }
            Packet::MasterServerClientRequestedArrangedConnection {
                flags,
                key,
                client_id,
                candidates,
            } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_u16(*client_id);
                w.write_u8(candidates.len().min(255) as u8);
                for candidate in candidates.iter().take(255) {
                    write_address(w, candidate);
                }
            }
            Packet::MasterServerAcceptArrangedConnection { flags, key, client_id } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_u16(*client_id);
            }
            Packet::MasterServerArrangedConnectionAccepted { flags, key, candidates } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_u8(candidates.len().min(255) as u8);
                for candidate in candidates.iter().take(255) {
                    write_address(w, candidate);
                }
            }
            Packet::MasterServerArrangedConnectionRejected { flags, key, reason } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_u8(*reason);
            }
            Packet::MasterServerGamePingRequest {
                flags,
                key,
                target,
                peer_flags,
                peer_key,
            }
            | Packet::MasterServerGameInfoRequest {
                flags,
                key,
                target,
                peer_flags,
                peer_key,
            } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                write_address(w, target);
                w.write_u8(*peer_flags);
                w.write_u32(*peer_key);
            }
            Packet::MasterServerGamePingResponse { flags, key, target, inner }
            | Packet::MasterServerGameInfoResponse { flags, key, target, inner } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                write_address(w, target);
                inner.write(w);
            }
            Packet::MasterServerRelayResponse { flags, key, is_host, relay } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_u8(*is_host as u8);
                write_address(w, relay);
            }
            Packet::MasterServerJoinInvite { flags, key, invite_code } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_string8(invite_code);
            }
            Packet::MasterServerJoinInviteResponse {
                flags,
                key,
                found,
                address,
            } => {
                w.write_u8(*flags);
                w.write_u32(*key);
                w.write_u8(*found as u8);
                write_address(w, address);
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Packet, WireError> {
        let mut r = PacketReader::new(data);
        Packet::read(&mut r)
    }

    fn read(r: &mut PacketReader) -> Result<Packet, WireError> {
        use types::*;
        let type_byte = r.read_u8()?;
        let flags = r.read_u8()?;
        let key = r.read_u32()?;
        let packet = match type_byte {
            GAME_TYPES_REQUEST => Packet::GameTypesRequest { flags, key },
            GAME_TYPES_RESPONSE => {
                let mut game_types = Vec::new();
                for _ in 0..r.read_u8()? {
                    game_types.push(r.read_string8()?);
                }
                let mut mission_types = Vec::new();
                for _ in 0..r.read_u8()? {
                    mission_types.push(r.read_string8()?);
                }
                Packet::GameTypesResponse {
                    flags,
                    key,
                    game_types,
                    mission_types,
                }
            }
            MASTER_SERVER_LIST_REQUEST => {
                let packet_index = r.read_u8()?;
                let game_type = r.read_string8()?;
                let mission_type = r.read_string8()?;
                let min_players = r.read_u8()?;
                let max_players = r.read_u8()?;
                let region_mask = r.read_u32()?;
                let version = r.read_u32()?;
                let filter_flags = r.read_u8()?;
                let max_bots = r.read_u8()?;
                let min_cpu = r.read_u16()?;
                let mut buddy_list = Vec::new();
                for _ in 0..r.read_u8()? {
                    buddy_list.push(r.read_u32()?);
                }
                Packet::MasterServerListRequest {
                    flags,
                    key,
                    packet_index,
                    game_type,
                    mission_type,
                    min_players,
                    max_players,
                    region_mask,
                    version,
                    filter_flags,
                    max_bots,
                    min_cpu,
                    buddy_list,
                }
            }
            MASTER_SERVER_LIST_RESPONSE => {
                let packet_index = r.read_u8()?;
                let packet_total = r.read_u8()?;
                let count = r.read_u16()?;
                let mut servers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    servers.push(read_address(r)?);
                }
                Packet::MasterServerListResponse {
                    flags,
                    key,
                    packet_index,
                    packet_total,
                    servers,
                }
            }
            GAME_MASTER_INFO_REQUEST => Packet::GameMasterInfoRequest { flags, key },
            GAME_MASTER_INFO_RESPONSE => {
                let game_type = r.read_string8()?;
                let mission_type = r.read_string8()?;
                let invite_code = r.read_string8()?;
                let max_players = r.read_u8()?;
                let region_mask = r.read_u32()?;
                let version = r.read_u32()?;
                let status = r.read_u8()?;
                let num_bots = r.read_u8()?;
                let cpu_speed = r.read_u16()?;
                let mut guids = Vec::new();
                for _ in 0..r.read_u8()? {
                    guids.push(r.read_u32()?);
                }
                Packet::GameMasterInfoResponse {
                    flags,
                    key,
                    game_type,
                    mission_type,
                    invite_code,
                    max_players,
                    region_mask,
                    version,
                    status,
                    num_bots,
                    cpu_speed,
                    guids,
                }
            }
            GAME_PING_REQUEST => Packet::GamePingRequest { flags, key },
            GAME_PING_RESPONSE => {
                let tagged = flags & QUERY_FLAG_NO_STRING_COMPRESS == 0;
                Packet::GamePingResponse {
                    flags,
                    key,
                    version_tag: r.read_string(tagged)?,
                    protocol_current: r.read_u32()?,
                    protocol_min: r.read_u32()?,
                    build_version: r.read_u32()?,
                    name: r.read_string(tagged)?,
                }
            }
            GAME_INFO_REQUEST => Packet::GameInfoRequest { flags, key },
            GAME_INFO_RESPONSE => {
                let tagged = flags & QUERY_FLAG_NO_STRING_COMPRESS == 0;
                Packet::GameInfoResponse {
                    flags,
                    key,
                    game_type: r.read_string(tagged)?,
                    mission_type: r.read_string(tagged)?,
                    mission_name: r.read_string(tagged)?,
                    status: r.read_u8()?,
                    num_players: r.read_u8()?,
                    max_players: r.read_u8()?,
                    num_bots: r.read_u8()?,
                    cpu_speed: r.read_u16()?,
                    info_string: r.read_string(tagged)?,
                    status_string: r.read_string16()?,
                }
            }
            GAME_HEARTBEAT => Packet::GameHeartbeat { flags, key },
            MASTER_SERVER_REQUEST_ARRANGED_CONNECTION => {
                Packet::MasterServerRequestArrangedConnection {
                    flags,
                    key,
                    target: read_address(r)?,
                }
            }
            MASTER_SERVER_CLIENT_REQUESTED_ARRANGED_CONNECTION => {
                let client_id = r.read_u16()?;
                let mut candidates = Vec::new();
                for _ in 0..r.read_u8()? {
                    candidates.push(read_address(r)?);
                }
                Packet::MasterServerClientRequestedArrangedConnection {
                    flags,
                    key,
                    client_id,
                    candidates,
                }
            }
            MASTER_SERVER_ACCEPT_ARRANGED_CONNECTION => {
                Packet::MasterServerAcceptArrangedConnection {
                    flags,
                    key,
                    client_id: r.read_u16()?,
                }
            }
            MASTER_SERVER_ARRANGED_CONNECTION_ACCEPTED => {
                let mut candidates = Vec::new();
                for _ in 0..r.read_u8()? {
                    candidates.push(read_address(r)?);
                }
                Packet::MasterServerArrangedConnectionAccepted {
                    flags,
                    key,
                    candidates,
                }
            }
            MASTER_SERVER_ARRANGED_CONNECTION_REJECTED => {
                Packet::MasterServerArrangedConnectionRejected {
                    flags,
                    key,
                    reason: r.read_u8()?,
                }
            }
            MASTER_SERVER_GAME_PING_REQUEST | MASTER_SERVER_GAME_INFO_REQUEST => {
                let target = read_address(r)?;
                let peer_flags = r.read_u8()?;
                let peer_key = r.read_u32()?;
                if type_byte == MASTER_SERVER_GAME_PING_REQUEST {
                    Packet::MasterServerGamePingRequest {
                        flags,
                        key,
                        target,
                        peer_flags,
                        peer_key,
                    }
                } else {
                    Packet::MasterServerGameInfoRequest {
                        flags,
                        key,
                        target,
                        peer_flags,
                        peer_key,
                    }
                }
            }
            MASTER_SERVER_GAME_PING_RESPONSE | MASTER_SERVER_GAME_INFO_RESPONSE => {
                let target = read_address(r)?;
                let inner = Box::new(Packet::read(r)?);
                if type_byte == MASTER_SERVER_GAME_PING_RESPONSE {
                    Packet::MasterServerGamePingResponse {
                        flags,
                        key,
                        target,
                        inner,
                    }
                } else {
                    Packet::MasterServerGameInfoResponse {
                        flags,
                        key,
                        target,
                        inner,
                    }
                }
            }
            MASTER_SERVER_RELAY_REQUEST => Packet::MasterServerRelayRequest {
                flags,
                key,
                target: read_address(r)?,
            },
            MASTER_SERVER_RELAY_RESPONSE => Packet::MasterServerRelayResponse {
                flags,
                key,
                is_host: r.read_u8()? != 0,
                relay: read_address(r)?,
            },
            MASTER_SERVER_RELAY_READY => Packet::MasterServerRelayReady { flags, key },
            MASTER_SERVER_JOIN_INVITE => Packet::MasterServerJoinInvite {
                flags,
                key,
                invite_code: r.read_string8()?,
            },
            MASTER_SERVER_JOIN_INVITE_RESPONSE => Packet::MasterServerJoinInviteResponse {
                flags,
                key,
                found: r.read_u8()? != 0,
                address: read_address(r)?,
            },
            other => return Err(WireError::UnknownPacketType(other)),
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> NetAddress {
        NetAddress::Ip {
            host: [192, 0, 2, last],
            port,
        }
    }

    fn sample_packets() -> Vec<Packet> {
        vec![
            Packet::GameTypesRequest { flags: 0, key: 7 },
            Packet::GameTypesResponse {
                flags: 0,
                key: 7,
                game_types: vec!["CTF".into(), "DM".into()],
                mission_types: vec!["any".into()],
            },
            Packet::MasterServerListRequest {
                flags: QUERY_FLAG_NO_STRING_COMPRESS,
                key: key_field(3, 0x1234),
                packet_index: 255,
                game_type: "CTF".into(),
                mission_type: "any".into(),
                min_players: 1,
                max_players: 32,
                region_mask: 0xFFFF_FFFF,
                version: BUILD_VERSION,
                filter_flags: FILTER_FLAG_DEDICATED,
                max_bots: 4,
                min_cpu: 400,
                buddy_list: vec![11, 22, 33],
            },
            Packet::MasterServerListResponse {
                flags: 1,
                key: key_field(3, 0x1234),
                packet_index: 0,
                packet_total: 3,
                servers: vec![addr(10, 28000), addr(11, 28001)],
            },
            Packet::GameMasterInfoRequest { flags: 0, key: 1 },
            Packet::GameMasterInfoResponse {
                flags: 0,
                key: 1,
                game_type: "CTF".into(),
                mission_type: "any".into(),
                invite_code: "SECRET".into(),
                max_players: 14,
                region_mask: 2,
                version: BUILD_VERSION,
                status: 0x05,
                num_bots: 1,
                cpu_speed: 2400,
                guids: vec![1001, 1002, 0],
            },
            Packet::GamePingRequest { flags: 0, key: 2 },
            Packet::GamePingResponse {
                flags: 0,
                key: 2,
                version_tag: VERSION_TAG.into(),
                protocol_current: CURRENT_PROTOCOL_VERSION,
                protocol_min: MIN_REQUIRED_PROTOCOL_VERSION,
                build_version: BUILD_VERSION,
                name: "Sunny's arena".into(),
            },
            Packet::GameInfoRequest { flags: 0, key: 3 },
            Packet::GameInfoResponse {
                flags: 0,
                key: 3,
                game_type: "CTF".into(),
                mission_type: "any".into(),
                mission_name: "canyon".into(),
                status: 0x01,
                num_players: 3,
                max_players: 16,
                num_bots: 0,
                cpu_speed: 2400,
                info_string: "bring a team".into(),
                status_string: "round 2 of 3".into(),
            },
            Packet::GameHeartbeat { flags: 0, key: 0 },
            Packet::MasterServerRequestArrangedConnection {
                flags: 0,
                key: 4,
                target: addr(20, 28000),
            },
            Packet::MasterServerClientRequestedArrangedConnection {
                flags: 0,
                key: 4,
                client_id: 99,
                candidates: vec![addr(20, 28000), addr(21, 28000)],
            },
            Packet::MasterServerAcceptArrangedConnection {
                flags: 0,
                key: 4,
                client_id: 99,
            },
            Packet::MasterServerArrangedConnectionAccepted {
                flags: 0,
                key: 4,
                candidates: vec![addr(22, 28000)],
            },
            Packet::MasterServerArrangedConnectionRejected {
                flags: 0,
                key: 4,
                reason: 1,
            },
            Packet::MasterServerGamePingRequest {
                flags: 0,
                key: 5,
                target: addr(30, 28000),
                peer_flags: 0,
                peer_key: key_field(3, 9),
            },
            Packet::MasterServerGamePingResponse {
                flags: 0,
                key: 5,
                target: addr(30, 28000),
                inner: Box::new(Packet::GamePingResponse {
                    flags: 0,
                    key: key_field(3, 9),
                    version_tag: VERSION_TAG.into(),
                    protocol_current: CURRENT_PROTOCOL_VERSION,
                    protocol_min: MIN_REQUIRED_PROTOCOL_VERSION,
                    build_version: BUILD_VERSION,
                    name: "behind a NAT".into(),
                }),
            },
            Packet::MasterServerGameInfoRequest {
                flags: 0,
                key: 6,
                target: addr(30, 28000),
                peer_flags: 0,
                peer_key: key_field(3, 10),
            },
            Packet::MasterServerRelayRequest {
                flags: 0,
                key: 8,
                target: addr(40, 28000),
            },
            Packet::MasterServerRelayResponse {
                flags: 0,
                key: 8,
                is_host: true,
                relay: addr(50, 29000),
            },
            Packet::MasterServerRelayReady { flags: 1, key: 0 },
            Packet::MasterServerJoinInvite {
                flags: 0,
                key: 0,
                invite_code: "SECRET".into(),
            },
            Packet::MasterServerJoinInviteResponse {
                flags: 0,
                key: 0,
                found: true,
                address: NetAddress::ip_broadcast(28000),
            },
        ]
    }

    #[test]
    fn every_layout_round_trips() {
        for packet in sample_packets() {
            let bytes = packet.encode();
            let decoded = Packet::decode(&bytes).unwrap();
            assert_eq!(decoded, packet, "round trip failed for {:?}", packet);
        }
    }

    #[test]
    fn compressed_and_plain_string_paths_round_trip() {
        for flags in [0, QUERY_FLAG_NO_STRING_COMPRESS] {
            let packet = Packet::GamePingResponse {
                flags,
                key: 1,
                version_tag: VERSION_TAG.into(),
                protocol_current: CURRENT_PROTOCOL_VERSION,
                protocol_min: MIN_REQUIRED_PROTOCOL_VERSION,
                build_version: BUILD_VERSION,
                name: "the eastern test server".into(),
            };
            let decoded = Packet::decode(&packet.encode()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let packet = Packet::GamePingRequest {
            flags: QUERY_FLAG_OFFLINE,
            key: key_field(2, 0xABCD),
        };
        let bytes = packet.encode();
        assert_eq!(bytes[0], types::GAME_PING_REQUEST);
        assert_eq!(bytes[1], QUERY_FLAG_OFFLINE);
        // key field is little-endian (session << 16) | key
        assert_eq!(
            u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            0x0002_ABCD
        );
        assert_eq!(bytes.len(), 6);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = Packet::GamePingRequest { flags: 0, key: 0 }.encode();
        bytes[0] = 0xEE;
        assert_eq!(
            Packet::decode(&bytes),
            Err(WireError::UnknownPacketType(0xEE))
        );
    }

    #[test]
    fn truncation_is_rejected() {
        let bytes = Packet::MasterServerListResponse {
            flags: 0,
            key: 1,
            packet_index: 0,
            packet_total: 1,
            servers: vec![addr(10, 28000)],
        }
        .encode();
        for len in 0..bytes.len() {
            assert!(Packet::decode(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn key_field_packs_session_and_nonce() {
        assert_eq!(key_field(0, 0), 0);
        assert_eq!(key_field(1, 0x1_0005), 0x0001_0005);
        assert_eq!(key_field(0xFFFF, 0xFFFF), 0xFFFF_FFFF);
    }
}
