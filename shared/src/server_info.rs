//! Discovered-server records and the status bitset they carry.

use std::fmt;

use crate::addr::NetAddress;

/// Status bits for a [`ServerInfo`].
///
/// The low byte is exactly the wire status byte of the info responses;
/// lifecycle bits the client tracks locally live in the high byte. A
/// freshly created record has no bits set ("new").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatus(pub u16);

impl ServerStatus {
    // Wire bits, written by responders into the status byte.

    /// The server runs without a local player.
    pub const DEDICATED: u16 = 1 << 0;
    /// Joining requires a password. Set from the password's presence,
    /// never its content.
    pub const PASSWORDED: u16 = 1 << 1;
    /// The server is a Linux build; surfaced for filtering only.
    pub const LINUX: u16 = 1 << 2;
    /// Invite-only match; carried in master-info responses so the
    /// directory can hide it from open browsing.
    pub const PRIVATE: u16 = 1 << 3;

    // Client-side lifecycle bits. These live above the wire byte so a
    // status-byte overwrite naturally resets the record's lifecycle.

    /// An info query for this record is in flight.
    pub const QUERYING: u16 = 1 << 8;
    /// A single-server refresh; filter rejection is suspended so the
    /// record survives whatever the new answer says.
    pub const UPDATING: u16 = 1 << 9;
    /// The record completed an info exchange and counts as found.
    pub const RESPONDED: u16 = 1 << 10;
    /// The record ran out of retries; kept for display, never
    /// re-contacted within the same session. Mutually exclusive with
    /// `RESPONDED` by construction.
    pub const TIMED_OUT: u16 = 1 << 11;

    pub fn new() -> ServerStatus {
        ServerStatus(0)
    }

    /// Builds the bitset from a wire status byte, clearing every
    /// lifecycle bit. Info responses overwrite the status this way.
    pub fn from_wire(byte: u8) -> ServerStatus {
        ServerStatus(byte as u16)
    }

    /// The low byte as it travels on the wire.
    pub fn wire_byte(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn test(&self, bits: u16) -> bool {
        self.0 & bits != 0
    }

    pub fn set(&mut self, bits: u16) {
        self.0 |= bits;
    }

    pub fn is_dedicated(&self) -> bool {
        self.test(Self::DEDICATED)
    }

    pub fn is_passworded(&self) -> bool {
        self.test(Self::PASSWORDED)
    }

    pub fn is_querying(&self) -> bool {
        self.test(Self::QUERYING)
    }

    pub fn is_updating(&self) -> bool {
        self.test(Self::UPDATING)
    }

    pub fn has_responded(&self) -> bool {
        self.test(Self::RESPONDED)
    }

    pub fn timed_out(&self) -> bool {
        self.test(Self::TIMED_OUT)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Persistent record for one discovered game server.
///
/// A record is created the moment an address first answers a ping (or
/// earlier, for bookmarked favorites) and then filled in field by field
/// as responses arrive. It lives until a filter rejects it, the host
/// removes it, or the list is cleared; a timed-out record stays visible
/// so the browser can show what stopped answering.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// The server's endpoint; the unique key for the record. Every
    /// queue and set in the pipeline identifies the server by this.
    pub address: NetAddress,
    /// Lifecycle and wire status bits; see [`ServerStatus`].
    pub status: ServerStatus,
    /// Display name from the ping response, or the user's bookmark
    /// name for favorites. Once set it is never overwritten, so a
    /// renamed favorite keeps the name its owner gave it.
    pub name: String,
    /// Rules set the server runs ("CTF", ...); filter-compared
    /// case-insensitively.
    pub game_type: String,
    /// Mission category, filtered like the game type.
    pub mission_type: String,
    /// Current map, with any trailing ".mis" extension stripped at
    /// parse time so the browser shows a clean name.
    pub mission_name: String,
    /// Operator-written description line.
    pub info_string: String,
    /// Free-form current-game status; the only long-string field.
    pub status_string: String,
    /// Measured round-trip time in milliseconds, from the send
    /// timestamp of whichever ping attempt the server answered.
    pub ping: u32,
    pub num_players: u8,
    pub max_players: u8,
    /// Bots padding the player count; filterable because bot-heavy
    /// servers often look fuller than they play.
    pub num_bots: u8,
    /// Server CPU speed in MHz, a rough simulation-quality signal from
    /// the era the protocol comes from.
    pub cpu_speed: u16,
    /// Build number reported by the ping response.
    pub version: u32,
    /// Learned over the LAN (broadcast reply) rather than from a master.
    pub is_local: bool,
    /// Bookmarked by the user; favorites are pre-created and pinged
    /// even when no master is reachable.
    pub is_favorite: bool,
}

impl ServerInfo {
    pub fn new(address: NetAddress) -> ServerInfo {
        ServerInfo {
            address,
            status: ServerStatus::new(),
            name: String::new(),
            game_type: String::new(),
            mission_type: String::new(),
            mission_name: String::new(),
            info_string: String::new(),
            status_string: String::new(),
            ping: 0,
            num_players: 0,
            max_players: 0,
            num_bots: 0,
            cpu_speed: 0,
            version: 0,
            is_local: false,
            is_favorite: false,
        }
    }
}

/// A master server directory entry.
///
/// Parsed from the `Server::Master<n>` config entries. Region 0 is
/// invalid and never parses, which keeps "no region configured" from
/// silently matching a zeroed preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterInfo {
    pub address: NetAddress,
    /// Coarse geographic bucket; master selection prefers entries whose
    /// region equals the local preference before settling for any.
    pub region: u32,
}
