//! # Discovery Protocol Library
//!
//! Shared foundation for the game-server discovery subsystem: the binary
//! wire protocol, the data model for discovered servers and master
//! directories, and the configuration boundary both sides read through.
//! The client's query engine and the server's responder both build on
//! exactly these types, which is what keeps a probe sent by one side
//! decodable and correlatable by the other.
//!
//! ## Module Organization
//!
//! ### Address Module (`addr`)
//! The `NetAddress` endpoint union (IPv4 plus legacy IPX broadcast),
//! parsing, display, and socket-address conversion. Addresses are the
//! identity key for everything downstream: ping queues, finished sets
//! and server records all compare them field-for-field.
//!
//! ### Wire Module (`wire`)
//! Little-endian packet reader/writer with the protocol's three string
//! framings (short, long, compressed) and the codec error type.
//!
//! ### Huffman Module (`huffman`)
//! The fixed-table coder behind the compressed string framing. Both ends
//! derive the identical tree, so nothing about it travels on the wire.
//!
//! ### Packet Module (`packet`)
//! The full packet family (master list paging, ping/info queries,
//! heartbeats, and the NAT-traversal rendezvous messages) with bit-exact
//! `encode`/`decode` and the protocol constants (`"VER1"`, protocol and
//! build versions, query and filter flag bits).
//!
//! ### Server Info Module (`server_info`)
//! `ServerInfo` records keyed by address, the `ServerStatus` bitset whose
//! low byte is the wire status byte, and `MasterInfo` directory entries.
//!
//! ### Config Module (`config`)
//! The read-only string key/value `Config` trait, the in-memory
//! `TableConfig`, master-list and favorites parsing, and the well-known
//! key names.
//!
//! ## Usage Examples
//!
//! Every request carries the shared header: a packet type byte, a
//! `flags` byte, and a 32-bit key field packing the sender's session
//! generation with a per-request nonce. Responders echo the header
//! verbatim, which is the whole correlation story:
//!
//! ```rust
//! use shared::packet::{key_field, types, Packet};
//!
//! // Session 3, request nonce 0x2A: the key field a live probe carries.
//! let request = Packet::GamePingRequest {
//!     flags: 0,
//!     key: key_field(3, 0x2A),
//! };
//!
//! let bytes = request.encode();
//! assert_eq!(bytes[0], types::GAME_PING_REQUEST);
//! assert_eq!(bytes.len(), 6); // type + flags + key, nothing else
//!
//! // The layout is bit-exact, so decoding gives the packet back.
//! let decoded = Packet::decode(&bytes).unwrap();
//! assert_eq!(decoded, request);
//! ```
//!
//! Both sides read their knobs through the string-typed [`Config`]
//! boundary; parsing and defaulting happen here, not at the call sites:
//!
//! ```rust
//! use shared::{Config, TableConfig};
//!
//! let mut config = TableConfig::new();
//! config.set("Pref::Server::MaxPlayers", "16");
//!
//! assert_eq!(config.get_u8("Pref::Server::MaxPlayers"), 16);
//! // Missing or garbled keys quietly default instead of failing.
//! assert_eq!(config.get_u8("Pref::Server::PrivateSlots"), 0);
//! ```
//!
//! ## Design Philosophy
//!
//! ### Lossy By Contract
//! The transport is connectionless and nothing in this crate retries or
//! acknowledges. Loss handling lives entirely in the client's query
//! engine, whose bounded-retry timers treat an unsent datagram and a
//! dropped one identically. That is also why [`Transport`] returns a
//! plain `io::Result`: the caller logs and moves on.
//!
//! ### Deterministic Encoding
//! Integers are always little-endian and the compressed string form is
//! built from a fixed table, so any two builds of this crate produce
//! byte-identical packets. Round-trip equality (`decode(encode(p)) ==
//! p`) holds for every representable packet and is what the codec tests
//! pin down.
//!
//! ### String-Typed Configuration
//! The original environment publishes everything as console variables,
//! so the [`Config`] trait keeps that shape: string getters with typed
//! helpers layered on top. Hosts can back it with CLI flags, a JSON
//! file, or a live scripting host without the engines noticing.

pub mod addr;
pub mod config;
pub mod huffman;
pub mod packet;
pub mod server_info;
pub mod wire;

pub use addr::NetAddress;
pub use config::{Config, TableConfig};
pub use packet::Packet;
pub use server_info::{MasterInfo, ServerInfo, ServerStatus};
pub use wire::WireError;

/// Milliseconds on the host-supplied monotonic virtual clock.
///
/// The engines never read a clock of their own; every entry point takes
/// one of these. A `u32` covers about 49 days of uptime, which matches
/// the original engine's millisecond counter and keeps the key/timer
/// arithmetic in plain integer math.
pub type Millis = u32;

/// Outbound side of the UDP socket, as the engines see it.
///
/// Implementations must not block; a send that cannot complete is simply
/// lost, which the retry logic upstream already tolerates. Test hosts
/// substitute a recording implementation to capture traffic.
pub trait Transport {
    fn send_to(&mut self, addr: &NetAddress, data: &[u8]) -> std::io::Result<()>;
}

/// Encodes and transmits one packet, logging and swallowing send errors;
/// the protocol treats an unsendable datagram exactly like a lost one.
pub fn send_packet(transport: &mut dyn Transport, addr: &NetAddress, packet: &Packet) {
    if let Err(e) = transport.send_to(addr, &packet.encode()) {
        log::warn!("Failed to send packet to {}: {}", addr, e);
    }
}
