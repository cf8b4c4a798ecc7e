//! The discovery query engine.
//!
//! One `QueryEngine` value owns everything a query touches: the session
//! and key counters, the ping/query/list-packet queues, the discovered
//! server list, and the working master list. It is single-threaded and
//! IO-free: the host feeds it datagrams and clock ticks and it talks
//! back through the injected [`Transport`] and [`QueryEventSink`].
//!
//! A query moves through four phases:
//!
//! 1. master list fetch: one outstanding request, retried and failed
//!    over to the next master by region preference
//! 2. list-packet reassembly: missing pages re-requested individually
//! 3. ping: up to [`MAX_CONCURRENT_PINGS`] round-trip probes
//! 4. info query: up to [`MAX_CONCURRENT_QUERIES`] detail requests
//!
//! Retries ride on an internal queue of `(due, session, work)` items; the
//! host drains it with [`QueryEngine::advance`] using any monotonic
//! millisecond clock. Cancellation bumps the session counter, which makes
//! every queued item and every late reply inert.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::{debug, error, info};

use shared::config::{keys, master_server_list, parse_favorite};
use shared::packet::{key_field, Packet, BUILD_VERSION, CURRENT_PROTOCOL_VERSION,
    MIN_REQUIRED_PROTOCOL_VERSION, VERSION_TAG};
use shared::{send_packet, Config, MasterInfo, Millis, NetAddress, ServerInfo, ServerStatus,
    Transport};

use crate::events::{QueryEventSink, QueryPhase};
use crate::filter::{FilterKind, ServerFilter};
use crate::server_list::ServerList;

pub const MAX_CONCURRENT_PINGS: usize = 10;
pub const MAX_CONCURRENT_QUERIES: usize = 2;

const MASTER_RETRY_COUNT: u32 = 3;
const MASTER_TIMEOUT: Millis = 2000;
const PACKET_RETRY_COUNT: u32 = 4;
const PACKET_TIMEOUT: Millis = 1000;
const PING_RETRY_COUNT: u32 = 4;
const PING_TIMEOUT: Millis = 800;
const QUERY_RETRY_COUNT: u32 = 4;
const QUERY_TIMEOUT: Millis = 1000;

/// Orchestrator tick spacing while any queue is non-empty.
const PROCESS_TICK: Millis = 1;
/// Re-request sweep spacing during list reassembly.
const PACKET_TICK: Millis = 30;

/// Requests are sent with no query flag bits set; the offline and
/// no-compress bits belong to other requesters.
const ONLINE_QUERY: u8 = 0;

/// An in-flight probe, used for both the ping and the query phase.
#[derive(Debug, Clone)]
struct Ping {
    address: NetAddress,
    session: u32,
    key: u32,
    sent_at: Option<Millis>,
    tries_left: u32,
    broadcast: bool,
    is_local: bool,
}

/// One missing master-list page awaiting re-request.
#[derive(Debug, Clone)]
struct PacketStatus {
    index: u8,
    key: u32,
    sent_at: Millis,
    tries_left: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    MasterQuery,
    PingsAndQueries,
    ListPackets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ScheduledEvent {
    due: Millis,
    stamp: u32,
    kind: EventKind,
}

struct InfoPayload {
    game_type: String,
    mission_type: String,
    mission_name: String,
    status: u8,
    num_players: u8,
    max_players: u8,
    num_bots: u8,
    cpu_speed: u16,
    info_string: String,
    status_string: String,
}

pub struct QueryEngine {
    transport: Box<dyn Transport>,
    config: Box<dyn Config>,
    sink: Box<dyn QueryEventSink>,

    session: u32,
    key_counter: u32,
    query_active: bool,
    /// True while a Normal query still owes us the first list packet.
    awaiting_master: bool,
    got_first_list_packet: bool,
    hole_punching: bool,
    ipx_broadcast: bool,

    filter: ServerFilter,
    servers: ServerList,
    finished: Vec<NetAddress>,
    ping_list: Vec<Ping>,
    query_list: Vec<Ping>,
    packet_status_list: Vec<PacketStatus>,
    master_list: Vec<MasterInfo>,
    master_ping: Option<Ping>,
    master_query_address: Option<NetAddress>,
    local_addresses: Vec<NetAddress>,

    server_ping_count: u32,
    server_query_count: u32,

    events: BinaryHeap<Reverse<ScheduledEvent>>,
}

impl QueryEngine {
    pub fn new(
        transport: Box<dyn Transport>,
        config: Box<dyn Config>,
        sink: Box<dyn QueryEventSink>,
    ) -> QueryEngine {
        QueryEngine {
            transport,
            config,
            sink,
            session: 0,
            key_counter: 0,
            query_active: false,
            awaiting_master: false,
            got_first_list_packet: false,
            hole_punching: false,
            ipx_broadcast: false,
            filter: ServerFilter::default(),
            servers: ServerList::new(),
            finished: Vec::new(),
            ping_list: Vec::new(),
            query_list: Vec::new(),
            packet_status_list: Vec::new(),
            master_list: Vec::new(),
            master_ping: None,
            master_query_address: None,
            local_addresses: Vec::new(),
            server_ping_count: 0,
            server_query_count: 0,
            events: BinaryHeap::new(),
        }
    }

    /// Also forward pings and queries through the masters so they can
    /// poke a hole toward us from the server's side.
    pub fn set_hole_punching(&mut self, enabled: bool) {
        self.hole_punching = enabled;
    }

    /// Broadcast on the legacy IPX segment as well during LAN queries.
    pub fn set_ipx_broadcast(&mut self, enabled: bool) {
        self.ipx_broadcast = enabled;
    }

    // ---------------------------------------------------------------
    // Public query operations
    // ---------------------------------------------------------------

    /// Broadcasts pings on the LAN `port`. With `use_filters` the current
    /// filter bounds also prune what comes back.
    pub fn query_lan_servers(
        &mut self,
        now: Millis,
        port: u16,
        mut filter: ServerFilter,
        use_filters: bool,
    ) {
        self.clear_server_list();
        self.query_active = true;
        self.awaiting_master = false;
        filter.kind = if use_filters {
            FilterKind::OfflineFiltered
        } else {
            FilterKind::Offline
        };
        filter.query_flags = ONLINE_QUERY;
        self.filter = filter;
        self.push_server_favorites();
        self.push_lan_broadcasts(port);
        self.sink.on_status(QueryPhase::Start, "Querying LAN servers", 0.0);
        self.schedule(EventKind::PingsAndQueries, now + PROCESS_TICK);
    }

    /// Fetches the server list from a master directory, pinging and
    /// querying every address it returns alongside the LAN broadcast.
    /// A non-empty `buddy_list` turns this into a buddy search instead.
    pub fn query_master_server(
        &mut self,
        now: Millis,
        lan_port: u16,
        mut filter: ServerFilter,
        buddy_list: Vec<u32>,
    ) {
        self.clear_server_list();
        self.got_first_list_packet = false;
        self.awaiting_master = true;
        self.query_active = true;
        self.sink
            .on_status(QueryPhase::Start, "Querying master server", 0.0);

        if buddy_list.is_empty() {
            filter.kind = FilterKind::Normal;
            filter.buddy_list.clear();
            self.filter = filter;
            self.push_server_favorites();
            self.push_lan_broadcasts(lan_port);
        } else {
            filter.kind = FilterKind::Buddy;
            filter.buddy_list = buddy_list;
            self.filter = filter;
        }

        self.master_list = master_server_list(self.config.as_ref());
        if !self.pick_master_server(now) {
            error!("No master servers found!");
            self.awaiting_master = false;
            self.process_pings_and_queries(self.session, now, true);
        } else {
            self.process_master_server_query(self.session, now);
            self.schedule(EventKind::PingsAndQueries, now + PROCESS_TICK);
        }
    }

    /// Re-pings and re-queries one server without clearing the list.
    pub fn query_single_server(&mut self, now: Millis, addr: &NetAddress) {
        self.query_active = true;
        if let Some(si) = self.servers.find_mut(addr) {
            si.status = ServerStatus(ServerStatus::UPDATING);
        }
        self.finished.retain(|a| a != addr);
        self.sink
            .on_status(QueryPhase::Start, "Refreshing server...", 0.0);
        self.server_ping_count = 0;
        self.server_query_count = 0;
        self.push_ping_request(addr);
        self.process_pings_and_queries(self.session, now, true);
    }

    /// Pings every bookmarked favorite, master or no master.
    pub fn query_favorite_servers(&mut self, now: Millis) {
        self.clear_server_list();
        self.query_active = true;
        self.awaiting_master = false;
        self.filter.kind = FilterKind::Favorites;
        self.push_server_favorites();
        self.sink
            .on_status(QueryPhase::Start, "Query favorites...", 0.0);
        self.process_pings_and_queries(self.session, now, true);
    }

    /// Asks one master for the game/mission type catalogue. The answer
    /// arrives through the sink's `exec` channel.
    pub fn query_master_game_types(&mut self, now: Millis) {
        let masters = master_server_list(self.config.as_ref());
        if masters.is_empty() {
            return;
        }
        let index = now as usize % masters.len();
        info!("Requesting game types from the master server...");
        let request = Packet::GameTypesRequest {
            flags: ONLINE_QUERY,
            key: key_field(self.session, self.key_counter),
        };
        self.transmit(&masters[index].address, &request);
    }

    /// Drops the current query outright. The session bump makes every
    /// outstanding timer and late reply inert; unresponsive entries are
    /// marked timed out and no `done` event is emitted.
    pub fn cancel_server_query(&mut self) {
        if !self.query_active {
            return;
        }
        info!("Server query canceled.");
        self.packet_status_list.clear();
        for ping in std::mem::take(&mut self.ping_list) {
            self.mark_unresponded_timed_out(&ping.address);
        }
        for query in std::mem::take(&mut self.query_list) {
            self.mark_unresponded_timed_out(&query.address);
        }
        self.query_active = false;
        self.awaiting_master = false;
        self.servers.dirty = true;
        self.bump_session();
    }

    /// Softer than cancel: outstanding pings are treated as done rather
    /// than timed out, and in-flight info queries still complete.
    pub fn stop_server_query(&mut self) {
        if !self.query_active {
            return;
        }
        self.packet_status_list.clear();
        if self.ping_list.is_empty() {
            self.cancel_server_query();
        } else {
            for ping in std::mem::take(&mut self.ping_list) {
                self.finished.push(ping.address);
            }
        }
    }

    /// Forgets every record and bumps the session.
    pub fn clear_server_list(&mut self) {
        self.packet_status_list.clear();
        self.servers.clear();
        self.finished.clear();
        self.ping_list.clear();
        self.query_list.clear();
        self.local_addresses.clear();
        self.server_ping_count = 0;
        self.server_query_count = 0;
        self.bump_session();
    }

    // ---------------------------------------------------------------
    // NAT traversal operations
    // ---------------------------------------------------------------

    /// Asks every master to broker a hole-punched connection to `target`.
    pub fn arrange_connection(&mut self, target: NetAddress) {
        for master in master_server_list(self.config.as_ref()) {
            info!(
                "Sending arranged connect request to master server [{}]",
                master.address
            );
            self.transmit(
                &master.address,
                &Packet::MasterServerRequestArrangedConnection {
                    flags: 0,
                    key: 0,
                    target,
                },
            );
        }
    }

    /// Asks every master for a relay endpoint toward `target`, for when
    /// hole punching fails.
    pub fn relay_connection(&mut self, target: NetAddress) {
        for master in master_server_list(self.config.as_ref()) {
            self.transmit(
                &master.address,
                &Packet::MasterServerRelayRequest {
                    flags: 0,
                    key: 0,
                    target,
                },
            );
        }
    }

    /// Looks up a host by invite code, over the masters and the LAN.
    pub fn join_game_by_invite(&mut self, invite_code: &str) {
        let invite = Packet::MasterServerJoinInvite {
            flags: 0,
            key: 0,
            invite_code: invite_code.to_string(),
        };
        for master in master_server_list(self.config.as_ref()) {
            self.transmit(&master.address, &invite);
        }
        let port = self.config.get_u16(keys::PREF_SERVER_PORT);
        self.transmit(&NetAddress::ip_broadcast(port), &invite);
    }

    // ---------------------------------------------------------------
    // Clock and packet entry points
    // ---------------------------------------------------------------

    /// Runs every scheduled work item due by `now`. Items stamped with a
    /// stale session are discarded unrun.
    pub fn advance(&mut self, now: Millis) {
        while let Some(&Reverse(ev)) = self.events.peek() {
            if ev.due > now {
                break;
            }
            self.events.pop();
            match ev.kind {
                EventKind::MasterQuery => self.process_master_server_query(ev.stamp, now),
                EventKind::PingsAndQueries => self.process_pings_and_queries(ev.stamp, now, true),
                EventKind::ListPackets => self.process_server_list_packets(ev.stamp, now),
            }
        }
    }

    /// When the next scheduled work item is due, if any.
    pub fn next_deadline(&self) -> Option<Millis> {
        self.events.peek().map(|Reverse(ev)| ev.due)
    }

    /// Feeds one received datagram into the engine. Malformed packets
    /// are dropped with a debug log and affect nothing else.
    pub fn handle_packet(&mut self, from: &NetAddress, data: &[u8], now: Millis) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed packet from {}: {}", from, e);
                return;
            }
        };
        self.dispatch_packet(from, packet, now);
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    pub fn query_in_progress(&self) -> bool {
        self.query_active
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn server_info(&self, index: usize) -> Option<&ServerInfo> {
        self.servers.get(index)
    }

    pub fn servers(&self) -> &[ServerInfo] {
        self.servers.as_slice()
    }

    /// True once per change batch; clears on read. A browser UI polls
    /// this to decide when to repaint.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.servers.dirty)
    }

    /// Whether `addr` is one of our own endpoints as reported by the
    /// master (list packets flagged as echoes of our public address).
    pub fn is_local_address(&self, addr: &NetAddress) -> bool {
        self.local_addresses.contains(addr)
    }

    // ---------------------------------------------------------------
    // Phase 1: master list fetch
    // ---------------------------------------------------------------

    fn process_master_server_query(&mut self, stamp: u32, now: Millis) {
        if stamp != self.session || !self.query_active || self.got_first_list_packet {
            return;
        }
        let Some(master) = self.master_ping.clone() else {
            return;
        };

        let mut keep_going = true;
        let due = master.sent_at.map_or(true, |t| t + MASTER_TIMEOUT <= now);
        if due {
            if master.tries_left == 0 {
                info!("Server list request to {} timed out.", master.address);
                self.master_list.retain(|m| m.address != master.address);
                keep_going = self.pick_master_server(now);
                if keep_going {
                    self.sink
                        .on_status(QueryPhase::Update, "Switching master servers...", 0.0);
                }
            }

            if keep_going {
                let key = self.next_key();
                let mp = self.master_ping.as_mut().unwrap();
                mp.tries_left -= 1;
                mp.sent_at = Some(now);
                mp.key = key;
                let address = mp.address;
                let tries_left = mp.tries_left;
                let request = self.list_request(255, key);
                self.transmit(&address, &request);
                info!(
                    "Requesting the server list from master server {} ({} tries left)...",
                    address, tries_left
                );
                if tries_left < MASTER_RETRY_COUNT - 1 {
                    self.sink
                        .on_status(QueryPhase::Update, "Retrying the master server...", 0.0);
                }
            }
        }

        if keep_going {
            self.schedule(EventKind::MasterQuery, now + PROCESS_TICK);
        } else {
            error!("There are no more master servers to try!");
            self.awaiting_master = false;
            self.process_pings_and_queries(self.session, now, true);
        }
    }

    /// Picks the next master to try, preferring the configured region,
    /// starting from a clock-derived index with wrap-around.
    fn pick_master_server(&mut self, now: Millis) -> bool {
        self.master_ping = None;
        let count = self.master_list.len();
        if count == 0 {
            return false;
        }

        let region = self.config.get_u32(keys::PREF_NET_REGION_MASK);
        let start = now as usize % count;
        let mut index = start;
        let mut chosen = None;
        for _ in 0..count {
            if self.master_list[index].region == region {
                chosen = Some(index);
                break;
            }
            index = if index < count - 1 { index + 1 } else { 0 };
        }

        let index = match chosen {
            Some(index) => {
                info!(
                    "Found master server {} in same region.",
                    self.master_list[index].address
                );
                index
            }
            None => {
                info!(
                    "No master servers found in this region, trying {}.",
                    self.master_list[start].address
                );
                start
            }
        };

        self.master_ping = Some(Ping {
            address: self.master_list[index].address,
            session: self.session,
            key: 0,
            sent_at: None,
            tries_left: MASTER_RETRY_COUNT,
            broadcast: false,
            is_local: false,
        });
        true
    }

    // ---------------------------------------------------------------
    // Phase 2: list-packet reassembly
    // ---------------------------------------------------------------

    fn process_server_list_packets(&mut self, stamp: u32, now: Millis) {
        if stamp != self.session || !self.query_active {
            return;
        }

        let mut i = 0;
        while i < self.packet_status_list.len() {
            let status = &self.packet_status_list[i];
            if now < status.sent_at + PACKET_TIMEOUT {
                i += 1;
                continue;
            }
            if status.tries_left == 0 {
                info!("Server list packet #{} timed out.", status.index + 1);
                self.packet_status_list.remove(i);
            } else {
                let key = self.next_key();
                let status = &mut self.packet_status_list[i];
                status.tries_left -= 1;
                status.sent_at = now;
                status.key = key;
                let index = status.index;
                info!("Rerequesting server list packet #{}...", index + 1);
                let request = self.page_rerequest(index, key);
                if let Some(master) = self.master_query_address {
                    self.transmit(&master, &request);
                }
                i += 1;
            }
        }

        if !self.packet_status_list.is_empty() {
            self.schedule(EventKind::ListPackets, now + PACKET_TICK);
        } else {
            self.process_pings_and_queries(self.session, now, true);
        }
    }

    fn handle_master_server_list_response(
        &mut self,
        flags: u8,
        key: u32,
        packet_index: u8,
        packet_total: u8,
        servers: Vec<NetAddress>,
        now: Millis,
    ) {
        // The expected key is the master probe's unless this page was
        // individually re-requested with a fresher one.
        let mut packet_key = self.master_ping.as_ref().map(|m| m.key).unwrap_or(0);
        if self.got_first_list_packet {
            if let Some(status) = self
                .packet_status_list
                .iter()
                .find(|s| s.index == packet_index)
            {
                packet_key = status.key;
            }
        }
        if key_field(self.session, packet_key) != key {
            return;
        }

        info!(
            "Received server list packet {} of {} from the master server ({} servers).",
            packet_index + 1,
            packet_total,
            servers.len()
        );

        for addr in &servers {
            if flags & 0x01 != 0 {
                // The master is echoing our own public endpoint.
                self.add_local_address(addr);
            }
            self.push_ping_request(addr);
        }

        if !self.got_first_list_packet {
            self.got_first_list_packet = true;
            self.awaiting_master = false;
            self.master_query_address = self.master_ping.as_ref().map(|m| m.address);
            let master_key = self.master_ping.as_ref().map(|m| m.key).unwrap_or(0);
            for index in 0..packet_total {
                if index != packet_index {
                    self.packet_status_list.push(PacketStatus {
                        index,
                        key: master_key,
                        sent_at: now,
                        tries_left: PACKET_RETRY_COUNT,
                    });
                }
            }
            self.process_server_list_packets(self.session, now);
        } else {
            self.packet_status_list.retain(|s| s.index != packet_index);
        }
    }

    // ---------------------------------------------------------------
    // Phases 3 and 4: pings, then queries
    // ---------------------------------------------------------------

    fn process_pings_and_queries(&mut self, stamp: u32, now: Millis, schedule: bool) {
        if stamp != self.session {
            return;
        }
        let waiting_for_master = self.waiting_for_master();
        let master_addresses: Vec<NetAddress> = if self.hole_punching {
            self.master_list.iter().map(|m| m.address).collect()
        } else {
            Vec::new()
        };

        let mut i = 0;
        while i < self.ping_list.len() && i < MAX_CONCURRENT_PINGS {
            let due = self.ping_list[i]
                .sent_at
                .map_or(true, |t| t + PING_TIMEOUT <= now);
            if !due {
                i += 1;
                continue;
            }
            if self.ping_list[i].tries_left == 0 {
                let ping = self.ping_list.remove(i);
                if !ping.broadcast {
                    info!("Ping to server {} timed out.", ping.address);
                }
                if let Some(si) = self.servers.find_mut(&ping.address) {
                    si.status = ServerStatus(ServerStatus::TIMED_OUT);
                    self.servers.dirty = true;
                }
                self.finished.push(ping.address);
                if !waiting_for_master {
                    self.update_ping_progress();
                }
            } else {
                let key = self.next_key();
                let ping = &mut self.ping_list[i];
                ping.tries_left -= 1;
                ping.sent_at = Some(now);
                ping.key = key;
                let (address, session, broadcast, tries_left) =
                    (ping.address, ping.session, ping.broadcast, ping.tries_left);
                if broadcast {
                    info!("LAN server ping: {}...", address);
                } else {
                    info!("Pinging server {} ({})...", address, tries_left);
                }
                self.transmit(
                    &address,
                    &Packet::GamePingRequest {
                        flags: ONLINE_QUERY,
                        key: key_field(session, key),
                    },
                );
                if !broadcast {
                    for master in &master_addresses {
                        send_packet(
                            self.transport.as_mut(),
                            master,
                            &Packet::MasterServerGamePingRequest {
                                flags: 0,
                                key: 0,
                                target: address,
                                peer_flags: ONLINE_QUERY,
                                peer_key: key_field(session, key),
                            },
                        );
                    }
                }
                i += 1;
            }
        }

        // The query phase never starts while any ping is outstanding.
        if self.ping_list.is_empty() && !waiting_for_master {
            let mut i = 0;
            while i < self.query_list.len() && i < MAX_CONCURRENT_QUERIES {
                let due = self.query_list[i]
                    .sent_at
                    .map_or(true, |t| t + QUERY_TIMEOUT <= now);
                if !due {
                    i += 1;
                    continue;
                }
                let address = self.query_list[i].address;
                if self.servers.find(&address).is_none() {
                    self.query_list.remove(i);
                    self.servers.dirty = true;
                    continue;
                }
                if self.query_list[i].tries_left == 0 {
                    info!("Query to server {} timed out.", address);
                    self.query_list.remove(i);
                    if let Some(si) = self.servers.find_mut(&address) {
                        si.status = ServerStatus(ServerStatus::TIMED_OUT);
                    }
                    self.servers.dirty = true;
                } else {
                    let key = self.next_key();
                    let query = &mut self.query_list[i];
                    query.tries_left -= 1;
                    query.sent_at = Some(now);
                    query.key = key;
                    let (session, broadcast, tries_left) =
                        (query.session, query.broadcast, query.tries_left);
                    info!("Querying server {} ({})...", address, tries_left);
                    self.transmit(
                        &address,
                        &Packet::GameInfoRequest {
                            flags: ONLINE_QUERY,
                            key: key_field(session, key),
                        },
                    );
                    if !broadcast {
                        for master in &master_addresses {
                            send_packet(
                                self.transport.as_mut(),
                                master,
                                &Packet::MasterServerGameInfoRequest {
                                    flags: 0,
                                    key: 0,
                                    target: address,
                                    peer_flags: ONLINE_QUERY,
                                    peer_key: key_field(session, key),
                                },
                            );
                        }
                    }
                    if let Some(si) = self.servers.find_mut(&address) {
                        if !si.status.is_querying() {
                            si.status.set(ServerStatus::QUERYING);
                            self.servers.dirty = true;
                        }
                    }
                    i += 1;
                }
            }
        }

        if !self.ping_list.is_empty() || !self.query_list.is_empty() || waiting_for_master {
            if schedule {
                self.schedule(EventKind::PingsAndQueries, now + PROCESS_TICK);
            }
        } else if self.query_active {
            self.query_active = false;
            let found = self
                .servers
                .as_slice()
                .iter()
                .filter(|si| si.status.has_responded())
                .count();
            let message = match found {
                0 => "No servers found.".to_string(),
                1 => "One server found.".to_string(),
                n => format!("{} servers found.", n),
            };
            self.sink.on_status(QueryPhase::Done, &message, 1.0);
        }
    }

    // ---------------------------------------------------------------
    // Response handlers
    // ---------------------------------------------------------------

    fn dispatch_packet(&mut self, from: &NetAddress, packet: Packet, now: Millis) {
        match packet {
            Packet::GamePingResponse {
                key,
                version_tag,
                protocol_current,
                protocol_min,
                build_version,
                name,
                ..
            } => self.handle_game_ping_response(
                from,
                key,
                &version_tag,
                protocol_current,
                protocol_min,
                build_version,
                &name,
                now,
            ),
            Packet::GameInfoResponse {
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
                ..
            } => self.handle_game_info_response(
                from,
                InfoPayload {
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
                },
            ),
            Packet::MasterServerListResponse {
                flags,
                key,
                packet_index,
                packet_total,
                servers,
            } => self.handle_master_server_list_response(
                flags,
                key,
                packet_index,
                packet_total,
                servers,
                now,
            ),
            Packet::GameTypesResponse {
                game_types,
                mission_types,
                ..
            } => {
                info!("Received game type list from the master server.");
                self.sink.exec("onClearGameTypes", &[]);
                for game_type in &game_types {
                    self.sink.exec("onAddGameType", &[game_type.clone()]);
                }
                self.sink.exec("onClearMissionTypes", &[]);
                for mission_type in &mission_types {
                    self.sink.exec("onAddMissionType", &[mission_type.clone()]);
                }
            }
            // A master relays a NAT'd server's answers wrapped with the
            // target address; unwrap and treat like a direct reply.
            Packet::MasterServerGamePingResponse { target, inner, .. } => match *inner {
                Packet::GamePingResponse {
                    key,
                    version_tag,
                    protocol_current,
                    protocol_min,
                    build_version,
                    name,
                    ..
                } => self.handle_game_ping_response(
                    &target,
                    key,
                    &version_tag,
                    protocol_current,
                    protocol_min,
                    build_version,
                    &name,
                    now,
                ),
                other => debug!(
                    "Relayed ping response wrapped unexpected packet type {}",
                    other.type_byte()
                ),
            },
            Packet::MasterServerGameInfoResponse { target, inner, .. } => match *inner {
                Packet::GameInfoResponse {
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
                    ..
                } => self.handle_game_info_response(
                    &target,
                    InfoPayload {
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
                    },
                ),
                other => debug!(
                    "Relayed info response wrapped unexpected packet type {}",
                    other.type_byte()
                ),
            },
            Packet::MasterServerClientRequestedArrangedConnection {
                client_id,
                candidates,
                ..
            } => {
                info!("Received an arranged-connection request from the master server.");
                self.transmit(
                    from,
                    &Packet::MasterServerAcceptArrangedConnection {
                        flags: 0,
                        key: 0,
                        client_id,
                    },
                );
                self.sink.on_arranged_candidates(&candidates, false);
            }
            Packet::MasterServerArrangedConnectionAccepted { candidates, .. } => {
                info!("Received accept arranged connect response from the master server.");
                self.sink.on_arranged_candidates(&candidates, true);
            }
            Packet::MasterServerArrangedConnectionRejected { reason, .. } => {
                let text = match reason {
                    0 => "No such server",
                    1 => "Server rejected",
                    _ => "Unknown reason",
                };
                info!("Arranged connection rejected: {}", text);
                self.sink.on_arranged_rejected(reason);
            }
            Packet::MasterServerRelayResponse { is_host, relay, .. } => {
                info!("Received relay response, attaching to {}", relay);
                self.transmit(
                    &relay,
                    &Packet::MasterServerRelayReady {
                        flags: is_host as u8,
                        key: 0,
                    },
                );
                self.sink.on_relay(relay, is_host);
            }
            Packet::MasterServerRelayReady { .. } => {
                self.sink.on_relay_ready(*from);
            }
            Packet::MasterServerJoinInviteResponse { found, address, .. } => {
                self.handle_join_invite_response(from, found, address);
            }
            other => {
                debug!(
                    "Ignoring packet type {} from {}",
                    other.type_byte(),
                    from
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_game_ping_response(
        &mut self,
        from: &NetAddress,
        key: u32,
        version_tag: &str,
        protocol_current: u32,
        protocol_min: u32,
        build_version: u32,
        name: &str,
        now: Millis,
    ) {
        // Broadcast has timed out or the query has been canceled.
        if self.ping_list.is_empty() {
            return;
        }

        let Some(index) = find_ping_entry(&self.ping_list, from) else {
            // An anonymous reply, probably to a broadcast. Ping it
            // directly to get a proper key round trip.
            if !self.address_finished(from) {
                self.push_ping_request(from);
                if let Some(ping) = self.ping_list.iter_mut().find(|p| p.address == *from) {
                    ping.is_local = true;
                }
            }
            return;
        };

        let expected = key_field(
            self.ping_list[index].session,
            self.ping_list[index].key,
        );
        if expected != key {
            return;
        }

        let apply_filter = self.filter.applies()
            && self
                .servers
                .find(from)
                .map_or(true, |si| !si.status.is_updating());
        let waiting_for_master = self.waiting_for_master();

        if version_tag != VERSION_TAG {
            info!("Server {} is a different version.", from);
            self.fail_ping(index, waiting_for_master, false);
            return;
        }
        if protocol_current < MIN_REQUIRED_PROTOCOL_VERSION {
            info!("Protocol for server {} does not meet minimum protocol.", from);
            self.fail_ping(index, waiting_for_master, false);
            return;
        }
        if CURRENT_PROTOCOL_VERSION < protocol_min {
            info!("You do not meet the minimum protocol for server {}.", from);
            self.fail_ping(index, waiting_for_master, false);
            return;
        }

        let sent_at = self.ping_list[index].sent_at.unwrap_or(now);
        let ping_ms = now.saturating_sub(sent_at);

        if apply_filter && self.filter.rejects_ping(ping_ms) {
            info!("Server {} filtered out by maximum ping.", from);
            self.fail_ping(index, waiting_for_master, true);
            return;
        }
        if build_version != BUILD_VERSION {
            info!("Server {} filtered out by version number.", from);
            self.fail_ping(index, waiting_for_master, true);
            return;
        }

        let is_local = self.ping_list[index].is_local;
        let si = self.servers.find_or_create(from);
        si.ping = ping_ms;
        si.version = build_version;
        si.is_local = is_local;
        if si.name.is_empty() {
            si.name = name.to_string();
        }

        // Promote to the query phase.
        let mut ping = self.ping_list.remove(index);
        self.finished.push(ping.address);
        ping.key = 0;
        ping.sent_at = None;
        ping.tries_left = QUERY_RETRY_COUNT;
        self.query_list.push(ping);
        self.server_query_count += 1;
        if !waiting_for_master {
            self.update_ping_progress();
        }
        self.servers.dirty = true;
    }

    /// Drops ping entry `index` as unusable. With `remove_record` the
    /// server record disappears entirely (filtered out); otherwise the
    /// record is kept and shown as timed out.
    fn fail_ping(&mut self, index: usize, waiting_for_master: bool, remove_record: bool) {
        let ping = self.ping_list.remove(index);
        self.finished.push(ping.address);
        if remove_record {
            self.servers.remove(&ping.address);
        } else if let Some(si) = self.servers.find_mut(&ping.address) {
            si.status = ServerStatus(ServerStatus::TIMED_OUT);
            self.servers.dirty = true;
        }
        if !waiting_for_master {
            self.update_ping_progress();
        }
    }

    fn handle_game_info_response(&mut self, from: &NetAddress, payload: InfoPayload) {
        if self.query_list.is_empty() {
            return;
        }
        let Some(index) = find_ping_entry(&self.query_list, from) else {
            return;
        };
        self.query_list.remove(index);
        self.update_query_progress();

        let Some(si) = self.servers.find_mut(from) else {
            return;
        };
        let is_update = si.status.is_updating();
        let apply_filter = !is_update && self.filter.applies();

        si.game_type = payload.game_type;
        si.mission_type = payload.mission_type;
        si.mission_name = payload
            .mission_name
            .strip_suffix(".mis")
            .unwrap_or(&payload.mission_name)
            .to_string();
        si.status = ServerStatus::from_wire(payload.status);
        si.num_players = payload.num_players;
        si.max_players = payload.max_players;
        si.num_bots = payload.num_bots;
        si.cpu_speed = payload.cpu_speed;
        si.info_string = payload.info_string;
        si.status_string = payload.status_string;

        if apply_filter {
            if let Some(reason) = self
                .filter
                .rejects_info(self.servers.find(from).unwrap())
            {
                info!("Server {} filtered out by {}", from, reason);
                self.servers.remove(from);
                return;
            }
        }

        let si = self.servers.find_mut(from).unwrap();
        si.status.set(ServerStatus::RESPONDED);
        self.servers.dirty = true;
    }

    fn handle_join_invite_response(&mut self, from: &NetAddress, found: bool, address: NetAddress) {
        if !found {
            self.sink.exec("onJoinGameReject", &[]);
            return;
        }
        let mut address = address;
        let mut is_local = false;
        if let NetAddress::Ip { host, port } = address {
            // The all-ones host means "the host is whoever answered".
            if host == [255, 255, 255, 255] {
                if let NetAddress::Ip { host: from_host, .. } = from {
                    address = NetAddress::Ip {
                        host: *from_host,
                        port,
                    };
                    is_local = true;
                }
            }
        }
        self.sink.exec(
            "onJoinGameAccept",
            &[address.to_string(), is_local.to_string()],
        );
    }

    // ---------------------------------------------------------------
    // Queue bookkeeping
    // ---------------------------------------------------------------

    /// Enqueues a unicast ping unless the address is already finished or
    /// already waiting to be pinged.
    fn push_ping_request(&mut self, addr: &NetAddress) {
        if self.address_finished(addr) || find_ping_entry(&self.ping_list, addr).is_some() {
            return;
        }
        self.ping_list.push(Ping {
            address: *addr,
            session: self.session,
            key: 0,
            sent_at: None,
            tries_left: PING_RETRY_COUNT,
            broadcast: false,
            is_local: false,
        });
        self.server_ping_count += 1;
    }

    /// Enqueues a broadcast ping: one try, and never counted toward the
    /// progress totals since the number of responders is unknown.
    fn push_ping_broadcast(&mut self, addr: &NetAddress) {
        if self.address_finished(addr) || find_ping_entry(&self.ping_list, addr).is_some() {
            return;
        }
        self.ping_list.push(Ping {
            address: *addr,
            session: self.session,
            key: 0,
            sent_at: None,
            tries_left: 1,
            broadcast: true,
            is_local: true,
        });
    }

    fn push_lan_broadcasts(&mut self, port: u16) {
        self.push_ping_broadcast(&NetAddress::ip_broadcast(port));
        if self.ipx_broadcast {
            self.push_ping_broadcast(&NetAddress::ipx_broadcast(port));
        }
    }

    /// Pre-creates records for the bookmarked favorites and pings them.
    fn push_server_favorites(&mut self) {
        let count = self.config.get_u32(keys::FAVORITE_COUNT);
        let favorites: Vec<(String, NetAddress)> = (0..count)
            .filter_map(|i| {
                let key = format!("{}{}", keys::FAVORITE_PREFIX, i);
                self.config.get(&key).and_then(parse_favorite)
            })
            .collect();
        for (name, addr) in favorites {
            let si = self.servers.find_or_create(&addr);
            si.name = name;
            si.is_favorite = true;
            self.push_ping_request(&addr);
        }
    }

    fn address_finished(&self, addr: &NetAddress) -> bool {
        self.finished.contains(addr)
    }

    fn add_local_address(&mut self, addr: &NetAddress) {
        if !self.local_addresses.contains(addr) {
            self.local_addresses.push(*addr);
        }
    }

    fn mark_unresponded_timed_out(&mut self, addr: &NetAddress) {
        if let Some(si) = self.servers.find_mut(addr) {
            if !si.status.has_responded() {
                si.status = ServerStatus(ServerStatus::TIMED_OUT);
            }
        }
    }

    /// Unicast pings still awaiting an answer; broadcast entries are not
    /// requests and never count.
    fn count_ping_requests(&self) -> u32 {
        self.ping_list.iter().filter(|p| !p.broadcast).count() as u32
    }

    fn waiting_for_master(&self) -> bool {
        self.awaiting_master && self.query_active
    }

    fn next_key(&mut self) -> u32 {
        let key = self.key_counter;
        self.key_counter = self.key_counter.wrapping_add(1);
        key
    }

    fn bump_session(&mut self) {
        self.session = self.session.wrapping_add(1);
        self.events.clear();
    }

    fn schedule(&mut self, kind: EventKind, due: Millis) {
        let stamp = self.session;
        // One pending item per kind per session is plenty; the work
        // functions reschedule themselves while there is anything to do.
        if self
            .events
            .iter()
            .any(|Reverse(ev)| ev.kind == kind && ev.stamp == stamp)
        {
            return;
        }
        self.events.push(Reverse(ScheduledEvent { due, stamp, kind }));
    }

    fn transmit(&mut self, addr: &NetAddress, packet: &Packet) {
        send_packet(self.transport.as_mut(), addr, packet);
    }

    fn list_request(&self, packet_index: u8, key: u32) -> Packet {
        let f = &self.filter;
        Packet::MasterServerListRequest {
            flags: f.query_flags,
            key: key_field(self.session, key),
            packet_index,
            game_type: f.game_type.clone(),
            mission_type: f.mission_type.clone(),
            min_players: f.min_players,
            max_players: f.max_players,
            region_mask: f.region_mask,
            version: BUILD_VERSION,
            filter_flags: f.filter_flags,
            max_bots: f.max_bots,
            min_cpu: f.min_cpu,
            buddy_list: f.buddy_list.clone(),
        }
    }

    /// A re-request names only the page it wants; the filter fields ride
    /// along zeroed.
    fn page_rerequest(&self, packet_index: u8, key: u32) -> Packet {
        Packet::MasterServerListRequest {
            flags: self.filter.query_flags,
            key: key_field(self.session, key),
            packet_index,
            game_type: String::new(),
            mission_type: String::new(),
            min_players: 0,
            max_players: 0,
            region_mask: 0,
            version: 0,
            filter_flags: 0,
            max_bots: 0,
            min_cpu: 0,
            buddy_list: Vec::new(),
        }
    }

    // ---------------------------------------------------------------
    // Progress reporting
    // ---------------------------------------------------------------

    /// Ping progress covers the first half of the bar.
    fn update_ping_progress(&mut self) {
        if self.ping_list.is_empty() {
            self.update_query_progress();
            return;
        }
        let pings_left = self.count_ping_requests();
        let message = if pings_left == 0 {
            "Waiting for lan servers...".to_string()
        } else {
            format!("Pinging servers: {} left...", pings_left)
        };
        let progress = if self.server_ping_count > 0 {
            self.server_ping_count.saturating_sub(pings_left) as f32
                / (self.server_ping_count * 2) as f32
        } else {
            0.0
        };
        self.sink.on_status(QueryPhase::Ping, &message, progress);
    }

    /// Query progress covers the second half.
    fn update_query_progress(&mut self) {
        if !self.ping_list.is_empty() {
            return;
        }
        let queries_left = self.query_list.len() as u32;
        let message = format!("Querying servers: {} left...", queries_left);
        let mut progress = 0.5;
        if self.server_query_count > 0 {
            progress += self.server_query_count.saturating_sub(queries_left) as f32
                / (self.server_query_count * 2) as f32;
        }
        self.sink.on_status(QueryPhase::Query, &message, progress);
    }
}

fn find_ping_entry(list: &[Ping], addr: &NetAddress) -> Option<usize> {
    list.iter().position(|p| p.address == *addr)
}
