//! End-to-end discovery scenarios against a virtual clock.
//!
//! These tests drive the query engine the way the socket driver would,
//! one millisecond at a time, but with a recording transport instead of
//! a socket, so every retry window and session rule is deterministic.

use std::sync::{Arc, Mutex};

use assert_approx_eq::assert_approx_eq;

use client::engine::QueryEngine;
use client::events::{QueryEventSink, QueryPhase};
use client::filter::ServerFilter;
use shared::config::keys;
use shared::packet::{
    Packet, BUILD_VERSION, CURRENT_PROTOCOL_VERSION, MIN_REQUIRED_PROTOCOL_VERSION, VERSION_TAG,
};
use shared::{Millis, NetAddress, ServerStatus, TableConfig, Transport};

type SentLog = Arc<Mutex<Vec<(NetAddress, Vec<u8>)>>>;
type StatusLog = Arc<Mutex<Vec<(String, String, f32)>>>;

struct RecordingTransport {
    sent: SentLog,
}

impl Transport for RecordingTransport {
    fn send_to(&mut self, addr: &NetAddress, data: &[u8]) -> std::io::Result<()> {
        self.sent.lock().unwrap().push((*addr, data.to_vec()));
        Ok(())
    }
}

struct RecordingSink {
    statuses: StatusLog,
}

impl QueryEventSink for RecordingSink {
    fn on_status(&mut self, phase: QueryPhase, message: &str, progress: f32) {
        self.statuses
            .lock()
            .unwrap()
            .push((phase.as_str().to_string(), message.to_string(), progress));
    }
}

/// Engine plus its hand-advanced clock and recorded traffic.
struct Harness {
    engine: QueryEngine,
    clock: Millis,
    sent: SentLog,
    statuses: StatusLog,
}

impl Harness {
    fn new(config: TableConfig) -> Harness {
        let sent: SentLog = Arc::new(Mutex::new(Vec::new()));
        let statuses: StatusLog = Arc::new(Mutex::new(Vec::new()));
        let engine = QueryEngine::new(
            Box::new(RecordingTransport { sent: Arc::clone(&sent) }),
            Box::new(config),
            Box::new(RecordingSink {
                statuses: Arc::clone(&statuses),
            }),
        );
        Harness {
            engine,
            clock: 1,
            sent,
            statuses,
        }
    }

    /// Steps the virtual clock one millisecond at a time up to `target`.
    fn run_to(&mut self, target: Millis) {
        while self.clock < target {
            self.clock += 1;
            self.engine.advance(self.clock);
        }
    }

    fn deliver(&mut self, from: &NetAddress, packet: &Packet) {
        let now = self.clock;
        self.engine.handle_packet(from, &packet.encode(), now);
    }

    fn sent(&self) -> Vec<(NetAddress, Packet)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(addr, data)| (*addr, Packet::decode(data).unwrap()))
            .collect()
    }

    fn drain_sent(&self) -> Vec<(NetAddress, Packet)> {
        let decoded = self.sent();
        self.sent.lock().unwrap().clear();
        decoded
    }

    fn statuses(&self) -> Vec<(String, String, f32)> {
        self.statuses.lock().unwrap().clone()
    }

    fn done_messages(&self) -> Vec<String> {
        self.statuses()
            .into_iter()
            .filter(|(phase, _, _)| phase == "done")
            .map(|(_, message, _)| message)
            .collect()
    }
}

fn addr(last: u8) -> NetAddress {
    NetAddress::Ip {
        host: [192, 0, 2, last],
        port: 28000,
    }
}

fn one_master_config() -> TableConfig {
    let mut config = TableConfig::new();
    config.set(format!("{}0", keys::MASTER_PREFIX), "2:192.0.2.1:28002");
    config
}

fn master_addr() -> NetAddress {
    "192.0.2.1:28002".parse().unwrap()
}

fn last_ping_key(sent: &[(NetAddress, Packet)], to: &NetAddress) -> Option<u32> {
    sent.iter().rev().find_map(|(a, p)| match p {
        Packet::GamePingRequest { key, .. } if a == to => Some(*key),
        _ => None,
    })
}

fn ping_response(key: u32, name: &str) -> Packet {
    Packet::GamePingResponse {
        flags: 0,
        key,
        version_tag: VERSION_TAG.to_string(),
        protocol_current: CURRENT_PROTOCOL_VERSION,
        protocol_min: MIN_REQUIRED_PROTOCOL_VERSION,
        build_version: BUILD_VERSION,
        name: name.to_string(),
    }
}

fn info_response(num_players: u8) -> Packet {
    Packet::GameInfoResponse {
        flags: 0,
        key: 0,
        game_type: "CTF".to_string(),
        mission_type: "any".to_string(),
        mission_name: "canyon.mis".to_string(),
        status: ServerStatus::DEDICATED as u8,
        num_players,
        max_players: 16,
        num_bots: 0,
        cpu_speed: 2400,
        info_string: "come play".to_string(),
        status_string: "round 1".to_string(),
    }
}

fn list_response(request_key: u32, index: u8, total: u8, servers: Vec<NetAddress>) -> Packet {
    Packet::MasterServerListResponse {
        flags: 0,
        key: request_key,
        packet_index: index,
        packet_total: total,
        servers,
    }
}

// -------------------------------------------------------------------
// S1: LAN discovery with two responders
// -------------------------------------------------------------------

#[test]
fn lan_discovery_two_responders() {
    let mut h = Harness::new(TableConfig::new());
    let s1 = addr(10);
    let s2 = addr(11);

    let now = h.clock;
    h.engine
        .query_lan_servers(now, 28000, ServerFilter::default(), false);
    h.run_to(3);

    // The broadcast ping went out on the LAN port.
    let broadcast = NetAddress::ip_broadcast(28000);
    let bkey = last_ping_key(&h.sent(), &broadcast).expect("no broadcast ping sent");

    // Both servers answer the broadcast; those anonymous replies trigger
    // proper unicast pings for a real key round trip.
    h.deliver(&s1, &ping_response(bkey, "alpha"));
    h.deliver(&s2, &ping_response(bkey, "beta"));
    h.run_to(6);

    for server in [&s1, &s2] {
        let key = last_ping_key(&h.sent(), server).expect("no unicast ping sent");
        h.deliver(server, &ping_response(key, "named by ping"));
    }

    // The broadcast entry expires at its 800 ms window, then the query
    // phase interrogates both servers.
    h.run_to(850);
    let queried: Vec<NetAddress> = h
        .sent()
        .iter()
        .filter_map(|(a, p)| matches!(p, Packet::GameInfoRequest { .. }).then_some(*a))
        .collect();
    assert!(queried.contains(&s1) && queried.contains(&s2));

    h.deliver(&s1, &info_response(3));
    h.deliver(&s2, &info_response(5));
    h.run_to(860);

    assert_eq!(h.engine.server_count(), 2);
    for si in h.engine.servers() {
        assert!(si.is_local, "{} should be marked LAN-local", si.address);
        assert!(si.status.has_responded());
        assert!(!si.status.timed_out());
        assert_eq!(si.game_type, "CTF");
        // Trailing ".mis" is clipped from the mission name.
        assert_eq!(si.mission_name, "canyon");
    }
    assert_eq!(h.done_messages(), vec!["2 servers found.".to_string()]);
    assert!(!h.engine.query_in_progress());
}

// -------------------------------------------------------------------
// S2: master list reassembly with a dropped fragment
// -------------------------------------------------------------------

#[test]
fn master_list_reassembly_rerequests_missing_fragment() {
    let mut h = Harness::new(one_master_config());
    let now = h.clock;
    h.engine
        .query_master_server(now, 28000, ServerFilter::default(), Vec::new());

    // The full-list request went to the master.
    let sent = h.sent();
    let (to, request_key) = sent
        .iter()
        .find_map(|(a, p)| match p {
            Packet::MasterServerListRequest {
                key,
                packet_index: 255,
                ..
            } => Some((*a, *key)),
            _ => None,
        })
        .expect("no list request sent");
    assert_eq!(to, master_addr());

    // Fragments 0 and 2 arrive; fragment 2 repeats one address.
    h.run_to(2);
    let frag0: Vec<NetAddress> = (10..14).map(addr).collect();
    let mut frag2: Vec<NetAddress> = (20..24).map(addr).collect();
    frag2.push(addr(10));
    h.deliver(&master_addr(), &list_response(request_key, 0, 3, frag0));
    h.deliver(&master_addr(), &list_response(request_key, 2, 3, frag2));

    // Within the retry window only fragment 1 is re-requested, naming
    // its page and zeroing the filter fields.
    h.run_to(1040);
    let rerequests: Vec<Packet> = h
        .sent()
        .iter()
        .filter_map(|(_, p)| match p {
            Packet::MasterServerListRequest { packet_index, .. } if *packet_index != 255 => {
                Some(p.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(rerequests.len(), 1);
    let rerequest_key = match &rerequests[0] {
        Packet::MasterServerListRequest {
            packet_index: 1,
            key,
            game_type,
            region_mask: 0,
            version: 0,
            ..
        } => {
            assert!(game_type.is_empty());
            *key
        }
        other => panic!("unexpected re-request {:?}", other),
    };

    let frag1: Vec<NetAddress> = (30..33).map(addr).collect();
    h.deliver(&master_addr(), &list_response(rerequest_key, 1, 3, frag1));

    // Let every ping run its retries dry; twelve entries were listed but
    // one was a repeat, so eleven distinct servers get pinged.
    h.run_to(9000);
    let mut targets: Vec<NetAddress> = h
        .sent()
        .iter()
        .filter_map(|(a, p)| {
            (matches!(p, Packet::GamePingRequest { .. }) && !a.is_broadcast()).then_some(*a)
        })
        .collect();
    targets.sort_by_key(|a| a.to_string());
    targets.dedup();
    assert_eq!(targets.len(), 11);
    assert_eq!(h.done_messages().len(), 1);
}

// -------------------------------------------------------------------
// S3: master timeout and switchover exhaustion
// -------------------------------------------------------------------

#[test]
fn master_timeout_falls_back_to_lan_results() {
    let mut h = Harness::new(one_master_config());
    let now = h.clock;
    h.engine
        .query_master_server(now, 28000, ServerFilter::default(), Vec::new());

    // Three tries, 2000 ms apart, then the master is dropped and the
    // query degrades to whatever the LAN produced (nothing).
    h.run_to(6050);
    let list_requests = h
        .sent()
        .iter()
        .filter(|(_, p)| {
            matches!(
                p,
                Packet::MasterServerListRequest {
                    packet_index: 255,
                    ..
                }
            )
        })
        .count();
    assert_eq!(list_requests, 3);
    assert_eq!(h.done_messages(), vec!["No servers found.".to_string()]);
    assert!(!h.engine.query_in_progress());
}

// -------------------------------------------------------------------
// S4: protocol-tag mismatch prunes without querying
// -------------------------------------------------------------------

#[test]
fn version_tag_mismatch_marks_timed_out() {
    let mut config = TableConfig::new();
    config.set(keys::FAVORITE_COUNT, "1");
    config.set(
        format!("{}0", keys::FAVORITE_PREFIX),
        "Old faithful\t192.0.2.10:28000",
    );
    let mut h = Harness::new(config);
    let now = h.clock;
    h.engine.query_favorite_servers(now);
    h.run_to(3);

    let key = last_ping_key(&h.sent(), &addr(10)).expect("favorite was not pinged");
    let mut response = ping_response(key, "old");
    if let Packet::GamePingResponse { version_tag, .. } = &mut response {
        *version_tag = "VER2".to_string();
    }
    h.deliver(&addr(10), &response);
    h.run_to(10);

    let si = h.engine.server_info(0).unwrap();
    assert!(si.status.timed_out());
    assert!(!si.status.has_responded());
    assert!(h
        .sent()
        .iter()
        .all(|(_, p)| !matches!(p, Packet::GameInfoRequest { .. })));
    assert_eq!(h.done_messages(), vec!["No servers found.".to_string()]);
}

// -------------------------------------------------------------------
// S5: cancel mid-query
// -------------------------------------------------------------------

#[test]
fn cancel_mid_query_drops_everything_and_stays_silent() {
    let mut h = Harness::new(one_master_config());
    let now = h.clock;
    h.engine
        .query_master_server(now, 28000, ServerFilter::default(), Vec::new());

    let request_key = h
        .sent()
        .iter()
        .find_map(|(_, p)| match p {
            Packet::MasterServerListRequest { key, .. } => Some(*key),
            _ => None,
        })
        .unwrap();
    h.run_to(2);
    let servers: Vec<NetAddress> = (50..70).map(addr).collect();
    h.deliver(&master_addr(), &list_response(request_key, 0, 1, servers.clone()));
    h.run_to(4);

    // Five servers answer their pings and enter the query queue.
    let sent = h.sent();
    let answered: Vec<NetAddress> = servers
        .iter()
        .take(5)
        .map(|s| {
            let key = last_ping_key(&sent, s).expect("ping missing");
            h.deliver(s, &ping_response(key, "queued"));
            *s
        })
        .collect();

    let session_before = h.engine.session();
    h.engine.cancel_server_query();
    assert!(h.engine.session() > session_before);
    assert!(!h.engine.query_in_progress());

    for server in &answered {
        let si = h
            .engine
            .servers()
            .iter()
            .find(|si| si.address == *server)
            .expect("record vanished on cancel");
        assert!(si.status.timed_out());
    }

    // Late answers for the old session are ignored entirely.
    h.deliver(&answered[0], &info_response(4));
    h.run_to(2000);
    let si = h
        .engine
        .servers()
        .iter()
        .find(|si| si.address == answered[0])
        .unwrap();
    assert!(!si.status.has_responded());
    assert!(si.status.timed_out());

    // And no done event is ever emitted for a canceled query.
    assert!(h.done_messages().is_empty());
}

// -------------------------------------------------------------------
// Flight limits (at most 10 pings, 2 queries outstanding)
// -------------------------------------------------------------------

#[test]
fn flight_limits_hold_at_every_step() {
    let mut config = TableConfig::new();
    config.set(keys::FAVORITE_COUNT, "30");
    for i in 0..30 {
        config.set(
            format!("{}{}", keys::FAVORITE_PREFIX, i),
            format!("fav{}\t192.0.2.{}:28000", i, 100 + i),
        );
    }
    let mut h = Harness::new(config);

    let now = h.clock;
    h.engine.query_favorite_servers(now);

    // The first batch goes out immediately and is capped at ten.
    let mut step = h.drain_sent();
    let first_ping_batch = step
        .iter()
        .filter(|(_, p)| matches!(p, Packet::GamePingRequest { .. }))
        .count();
    assert_eq!(first_ping_batch, 10);

    let mut first_query_batch = None;
    for _ in 0..40 {
        // Answer this step's pings so the pipeline keeps pulling work.
        for (target, key) in step.iter().filter_map(|(a, p)| match p {
            Packet::GamePingRequest { key, .. } if !a.is_broadcast() => Some((*a, *key)),
            _ => None,
        }) {
            h.deliver(&target, &ping_response(key, "answered"));
        }

        let next = h.clock + 1;
        h.run_to(next);
        step = h.drain_sent();
        let pings = step
            .iter()
            .filter(|(_, p)| matches!(p, Packet::GamePingRequest { .. }))
            .count();
        let queries = step
            .iter()
            .filter(|(_, p)| matches!(p, Packet::GameInfoRequest { .. }))
            .count();
        assert!(pings <= 10, "{} pings in one tick", pings);
        assert!(queries <= 2, "{} queries in one tick", queries);
        if queries > 0 && first_query_batch.is_none() {
            first_query_batch = Some(queries);
        }
    }

    assert_eq!(first_query_batch, Some(2));
}

// -------------------------------------------------------------------
// Progress math
// -------------------------------------------------------------------

#[test]
fn progress_runs_through_both_halves() {
    let mut config = TableConfig::new();
    config.set(keys::FAVORITE_COUNT, "2");
    config.set(format!("{}0", keys::FAVORITE_PREFIX), "a\t192.0.2.10:28000");
    config.set(format!("{}1", keys::FAVORITE_PREFIX), "b\t192.0.2.11:28000");
    let mut h = Harness::new(config);

    let now = h.clock;
    h.engine.query_favorite_servers(now);
    h.run_to(3);

    // First ping answered: 1 of 2 pings done, so (2-1)/(2*2).
    let key = last_ping_key(&h.sent(), &addr(10)).unwrap();
    h.deliver(&addr(10), &ping_response(key, "a"));
    let ping_events: Vec<(String, String, f32)> = h
        .statuses()
        .into_iter()
        .filter(|(phase, _, _)| phase == "ping")
        .collect();
    let (_, message, progress) = ping_events.last().unwrap().clone();
    assert_eq!(message, "Pinging servers: 1 left...");
    assert_approx_eq!(progress, 0.25, 1e-6);

    let key = last_ping_key(&h.sent(), &addr(11)).unwrap();
    h.deliver(&addr(11), &ping_response(key, "b"));
    h.run_to(10);

    // First info answered: half way plus (2-1)/(2*2).
    h.deliver(&addr(10), &info_response(1));
    let query_events: Vec<(String, String, f32)> = h
        .statuses()
        .into_iter()
        .filter(|(phase, _, _)| phase == "query")
        .collect();
    let (_, message, progress) = query_events.last().unwrap().clone();
    assert_eq!(message, "Querying servers: 1 left...");
    assert_approx_eq!(progress, 0.75, 1e-6);

    h.deliver(&addr(11), &info_response(1));
    h.run_to(20);
    let (_, _, done_progress) = h
        .statuses()
        .into_iter()
        .find(|(phase, _, _)| phase == "done")
        .unwrap();
    assert_approx_eq!(done_progress, 1.0, 1e-6);
}

// -------------------------------------------------------------------
// Filter behavior across schedule jitter
// -------------------------------------------------------------------

#[test]
fn filtering_is_stable_under_timing_jitter() {
    let run = |ping_delay: Millis, reversed: bool| -> Vec<String> {
        let mut config = TableConfig::new();
        config.set(keys::FAVORITE_COUNT, "2");
        config.set(format!("{}0", keys::FAVORITE_PREFIX), "a\t192.0.2.10:28000");
        config.set(format!("{}1", keys::FAVORITE_PREFIX), "b\t192.0.2.11:28000");
        let mut h = Harness::new(config);

        let filter = ServerFilter {
            game_type: "CTF".to_string(),
            max_players: 255,
            min_players: 0,
            max_bots: 0,
            ..ServerFilter::default()
        };
        // LAN query with filters on, so pruning applies to both.
        let now = h.clock;
        h.engine.query_lan_servers(now, 28000, filter, true);
        h.run_to(2 + ping_delay);

        let order: Vec<NetAddress> = if reversed {
            vec![addr(11), addr(10)]
        } else {
            vec![addr(10), addr(11)]
        };
        let sent = h.sent();
        for server in &order {
            let key = last_ping_key(&sent, server).unwrap();
            h.deliver(server, &ping_response(key, "s"));
        }
        h.run_to(900);

        // One server passes the filter; the other runs bots and is cut.
        h.deliver(&addr(10), &info_response(3));
        let mut botty = info_response(3);
        if let Packet::GameInfoResponse { num_bots, .. } = &mut botty {
            *num_bots = 5;
        }
        h.deliver(&addr(11), &botty);
        h.run_to(2000);

        let mut result: Vec<String> = h
            .engine
            .servers()
            .iter()
            .filter(|si| si.status.has_responded())
            .map(|si| si.address.to_string())
            .collect();
        result.sort();
        result
    };

    let baseline = run(0, false);
    assert_eq!(baseline, vec!["192.0.2.10:28000".to_string()]);
    assert_eq!(run(3, true), baseline);
    assert_eq!(run(7, false), baseline);
}

// -------------------------------------------------------------------
// Master echo of our public address
// -------------------------------------------------------------------

#[test]
fn flagged_list_packets_populate_the_local_address_set() {
    let mut h = Harness::new(one_master_config());
    let now = h.clock;
    h.engine
        .query_master_server(now, 28000, ServerFilter::default(), Vec::new());
    let request_key = h
        .sent()
        .iter()
        .find_map(|(_, p)| match p {
            Packet::MasterServerListRequest { key, .. } => Some(*key),
            _ => None,
        })
        .unwrap();

    h.run_to(2);
    let own = addr(99);
    let mut response = list_response(request_key, 0, 1, vec![own]);
    if let Packet::MasterServerListResponse { flags, .. } = &mut response {
        *flags = 1;
    }
    h.deliver(&master_addr(), &response);

    assert!(h.engine.is_local_address(&own));
    assert!(!h.engine.is_local_address(&addr(98)));
}

// -------------------------------------------------------------------
// Single-server refresh keeps updating records unfiltered
// -------------------------------------------------------------------

#[test]
fn single_server_refresh_bypasses_filters() {
    let mut config = TableConfig::new();
    config.set(keys::FAVORITE_COUNT, "1");
    config.set(format!("{}0", keys::FAVORITE_PREFIX), "a\t192.0.2.10:28000");
    let mut h = Harness::new(config);

    // Seed the record with a completed filtered LAN query; zero bots
    // allowed, and the server reports zero.
    let filter = ServerFilter {
        max_bots: 0,
        ..ServerFilter::default()
    };
    let now = h.clock;
    h.engine.query_lan_servers(now, 28000, filter, true);
    h.run_to(3);
    let key = last_ping_key(&h.sent(), &addr(10)).unwrap();
    h.deliver(&addr(10), &ping_response(key, "a"));
    h.run_to(850);
    h.deliver(&addr(10), &info_response(2));
    h.run_to(900);
    assert_eq!(h.done_messages().len(), 1);

    // Refresh it as an update. The new answer now violates the active
    // filter, but updating records bypass rejection and keep the data.
    h.drain_sent();
    let now = h.clock;
    h.engine.query_single_server(now, &addr(10));
    h.run_to(h.clock + 3);
    let key = last_ping_key(&h.sent(), &addr(10)).unwrap();
    h.deliver(&addr(10), &ping_response(key, "a"));
    h.run_to(h.clock + 3);
    let mut update = info_response(9);
    if let Packet::GameInfoResponse { num_bots, .. } = &mut update {
        *num_bots = 6;
    }
    h.deliver(&addr(10), &update);
    h.run_to(h.clock + 10);

    let si = h.engine.server_info(0).unwrap();
    assert!(si.status.has_responded());
    assert_eq!(si.num_players, 9);
    assert_eq!(si.num_bots, 6);
    assert_eq!(h.engine.server_count(), 1);
}
