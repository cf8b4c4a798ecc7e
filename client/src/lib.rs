//! # Server Discovery Client Library
//!
//! Client side of the game-server discovery subsystem. It finds live
//! game servers two ways, broadcasting on the LAN and walking one or
//! more master-server directories, then pings and interrogates every
//! candidate to build a filtered list of joinable servers.
//!
//! ## Architecture Overview
//!
//! Everything interesting happens in the [`engine::QueryEngine`], a
//! single-threaded state machine that owns the discovery pipeline:
//!
//! 1. **Master list fetch**: one request in flight, retried with fresh
//!    keys and failed over across masters by region preference.
//! 2. **List-packet reassembly**: the paginated response is tracked
//!    page by page and missing pages are re-requested individually.
//! 3. **Ping**: every learned address gets a bounded-retry round-trip
//!    probe, at most ten concurrently.
//! 4. **Info query**: responsive servers are asked for full details,
//!    at most two concurrently, and filtered as answers arrive.
//!
//! The engine performs no IO and reads no clock of its own. Datagrams,
//! virtual-time ticks, configuration and status callbacks all flow
//! through injected interfaces, which keeps the whole protocol state
//! machine deterministic under test.
//!
//! ## Module Organization
//!
//! - [`engine`]: the query state machine and NAT-traversal dispatch
//! - [`filter`]: the active filter and its pruning chain
//! - [`server_list`]: discovered-server records keyed by address
//! - [`events`]: status/callback sink trait and the logging sink
//! - [`network`]: the tokio socket driver feeding the engine
//!
//! ## Cancellation Model
//!
//! There is exactly one cancellation primitive: bumping the engine's
//! session counter. Scheduled retries and late responses carry the
//! session they were created under and are silently discarded once it
//! goes stale, so a cancel takes effect within a single event tick.

pub mod engine;
pub mod events;
pub mod filter;
pub mod network;
pub mod server_list;
