//! # Server Discovery Responder Library
//!
//! Server side of the game-server discovery subsystem. Two pieces:
//!
//! ## Responder
//! Answers the discovery traffic a running game server receives:
//! `GamePingRequest`, `GameInfoRequest`, `GameMasterInfoRequest`, and
//! LAN join invites. Every reply is built from a fresh snapshot of the
//! published configuration and echoes the request's flags and key field
//! verbatim, so clients can correlate answers with their bounded-retry
//! probes. A server that is full, closed, or single-player simply stays
//! silent; there is no negative reply in this protocol.
//!
//! ## Heartbeat
//! Keeps the server registered with every configured master directory
//! by sending `GameHeartbeat` on a ten-second cadence. The loop is
//! gated by a sequence counter rather than a cancellable timer handle:
//! stopping bumps the sequence, and the already-scheduled tick discards
//! itself when it fires against the stale value.
//!
//! The [`network`] module supplies the tokio socket driver; the
//! responder and heartbeat themselves are synchronous and testable with
//! a recording transport and a hand-advanced clock.

pub mod heartbeat;
pub mod network;
pub mod responder;
