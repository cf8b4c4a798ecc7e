//! Tokio UDP driver for the query engine.
//!
//! The engine itself is synchronous; this module owns the socket, feeds
//! received datagrams and clock ticks into it, and sleeps until the
//! engine's next retry deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error};
use tokio::net::UdpSocket;
use tokio::time::sleep;

use shared::{Config, Millis, NetAddress, Transport};

use crate::engine::QueryEngine;
use crate::events::QueryEventSink;

/// [`Transport`] over a shared tokio UDP socket. Sends are best-effort:
/// a full send buffer drops the datagram, like any other packet loss.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> UdpTransport {
        UdpTransport { socket }
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, addr: &NetAddress, data: &[u8]) -> std::io::Result<()> {
        let Some(target) = addr.to_socket_addr() else {
            debug!("No socket transport for {}, datagram dropped", addr);
            return Ok(());
        };
        match self.socket.try_send_to(data, target) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Send buffer full, dropped datagram to {}", addr);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Binds a socket and drives a [`QueryEngine`] over it.
pub struct QueryRunner {
    socket: Arc<UdpSocket>,
    engine: QueryEngine,
    epoch: Instant,
}

impl QueryRunner {
    pub async fn bind(
        config: Box<dyn Config>,
        sink: Box<dyn QueryEventSink>,
    ) -> std::io::Result<QueryRunner> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        socket.set_broadcast(true)?;
        let transport = Box::new(UdpTransport::new(Arc::clone(&socket)));
        Ok(QueryRunner {
            engine: QueryEngine::new(transport, config, sink),
            socket,
            epoch: Instant::now(),
        })
    }

    /// Milliseconds since the runner came up, offset so the clock never
    /// reads zero (zero means "never sent" inside the engine).
    pub fn now(&self) -> Millis {
        self.epoch.elapsed().as_millis() as Millis + 1
    }

    pub fn engine_mut(&mut self) -> &mut QueryEngine {
        &mut self.engine
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    /// Pumps the engine until the active query completes and no retry
    /// work remains.
    pub async fn run_to_completion(&mut self) {
        loop {
            let now = self.now();
            self.engine.advance(now);
            if !self.engine.query_in_progress() && self.engine.next_deadline().is_none() {
                return;
            }
            self.pump_once().await;
        }
    }

    /// Pumps the engine for a fixed wall-clock window; used for
    /// fire-and-forget operations like the game-types catalogue fetch.
    pub async fn run_for(&mut self, window: Duration) {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            let now = self.now();
            self.engine.advance(now);
            self.pump_once().await;
        }
    }

    async fn pump_once(&mut self) {
        let now = self.now();
        let wait = self
            .engine
            .next_deadline()
            .map(|due| due.saturating_sub(now) as u64)
            .unwrap_or(250)
            .max(1);
        let mut buf = [0u8; 2048];
        tokio::select! {
            received = self.socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    if let Some(addr) = NetAddress::from_socket_addr(from) {
                        let now = self.now();
                        self.engine.handle_packet(&addr, &buf[..len], now);
                    }
                }
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    sleep(Duration::from_millis(10)).await;
                }
            },
            _ = sleep(Duration::from_millis(wait)) => {}
        }
    }
}
