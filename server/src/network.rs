//! Tokio UDP driver for the responder and heartbeat loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use tokio::net::UdpSocket;
use tokio::time::sleep;

use shared::{send_packet, Millis, NetAddress, TableConfig, Transport};

use crate::heartbeat::{Authenticator, Heartbeat};
use crate::responder::Responder;

/// [`Transport`] over a shared tokio UDP socket; best-effort sends.
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

/// Binds the game port and serves discovery queries until shutdown.
pub struct ServerRunner {
    socket: Arc<UdpSocket>,
    transport: UdpTransport,
    responder: Responder,
    heartbeat: Heartbeat,
    config: TableConfig,
    epoch: Instant,
}

impl ServerRunner {
    pub async fn bind(port: u16, config: TableConfig) -> std::io::Result<ServerRunner> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        info!("Responder listening on port {}", port);
        let transport = UdpTransport::new(Arc::clone(&socket));
        Ok(ServerRunner {
            socket,
            transport,
            responder: Responder::new(),
            heartbeat: Heartbeat::new(),
            config,
            epoch: Instant::now(),
        })
    }

    fn now(&self) -> Millis {
        self.epoch.elapsed().as_millis() as Millis + 1
    }

    pub fn responder_mut(&mut self) -> &mut Responder {
        &mut self.responder
    }

    /// Starts master registration; a refused authentication gate just
    /// means this server stays LAN-only.
    pub fn start_heartbeat(&mut self, auth: &dyn Authenticator) -> bool {
        let now = self.now();
        self.heartbeat
            .start(auth, &self.config, &mut self.transport, now)
    }

    pub fn stop_heartbeat(&mut self) {
        self.heartbeat.stop();
    }

    /// Serves forever: answer queries as they arrive, beat on schedule.
    pub async fn run(&mut self) {
        let mut buf = [0u8; 2048];
        loop {
            let now = self.now();
            self.heartbeat
                .advance(&self.config, &mut self.transport, now);

            let wait = self
                .heartbeat
                .next_deadline()
                .map(|due| due.saturating_sub(now) as u64)
                .unwrap_or(1000)
                .max(1);

            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if let Some(addr) = NetAddress::from_socket_addr(from) {
                            if let Some(reply) =
                                self.responder.handle_datagram(&self.config, &addr, &buf[..len])
                            {
                                send_packet(&mut self.transport, &addr, &reply);
                            }
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
}
