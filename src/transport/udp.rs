//! UDP transport for DNS queries.
//!
//! Each datagram is handled in its own task so a slow upstream only holds
//! up the query waiting on it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::dispatcher::Dispatcher;

use super::{MAX_DNS_PACKET_SIZE, Protocol};

/// UDP listener for the DNS proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the receive loop.
    pub fn start(self, dispatcher: Dispatcher) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, dispatcher))
    }
}

async fn run(socket: Arc<UdpSocket>, dispatcher: Dispatcher) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                error!("UDP recv error: {}", e);
                continue;
            }
        };

        if len < 12 {
            continue;
        }

        let query = buf[..len].to_vec();
        let socket = socket.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let Some(response) = dispatcher.handle(&query, Protocol::Udp).await else {
                return;
            };
            if let Err(e) = socket.send_to(&response, src).await {
                warn!(client = %src, "UDP response error: {}", e);
            }
        });
    }
}
