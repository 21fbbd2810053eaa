//! TCP transport for DNS queries.
//!
//! Each client connection is handled independently. A connection may carry
//! several length-prefixed queries; it is closed on EOF, on a framing error,
//! or after sitting idle.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::dispatcher::Dispatcher;

use super::Protocol;
use super::client::{read_framed, write_framed};

/// How long a client connection may sit without sending a query.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP listener for the DNS proxy.
///
/// Accepts connections from clients and handles each in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the accept loop.
    pub fn start(self, dispatcher: Dispatcher) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, dispatcher))
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop(listener: TcpListener, dispatcher: Dispatcher) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(client, peer, dispatcher.clone()));
            }
            Err(e) => {
                error!("TCP accept error: {}", e);
            }
        }
    }
}

/// Serve queries on one connection until the client goes away.
async fn handle_connection(mut client: TcpStream, peer: SocketAddr, dispatcher: Dispatcher) {
    loop {
        let query = match tokio::time::timeout(IDLE_TIMEOUT, read_framed(&mut client)).await {
            Ok(Ok(query)) => query,
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return,
            Ok(Err(e)) => {
                debug!(client = %peer, "TCP read error: {}", e);
                return;
            }
            Err(_) => {
                debug!(client = %peer, "closing idle TCP connection");
                return;
            }
        };

        let Some(response) = dispatcher.handle(&query, Protocol::Tcp).await else {
            return;
        };

        if let Err(e) = write_framed(&mut client, &response).await {
            debug!(client = %peer, "TCP write error: {}", e);
            return;
        }
    }
}
