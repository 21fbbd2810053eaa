//! Upstream client used by the forwarder.
//!
//! Queries go out over UDP. For clients that asked over TCP, a truncated UDP
//! answer is retried once over TCP, where DNS messages carry a 2-byte
//! big-endian length prefix. UDP clients get the truncated answer as is, so
//! they see the TC bit and retry over TCP themselves.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tracing::debug;

use crate::error::ExchangeError;
use crate::forwarder::Exchange;
use crate::message;

use super::{MAX_DNS_PACKET_SIZE, Protocol};

/// Network exchange with a bounded timeout per upstream attempt.
#[derive(Debug, Clone)]
pub struct NetworkExchange {
    timeout: Duration,
}

impl NetworkExchange {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn resolve(&self, upstream: &str) -> Result<SocketAddr, ExchangeError> {
        let mut addrs = self.within(lookup_host(upstream)).await??;
        addrs.next().ok_or_else(|| {
            ExchangeError::Malformed(format!("upstream {upstream} resolved to no address"))
        })
    }

    async fn exchange_udp(&self, query: &[u8], server: SocketAddr) -> Result<Vec<u8>, ExchangeError> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;

        self.within(socket.send(query)).await??;

        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        let len = self.within(socket.recv(&mut buf)).await??;
        buf.truncate(len);

        Ok(buf)
    }

    async fn exchange_tcp(&self, query: &[u8], server: SocketAddr) -> Result<Vec<u8>, ExchangeError> {
        self.within(async {
            let mut stream = TcpStream::connect(server).await?;
            stream.set_nodelay(true)?;
            write_framed(&mut stream, query).await?;
            Ok::<_, std::io::Error>(read_framed(&mut stream).await?)
        })
        .await?
        .map_err(ExchangeError::from)
    }

    async fn within<F: Future>(&self, fut: F) -> Result<F::Output, ExchangeError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ExchangeError::Timeout(self.timeout))
    }
}

#[async_trait]
impl Exchange for NetworkExchange {
    async fn exchange(
        &self,
        query: &[u8],
        upstream: &str,
        client: Protocol,
    ) -> Result<Vec<u8>, ExchangeError> {
        let expected = message::message_id(query)
            .ok_or_else(|| ExchangeError::Malformed("query shorter than a DNS header".into()))?;
        let server = self.resolve(upstream).await?;

        let mut response = self.exchange_udp(query, server).await?;
        if client == Protocol::Tcp && message::is_truncated(&response) {
            debug!(upstream = %upstream, "truncated UDP response, retrying over TCP");
            response = self.exchange_tcp(query, server).await?;
        }

        match message::message_id(&response) {
            Some(got) if got == expected => Ok(response),
            Some(got) => Err(ExchangeError::IdMismatch { expected, got }),
            None => Err(ExchangeError::Malformed("response shorter than a DNS header".into())),
        }
    }
}

/// Write one length-prefixed DNS message.
pub async fn write_framed(stream: &mut TcpStream, message: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(message.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "DNS message too large for TCP")
    })?;
    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await
}

/// Read one length-prefixed DNS message, without the prefix.
pub async fn read_framed(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;

    Ok(buf)
}
