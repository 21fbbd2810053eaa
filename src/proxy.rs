//! DNS proxy orchestration.
//!
//! Builds the shared rule set, forwarder and stats, binds the UDP and TCP
//! listeners and runs them until one stops.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::forwarder::{Forwarder, UpstreamList};
use crate::rules::RuleSet;
use crate::stats::Stats;
use crate::transport::client::NetworkExchange;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};

/// A bound, not yet serving, proxy.
pub struct Proxy {
    udp: UdpTransport,
    tcp: TcpTransport,
    dispatcher: Dispatcher,
    forwarder: Arc<Forwarder>,
    stats: Arc<Stats>,
    stats_interval: Duration,
}

impl Proxy {
    /// Bind both listeners on `config.addr`.
    ///
    /// UDP is bound first and TCP reuses its port, so a port of 0 gives both
    /// listeners the same ephemeral port.
    pub async fn bind(config: &Config, rules: RuleSet, self_ip: Ipv4Addr) -> Result<Self, Error> {
        let udp = UdpTransport::bind(config.addr).await?;
        let tcp = TcpTransport::bind(udp.local_addr()?).await?;

        let exchange = Arc::new(NetworkExchange::new(config.timeout()));
        let forwarder = Arc::new(Forwarder::new(
            UpstreamList::new(config.servers.clone()),
            exchange,
        ));
        let stats = Arc::new(Stats::new());
        let dispatcher = Dispatcher::new(Arc::new(rules), self_ip, forwarder.clone(), stats.clone());

        Ok(Self {
            udp,
            tcp,
            dispatcher,
            forwarder,
            stats,
            stats_interval: Duration::from_secs(config.stats_interval_secs),
        })
    }

    /// Address both listeners are bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Serve until a listener stops. Never returns `Ok`.
    pub async fn run(self) -> Result<(), Error> {
        info!(
            addr = %self.local_addr()?,
            upstreams = ?self.forwarder.upstreams().snapshot(),
            "DNS proxy listening"
        );

        let udp = self.udp.start(self.dispatcher.clone());
        let tcp = self.tcp.start(self.dispatcher);

        if !self.stats_interval.is_zero() {
            tokio::spawn(stats_loop(self.stats, self.forwarder, self.stats_interval));
        }

        let (result, index, _) = futures::future::select_all([udp, tcp]).await;
        let listener = if index == 0 { "UDP" } else { "TCP" };
        if let Err(e) = result {
            error!(listener, "listener task failed: {}", e);
        }

        Err(Error::ListenerStopped(listener))
    }
}

/// Log a stats line every `interval`.
async fn stats_loop(stats: Arc<Stats>, forwarder: Arc<Forwarder>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip first immediate tick
    loop {
        ticker.tick().await;
        let snapshot = stats.snapshot_and_reset();
        info!(
            requests = snapshot.requests,
            overridden = snapshot.overridden,
            forwarded = snapshot.forwarded,
            exhausted = snapshot.exhausted,
            avg_response_ms = snapshot.avg_response_ms,
            upstreams = ?forwarder.upstreams().snapshot(),
            "stats"
        );
    }
}
