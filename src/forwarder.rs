//! Upstream failover forwarding.
//!
//! Upstreams are tried in their current order. The first one that answers
//! is moved to the front, so later queries start with the resolver that
//! most recently worked.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::error::ProtoError;
use hickory_proto::op::Message;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::message;
use crate::transport::Protocol;

/// One request/response exchange with an upstream resolver.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Send `query` to `upstream` (`host:port`) and return the raw response.
    ///
    /// `client` is the protocol the query arrived on; the response must fit
    /// what that client can receive.
    async fn exchange(
        &self,
        query: &[u8],
        upstream: &str,
        client: Protocol,
    ) -> Result<Vec<u8>, ExchangeError>;
}

/// Ordered upstream addresses shared by every query handler.
///
/// Reads and rotations happen under one lock, so concurrent promotions may
/// interleave in any order but never lose or duplicate an address.
#[derive(Debug)]
pub struct UpstreamList {
    servers: Mutex<Vec<String>>,
}

impl UpstreamList {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers: Mutex::new(servers),
        }
    }

    /// Current try order.
    pub fn snapshot(&self) -> Vec<String> {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move `upstream` to the front, keeping the relative order of the rest.
    ///
    /// Everything ahead of it is rotated to the back. Unknown addresses are
    /// ignored.
    pub fn promote(&self, upstream: &str) {
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = servers.iter().position(|s| s == upstream) {
            servers.rotate_left(index);
        }
    }
}

/// Result of forwarding one query.
#[derive(Debug)]
pub enum Forwarded {
    /// An upstream answered; `response` is its message, unmodified.
    Relayed {
        upstream: String,
        response: Vec<u8>,
        rtt: Duration,
    },
    /// Every upstream failed; an empty reply to the request.
    Exhausted(Vec<u8>),
}

impl Forwarded {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Relayed { response, .. } => response,
            Self::Exhausted(reply) => reply,
        }
    }
}

/// Forwards queries through the upstream list with failover and promotion.
pub struct Forwarder {
    upstreams: UpstreamList,
    exchange: Arc<dyn Exchange>,
}

impl Forwarder {
    pub fn new(upstreams: UpstreamList, exchange: Arc<dyn Exchange>) -> Self {
        Self {
            upstreams,
            exchange,
        }
    }

    pub fn upstreams(&self) -> &UpstreamList {
        &self.upstreams
    }

    /// Forward `raw` (the wire form of `request`) to the first upstream that
    /// answers.
    ///
    /// Upstream failures are logged and skipped. If all of them fail the
    /// result is an empty reply rather than an error; the only error is a
    /// failure to encode that reply.
    pub async fn forward(
        &self,
        request: &Message,
        raw: &[u8],
        client: Protocol,
    ) -> Result<Forwarded, ProtoError> {
        let tag = message::query_tag(request);
        if let Some(relayed) = self.relay(raw, &tag, client).await {
            return Ok(relayed);
        }

        warn!(tag = %tag, "all upstreams failed");
        let reply = message::encode(&message::reply(request))?;

        Ok(Forwarded::Exhausted(reply))
    }

    /// Forward a message that could not be parsed, byte for byte.
    ///
    /// There is no request to build an empty reply from, so exhaustion
    /// yields `None`.
    pub async fn forward_opaque(&self, raw: &[u8], client: Protocol) -> Option<Forwarded> {
        let relayed = self.relay(raw, "unparsed", client).await;
        if relayed.is_none() {
            warn!(tag = "unparsed", "all upstreams failed");
        }
        relayed
    }

    async fn relay(&self, raw: &[u8], tag: &str, client: Protocol) -> Option<Forwarded> {
        for upstream in self.upstreams.snapshot() {
            let start = Instant::now();
            match self.exchange.exchange(raw, &upstream, client).await {
                Ok(response) => {
                    let rtt = start.elapsed();
                    info!(upstream = %upstream, tag = %tag, rtt = ?rtt, "query ok");
                    log_answers(&response);

                    self.upstreams.promote(&upstream);

                    return Some(Forwarded::Relayed {
                        upstream,
                        response,
                        rtt,
                    });
                }
                Err(e) => {
                    warn!(upstream = %upstream, tag = %tag, error = %e, "query failed");
                }
            }
        }

        None
    }
}

fn log_answers(response: &[u8]) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    if let Ok(parsed) = message::parse(response) {
        for answer in parsed.answers() {
            debug!(answer = %answer, "upstream answer");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use rustc_hash::FxHashSet;
    use std::io;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    /// Answers from a fixed set of addresses, fails for the rest, and
    /// records every address it was asked to contact. Queries it cannot
    /// parse are echoed back with the response bit set.
    pub(crate) struct FakeExchange {
        up: FxHashSet<String>,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl FakeExchange {
        pub(crate) fn new(up: &[&str]) -> Self {
            Self {
                up: up.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Exchange for FakeExchange {
        async fn exchange(
            &self,
            query: &[u8],
            upstream: &str,
            _client: Protocol,
        ) -> Result<Vec<u8>, ExchangeError> {
            self.calls.lock().unwrap().push(upstream.to_string());
            if !self.up.contains(upstream) {
                return Err(ExchangeError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }

            let Ok(request) = message::parse(query) else {
                let mut echo = query.to_vec();
                echo[2] |= 0x80;
                return Ok(echo);
            };
            let name = request.queries()[0].name().clone();
            let reply = message::address_reply(&request, name, Ipv4Addr::new(203, 0, 113, 7));
            message::encode(&reply).map_err(|e| ExchangeError::Malformed(e.to_string()))
        }
    }

    pub(crate) fn request(name: &str, qtype: RecordType) -> Message {
        let mut message = Message::new();
        message
            .set_id(0xbeef)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        message
    }

    fn list(servers: &[&str]) -> UpstreamList {
        UpstreamList::new(servers.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn promote_rotates_left_by_index() {
        let upstreams = list(&["a", "b", "c", "d"]);

        upstreams.promote("c");
        assert_eq!(upstreams.snapshot(), ["c", "d", "a", "b"]);

        upstreams.promote("c");
        assert_eq!(upstreams.snapshot(), ["c", "d", "a", "b"]);

        upstreams.promote("unknown");
        assert_eq!(upstreams.snapshot(), ["c", "d", "a", "b"]);
    }

    #[tokio::test]
    async fn failover_promotes_first_success() {
        let exchange = Arc::new(FakeExchange::new(&["b:53", "c:53"]));
        let forwarder = Forwarder::new(list(&["a:53", "b:53", "c:53"]), exchange.clone());
        let request = request("example.com.", RecordType::A);
        let raw = message::encode(&request).unwrap();

        let forwarded = forwarder.forward(&request, &raw, Protocol::Udp).await.unwrap();

        match &forwarded {
            Forwarded::Relayed { upstream, .. } => assert_eq!(upstream, "b:53"),
            other => panic!("expected relayed response, got {other:?}"),
        }
        assert_eq!(exchange.calls(), ["a:53", "b:53"]);
        assert_eq!(forwarder.upstreams().snapshot(), ["b:53", "c:53", "a:53"]);

        let reply = message::parse(&forwarded.into_bytes()).unwrap();
        assert_eq!(reply.id(), 0xbeef);
        assert_eq!(reply.answers().len(), 1);
    }

    #[tokio::test]
    async fn promoted_upstream_is_tried_first() {
        let exchange = Arc::new(FakeExchange::new(&["b:53"]));
        let forwarder = Forwarder::new(list(&["a:53", "b:53"]), exchange.clone());
        let request = request("example.com.", RecordType::A);
        let raw = message::encode(&request).unwrap();

        forwarder.forward(&request, &raw, Protocol::Udp).await.unwrap();
        forwarder.forward(&request, &raw, Protocol::Udp).await.unwrap();

        assert_eq!(exchange.calls(), ["a:53", "b:53", "b:53"]);
    }

    #[tokio::test]
    async fn first_upstream_success_keeps_order() {
        let exchange = Arc::new(FakeExchange::new(&["a:53", "b:53"]));
        let forwarder = Forwarder::new(list(&["a:53", "b:53", "c:53"]), exchange.clone());
        let request = request("example.com.", RecordType::A);
        let raw = message::encode(&request).unwrap();

        forwarder.forward(&request, &raw, Protocol::Udp).await.unwrap();

        assert_eq!(exchange.calls(), ["a:53"]);
        assert_eq!(forwarder.upstreams().snapshot(), ["a:53", "b:53", "c:53"]);
    }

    #[tokio::test]
    async fn exhaustion_returns_empty_reply() {
        let exchange = Arc::new(FakeExchange::new(&[]));
        let forwarder = Forwarder::new(list(&["a:53", "b:53"]), exchange.clone());
        let request = request("example.com.", RecordType::MX);
        let raw = message::encode(&request).unwrap();

        let forwarded = forwarder.forward(&request, &raw, Protocol::Udp).await.unwrap();

        assert!(matches!(forwarded, Forwarded::Exhausted(_)));
        let reply = message::parse(&forwarded.into_bytes()).unwrap();
        assert_eq!(reply.id(), 0xbeef);
        assert_eq!(reply.op_code(), OpCode::Query);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert!(reply.answers().is_empty());
        assert_eq!(exchange.calls(), ["a:53", "b:53"]);
        assert_eq!(forwarder.upstreams().snapshot(), ["a:53", "b:53"]);
    }

    #[tokio::test]
    async fn opaque_forward_relays_raw_bytes() {
        let exchange = Arc::new(FakeExchange::new(&["b:53"]));
        let forwarder = Forwarder::new(list(&["a:53", "b:53"]), exchange.clone());
        let raw = [0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

        match forwarder.forward_opaque(&raw, Protocol::Tcp).await {
            Some(Forwarded::Relayed { upstream, response, .. }) => {
                assert_eq!(upstream, "b:53");
                assert_eq!(&response[..2], &[0x12, 0x34]);
                assert_ne!(response[2] & 0x80, 0);
            }
            other => panic!("expected relayed response, got {other:?}"),
        }
        assert_eq!(forwarder.upstreams().snapshot(), ["b:53", "a:53"]);

        let dead = Forwarder::new(list(&["a:53"]), Arc::new(FakeExchange::new(&[])));
        assert!(dead.forward_opaque(&raw, Protocol::Udp).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_promotions_keep_every_address() {
        let servers: Vec<String> = (0..8).map(|i| format!("10.0.0.{i}:53")).collect();
        let upstreams = Arc::new(UpstreamList::new(servers.clone()));

        let tasks = (0..64).map(|i| {
            let upstreams = upstreams.clone();
            let target = servers[(i * 5) % servers.len()].clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    upstreams.promote(&target);
                    tokio::task::yield_now().await;
                }
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        let mut after = upstreams.snapshot();
        after.sort();
        let mut expected = servers;
        expected.sort();
        assert_eq!(after, expected);
    }
}
