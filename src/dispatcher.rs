//! Per-query decision logic.
//!
//! Transports hand every inbound message to a [`Dispatcher`]. It answers `A`
//! questions that match an override rule itself and forwards everything
//! else through the [`Forwarder`].

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::{Message, OpCode};
use hickory_proto::rr::{Name, RecordType};
use tracing::{debug, info, warn};

use crate::forwarder::{Forwarded, Forwarder};
use crate::message;
use crate::rules::RuleSet;
use crate::stats::Stats;
use crate::transport::Protocol;

/// Action to take for a DNS query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Answer locally with a single `A` record.
    Override { name: Name, addr: Ipv4Addr },
    /// Send the query to the upstreams.
    Forward,
}

/// Shared query handler. Cloning is cheap; each transport gets its own
/// clone backed by the same rules, upstream list and stats.
#[derive(Clone)]
pub struct Dispatcher {
    rules: Arc<RuleSet>,
    self_ip: Ipv4Addr,
    forwarder: Arc<Forwarder>,
    stats: Arc<Stats>,
}

impl Dispatcher {
    pub fn new(
        rules: Arc<RuleSet>,
        self_ip: Ipv4Addr,
        forwarder: Arc<Forwarder>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            rules,
            self_ip,
            forwarder,
            stats,
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Decide whether `request` is answered locally.
    ///
    /// Only standard queries are eligible. Questions are checked in order and
    /// the first `A` question with a matching rule wins; `self` targets are
    /// replaced by this host's address.
    pub fn decide(&self, request: &Message) -> Action {
        if request.op_code() != OpCode::Query {
            return Action::Forward;
        }

        request
            .queries()
            .iter()
            .filter(|query| query.query_type() == RecordType::A)
            .find_map(|query| {
                let target = self.rules.lookup(&query.name().to_ascii())?;
                Some(Action::Override {
                    name: query.name().clone(),
                    addr: target.resolve(self.self_ip),
                })
            })
            .unwrap_or(Action::Forward)
    }

    /// Process one raw query and produce the raw response to send back.
    ///
    /// Messages the codec rejects are still forwarded byte for byte. Returns
    /// `None` when there is nothing to send: input shorter than a DNS header,
    /// or an unparsable query no upstream answered.
    pub async fn handle(&self, raw: &[u8], protocol: Protocol) -> Option<Vec<u8>> {
        let start = Instant::now();

        let request = match message::parse(raw) {
            Ok(request) => request,
            Err(_) if message::message_id(raw).is_none() => {
                debug!(protocol = %protocol, len = raw.len(), "dropping short query");
                return None;
            }
            Err(e) => {
                debug!(protocol = %protocol, error = %e, "forwarding unparsable query as is");
                let forwarded = self.forwarder.forward_opaque(raw, protocol).await;
                match &forwarded {
                    Some(_) => self.stats.record_forwarded(start.elapsed()),
                    None => self.stats.record_exhausted(start.elapsed()),
                }
                return forwarded.map(Forwarded::into_bytes);
            }
        };

        let response = match self.decide(&request) {
            Action::Override { name, addr } => {
                info!(protocol = %protocol, name = %name, addr = %addr, "answered locally");
                let reply = message::encode(&message::address_reply(&request, name, addr));
                self.stats.record_overridden(start.elapsed());
                reply
            }
            Action::Forward => {
                debug!(protocol = %protocol, tag = %message::query_tag(&request), "forwarding");
                self.forwarder.forward(&request, raw, protocol).await.map(|forwarded| {
                    match &forwarded {
                        Forwarded::Relayed { .. } => self.stats.record_forwarded(start.elapsed()),
                        Forwarded::Exhausted(_) => self.stats.record_exhausted(start.elapsed()),
                    }
                    forwarded.into_bytes()
                })
            }
        };

        match response {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(protocol = %protocol, error = %e, "failed to encode response");
                None
            }
        }
    }
}
