//! DNS message helpers on top of `hickory-proto`.
//!
//! Forwarded traffic never goes through here; upstream responses are relayed
//! as raw bytes. This module only parses inbound requests and builds the
//! replies the proxy answers itself.

use std::net::Ipv4Addr;

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record};

const HEADER_LEN: usize = 12;

/// TTL of synthesized address records.
pub const ANSWER_TTL: u32 = 3600;

/// Parse a request from wire format.
pub fn parse(raw: &[u8]) -> Result<Message, ProtoError> {
    Message::from_vec(raw)
}

/// Encode a message to wire format.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtoError> {
    message.to_vec()
}

/// An empty reply to `request`.
///
/// Mirrors the id, opcode, recursion-desired and checking-disabled flags and
/// the question section. Response code is NoError and there are no answers.
pub fn reply(request: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_checking_disabled(request.checking_disabled())
        .set_response_code(ResponseCode::NoError);
    reply.add_queries(request.queries().iter().cloned());
    reply
}

/// A reply to `request` carrying a single `A` record.
pub fn address_reply(request: &Message, name: Name, ip: Ipv4Addr) -> Message {
    let mut reply = reply(request);
    reply.add_answer(address_record(name, ip));
    reply
}

pub fn address_record(name: Name, ip: Ipv4Addr) -> Record {
    Record::from_rdata(name, ANSWER_TTL, RData::A(A(ip)))
}

/// Short description of a request for log lines: `op=0 qt=1 name=example.com.`
pub fn query_tag(request: &Message) -> String {
    let op = u8::from(request.op_code());
    match request.queries().first() {
        Some(query) => format!(
            "op={} qt={} name={}",
            op,
            u16::from(query.query_type()),
            query.name()
        ),
        None => format!("op={op} qt=- name=-"),
    }
}

/// Transaction id of a raw message.
pub fn message_id(raw: &[u8]) -> Option<u16> {
    if raw.len() < HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([raw[0], raw[1]]))
}

/// Whether the TC bit is set in a raw message.
pub fn is_truncated(raw: &[u8]) -> bool {
    raw.len() >= HEADER_LEN && raw[2] & 0x02 != 0
}
