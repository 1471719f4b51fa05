use crate::plugin::Plugin;
use crate::types::QueryContext;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, TXT};
use hickory_proto::rr::{RData, Record, RecordType};
use std::net::IpAddr;

/// Answers every query with the client's own address and endpoint.
pub struct ReflectPlugin;

impl Plugin for ReflectPlugin {
    fn name(&self) -> &str { "reflect" }

    fn process(&self, query: &QueryContext, request: &Message) -> Option<Message> {
        Some(respond(query, request))
    }

    fn priority(&self) -> u8 { 200 }
}

/// Build the reply header the way a DNS server replies to any query:
/// same id/opcode/RD/CD, QR set, question echoed.
pub fn reply_to(request: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_checking_disabled(request.checking_disabled())
        .set_response_code(ResponseCode::NoError);
    if let Some(question) = request.queries().first() {
        reply.add_query(question.clone());
    }
    reply
}

/// A record for v4 clients, AAAA for v6 ones.
pub fn address_record(query: &QueryContext) -> Record {
    let rdata = match query.remote_ip() {
        IpAddr::V4(v4) => RData::A(A(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
    };
    Record::from_rdata(query.name.clone(), 0, rdata)
}

pub fn endpoint_record(query: &QueryContext) -> Record {
    Record::from_rdata(query.name.clone(), 0, RData::TXT(TXT::new(vec![query.endpoint()])))
}

pub fn respond(query: &QueryContext, request: &Message) -> Message {
    let mut reply = reply_to(request);
    match query.query_type {
        RecordType::TXT => { reply.add_answer(endpoint_record(query)); }
        // The family of the client decides, not the requested type.
        RecordType::A | RecordType::AAAA | RecordType::ANY => { reply.add_answer(address_record(query)); }
        _ => {}
    }
    reply
}
