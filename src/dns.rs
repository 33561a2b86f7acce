use std::net::IpAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use trust_dns_proto::op::{Header, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::rdata::{A, AAAA, CNAME};
use trust_dns_proto::rr::{Name, RData, Record, RecordType};
use trust_dns_server::authority::MessageResponseBuilder;
use trust_dns_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use uuid::Uuid;

use crate::manager::RebindManager;
use crate::rebind::DnsAnswer;

/// Canonical UUID leading label, as minted for offer subdomains.
static SUBDOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})\.").unwrap()
});

/// Extracts the offer UUID from the leading label of a DNS name or a
/// Host header value.
pub fn extract_offer_id(name: &str) -> Option<Uuid> {
    let caps = SUBDOMAIN_RE.captures(name)?;
    Uuid::parse_str(caps.get(1)?.as_str()).ok()
}

/// Answers DNS queries by routing the subdomain-embedded offer UUID to
/// its registered strategy. Anything that does not resolve to a live
/// offer is refused.
pub struct DnsResponder {
    mgr: Arc<RebindManager>,
}

impl DnsResponder {
    pub fn new(mgr: Arc<RebindManager>) -> Self {
        Self { mgr }
    }

    async fn refuse<R: ResponseHandler>(&self, request: &Request, mut handle: R) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.error_msg(request.header(), ResponseCode::Refused);
        match handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                log::error!("failed to write dns refusal: {e}");
                failed_response_info()
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for DnsResponder {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        if request.op_code() != OpCode::Query || request.message_type() != MessageType::Query {
            return self.refuse(request, response_handle).await;
        }
        let query = request.query();
        let qtype = query.query_type();
        log::debug!(
            "got dns request {} {} from {}",
            query.name(),
            qtype,
            request.src()
        );

        // The lowered form keeps 0x20-mixed-case queries routable while
        // matching the canonical lowercase pattern.
        let Some(id) = extract_offer_id(&query.name().to_string()) else {
            return self.refuse(request, response_handle).await;
        };
        let Some(strategy) = self.mgr.lookup(&id).await else {
            return self.refuse(request, response_handle).await;
        };

        let answers = strategy.handle_dns(qtype);
        let qname = query.original().name().clone();
        let records = build_records(&qname, qtype, &answers);

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            records.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                log::error!("failed to write dns response: {e}");
                failed_response_info()
            }
        }
    }
}

/// Maps strategy answers onto wire records of the queried type, in the
/// order the strategy produced them. Answers that cannot be expressed
/// in the queried type are dropped.
pub fn build_records(name: &Name, qtype: RecordType, answers: &[DnsAnswer]) -> Vec<Record> {
    let mut records = Vec::with_capacity(answers.len());
    for answer in answers {
        let rdata = match qtype {
            RecordType::A => match answer.addr.internal_ip {
                Some(IpAddr::V4(v4)) => RData::A(A(v4)),
                _ => continue,
            },
            RecordType::AAAA => match answer.addr.internal_ip {
                Some(IpAddr::V6(v6)) => RData::AAAA(AAAA(v6)),
                _ => continue,
            },
            RecordType::CNAME => match Name::from_utf8(&answer.addr.host) {
                Ok(target) => RData::CNAME(CNAME(target)),
                Err(_) => continue,
            },
            _ => continue,
        };
        records.push(Record::from_rdata(name.clone(), answer.ttl, rdata));
    }
    records
}

fn failed_response_info() -> ResponseInfo {
    let mut header = Header::new();
    header.set_response_code(ResponseCode::ServFail);
    header.into()
}
