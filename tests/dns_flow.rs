use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use trust_dns_client::client::{AsyncClient, ClientHandle};
use trust_dns_proto::op::ResponseCode;
use trust_dns_proto::rr::rdata::A;
use trust_dns_proto::rr::{DNSClass, Name, RData, RecordType};
use trust_dns_proto::udp::UdpClientStream;
use trust_dns_server::ServerFuture;
use uuid::Uuid;

use rebindd::addr::Address;
use rebindd::dns::DnsResponder;
use rebindd::manager::RebindManager;
use rebindd::rebind::{RebindStrategy, ThresholdRebind, TtlRebind};

const POOL_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const VICTIM_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 5);

struct Harness {
    mgr: Arc<RebindManager>,
    root: CancellationToken,
    client: AsyncClient,
}

async fn harness() -> Harness {
    let root = CancellationToken::new();
    let pool = vec![Address::parse("127.0.0.1:80").unwrap()];
    let mgr = RebindManager::new("r.test".to_string(), pool, root.clone());

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dns_addr = udp.local_addr().unwrap();
    let mut server = ServerFuture::new(DnsResponder::new(mgr.clone()));
    server.register_socket(udp);
    tokio::spawn(async move {
        let _ = server.block_until_done().await;
    });

    let stream = UdpClientStream::<UdpSocket>::new(dns_addr);
    let (client, bg) = AsyncClient::connect(stream).await.unwrap();
    tokio::spawn(bg);

    Harness { mgr, root, client }
}

impl Harness {
    /// Registers a strategy under a fresh offer UUID and returns the
    /// query name for it.
    async fn offer(&self, strategy: RebindStrategy) -> Name {
        let id = Uuid::new_v4();
        self.mgr
            .register(id, Arc::new(strategy), &self.root)
            .await;
        Name::from_utf8(format!("{id}.r.test.")).unwrap()
    }
}

fn single_a(answers: &[trust_dns_proto::rr::Record]) -> (Ipv4Addr, u32) {
    assert_eq!(answers.len(), 1, "expected exactly one answer");
    match answers[0].data() {
        Some(RData::A(A(ip))) => (*ip, answers[0].ttl()),
        other => panic!("unexpected rdata: {other:?}"),
    }
}

#[tokio::test]
async fn unknown_offer_subdomains_are_refused() {
    let mut h = harness().await;
    let name = Name::from_utf8(format!("{}.r.test.", Uuid::new_v4())).unwrap();
    let response = h.client.query(name, DNSClass::IN, RecordType::A).await.unwrap();
    assert_eq!(response.response_code(), ResponseCode::Refused);
    assert!(response.answers().is_empty());
}

#[tokio::test]
async fn non_uuid_subdomains_are_refused() {
    let mut h = harness().await;
    let name = Name::from_utf8("www.r.test.").unwrap();
    let response = h.client.query(name, DNSClass::IN, RecordType::A).await.unwrap();
    assert_eq!(response.response_code(), ResponseCode::Refused);
}

#[tokio::test]
async fn ttl_rebind_moves_to_the_victim_on_the_second_query() {
    let h = harness().await;
    let victim = Address::parse("203.0.113.5:0").unwrap();
    let strategy = TtlRebind::new(&h.mgr, &h.root, victim, 1).await.unwrap();
    let name = h.offer(RebindStrategy::Ttl(strategy)).await;
    let mut client = h.client.clone();

    let first = client
        .query(name.clone(), DNSClass::IN, RecordType::A)
        .await
        .unwrap();
    assert_eq!(first.response_code(), ResponseCode::NoError);
    assert_eq!(single_a(first.answers()), (POOL_IP, 1));

    for _ in 0..3 {
        let later = client
            .query(name.clone(), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        assert_eq!(later.response_code(), ResponseCode::NoError);
        assert_eq!(single_a(later.answers()), (VICTIM_IP, 1));
    }
}

#[tokio::test]
async fn threshold_rebind_counts_down_before_moving() {
    let h = harness().await;
    let victim = Address::parse("203.0.113.5:0").unwrap();
    let strategy = ThresholdRebind::new(&h.mgr, &h.root, victim, 2, 2)
        .await
        .unwrap();
    let name = h.offer(RebindStrategy::Threshold(strategy)).await;
    let mut client = h.client.clone();

    for _ in 0..2 {
        let reply = client
            .query(name.clone(), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        assert_eq!(single_a(reply.answers()), (POOL_IP, 2));
    }
    for _ in 0..2 {
        let reply = client
            .query(name.clone(), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        assert_eq!(single_a(reply.answers()), (VICTIM_IP, 2));
    }
}

#[tokio::test]
async fn mismatched_family_queries_answer_empty_with_noerror() {
    let h = harness().await;
    let victim = Address::parse("203.0.113.5:0").unwrap();
    let strategy = TtlRebind::new(&h.mgr, &h.root, victim, 4).await.unwrap();
    let name = h.offer(RebindStrategy::Ttl(strategy)).await;
    let mut client = h.client.clone();

    // An IPv4-only victim has no AAAA story; the offer stays unprimed.
    let aaaa = client
        .query(name.clone(), DNSClass::IN, RecordType::AAAA)
        .await
        .unwrap();
    assert_eq!(aaaa.response_code(), ResponseCode::NoError);
    assert!(aaaa.answers().is_empty());

    // The first family-matched query still gets the listener.
    let a = client
        .query(name.clone(), DNSClass::IN, RecordType::A)
        .await
        .unwrap();
    assert_eq!(single_a(a.answers()), (POOL_IP, 4));
}

#[tokio::test]
async fn deregistered_offers_go_back_to_refused() {
    let h = harness().await;
    let victim = Address::parse("203.0.113.5:0").unwrap();
    let scope = h.root.child_token();
    let id = Uuid::new_v4();
    let strategy = TtlRebind::new(&h.mgr, &scope, victim, 1).await.unwrap();
    h.mgr
        .register(id, Arc::new(RebindStrategy::Ttl(strategy)), &scope)
        .await;
    let name = Name::from_utf8(format!("{id}.r.test.")).unwrap();
    let mut client = h.client.clone();

    let live = client
        .query(name.clone(), DNSClass::IN, RecordType::A)
        .await
        .unwrap();
    assert_eq!(live.response_code(), ResponseCode::NoError);

    scope.cancel();
    for _ in 0..200 {
        if h.mgr.lookup(&id).await.is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let gone = client.query(name, DNSClass::IN, RecordType::A).await.unwrap();
    assert_eq!(gone.response_code(), ResponseCode::Refused);
}
