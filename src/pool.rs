use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::addr::{Address, AddressKey};
use crate::error::RebindError;

/// One outstanding lease occurrence. Minted per lease so that release
/// removes exactly the occurrence it was paired with.
pub type LeaseId = u64;

/// Decides whether a pool address is eligible for a lease.
pub trait LeaseCriteria: Send + Sync {
    fn eligible(&self, leases: &[LeaseId], addr: &Address) -> bool;
}

/// Matches addresses of the requested family.
pub struct AddressFamily {
    pub ipv6: bool,
}

impl LeaseCriteria for AddressFamily {
    fn eligible(&self, _leases: &[LeaseId], addr: &Address) -> bool {
        matches!(addr.internal_ip, Some(IpAddr::V6(_))) == self.ipv6
    }
}

/// Matches the address whose external IP equals the given one.
pub struct ExternalIpMatch {
    pub addr: Address,
}

impl LeaseCriteria for ExternalIpMatch {
    fn eligible(&self, _leases: &[LeaseId], addr: &Address) -> bool {
        addr.external_ip == self.addr.external_ip
    }
}

struct PoolInner {
    addrs: Vec<Address>,
    leases: HashMap<AddressKey, Vec<LeaseId>>,
    next_lease: LeaseId,
}

/// A pool of externally visible addresses available for binding rebind
/// HTTP servers. Addresses are fixed at construction; only the lease
/// table changes afterwards.
pub struct AddressPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl AddressPool {
    pub fn new(addrs: Vec<Address>) -> Self {
        let leases = addrs.iter().map(|a| (a.key(), Vec::new())).collect();
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                addrs,
                leases,
                next_lease: 0,
            })),
        }
    }

    /// Leases an address meeting every criterion for as long as `scope`
    /// lives, releasing it back into the pool when the scope cancels.
    /// The pick among eligible addresses is uniformly random.
    pub async fn lease(
        &self,
        scope: &CancellationToken,
        criteria: &[&dyn LeaseCriteria],
    ) -> Result<Address, RebindError> {
        let mut inner = self.inner.lock().await;
        let eligible: Vec<usize> = (0..inner.addrs.len())
            .filter(|&idx| {
                let addr = &inner.addrs[idx];
                let held = inner.leases.get(&addr.key()).map(Vec::as_slice).unwrap_or(&[]);
                criteria.iter().all(|c| c.eligible(held, addr))
            })
            .collect();
        log::info!("found {} eligible pool addresses", eligible.len());
        let Some(&idx) = eligible.choose(&mut rand::thread_rng()) else {
            return Err(RebindError::PoolExhausted);
        };
        let addr = inner.addrs[idx].clone();
        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.entry(addr.key()).or_default().push(id);
        drop(inner);
        log::info!("leasing {addr}");

        let pool = self.inner.clone();
        let scope = scope.clone();
        let key = addr.key();
        let released = addr.clone();
        tokio::spawn(async move {
            scope.cancelled().await;
            log::info!("releasing lease on {released}");
            let mut inner = pool.lock().await;
            if let Some(held) = inner.leases.get_mut(&key) {
                if let Some(pos) = held.iter().position(|&l| l == id) {
                    held.remove(pos);
                }
            }
        });

        Ok(addr)
    }

    /// Number of outstanding leases on the given address.
    pub async fn lease_count(&self, addr: &Address) -> usize {
        let inner = self.inner.lock().await;
        inner.leases.get(&addr.key()).map(Vec::len).unwrap_or(0)
    }

    /// Total outstanding leases across the pool.
    pub async fn total_leases(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.leases.values().map(Vec::len).sum()
    }
}
