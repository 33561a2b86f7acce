use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use once_cell::sync::OnceCell;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trust_dns_server::ServerFuture;
use uuid::Uuid;

use crate::addr::Address;
use crate::dns::DnsResponder;
use crate::error::RebindError;
use crate::http;
use crate::listener::{HttpListener, ListenerRegistry};
use crate::pool::{AddressPool, ExternalIpMatch, LeaseCriteria};
use crate::rebind::RebindStrategy;

const DNS_TCP_TIMEOUT: Duration = Duration::from_secs(5);

type RebindMap = Arc<RwLock<HashMap<Uuid, Arc<RebindStrategy>>>>;

/// The rebinding manager: owns the IP pool, the offer registry, the
/// HTTP listener registry, and the shared mux. One instance per
/// process, alive for the root scope's lifetime.
pub struct RebindManager {
    base: String,
    pool: AddressPool,
    rebinds: RebindMap,
    listeners: ListenerRegistry,
    mux: OnceCell<Router>,
    root: CancellationToken,
}

impl RebindManager {
    pub fn new(base: String, pool_addrs: Vec<Address>, root: CancellationToken) -> Arc<Self> {
        let mgr = Arc::new(Self {
            base,
            pool: AddressPool::new(pool_addrs),
            rebinds: Arc::new(RwLock::new(HashMap::new())),
            listeners: ListenerRegistry::new(),
            mux: OnceCell::new(),
            root,
        });
        // The mux is configured exactly once here and read-only after.
        let _ = mgr.mux.set(http::build_mux(mgr.clone()));
        mgr
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn root_scope(&self) -> &CancellationToken {
        &self.root
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn mux(&self) -> Router {
        self.mux.get().expect("mux is set at construction").clone()
    }

    /// Publishes a strategy under `id` and arranges deregistration when
    /// the owning scope ends. The entry is visible to the DNS path
    /// before this returns.
    pub async fn register(&self, id: Uuid, strategy: Arc<RebindStrategy>, scope: &CancellationToken) {
        self.rebinds.write().await.insert(id, strategy);
        let rebinds = self.rebinds.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            scope.cancelled().await;
            rebinds.write().await.remove(&id);
            log::info!("deregistered rebind offer \"{id}\"");
        });
    }

    pub async fn lookup(&self, id: &Uuid) -> Option<Arc<RebindStrategy>> {
        self.rebinds.read().await.get(id).cloned()
    }

    pub async fn rebind_count(&self) -> usize {
        self.rebinds.read().await.len()
    }

    /// Leases a pool address meeting `criteria` and checks out a
    /// listener on it at the victim's port, both tied to `scope`.
    pub async fn lease_and_acquire(
        &self,
        scope: &CancellationToken,
        criteria: &dyn LeaseCriteria,
        victim: &Address,
    ) -> Result<Arc<HttpListener>, RebindError> {
        let choice = self.pool.lease(scope, &[criteria]).await?;
        self.listeners.acquire(scope, &choice, victim, self.mux()).await
    }

    /// Starts the DNS responders (TCP and UDP) on `dns_bind` and one
    /// HTTP listener per bind address, each leasing its matching pool
    /// entry for the process lifetime. Returns the DNS serve task;
    /// cancelling the root scope shuts the responders down gracefully.
    pub async fn listen(
        self: &Arc<Self>,
        dns_bind: &str,
        http_binds: &[Address],
    ) -> Result<JoinHandle<()>, RebindError> {
        let udp = UdpSocket::bind(dns_bind).await?;
        let tcp = TcpListener::bind(dns_bind).await?;
        log::info!("created DNS servers bound to \"{dns_bind}\" (tcp+udp)");

        let mut server = ServerFuture::new(DnsResponder::new(self.clone()));
        server.register_socket(udp);
        server.register_listener(tcp, DNS_TCP_TIMEOUT);

        let scope = self.root.clone();
        let (shutdown_signal, done) = server.graceful();
        let handle = tokio::spawn(async move {
            tokio::pin!(done);
            tokio::select! {
                _ = scope.cancelled() => {}
                res = &mut done => {
                    if let Err(e) = res {
                        log::error!("dns server terminated: {e}");
                    }
                    return;
                }
            }
            shutdown_signal.shutdown().await;
            if let Err(e) = done.await {
                log::error!("dns server shutdown failed: {e}");
            }
            log::info!("closed DNS servers");
        });

        for bind in http_binds {
            let leased = self
                .pool
                .lease(&self.root, &[&ExternalIpMatch { addr: bind.clone() }])
                .await?;
            self.listeners
                .acquire(&self.root, &leased, bind, self.mux())
                .await?;
        }
        Ok(handle)
    }
}
