use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::addr::{Address, AddressKey};
use crate::error::RebindError;

/// How long a stopping listener may spend draining in-flight
/// connections before teardown proceeds without them.
const DRAIN_WINDOW: Duration = Duration::from_secs(1);

/// A bound HTTP server serving the shared mux on one (bind IP, port)
/// pair. Held by reference count in the registry; the accept loop runs
/// until the last holder's scope ends.
pub struct HttpListener {
    addr: Address,
    local: SocketAddr,
    stop: CancellationToken,
    connections: TaskTracker,
}

impl HttpListener {
    /// The bind address this listener answers for (pool IP + victim
    /// port). DNS answers advertise this address.
    pub fn addr(&self) -> &Address {
        &self.addr
    }

    /// The socket address actually bound, with any ephemeral port
    /// resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn shutdown(&self) {
        self.stop.cancel();
        self.connections.close();
        if tokio::time::timeout(DRAIN_WINDOW, self.connections.wait())
            .await
            .is_err()
        {
            log::warn!(
                "listener {} still had connections after {:?} drain",
                self.addr,
                DRAIN_WINDOW
            );
        }
        log::info!("listener {} stopped", self.addr);
    }
}

struct ListenerEntry {
    listener: Arc<HttpListener>,
    refs: usize,
}

type ListenerMap = Arc<RwLock<HashMap<AddressKey, ListenerEntry>>>;

/// Registry of HTTP listeners keyed by bind address. Lookup and
/// refcount changes happen under one write guard so a listener can
/// never be torn down concurrently with a fresh acquisition of the
/// same key.
pub struct ListenerRegistry {
    servers: ListenerMap,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            servers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Checks out a listener on `pool_choice` at the victim's port,
    /// binding a fresh server if none exists for that key. The checkout
    /// is returned when `scope` cancels; the listener stops once its
    /// last checkout is returned.
    pub async fn acquire(
        &self,
        scope: &CancellationToken,
        pool_choice: &Address,
        victim: &Address,
        mux: Router,
    ) -> Result<Arc<HttpListener>, RebindError> {
        let mut bind = pool_choice.clone();
        bind.port = victim.port;
        let key = bind.key();

        let mut servers = self.servers.write().await;
        if let Some(entry) = servers.get_mut(&key) {
            entry.refs += 1;
            log::info!(
                "incremented users of listener {} to {}",
                entry.listener.addr,
                entry.refs
            );
            let listener = entry.listener.clone();
            drop(servers);
            self.watch_release(scope, key);
            return Ok(listener);
        }

        let sock = bind.internal_socket().ok_or_else(|| RebindError::AddressParse {
            addr: bind.to_string(),
            reason: "bind address has no IP".to_string(),
        })?;
        let tcp = TcpListener::bind(sock).await.map_err(|e| RebindError::Bind {
            addr: bind.internal_addr(),
            source: e,
        })?;
        let local = tcp.local_addr()?;
        let stop = CancellationToken::new();
        let connections = TaskTracker::new();
        // The accept loop rides the same tracker as its connections, so
        // draining also waits for the bound socket to close.
        connections.spawn(accept_loop(tcp, mux, stop.clone(), connections.clone()));

        let listener = Arc::new(HttpListener {
            addr: bind,
            local,
            stop,
            connections,
        });
        log::info!("created listener {} ({})", listener.addr, local);
        servers.insert(
            key.clone(),
            ListenerEntry {
                listener: listener.clone(),
                refs: 1,
            },
        );
        drop(servers);
        self.watch_release(scope, key);
        Ok(listener)
    }

    /// Decrements the key's refcount when the scope ends. At zero the
    /// listener is stopped and deregistered under one guard, so a
    /// concurrent acquire of the same key waits for the old socket to
    /// be gone before binding a fresh one.
    fn watch_release(&self, scope: &CancellationToken, key: AddressKey) {
        let servers = self.servers.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            scope.cancelled().await;
            let mut map = servers.write().await;
            let Some(entry) = map.get_mut(&key) else {
                return;
            };
            entry.refs -= 1;
            if entry.refs > 0 {
                log::info!(
                    "decremented users of listener {} to {}",
                    entry.listener.addr,
                    entry.refs
                );
                return;
            }
            let listener = entry.listener.clone();
            listener.shutdown().await;
            map.remove(&key);
        });
    }

    /// Whether a listener exists for the given bind address.
    pub async fn contains(&self, addr: &Address) -> bool {
        self.servers.read().await.contains_key(&addr.key())
    }

    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }
}

/// Accepts connections until stopped, serving each over HTTP/1 with
/// keep-alive disabled. Keep-alive must stay off: every HTTP request
/// has to open a fresh connection and therefore resolve DNS again once
/// the cached answer expires, which is what makes the rebind land.
async fn accept_loop(tcp: TcpListener, mux: Router, stop: CancellationToken, conns: TaskTracker) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            res = tcp.accept() => res,
        };
        let (stream, _peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };
        let service = TowerToHyperService::new(mux.clone());
        conns.spawn(async move {
            let io = TokioIo::new(stream);
            let conn = http1::Builder::new()
                .keep_alive(false)
                .serve_connection(io, service)
                .with_upgrades();
            if let Err(e) = conn.await {
                log::debug!("connection ended with error: {e}");
            }
        });
    }
}
