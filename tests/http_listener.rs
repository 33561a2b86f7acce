use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use rebindd::addr::Address;
use rebindd::manager::RebindManager;
use rebindd::pool::AddressFamily;

fn test_manager() -> (Arc<RebindManager>, CancellationToken) {
    let root = CancellationToken::new();
    let pool = vec![Address::parse("127.0.0.1:80").unwrap()];
    let mgr = RebindManager::new("r.test".to_string(), pool, root.clone());
    (mgr, root)
}

/// Sends one request and reads until the server closes the connection.
async fn roundtrip(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: test.r.test\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn listeners_disable_keep_alive() {
    let (mgr, root) = test_manager();
    let victim = Address::parse("203.0.113.5:0").unwrap();
    let listener = mgr
        .lease_and_acquire(&root, &AddressFamily { ipv6: false }, &victim)
        .await
        .unwrap();

    // read_to_end only returns because the server closes after one
    // exchange; a keep-alive server would leave the socket open.
    let response = roundtrip(listener.local_addr(), "/.well-known/rebind/v1.ping").await;
    let lower = response.to_lowercase();
    assert!(lower.starts_with("http/1.1 200"));
    assert!(lower.contains("connection: close"));
    assert!(response.ends_with("pong"));
    root.cancel();
}

#[tokio::test]
async fn mux_serves_the_fixed_paths() {
    let (mgr, root) = test_manager();
    let victim = Address::parse("203.0.113.5:0").unwrap();
    let listener = mgr
        .lease_and_acquire(&root, &AddressFamily { ipv6: false }, &victim)
        .await
        .unwrap();
    let addr = listener.local_addr();

    let index = roundtrip(addr, "/").await;
    assert!(index.ends_with("Index"));

    let frame = roundtrip(addr, "/.well-known/rebind/v1.frame").await;
    assert!(frame.to_lowercase().contains("content-type: text/html"));
    assert!(frame.contains("waitForRebind"));

    let js = roundtrip(addr, "/v1.js").await;
    assert!(js.to_lowercase().contains("content-type: application/javascript"));
    assert!(js.contains("DNSRebind"));

    let appcache = roundtrip(addr, "/.well-known/rebind/v1.appcache").await;
    assert!(appcache.to_lowercase().contains("content-type: text/cache-manifest"));
    assert!(appcache.contains("CACHE MANIFEST"));
    root.cancel();
}

#[tokio::test]
async fn teardown_stops_accepting() {
    let (mgr, root) = test_manager();
    let victim = Address::parse("203.0.113.5:0").unwrap();
    let scope = root.child_token();
    let listener = mgr
        .lease_and_acquire(&scope, &AddressFamily { ipv6: false }, &victim)
        .await
        .unwrap();
    let addr = listener.local_addr();

    let response = roundtrip(addr, "/.well-known/rebind/v1.ping").await;
    assert!(response.ends_with("pong"));

    scope.cancel();
    for _ in 0..200 {
        if mgr.listeners().is_empty().await {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(mgr.listeners().is_empty().await);
    // The bound socket is gone with the listener.
    assert!(TcpStream::connect(addr).await.is_err());
    root.cancel();
}
