use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::control::websocket_handler;
use crate::dns::extract_offer_id;
use crate::manager::RebindManager;

static REBIND_JS: &str = include_str!("../www/rebind.js");
static FRAME_HTML: &str = include_str!("../www/frame.html");
static FRAME_APPCACHE: &str = include_str!("../www/frame.appcache");

/// Builds the mux shared by every HTTP listener.
pub fn build_mux(mgr: Arc<RebindManager>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/v1.js", get(client_js))
        .route("/v1.websocket", get(websocket_handler))
        .route("/.well-known/rebind/v1.ping", get(ping))
        .route("/.well-known/rebind/v1.frame", get(frame))
        .route("/.well-known/rebind/v1.appcache", get(appcache))
        .layer(middleware::from_fn_with_state(mgr.clone(), host_dispatch))
        .with_state(mgr)
}

/// Routes requests addressed to an offer subdomain past the owning
/// strategy's HTTP hook before the mux handles them.
async fn host_dispatch(
    State(mgr): State<Arc<RebindManager>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(host) = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(id) = extract_offer_id(host) {
            if let Some(strategy) = mgr.lookup(&id).await {
                strategy.observe_http(request.uri().path());
            }
        }
    }
    next.run(request).await
}

async fn index() -> &'static str {
    "Index"
}

async fn ping() -> &'static str {
    "pong"
}

async fn client_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        REBIND_JS,
    )
}

async fn frame() -> Html<&'static str> {
    Html(FRAME_HTML)
}

async fn appcache() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/cache-manifest")], FRAME_APPCACHE)
}
