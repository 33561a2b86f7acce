use std::sync::Arc;

use axum::extract::ws::{close_code, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::addr::Address;
use crate::manager::RebindManager;
use crate::offers::{self, RebindOffer};

/// Scope of one control-channel message: the cancellation handle owning
/// whatever the message sets up, plus the identifiers it runs under.
#[derive(Clone, Debug)]
pub struct RequestScope {
    pub cancel: CancellationToken,
    pub session_id: Uuid,
    pub request_id: Uuid,
}

/// Common envelope of every control-channel message.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "requestId")]
    request_id: Uuid,
    action: String,
}

#[derive(Debug, Deserialize)]
struct HostRequest {
    host: Address,
}

#[derive(Debug, Serialize)]
struct HostResponse {
    #[serde(rename = "requestId")]
    request_id: Uuid,
    offers: Vec<RebindOffer>,
}

/// Upgrades a client to the control channel. Any Origin is accepted on
/// purpose: the whole point is to hand rebind offers to pages we do not
/// control.
pub async fn websocket_handler(
    State(mgr): State<Arc<RebindManager>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_session(mgr, socket))
}

async fn run_session(mgr: Arc<RebindManager>, mut socket: WebSocket) {
    let session_id = Uuid::new_v4();
    let session = mgr.root_scope().child_token();
    // Everything the session sets up hangs off this scope; dropping the
    // guard on any exit path cancels it and cascades the releases.
    let _guard = session.clone().drop_guard();
    log::info!("new control session \"{session_id}\"");

    loop {
        let msg = match socket.recv().await {
            None => break,
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                log::error!("session \"{session_id}\" read failed: {e}");
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(frame) => {
                match frame {
                    // 1001: the page went away, which is how most
                    // sessions end.
                    Some(f) if f.code == close_code::AWAY => {}
                    Some(f) => log::info!(
                        "session \"{session_id}\" closed with code {} ({})",
                        f.code,
                        f.reason
                    ),
                    None => log::info!("session \"{session_id}\" closed"),
                }
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => {
                log::error!("session \"{session_id}\" sent a binary frame");
                break;
            }
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::error!("session \"{session_id}\" sent a bad envelope: {e}");
                break;
            }
        };
        let scope = RequestScope {
            cancel: session.child_token(),
            session_id,
            request_id: envelope.request_id,
        };
        log::info!(
            "session \"{session_id}\" got msg \"{}\" for \"{}\" action",
            scope.request_id,
            envelope.action
        );
        if let Err(e) = dispatch(&mgr, &mut socket, &scope, &envelope.action, &text).await {
            log::error!(
                "session \"{session_id}\" failed on request \"{}\": {e}",
                scope.request_id
            );
            break;
        }
    }
    log::info!("control session \"{session_id}\" has closed, cleaning up");
}

async fn dispatch(
    mgr: &Arc<RebindManager>,
    socket: &mut WebSocket,
    scope: &RequestScope,
    action: &str,
    raw: &str,
) -> anyhow::Result<()> {
    match action {
        "host" => {
            let request: HostRequest = serde_json::from_str(raw)?;
            let offers = offers::make_offers(mgr, scope, &request.host).await;
            let response = HostResponse {
                request_id: scope.request_id,
                offers,
            };
            let count = response.offers.len();
            socket
                .send(Message::Text(serde_json::to_string(&response)?))
                .await?;
            log::info!(
                "wrote {count} offers to session \"{}\" in response to msg \"{}\"",
                scope.session_id,
                scope.request_id
            );
        }
        // Other actions are reserved.
        _ => {}
    }
    Ok(())
}
