use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::addr::Address;
use crate::control::RequestScope;
use crate::error::RebindError;
use crate::manager::RebindManager;
use crate::rebind::{RebindStrategy, ThresholdRebind, TtlRebind};

/// One rebind configuration advertised to the client.
#[derive(Clone, Debug, Serialize)]
pub struct RebindOffer {
    pub id: Uuid,
    pub url: String,
}

#[derive(Clone, Copy, Debug)]
enum MenuEntry {
    Ttl { ttl: u32 },
    Threshold { threshold: u64, ttl: u32 },
}

/// The fixed menu offered for every victim. Multi-record stays off the
/// menu until its refusal behavior is settled.
const MENU: [MenuEntry; 9] = [
    MenuEntry::Ttl { ttl: 1 },
    MenuEntry::Ttl { ttl: 2 },
    MenuEntry::Ttl { ttl: 4 },
    MenuEntry::Ttl { ttl: 8 },
    MenuEntry::Ttl { ttl: 16 },
    MenuEntry::Threshold { threshold: 1, ttl: 2 },
    MenuEntry::Threshold { threshold: 2, ttl: 2 },
    MenuEntry::Threshold { threshold: 3, ttl: 4 },
    MenuEntry::Threshold { threshold: 4, ttl: 4 },
];

async fn build_strategy(
    mgr: &RebindManager,
    scope: &RequestScope,
    victim: &Address,
    entry: MenuEntry,
) -> Result<RebindStrategy, RebindError> {
    match entry {
        MenuEntry::Ttl { ttl } => TtlRebind::new(mgr, &scope.cancel, victim.clone(), ttl)
            .await
            .map(RebindStrategy::Ttl),
        MenuEntry::Threshold { threshold, ttl } => {
            ThresholdRebind::new(mgr, &scope.cancel, victim.clone(), threshold, ttl)
                .await
                .map(RebindStrategy::Threshold)
        }
    }
}

/// Sets up and publishes the offer menu for a victim. Every offer's
/// UUID is registered before its URL is handed out, and the whole batch
/// is torn down when the request scope ends. A strategy that cannot
/// lease an address is left off the menu; a strategy that cannot bind
/// its socket takes the process down, since a harness that cannot open
/// listeners has nothing left to offer.
pub async fn make_offers(
    mgr: &Arc<RebindManager>,
    scope: &RequestScope,
    victim: &Address,
) -> Vec<RebindOffer> {
    let mut offers = Vec::with_capacity(MENU.len());
    for entry in MENU {
        let strategy = match build_strategy(mgr, scope, victim, entry).await {
            Ok(strategy) => strategy,
            Err(RebindError::PoolExhausted) => {
                log::warn!(
                    "skipping {entry:?} offer for request \"{}\": pool exhausted",
                    scope.request_id
                );
                continue;
            }
            Err(e @ RebindError::Bind { .. }) => {
                log::error!("cannot bind rebind listener: {e}");
                std::process::exit(1);
            }
            Err(e) => {
                log::error!(
                    "failed to set up {entry:?} offer for request \"{}\": {e}",
                    scope.request_id
                );
                continue;
            }
        };
        let kind = strategy.kind();
        let id = Uuid::new_v4();
        mgr.register(id, Arc::new(strategy), &scope.cancel).await;
        offers.push(RebindOffer {
            id,
            url: format!(
                "http://{id}.{}:{}/.well-known/rebind/v1.frame",
                mgr.base(),
                victim.port
            ),
        });
        log::info!(
            "created rebind offer \"{id}\" of type \"{kind}\" for request \"{}\" on session \"{}\"",
            scope.request_id,
            scope.session_id
        );
    }
    offers
}
