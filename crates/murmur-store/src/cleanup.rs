use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::{RoomStore, blocking};

/// Background task that reclaims expired rooms and sessions.
///
/// Reads never return expired entries, so this only bounds store growth.
pub async fn run_cleanup_loop(store: Arc<dyn RoomStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        let store = store.clone();
        match blocking(move || store.purge_expired()).await {
            Ok(count) => {
                if count > 0 {
                    info!("Cleanup: purged {} expired rooms/sessions", count);
                }
            }
            Err(e) => {
                warn!("Cleanup error: {}", e);
            }
        }
    }
}
