//! Handler dispatch utilities.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::error;

use super::{Envelope, EventHandler};

/// Dispatch an envelope to all registered handlers.
///
/// Calls each handler in sequence, logging errors but continuing to subsequent
/// handlers. Returns `true` if all handlers succeeded, `false` if any failed.
pub async fn dispatch_to_handlers(
    handlers: &Arc<RwLock<Vec<Box<dyn EventHandler>>>>,
    envelope: &Arc<Envelope>,
) -> bool {
    let handlers_guard = handlers.read().await;
    let mut all_succeeded = true;

    for handler in handlers_guard.iter() {
        if let Err(e) = handler.handle(Arc::clone(envelope)).await {
            error!(topic = %envelope.topic, error = %e, "Handler failed");
            all_succeeded = false;
        }
    }

    all_succeeded
}
