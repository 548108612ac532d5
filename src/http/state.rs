use std::sync::Arc;

use crate::coordinator::SessionCoordinator;
use crate::identity::IdentityProvider;
use crate::store::MetadataStore;

/// Shared application state for HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
    pub store: Arc<dyn MetadataStore>,
    pub identity: Arc<dyn IdentityProvider>,
}
