use std::sync::Arc;

use crate::hub::Hub;
use crate::index::ConnectionIndex;
use crate::session_cache::SessionCache;
use crate::store::Store;

/// Shared handles threaded through every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub cache: Arc<SessionCache>,
    pub index: Arc<ConnectionIndex>,
    pub hub: Hub,
}
