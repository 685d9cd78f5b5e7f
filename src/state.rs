//! Application state shared across request handlers.

use std::sync::Arc;

use crate::queue::JobQueue;
use crate::store::Store;

/// Shared application state, passed to handlers via Axum's state
/// extractor. Holds the store and queue behind their contracts so the
/// same router runs over Postgres/Redis in production and the in-memory
/// backends in tests.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { store, queue }),
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }

    pub fn queue(&self) -> &dyn JobQueue {
        self.inner.queue.as_ref()
    }
}
