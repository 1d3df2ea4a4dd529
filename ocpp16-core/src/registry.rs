//! Process-wide session registry
//!
//! Maps charge point identity to its live session so outbound commands can
//! be routed. Exactly one session per identity: a reconnect displaces the
//! previous session, which is closed (failing its pending calls) before
//! the replacement is installed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::session::Session;

/// Shared identity -> session table
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session under its identity. An existing session for the
    /// same identity is closed first, so its pending calls fail with a
    /// connection-closed error before the newcomer becomes routable.
    pub async fn register(&self, session: Arc<Session>) {
        let identity = session.identity().to_string();
        let mut inner = self.inner.write().await;

        if let Some(old) = inner.get(&identity) {
            if Arc::ptr_eq(old, &session) {
                return;
            }
            warn!(%identity, "reconnect displaces existing session");
            old.close();
        }

        info!(%identity, "session registered");
        inner.insert(identity, session);
    }

    pub async fn lookup(&self, identity: &str) -> Option<Arc<Session>> {
        self.inner.read().await.get(identity).cloned()
    }

    /// Remove a session on close. A no-op unless the registry entry is
    /// this exact session instance, so a stale close never evicts a newer
    /// session for the same identity.
    pub async fn unregister(&self, session: &Arc<Session>) {
        let mut inner = self.inner.write().await;
        if let Some(current) = inner.get(session.identity()) {
            if Arc::ptr_eq(current, session) {
                info!(identity = %session.identity(), "session unregistered");
                inner.remove(session.identity());
            }
        }
    }

    /// Identities with a registered session.
    pub async fn identities(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
