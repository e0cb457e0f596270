//! The cross-node send path: local registry first, then directory lookup
//! plus a tunnel RPC forward.
//!
//! Grounded on the original source's `core/server.go::WriteTo` and the
//! top-level `server.go::Send`: local-first, uniform `ConnectionNotFound`
//! whether the miss is local or remote, and no re-consult on a stale
//! directory entry (forwarding is exactly one hop).

use std::sync::Arc;
use std::time::Duration;

use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::tunnel::pool::Pool;

#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    directory: Option<Arc<dyn Directory>>,
    pool: Arc<Pool>,
}

impl Dispatcher {
    pub fn new(registry: Registry, directory: Option<Arc<dyn Directory>>, pool: Arc<Pool>) -> Self {
        Self {
            registry,
            directory,
            pool,
        }
    }

    /// Deliver `data` to the session addressed by `id`, locally or across
    /// the cluster. Never synthesizes a false success: a miss at any stage
    /// surfaces as [`Error::ConnectionNotFound`].
    pub async fn send(&self, id: &str, data: &[u8]) -> Result<()> {
        if let Some(session) = self.registry.lookup(id) {
            return session.write(data).await;
        }

        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| Error::ConnectionNotFound(id.to_string()))?;
        let node_address = directory.discover(id).await?;
        self.pool.send_message(&node_address, id, data.to_vec()).await
    }
}

/// Convenience constructor for a single-node dispatcher with no directory
/// and no outbound RPC pool activity (every send either hits locally or
/// fails closed).
pub fn local_only(registry: Registry) -> Dispatcher {
    Dispatcher::new(registry, None, Arc::new(Pool::new(Duration::from_secs(5))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session;

    #[tokio::test]
    async fn hits_local_session() {
        let registry = Registry::new();
        let handle = session::tests::make_handle("A");
        registry.insert("A".into(), handle.clone());
        let dispatcher = local_only(registry);

        // The session never ran, so it's not alive yet; writing to it
        // should fail closed rather than silently succeed.
        let err = dispatcher.send("A", b"hi").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn miss_without_directory_is_connection_not_found() {
        let dispatcher = local_only(Registry::new());
        let err = dispatcher.send("missing", b"hi").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionNotFound(_)));
    }
}
