//! The accept loop and node lifecycle: `Node::run`/`Node::stop`.
//!
//! Grounded directly on the teacher's `server.rs` — the `Listener`'s
//! semaphore-gated, exponential-backoff accept loop and
//! `broadcast`-triggered shutdown map almost one-to-one onto
//! `Node`/`Session`, generalized from a single `TcpListener` to any
//! [`Acceptor`] and with per-session cancellation tokens replacing the
//! flat `broadcast::Sender<()>` (sessions here need independently
//! cancellable contexts, not just a shared shutdown signal).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::directory::{renewer, Directory, DEFAULT_RENEW_SLACK, DEFAULT_TTL};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::registry::Registry;
use crate::session::{Hooks, SessionHandle};
use crate::stream::Stream;
use crate::transport::Acceptor;
use crate::tunnel::pool::Pool;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration recognized by [`Node::new`], mirroring spec.md §6's
/// server-factory options.
#[derive(Clone)]
pub struct NodeConfig {
    idle_timeout: Duration,
    limit: usize,
    node_address: Option<String>,
    directory: Option<Arc<dyn Directory>>,
    directory_ttl: Duration,
    renew_slack: Duration,
    hooks: Hooks,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            limit: 0,
            node_address: None,
            directory: None,
            directory_ttl: DEFAULT_TTL,
            renew_slack: DEFAULT_RENEW_SLACK,
            hooks: Hooks::default(),
        }
    }
}

impl NodeConfig {
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// 0 (the default) means unlimited.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Required if `directory` is configured: the address this node
    /// advertises to the rest of the cluster.
    pub fn node_address(mut self, node_address: impl Into<String>) -> Self {
        self.node_address = Some(node_address.into());
        self
    }

    pub fn directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn directory_ttl(mut self, ttl: Duration) -> Self {
        self.directory_ttl = ttl;
        self
    }

    pub fn renew_slack(mut self, slack: Duration) -> Self {
        self.renew_slack = slack;
        self
    }

    pub fn on_connect(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hooks.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_message(
        mut self,
        f: impl Fn(&str, &[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hooks.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(&str, &crate::error::Error) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_error = Some(Arc::new(f));
        self
    }
}

struct Inner {
    config: NodeConfig,
    registry: Registry,
    dispatcher: Dispatcher,
    pool: Arc<Pool>,
    cancel: CancellationToken,
    admitted: AtomicUsize,
    acceptor: AsyncMutex<Box<dyn Acceptor>>,
}

/// One node in the cluster: owns the accept loop, the local registry, and
/// the dispatcher/RPC pool used for outbound sends.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    pub fn new(acceptor: Box<dyn Acceptor>, config: NodeConfig) -> Self {
        let registry = Registry::new();
        let pool = Arc::new(Pool::new(DEFAULT_CONNECT_TIMEOUT));
        let dispatcher = Dispatcher::new(registry.clone(), config.directory.clone(), pool.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                dispatcher,
                pool,
                cancel: CancellationToken::new(),
                admitted: AtomicUsize::new(0),
                acceptor: AsyncMutex::new(acceptor),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.inner.pool
    }

    /// Opens the accept loop and blocks until it is cancelled via
    /// [`Node::stop`] or the acceptor gives up after repeated failures.
    pub async fn run(&self) -> Result<()> {
        info!("accepting inbound sessions");
        let mut acceptor = self.inner.acceptor.lock().await;
        let mut backoff = 1u64;

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    debug!("accept loop cancelled");
                    return Ok(());
                }
                accepted = acceptor.accept() => {
                    match accepted {
                        Ok(stream) => {
                            backoff = 1;
                            self.admit(stream);
                        }
                        Err(err) => {
                            if backoff > 64 {
                                error!(%err, "failed to accept inbound session too many times");
                                return Err(err);
                            }
                            warn!(%err, "accept failed, retrying in {backoff}s");
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                                _ = self.inner.cancel.cancelled() => return Ok(()),
                            }
                            backoff *= 2;
                        }
                    }
                }
            }
        }
    }

    /// Cancels the accept loop and every live session's context. Does not
    /// wait for sessions to finish tearing down — callers that need a
    /// drain guarantee must track that themselves.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    fn admit(&self, stream: Box<dyn Stream>) {
        if self.inner.config.limit > 0 && !self.try_reserve_slot() {
            warn!(id = stream.id(), "session limit reached, closing immediately");
            tokio::spawn(async move {
                let _ = stream.close().await;
            });
            return;
        }

        let id = stream.id().to_string();
        let cancel = self.inner.cancel.child_token();
        let handle = SessionHandle::new(
            stream,
            self.inner.config.idle_timeout,
            self.inner.config.hooks.clone(),
            cancel,
        );

        if let Some(prior) = self.inner.registry.insert(id.clone(), handle.clone()) {
            tokio::spawn(async move {
                let _ = prior.close().await;
            });
        }

        let node = self.clone();
        tokio::spawn(async move { node.drive(handle).await });
    }

    /// Check-then-increment against `limit`: this is the fix for the
    /// increment-before-check race spec.md §9 flags in one reference
    /// variant.
    fn try_reserve_slot(&self) -> bool {
        loop {
            let current = self.inner.admitted.load(Ordering::Acquire);
            if current >= self.inner.config.limit {
                return false;
            }
            if self
                .inner
                .admitted
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_slot(&self) {
        if self.inner.config.limit > 0 {
            self.inner.admitted.fetch_sub(1, Ordering::AcqRel);
        }
    }

    async fn drive(&self, handle: SessionHandle) {
        if let (Some(directory), Some(node_address)) =
            (&self.inner.config.directory, &self.inner.config.node_address)
        {
            if let Err(err) = directory
                .register(handle.id(), node_address, self.inner.config.directory_ttl)
                .await
            {
                error!(id = handle.id(), %err, "directory registration failed, closing session");
                let _ = handle.close().await;
                self.inner.registry.remove_if_current(handle.id(), &handle);
                self.release_slot();
                return;
            }

            tokio::spawn(renewer::run(
                directory.clone(),
                handle.clone(),
                node_address.clone(),
                self.inner.config.directory_ttl,
                self.inner.config.renew_slack,
            ));
        }

        handle.run().await;
        self.inner.registry.remove_if_current(handle.id(), &handle);
        self.release_slot();
    }
}
