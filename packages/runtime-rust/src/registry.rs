use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::Mutex;
use relay_core::Envelope;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::RouteError;
use crate::handler::EventHandler;
use crate::lifecycle::{RouteLifecycle, RouteState};

// ---------------------------------------------------------------------------
// ServiceDef
// ---------------------------------------------------------------------------

bitflags! {
    /// Behaviour switches resolved once at registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        /// Handler receives the whole envelope instead of the body.
        const WANTS_ENVELOPE   = 0b0001;
        /// Receives every call verbatim, pings included, and never gets an automatic reply.
        const INTERCEPTOR      = 0b0010;
        /// Failures go to `EventHandler::on_error` instead of an error reply.
        const HANDLES_ERRORS   = 0b0100;
        /// No trace span is emitted for this route.
        const TRACING_DISABLED = 0b1000;
    }
}

/// Who may reach a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    /// Reachable from remote callers.
    #[default]
    Public,
    /// Process-local only.
    Private,
}

/// A route binding: handler plus the options it runs with.
#[derive(Clone)]
pub struct ServiceDef {
    route: String,
    handler: Arc<dyn EventHandler>,
    pool_size: Option<usize>,
    visibility: Visibility,
    capabilities: Capabilities,
}

impl ServiceDef {
    /// Public route with the platform's default pool size and no capabilities.
    pub fn new(route: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            route: route.into(),
            handler,
            pool_size: None,
            visibility: Visibility::Public,
            capabilities: Capabilities::empty(),
        }
    }

    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = Some(pool_size);
        self
    }

    #[must_use]
    pub fn private(mut self) -> Self {
        self.visibility = Visibility::Private;
        self
    }

    #[must_use]
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities |= capabilities;
        self
    }

    #[must_use]
    pub fn route(&self) -> &str {
        &self.route
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    /// Requested pool size; `None` until registration fills in the default.
    #[must_use]
    pub fn pool_size(&self) -> Option<usize> {
        self.pool_size
    }

    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    #[must_use]
    pub fn is_private(&self) -> bool {
        self.visibility == Visibility::Private
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

impl fmt::Debug for ServiceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDef")
            .field("route", &self.route)
            .field("pool_size", &self.pool_size)
            .field("visibility", &self.visibility)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RouteHandle
// ---------------------------------------------------------------------------

/// A live route: its current definition, inbox and pool lifecycle.
pub(crate) struct RouteHandle {
    pub(crate) def: Arc<ArcSwap<ServiceDef>>,
    pub(crate) inbox: mpsc::UnboundedSender<Envelope>,
    pub(crate) lifecycle: Arc<RouteLifecycle>,
    pub(crate) manager: Mutex<Option<JoinHandle<()>>>,
}

impl RouteHandle {
    pub(crate) fn def(&self) -> Arc<ServiceDef> {
        self.def.load_full()
    }

    /// Swaps the definition in place. Running handlers keep the one they loaded.
    pub(crate) fn replace_def(&self, def: ServiceDef) {
        self.def.store(Arc::new(def));
    }

    pub(crate) fn pool_size(&self) -> usize {
        self.def.load().pool_size.unwrap_or(1)
    }

    pub(crate) fn deliver(&self, envelope: Envelope) -> Result<(), RouteError> {
        let route = self.def.load().route.clone();
        if self.lifecycle.state() != RouteState::Ready {
            return Err(RouteError::not_found(&route));
        }
        self.inbox
            .send(envelope)
            .map_err(|_| RouteError::not_found(&route))
    }

    /// Stops the pool and waits up to `grace` for running handlers.
    pub(crate) async fn drain(&self, grace: Duration) -> bool {
        self.lifecycle.begin_drain();
        let manager = self.manager.lock().take();
        if let Some(manager) = manager {
            if let Err(e) = manager.await {
                tracing::warn!("route manager ended abnormally: {e}");
            }
        }
        self.lifecycle.wait_for_drain(grace).await
    }
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Route table.
///
/// Reads and writes of different routes never contend beyond a shard lock;
/// a route's definition is swapped atomically through its `ArcSwap`.
pub(crate) struct ServiceRegistry {
    routes: DashMap<String, Arc<RouteHandle>>,
    registered: Notify,
}

impl ServiceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            routes: DashMap::new(),
            registered: Notify::new(),
        }
    }

    pub(crate) fn get(&self, route: &str) -> Option<Arc<RouteHandle>> {
        self.routes.get(route).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn contains(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    /// Binds `route`, returning the handle it replaced.
    pub(crate) fn insert(&self, route: &str, handle: Arc<RouteHandle>) -> Option<Arc<RouteHandle>> {
        let previous = self.routes.insert(route.to_string(), handle);
        self.registered.notify_waiters();
        previous
    }

    pub(crate) fn remove(&self, route: &str) -> Option<Arc<RouteHandle>> {
        self.routes.remove(route).map(|(_, handle)| handle)
    }

    /// Registered routes, sorted.
    pub(crate) fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        routes.sort();
        routes
    }

    /// Waits until `route` is registered or `timeout` elapses.
    pub(crate) async fn wait_for(&self, route: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.registered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.contains(route) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.contains(route);
            }
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
