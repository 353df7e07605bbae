//! The platform context: one per process, created at startup and passed to
//! whatever needs to register routes or send messages.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::PlatformConfig;
use crate::distributed_trace::DistributedTrace;
use crate::error::RouteError;
use crate::lifecycle::RouteState;
use crate::pending::PendingTable;
use crate::post_office::PostOffice;
use crate::pubsub::PubSub;
use crate::registry::{Capabilities, ServiceDef, ServiceRegistry, Visibility};
use crate::scheduler::Scheduler;
use crate::worker::{spawn_route, RestartPolicy};

/// State shared by the platform, the post office and every worker slot.
pub(crate) struct Shared {
    pub(crate) config: PlatformConfig,
    pub(crate) registry: ServiceRegistry,
    pub(crate) pending: PendingTable,
    pub(crate) scheduler: Scheduler,
    pub(crate) pubsub: PubSub,
}

/// Handle to the routing runtime. Cheap to clone.
#[derive(Clone)]
pub struct Platform {
    shared: Arc<Shared>,
}

impl Platform {
    /// Starts the platform and registers the built-in trace route.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidRoute`] if a configured trace route name is invalid.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(mut config: PlatformConfig) -> Result<Self, RouteError> {
        if config.origin.is_empty() {
            config.origin = uuid::Uuid::new_v4().simple().to_string();
        }
        let shared = Arc::new(Shared {
            config,
            registry: ServiceRegistry::new(),
            pending: PendingTable::new(),
            scheduler: Scheduler::new(),
            pubsub: PubSub::new(),
        });
        let platform = Self { shared };
        let trace_route = platform.shared.config.trace_route.clone();
        platform.register(
            ServiceDef::new(
                trace_route,
                Arc::new(DistributedTrace::new(Arc::downgrade(&platform.shared))),
            )
            .private()
            .with_capabilities(Capabilities::WANTS_ENVELOPE | Capabilities::TRACING_DISABLED),
        )?;
        info!(
            app = %platform.shared.config.app_name,
            origin = %platform.shared.config.origin,
            "platform started"
        );
        Ok(platform)
    }

    #[must_use]
    pub fn config(&self) -> &PlatformConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.shared.config.origin
    }

    #[must_use]
    pub fn post_office(&self) -> PostOffice {
        PostOffice::new(Arc::clone(&self.shared))
    }

    #[must_use]
    pub fn pubsub(&self) -> &PubSub {
        &self.shared.pubsub
    }

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            grace: Duration::from_millis(self.shared.config.slot_restart_grace_ms),
            max_restarts: self.shared.config.max_slot_restarts,
        }
    }

    /// Binds `def` to its route.
    ///
    /// Registering an existing route replaces its definition. With an equal
    /// pool size the swap is atomic and running handlers finish on the old
    /// definition; with a different pool size a new pool takes over and the
    /// old one drains in the background.
    ///
    /// # Errors
    ///
    /// - [`RouteError::InvalidRoute`] when the route name is malformed.
    /// - [`RouteError::InvalidHandler`] when the pool size is zero.
    pub fn register(&self, mut def: ServiceDef) -> Result<(), RouteError> {
        let route = def.route().to_string();
        relay_core::validate_route(&route).map_err(|reason| RouteError::InvalidRoute {
            route: route.clone(),
            reason,
        })?;
        let pool_size = def
            .pool_size()
            .unwrap_or(self.shared.config.default_pool_size);
        if pool_size == 0 {
            return Err(RouteError::InvalidHandler {
                route,
                reason: "pool size must be at least 1".to_string(),
            });
        }
        def = def.with_pool_size(pool_size);

        if let Some(existing) = self.shared.registry.get(&route) {
            if existing.pool_size() == pool_size {
                existing.replace_def(def);
                info!(route = %route, "route updated");
                return Ok(());
            }
        }
        let handle = spawn_route(def, Arc::downgrade(&self.shared), self.restart_policy());
        if let Some(previous) = self.shared.registry.insert(&route, handle) {
            let grace = Duration::from_millis(self.shared.config.release_grace_ms);
            tokio::spawn(async move {
                if !previous.drain(grace).await {
                    warn!(route = %route, "replaced pool did not drain in time");
                }
            });
        }
        Ok(())
    }

    /// Same as [`Platform::register`] with private visibility.
    ///
    /// # Errors
    ///
    /// Same as [`Platform::register`].
    pub fn register_private(&self, def: ServiceDef) -> Result<(), RouteError> {
        self.register(def.private())
    }

    /// Unbinds `route` and waits for its running handlers, up to the release grace.
    ///
    /// # Errors
    ///
    /// [`RouteError::RouteNotFound`] when the route is not registered.
    pub async fn release(&self, route: &str) -> Result<(), RouteError> {
        let handle = self
            .shared
            .registry
            .remove(route)
            .ok_or_else(|| RouteError::not_found(route))?;
        let grace = Duration::from_millis(self.shared.config.release_grace_ms);
        if handle.drain(grace).await {
            info!(route, "route released");
        } else {
            warn!(route, "route released before in-flight work finished");
        }
        Ok(())
    }

    /// Makes a private route public without touching its handler.
    ///
    /// # Errors
    ///
    /// [`RouteError::RouteNotFound`] when the route is not registered.
    pub fn make_public(&self, route: &str) -> Result<(), RouteError> {
        let handle = self
            .shared
            .registry
            .get(route)
            .ok_or_else(|| RouteError::not_found(route))?;
        let def = handle.def();
        if def.is_private() {
            handle.replace_def((*def).clone().with_visibility(Visibility::Public));
        }
        Ok(())
    }

    /// Current definition of `route`.
    #[must_use]
    pub fn service_def(&self, route: &str) -> Option<Arc<ServiceDef>> {
        self.shared.registry.get(route).map(|handle| handle.def())
    }

    /// Lifecycle state of the pool currently serving `route`.
    #[must_use]
    pub fn route_state(&self, route: &str) -> Option<RouteState> {
        self.shared
            .registry
            .get(route)
            .map(|handle| handle.lifecycle.state())
    }

    #[must_use]
    pub fn has_route(&self, route: &str) -> bool {
        self.shared.registry.contains(route)
    }

    /// Registered routes, sorted.
    #[must_use]
    pub fn local_routes(&self) -> Vec<String> {
        self.shared.registry.routes()
    }

    /// Waits until `route` is registered.
    ///
    /// # Errors
    ///
    /// [`RouteError::Timeout`] when it does not appear within `timeout`.
    pub async fn wait_for_provider(&self, route: &str, timeout: Duration) -> Result<(), RouteError> {
        if self.shared.registry.wait_for(route, timeout).await {
            Ok(())
        } else {
            Err(RouteError::Timeout {
                route: route.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }

    /// Releases every route, cancels scheduled events and fails pending calls.
    pub async fn shutdown(&self) {
        self.shared.scheduler.cancel_all();
        for route in self.local_routes() {
            if let Err(e) = self.release(&route).await {
                warn!(route = %route, "release during shutdown failed: {e}");
            }
        }
        let abandoned = self.shared.pending.len();
        if abandoned > 0 {
            warn!(abandoned, "pending calls abandoned at shutdown");
        }
        self.shared.pending.clear();
        self.shared.pubsub.disable();
        info!("platform stopped");
    }
}
