//! The public messaging API: send, request, fan-out, broadcast, scheduling,
//! presence queries and trace helpers.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use relay_core::{Envelope, RouteNameError, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use crate::error::RouteError;
use crate::pending;
use crate::platform::Shared;
use crate::registry::RouteHandle;
use crate::trace::{self, TraceContext};

fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

fn target_of(envelope: &Envelope) -> Result<String, RouteError> {
    match envelope.to.as_deref() {
        Some(to) if !to.is_empty() => Ok(to.to_string()),
        _ => Err(RouteError::InvalidRoute {
            route: String::new(),
            reason: RouteNameError::Empty,
        }),
    }
}

/// An outstanding call issued to a route.
struct Issued {
    route: String,
    address: String,
    receiver: oneshot::Receiver<Envelope>,
}

/// Reply handle returned by [`PostOffice::async_request`].
///
/// Resolves to the reply, or to the same errors `request` would return.
pub struct ReplyFuture {
    task: JoinHandle<Result<Envelope, RouteError>>,
}

impl Future for ReplyFuture {
    type Output = Result<Envelope, RouteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(RouteError::Internal(anyhow::anyhow!("reply task failed: {e}"))),
        })
    }
}

/// Entry point for all messaging. Cheap to clone.
#[derive(Clone)]
pub struct PostOffice {
    shared: Arc<Shared>,
}

impl PostOffice {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn resolve(&self, route: &str) -> Result<Arc<RouteHandle>, RouteError> {
        let target = self.shared.config.substitute(route);
        self.shared
            .registry
            .get(target)
            .ok_or_else(|| RouteError::not_found(route))
    }

    /// Sets `from` to the calling route, or clears it outside a handler, and
    /// propagates the current trace.
    fn stamp(envelope: &mut Envelope) {
        let Some((route, trace)) = trace::outgoing() else {
            envelope.from = None;
            return;
        };
        envelope.from = route;
        if envelope.trace_id.is_none() {
            if let Some((id, path)) = trace {
                envelope.trace_id = Some(id);
                envelope.trace_path = Some(path);
            }
        }
    }

    /// Routes an envelope as-is: to a waiting caller or to a route inbox.
    pub(crate) fn deliver(&self, envelope: Envelope) -> Result<(), RouteError> {
        let to = target_of(&envelope)?;
        if pending::is_reply_address(&to) {
            self.shared.pending.complete(&to, envelope);
            return Ok(());
        }
        self.resolve(&to)?.deliver(envelope)
    }

    /// Fire-and-forget delivery.
    ///
    /// # Errors
    ///
    /// [`RouteError::RouteNotFound`] when the target is not registered.
    pub fn send(&self, mut envelope: Envelope) -> Result<(), RouteError> {
        Self::stamp(&mut envelope);
        self.deliver(envelope)
    }

    /// Delivers to every instance bound to the route.
    ///
    /// In a single process that is the one local binding; cluster fan-out is
    /// the job of a transport bridge subscribed to the route.
    ///
    /// # Errors
    ///
    /// [`RouteError::RouteNotFound`] when the target is not registered.
    pub fn broadcast(&self, envelope: Envelope) -> Result<(), RouteError> {
        self.send(envelope)
    }

    fn issue(&self, mut envelope: Envelope) -> Result<Issued, RouteError> {
        let route = target_of(&envelope)?;
        self.resolve(&route)?;
        Self::stamp(&mut envelope);
        let (address, receiver) = self
            .shared
            .pending
            .register(&route, envelope.correlation_id.clone());
        envelope.reply_to = Some(address.clone());
        if let Err(e) = self.deliver(envelope) {
            self.shared.pending.expire(&address);
            return Err(e);
        }
        Ok(Issued {
            route,
            address,
            receiver,
        })
    }

    async fn await_reply(
        shared: &Shared,
        issued: Issued,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Envelope, RouteError> {
        let Issued {
            route,
            address,
            mut receiver,
        } = issued;
        let closed = |route: &str| {
            RouteError::Internal(anyhow::anyhow!("reply channel for {route} closed"))
        };
        match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(closed(&route)),
            Err(_) => {
                if shared.pending.expire(&address) {
                    metrics::counter!("relay_request_timeouts_total", "route" => route.clone())
                        .increment(1);
                    Err(RouteError::Timeout {
                        route,
                        timeout_ms: timeout_ms(timeout),
                    })
                } else {
                    // A reply claimed the entry just before the deadline.
                    receiver.await.map_err(|_| closed(&route))
                }
            }
        }
    }

    fn into_result(reply: Envelope) -> Result<Envelope, RouteError> {
        if reply.has_error() {
            Err(RouteError::from_reply(&reply))
        } else {
            Ok(reply)
        }
    }

    /// Sends `envelope` and waits for its reply.
    ///
    /// # Errors
    ///
    /// - [`RouteError::RouteNotFound`] when the target is not registered.
    /// - [`RouteError::Timeout`] when no reply arrives within `timeout`.
    /// - [`RouteError::Application`] when the reply carries a failure status.
    pub async fn request(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope, RouteError> {
        let deadline = Instant::now() + timeout;
        let issued = self.issue(envelope)?;
        Self::await_reply(&self.shared, issued, deadline, timeout)
            .await
            .and_then(Self::into_result)
    }

    /// Like [`PostOffice::request`] but returns immediately with a future.
    ///
    /// # Errors
    ///
    /// [`RouteError::RouteNotFound`] is reported here, before any waiting.
    /// Timeouts and failure replies resolve the returned future with an error.
    pub fn async_request(&self, envelope: Envelope, timeout: Duration) -> Result<ReplyFuture, RouteError> {
        let deadline = Instant::now() + timeout;
        let issued = self.issue(envelope)?;
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            Self::await_reply(&shared, issued, deadline, timeout)
                .await
                .and_then(Self::into_result)
        });
        Ok(ReplyFuture { task })
    }

    /// Issues all requests concurrently under one shared deadline.
    ///
    /// Returns the replies that arrived in time, failure replies included,
    /// in issue order. Requests that timed out are left out of the result.
    ///
    /// # Errors
    ///
    /// [`RouteError::RouteNotFound`] if any target is not registered; nothing
    /// is sent in that case.
    pub async fn request_all(
        &self,
        envelopes: Vec<Envelope>,
        timeout: Duration,
    ) -> Result<Vec<Envelope>, RouteError> {
        let deadline = Instant::now() + timeout;
        for envelope in &envelopes {
            self.resolve(&target_of(envelope)?)?;
        }
        let mut issued = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            match self.issue(envelope) {
                Ok(call) => issued.push(call),
                Err(e) => {
                    for call in &issued {
                        self.shared.pending.expire(&call.address);
                    }
                    return Err(e);
                }
            }
        }
        let waits = issued
            .into_iter()
            .map(|call| Self::await_reply(&self.shared, call, deadline, timeout));
        let replies = futures_util::future::join_all(waits).await;
        Ok(replies
            .into_iter()
            .filter_map(|reply| match reply {
                Ok(reply) => Some(reply),
                Err(RouteError::Timeout { .. }) => None,
                Err(e) => {
                    warn!("fan-out request failed: {e}");
                    None
                }
            })
            .collect())
    }

    /// Liveness probe: the route answers without running its handler.
    ///
    /// # Errors
    ///
    /// Same as [`PostOffice::request`].
    pub async fn ping(&self, route: &str, timeout: Duration) -> Result<Envelope, RouteError> {
        self.request(Envelope::to_route(route), timeout).await
    }

    /// Schedules `envelope` for delivery at `fire_time`. Returns the envelope id.
    ///
    /// The target does not need to exist yet; a delivery failure at fire time
    /// is logged.
    ///
    /// # Errors
    ///
    /// [`RouteError::InvalidRoute`] when the envelope has no valid target.
    pub fn send_later(&self, mut envelope: Envelope, fire_time: SystemTime) -> Result<String, RouteError> {
        let route = target_of(&envelope)?;
        relay_core::validate_route(&route).map_err(|reason| RouteError::InvalidRoute {
            route: route.clone(),
            reason,
        })?;
        Self::stamp(&mut envelope);
        let id = envelope.id.clone();
        let weak = Arc::downgrade(&self.shared);
        let key = id.clone();
        self.shared
            .scheduler
            .schedule(&id, &route, fire_time, move |token| async move {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if !shared.scheduler.claim(&key, token) {
                    return;
                }
                if let Err(e) = PostOffice::new(shared).deliver(envelope) {
                    warn!(event = %key, "scheduled event not delivered: {e}");
                }
            });
        Ok(id)
    }

    /// Cancels a scheduled event. Returns `false` if it already fired or is unknown.
    pub fn cancel_future_event(&self, id: &str) -> bool {
        self.shared.scheduler.cancel(id)
    }

    /// Ids of pending scheduled events for `route`.
    #[must_use]
    pub fn future_events(&self, route: &str) -> Vec<String> {
        self.shared.scheduler.events_for(route)
    }

    /// Routes with pending scheduled events.
    #[must_use]
    pub fn all_future_events(&self) -> Vec<String> {
        self.shared.scheduler.routes()
    }

    #[must_use]
    pub fn future_event_time(&self, id: &str) -> Option<SystemTime> {
        self.shared.scheduler.fire_time(id)
    }

    /// `true` when every listed route is registered. An empty list is `false`.
    #[must_use]
    pub fn exists(&self, routes: &[&str]) -> bool {
        !routes.is_empty()
            && routes.iter().all(|route| {
                self.shared
                    .registry
                    .contains(self.shared.config.substitute(route))
            })
    }

    /// Origins serving `route`. Only this process is known locally, so a
    /// remote-only search is always empty.
    #[must_use]
    pub fn search(&self, route: &str, remote_only: bool) -> Vec<String> {
        if !remote_only && self.exists(&[route]) {
            vec![self.shared.config.origin.clone()]
        } else {
            Vec::new()
        }
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.shared.config.origin
    }

    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.shared.config.app_name
    }

    #[must_use]
    pub fn is_journaled(&self, route: &str) -> bool {
        self.shared.config.journal_routes.contains(route)
    }

    /// Journaled routes, sorted.
    #[must_use]
    pub fn journaled_routes(&self) -> Vec<String> {
        self.shared.config.journal_routes.iter().cloned().collect()
    }

    #[must_use]
    pub fn route_substitution_list(&self) -> &BTreeMap<String, String> {
        &self.shared.config.route_substitution
    }

    /// Route serving the current call.
    #[must_use]
    pub fn route(&self) -> Option<String> {
        trace::current_route()
    }

    /// Attaches a new trace to the current call. Returns `false` outside a call.
    pub fn start_tracing(&self, route: &str, trace_id: &str, trace_path: &str) -> bool {
        trace::start_tracing(route, trace_id, trace_path)
    }

    pub fn stop_tracing(&self) {
        trace::stop_tracing();
    }

    /// Annotates the current trace. Annotations never leave this call.
    pub fn annotate_trace(&self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        trace::annotate(key, value)
    }

    #[must_use]
    pub fn trace_id(&self) -> Option<String> {
        trace::trace_id()
    }

    #[must_use]
    pub fn trace(&self) -> Option<TraceContext> {
        trace::current_trace()
    }
}
