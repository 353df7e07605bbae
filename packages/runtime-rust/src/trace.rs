//! Call-scoped trace context.
//!
//! Every handler invocation runs inside its own task-local scope holding the
//! serving route and, when the incoming envelope carried one, the trace id
//! and path. Annotations live only in that scope: outgoing calls inherit the
//! id and path but never the annotations, and the scope is discarded once the
//! span for the call has been emitted.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;

use relay_core::clock::now_millis;
use relay_core::Value;

tokio::task_local! {
    static CALL_SCOPE: RefCell<CallScope>;
}

/// Trace state of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceContext {
    pub id: String,
    pub path: String,
    /// Epoch milliseconds when the trace was attached to this call.
    pub start_ms: u64,
    pub annotations: BTreeMap<String, Value>,
}

impl TraceContext {
    #[must_use]
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            start_ms: now_millis(),
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CallScope {
    pub(crate) route: Option<String>,
    pub(crate) trace: Option<TraceContext>,
}

/// Runs `fut` inside `scope` and returns its output with the final scope.
pub(crate) async fn run_scoped<F: Future>(scope: CallScope, fut: F) -> (F::Output, CallScope) {
    CALL_SCOPE
        .scope(RefCell::new(scope), async move {
            let output = fut.await;
            let scope = CALL_SCOPE.with(RefCell::take);
            (output, scope)
        })
        .await
}

/// Runs `fut` as if it were a call served by `route` with the given trace.
///
/// Entry points that do not come through a worker slot (gateways, tests,
/// bootstrap code) use this to start a traced call chain.
pub async fn traced<F: Future>(route: &str, trace_id: &str, trace_path: &str, fut: F) -> F::Output {
    let scope = CallScope {
        route: Some(route.to_string()),
        trace: Some(TraceContext::new(trace_id, trace_path)),
    };
    run_scoped(scope, fut).await.0
}

fn with_scope<R>(f: impl FnOnce(&mut CallScope) -> R) -> Option<R> {
    CALL_SCOPE.try_with(|cell| f(&mut cell.borrow_mut())).ok()
}

/// Route serving the current call, if any.
#[must_use]
pub fn current_route() -> Option<String> {
    with_scope(|s| s.route.clone()).flatten()
}

/// Attaches a fresh trace to the current call. Returns `false` outside a call.
pub fn start_tracing(route: &str, trace_id: &str, trace_path: &str) -> bool {
    with_scope(|s| {
        if s.route.is_none() {
            s.route = Some(route.to_string());
        }
        s.trace = Some(TraceContext::new(trace_id, trace_path));
    })
    .is_some()
}

/// Detaches the trace from the current call.
pub fn stop_tracing() {
    with_scope(|s| s.trace = None);
}

/// Adds an annotation to the current trace. Returns `false` when not traced.
pub fn annotate(key: impl Into<String>, value: impl Into<Value>) -> bool {
    with_scope(|s| match s.trace.as_mut() {
        Some(trace) => {
            trace.annotations.insert(key.into(), value.into());
            true
        }
        None => false,
    })
    .unwrap_or(false)
}

#[must_use]
pub fn trace_id() -> Option<String> {
    with_scope(|s| s.trace.as_ref().map(|t| t.id.clone())).flatten()
}

/// Snapshot of the current trace.
#[must_use]
pub fn current_trace() -> Option<TraceContext> {
    with_scope(|s| s.trace.clone()).flatten()
}

/// Route and trace id/path an outgoing envelope should inherit.
pub(crate) fn outgoing() -> Option<(Option<String>, Option<(String, String)>)> {
    with_scope(|s| {
        let trace = s.trace.as_ref().map(|t| (t.id.clone(), t.path.clone()));
        (s.route.clone(), trace)
    })
}
