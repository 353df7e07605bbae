//! One worker slot: takes an envelope, runs the handler, replies, emits the
//! span, then signals ready.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use relay_core::clock::{now_millis, round_millis};
use relay_core::{
    value_map, AppError, Envelope, ErrorInfo, Headers, SpanOutcome, SpanRecord, Value,
    STATUS_TIMEOUT,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info_span, warn, Instrument};

use super::{Assignment, SlotContext, SlotSignal};
use crate::handler::{EventHandler, Output, Payload};
use crate::platform::Shared;
use crate::post_office::PostOffice;
use crate::registry::Capabilities;
use crate::trace::{self, CallScope, TraceContext};

const PONG_REASON: &str =
    "This response is generated when you send an event without headers and body";

/// Reports `Crashed` if the slot task ends without a clean shutdown.
struct CrashGuard {
    instance: usize,
    signals: mpsc::UnboundedSender<SlotSignal>,
    armed: bool,
}

impl Drop for CrashGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.signals.send(SlotSignal::Crashed(self.instance));
        }
    }
}

pub(super) fn spawn(
    ctx: Arc<SlotContext>,
    instance: usize,
    mut work: mpsc::Receiver<Assignment>,
    signals: mpsc::UnboundedSender<SlotSignal>,
) {
    tokio::spawn(async move {
        let mut guard = CrashGuard {
            instance,
            signals: signals.clone(),
            armed: true,
        };
        while let Some(Assignment { envelope, ticket }) = work.recv().await {
            process(&ctx, instance, envelope).await;
            drop(ticket);
            if signals.send(SlotSignal::Ready(instance)).is_err() {
                break;
            }
        }
        guard.armed = false;
    });
}

/// Reply skeleton for `request`, or `None` when the caller wants no reply.
fn reply_for(request: &Envelope, route: &str) -> Option<Envelope> {
    let reply_to = request.reply_to.as_ref()?;
    let mut reply = Envelope::to_route(reply_to.clone()).with_from(route);
    reply.correlation_id.clone_from(&request.correlation_id);
    reply.extra.clone_from(&request.extra);
    reply.trace_id.clone_from(&request.trace_id);
    reply.trace_path.clone_from(&request.trace_path);
    Some(reply)
}

fn send_reply(po: &PostOffice, reply: Envelope) {
    let to = reply.to.clone().unwrap_or_default();
    if let Err(e) = po.deliver(reply) {
        warn!(reply_to = %to, "reply not delivered: {e}");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn deliver_error(handler: &Arc<dyn EventHandler>, err: AppError, envelope: &Envelope) {
    let outcome = AssertUnwindSafe(handler.on_error(err, envelope))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("error handler failed: {e:#}"),
        Err(panic) => error!("error handler panicked: {}", panic_message(&*panic)),
    }
}

/// What the call produced, normalized for replies and spans.
struct Completion {
    headers: Headers,
    body: Value,
    status: u16,
    error: Option<ErrorInfo>,
}

impl Completion {
    fn failed(&self) -> bool {
        self.status >= 400
    }
}

fn incoming_trace(envelope: &Envelope) -> Option<TraceContext> {
    match (&envelope.trace_id, &envelope.trace_path) {
        (Some(id), Some(path)) => Some(TraceContext::new(id.clone(), path.clone())),
        _ => None,
    }
}

async fn process(ctx: &SlotContext, instance: usize, envelope: Envelope) {
    let Some(shared) = ctx.shared.upgrade() else {
        return;
    };
    let def = ctx.def.load_full();
    let caps = def.capabilities();
    let route = ctx.route.as_str();
    let po = PostOffice::new(Arc::clone(&shared));
    metrics::counter!("relay_events_dispatched_total", "route" => route.to_string()).increment(1);

    let start_ms = now_millis();
    let started = Instant::now();
    let call = Call {
        shared: &shared,
        po: &po,
        caps,
        route,
        envelope: &envelope,
        start_ms,
    };

    if envelope.has_error() && caps.contains(Capabilities::HANDLES_ERRORS) {
        let message = envelope.error_message().unwrap_or_default();
        deliver_error(def.handler(), AppError::new(envelope.status, message.clone()), &envelope)
            .await;
        call.emit_span(
            incoming_trace(&envelope),
            SpanOutcome::Failure {
                status: envelope.status,
                exception: message,
            },
            None,
        );
        return;
    }

    let interceptor = caps.contains(Capabilities::INTERCEPTOR);
    if !interceptor && envelope.is_empty_call() {
        metrics::counter!("relay_ping_total", "route" => route.to_string()).increment(1);
        if let Some(mut reply) = reply_for(&envelope, route) {
            reply.body = pong(&shared, route);
            send_reply(&po, reply);
        }
        call.emit_span(
            incoming_trace(&envelope),
            SpanOutcome::Success {
                exec_time: round_millis(started.elapsed()),
            },
            None,
        );
        return;
    }

    let payload = if interceptor || caps.contains(Capabilities::WANTS_ENVELOPE) {
        Payload::Envelope(Box::new(envelope.clone()))
    } else {
        Payload::Body(envelope.body.clone())
    };
    let scope = CallScope {
        route: Some(route.to_string()),
        trace: incoming_trace(&envelope),
    };
    let span = info_span!(
        "handle_event",
        route = %route,
        instance,
        trace_id = envelope.trace_id.as_deref().unwrap_or(""),
    );

    let invocation = AssertUnwindSafe(def.handler().handle_event(
        envelope.headers.clone(),
        payload,
        instance,
    ))
    .catch_unwind();
    let (result, scope) = trace::run_scoped(scope, invocation)
        .instrument(span.clone())
        .await;
    let exec_time = round_millis(started.elapsed());

    let result = result.unwrap_or_else(|panic| {
        Err(anyhow::anyhow!(
            "handler panicked: {}",
            panic_message(&*panic)
        ))
    });

    let completion = match result {
        Ok(Output::Body(body)) => Completion {
            headers: Headers::new(),
            body,
            status: relay_core::STATUS_OK,
            error: None,
        },
        Ok(Output::Envelope(out)) => Completion {
            headers: out.headers,
            body: out.body,
            status: out.status,
            error: out.error,
        },
        Err(err) => {
            let info = ErrorInfo::from_anyhow(&err);
            Completion {
                headers: Headers::new(),
                body: Value::String(info.root_cause().message.clone()),
                status: info.status_code(),
                error: Some(info),
            }
        }
    };
    let failed = completion.failed();
    // A bare 408 is the handler asking the caller to time out; it is not a failure.
    let simulated_timeout = completion.status == STATUS_TIMEOUT
        && completion.headers.is_empty()
        && completion.body.is_null();
    let message = if failed {
        completion.body.to_text()
    } else {
        String::new()
    };

    if failed && completion.error.is_some() && caps.contains(Capabilities::HANDLES_ERRORS) {
        deliver_error(
            def.handler(),
            AppError::new(completion.status, message.clone()),
            &envelope,
        )
        .await;
    } else if simulated_timeout {
        debug!("handler signalled timeout, no reply");
    } else if let Some(mut reply) = reply_for(&envelope, route).filter(|_| failed || !interceptor) {
        reply.headers.clone_from(&completion.headers);
        reply.body = completion.body.clone();
        reply.status = completion.status;
        reply.error.clone_from(&completion.error);
        reply.execution_time = exec_time;
        send_reply(&po, reply);
    } else if failed {
        span.in_scope(|| {
            if completion.status >= relay_core::STATUS_INTERNAL {
                error!(status = completion.status, "unhandled failure: {message}");
            } else {
                warn!(status = completion.status, "unhandled failure: {message}");
            }
        });
    }

    let outcome = if failed && !simulated_timeout {
        SpanOutcome::Failure {
            status: completion.status,
            exception: message,
        }
    } else {
        SpanOutcome::Success { exec_time }
    };
    let journal = shared
        .config
        .journal_routes
        .contains(route)
        .then(|| journal_payload(&envelope, &completion));
    call.emit_span(scope.trace, outcome, journal);
}

/// Input and output of a journaled call.
fn journal_payload(envelope: &Envelope, completion: &Completion) -> Value {
    let mut output = value_map! {
        "body" => completion.body.clone(),
        "status" => u32::from(completion.status),
    };
    if !completion.headers.is_empty() {
        if let Value::Map(m) = &mut output {
            m.insert("headers".to_string(), Value::from(&completion.headers));
        }
    }
    value_map! {
        "input" => value_map! {
            "headers" => &envelope.headers,
            "body" => envelope.body.clone(),
        },
        "output" => output,
    }
}

/// The envelope being processed and where its span goes.
struct Call<'a> {
    shared: &'a Shared,
    po: &'a PostOffice,
    caps: Capabilities,
    route: &'a str,
    envelope: &'a Envelope,
    start_ms: u64,
}

impl Call<'_> {
    /// Sends one span to the trace route for a traced call.
    fn emit_span(&self, trace: Option<TraceContext>, outcome: SpanOutcome, payload: Option<Value>) {
        if self.caps.contains(Capabilities::TRACING_DISABLED) {
            return;
        }
        let Some(trace) = trace else {
            return;
        };
        let trace_route = self.shared.config.trace_route.as_str();
        if !self.shared.registry.contains(trace_route) {
            return;
        }
        let record = SpanRecord {
            service: self.route.to_string(),
            origin: self.shared.config.origin.clone(),
            trace_id: trace.id,
            trace_path: trace.path,
            from: self.envelope.from.clone(),
            start: self.start_ms,
            outcome,
            annotations: trace.annotations,
            payload,
        };
        let mut span_envelope = record.to_envelope(trace_route);
        span_envelope.from = Some(self.route.to_string());
        if let Err(e) = self.po.deliver(span_envelope) {
            debug!(route = self.route, "span not delivered: {e}");
        }
    }
}

fn pong(shared: &Shared, route: &str) -> Value {
    value_map! {
        "type" => "pong",
        "time" => i64::try_from(now_millis()).unwrap_or(i64::MAX),
        "app" => shared.config.app_name.as_str(),
        "origin" => shared.config.origin.as_str(),
        "service" => route,
        "reason" => PONG_REASON,
        "message" => format!("you have reached {route}"),
    }
}
