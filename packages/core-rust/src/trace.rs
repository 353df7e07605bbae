//! Distributed-trace span records.
//!
//! A span is emitted once per traced handler call. On the wire it is an
//! envelope addressed to the trace collector route: scalar facts travel as
//! headers, annotations and the optional journaled payload travel in the body.

use std::collections::BTreeMap;

use crate::envelope::Envelope;
use crate::types::{Headers, Value};

/// Outcome-specific part of a span.
#[derive(Debug, Clone, PartialEq)]
pub enum SpanOutcome {
    /// Handler finished; wall time in milliseconds.
    Success { exec_time: f64 },
    /// Handler failed with `status`; `exception` is the root-cause message.
    Failure { status: u16, exception: String },
}

/// One completed traced call.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub service: String,
    pub origin: String,
    pub trace_id: String,
    pub trace_path: String,
    pub from: Option<String>,
    /// Start time, epoch milliseconds.
    pub start: u64,
    pub outcome: SpanOutcome,
    pub annotations: BTreeMap<String, Value>,
    /// Journaled input/output, present only for journaled routes.
    pub payload: Option<Value>,
}

impl SpanRecord {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SpanOutcome::Success { .. })
    }

    /// Renders the span as an envelope for `route`.
    #[must_use]
    pub fn to_envelope(&self, route: &str) -> Envelope {
        let mut headers = Headers::new();
        headers.insert("origin".into(), self.origin.clone());
        headers.insert("id".into(), self.trace_id.clone());
        headers.insert("path".into(), self.trace_path.clone());
        headers.insert("service".into(), self.service.clone());
        headers.insert("start".into(), self.start.to_string());
        headers.insert("success".into(), self.is_success().to_string());
        if let Some(from) = &self.from {
            headers.insert("from".into(), from.clone());
        }
        match &self.outcome {
            SpanOutcome::Success { exec_time } => {
                headers.insert("exec_time".into(), exec_time.to_string());
            }
            SpanOutcome::Failure { status, exception } => {
                headers.insert("status".into(), status.to_string());
                headers.insert("exception".into(), exception.clone());
            }
        }
        let mut body = BTreeMap::new();
        body.insert("annotations".to_string(), Value::Map(self.annotations.clone()));
        if let Some(payload) = &self.payload {
            body.insert("payload".to_string(), payload.clone());
        }
        Envelope::to_route(route)
            .with_headers(headers)
            .with_body(Value::Map(body))
    }

    /// Parses a span envelope. Returns `None` if required headers are missing.
    #[must_use]
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        let h = |key: &str| envelope.header(key).map(str::to_string);
        let outcome = if envelope.header("success")? == "true" {
            SpanOutcome::Success {
                exec_time: envelope.header("exec_time")?.parse().ok()?,
            }
        } else {
            SpanOutcome::Failure {
                status: envelope.header("status")?.parse().ok()?,
                exception: h("exception").unwrap_or_default(),
            }
        };
        Some(Self {
            service: h("service")?,
            origin: h("origin")?,
            trace_id: h("id")?,
            trace_path: h("path")?,
            from: h("from"),
            start: envelope.header("start")?.parse().ok()?,
            outcome,
            annotations: envelope
                .body
                .get("annotations")
                .and_then(Value::as_map)
                .cloned()
                .unwrap_or_default(),
            payload: envelope.body.get("payload").cloned(),
        })
    }
}
