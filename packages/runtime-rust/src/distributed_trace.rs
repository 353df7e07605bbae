//! Built-in collector for trace spans.
//!
//! Worker slots send one span envelope per traced call to the trace route.
//! This service logs it and hands it on to the trace processor route when an
//! application has registered one.

use std::sync::Weak;

use async_trait::async_trait;
use relay_core::{Envelope, Headers, SpanOutcome, SpanRecord};
use tracing::{debug, info, warn};

use crate::handler::{EventHandler, Output, Payload};
use crate::platform::Shared;
use crate::post_office::PostOffice;

pub(crate) struct DistributedTrace {
    shared: Weak<Shared>,
}

impl DistributedTrace {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl EventHandler for DistributedTrace {
    async fn handle_event(
        &self,
        headers: Headers,
        payload: Payload,
        _instance: usize,
    ) -> anyhow::Result<Output> {
        let Some(envelope) = payload.as_envelope() else {
            return Ok(Output::none());
        };
        let Some(span) = SpanRecord::from_envelope(envelope) else {
            debug!("ignored malformed span");
            return Ok(Output::none());
        };
        match &span.outcome {
            SpanOutcome::Success { exec_time } => info!(
                target: "relay::trace",
                trace_id = %span.trace_id,
                path = %span.trace_path,
                service = %span.service,
                from = span.from.as_deref().unwrap_or(""),
                exec_time,
                "span"
            ),
            SpanOutcome::Failure { status, exception } => info!(
                target: "relay::trace",
                trace_id = %span.trace_id,
                path = %span.trace_path,
                service = %span.service,
                from = span.from.as_deref().unwrap_or(""),
                status,
                exception = %exception,
                "span"
            ),
        }

        let Some(shared) = self.shared.upgrade() else {
            return Ok(Output::none());
        };
        let processor = shared.config.trace_processor_route.clone();
        let po = PostOffice::new(shared);
        if po.exists(&[processor.as_str()]) {
            let forward = Envelope::to_route(processor)
                .with_headers(headers)
                .with_body(envelope.body.clone());
            if let Err(e) = po.send(forward) {
                warn!("span not forwarded: {e}");
            }
        }
        Ok(Output::none())
    }
}
