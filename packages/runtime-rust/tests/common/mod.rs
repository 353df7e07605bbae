#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_core::{value_map, Headers, Value};
use relay_runtime::{handler_fn, EventHandler, Output, Platform, PlatformConfig, ServiceDef};
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(2);

pub fn start() -> Platform {
    start_with(PlatformConfig::default())
}

pub fn start_with(config: PlatformConfig) -> Platform {
    Platform::start(config).expect("platform starts")
}

/// `(headers, body, instance) -> {headers, body}`.
pub fn echo() -> Arc<dyn EventHandler> {
    handler_fn(|headers: Headers, payload, _| async move {
        Ok(Output::body(value_map! {
            "headers" => &headers,
            "body" => payload.into_body(),
        }))
    })
}

/// Registers `route` and returns everything it receives.
pub fn capture(platform: &Platform, route: &str) -> mpsc::UnboundedReceiver<(Headers, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    platform
        .register(ServiceDef::new(
            route,
            handler_fn(move |headers, payload, _| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((headers, payload.into_body()));
                    Ok(Output::none())
                }
            }),
        ))
        .expect("capture route registers");
    rx
}

/// Collects `n` messages or fails after `TIMEOUT`.
pub async fn collect(rx: &mut mpsc::UnboundedReceiver<(Headers, Value)>, n: usize) -> Vec<(Headers, Value)> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let next = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("message arrives in time")
            .expect("channel open");
        out.push(next);
    }
    out
}
