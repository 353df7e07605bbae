//! The contract between the runtime and service code.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{AppError, Envelope, Headers, Value};

/// What a handler receives as its second argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The unwrapped body.
    Body(Value),
    /// The whole envelope, for interceptors and services that want envelope access.
    Envelope(Box<Envelope>),
}

impl Payload {
    /// The body, whichever form the payload takes.
    #[must_use]
    pub fn body(&self) -> &Value {
        match self {
            Payload::Body(v) => v,
            Payload::Envelope(e) => &e.body,
        }
    }

    #[must_use]
    pub fn into_body(self) -> Value {
        match self {
            Payload::Body(v) => v,
            Payload::Envelope(e) => e.body,
        }
    }

    #[must_use]
    pub fn as_envelope(&self) -> Option<&Envelope> {
        match self {
            Payload::Envelope(e) => Some(e),
            Payload::Body(_) => None,
        }
    }
}

/// What a handler returns.
///
/// A plain body becomes the reply body. An envelope lets the handler choose
/// the reply's headers and status as well.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Body(Value),
    Envelope(Box<Envelope>),
}

impl Output {
    #[must_use]
    pub fn body(value: impl Into<Value>) -> Self {
        Output::Body(value.into())
    }

    /// No reply body.
    #[must_use]
    pub fn none() -> Self {
        Output::Body(Value::Null)
    }
}

impl From<Value> for Output {
    fn from(v: Value) -> Self {
        Output::Body(v)
    }
}

impl From<Envelope> for Output {
    fn from(e: Envelope) -> Self {
        Output::Envelope(Box::new(e))
    }
}

/// A service implementation bound to a route.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handles one envelope. `instance` is the 1-based worker slot number.
    async fn handle_event(
        &self,
        headers: Headers,
        payload: Payload,
        instance: usize,
    ) -> anyhow::Result<Output>;

    /// Receives failures instead of the automatic error reply.
    ///
    /// Called only for services registered with `Capabilities::HANDLES_ERRORS`.
    /// Errors returned here are logged and dropped.
    async fn on_error(&self, error: AppError, envelope: &Envelope) -> anyhow::Result<()> {
        tracing::debug!(
            status = error.status,
            envelope = %envelope.id,
            "unhandled error: {}", error.message
        );
        Ok(())
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Headers, Payload, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Output>> + Send + 'static,
{
    async fn handle_event(
        &self,
        headers: Headers,
        payload: Payload,
        instance: usize,
    ) -> anyhow::Result<Output> {
        (self.0)(headers, payload, instance).await
    }
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Headers, Payload, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Output>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_handler_receives_arguments() {
        let handler = handler_fn(|headers: Headers, payload: Payload, instance| async move {
            Ok(Output::body(relay_core::value_map! {
                "headers" => &headers,
                "body" => payload.into_body(),
                "instance" => i64::try_from(instance)?,
            }))
        });
        let mut headers = Headers::new();
        headers.insert("a".into(), "b".into());
        let out = handler
            .handle_event(headers, Payload::Body(Value::from(111)), 2)
            .await
            .unwrap();
        let Output::Body(body) = out else {
            panic!("expected body output");
        };
        assert_eq!(body.get("body"), Some(&Value::from(111)));
        assert_eq!(body.get_path("headers.a"), Some(&Value::from("b")));
        assert_eq!(body.get("instance"), Some(&Value::from(2)));
    }

    #[test]
    fn payload_body_reads_through_envelope() {
        let env = Envelope::new().with_body("x");
        let payload = Payload::Envelope(Box::new(env));
        assert_eq!(payload.body(), &Value::from("x"));
        assert!(payload.as_envelope().is_some());
        assert!(Payload::Body(Value::Null).as_envelope().is_none());
    }

    #[tokio::test]
    async fn default_error_hook_is_ok() {
        let handler = handler_fn(|_, _, _| async { Ok(Output::none()) });
        let result = handler
            .on_error(AppError::new(500, "boom"), &Envelope::new())
            .await;
        assert!(result.is_ok());
    }
}
