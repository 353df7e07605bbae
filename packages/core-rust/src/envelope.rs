//! The addressed message unit exchanged between routes.
//!
//! Envelopes serialize with named `MsgPack` fields (`rmp_serde::to_vec_named()`)
//! and camelCase keys so a bridge can move them across processes unchanged.

use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;
use crate::types::{Headers, Value};

/// Status of a successful envelope.
pub const STATUS_OK: u16 = 200;

/// Failure to encode or decode an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeCodecError {
    #[error("envelope encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("envelope decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

fn default_status() -> u16 {
    STATUS_OK
}

fn unmeasured() -> f64 {
    -1.0
}

/// Addressed message carried between routes.
///
/// `from`, `execution_time` and `round_trip` are stamped by the dispatcher;
/// everything else belongs to the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique per envelope. Doubles as the handle of a scheduled send.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_path: Option<String>,
    /// Opaque passthrough metadata, copied verbatim onto replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    /// Handler wall time in milliseconds (3 decimals); -1 when no handler ran.
    #[serde(default = "unmeasured")]
    pub execution_time: f64,
    /// Caller-observed latency in milliseconds; -1 until a reply is received.
    #[serde(default = "unmeasured")]
    pub round_trip: f64,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl Envelope {
    /// Creates an empty envelope with a fresh id and status 200.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            to: None,
            from: None,
            reply_to: None,
            headers: Headers::new(),
            body: Value::Null,
            correlation_id: None,
            status: STATUS_OK,
            error: None,
            trace_id: None,
            trace_path: None,
            extra: None,
            execution_time: -1.0,
            round_trip: -1.0,
        }
    }

    /// Shorthand for `Envelope::new().with_to(route)`.
    #[must_use]
    pub fn to_route(route: impl Into<String>) -> Self {
        Self::new().with_to(route)
    }

    #[must_use]
    pub fn with_to(mut self, route: impl Into<String>) -> Self {
        self.to = Some(route.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, route: impl Into<String>) -> Self {
        self.from = Some(route.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, cid: impl Into<String>) -> Self {
        self.correlation_id = Some(cid.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub fn with_trace(mut self, id: impl Into<String>, path: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self.trace_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    /// `true` when the status indicates failure (>= 400).
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.status >= 400
    }

    /// Failure text: the body when it is a string, otherwise the error chain message.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        if !self.has_error() {
            return None;
        }
        match (&self.body, &self.error) {
            (Value::String(s), _) => Some(s.clone()),
            (_, Some(info)) => Some(info.root_cause().message.clone()),
            (body, None) => Some(body.to_text()),
        }
    }

    /// Ping probe: no headers and a null body.
    #[must_use]
    pub fn is_empty_call(&self) -> bool {
        self.headers.is_empty() && self.body.is_null()
    }

    /// Header lookup.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Same content under a new id, for sending an envelope a second time.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            ..self.clone()
        }
    }

    /// Encodes to named-field `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeCodecError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeCodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes an envelope produced by [`Envelope::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeCodecError::Decode`] for malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeCodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::value_map;

    use super::*;

    #[test]
    fn new_envelope_has_defaults() {
        let e = Envelope::new();
        assert_eq!(e.status, 200);
        assert!(e.execution_time < 0.0);
        assert!(e.round_trip < 0.0);
        assert!(e.is_empty_call());
        assert!(!e.has_error());
        assert_eq!(e.id.len(), 32);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(Envelope::new().id, Envelope::new().id);
        let e = Envelope::to_route("hello.world").with_body(1);
        let c = e.copy();
        assert_ne!(e.id, c.id);
        assert_eq!(c.body, e.body);
    }

    #[test]
    fn header_makes_call_non_empty() {
        let e = Envelope::to_route("hello.world").with_header("a", "b");
        assert!(!e.is_empty_call());
        assert_eq!(e.header("a"), Some("b"));
    }

    #[test]
    fn error_message_prefers_string_body() {
        let e = Envelope::new().with_status(400).with_body("bad input");
        assert_eq!(e.error_message().as_deref(), Some("bad input"));

        let e = Envelope::new()
            .with_status(500)
            .with_error(ErrorInfo::new(ErrorKind::Internal, "boom"));
        assert_eq!(e.error_message().as_deref(), Some("boom"));

        assert!(Envelope::new().with_body("fine").error_message().is_none());
    }

    #[test]
    fn msgpack_keeps_nested_body_and_error() {
        let e = Envelope::to_route("hello.world")
            .with_reply_to("r:1")
            .with_body(value_map! { "n" => 111, "bin" => vec![1u8, 2, 3] })
            .with_correlation_id("cid")
            .with_trace("t1", "GET /x")
            .with_status(400)
            .with_error(
                ErrorInfo::new(ErrorKind::InvalidArgument, "outer")
                    .with_cause(ErrorInfo::new(ErrorKind::Io, "inner")),
            );
        let decoded = Envelope::from_bytes(&e.to_bytes().expect("encode")).expect("decode");
        assert_eq!(decoded, e);
    }

    #[test]
    fn decodes_sparse_map_with_defaults() {
        #[derive(Serialize)]
        struct Sparse {
            id: &'static str,
            to: &'static str,
        }
        let bytes = rmp_serde::to_vec_named(&Sparse {
            id: "x",
            to: "hello.world",
        })
        .expect("encode");
        let e = Envelope::from_bytes(&bytes).expect("decode");
        assert_eq!(e.to.as_deref(), Some("hello.world"));
        assert_eq!(e.status, 200);
        assert!(e.body.is_null());
        assert!(e.execution_time < 0.0);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            Envelope::from_bytes(&[0xc1, 0x00]),
            Err(EnvelopeCodecError::Decode(_))
        ));
    }
}
