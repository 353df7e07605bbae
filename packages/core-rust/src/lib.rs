//! Relay core: envelopes, dynamic values, error transport, route names and span records.

pub mod clock;
pub mod envelope;
pub mod error;
pub mod route;
pub mod trace;
pub mod types;

pub use envelope::{Envelope, EnvelopeCodecError, STATUS_OK};
pub use error::{
    AppError, ErrorInfo, ErrorKind, InvalidArgument, STATUS_BAD_REQUEST, STATUS_INTERNAL,
    STATUS_TIMEOUT,
};
pub use route::{validate_route, RouteNameError};
pub use trace::{SpanOutcome, SpanRecord};
pub use types::{Headers, Value};

