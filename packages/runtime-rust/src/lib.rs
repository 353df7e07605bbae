//! Relay runtime: in-process routing of envelopes between named services.
//!
//! A [`Platform`] owns the route table. Services register an
//! [`EventHandler`] under a route name and get a pool of worker slots;
//! callers talk to routes only through the [`PostOffice`].
//!
//! ```no_run
//! use std::time::Duration;
//! use relay_runtime::{handler_fn, Output, Platform, PlatformConfig, ServiceDef};
//! use relay_core::Envelope;
//!
//! # async fn demo() -> Result<(), relay_runtime::RouteError> {
//! let platform = Platform::start(PlatformConfig::default())?;
//! platform.register(ServiceDef::new(
//!     "hello.world",
//!     handler_fn(|_headers, payload, _instance| async move {
//!         Ok(Output::Body(payload.into_body()))
//!     }),
//! ))?;
//! let reply = platform
//!     .post_office()
//!     .request(Envelope::to_route("hello.world").with_body(111), Duration::from_millis(500))
//!     .await?;
//! assert_eq!(reply.body.as_i64(), Some(111));
//! # Ok(())
//! # }
//! ```

pub mod config;
mod distributed_trace;
pub mod error;
pub mod handler;
pub mod lifecycle;
mod pending;
pub mod platform;
pub mod post_office;
pub mod pubsub;
pub mod registry;
mod scheduler;
pub mod telemetry;
pub mod trace;
mod worker;

pub use config::PlatformConfig;
pub use error::{PubSubError, RouteError};
pub use handler::{handler_fn, EventHandler, Output, Payload};
pub use lifecycle::{RouteState, SlotState};
pub use platform::Platform;
pub use post_office::{PostOffice, ReplyFuture};
pub use pubsub::{LocalPubSub, PubSub, PubSubProvider};
pub use registry::{Capabilities, ServiceDef, Visibility};
pub use telemetry::{init_tracing, LogFormat};
pub use trace::TraceContext;
