//! Error types that travel inside envelopes.
//!
//! Handlers fail with `anyhow::Error`. Before a failure crosses a route
//! boundary it is flattened into an [`ErrorInfo`] chain, which is
//! serializable and still implements `std::error::Error` so the receiving
//! side can walk `source()` exactly like the original chain.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status used when a failure carries no better classification.
pub const STATUS_INTERNAL: u16 = 500;
/// Status for invalid-argument and IO-class failures.
pub const STATUS_BAD_REQUEST: u16 = 400;
/// Status of an empty reply envelope that simulates a read timeout.
pub const STATUS_TIMEOUT: u16 = 408;

/// Application error with an explicit status code chosen by the handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AppError {
    pub status: u16,
    pub message: String,
}

impl AppError {
    #[must_use]
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Rejected input. Classified as status 400.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct InvalidArgument {
    pub message: String,
    #[source]
    source: Option<BoxError>,
}

impl InvalidArgument {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Invalid argument caused by a lower-level failure.
    #[must_use]
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Coarse class of one link in a transported error chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An [`AppError`]; the link keeps its status.
    Application,
    /// An [`InvalidArgument`].
    InvalidArgument,
    /// A `std::io::Error`.
    Io,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    fn classify(err: &(dyn std::error::Error + 'static)) -> (Self, Option<u16>) {
        if let Some(app) = err.downcast_ref::<AppError>() {
            (ErrorKind::Application, Some(app.status))
        } else if err.is::<InvalidArgument>() {
            (ErrorKind::InvalidArgument, None)
        } else if err.is::<std::io::Error>() {
            (ErrorKind::Io, None)
        } else if let Some(info) = err.downcast_ref::<ErrorInfo>() {
            (info.kind, info.status)
        } else {
            (ErrorKind::Internal, None)
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Application => "application",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Serializable snapshot of an error chain.
///
/// The outermost error is the root of this struct; `cause` points one level
/// deeper. Nesting is preserved, never flattened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Present only for [`ErrorKind::Application`] links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[source]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            cause: None,
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Captures the full `anyhow` chain, outermost first.
    ///
    /// The outermost link is classified through `anyhow`'s own downcast so
    /// that errors attached with `.context(..)` keep their kind. A downcast
    /// that only finds the type one level down is left to that level.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let links: Vec<&(dyn std::error::Error + 'static)> = err.chain().collect();
        let mut info = Self::from_links(&links);
        let (kind, status) = if let Some(app) = err.downcast_ref::<AppError>() {
            (ErrorKind::Application, Some(app.status))
        } else if err.downcast_ref::<InvalidArgument>().is_some() {
            (ErrorKind::InvalidArgument, None)
        } else if err.downcast_ref::<std::io::Error>().is_some() {
            (ErrorKind::Io, None)
        } else {
            return info;
        };
        let inherited = info.cause.as_deref().is_some_and(|c| c.kind == kind);
        if info.kind == ErrorKind::Internal && !inherited {
            info.kind = kind;
            info.status = status;
        }
        info
    }

    /// Captures a plain `std::error::Error` and all of its sources.
    #[must_use]
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut links = vec![err];
        let mut current = err.source();
        while let Some(next) = current {
            links.push(next);
            current = next.source();
        }
        Self::from_links(&links)
    }

    fn from_links(links: &[&(dyn std::error::Error + 'static)]) -> Self {
        let mut built: Option<ErrorInfo> = None;
        for link in links.iter().rev() {
            let (kind, status) = ErrorKind::classify(*link);
            built = Some(ErrorInfo {
                kind,
                message: link.to_string(),
                status,
                cause: built.map(Box::new),
            });
        }
        built.unwrap_or_else(|| ErrorInfo::new(ErrorKind::Internal, "unknown error"))
    }

    /// Deepest link of the chain.
    #[must_use]
    pub fn root_cause(&self) -> &ErrorInfo {
        let mut current = self;
        while let Some(next) = current.cause.as_deref() {
            current = next;
        }
        current
    }

    /// Reply status for a failure whose chain is `self`.
    ///
    /// Decided by the root cause: an application error keeps its status,
    /// invalid-argument and IO failures map to 400, anything else to 500.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        let root = self.root_cause();
        match root.kind {
            ErrorKind::Application => root.status.unwrap_or(STATUS_INTERNAL),
            ErrorKind::InvalidArgument | ErrorKind::Io => STATUS_BAD_REQUEST,
            ErrorKind::Internal => STATUS_INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn app_error_keeps_status() {
        let err = anyhow::Error::new(AppError::new(409, "conflict"));
        let info = ErrorInfo::from_anyhow(&err);
        assert_eq!(info.kind, ErrorKind::Application);
        assert_eq!(info.status_code(), 409);
        assert_eq!(info.message, "conflict");
    }

    #[test]
    fn invalid_argument_maps_to_400() {
        let err = anyhow::Error::new(InvalidArgument::new("bad"));
        assert_eq!(ErrorInfo::from_anyhow(&err).status_code(), 400);
    }

    #[test]
    fn io_error_maps_to_400() {
        let err = anyhow::Error::new(std::io::Error::other("disk"));
        let info = ErrorInfo::from_anyhow(&err);
        assert_eq!(info.kind, ErrorKind::Io);
        assert_eq!(info.status_code(), 400);
    }

    #[test]
    fn unknown_error_maps_to_500() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(ErrorInfo::from_anyhow(&err).status_code(), 500);
    }

    #[test]
    fn nested_chain_is_preserved() {
        let err = anyhow::Error::new(std::io::Error::other("sql error"))
            .context(InvalidArgument::new("hello world"));
        let info = ErrorInfo::from_anyhow(&err);

        assert_eq!(info.kind, ErrorKind::InvalidArgument);
        assert_eq!(info.message, "hello world");
        let nested = info.source().expect("nested cause");
        assert_eq!(nested.to_string(), "sql error");
        assert_eq!(info.root_cause().kind, ErrorKind::Io);
    }

    #[test]
    fn invalid_argument_with_source_nests_one_level() {
        let err = anyhow::Error::new(InvalidArgument::with_source(
            "hello world",
            std::io::Error::other("sql error"),
        ));
        let info = ErrorInfo::from_anyhow(&err);
        assert_eq!(info.kind, ErrorKind::InvalidArgument);
        let nested = info.cause.as_deref().expect("nested cause");
        assert_eq!(nested.kind, ErrorKind::Io);
        assert_eq!(nested.message, "sql error");
    }

    #[test]
    fn status_is_decided_by_root_cause() {
        let err = anyhow::Error::new(AppError::new(403, "denied")).context("while loading");
        let info = ErrorInfo::from_anyhow(&err);
        assert_eq!(info.kind, ErrorKind::Internal);
        assert_eq!(info.message, "while loading");
        assert_eq!(info.status_code(), 403);
    }

    #[test]
    fn round_trips_through_json() {
        let info = ErrorInfo::new(ErrorKind::InvalidArgument, "outer")
            .with_cause(ErrorInfo::new(ErrorKind::Io, "inner"));
        let json = serde_json::to_string(&info).unwrap();
        let back: ErrorInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
