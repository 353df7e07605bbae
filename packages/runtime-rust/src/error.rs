use relay_core::{Envelope, ErrorInfo, RouteNameError};

/// Errors returned by the registry and the post office.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid route {route}: {reason}")]
    InvalidRoute {
        route: String,
        #[source]
        reason: RouteNameError,
    },
    #[error("invalid handler for {route}: {reason}")]
    InvalidHandler { route: String, reason: String },
    #[error("route {route} not found")]
    RouteNotFound { route: String },
    #[error("{route} timeout for {timeout_ms} ms")]
    Timeout { route: String, timeout_ms: u64 },
    /// The callee replied with a failure status.
    #[error("{message}")]
    Application {
        status: u16,
        message: String,
        #[source]
        cause: Option<ErrorInfo>,
    },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RouteError {
    /// Status code equivalent, for callers that need to answer over a wire.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            RouteError::InvalidRoute { .. } | RouteError::InvalidHandler { .. } => 400,
            RouteError::RouteNotFound { .. } => 404,
            RouteError::Timeout { .. } => relay_core::STATUS_TIMEOUT,
            RouteError::Application { status, .. } => *status,
            RouteError::Internal(_) => relay_core::STATUS_INTERNAL,
        }
    }

    /// Builds an application error from a failure reply.
    ///
    /// The message is the outermost link of the transported chain when there
    /// is one, so the caller sees the error the handler raised.
    #[must_use]
    pub fn from_reply(reply: &Envelope) -> Self {
        let message = match &reply.error {
            Some(info) => info.message.clone(),
            None => reply.error_message().unwrap_or_default(),
        };
        RouteError::Application {
            status: reply.status,
            message,
            cause: reply.error.clone(),
        }
    }

    pub(crate) fn not_found(route: &str) -> Self {
        RouteError::RouteNotFound {
            route: route.to_string(),
        }
    }
}

/// Errors from the pub/sub facade.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("pub/sub is not enabled")]
    NotEnabled,
    #[error("pub/sub provider is already enabled")]
    AlreadyEnabled,
    #[error("topic {0} does not exist")]
    TopicNotFound(String),
    #[error("invalid topic {topic}: {reason}")]
    InvalidTopic { topic: String, reason: String },
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("provider error: {0}")]
    Provider(#[from] anyhow::Error),
}
