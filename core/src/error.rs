//! Error types for the VAYLA bus

use thiserror::Error;

/// Error reported by a subscriber callback
///
/// Subscribers return `Result<(), HandlerError>`; an `Err` is caught by the
/// bus, counted, surfaced through the error listeners, and never interrupts
/// delivery to the remaining subscribers.
///
/// # Example
///
/// ```
/// use vayla_core::HandlerError;
///
/// fn handle() -> Result<(), HandlerError> {
///     Err(HandlerError::new("downstream unavailable"))
/// }
/// assert_eq!(handle().unwrap_err().to_string(), "downstream unavailable");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a handler error from any displayable cause
    pub fn new(cause: impl std::fmt::Display) -> Self {
        Self(cause.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Main error type for bus and routing operations
///
/// Each variant carries a stable string code (see [`BusError::code`]) that
/// collaborators can match on without depending on the Rust enum layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Message failed structural validation (topic grammar, empty client id)
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Serialized envelope exceeds the configured limit
    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge {
        /// Serialized envelope size
        size: usize,
        /// Configured `max_message_size`
        max: usize,
    },

    /// Serialized payload exceeds the configured limit
    #[error("payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge {
        /// Serialized payload size
        size: usize,
        /// Configured `max_payload_size`
        max: usize,
    },

    /// Publisher exceeded its per-second budget; the message was dropped
    #[error("client '{client}' exceeded its publish rate limit")]
    RateLimitExceeded {
        /// Offending client id
        client: String,
    },

    /// Global wildcard subscriptions are disabled by configuration
    #[error("global wildcard subscriptions are disabled")]
    WildcardDisabled,

    /// A subscriber callback failed during dispatch (isolated, reported)
    #[error("subscriber for '{pattern}' failed on '{topic}': {cause}")]
    SubscriptionHandler {
        /// Pattern the failing subscription was registered under
        pattern: String,
        /// Topic of the message being delivered
        topic: String,
        /// Callback error text
        cause: String,
    },

    /// Route definition rejected at registration time
    #[error("invalid route: {0}")]
    RouteInvalid(String),

    /// Route id does not exist
    #[error("no route with id '{0}'")]
    RouteNotFound(String),

    /// Predicate could not be evaluated (isolated, reported)
    #[error("predicate error in route '{route}': {cause}")]
    PredicateError {
        /// Route name or id
        route: String,
        /// Failure detail
        cause: String,
    },

    /// Transform function id is not registered
    #[error("no transform registered under '{0}'")]
    TransformNotFound(String),

    /// Transform failed or produced an invalid envelope (isolated, reported)
    #[error("transform error in route '{route}': {cause}")]
    TransformError {
        /// Route name or id
        route: String,
        /// Failure detail
        cause: String,
    },

    /// An action failed during execution (isolated, reported)
    #[error("action error in route '{route}': {cause}")]
    ActionError {
        /// Route name or id
        route: String,
        /// Failure detail
        cause: String,
    },

    /// CALL handler id is not registered
    #[error("no handler registered under '{0}'")]
    HandlerNotFound(String),

    /// No matching reply arrived within the request timeout
    #[error("request on '{topic}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Request topic
        topic: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },
}

impl BusError {
    /// Stable string code for this error
    ///
    /// These codes are the cross-language contract; matching on them is
    /// safer for collaborators than matching enum variants.
    pub fn code(&self) -> &'static str {
        match self {
            BusError::InvalidMessage(_) => "MESSAGE_INVALID",
            BusError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            BusError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            BusError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            BusError::WildcardDisabled => "WILDCARD_DISABLED",
            BusError::SubscriptionHandler { .. } => "SUBSCRIPTION_HANDLER_ERROR",
            BusError::RouteInvalid(_) => "ROUTE_INVALID",
            BusError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            BusError::PredicateError { .. } => "PREDICATE_ERROR",
            BusError::TransformNotFound(_) => "TRANSFORM_NOT_FOUND",
            BusError::TransformError { .. } => "TRANSFORM_ERROR",
            BusError::ActionError { .. } => "ACTION_ERROR",
            BusError::HandlerNotFound(_) => "HANDLER_NOT_FOUND",
            BusError::RequestTimeout { .. } => "REQUEST_TIMEOUT",
        }
    }
}
