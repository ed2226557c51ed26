use std::fmt::Debug;

/// The result of talking to a chain endpoint.
pub type ChainResult<T> = Result<T, ChainRpcError>;

/// Errors returned when reading from a chain RPC endpoint.
///
/// Classification is by effect, not by type: [`ChainRpcError::is_transient`]
/// decides whether the retry layer may try again or must fail immediately.
#[derive(Debug, thiserror::Error)]
pub enum ChainRpcError {
    /// Connection-level failure (DNS, TLS, reset, ...).
    #[error("transport error: {0}")]
    Transport(String),
    /// Request exceeded its per-call timeout.
    #[error("request timed out")]
    Timeout,
    /// Non-success HTTP status from the endpoint.
    #[error("http status {0}")]
    HttpStatus(u16),
    /// JSON-RPC level error returned by the node.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the node.
        message: String,
    },
    /// The endpoint answered with something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ChainRpcError {
    /// Whether the retry layer should try this request again.
    ///
    /// Network faults and 429/5xx answers are transient; 400/403/404 and
    /// malformed payloads are permanent. Node-side JSON-RPC errors are
    /// retried for read calls, matching how upstream providers behave under
    /// load shedding.
    pub fn is_transient(&self) -> bool {
        match self {
            ChainRpcError::Transport(_) | ChainRpcError::Timeout => true,
            ChainRpcError::HttpStatus(code) => matches!(code, 429 | 500 | 502 | 503 | 504),
            ChainRpcError::Rpc { .. } => true,
            ChainRpcError::InvalidResponse(_) => false,
        }
    }

    /// Convenience constructor for invalid-payload failures.
    pub fn invalid<E: Debug>(err: E) -> Self {
        ChainRpcError::InvalidResponse(format!("{err:?}"))
    }
}

/// Errors surfaced by a [`crate::FlowStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced flow does not exist.
    #[error("flow not found")]
    NotFound,
    /// Backend failure (connection, constraint, serialization).
    #[error("store error: {0}")]
    Backend(String),
}

/// The result of a flow-store operation.
pub type StoreResult<T> = Result<T, StoreError>;
