use std::time::Duration;

use crate::protocol::RequestId;

/// Errors surfaced by the bridge to HTTP callers and to the binary.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Request timeout: no response for {id} after {after:?}")]
    Timeout { id: RequestId, after: Duration },

    #[error("Request id {0} is already in flight")]
    DuplicateRequestId(RequestId),

    #[error("Failed to write request upstream: {0}")]
    UpstreamWrite(#[source] std::io::Error),

    #[error("Upstream connection closed before a response arrived")]
    UpstreamClosed,

    #[error("Bridge is shutting down")]
    ShuttingDown,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Errors that end one request without saying anything about the link itself.
    pub fn is_per_request(&self) -> bool {
        matches!(
            self,
            BridgeError::Timeout { .. }
                | BridgeError::DuplicateRequestId(_)
                | BridgeError::InvalidRequest(_)
        )
    }
}
