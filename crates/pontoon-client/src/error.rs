use thiserror::Error;

use crate::store::StoreError;
use crate::transport::TransportError;

/// Failures surfaced to widget code and embedders.
///
/// Failures scoped to a single call (`Rejected`, `Call`) only ever reach
/// that call's future. When the connection fails as a whole, outstanding
/// calls are rejected uniformly with [`RelayError::Reset`]; the richer
/// cause goes to whoever drove the failing operation.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay endpoint or client configuration was unusable.
    #[error("invalid relay configuration: {0}")]
    Config(String),
    /// The relay does not recognise the presented session key. The
    /// display text is the stable token callers match on.
    #[error("KEY_NOT_FOUND")]
    KeyNotFound,
    /// The relay reported a failure of its own in the response envelope.
    #[error("relay server failure: {0}")]
    Server(String),
    /// The session was reset while the call was outstanding.
    #[error("connection reset")]
    Reset,
    /// The call never made it into the relay's queue.
    #[error("call rejected: {0}")]
    Rejected(String),
    /// The relay executed the call and the host reported an error.
    #[error("call failed: {0}")]
    Call(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// The response matched neither recognised wire shape.
    #[error("malformed relay response: {0}")]
    Protocol(String),
    #[error("key store error: {0}")]
    Store(#[from] StoreError),
}

pub type RelayResult<T> = Result<T, RelayError>;
