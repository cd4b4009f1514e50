use serde::Serialize;

/// Read-only snapshot of the relay client, rebroadcast on every change
/// to the connection, the queues, or the processing flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayState {
    /// A session key is present, the connection is not broken, and no
    /// connection-level error is recorded.
    pub connected: bool,
    /// A batch round is currently in flight.
    pub processing: bool,
    /// Text of the last connection-level failure, cleared by the next
    /// successful round.
    pub error: Option<String>,
    /// Effective delay between batch rounds, in milliseconds.
    pub poll_interval_ms: u64,
    /// Calls waiting to be submitted to the relay.
    pub pending: usize,
    /// Calls the relay has accepted but not yet finished.
    pub active: usize,
    /// Delivered results awaiting acknowledgement.
    pub completed: usize,
}
