// Error taxonomy for the session engine.
//
// Callers need to tell apart "your password is wrong" from "the network is
// down" from "that contact is not online", so every user-initiated operation
// returns one of these instead of a flattened error string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The server rejected the credentials. Terminal for the attempt; the
    /// user has to re-enter them.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Connectivity-level failure. Retryable by the caller; the engine does
    /// not retry on its own.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A session is already connected, or a connect is already in flight.
    #[error("a connection is already established or in progress")]
    AlreadyConnected,

    /// The operation needs a live session and there is none.
    #[error("not connected to a server")]
    NotConnected,

    /// The server rejected a roster get/set. Surfaced, never retried.
    #[error("roster operation rejected: {0}")]
    RosterOperation(String),

    /// The server rejected a vCard set.
    #[error("profile operation rejected: {0}")]
    ProfileOperation(String),

    /// A call was placed to a contact that is not online. Policy rejection,
    /// not a fault.
    #[error("{0} is not available for calls")]
    ContactUnavailable(String),

    /// A call attempt is already outstanding.
    #[error("another call attempt is already in progress")]
    CallInProgress,

    /// Cancel was requested with no outstanding attempt.
    #[error("no call attempt is in progress")]
    NoActiveCall,

    /// A payload we produced or consumed did not serialize/parse.
    #[error("malformed payload: {0}")]
    ProtocolParse(String),
}
