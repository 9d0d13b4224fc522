//! Fault taxonomy surfaced by the host-side facade.

use crate::codec::CodecError;
use crate::rpc::{FaultFrame, FaultKind};
use std::time::Duration;
use thiserror::Error;

/// Everything that can go wrong with a bridged call, one variant per
/// fault kind.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker process exited before readiness, or the readiness
    /// deadline elapsed. Fatal; the facade is unusable.
    #[error("worker failed to start: {reason}")]
    WorkerStartFailed {
        /// Why the start was abandoned.
        reason: String,
        /// Captured worker stderr up to the failure.
        stderr: String,
    },
    /// The worker refused the requested codec version during bootstrap.
    #[error("worker refused protocol version {requested} (worker supports: {supported})")]
    ProtocolVersionMismatch {
        /// Version the host advertised.
        requested: u16,
        /// Versions the worker reported, verbatim from its stderr.
        supported: String,
    },
    /// `call` was invoked after `shutdown`. Fatal.
    #[error("worker already stopped")]
    WorkerStopped,
    /// Network I/O failed during a call.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The request violated the transport contract (e.g. a frame over
    /// the body limit).
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A value could not be encoded or decoded under the negotiated
    /// protocol. Surfaced locally, without touching the wire.
    #[error("codec failure: {0}")]
    Codec(String),
    /// The remote name resolved to nothing on the extension.
    #[error("worker extension has no attribute named '{0}'")]
    AttributeMissing(String),
    /// The per-call deadline expired on the client side.
    #[error("remote call timed out after {elapsed:?}")]
    RemoteTimeout {
        /// The deadline that expired.
        elapsed: Duration,
    },
    /// The user's method raised. Carries the remote error verbatim.
    #[error("worker extension raised {type_name}: {message}")]
    User {
        /// Remote error type name, a plain identifier.
        type_name: String,
        /// Remote error message.
        message: String,
        /// Full remote traceback text, opaque to the caller.
        traceback: String,
    },
}

impl BridgeError {
    /// Stable identifier of the fault kind, for logs and assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::WorkerStartFailed { .. } => "worker-start-failed",
            BridgeError::ProtocolVersionMismatch { .. } => "protocol-version-mismatch",
            BridgeError::WorkerStopped => "worker-stopped",
            BridgeError::Transport(_) => "transport",
            BridgeError::Protocol(_) => "protocol",
            BridgeError::Codec(_) => "codec",
            BridgeError::AttributeMissing(_) => "attribute-missing",
            BridgeError::RemoteTimeout { .. } => "remote-timeout",
            BridgeError::User { .. } => "user",
        }
    }

    /// True for start-failure errors (including the protocol-mismatch
    /// subtype).
    pub fn is_start_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::WorkerStartFailed { .. } | BridgeError::ProtocolVersionMismatch { .. }
        )
    }
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        BridgeError::Codec(err.to_string())
    }
}

impl From<FaultFrame> for BridgeError {
    fn from(frame: FaultFrame) -> Self {
        match frame.kind {
            FaultKind::AttributeMissing => BridgeError::AttributeMissing(frame.message),
            FaultKind::User => BridgeError::User {
                type_name: frame.type_name,
                message: frame.message,
                traceback: frame.traceback,
            },
            FaultKind::Codec => BridgeError::Codec(frame.message),
            FaultKind::Protocol => BridgeError::Protocol(frame.message),
        }
    }
}
