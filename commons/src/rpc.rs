//! Request and response frames.

use crate::value::{Value, ValueMap};
use serde::{Deserialize, Serialize};

/// One method invocation, as carried in one HTTP request body.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Request {
    /// Monotonic per-worker sequence number, for log correlation only.
    pub seq: u64,
    /// Method (or attribute) name to resolve on the extension.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: ValueMap,
}

impl Request {
    /// Create a request for `method` with the given arguments.
    pub fn new<S: Into<String>>(seq: u64, method: S, args: Vec<Value>, kwargs: ValueMap) -> Self {
        Request {
            seq,
            method: method.into(),
            args,
            kwargs,
        }
    }

    /// Create a no-op warm-up request.
    pub fn ping(seq: u64) -> Self {
        Request::new(seq, crate::dispatch::PING_METHOD, Vec::new(), ValueMap::new())
    }

    /// Create an orderly-shutdown request.
    pub fn shutdown(seq: u64) -> Self {
        Request::new(
            seq,
            crate::dispatch::SHUTDOWN_METHOD,
            Vec::new(),
            ValueMap::new(),
        )
    }
}

/// The outcome of one request, as carried in one HTTP response body.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Response {
    /// The method ran to completion and returned a value.
    Ok(Value),
    /// The method did not produce a value.
    Fault(FaultFrame),
}

/// Wire-level fault kinds, distinguishable by the caller.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FaultKind {
    /// The requested name does not exist on the extension.
    AttributeMissing,
    /// The extension's method returned an error or panicked.
    User,
    /// A frame could not be decoded (or a value encoded) on the worker.
    Codec,
    /// The request violated the transport contract.
    Protocol,
}

/// A structured failure response.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FaultFrame {
    /// What went wrong, by kind.
    pub kind: FaultKind,
    /// Remote error type name; empty unless `kind` is `User`.
    pub type_name: String,
    /// Human-readable message. For `AttributeMissing` this is the bare
    /// attribute name.
    pub message: String,
    /// Remote traceback text, opaque to the caller.
    pub traceback: String,
}

impl FaultFrame {
    /// Fault for a name that resolved to nothing.
    pub fn attribute_missing<S: Into<String>>(name: S) -> Self {
        FaultFrame {
            kind: FaultKind::AttributeMissing,
            type_name: String::new(),
            message: name.into(),
            traceback: String::new(),
        }
    }

    /// Fault for a failed user method.
    pub fn user<T, M, B>(type_name: T, message: M, traceback: B) -> Self
    where
        T: Into<String>,
        M: Into<String>,
        B: Into<String>,
    {
        FaultFrame {
            kind: FaultKind::User,
            type_name: type_name.into(),
            message: message.into(),
            traceback: traceback.into(),
        }
    }

    /// Fault for a frame the worker could not decode.
    pub fn codec<M: Into<String>>(message: M) -> Self {
        FaultFrame {
            kind: FaultKind::Codec,
            type_name: String::new(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    /// Fault for a request violating the transport contract.
    pub fn protocol<M: Into<String>>(message: M) -> Self {
        FaultFrame {
            kind: FaultKind::Protocol,
            type_name: String::new(),
            message: message.into(),
            traceback: String::new(),
        }
    }
}
