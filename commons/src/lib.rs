//! Building blocks shared by both ends of the bridge.
//!
//! The host-side facade and the worker runtime agree on everything in this
//! crate: the wire value model and codec, the request/response frames, the
//! fault taxonomy, the dispatch interface extensions implement, and the
//! small utilities (port allocation, CLI options encoding) both sides need.

#![deny(missing_docs)]

pub mod codec;
pub mod dispatch;
mod errors;
pub mod options;
pub mod port;
pub mod registry;
pub mod rpc;
pub mod testing;
mod value;

pub use crate::errors::BridgeError;
pub use crate::value::{Record, Value, ValueMap};

/// Error-handling prelude.
pub mod prelude_errors {
    pub use crate::errors::BridgeError;
    pub use anyhow::{anyhow, bail, ensure, Context, Error, Result as Fallible};
}
