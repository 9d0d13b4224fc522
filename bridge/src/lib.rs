//! Host-side half of the bridge.
//!
//! A [`Client`] owns one worker process hosting the foreign-bitness
//! library and exposes its extension methods as ordinary calls. The
//! pieces underneath are the worker launcher (process supervision and
//! stream capture), the loopback HTTP transport, and the in-process mock
//! backend selected with host `none`.

mod client;
mod launcher;
mod mock;
mod transport;

pub use crate::client::{Client, ClientBuilder, WorkerDescriptor};
pub use commons::dispatch::MOCK_HOST;
pub use commons::BridgeError;
