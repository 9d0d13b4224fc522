//! Worker-side runtime.
//!
//! The binary built from this crate is what the host-side launcher
//! spawns: it parses the agreed CLI, grooms its environment, constructs
//! the user extension, and serves the loopback RPC endpoint until an
//! orderly shutdown request (or a signal) ends it.

pub mod bootstrap;
pub mod config;
pub mod demo;
pub mod server;

use commons::codec;
use commons::registry::ExtensionRegistry;
use std::io::Write;

/// The extensions compiled into the shipped worker binary.
pub fn default_registry() -> ExtensionRegistry {
    let mut registry = ExtensionRegistry::new();
    registry.register(demo::NAME, demo::build);
    registry
}

/// Run the worker to completion and return its exit code: 0 for an
/// orderly shutdown, 1 for a bootstrap failure, 2 for a server failure.
pub fn run(options: config::Options) -> i32 {
    let settings = match config::RunSettings::assemble(options) {
        Ok(settings) => settings,
        Err(err) => return bootstrap_failure(&err),
    };
    if !codec::is_supported(settings.protocol) {
        eprintln!(
            "error: {} {} (supported: {:?})",
            codec::UNSUPPORTED_PROTOCOL_MARKER,
            settings.protocol,
            codec::SUPPORTED_PROTOCOLS
        );
        let _ = std::io::stderr().flush();
        return 1;
    }
    let extension = match bootstrap::build_extension(&settings, &default_registry()) {
        Ok(extension) => extension,
        Err(err) => return bootstrap_failure(&err),
    };

    println!("worker listening on {}:{}", settings.host, settings.port);
    let _ = std::io::stdout().flush();

    match server::serve(settings, extension) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {:#}", err);
            let _ = std::io::stderr().flush();
            2
        }
    }
}

fn bootstrap_failure(err: &anyhow::Error) -> i32 {
    eprintln!("error: {:#}", err);
    let _ = std::io::stderr().flush();
    1
}
