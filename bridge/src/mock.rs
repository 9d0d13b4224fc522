//! Mock mode: the extension lives in the host process.
//!
//! Selected with host `none`. Calls are routed straight into the shared
//! dispatch logic, skipping the codec and the transport entirely, so the
//! semantics match the remote path while return values need not be
//! serializable and no worker process exists.

use commons::dispatch::{Dispatchable, ExtensionContext, MOCK_HOST};
use commons::registry::ExtensionRegistry;
use commons::BridgeError;
use log::info;
use std::collections::BTreeMap;

pub(crate) fn instantiate(
    registry: &ExtensionRegistry,
    module: &str,
    options: &BTreeMap<String, String>,
) -> Result<Box<dyn Dispatchable>, BridgeError> {
    let context = ExtensionContext {
        host: MOCK_HOST.to_string(),
        port: 0,
        options: options.clone(),
    };
    let extension = registry
        .build(module, &context)
        .map_err(|err| BridgeError::WorkerStartFailed {
            reason: format!("could not build the mock extension: {:#}", err),
            stderr: String::new(),
        })?;
    info!("mock extension '{}' ready in-process", module);
    Ok(extension)
}
