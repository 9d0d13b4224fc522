//! Test helpers.

use anyhow::Result as Fallible;

/// Initialize logging for a test; safe to call repeatedly.
pub fn init_logger() -> Fallible<()> {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();
    Ok(())
}
