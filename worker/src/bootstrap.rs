//! Worker bootstrap: environment grooming and extension resolution.
//!
//! The module search path never inherits anything from the host
//! process; it is rebuilt from the `--sys-path` entries plus the worker
//! executable's own directory, so modules belonging to the host's
//! installation cannot be resolved by accident. The OS library search
//! path gets the `--env-path` entries and `HOST_CWD` prepended before
//! the extension is constructed.

use crate::config::RunSettings;
use commons::dispatch::{Dispatchable, ExtensionContext};
use commons::prelude_errors::*;
use commons::registry::ExtensionRegistry;
use commons::{Value, ValueMap};
use libloading::{Library, Symbol};
use log::{debug, info};
use std::collections::HashSet;
use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Symbol an extension cdylib must export: a
/// `fn(&ExtensionContext) -> anyhow::Result<Box<dyn Dispatchable>>`
/// building the extension instance.
pub const EXTENSION_ENTRY_SYMBOL: &[u8] = b"bridge_extension_new";

/// Signature of the cdylib entry point.
pub type ExtensionEntry = fn(&ExtensionContext) -> Fallible<Box<dyn Dispatchable>>;

const LIBRARY_PATH_VAR: &str = if cfg!(windows) { "PATH" } else { "LD_LIBRARY_PATH" };

/// Groom the environment and construct the extension named by the
/// settings: a registered name takes precedence, otherwise the module
/// is resolved as a cdylib on the module search path.
pub fn build_extension(
    settings: &RunSettings,
    registry: &ExtensionRegistry,
) -> Fallible<Box<dyn Dispatchable>> {
    prepare_library_path(settings);
    let context = ExtensionContext {
        host: settings.host.to_string(),
        port: settings.port,
        options: settings.options.clone(),
    };
    if registry.contains(&settings.module) {
        info!("building registered extension '{}'", settings.module);
        return registry.build(&settings.module, &context);
    }
    let search = module_search_path(settings);
    let path = resolve_module(&settings.module, &search).ok_or_else(|| {
        anyhow!(
            "'{}' is neither a registered extension (have: {:?}) nor a module file on the search path",
            settings.module,
            registry.names()
        )
    })?;
    info!("loading extension module {:?}", path);
    load_module(&path, &context)
}

fn prepare_library_path(settings: &RunSettings) {
    let host_cwd = env::var_os("HOST_CWD").map(PathBuf::from);
    let merged = merge_search_path(
        &settings.env_path,
        host_cwd,
        env::var_os(LIBRARY_PATH_VAR).as_deref(),
    );
    if merged.is_empty() {
        return;
    }
    if let Ok(joined) = env::join_paths(&merged) {
        debug!("{} set to {:?}", LIBRARY_PATH_VAR, joined);
        env::set_var(LIBRARY_PATH_VAR, joined);
    }
}

/// Prepend `prepend` and the host's working directory to an existing
/// search path, dropping duplicates while keeping first occurrences.
fn merge_search_path(
    prepend: &[PathBuf],
    host_cwd: Option<PathBuf>,
    existing: Option<&OsStr>,
) -> Vec<PathBuf> {
    let mut merged: Vec<PathBuf> = prepend.to_vec();
    merged.extend(host_cwd);
    if let Some(existing) = existing {
        merged.extend(env::split_paths(existing));
    }
    let mut seen = HashSet::new();
    merged.retain(|entry| seen.insert(entry.clone()));
    merged
}

fn module_search_path(settings: &RunSettings) -> Vec<PathBuf> {
    let mut search = settings.sys_path.clone();
    if let Ok(me) = env::current_exe() {
        if let Some(dir) = me.parent() {
            search.push(dir.to_path_buf());
        }
    }
    search
}

fn resolve_module(module: &str, search: &[PathBuf]) -> Option<PathBuf> {
    let direct = Path::new(module);
    if direct.is_file() {
        return Some(direct.to_path_buf());
    }
    if direct.is_absolute() {
        return None;
    }
    search
        .iter()
        .map(|dir| dir.join(module))
        .find(|candidate| candidate.is_file())
}

/// Keeps the library mapped for as long as the extension lives; the
/// extension is dropped first.
struct LoadedModule {
    inner: Box<dyn Dispatchable>,
    _library: Library,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule").finish_non_exhaustive()
    }
}

impl Dispatchable for LoadedModule {
    fn invoke(
        &mut self,
        method: &str,
        args: &[Value],
        kwargs: &ValueMap,
    ) -> Result<Value, commons::dispatch::DispatchError> {
        self.inner.invoke(method, args, kwargs)
    }

    fn before_shutdown(&mut self) -> Value {
        self.inner.before_shutdown()
    }
}

fn load_module(path: &Path, context: &ExtensionContext) -> Fallible<Box<dyn Dispatchable>> {
    let library = unsafe { Library::new(path) }
        .with_context(|| format!("could not load extension module {:?}", path))?;
    let inner = unsafe {
        let entry: Symbol<ExtensionEntry> =
            library.get(EXTENSION_ENTRY_SYMBOL).with_context(|| {
                format!("module {:?} does not export the extension entry point", path)
            })?;
        entry(context)?
    };
    Ok(Box::new(LoadedModule {
        inner,
        _library: library,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(entries: &[&str]) -> Vec<PathBuf> {
        entries.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn prepended_entries_come_first() {
        let existing = env::join_paths(vec!["/usr/lib", "/opt/lib"]).unwrap();
        let merged = merge_search_path(
            &paths(&["/bridge/lib"]),
            Some(PathBuf::from("/host/cwd")),
            Some(existing.as_os_str()),
        );
        assert_eq!(
            merged,
            paths(&["/bridge/lib", "/host/cwd", "/usr/lib", "/opt/lib"])
        );
    }

    #[test]
    fn duplicates_keep_their_first_occurrence() {
        let existing = env::join_paths(vec!["/bridge/lib", "/usr/lib"]).unwrap();
        let merged = merge_search_path(&paths(&["/bridge/lib"]), None, Some(existing.as_os_str()));
        assert_eq!(merged, paths(&["/bridge/lib", "/usr/lib"]));
    }

    #[test]
    fn empty_inputs_merge_to_nothing() {
        assert!(merge_search_path(&[], None, None).is_empty());
    }

    #[test]
    fn modules_resolve_against_the_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("libdemo.so");
        std::fs::write(&module, b"not really a library").unwrap();

        let found = resolve_module("libdemo.so", &[dir.path().to_path_buf()]);
        assert_eq!(found, Some(module.clone()));

        let direct = resolve_module(module.to_str().unwrap(), &[]);
        assert_eq!(direct, Some(module));

        assert_eq!(resolve_module("libghost.so", &[dir.path().to_path_buf()]), None);
        assert_eq!(resolve_module("/absolute/libghost.so", &[]), None);
    }

    #[test]
    fn fake_module_files_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("libfake.so");
        std::fs::write(&module, b"not a shared object").unwrap();
        let context = ExtensionContext {
            host: "127.0.0.1".to_string(),
            port: 1,
            options: Default::default(),
        };
        assert!(load_module(&module, &context).is_err());
    }
}
