//! CLI options and runtime settings assembly.

use commons::options::decode_options;
use commons::prelude_errors::*;
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use structopt::StructOpt;

/// Command-line grammar of the worker binary.
#[derive(Debug, StructOpt)]
pub struct Options {
    /// Address to bind
    #[structopt(short = "H", long = "host", default_value = "127.0.0.1")]
    pub host: Ipv4Addr,

    /// Port to bind
    #[structopt(short = "p", long = "port")]
    pub port: u16,

    /// Extension to load: a registry name or a cdylib path
    #[structopt(short = "m", long = "module")]
    pub module: String,

    /// Paths prepended to the module search path (platform separator)
    #[structopt(short = "s", long = "sys-path", parse(from_os_str))]
    pub sys_path: Option<OsString>,

    /// Paths prepended to the OS library search path (platform separator)
    #[structopt(short = "e", long = "env-path", parse(from_os_str))]
    pub env_path: Option<OsString>,

    /// User options as a length-prefixed encoded mapping
    #[structopt(short = "o", long = "options")]
    pub options: Option<String>,

    /// Requested object-codec protocol version
    #[structopt(short = "P", long = "protocol", default_value = "1")]
    pub protocol: u16,
}

/// Validated runtime settings assembled from [`Options`].
#[derive(Debug)]
pub struct RunSettings {
    /// Address to bind.
    pub host: Ipv4Addr,
    /// Port to bind.
    pub port: u16,
    /// Extension to load.
    pub module: String,
    /// Module search path entries.
    pub sys_path: Vec<PathBuf>,
    /// OS library search path entries.
    pub env_path: Vec<PathBuf>,
    /// Decoded user options.
    pub options: BTreeMap<String, String>,
    /// Requested object-codec protocol version.
    pub protocol: u16,
}

impl RunSettings {
    /// Validate and assemble runtime settings.
    pub fn assemble(options: Options) -> Fallible<Self> {
        ensure!(!options.module.is_empty(), "--module must not be empty");
        let user_options = match &options.options {
            Some(encoded) => decode_options(encoded).context("--options is malformed")?,
            None => BTreeMap::new(),
        };
        Ok(RunSettings {
            host: options.host,
            port: options.port,
            module: options.module,
            sys_path: split_path_list(options.sys_path),
            env_path: split_path_list(options.env_path),
            options: user_options,
            protocol: options.protocol,
        })
    }
}

fn split_path_list(list: Option<OsString>) -> Vec<PathBuf> {
    match list {
        Some(list) => env::split_paths(&list).collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        let mut argv = vec!["worker"];
        argv.extend_from_slice(args);
        Options::from_iter(argv)
    }

    #[test]
    fn minimal_invocation_assembles() {
        let settings =
            RunSettings::assemble(parse(&["--port", "5001", "--module", "demo"])).unwrap();
        assert_eq!(settings.host, Ipv4Addr::LOCALHOST);
        assert_eq!(settings.port, 5001);
        assert_eq!(settings.module, "demo");
        assert!(settings.sys_path.is_empty());
        assert!(settings.options.is_empty());
        assert_eq!(settings.protocol, commons::codec::DEFAULT_PROTOCOL);
    }

    #[test]
    fn short_forms_are_equivalent() {
        let settings = RunSettings::assemble(parse(&[
            "-H", "127.0.0.1", "-p", "5002", "-m", "demo", "-P", "1",
        ]))
        .unwrap();
        assert_eq!(settings.port, 5002);
        assert_eq!(settings.protocol, 1);
    }

    #[test]
    fn path_lists_split_on_the_platform_separator() {
        let joined = env::join_paths(vec!["/one", "/two"]).unwrap();
        let settings = RunSettings::assemble(parse(&[
            "--port",
            "5003",
            "--module",
            "demo",
            "--sys-path",
            joined.to_str().unwrap(),
        ]))
        .unwrap();
        assert_eq!(
            settings.sys_path,
            vec![PathBuf::from("/one"), PathBuf::from("/two")]
        );
    }

    #[test]
    fn user_options_are_decoded() {
        let settings = RunSettings::assemble(parse(&[
            "--port",
            "5004",
            "--module",
            "demo",
            "--options",
            "7:version2:12",
        ]))
        .unwrap();
        assert_eq!(settings.options.get("version"), Some(&"12".to_string()));
    }

    #[test]
    fn malformed_options_are_refused() {
        let err =
            RunSettings::assemble(parse(&["--port", "5005", "--module", "demo", "--options", "9:"]))
                .unwrap_err();
        assert!(format!("{:#}", err).contains("--options"));
    }
}
