//! Dispatch interface between the worker runtime and user extensions.
//!
//! Extension authors either implement [`Dispatchable`] directly or build a
//! [`MethodTable`] at construction time and wrap their state in a
//! [`TableExtension`], which resolves names the standard way: a
//! registered method is invoked with the decoded arguments, a registered
//! attribute read back when no arguments were supplied, and anything else
//! reported as missing.

use crate::rpc::{FaultFrame, Request, Response};
use crate::value::{Value, ValueMap};
use anyhow::Result as Fallible;
use log::{debug, warn};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Distinguished pseudo-method triggering orderly worker shutdown.
pub const SHUTDOWN_METHOD: &str = "__shutdown__";

/// Distinguished no-op pseudo-method, used as the readiness warm-up.
pub const PING_METHOD: &str = "__ping__";

/// Host address literal selecting mock mode instead of a worker process.
pub const MOCK_HOST: &str = "none";

/// What an extension is constructed with.
#[derive(Clone, Debug)]
pub struct ExtensionContext {
    /// Address the worker serves on, or [`MOCK_HOST`] in mock mode.
    pub host: String,
    /// Port the worker serves on; 0 in mock mode.
    pub port: u16,
    /// User options, string-valued because they travel through argv.
    pub options: std::collections::BTreeMap<String, String>,
}

impl ExtensionContext {
    /// True when the extension runs in the host process (mock mode).
    pub fn is_mock(&self) -> bool {
        self.host == MOCK_HOST
    }
}

/// The capability surface a worker exposes remotely.
pub trait Dispatchable: Send + std::fmt::Debug {
    /// Resolve `method` and produce its value.
    fn invoke(
        &mut self,
        method: &str,
        args: &[Value],
        kwargs: &ValueMap,
    ) -> Result<Value, DispatchError>;

    /// Hook run on orderly shutdown; its return value is included in the
    /// shutdown response.
    fn before_shutdown(&mut self) -> Value {
        Value::Unit
    }
}

/// Why a name could not be dispatched.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The name resolved to nothing.
    #[error("no attribute named '{0}'")]
    AttributeMissing(String),
    /// The user's method failed.
    #[error("{type_name}: {message}")]
    Failed {
        /// Error type name, a plain identifier.
        type_name: String,
        /// Error message.
        message: String,
        /// Formatted error chain.
        traceback: String,
    },
}

impl DispatchError {
    /// Convert a user method's error, preserving a [`NamedError`] type
    /// name when one is present in the chain.
    pub fn from_user_error(err: anyhow::Error) -> Self {
        let type_name = err
            .downcast_ref::<NamedError>()
            .map(|named| named.type_name.clone())
            .unwrap_or_else(|| "Error".to_string());
        DispatchError::Failed {
            type_name,
            message: err.to_string(),
            traceback: format!("{:?}", err),
        }
    }
}

/// An error carrying an explicit remote type name.
///
/// User methods that want a recognisable identifier on the host side
/// return this instead of a bare message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct NamedError {
    /// Identifier surfaced to the host as the remote error type.
    pub type_name: String,
    /// Error message.
    pub message: String,
}

impl NamedError {
    /// Create a named error.
    pub fn new<T: Into<String>, M: Into<String>>(type_name: T, message: M) -> Self {
        NamedError {
            type_name: type_name.into(),
            message: message.into(),
        }
    }
}

type Method<T> = Box<dyn Fn(&mut T, &[Value], &ValueMap) -> Fallible<Value> + Send>;
type Attribute<T> = Box<dyn Fn(&T) -> Value + Send>;
type ShutdownHook<T> = Box<dyn Fn(&mut T) -> Value + Send>;

/// Registered-methods table built once at extension construction.
pub struct MethodTable<T> {
    methods: HashMap<String, Method<T>>,
    attributes: HashMap<String, Attribute<T>>,
}

impl<T> Default for MethodTable<T> {
    fn default() -> Self {
        MethodTable::new()
    }
}

impl<T> MethodTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        MethodTable {
            methods: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    /// Register a callable method.
    pub fn method<F>(&mut self, name: &str, body: F) -> &mut Self
    where
        F: Fn(&mut T, &[Value], &ValueMap) -> Fallible<Value> + Send + 'static,
    {
        self.methods.insert(name.to_string(), Box::new(body));
        self
    }

    /// Register a non-callable attribute; reads return its current value.
    pub fn attribute<F>(&mut self, name: &str, read: F) -> &mut Self
    where
        F: Fn(&T) -> Value + Send + 'static,
    {
        self.attributes.insert(name.to_string(), Box::new(read));
        self
    }
}

/// The default dispatcher: user state plus its method table.
pub struct TableExtension<T: Send> {
    state: T,
    table: MethodTable<T>,
    shutdown_hook: Option<ShutdownHook<T>>,
}

impl<T: Send> TableExtension<T> {
    /// Wrap `state` with its registered methods.
    pub fn new(state: T, table: MethodTable<T>) -> Self {
        TableExtension {
            state,
            table,
            shutdown_hook: None,
        }
    }

    /// Install a hook run on orderly shutdown.
    pub fn with_shutdown_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut T) -> Value + Send + 'static,
    {
        self.shutdown_hook = Some(Box::new(hook));
        self
    }

    /// Borrow the wrapped state.
    pub fn state(&self) -> &T {
        &self.state
    }
}

impl<T: Send> std::fmt::Debug for TableExtension<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableExtension").finish_non_exhaustive()
    }
}

impl<T: Send> Dispatchable for TableExtension<T> {
    fn invoke(
        &mut self,
        method: &str,
        args: &[Value],
        kwargs: &ValueMap,
    ) -> Result<Value, DispatchError> {
        if let Some(body) = self.table.methods.get(method) {
            return body(&mut self.state, args, kwargs).map_err(DispatchError::from_user_error);
        }
        if let Some(read) = self.table.attributes.get(method) {
            if args.is_empty() && kwargs.is_empty() {
                return Ok(read(&self.state));
            }
            return Err(DispatchError::Failed {
                type_name: "Error".to_string(),
                message: format!("attribute '{}' is not callable", method),
                traceback: String::new(),
            });
        }
        Err(DispatchError::AttributeMissing(method.to_string()))
    }

    fn before_shutdown(&mut self) -> Value {
        match &self.shutdown_hook {
            Some(hook) => hook(&mut self.state),
            None => Value::Unit,
        }
    }
}

/// Execute one request against an extension.
///
/// Shared by the worker's request handler and by mock mode, so both paths
/// fault identically. Panics inside the user's method are captured and
/// reported as user faults.
pub fn dispatch(extension: &mut dyn Dispatchable, request: &Request) -> Response {
    if request.method.is_empty() {
        return Response::Fault(FaultFrame::protocol("empty method name"));
    }
    if request.method == PING_METHOD {
        return Response::Ok(Value::Unit);
    }
    debug!("dispatching request #{} '{}'", request.seq, request.method);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        extension.invoke(&request.method, &request.args, &request.kwargs)
    }));
    match outcome {
        Ok(Ok(value)) => Response::Ok(value),
        Ok(Err(DispatchError::AttributeMissing(name))) => {
            Response::Fault(FaultFrame::attribute_missing(name))
        }
        Ok(Err(DispatchError::Failed {
            type_name,
            message,
            traceback,
        })) => Response::Fault(FaultFrame::user(type_name, message, traceback)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(
                "request #{} '{}' panicked: {}",
                request.seq, request.method, message
            );
            Response::Fault(FaultFrame::user("panic", message, String::new()))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Positional and keyword argument accessors for method bodies.
pub mod params {
    use super::{Value, ValueMap};
    use anyhow::{anyhow, Result as Fallible};

    /// The `index`-th positional argument.
    pub fn arg<'a>(args: &'a [Value], index: usize) -> Fallible<&'a Value> {
        args.get(index)
            .ok_or_else(|| anyhow!("missing positional argument {}", index))
    }

    /// The `index`-th positional argument as an integer.
    pub fn int(args: &[Value], index: usize) -> Fallible<i64> {
        let value = arg(args, index)?;
        value
            .as_i64()
            .ok_or_else(|| anyhow!("argument {} must be an integer, got {}", index, value.kind()))
    }

    /// The `index`-th positional argument as a double.
    pub fn float(args: &[Value], index: usize) -> Fallible<f64> {
        let value = arg(args, index)?;
        value
            .as_f64()
            .ok_or_else(|| anyhow!("argument {} must be a double, got {}", index, value.kind()))
    }

    /// The `index`-th positional argument as text.
    pub fn text<'a>(args: &'a [Value], index: usize) -> Fallible<&'a str> {
        let value = arg(args, index)?;
        value
            .as_str()
            .ok_or_else(|| anyhow!("argument {} must be text, got {}", index, value.kind()))
    }

    /// The `index`-th positional argument as a sequence.
    pub fn list<'a>(args: &'a [Value], index: usize) -> Fallible<&'a [Value]> {
        let value = arg(args, index)?;
        value
            .as_list()
            .ok_or_else(|| anyhow!("argument {} must be a sequence, got {}", index, value.kind()))
    }

    /// The keyword argument `name`, when present.
    pub fn kwarg<'a>(kwargs: &'a ValueMap, name: &str) -> Option<&'a Value> {
        kwargs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;
    use anyhow::bail;

    struct Counter {
        total: i64,
    }

    fn extension() -> TableExtension<Counter> {
        let mut table = MethodTable::new();
        table
            .method("add", |state: &mut Counter, args, _| {
                state.total += params::int(args, 0)?;
                Ok(Value::from(state.total))
            })
            .method("fail", |_, args, _| -> Fallible<Value> {
                let message = params::text(args, 0).unwrap_or("boom").to_string();
                Err(NamedError::new("CounterError", message).into())
            })
            .method("fail_plain", |_, _, _| -> Fallible<Value> {
                bail!("plain failure")
            })
            .method("blow_up", |_, _, _| -> Fallible<Value> {
                panic!("kaboom");
            })
            .attribute("total", |state| Value::from(state.total));
        TableExtension::new(Counter { total: 0 }, table)
            .with_shutdown_hook(|state| Value::from(state.total))
    }

    fn request(method: &str, args: Vec<Value>) -> Request {
        Request::new(1, method, args, ValueMap::new())
    }

    #[test]
    fn methods_are_invoked_with_arguments() {
        let mut ext = extension();
        let response = dispatch(&mut ext, &request("add", vec![Value::from(5)]));
        assert_eq!(response, Response::Ok(Value::from(5)));
        let response = dispatch(&mut ext, &request("add", vec![Value::from(2)]));
        assert_eq!(response, Response::Ok(Value::from(7)));
    }

    #[test]
    fn attribute_reads_return_the_current_value() {
        let mut ext = extension();
        dispatch(&mut ext, &request("add", vec![Value::from(3)]));
        let response = dispatch(&mut ext, &request("total", Vec::new()));
        assert_eq!(response, Response::Ok(Value::from(3)));
    }

    #[test]
    fn attribute_with_arguments_is_a_user_fault() {
        let mut ext = extension();
        match dispatch(&mut ext, &request("total", vec![Value::from(1)])) {
            Response::Fault(frame) => {
                assert_eq!(frame.kind, crate::rpc::FaultKind::User);
                assert!(frame.message.contains("not callable"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn unknown_names_are_missing_attributes() {
        let mut ext = extension();
        match dispatch(&mut ext, &request("nope", Vec::new())) {
            Response::Fault(frame) => {
                assert_eq!(frame.kind, crate::rpc::FaultKind::AttributeMissing);
                assert_eq!(frame.message, "nope");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn named_errors_keep_their_type_name() {
        let mut ext = extension();
        match dispatch(&mut ext, &request("fail", vec![Value::from("oh no")])) {
            Response::Fault(frame) => {
                assert_eq!(frame.type_name, "CounterError");
                assert!(frame.message.contains("oh no"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn plain_errors_fall_back_to_a_generic_type_name() {
        let mut ext = extension();
        match dispatch(&mut ext, &request("fail_plain", Vec::new())) {
            Response::Fault(frame) => {
                assert_eq!(frame.type_name, "Error");
                assert!(frame.message.contains("plain failure"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn panics_become_user_faults() {
        let mut ext = extension();
        match dispatch(&mut ext, &request("blow_up", Vec::new())) {
            Response::Fault(frame) => {
                assert_eq!(frame.type_name, "panic");
                assert!(frame.message.contains("kaboom"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
        // the extension stays usable afterwards
        let response = dispatch(&mut ext, &request("add", vec![Value::from(1)]));
        assert_eq!(response, Response::Ok(Value::from(1)));
    }

    #[test]
    fn pings_do_not_reach_the_extension() {
        let mut ext = extension();
        assert_eq!(
            dispatch(&mut ext, &Request::ping(0)),
            Response::Ok(Value::Unit)
        );
    }

    #[test]
    fn empty_method_names_are_protocol_faults() {
        let mut ext = extension();
        match dispatch(&mut ext, &request("", Vec::new())) {
            Response::Fault(frame) => assert_eq!(frame.kind, crate::rpc::FaultKind::Protocol),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn shutdown_hook_value_is_returned() {
        let mut ext = extension();
        dispatch(&mut ext, &request("add", vec![Value::from(9)]));
        assert_eq!(ext.before_shutdown(), Value::from(9));
    }

    #[test]
    fn kwargs_are_visible_to_methods() {
        let mut table = MethodTable::new();
        table.method("greet", |_: &mut (), _, kwargs| {
            let name = params::kwarg(kwargs, "name")
                .and_then(Value::as_str)
                .unwrap_or("world");
            Ok(Value::from(format!("hello {}", name)))
        });
        let mut ext = TableExtension::new((), table);
        let req = Request::new(1, "greet", Vec::new(), value_map! {"name" => "bridge"});
        assert_eq!(
            dispatch(&mut ext, &req),
            Response::Ok(Value::from("hello bridge"))
        );
    }
}
