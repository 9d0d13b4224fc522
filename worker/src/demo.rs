//! The demo extension embedded in the shipped worker binary.
//!
//! Stands in for a real library wrapper: a handful of arithmetic and
//! string methods, an echo method, a version attribute, and a pair of
//! methods recording call order. The end-to-end suite drives the whole
//! bridge through it.

use commons::dispatch::{
    params, Dispatchable, ExtensionContext, MethodTable, NamedError, TableExtension,
};
use commons::prelude_errors::*;
use commons::Value;
use log::info;
use std::time::Duration;

/// Registry name of the demo extension.
pub const NAME: &str = "demo";

struct Demo {
    version: i64,
    history: Vec<Value>,
}

/// Build the demo extension.
pub fn build(context: &ExtensionContext) -> Fallible<Box<dyn Dispatchable>> {
    let version = match context.options.get("version") {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("option 'version' is not an integer: '{}'", raw))?,
        None => 7,
    };
    info!(
        "demo extension starting (host {}, port {}, version {})",
        context.host, context.port, version
    );

    let mut table = MethodTable::new();
    table
        .method("add", |_: &mut Demo, args, _| {
            Ok(Value::from(params::int(args, 0)? + params::int(args, 1)?))
        })
        .method("subtract", |_, args, _| {
            Ok(Value::from(params::float(args, 0)? - params::float(args, 1)?))
        })
        .method("scalar_multiply", |_, args, _| {
            let scalar = params::float(args, 0)?;
            let values = params::list(args, 1)?;
            let mut scaled = Vec::with_capacity(values.len());
            for (index, value) in values.iter().enumerate() {
                let x = value
                    .as_f64()
                    .ok_or_else(|| anyhow!("element {} must be a double, got {}", index, value.kind()))?;
                scaled.push(Value::from(scalar * x));
            }
            Ok(Value::List(scaled))
        })
        .method("reverse_string_v1", |_, args, _| {
            let text = params::text(args, 0)?;
            Ok(Value::from(text.chars().rev().collect::<String>()))
        })
        .method("send_data", |_, args, kwargs| {
            Ok(Value::List(vec![
                Value::List(args.to_vec()),
                Value::Map(kwargs.clone()),
            ]))
        })
        .method("record", |state, args, _| {
            state.history.push(params::arg(args, 0)?.clone());
            Ok(Value::Unit)
        })
        .method("fail", |_, args, _| -> Fallible<Value> {
            let message = params::text(args, 0).unwrap_or("deliberate demo failure");
            Err(NamedError::new("DemoError", message).into())
        })
        .method("sleep_ms", |_, args, _| {
            let millis = params::int(args, 0)?;
            ensure!(millis >= 0, "sleep duration must not be negative");
            std::thread::sleep(Duration::from_millis(millis as u64));
            Ok(Value::Unit)
        })
        .attribute("version", |state| Value::from(state.version))
        .attribute("history", |state| Value::List(state.history.clone()));

    let extension = TableExtension::new(
        Demo {
            version,
            history: Vec::new(),
        },
        table,
    )
    .with_shutdown_hook(|state| {
        info!("demo extension stopping after {} recorded calls", state.history.len());
        Value::from(state.history.len() as i64)
    });
    Ok(Box::new(extension))
}

#[cfg(test)]
mod tests {
    use super::*;
    use commons::dispatch::dispatch;
    use commons::rpc::{Request, Response};
    use commons::{values, ValueMap};

    fn demo() -> Box<dyn Dispatchable> {
        build(&ExtensionContext {
            host: "127.0.0.1".to_string(),
            port: 1,
            options: Default::default(),
        })
        .unwrap()
    }

    fn call(ext: &mut Box<dyn Dispatchable>, method: &str, args: Vec<Value>) -> Response {
        dispatch(ext.as_mut(), &Request::new(0, method, args, ValueMap::new()))
    }

    #[test]
    fn arithmetic_matches() {
        let mut ext = demo();
        assert_eq!(
            call(&mut ext, "add", values![3, 14]),
            Response::Ok(Value::from(17))
        );
        assert_eq!(
            call(&mut ext, "subtract", values![43.2, 3.2]),
            Response::Ok(Value::from(40.0))
        );
    }

    #[test]
    fn scalar_multiply_scales_every_element() {
        let mut ext = demo();
        let input = Value::List(values![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            call(&mut ext, "scalar_multiply", vec![Value::from(2.0), input]),
            Response::Ok(Value::List(values![0.0, 2.0, 4.0, 6.0, 8.0]))
        );
    }

    #[test]
    fn strings_reverse() {
        let mut ext = demo();
        assert_eq!(
            call(&mut ext, "reverse_string_v1", values!["hello world!"]),
            Response::Ok(Value::from("!dlrow olleh"))
        );
    }

    #[test]
    fn version_option_overrides_the_default() {
        let mut with_default = demo();
        assert_eq!(
            call(&mut with_default, "version", values![]),
            Response::Ok(Value::from(7))
        );

        let mut options = std::collections::BTreeMap::new();
        options.insert("version".to_string(), "12".to_string());
        let mut overridden = build(&ExtensionContext {
            host: "127.0.0.1".to_string(),
            port: 1,
            options,
        })
        .unwrap();
        assert_eq!(
            call(&mut overridden, "version", values![]),
            Response::Ok(Value::from(12))
        );
    }

    #[test]
    fn bad_version_options_fail_construction() {
        let mut options = std::collections::BTreeMap::new();
        options.insert("version".to_string(), "seven".to_string());
        assert!(build(&ExtensionContext {
            host: "127.0.0.1".to_string(),
            port: 1,
            options,
        })
        .is_err());
    }

    #[test]
    fn history_preserves_recording_order() {
        let mut ext = demo();
        for i in 0..5 {
            call(&mut ext, "record", values![i]);
        }
        assert_eq!(
            call(&mut ext, "history", values![]),
            Response::Ok(Value::List(values![0, 1, 2, 3, 4]))
        );
    }
}
