//! Wire value model.
//!
//! Every argument and every return value crossing the bridge is expressed
//! as a [`Value`]. The set is closed on purpose: it is exactly what the
//! codec guarantees to round-trip, and cyclic structures are
//! unrepresentable by construction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String-keyed mapping of wire values.
pub type ValueMap = BTreeMap<String, Value>;

/// A language-level value in its wire-representable form.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Value {
    /// The unit value (absence of a value).
    Unit,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// An IEEE-754 double, preserved bit-for-bit by the codec.
    Float(f64),
    /// A byte string.
    Bytes(Vec<u8>),
    /// A UTF-8 text string.
    Text(String),
    /// An ordered sequence.
    List(Vec<Value>),
    /// An unordered mapping with string keys.
    Map(ValueMap),
    /// A user-declared record with named fields.
    Record(Record),
}

/// A user-declared structured value: a named record with typed fields.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Record {
    /// Record type name, a plain identifier declared by the user.
    pub name: String,
    /// Named fields, each holding any wire value.
    pub fields: ValueMap,
}

impl Record {
    /// Create a record with the given type name and fields.
    pub fn new<S: Into<String>>(name: S, fields: ValueMap) -> Self {
        Record {
            name: name.into(),
            fields,
        }
    }
}

impl Value {
    /// Create a byte-string value.
    pub fn bytes<B: Into<Vec<u8>>>(bytes: B) -> Self {
        Value::Bytes(bytes.into())
    }

    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Record(_) => "record",
        }
    }

    /// True for the unit value.
    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }

    /// Boolean content, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer content, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Double content, if this is a double.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Text content, if this is a text string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Byte content, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Sequence content, if this is a sequence.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Mapping content, if this is a mapping.
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Record content, if this is a record.
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Structural equality with bitwise comparison of doubles.
    ///
    /// The derived `PartialEq` follows IEEE-754, under which NaN is not
    /// equal to itself. Round-trip assertions need the stricter notion
    /// where two doubles are equal when their bit patterns are.
    pub fn bitwise_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.bitwise_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.bitwise_eq(vb))
            }
            (Value::Record(a), Value::Record(b)) => {
                a.name == b.name
                    && a.fields.len() == b.fields.len()
                    && a.fields
                        .iter()
                        .zip(&b.fields)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.bitwise_eq(vb))
            }
            (a, b) => a == b,
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n.into())
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<ValueMap> for Value {
    fn from(entries: ValueMap) -> Self {
        Value::Map(entries)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Record(record)
    }
}

/// Build a `Vec<Value>`, converting each element with `Value::from`.
#[macro_export]
macro_rules! values {
    () => { Vec::<$crate::Value>::new() };
    ($($item:expr),+ $(,)?) => {
        vec![$($crate::Value::from($item)),+]
    };
}

/// Build a [`ValueMap`](crate::ValueMap) from `key => value` pairs.
#[macro_export]
macro_rules! value_map {
    () => { $crate::ValueMap::new() };
    ($($key:expr => $val:expr),+ $(,)?) => {{
        let mut entries = $crate::ValueMap::new();
        $(entries.insert($key.to_string(), $crate::Value::from($val));)+
        entries
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_match_variants() {
        assert_eq!(Value::from(3).as_i64(), Some(3));
        assert_eq!(Value::from(3).as_f64(), None);
        assert_eq!(Value::from("hi").as_str(), Some("hi"));
        assert_eq!(Value::bytes(vec![1u8, 2]).as_bytes(), Some(&[1u8, 2][..]));
        assert!(Value::Unit.is_unit());
        assert_eq!(Value::from(true).kind(), "bool");
    }

    #[test]
    fn bitwise_eq_treats_nan_as_equal() {
        let nan = Value::Float(f64::NAN);
        assert_ne!(nan, nan.clone());
        assert!(nan.bitwise_eq(&nan.clone()));

        let nested = Value::List(vec![Value::Float(f64::NAN), Value::from(1)]);
        assert!(nested.bitwise_eq(&nested.clone()));
    }

    #[test]
    fn bitwise_eq_distinguishes_nan_payloads() {
        let quiet = Value::Float(f64::from_bits(0x7ff8_0000_0000_0000));
        let payload = Value::Float(f64::from_bits(0x7ff8_0000_0000_0001));
        assert!(!quiet.bitwise_eq(&payload));
    }

    #[test]
    fn macros_build_args_and_maps() {
        let args = values![1, 2.5, "three"];
        assert_eq!(
            args,
            vec![Value::Int(1), Value::Float(2.5), Value::from("three")]
        );

        let entries = value_map! {"x" => true, "y" => "hello"};
        assert_eq!(entries.get("x"), Some(&Value::Bool(true)));
        assert_eq!(entries.get("y"), Some(&Value::from("hello")));
    }
}
