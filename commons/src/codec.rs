//! Versioned object codec.
//!
//! A single serializer governs both RPC directions so that a fault
//! produced on one side can be surfaced on the other with identical
//! types. Frames are bincode with fixed-width little-endian integers;
//! doubles travel as their raw IEEE-754 bit patterns, so NaN payloads and
//! infinities round-trip exactly.

use crate::rpc::{Request, Response};
use bincode::Options;
use thiserror::Error;

/// Protocol version the host advertises when none is configured.
pub const DEFAULT_PROTOCOL: u16 = 1;

/// Protocol versions this build can encode and decode.
pub const SUPPORTED_PROTOCOLS: &[u16] = &[1];

/// Upper bound on one encoded frame, matching the worker's HTTP body
/// limit (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Marker written to stderr by a worker refusing the requested protocol
/// version; the launcher keys on it to classify the start failure.
pub const UNSUPPORTED_PROTOCOL_MARKER: &str = "unsupported protocol version";

/// A frame could not be produced or understood.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The requested protocol version is not supported by this build.
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u16),
    /// A value could not be encoded.
    #[error("could not encode {what}: {source}")]
    Encode {
        /// What was being encoded.
        what: &'static str,
        /// Underlying serializer failure.
        source: bincode::Error,
    },
    /// A frame could not be decoded.
    #[error("could not decode {what}: {source}")]
    Decode {
        /// What was being decoded.
        what: &'static str,
        /// Underlying serializer failure.
        source: bincode::Error,
    },
}

/// True when this build can encode and decode `protocol`.
pub fn is_supported(protocol: u16) -> bool {
    SUPPORTED_PROTOCOLS.contains(&protocol)
}

fn wire_options() -> impl Options {
    bincode::options()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_FRAME_LEN as u64)
}

/// Encode a request frame under the given protocol version.
pub fn encode_request(request: &Request, protocol: u16) -> Result<Vec<u8>, CodecError> {
    check(protocol)?;
    wire_options()
        .serialize(request)
        .map_err(|source| CodecError::Encode {
            what: "request",
            source,
        })
}

/// Decode a request frame under the given protocol version.
pub fn decode_request(frame: &[u8], protocol: u16) -> Result<Request, CodecError> {
    check(protocol)?;
    wire_options()
        .deserialize(frame)
        .map_err(|source| CodecError::Decode {
            what: "request",
            source,
        })
}

/// Encode a response frame under the given protocol version.
pub fn encode_response(response: &Response, protocol: u16) -> Result<Vec<u8>, CodecError> {
    check(protocol)?;
    wire_options()
        .serialize(response)
        .map_err(|source| CodecError::Encode {
            what: "response",
            source,
        })
}

/// Decode a response frame under the given protocol version.
pub fn decode_response(frame: &[u8], protocol: u16) -> Result<Response, CodecError> {
    check(protocol)?;
    wire_options()
        .deserialize(frame)
        .map_err(|source| CodecError::Decode {
            what: "response",
            source,
        })
}

fn check(protocol: u16) -> Result<(), CodecError> {
    if is_supported(protocol) {
        Ok(())
    } else {
        Err(CodecError::UnsupportedProtocol(protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{FaultFrame, FaultKind};
    use crate::value::{Record, Value, ValueMap};
    use crate::{value_map, values};

    fn roundtrip(value: Value) -> Value {
        let request = Request::new(7, "echo", vec![value], ValueMap::new());
        let frame = encode_request(&request, DEFAULT_PROTOCOL).unwrap();
        let decoded = decode_request(&frame, DEFAULT_PROTOCOL).unwrap();
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.method, "echo");
        decoded.args.into_iter().next().unwrap()
    }

    #[test]
    fn scalars_roundtrip() {
        for value in values![
            true,
            false,
            0,
            -1,
            i64::MAX,
            i64::MIN,
            0.0,
            -0.0,
            1.5e300,
            "hello world!",
            ""
        ] {
            assert!(roundtrip(value.clone()).bitwise_eq(&value));
        }
        assert_eq!(roundtrip(Value::Unit), Value::Unit);
        assert_eq!(
            roundtrip(Value::bytes(vec![0u8, 255, 128])),
            Value::bytes(vec![0u8, 255, 128])
        );
    }

    #[test]
    fn non_finite_doubles_roundtrip_bit_for_bit() {
        for bits in [
            f64::NAN.to_bits(),
            0x7ff8_0000_0000_0001u64, // NaN with a payload
            0xfff8_0000_0000_0000u64, // negative NaN
            f64::INFINITY.to_bits(),
            f64::NEG_INFINITY.to_bits(),
            (-0.0f64).to_bits(),
        ]
        .iter()
        {
            let value = Value::Float(f64::from_bits(*bits));
            match roundtrip(value) {
                Value::Float(out) => assert_eq!(out.to_bits(), *bits),
                other => panic!("expected a float, got {:?}", other),
            }
        }
    }

    #[test]
    fn containers_roundtrip() {
        let value = Value::List(vec![
            Value::from(1.2),
            Value::Map(value_map! {"my_list" => Value::List(values![1, 2, 3])}),
            Value::Record(Record::new(
                "Point",
                value_map! {"x" => 1.0, "y" => -2.0},
            )),
        ]);
        assert!(roundtrip(value.clone()).bitwise_eq(&value));
    }

    #[test]
    fn responses_roundtrip() {
        let ok = Response::Ok(Value::from(17));
        let frame = encode_response(&ok, DEFAULT_PROTOCOL).unwrap();
        assert_eq!(decode_response(&frame, DEFAULT_PROTOCOL).unwrap(), ok);

        let fault = Response::Fault(FaultFrame::user(
            "DemoError",
            "deliberate failure",
            "DemoError: deliberate failure",
        ));
        let frame = encode_response(&fault, DEFAULT_PROTOCOL).unwrap();
        let decoded = decode_response(&frame, DEFAULT_PROTOCOL).unwrap();
        match decoded {
            Response::Fault(frame) => {
                assert_eq!(frame.kind, FaultKind::User);
                assert_eq!(frame.type_name, "DemoError");
            }
            other => panic!("expected a fault, got {:?}", other),
        }
    }

    #[test]
    fn unsupported_protocol_is_refused() {
        let request = Request::ping(0);
        let err = encode_request(&request, 99).unwrap_err();
        assert!(err.to_string().contains(UNSUPPORTED_PROTOCOL_MARKER));
        assert!(!is_supported(99));
        assert!(is_supported(DEFAULT_PROTOCOL));
    }

    #[test]
    fn garbage_frames_fail_to_decode() {
        assert!(decode_request(b"not a frame", DEFAULT_PROTOCOL).is_err());
        assert!(decode_response(&[0xff; 16], DEFAULT_PROTOCOL).is_err());
    }
}
