//! Argv-safe encoding of the user options mapping.
//!
//! The worker CLI carries user options as a single `--options` argument.
//! The mapping is flattened into concatenated length-prefixed tokens,
//! `<len>:<key><len>:<value>` per entry with byte lengths in decimal, so
//! keys and values can contain any character except NUL without
//! escaping. Values are strings only; type fidelity is intentionally
//! forfeited on this path.

use anyhow::{bail, Result as Fallible};
use std::collections::BTreeMap;

/// Encode an options mapping for the `--options` CLI argument.
pub fn encode_options(options: &BTreeMap<String, String>) -> String {
    let mut encoded = String::new();
    for (key, value) in options {
        push_token(&mut encoded, key);
        push_token(&mut encoded, value);
    }
    encoded
}

fn push_token(out: &mut String, token: &str) {
    out.push_str(&token.len().to_string());
    out.push(':');
    out.push_str(token);
}

/// Decode the `--options` CLI argument back into a mapping.
pub fn decode_options(encoded: &str) -> Fallible<BTreeMap<String, String>> {
    let mut options = BTreeMap::new();
    let mut rest = encoded;
    while !rest.is_empty() {
        let (key, after_key) = take_token(rest)?;
        let (value, after_value) = take_token(after_key)?;
        options.insert(key.to_string(), value.to_string());
        rest = after_value;
    }
    Ok(options)
}

fn take_token(input: &str) -> Fallible<(&str, &str)> {
    let colon = match input.find(':') {
        Some(index) if index > 0 => index,
        _ => bail!("malformed options token near '{}'", clip(input)),
    };
    let len: usize = match input[..colon].parse() {
        Ok(len) => len,
        Err(_) => bail!("malformed options length near '{}'", clip(input)),
    };
    let body = &input[colon + 1..];
    match body.get(..len) {
        Some(token) => Ok((token, &body[len..])),
        None => bail!("truncated options token near '{}'", clip(input)),
    }
}

fn clip(input: &str) -> &str {
    let end = input
        .char_indices()
        .map(|(i, _)| i)
        .nth(16)
        .unwrap_or_else(|| input.len());
    &input[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_mapping_encodes_to_nothing() {
        assert_eq!(encode_options(&BTreeMap::new()), "");
        assert_eq!(decode_options("").unwrap(), BTreeMap::new());
    }

    #[test]
    fn mappings_roundtrip() {
        let options = map(&[("alpha", "1"), ("beta", "two words"), ("empty", "")]);
        let encoded = encode_options(&options);
        assert_eq!(decode_options(&encoded).unwrap(), options);
    }

    #[test]
    fn encoding_is_length_prefixed() {
        let options = map(&[("a", "bc")]);
        assert_eq!(encode_options(&options), "1:a2:bc");
    }

    #[test]
    fn separator_characters_need_no_escaping() {
        let options = map(&[("path", "/a:/b;c=d"), ("quote", "it said \"9:\"")]);
        let encoded = encode_options(&options);
        assert_eq!(decode_options(&encoded).unwrap(), options);
    }

    #[test]
    fn multibyte_values_roundtrip() {
        let options = map(&[("greeting", "grüß dich"), ("emoji", "🦀")]);
        let encoded = encode_options(&options);
        assert_eq!(decode_options(&encoded).unwrap(), options);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(decode_options("no-colon").is_err());
        assert!(decode_options(":1").is_err());
        assert!(decode_options("5:ab").is_err());
        assert!(decode_options("2:ab9:short").is_err());
        // a length cutting a multibyte character in half is not a token
        assert!(decode_options("1:é").is_err());
    }
}
