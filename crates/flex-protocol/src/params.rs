//! Query parameters carried by control requests.

use std::collections::BTreeMap;

use crate::ProtocolError;

pub const NAME: &str = "name";
pub const COMMAND: &str = "command";
pub const SECRET: &str = "secret";
pub const DISTRO: &str = "distro";
pub const RELEASE: &str = "release";
pub const ARCH: &str = "arch";

/// Largest attach secret the relay accepts, in bytes.
pub const MAX_SECRET_LEN: usize = 256;

/// Decoded `key=value` query parameters.
///
/// Repeated keys keep the first value. Empty values count as missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    values: BTreeMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a URL query string (without the leading `?`).
    ///
    /// Pairs that are not valid percent-encoded UTF-8 are dropped.
    pub fn parse(query: &str) -> Self {
        let mut values = BTreeMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let (Some(key), Some(value)) = (decode(key), decode(value)) else {
                continue;
            };
            values.entry(key).or_insert(value);
        }
        Self { values }
    }

    /// Adds a parameter, builder style.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Returns the non-empty value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Returns the value of `key` or a `MissingParam` error naming it.
    pub fn require(&self, key: &'static str) -> Result<&str, ProtocolError> {
        self.get(key).ok_or(ProtocolError::MissingParam(key))
    }

    /// Encodes the parameters as a query string.
    pub fn encode(&self) -> String {
        self.values
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn decode(s: &str) -> Option<String> {
    let spaced = s.replace('+', " ");
    urlencoding::decode(&spaced).ok().map(|v| v.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_get() {
        let p = Params::parse("name=c1&command=%2Fbin%2Fbash+-l&secret=abc");
        assert_eq!(p.get(NAME), Some("c1"));
        assert_eq!(p.get(COMMAND), Some("/bin/bash -l"));
        assert_eq!(p.get(SECRET), Some("abc"));
    }

    #[test]
    fn test_require_missing_and_empty() {
        let p = Params::parse("name=&distro=ubuntu");
        assert_eq!(p.require(NAME), Err(ProtocolError::MissingParam(NAME)));
        assert_eq!(p.require(ARCH), Err(ProtocolError::MissingParam(ARCH)));
        assert_eq!(p.require(DISTRO), Ok("ubuntu"));
    }

    #[test]
    fn test_first_value_wins() {
        let p = Params::parse("name=a&name=b");
        assert_eq!(p.get(NAME), Some("a"));
    }

    #[test]
    fn test_encode_escapes_reserved_characters() {
        let p = Params::new()
            .with(NAME, "c1")
            .with(COMMAND, "echo a&b=c");
        let encoded = p.encode();
        assert!(encoded.contains("command=echo%20a%26b%3Dc"));
        assert_eq!(Params::parse(&encoded), p);
    }
}
