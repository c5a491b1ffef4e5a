use std::fmt;

use crate::error::{Code, RpcError};

/// Protocol-reserved pseudo-keys that carry gRPC signalling rather than
/// application data (section 3).
pub const GRPC_ENCODING: &str = "grpc-encoding";
pub const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
pub const GRPC_TIMEOUT: &str = "grpc-timeout";
pub const GRPC_RETRY_PUSHBACK_MS: &str = "grpc-retry-pushback-ms";
pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";
pub const GRPC_PREVIOUS_RPC_ATTEMPTS: &str = "grpc-previous-rpc-attempts";

/// A single metadata value: either a printable ASCII string or opaque bytes.
///
/// Keys ending in `-bin` are always `Binary`; all other keys are always
/// `Ascii`. The distinction is enforced at `append`/`insert` time rather
/// than carried separately, matching how the key's suffix is the sole
/// discriminator in the wire protocol (section 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Ascii(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn as_ascii(&self) -> Option<&str> {
        match self {
            Value::Ascii(s) => Some(s),
            Value::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            Value::Ascii(_) => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Ascii(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Ascii(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(b)
    }
}

fn is_binary_key(key: &str) -> bool {
    key.ends_with("-bin")
}

/// Printable-ASCII validation for non-binary header values: VCHAR (0x21-0x7E)
/// plus space and tab, matching HTTP field-value rules. Binary keys skip
/// this check entirely since their values are opaque bytes.
fn validate_ascii_value(value: &str) -> Result<(), RpcError> {
    if value
        .bytes()
        .all(|b| b == b' ' || b == b'\t' || (0x21..=0x7e).contains(&b))
    {
        Ok(())
    } else {
        Err(RpcError::status(
            Code::InvalidArgument,
            format!("metadata value {value:?} contains non-printable-ASCII bytes"),
        ))
    }
}

fn validate_key(key: &str) -> Result<(), RpcError> {
    if key.is_empty()
        || !key.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_' || b == b'.'
        })
    {
        return Err(RpcError::status(
            Code::InvalidArgument,
            format!("metadata key {key:?} is not a valid lowercase ASCII token"),
        ));
    }
    Ok(())
}

/// An ordered multi-map of metadata key/value pairs (section 3).
///
/// Duplicate keys are permitted and insertion order is preserved, matching
/// how repeated HTTP/2 headers are exposed to gRPC applications. `Metadata`
/// is a plain value type: `clone()` always produces an independent deep
/// copy, satisfying the "once sent, immutable; readers get deep copies"
/// invariant from section 3 without needing interior mutability or
/// reference counting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Value)>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata {
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Append a value under `key`, normalising the key to lowercase.
    /// Fails if a binary key is given a value that isn't `Value::Binary`
    /// (and vice versa), or if an ASCII value contains non-printable bytes.
    pub fn append(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<Value>,
    ) -> Result<(), RpcError> {
        let key = key.as_ref().to_ascii_lowercase();
        validate_key(&key)?;
        let value = value.into();

        match (&value, is_binary_key(&key)) {
            (Value::Binary(_), true) => {}
            (Value::Ascii(s), false) => validate_ascii_value(s)?,
            (Value::Binary(_), false) => {
                return Err(RpcError::status(
                    Code::InvalidArgument,
                    format!("key {key:?} does not end in -bin but was given a binary value"),
                ));
            }
            (Value::Ascii(_), true) => {
                return Err(RpcError::status(
                    Code::InvalidArgument,
                    format!("key {key:?} ends in -bin but was given an ASCII value"),
                ));
            }
        }

        self.entries.push((key, value));
        Ok(())
    }

    /// Remove all existing values for `key` and replace with a single one.
    pub fn insert(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<Value>,
    ) -> Result<(), RpcError> {
        self.remove(key.as_ref());
        self.append(key, value)
    }

    /// First value for `key`, or `None` if absent.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&Value> {
        let key = key.as_ref();
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn get_ascii(&self, key: impl AsRef<str>) -> Option<&str> {
        self.get(key).and_then(Value::as_ascii)
    }

    /// All values for `key`, in insertion order.
    pub fn get_all(&self, key: impl AsRef<str>) -> Vec<&Value> {
        let key = key.as_ref();
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
            .collect()
    }

    /// Remove every value for `key`. Returns the number of entries removed.
    pub fn remove(&mut self, key: impl AsRef<str>) -> usize {
        let key = key.as_ref();
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        before - self.entries.len()
    }

    /// An independent deep copy, satisfying the "readers obtain deep
    /// copies" invariant from section 3.
    pub fn copy(&self) -> Metadata {
        self.clone()
    }

    /// Concatenate `other`'s entries after this map's, preserving order
    /// from both sides (section 4.2: "merging ... concatenates in order").
    pub fn merge(&mut self, other: &Metadata) {
        self.entries.extend(other.entries.iter().cloned());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(empty)");
        }
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                writeln!(f)?;
            }
            first = false;
            match v {
                Value::Ascii(s) => write!(f, "{k}: {s}")?,
                Value::Binary(b) => write!(f, "{k}: <{} bytes>", b.len())?,
            }
        }
        Ok(())
    }
}
