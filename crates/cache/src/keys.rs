//! Function and input identities
//!
//! A [`FunctionKey`] names a cacheable function; an [`InputKey`] names one
//! invocation of it. Both are plain values: equality and hashing are
//! structural, so keys built independently in different processes compare
//! equal whenever their ids match.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Longest encoded directory name a key component may produce
pub const MAX_COMPONENT_LEN: usize = 200;

/// Identity of a cacheable function
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionKey {
    function_id: String,
}

impl FunctionKey {
    /// Create a function key
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the id is empty or too long to be
    /// stored as a directory name.
    pub fn new(function_id: impl Into<String>) -> Result<Self> {
        let function_id = function_id.into();
        validate_component("function id", &function_id)?;
        Ok(Self { function_id })
    }

    /// The function id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.function_id
    }

    /// Build an input key scoped to this function
    pub fn input(&self, input_id: impl Into<String>) -> Result<InputKey> {
        InputKey::new(self.clone(), input_id)
    }

    pub(crate) fn encoded(&self) -> String {
        encode_component(&self.function_id)
    }
}

impl TryFrom<String> for FunctionKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<FunctionKey> for String {
    fn from(key: FunctionKey) -> Self {
        key.function_id
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.function_id)
    }
}

/// Identity of one invocation of a function
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawInputKey", into = "RawInputKey")]
pub struct InputKey {
    function_key: FunctionKey,
    input_id: String,
}

impl InputKey {
    /// Create an input key from an already computed fingerprint id
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the id is empty or too long.
    pub fn new(function_key: FunctionKey, input_id: impl Into<String>) -> Result<Self> {
        let input_id = input_id.into();
        validate_component("input id", &input_id)?;
        Ok(Self {
            function_key,
            input_id,
        })
    }

    /// Create an input key whose id is the SHA-256 of the fingerprint bytes
    #[must_use]
    pub fn from_fingerprint(function_key: FunctionKey, fingerprint: &[u8]) -> Self {
        Self {
            function_key,
            input_id: hex::encode(Sha256::digest(fingerprint)),
        }
    }

    /// Create an input key from any serializable argument set
    ///
    /// The value is converted to canonical JSON (object keys sorted) before
    /// hashing, so map insertion order does not change the key.
    pub fn from_serializable<T: Serialize + ?Sized>(
        function_key: FunctionKey,
        args: &T,
    ) -> Result<Self> {
        let value = serde_json::to_value(args)
            .map_err(|e| Error::serialization(format!("Failed to encode arguments: {e}")))?;
        let bytes = serde_json::to_vec(&value)
            .map_err(|e| Error::serialization(format!("Failed to serialize arguments: {e}")))?;
        Ok(Self::from_fingerprint(function_key, &bytes))
    }

    /// The function this input belongs to
    #[must_use]
    pub fn function_key(&self) -> &FunctionKey {
        &self.function_key
    }

    /// The input id (argument fingerprint)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.input_id
    }

    /// Same input id, owned by another function
    #[must_use]
    pub fn with_function(&self, function_key: FunctionKey) -> Self {
        Self {
            function_key,
            input_id: self.input_id.clone(),
        }
    }

    pub(crate) fn encoded(&self) -> String {
        encode_component(&self.input_id)
    }
}

impl fmt::Display for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.function_key, self.input_id)
    }
}

#[derive(Serialize, Deserialize)]
struct RawInputKey {
    function_id: String,
    input_id: String,
}

impl TryFrom<RawInputKey> for InputKey {
    type Error = Error;

    fn try_from(raw: RawInputKey) -> Result<Self> {
        Self::new(FunctionKey::new(raw.function_id)?, raw.input_id)
    }
}

impl From<InputKey> for RawInputKey {
    fn from(key: InputKey) -> Self {
        Self {
            function_id: key.function_key.function_id,
            input_id: key.input_id,
        }
    }
}

fn validate_component(what: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::invalid_key(format!("{what} must not be empty")));
    }
    let len = encoded_len(id);
    if len > MAX_COMPONENT_LEN {
        return Err(Error::invalid_key(format!(
            "{what} encodes to {len} bytes, limit is {MAX_COMPONENT_LEN}"
        )));
    }
    Ok(())
}

fn passes_through(index: usize, byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || (byte == b'.' && index > 0)
}

fn encoded_len(id: &str) -> usize {
    id.bytes()
        .enumerate()
        .map(|(i, b)| if passes_through(i, b) { 1 } else { 3 })
        .sum()
}

/// Encode an id as a single path component.
///
/// Safe bytes pass through and everything else becomes `%XX`. A leading `.`
/// is always escaped so encoded names never collide with `.`/`..` or hidden
/// files.
pub(crate) fn encode_component(id: &str) -> String {
    let mut out = String::with_capacity(encoded_len(id));
    for (i, byte) in id.bytes().enumerate() {
        if passes_through(i, byte) {
            out.push(char::from(byte));
        } else {
            out.push('%');
            out.push_str(&format!("{byte:02X}"));
        }
    }
    out
}

/// Inverse of [`encode_component`]; `None` for names it could not have produced
pub(crate) fn decode_component(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    let decoded = String::from_utf8(out).ok()?;
    // Reject non-canonical spellings such as "%41" for "A"
    (encode_component(&decoded) == name).then_some(decoded)
}
