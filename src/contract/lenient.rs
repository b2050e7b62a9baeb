//! Lenient decoding of contract fragments produced by external agents.
//!
//! Malformed optional sub-structures are dropped rather than failing the
//! whole decode, but every dropped fragment is reported back to the caller.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Best-effort decode result plus the fragments that were ignored.
#[derive(Debug, Clone)]
pub struct LenientDecoded<T> {
    pub value: T,
    pub dropped: Vec<String>,
}

impl<T> LenientDecoded<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            dropped: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty()
    }
}

/// Decode a JSON array element-wise, keeping the elements that parse and
/// reporting the ones that do not.
pub fn decode_optional_list<T: DeserializeOwned>(value: &Value) -> LenientDecoded<Vec<T>> {
    let items = match value.as_array() {
        Some(items) => items,
        None => {
            if value.is_null() {
                return LenientDecoded::clean(Vec::new());
            }
            return LenientDecoded {
                value: Vec::new(),
                dropped: vec![format!("expected array, got: {value}")],
            };
        }
    };

    let mut decoded = Vec::with_capacity(items.len());
    let mut dropped = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        match serde_json::from_value(item.clone()) {
            Ok(v) => decoded.push(v),
            Err(e) => dropped.push(format!("[{idx}] {e}")),
        }
    }

    LenientDecoded {
        value: decoded,
        dropped,
    }
}
