//! Header containers.
//!
//! - [`RawHeader`]: one received line, original casing and order preserved
//! - [`HeaderMap`]: received headers folded by lower-cased name
//! - [`HeaderTable`]: outgoing headers with a case-insensitive index
//!
//! # Fold rule
//! A name seen once maps to [`HeaderValue::Single`]; from the second
//! occurrence on it is coerced into [`HeaderValue::List`] in arrival order.

use std::collections::HashMap;

use crate::http::error::HttpError;

/// A header value that may repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Single(String),
    List(Vec<String>),
}

impl HeaderValue {
    /// All values in order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            HeaderValue::Single(v) => std::slice::from_ref(v),
            HeaderValue::List(vs) => vs.as_slice(),
        };
        slice.iter().map(String::as_str)
    }

    /// The first value, or `""` for an empty list.
    pub fn first(&self) -> &str {
        self.values().next().unwrap_or("")
    }

    /// Append a value, coercing a single value into a list.
    pub fn push(&mut self, value: String) {
        match self {
            HeaderValue::Single(existing) => {
                let first = std::mem::take(existing);
                *self = HeaderValue::List(vec![first, value]);
            }
            HeaderValue::List(vs) => vs.push(value),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Single(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Single(v)
    }
}

impl From<u64> for HeaderValue {
    fn from(v: u64) -> Self {
        HeaderValue::Single(v.to_string())
    }
}

impl From<usize> for HeaderValue {
    fn from(v: usize) -> Self {
        HeaderValue::Single(v.to_string())
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(vs: Vec<String>) -> Self {
        HeaderValue::List(vs)
    }
}

impl From<Vec<&str>> for HeaderValue {
    fn from(vs: Vec<&str>) -> Self {
        HeaderValue::List(vs.into_iter().map(str::to_string).collect())
    }
}

/// One header line as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    pub name: String,
    pub value: String,
}

impl RawHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Received headers keyed by lower-cased name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: HashMap<String, HeaderValue>,
}

impl HeaderMap {
    /// Build the map from raw lines using the fold rule.
    pub fn fold(raw: &[RawHeader]) -> Self {
        let mut entries: HashMap<String, HeaderValue> = HashMap::with_capacity(raw.len());
        for header in raw {
            let key = header.name.to_ascii_lowercase();
            match entries.get_mut(&key) {
                Some(existing) => existing.push(header.value.clone()),
                None => {
                    entries.insert(key, HeaderValue::Single(header.value.clone()));
                }
            }
        }
        Self { entries }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries.get(&name.to_ascii_lowercase())
    }

    /// First value of `name`, if present.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).map(HeaderValue::first)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Outgoing headers: canonical names in insertion order plus a
/// lower-case → canonical index.
#[derive(Debug, Clone, Default)]
pub struct HeaderTable {
    entries: Vec<(String, HeaderValue)>,
    index: HashMap<String, String>,
}

impl HeaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`. The most recent casing becomes canonical.
    pub fn set(&mut self, name: &str, value: HeaderValue) {
        let key = name.to_ascii_lowercase();
        match self.index.insert(key, name.to_string()) {
            Some(previous) => {
                if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == previous) {
                    *entry = (name.to_string(), value);
                }
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        let canonical = self.index.get(&name.to_ascii_lowercase())?;
        self.entries
            .iter()
            .find(|(n, _)| n == canonical)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        let canonical = self.index.remove(&name.to_ascii_lowercase())?;
        let pos = self.entries.iter().position(|(n, _)| *n == canonical)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_ascii_lowercase())
    }

    /// Canonical names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

/// Reject names that are not RFC 7230 tokens.
pub fn validate_name(name: &str) -> Result<(), HttpError> {
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(HttpError::InvalidHeader {
            name: name.to_string(),
            reason: "name is not a valid token",
        });
    }
    Ok(())
}

/// Reject values that would break the line framing.
pub fn validate_value(name: &str, value: &HeaderValue) -> Result<(), HttpError> {
    if value
        .values()
        .any(|v| v.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0))
    {
        return Err(HttpError::InvalidHeader {
            name: name.to_string(),
            reason: "value contains CR, LF or NUL",
        });
    }
    Ok(())
}
