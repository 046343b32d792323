//! Dynamic value model held by observables.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CodecError, CodecResult};

/// A value that can live inside an observable and be persisted.
///
/// `Map` and `Set` keep insertion order and stay distinct from `Object`
/// and `Array`. `Shared` nodes carry identity: two `Shared` values that
/// point at the same node survive a codec round trip as one node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    /// UTC instant with millisecond precision.
    Date(DateTime<Utc>),
    Regex { source: String, flags: String },
    Shared(SharedValue),
}

/// Reference-counted, interior-mutable value node.
///
/// Cloning yields another handle to the same node. Cycles are built by
/// storing a handle inside the node it points to.
#[derive(Clone)]
pub struct SharedValue(Arc<RwLock<Value>>);

impl SharedValue {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Clone of the current contents. The lock is released before returning.
    pub fn get(&self) -> Value {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// True when both handles point at the same node.
    pub fn ptr_eq(&self, other: &SharedValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Stable address of the node, used for identity tracking.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for SharedValue {
    // Distinct cyclic graphs never terminate here; compare those with `ptr_eq`.
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.get() == other.get()
    }
}

impl fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Contents are not printed: the node may be part of a cycle.
        f.debug_tuple("Shared")
            .field(&format_args!("{:p}", Arc::as_ptr(&self.0)))
            .finish()
    }
}

impl Value {
    /// Wrap `value` in a fresh shared node.
    pub fn shared(value: Value) -> Self {
        Value::Shared(SharedValue::new(value))
    }

    /// Date from epoch milliseconds.
    pub fn date_millis(millis: i64) -> CodecResult<Self> {
        DateTime::<Utc>::from_timestamp_millis(millis)
            .map(Value::Date)
            .ok_or(CodecError::InvalidDate(millis))
    }

    /// Date truncated to millisecond precision, the resolution the codec keeps.
    pub fn date(at: DateTime<Utc>) -> CodecResult<Self> {
        Self::date_millis(at.timestamp_millis())
    }

    pub fn regex(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Value::Regex {
            source: source.into(),
            flags: flags.into(),
        }
    }

    /// Build a `regex::Regex` from a `Regex` value.
    ///
    /// `i`, `m`, `s` and `x` map to the matching builder options. `g`, `y`,
    /// `u` and `d` only affect matching state and are ignored.
    pub fn compile_regex(&self) -> CodecResult<Regex> {
        let Value::Regex { source, flags } = self else {
            return Err(CodecError::InvalidRegex("value is not a regex".to_string()));
        };
        let mut builder = RegexBuilder::new(source);
        for flag in flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'x' => {
                    builder.ignore_whitespace(true);
                }
                'g' | 'y' | 'u' | 'd' => {}
                other => {
                    return Err(CodecError::InvalidRegex(format!("unsupported flag '{other}'")));
                }
            }
        }
        builder
            .build()
            .map_err(|e| CodecError::InvalidRegex(e.to_string()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Shared(node) => node.get().as_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Plain JSON to value. Objects stay objects; no tags are interpreted.
    pub fn from_json(json: serde_json::Value) -> CodecResult<Self> {
        let value = match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::from_number(&n)?,
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::from_json)
                    .collect::<CodecResult<_>>()?,
            ),
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| Value::from_json(v).map(|v| (k, v)))
                    .collect::<CodecResult<_>>()?,
            ),
        };
        Ok(value)
    }

    /// Integers that fit `i64` stay exact; everything else goes through `f64`.
    pub(crate) fn from_number(n: &serde_json::Number) -> CodecResult<Self> {
        if let Some(i) = n.as_i64() {
            return Ok(Value::Int(i));
        }
        n.as_f64()
            .map(Value::Float)
            .ok_or_else(|| CodecError::UnrepresentableNumber(n.to_string()))
    }

    /// Lossy conversion to plain JSON.
    ///
    /// Sets become arrays, maps become arrays of `[key, value]` pairs, dates
    /// become RFC 3339 strings, regexes become `/source/flags`, non-finite
    /// floats and `Undefined` become `null`. A shared node reached again
    /// while it is still being converted (a cycle) becomes `null`.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_inner(&mut HashSet::new())
    }

    fn to_json_inner(&self, open: &mut HashSet<usize>) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Undefined | Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) | Value::Set(items) => {
                Json::Array(items.iter().map(|v| v.to_json_inner(open)).collect())
            }
            Value::Object(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_inner(open)))
                    .collect(),
            ),
            Value::Map(entries) => Json::Array(
                entries
                    .iter()
                    .map(|(k, v)| Json::Array(vec![k.to_json_inner(open), v.to_json_inner(open)]))
                    .collect(),
            ),
            Value::Date(at) => Json::String(at.to_rfc3339()),
            Value::Regex { source, flags } => Json::String(format!("/{source}/{flags}")),
            Value::Shared(node) => {
                let addr = node.addr();
                if !open.insert(addr) {
                    return Json::Null;
                }
                let json = node.get().to_json_inner(open);
                open.remove(&addr);
                json
            }
        }
    }

    /// Convert any serde-serializable host value.
    pub fn from_serde<T: Serialize>(value: &T) -> CodecResult<Self> {
        Value::from_json(serde_json::to_value(value)?)
    }

    /// Convert back into a typed host value through plain JSON.
    pub fn into_serde<T: DeserializeOwned>(&self) -> CodecResult<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}
