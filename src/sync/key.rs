//! Hierarchical resource keys.
//!
//! A key is an ordered sequence of segments such as
//! `["sellers", "list", {"status": "pending", "page": 1}]`. Keys are
//! normalized at construction and carry their canonical string form, which is
//! the index used by the store and the basis of equality and hashing.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::Value;

use super::error::SyncError;

/// One component of a [`ResourceKey`].
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Number(i64),
    /// Parameter record; member order is irrelevant.
    Record(BTreeMap<String, Value>),
    /// An omitted parameter segment. Normalizes to an empty record.
    Absent,
}

impl Segment {
    /// Build a record segment from a JSON object.
    pub fn record(value: Value) -> Result<Self, SyncError> {
        match value {
            Value::Object(map) => Ok(Segment::Record(map.into_iter().collect())),
            Value::Null => Ok(Segment::Absent),
            other => Err(SyncError::invalid_key(format!(
                "record segment must be a JSON object, got `{other}`"
            ))),
        }
    }

    fn is_empty_record(&self) -> bool {
        match self {
            Segment::Absent => true,
            Segment::Record(map) => map.values().all(Value::is_null),
            Segment::Text(_) | Segment::Number(_) => false,
        }
    }
}

impl From<&str> for Segment {
    fn from(value: &str) -> Self {
        Segment::Text(value.to_string())
    }
}

impl From<String> for Segment {
    fn from(value: String) -> Self {
        Segment::Text(value)
    }
}

impl From<i64> for Segment {
    fn from(value: i64) -> Self {
        Segment::Number(value)
    }
}

impl From<u32> for Segment {
    fn from(value: u32) -> Self {
        Segment::Number(i64::from(value))
    }
}

impl From<BTreeMap<String, Value>> for Segment {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Segment::Record(value)
    }
}

impl TryFrom<Value> for Segment {
    type Error = SyncError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(text) => Ok(Segment::Text(text)),
            Value::Number(number) => number.as_i64().map(Segment::Number).ok_or_else(|| {
                SyncError::invalid_key(format!("numeric segment `{number}` is not an i64"))
            }),
            Value::Object(_) | Value::Null => Segment::record(value),
            other => Err(SyncError::invalid_key(format!(
                "unsupported segment `{other}`"
            ))),
        }
    }
}

/// Structured identifier of a cached collection or record.
#[derive(Clone)]
pub struct ResourceKey {
    segments: Vec<Segment>,
    parts: Vec<String>,
    canonical: String,
}

impl ResourceKey {
    /// Build and normalize a key.
    ///
    /// Absent segments become empty records, `null` record members are
    /// dropped, and trailing empty records are trimmed, so
    /// `["sellers","list"]` and `["sellers","list",{}]` are the same key.
    pub fn new<I>(segments: I) -> Result<Self, SyncError>
    where
        I: IntoIterator<Item = Segment>,
    {
        let key = Self::build(segments);
        key.validate()?;
        Ok(key)
    }

    /// Build a key whose shape is known to be valid (fixed resource names).
    pub(crate) fn trusted<I>(segments: I) -> Self
    where
        I: IntoIterator<Item = Segment>,
    {
        let key = Self::build(segments);
        debug_assert!(key.validate().is_ok(), "trusted key {key} is invalid");
        key
    }

    fn build<I>(segments: I) -> Self
    where
        I: IntoIterator<Item = Segment>,
    {
        let mut normalized: Vec<Segment> = segments
            .into_iter()
            .map(|segment| match segment {
                Segment::Absent => Segment::Record(BTreeMap::new()),
                Segment::Record(map) => Segment::Record(strip_nulls(map)),
                other => other,
            })
            .collect();

        while normalized.last().is_some_and(Segment::is_empty_record) {
            normalized.pop();
        }

        let parts: Vec<String> = normalized.iter().map(canonical_segment).collect();
        let canonical = format!("[{}]", parts.join(","));

        Self {
            segments: normalized,
            parts,
            canonical,
        }
    }

    fn validate(&self) -> Result<(), SyncError> {
        match self.segments.first() {
            None => return Err(SyncError::invalid_key("key has no segments")),
            Some(Segment::Text(_)) => {}
            Some(_) => {
                return Err(SyncError::invalid_key(
                    "first segment must name a resource",
                ));
            }
        }

        for (index, segment) in self.segments.iter().enumerate() {
            if let Segment::Text(text) = segment
                && text.is_empty()
            {
                return Err(SyncError::invalid_key(format!(
                    "text segment {index} is empty"
                )));
            }
        }
        Ok(())
    }

    /// Build a key from a JSON array of segments.
    pub fn from_json(value: &Value) -> Result<Self, SyncError> {
        let Value::Array(items) = value else {
            return Err(SyncError::invalid_key(format!(
                "key must be a JSON array, got `{value}`"
            )));
        };
        let segments = items
            .iter()
            .cloned()
            .map(Segment::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(segments)
    }

    /// Parse the canonical (or any JSON array) string form of a key.
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| SyncError::invalid_key(format!("`{text}` is not JSON: {err}")))?;
        Self::from_json(&value)
    }

    /// Single-segment key naming a resource collection.
    pub fn resource(name: &str) -> Result<Self, SyncError> {
        Self::new([Segment::from(name)])
    }

    /// Extend this key by one segment.
    pub fn child(&self, segment: impl Into<Segment>) -> Result<Self, SyncError> {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self::new(segments)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Keys always hold at least one segment.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Canonical string form, identical for deep-equal keys.
    pub fn serialize(&self) -> &str {
        &self.canonical
    }

    /// Name of the resource collection (first segment).
    pub fn resource_name(&self) -> &str {
        match self.segments.first() {
            Some(Segment::Text(name)) => name,
            _ => "",
        }
    }

    /// True when `self` is a strict prefix of `other`.
    pub fn is_ancestor_of(&self, other: &ResourceKey) -> bool {
        self.parts.len() < other.parts.len() && other.parts.starts_with(&self.parts)
    }

    /// True when `self` equals `other` or is one of its ancestors.
    pub fn is_prefix_of(&self, other: &ResourceKey) -> bool {
        other.parts.starts_with(&self.parts)
    }

    /// Single-segment key of the owning resource collection.
    pub fn root(&self) -> ResourceKey {
        Self::build(self.segments.iter().take(1).cloned())
    }

    /// Parent key, or `None` for a single-segment key.
    pub fn parent(&self) -> Option<ResourceKey> {
        if self.segments.len() < 2 {
            return None;
        }
        ResourceKey::new(self.segments[..self.segments.len() - 1].to_vec()).ok()
    }

    /// Strict ancestors from the root down.
    pub fn ancestors(&self) -> Vec<ResourceKey> {
        let mut chain = Vec::with_capacity(self.segments.len().saturating_sub(1));
        let mut current = self.parent();
        while let Some(key) = current {
            current = key.parent();
            chain.push(key);
        }
        chain.reverse();
        chain
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for ResourceKey {}

impl Hash for ResourceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceKey({})", self.canonical)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Build a [`ResourceKey`] from JSON-like segment literals.
///
/// ```
/// let key = almanac::key!["sellers", "list", {"status": "pending"}].unwrap();
/// assert_eq!(key.serialize(), r#"["sellers","list",{"status":"pending"}]"#);
/// ```
#[macro_export]
macro_rules! key {
    ($($segment:tt),+ $(,)?) => {
        $crate::sync::ResourceKey::from_json(&$crate::sync::__json!([$($segment),+]))
    };
}

pub fn equals(a: &ResourceKey, b: &ResourceKey) -> bool {
    a == b
}

pub fn is_ancestor(prefix: &ResourceKey, key: &ResourceKey) -> bool {
    prefix.is_ancestor_of(key)
}

pub fn serialize(key: &ResourceKey) -> &str {
    key.serialize()
}

fn strip_nulls(map: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    map.into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| (name, strip_nested_nulls(value)))
        .collect()
}

fn strip_nested_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(name, value)| (name, strip_nested_nulls(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nested_nulls).collect()),
        other => other,
    }
}

fn canonical_segment(segment: &Segment) -> String {
    let mut out = String::new();
    match segment {
        Segment::Text(text) => write_string(text, &mut out),
        Segment::Number(number) => out.push_str(&number.to_string()),
        Segment::Record(map) => write_members(map.iter(), &mut out),
        Segment::Absent => out.push_str("{}"),
    }
    out
}

fn write_string(text: &str, out: &mut String) {
    out.push_str(&Value::from(text).to_string());
}

fn write_members<'a>(members: impl Iterator<Item = (&'a String, &'a Value)>, out: &mut String) {
    // Sort explicitly: serde_json may be built with `preserve_order`.
    let mut members: Vec<_> = members.collect();
    members.sort_by(|(a, _), (b, _)| a.cmp(b));

    out.push('{');
    for (index, (name, value)) in members.into_iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_string(name, out);
        out.push(':');
        write_value(value, out);
    }
    out.push('}');
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_members(map.iter(), out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::String(text) => write_string(text, out),
        scalar => out.push_str(&scalar.to_string()),
    }
}
