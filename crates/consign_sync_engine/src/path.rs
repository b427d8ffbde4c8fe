//! Field paths and the path mutator.
//!
//! A [`FieldPath`] is a dot-separated address into a settings document
//! (`"thresholds.highValueSale"`). Writes go through [`set_path`], which
//! works on a clone so the previous document stays intact for anyone
//! still holding it.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '.';

/// A dot-separated address into a settings document.
///
/// Every segment is non-empty. Paths order lexicographically, which keeps
/// a parent directly before its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(String);

impl FieldPath {
    /// Parses a dot-separated path.
    pub fn parse(raw: &str) -> SyncResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.split(PATH_SEPARATOR).any(str::is_empty) {
            return Err(SyncError::InvalidPath(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the path as written.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(PATH_SEPARATOR)
    }

    /// Returns the number of segments.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Returns true if `other` lies strictly below this path.
    pub fn is_ancestor_of(&self, other: &FieldPath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0[self.0.len()..].starts_with(PATH_SEPARATOR)
    }

    /// Returns the remainder of this path below `ancestor`.
    pub fn relative_to(&self, ancestor: &FieldPath) -> Option<FieldPath> {
        if ancestor.is_ancestor_of(self) {
            Some(FieldPath(self.0[ancestor.0.len() + 1..].to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FieldPath {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for FieldPath {
    type Error = SyncError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FieldPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Returns a copy of `doc` with `value` stored at `path`.
///
/// Missing or null intermediates become empty objects. The input is
/// never modified.
pub fn set_path(doc: &Value, path: &FieldPath, value: Value) -> SyncResult<Value> {
    let mut next = doc.clone();
    set_in_place(&mut next, path, value)?;
    Ok(next)
}

/// Stores `value` at `path` inside `target`.
///
/// On error `target` may hold freshly created empty intermediates but no
/// existing field is overwritten; callers that need atomicity work on a
/// clone (see [`set_path`]).
pub fn set_in_place(target: &mut Value, path: &FieldPath, value: Value) -> SyncResult<()> {
    let segments: Vec<&str> = path.segments().collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(SyncError::InvalidPath(path.to_string()));
    };

    let mut cursor = target;
    let mut walked: Option<&str> = None;
    for segment in parents {
        cursor = object_at(cursor, path, walked)?
            .entry((*segment).to_string())
            .or_insert(Value::Null);
        walked = Some(*segment);
    }

    object_at(cursor, path, walked)?.insert((*last).to_string(), value);
    Ok(())
}

fn object_at<'a>(
    value: &'a mut Value,
    path: &FieldPath,
    segment: Option<&str>,
) -> SyncResult<&'a mut Map<String, Value>> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(SyncError::PathConflict {
            path: path.to_string(),
            segment: segment.unwrap_or_default().to_string(),
        }),
    }
}

/// Reads the value at `path`, if every segment resolves.
pub fn get_path<'a>(doc: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    path.segments()
        .try_fold(doc, |cursor, segment| cursor.as_object()?.get(segment))
}

/// Builds a nested object out of flat `path -> value` entries.
pub fn expand<'a, I>(entries: I) -> SyncResult<Value>
where
    I: IntoIterator<Item = (&'a FieldPath, &'a Value)>,
{
    let mut nested = Value::Object(Map::new());
    for (path, value) in entries {
        set_in_place(&mut nested, path, value.clone())?;
    }
    Ok(nested)
}

/// Flat key to nested path lookup for one settings domain.
///
/// Some forms address fields by a flat key (`"salesTaxRate"`) that lives
/// at a nested path (`"tax.salesTaxRate"`). Keys without an alias are
/// parsed as paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathAliases {
    aliases: HashMap<String, FieldPath>,
}

impl PathAliases {
    /// Creates an empty alias table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from `(key, path)` pairs.
    pub fn from_pairs<'a, I>(pairs: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut table = Self::new();
        for (key, path) in pairs {
            table.insert(key, FieldPath::parse(path)?);
        }
        Ok(table)
    }

    /// Adds or replaces an alias.
    pub fn insert(&mut self, key: impl Into<String>, path: FieldPath) {
        self.aliases.insert(key.into(), path);
    }

    /// Resolves a key to the path it addresses.
    pub fn resolve(&self, key: &str) -> SyncResult<FieldPath> {
        match self.aliases.get(key) {
            Some(path) => Ok(path.clone()),
            None => FieldPath::parse(key),
        }
    }

    /// Number of aliases.
    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    /// Returns true if there are no aliases.
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}
