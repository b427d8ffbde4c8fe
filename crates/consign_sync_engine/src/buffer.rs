//! Pending change buffer.
//!
//! Edits accumulate here between saves, one entry per path with the
//! latest value. [`PendingChangeBuffer::take`] hands the entries over by
//! value and opens a new generation, so edits arriving while a save is in
//! flight can never leak into the payload already sent.

use crate::error::{SyncError, SyncResult};
use crate::path::{expand, set_path, FieldPath};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::mem;

/// Edits recorded since the last save was dispatched.
#[derive(Debug, Clone, Default)]
pub struct PendingChangeBuffer {
    entries: BTreeMap<FieldPath, Value>,
    generation: u64,
    edits: u64,
}

impl PendingChangeBuffer {
    /// Creates an empty buffer at generation 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` at `path`, last write wins.
    ///
    /// A write to `a` supersedes pending writes below it (`a.b`, `a.c.d`).
    /// A write below a pending ancestor is folded into the ancestor's
    /// value, so the buffer never holds two overlapping entries.
    pub fn record(&mut self, path: FieldPath, value: Value) -> SyncResult<()> {
        let ancestor = self
            .entries
            .keys()
            .find(|pending| pending.is_ancestor_of(&path))
            .cloned();

        match ancestor.and_then(|a| path.relative_to(&a).map(|rel| (a, rel))) {
            Some((ancestor, relative)) => {
                if let Some(slot) = self.entries.get_mut(&ancestor) {
                    *slot = set_path(slot, &relative, value)?;
                }
            }
            None => {
                self.entries.retain(|pending, _| !path.is_ancestor_of(pending));
                self.entries.insert(path, value);
            }
        }

        self.edits += 1;
        Ok(())
    }

    /// Snapshots the pending entries and starts the next generation.
    pub fn take(&mut self) -> ChangeSet {
        let snapshot = ChangeSet {
            generation: self.generation,
            entries: mem::take(&mut self.entries),
            edits: mem::take(&mut self.edits),
        };
        self.generation += 1;
        snapshot
    }

    /// Drops every pending entry and starts the next generation.
    pub fn discard(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.edits = 0;
        self.generation += 1;
        dropped
    }

    /// Returns the pending value for `path`.
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        self.entries.get(path)
    }

    /// Number of distinct pending paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The generation that the next [`take`](Self::take) will carry.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of edits recorded in this generation, including overwrites.
    pub fn edits(&self) -> u64 {
        self.edits
    }
}

/// An immutable snapshot of pending changes, as sent to the settings API.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeSet {
    generation: u64,
    entries: BTreeMap<FieldPath, Value>,
    edits: u64,
}

impl ChangeSet {
    /// Builds a change set directly from entries (generation 0).
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (FieldPath, Value)>,
    {
        let entries: BTreeMap<_, _> = entries.into_iter().collect();
        Self {
            generation: 0,
            edits: entries.len() as u64,
            entries,
        }
    }

    /// Buffer generation this snapshot was taken from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of edits coalesced into this snapshot.
    pub fn edits(&self) -> u64 {
        self.edits
    }

    /// The flat `path -> value` entries in path order.
    pub fn entries(&self) -> &BTreeMap<FieldPath, Value> {
        &self.entries
    }

    /// Returns the value sent for `path`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let path = FieldPath::parse(path).ok()?;
        self.entries.get(&path)
    }

    /// Iterates over the changed paths.
    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.entries.keys()
    }

    /// Number of changed paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no changes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expands the changes into a nested object.
    pub fn to_nested(&self) -> SyncResult<Value> {
        expand(&self.entries)
    }

    /// The PATCH body: a JSON object keyed by field path.
    ///
    /// Each value replaces whatever the document holds at its path, so an
    /// object value replaces the whole subtree rather than merging into it.
    pub fn to_patch_body(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(path, value)| (path.as_str().to_string(), value.clone()))
                .collect::<Map<_, _>>(),
        )
    }

    /// Parses a PATCH body produced by [`ChangeSet::to_patch_body`].
    pub fn from_patch_body(body: &Value) -> SyncResult<Self> {
        let Value::Object(entries) = body else {
            return Err(SyncError::Codec("patch body must be a JSON object".into()));
        };
        let entries = entries
            .iter()
            .map(|(path, value)| Ok((FieldPath::parse(path)?, value.clone())))
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(Self::from_entries(entries))
    }

    /// Applies the changes on top of `doc`, returning a new document.
    pub fn apply_to(&self, doc: &Value) -> SyncResult<Value> {
        let mut next = doc.clone();
        for (path, value) in &self.entries {
            next = set_path(&next, path, value.clone())?;
        }
        Ok(next)
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = (&'a FieldPath, &'a Value);
    type IntoIter = std::collections::btree_map::Iter<'a, FieldPath, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
