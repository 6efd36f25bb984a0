//! Document values and the edits between them.
//!
//! An [`Item`] is a schema tag plus a flat map of JSON fields. Two items can
//! be diffed into an [`Edit`] and an edit can be patched onto an item. Edits
//! carry the checksums of their source and destination so a reader can detect
//! a delta applied to the wrong base.
//!
//! Conflicts only arise when a patch is applied to a value that drifted from
//! the edit's source, which is what happens while folding several concurrent
//! edits during a merge:
//! - a locally-authored change always wins,
//! - between remote changes the greater canonical JSON value wins,
//! - an update beats a concurrent removal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::OnceLock;

use crate::checksum::{checksum_bytes, Checksum};

/// Namespace whose records describe signing sessions.
pub const SESSION_NAMESPACE: &str = "sessions";

/// Namespace of the null item.
pub const NULL_NAMESPACE: &str = "null";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    pub ns: String,
    pub version: u32,
}

impl Schema {
    pub fn new(ns: impl Into<String>, version: u32) -> Self {
        Self {
            ns: ns.into(),
            version,
        }
    }

    pub fn null() -> Self {
        Self::new(NULL_NAMESPACE, 0)
    }

    pub fn is_null(&self) -> bool {
        self.ns == NULL_NAMESPACE
    }

    pub fn is_session(&self) -> bool {
        self.ns == SESSION_NAMESPACE
    }

    /// Whether `other` should replace `self` as the schema of a merge.
    pub fn is_superseded_by(&self, other: &Schema) -> bool {
        if self.is_null() {
            return !other.is_null();
        }
        self.ns == other.ns && other.version > self.version
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "s")]
    schema: Schema,
    #[serde(rename = "d", default)]
    data: Map<String, Value>,
    #[serde(skip)]
    checksum: OnceLock<Checksum>,
    #[serde(skip)]
    locked: bool,
}

#[derive(Serialize)]
struct CanonicalItem<'a> {
    s: &'a Schema,
    d: &'a Map<String, Value>,
}

impl Item {
    pub fn new(schema: Schema, data: Map<String, Value>) -> Self {
        Self {
            schema,
            data,
            checksum: OnceLock::new(),
            locked: false,
        }
    }

    /// Build an item from `(field, value)` pairs.
    pub fn from_fields<K, I>(schema: Schema, fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let data = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self::new(schema, data)
    }

    /// The empty value every history starts from.
    pub fn null() -> Self {
        Self::new(Schema::null(), Map::new())
    }

    pub fn is_null(&self) -> bool {
        self.schema.is_null()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Freeze the item. Any later mutation is a programming error.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn locked(mut self) -> Self {
        self.lock();
        self
    }

    fn begin_mutation(&mut self) {
        assert!(!self.locked, "attempted to mutate a locked item");
        self.checksum.take();
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.begin_mutation();
        self.data.insert(field.into(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.begin_mutation();
        self.data.remove(field)
    }

    /// Move to `target` if it is a newer version of this schema, or if this is the null item.
    pub fn upgrade_schema(&mut self, target: &Schema) {
        if self.schema.is_superseded_by(target) {
            self.begin_mutation();
            self.schema = target.clone();
        }
    }

    pub fn checksum(&self) -> Checksum {
        *self.checksum.get_or_init(|| {
            let canonical = CanonicalItem {
                s: &self.schema,
                d: &self.data,
            };
            checksum_bytes(&serde_json::to_vec(&canonical).unwrap_or_default())
        })
    }

    /// Compute the edit that turns `self` into `other`.
    ///
    /// `local` tags the edit as authored by this replica's session, which
    /// decides conflicts when the edit is later folded into a merge.
    pub fn diff(&self, other: &Item, local: bool) -> Edit {
        let mut changes = Vec::new();
        for (field, value) in &other.data {
            match self.data.get(field) {
                None => changes.push(Change::Insert {
                    field: field.clone(),
                    to: value.clone(),
                }),
                Some(old) if old != value => changes.push(Change::Set {
                    field: field.clone(),
                    from: old.clone(),
                    to: value.clone(),
                }),
                Some(_) => {}
            }
        }
        for (field, old) in &self.data {
            if !other.data.contains_key(field) {
                changes.push(Change::Remove {
                    field: field.clone(),
                    from: old.clone(),
                });
            }
        }
        let upgrade = (self.schema != other.schema).then(|| other.schema.clone());
        Edit {
            changes,
            src_checksum: self.checksum(),
            dst_checksum: other.checksum(),
            upgrade,
            local,
        }
    }

    /// Apply `edit` in place.
    pub fn patch(&mut self, edit: &Edit) {
        self.begin_mutation();
        if let Some(schema) = &edit.upgrade {
            self.schema = schema.clone();
        }
        for change in &edit.changes {
            self.apply_change(change, edit.local);
        }
    }

    fn apply_change(&mut self, change: &Change, local: bool) {
        match change {
            Change::Insert { field, to } => match self.data.get(field) {
                Some(current) if current == to => {}
                Some(current) if !local && canonical_cmp(to, current) != Ordering::Greater => {}
                _ => {
                    self.data.insert(field.clone(), to.clone());
                }
            },
            Change::Set { field, from, to } => match self.data.get(field) {
                Some(current) if current == from || current == to => {
                    self.data.insert(field.clone(), to.clone());
                }
                Some(current) if !local && canonical_cmp(to, current) != Ordering::Greater => {}
                _ => {
                    self.data.insert(field.clone(), to.clone());
                }
            },
            Change::Remove { field, from } => match self.data.get(field) {
                Some(current) if current == from || local => {
                    self.data.remove(field);
                }
                _ => {}
            },
        }
    }
}

fn canonical_cmp(a: &Value, b: &Value) -> Ordering {
    let a = serde_json::to_string(a).unwrap_or_default();
    let b = serde_json::to_string(b).unwrap_or_default();
    a.cmp(&b)
}

impl Clone for Item {
    /// Clones are always unlocked.
    fn clone(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            data: self.data.clone(),
            checksum: self.checksum.clone(),
            locked: false,
        }
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.schema == other.schema && self.data == other.data
    }
}

impl Default for Item {
    fn default() -> Self {
        Self::null()
    }
}

/// A single field change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Change {
    /// Field absent in the source.
    Insert {
        #[serde(rename = "f")]
        field: String,
        to: Value,
    },
    Set {
        #[serde(rename = "f")]
        field: String,
        from: Value,
        to: Value,
    },
    Remove {
        #[serde(rename = "f")]
        field: String,
        from: Value,
    },
}

impl Change {
    pub fn field(&self) -> &str {
        match self {
            Change::Insert { field, .. } | Change::Set { field, .. } | Change::Remove { field, .. } => {
                field
            }
        }
    }
}

/// A named delta between two items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    #[serde(rename = "c", default)]
    pub changes: Vec<Change>,
    #[serde(rename = "src")]
    pub src_checksum: Checksum,
    #[serde(rename = "dst")]
    pub dst_checksum: Checksum,
    /// Schema the patched item moves to.
    #[serde(rename = "up", default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<Schema>,
    #[serde(skip)]
    pub local: bool,
}

impl Edit {
    pub fn is_empty(&self) -> bool {
        self.src_checksum == self.dst_checksum
    }
}
