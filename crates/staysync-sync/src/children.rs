//! Child and bridge row resolution.
//!
//! Children arrive tagged with their parent's external id. Before they can be
//! upserted every surrogate FK must be filled from a key map built from rows
//! already persisted in the same region.

use std::collections::HashMap;

use serde_json::Value;
use staysync_core::{external_key, ChildSpec, Row};
use staysync_transform::ChildRow;
use tracing::{debug, warn};

/// External id to surrogate id for one table in one region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMap(HashMap<String, i64>);

impl KeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, external_id: impl Into<String>, id: i64) {
        self.0.insert(external_id.into(), id);
    }

    pub fn get(&self, external_id: &str) -> Option<i64> {
        self.0.get(external_id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, i64)> for KeyMap {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Key maps for the entities a child's references point at, by entity name.
pub type KeyMaps = HashMap<String, KeyMap>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildResolution {
    pub ready: Vec<Row>,
    /// No persisted parent, or a mandatory reference could not be found.
    pub dropped: usize,
    /// Optional references left null.
    pub unresolved_optional: usize,
}

/// Fills `parent_fk` and every declared reference column.
///
/// A row is emitted only when its parent and all mandatory references
/// resolved; a bridge row with one resolved side is dropped, not half-written.
pub fn resolve_children(child: &ChildSpec, rows: Vec<ChildRow>, parents: &KeyMap, references: &KeyMaps) -> ChildResolution {
    let empty = KeyMap::new();
    let mut resolution = ChildResolution::default();
    let mut orphaned = 0usize;
    let mut unmatched_refs = 0usize;

    'rows: for row in rows {
        let Some(parent_id) = parents.get(&row.parent_external_id) else {
            orphaned += 1;
            debug!(child = %child.name, parent = %row.parent_external_id, "no persisted parent for child row");
            continue;
        };
        let mut values = row.values;
        values.insert(child.parent_fk.clone(), Value::from(parent_id));

        for reference in &child.references {
            let map = references.get(&reference.parent).unwrap_or(&empty);
            let resolved = values
                .get(&reference.via)
                .and_then(external_key)
                .and_then(|ext| map.get(&ext));
            match resolved {
                Some(id) => {
                    values.insert(reference.column.clone(), Value::from(id));
                }
                None if reference.mandatory => {
                    unmatched_refs += 1;
                    debug!(
                        child = %child.name,
                        column = %reference.column,
                        via = ?values.get(&reference.via),
                        "mandatory reference unresolved"
                    );
                    continue 'rows;
                }
                None => {
                    values.insert(reference.column.clone(), Value::Null);
                    resolution.unresolved_optional += 1;
                }
            }
        }
        resolution.ready.push(values);
    }

    resolution.dropped = orphaned + unmatched_refs;
    if orphaned > 0 {
        warn!(child = %child.name, table = %child.table, dropped = orphaned, "dropping child rows without a persisted parent");
    }
    if unmatched_refs > 0 {
        warn!(
            child = %child.name,
            table = %child.table,
            dropped = unmatched_refs,
            "dropping child rows with an unresolved mandatory reference"
        );
    }
    resolution
}
