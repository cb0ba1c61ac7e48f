//! Pure record transformer: one raw API record becomes one parent row plus
//! row sets for each embedded child table. No I/O happens here.

use std::collections::BTreeMap;

use serde_json::Value;
use staysync_core::{external_key, ChildSource, ChildSpec, EntitySpec, FieldMapping, RegionCode, Row, REGION_COLUMN};
use thiserror::Error;
use tracing::{info, warn};

mod cast;

pub use cast::apply_cast;

pub const CRATE_NAME: &str = "staysync-transform";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing external id field {0}")]
    MissingExternalId(String),
    #[error("missing required field {0}")]
    MissingField(String),
    #[error("natural key column {0} is empty")]
    MissingKey(String),
}

/// Child row tagged with its parent's external id. The surrogate FK is filled
/// in later by the child resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRow {
    pub parent_external_id: String,
    pub values: Row,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    pub external_id: String,
    pub row: Row,
    /// Embedded children only, keyed by child name.
    pub children: BTreeMap<String, Vec<ChildRow>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformedBatch {
    pub parents: Vec<Row>,
    pub children: BTreeMap<String, Vec<ChildRow>>,
    pub dropped: usize,
    pub filtered: usize,
    pub child_dropped: usize,
}

impl TransformedBatch {
    /// External ids of the parents in this batch, in input order.
    pub fn external_ids<'a>(&'a self, column: &'a str) -> impl Iterator<Item = String> + 'a {
        self.parents.iter().filter_map(move |row| row.get(column).and_then(external_key))
    }
}

#[derive(Debug, Clone)]
pub struct Transformer<'a> {
    entity: &'a EntitySpec,
    region: RegionCode,
}

impl<'a> Transformer<'a> {
    pub fn new(entity: &'a EntitySpec, region: RegionCode) -> Self {
        Self { entity, region }
    }

    pub fn entity(&self) -> &EntitySpec {
        self.entity
    }

    /// `keep_if` filter; records failing it are skipped, not dropped.
    pub fn keeps(&self, record: &Value) -> bool {
        match &self.entity.keep_if {
            Some(filter) => record.get(&filter.field) == Some(&filter.equals),
            None => true,
        }
    }

    pub fn transform(&self, record: &Value) -> Result<TransformedRecord, DropReason> {
        let object = record.as_object().ok_or(DropReason::NotAnObject)?;
        let id_field = &self.entity.external_id.field;
        let external_id = object
            .get(id_field)
            .and_then(external_key)
            .ok_or_else(|| DropReason::MissingExternalId(id_field.clone()))?;
        check_required(object, &self.entity.required)?;

        let mut row = self.base_row();
        apply_mappings(&self.entity.mappings, object, &mut row);
        row.insert(self.entity.external_id.column.clone(), Value::String(external_id.clone()));
        check_key(&row, self.entity.natural_key.columns(), |_| false)?;

        let mut children = BTreeMap::new();
        for child in &self.entity.children {
            let ChildSource::Embedded { field } = &child.source else {
                continue;
            };
            let Some(items) = object.get(field).and_then(Value::as_array) else {
                continue;
            };
            let mut rows = Vec::with_capacity(items.len());
            for item in items {
                match self.transform_child(child, &external_id, item) {
                    Ok(row) => rows.push(row),
                    Err(reason) => warn!(
                        entity = %self.entity.name,
                        child = %child.name,
                        parent = %external_id,
                        %reason,
                        "dropping child record"
                    ),
                }
            }
            children.insert(child.name.clone(), rows);
        }

        Ok(TransformedRecord {
            external_id,
            row,
            children,
        })
    }

    /// Transforms one child record, embedded or fetched from a child endpoint.
    pub fn transform_child(&self, child: &ChildSpec, parent_external_id: &str, record: &Value) -> Result<ChildRow, DropReason> {
        let object = record.as_object().ok_or(DropReason::NotAnObject)?;
        check_required(object, &child.required)?;

        let mut values = self.base_row();
        apply_mappings(&child.mappings, object, &mut values);
        check_key(&values, child.natural_key.columns(), |column| {
            column == child.parent_fk || child.references.iter().any(|r| r.column == column)
        })?;

        Ok(ChildRow {
            parent_external_id: parent_external_id.to_string(),
            values,
        })
    }

    pub fn transform_batch(&self, records: &[Value]) -> TransformedBatch {
        let mut batch = TransformedBatch::default();
        for child in &self.entity.children {
            batch.children.insert(child.name.clone(), Vec::new());
        }

        for record in records {
            if !self.keeps(record) {
                batch.filtered += 1;
                continue;
            }
            match self.transform(record) {
                Ok(transformed) => {
                    for (name, rows) in transformed.children {
                        let expected = record_child_count(self.entity, &name, record);
                        batch.child_dropped += expected.saturating_sub(rows.len());
                        batch.children.entry(name).or_default().extend(rows);
                    }
                    batch.parents.push(transformed.row);
                }
                Err(reason) => {
                    batch.dropped += 1;
                    warn!(
                        entity = %self.entity.name,
                        region = %self.region,
                        id = ?record.get(&self.entity.external_id.field),
                        %reason,
                        "dropping record"
                    );
                }
            }
        }

        info!(
            entity = %self.entity.name,
            region = %self.region,
            parents = batch.parents.len(),
            dropped = batch.dropped,
            filtered = batch.filtered,
            child_dropped = batch.child_dropped,
            "transformed batch"
        );
        batch
    }

    fn base_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(REGION_COLUMN.to_string(), Value::String(self.region.to_string()));
        row
    }
}

fn record_child_count(entity: &EntitySpec, child: &str, record: &Value) -> usize {
    match entity.child(child).map(|c| &c.source) {
        Some(ChildSource::Embedded { field }) => record.get(field).and_then(Value::as_array).map_or(0, Vec::len),
        _ => 0,
    }
}

fn check_required(object: &Row, required: &[String]) -> Result<(), DropReason> {
    for field in required {
        let present = match object.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        };
        if !present {
            return Err(DropReason::MissingField(field.clone()));
        }
    }
    Ok(())
}

/// Natural-key columns must be filled after mapping, except FK columns the
/// resolver fills later.
fn check_key(row: &Row, key: &[String], filled_later: impl Fn(&str) -> bool) -> Result<(), DropReason> {
    for column in key {
        if filled_later(column) {
            continue;
        }
        let empty = match row.get(column) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        };
        if empty {
            return Err(DropReason::MissingKey(column.clone()));
        }
    }
    Ok(())
}

fn apply_mappings(mappings: &[FieldMapping], object: &Row, row: &mut Row) {
    for mapping in mappings {
        match mapping {
            FieldMapping::Rename { from, to, cast } => {
                let value = object.get(from).cloned().unwrap_or(Value::Null);
                row.insert(to.clone(), apply_cast(*cast, value));
            }
            FieldMapping::Flatten { from, fields, cast } => {
                let nested = object.get(from).and_then(Value::as_object);
                for (field, column) in fields {
                    let value = nested.and_then(|n| n.get(field)).cloned().unwrap_or(Value::Null);
                    row.insert(column.clone(), apply_cast(*cast, value));
                }
            }
            FieldMapping::Json { from, to } => {
                let value = match object.get(from) {
                    None | Some(Value::Null) => Value::Null,
                    Some(Value::Array(a)) if a.is_empty() => Value::Null,
                    Some(Value::Object(o)) if o.is_empty() => Value::Null,
                    Some(other) => Value::String(other.to_string()),
                };
                row.insert(to.clone(), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use staysync_core::Catalog;

    fn catalog() -> Catalog {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../catalog.yaml");
        Catalog::load(path).expect("catalog.yaml")
    }

    fn region() -> RegionCode {
        RegionCode::new("nashville").unwrap()
    }

    fn sample_property() -> Value {
        json!({
            "id": 12345,
            "company_id": "8558",
            "name": "Beach House 101",
            "status": "active",
            "city": "Nashville",
            "latitude": "36.1627",
            "longitude": "-86.7816",
            "notes": {"about": "Beautiful beach property", "access": "Front door code: 1234"},
            "photos": [
                {"id": "photo1", "url": "https://example.com/photo1.jpg", "default": true},
                {"id": "photo2", "url": "https://example.com/photo2.jpg", "default": false},
                {"url": "https://example.com/no-id.jpg"}
            ]
        })
    }

    #[test]
    fn property_fields_are_mapped_and_cast() {
        let catalog = catalog();
        let properties = catalog.entity("properties").unwrap();
        let record = Transformer::new(properties, region()).transform(&sample_property()).unwrap();

        assert_eq!(record.external_id, "12345");
        assert_eq!(record.row["region_code"], json!("nashville"));
        assert_eq!(record.row["property_id"], json!("12345"));
        assert_eq!(record.row["company_id"], json!(8558));
        assert_eq!(record.row["property_name"], json!("Beach House 101"));
        assert_eq!(record.row["latitude_numeric"], json!(36.1627));
        assert_eq!(record.row["property_notes_general"], json!("Beautiful beach property"));
        assert_eq!(record.row["property_notes_wifi"], Value::Null);
    }

    #[test]
    fn embedded_children_are_tagged_with_parent_external_id() {
        let catalog = catalog();
        let properties = catalog.entity("properties").unwrap();
        let record = Transformer::new(properties, region()).transform(&sample_property()).unwrap();

        let photos = &record.children["photos"];
        assert_eq!(photos.len(), 2, "photo without id is dropped");
        assert!(photos.iter().all(|p| p.parent_external_id == "12345"));
        assert_eq!(photos[0].values["photo_id"], json!("photo1"));
        assert_eq!(photos[0].values["is_default"], json!(true));
        assert_eq!(photos[0].values["region_code"], json!("nashville"));
    }

    #[test]
    fn task_currency_and_nested_fields() {
        let catalog = catalog();
        let tasks = catalog.entity("tasks").unwrap();
        let task = json!({
            "id": 9001,
            "home_id": 12345,
            "name": "Turnover clean",
            "rate_paid": "50.00 USD",
            "type_department": "housekeeping",
            "created_by": {"id": "user001", "name": "Admin User"},
            "linked_reservation": {"id": "res123"},
            "type_task_status": {"code": "SCHED"}
        });
        let record = Transformer::new(tasks, region()).transform(&task).unwrap();
        assert_eq!(record.row["task_id"], json!("9001"));
        assert_eq!(record.row["home_id"], json!("12345"));
        assert_eq!(record.row["rate_paid"], json!(50.0));
        assert_eq!(record.row["created_by_id"], json!("user001"));
        assert_eq!(record.row["task_status_code"], json!("SCHED"));
        assert_eq!(record.row["linked_reservation_id"], json!("res123"));
    }

    #[test]
    fn null_values_stay_null() {
        let catalog = catalog();
        let tasks = catalog.entity("tasks").unwrap();
        let task = json!({"id": 1, "home_id": 2, "description": null, "rate_paid": null});
        let record = Transformer::new(tasks, region()).transform(&task).unwrap();
        assert_eq!(record.row["task_description"], Value::Null);
        assert_eq!(record.row["rate_paid"], Value::Null);
        assert_eq!(record.row["created_by_id"], Value::Null);
    }

    #[test]
    fn batch_counts_drops_and_filters_without_failing() {
        let catalog = catalog();
        let properties = catalog.entity("properties").unwrap();
        let records = vec![
            sample_property(),
            json!({"id": 2, "status": "inactive"}),
            json!({"name": "no id", "status": "active"}),
            json!("not an object"),
            json!({"id": "  ", "status": "active"}),
        ];
        let batch = Transformer::new(properties, region()).transform_batch(&records);
        assert_eq!(batch.parents.len(), 1);
        assert_eq!(batch.filtered, 2, "string record and inactive one fail keep_if");
        assert_eq!(batch.dropped, 2);
        assert_eq!(batch.children["photos"].len(), 2);
        assert_eq!(batch.child_dropped, 1);
        assert_eq!(batch.external_ids("property_id").collect::<Vec<_>>(), vec!["12345"]);
    }

    #[test]
    fn endpoint_children_use_the_same_mapping_rules() {
        let catalog = catalog();
        let tasks = catalog.entity("tasks").unwrap();
        let comments = tasks.child("comments").unwrap();
        let transformer = Transformer::new(tasks, region());

        let row = transformer
            .transform_child(comments, "9001", &json!({"id": 77, "comment": "done", "author": {"id": 5, "name": "Ana"}}))
            .unwrap();
        assert_eq!(row.parent_external_id, "9001");
        assert_eq!(row.values["comment_id"], json!("77"));
        assert_eq!(row.values["author_name"], json!("Ana"));

        let err = transformer.transform_child(comments, "9001", &json!({"comment": "no id"})).unwrap_err();
        assert_eq!(err, DropReason::MissingKey("comment_id".to_string()));
    }

    #[test]
    fn json_mapping_stores_text_and_skips_empty_structures() {
        let catalog = catalog();
        let tasks = catalog.entity("tasks").unwrap();
        let requirements = tasks.child("requirements").unwrap();
        let transformer = Transformer::new(tasks, region());
        let row = transformer
            .transform_child(requirements, "9001", &json!({"id": 3, "action": ["wipe", "mop"], "photos": []}))
            .unwrap();
        assert_eq!(row.values["action"], json!(r#"["wipe","mop"]"#));
        assert_eq!(row.values["photos"], Value::Null);
    }

    #[test]
    fn reservation_without_stay_dates_is_dropped_and_the_batch_continues() {
        let catalog = catalog();
        let reservations = catalog.entity("reservations").unwrap();
        let transformer = Transformer::new(reservations, region());
        let records = vec![
            json!({"id": 1, "property_id": 101, "checkin_date": "2024-03-01", "checkout_date": "2024-03-05"}),
            json!({"id": 2, "property_id": 101, "checkin_date": null, "checkout_date": "2024-03-05",
                   "guests": [{"name": "Pat"}]}),
            json!({"id": 3, "property_id": 101, "checkin_date": "2024-03-07"}),
            json!({"id": 4, "property_id": " ", "checkin_date": "2024-03-07", "checkout_date": "2024-03-09"}),
            json!({"id": 5, "property_id": 102, "checkin_date": "2024-03-10", "checkout_date": "2024-03-12"}),
        ];

        assert_eq!(
            transformer.transform(&records[1]).unwrap_err(),
            DropReason::MissingField("checkin_date".to_string())
        );
        assert_eq!(
            transformer.transform(&records[2]).unwrap_err(),
            DropReason::MissingField("checkout_date".to_string())
        );

        let batch = transformer.transform_batch(&records);
        assert_eq!(batch.dropped, 3);
        assert_eq!(batch.filtered, 0);
        assert_eq!(batch.external_ids("reservation_id").collect::<Vec<_>>(), vec!["1", "5"]);
        assert!(batch.children["guests"].is_empty(), "children of a dropped record are not emitted");
    }

    #[test]
    fn required_child_fields_drop_only_that_child() {
        let mut catalog = catalog();
        let tasks = catalog.entities.iter_mut().find(|e| e.name == "tasks").unwrap();
        tasks.children.iter_mut().find(|c| c.name == "photos").unwrap().required = vec!["url".to_string()];
        let tasks = catalog.entity("tasks").unwrap();

        let task = json!({
            "id": 9001,
            "home_id": 101,
            "photos": [
                {"id": "p1", "url": "https://example.com/p1.jpg"},
                {"id": "p2", "url": null}
            ]
        });
        let batch = Transformer::new(tasks, region()).transform_batch(&[task]);
        assert_eq!(batch.parents.len(), 1);
        assert_eq!(batch.children["photos"].len(), 1);
        assert_eq!(batch.child_dropped, 1);

        let err = Transformer::new(tasks, region())
            .transform_child(tasks.child("photos").unwrap(), "9001", &json!({"id": "p3"}))
            .unwrap_err();
        assert_eq!(err, DropReason::MissingField("url".to_string()));
    }
}
