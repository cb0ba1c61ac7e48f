//! Declarative entity catalog: which API records map to which tables, how
//! their children are extracted and how their foreign keys are resolved.
//!
//! The catalog is loaded from YAML and validated once at startup. Nothing
//! downstream re-checks table names, natural keys or pass ordering.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{is_identifier, MatchRule, NaturalKey, Referrer, RegionCode, TableSpec, REGION_COLUMN};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing catalog: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid region code {0:?}")]
    InvalidRegion(String),
    #[error("invalid {context} identifier {name:?}")]
    InvalidIdentifier { context: String, name: String },
    #[error("natural key must name at least one column")]
    EmptyNaturalKey,
    #[error("duplicate name {0:?}")]
    DuplicateName(String),
    #[error("natural key of {table} must include {column}")]
    NaturalKeyMissingColumn { table: String, column: String },
    #[error("{referenced_by} references unknown entity {name:?}")]
    UnknownEntity { referenced_by: String, name: String },
    #[error("unknown region {0:?}")]
    UnknownRegion(String),
    #[error("table {0:?} is not in the catalog")]
    UnknownTable(String),
    #[error("entity dependency cycle among {0:?}")]
    DependencyCycle(Vec<String>),
    #[error("{table}: {reason}")]
    Invalid { table: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cast {
    #[default]
    AsIs,
    String,
    Integer,
    Float,
    /// Leading numeric part of money strings like `"120.00 USD"`.
    Currency,
    Boolean,
}

/// Closed set of ways an API field can become a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldMapping {
    Rename {
        from: String,
        to: String,
        #[serde(default)]
        cast: Cast,
    },
    Flatten {
        from: String,
        fields: BTreeMap<String, String>,
        #[serde(default)]
        cast: Cast,
    },
    /// Nested structure stored verbatim as JSON text.
    Json { from: String, to: String },
}

impl FieldMapping {
    pub fn columns(&self) -> Vec<&str> {
        match self {
            FieldMapping::Rename { to, .. } | FieldMapping::Json { to, .. } => vec![to.as_str()],
            FieldMapping::Flatten { fields, .. } => fields.values().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalId {
    /// Field name in the API record.
    pub field: String,
    /// Column the id is stored in; always text.
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepIf {
    pub field: String,
    pub equals: Value,
}

/// Extraction fan-out: fetch the entity once per already-synced parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub parent: String,
    pub param: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChildSource {
    /// Array embedded in the parent record.
    Embedded { field: String },
    /// Separate endpoint per parent; `{id}` is replaced by the parent external id.
    Endpoint { template: String },
}

/// Extra FK on a child row, resolved from a column holding an external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildReference {
    pub column: String,
    pub via: String,
    pub parent: String,
    #[serde(default = "default_true")]
    pub mandatory: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub name: String,
    pub table: String,
    pub source: ChildSource,
    pub parent_fk: String,
    pub natural_key: NaturalKey,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub references: Vec<ChildReference>,
}

impl ChildSpec {
    pub fn table_spec(&self) -> Result<TableSpec, CatalogError> {
        Ok(TableSpec::new(&self.table, self.natural_key.clone())?
            .with_fk_columns(std::iter::once(self.parent_fk.clone()).chain(self.references.iter().map(|r| r.column.clone()))))
    }

    pub fn mapped_columns(&self) -> BTreeSet<&str> {
        self.mappings.iter().flat_map(FieldMapping::columns).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectPass {
    pub column: String,
    pub parent: String,
    /// Column on this table holding the parent's external id; may differ from
    /// the parent's own external-id column name.
    pub via: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeJoin {
    /// Already-resolved FK on the subject table (e.g. `property_pk`).
    pub column: String,
    /// Matching FK on the candidate table.
    pub parent_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubjectColumns {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub scheduled: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowColumns {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeuristicPass {
    pub column: String,
    pub parent: String,
    pub scope: ScopeJoin,
    pub subject: SubjectColumns,
    pub candidate: WindowColumns,
    pub rules: Vec<MatchRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForeignKeyPass {
    Direct(DirectPass),
    /// Optional relationships only; best effort.
    Heuristic(HeuristicPass),
}

impl ForeignKeyPass {
    pub fn column(&self) -> &str {
        match self {
            ForeignKeyPass::Direct(p) => &p.column,
            ForeignKeyPass::Heuristic(p) => &p.column,
        }
    }

    pub fn parent(&self) -> &str {
        match self {
            ForeignKeyPass::Direct(p) => &p.parent,
            ForeignKeyPass::Heuristic(p) => &p.parent,
        }
    }

    pub fn label(&self) -> String {
        match self {
            ForeignKeyPass::Direct(p) => format!("direct:{}", p.column),
            ForeignKeyPass::Heuristic(p) => format!("heuristic:{}", p.column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    pub table: String,
    pub endpoint: String,
    pub external_id: ExternalId,
    pub natural_key: NaturalKey,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub keep_if: Option<KeepIf>,
    #[serde(default)]
    pub supports_incremental: bool,
    /// Send the region's `company_id` as a query filter.
    #[serde(default)]
    pub company_filter: bool,
    #[serde(default)]
    pub partition: Option<Partition>,
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub children: Vec<ChildSpec>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyPass>,
}

impl EntitySpec {
    pub fn table_spec(&self) -> Result<TableSpec, CatalogError> {
        Ok(TableSpec::new(&self.table, self.natural_key.clone())?
            .with_fk_columns(self.foreign_keys.iter().map(|p| p.column().to_string())))
    }

    pub fn child(&self, name: &str) -> Option<&ChildSpec> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Other entities that must be synced before this one.
    pub fn depends_on(&self) -> BTreeSet<&str> {
        let mut deps: BTreeSet<&str> = self.foreign_keys.iter().map(ForeignKeyPass::parent).collect();
        if let Some(partition) = &self.partition {
            deps.insert(&partition.parent);
        }
        for child in &self.children {
            deps.extend(child.references.iter().map(|r| r.parent.as_str()));
        }
        deps.remove(self.name.as_str());
        deps
    }

    pub fn mapped_columns(&self) -> BTreeSet<&str> {
        let mut cols: BTreeSet<&str> = self.mappings.iter().flat_map(FieldMapping::columns).collect();
        cols.insert(&self.external_id.column);
        cols
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub code: RegionCode,
    pub name: String,
    #[serde(default)]
    pub company_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub regions: Vec<RegionSpec>,
    pub entities: Vec<EntitySpec>,
}

impl Catalog {
    pub fn from_yaml_str(text: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = serde_yaml::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn region(&self, code: &str) -> Option<&RegionSpec> {
        self.regions.iter().find(|r| r.code.as_str() == code)
    }

    pub fn entity(&self, name: &str) -> Option<&EntitySpec> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Entity or child table named `table`, carrying every catalog column
    /// that references it.
    pub fn table_spec(&self, table: &str) -> Result<TableSpec, CatalogError> {
        let spec = self
            .entities
            .iter()
            .find_map(|entity| {
                if entity.table == table {
                    return Some(entity.table_spec());
                }
                entity.children.iter().find(|c| c.table == table).map(ChildSpec::table_spec)
            })
            .ok_or_else(|| CatalogError::UnknownTable(table.to_string()))??;
        Ok(spec.with_referrers(self.referrers_of(table)))
    }

    /// Columns holding surrogate ids of `table`: entity FK passes, child
    /// parent FKs and child references.
    pub fn referrers_of(&self, table: &str) -> Vec<Referrer> {
        let targets = |entity_name: &str| self.entity(entity_name).is_some_and(|e| e.table == table);
        let mut referrers = Vec::new();
        for entity in &self.entities {
            for pass in entity.foreign_keys.iter().filter(|p| targets(p.parent())) {
                referrers.push(Referrer {
                    table: entity.table.clone(),
                    column: pass.column().to_string(),
                    natural_key: entity.natural_key.clone(),
                });
            }
            for child in &entity.children {
                if entity.table == table {
                    referrers.push(Referrer {
                        table: child.table.clone(),
                        column: child.parent_fk.clone(),
                        natural_key: child.natural_key.clone(),
                    });
                }
                for reference in child.references.iter().filter(|r| targets(&r.parent)) {
                    referrers.push(Referrer {
                        table: child.table.clone(),
                        column: reference.column.clone(),
                        natural_key: child.natural_key.clone(),
                    });
                }
            }
        }
        let mut seen = BTreeSet::new();
        referrers.retain(|r| seen.insert((r.table.clone(), r.column.clone())));
        referrers
    }

    /// `all` or a single region code.
    pub fn select_regions(&self, selector: &str) -> Result<Vec<&RegionSpec>, CatalogError> {
        if selector == "all" {
            return Ok(self.regions.iter().collect());
        }
        self.region(selector)
            .map(|r| vec![r])
            .ok_or_else(|| CatalogError::UnknownRegion(selector.to_string()))
    }

    /// `all` or a single entity name; `all` comes back in dependency order.
    pub fn select_entities(&self, selector: &str) -> Result<Vec<&EntitySpec>, CatalogError> {
        if selector == "all" {
            return self.sync_order();
        }
        self.entity(selector).map(|e| vec![e]).ok_or_else(|| CatalogError::UnknownEntity {
            referenced_by: "selection".to_string(),
            name: selector.to_string(),
        })
    }

    /// Entities ordered so every dependency precedes its dependents. Ties keep
    /// declaration order.
    pub fn sync_order(&self) -> Result<Vec<&EntitySpec>, CatalogError> {
        let mut remaining: Vec<&EntitySpec> = self.entities.iter().collect();
        let mut done: BTreeSet<&str> = BTreeSet::new();
        let mut ordered = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .position(|e| e.depends_on().iter().all(|d| done.contains(d)));
            match ready {
                Some(idx) => {
                    let entity = remaining.remove(idx);
                    done.insert(&entity.name);
                    ordered.push(entity);
                }
                None => {
                    return Err(CatalogError::DependencyCycle(
                        remaining.iter().map(|e| e.name.clone()).collect(),
                    ))
                }
            }
        }
        Ok(ordered)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut region_codes = BTreeSet::new();
        for region in &self.regions {
            if !region_codes.insert(region.code.as_str()) {
                return Err(CatalogError::DuplicateName(region.code.to_string()));
            }
        }

        let mut entity_names = BTreeSet::new();
        let mut tables = BTreeSet::new();
        let by_name: HashMap<&str, &EntitySpec> = self.entities.iter().map(|e| (e.name.as_str(), e)).collect();

        for entity in &self.entities {
            ident("entity", &entity.name)?;
            if !entity_names.insert(entity.name.as_str()) {
                return Err(CatalogError::DuplicateName(entity.name.clone()));
            }
            if !tables.insert(entity.table.as_str()) {
                return Err(CatalogError::DuplicateName(entity.table.clone()));
            }
            validate_entity(entity, &by_name)?;
            for child in &entity.children {
                if !tables.insert(child.table.as_str()) {
                    return Err(CatalogError::DuplicateName(child.table.clone()));
                }
            }
        }

        self.sync_order().map(|_| ())
    }
}

fn ident(context: &str, name: &str) -> Result<(), CatalogError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(CatalogError::InvalidIdentifier {
            context: context.to_string(),
            name: name.to_string(),
        })
    }
}

fn invalid(table: &str, reason: impl Into<String>) -> CatalogError {
    CatalogError::Invalid {
        table: table.to_string(),
        reason: reason.into(),
    }
}

fn known_entity<'a>(
    by_name: &HashMap<&str, &'a EntitySpec>,
    referenced_by: &str,
    name: &str,
) -> Result<&'a EntitySpec, CatalogError> {
    by_name.get(name).copied().ok_or_else(|| CatalogError::UnknownEntity {
        referenced_by: referenced_by.to_string(),
        name: name.to_string(),
    })
}

fn validate_mappings(context: &str, mappings: &[FieldMapping]) -> Result<(), CatalogError> {
    let mut seen = BTreeSet::new();
    for mapping in mappings {
        for column in mapping.columns() {
            ident(context, column)?;
            if !seen.insert(column) {
                return Err(invalid(context, format!("column {column} mapped twice")));
            }
        }
    }
    Ok(())
}

fn validate_entity(entity: &EntitySpec, by_name: &HashMap<&str, &EntitySpec>) -> Result<(), CatalogError> {
    let table = entity.table.as_str();
    ident("table", table)?;
    ident("column", &entity.external_id.column)?;
    validate_mappings(table, &entity.mappings)?;
    if entity.mappings.iter().flat_map(FieldMapping::columns).any(|c| c == entity.external_id.column) {
        return Err(invalid(
            table,
            format!("{} is filled from external_id and cannot be mapped again", entity.external_id.column),
        ));
    }

    for column in [entity.external_id.column.as_str(), REGION_COLUMN] {
        if !entity.natural_key.contains(column) {
            return Err(CatalogError::NaturalKeyMissingColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
    }

    if let Some(partition) = &entity.partition {
        known_entity(by_name, table, &partition.parent)?;
    }

    let mapped = entity.mapped_columns();
    let mut resolved_direct: BTreeSet<&str> = BTreeSet::new();
    for pass in &entity.foreign_keys {
        ident("column", pass.column())?;
        let parent = known_entity(by_name, table, pass.parent())?;
        match pass {
            ForeignKeyPass::Direct(direct) => {
                if !mapped.contains(direct.via.as_str()) {
                    return Err(invalid(table, format!("direct pass via column {} is never mapped", direct.via)));
                }
                resolved_direct.insert(&direct.column);
            }
            ForeignKeyPass::Heuristic(heuristic) => {
                if heuristic.rules.is_empty() {
                    return Err(invalid(table, format!("heuristic pass {} has no rules", heuristic.column)));
                }
                if !resolved_direct.contains(heuristic.scope.column.as_str()) {
                    return Err(invalid(
                        table,
                        format!(
                            "heuristic pass {} is scoped by {} which no earlier direct pass resolves",
                            heuristic.column, heuristic.scope.column
                        ),
                    ));
                }
                let parent_fks: BTreeSet<&str> = parent.foreign_keys.iter().map(ForeignKeyPass::column).collect();
                if !parent_fks.contains(heuristic.scope.parent_column.as_str()) {
                    return Err(invalid(
                        table,
                        format!("{} has no FK column {}", parent.table, heuristic.scope.parent_column),
                    ));
                }
                let subject = &heuristic.subject;
                for column in [&subject.start, &subject.end, &subject.scheduled, &subject.category]
                    .into_iter()
                    .flatten()
                {
                    if !mapped.contains(column.as_str()) {
                        return Err(invalid(table, format!("heuristic subject column {column} is never mapped")));
                    }
                }
                ident("column", &heuristic.candidate.start)?;
                ident("column", &heuristic.candidate.end)?;
            }
        }
    }

    let mut child_names = BTreeSet::new();
    for child in &entity.children {
        let child_table = child.table.as_str();
        ident("table", child_table)?;
        ident("column", &child.parent_fk)?;
        if !child_names.insert(child.name.as_str()) {
            return Err(CatalogError::DuplicateName(child.name.clone()));
        }
        validate_mappings(child_table, &child.mappings)?;
        if !child.natural_key.contains(&child.parent_fk) {
            return Err(CatalogError::NaturalKeyMissingColumn {
                table: child_table.to_string(),
                column: child.parent_fk.clone(),
            });
        }
        if let ChildSource::Endpoint { template } = &child.source {
            if !template.contains("{id}") {
                return Err(invalid(child_table, "endpoint template must contain {id}"));
            }
        }
        let child_mapped = child.mapped_columns();
        for key_column in child.natural_key.columns() {
            let fk = key_column == &child.parent_fk || child.references.iter().any(|r| &r.column == key_column);
            if !fk && key_column != REGION_COLUMN && !child_mapped.contains(key_column.as_str()) {
                return Err(invalid(child_table, format!("natural key column {key_column} is never filled")));
            }
        }
        for reference in &child.references {
            ident("column", &reference.column)?;
            known_entity(by_name, child_table, &reference.parent)?;
            if !child_mapped.contains(reference.via.as_str()) {
                return Err(invalid(child_table, format!("reference via column {} is never mapped", reference.via)));
            }
            if !reference.mandatory && child.natural_key.contains(&reference.column) {
                return Err(invalid(
                    child_table,
                    format!("optional reference {} cannot be part of the natural key", reference.column),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_catalog() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../catalog.yaml")
    }

    const MINIMAL: &str = r#"
regions:
  - code: r1
    name: Region One
entities:
  - name: properties
    table: properties
    endpoint: /property
    external_id: { field: id, column: property_id }
    natural_key: [property_id, region_code]
    mappings:
      - { kind: rename, from: name, to: property_name }
  - name: reservations
    table: reservations
    endpoint: /reservation
    external_id: { field: id, column: reservation_id }
    natural_key: [reservation_id, region_code]
    mappings:
      - { kind: rename, from: property_id, to: property_id, cast: string }
      - { kind: rename, from: checkin_date, to: checkin_date }
      - { kind: rename, from: checkout_date, to: checkout_date }
    foreign_keys:
      - { kind: direct, column: property_pk, parent: properties, via: property_id }
"#;

    #[test]
    fn workspace_catalog_loads_and_orders_dependencies() {
        let catalog = Catalog::load(workspace_catalog()).expect("catalog.yaml");
        let order: Vec<&str> = catalog
            .sync_order()
            .unwrap()
            .into_iter()
            .map(|e| e.name.as_str())
            .collect();
        let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
        assert!(pos("properties") < pos("reservations"));
        assert!(pos("reservations") < pos("tasks"));
        assert!(pos("tags") < pos("tasks"));
        assert!(catalog.region("nashville").is_some());
    }

    #[test]
    fn minimal_catalog_validates() {
        let catalog = Catalog::from_yaml_str(MINIMAL).unwrap();
        let reservations = catalog.entity("reservations").unwrap();
        assert_eq!(reservations.depends_on().into_iter().collect::<Vec<_>>(), vec!["properties"]);
        let table = reservations.table_spec().unwrap();
        assert!(table.is_fk_column("property_pk"));
        assert_eq!(table.natural_key().columns(), ["reservation_id", "region_code"]);
    }

    #[test]
    fn entity_without_natural_key_is_rejected() {
        let yaml = MINIMAL.replace("    natural_key: [property_id, region_code]\n", "");
        assert!(matches!(Catalog::from_yaml_str(&yaml), Err(CatalogError::Parse(_))));
    }

    #[test]
    fn empty_natural_key_is_rejected() {
        let yaml = MINIMAL.replace("natural_key: [property_id, region_code]", "natural_key: []");
        assert!(Catalog::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn natural_key_must_be_region_scoped() {
        let yaml = MINIMAL.replace("natural_key: [property_id, region_code]", "natural_key: [property_id]");
        assert!(matches!(
            Catalog::from_yaml_str(&yaml),
            Err(CatalogError::NaturalKeyMissingColumn { column, .. }) if column == "region_code"
        ));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let yaml = MINIMAL.replace("parent: properties", "parent: homes");
        assert!(matches!(Catalog::from_yaml_str(&yaml), Err(CatalogError::UnknownEntity { .. })));
    }

    #[test]
    fn cycles_are_rejected() {
        let yaml = MINIMAL.replace(
            "      - { kind: rename, from: name, to: property_name }\n",
            "      - { kind: rename, from: name, to: property_name }\n    partition: { parent: reservations, param: reservation_id }\n",
        );
        assert!(matches!(Catalog::from_yaml_str(&yaml), Err(CatalogError::DependencyCycle(_))));
    }

    #[test]
    fn heuristic_pass_needs_earlier_scope_resolution() {
        let yaml = format!(
            "{MINIMAL}{}",
            r#"  - name: tasks
    table: tasks
    endpoint: /task
    external_id: { field: id, column: task_id }
    natural_key: [task_id, region_code]
    mappings:
      - { kind: rename, from: home_id, to: home_id, cast: string }
      - { kind: rename, from: scheduled_date, to: scheduled_date }
    foreign_keys:
      - kind: heuristic
        column: reservation_pk
        parent: reservations
        scope: { column: property_pk, parent_column: property_pk }
        subject: { scheduled: scheduled_date }
        candidate: { start: checkin_date, end: checkout_date }
        rules:
          - rule: range_overlap
      - { kind: direct, column: property_pk, parent: properties, via: home_id }
"#
        );
        let err = Catalog::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("no earlier direct pass"), "{err}");
    }

    #[test]
    fn select_helpers_accept_all_keyword() {
        let catalog = Catalog::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(catalog.select_regions("all").unwrap().len(), 1);
        assert!(catalog.select_regions("austin").is_err());
        let names: Vec<_> = catalog
            .select_entities("all")
            .unwrap()
            .into_iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names, vec!["properties", "reservations"]);
    }

    #[test]
    fn referrers_cover_passes_parent_fks_and_child_references() {
        let catalog = Catalog::load(workspace_catalog()).unwrap();
        let pairs = |table: &str| -> Vec<(String, String)> {
            catalog
                .table_spec(table)
                .unwrap()
                .referrers()
                .iter()
                .map(|r| (r.table.clone(), r.column.clone()))
                .collect()
        };
        let pair = |t: &str, c: &str| (t.to_string(), c.to_string());

        assert_eq!(
            pairs("properties"),
            vec![
                pair("property_photos", "property_pk"),
                pair("reservations", "property_pk"),
                pair("tasks", "property_pk"),
            ]
        );
        assert_eq!(
            pairs("reservations"),
            vec![pair("reservation_guests", "reservation_pk"), pair("tasks", "reservation_pk")]
        );
        assert_eq!(pairs("tags"), vec![pair("task_tags", "tag_pk")]);
        assert!(pairs("task_comments").is_empty());

        let comments = catalog.referrers_of("tasks").into_iter().find(|r| r.table == "task_comments").unwrap();
        assert!(comments.natural_key.contains("task_pk"));
        assert!(matches!(catalog.table_spec("nope"), Err(CatalogError::UnknownTable(_))));
    }
}
