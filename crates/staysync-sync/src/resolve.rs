//! Foreign-key resolution stage.
//!
//! Passes run in catalog order after a batch is upserted. Every write is
//! guarded by `<fk> IS NULL`, so a pass never overwrites a link made by an
//! earlier pass or an earlier run.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use staysync_core::{
    Catalog, CatalogError, DirectPass, EntitySpec, ForeignKeyPass, HeuristicCandidate, HeuristicPass,
    HeuristicSubject, MatchRule, RegionCode, SubjectColumns, WindowColumns, REGION_COLUMN, SURROGATE_COLUMN,
};
use tracing::{debug, info};

use crate::store::LoadSession;
use crate::SyncError;

/// Outcome of one FK pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PassReport {
    pub pass: String,
    pub column: String,
    pub resolved: u64,
    /// Rows that were eligible for the pass.
    pub candidates: u64,
    /// Heuristic passes only: links made per rule name.
    pub by_rule: BTreeMap<String, u64>,
}

/// Exact-match pass: `<column> = parent.id` where `<via>` equals the parent's
/// external id in the same region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectPlan {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub via: String,
    pub parent_table: String,
    pub parent_external_column: String,
}

impl DirectPlan {
    pub fn new(schema: &str, entity: &EntitySpec, pass: &DirectPass, parent: &EntitySpec) -> Self {
        Self {
            schema: schema.to_string(),
            table: entity.table.clone(),
            column: pass.column.clone(),
            via: pass.via.clone(),
            parent_table: parent.table.clone(),
            parent_external_column: parent.external_id.column.clone(),
        }
    }

    pub fn label(&self) -> String {
        format!("direct:{}", self.column)
    }

    pub fn candidate_count_statement(&self) -> String {
        format!(
            "SELECT count(*) FROM {schema}.{table} \
             WHERE {REGION_COLUMN} = $1 AND {column} IS NULL AND btrim({via}::text) <> ''",
            schema = self.schema,
            table = self.table,
            column = self.column,
            via = self.via,
        )
    }

    pub fn update_statement(&self) -> String {
        format!(
            "UPDATE {schema}.{table} AS c SET {column} = p.{SURROGATE_COLUMN} \
             FROM {schema}.{parent} AS p \
             WHERE btrim(c.{via}::text) = btrim(p.{parent_ext}::text) \
             AND p.{REGION_COLUMN} = c.{REGION_COLUMN} \
             AND c.{REGION_COLUMN} = $1 \
             AND c.{column} IS NULL",
            schema = self.schema,
            table = self.table,
            column = self.column,
            parent = self.parent_table,
            via = self.via,
            parent_ext = self.parent_external_column,
        )
    }
}

/// Best-effort pass over rows the direct passes left unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicPlan {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub parent_table: String,
    pub scope_column: String,
    pub parent_scope_column: String,
    pub subject: SubjectColumns,
    pub candidate: WindowColumns,
    pub rules: Vec<MatchRule>,
}

impl HeuristicPlan {
    pub fn new(schema: &str, entity: &EntitySpec, pass: &HeuristicPass, parent: &EntitySpec) -> Self {
        Self {
            schema: schema.to_string(),
            table: entity.table.clone(),
            column: pass.column.clone(),
            parent_table: parent.table.clone(),
            scope_column: pass.scope.column.clone(),
            parent_scope_column: pass.scope.parent_column.clone(),
            subject: pass.subject.clone(),
            candidate: pass.candidate.clone(),
            rules: pass.rules.clone(),
        }
    }

    pub fn label(&self) -> String {
        format!("heuristic:{}", self.column)
    }

    pub fn subjects_statement(&self) -> String {
        let date = |column: &Option<String>| match column {
            Some(c) => format!("{c}::date"),
            None => "NULL::date".to_string(),
        };
        let category = match &self.subject.category {
            Some(c) => format!("{c}::text"),
            None => "NULL::text".to_string(),
        };
        format!(
            "SELECT {SURROGATE_COLUMN} AS id, {scope} AS scope, {start} AS start_date, {end} AS end_date, \
             {scheduled} AS scheduled_date, {category} AS category \
             FROM {schema}.{table} \
             WHERE {REGION_COLUMN} = $1 AND {column} IS NULL AND {scope} IS NOT NULL \
             ORDER BY {SURROGATE_COLUMN}",
            scope = self.scope_column,
            start = date(&self.subject.start),
            end = date(&self.subject.end),
            scheduled = date(&self.subject.scheduled),
            schema = self.schema,
            table = self.table,
            column = self.column,
        )
    }

    pub fn candidates_statement(&self) -> String {
        format!(
            "SELECT {SURROGATE_COLUMN} AS id, {scope} AS scope, {start}::date AS start_date, {end}::date AS end_date \
             FROM {schema}.{parent} \
             WHERE {REGION_COLUMN} = $1 AND {scope} IS NOT NULL \
             ORDER BY {SURROGATE_COLUMN}",
            scope = self.parent_scope_column,
            start = self.candidate.start,
            end = self.candidate.end,
            schema = self.schema,
            parent = self.parent_table,
        )
    }

    /// Binds `$1` subject ids and `$2` parent ids as parallel arrays.
    pub fn apply_statement(&self) -> String {
        format!(
            "UPDATE {schema}.{table} AS c SET {column} = v.parent_id \
             FROM unnest($1::bigint[], $2::bigint[]) AS v(child_id, parent_id) \
             WHERE c.{SURROGATE_COLUMN} = v.child_id AND c.{column} IS NULL",
            schema = self.schema,
            table = self.table,
            column = self.column,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeuristicOutcome {
    /// `(subject id, candidate id)`.
    pub links: Vec<(i64, i64)>,
    pub by_rule: BTreeMap<String, u64>,
    pub unmatched: usize,
}

/// Rules are tried in order and the first rule with any match wins; within a
/// rule the lowest candidate id wins. Candidates are only considered inside
/// the subject's scope.
pub fn resolve_heuristic(
    rules: &[MatchRule],
    subjects: &[HeuristicSubject],
    candidates: &[HeuristicCandidate],
) -> HeuristicOutcome {
    let mut by_scope: HashMap<i64, Vec<&HeuristicCandidate>> = HashMap::new();
    for candidate in candidates {
        by_scope.entry(candidate.scope).or_default().push(candidate);
    }
    for pool in by_scope.values_mut() {
        pool.sort_by_key(|c| c.id);
    }

    let mut outcome = HeuristicOutcome {
        by_rule: rules.iter().map(|r| (r.name().to_string(), 0)).collect(),
        ..HeuristicOutcome::default()
    };
    for subject in subjects {
        let found = by_scope.get(&subject.scope).and_then(|pool| {
            rules
                .iter()
                .find_map(|rule| pool.iter().find(|c| rule.matches(subject, c)).map(|c| (rule, c.id)))
        });
        match found {
            Some((rule, candidate_id)) => {
                outcome.links.push((subject.id, candidate_id));
                *outcome.by_rule.entry(rule.name().to_string()).or_default() += 1;
            }
            None => outcome.unmatched += 1,
        }
    }
    outcome
}

fn parent_of<'a>(catalog: &'a Catalog, entity: &EntitySpec, parent: &str) -> Result<&'a EntitySpec, SyncError> {
    catalog.entity(parent).ok_or_else(|| {
        SyncError::Catalog(CatalogError::UnknownEntity {
            referenced_by: entity.name.clone(),
            name: parent.to_string(),
        })
    })
}

/// Runs every FK pass declared for `entity` against rows of `region`.
pub async fn run_fk_passes(
    session: &mut dyn LoadSession,
    schema: &str,
    catalog: &Catalog,
    entity: &EntitySpec,
    region: &RegionCode,
) -> Result<Vec<PassReport>, SyncError> {
    let mut reports = Vec::with_capacity(entity.foreign_keys.len());
    for pass in &entity.foreign_keys {
        let parent = parent_of(catalog, entity, pass.parent())?;
        let report = match pass {
            ForeignKeyPass::Direct(direct) => {
                let plan = DirectPlan::new(schema, entity, direct, parent);
                session.resolve_direct(&plan, region).await?
            }
            ForeignKeyPass::Heuristic(heuristic) => {
                let plan = HeuristicPlan::new(schema, entity, heuristic, parent);
                run_heuristic(session, &plan, region).await?
            }
        };
        info!(
            entity = %entity.name,
            %region,
            pass = %report.pass,
            resolved = report.resolved,
            candidates = report.candidates,
            "resolved {} of {}",
            report.resolved,
            report.candidates
        );
        reports.push(report);
    }
    Ok(reports)
}

async fn run_heuristic(
    session: &mut dyn LoadSession,
    plan: &HeuristicPlan,
    region: &RegionCode,
) -> Result<PassReport, SyncError> {
    let mut report = PassReport {
        pass: plan.label(),
        column: plan.column.clone(),
        ..PassReport::default()
    };
    let subjects = session.heuristic_subjects(plan, region).await?;
    report.candidates = subjects.len() as u64;
    if subjects.is_empty() {
        return Ok(report);
    }

    let candidates = session.heuristic_candidates(plan, region).await?;
    let outcome = resolve_heuristic(&plan.rules, &subjects, &candidates);
    debug!(
        pass = %report.pass,
        subjects = subjects.len(),
        candidates = candidates.len(),
        links = outcome.links.len(),
        unmatched = outcome.unmatched,
        "heuristic match complete"
    );
    report.resolved = if outcome.links.is_empty() {
        0
    } else {
        session.apply_links(plan, &outcome.links).await?
    };
    report.by_rule = outcome.by_rule;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(s: &str) -> Option<NaiveDate> {
        Some(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
    }

    fn subject(id: i64, scope: i64, start: &str, end: &str) -> HeuristicSubject {
        HeuristicSubject {
            id,
            scope,
            start: d(start),
            end: d(end),
            scheduled: None,
            category: None,
        }
    }

    fn stay(id: i64, scope: i64, start: &str, end: &str) -> HeuristicCandidate {
        HeuristicCandidate {
            id,
            scope,
            start: d(start),
            end: d(end),
        }
    }

    fn rules() -> Vec<MatchRule> {
        vec![
            MatchRule::ExactRange,
            MatchRule::ScheduledWithinWindow {
                category: "housekeeping".to_string(),
            },
            MatchRule::RangeOverlap,
        ]
    }

    #[test]
    fn earlier_rule_wins_over_lower_id() {
        // 7 only overlaps; 9 matches exactly.
        let subjects = vec![subject(1, 100, "2024-05-01", "2024-05-05")];
        let candidates = vec![
            stay(7, 100, "2024-04-28", "2024-05-02"),
            stay(9, 100, "2024-05-01", "2024-05-05"),
        ];
        let outcome = resolve_heuristic(&rules(), &subjects, &candidates);
        assert_eq!(outcome.links, vec![(1, 9)]);
        assert_eq!(outcome.by_rule["exact_range"], 1);
        assert_eq!(outcome.by_rule["range_overlap"], 0);
    }

    #[test]
    fn ties_within_a_rule_pick_the_lowest_id() {
        let subjects = vec![subject(1, 100, "2024-05-03", "2024-05-04")];
        let candidates = vec![
            stay(12, 100, "2024-05-01", "2024-05-10"),
            stay(4, 100, "2024-05-02", "2024-05-06"),
        ];
        let outcome = resolve_heuristic(&rules(), &subjects, &candidates);
        assert_eq!(outcome.links, vec![(1, 4)]);
        assert_eq!(outcome.by_rule["range_overlap"], 1);
    }

    #[test]
    fn candidates_outside_the_scope_are_ignored() {
        let subjects = vec![subject(1, 100, "2024-05-01", "2024-05-05"), subject(2, 300, "2024-05-01", "2024-05-05")];
        let candidates = vec![stay(5, 200, "2024-05-01", "2024-05-05"), stay(6, 100, "2024-05-01", "2024-05-05")];
        let outcome = resolve_heuristic(&rules(), &subjects, &candidates);
        assert_eq!(outcome.links, vec![(1, 6)]);
        assert_eq!(outcome.unmatched, 1);
    }

    #[test]
    fn scheduled_housekeeping_task_matches_its_stay() {
        let cleaning = HeuristicSubject {
            id: 3,
            scope: 100,
            start: None,
            end: None,
            scheduled: d("2024-05-04"),
            category: Some("Housekeeping".to_string()),
        };
        let outcome = resolve_heuristic(&rules(), &[cleaning], &[stay(8, 100, "2024-05-01", "2024-05-05")]);
        assert_eq!(outcome.links, vec![(3, 8)]);
        assert_eq!(outcome.by_rule["scheduled_within_window"], 1);
    }

    fn tasks_catalog() -> Catalog {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../catalog.yaml");
        Catalog::load(path).unwrap()
    }

    #[test]
    fn direct_statements_stay_inside_the_region() {
        let catalog = tasks_catalog();
        let tasks = catalog.entity("tasks").unwrap();
        let properties = catalog.entity("properties").unwrap();
        let ForeignKeyPass::Direct(pass) = &tasks.foreign_keys[0] else {
            panic!("first tasks pass is direct");
        };
        let plan = DirectPlan::new("staysync", tasks, pass, properties);
        let sql = plan.update_statement();
        assert!(sql.starts_with("UPDATE staysync.tasks AS c SET property_pk = p.id FROM staysync.properties AS p"));
        assert!(sql.contains("btrim(c.home_id::text) = btrim(p.property_id::text)"));
        assert!(sql.contains("p.region_code = c.region_code"));
        assert!(sql.contains("c.region_code = $1"));
        assert!(sql.ends_with("c.property_pk IS NULL"));
        assert!(plan
            .candidate_count_statement()
            .contains("property_pk IS NULL AND btrim(home_id::text) <> ''"));
    }

    #[test]
    fn heuristic_statements_only_touch_null_links() {
        let catalog = tasks_catalog();
        let tasks = catalog.entity("tasks").unwrap();
        let reservations = catalog.entity("reservations").unwrap();
        let pass = tasks
            .foreign_keys
            .iter()
            .find_map(|p| match p {
                ForeignKeyPass::Heuristic(h) => Some(h),
                ForeignKeyPass::Direct(_) => None,
            })
            .unwrap();
        let plan = HeuristicPlan::new("staysync", tasks, pass, reservations);
        assert_eq!(plan.label(), "heuristic:reservation_pk");
        let subjects = plan.subjects_statement();
        assert!(subjects.contains("checkin_date::date AS start_date"));
        assert!(subjects.contains("type_department::text AS category"));
        assert!(subjects.contains("reservation_pk IS NULL AND property_pk IS NOT NULL"));
        assert!(plan.candidates_statement().contains("FROM staysync.reservations"));
        assert!(plan.apply_statement().ends_with("c.reservation_pk IS NULL"));
    }
}
