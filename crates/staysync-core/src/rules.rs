//! Named match rules for heuristic FK resolution.
//!
//! A rule only answers "does this candidate fit this subject". Ordering,
//! short-circuiting and tie-breaking live in the resolver.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum MatchRule {
    /// Subject and candidate cover exactly the same date range.
    ExactRange,
    /// Subject of the given category is scheduled inside the candidate's range.
    ScheduledWithinWindow { category: String },
    /// Subject's range (or scheduled day) intersects the candidate's range.
    RangeOverlap,
}

/// Row that still lacks the FK, e.g. a task without a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicSubject {
    pub id: i64,
    pub scope: i64,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub scheduled: Option<NaiveDate>,
    pub category: Option<String>,
}

/// Row the subject may point to, e.g. a reservation on the same property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicCandidate {
    pub id: i64,
    pub scope: i64,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl HeuristicSubject {
    fn window(&self) -> Option<(NaiveDate, NaiveDate)> {
        match (self.start, self.end, self.scheduled) {
            (Some(start), Some(end), _) => Some(ordered(start, end)),
            (_, _, Some(day)) => Some((day, day)),
            _ => None,
        }
    }
}

impl HeuristicCandidate {
    fn window(&self) -> Option<(NaiveDate, NaiveDate)> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(ordered(start, end)),
            _ => None,
        }
    }
}

fn ordered(a: NaiveDate, b: NaiveDate) -> (NaiveDate, NaiveDate) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl MatchRule {
    pub fn name(&self) -> &'static str {
        match self {
            MatchRule::ExactRange => "exact_range",
            MatchRule::ScheduledWithinWindow { .. } => "scheduled_within_window",
            MatchRule::RangeOverlap => "range_overlap",
        }
    }

    pub fn matches(&self, subject: &HeuristicSubject, candidate: &HeuristicCandidate) -> bool {
        if subject.scope != candidate.scope {
            return false;
        }
        match self {
            MatchRule::ExactRange => {
                subject.start.is_some()
                    && subject.end.is_some()
                    && subject.start == candidate.start
                    && subject.end == candidate.end
            }
            MatchRule::ScheduledWithinWindow { category } => {
                let same_category = subject
                    .category
                    .as_deref()
                    .is_some_and(|c| c.trim().eq_ignore_ascii_case(category));
                match (same_category, subject.scheduled, candidate.window()) {
                    (true, Some(day), Some((start, end))) => start <= day && day <= end,
                    _ => false,
                }
            }
            MatchRule::RangeOverlap => match (subject.window(), candidate.window()) {
                (Some((s_start, s_end)), Some((c_start, c_end))) => s_start <= c_end && c_start <= s_end,
                _ => false,
            },
        }
    }
}

/// Calendar date from an API or database value. Accepts `YYYY-MM-DD` and
/// anything starting with it (`2024-05-01T10:00:00Z`).
pub fn date_from_value(value: &Value) -> Option<NaiveDate> {
    let text = value.as_str()?;
    let head = text.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn stay(id: i64, start: &str, end: &str) -> HeuristicCandidate {
        HeuristicCandidate {
            id,
            scope: 1,
            start: Some(d(start)),
            end: Some(d(end)),
        }
    }

    fn task(start: Option<&str>, end: Option<&str>, scheduled: Option<&str>, category: Option<&str>) -> HeuristicSubject {
        HeuristicSubject {
            id: 100,
            scope: 1,
            start: start.map(d),
            end: end.map(d),
            scheduled: scheduled.map(d),
            category: category.map(str::to_string),
        }
    }

    #[test]
    fn exact_range_needs_both_ends() {
        let reservation = stay(1, "2024-06-01", "2024-06-05");
        assert!(MatchRule::ExactRange.matches(&task(Some("2024-06-01"), Some("2024-06-05"), None, None), &reservation));
        assert!(!MatchRule::ExactRange.matches(&task(Some("2024-06-01"), None, None, None), &reservation));
    }

    #[test]
    fn scheduled_within_window_is_category_restricted() {
        let rule = MatchRule::ScheduledWithinWindow {
            category: "housekeeping".to_string(),
        };
        let reservation = stay(1, "2024-06-01", "2024-06-05");
        assert!(rule.matches(&task(None, None, Some("2024-06-05"), Some("Housekeeping")), &reservation));
        assert!(!rule.matches(&task(None, None, Some("2024-06-05"), Some("maintenance")), &reservation));
        assert!(!rule.matches(&task(None, None, Some("2024-06-06"), Some("housekeeping")), &reservation));
    }

    #[test]
    fn overlap_uses_scheduled_day_when_range_missing() {
        let reservation = stay(1, "2024-06-01", "2024-06-05");
        assert!(MatchRule::RangeOverlap.matches(&task(None, None, Some("2024-06-03"), None), &reservation));
        assert!(MatchRule::RangeOverlap.matches(&task(Some("2024-05-28"), Some("2024-06-01"), None, None), &reservation));
        assert!(!MatchRule::RangeOverlap.matches(&task(Some("2024-05-20"), Some("2024-05-25"), None, None), &reservation));
    }

    #[test]
    fn different_scope_never_matches() {
        let mut reservation = stay(1, "2024-06-01", "2024-06-05");
        reservation.scope = 2;
        assert!(!MatchRule::RangeOverlap.matches(&task(Some("2024-06-01"), Some("2024-06-05"), None, None), &reservation));
    }

    #[test]
    fn dates_parse_from_timestamps() {
        assert_eq!(date_from_value(&json!("2024-06-01T10:00:00Z")), Some(d("2024-06-01")));
        assert_eq!(date_from_value(&json!("June")), None);
        assert_eq!(date_from_value(&json!(null)), None);
    }
}
