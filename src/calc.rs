use rusqlite::{params_from_iter, types::Value, Connection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Label reported when a score falls outside every configured criterion band.
pub const UNCLASSIFIED: &str = "Unclassified";

/// One scored competency element for one student by one evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    #[serde(default)]
    pub element_id: String,
    pub weight: f64,
    #[serde(default)]
    pub raw_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionRange {
    pub label: String,
    pub min_score: f64,
    pub max_score: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateMode {
    pub weighted: bool,
}

impl AggregateMode {
    pub const WEIGHTED: AggregateMode = AggregateMode { weighted: true };
    pub const UNWEIGHTED: AggregateMode = AggregateMode { weighted: false };
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub final_score: f64,
    pub matched_label: String,
}

/// Round half up to 2 decimals: `Int(100*x + 0.5) / 100`.
pub fn round_half_up_2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Final score for one subject.
///
/// Unscored entries count as 0 and stay in the denominator. In weighted mode a
/// non-positive weight sum falls back to the plain mean; an empty input is 0.
pub fn aggregate(entries: &[ScoreEntry], mode: AggregateMode) -> f64 {
    if entries.is_empty() {
        return 0.0;
    }

    if mode.weighted {
        let mut sum = 0.0_f64;
        let mut weight_sum = 0.0_f64;
        for e in entries {
            let w = e.weight.max(0.0);
            sum += e.raw_score.unwrap_or(0.0) * w;
            weight_sum += w;
        }
        if weight_sum > 0.0 {
            return round_half_up_2(sum / weight_sum);
        }
    }

    let sum: f64 = entries.iter().map(|e| e.raw_score.unwrap_or(0.0)).sum();
    round_half_up_2(sum / (entries.len() as f64))
}

/// First range (in the given order) containing `score`, bounds inclusive.
pub fn classify(score: f64, ranges: &[CriterionRange]) -> &str {
    ranges
        .iter()
        .find(|r| r.min_score <= score && score <= r.max_score)
        .map(|r| r.label.as_str())
        .unwrap_or(UNCLASSIFIED)
}

pub fn evaluate(
    entries: &[ScoreEntry],
    ranges: &[CriterionRange],
    mode: AggregateMode,
) -> AggregateResult {
    let final_score = aggregate(entries, mode);
    AggregateResult {
        final_score,
        matched_label: classify(final_score, ranges).to_string(),
    }
}

/// Score the evaluation form fills in when a band is picked directly:
/// the band midpoint rounded to the nearest integer.
pub fn score_from_criterion(range: &CriterionRange) -> f64 {
    ((range.min_score + range.max_score) / 2.0 + 0.5).floor()
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

pub fn load_criteria(conn: &Connection) -> Result<Vec<CriterionRange>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT name, min_score, max_score
             FROM criteria
             ORDER BY min_score, max_score, name",
        )
        .map_err(CalcError::db)?;
    let ranges = stmt
        .query_map([], |r| {
            Ok(CriterionRange {
                label: r.get(0)?,
                min_score: r.get(1)?,
                max_score: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    Ok(ranges)
}

// ---------------------------------------------------------------------------
// Evaluation form preview

#[derive(Debug, Clone)]
pub struct FormAspect {
    pub id: String,
    pub name: String,
    pub elements: Vec<FormElement>,
}

#[derive(Debug, Clone)]
pub struct FormElement {
    pub id: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AspectPreview {
    pub aspect_id: String,
    pub name: String,
    pub element_count: usize,
    pub scored_count: usize,
    pub score: f64,
    pub criterion: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormPreview {
    pub aspects: Vec<AspectPreview>,
    pub total: AggregateResult,
    pub weighted: bool,
    pub element_count: usize,
    pub unscored_count: usize,
    pub complete: bool,
}

/// Per-aspect means (always unweighted, as on the form) plus the overall total
/// across every element of every aspect.
pub fn compute_form_preview(
    aspects: &[FormAspect],
    scores: &HashMap<String, Option<f64>>,
    ranges: &[CriterionRange],
    mode: AggregateMode,
) -> FormPreview {
    let mut all_entries: Vec<ScoreEntry> = Vec::new();
    let mut out: Vec<AspectPreview> = Vec::with_capacity(aspects.len());

    for a in aspects {
        let entries: Vec<ScoreEntry> = a
            .elements
            .iter()
            .map(|e| ScoreEntry {
                element_id: e.id.clone(),
                weight: e.weight,
                raw_score: scores.get(&e.id).copied().flatten(),
            })
            .collect();
        let scored_count = entries.iter().filter(|e| e.raw_score.is_some()).count();
        let result = evaluate(&entries, ranges, AggregateMode::UNWEIGHTED);
        out.push(AspectPreview {
            aspect_id: a.id.clone(),
            name: a.name.clone(),
            element_count: entries.len(),
            scored_count,
            score: result.final_score,
            criterion: result.matched_label,
        });
        all_entries.extend(entries);
    }

    let unscored_count = all_entries.iter().filter(|e| e.raw_score.is_none()).count();
    FormPreview {
        aspects: out,
        total: evaluate(&all_entries, ranges, mode),
        weighted: mode.weighted,
        element_count: all_entries.len(),
        unscored_count,
        complete: unscored_count == 0,
    }
}

/// Aspects of one department in form order (oldest first), elements by position.
pub fn load_form_aspects(
    conn: &Connection,
    department_id: &str,
) -> Result<Vec<FormAspect>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.name, e.id, e.weight
             FROM aspects a
             LEFT JOIN elements e ON e.aspect_id = a.id
             WHERE a.department_id = ?
             ORDER BY a.created_at, a.rowid, e.sort_order",
        )
        .map_err(CalcError::db)?;
    let rows = stmt
        .query_map([department_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<f64>>(3)?,
            ))
        })
        .map_err(CalcError::db)?;

    let mut out: Vec<FormAspect> = Vec::new();
    for row in rows {
        let (aspect_id, aspect_name, element_id, weight) = row.map_err(CalcError::db)?;
        if out.last().map(|a| a.id != aspect_id).unwrap_or(true) {
            out.push(FormAspect {
                id: aspect_id,
                name: aspect_name,
                elements: Vec::new(),
            });
        }
        if let (Some(id), Some(last)) = (element_id, out.last_mut()) {
            last.elements.push(FormElement {
                id,
                weight: weight.unwrap_or(1.0),
            });
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Report

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFilters {
    pub department_id: Option<String>,
    pub evaluator_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportSort {
    Name,
    FinalScore,
}

#[derive(Debug, Clone, Copy)]
pub struct ReportOptions {
    pub mode: AggregateMode,
    pub sort_by: ReportSort,
    pub include_details: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStudent {
    pub id: String,
    pub name: String,
    pub class_label: String,
    pub department: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDetail {
    pub aspect: String,
    pub element: String,
    pub weight: f64,
    pub value: Option<f64>,
    pub weighted_value: f64,
    pub evaluator: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub student: ReportStudent,
    pub final_score: f64,
    pub criterion: String,
    pub score_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<ReportDetail>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionCount {
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportModel {
    pub filters: ReportFilters,
    pub weighted: bool,
    pub sort_by: ReportSort,
    pub criteria: Vec<CriterionRange>,
    pub rows: Vec<ReportRow>,
    pub distribution: Vec<CriterionCount>,
}

pub fn parse_report_filters(raw: &serde_json::Value) -> Result<ReportFilters, CalcError> {
    fn opt_id(raw: &serde_json::Value, key: &str) -> Result<Option<String>, CalcError> {
        match raw.get(key) {
            None => Ok(None),
            Some(v) if v.is_null() => Ok(None),
            Some(v) => {
                let Some(s) = v.as_str() else {
                    return Err(CalcError::new(
                        "bad_params",
                        format!("{} must be string or null", key),
                    ));
                };
                let t = s.trim();
                if t.is_empty() || t.eq_ignore_ascii_case("ALL") {
                    Ok(None)
                } else {
                    Ok(Some(t.to_string()))
                }
            }
        }
    }

    Ok(ReportFilters {
        department_id: opt_id(raw, "departmentId")?,
        evaluator_id: opt_id(raw, "evaluatorId")?,
    })
}

struct StudentAccumulator {
    student: ReportStudent,
    entries: Vec<ScoreEntry>,
    details: Vec<ReportDetail>,
}

pub fn compute_report(
    conn: &Connection,
    filters: &ReportFilters,
    options: &ReportOptions,
) -> Result<ReportModel, CalcError> {
    let criteria = load_criteria(conn)?;

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(d) = &filters.department_id {
        clauses.push("s.department_id = ?");
        binds.push(Value::Text(d.clone()));
    }
    if let Some(ev) = &filters.evaluator_id {
        clauses.push("p.evaluator_id = ?");
        binds.push(Value::Text(ev.clone()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    // Every (student, evaluator) assessment is expanded to the department's
    // current form, so elements without a score row come back as NULL.
    let sql = format!(
        "SELECT s.id, s.name, s.class_label, d.name,
                a.name, e.id, e.name, e.weight, sc.value, ev.name
         FROM (SELECT student_id, evaluator_id,
                      MIN(created_at) AS first_at, MIN(rowid) AS first_row
               FROM scores
               GROUP BY student_id, evaluator_id) p
         JOIN students s ON s.id = p.student_id
         JOIN departments d ON d.id = s.department_id
         JOIN evaluators ev ON ev.id = p.evaluator_id
         JOIN aspects a ON a.department_id = s.department_id
         JOIN elements e ON e.aspect_id = a.id
         LEFT JOIN scores sc
           ON sc.student_id = p.student_id
          AND sc.evaluator_id = p.evaluator_id
          AND sc.element_id = e.id
         {}
         ORDER BY p.first_at, p.first_row, a.created_at, a.rowid, e.sort_order",
        where_sql
    );

    let mut stmt = conn.prepare(&sql).map_err(CalcError::db)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                ReportStudent {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    class_label: r.get(2)?,
                    department: r.get(3)?,
                },
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, f64>(7)?,
                r.get::<_, Option<f64>>(8)?,
                r.get::<_, String>(9)?,
            ))
        })
        .map_err(CalcError::db)?;

    // Keep first-seen order per student.
    let mut order: Vec<StudentAccumulator> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let (student, aspect, element_id, element, weight, value, evaluator) =
            row.map_err(CalcError::db)?;
        let slot = match index.get(&student.id) {
            Some(i) => *i,
            None => {
                index.insert(student.id.clone(), order.len());
                order.push(StudentAccumulator {
                    student,
                    entries: Vec::new(),
                    details: Vec::new(),
                });
                order.len() - 1
            }
        };
        let acc = &mut order[slot];
        acc.entries.push(ScoreEntry {
            element_id,
            weight,
            raw_score: value,
        });
        acc.details.push(ReportDetail {
            aspect,
            element,
            weight,
            value,
            weighted_value: value.unwrap_or(0.0) * weight,
            evaluator,
        });
    }

    let mut out: Vec<ReportRow> = order
        .into_iter()
        .map(|acc| {
            let result = evaluate(&acc.entries, &criteria, options.mode);
            ReportRow {
                student: acc.student,
                final_score: result.final_score,
                criterion: result.matched_label,
                score_count: acc.entries.len(),
                details: options.include_details.then_some(acc.details),
            }
        })
        .collect();

    match options.sort_by {
        ReportSort::Name => out.sort_by(|a, b| {
            a.student
                .name
                .to_lowercase()
                .cmp(&b.student.name.to_lowercase())
        }),
        ReportSort::FinalScore => out.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(Ordering::Equal)
        }),
    }

    let mut distribution: Vec<CriterionCount> = Vec::new();
    for c in &criteria {
        if !distribution.iter().any(|d| d.label == c.label) {
            distribution.push(CriterionCount {
                label: c.label.clone(),
                count: 0,
            });
        }
    }
    distribution.push(CriterionCount {
        label: UNCLASSIFIED.to_string(),
        count: 0,
    });
    for r in &out {
        if let Some(slot) = distribution.iter_mut().find(|d| d.label == r.criterion) {
            slot.count += 1;
        }
    }

    Ok(ReportModel {
        filters: filters.clone(),
        weighted: options.mode.weighted,
        sort_by: options.sort_by,
        criteria,
        rows: out,
        distribution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, raw: Option<f64>, weight: f64) -> ScoreEntry {
        ScoreEntry {
            element_id: id.to_string(),
            weight,
            raw_score: raw,
        }
    }

    fn range(label: &str, min: f64, max: f64) -> CriterionRange {
        CriterionRange {
            label: label.to_string(),
            min_score: min,
            max_score: max,
        }
    }

    #[test]
    fn rounding_is_half_up_to_two_decimals() {
        assert_eq!(round_half_up_2(0.0), 0.0);
        assert_eq!(round_half_up_2(73.3333), 73.33);
        assert_eq!(round_half_up_2(66.666), 66.67);
        assert_eq!(round_half_up_2(12.125), 12.13);
    }

    #[test]
    fn empty_input_aggregates_to_zero_in_both_modes() {
        assert_eq!(aggregate(&[], AggregateMode::WEIGHTED), 0.0);
        assert_eq!(aggregate(&[], AggregateMode::UNWEIGHTED), 0.0);
    }

    #[test]
    fn weighted_mean_matches_hand_computation() {
        let entries = vec![entry("a", Some(80.0), 2.0), entry("b", Some(60.0), 1.0)];
        assert_eq!(aggregate(&entries, AggregateMode::WEIGHTED), 73.33);
        assert_eq!(aggregate(&entries, AggregateMode::UNWEIGHTED), 70.0);
    }

    #[test]
    fn uniform_unit_weights_make_both_modes_agree() {
        let entries = vec![
            entry("a", Some(91.0), 1.0),
            entry("b", Some(47.5), 1.0),
            entry("c", Some(73.0), 1.0),
        ];
        assert_eq!(
            aggregate(&entries, AggregateMode::WEIGHTED),
            aggregate(&entries, AggregateMode::UNWEIGHTED)
        );
    }

    #[test]
    fn zero_weight_sum_falls_back_to_plain_mean() {
        let entries = vec![entry("a", Some(90.0), 0.0), entry("b", Some(70.0), 0.0)];
        assert_eq!(aggregate(&entries, AggregateMode::WEIGHTED), 80.0);
    }

    #[test]
    fn unscored_elements_count_as_zero_and_stay_in_denominator() {
        let entries = vec![entry("a", Some(90.0), 1.0), entry("b", None, 1.0)];
        assert_eq!(aggregate(&entries, AggregateMode::UNWEIGHTED), 45.0);
        assert_eq!(aggregate(&entries, AggregateMode::WEIGHTED), 45.0);

        let weighted = vec![entry("a", Some(90.0), 1.0), entry("b", None, 2.0)];
        assert_eq!(aggregate(&weighted, AggregateMode::WEIGHTED), 30.0);
    }

    #[test]
    fn classify_picks_inclusive_band() {
        let ranges = vec![range("Cukup", 55.0, 69.0), range("Baik", 70.0, 84.0)];
        assert_eq!(classify(73.33, &ranges), "Baik");
        assert_eq!(classify(70.0, &ranges), "Baik");
        assert_eq!(classify(84.0, &ranges), "Baik");
        assert_eq!(classify(55.0, &ranges), "Cukup");
    }

    #[test]
    fn classify_gap_is_unclassified() {
        let ranges = vec![range("Baik", 70.0, 84.0)];
        assert_eq!(classify(50.0, &ranges), UNCLASSIFIED);
        assert_eq!(classify(69.5, &ranges), UNCLASSIFIED);
        assert_eq!(classify(10.0, &[]), UNCLASSIFIED);
    }

    #[test]
    fn shared_boundary_resolves_to_first_listed_range() {
        let ab = vec![range("A", 0.0, 50.0), range("B", 50.0, 100.0)];
        assert_eq!(classify(50.0, &ab), "A");
        assert_eq!(classify(100.0, &ab), "B");

        let ba = vec![range("B", 50.0, 100.0), range("A", 0.0, 50.0)];
        assert_eq!(classify(50.0, &ba), "B");
    }

    #[test]
    fn evaluate_combines_score_and_label() {
        let entries = vec![entry("a", Some(80.0), 2.0), entry("b", Some(60.0), 1.0)];
        let ranges = vec![range("Cukup", 55.0, 69.0), range("Baik", 70.0, 84.0)];
        let r = evaluate(&entries, &ranges, AggregateMode::WEIGHTED);
        assert_eq!(r.final_score, 73.33);
        assert_eq!(r.matched_label, "Baik");
    }

    #[test]
    fn criterion_midpoint_rounds_half_up() {
        assert_eq!(score_from_criterion(&range("Sangat Baik", 85.0, 100.0)), 93.0);
        assert_eq!(score_from_criterion(&range("Baik", 70.0, 84.0)), 77.0);
        assert_eq!(score_from_criterion(&range("Sangat Kurang", 0.0, 39.0)), 20.0);
    }

    #[test]
    fn form_preview_averages_per_aspect_and_flags_unscored() {
        let aspects = vec![
            FormAspect {
                id: "asp1".into(),
                name: "Persiapan".into(),
                elements: vec![
                    FormElement { id: "e1".into(), weight: 1.0 },
                    FormElement { id: "e2".into(), weight: 3.0 },
                ],
            },
            FormAspect {
                id: "asp2".into(),
                name: "Hasil".into(),
                elements: vec![FormElement { id: "e3".into(), weight: 1.0 }],
            },
        ];
        let mut scores = HashMap::new();
        scores.insert("e1".to_string(), Some(90.0));
        scores.insert("e2".to_string(), Some(70.0));
        scores.insert("e3".to_string(), None);
        let ranges = vec![range("Baik", 70.0, 84.0), range("Sangat Baik", 85.0, 100.0)];

        let p = compute_form_preview(&aspects, &scores, &ranges, AggregateMode::UNWEIGHTED);
        assert_eq!(p.aspects[0].score, 80.0);
        assert_eq!(p.aspects[0].criterion, "Baik");
        assert_eq!(p.aspects[1].score, 0.0);
        assert_eq!(p.aspects[1].criterion, UNCLASSIFIED);
        assert_eq!(p.total.final_score, 53.33);
        assert_eq!(p.unscored_count, 1);
        assert!(!p.complete);

        let w = compute_form_preview(&aspects, &scores, &ranges, AggregateMode::WEIGHTED);
        // (90*1 + 70*3 + 0*1) / 5
        assert_eq!(w.total.final_score, 60.0);
        assert!(w.weighted);
    }

    #[test]
    fn report_filters_treat_all_and_blank_as_unset() {
        let raw = serde_json::json!({ "departmentId": "ALL", "evaluatorId": "  " });
        let f = parse_report_filters(&raw).expect("parse");
        assert!(f.department_id.is_none());
        assert!(f.evaluator_id.is_none());

        let bad = serde_json::json!({ "departmentId": 7 });
        let e = parse_report_filters(&bad).expect_err("non-string id");
        assert_eq!(e.code, "bad_params");
    }
}
