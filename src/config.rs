use crate::calc::{AggregateMode, ReportSort};
use crate::db;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    Scoring,
    Assessment,
    Reports,
}

impl SetupSection {
    pub const ALL: [SetupSection; 3] = [Self::Scoring, Self::Assessment, Self::Reports];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scoring" => Some(Self::Scoring),
            "assessment" => Some(Self::Assessment),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Scoring => "scoring",
            Self::Assessment => "assessment",
            Self::Reports => "reports",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Scoring => "setup.scoring",
            Self::Assessment => "setup.assessment",
            Self::Reports => "setup.reports",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Scoring => json!({
            "reportWeighted": true,
            "defaultElementWeight": 1.0,
            "unscoredPolicy": "zero"
        }),
        SetupSection::Assessment => json!({
            "scoreMin": 0.0,
            "scoreMax": 100.0,
            "allowReassess": false
        }),
        SetupSection::Reports => json!({
            "sortBy": "name",
            "includeDetails": true
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_choice(v: &Value, key: &str, choices: &[&str]) -> Result<String, String> {
    let s = v
        .as_str()
        .ok_or_else(|| format!("{} must be string", key))?
        .trim();
    choices
        .iter()
        .find(|c| c.eq_ignore_ascii_case(s))
        .map(|c| c.to_string())
        .ok_or_else(|| format!("{} must be one of: {}", key, choices.join(", ")))
}

const REPORT_SORT_CHOICES: &[&str] = &["name", "finalScore"];

/// `sortBy` as stored in settings or sent with a report request, case-insensitive.
pub fn parse_report_sort(v: &Value) -> Result<ReportSort, String> {
    Ok(match parse_choice(v, "sortBy", REPORT_SORT_CHOICES)?.as_str() {
        "finalScore" => ReportSort::FinalScore,
        _ => ReportSort::Name,
    })
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Scoring => match k.as_str() {
                "reportWeighted" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "defaultElementWeight" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                "unscoredPolicy" => {
                    obj.insert(k.clone(), Value::String(parse_choice(v, k, &["zero"])?));
                }
                _ => return Err(format!("unknown scoring field: {}", k)),
            },
            SetupSection::Assessment => match k.as_str() {
                "scoreMin" | "scoreMax" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                "allowReassess" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown assessment field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "sortBy" => {
                    obj.insert(
                        k.clone(),
                        Value::String(parse_choice(v, k, REPORT_SORT_CHOICES)?),
                    );
                }
                "includeDetails" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }

    if section == SetupSection::Assessment {
        let lo = obj.get("scoreMin").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let hi = obj.get("scoreMax").and_then(|v| v.as_f64()).unwrap_or(100.0);
        if lo > hi {
            return Err("scoreMin must not exceed scoreMax".into());
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            let mut candidate = current.clone();
            // A stored value that no longer validates must not block the workspace.
            match merge_section_patch(section, &mut candidate, saved_obj) {
                Ok(()) => current = candidate,
                Err(msg) => tracing::warn!(
                    section = section.name(),
                    error = %msg,
                    "ignoring invalid stored settings"
                ),
            }
        }
    }
    Ok(current)
}

pub fn update_section(
    conn: &Connection,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> anyhow::Result<Result<Value, String>> {
    let mut current = load_section(conn, section)?;
    if let Err(msg) = merge_section_patch(section, &mut current, patch) {
        return Ok(Err(msg));
    }
    db::settings_set_json(conn, section.key(), &current)?;
    Ok(Ok(current))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringSettings {
    pub report_mode: AggregateMode,
    pub default_element_weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssessmentSettings {
    pub score_min: f64,
    pub score_max: f64,
    pub allow_reassess: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportSettings {
    pub sort_by: ReportSort,
    pub include_details: bool,
}

pub fn scoring_settings(conn: &Connection) -> anyhow::Result<ScoringSettings> {
    let v = load_section(conn, SetupSection::Scoring)?;
    Ok(ScoringSettings {
        report_mode: if v["reportWeighted"].as_bool().unwrap_or(true) {
            AggregateMode::WEIGHTED
        } else {
            AggregateMode::UNWEIGHTED
        },
        default_element_weight: v["defaultElementWeight"].as_f64().unwrap_or(1.0),
    })
}

pub fn assessment_settings(conn: &Connection) -> anyhow::Result<AssessmentSettings> {
    let v = load_section(conn, SetupSection::Assessment)?;
    Ok(AssessmentSettings {
        score_min: v["scoreMin"].as_f64().unwrap_or(0.0),
        score_max: v["scoreMax"].as_f64().unwrap_or(100.0),
        allow_reassess: v["allowReassess"].as_bool().unwrap_or(false),
    })
}

pub fn report_settings(conn: &Connection) -> anyhow::Result<ReportSettings> {
    let v = load_section(conn, SetupSection::Reports)?;
    Ok(ReportSettings {
        sort_by: parse_report_sort(&v["sortBy"]).unwrap_or(ReportSort::Name),
        include_details: v["includeDetails"].as_bool().unwrap_or(true),
    })
}
