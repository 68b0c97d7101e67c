use crate::batch::MAX_WORKERS;
use crate::db;
use crate::grade::AbsenceRanking;
use crate::ipc::error::{err, no_workspace, ok};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{AttemptCounting, MergePolicy};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

#[derive(Clone, Copy)]
enum SetupSection {
    Merge,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Merge => "setup.merge",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Merge => json!({
            "attemptCounting": AttemptCounting::default().as_str(),
            "absenceRanking": AbsenceRanking::default().as_str(),
            "workers": 1,
            "rejectDuplicateSubmissions": false
        }),
    }
}

/// Typed view of the `merge` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSettings {
    pub attempt_counting: AttemptCounting,
    pub absence_ranking: AbsenceRanking,
    pub workers: usize,
    pub reject_duplicate_submissions: bool,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            attempt_counting: AttemptCounting::default(),
            absence_ranking: AbsenceRanking::default(),
            workers: 1,
            reject_duplicate_submissions: false,
        }
    }
}

impl MergeSettings {
    pub fn policy(&self) -> MergePolicy {
        MergePolicy::new(self.absence_ranking, self.attempt_counting)
    }

    // Only ever called on values that went through merge_section_patch.
    fn from_section(v: &Value) -> Self {
        let d = Self::default();
        Self {
            attempt_counting: v
                .get("attemptCounting")
                .and_then(|x| x.as_str())
                .and_then(AttemptCounting::parse)
                .unwrap_or(d.attempt_counting),
            absence_ranking: v
                .get("absenceRanking")
                .and_then(|x| x.as_str())
                .and_then(AbsenceRanking::parse)
                .unwrap_or(d.absence_ranking),
            workers: v
                .get("workers")
                .and_then(|x| x.as_u64())
                .map(|n| n as usize)
                .unwrap_or(d.workers),
            reject_duplicate_submissions: v
                .get("rejectDuplicateSubmissions")
                .and_then(|x| x.as_bool())
                .unwrap_or(d.reject_duplicate_submissions),
        }
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_choice(v: &Value, key: &str, choices: &[&str]) -> Result<String, String> {
    let s = v
        .as_str()
        .ok_or_else(|| format!("{} must be string", key))?
        .trim()
        .to_ascii_lowercase();
    if !choices.contains(&s.as_str()) {
        return Err(format!("{} must be one of: {}", key, choices.join(", ")));
    }
    Ok(s)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Merge => match k.as_str() {
                "attemptCounting" => {
                    let s = parse_choice(v, k, &["every_submission", "skip_identical"])?;
                    obj.insert(k.clone(), Value::String(s));
                }
                "absenceRanking" => {
                    let s = parse_choice(v, k, &["worse_than_fail", "same_as_fail"])?;
                    obj.insert(k.clone(), Value::String(s));
                }
                "workers" => {
                    let n = parse_i64_range(v, k, 1, MAX_WORKERS as i64)?;
                    obj.insert(k.clone(), Value::from(n));
                }
                "rejectDuplicateSubmissions" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown merge field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let single: Map<String, Value> = [(k.clone(), v.clone())].into_iter().collect();
                if let Err(e) = merge_section_patch(section, &mut current, &single) {
                    warn!(key = section.key(), error = %e, "ignoring stored setting");
                }
            }
        }
    }
    Ok(current)
}

pub fn load_merge_settings(conn: &rusqlite::Connection) -> anyhow::Result<MergeSettings> {
    let section = load_section(conn, SetupSection::Merge)?;
    Ok(MergeSettings::from_section(&section))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let merge = match load_section(conn, SetupSection::Merge) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "merge": merge }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(section = section.key(), "settings updated");
    ok(&req.id, json!({ "ok": true, "merge": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
