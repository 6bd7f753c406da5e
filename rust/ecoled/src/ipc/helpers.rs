use crate::calc::GradingPolicy;
use crate::error::AppError;
use crate::ipc::error::{app_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ranking::RankingPolicy;
use crate::report::StudentScope;
use rusqlite::Connection;
use serde_json::json;

/// Handler outcome: `Ok` carries the result payload, `Err` a ready error response.
pub type Reply = Result<serde_json::Value, serde_json::Value>;

pub fn respond(req: &Request, reply: Reply) -> serde_json::Value {
    match reply {
        Ok(v) => ok(&req.id, v),
        Err(e) => e,
    }
}

pub fn fail(req: &Request) -> impl Fn(AppError) -> serde_json::Value + '_ {
    move |e| app_err(&req.id, e)
}

pub fn bad_params(req: &Request, message: impl Into<String>) -> serde_json::Value {
    err(&req.id, "bad_params", message, None)
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match optional_str(req, key)? {
        Some(v) => Ok(v),
        None => Err(bad_params(req, format!("missing {}", key))),
    }
}

/// Trimmed string param; blank and null read as absent.
pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(bad_params(req, format!("{} must be a string", key)));
            };
            let t = s.trim();
            Ok((!t.is_empty()).then(|| t.to_string()))
        }
    }
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    optional_f64(req, key)?.ok_or_else(|| bad_params(req, format!("missing {}", key)))
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_f64() {
            Some(n) if n.is_finite() => Ok(Some(n)),
            _ => Err(bad_params(req, format!("{} must be a number", key))),
        },
    }
}

pub fn optional_i64(req: &Request, key: &str) -> Result<Option<i64>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| bad_params(req, format!("{} must be an integer", key))),
    }
}

/// `YYYY-MM-DD`, validated.
pub fn optional_date(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    let Some(raw) = optional_str(req, key)? else {
        return Ok(None);
    };
    match chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        Ok(d) => Ok(Some(d.format("%Y-%m-%d").to_string())),
        Err(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a date (YYYY-MM-DD)", key),
            Some(json!({ "field": key, "value": raw })),
        )),
    }
}

pub fn parse_student_scope(req: &Request) -> Result<StudentScope, serde_json::Value> {
    let raw = optional_str(req, "studentScope")?;
    StudentScope::parse(raw.as_deref()).map_err(fail(req))
}

/// Config policy, optionally overridden by `params.passRatio`.
pub fn grading_policy(state: &AppState, req: &Request) -> Result<GradingPolicy, serde_json::Value> {
    let mut policy = state.config.grading_policy();
    if let Some(r) = optional_f64(req, "passRatio")? {
        if !(r > 0.0 && r <= 1.0) {
            return Err(err(
                &req.id,
                "bad_params",
                "passRatio must be in (0, 1]",
                Some(json!({ "passRatio": r })),
            ));
        }
        policy.pass_ratio = r;
    }
    Ok(policy)
}

/// Config policy, optionally overridden by `params.minEvaluations`.
pub fn ranking_policy(state: &AppState, req: &Request) -> Result<RankingPolicy, serde_json::Value> {
    let mut policy = state.config.ranking_policy();
    if let Some(n) = optional_i64(req, "minEvaluations")? {
        if n < 0 {
            return Err(bad_params(req, "minEvaluations must be >= 0"));
        }
        policy.min_evaluations = n as usize;
    }
    Ok(policy)
}

/// Maps a failed INSERT/UPDATE; constraint violations become `conflict`.
pub fn write_err(req: &Request, table: &str, e: rusqlite::Error) -> serde_json::Value {
    let code = match &e {
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
            "conflict"
        }
        _ => "db_insert_failed",
    };
    err(&req.id, code, e.to_string(), Some(json!({ "table": table })))
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn db_fail(req: &Request) -> impl Fn(rusqlite::Error) -> serde_json::Value + '_ {
    move |e| app_err(&req.id, e.into())
}

pub fn tx_fail(req: &Request) -> impl Fn(rusqlite::Error) -> serde_json::Value + '_ {
    move |e| err(&req.id, "db_tx_failed", e.to_string(), None)
}
