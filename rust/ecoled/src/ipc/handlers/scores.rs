use std::collections::HashSet;

use crate::calc::{normalize, Mention};
use crate::db::now_timestamp;
use crate::error::AppError;
use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, db_conn, db_fail, fail, new_id, optional_str, required_f64, required_str, respond,
    write_err, Reply,
};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, EvaluationHeader};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntryRequest {
    pub evaluation_id: String,
    pub entries: Vec<BatchEntryRow>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntryRow {
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub remark: Option<String>,
}

impl BatchEntryRow {
    fn student_id(&self) -> &str {
        self.student_id.as_deref().map(str::trim).unwrap_or("")
    }
}

/// A batch row that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRow<'a> {
    pub student_id: &'a str,
    pub value: f64,
    pub remark: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub index: usize,
    pub student_id: String,
    pub code: String,
    pub message: String,
}

impl RowError {
    fn new(index: usize, student_id: &str, e: AppError) -> Self {
        Self {
            index,
            student_id: student_id.to_string(),
            code: e.code,
            message: e.message,
        }
    }
}

fn check_writable(evaluation: &EvaluationHeader) -> Result<(), AppError> {
    if evaluation.status == "completed" {
        return Err(AppError::new("evaluation_locked", "evaluation is completed")
            .with_details(json!({ "evaluationId": evaluation.id })));
    }
    Ok(())
}

fn row_value(value: &serde_json::Value) -> Result<f64, AppError> {
    match value {
        serde_json::Value::Null => Err(AppError::bad_params("missing value")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| AppError::bad_params("value must be a number")),
        other => Err(AppError::bad_params("value must be a number")
            .with_details(json!({ "value": other }))),
    }
}

fn check_value(value: f64, max_score: f64) -> Result<(), AppError> {
    if !value.is_finite() || value < 0.0 || value > max_score {
        return Err(AppError::bad_params(format!(
            "value must be between 0 and {}",
            max_score
        ))
        .with_details(json!({ "value": value, "maxScore": max_score })));
    }
    Ok(())
}

/// Students with any enrollment (current or past) in the class.
fn class_roster(conn: &Connection, class_id: &str) -> Result<HashSet<String>, AppError> {
    let mut stmt = conn.prepare("SELECT DISTINCT student_id FROM enrollments WHERE class_id = ?")?;
    let ids = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())?;
    Ok(ids)
}

fn existing_students(conn: &Connection, ids: &[&str]) -> Result<HashSet<String>, AppError> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT id FROM students WHERE id IN ({})", placeholders);
    let mut stmt = conn.prepare(&sql)?;
    let found = stmt
        .query_map(params_from_iter(ids.iter()), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())?;
    Ok(found)
}

/// Splits a batch into writable rows and per-row rejections. Order is kept.
pub fn validate_batch<'a>(
    rows: &'a [BatchEntryRow],
    max_score: f64,
    known: &HashSet<String>,
    roster: &HashSet<String>,
) -> (Vec<ScoreRow<'a>>, Vec<RowError>) {
    let mut valid = Vec::new();
    let mut errors = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for (index, row) in rows.iter().enumerate() {
        let sid = row.student_id();
        let verdict = if sid.is_empty() {
            Err(AppError::bad_params("missing studentId"))
        } else if !seen.insert(sid) {
            Err(AppError::new("duplicate_entry", "student appears more than once in the batch"))
        } else if !known.contains(sid) {
            Err(AppError::not_found("student"))
        } else if !roster.contains(sid) {
            Err(AppError::new("not_enrolled", "student is not enrolled in the evaluation's class"))
        } else {
            row_value(&row.value).and_then(|v| check_value(v, max_score).map(|()| v))
        };
        match verdict {
            Ok(value) => valid.push(ScoreRow {
                student_id: sid,
                value,
                remark: row.remark.as_deref().map(str::trim).filter(|r| !r.is_empty()),
            }),
            Err(e) => errors.push(RowError::new(index, sid, e)),
        }
    }
    (valid, errors)
}

fn upsert_score(
    conn: &Connection,
    evaluation_id: &str,
    student_id: &str,
    value: f64,
    remark: Option<&str>,
    now: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO scores(id, evaluation_id, student_id, value, remark, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(evaluation_id, student_id) DO UPDATE SET
           value = excluded.value,
           remark = excluded.remark,
           updated_at = excluded.updated_at",
        (new_id(), evaluation_id, student_id, value, remark, now),
    )?;
    Ok(())
}

/// A scheduled evaluation becomes in progress once it has a score.
fn advance_to_in_progress(conn: &Connection, evaluation_id: &str) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE evaluations SET status = 'in_progress' WHERE id = ? AND status = 'scheduled'",
        [evaluation_id],
    )?;
    Ok(n > 0)
}

/// Writes every row or none of them.
pub fn write_batch(
    conn: &Connection,
    evaluation_id: &str,
    rows: &[ScoreRow<'_>],
) -> rusqlite::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let now = now_timestamp();
    for row in rows {
        upsert_score(&tx, evaluation_id, row.student_id, row.value, row.remark, &now)?;
    }
    if !rows.is_empty() {
        advance_to_in_progress(&tx, evaluation_id)?;
    }
    tx.commit()?;
    Ok(rows.len())
}

fn handle_scores_list(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let evaluation_id = required_str(req, "evaluationId")?;
    let evaluation = report::load_evaluation(conn, &evaluation_id).map_err(fail(req))?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.matricule, s.last_name, s.first_name, s.status, sc.value, sc.remark
             FROM students s
             LEFT JOIN scores sc ON sc.student_id = s.id AND sc.evaluation_id = ?1
             WHERE s.id IN (SELECT student_id FROM enrollments WHERE class_id = ?2 AND status = 'active')
                OR sc.id IS NOT NULL
             ORDER BY s.last_name COLLATE NOCASE, s.first_name COLLATE NOCASE, s.id",
        )
        .map_err(db_fail(req))?;
    let max_score = evaluation.max_score;
    let rows = stmt
        .query_map((&evaluation.id, &evaluation.class_id), |r| {
            let value: Option<f64> = r.get(5)?;
            let normalized = value.and_then(|v| normalize(v, max_score));
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "matricule": r.get::<_, Option<String>>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "firstName": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "value": value,
                "normalized": normalized,
                "mention": normalized.map(Mention::from_normalized),
                "remark": r.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_fail(req))?;

    Ok(json!({ "evaluation": evaluation, "rows": rows }))
}

fn handle_scores_upsert(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let evaluation_id = required_str(req, "evaluationId")?;
    let student_id = required_str(req, "studentId")?;
    let value = required_f64(req, "value")?;
    let remark = optional_str(req, "remark")?;

    let evaluation = report::load_evaluation(conn, &evaluation_id).map_err(fail(req))?;
    check_writable(&evaluation).map_err(fail(req))?;
    check_value(value, evaluation.max_score).map_err(fail(req))?;
    report::load_student(conn, &student_id).map_err(fail(req))?;
    let roster = class_roster(conn, &evaluation.class_id).map_err(fail(req))?;
    if !roster.contains(&student_id) {
        return Err(err(
            &req.id,
            "not_enrolled",
            "student is not enrolled in the evaluation's class",
            Some(json!({ "studentId": student_id, "classId": evaluation.class_id })),
        ));
    }

    upsert_score(conn, &evaluation_id, &student_id, value, remark.as_deref(), &now_timestamp())
        .map_err(|e| write_err(req, "scores", e))?;
    let advanced = advance_to_in_progress(conn, &evaluation_id).map_err(db_fail(req))?;
    info!(%evaluation_id, %student_id, value, "score saved");
    Ok(json!({
        "evaluationId": evaluation_id,
        "studentId": student_id,
        "value": value,
        "normalized": normalize(value, evaluation.max_score),
        "statusAdvanced": advanced,
    }))
}

fn handle_scores_delete(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let evaluation_id = required_str(req, "evaluationId")?;
    let student_id = required_str(req, "studentId")?;
    let evaluation = report::load_evaluation(conn, &evaluation_id).map_err(fail(req))?;
    check_writable(&evaluation).map_err(fail(req))?;

    let n = conn
        .execute(
            "DELETE FROM scores WHERE evaluation_id = ? AND student_id = ?",
            (&evaluation_id, &student_id),
        )
        .map_err(db_fail(req))?;
    if n > 0 {
        info!(%evaluation_id, %student_id, "score deleted");
    }
    Ok(json!({ "deleted": n > 0 }))
}

fn handle_scores_batch_entry(state: &mut AppState, req: &Request) -> Reply {
    let max_entries = state.config.limits.batch_max_entries;
    let conn = db_conn(state, req)?;
    let batch: BatchEntryRequest = serde_json::from_value(req.params.clone())
        .map_err(|e| bad_params(req, format!("invalid batch: {}", e)))?;

    if batch.entries.len() > max_entries {
        return Err(err(
            &req.id,
            "bad_params",
            format!(
                "batch exceeds max entries: {} > {}",
                batch.entries.len(),
                max_entries
            ),
            Some(json!({ "limit": max_entries, "received": batch.entries.len() })),
        ));
    }

    let evaluation = report::load_evaluation(conn, &batch.evaluation_id).map_err(fail(req))?;
    check_writable(&evaluation).map_err(fail(req))?;

    let ids: Vec<&str> = batch
        .entries
        .iter()
        .map(BatchEntryRow::student_id)
        .filter(|sid| !sid.is_empty())
        .collect();
    let known = existing_students(conn, &ids).map_err(fail(req))?;
    let roster = class_roster(conn, &evaluation.class_id).map_err(fail(req))?;
    let (valid, errors) = validate_batch(&batch.entries, evaluation.max_score, &known, &roster);

    for e in &errors {
        warn!(
            evaluation_id = %evaluation.id,
            index = e.index,
            student_id = %e.student_id,
            code = %e.code,
            "batch row rejected"
        );
    }

    let saved = match write_batch(conn, &evaluation.id, &valid) {
        Ok(n) => n,
        Err(e) => {
            warn!(evaluation_id = %evaluation.id, error = %e, "batch rolled back");
            return Err(err(
                &req.id,
                "db_tx_failed",
                e.to_string(),
                Some(json!({
                    "notSaved": valid.len(),
                    "rejected": errors.len(),
                    "errors": errors,
                })),
            ));
        }
    };

    info!(evaluation_id = %evaluation.id, saved, rejected = errors.len(), "batch entry saved");
    Ok(json!({
        "evaluationId": evaluation.id,
        "saved": saved,
        "rejected": errors.len(),
        "errors": errors,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "scores.list" => handle_scores_list(state, req),
        "scores.upsert" => handle_scores_upsert(state, req),
        "scores.delete" => handle_scores_delete(state, req),
        "scores.batchEntry" => handle_scores_batch_entry(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
