use crate::db::now_timestamp;
use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, db_conn, db_fail, fail, new_id, optional_date, optional_f64, optional_str,
    required_f64, required_str, respond, tx_fail, write_err, Reply,
};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, ScoreFilter};
use serde_json::json;
use tracing::info;

/// Lifecycle of an evaluation. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvaluationStatus {
    Scheduled,
    InProgress,
    Completed,
}

impl EvaluationStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "scheduled" => Some(Self::Scheduled),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

fn handle_evaluations_create(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let class_id = required_str(req, "classId")?;
    let subject_id = required_str(req, "subjectId")?;
    let period_id = required_str(req, "periodId")?;
    let title = required_str(req, "title")?;
    let date = optional_date(req, "date")?;
    let max_score = required_f64(req, "maxScore")?;
    if max_score <= 0.0 {
        return Err(bad_params(req, "maxScore must be > 0"));
    }
    let coefficient = optional_f64(req, "coefficient")?.unwrap_or(1.0);
    if coefficient <= 0.0 {
        return Err(bad_params(req, "coefficient must be > 0"));
    }

    let class = report::load_class(conn, &class_id).map_err(fail(req))?;
    report::load_subject(conn, &subject_id).map_err(fail(req))?;
    let period = report::load_period(conn, &period_id).map_err(fail(req))?;
    if period.academic_year != class.academic_year {
        return Err(err(
            &req.id,
            "bad_params",
            "period and class belong to different academic years",
            Some(json!({
                "classYear": class.academic_year,
                "periodYear": period.academic_year,
            })),
        ));
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO evaluations(id, class_id, subject_id, period_id, title, date, max_score, coefficient, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'scheduled', ?)",
        (
            &id,
            &class_id,
            &subject_id,
            &period_id,
            &title,
            &date,
            max_score,
            coefficient,
            now_timestamp(),
        ),
    )
    .map_err(|e| write_err(req, "evaluations", e))?;
    info!(evaluation_id = %id, %class_id, %subject_id, max_score, "evaluation created");
    Ok(json!({ "evaluationId": id }))
}

fn handle_evaluations_list(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let filter = ScoreFilter {
        class_id: optional_str(req, "classId")?,
        subject_id: optional_str(req, "subjectId")?,
        period_id: optional_str(req, "periodId")?,
        ..Default::default()
    };
    let evaluations = report::load_evaluations(conn, &filter).map_err(fail(req))?;
    Ok(json!({ "evaluations": evaluations }))
}

fn handle_evaluations_get(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let evaluation_id = required_str(req, "evaluationId")?;
    let evaluation = report::load_evaluation(conn, &evaluation_id).map_err(fail(req))?;
    let score_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM scores WHERE evaluation_id = ?",
            [&evaluation_id],
            |r| r.get(0),
        )
        .map_err(db_fail(req))?;
    Ok(json!({ "evaluation": evaluation, "scoreCount": score_count }))
}

fn handle_evaluations_set_status(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let evaluation_id = required_str(req, "evaluationId")?;
    let raw = required_str(req, "status")?;
    let Some(next) = EvaluationStatus::parse(&raw) else {
        return Err(err(
            &req.id,
            "bad_params",
            "status must be one of: scheduled, in_progress, completed",
            Some(json!({ "status": raw })),
        ));
    };

    let evaluation = report::load_evaluation(conn, &evaluation_id).map_err(fail(req))?;
    let current = EvaluationStatus::parse(&evaluation.status).unwrap_or(EvaluationStatus::Scheduled);
    if next == current {
        return Ok(json!({ "evaluationId": evaluation_id, "status": current.as_str(), "changed": false }));
    }
    if next < current {
        return Err(err(
            &req.id,
            "conflict",
            "evaluation status cannot move backwards",
            Some(json!({ "from": current.as_str(), "to": next.as_str() })),
        ));
    }

    conn.execute(
        "UPDATE evaluations SET status = ? WHERE id = ?",
        (next.as_str(), &evaluation_id),
    )
    .map_err(|e| write_err(req, "evaluations", e))?;
    info!(%evaluation_id, from = current.as_str(), to = next.as_str(), "evaluation status changed");
    Ok(json!({ "evaluationId": evaluation_id, "status": next.as_str(), "changed": true }))
}

fn handle_evaluations_delete(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let evaluation_id = required_str(req, "evaluationId")?;
    report::load_evaluation(conn, &evaluation_id).map_err(fail(req))?;

    let tx = conn.unchecked_transaction().map_err(tx_fail(req))?;
    let removed_scores = tx
        .execute("DELETE FROM scores WHERE evaluation_id = ?", [&evaluation_id])
        .map_err(tx_fail(req))?;
    tx.execute("DELETE FROM evaluations WHERE id = ?", [&evaluation_id])
        .map_err(tx_fail(req))?;
    tx.commit().map_err(tx_fail(req))?;

    info!(%evaluation_id, removed_scores, "evaluation deleted");
    Ok(json!({ "evaluationId": evaluation_id, "removedScores": removed_scores }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "evaluations.create" => handle_evaluations_create(state, req),
        "evaluations.list" => handle_evaluations_list(state, req),
        "evaluations.get" => handle_evaluations_get(state, req),
        "evaluations.setStatus" => handle_evaluations_set_status(state, req),
        "evaluations.delete" => handle_evaluations_delete(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
