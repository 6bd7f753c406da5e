use crate::cache::CacheKey;
use crate::export;
use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, db_conn, fail, grading_policy, optional_i64, optional_str, parse_student_scope,
    ranking_policy, required_str, respond, Reply,
};
use crate::ipc::types::{AppState, Request, RequestContext};
use crate::calc::GroupKey;
use crate::report::{self, PredefinedKind, ReportContext, ScoreFilter};
use serde_json::json;
use tracing::debug;

fn report_ctx<'a>(state: &'a AppState, req: &Request) -> Result<ReportContext<'a>, serde_json::Value> {
    Ok(ReportContext {
        conn: db_conn(state, req)?,
        grading: grading_policy(state, req)?,
        ranking: ranking_policy(state, req)?,
        scope: parse_student_scope(req)?,
    })
}

fn filter_from_params(req: &Request) -> Result<ScoreFilter, serde_json::Value> {
    Ok(ScoreFilter {
        class_id: optional_str(req, "classId")?,
        subject_id: optional_str(req, "subjectId")?,
        period_id: optional_str(req, "periodId")?,
        academic_year: optional_str(req, "academicYear")?,
        level: optional_str(req, "level")?,
        ..Default::default()
    })
}

fn to_value<T: serde::Serialize>(req: &Request, v: &T) -> Reply {
    serde_json::to_value(v).map_err(|e| err(&req.id, "internal", e.to_string(), None))
}

fn handle_evaluation_stats(state: &mut AppState, req: &Request) -> Reply {
    let ctx = report_ctx(state, req)?;
    let evaluation_id = required_str(req, "evaluationId")?;
    let stats = report::evaluation_stats(&ctx, &evaluation_id).map_err(fail(req))?;
    to_value(req, &stats)
}

fn handle_class_report(state: &mut AppState, req: &Request) -> Reply {
    let ctx = report_ctx(state, req)?;
    let class_id = required_str(req, "classId")?;
    let period_id = optional_str(req, "periodId")?;
    let model = report::class_report(&ctx, &class_id, period_id.as_deref()).map_err(fail(req))?;
    to_value(req, &model)
}

fn handle_subject_report(state: &mut AppState, req: &Request) -> Reply {
    let ctx = report_ctx(state, req)?;
    let subject_id = required_str(req, "subjectId")?;
    let academic_year = optional_str(req, "academicYear")?;
    let period_id = optional_str(req, "periodId")?;
    let model = report::subject_report(&ctx, &subject_id, academic_year.as_deref(), period_id.as_deref())
        .map_err(fail(req))?;
    to_value(req, &model)
}

fn handle_period_report(state: &mut AppState, req: &Request) -> Reply {
    let ctx = report_ctx(state, req)?;
    let period_id = required_str(req, "periodId")?;
    let model = report::period_report(&ctx, &period_id).map_err(fail(req))?;
    to_value(req, &model)
}

fn handle_student_ranking(state: &mut AppState, req: &Request) -> Reply {
    let ctx = report_ctx(state, req)?;
    let filter = filter_from_params(req)?;
    let ranking = report::student_ranking(&ctx, &filter).map_err(fail(req))?;
    to_value(req, &ranking)
}

fn handle_grouped_stats(state: &mut AppState, req: &Request) -> Reply {
    let ctx = report_ctx(state, req)?;
    let raw = required_str(req, "groupBy")?;
    let Some(key) = GroupKey::parse(&raw) else {
        return Err(bad_params(req, format!("unknown groupBy: {}", raw)));
    };
    let min_sample = match optional_i64(req, "minSample")? {
        Some(n) if n < 0 => return Err(bad_params(req, "minSample must be >= 0")),
        other => other.map(|n| n as usize),
    };
    let mut filter = filter_from_params(req)?;
    filter.student_id = optional_str(req, "studentId")?;
    let groups = report::grouped_stats(&ctx, &filter, key, min_sample).map_err(fail(req))?;
    Ok(json!({ "groupBy": raw, "groups": groups }))
}

fn csv_file_name(label: &str) -> String {
    let slug: String = label
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("ranking_{}.csv", slug.trim_matches('_'))
}

fn handle_student_ranking_csv(state: &mut AppState, req: &Request) -> Reply {
    let ctx = report_ctx(state, req)?;
    let filter = filter_from_params(req)?;
    let ranking = report::student_ranking(&ctx, &filter).map_err(fail(req))?;

    let label = match (&filter.class_id, &filter.level) {
        (Some(class_id), _) => report::load_class(ctx.conn, class_id)
            .map(|c| format!("{} {}", c.name, c.academic_year))
            .map_err(fail(req))?,
        (None, Some(level)) => match &filter.academic_year {
            Some(y) => format!("{} {}", level, y),
            None => level.clone(),
        },
        (None, None) => String::from("school"),
    };

    Ok(json!({
        "filename": csv_file_name(&label),
        "rowCount": ranking.rows.len(),
        "csv": export::ranking_csv(&ranking.rows),
    }))
}

/// Parses a previously exported ranking file back into rows.
fn handle_ranking_csv_preview(_state: &mut AppState, req: &Request) -> Reply {
    let csv = required_str(req, "csv")?;
    let rows = export::parse_ranking_csv(&csv).map_err(fail(req))?;
    Ok(json!({ "rowCount": rows.len(), "rows": rows }))
}

fn handle_student_report(state: &mut AppState, req: &Request) -> Reply {
    let ctx = report_ctx(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let period_id = optional_str(req, "periodId")?;
    let model = report::student_report(&ctx, &student_id, period_id.as_deref()).map_err(fail(req))?;
    to_value(req, &model)
}

/// Predefined reports go through the per-user cache. Entries expire on TTL
/// only, so writes made in the meantime are not visible until then.
fn handle_predefined(state: &mut AppState, req: &Request) -> Reply {
    let rc = RequestContext::from_request(req);
    let kind = PredefinedKind::parse(&required_str(req, "kind")?).map_err(fail(req))?;
    let limit = match optional_i64(req, "limit")? {
        Some(n) if n <= 0 => return Err(bad_params(req, "limit must be > 0")),
        other => other.map(|n| n as usize),
    };

    let key = CacheKey::new(&rc.user, &req.method, &req.params);
    if let Some(mut hit) = state.cache.get(&key, rc.now) {
        debug!(user = %rc.user, kind = kind.as_str(), "predefined report served from cache");
        hit["cached"] = json!(true);
        return Ok(hit);
    }

    let mut result = {
        let ctx = report_ctx(state, req)?;
        let filter = filter_from_params(req)?;
        report::predefined(&ctx, kind, &filter, limit).map_err(fail(req))?
    };
    state.cache.put(key, result.clone(), rc.now);
    result["cached"] = json!(false);
    Ok(result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "reports.evaluationStats" => handle_evaluation_stats(state, req),
        "reports.classReport" => handle_class_report(state, req),
        "reports.subjectReport" => handle_subject_report(state, req),
        "reports.periodReport" => handle_period_report(state, req),
        "reports.studentRanking" => handle_student_ranking(state, req),
        "reports.studentRankingCsv" => handle_student_ranking_csv(state, req),
        "reports.rankingCsvPreview" => handle_ranking_csv_preview(state, req),
        "reports.groupedStats" => handle_grouped_stats(state, req),
        "reports.studentReport" => handle_student_report(state, req),
        "reports.predefined" => handle_predefined(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
