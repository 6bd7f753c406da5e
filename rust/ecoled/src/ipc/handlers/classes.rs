use crate::ipc::helpers::{
    bad_params, db_conn, db_fail, fail, new_id, optional_date, optional_f64, optional_i64,
    optional_str, required_str, respond, write_err, Reply,
};
use crate::ipc::types::{AppState, Request};
use crate::report;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use tracing::info;

fn handle_classes_create(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let name = required_str(req, "name")?;
    let level = required_str(req, "level")?;
    let academic_year = required_str(req, "academicYear")?;

    let id = new_id();
    conn.execute(
        "INSERT INTO classes(id, name, level, academic_year) VALUES(?, ?, ?, ?)",
        (&id, &name, &level, &academic_year),
    )
    .map_err(|e| write_err(req, "classes", e))?;
    info!(class_id = %id, %name, "class created");
    Ok(json!({ "classId": id }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let academic_year = optional_str(req, "academicYear")?;

    let mut sql = String::from(
        "SELECT c.id, c.name, c.level, c.academic_year,
                (SELECT COUNT(*) FROM enrollments e WHERE e.class_id = c.id AND e.status = 'active')
         FROM classes c",
    );
    let mut values: Vec<Value> = Vec::new();
    if let Some(y) = academic_year {
        sql.push_str(" WHERE c.academic_year = ?");
        values.push(Value::Text(y));
    }
    sql.push_str(" ORDER BY c.academic_year DESC, c.level, c.name");

    let mut stmt = conn.prepare(&sql).map_err(db_fail(req))?;
    let classes = stmt
        .query_map(params_from_iter(values), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "level": r.get::<_, String>(2)?,
                "academicYear": r.get::<_, String>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_fail(req))?;
    Ok(json!({ "classes": classes }))
}

fn coefficient_param(req: &Request) -> Result<Option<f64>, serde_json::Value> {
    match optional_f64(req, "coefficient")? {
        Some(c) if c < 0.0 => Err(bad_params(req, "coefficient must be >= 0")),
        other => Ok(other),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let name = required_str(req, "name")?;
    let code = optional_str(req, "code")?;
    let coefficient = coefficient_param(req)?.unwrap_or(1.0);

    let id = new_id();
    conn.execute(
        "INSERT INTO subjects(id, name, code, coefficient) VALUES(?, ?, ?, ?)",
        (&id, &name, &code, coefficient),
    )
    .map_err(|e| write_err(req, "subjects", e))?;
    info!(subject_id = %id, %name, coefficient, "subject created");
    Ok(json!({ "subjectId": id }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let mut subjects: Vec<report::SubjectHeader> = report::load_subjects(conn)
        .map_err(fail(req))?
        .into_values()
        .collect();
    subjects.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(json!({ "subjects": subjects }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let subject_id = required_str(req, "subjectId")?;
    let current = report::load_subject(conn, &subject_id).map_err(fail(req))?;

    let name = optional_str(req, "name")?.unwrap_or(current.name);
    let code = match req.params.get("code") {
        Some(_) => optional_str(req, "code")?,
        None => current.code,
    };
    let coefficient = coefficient_param(req)?.unwrap_or(current.coefficient);

    conn.execute(
        "UPDATE subjects SET name = ?, code = ?, coefficient = ? WHERE id = ?",
        (&name, &code, coefficient, &subject_id),
    )
    .map_err(|e| write_err(req, "subjects", e))?;
    info!(%subject_id, coefficient, "subject updated");
    Ok(json!({ "subjectId": subject_id }))
}

fn handle_periods_create(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let name = required_str(req, "name")?;
    let academic_year = required_str(req, "academicYear")?;
    let start_date = optional_date(req, "startDate")?;
    let end_date = optional_date(req, "endDate")?;
    if let (Some(s), Some(e)) = (&start_date, &end_date) {
        if e < s {
            return Err(bad_params(req, "endDate must not precede startDate"));
        }
    }

    let sort_order = match optional_i64(req, "sortOrder")? {
        Some(v) => v,
        None => conn
            .query_row(
                "SELECT MAX(sort_order) FROM periods WHERE academic_year = ?",
                [&academic_year],
                |r| r.get::<_, Option<i64>>(0),
            )
            .optional()
            .map_err(db_fail(req))?
            .flatten()
            .map(|m| m + 1)
            .unwrap_or(1),
    };

    let id = new_id();
    conn.execute(
        "INSERT INTO periods(id, name, academic_year, sort_order, start_date, end_date)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &name, &academic_year, sort_order, &start_date, &end_date),
    )
    .map_err(|e| write_err(req, "periods", e))?;
    info!(period_id = %id, %name, %academic_year, "period created");
    Ok(json!({ "periodId": id, "sortOrder": sort_order }))
}

fn handle_periods_list(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let academic_year = optional_str(req, "academicYear")?;

    let mut sql = String::from(
        "SELECT id, name, academic_year, sort_order, start_date, end_date FROM periods",
    );
    let mut values: Vec<Value> = Vec::new();
    if let Some(y) = academic_year {
        sql.push_str(" WHERE academic_year = ?");
        values.push(Value::Text(y));
    }
    sql.push_str(" ORDER BY academic_year DESC, sort_order");

    let mut stmt = conn.prepare(&sql).map_err(db_fail(req))?;
    let periods = stmt
        .query_map(params_from_iter(values), |r| {
            Ok(report::PeriodHeader {
                id: r.get(0)?,
                name: r.get(1)?,
                academic_year: r.get(2)?,
                sort_order: r.get(3)?,
                start_date: r.get(4)?,
                end_date: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_fail(req))?;
    Ok(json!({ "periods": periods }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "classes.create" => handle_classes_create(state, req),
        "classes.list" => handle_classes_list(state, req),
        "subjects.create" => handle_subjects_create(state, req),
        "subjects.list" => handle_subjects_list(state, req),
        "subjects.update" => handle_subjects_update(state, req),
        "periods.create" => handle_periods_create(state, req),
        "periods.list" => handle_periods_list(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
