use crate::db::now_timestamp;
use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, db_conn, db_fail, fail, new_id, optional_date, optional_str, required_str,
    respond, tx_fail, write_err, Reply,
};
use crate::ipc::types::{AppState, Request};
use crate::report;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

const STUDENT_STATUSES: [&str; 3] = ["active", "transferred", "withdrawn"];

fn gender_param(req: &Request) -> Result<Option<String>, serde_json::Value> {
    match optional_str(req, "gender")? {
        None => Ok(None),
        Some(g) => match g.to_uppercase().as_str() {
            "M" | "F" => Ok(Some(g.to_uppercase())),
            _ => Err(bad_params(req, "gender must be M or F")),
        },
    }
}

fn active_enrollment(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Option<(String, String)>> {
    conn.query_row(
        "SELECT id, class_id FROM enrollments WHERE student_id = ? AND status = 'active'",
        [student_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
}

fn handle_students_create(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let last_name = required_str(req, "lastName")?;
    let first_name = required_str(req, "firstName")?;
    let class_id = required_str(req, "classId")?;
    let matricule = optional_str(req, "matricule")?;
    let birth_date = optional_date(req, "birthDate")?;
    let gender = gender_param(req)?;

    let class = report::load_class(conn, &class_id).map_err(fail(req))?;

    let student_id = new_id();
    let enrollment_id = new_id();
    let now = now_timestamp();

    let tx = conn.unchecked_transaction().map_err(tx_fail(req))?;
    tx.execute(
        "INSERT INTO students(id, matricule, last_name, first_name, birth_date, gender, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 'active', ?, ?)",
        (
            &student_id,
            &matricule,
            &last_name,
            &first_name,
            &birth_date,
            &gender,
            &now,
            &now,
        ),
    )
    .map_err(|e| write_err(req, "students", e))?;
    tx.execute(
        "INSERT INTO enrollments(id, student_id, class_id, academic_year, status, enrolled_at)
         VALUES(?, ?, ?, ?, 'active', ?)",
        (&enrollment_id, &student_id, &class.id, &class.academic_year, &now),
    )
    .map_err(|e| write_err(req, "enrollments", e))?;
    tx.commit().map_err(tx_fail(req))?;

    info!(%student_id, class_id = %class.id, "student admitted");
    Ok(json!({ "studentId": student_id, "enrollmentId": enrollment_id }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let class_id = optional_str(req, "classId")?;
    let status = optional_str(req, "status")?;
    if let Some(s) = &status {
        if !STUDENT_STATUSES.contains(&s.as_str()) {
            return Err(err(
                &req.id,
                "bad_params",
                "status must be one of: active, transferred, withdrawn",
                Some(json!({ "status": s })),
            ));
        }
    }

    let mut sql = String::from(
        "SELECT s.id, s.matricule, s.last_name, s.first_name, s.birth_date, s.gender, s.status,
                e.class_id
         FROM students s
         LEFT JOIN enrollments e ON e.student_id = s.id AND e.status = 'active'
         WHERE 1 = 1",
    );
    let mut values: Vec<Value> = Vec::new();
    if let Some(c) = class_id {
        // Former members of the class are listed too when a status filter asks for them.
        sql.push_str(
            " AND s.id IN (SELECT student_id FROM enrollments WHERE class_id = ?
                           AND (status = 'active' OR ? IS NOT NULL))",
        );
        values.push(Value::Text(c));
        values.push(match &status {
            Some(s) => Value::Text(s.clone()),
            None => Value::Null,
        });
    }
    if let Some(s) = status {
        sql.push_str(" AND s.status = ?");
        values.push(Value::Text(s));
    }
    sql.push_str(" ORDER BY s.last_name COLLATE NOCASE, s.first_name COLLATE NOCASE, s.id");

    let mut stmt = conn.prepare(&sql).map_err(db_fail(req))?;
    let students = stmt
        .query_map(params_from_iter(values), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "matricule": r.get::<_, Option<String>>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "firstName": r.get::<_, String>(3)?,
                "birthDate": r.get::<_, Option<String>>(4)?,
                "gender": r.get::<_, Option<String>>(5)?,
                "status": r.get::<_, String>(6)?,
                "classId": r.get::<_, Option<String>>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_fail(req))?;
    Ok(json!({ "students": students }))
}

fn handle_students_get(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;

    let student = conn
        .query_row(
            "SELECT id, matricule, last_name, first_name, birth_date, gender, status,
                    created_at, updated_at
             FROM students WHERE id = ?",
            [&student_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "matricule": r.get::<_, Option<String>>(1)?,
                    "lastName": r.get::<_, String>(2)?,
                    "firstName": r.get::<_, String>(3)?,
                    "birthDate": r.get::<_, Option<String>>(4)?,
                    "gender": r.get::<_, Option<String>>(5)?,
                    "status": r.get::<_, String>(6)?,
                    "createdAt": r.get::<_, String>(7)?,
                    "updatedAt": r.get::<_, String>(8)?,
                }))
            },
        )
        .optional()
        .map_err(db_fail(req))?
        .ok_or_else(|| err(&req.id, "not_found", "student not found", None))?;

    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.class_id, c.name, e.academic_year, e.status, e.enrolled_at, e.ended_at
             FROM enrollments e
             JOIN classes c ON c.id = e.class_id
             WHERE e.student_id = ?
             ORDER BY e.enrolled_at, e.id",
        )
        .map_err(db_fail(req))?;
    let enrollments = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "className": r.get::<_, String>(2)?,
                "academicYear": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "enrolledAt": r.get::<_, String>(5)?,
                "endedAt": r.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_fail(req))?;

    Ok(json!({ "student": student, "enrollments": enrollments }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let current = report::load_student(conn, &student_id).map_err(fail(req))?;

    let last_name = optional_str(req, "lastName")?.unwrap_or(current.last_name);
    let first_name = optional_str(req, "firstName")?.unwrap_or(current.first_name);
    let matricule = match req.params.get("matricule") {
        Some(_) => optional_str(req, "matricule")?,
        None => current.matricule,
    };

    let mut sql = String::from(
        "UPDATE students SET last_name = ?, first_name = ?, matricule = ?, updated_at = ?",
    );
    let mut values: Vec<Value> = vec![
        Value::Text(last_name),
        Value::Text(first_name),
        matricule.map(Value::Text).unwrap_or(Value::Null),
        Value::Text(now_timestamp()),
    ];
    if req.params.get("birthDate").is_some() {
        sql.push_str(", birth_date = ?");
        values.push(optional_date(req, "birthDate")?.map(Value::Text).unwrap_or(Value::Null));
    }
    if req.params.get("gender").is_some() {
        sql.push_str(", gender = ?");
        values.push(gender_param(req)?.map(Value::Text).unwrap_or(Value::Null));
    }
    sql.push_str(" WHERE id = ?");
    values.push(Value::Text(student_id.clone()));

    conn.execute(&sql, params_from_iter(values))
        .map_err(|e| write_err(req, "students", e))?;
    info!(%student_id, "student updated");
    Ok(json!({ "studentId": student_id }))
}

/// With `classId`: moves the student to another class (the student stays
/// active). Without: the student leaves the school as `transferred`.
fn handle_students_transfer(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let target_class_id = optional_str(req, "classId")?;

    let student = report::load_student(conn, &student_id).map_err(fail(req))?;
    if student.status != "active" {
        return Err(err(
            &req.id,
            "conflict",
            "only active students can be transferred",
            Some(json!({ "status": student.status })),
        ));
    }
    let current = active_enrollment(conn, &student_id).map_err(db_fail(req))?;
    let target = target_class_id
        .map(|id| report::load_class(conn, &id))
        .transpose()
        .map_err(fail(req))?;
    if let (Some((_, from)), Some(to)) = (&current, &target) {
        if from == &to.id {
            return Err(bad_params(req, "student is already enrolled in this class"));
        }
    }

    let now = now_timestamp();
    let tx = conn.unchecked_transaction().map_err(tx_fail(req))?;
    tx.execute(
        "UPDATE enrollments SET status = 'transferred', ended_at = ?
         WHERE student_id = ? AND status = 'active'",
        (&now, &student_id),
    )
    .map_err(|e| write_err(req, "enrollments", e))?;

    let enrollment_id = match &target {
        Some(class) => {
            let id = new_id();
            tx.execute(
                "INSERT INTO enrollments(id, student_id, class_id, academic_year, status, enrolled_at)
                 VALUES(?, ?, ?, ?, 'active', ?)",
                (&id, &student_id, &class.id, &class.academic_year, &now),
            )
            .map_err(|e| write_err(req, "enrollments", e))?;
            Some(id)
        }
        None => {
            tx.execute(
                "UPDATE students SET status = 'transferred', updated_at = ? WHERE id = ?",
                (&now, &student_id),
            )
            .map_err(|e| write_err(req, "students", e))?;
            None
        }
    };
    tx.commit().map_err(tx_fail(req))?;

    info!(
        %student_id,
        from = current.as_ref().map(|(_, c)| c.as_str()).unwrap_or("-"),
        to = target.as_ref().map(|c| c.id.as_str()).unwrap_or("-"),
        "student transferred"
    );
    let status = if target.is_some() { "active" } else { "transferred" };
    Ok(json!({
        "studentId": student_id,
        "status": status,
        "enrollmentId": enrollment_id,
    }))
}

fn handle_students_withdraw(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let student = report::load_student(conn, &student_id).map_err(fail(req))?;
    if student.status == "withdrawn" {
        return Err(err(&req.id, "conflict", "student already withdrawn", None));
    }

    let now = now_timestamp();
    let tx = conn.unchecked_transaction().map_err(tx_fail(req))?;
    tx.execute(
        "UPDATE enrollments SET status = 'withdrawn', ended_at = ?
         WHERE student_id = ? AND status = 'active'",
        (&now, &student_id),
    )
    .map_err(|e| write_err(req, "enrollments", e))?;
    tx.execute(
        "UPDATE students SET status = 'withdrawn', updated_at = ? WHERE id = ?",
        (&now, &student_id),
    )
    .map_err(|e| write_err(req, "students", e))?;
    tx.commit().map_err(tx_fail(req))?;

    info!(%student_id, "student withdrawn");
    Ok(json!({ "studentId": student_id, "status": "withdrawn" }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "students.create" => handle_students_create(state, req),
        "students.list" => handle_students_list(state, req),
        "students.get" => handle_students_get(state, req),
        "students.update" => handle_students_update(state, req),
        "students.transfer" => handle_students_transfer(state, req),
        "students.withdraw" => handle_students_withdraw(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
