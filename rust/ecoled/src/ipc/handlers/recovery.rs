use std::collections::HashMap;

use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, db_conn, db_fail, fail, new_id, optional_date, optional_i64, optional_str,
    required_str, respond, write_err, Reply,
};
use crate::ipc::types::{AppState, Request};
use crate::recovery::{self, Debtor, FeeLine, PaymentLine, MAX_AMOUNT};
use crate::report;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

fn today() -> String {
    chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()
}

fn amount_param(req: &Request) -> Result<i64, serde_json::Value> {
    match optional_i64(req, "amount")? {
        None => Err(bad_params(req, "missing amount")),
        Some(a) if a <= 0 => Err(bad_params(req, "amount must be a positive integer")),
        Some(a) if a > MAX_AMOUNT => Err(err(
            &req.id,
            "bad_params",
            format!("amount must not exceed {}", MAX_AMOUNT),
            Some(json!({ "amount": a, "max": MAX_AMOUNT })),
        )),
        Some(a) => Ok(a),
    }
}

fn load_fees(conn: &Connection, class_id: Option<&str>) -> rusqlite::Result<Vec<FeeLine>> {
    let mut sql = String::from("SELECT id, class_id, label, amount, due_date FROM fees");
    let mut values: Vec<Value> = Vec::new();
    if let Some(c) = class_id {
        sql.push_str(" WHERE class_id = ?");
        values.push(Value::Text(c.to_string()));
    }
    sql.push_str(" ORDER BY due_date, label, id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |r| {
            Ok(FeeLine {
                id: r.get(0)?,
                class_id: r.get(1)?,
                label: r.get(2)?,
                amount: r.get(3)?,
                due_date: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

fn load_payments(conn: &Connection, student_id: Option<&str>) -> rusqlite::Result<Vec<PaymentLine>> {
    let mut sql = String::from(
        "SELECT id, student_id, fee_id, amount, paid_at, reference FROM payments",
    );
    let mut values: Vec<Value> = Vec::new();
    if let Some(s) = student_id {
        sql.push_str(" WHERE student_id = ?");
        values.push(Value::Text(s.to_string()));
    }
    sql.push_str(" ORDER BY paid_at, id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |r| {
            Ok(PaymentLine {
                id: r.get(0)?,
                student_id: r.get(1)?,
                fee_id: r.get(2)?,
                amount: r.get(3)?,
                paid_at: r.get(4)?,
                reference: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

fn handle_fees_create(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let class_id = required_str(req, "classId")?;
    let label = required_str(req, "label")?;
    let amount = amount_param(req)?;
    let Some(due_date) = optional_date(req, "dueDate")? else {
        return Err(bad_params(req, "missing dueDate"));
    };
    report::load_class(conn, &class_id).map_err(fail(req))?;

    let id = new_id();
    conn.execute(
        "INSERT INTO fees(id, class_id, label, amount, due_date) VALUES(?, ?, ?, ?, ?)",
        (&id, &class_id, &label, amount, &due_date),
    )
    .map_err(|e| write_err(req, "fees", e))?;
    info!(fee_id = %id, %class_id, amount, %due_date, "fee created");
    Ok(json!({ "feeId": id }))
}

fn handle_fees_list(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let class_id = optional_str(req, "classId")?;
    let fees = load_fees(conn, class_id.as_deref()).map_err(db_fail(req))?;
    Ok(json!({ "fees": fees }))
}

fn handle_payments_record(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let amount = amount_param(req)?;
    let fee_id = optional_str(req, "feeId")?;
    let paid_at = optional_date(req, "paidAt")?.unwrap_or_else(today);
    let reference = optional_str(req, "reference")?;

    report::load_student(conn, &student_id).map_err(fail(req))?;
    if let Some(f) = &fee_id {
        let exists = conn
            .query_row("SELECT 1 FROM fees WHERE id = ?", [f], |_| Ok(()))
            .optional()
            .map_err(db_fail(req))?
            .is_some();
        if !exists {
            return Err(err(&req.id, "not_found", "fee not found", Some(json!({ "feeId": f }))));
        }
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO payments(id, student_id, fee_id, amount, paid_at, reference)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &student_id, &fee_id, amount, &paid_at, &reference),
    )
    .map_err(|e| write_err(req, "payments", e))?;
    info!(payment_id = %id, %student_id, amount, %paid_at, "payment recorded");
    Ok(json!({ "paymentId": id, "paidAt": paid_at }))
}

fn handle_recovery_outstanding(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let class_id = optional_str(req, "classId")?;
    let as_of = optional_date(req, "asOf")?;
    if let Some(c) = &class_id {
        report::load_class(conn, c).map_err(fail(req))?;
    }

    let mut sql = String::from(
        "SELECT s.id, s.matricule, s.last_name, s.first_name, c.id, c.name
         FROM students s
         JOIN enrollments e ON e.student_id = s.id AND e.status = 'active'
         JOIN classes c ON c.id = e.class_id
         WHERE s.status = 'active'",
    );
    let mut values: Vec<Value> = Vec::new();
    if let Some(c) = &class_id {
        sql.push_str(" AND c.id = ?");
        values.push(Value::Text(c.clone()));
    }
    let mut stmt = conn.prepare(&sql).map_err(db_fail(req))?;
    let debtors = stmt
        .query_map(params_from_iter(values), |r| {
            Ok(Debtor {
                student_id: r.get(0)?,
                matricule: r.get(1)?,
                last_name: r.get(2)?,
                first_name: r.get(3)?,
                class_id: r.get(4)?,
                class_name: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_fail(req))?;

    let mut fees_by_class: HashMap<String, Vec<FeeLine>> = HashMap::new();
    for f in load_fees(conn, class_id.as_deref()).map_err(db_fail(req))? {
        fees_by_class.entry(f.class_id.clone()).or_default().push(f);
    }
    let mut payments_by_student: HashMap<String, Vec<PaymentLine>> = HashMap::new();
    for p in load_payments(conn, None).map_err(db_fail(req))? {
        payments_by_student.entry(p.student_id.clone()).or_default().push(p);
    }

    let summary = recovery::outstanding(
        &debtors,
        &fees_by_class,
        &payments_by_student,
        as_of.as_deref(),
        &today(),
    )
    .map_err(fail(req))?;
    Ok(json!(summary))
}

fn handle_recovery_student_statement(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let student = report::load_student(conn, &student_id).map_err(fail(req))?;

    // Open enrollment first, otherwise the most recent one.
    let class = conn
        .query_row(
            "SELECT c.id, c.name FROM enrollments e
             JOIN classes c ON c.id = e.class_id
             WHERE e.student_id = ?
             ORDER BY (e.status = 'active') DESC, e.enrolled_at DESC
             LIMIT 1",
            [&student_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()
        .map_err(db_fail(req))?;

    let fees = match &class {
        Some((class_id, _)) => load_fees(conn, Some(class_id)).map_err(db_fail(req))?,
        None => Vec::new(),
    };
    let payments = load_payments(conn, Some(&student_id)).map_err(db_fail(req))?;

    let (class_id, class_name) = class.unwrap_or_default();
    let debtor = Debtor {
        student_id: student.id.clone(),
        matricule: student.matricule.clone(),
        last_name: student.last_name.clone(),
        first_name: student.first_name.clone(),
        class_id,
        class_name,
    };
    let balance =
        recovery::balance_of(&debtor, &fees, &payments, None, &today()).map_err(fail(req))?;

    Ok(json!({
        "student": student,
        "fees": fees,
        "payments": payments,
        "due": balance.due,
        "paid": balance.paid,
        "balance": balance.balance,
        "overdue": balance.overdue,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "fees.create" => handle_fees_create(state, req),
        "fees.list" => handle_fees_list(state, req),
        "payments.record" => handle_payments_record(state, req),
        "recovery.outstanding" => handle_recovery_outstanding(state, req),
        "recovery.studentStatement" => handle_recovery_student_statement(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
