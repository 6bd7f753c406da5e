//! Fee recovery ("recouvrement"): what each student owes versus what was paid.
//!
//! Amounts are integer minor units. Dates are `YYYY-MM-DD` strings, which
//! order correctly as text.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::calc::round_half_up_2;
use crate::error::AppError;

/// Largest single fee or payment accepted, in minor units.
pub const MAX_AMOUNT: i64 = 1_000_000_000_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeLine {
    pub id: String,
    pub class_id: String,
    pub label: String,
    pub amount: i64,
    pub due_date: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLine {
    pub id: String,
    pub student_id: String,
    pub fee_id: Option<String>,
    pub amount: i64,
    pub paid_at: String,
    pub reference: Option<String>,
}

/// A student with an open enrollment, as seen by recovery.
#[derive(Debug, Clone)]
pub struct Debtor {
    pub student_id: String,
    pub matricule: Option<String>,
    pub last_name: String,
    pub first_name: String,
    pub class_id: String,
    pub class_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBalance {
    pub student_id: String,
    pub matricule: Option<String>,
    pub last_name: String,
    pub first_name: String,
    pub class_id: String,
    pub class_name: String,
    pub due: i64,
    pub paid: i64,
    pub balance: i64,
    pub overdue: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySummary {
    pub as_of: Option<String>,
    pub rows: Vec<StudentBalance>,
    pub total_due: i64,
    pub total_paid: i64,
    pub total_balance: i64,
    /// `100 * paid / due`, absent when nothing is due.
    pub recovery_rate: Option<f64>,
    pub overdue_count: usize,
}

/// Fees counted as due: all of them, or those due on or before `as_of`.
pub fn fees_due<'a>(fees: &'a [FeeLine], as_of: Option<&str>) -> impl Iterator<Item = &'a FeeLine> + 'a {
    let as_of = as_of.map(str::to_string);
    fees.iter()
        .filter(move |f| as_of.as_deref().map(|d| f.due_date.as_str() <= d).unwrap_or(true))
}

fn checked_total(amounts: impl IntoIterator<Item = i64>) -> Result<i64, AppError> {
    amounts
        .into_iter()
        .try_fold(0i64, |acc, a| acc.checked_add(a))
        .ok_or_else(overflow)
}

fn overflow() -> AppError {
    AppError::new("amount_overflow", "amounts exceed the supported range")
}

pub fn recovery_rate(paid: i64, due: i64) -> Option<f64> {
    (due > 0).then(|| round_half_up_2(paid as f64 * 100.0 / due as f64))
}

/// `today` decides what is past due when no `as_of` is given.
pub fn balance_of(
    debtor: &Debtor,
    class_fees: &[FeeLine],
    payments: &[PaymentLine],
    as_of: Option<&str>,
    today: &str,
) -> Result<StudentBalance, AppError> {
    let reference = as_of.unwrap_or(today);
    let due = checked_total(fees_due(class_fees, as_of).map(|f| f.amount))?;
    let paid = checked_total(
        payments
            .iter()
            .filter(|p| as_of.map(|d| p.paid_at.as_str() <= d).unwrap_or(true))
            .map(|p| p.amount),
    )?;
    let balance = due.checked_sub(paid).ok_or_else(overflow)?;
    let past_due = fees_due(class_fees, as_of).any(|f| f.due_date.as_str() < reference);

    Ok(StudentBalance {
        student_id: debtor.student_id.clone(),
        matricule: debtor.matricule.clone(),
        last_name: debtor.last_name.clone(),
        first_name: debtor.first_name.clone(),
        class_id: debtor.class_id.clone(),
        class_name: debtor.class_name.clone(),
        due,
        paid,
        balance,
        overdue: balance > 0 && past_due,
    })
}

fn by_balance_then_name(a: &StudentBalance, b: &StudentBalance) -> Ordering {
    b.balance
        .cmp(&a.balance)
        .then_with(|| a.last_name.to_lowercase().cmp(&b.last_name.to_lowercase()))
        .then_with(|| a.first_name.to_lowercase().cmp(&b.first_name.to_lowercase()))
        .then_with(|| a.student_id.cmp(&b.student_id))
}

pub fn outstanding(
    debtors: &[Debtor],
    fees_by_class: &HashMap<String, Vec<FeeLine>>,
    payments_by_student: &HashMap<String, Vec<PaymentLine>>,
    as_of: Option<&str>,
    today: &str,
) -> Result<RecoverySummary, AppError> {
    let mut rows: Vec<StudentBalance> = debtors
        .iter()
        .map(|d| {
            let fees = fees_by_class.get(&d.class_id).map(Vec::as_slice).unwrap_or(&[]);
            let payments = payments_by_student
                .get(&d.student_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            balance_of(d, fees, payments, as_of, today)
        })
        .collect::<Result<_, _>>()?;
    rows.sort_by(by_balance_then_name);

    let total_due = checked_total(rows.iter().map(|r| r.due))?;
    let total_paid = checked_total(rows.iter().map(|r| r.paid))?;
    Ok(RecoverySummary {
        as_of: as_of.map(str::to_string),
        total_balance: total_due.checked_sub(total_paid).ok_or_else(overflow)?,
        recovery_rate: recovery_rate(total_paid, total_due),
        overdue_count: rows.iter().filter(|r| r.overdue).count(),
        total_due,
        total_paid,
        rows,
    })
}
