mod common;

use common::{create_evaluation, score, small_school, Sidecar};
use serde_json::json;

#[test]
fn status_moves_forward_only() {
    let mut s = Sidecar::start();
    let school = small_school(&mut s);
    let ev = create_evaluation(&mut s, &school.class_id, &school.subject_id, &school.period_id, "DS1", 20.0);

    let same = s.ok("evaluations.setStatus", json!({ "evaluationId": ev, "status": "scheduled" }));
    assert_eq!(same["changed"], json!(false));

    let done = s.ok("evaluations.setStatus", json!({ "evaluationId": ev, "status": "completed" }));
    assert_eq!(done["changed"], json!(true));

    assert_eq!(
        s.error_code("evaluations.setStatus", json!({ "evaluationId": ev, "status": "in_progress" })),
        "conflict"
    );
    assert_eq!(
        s.error_code("evaluations.setStatus", json!({ "evaluationId": ev, "status": "graded" })),
        "bad_params"
    );
}

#[test]
fn create_validates_inputs() {
    let mut s = Sidecar::start();
    let school = small_school(&mut s);
    let base = json!({
        "classId": school.class_id,
        "subjectId": school.subject_id,
        "periodId": school.period_id,
        "title": "DS1",
    });

    let mut zero_max = base.clone();
    zero_max["maxScore"] = json!(0);
    assert_eq!(s.error_code("evaluations.create", zero_max), "bad_params");

    let mut bad_coef = base.clone();
    bad_coef["maxScore"] = json!(20);
    bad_coef["coefficient"] = json!(0);
    assert_eq!(s.error_code("evaluations.create", bad_coef), "bad_params");

    let other_year = common::create_period(&mut s, "Trimestre 1", "2024-2025");
    let mut wrong_year = base.clone();
    wrong_year["maxScore"] = json!(20);
    wrong_year["periodId"] = json!(other_year);
    assert_eq!(s.error_code("evaluations.create", wrong_year), "bad_params");

    let mut unknown_subject = base;
    unknown_subject["maxScore"] = json!(20);
    unknown_subject["subjectId"] = json!("nope");
    assert_eq!(s.error_code("evaluations.create", unknown_subject), "not_found");
}

#[test]
fn delete_removes_scores() {
    let mut s = Sidecar::start();
    let school = small_school(&mut s);
    let ev = create_evaluation(&mut s, &school.class_id, &school.subject_id, &school.period_id, "DS1", 20.0);
    score(&mut s, &ev, &school.students[0], 11.0);
    score(&mut s, &ev, &school.students[1], 13.0);

    let got = s.ok("evaluations.get", json!({ "evaluationId": ev }));
    assert_eq!(got["scoreCount"], json!(2));
    assert_eq!(got["evaluation"]["status"], json!("in_progress"));

    let deleted = s.ok("evaluations.delete", json!({ "evaluationId": ev }));
    assert_eq!(deleted["removedScores"], json!(2));
    assert_eq!(s.error_code("evaluations.get", json!({ "evaluationId": ev })), "not_found");

    let report = s.ok("reports.classReport", json!({ "classId": school.class_id }));
    assert_eq!(report["overall"]["count"], json!(0));
    assert!(report["overall"]["mean"].is_null());
}
