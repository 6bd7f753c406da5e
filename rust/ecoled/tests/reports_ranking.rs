mod common;

use common::{create_evaluation, score, small_school, Sidecar, School};
use serde_json::{json, Value};

/// Diop 14/16, Ba 16/14 (tied at 15), Sow 18 on one evaluation only.
fn scored_school(s: &mut Sidecar) -> (School, String, String) {
    let school = small_school(s);
    let ds1 = create_evaluation(s, &school.class_id, &school.subject_id, &school.period_id, "DS1", 20.0);
    let ds2 = create_evaluation(s, &school.class_id, &school.subject_id, &school.period_id, "DS2", 20.0);
    let [diop, ba, sow] = [&school.students[0], &school.students[1], &school.students[2]];
    score(s, &ds1, diop, 14.0);
    score(s, &ds2, diop, 16.0);
    score(s, &ds1, ba, 16.0);
    score(s, &ds2, ba, 14.0);
    score(s, &ds1, sow, 18.0);
    (school, ds1, ds2)
}

fn names(rows: &Value) -> Vec<String> {
    rows.as_array()
        .expect("rows")
        .iter()
        .map(|r| r["lastName"].as_str().unwrap_or("").to_string())
        .collect()
}

#[test]
fn class_report_ranks_with_exclusion_and_tie_break() {
    let mut s = Sidecar::start();
    let (school, _, _) = scored_school(&mut s);

    let report = s.ok("reports.classReport", json!({ "classId": school.class_id }));
    assert_eq!(report["studentScope"], json!("active"));
    assert_eq!(report["overall"]["count"], json!(5));
    assert_eq!(report["overall"]["max"], json!(18.0));
    assert_eq!(report["perEvaluation"].as_array().unwrap().len(), 2);
    assert_eq!(report["perSubject"][0]["evaluationCount"], json!(2));

    let ranking = &report["ranking"];
    assert_eq!(names(&ranking["rows"]), vec!["Ba", "Diop"]);
    assert_eq!(ranking["unrankedCount"], json!(1));
    assert_eq!(ranking["minEvaluations"], json!(2));
    let rows = ranking["rows"].as_array().unwrap();
    assert_eq!(rows[0]["rank"], json!(1));
    assert_eq!(rows[0]["exAequo"], json!(false));
    assert_eq!(rows[1]["rank"], json!(2));
    assert_eq!(rows[1]["exAequo"], json!(true));
    assert_eq!(rows[0]["average"], json!(15.0));
    assert_eq!(rows[0]["mention"], json!("tres_bien"));

    // Lowering the threshold brings Sow in at the top.
    let relaxed = s.ok(
        "reports.studentRanking",
        json!({ "classId": school.class_id, "minEvaluations": 1 }),
    );
    assert_eq!(names(&relaxed["rows"]), vec!["Sow", "Ba", "Diop"]);
    assert_eq!(relaxed["unrankedCount"], json!(0));
}

#[test]
fn evaluation_stats_normalize_to_twenty() {
    let mut s = Sidecar::start();
    let school = small_school(&mut s);
    let ev = create_evaluation(&mut s, &school.class_id, &school.subject_id, &school.period_id, "DS", 25.0);
    score(&mut s, &ev, &school.students[0], 20.0);
    score(&mut s, &ev, &school.students[1], 15.0);
    score(&mut s, &ev, &school.students[2], 10.0);

    let stats = s.ok("reports.evaluationStats", json!({ "evaluationId": ev }));
    assert_eq!(stats["raw"]["mean"], json!(15.0));
    let n = &stats["normalized"];
    assert_eq!(n["count"], json!(3));
    assert_eq!(n["mean"], json!(12.0));
    assert_eq!(n["min"], json!(8.0));
    assert_eq!(n["max"], json!(16.0));
    assert_eq!(n["median"], json!(12.0));
    assert_eq!(n["passCount"], json!(2));
    assert_eq!(n["passRate"], json!(66.67));

    let buckets: Vec<u64> = n["distribution"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["count"].as_u64().unwrap())
        .collect();
    // Excellent, Très bien, Bien, Assez bien, Passable, Insuffisant
    assert_eq!(buckets, vec![1, 0, 1, 0, 1, 0]);

    let strict = s.ok(
        "reports.evaluationStats",
        json!({ "evaluationId": ev, "passRatio": 0.7 }),
    );
    assert_eq!(strict["normalized"]["passCount"], json!(1));
}

#[test]
fn ranking_csv_lists_ranked_rows_in_order() {
    let mut s = Sidecar::start();
    let (school, _, _) = scored_school(&mut s);

    let out = s.ok("reports.studentRankingCsv", json!({ "classId": school.class_id }));
    assert_eq!(out["filename"], json!("ranking_6e_a_2025_2026.csv"));
    assert_eq!(out["rowCount"], json!(2));
    let csv = out["csv"].as_str().expect("csv text");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(
        lines,
        vec![
            "rank,matricule,name,class,level,count,mean,min,max,mention",
            "1,,BA Issa,6e A,6e,2,15.00,14.00,16.00,Très bien",
            "2,,DIOP Awa,6e A,6e,2,15.00,14.00,16.00,Très bien",
        ]
    );
}

#[test]
fn level_ranking_spans_classes() {
    let mut s = Sidecar::start();
    let (school, _, _) = scored_school(&mut s);
    let b = common::create_class(&mut s, "6e B", "6e", "2025-2026");
    let kane = common::admit(&mut s, &b, "Kane", "Moussa");
    let e1 = create_evaluation(&mut s, &b, &school.subject_id, &school.period_id, "DS1", 10.0);
    let e2 = create_evaluation(&mut s, &b, &school.subject_id, &school.period_id, "DS2", 10.0);
    score(&mut s, &e1, &kane, 9.0);
    score(&mut s, &e2, &kane, 8.0);

    let r = s.ok(
        "reports.studentRanking",
        json!({ "level": "6e", "academicYear": "2025-2026" }),
    );
    assert_eq!(names(&r["rows"]), vec!["Kane", "Ba", "Diop"]);
    assert_eq!(r["rows"][0]["className"], json!("6e B"));
    assert_eq!(r["rows"][0]["average"], json!(17.0));
}

#[test]
fn student_report_carries_rank_and_mention() {
    let mut s = Sidecar::start();
    let (school, _, _) = scored_school(&mut s);
    let sciences = common::create_subject(&mut s, "Sciences", 2.0);
    let ev = create_evaluation(&mut s, &school.class_id, &sciences, &school.period_id, "TP", 20.0);
    score(&mut s, &ev, &school.students[0], 9.0);

    // Diop: Maths 15 (coef 4), Sciences 9 (coef 2) -> 13.
    let r = s.ok("reports.studentReport", json!({ "studentId": school.students[0] }));
    assert_eq!(r["average"], json!(13.0));
    assert_eq!(r["mention"], json!("bien"));
    assert_eq!(r["evaluationCount"], json!(3));
    let subjects: Vec<&str> = r["subjects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["subject"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(subjects, vec!["Maths", "Sciences"]);
    assert_eq!(r["rank"], json!(2));
    assert_eq!(r["rankedCount"], json!(2));

    // Sow has one evaluation only: a bulletin, but no rank.
    let sow = s.ok("reports.studentReport", json!({ "studentId": school.students[2] }));
    assert_eq!(sow["average"], json!(18.0));
    assert!(sow["rank"].is_null());
}

#[test]
fn subject_and_period_reports_rank_classes() {
    let mut s = Sidecar::start();
    let (school, _, _) = scored_school(&mut s);
    let b = common::create_class(&mut s, "6e B", "6e", "2025-2026");
    let kane = common::admit(&mut s, &b, "Kane", "Moussa");
    let ev = create_evaluation(&mut s, &b, &school.subject_id, &school.period_id, "DS1", 20.0);
    score(&mut s, &ev, &kane, 10.0);

    let subject = s.ok("reports.subjectReport", json!({ "subjectId": school.subject_id }));
    assert_eq!(subject["overall"]["count"], json!(6));
    let ranked: Vec<&str> = subject["classRanking"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["className"].as_str().unwrap())
        .collect();
    assert_eq!(ranked, vec!["6e A", "6e B"]);

    let period = s.ok("reports.periodReport", json!({ "periodId": school.period_id }));
    assert_eq!(period["perClass"].as_array().unwrap().len(), 2);
    assert_eq!(period["perSubject"][0]["stats"]["count"], json!(6));
}

#[test]
fn withdrawn_students_leave_active_scope() {
    let mut s = Sidecar::start();
    let (school, _, _) = scored_school(&mut s);
    s.ok("students.withdraw", json!({ "studentId": school.students[1] }));

    let active = s.ok("reports.studentRanking", json!({ "classId": school.class_id }));
    assert_eq!(names(&active["rows"]), vec!["Diop"]);

    let all = s.ok(
        "reports.studentRanking",
        json!({ "classId": school.class_id, "studentScope": "all" }),
    );
    assert_eq!(names(&all["rows"]), vec!["Ba", "Diop"]);

    assert_eq!(
        s.error_code(
            "reports.studentRanking",
            json!({ "classId": school.class_id, "studentScope": "some" })
        ),
        "bad_params"
    );
}

#[test]
fn grouped_stats_drop_thin_groups() {
    let mut s = Sidecar::start();
    let (school, ds1, _) = scored_school(&mut s);

    let by_eval = s.ok(
        "reports.groupedStats",
        json!({ "groupBy": "evaluation", "classId": school.class_id }),
    );
    let groups = by_eval["groups"].as_array().expect("groups");
    assert_eq!(groups.len(), 2);
    let first = groups.iter().find(|g| g["key"] == json!(ds1)).expect("ds1 group");
    assert_eq!(first["count"], json!(3));
    assert_eq!(first["mean"], json!(16.0));

    let by_student = s.ok(
        "reports.groupedStats",
        json!({ "groupBy": "student", "classId": school.class_id, "minSample": 2 }),
    );
    let mut keys: Vec<String> = by_student["groups"]
        .as_array()
        .unwrap()
        .iter()
        .map(|g| g["key"].as_str().unwrap().to_string())
        .collect();
    keys.sort();
    let mut expected = vec![school.students[0].clone(), school.students[1].clone()];
    expected.sort();
    assert_eq!(keys, expected);
}

#[test]
fn exported_ranking_reads_back() {
    let mut s = Sidecar::start();
    let (school, _, _) = scored_school(&mut s);
    let out = s.ok("reports.studentRankingCsv", json!({ "classId": school.class_id }));

    let preview = s.ok("reports.rankingCsvPreview", json!({ "csv": out["csv"] }));
    assert_eq!(preview["rowCount"], json!(2));
    let rows = preview["rows"].as_array().unwrap();
    assert_eq!(rows[0]["name"], json!("BA Issa"));
    assert_eq!(rows[1]["rank"], json!(2));
    assert_eq!(rows[1]["mean"], json!(15.0));
    assert_eq!(rows[1]["mention"], json!("tres_bien"));
}
