mod common;

use common::{admit, create_class, str_of, Sidecar};
use serde_json::json;

#[test]
fn admission_transfer_and_withdrawal() {
    let mut s = Sidecar::start();
    let a = create_class(&mut s, "6e A", "6e", "2025-2026");
    let b = create_class(&mut s, "6e B", "6e", "2025-2026");

    let created = s.ok(
        "students.create",
        json!({
            "classId": a,
            "lastName": "Diop",
            "firstName": "Awa",
            "matricule": "2025-001",
            "birthDate": "2013-04-02",
            "gender": "f"
        }),
    );
    let diop = str_of(&created, "studentId");
    let ba = admit(&mut s, &a, "Ba", "Issa");

    let classes = s.ok("classes.list", json!({}));
    let a_row = classes["classes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["id"] == json!(a))
        .cloned()
        .expect("class a");
    assert_eq!(a_row["studentCount"], json!(2));

    // Duplicate matricule.
    assert_eq!(
        s.error_code(
            "students.create",
            json!({ "classId": a, "lastName": "X", "firstName": "Y", "matricule": "2025-001" })
        ),
        "conflict"
    );

    let moved = s.ok("students.transfer", json!({ "studentId": diop, "classId": b }));
    assert_eq!(moved["status"], json!("active"));
    let in_b = s.ok("students.list", json!({ "classId": b }));
    assert_eq!(in_b["students"].as_array().unwrap().len(), 1);
    assert_eq!(in_b["students"][0]["gender"], json!("F"));
    let in_a = s.ok("students.list", json!({ "classId": a }));
    assert_eq!(in_a["students"].as_array().unwrap().len(), 1);

    let detail = s.ok("students.get", json!({ "studentId": diop }));
    let statuses: Vec<&str> = detail["enrollments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["transferred", "active"]);

    assert_eq!(
        s.error_code("students.transfer", json!({ "studentId": diop, "classId": b })),
        "bad_params"
    );

    let left = s.ok("students.transfer", json!({ "studentId": ba }));
    assert_eq!(left["status"], json!("transferred"));
    let transferred = s.ok("students.list", json!({ "status": "transferred" }));
    assert_eq!(transferred["students"][0]["lastName"], json!("Ba"));
    assert!(transferred["students"][0]["classId"].is_null());
    let former = s.ok("students.list", json!({ "classId": a, "status": "transferred" }));
    assert_eq!(former["students"].as_array().unwrap().len(), 1);

    s.ok("students.withdraw", json!({ "studentId": diop }));
    assert_eq!(
        s.error_code("students.withdraw", json!({ "studentId": diop })),
        "conflict"
    );
    let detail = s.ok("students.get", json!({ "studentId": diop }));
    assert_eq!(detail["student"]["status"], json!("withdrawn"));
    assert!(detail["enrollments"]
        .as_array()
        .unwrap()
        .iter()
        .all(|e| e["status"] != json!("active")));
}

#[test]
fn update_keeps_unspecified_fields() {
    let mut s = Sidecar::start();
    let a = create_class(&mut s, "6e A", "6e", "2025-2026");
    let id = admit(&mut s, &a, "Diop", "Awa");
    s.ok(
        "students.update",
        json!({ "studentId": id, "matricule": "M-7", "birthDate": "2013-01-01" }),
    );
    s.ok("students.update", json!({ "studentId": id, "firstName": "Aïssatou" }));

    let detail = s.ok("students.get", json!({ "studentId": id }));
    let st = &detail["student"];
    assert_eq!(st["lastName"], json!("Diop"));
    assert_eq!(st["firstName"], json!("Aïssatou"));
    assert_eq!(st["matricule"], json!("M-7"));
    assert_eq!(st["birthDate"], json!("2013-01-01"));

    assert_eq!(
        s.error_code("students.update", json!({ "studentId": "nobody" })),
        "not_found"
    );
    assert_eq!(
        s.error_code("students.update", json!({ "studentId": id, "gender": "x" })),
        "bad_params"
    );
}
