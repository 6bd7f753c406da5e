#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tempfile::TempDir;

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    pub workspace: TempDir,
}

impl Sidecar {
    /// Spawns the binary with `args` and no workspace selected.
    pub fn spawn(args: &[&str]) -> Self {
        let exe = env!("CARGO_BIN_EXE_ecoled");
        let mut child = Command::new(exe)
            .args(args)
            .env_remove("ECOLED_WORKSPACE")
            .env_remove("ECOLED_CONFIG")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn ecoled");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Sidecar {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
            workspace: tempfile::tempdir().expect("temp workspace"),
        }
    }

    /// Spawns and selects a fresh workspace.
    pub fn start() -> Self {
        let mut s = Self::spawn(&[]);
        let path = s.workspace.path().to_string_lossy().to_string();
        s.ok("workspace.select", json!({ "path": path }));
        s
    }

    pub fn workspace_path(&self) -> &Path {
        self.workspace.path()
    }

    pub fn send_raw(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request_as(&mut self, user: Option<&str>, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let mut payload = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(u) = user {
            payload["user"] = json!(u);
        }
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn request(&mut self, method: &str, params: Value) -> Value {
        self.request_as(None, method, params)
    }

    /// Asserts success and returns `result`.
    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let resp = self.request(method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            resp
        );
        resp["result"].clone()
    }

    /// Asserts failure and returns the error code.
    pub fn error_code(&mut self, method: &str, params: Value) -> String {
        let resp = self.request(method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            resp
        );
        resp["error"]["code"].as_str().unwrap_or("").to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn str_of(v: &Value, key: &str) -> String {
    v[key]
        .as_str()
        .unwrap_or_else(|| panic!("{} missing in {}", key, v))
        .to_string()
}

pub fn create_class(s: &mut Sidecar, name: &str, level: &str, year: &str) -> String {
    let r = s.ok(
        "classes.create",
        json!({ "name": name, "level": level, "academicYear": year }),
    );
    str_of(&r, "classId")
}

pub fn create_subject(s: &mut Sidecar, name: &str, coefficient: f64) -> String {
    let r = s.ok("subjects.create", json!({ "name": name, "coefficient": coefficient }));
    str_of(&r, "subjectId")
}

pub fn create_period(s: &mut Sidecar, name: &str, year: &str) -> String {
    let r = s.ok("periods.create", json!({ "name": name, "academicYear": year }));
    str_of(&r, "periodId")
}

pub fn admit(s: &mut Sidecar, class_id: &str, last: &str, first: &str) -> String {
    let r = s.ok(
        "students.create",
        json!({ "classId": class_id, "lastName": last, "firstName": first }),
    );
    str_of(&r, "studentId")
}

pub fn create_evaluation(
    s: &mut Sidecar,
    class_id: &str,
    subject_id: &str,
    period_id: &str,
    title: &str,
    max_score: f64,
) -> String {
    let r = s.ok(
        "evaluations.create",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "periodId": period_id,
            "title": title,
            "maxScore": max_score,
        }),
    );
    str_of(&r, "evaluationId")
}

pub fn score(s: &mut Sidecar, evaluation_id: &str, student_id: &str, value: f64) {
    s.ok(
        "scores.upsert",
        json!({ "evaluationId": evaluation_id, "studentId": student_id, "value": value }),
    );
}

/// One class, one subject, one period and three students.
pub struct School {
    pub class_id: String,
    pub subject_id: String,
    pub period_id: String,
    pub students: Vec<String>,
}

pub fn small_school(s: &mut Sidecar) -> School {
    let class_id = create_class(s, "6e A", "6e", "2025-2026");
    let subject_id = create_subject(s, "Maths", 4.0);
    let period_id = create_period(s, "Trimestre 1", "2025-2026");
    let students = vec![
        admit(s, &class_id, "Diop", "Awa"),
        admit(s, &class_id, "Ba", "Issa"),
        admit(s, &class_id, "Sow", "Fatou"),
    ];
    School {
        class_id,
        subject_id,
        period_id,
        students,
    }
}
