//! Report models: load score entries from the store, then hand them to the
//! pure aggregation and ranking code.

use crate::calc::{
    aggregate, aggregate_by, raw_stats, student_average, student_averages, AggregateResult,
    GradingPolicy, GroupAggregate, GroupKey, Mention, RawStats, ScoreEntry,
};
use crate::error::AppError;
use crate::ranking::{rank_classes, rank_students, ClassStanding, Ranked, RankingPolicy, StudentStanding};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudentScope {
    /// Students whose status is `active`.
    Active,
    All,
}

impl StudentScope {
    pub fn as_str(self) -> &'static str {
        match self {
            StudentScope::Active => "active",
            StudentScope::All => "all",
        }
    }

    pub fn parse(raw: Option<&str>) -> Result<Self, AppError> {
        match raw.map(|s| s.to_ascii_lowercase()).as_deref() {
            None | Some("active") => Ok(StudentScope::Active),
            Some("all") => Ok(StudentScope::All),
            Some(other) => Err(AppError::bad_params("studentScope must be one of: active, all")
                .with_details(serde_json::json!({ "studentScope": other }))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportContext<'a> {
    pub conn: &'a Connection,
    pub grading: GradingPolicy,
    pub ranking: RankingPolicy,
    pub scope: StudentScope,
}

/// Which scores (or evaluations) a report covers. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct ScoreFilter {
    pub evaluation_id: Option<String>,
    pub class_id: Option<String>,
    pub subject_id: Option<String>,
    pub period_id: Option<String>,
    pub academic_year: Option<String>,
    pub level: Option<String>,
    pub student_id: Option<String>,
}

impl ScoreFilter {
    fn push_evaluation_clauses(&self, sql: &mut String, values: &mut Vec<Value>) {
        let clauses = [
            ("ev.id", &self.evaluation_id),
            ("ev.class_id", &self.class_id),
            ("ev.subject_id", &self.subject_id),
            ("ev.period_id", &self.period_id),
            ("cl.academic_year", &self.academic_year),
            ("cl.level", &self.level),
        ];
        for (column, value) in clauses {
            if let Some(v) = value {
                sql.push_str(&format!(" AND {} = ?", column));
                values.push(Value::Text(v.clone()));
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassHeader {
    pub id: String,
    pub name: String,
    pub level: String,
    pub academic_year: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectHeader {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
    pub coefficient: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodHeader {
    pub id: String,
    pub name: String,
    pub academic_year: String,
    pub sort_order: i64,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationHeader {
    pub id: String,
    pub class_id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub period_id: String,
    pub title: String,
    pub date: Option<String>,
    pub max_score: f64,
    pub coefficient: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentHeader {
    pub id: String,
    pub matricule: Option<String>,
    pub last_name: String,
    pub first_name: String,
    pub status: String,
    /// Class of the open enrollment, if any.
    pub class_id: Option<String>,
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<ClassHeader, AppError> {
    conn.query_row(
        "SELECT id, name, level, academic_year FROM classes WHERE id = ?",
        [class_id],
        |r| {
            Ok(ClassHeader {
                id: r.get(0)?,
                name: r.get(1)?,
                level: r.get(2)?,
                academic_year: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("class"))
}

pub fn load_classes(conn: &Connection) -> Result<HashMap<String, ClassHeader>, AppError> {
    let mut stmt = conn.prepare("SELECT id, name, level, academic_year FROM classes")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(ClassHeader {
                id: r.get(0)?,
                name: r.get(1)?,
                level: r.get(2)?,
                academic_year: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows.into_iter().map(|c| (c.id.clone(), c)).collect())
}

fn subject_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SubjectHeader> {
    Ok(SubjectHeader {
        id: r.get(0)?,
        name: r.get(1)?,
        code: r.get(2)?,
        coefficient: r.get(3)?,
    })
}

pub fn load_subject(conn: &Connection, subject_id: &str) -> Result<SubjectHeader, AppError> {
    conn.query_row(
        "SELECT id, name, code, coefficient FROM subjects WHERE id = ?",
        [subject_id],
        subject_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("subject"))
}

pub fn load_subjects(conn: &Connection) -> Result<HashMap<String, SubjectHeader>, AppError> {
    let mut stmt = conn.prepare("SELECT id, name, code, coefficient FROM subjects")?;
    let rows = stmt
        .query_map([], subject_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows.into_iter().map(|s| (s.id.clone(), s)).collect())
}

pub fn load_period(conn: &Connection, period_id: &str) -> Result<PeriodHeader, AppError> {
    conn.query_row(
        "SELECT id, name, academic_year, sort_order, start_date, end_date
         FROM periods WHERE id = ?",
        [period_id],
        |r| {
            Ok(PeriodHeader {
                id: r.get(0)?,
                name: r.get(1)?,
                academic_year: r.get(2)?,
                sort_order: r.get(3)?,
                start_date: r.get(4)?,
                end_date: r.get(5)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("period"))
}

pub fn load_student(conn: &Connection, student_id: &str) -> Result<StudentHeader, AppError> {
    conn.query_row(
        "SELECT s.id, s.matricule, s.last_name, s.first_name, s.status, e.class_id
         FROM students s
         LEFT JOIN enrollments e ON e.student_id = s.id AND e.status = 'active'
         WHERE s.id = ?",
        [student_id],
        student_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("student"))
}

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentHeader> {
    Ok(StudentHeader {
        id: r.get(0)?,
        matricule: r.get(1)?,
        last_name: r.get(2)?,
        first_name: r.get(3)?,
        status: r.get(4)?,
        class_id: r.get(5)?,
    })
}

fn load_students(conn: &Connection) -> Result<HashMap<String, StudentHeader>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.matricule, s.last_name, s.first_name, s.status, e.class_id
         FROM students s
         LEFT JOIN enrollments e ON e.student_id = s.id AND e.status = 'active'",
    )?;
    let rows = stmt
        .query_map([], student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows.into_iter().map(|s| (s.id.clone(), s)).collect())
}

pub fn load_evaluation(conn: &Connection, evaluation_id: &str) -> Result<EvaluationHeader, AppError> {
    let filter = ScoreFilter {
        evaluation_id: Some(evaluation_id.to_string()),
        ..Default::default()
    };
    load_evaluations(conn, &filter)?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::not_found("evaluation"))
}

/// Evaluations in scope, oldest first.
pub fn load_evaluations(
    conn: &Connection,
    filter: &ScoreFilter,
) -> Result<Vec<EvaluationHeader>, AppError> {
    let mut sql = String::from(
        "SELECT ev.id, ev.class_id, ev.subject_id, su.name, ev.period_id, ev.title, ev.date,
                ev.max_score, ev.coefficient, ev.status
         FROM evaluations ev
         JOIN subjects su ON su.id = ev.subject_id
         JOIN classes cl ON cl.id = ev.class_id
         WHERE 1 = 1",
    );
    let mut values: Vec<Value> = Vec::new();
    filter.push_evaluation_clauses(&mut sql, &mut values);
    sql.push_str(" ORDER BY COALESCE(ev.date, ''), ev.created_at, ev.id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |r| {
            Ok(EvaluationHeader {
                id: r.get(0)?,
                class_id: r.get(1)?,
                subject_id: r.get(2)?,
                subject_name: r.get(3)?,
                period_id: r.get(4)?,
                title: r.get(5)?,
                date: r.get(6)?,
                max_score: r.get(7)?,
                coefficient: r.get(8)?,
                status: r.get(9)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

pub fn load_score_entries(
    conn: &Connection,
    filter: &ScoreFilter,
    scope: StudentScope,
) -> Result<Vec<ScoreEntry>, AppError> {
    let mut sql = String::from(
        "SELECT sc.student_id, sc.evaluation_id, ev.class_id, ev.subject_id, ev.period_id,
                sc.value, ev.max_score, ev.coefficient, su.coefficient
         FROM scores sc
         JOIN evaluations ev ON ev.id = sc.evaluation_id
         JOIN subjects su ON su.id = ev.subject_id
         JOIN classes cl ON cl.id = ev.class_id
         JOIN students st ON st.id = sc.student_id
         WHERE 1 = 1",
    );
    let mut values: Vec<Value> = Vec::new();
    filter.push_evaluation_clauses(&mut sql, &mut values);
    if let Some(student_id) = &filter.student_id {
        sql.push_str(" AND sc.student_id = ?");
        values.push(Value::Text(student_id.clone()));
    }
    if scope == StudentScope::Active {
        sql.push_str(" AND st.status = 'active'");
    }
    sql.push_str(" ORDER BY ev.class_id, ev.subject_id, ev.id, sc.student_id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |r| {
            Ok(ScoreEntry {
                student_id: r.get(0)?,
                evaluation_id: r.get(1)?,
                class_id: r.get(2)?,
                subject_id: r.get(3)?,
                period_id: r.get(4)?,
                value: r.get(5)?,
                max_score: r.get(6)?,
                evaluation_coefficient: r.get(7)?,
                subject_coefficient: r.get(8)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationStats {
    pub evaluation: EvaluationHeader,
    pub raw: RawStats,
    pub normalized: AggregateResult,
}

fn evaluation_stats_from(
    evaluation: EvaluationHeader,
    entries: &[&ScoreEntry],
    policy: &GradingPolicy,
) -> EvaluationStats {
    EvaluationStats {
        raw: raw_stats(entries.iter().map(|e| e.value)),
        normalized: aggregate(entries.iter().copied(), policy),
        evaluation,
    }
}

pub fn evaluation_stats(ctx: &ReportContext<'_>, evaluation_id: &str) -> Result<EvaluationStats, AppError> {
    let evaluation = load_evaluation(ctx.conn, evaluation_id)?;
    let filter = ScoreFilter {
        evaluation_id: Some(evaluation_id.to_string()),
        ..Default::default()
    };
    let entries = load_score_entries(ctx.conn, &filter, ctx.scope)?;
    let refs: Vec<&ScoreEntry> = entries.iter().collect();
    Ok(evaluation_stats_from(evaluation, &refs, &ctx.grading))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub subject: SubjectHeader,
    pub evaluation_count: usize,
    pub stats: AggregateResult,
}

/// One row per subject that has at least one evaluation in scope, even when
/// none of them has scores yet. Ordered by subject name.
fn subject_stats(
    evaluations: &[EvaluationHeader],
    entries: &[ScoreEntry],
    subjects: &HashMap<String, SubjectHeader>,
    policy: &GradingPolicy,
) -> Vec<SubjectStats> {
    let mut eval_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for ev in evaluations {
        *eval_counts.entry(ev.subject_id.as_str()).or_insert(0) += 1;
    }
    let mut out: Vec<SubjectStats> = eval_counts
        .into_iter()
        .filter_map(|(subject_id, evaluation_count)| {
            let subject = subjects.get(subject_id)?.clone();
            let stats = aggregate(entries.iter().filter(|e| e.subject_id == subject_id), policy);
            Some(SubjectStats {
                subject,
                evaluation_count,
                stats,
            })
        })
        .collect();
    out.sort_by(|a, b| {
        a.subject
            .name
            .to_lowercase()
            .cmp(&b.subject.name.to_lowercase())
            .then_with(|| a.subject.id.cmp(&b.subject.id))
    });
    out
}

/// Per-class aggregates for the given classes; classes without scores get an
/// empty aggregate.
fn class_standings<'c, I>(classes: I, entries: &[ScoreEntry], policy: &GradingPolicy) -> Vec<ClassStanding>
where
    I: IntoIterator<Item = &'c ClassHeader>,
{
    classes
        .into_iter()
        .map(|c| ClassStanding {
            class_id: c.id.clone(),
            class_name: c.name.clone(),
            level: c.level.clone(),
            stats: aggregate(entries.iter().filter(|e| e.class_id == c.id), policy),
        })
        .collect()
}

/// Turns per-student averages into rankable standings.
///
/// `fixed_class` pins every standing to the report's class; otherwise the
/// open enrollment wins, then the class the scores were earned in.
fn build_standings(
    entries: &[ScoreEntry],
    students: &HashMap<String, StudentHeader>,
    classes: &HashMap<String, ClassHeader>,
    fixed_class: Option<&ClassHeader>,
) -> Vec<StudentStanding> {
    let mut first_class: HashMap<&str, &str> = HashMap::new();
    for e in entries {
        first_class.entry(e.student_id.as_str()).or_insert(e.class_id.as_str());
    }

    student_averages(entries)
        .into_iter()
        .filter_map(|avg| {
            let student = students.get(&avg.student_id)?;
            let class = match fixed_class {
                Some(c) => Some(c),
                None => student
                    .class_id
                    .as_deref()
                    .and_then(|id| classes.get(id))
                    .or_else(|| {
                        first_class
                            .get(avg.student_id.as_str())
                            .and_then(|id| classes.get(*id))
                    }),
            };
            Some(StudentStanding {
                student_id: avg.student_id,
                matricule: student.matricule.clone(),
                last_name: student.last_name.clone(),
                first_name: student.first_name.clone(),
                class_id: class.map(|c| c.id.clone()),
                class_name: class.map(|c| c.name.clone()),
                level: class.map(|c| c.level.clone()),
                evaluation_count: avg.evaluation_count,
                average: avg.average,
                min: avg.min,
                max: avg.max,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRanking {
    pub rows: Vec<Ranked<StudentStanding>>,
    /// Students with scores who did not meet the minimum evaluation count.
    pub unranked_count: usize,
    pub min_evaluations: usize,
}

fn ranking_from(standings: Vec<StudentStanding>, policy: &RankingPolicy) -> StudentRanking {
    let total = standings.len();
    let rows = rank_students(standings, policy);
    StudentRanking {
        unranked_count: total - rows.len(),
        min_evaluations: policy.min_evaluations,
        rows,
    }
}

/// Ranking over `filter`; the filter must name a class or a level.
pub fn student_ranking(ctx: &ReportContext<'_>, filter: &ScoreFilter) -> Result<StudentRanking, AppError> {
    if filter.class_id.is_none() && filter.level.is_none() {
        return Err(AppError::bad_params("choose a class or a level to rank"));
    }
    let fixed = match &filter.class_id {
        Some(id) => Some(load_class(ctx.conn, id)?),
        None => None,
    };
    if let Some(period_id) = &filter.period_id {
        load_period(ctx.conn, period_id)?;
    }
    let entries = load_score_entries(ctx.conn, filter, ctx.scope)?;
    let students = load_students(ctx.conn)?;
    let classes = load_classes(ctx.conn)?;
    let standings = build_standings(&entries, &students, &classes, fixed.as_ref());
    Ok(ranking_from(standings, &ctx.ranking))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassReport {
    pub class: ClassHeader,
    pub period: Option<PeriodHeader>,
    pub student_scope: &'static str,
    pub overall: AggregateResult,
    pub per_subject: Vec<SubjectStats>,
    pub per_evaluation: Vec<EvaluationStats>,
    pub ranking: StudentRanking,
}

/// Every evaluation of the class (optionally within one period).
pub fn class_report(
    ctx: &ReportContext<'_>,
    class_id: &str,
    period_id: Option<&str>,
) -> Result<ClassReport, AppError> {
    let class = load_class(ctx.conn, class_id)?;
    let period = period_id.map(|id| load_period(ctx.conn, id)).transpose()?;
    let filter = ScoreFilter {
        class_id: Some(class.id.clone()),
        period_id: period.as_ref().map(|p| p.id.clone()),
        ..Default::default()
    };

    let evaluations = load_evaluations(ctx.conn, &filter)?;
    let entries = load_score_entries(ctx.conn, &filter, ctx.scope)?;
    let subjects = load_subjects(ctx.conn)?;
    let students = load_students(ctx.conn)?;
    let classes = load_classes(ctx.conn)?;

    let mut by_evaluation: HashMap<&str, Vec<&ScoreEntry>> = HashMap::new();
    for e in &entries {
        by_evaluation.entry(e.evaluation_id.as_str()).or_default().push(e);
    }
    let per_evaluation = evaluations
        .iter()
        .map(|ev| {
            let rows = by_evaluation.get(ev.id.as_str()).cloned().unwrap_or_default();
            evaluation_stats_from(ev.clone(), &rows, &ctx.grading)
        })
        .collect();

    let standings = build_standings(&entries, &students, &classes, Some(&class));
    Ok(ClassReport {
        overall: aggregate(&entries, &ctx.grading),
        per_subject: subject_stats(&evaluations, &entries, &subjects, &ctx.grading),
        per_evaluation,
        ranking: ranking_from(standings, &ctx.ranking),
        student_scope: ctx.scope.as_str(),
        class,
        period,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectReport {
    pub subject: SubjectHeader,
    pub academic_year: Option<String>,
    pub period: Option<PeriodHeader>,
    pub overall: AggregateResult,
    pub per_class: Vec<ClassStanding>,
    pub class_ranking: Vec<Ranked<ClassStanding>>,
}

/// The subject across every class that evaluated it.
pub fn subject_report(
    ctx: &ReportContext<'_>,
    subject_id: &str,
    academic_year: Option<&str>,
    period_id: Option<&str>,
) -> Result<SubjectReport, AppError> {
    let subject = load_subject(ctx.conn, subject_id)?;
    let period = period_id.map(|id| load_period(ctx.conn, id)).transpose()?;
    let filter = ScoreFilter {
        subject_id: Some(subject.id.clone()),
        period_id: period.as_ref().map(|p| p.id.clone()),
        academic_year: academic_year.map(str::to_string),
        ..Default::default()
    };

    let evaluations = load_evaluations(ctx.conn, &filter)?;
    let entries = load_score_entries(ctx.conn, &filter, ctx.scope)?;
    let classes = load_classes(ctx.conn)?;
    let in_scope = classes_of(&evaluations, &classes);

    let per_class = class_standings(in_scope, &entries, &ctx.grading);
    Ok(SubjectReport {
        overall: aggregate(&entries, &ctx.grading),
        class_ranking: rank_classes(per_class.clone(), 1),
        per_class,
        subject,
        academic_year: academic_year.map(str::to_string),
        period,
    })
}

/// Distinct classes of `evaluations`, sorted by name.
fn classes_of<'c>(
    evaluations: &[EvaluationHeader],
    classes: &'c HashMap<String, ClassHeader>,
) -> Vec<&'c ClassHeader> {
    let mut ids: Vec<&str> = evaluations.iter().map(|e| e.class_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    let mut out: Vec<&ClassHeader> = ids.into_iter().filter_map(|id| classes.get(id)).collect();
    out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    out
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodReport {
    pub period: PeriodHeader,
    pub overall: AggregateResult,
    pub per_class: Vec<ClassStanding>,
    pub per_subject: Vec<SubjectStats>,
    pub class_ranking: Vec<Ranked<ClassStanding>>,
}

/// Whole-school view of one period.
///
/// Only classes of the period's academic year are counted, which the class
/// report does not do when given the same period id.
pub fn period_report(ctx: &ReportContext<'_>, period_id: &str) -> Result<PeriodReport, AppError> {
    let period = load_period(ctx.conn, period_id)?;
    let filter = ScoreFilter {
        period_id: Some(period.id.clone()),
        academic_year: Some(period.academic_year.clone()),
        ..Default::default()
    };

    let evaluations = load_evaluations(ctx.conn, &filter)?;
    let entries = load_score_entries(ctx.conn, &filter, ctx.scope)?;
    let classes = load_classes(ctx.conn)?;
    let subjects = load_subjects(ctx.conn)?;

    let per_class = class_standings(classes_of(&evaluations, &classes), &entries, &ctx.grading);
    Ok(PeriodReport {
        overall: aggregate(&entries, &ctx.grading),
        per_subject: subject_stats(&evaluations, &entries, &subjects, &ctx.grading),
        class_ranking: rank_classes(per_class.clone(), 1),
        per_class,
        period,
    })
}

/// Aggregates over `filter`, one per group. Groups below `min_sample` scores
/// are dropped.
pub fn grouped_stats(
    ctx: &ReportContext<'_>,
    filter: &ScoreFilter,
    key: GroupKey,
    min_sample: Option<usize>,
) -> Result<Vec<GroupAggregate>, AppError> {
    let entries = load_score_entries(ctx.conn, filter, ctx.scope)?;
    Ok(aggregate_by(&entries, key, min_sample, &ctx.grading))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub subject: SubjectHeader,
    pub evaluation_count: usize,
    pub average: Option<f64>,
    pub mention: Option<Mention>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub student: StudentHeader,
    pub class: Option<ClassHeader>,
    pub period: Option<PeriodHeader>,
    pub subjects: Vec<SubjectLine>,
    pub evaluation_count: usize,
    pub average: Option<f64>,
    pub mention: Option<Mention>,
    /// Position in the class ranking; absent when not ranked.
    pub rank: Option<usize>,
    pub ranked_count: usize,
}

fn latest_class_id(conn: &Connection, student_id: &str) -> Result<Option<String>, AppError> {
    Ok(conn
        .query_row(
            "SELECT class_id FROM enrollments
             WHERE student_id = ?
             ORDER BY CASE status WHEN 'active' THEN 0 ELSE 1 END, enrolled_at DESC
             LIMIT 1",
            [student_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// Bulletin of one student in their current (or last) class.
pub fn student_report(
    ctx: &ReportContext<'_>,
    student_id: &str,
    period_id: Option<&str>,
) -> Result<StudentReport, AppError> {
    let student = load_student(ctx.conn, student_id)?;
    let period = period_id.map(|id| load_period(ctx.conn, id)).transpose()?;
    let class = match latest_class_id(ctx.conn, &student.id)? {
        Some(id) => Some(load_class(ctx.conn, &id)?),
        None => None,
    };

    let filter = ScoreFilter {
        class_id: class.as_ref().map(|c| c.id.clone()),
        period_id: period.as_ref().map(|p| p.id.clone()),
        student_id: Some(student.id.clone()),
        ..Default::default()
    };
    let entries = load_score_entries(ctx.conn, &filter, StudentScope::All)?;
    let subjects = load_subjects(ctx.conn)?;
    let avg = student_average(&student.id, &entries);

    let mut lines: Vec<SubjectLine> = avg
        .subjects
        .iter()
        .filter_map(|s| {
            Some(SubjectLine {
                subject: subjects.get(&s.subject_id)?.clone(),
                evaluation_count: s.evaluation_count,
                average: s.average,
                mention: s.average.map(Mention::from_normalized),
            })
        })
        .collect();
    lines.sort_by(|a, b| a.subject.name.to_lowercase().cmp(&b.subject.name.to_lowercase()));

    let (rank, ranked_count) = match &class {
        Some(c) => {
            let ranking = student_ranking(
                ctx,
                &ScoreFilter {
                    class_id: Some(c.id.clone()),
                    period_id: period.as_ref().map(|p| p.id.clone()),
                    ..Default::default()
                },
            )?;
            let rank = ranking
                .rows
                .iter()
                .find(|r| r.item.student_id == student.id)
                .map(|r| r.rank);
            (rank, ranking.rows.len())
        }
        None => (None, 0),
    };

    Ok(StudentReport {
        subjects: lines,
        evaluation_count: avg.evaluation_count,
        average: avg.average,
        mention: avg.average.map(Mention::from_normalized),
        rank,
        ranked_count,
        student,
        class,
        period,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredefinedKind {
    TopStudents,
    AtRisk,
    SubjectOverview,
}

impl PredefinedKind {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "topStudents" => Ok(PredefinedKind::TopStudents),
            "atRisk" => Ok(PredefinedKind::AtRisk),
            "subjectOverview" => Ok(PredefinedKind::SubjectOverview),
            other => Err(AppError::bad_params(
                "kind must be one of: topStudents, atRisk, subjectOverview",
            )
            .with_details(serde_json::json!({ "kind": other }))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PredefinedKind::TopStudents => "topStudents",
            PredefinedKind::AtRisk => "atRisk",
            PredefinedKind::SubjectOverview => "subjectOverview",
        }
    }
}

pub const DEFAULT_TOP_LIMIT: usize = 10;

/// Canned reports. `filter` narrows the population (class, level, academic
/// year, period).
pub fn predefined(
    ctx: &ReportContext<'_>,
    kind: PredefinedKind,
    filter: &ScoreFilter,
    limit: Option<usize>,
) -> Result<serde_json::Value, AppError> {
    let filter = &within_one_year(ctx.conn, filter)?;
    match kind {
        PredefinedKind::TopStudents => {
            let mut ranking = school_ranking(ctx, filter)?;
            ranking.rows.truncate(limit.unwrap_or(DEFAULT_TOP_LIMIT));
            Ok(serde_json::json!({
                "kind": kind.as_str(),
                "academicYear": filter.academic_year,
                "rows": ranking.rows,
                "minEvaluations": ranking.min_evaluations,
            }))
        }
        PredefinedKind::AtRisk => {
            let pass_mark = ctx.grading.pass_mark();
            let ranking = school_ranking(ctx, filter)?;
            let rows: Vec<&Ranked<StudentStanding>> = ranking
                .rows
                .iter()
                .filter(|r| r.item.average.map(|a| a < pass_mark).unwrap_or(false))
                .collect();
            Ok(serde_json::json!({
                "kind": kind.as_str(),
                "academicYear": filter.academic_year,
                "passMark": pass_mark,
                "rows": rows,
                "minEvaluations": ranking.min_evaluations,
            }))
        }
        PredefinedKind::SubjectOverview => {
            let evaluations = load_evaluations(ctx.conn, filter)?;
            let entries = load_score_entries(ctx.conn, filter, ctx.scope)?;
            let subjects = load_subjects(ctx.conn)?;
            Ok(serde_json::json!({
                "kind": kind.as_str(),
                "academicYear": filter.academic_year,
                "perSubject": subject_stats(&evaluations, &entries, &subjects, &ctx.grading),
            }))
        }
    }
}

/// Pins a filter to the latest academic year unless a year, class, period
/// or evaluation already narrows it to one.
fn within_one_year(conn: &Connection, filter: &ScoreFilter) -> Result<ScoreFilter, AppError> {
    let pinned = filter.academic_year.is_some()
        || filter.class_id.is_some()
        || filter.period_id.is_some()
        || filter.evaluation_id.is_some();
    let mut scoped = filter.clone();
    if !pinned {
        scoped.academic_year = conn.query_row(
            "SELECT MAX(academic_year) FROM classes",
            [],
            |r| r.get::<_, Option<String>>(0),
        )?;
    }
    Ok(scoped)
}

/// Like [`student_ranking`] but may span the whole school.
fn school_ranking(ctx: &ReportContext<'_>, filter: &ScoreFilter) -> Result<StudentRanking, AppError> {
    let fixed = match &filter.class_id {
        Some(id) => Some(load_class(ctx.conn, id)?),
        None => None,
    };
    let entries = load_score_entries(ctx.conn, filter, ctx.scope)?;
    let students = load_students(ctx.conn)?;
    let classes = load_classes(ctx.conn)?;
    let standings = build_standings(&entries, &students, &classes, fixed.as_ref());
    Ok(ranking_from(standings, &ctx.ranking))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_schema;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().expect("memory db");
        init_schema(&conn).expect("schema");
        conn.execute_batch(
            "INSERT INTO classes VALUES('c1','6e A','6e','2025-2026');
             INSERT INTO classes VALUES('c2','6e B','6e','2025-2026');
             INSERT INTO classes VALUES('old','6e A','6e','2024-2025');
             INSERT INTO subjects VALUES('math','Maths',NULL,4);
             INSERT INTO subjects VALUES('fr','Français',NULL,2);
             INSERT INTO periods VALUES('t1','T1','2025-2026',1,NULL,NULL);
             INSERT INTO periods VALUES('t2','T2','2025-2026',2,NULL,NULL);
             INSERT INTO students VALUES('s1','M1','Diop','Awa',NULL,NULL,'active','t','t');
             INSERT INTO students VALUES('s2','M2','Ba','Issa',NULL,NULL,'active','t','t');
             INSERT INTO students VALUES('s3','M3','Sy','Lala',NULL,NULL,'withdrawn','t','t');
             INSERT INTO students VALUES('s4','M4','Fall','Modou',NULL,NULL,'active','t','t');
             INSERT INTO enrollments VALUES('e1','s1','c1','2025-2026','active','2025-09-01',NULL);
             INSERT INTO enrollments VALUES('e2','s2','c1','2025-2026','active','2025-09-01',NULL);
             INSERT INTO enrollments VALUES('e3','s3','c1','2025-2026','withdrawn','2025-09-01','2025-11-01');
             INSERT INTO enrollments VALUES('e4','s4','c2','2025-2026','active','2025-09-01',NULL);
             INSERT INTO evaluations VALUES('ev1','c1','math','t1','DS1','2025-10-01',25,1,'completed','t');
             INSERT INTO evaluations VALUES('ev2','c1','fr','t1','Dictée','2025-10-02',20,1,'completed','t');
             INSERT INTO evaluations VALUES('ev3','c1','math','t2','DS2','2026-01-10',20,1,'scheduled','t');
             INSERT INTO evaluations VALUES('ev4','c2','math','t1','DS1','2025-10-01',20,1,'completed','t');
             INSERT INTO evaluations VALUES('ev5','old','math','t1','DS1','2024-10-01',20,1,'completed','t');
             INSERT INTO scores VALUES('x1','ev1','s1',20,NULL,'t');
             INSERT INTO scores VALUES('x2','ev1','s2',15,NULL,'t');
             INSERT INTO scores VALUES('x3','ev1','s3',10,NULL,'t');
             INSERT INTO scores VALUES('x4','ev2','s1',10,NULL,'t');
             INSERT INTO scores VALUES('x5','ev2','s2',14,NULL,'t');
             INSERT INTO scores VALUES('x6','ev4','s4',9,NULL,'t');
             INSERT INTO scores VALUES('x7','ev5','s4',19,NULL,'t');",
        )
        .expect("seed");
        conn
    }

    fn ctx(conn: &Connection, scope: StudentScope) -> ReportContext<'_> {
        ReportContext {
            conn,
            grading: GradingPolicy::default(),
            ranking: RankingPolicy::default(),
            scope,
        }
    }

    #[test]
    fn evaluation_stats_matches_out_of_25_example() {
        let conn = seeded();
        let stats = evaluation_stats(&ctx(&conn, StudentScope::All), "ev1").expect("stats");
        assert_eq!(stats.raw.mean, Some(15.0));
        assert_eq!(stats.normalized.mean, Some(12.0));
        assert_eq!(stats.normalized.count, 3);
        assert_eq!(stats.normalized.distribution.total(), 3);

        let active = evaluation_stats(&ctx(&conn, StudentScope::Active), "ev1").expect("stats");
        assert_eq!(active.normalized.count, 2);
    }

    #[test]
    fn class_report_keeps_empty_evaluations_with_no_mean() {
        let conn = seeded();
        let report = class_report(&ctx(&conn, StudentScope::Active), "c1", None).expect("report");
        assert_eq!(report.per_evaluation.len(), 3);
        let ds2 = report
            .per_evaluation
            .iter()
            .find(|e| e.evaluation.id == "ev3")
            .expect("ev3");
        assert_eq!(ds2.normalized.count, 0);
        assert_eq!(ds2.normalized.mean, None);
        assert_eq!(ds2.raw.mean, None);

        let names: Vec<&str> = report.per_subject.iter().map(|s| s.subject.name.as_str()).collect();
        assert_eq!(names, vec!["Français", "Maths"]);

        // s1: maths 16 (coef 4), français 10 (coef 2) -> 14.0
        // s2: maths 12, français 14 -> 12.67
        let ids: Vec<&str> = report
            .ranking
            .rows
            .iter()
            .map(|r| r.item.student_id.as_str())
            .collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(report.ranking.rows[0].item.average, Some(14.0));
        assert_eq!(report.ranking.rows[1].item.average, Some(12.67));
        assert_eq!(report.ranking.unranked_count, 0);
    }

    #[test]
    fn ranking_threshold_excludes_thin_records() {
        let conn = seeded();
        let mut c = ctx(&conn, StudentScope::All);
        c.ranking.min_evaluations = 2;
        let filter = ScoreFilter {
            level: Some("6e".to_string()),
            academic_year: Some("2025-2026".to_string()),
            ..Default::default()
        };
        let ranking = student_ranking(&c, &filter).expect("ranking");
        let ids: Vec<&str> = ranking.rows.iter().map(|r| r.item.student_id.as_str()).collect();
        // s3 and s4 only have one score this year.
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(ranking.unranked_count, 2);
    }

    #[test]
    fn ranking_needs_class_or_level() {
        let conn = seeded();
        let e = student_ranking(&ctx(&conn, StudentScope::Active), &ScoreFilter::default())
            .expect_err("scope required");
        assert_eq!(e.code, "bad_params");
    }

    #[test]
    fn period_report_only_counts_the_periods_year() {
        let conn = seeded();
        let report = period_report(&ctx(&conn, StudentScope::Active), "t1").expect("report");
        let classes: Vec<&str> = report.per_class.iter().map(|c| c.class_id.as_str()).collect();
        assert_eq!(classes, vec!["c1", "c2"]);
        assert_eq!(report.class_ranking[0].item.class_id, "c1");
        assert_eq!(report.overall.count, 5);
    }

    #[test]
    fn subject_report_ranks_classes() {
        let conn = seeded();
        let report = subject_report(&ctx(&conn, StudentScope::Active), "math", Some("2025-2026"), None)
            .expect("report");
        assert_eq!(report.per_class.len(), 2);
        assert_eq!(report.class_ranking[0].item.class_id, "c1");
        assert_eq!(report.class_ranking[1].item.stats.mean, Some(9.0));
    }

    #[test]
    fn student_report_gives_rank_and_mentions() {
        let conn = seeded();
        let report = student_report(&ctx(&conn, StudentScope::Active), "s2", Some("t1")).expect("report");
        assert_eq!(report.average, Some(12.67));
        assert_eq!(report.mention, Some(Mention::Bien));
        assert_eq!(report.rank, Some(2));
        assert_eq!(report.ranked_count, 2);
        assert_eq!(report.subjects.len(), 2);
    }

    #[test]
    fn at_risk_lists_students_below_pass_mark() {
        let conn = seeded();
        let mut c = ctx(&conn, StudentScope::Active);
        c.ranking.min_evaluations = 1;
        let filter = ScoreFilter {
            academic_year: Some("2025-2026".to_string()),
            ..Default::default()
        };
        let v = predefined(&c, PredefinedKind::AtRisk, &filter, None).expect("report");
        let rows = v["rows"].as_array().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["studentId"], "s4");
        assert_eq!(v["passMark"], 10.0);
    }

    #[test]
    fn unscoped_predefined_reports_stay_in_the_latest_year() {
        let conn = seeded();
        let mut c = ctx(&conn, StudentScope::Active);
        c.ranking.min_evaluations = 1;

        let v = predefined(&c, PredefinedKind::TopStudents, &ScoreFilter::default(), None)
            .expect("report");
        assert_eq!(v["academicYear"], "2025-2026");
        let s4 = v["rows"]
            .as_array()
            .expect("rows")
            .iter()
            .find(|r| r["studentId"] == "s4")
            .expect("s4");
        assert_eq!(s4["average"], 9.0);
        assert_eq!(s4["evaluationCount"], 1);

        let level_only = ScoreFilter {
            level: Some("6e".to_string()),
            ..Default::default()
        };
        let v = predefined(&c, PredefinedKind::AtRisk, &level_only, None).expect("report");
        assert_eq!(v["academicYear"], "2025-2026");
        assert_eq!(v["rows"][0]["average"], 9.0);

        let last_year = ScoreFilter {
            academic_year: Some("2024-2025".to_string()),
            ..Default::default()
        };
        let v = predefined(&c, PredefinedKind::TopStudents, &last_year, None).expect("report");
        let rows = v["rows"].as_array().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["average"], 19.0);
    }

    #[test]
    fn grouped_stats_by_student_with_min_sample() {
        let conn = seeded();
        let filter = ScoreFilter {
            class_id: Some("c1".to_string()),
            ..Default::default()
        };
        let c = ctx(&conn, StudentScope::All);
        let by_student = grouped_stats(&c, &filter, GroupKey::Student, None).expect("groups");
        let keys: Vec<&str> = by_student.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["s1", "s2", "s3"]);

        let thick = grouped_stats(&c, &filter, GroupKey::Student, Some(2)).expect("groups");
        assert_eq!(thick.len(), 2);
        assert_eq!(thick[0].stats.count, 2);
    }
}
