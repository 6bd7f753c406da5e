use crate::calc::Mention;
use crate::error::AppError;
use crate::ranking::{Ranked, StudentStanding};
use serde::Serialize;

pub const RANKING_CSV_HEADER: &str = "rank,matricule,name,class,level,count,mean,min,max,mention";

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '"' {
            if in_quotes && chars.peek() == Some(&'"') {
                buf.push('"');
                chars.next();
                continue;
            }
            in_quotes = !in_quotes;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(std::mem::take(&mut buf));
            continue;
        }
        buf.push(ch);
    }
    out.push(buf);
    out
}

/// Splits CSV text into records. Line breaks inside quoted fields stay in
/// the record. Each record keeps the line number it starts on.
pub fn csv_records(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut line_no = 1;
    let mut start = 1;
    for ch in text.chars() {
        if ch == '"' {
            in_quotes = !in_quotes;
        }
        if ch == '\n' {
            line_no += 1;
            if !in_quotes {
                if buf.ends_with('\r') {
                    buf.pop();
                }
                out.push((start, std::mem::take(&mut buf)));
                start = line_no;
                continue;
            }
        }
        buf.push(ch);
    }
    if !buf.is_empty() {
        out.push((start, buf));
    }
    out
}

fn fmt_score(v: Option<f64>) -> String {
    v.map(|v| format!("{:.2}", v)).unwrap_or_default()
}

/// Student ranking as CSV, one row per ranked student, header first.
pub fn ranking_csv(rows: &[Ranked<StudentStanding>]) -> String {
    let mut csv = String::from(RANKING_CSV_HEADER);
    csv.push('\n');
    for r in rows {
        let s = &r.item;
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            r.rank,
            csv_quote(s.matricule.as_deref().unwrap_or("")),
            csv_quote(&s.display_name()),
            csv_quote(s.class_name.as_deref().unwrap_or("")),
            csv_quote(s.level.as_deref().unwrap_or("")),
            s.evaluation_count,
            fmt_score(s.average),
            fmt_score(s.min),
            fmt_score(s.max),
            csv_quote(r.mention.label()),
        ));
    }
    csv
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingCsvRow {
    pub rank: usize,
    pub matricule: String,
    pub name: String,
    pub class: String,
    pub level: String,
    pub count: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mention: Option<Mention>,
}

fn parse_opt_score(s: &str, line_no: usize) -> Result<Option<f64>, AppError> {
    let t = s.trim();
    if t.is_empty() {
        return Ok(None);
    }
    t.parse::<f64>().map(Some).map_err(|_| {
        AppError::bad_params(format!("line {}: invalid score {:?}", line_no, t))
    })
}

/// Reads back a file produced by [`ranking_csv`]. Rows come back in file order.
pub fn parse_ranking_csv(text: &str) -> Result<Vec<RankingCsvRow>, AppError> {
    let mut records = csv_records(text)
        .into_iter()
        .filter(|(_, r)| !r.trim().is_empty());
    let Some((_, header)) = records.next() else {
        return Err(AppError::bad_params("empty ranking csv"));
    };
    if header.trim() != RANKING_CSV_HEADER {
        return Err(AppError::bad_params("unexpected ranking csv header")
            .with_details(serde_json::json!({ "header": header })));
    }

    let mut out = Vec::new();
    for (line_no, record) in records {
        let f = parse_csv_record(&record);
        if f.len() != 10 {
            return Err(AppError::bad_params(format!(
                "line {}: expected 10 fields, got {}",
                line_no,
                f.len()
            )));
        }
        let rank = f[0]
            .trim()
            .parse::<usize>()
            .map_err(|_| AppError::bad_params(format!("line {}: invalid rank", line_no)))?;
        let count = f[5]
            .trim()
            .parse::<usize>()
            .map_err(|_| AppError::bad_params(format!("line {}: invalid count", line_no)))?;
        out.push(RankingCsvRow {
            rank,
            matricule: f[1].clone(),
            name: f[2].clone(),
            class: f[3].clone(),
            level: f[4].clone(),
            count,
            mean: parse_opt_score(&f[6], line_no)?,
            min: parse_opt_score(&f[7], line_no)?,
            max: parse_opt_score(&f[8], line_no)?,
            mention: Mention::parse_label(&f[9]),
        });
    }
    Ok(out)
}
