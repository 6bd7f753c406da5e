use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Every score is compared on a common /20 basis.
pub const SCALE: f64 = 20.0;

/// Two-decimal rounding with halves going up: `floor(100*x + 0.5) / 100`.
pub fn round_half_up_2(x: f64) -> f64 {
    // 1e-9 absorbs representation error (2.675 is stored as 2.67499999...).
    ((100.0 * x) + 0.5 + 1e-9).floor() / 100.0
}

/// `raw * 20 / max_score`, rounded to two decimals.
/// `None` when the evaluation has no usable maximum.
pub fn normalize(raw: f64, max_score: f64) -> Option<f64> {
    if !(max_score > 0.0) || !raw.is_finite() {
        return None;
    }
    let scaled = (raw * SCALE / max_score).clamp(0.0, SCALE);
    Some(round_half_up_2(scaled))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mention {
    Excellent,
    TresBien,
    Bien,
    AssezBien,
    Passable,
    Insuffisant,
}

impl Mention {
    /// Highest band first.
    pub const ALL: [Mention; 6] = [
        Mention::Excellent,
        Mention::TresBien,
        Mention::Bien,
        Mention::AssezBien,
        Mention::Passable,
        Mention::Insuffisant,
    ];

    /// Band lookup on the /20 scale; lower bounds are inclusive.
    pub fn from_normalized(v: f64) -> Mention {
        Mention::ALL
            .into_iter()
            .find(|m| v >= m.lower_bound())
            .unwrap_or(Mention::Insuffisant)
    }

    pub fn label(self) -> &'static str {
        match self {
            Mention::Excellent => "Excellent",
            Mention::TresBien => "Très bien",
            Mention::Bien => "Bien",
            Mention::AssezBien => "Assez bien",
            Mention::Passable => "Passable",
            Mention::Insuffisant => "Insuffisant",
        }
    }

    pub fn lower_bound(self) -> f64 {
        match self {
            Mention::Excellent => 16.0,
            Mention::TresBien => 14.0,
            Mention::Bien => 12.0,
            Mention::AssezBien => 10.0,
            Mention::Passable => 8.0,
            Mention::Insuffisant => 0.0,
        }
    }

    /// Exclusive, except for the top band which closes at 20.
    pub fn upper_bound(self) -> f64 {
        match self {
            Mention::Excellent => SCALE,
            Mention::TresBien => 16.0,
            Mention::Bien => 14.0,
            Mention::AssezBien => 12.0,
            Mention::Passable => 10.0,
            Mention::Insuffisant => 8.0,
        }
    }

    fn index(self) -> usize {
        match self {
            Mention::Excellent => 0,
            Mention::TresBien => 1,
            Mention::Bien => 2,
            Mention::AssezBien => 3,
            Mention::Passable => 4,
            Mention::Insuffisant => 5,
        }
    }

    pub fn parse_label(label: &str) -> Option<Mention> {
        Mention::ALL
            .into_iter()
            .find(|m| m.label().eq_ignore_ascii_case(label.trim()))
    }
}

/// Counts per mention band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Distribution {
    counts: [usize; 6],
}

impl Distribution {
    pub fn add(&mut self, normalized: f64) {
        self.counts[Mention::from_normalized(normalized).index()] += 1;
    }

    pub fn count(&self, mention: Mention) -> usize {
        self.counts[mention.index()]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketOut {
    mention: Mention,
    label: &'static str,
    lower: f64,
    upper: f64,
    count: usize,
}

impl Serialize for Distribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(Mention::ALL.len()))?;
        for m in Mention::ALL {
            seq.serialize_element(&BucketOut {
                mention: m,
                label: m.label(),
                lower: m.lower_bound(),
                upper: m.upper_bound(),
                count: self.count(m),
            })?;
        }
        seq.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradingPolicy {
    /// Fraction of the maximum score needed to pass.
    pub pass_ratio: f64,
}

impl Default for GradingPolicy {
    fn default() -> Self {
        Self { pass_ratio: 0.5 }
    }
}

impl GradingPolicy {
    /// The pass mark on the /20 scale.
    pub fn pass_mark(&self) -> f64 {
        round_half_up_2(self.pass_ratio * SCALE)
    }

    pub fn passes(&self, normalized: f64) -> bool {
        normalized >= self.pass_mark()
    }
}

/// One score joined with the evaluation and subject it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreEntry {
    pub student_id: String,
    pub evaluation_id: String,
    pub class_id: String,
    pub subject_id: String,
    pub period_id: String,
    pub value: f64,
    pub max_score: f64,
    pub evaluation_coefficient: f64,
    pub subject_coefficient: f64,
}

impl ScoreEntry {
    pub fn normalized(&self) -> Option<f64> {
        normalize(self.value, self.max_score)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub count: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub median: Option<f64>,
    pub pass_count: usize,
    pub pass_rate: Option<f64>,
    pub distribution: Distribution,
}

impl AggregateResult {
    pub fn empty() -> Self {
        Self {
            count: 0,
            mean: None,
            min: None,
            max: None,
            median: None,
            pass_count: 0,
            pass_rate: None,
            distribution: Distribution::default(),
        }
    }
}

fn compute_median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0)
    }
}

/// Statistics over already-normalized values.
pub fn aggregate_values<I>(values: I, policy: &GradingPolicy) -> AggregateResult
where
    I: IntoIterator<Item = f64>,
{
    let values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return AggregateResult::empty();
    }

    let mut distribution = Distribution::default();
    let mut sum = 0.0_f64;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut pass_count = 0_usize;
    for &v in &values {
        sum += v;
        min = min.min(v);
        max = max.max(v);
        if policy.passes(v) {
            pass_count += 1;
        }
        distribution.add(v);
    }

    let count = values.len();
    debug_assert_eq!(distribution.total(), count);
    let mean = round_half_up_2(sum / count as f64).clamp(min, max);
    AggregateResult {
        count,
        mean: Some(mean),
        min: Some(min),
        max: Some(max),
        median: compute_median(&values).map(round_half_up_2),
        pass_count,
        pass_rate: Some(round_half_up_2(100.0 * pass_count as f64 / count as f64)),
        distribution,
    }
}

pub fn aggregate<'a, I>(entries: I, policy: &GradingPolicy) -> AggregateResult
where
    I: IntoIterator<Item = &'a ScoreEntry>,
{
    aggregate_values(entries.into_iter().filter_map(|e| e.normalized()), policy)
}

/// Raw statistics on an evaluation's own scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStats {
    pub count: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

pub fn raw_stats<I>(values: I) -> RawStats
where
    I: IntoIterator<Item = f64>,
{
    let mut count = 0_usize;
    let mut sum = 0.0_f64;
    let mut min: Option<f64> = None;
    let mut max: Option<f64> = None;
    for v in values {
        count += 1;
        sum += v;
        min = Some(min.map_or(v, |m| m.min(v)));
        max = Some(max.map_or(v, |m| m.max(v)));
    }
    RawStats {
        count,
        mean: (count > 0).then(|| round_half_up_2(sum / count as f64)),
        min,
        max,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKey {
    Evaluation,
    Class,
    Subject,
    Period,
    Student,
}

impl GroupKey {
    pub fn parse(raw: &str) -> Option<GroupKey> {
        match raw {
            "evaluation" => Some(GroupKey::Evaluation),
            "class" => Some(GroupKey::Class),
            "subject" => Some(GroupKey::Subject),
            "period" => Some(GroupKey::Period),
            "student" => Some(GroupKey::Student),
            _ => None,
        }
    }

    pub fn key_of(self, e: &ScoreEntry) -> &str {
        match self {
            GroupKey::Evaluation => &e.evaluation_id,
            GroupKey::Class => &e.class_id,
            GroupKey::Subject => &e.subject_id,
            GroupKey::Period => &e.period_id,
            GroupKey::Student => &e.student_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAggregate {
    pub key: String,
    #[serde(flatten)]
    pub stats: AggregateResult,
}

/// One aggregate per group, ordered by key. Groups with fewer than
/// `min_sample` scores are left out.
pub fn aggregate_by(
    entries: &[ScoreEntry],
    key: GroupKey,
    min_sample: Option<usize>,
    policy: &GradingPolicy,
) -> Vec<GroupAggregate> {
    let mut groups: BTreeMap<&str, Vec<&ScoreEntry>> = BTreeMap::new();
    for e in entries {
        groups.entry(key.key_of(e)).or_default().push(e);
    }

    groups
        .into_iter()
        .filter(|(_, members)| members.len() >= min_sample.unwrap_or(0))
        .map(|(k, members)| GroupAggregate {
            key: k.to_string(),
            stats: aggregate(members, policy),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject_id: String,
    pub coefficient: f64,
    pub evaluation_count: usize,
    pub average: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAverage {
    pub student_id: String,
    pub evaluation_count: usize,
    pub average: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub subjects: Vec<SubjectAverage>,
}

/// Overall average of one student.
///
/// Within a subject, scores are weighted by their evaluation coefficient;
/// subject averages are then weighted by the subject coefficient. When every
/// subject carries a zero coefficient the subjects count equally.
pub fn student_average<'a, I>(student_id: &str, entries: I) -> StudentAverage
where
    I: IntoIterator<Item = &'a ScoreEntry>,
{
    // subject -> (weighted sum, weight, subject coefficient, count)
    let mut per_subject: BTreeMap<&str, (f64, f64, f64, usize)> = BTreeMap::new();
    let mut evaluation_count = 0_usize;
    let mut min: Option<f64> = None;
    let mut max: Option<f64> = None;

    for e in entries {
        let Some(v) = e.normalized() else {
            continue;
        };
        evaluation_count += 1;
        min = Some(min.map_or(v, |m| m.min(v)));
        max = Some(max.map_or(v, |m| m.max(v)));
        let w = if e.evaluation_coefficient > 0.0 {
            e.evaluation_coefficient
        } else {
            1.0
        };
        let slot = per_subject
            .entry(e.subject_id.as_str())
            .or_insert((0.0, 0.0, e.subject_coefficient.max(0.0), 0));
        slot.0 += v * w;
        slot.1 += w;
        slot.3 += 1;
    }

    let mut weighted_sum = 0.0_f64;
    let mut weighted_denom = 0.0_f64;
    let mut equal_sum = 0.0_f64;
    let mut equal_denom = 0.0_f64;
    let mut subjects = Vec::with_capacity(per_subject.len());

    for (subject_id, (sum, denom, coefficient, count)) in per_subject {
        let avg = (denom > 0.0).then(|| sum / denom);
        if let Some(avg) = avg {
            if coefficient > 0.0 {
                weighted_sum += avg * coefficient;
                weighted_denom += coefficient;
            }
            equal_sum += avg;
            equal_denom += 1.0;
        }
        subjects.push(SubjectAverage {
            subject_id: subject_id.to_string(),
            coefficient,
            evaluation_count: count,
            average: avg.map(round_half_up_2),
        });
    }

    let average = if weighted_denom > 0.0 {
        Some(weighted_sum / weighted_denom)
    } else if equal_denom > 0.0 {
        Some(equal_sum / equal_denom)
    } else {
        None
    };

    StudentAverage {
        student_id: student_id.to_string(),
        evaluation_count,
        average: average.map(round_half_up_2),
        min,
        max,
        subjects,
    }
}

/// `student_average` for every student present, ordered by student id.
pub fn student_averages(entries: &[ScoreEntry]) -> Vec<StudentAverage> {
    let mut by_student: BTreeMap<&str, Vec<&ScoreEntry>> = BTreeMap::new();
    for e in entries {
        by_student.entry(e.student_id.as_str()).or_default().push(e);
    }
    by_student
        .into_iter()
        .map(|(id, rows)| student_average(id, rows))
        .collect()
}
