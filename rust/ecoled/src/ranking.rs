use crate::calc::{AggregateResult, Mention};
use serde::Serialize;
use std::cmp::Ordering;

/// Something that can be placed in a ranking.
pub trait Rankable {
    /// Value ranked on, highest first. `None` never ranks.
    fn mean(&self) -> Option<f64>;
    /// Number of observations behind `mean`.
    fn sample_size(&self) -> usize;
    /// Order between two items carrying the same mean.
    fn tie_break(&self, other: &Self) -> Ordering;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ranked<T> {
    pub rank: usize,
    /// Same mean as the row above.
    pub ex_aequo: bool,
    pub mention: Mention,
    #[serde(flatten)]
    pub item: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingPolicy {
    pub min_evaluations: usize,
}

impl Default for RankingPolicy {
    fn default() -> Self {
        Self { min_evaluations: 2 }
    }
}

/// Ranks `items` by mean, descending.
///
/// Items without a mean or below `min_sample` are removed from the result
/// entirely; they are not appended at the bottom.
pub fn rank<T: Rankable>(items: Vec<T>, min_sample: usize) -> Vec<Ranked<T>> {
    let mut kept: Vec<(f64, T)> = items
        .into_iter()
        .filter(|item| item.sample_size() >= min_sample)
        .filter_map(|item| item.mean().map(|m| (m, item)))
        .collect();

    kept.sort_by(|(ma, a), (mb, b)| mb.total_cmp(ma).then_with(|| a.tie_break(b)));

    let mut out: Vec<Ranked<T>> = Vec::with_capacity(kept.len());
    let mut prev: Option<f64> = None;
    for (i, (mean, item)) in kept.into_iter().enumerate() {
        out.push(Ranked {
            rank: i + 1,
            ex_aequo: prev == Some(mean),
            mention: Mention::from_normalized(mean),
            item,
        });
        prev = Some(mean);
    }
    out
}

fn cmp_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

/// A student's standing inside a ranking scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStanding {
    pub student_id: String,
    pub matricule: Option<String>,
    pub last_name: String,
    pub first_name: String,
    pub class_id: Option<String>,
    pub class_name: Option<String>,
    pub level: Option<String>,
    pub evaluation_count: usize,
    pub average: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl StudentStanding {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.last_name.to_uppercase(), self.first_name)
    }
}

impl Rankable for StudentStanding {
    fn mean(&self) -> Option<f64> {
        self.average
    }

    fn sample_size(&self) -> usize {
        self.evaluation_count
    }

    fn tie_break(&self, other: &Self) -> Ordering {
        cmp_names(&self.last_name, &other.last_name)
            .then_with(|| cmp_names(&self.first_name, &other.first_name))
            .then_with(|| self.student_id.cmp(&other.student_id))
    }
}

pub fn rank_students(
    standings: Vec<StudentStanding>,
    policy: &RankingPolicy,
) -> Vec<Ranked<StudentStanding>> {
    rank(standings, policy.min_evaluations)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStanding {
    pub class_id: String,
    pub class_name: String,
    pub level: String,
    pub stats: AggregateResult,
}

impl Rankable for ClassStanding {
    fn mean(&self) -> Option<f64> {
        self.stats.mean
    }

    fn sample_size(&self) -> usize {
        self.stats.count
    }

    fn tie_break(&self, other: &Self) -> Ordering {
        cmp_names(&self.class_name, &other.class_name)
            .then_with(|| self.class_id.cmp(&other.class_id))
    }
}

pub fn rank_classes(classes: Vec<ClassStanding>, min_scores: usize) -> Vec<Ranked<ClassStanding>> {
    rank(classes, min_scores)
}
