//! Keyword and context based sensitivity scoring.
//!
//! Scores free text for risk before a task is routed:
//! - weighted keywords are matched as substrings of the lower-cased text
//! - context pairs (both words present as tokens) boost or reduce the total
//! - the total is clamped to [0, 1] and rounded to two decimals
//!
//! Pure and deterministic. No I/O.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default score at or above which a task needs human approval.
pub const DEFAULT_THRESHOLD: f64 = 0.6;

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+").expect("word pattern is a valid regex"));

/// Weighted keywords, in evaluation order.
const KEYWORDS_WEIGHTED: &[(&str, f64, SensitivityCategory)] = &[
    ("invoice", 0.8, SensitivityCategory::Financial),
    ("payment", 0.9, SensitivityCategory::Financial),
    ("email", 0.6, SensitivityCategory::ExternalCommunication),
    ("client", 0.5, SensitivityCategory::ExternalCommunication),
    ("delete", 0.9, SensitivityCategory::DataDeletion),
    ("password", 1.0, SensitivityCategory::AccessChange),
    ("refund", 0.8, SensitivityCategory::Financial),
    ("credential", 0.9, SensitivityCategory::AccessChange),
    ("permission", 0.7, SensitivityCategory::AccessChange),
    ("access", 0.6, SensitivityCategory::AccessChange),
];

const CONTEXT_BOOST: &[(&str, &str, f64)] = &[
    ("email", "client", 0.3),
    ("email", "external", 0.2),
    ("payment", "invoice", 0.2),
    ("delete", "database", 0.3),
    ("delete", "production", 0.3),
    ("access", "admin", 0.3),
    ("password", "reset", 0.2),
    ("credential", "share", 0.3),
];

const CONTEXT_REDUCE: &[(&str, &str, f64)] = &[
    ("email", "internal", -0.2),
    ("email", "notification", -0.15),
    ("delete", "draft", -0.2),
    ("delete", "temp", -0.2),
    ("access", "read", -0.1),
];

/// Risk category of the strongest keyword group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityCategory {
    Financial,
    ExternalCommunication,
    DataDeletion,
    AccessChange,
    /// Nothing matched.
    #[serde(rename = "none")]
    Unflagged,
}

impl fmt::Display for SensitivityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Financial => "financial",
            Self::ExternalCommunication => "external_communication",
            Self::DataDeletion => "data_deletion",
            Self::AccessChange => "access_change",
            Self::Unflagged => "none",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SensitivityCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "financial" => Ok(Self::Financial),
            "external_communication" => Ok(Self::ExternalCommunication),
            "data_deletion" => Ok(Self::DataDeletion),
            "access_change" => Ok(Self::AccessChange),
            "none" => Ok(Self::Unflagged),
            other => Err(format!("unknown sensitivity category: {other}")),
        }
    }
}

/// Outcome of scoring a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityReport {
    /// Clamped, rounded score in [0, 1].
    pub score: f64,
    pub category: SensitivityCategory,
    /// Each contribution, in table order.
    pub signals: Vec<String>,
    pub requires_approval: bool,
}

/// Score `text` against the keyword and context tables.
pub fn score(text: &str, threshold: f64) -> SensitivityReport {
    let lower = text.to_lowercase();
    let words: std::collections::HashSet<&str> =
        WORD.find_iter(&lower).map(|m| m.as_str()).collect();

    let mut signals = Vec::new();
    // Insertion order decides ties between categories.
    let mut by_category: Vec<(SensitivityCategory, f64)> = Vec::new();
    let mut total = 0.0;

    for &(keyword, weight, category) in KEYWORDS_WEIGHTED {
        if lower.contains(keyword) {
            signals.push(format!("{keyword} (+{weight:?})"));
            total += weight;
            match by_category.iter_mut().find(|(c, _)| *c == category) {
                Some((_, acc)) => *acc += weight,
                None => by_category.push((category, weight)),
            }
        }
    }

    for &(a, b, modifier) in CONTEXT_BOOST {
        if words.contains(a) && words.contains(b) {
            total += modifier;
            signals.push(format!("context({a}+{b}) (+{modifier:?})"));
        }
    }

    for &(a, b, modifier) in CONTEXT_REDUCE {
        if words.contains(a) && words.contains(b) {
            total += modifier;
            signals.push(format!("context({a}+{b}) ({modifier:?})"));
        }
    }

    let score = round2(total.clamp(0.0, 1.0));

    let mut category = SensitivityCategory::Unflagged;
    let mut best = f64::NEG_INFINITY;
    for (c, acc) in by_category {
        if acc > best {
            best = acc;
            category = c;
        }
    }

    SensitivityReport {
        score,
        category,
        signals,
        requires_approval: score >= threshold,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
