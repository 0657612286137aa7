use chrono::DateTime;
use scanplane_model::{Severity, Vulnerability};

/// Per-consumer attributes of a vulnerability, kept so counts can be
/// recomputed after re-filtering without touching the full report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VulTrait {
    pub name: String,
    pub package_name: String,
    pub package_version: String,
    pub fixed_version: String,
    /// Unix seconds; zero when the scanner gave no usable date.
    pub published_ts: i64,
    pub severity: Severity,
    pub(crate) filtered: bool,
}

impl VulTrait {
    pub fn is_filtered(&self) -> bool {
        self.filtered
    }
}

/// Accepts unix seconds or RFC 3339.
pub fn parse_published(raw: &str) -> i64 {
    if let Ok(ts) = raw.trim().parse::<i64>() {
        return ts;
    }
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(ts) => ts.timestamp(),
        Err(_) => {
            if !raw.is_empty() {
                tracing::warn!(target: "scan::profile", published = raw, "unparseable publish date");
            }
            0
        }
    }
}

pub fn extract_vul_traits(vuls: &[Vulnerability]) -> Vec<VulTrait> {
    vuls.iter()
        .map(|v| VulTrait {
            name: v.name.clone(),
            package_name: v.package_name.clone(),
            package_version: v.package_version.clone(),
            fixed_version: v.fixed_version.clone(),
            published_ts: parse_published(&v.published_date),
            severity: v.severity,
            filtered: false,
        })
        .collect()
}

fn is_high(severity: Severity) -> bool {
    matches!(severity, Severity::High | Severity::Critical)
}

/// High and medium counts among traits that survived filtering.
pub fn count_vul_traits(traits: &[VulTrait]) -> (usize, usize) {
    traits
        .iter()
        .filter(|t| !t.filtered)
        .fold((0, 0), |(high, medium), t| {
            if is_high(t.severity) {
                (high + 1, medium)
            } else if t.severity == Severity::Medium {
                (high, medium + 1)
            } else {
                (high, medium)
            }
        })
}

/// Names of high and medium traits that survived filtering.
pub fn gather_vul_traits(traits: &[VulTrait]) -> (Vec<String>, Vec<String>) {
    let mut highs = Vec::new();
    let mut mediums = Vec::new();
    for t in traits.iter().filter(|t| !t.filtered) {
        if is_high(t.severity) {
            highs.push(t.name.clone());
        } else if t.severity == Severity::Medium {
            mediums.push(t.name.clone());
        }
    }
    (highs, mediums)
}
