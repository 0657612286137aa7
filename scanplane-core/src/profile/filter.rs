use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use scanplane_model::{
    IdName, ProfileEntry, VULN_NAME_RECENT, VULN_NAME_RECENT_WITHOUT_FIX, Vulnerability,
    VulnerabilityProfile,
};

use crate::error::Result;

use super::traits::{VulTrait, parse_published};

const SECS_PER_DAY: i64 = 24 * 3600;

/// The facts a profile entry can look at.
trait VulnFacts {
    fn name(&self) -> &str;
    fn fixed_version(&self) -> &str;
    fn published_ts(&self) -> i64;
}

impl VulnFacts for VulTrait {
    fn name(&self) -> &str {
        &self.name
    }

    fn fixed_version(&self) -> &str {
        &self.fixed_version
    }

    fn published_ts(&self) -> i64 {
        self.published_ts
    }
}

struct ReportedVuln<'a> {
    vul: &'a Vulnerability,
    published_ts: i64,
}

impl VulnFacts for ReportedVuln<'_> {
    fn name(&self) -> &str {
        &self.vul.name
    }

    fn fixed_version(&self) -> &str {
        &self.vul.fixed_version
    }

    fn published_ts(&self) -> i64 {
        self.published_ts
    }
}

enum NameMatcher {
    Recent { days: i64 },
    RecentWithoutFix { days: i64 },
    Literal(String),
    Pattern(Regex),
}

impl NameMatcher {
    fn compile(entry: &ProfileEntry) -> Result<Self> {
        Ok(match entry.name.as_str() {
            VULN_NAME_RECENT => NameMatcher::Recent {
                days: i64::from(entry.days),
            },
            VULN_NAME_RECENT_WITHOUT_FIX => NameMatcher::RecentWithoutFix {
                days: i64::from(entry.days),
            },
            name if name.contains('*') => NameMatcher::Pattern(wildcard(name)?),
            name => NameMatcher::Literal(name.to_string()),
        })
    }

    fn matches(&self, vul: &dyn VulnFacts, now: i64) -> bool {
        match self {
            NameMatcher::Recent { days } => age_in_days(vul, now).is_some_and(|age| age < *days),
            NameMatcher::RecentWithoutFix { days } => {
                vul.fixed_version().is_empty()
                    && age_in_days(vul, now).is_some_and(|age| age < *days)
            }
            NameMatcher::Literal(name) => name.eq_ignore_ascii_case(vul.name()),
            NameMatcher::Pattern(re) => re.is_match(vul.name()),
        }
    }
}

/// Whole days since publication; `None` for a date a day or more ahead.
fn age_in_days(vul: &dyn VulnFacts, now: i64) -> Option<i64> {
    let age = (now - vul.published_ts()) / SECS_PER_DAY;
    (age >= 0).then_some(age)
}

enum ScopeMatcher {
    Literal(String),
    Pattern(Regex),
}

impl ScopeMatcher {
    fn compile(raw: &str) -> Result<Self> {
        if raw.contains('*') {
            Ok(ScopeMatcher::Pattern(wildcard(raw)?))
        } else {
            Ok(ScopeMatcher::Literal(raw.to_string()))
        }
    }

    fn matches(&self, subject: &str) -> bool {
        match self {
            ScopeMatcher::Literal(value) => value.eq_ignore_ascii_case(subject),
            ScopeMatcher::Pattern(re) => re.is_match(subject),
        }
    }
}

fn wildcard(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("(?i){}", pattern.replace('*', ".*")))?)
}

struct CompiledEntry {
    name: NameMatcher,
    domains: Vec<ScopeMatcher>,
    images: Vec<ScopeMatcher>,
}

impl CompiledEntry {
    fn matches(&self, vul: &dyn VulnFacts, domains: &[String], image: &str, now: i64) -> bool {
        if !self.name.matches(vul, now) {
            return false;
        }
        if !self.domains.is_empty()
            && !self
                .domains
                .iter()
                .any(|m| domains.iter().any(|d| m.matches(d)))
        {
            return false;
        }
        if !self.images.is_empty()
            && (image.is_empty() || !self.images.iter().any(|m| m.matches(image)))
        {
            return false;
        }
        true
    }
}

/// Compiled form of a [`VulnerabilityProfile`]. Entries are evaluated in
/// order and the first full match suppresses the vulnerability.
pub struct VulnerabilityProfileFilter {
    name: String,
    entries: Vec<CompiledEntry>,
    updated_at: DateTime<Utc>,
}

impl fmt::Debug for VulnerabilityProfileFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulnerabilityProfileFilter")
            .field("name", &self.name)
            .field("entry_count", &self.entries.len())
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl Default for VulnerabilityProfileFilter {
    fn default() -> Self {
        Self::empty()
    }
}

impl VulnerabilityProfileFilter {
    /// A filter that suppresses nothing.
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            entries: Vec::new(),
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn compile(profile: &VulnerabilityProfile) -> Result<Self> {
        let entries = profile
            .entries
            .iter()
            .map(|entry| {
                Ok(CompiledEntry {
                    name: NameMatcher::compile(entry)?,
                    domains: entry
                        .domains
                        .iter()
                        .map(|d| ScopeMatcher::compile(d))
                        .collect::<Result<_>>()?,
                    images: entry
                        .images
                        .iter()
                        .map(|i| ScopeMatcher::compile(i))
                        .collect::<Result<_>>()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: profile.name.clone(),
            entries,
            updated_at: Utc::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// When this filter was built; results filtered before it are stale.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn suppresses_in_scope(
        &self,
        vul: &dyn VulnFacts,
        domains: &[String],
        image: &str,
        now: i64,
    ) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.matches(vul, domains, image, now))
    }

    /// Suppressed when any consumer scope excuses it; no scopes means one
    /// unscoped evaluation.
    fn suppresses(&self, vul: &dyn VulnFacts, idns: &[IdName], now: i64) -> bool {
        if idns.is_empty() {
            return self.suppresses_in_scope(vul, &[], "", now);
        }
        idns.iter()
            .any(|idn| self.suppresses_in_scope(vul, &idn.domains, &idn.image, now))
    }

    /// Stamp every trait's `filtered` flag and return the surviving names.
    /// Safe to call repeatedly on the same traits.
    pub fn filter_vul_traits(&self, traits: &mut [VulTrait], idns: &[IdName]) -> HashSet<String> {
        let now = Utc::now().timestamp();
        let mut alive = HashSet::new();
        for t in traits.iter_mut() {
            let suppressed = !self.is_empty() && self.suppresses(&*t, idns, now);
            t.filtered = suppressed;
            if !suppressed {
                alive.insert(t.name.clone());
            }
        }
        alive
    }

    /// Drop suppressed vulnerabilities, or keep them tagged with `show_tag`.
    pub fn filter_vulnerabilities(
        &self,
        vuls: Vec<Vulnerability>,
        idns: &[IdName],
        show_tag: Option<&str>,
    ) -> Vec<Vulnerability> {
        if self.is_empty() {
            return vuls;
        }
        let now = Utc::now().timestamp();
        vuls.into_iter()
            .filter_map(|mut vul| {
                let facts = ReportedVuln {
                    published_ts: parse_published(&vul.published_date),
                    vul: &vul,
                };
                if !self.suppresses(&facts, idns, now) {
                    return Some(vul);
                }
                show_tag.map(|tag| {
                    vul.tags = vec![tag.to_string()];
                    vul
                })
            })
            .collect()
    }
}
