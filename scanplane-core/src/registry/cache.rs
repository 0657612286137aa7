use std::collections::HashMap;

use chrono::{DateTime, Utc};
use scanplane_model::{
    IdName, ImageSummary, ScanReport, ScanStatus, SecretFinding, SetIdFinding, Severity,
};
use tokio_util::sync::CancellationToken;

use crate::profile::{VulTrait, VulnerabilityProfileFilter, extract_vul_traits};

use super::Registry;

/// Display data of a finished image, derived from its scan report and
/// recomputed whenever the vulnerability profile changes.
#[derive(Clone, Debug, Default)]
pub struct ImageInfoCache {
    pub high: usize,
    pub medium: usize,
    pub high_with_fix: usize,
    /// Highest score among vulnerabilities that survived filtering.
    pub vul_score: f32,
    pub vul_traits: Vec<VulTrait>,
    pub layers: Vec<String>,
    pub envs: Vec<String>,
    pub labels: HashMap<String, String>,
    pub secrets: Vec<SecretFinding>,
    pub set_id_perms: Vec<SetIdFinding>,
    pub filtered_time: Option<DateTime<Utc>>,
    scores: HashMap<String, f32>,
    idns: Vec<IdName>,
}

impl ImageInfoCache {
    pub fn build(sum: &ImageSummary, report: &ScanReport, filter: &VulnerabilityProfileFilter) -> Self {
        let result = &report.result;
        let mut cache = Self {
            vul_traits: extract_vul_traits(&result.vulnerabilities),
            scores: result
                .vulnerabilities
                .iter()
                .map(|v| (v.name.clone(), v.score))
                .collect(),
            layers: result.layers.iter().map(|l| l.digest.clone()).collect(),
            envs: result.envs.clone(),
            labels: result.labels.clone(),
            secrets: result.secrets.clone().unwrap_or_default(),
            set_id_perms: result.set_id_perms.clone(),
            idns: image_idns(sum),
            ..Self::default()
        };
        cache.refilter(filter);
        cache
    }

    fn refilter(&mut self, filter: &VulnerabilityProfileFilter) {
        filter.filter_vul_traits(&mut self.vul_traits, &self.idns);
        self.high = 0;
        self.medium = 0;
        self.high_with_fix = 0;
        self.vul_score = 0.0;
        for t in self.vul_traits.iter().filter(|t| !t.is_filtered()) {
            match t.severity {
                Severity::High | Severity::Critical => {
                    self.high += 1;
                    if !t.fixed_version.is_empty() {
                        self.high_with_fix += 1;
                    }
                }
                Severity::Medium => self.medium += 1,
                _ => {}
            }
            if let Some(score) = self.scores.get(&t.name) {
                self.vul_score = self.vul_score.max(*score);
            }
        }
        self.filtered_time = Some(Utc::now());
    }
}

/// Profile scope of an image: each reference's domain and display name.
fn image_idns(sum: &ImageSummary) -> Vec<IdName> {
    sum.images
        .iter()
        .map(|image| {
            let domains = if image.domain.is_empty() {
                Vec::new()
            } else {
                vec![image.domain.clone()]
            };
            IdName::new(domains, image.display_name())
        })
        .collect()
}

impl Registry {
    /// Mirror a persisted summary change into the local tables. A finished
    /// summary also rebuilds its cache from the stored report.
    pub(super) async fn apply_image_state(&self, id: &str, sum: Option<ImageSummary>) {
        let cache = match &sum {
            Some(sum) if sum.status == ScanStatus::Finished => {
                match self.deps().store.image_report(self.name(), id).await {
                    Ok(Some(report)) => {
                        let filter = self.deps().profiles.current().await;
                        Some(ImageInfoCache::build(sum, &report, &filter))
                    }
                    Ok(None) => {
                        tracing::debug!(target: "scan::registry", registry = self.name(), id, "finished image has no report");
                        None
                    }
                    Err(err) => {
                        tracing::error!(target: "scan::registry", registry = self.name(), id, error = %err, "failed to read image report");
                        None
                    }
                }
            }
            _ => None,
        };

        let mut content = self.lock().await;
        match sum {
            Some(sum) => {
                content.index_summary(id, sum);
                match cache {
                    Some(cache) => {
                        content.cache.insert(id.to_string(), cache);
                    }
                    None => {
                        content.cache.remove(id);
                    }
                }
            }
            None => content.unindex_summary(id),
        }
    }

    /// Re-filter finished images whose cache predates `filter`. Returns the
    /// number of caches refreshed.
    pub(super) async fn refresh_cache(
        &self,
        filter: &VulnerabilityProfileFilter,
        cancel: &CancellationToken,
    ) -> usize {
        let ids: Vec<String> = self.lock().await.cache.keys().cloned().collect();
        let mut refreshed = 0;
        for id in ids {
            if cancel.is_cancelled() {
                break;
            }
            let mut content = self.lock().await;
            let finished = content
                .summary
                .get(&id)
                .is_some_and(|sum| sum.status == ScanStatus::Finished);
            let Some(cache) = content.cache.get_mut(&id) else {
                continue;
            };
            let stale = cache
                .filtered_time
                .is_none_or(|filtered| filter.updated_at() > filtered);
            if finished && stale {
                cache.refilter(filter);
                refreshed += 1;
            }
        }
        refreshed
    }
}
