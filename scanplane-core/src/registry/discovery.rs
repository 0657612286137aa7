use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use regex::Regex;
use scanplane_model::{ImageRef, RegistryFilter, RegistryType};
use serde::Serialize;

use crate::error::{Result, ScanError};

use super::driver::RegistryDriver;
use super::{Registry, ScanContext};

/// Content ID to the references resolving to it, as found by one pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveredImages {
    pub images: BTreeMap<String, BTreeSet<ImageRef>>,
    /// Number of `(repo, tag)` pairs that resolved.
    pub total: usize,
}

/// Resolved metadata for one content ID.
#[derive(Clone, Debug, Default)]
pub(super) struct ImageMeta {
    pub id: String,
    pub digest: String,
    pub images: BTreeSet<ImageRef>,
}

/// A repository to expand, with the tag pattern from its filter in `tag`.
pub(super) type TagFilter = ImageRef;

/// Repositories matching `filter`. The repo pattern is anchored; the
/// organisation and creator domains compare literally against the part of
/// the repository before the first `/`. A `limit` of zero means unlimited.
pub fn filter_repos(
    repos: Vec<ImageRef>,
    filter: &RegistryFilter,
    domains: Option<&[String]>,
    limit: usize,
) -> Result<Vec<ImageRef>> {
    let match_all = filter.org.is_empty() && filter.repo == ".*" && domains.is_none();
    let pattern = if match_all {
        None
    } else {
        Some(Regex::new(&format!("^{}$", filter.repo))?)
    };

    let mut matches = Vec::new();
    for repo in repos {
        if let Some(pattern) = &pattern {
            let (org, name) = match repo.repo.find('/') {
                Some(i) if i > 0 && (!filter.org.is_empty() || domains.is_some()) => {
                    (&repo.repo[..i], &repo.repo[i + 1..])
                }
                _ => ("", repo.repo.as_str()),
            };
            if !filter.org.is_empty() && filter.org != org {
                continue;
            }
            if let Some(domains) = domains
                && !domains.iter().any(|d| d == org)
            {
                continue;
            }
            if !pattern.is_match(name) {
                continue;
            }
        }

        matches.push(repo);
        if limit != 0 && matches.len() >= limit {
            break;
        }
    }
    Ok(matches)
}

/// Tags matching the anchored `pattern`, up to `limit` (zero is unlimited).
pub fn filter_tags(tags: &[String], pattern: &str, limit: usize) -> Result<Vec<String>> {
    let regex = Regex::new(&format!("^{pattern}$"))?;
    let mut list = Vec::with_capacity(tags.len());
    for tag in tags {
        if pattern != ".*" && !regex.is_match(tag) {
            continue;
        }
        list.push(tag.clone());
        if limit != 0 && list.len() >= limit {
            break;
        }
    }
    Ok(list)
}

/// Resolve `tags` of one repository to content IDs.
pub(super) async fn get_image_meta(
    scan: &ScanContext,
    driver: &dyn RegistryDriver,
    itf: &TagFilter,
    tags: &[String],
) -> Result<HashMap<String, ImageMeta>> {
    let mut metas: HashMap<String, ImageMeta> = HashMap::new();
    for tag in tags {
        match driver.get_image_meta(&itf.domain, &itf.repo, tag).await {
            Ok(info) => {
                let image = ImageRef::new(itf.domain.clone(), itf.repo.clone(), tag.clone());
                metas
                    .entry(info.id.clone())
                    .or_insert_with(|| ImageMeta {
                        id: info.id.clone(),
                        digest: info.digest.clone(),
                        images: BTreeSet::new(),
                    })
                    .images
                    .insert(image);
            }
            Err(code) => {
                tracing::debug!(target: "scan::discovery", repo = %itf.repo, tag, error = %code, "failed to get image info");
            }
        }
        if scan.is_cancelled() {
            return Err(ScanError::Cancelled("image metadata lookup".into()));
        }
    }
    Ok(metas)
}

fn checkpoint(scan: &ScanContext, phase: &str) -> Result<()> {
    if scan.is_cancelled() {
        tracing::debug!(target: "scan::discovery", phase, "registry scan canceled");
        return Err(ScanError::Cancelled(phase.to_string()));
    }
    Ok(())
}

impl Registry {
    /// Enumerate, filter and resolve the registry's images. Unless
    /// `dry_run`, new or changed content is scheduled as it is found.
    pub(super) async fn get_scan_images(
        &self,
        scan: &ScanContext,
        driver: Arc<dyn RegistryDriver>,
        dry_run: bool,
    ) -> Result<DiscoveredImages> {
        scan.set_scheduling(true);
        let result = self.discover(scan, driver, dry_run).await;
        scan.set_scheduling(false);
        result
    }

    async fn discover(
        &self,
        scan: &ScanContext,
        driver: Arc<dyn RegistryDriver>,
        dry_run: bool,
    ) -> Result<DiscoveredImages> {
        let (config, public) = {
            let content = self.lock().await;
            (content.config.clone(), content.public)
        };
        let registry = self.name();

        let all_images = match driver.get_all_images().await {
            Ok(all) => all,
            Err(err) => {
                tracing::debug!(target: "scan::discovery", registry, error = %err, "bulk listing failed");
                None
            }
        };
        checkpoint(scan, "bulk listing")?;

        let repo_limit = if public { config.repo_limit } else { 0 };
        let tag_limit = if public { config.tag_limit } else { 0 };

        let mut last_err = None;
        let mut tag_filters: Vec<TagFilter> = Vec::new();
        for filter in &config.filters {
            tracing::debug!(target: "scan::discovery", registry, %filter, "expanding filter");
            let repos = match &all_images {
                Some(all) => {
                    let prefix = format!("{}/", filter.org);
                    let match_all = filter.org.is_empty() && filter.repo == ".*";
                    let mut repos: Vec<ImageRef> = all
                        .keys()
                        .filter(|r| {
                            match_all || (!filter.org.is_empty() && r.repo.starts_with(&prefix))
                        })
                        .map(|r| ImageRef::new(r.domain.clone(), r.repo.clone(), ""))
                        .collect();
                    repos.sort();
                    repos
                }
                None => match driver.get_repo_list(&filter.org, &filter.repo, repo_limit).await {
                    Ok(repos) => repos,
                    Err(err) => {
                        tracing::error!(target: "scan::discovery", registry, error = %err, "failed to get repository list");
                        last_err = Some(err);
                        continue;
                    }
                },
            };

            let mut filter = filter.clone();
            if config.registry_type == RegistryType::Docker
                && public
                && filter.org.is_empty()
                && !filter.repo.contains('*')
            {
                filter.org = "library".into();
            }

            match filter_repos(repos, &filter, config.scoped_domains(), repo_limit) {
                Ok(matched) => tag_filters.extend(matched.into_iter().map(|mut repo| {
                    repo.tag = filter.tag.clone();
                    repo
                })),
                Err(err) => {
                    tracing::error!(target: "scan::discovery", registry, error = %err, "failed to filter repository list");
                    last_err = Some(err);
                    continue;
                }
            }
            checkpoint(scan, "repository listing")?;
        }

        tracing::debug!(target: "scan::discovery", registry, count = tag_filters.len(), "repositories with tag filter");
        if tag_filters.is_empty()
            && let Some(err) = last_err
        {
            return Err(err);
        }

        let mut expanded: Vec<(TagFilter, Vec<String>)> = Vec::with_capacity(tag_filters.len());
        for itf in tag_filters {
            let tags = match &all_images {
                Some(all) => all
                    .get(&ImageRef::new(itf.domain.clone(), itf.repo.clone(), ""))
                    .cloned()
                    .ok_or_else(|| ScanError::NotFound(format!("repository {}", itf.repo))),
                None => driver.get_tag_list(&itf.domain, &itf.repo, &itf.tag).await,
            };
            let tags = match tags.and_then(|tags| filter_tags(&tags, &itf.tag, tag_limit)) {
                Ok(tags) => tags,
                Err(err) => {
                    tracing::error!(target: "scan::discovery", registry, repo = %itf.repo, error = %err, "failed to get repository tag list");
                    continue;
                }
            };
            tracing::debug!(target: "scan::discovery", registry, repo = %itf.repo, tags = tags.len(), "tags expanded");
            expanded.push((itf, tags));
            checkpoint(scan, "tag listing")?;
        }

        if dry_run {
            let mut found = DiscoveredImages::default();
            for (itf, tags) in &expanded {
                for tag in tags {
                    match driver.get_image_meta(&itf.domain, &itf.repo, tag).await {
                        Ok(info) => {
                            found
                                .images
                                .entry(info.id)
                                .or_default()
                                .insert(ImageRef::new(itf.domain.clone(), itf.repo.clone(), tag.clone()));
                            found.total += 1;
                        }
                        Err(code) => {
                            tracing::debug!(target: "scan::discovery", repo = %itf.repo, tag, error = %code, "failed to get image info");
                        }
                    }
                }
            }
            return Ok(found);
        }

        let found = self.schedule_scan_images(scan, driver.as_ref(), &expanded).await;
        tracing::debug!(target: "scan::discovery", registry, total = found.total, "total images");
        Ok(found)
    }
}
