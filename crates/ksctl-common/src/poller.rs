//! Release version lookup
//!
//! Distributions ask a [`ReleasePoller`] for the published releases of an
//! upstream repository (newest first) and resolve the operator's requested
//! version against that list with [`resolve_version`].

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How long a fetched release list is served from cache
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

const GITHUB_API: &str = "https://api.github.com";

/// Source of published releases for `org/repo`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleasePoller: Send + Sync {
    /// Stable releases, newest first
    async fn releases(&self, org: &str, repo: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
}

struct CachedReleases {
    fetched_at: Instant,
    releases: Vec<String>,
}

/// Polls the GitHub releases API and caches the result per repository
pub struct GithubReleasePoller {
    client: reqwest::Client,
    base_url: String,
    ttl: Duration,
    cache: DashMap<String, CachedReleases>,
}

impl GithubReleasePoller {
    /// Create a poller against api.github.com
    pub fn new() -> Result<Self> {
        Self::with_base_url(GITHUB_API, DEFAULT_CACHE_TTL)
    }

    /// Create a poller against a GitHub compatible endpoint
    pub fn with_base_url(base_url: impl Into<String>, ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ksctl/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::internal_with_context("poller", e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ttl,
            cache: DashMap::new(),
        })
    }

    async fn fetch(&self, org: &str, repo: &str) -> Result<Vec<String>> {
        let repository = format!("{org}/{repo}");
        let url = format!("{}/repos/{}/releases?per_page=100", self.base_url, repository);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| Error::poller(&repository, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::poller(
                &repository,
                format!("GET {} returned {}", url, response.status()),
            ));
        }

        let releases: Vec<GithubRelease> = response
            .json()
            .await
            .map_err(|e| Error::poller(&repository, e.to_string()))?;

        Ok(stable_releases(releases))
    }
}

#[async_trait]
impl ReleasePoller for GithubReleasePoller {
    async fn releases(&self, org: &str, repo: &str) -> Result<Vec<String>> {
        let key = format!("{org}/{repo}");

        if let Some(hit) = self.cache.get(&key) {
            if hit.fetched_at.elapsed() < self.ttl {
                return Ok(hit.releases.clone());
            }
        }

        match self.fetch(org, repo).await {
            Ok(releases) => {
                debug!(repository = %key, count = releases.len(), "fetched releases");
                self.cache.insert(
                    key,
                    CachedReleases {
                        fetched_at: Instant::now(),
                        releases: releases.clone(),
                    },
                );
                Ok(releases)
            }
            Err(e) => {
                // Stale data beats no data when the API is rate limiting us
                if let Some(stale) = self.cache.get(&key) {
                    warn!(repository = %key, error = %e, "release refresh failed, serving stale list");
                    return Ok(stale.releases.clone());
                }
                Err(e)
            }
        }
    }
}

// =============================================================================
// Pure Functions (unit-testable)
// =============================================================================

fn stable_releases(releases: Vec<GithubRelease>) -> Vec<String> {
    let mut tags: Vec<String> = releases
        .into_iter()
        .filter(|r| !r.draft && !r.prerelease)
        .map(|r| r.tag_name)
        .collect();
    tags.sort_by(|a, b| compare_versions(b, a));
    tags
}

/// Numeric components of `v1.30.3+k3s1` → `[1, 30, 3]`; build metadata is
/// compared as a tie breaker.
fn version_key(v: &str) -> (Vec<u64>, &str) {
    let v = v.trim_start_matches('v');
    let (core, build) = v.split_once('+').unwrap_or((v, ""));
    let core = core.split_once('-').map(|(c, _)| c).unwrap_or(core);
    let nums = core
        .split('.')
        .map(|p| p.parse::<u64>().unwrap_or(0))
        .collect();
    (nums, build)
}

/// Semantic ordering of release tags
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (an, ab) = version_key(a);
    let (bn, bb) = version_key(b);
    an.cmp(&bn).then_with(|| ab.cmp(bb))
}

/// Resolve a requested version against a newest-first release list
///
/// `""` selects the newest release. Anything else must equal an entry of
/// the list after both sides have been passed through `normalize`.
pub fn resolve_version(
    component: &str,
    releases: &[String],
    requested: &str,
    normalize_release: impl Fn(&str) -> String,
    normalize_request: impl Fn(&str) -> String,
) -> Result<String> {
    let valid: Vec<String> = releases.iter().map(|r| normalize_release(r)).collect();

    if requested.is_empty() {
        return valid
            .first()
            .cloned()
            .ok_or_else(|| Error::invalid_version(component, requested, &valid));
    }

    let wanted = normalize_request(requested);
    valid
        .iter()
        .find(|v| **v == wanted)
        .cloned()
        .ok_or_else(|| Error::invalid_version(component, requested, &valid))
}

/// Identity normalization
pub fn exact(v: &str) -> String {
    v.to_string()
}

/// Truncate `vMAJOR.MINOR.PATCH` to `vMAJOR.MINOR`; other shapes pass through
pub fn truncate_to_minor(v: &str) -> String {
    let parts: Vec<&str> = v.split('.').collect();
    if parts.len() == 3 {
        format!("{}.{}", parts[0], parts[1])
    } else {
        v.to_string()
    }
}

/// Append the `+k3s1` build suffix when a request carries none
pub fn with_k3s_suffix(v: &str) -> String {
    if v.contains('+') {
        v.to_string()
    } else {
        format!("{v}+k3s1")
    }
}
