//! In-memory fakes for tests in this and dependent crates

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::poller::{compare_versions, ReleasePoller};

/// Release that every [`StaticPoller`] list carries, like the upstream fixtures
pub const PLACEHOLDER_RELEASE: &str = "v0.0.1";

/// Fixed release lists instead of the GitHub API
#[derive(Clone, Default)]
pub struct StaticPoller {
    releases: Arc<DashMap<String, Vec<String>>>,
}

impl StaticPoller {
    /// Poller knowing no repository; every lookup answers [`PLACEHOLDER_RELEASE`]
    pub fn new() -> Self {
        Self::default()
    }

    /// One known release per bootstrap component
    pub fn with_defaults() -> Self {
        Self::new()
            .with_releases("etcd-io", "etcd", ["v3.5.15"])
            .with_releases("k3s-io", "k3s", ["v1.30.3+k3s1"])
            .with_releases("kubernetes", "kubernetes", ["v1.31.0"])
    }

    /// Register releases for `org/repo`, newest first after sorting
    pub fn with_releases<I, S>(self, org: &str, repo: &str, releases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = releases.into_iter().map(Into::into).collect();
        list.push(PLACEHOLDER_RELEASE.to_string());
        list.sort_by(|a, b| compare_versions(b, a));
        list.dedup();
        self.releases.insert(format!("{org}/{repo}"), list);
        self
    }
}

#[async_trait]
impl ReleasePoller for StaticPoller {
    async fn releases(&self, org: &str, repo: &str) -> Result<Vec<String>> {
        Ok(self
            .releases
            .get(&format!("{org}/{repo}"))
            .map(|r| r.clone())
            .unwrap_or_else(|| vec![PLACEHOLDER_RELEASE.to_string()]))
    }
}
