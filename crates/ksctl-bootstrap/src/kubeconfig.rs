//! Admin kubeconfig rewriting
//!
//! The kubeconfig a control plane writes points at an address only reachable
//! inside the cluster network and uses the distribution's default context
//! name. Before it is stored both are replaced so the file works from the
//! operator's machine and cannot clash with other clusters' contexts.

/// Replacements applied to a fetched kubeconfig
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeconfigRewrite<'a> {
    /// Address the distribution wrote into `server:` (loopback or private LB)
    pub internal_address: &'a str,
    /// Load balancer address reachable from outside
    pub external_address: &'a str,
    /// Context name the distribution generated
    pub default_context: &'a str,
    /// `{cluster}-{region}-{clusterType}-{provider}-ksctl`
    pub context: &'a str,
}

impl KubeconfigRewrite<'_> {
    /// Apply every replacement to `raw`, leaving all other text untouched
    pub fn apply(&self, raw: &str) -> String {
        raw.replace(self.internal_address, self.external_address)
            .replace(self.default_context, self.context)
    }
}
