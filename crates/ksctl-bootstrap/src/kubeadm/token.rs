//! Bootstrap token freshness
//!
//! kubeadm bootstrap tokens expire 20 minutes after creation. A slow cluster
//! can outlive the token created during init, so every join first checks
//! the recorded expiry and regenerates the token on control plane 0 when it
//! is close to running out. The check and the regeneration happen under one
//! lock so concurrent joiners regenerate at most once.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use ksctl_common::state::KubeadmBootstrapState;
use ksctl_common::{StorageDocument, BOOTSTRAP_TOKEN_REFRESH_MARGIN, BOOTSTRAP_TOKEN_TTL};
use ksctl_ssh::OutputMode;

use crate::distribution::{node_target, BootstrapContext, NodeRole};
use crate::error::{Error, Result, StepContext};

use super::scripts;

pub(crate) fn chrono_duration(d: std::time::Duration) -> Duration {
    Duration::seconds(d.as_secs() as i64)
}

/// Expiry of a token created at `created_at`
pub(crate) fn expiry_from(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + chrono_duration(BOOTSTRAP_TOKEN_TTL)
}

/// True unless the token stays valid for strictly more than `margin`
pub fn needs_refresh(now: DateTime<Utc>, expires_at: Option<DateTime<Utc>>, margin: Duration) -> bool {
    match expires_at {
        Some(expiry) => expiry - now <= margin,
        None => true,
    }
}

fn recorded(doc: &StorageDocument) -> (Option<String>, Option<DateTime<Utc>>) {
    doc.k8s_bootstrap
        .as_ref()
        .and_then(|b| b.kubeadm.as_ref())
        .map(|k| (k.bootstrap_token.clone(), k.bootstrap_token_expire_time_utc))
        .unwrap_or_default()
}

/// Serializes token checks for one cluster operation
#[derive(Default)]
pub(crate) struct TokenRefresher {
    lock: Mutex<()>,
}

impl TokenRefresher {
    /// Token that is valid for longer than the refresh margin
    pub(crate) async fn fresh_token(&self, ctx: &BootstrapContext) -> Result<String> {
        let _guard = self.lock.lock().await;

        let (token, expiry) = ctx.state.read(recorded).await;
        let margin = chrono_duration(BOOTSTRAP_TOKEN_REFRESH_MARGIN);
        if let Some(token) = token {
            if !needs_refresh(Utc::now(), expiry, margin) {
                debug!(expires_at = ?expiry, "bootstrap token still valid");
                return Ok(token);
            }
        }

        info!(expires_at = ?expiry, "bootstrap token expired or close to expiry, renewing");
        let target = ctx
            .state
            .read(|doc| node_target(doc, NodeRole::ControlPlane, 0))
            .await?;

        let created_at = Utc::now();
        let out = ctx
            .executor
            .fast()
            .run(&target, scripts::renew_token(), OutputMode::WithOutput)
            .await
            .step("renew bootstrap token")?;
        let token = out
            .trimmed(0)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::validation("kubeadm returned an empty bootstrap token"))?;

        let expires_at = expiry_from(created_at);
        ctx.state
            .update("kubeadm bootstrap token renewal", |doc| {
                if let Some(b) = doc.k8s_bootstrap.as_mut() {
                    let kubeadm = b.kubeadm.get_or_insert_with(KubeadmBootstrapState::default);
                    kubeadm.bootstrap_token = Some(token.clone());
                    kubeadm.bootstrap_token_expire_time_utc = Some(expires_at);
                }
            })
            .await?;

        debug!(expires_at = %expires_at, "bootstrap token renewed");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bootstrapped_doc, Harness};
    use std::sync::Arc;

    fn margin() -> Duration {
        chrono_duration(BOOTSTRAP_TOKEN_REFRESH_MARGIN)
    }

    #[test]
    fn refresh_boundary_is_ten_minutes() {
        let now = Utc::now();
        assert!(needs_refresh(now, Some(now + Duration::minutes(9)), margin()));
        assert!(needs_refresh(now, Some(now + Duration::minutes(10)), margin()));
        assert!(!needs_refresh(now, Some(now + Duration::minutes(11)), margin()));
        assert!(needs_refresh(now, Some(now - Duration::minutes(1)), margin()));
        assert!(needs_refresh(now, None, margin()));
    }

    #[test]
    fn expiry_is_twenty_minutes_after_creation() {
        let created = Utc::now();
        assert_eq!(expiry_from(created) - created, Duration::minutes(20));
    }

    fn harness_with_token(expires_in: Duration) -> Harness {
        let mut doc = bootstrapped_doc(3, 2, 1);
        if let Some(b) = doc.k8s_bootstrap.as_mut() {
            b.kubeadm = Some(KubeadmBootstrapState {
                bootstrap_token: Some("old.token".into()),
                bootstrap_token_expire_time_utc: Some(Utc::now() + expires_in),
                ..Default::default()
            });
        }
        let h = Harness::new(doc);
        h.transport.respond("kubeadm token create", "new.token\n");
        h
    }

    #[tokio::test]
    async fn token_near_expiry_is_renewed_on_control_plane_zero() {
        let h = harness_with_token(Duration::minutes(9));
        let refresher = TokenRefresher::default();

        let token = refresher.fresh_token(&h.ctx).await.unwrap();

        assert_eq!(token, "new.token");
        assert_eq!(h.transport.count_on("203.0.113.10", "kubeadm token create"), 1);
        let doc = h.store.snapshot().unwrap();
        let kubeadm = doc.k8s_bootstrap.unwrap().kubeadm.unwrap();
        assert_eq!(kubeadm.bootstrap_token.as_deref(), Some("new.token"));
        let left = kubeadm.bootstrap_token_expire_time_utc.unwrap() - Utc::now();
        assert!(left > Duration::minutes(19));
    }

    #[tokio::test]
    async fn token_with_time_left_is_reused() {
        let h = harness_with_token(Duration::minutes(11));
        let refresher = TokenRefresher::default();

        let token = refresher.fresh_token(&h.ctx).await.unwrap();

        assert_eq!(token, "old.token");
        assert!(h.transport.executed().is_empty());
        assert_eq!(h.store.write_count(), 0);
    }

    /// Story: Two workers joining at once renew an expiring token only once
    #[tokio::test]
    async fn story_concurrent_joiners_renew_once() {
        let h = harness_with_token(Duration::minutes(2));
        let refresher = Arc::new(TokenRefresher::default());

        let (a, b) = tokio::join!(refresher.fresh_token(&h.ctx), refresher.fresh_token(&h.ctx));

        assert_eq!(a.unwrap(), "new.token");
        assert_eq!(b.unwrap(), "new.token");
        assert_eq!(h.transport.count("kubeadm token create"), 1);
    }

    #[tokio::test]
    async fn failed_renewal_keeps_the_old_token_recorded() {
        let h = harness_with_token(Duration::minutes(1));
        h.transport.fail("kubeadm token create", 1, "connection to the server was refused");
        let refresher = TokenRefresher::default();

        let err = refresher.fresh_token(&h.ctx).await.unwrap_err();

        assert!(err.to_string().starts_with("renew bootstrap token"));
        let doc = h.doc().await;
        let kubeadm = doc.k8s_bootstrap.unwrap().kubeadm.unwrap();
        assert_eq!(kubeadm.bootstrap_token.as_deref(), Some("old.token"));
    }
}
