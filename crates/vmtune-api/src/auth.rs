//! Authorization seam
//!
//! Every component receives its [`AuthorizationService`] through its
//! constructor; nothing is bound globally.

use async_trait::async_trait;
use vmtune_core::{ComputeError, PolicyConfig, RequestContext};

/// Grants or denies a caller per policy alias
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    /// Check that `ctx` may use the endpoints guarded by `alias`
    ///
    /// # Errors
    /// `Unauthorized` when the policy denies the caller
    async fn authorize(&self, ctx: &RequestContext, alias: &str) -> Result<(), ComputeError>;
}

/// Role-based authorizer driven by [`PolicyConfig`]
///
/// A caller passes when it holds any role the alias requires. An alias
/// with no required roles admits everyone.
#[derive(Debug, Clone, Default)]
pub struct PolicyAuthorizer {
    policy: PolicyConfig,
}

impl PolicyAuthorizer {
    /// Create authorizer over policy rules
    #[inline]
    #[must_use]
    pub fn new(policy: PolicyConfig) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AuthorizationService for PolicyAuthorizer {
    async fn authorize(&self, ctx: &RequestContext, alias: &str) -> Result<(), ComputeError> {
        let required = self.policy.roles_for(alias);
        if required.is_empty() || required.iter().any(|role| ctx.has_role(role)) {
            return Ok(());
        }

        tracing::info!(
            user = %ctx.user_id,
            request = %ctx.request_id,
            alias,
            "policy denied request"
        );
        Err(ComputeError::Unauthorized {
            alias: alias.to_string(),
            user: ctx.user_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn member_may_hotplug() {
        let authz = PolicyAuthorizer::default();
        let ctx = RequestContext::new("alice", "p1").with_roles(["member"]);
        assert!(authz.authorize(&ctx, "os-server-cpu-hotplug").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_alias_falls_back_to_default_roles() {
        let authz = PolicyAuthorizer::default();
        let ctx = RequestContext::new("alice", "p1").with_roles(["member"]);

        let err = authz.authorize(&ctx, "os-server-live-resize").await.unwrap_err();
        assert_eq!(
            err,
            ComputeError::Unauthorized {
                alias: "os-server-live-resize".into(),
                user: "alice".into(),
            }
        );
        assert!(authz
            .authorize(&RequestContext::admin(), "os-server-live-resize")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn empty_rule_admits_everyone() {
        let policy = PolicyConfig::default().with_rule("os-server-mem-hottune", Vec::<String>::new());
        let authz = PolicyAuthorizer::new(policy);
        let ctx = RequestContext::new("bob", "p2");
        assert!(authz.authorize(&ctx, "os-server-mem-hottune").await.is_ok());
    }
}
