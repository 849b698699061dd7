//! Organization and tenant context types.
//!
//! The [`TenantContext`] is built once at socket admission, never mutated,
//! and passed by value into every core operation. The `organization_id`
//! field is the authority token: any entity access asserts equality with it
//! or fails `Forbidden`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{OrgId, UserId};

/// Per-organization resource ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgLimits {
    pub max_connections: u32,
    pub max_channels: u32,
    pub max_rooms: u32,
}

impl Default for OrgLimits {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_channels: 500,
            max_rooms: 100,
        }
    }
}

/// A tenant organization. Immutable within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    pub slug: String,
    pub active: bool,
    pub limits: OrgLimits,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(id: impl Into<OrgId>, slug: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slug: slug.into(),
            active: true,
            limits: OrgLimits::default(),
            created_at: Utc::now(),
        }
    }
}

/// Validated `(org, user?, roles, permissions)` bundle propagated through
/// every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub organization_id: OrgId,
    pub user_id: Option<UserId>,
    pub user_role: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub features: Vec<String>,
}

impl TenantContext {
    /// Context for an organization with no authenticated user (demo mode,
    /// service-to-service tokens).
    pub fn for_org(organization_id: impl Into<OrgId>) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: None,
            user_role: None,
            roles: Vec::new(),
            permissions: Vec::new(),
            features: Vec::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        let role = role.into();
        self.user_role = Some(role.clone());
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
        self
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    /// True for the `admin` role or the `*:*` wildcard grant.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin") || self.permissions.iter().any(|p| p == "*:*")
    }

    /// Check a `Resource:action` permission, honoring resource-level and
    /// global wildcards.
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        if self.is_admin() {
            return true;
        }
        if self.permissions.iter().any(|p| p == permission) {
            return true;
        }
        // "Channel:read" is also granted by "Channel:*".
        match permission.split_once(':') {
            Some((resource, _)) => {
                let wildcard = format!("{resource}:*");
                self.permissions.iter().any(|p| p == &wildcard)
            }
            None => false,
        }
    }

    /// Assert that an entity's org matches this context.
    pub fn assert_same_org(&self, other: &OrgId) -> crate::error::Result<()> {
        if &self.organization_id == other {
            Ok(())
        } else {
            Err(crate::error::Error::Forbidden(format!(
                "entity belongs to {other}, context is {}",
                self.organization_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_role_grants_everything() {
        let ctx = TenantContext::for_org("o1").with_role("admin");
        assert!(ctx.is_admin());
        assert!(ctx.has_permission("Event:create"));
    }

    #[test]
    fn wildcard_permission_grants_everything() {
        let ctx = TenantContext::for_org("o1").with_permissions(vec!["*:*".into()]);
        assert!(ctx.has_permission("Channel:read"));
    }

    #[test]
    fn resource_wildcard_grants_actions_on_resource() {
        let ctx = TenantContext::for_org("o1").with_permissions(vec!["Channel:*".into()]);
        assert!(ctx.has_permission("Channel:read"));
        assert!(!ctx.has_permission("Event:create"));
    }

    #[test]
    fn exact_permission_match() {
        let ctx = TenantContext::for_org("o1").with_permissions(vec!["Event:read".into()]);
        assert!(ctx.has_permission("Event:read"));
        assert!(!ctx.has_permission("Event:create"));
    }

    #[test]
    fn same_org_assertion() {
        let ctx = TenantContext::for_org("o1");
        assert!(ctx.assert_same_org(&OrgId::new("o1")).is_ok());
        assert!(ctx.assert_same_org(&OrgId::new("o2")).is_err());
    }

    #[test]
    fn with_role_sets_user_role_and_roles() {
        let ctx = TenantContext::for_org("o1").with_role("editor");
        assert_eq!(ctx.user_role.as_deref(), Some("editor"));
        assert_eq!(ctx.roles, vec!["editor".to_string()]);
    }
}
