//! Channel subscriptions, room membership and outbound filtering.
//!
//! Rooms follow a fixed naming convention; nothing else is joinable.
//! Channel access is a pure prefix check against the tenant context, and
//! every outbound event passes the same org filter again immediately
//! before delivery, so a routing bug upstream cannot leak across tenants.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::core::domain::{
    AuditAction, AuditRecord, ChannelName, Event, OrgId, SessionId, TenantContext, UserId,
};
use crate::core::store::Store;
use crate::error::{Error, Result};

/// Cap on concurrent channel subscriptions per socket.
pub const MAX_SUBSCRIPTIONS: usize = 200;

/// Payload fields stripped for non-admin receivers.
const REDACTED_FIELDS: [&str; 3] = ["internalMetadata", "systemData", "debugInfo"];

/// The only permitted room names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomName {
    Org(OrgId),
    User(UserId),
    Role(OrgId, String),
    Feature(OrgId, String),
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomName::Org(org) => write!(f, "org:{org}"),
            RoomName::User(user) => write!(f, "user:{user}"),
            RoomName::Role(org, role) => write!(f, "role:{org}:{role}"),
            RoomName::Feature(org, feature) => write!(f, "feature:{org}:{feature}"),
        }
    }
}

impl RoomName {
    /// The rooms a context joins at admission: org always, user when
    /// present, one per role, one per feature.
    #[must_use]
    pub fn admission_set(ctx: &TenantContext, include_features: bool) -> Vec<RoomName> {
        let org = &ctx.organization_id;
        let mut rooms = vec![RoomName::Org(org.clone())];
        if let Some(user) = &ctx.user_id {
            rooms.push(RoomName::User(user.clone()));
        }
        for role in &ctx.roles {
            rooms.push(RoomName::Role(org.clone(), role.clone()));
        }
        if include_features {
            for feature in &ctx.features {
                rooms.push(RoomName::Feature(org.clone(), feature.clone()));
            }
        }
        rooms
    }
}

/// Routing state for one node's sockets.
pub struct Router {
    store: Arc<dyn Store>,
    /// room name -> member sessions.
    rooms: DashMap<String, HashSet<String>>,
    /// session -> joined room names (mirror of `rooms`).
    memberships: DashMap<String, HashSet<String>>,
    /// session -> subscribed channels.
    subscriptions: DashMap<String, HashSet<ChannelName>>,
}

impl Router {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Join the admission room set for a freshly accepted socket.
    pub fn join_tenant_rooms(
        &self,
        ctx: &TenantContext,
        session: &SessionId,
        include_features: bool,
    ) -> Vec<RoomName> {
        let rooms = RoomName::admission_set(ctx, include_features);
        for room in &rooms {
            self.join(session, room);
        }
        debug!(session = %session, rooms = rooms.len(), "Joined tenant rooms");
        rooms
    }

    fn join(&self, session: &SessionId, room: &RoomName) {
        let name = room.to_string();
        self.rooms
            .entry(name.clone())
            .or_default()
            .insert(session.as_str().to_string());
        self.memberships
            .entry(session.as_str().to_string())
            .or_default()
            .insert(name);
    }

    /// Leaving mirrors joining: drop every membership and subscription.
    pub fn leave_all(&self, session: &SessionId) {
        if let Some((_, joined)) = self.memberships.remove(session.as_str()) {
            for name in joined {
                if let Some(mut members) = self.rooms.get_mut(&name) {
                    members.remove(session.as_str());
                }
            }
        }
        self.subscriptions.remove(session.as_str());
    }

    /// Membership check, re-run before any room fan-out.
    #[must_use]
    pub fn is_member(&self, session: &SessionId, room: &RoomName) -> bool {
        self.rooms
            .get(&room.to_string())
            .is_some_and(|members| members.contains(session.as_str()))
    }

    /// Members of a room, membership re-validated against the mirror map.
    #[must_use]
    pub fn members_of(&self, room: &RoomName) -> Vec<SessionId> {
        let name = room.to_string();
        self.rooms
            .get(&name)
            .map(|members| {
                members
                    .iter()
                    .filter(|session| {
                        // Re-check through the per-session mirror; a
                        // half-torn-down socket fails this and is skipped.
                        self.memberships
                            .get(session.as_str())
                            .is_some_and(|joined| joined.contains(&name))
                    })
                    .map(|s| SessionId::new(s.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A channel is accessible iff it carries the context's org prefix.
    pub async fn check_channel_access(
        &self,
        ctx: &TenantContext,
        channel: &ChannelName,
    ) -> Result<()> {
        if channel.belongs_to(&ctx.organization_id) {
            return Ok(());
        }
        let subject = ctx
            .user_id
            .as_ref()
            .map(|u| u.as_str().to_string())
            .unwrap_or_else(|| "org".into());
        warn!(
            org = %ctx.organization_id,
            channel = %channel,
            "Cross-tenant channel access denied"
        );
        if let Err(e) = self
            .store
            .append_audit(AuditRecord::new(
                ctx.organization_id.clone(),
                subject,
                AuditAction::AccessDenied,
                format!("channel {channel} outside tenant"),
            ))
            .await
        {
            warn!(error = %e, "Failed to write access audit record");
        }
        Err(Error::Forbidden(format!(
            "channel {channel} is outside organization {}",
            ctx.organization_id
        )))
    }

    /// Subscribe a session to channels, enforcing access and the cap.
    pub async fn subscribe(
        &self,
        ctx: &TenantContext,
        session: &SessionId,
        channels: &[ChannelName],
    ) -> Result<()> {
        for channel in channels {
            self.check_channel_access(ctx, channel).await?;
        }

        let mut subs = self
            .subscriptions
            .entry(session.as_str().to_string())
            .or_default();
        let added = channels
            .iter()
            .filter(|c| !subs.contains(*c))
            .count();
        if subs.len() + added > MAX_SUBSCRIPTIONS {
            return Err(Error::SubscriptionLimit(subs.len() + added));
        }
        subs.extend(channels.iter().cloned());
        Ok(())
    }

    pub fn unsubscribe(&self, session: &SessionId, channels: &[ChannelName]) {
        if let Some(mut subs) = self.subscriptions.get_mut(session.as_str()) {
            for channel in channels {
                subs.remove(channel);
            }
        }
    }

    #[must_use]
    pub fn subscriptions_of(&self, session: &SessionId) -> Vec<ChannelName> {
        self.subscriptions
            .get(session.as_str())
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sessions on this node subscribed to `channel`.
    #[must_use]
    pub fn subscribers_of(&self, channel: &ChannelName) -> Vec<SessionId> {
        self.subscriptions
            .iter()
            .filter(|e| e.value().contains(channel))
            .map(|e| SessionId::new(e.key().as_str()))
            .collect()
    }

    /// Final outbound filter: drop cross-org events, redact internals for
    /// non-admin receivers.
    #[must_use]
    pub fn filter_outbound(
        &self,
        event: &Event,
        receiver_org: &OrgId,
        receiver_is_admin: bool,
    ) -> Option<Event> {
        if &event.organization_id != receiver_org {
            warn!(
                event_org = %event.organization_id,
                receiver_org = %receiver_org,
                "Dropped cross-tenant event at outbound filter"
            );
            return None;
        }
        if receiver_is_admin {
            return Some(event.clone());
        }
        let mut redacted = event.clone();
        if let Some(payload) = redacted.payload.as_object_mut() {
            for field in REDACTED_FIELDS {
                payload.remove(field);
            }
        }
        Some(redacted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;

    fn router() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Router::new(store.clone()), store)
    }

    fn ctx() -> TenantContext {
        TenantContext::for_org("o1")
            .with_user("u1")
            .with_role("editor")
    }

    fn chan(name: &str) -> ChannelName {
        ChannelName::parse(name).unwrap()
    }

    #[test]
    fn room_names_follow_convention() {
        assert_eq!(RoomName::Org(OrgId::new("o1")).to_string(), "org:o1");
        assert_eq!(RoomName::User(UserId::new("u1")).to_string(), "user:u1");
        assert_eq!(
            RoomName::Role(OrgId::new("o1"), "admin".into()).to_string(),
            "role:o1:admin"
        );
        assert_eq!(
            RoomName::Feature(OrgId::new("o1"), "magic".into()).to_string(),
            "feature:o1:magic"
        );
    }

    #[test]
    fn admission_set_covers_org_user_roles() {
        let rooms = RoomName::admission_set(&ctx(), false);
        assert_eq!(
            rooms,
            vec![
                RoomName::Org(OrgId::new("o1")),
                RoomName::User(UserId::new("u1")),
                RoomName::Role(OrgId::new("o1"), "editor".into()),
            ]
        );
    }

    #[test]
    fn features_join_only_when_requested() {
        let mut c = ctx();
        c.features = vec!["magic".into()];
        assert_eq!(RoomName::admission_set(&c, false).len(), 3);
        assert_eq!(RoomName::admission_set(&c, true).len(), 4);
    }

    #[test]
    fn join_then_leave_mirrors() {
        let (router, _) = router();
        let session = SessionId::new("s1");
        router.join_tenant_rooms(&ctx(), &session, false);

        let org_room = RoomName::Org(OrgId::new("o1"));
        assert!(router.is_member(&session, &org_room));
        assert_eq!(router.members_of(&org_room).len(), 1);

        router.leave_all(&session);
        assert!(!router.is_member(&session, &org_room));
        assert!(router.members_of(&org_room).is_empty());
    }

    #[tokio::test]
    async fn cross_tenant_channel_is_forbidden_and_audited() {
        let (router, store) = router();
        let err = router
            .check_channel_access(&ctx(), &chan("org:o2:chat"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let audits = store.audit_records();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action, AuditAction::AccessDenied);
    }

    #[tokio::test]
    async fn same_tenant_channel_is_allowed() {
        let (router, store) = router();
        router
            .check_channel_access(&ctx(), &chan("org:o1:chat"))
            .await
            .unwrap();
        assert!(store.audit_records().is_empty());
    }

    #[tokio::test]
    async fn subscribe_tracks_and_caps() {
        let (router, _) = router();
        let session = SessionId::new("s1");
        router
            .subscribe(&ctx(), &session, &[chan("org:o1:a"), chan("org:o1:b")])
            .await
            .unwrap();
        assert_eq!(router.subscriptions_of(&session).len(), 2);
        assert_eq!(router.subscribers_of(&chan("org:o1:a")).len(), 1);

        router.unsubscribe(&session, &[chan("org:o1:a")]);
        assert!(router.subscribers_of(&chan("org:o1:a")).is_empty());
    }

    #[tokio::test]
    async fn subscription_cap_is_enforced() {
        let (router, _) = router();
        let session = SessionId::new("s1");
        let channels: Vec<ChannelName> = (0..MAX_SUBSCRIPTIONS)
            .map(|i| chan(&format!("org:o1:c{i}")))
            .collect();
        router.subscribe(&ctx(), &session, &channels).await.unwrap();

        let over = router
            .subscribe(&ctx(), &session, &[chan("org:o1:one-more")])
            .await;
        assert!(matches!(over, Err(Error::SubscriptionLimit(_))));

        // Re-subscribing an existing channel is not over the cap.
        router
            .subscribe(&ctx(), &session, &[chan("org:o1:c0")])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn subscribe_rejects_any_foreign_channel_atomically() {
        let (router, _) = router();
        let session = SessionId::new("s1");
        let result = router
            .subscribe(&ctx(), &session, &[chan("org:o1:ok"), chan("org:o2:bad")])
            .await;
        assert!(result.is_err());
        assert!(router.subscriptions_of(&session).is_empty());
    }

    #[test]
    fn outbound_filter_drops_cross_org() {
        let (router, _) = router();
        let event = Event::new("m", chan("org:o1:chat"), None, serde_json::json!({}))
            .unwrap();
        assert!(router
            .filter_outbound(&event, &OrgId::new("o2"), false)
            .is_none());
        assert!(router
            .filter_outbound(&event, &OrgId::new("o1"), false)
            .is_some());
    }

    #[test]
    fn outbound_filter_redacts_for_non_admin() {
        let (router, _) = router();
        let payload = serde_json::json!({
            "text": "hi",
            "internalMetadata": {"trace": 1},
            "systemData": {},
            "debugInfo": "stack",
        });
        let event = Event::new("m", chan("org:o1:chat"), None, payload).unwrap();

        let plain = router
            .filter_outbound(&event, &OrgId::new("o1"), false)
            .unwrap();
        assert_eq!(plain.payload.get("text").unwrap(), "hi");
        assert!(plain.payload.get("internalMetadata").is_none());
        assert!(plain.payload.get("systemData").is_none());
        assert!(plain.payload.get("debugInfo").is_none());

        let admin = router
            .filter_outbound(&event, &OrgId::new("o1"), true)
            .unwrap();
        assert!(admin.payload.get("internalMetadata").is_some());
    }
}
