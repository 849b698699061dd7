//! In-memory `Store` for tests and single-node demo mode.
//!
//! All maps key by `(org, entity id)` so the org id participates in every
//! lookup, matching the predicate rule real implementations must follow.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{Store, TimeRange};
use crate::core::domain::{
    AuditRecord, Branch, Channel, ChannelName, Connection, Event, OrgId, Organization, Room,
    RoomId, SessionId, Snapshot, UserId,
};
use crate::error::{Error, Result};

type OrgKey = (String, String);

fn key(org: &OrgId, id: &str) -> OrgKey {
    (org.as_str().to_string(), id.to_string())
}

/// DashMap-backed store.
#[derive(Default)]
pub struct MemoryStore {
    organizations: DashMap<String, Organization>,
    users: DashMap<String, HashSet<String>>,
    connections: DashMap<OrgKey, Connection>,
    channels: DashMap<OrgKey, Channel>,
    events: DashMap<OrgKey, Vec<Event>>,
    rooms: DashMap<OrgKey, Room>,
    snapshots: DashMap<OrgKey, Snapshot>,
    branches: DashMap<OrgKey, Branch>,
    audit: Mutex<Vec<AuditRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit rows captured so far (test observability).
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_organization(&self, org: Organization) -> Result<()> {
        self.organizations.insert(org.id.as_str().to_string(), org);
        Ok(())
    }

    async fn get_organization(&self, id: &OrgId) -> Result<Organization> {
        self.organizations
            .get(id.as_str())
            .map(|r| r.clone())
            .ok_or_else(|| Error::NotFound(format!("organization {id}")))
    }

    async fn register_user(&self, org: &OrgId, user: &UserId) -> Result<()> {
        self.users
            .entry(org.as_str().to_string())
            .or_default()
            .insert(user.as_str().to_string());
        Ok(())
    }

    async fn user_belongs_to(&self, org: &OrgId, user: &UserId) -> Result<bool> {
        Ok(self
            .users
            .get(org.as_str())
            .is_some_and(|set| set.contains(user.as_str())))
    }

    async fn upsert_connection(&self, conn: &Connection) -> Result<()> {
        self.connections.insert(
            key(&conn.organization_id, conn.session_id.as_str()),
            conn.clone(),
        );
        Ok(())
    }

    async fn get_connection(&self, org: &OrgId, session: &SessionId) -> Result<Connection> {
        self.connections
            .get(&key(org, session.as_str()))
            .map(|r| r.clone())
            .ok_or_else(|| Error::NotFound(format!("connection {session}")))
    }

    async fn list_connections(&self, org: &OrgId, range: TimeRange) -> Result<Vec<Connection>> {
        Ok(self
            .connections
            .iter()
            .filter(|e| e.key().0 == org.as_str() && range.contains(e.value().connected_at))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn count_connections(&self, org: &OrgId) -> Result<u64> {
        Ok(self
            .connections
            .iter()
            .filter(|e| e.key().0 == org.as_str())
            .count() as u64)
    }

    async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        self.channels.insert(
            key(&channel.organization_id, channel.name.as_str()),
            channel.clone(),
        );
        Ok(())
    }

    async fn list_channels(&self, org: &OrgId) -> Result<Vec<Channel>> {
        Ok(self
            .channels
            .iter()
            .filter(|e| e.key().0 == org.as_str())
            .map(|e| e.value().clone())
            .collect())
    }

    async fn count_channels(&self, org: &OrgId) -> Result<u64> {
        Ok(self
            .channels
            .iter()
            .filter(|e| e.key().0 == org.as_str())
            .count() as u64)
    }

    async fn insert_event(&self, event: &Event) -> Result<()> {
        self.events
            .entry(key(&event.organization_id, event.channel.as_str()))
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        org: &OrgId,
        channel: &ChannelName,
        range: TimeRange,
    ) -> Result<Vec<Event>> {
        Ok(self
            .events
            .get(&key(org, channel.as_str()))
            .map(|rows| {
                rows.iter()
                    .filter(|e| range.contains(e.created_at))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn distinct_event_types(&self, org: &OrgId) -> Result<Vec<String>> {
        let mut types: HashSet<String> = HashSet::new();
        for entry in self.events.iter() {
            if entry.key().0 == org.as_str() {
                types.extend(entry.value().iter().map(|e| e.event_type.clone()));
            }
        }
        let mut out: Vec<String> = types.into_iter().collect();
        out.sort();
        Ok(out)
    }

    async fn upsert_room(&self, room: &Room) -> Result<()> {
        self.rooms
            .insert(key(&room.organization_id, room.id.as_str()), room.clone());
        Ok(())
    }

    async fn get_room(&self, org: &OrgId, id: &RoomId) -> Result<Room> {
        self.rooms
            .get(&key(org, id.as_str()))
            .map(|r| r.clone())
            .ok_or_else(|| Error::NotFound(format!("room {id}")))
    }

    async fn get_room_by_name(&self, org: &OrgId, name: &str) -> Result<Room> {
        self.rooms
            .iter()
            .find(|e| e.key().0 == org.as_str() && e.value().name == name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound(format!("room named {name}")))
    }

    async fn count_rooms(&self, org: &OrgId) -> Result<u64> {
        Ok(self
            .rooms
            .iter()
            .filter(|e| e.key().0 == org.as_str())
            .count() as u64)
    }

    async fn insert_snapshot(&self, org: &OrgId, snapshot: &Snapshot) -> Result<()> {
        let k = key(org, &snapshot.id);
        if self.snapshots.contains_key(&k) {
            // Snapshots are immutable.
            return Err(Error::Conflict(format!("snapshot {}", snapshot.id)));
        }
        self.snapshots.insert(k, snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, org: &OrgId, room: &RoomId, id: &str) -> Result<Snapshot> {
        self.snapshots
            .get(&key(org, id))
            .filter(|s| &s.room_id == room)
            .map(|s| s.clone())
            .ok_or_else(|| Error::NotFound(format!("snapshot {id}")))
    }

    async fn list_snapshots(&self, org: &OrgId, room: &RoomId) -> Result<Vec<Snapshot>> {
        let mut out: Vec<Snapshot> = self
            .snapshots
            .iter()
            .filter(|e| e.key().0 == org.as_str() && &e.value().room_id == room)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|s| s.version);
        Ok(out)
    }

    async fn upsert_branch(&self, org: &OrgId, branch: &Branch) -> Result<()> {
        let k = key(org, &format!("{}:{}", branch.room_id, branch.name));
        self.branches.insert(k, branch.clone());
        Ok(())
    }

    async fn get_branch(&self, org: &OrgId, room: &RoomId, name: &str) -> Result<Branch> {
        self.branches
            .get(&key(org, &format!("{room}:{name}")))
            .map(|b| b.clone())
            .ok_or_else(|| Error::NotFound(format!("branch {name}")))
    }

    async fn list_branches(&self, org: &OrgId, room: &RoomId) -> Result<Vec<Branch>> {
        Ok(self
            .branches
            .iter()
            .filter(|e| e.key().0 == org.as_str() && &e.value().room_id == room)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn append_audit(&self, record: AuditRecord) -> Result<()> {
        self.audit.lock().push(record);
        Ok(())
    }
}
