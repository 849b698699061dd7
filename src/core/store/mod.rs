//! Durable state behind an opaque trait.
//!
//! Relational persistence is an external collaborator; the core only sees
//! this interface. Every method is org-scoped: implementations must include
//! the organization id in every predicate, so a query can never cross a
//! tenant boundary even when handed a foreign entity id.
//!
//! Failure taxonomy: `NotFound`, `Conflict` (unique key), `Transient`
//! (retryable), `Fatal`.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::domain::{
    AuditRecord, Branch, Channel, ChannelName, Connection, Event, OrgId, Organization, Room,
    RoomId, SessionId, Snapshot, UserId,
};
use crate::error::Result;

/// Inclusive time-range filter for bulk queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.map_or(true, |f| ts >= f) && self.to.map_or(true, |t| ts <= t)
    }
}

/// Opaque transactional store for tenant state.
#[async_trait]
pub trait Store: Send + Sync {
    // Organizations

    async fn upsert_organization(&self, org: Organization) -> Result<()>;
    async fn get_organization(&self, id: &OrgId) -> Result<Organization>;

    // Users (membership only; profiles live outside the core)

    async fn register_user(&self, org: &OrgId, user: &UserId) -> Result<()>;
    async fn user_belongs_to(&self, org: &OrgId, user: &UserId) -> Result<bool>;

    // Connections

    async fn upsert_connection(&self, conn: &Connection) -> Result<()>;
    async fn get_connection(&self, org: &OrgId, session: &SessionId) -> Result<Connection>;
    async fn list_connections(&self, org: &OrgId, range: TimeRange) -> Result<Vec<Connection>>;
    async fn count_connections(&self, org: &OrgId) -> Result<u64>;

    // Channels

    async fn upsert_channel(&self, channel: &Channel) -> Result<()>;
    async fn list_channels(&self, org: &OrgId) -> Result<Vec<Channel>>;
    async fn count_channels(&self, org: &OrgId) -> Result<u64>;

    // Events (durable copies of appended log entries)

    async fn insert_event(&self, event: &Event) -> Result<()>;
    async fn list_events(
        &self,
        org: &OrgId,
        channel: &ChannelName,
        range: TimeRange,
    ) -> Result<Vec<Event>>;
    /// Distinct-field query: the set of event types seen for an org.
    async fn distinct_event_types(&self, org: &OrgId) -> Result<Vec<String>>;

    // Rooms

    async fn upsert_room(&self, room: &Room) -> Result<()>;
    async fn get_room(&self, org: &OrgId, id: &RoomId) -> Result<Room>;
    async fn get_room_by_name(&self, org: &OrgId, name: &str) -> Result<Room>;
    async fn count_rooms(&self, org: &OrgId) -> Result<u64>;

    // Snapshots (immutable once inserted)

    async fn insert_snapshot(&self, org: &OrgId, snapshot: &Snapshot) -> Result<()>;
    async fn get_snapshot(&self, org: &OrgId, room: &RoomId, id: &str) -> Result<Snapshot>;
    async fn list_snapshots(&self, org: &OrgId, room: &RoomId) -> Result<Vec<Snapshot>>;

    // Branches

    async fn upsert_branch(&self, org: &OrgId, branch: &Branch) -> Result<()>;
    async fn get_branch(&self, org: &OrgId, room: &RoomId, name: &str) -> Result<Branch>;
    async fn list_branches(&self, org: &OrgId, room: &RoomId) -> Result<Vec<Branch>>;

    // Audit

    async fn append_audit(&self, record: AuditRecord) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_range_bounds_are_inclusive() {
        let at = |s| Utc.timestamp_opt(s, 0).unwrap();
        let range = TimeRange {
            from: Some(at(10)),
            to: Some(at(20)),
        };
        assert!(range.contains(at(10)));
        assert!(range.contains(at(20)));
        assert!(!range.contains(at(9)));
        assert!(!range.contains(at(21)));
    }

    #[test]
    fn open_range_contains_everything() {
        let range = TimeRange::default();
        assert!(range.contains(Utc::now()));
    }
}
