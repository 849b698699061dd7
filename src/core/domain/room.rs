//! Collaboration rooms, operations, snapshots and branches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::id::{OrgId, RoomId};

/// Policy applied when an operation cannot be transformed cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Drop the conflicting operation (first write wins).
    FirstWriteWins,
    /// Apply the conflicting operation anyway (last write wins).
    #[default]
    LastWriteWins,
    /// Surface the conflict to the user for manual resolution.
    UserChoice,
}

/// Room feature toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    pub time_travel: bool,
    pub presence: bool,
    pub conflict_resolution: ConflictResolution,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            time_travel: true,
            presence: true,
            conflict_resolution: ConflictResolution::default(),
        }
    }
}

/// A collaboration document with versioned state.
///
/// `version` is a monotonic integer incremented exactly once per accepted
/// operation. State is mutated only by the CollaborationEngine under the
/// per-room critical section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub organization_id: OrgId,
    pub state: serde_json::Value,
    pub version: u64,
    pub config: RoomConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn new(name: impl Into<String>, organization_id: impl Into<OrgId>) -> Self {
        let now = Utc::now();
        Self {
            id: RoomId::new(Uuid::new_v4().to_string()),
            name: name.into(),
            organization_id: organization_id.into(),
            state: serde_json::json!({}),
            version: 0,
            config: RoomConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// The structural edit kinds subject to operational transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OperationKind {
    /// Replace the value at `path`.
    Set { value: serde_json::Value },
    /// Insert `value` at `index` in the array at `path`.
    ArrayInsert {
        index: usize,
        value: serde_json::Value,
    },
    /// Delete the element at `index` in the array at `path`.
    ArrayDelete { index: usize },
    /// Move the element at `from` to `to` in the array at `path`.
    ArrayMove { from: usize, to: usize },
    /// Field-wise merge of an object into the object at `path`.
    ObjectMerge { value: serde_json::Value },
}

/// A structural edit against room state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(flatten)]
    pub kind: OperationKind,
    pub path: Vec<String>,
    pub client_id: String,
    pub base_version: u64,
    /// Milliseconds since epoch; LWW tiebreak with `client_id`.
    pub timestamp: i64,
    #[serde(default)]
    pub causality: Vec<String>,
}

impl Operation {
    pub fn new(
        kind: OperationKind,
        path: Vec<String>,
        client_id: impl Into<String>,
        base_version: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            path,
            client_id: client_id.into(),
            base_version,
            timestamp: Utc::now().timestamp_millis(),
            causality: Vec::new(),
        }
    }

    /// LWW ordering: later timestamp wins; equal timestamps break on the
    /// lexicographically greater client id.
    #[must_use]
    pub fn wins_over(&self, other: &Operation) -> bool {
        match self.timestamp.cmp(&other.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.client_id > other.client_id,
        }
    }
}

/// Immutable capture of room state at a version on a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub room_id: RoomId,
    pub branch_name: String,
    pub state: serde_json::Value,
    pub version: u64,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The reserved default branch name.
pub const MAIN_BRANCH: &str = "main";

/// A lineage of snapshots rooted at `from_snapshot_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub room_id: RoomId,
    pub from_snapshot_id: Option<String>,
    pub head_snapshot_id: Option<String>,
    pub conflict_count: u32,
    pub last_activity: DateTime<Utc>,
}

impl Branch {
    pub fn main(room_id: RoomId) -> Self {
        Self {
            name: MAIN_BRANCH.to_string(),
            room_id,
            from_snapshot_id: None,
            head_snapshot_id: None,
            conflict_count: 0,
            last_activity: Utc::now(),
        }
    }
}

/// Strategy for reverting a room to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertStrategy {
    /// Refuse when in-flight operations have `base_version` past the snapshot.
    Safe,
    /// Discard in-flight operations and record a revert entry.
    Force,
}

/// Strategy for merging one branch into another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Succeed only when no field-level conflict exists.
    Auto,
    /// Return conflicts for caller resolution.
    Manual,
    /// Keep the target branch's value on conflict.
    Ours,
    /// Take the source branch's value on conflict.
    Theirs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_room_starts_at_version_zero() {
        let room = Room::new("doc-1", "o1");
        assert_eq!(room.version, 0);
        assert!(room.state.as_object().is_some_and(|o| o.is_empty()));
    }

    #[test]
    fn lww_prefers_later_timestamp() {
        let mut a = Operation::new(
            OperationKind::Set {
                value: serde_json::json!(1),
            },
            vec!["x".into()],
            "client-a",
            0,
        );
        let mut b = a.clone();
        b.client_id = "client-b".into();
        a.timestamp = 100;
        b.timestamp = 200;
        assert!(b.wins_over(&a));
        assert!(!a.wins_over(&b));
    }

    #[test]
    fn lww_ties_break_on_client_id() {
        let mut a = Operation::new(
            OperationKind::Set {
                value: serde_json::json!(1),
            },
            vec!["x".into()],
            "client-a",
            0,
        );
        let mut b = a.clone();
        b.client_id = "client-b".into();
        a.timestamp = 100;
        b.timestamp = 100;
        assert!(b.wins_over(&a));
    }

    #[test]
    fn operation_kind_round_trips_tagged() {
        let op = Operation::new(
            OperationKind::ArrayInsert {
                index: 2,
                value: serde_json::json!("A"),
            },
            vec!["items".into()],
            "c1",
            10,
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "arrayInsert");
        assert_eq!(json["index"], 2);
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn main_branch_has_reserved_name() {
        let b = Branch::main(RoomId::new("r1"));
        assert_eq!(b.name, MAIN_BRANCH);
        assert_eq!(b.conflict_count, 0);
    }
}
