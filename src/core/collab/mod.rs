//! Collaboration rooms: serialized operation application, snapshots,
//! branches and merges.
//!
//! # Concurrency
//!
//! Operations against one room are serialized through a per-room
//! `tokio::sync::Mutex`; rooms progress independently. Callers never hold
//! references into a room across await points: every public method takes
//! ids and returns owned snapshots.

pub mod ot;
pub mod state;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::domain::{
    Branch, ConflictResolution, MergeStrategy, Operation, OrgId, RevertStrategy, Room, RoomConfig,
    RoomId, Snapshot, TenantContext, MAIN_BRANCH,
};
use crate::core::kv::KvStore;
use crate::core::log::EventLog;
use crate::core::store::Store;
use crate::error::{Error, Result};

pub use ot::{transform, transform_against_all, Transformed};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Approximate trim length for per-room op logs.
    pub op_log_trim: usize,
    /// Accepted operations kept in memory for transforms.
    pub history_window: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            op_log_trim: 1000,
            history_window: 512,
        }
    }
}

/// Stream key for a room's operation log.
#[must_use]
pub fn op_log_key(org: &OrgId, room: &RoomId) -> String {
    format!("rooms:{org}:{room}:ops")
}

/// Pub/sub channel for a room's applied-operation notifications.
#[must_use]
pub fn magic_channel(room_name: &str) -> String {
    format!("magic:{room_name}")
}

/// Result of submitting an operation.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedOperation {
    pub version: u64,
    /// The operation as applied, after transformation. `None` when the
    /// operation was dropped by conflict policy.
    pub operation: Option<Operation>,
    pub transformed: bool,
    pub dropped: bool,
    pub conflict: bool,
}

/// One irreconcilable field in a merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldConflict {
    pub path: String,
    pub ours: Option<Value>,
    pub theirs: Option<Value>,
}

/// Merge result: a snapshot when it succeeded, conflicts otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub snapshot: Option<Snapshot>,
    pub conflicts: Vec<FieldConflict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffSeverity {
    Low,
    Medium,
    High,
}

/// One per-path difference between two branches.
#[derive(Debug, Clone, Serialize)]
pub struct PathDiff {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: DiffKind,
    pub old: Option<Value>,
    pub new: Option<Value>,
    pub severity: DiffSeverity,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchComparison {
    pub differences: Vec<PathDiff>,
    pub summary: DiffSummary,
}

/// A point on a room's history.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub snapshot_id: String,
    pub branch_name: String,
    pub version: u64,
    pub description: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
}

struct RoomInner {
    room: Room,
    /// Accepted operations, oldest first. Entry `i` produced version
    /// `history_base + i + 1`.
    history: VecDeque<Operation>,
    history_base: u64,
    /// Base versions discarded by a force revert: ops based inside the
    /// span `(from, to]` are rejected.
    reverted_span: Option<(u64, u64)>,
}

struct RoomSlot {
    gate: Mutex<RoomInner>,
}

/// The per-node collaboration engine.
pub struct CollaborationEngine {
    store: Arc<dyn Store>,
    log: Arc<dyn EventLog>,
    kv: Arc<dyn KvStore>,
    config: CollabConfig,
    rooms: DashMap<String, Arc<RoomSlot>>,
    /// Operations waiting on a room gate, by base version. Consulted by
    /// safe reverts.
    inflight: DashMap<String, Vec<u64>>,
    /// Presence participants per room id.
    presence: DashMap<String, HashSet<String>>,
}

impl CollaborationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        log: Arc<dyn EventLog>,
        kv: Arc<dyn KvStore>,
        config: CollabConfig,
    ) -> Self {
        Self {
            store,
            log,
            kv,
            config,
            rooms: DashMap::new(),
            inflight: DashMap::new(),
            presence: DashMap::new(),
        }
    }

    /// Fetch a room by name, creating it (with its `main` branch) when
    /// absent.
    pub async fn get_or_create_room(
        &self,
        ctx: &TenantContext,
        name: &str,
        config: Option<RoomConfig>,
    ) -> Result<Room> {
        match self
            .store
            .get_room_by_name(&ctx.organization_id, name)
            .await
        {
            Ok(room) => {
                ctx.assert_same_org(&room.organization_id)?;
                Ok(room)
            }
            Err(Error::NotFound(_)) => {
                let mut room = Room::new(name, ctx.organization_id.clone());
                if let Some(config) = config {
                    room.config = config;
                }
                self.store.upsert_room(&room).await?;
                self.store
                    .upsert_branch(&ctx.organization_id, &Branch::main(room.id.clone()))
                    .await?;
                info!(room = %room.id, org = %ctx.organization_id, "Room created");
                Ok(room)
            }
            Err(e) => Err(e),
        }
    }

    /// Current room state, org-checked.
    pub async fn room_state(&self, ctx: &TenantContext, room_id: &RoomId) -> Result<Room> {
        let slot = self.slot(ctx, room_id).await?;
        let inner = slot.gate.lock().await;
        Ok(inner.room.clone())
    }

    /// Presence join; returns the current participant set.
    pub async fn join_room(
        &self,
        ctx: &TenantContext,
        room_id: &RoomId,
        participant: &str,
    ) -> Result<Vec<String>> {
        let slot = self.slot(ctx, room_id).await?;
        let _inner = slot.gate.lock().await;
        let mut members = self
            .presence
            .entry(room_id.as_str().to_string())
            .or_default();
        members.insert(participant.to_string());
        Ok(members.iter().cloned().collect())
    }

    /// Presence leave.
    pub async fn leave_room(
        &self,
        ctx: &TenantContext,
        room_id: &RoomId,
        participant: &str,
    ) -> Result<()> {
        let slot = self.slot(ctx, room_id).await?;
        let _inner = slot.gate.lock().await;
        if let Some(mut members) = self.presence.get_mut(room_id.as_str()) {
            members.remove(participant);
        }
        Ok(())
    }

    #[must_use]
    pub fn participants(&self, room_id: &RoomId) -> Vec<String> {
        self.presence
            .get(room_id.as_str())
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Submit an operation; transforms against intervening history when
    /// the base version is stale.
    pub async fn apply_operation(
        &self,
        ctx: &TenantContext,
        room_id: &RoomId,
        op: Operation,
    ) -> Result<AppliedOperation> {
        let slot = self.slot(ctx, room_id).await?;
        let _inflight = InflightGuard::register(&self.inflight, room_id, op.base_version);

        let mut inner = slot.gate.lock().await;
        let room_version = inner.room.version;

        if let Some((from, to)) = inner.reverted_span {
            if op.base_version > from && op.base_version <= to {
                return Err(Error::Conflict(format!(
                    "operation base {} was discarded by a revert",
                    op.base_version
                )));
            }
        }
        if op.base_version > room_version {
            return Err(Error::Validation(format!(
                "base version {} is ahead of room version {room_version}",
                op.base_version
            )));
        }
        if op.base_version < inner.history_base {
            return Err(Error::Conflict(format!(
                "base version {} predates the retained history",
                op.base_version
            )));
        }

        // Transform against everything the client had not seen.
        let skip = (op.base_version - inner.history_base) as usize;
        let priors: Vec<Operation> = inner.history.iter().skip(skip).cloned().collect();
        let was_stale = !priors.is_empty();

        let (to_apply, conflict) = match ot::transform_against_all(op.clone(), &priors) {
            Transformed::Keep(t) => (Some(t), false),
            Transformed::Drop => (None, false),
            Transformed::Conflict(original) => {
                match inner.room.config.conflict_resolution {
                    ConflictResolution::FirstWriteWins => (None, true),
                    ConflictResolution::LastWriteWins => (Some(original), true),
                    ConflictResolution::UserChoice => {
                        drop(inner);
                        self.record_conflict(ctx, room_id).await;
                        return Err(Error::Conflict(
                            "operation conflicts with concurrent edits".into(),
                        ));
                    }
                }
            }
        };

        if conflict {
            // Resolved silently by policy, but still counted on the branch.
            let org = ctx.organization_id.clone();
            let room = room_id.clone();
            if let Ok(mut branch) = self.store.get_branch(&org, &room, MAIN_BRANCH).await {
                branch.conflict_count += 1;
                branch.last_activity = Utc::now();
                let _ = self.store.upsert_branch(&org, &branch).await;
            }
        }

        let Some(applied) = to_apply else {
            debug!(room = %room_id, "Operation dropped by transform");
            return Ok(AppliedOperation {
                version: inner.room.version,
                operation: None,
                transformed: was_stale,
                dropped: true,
                conflict,
            });
        };

        // Apply failures are structural conflicts (e.g. an index the
        // transform could not see was invalidated by a set).
        if let Err(e) = state::apply(&mut inner.room.state, &applied) {
            warn!(room = %room_id, error = %e, "Operation failed to apply");
            return Err(e);
        }

        inner.room.version += 1;
        inner.room.updated_at = Utc::now();
        inner.history.push_back(applied.clone());
        while inner.history.len() > self.config.history_window {
            inner.history.pop_front();
            inner.history_base += 1;
        }

        let room_snapshot = inner.room.clone();
        let version = room_snapshot.version;
        drop(inner);

        self.store.upsert_room(&room_snapshot).await?;
        self.append_op_log(ctx, &room_snapshot, &applied, version).await;
        self.publish_applied(&room_snapshot, &applied, version).await;

        Ok(AppliedOperation {
            version,
            operation: Some(applied),
            transformed: was_stale,
            dropped: false,
            conflict,
        })
    }

    /// Capture an immutable snapshot of the room at its current version.
    pub async fn create_snapshot(
        &self,
        ctx: &TenantContext,
        room_id: &RoomId,
        branch_name: Option<&str>,
        description: Option<String>,
    ) -> Result<Snapshot> {
        let slot = self.slot(ctx, room_id).await?;
        let inner = slot.gate.lock().await;
        let branch_name = branch_name.unwrap_or(MAIN_BRANCH).to_string();

        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            branch_name: branch_name.clone(),
            state: inner.room.state.clone(),
            version: inner.room.version,
            description,
            created_at: Utc::now(),
        };
        drop(inner);

        self.store
            .insert_snapshot(&ctx.organization_id, &snapshot)
            .await?;
        self.move_branch_head(ctx, room_id, &branch_name, &snapshot.id)
            .await?;
        info!(room = %room_id, snapshot = %snapshot.id, version = snapshot.version, "Snapshot created");
        Ok(snapshot)
    }

    /// Create a branch rooted at a snapshot.
    pub async fn create_branch(
        &self,
        ctx: &TenantContext,
        room_id: &RoomId,
        from_snapshot_id: &str,
        name: &str,
    ) -> Result<Branch> {
        if name == MAIN_BRANCH {
            return Err(Error::Validation(format!("branch name '{MAIN_BRANCH}' is reserved")));
        }
        let snapshot = self
            .store
            .get_snapshot(&ctx.organization_id, room_id, from_snapshot_id)
            .await?;
        if self
            .store
            .get_branch(&ctx.organization_id, room_id, name)
            .await
            .is_ok()
        {
            return Err(Error::Conflict(format!("branch {name} already exists")));
        }

        let branch = Branch {
            name: name.to_string(),
            room_id: room_id.clone(),
            from_snapshot_id: Some(snapshot.id.clone()),
            head_snapshot_id: Some(snapshot.id),
            conflict_count: 0,
            last_activity: Utc::now(),
        };
        self.store
            .upsert_branch(&ctx.organization_id, &branch)
            .await?;
        Ok(branch)
    }

    pub async fn list_branches(&self, ctx: &TenantContext, room_id: &RoomId) -> Result<Vec<Branch>> {
        let room = self.room_state(ctx, room_id).await?;
        self.store.list_branches(&ctx.organization_id, &room.id).await
    }

    /// Revert the room to a snapshot. `Safe` refuses when operations based
    /// past the snapshot are in flight; `Force` discards them.
    pub async fn revert_to_snapshot(
        &self,
        ctx: &TenantContext,
        room_id: &RoomId,
        snapshot_id: &str,
        strategy: RevertStrategy,
    ) -> Result<Room> {
        let snapshot = self
            .store
            .get_snapshot(&ctx.organization_id, room_id, snapshot_id)
            .await?;
        let slot = self.slot(ctx, room_id).await?;
        let mut inner = slot.gate.lock().await;

        let in_flight_past_snapshot = self
            .inflight
            .get(room_id.as_str())
            .map(|versions| versions.iter().any(|v| *v > snapshot.version))
            .unwrap_or(false);

        match strategy {
            RevertStrategy::Safe if in_flight_past_snapshot => {
                return Err(Error::Conflict(
                    "in-flight operations are based past the snapshot".into(),
                ));
            }
            RevertStrategy::Force => {
                inner.reverted_span = Some((snapshot.version, inner.room.version));
            }
            RevertStrategy::Safe => {}
        }

        inner.room.state = snapshot.state.clone();
        // The revert itself counts as an operation.
        inner.room.version += 1;
        inner.room.updated_at = Utc::now();
        inner.history.clear();
        inner.history_base = inner.room.version;

        let room_snapshot = inner.room.clone();
        drop(inner);

        self.store.upsert_room(&room_snapshot).await?;
        self.move_branch_head(ctx, room_id, &snapshot.branch_name, &snapshot.id)
            .await?;

        let fields = vec![
            ("type".to_string(), "revert".to_string()),
            ("snapshot_id".to_string(), snapshot.id.clone()),
            ("version".to_string(), room_snapshot.version.to_string()),
        ];
        if let Err(e) = self
            .log
            .append(
                &op_log_key(&ctx.organization_id, room_id),
                &fields,
                Some(self.config.op_log_trim),
            )
            .await
        {
            warn!(room = %room_id, error = %e, "Failed to log revert entry");
        }
        info!(room = %room_id, snapshot = %snapshot.id, "Room reverted");
        Ok(room_snapshot)
    }

    /// Merge `source` into `target`, producing a merge snapshot on the
    /// target or a conflict list.
    pub async fn merge_branches(
        &self,
        ctx: &TenantContext,
        room_id: &RoomId,
        source: &str,
        target: &str,
        strategy: MergeStrategy,
    ) -> Result<MergeOutcome> {
        let org = &ctx.organization_id;
        let source_branch = self.store.get_branch(org, room_id, source).await?;
        let target_branch = self.store.get_branch(org, room_id, target).await?;

        let slot = self.slot(ctx, room_id).await?;
        let mut inner = slot.gate.lock().await;

        let source_state = self
            .branch_state(org, room_id, &source_branch, &inner.room)
            .await?;
        let target_state = self
            .branch_state(org, room_id, &target_branch, &inner.room)
            .await?;
        let base_state = match &source_branch.from_snapshot_id {
            Some(id) => self.store.get_snapshot(org, room_id, id).await?.state,
            None => serde_json::json!({}),
        };

        // Merging a branch into itself (or identical states) is identity.
        if source == target || source_state == target_state {
            return Ok(MergeOutcome {
                snapshot: None,
                conflicts: Vec::new(),
            });
        }

        let theirs = state::flatten(&source_state);
        let ours = state::flatten(&target_state);
        let base = state::flatten(&base_state);

        let mut merged = ours.clone();
        let mut conflicts = Vec::new();
        let paths: HashSet<&String> = theirs.keys().chain(ours.keys()).collect();
        for path in paths {
            let s = theirs.get(path);
            let t = ours.get(path);
            let b = base.get(path);
            if s == t {
                continue;
            }
            let source_changed = s != b;
            let target_changed = t != b;
            match (source_changed, target_changed) {
                (true, false) => {
                    match s {
                        Some(v) => merged.insert(path.clone(), v.clone()),
                        None => merged.remove(path),
                    };
                }
                (false, true) => {}
                _ => {
                    let resolved = match strategy {
                        MergeStrategy::Ours => Some(t.cloned()),
                        MergeStrategy::Theirs => Some(s.cloned()),
                        MergeStrategy::Auto | MergeStrategy::Manual => None,
                    };
                    match resolved {
                        Some(Some(v)) => {
                            merged.insert(path.clone(), v);
                        }
                        Some(None) => {
                            merged.remove(path);
                        }
                        None => conflicts.push(FieldConflict {
                            path: path.clone(),
                            ours: t.cloned(),
                            theirs: s.cloned(),
                        }),
                    }
                }
            }
        }

        if !conflicts.is_empty() {
            let mut branch = target_branch;
            branch.conflict_count += conflicts.len() as u32;
            branch.last_activity = Utc::now();
            self.store.upsert_branch(org, &branch).await?;
            return Ok(MergeOutcome {
                snapshot: None,
                conflicts,
            });
        }

        let merged_state = state::unflatten(&merged);
        inner.room.version += 1;
        if target == MAIN_BRANCH {
            // Merging into main updates the live document.
            inner.room.state = merged_state.clone();
        }
        inner.room.updated_at = Utc::now();
        // Pre-merge history can no longer anchor transforms.
        inner.history.clear();
        inner.history_base = inner.room.version;
        let room_snapshot = inner.room.clone();
        let version = room_snapshot.version;
        drop(inner);

        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            branch_name: target.to_string(),
            state: merged_state,
            version,
            description: Some(format!("merge {source} into {target}")),
            created_at: Utc::now(),
        };
        self.store.upsert_room(&room_snapshot).await?;
        self.store.insert_snapshot(org, &snapshot).await?;
        self.move_branch_head(ctx, room_id, target, &snapshot.id)
            .await?;
        info!(room = %room_id, source, target, "Branches merged");
        Ok(MergeOutcome {
            snapshot: Some(snapshot),
            conflicts: Vec::new(),
        })
    }

    /// Per-path differences between two branch heads.
    pub async fn compare_branches(
        &self,
        ctx: &TenantContext,
        room_id: &RoomId,
        left: &str,
        right: &str,
    ) -> Result<BranchComparison> {
        let org = &ctx.organization_id;
        let left_branch = self.store.get_branch(org, room_id, left).await?;
        let right_branch = self.store.get_branch(org, room_id, right).await?;

        let slot = self.slot(ctx, room_id).await?;
        let inner = slot.gate.lock().await;
        let left_state = self
            .branch_state(org, room_id, &left_branch, &inner.room)
            .await?;
        let right_state = self
            .branch_state(org, room_id, &right_branch, &inner.room)
            .await?;
        drop(inner);

        let old = state::flatten(&left_state);
        let new = state::flatten(&right_state);
        let mut differences = Vec::new();
        let mut summary = DiffSummary::default();

        for (path, value) in &new {
            match old.get(path) {
                None => {
                    summary.added += 1;
                    differences.push(PathDiff {
                        path: path.clone(),
                        kind: DiffKind::Added,
                        old: None,
                        new: Some(value.clone()),
                        severity: DiffSeverity::Low,
                    });
                }
                Some(previous) if previous != value => {
                    summary.modified += 1;
                    differences.push(PathDiff {
                        path: path.clone(),
                        kind: DiffKind::Modified,
                        old: Some(previous.clone()),
                        new: Some(value.clone()),
                        severity: DiffSeverity::Medium,
                    });
                }
                Some(_) => {}
            }
        }
        for (path, value) in &old {
            if !new.contains_key(path) {
                summary.removed += 1;
                differences.push(PathDiff {
                    path: path.clone(),
                    kind: DiffKind::Removed,
                    old: Some(value.clone()),
                    new: None,
                    severity: DiffSeverity::High,
                });
            }
        }
        differences.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(BranchComparison {
            differences,
            summary,
        })
    }

    /// Snapshots across all branches, ordered by version.
    pub async fn timeline(&self, ctx: &TenantContext, room_id: &RoomId) -> Result<Vec<TimelineEntry>> {
        let room = self.room_state(ctx, room_id).await?;
        let snapshots = self
            .store
            .list_snapshots(&ctx.organization_id, &room.id)
            .await?;
        Ok(snapshots
            .into_iter()
            .map(|s| TimelineEntry {
                snapshot_id: s.id,
                branch_name: s.branch_name,
                version: s.version,
                description: s.description,
                created_at: s.created_at,
            })
            .collect())
    }

    async fn slot(&self, ctx: &TenantContext, room_id: &RoomId) -> Result<Arc<RoomSlot>> {
        if let Some(slot) = self.rooms.get(room_id.as_str()) {
            let inner = slot.gate.lock().await;
            ctx.assert_same_org(&inner.room.organization_id)?;
            drop(inner);
            return Ok(slot.clone());
        }
        let room = self.store.get_room(&ctx.organization_id, room_id).await?;
        ctx.assert_same_org(&room.organization_id)?;
        let history_base = room.version;
        let slot = self
            .rooms
            .entry(room_id.as_str().to_string())
            .or_insert_with(|| {
                Arc::new(RoomSlot {
                    gate: Mutex::new(RoomInner {
                        room,
                        history: VecDeque::new(),
                        history_base,
                        reverted_span: None,
                    }),
                })
            })
            .clone();
        Ok(slot)
    }

    async fn branch_state(
        &self,
        org: &OrgId,
        room_id: &RoomId,
        branch: &Branch,
        room: &Room,
    ) -> Result<Value> {
        if let Some(head) = &branch.head_snapshot_id {
            return Ok(self.store.get_snapshot(org, room_id, head).await?.state);
        }
        if branch.name == MAIN_BRANCH {
            // Main with no snapshot yet is the live document.
            return Ok(room.state.clone());
        }
        match &branch.from_snapshot_id {
            Some(id) => Ok(self.store.get_snapshot(org, room_id, id).await?.state),
            None => Ok(serde_json::json!({})),
        }
    }

    async fn move_branch_head(
        &self,
        ctx: &TenantContext,
        room_id: &RoomId,
        branch_name: &str,
        snapshot_id: &str,
    ) -> Result<()> {
        let org = &ctx.organization_id;
        let mut branch = match self.store.get_branch(org, room_id, branch_name).await {
            Ok(b) => b,
            Err(Error::NotFound(_)) if branch_name == MAIN_BRANCH => {
                Branch::main(room_id.clone())
            }
            Err(e) => return Err(e),
        };
        branch.head_snapshot_id = Some(snapshot_id.to_string());
        branch.last_activity = Utc::now();
        self.store.upsert_branch(org, &branch).await
    }

    async fn record_conflict(&self, ctx: &TenantContext, room_id: &RoomId) {
        let org = &ctx.organization_id;
        if let Ok(mut branch) = self.store.get_branch(org, room_id, MAIN_BRANCH).await {
            branch.conflict_count += 1;
            branch.last_activity = Utc::now();
            let _ = self.store.upsert_branch(org, &branch).await;
        }
    }

    async fn append_op_log(
        &self,
        ctx: &TenantContext,
        room: &Room,
        op: &Operation,
        version: u64,
    ) {
        let body = match serde_json::to_string(op) {
            Ok(b) => b,
            Err(e) => {
                warn!(room = %room.id, error = %e, "Unserializable operation");
                return;
            }
        };
        let fields = vec![
            ("type".to_string(), "operation".to_string()),
            ("operation".to_string(), body),
            ("version".to_string(), version.to_string()),
        ];
        if let Err(e) = self
            .log
            .append(
                &op_log_key(&ctx.organization_id, &room.id),
                &fields,
                Some(self.config.op_log_trim),
            )
            .await
        {
            warn!(room = %room.id, error = %e, "Op log append failed");
        }
    }

    async fn publish_applied(&self, room: &Room, op: &Operation, version: u64) {
        let payload = serde_json::json!({
            "type": "magic_operation_applied",
            "roomId": room.id.as_str(),
            "organizationId": room.organization_id.as_str(),
            "operationId": op.id,
            "version": version,
        });
        if let Err(e) = self
            .kv
            .publish(&magic_channel(&room.name), &payload.to_string())
            .await
        {
            warn!(room = %room.id, error = %e, "Operation notification failed");
        }
    }
}

/// RAII registration of an op waiting on a room gate.
struct InflightGuard<'a> {
    map: &'a DashMap<String, Vec<u64>>,
    room: String,
    base: u64,
}

impl<'a> InflightGuard<'a> {
    fn register(map: &'a DashMap<String, Vec<u64>>, room: &RoomId, base: u64) -> Self {
        map.entry(room.as_str().to_string()).or_default().push(base);
        Self {
            map,
            room: room.as_str().to_string(),
            base,
        }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut versions) = self.map.get_mut(&self.room) {
            if let Some(pos) = versions.iter().position(|v| *v == self.base) {
                versions.swap_remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::OperationKind;
    use crate::core::kv::MemoryKv;
    use crate::core::log::MemoryLog;
    use crate::core::store::MemoryStore;
    use serde_json::json;

    fn engine() -> CollaborationEngine {
        CollaborationEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLog::new()),
            Arc::new(MemoryKv::new()),
            CollabConfig::default(),
        )
    }

    fn ctx() -> TenantContext {
        TenantContext::for_org("o1").with_user("u1")
    }

    fn set_op(path: &[&str], value: Value, client: &str, base: u64) -> Operation {
        Operation::new(
            OperationKind::Set { value },
            path.iter().map(|s| s.to_string()).collect(),
            client,
            base,
        )
    }

    fn insert_op(path: &[&str], index: usize, value: Value, client: &str, base: u64) -> Operation {
        Operation::new(
            OperationKind::ArrayInsert { index, value },
            path.iter().map(|s| s.to_string()).collect(),
            client,
            base,
        )
    }

    async fn room_with_items(engine: &CollaborationEngine, count: usize) -> Room {
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        for i in 0..count {
            engine
                .apply_operation(
                    &ctx(),
                    &room.id,
                    insert_op(&["items"], i, json!(format!("v{i}")), "seed", i as u64),
                )
                .await
                .unwrap();
        }
        room
    }

    #[tokio::test]
    async fn versions_count_accepted_operations() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        assert_eq!(room.version, 0);

        for i in 1..=4 {
            let applied = engine
                .apply_operation(
                    &ctx(),
                    &room.id,
                    set_op(&["n"], json!(i), "c1", (i - 1) as u64),
                )
                .await
                .unwrap();
            assert_eq!(applied.version, i as u64);
        }
    }

    #[tokio::test]
    async fn cross_org_room_access_is_forbidden() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        let foreign = TenantContext::for_org("o2");
        let err = engine.room_state(&foreign, &room.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_) | Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn concurrent_inserts_transform_and_order() {
        // Room at v=10; A and B both insert at index 2 against base 10.
        let engine = engine();
        let room = room_with_items(&engine, 10).await;

        let a = engine
            .apply_operation(&ctx(), &room.id, insert_op(&["items"], 2, json!("A"), "a", 10))
            .await
            .unwrap();
        assert_eq!(a.version, 11);
        assert!(!a.transformed);

        let b = engine
            .apply_operation(&ctx(), &room.id, insert_op(&["items"], 2, json!("B"), "b", 10))
            .await
            .unwrap();
        assert_eq!(b.version, 12);
        assert!(b.transformed);
        match b.operation.unwrap().kind {
            OperationKind::ArrayInsert { index, .. } => assert_eq!(index, 3),
            other => panic!("unexpected kind {other:?}"),
        }

        let state = engine.room_state(&ctx(), &room.id).await.unwrap().state;
        let items = state["items"].as_array().unwrap();
        assert_eq!(items[2], json!("A"));
        assert_eq!(items[3], json!("B"));
    }

    #[tokio::test]
    async fn stale_set_loses_lww_and_is_dropped() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();

        let mut winner = set_op(&["x"], json!("new"), "a", 0);
        winner.timestamp = 2000;
        engine.apply_operation(&ctx(), &room.id, winner).await.unwrap();

        let mut loser = set_op(&["x"], json!("old"), "b", 0);
        loser.timestamp = 1000;
        let applied = engine.apply_operation(&ctx(), &room.id, loser).await.unwrap();
        assert!(applied.dropped);
        // Dropped operations do not advance the version.
        assert_eq!(applied.version, 1);

        let state = engine.room_state(&ctx(), &room.id).await.unwrap().state;
        assert_eq!(state["x"], json!("new"));
    }

    #[tokio::test]
    async fn future_base_version_is_rejected() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        let err = engine
            .apply_operation(&ctx(), &room.id, set_op(&["x"], json!(1), "c", 99))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn snapshot_captures_state_at_version() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        for i in 0..5 {
            engine
                .apply_operation(&ctx(), &room.id, set_op(&["n"], json!(i), "c", i))
                .await
                .unwrap();
        }
        let snapshot = engine
            .create_snapshot(&ctx(), &room.id, None, Some("five".into()))
            .await
            .unwrap();
        assert_eq!(snapshot.version, 5);
        assert_eq!(snapshot.state["n"], json!(4));
        assert_eq!(snapshot.branch_name, MAIN_BRANCH);
    }

    #[tokio::test]
    async fn safe_revert_restores_state_and_counts_as_operation() {
        // S6: snapshot at v=5, ops to v=8, safe revert -> v=9, head moves.
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        for i in 0..5 {
            engine
                .apply_operation(&ctx(), &room.id, set_op(&["n"], json!(i), "c", i))
                .await
                .unwrap();
        }
        let snapshot = engine
            .create_snapshot(&ctx(), &room.id, None, None)
            .await
            .unwrap();
        for i in 5..8 {
            engine
                .apply_operation(&ctx(), &room.id, set_op(&["n"], json!(i), "c", i))
                .await
                .unwrap();
        }

        let reverted = engine
            .revert_to_snapshot(&ctx(), &room.id, &snapshot.id, RevertStrategy::Safe)
            .await
            .unwrap();
        assert_eq!(reverted.version, 9);
        assert_eq!(reverted.state, snapshot.state);

        let main = engine
            .store
            .get_branch(&OrgId::new("o1"), &room.id, MAIN_BRANCH)
            .await
            .unwrap();
        assert_eq!(main.head_snapshot_id.as_deref(), Some(snapshot.id.as_str()));
    }

    #[tokio::test]
    async fn force_revert_discards_span_operations() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        for i in 0..3 {
            engine
                .apply_operation(&ctx(), &room.id, set_op(&["n"], json!(i), "c", i))
                .await
                .unwrap();
        }
        let snapshot = engine
            .create_snapshot(&ctx(), &room.id, None, None)
            .await
            .unwrap();
        for i in 3..6 {
            engine
                .apply_operation(&ctx(), &room.id, set_op(&["n"], json!(i), "c", i))
                .await
                .unwrap();
        }

        engine
            .revert_to_snapshot(&ctx(), &room.id, &snapshot.id, RevertStrategy::Force)
            .await
            .unwrap();

        // An op based inside the discarded span is refused.
        let err = engine
            .apply_operation(&ctx(), &room.id, set_op(&["n"], json!(99), "c", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn snapshot_equals_fold_of_operations() {
        // Replaying the accepted operations up to the snapshot version
        // reproduces the snapshot state.
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        let ops = vec![
            set_op(&["a"], json!(1), "c", 0),
            insert_op(&["list"], 0, json!("x"), "c", 1),
            insert_op(&["list"], 1, json!("y"), "c", 2),
            set_op(&["b"], json!({"k": true}), "c", 3),
        ];
        let mut accepted = Vec::new();
        for op in ops {
            let applied = engine.apply_operation(&ctx(), &room.id, op).await.unwrap();
            accepted.push(applied.operation.unwrap());
        }
        let snapshot = engine
            .create_snapshot(&ctx(), &room.id, None, None)
            .await
            .unwrap();

        let mut folded = json!({});
        for op in &accepted {
            state::apply(&mut folded, op).unwrap();
        }
        assert_eq!(folded, snapshot.state);
    }

    #[tokio::test]
    async fn branch_create_and_list() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        engine
            .apply_operation(&ctx(), &room.id, set_op(&["a"], json!(1), "c", 0))
            .await
            .unwrap();
        let snapshot = engine
            .create_snapshot(&ctx(), &room.id, None, None)
            .await
            .unwrap();

        let branch = engine
            .create_branch(&ctx(), &room.id, &snapshot.id, "experiment")
            .await
            .unwrap();
        assert_eq!(branch.from_snapshot_id.as_deref(), Some(snapshot.id.as_str()));

        let names: Vec<String> = engine
            .list_branches(&ctx(), &room.id)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert!(names.contains(&"main".to_string()));
        assert!(names.contains(&"experiment".to_string()));

        // Reserved and duplicate names are rejected.
        assert!(engine
            .create_branch(&ctx(), &room.id, &snapshot.id, MAIN_BRANCH)
            .await
            .is_err());
        assert!(engine
            .create_branch(&ctx(), &room.id, &snapshot.id, "experiment")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn merge_into_itself_is_identity() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        engine
            .apply_operation(&ctx(), &room.id, set_op(&["a"], json!(1), "c", 0))
            .await
            .unwrap();
        engine.create_snapshot(&ctx(), &room.id, None, None).await.unwrap();

        let before = engine.room_state(&ctx(), &room.id).await.unwrap();
        let outcome = engine
            .merge_branches(&ctx(), &room.id, MAIN_BRANCH, MAIN_BRANCH, MergeStrategy::Auto)
            .await
            .unwrap();
        assert!(outcome.snapshot.is_none());
        assert!(outcome.conflicts.is_empty());
        let after = engine.room_state(&ctx(), &room.id).await.unwrap();
        assert_eq!(before.version, after.version);
        assert_eq!(before.state, after.state);
    }

    #[tokio::test]
    async fn auto_merge_applies_disjoint_changes() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        engine
            .apply_operation(&ctx(), &room.id, set_op(&["shared"], json!("base"), "c", 0))
            .await
            .unwrap();
        let base_snapshot = engine
            .create_snapshot(&ctx(), &room.id, None, None)
            .await
            .unwrap();
        engine
            .create_branch(&ctx(), &room.id, &base_snapshot.id, "feature")
            .await
            .unwrap();

        // main advances on a different field.
        engine
            .apply_operation(&ctx(), &room.id, set_op(&["main_only"], json!(1), "c", 1))
            .await
            .unwrap();
        engine.create_snapshot(&ctx(), &room.id, None, None).await.unwrap();

        // feature's head gains its own field.
        let feature_snapshot = Snapshot {
            id: "feat-snap".into(),
            room_id: room.id.clone(),
            branch_name: "feature".into(),
            state: json!({"shared": "base", "feature_only": true}),
            version: 2,
            description: None,
            created_at: Utc::now(),
        };
        engine
            .store
            .insert_snapshot(&OrgId::new("o1"), &feature_snapshot)
            .await
            .unwrap();
        let mut feature = engine
            .store
            .get_branch(&OrgId::new("o1"), &room.id, "feature")
            .await
            .unwrap();
        feature.head_snapshot_id = Some(feature_snapshot.id.clone());
        engine
            .store
            .upsert_branch(&OrgId::new("o1"), &feature)
            .await
            .unwrap();

        let outcome = engine
            .merge_branches(&ctx(), &room.id, "feature", MAIN_BRANCH, MergeStrategy::Auto)
            .await
            .unwrap();
        let snapshot = outcome.snapshot.unwrap();
        assert!(outcome.conflicts.is_empty());
        assert_eq!(snapshot.state["feature_only"], json!(true));
        assert_eq!(snapshot.state["main_only"], json!(1));
        assert_eq!(snapshot.state["shared"], json!("base"));

        // Merging into main updated the live document too.
        let live = engine.room_state(&ctx(), &room.id).await.unwrap();
        assert_eq!(live.state, snapshot.state);
    }

    #[tokio::test]
    async fn auto_merge_surfaces_field_conflicts() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        engine
            .apply_operation(&ctx(), &room.id, set_op(&["shared"], json!("base"), "c", 0))
            .await
            .unwrap();
        let base_snapshot = engine
            .create_snapshot(&ctx(), &room.id, None, None)
            .await
            .unwrap();
        engine
            .create_branch(&ctx(), &room.id, &base_snapshot.id, "feature")
            .await
            .unwrap();

        // Both sides rewrite the same field.
        engine
            .apply_operation(&ctx(), &room.id, set_op(&["shared"], json!("ours"), "c", 1))
            .await
            .unwrap();
        engine.create_snapshot(&ctx(), &room.id, None, None).await.unwrap();

        let feature_snapshot = Snapshot {
            id: "feat-snap".into(),
            room_id: room.id.clone(),
            branch_name: "feature".into(),
            state: json!({"shared": "theirs"}),
            version: 2,
            description: None,
            created_at: Utc::now(),
        };
        engine
            .store
            .insert_snapshot(&OrgId::new("o1"), &feature_snapshot)
            .await
            .unwrap();
        let mut feature = engine
            .store
            .get_branch(&OrgId::new("o1"), &room.id, "feature")
            .await
            .unwrap();
        feature.head_snapshot_id = Some(feature_snapshot.id.clone());
        engine
            .store
            .upsert_branch(&OrgId::new("o1"), &feature)
            .await
            .unwrap();

        let outcome = engine
            .merge_branches(&ctx(), &room.id, "feature", MAIN_BRANCH, MergeStrategy::Auto)
            .await
            .unwrap();
        assert!(outcome.snapshot.is_none());
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].path, "shared");
        assert_eq!(outcome.conflicts[0].ours, Some(json!("ours")));
        assert_eq!(outcome.conflicts[0].theirs, Some(json!("theirs")));

        // "theirs" resolves in favor of the source branch.
        let resolved = engine
            .merge_branches(&ctx(), &room.id, "feature", MAIN_BRANCH, MergeStrategy::Theirs)
            .await
            .unwrap();
        assert_eq!(resolved.snapshot.unwrap().state["shared"], json!("theirs"));
    }

    #[tokio::test]
    async fn compare_branches_reports_typed_differences() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        engine
            .apply_operation(
                &ctx(),
                &room.id,
                Operation::new(
                    OperationKind::ObjectMerge {
                        value: json!({"kept": 1, "changed": "a", "gone": true}),
                    },
                    vec![],
                    "c",
                    0,
                ),
            )
            .await
            .unwrap();
        let snapshot = engine
            .create_snapshot(&ctx(), &room.id, None, None)
            .await
            .unwrap();
        engine
            .create_branch(&ctx(), &room.id, &snapshot.id, "other")
            .await
            .unwrap();

        let other_snapshot = Snapshot {
            id: "other-head".into(),
            room_id: room.id.clone(),
            branch_name: "other".into(),
            state: json!({"kept": 1, "changed": "b", "fresh": 2}),
            version: 2,
            description: None,
            created_at: Utc::now(),
        };
        engine
            .store
            .insert_snapshot(&OrgId::new("o1"), &other_snapshot)
            .await
            .unwrap();
        let mut other = engine
            .store
            .get_branch(&OrgId::new("o1"), &room.id, "other")
            .await
            .unwrap();
        other.head_snapshot_id = Some(other_snapshot.id.clone());
        engine
            .store
            .upsert_branch(&OrgId::new("o1"), &other)
            .await
            .unwrap();

        let cmp = engine
            .compare_branches(&ctx(), &room.id, MAIN_BRANCH, "other")
            .await
            .unwrap();
        assert_eq!(cmp.summary.added, 1);
        assert_eq!(cmp.summary.removed, 1);
        assert_eq!(cmp.summary.modified, 1);

        let changed = cmp
            .differences
            .iter()
            .find(|d| d.path == "changed")
            .unwrap();
        assert_eq!(changed.kind, DiffKind::Modified);
        assert_eq!(changed.severity, DiffSeverity::Medium);
        let gone = cmp.differences.iter().find(|d| d.path == "gone").unwrap();
        assert_eq!(gone.kind, DiffKind::Removed);
        assert_eq!(gone.severity, DiffSeverity::High);
    }

    #[tokio::test]
    async fn timeline_orders_snapshots_by_version() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        for i in 0..3 {
            engine
                .apply_operation(&ctx(), &room.id, set_op(&["n"], json!(i), "c", i))
                .await
                .unwrap();
            engine
                .create_snapshot(&ctx(), &room.id, None, Some(format!("v{}", i + 1)))
                .await
                .unwrap();
        }
        let timeline = engine.timeline(&ctx(), &room.id).await.unwrap();
        let versions: Vec<u64> = timeline.iter().map(|t| t.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn presence_join_and_leave() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        let members = engine.join_room(&ctx(), &room.id, "u1").await.unwrap();
        assert_eq!(members, vec!["u1".to_string()]);
        engine.join_room(&ctx(), &room.id, "u2").await.unwrap();
        assert_eq!(engine.participants(&room.id).len(), 2);
        engine.leave_room(&ctx(), &room.id, "u1").await.unwrap();
        assert_eq!(engine.participants(&room.id), vec!["u2".to_string()]);
    }

    #[tokio::test]
    async fn op_log_receives_applied_operations() {
        let engine = engine();
        let room = engine.get_or_create_room(&ctx(), "doc", None).await.unwrap();
        engine
            .apply_operation(&ctx(), &room.id, set_op(&["a"], json!(1), "c", 0))
            .await
            .unwrap();

        let key = op_log_key(&OrgId::new("o1"), &room.id);
        let entries = engine.log.read(&key, "0", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("type"), Some("operation"));
        assert_eq!(entries[0].field("version"), Some("1"));
    }
}
