//! Core domain types for axonpuls.
//!
//! ## Tenancy
//!
//! - [`Organization`] - A tenant with resource limits
//! - [`TenantContext`] - Validated (org, user?, roles, permissions) bundle
//!
//! ## Sessions
//!
//! - [`Connection`] - A socket session with heartbeat bookkeeping
//! - [`ConnectionStatus`] / [`ConnectionQuality`] - Lifecycle and network classification
//!
//! ## Messaging
//!
//! - [`ChannelName`] - Tenant-scoped topic `org:<orgId>:<rest>`
//! - [`Event`] - Immutable log entry carried over a channel
//!
//! ## Collaboration
//!
//! - [`Room`] - Versioned collaborative document
//! - [`Operation`] - Structural edit subject to OT
//! - [`Snapshot`] / [`Branch`] - Immutable captures and their lineages
//!
//! ## Cluster
//!
//! - [`ServerNode`] - One fleet member in the shared registry
//!
//! ## Identifier Types
//!
//! - [`OrgId`], [`UserId`], [`SessionId`], [`RoomId`], [`NodeId`]

mod audit;
mod channel;
mod connection;
mod event;
mod id;
mod node;
mod room;
mod tenant;

pub use audit::{AuditAction, AuditRecord};
pub use channel::{Channel, ChannelName};
pub use connection::{ClientType, Connection, ConnectionQuality, ConnectionStatus};
pub use event::{DeliveryGuarantee, Event, MAX_PAYLOAD_BYTES};
pub use id::{NodeId, OrgId, RoomId, SessionId, UserId};
pub use node::{NodeStatus, ServerNode};
pub use room::{
    Branch, ConflictResolution, MergeStrategy, Operation, OperationKind, RevertStrategy, Room,
    RoomConfig, Snapshot, MAIN_BRANCH,
};
pub use tenant::{OrgLimits, Organization, TenantContext};
