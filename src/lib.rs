//! AxonPuls - multi-tenant real-time messaging and collaboration server.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── core/             # Reusable library components
//! │   ├── domain/       # Tenants, sessions, channels, events, rooms, nodes
//! │   ├── store/        # Durable state behind an opaque trait
//! │   ├── log/          # Append-only per-channel streams with groups
//! │   ├── kv/           # Counters, hashes, sets, cross-node pub/sub
//! │   ├── auth/         # Credential extraction + tenant validation
//! │   ├── limiter/      # Sliding-window and burst rate limits
//! │   ├── connection/   # Session lifecycle, heartbeat, reconnection
//! │   ├── router/       # Room membership and outbound filtering
//! │   ├── registry/     # Distributed node registry and placement
//! │   ├── collab/       # OT rooms, snapshots, branches, merges
//! │   └── health/       # EMA metrics and typed alerts
//! ├── gateway/          # WebSocket admission, dispatch, backpressure
//! ├── http/             # Collaboration REST surface + replay + healthz
//! └── app/              # Configuration and the process root
//! ```

pub mod app;
pub mod cli;
pub mod core;
pub mod error;
pub mod gateway;
pub mod http;
