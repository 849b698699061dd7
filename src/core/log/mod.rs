//! Append-only per-channel event log with consumer groups.
//!
//! The log speaks Redis-Streams semantics: entry ids are `millis-seq`
//! strings that are strictly monotonic per key, grouped reads are
//! at-least-once with pending entries surviving crashes, and trimming is
//! approximate. [`MemoryLog`] reproduces the same semantics in-process so
//! the two implementations are interchangeable in tests.
//!
//! Stream keys follow the convention `events:{orgId}:{channel}`.

mod memory;
mod redis_log;

pub use memory::MemoryLog;
pub use redis_log::RedisLog;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::core::domain::{ChannelName, OrgId};
use crate::error::{Error, Result};

/// Default per-channel trim threshold.
pub const DEFAULT_TRIM_LEN: usize = 1000;

/// Stream key for a tenant channel.
#[must_use]
pub fn stream_key(org: &OrgId, channel: &ChannelName) -> String {
    format!("events:{org}:{channel}")
}

/// One log entry: the id assigned on append plus its field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl LogEntry {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Parse a `millis-seq` entry id into its ordered parts.
///
/// A bare number is accepted with an implied `-0` sequence, matching Redis.
pub fn parse_entry_id(id: &str) -> Result<(u64, u64)> {
    let (ms, seq) = match id.split_once('-') {
        Some((ms, seq)) => (ms, seq),
        None => (id, "0"),
    };
    let ms = ms
        .parse::<u64>()
        .map_err(|_| Error::Validation(format!("bad entry id '{id}'")))?;
    let seq = seq
        .parse::<u64>()
        .map_err(|_| Error::Validation(format!("bad entry id '{id}'")))?;
    Ok((ms, seq))
}

/// Strict ordering over entry ids; invalid ids sort first.
#[must_use]
pub fn entry_id_after(id: &str, than: &str) -> bool {
    match (parse_entry_id(id), parse_entry_id(than)) {
        (Ok(a), Ok(b)) => a > b,
        _ => false,
    }
}

/// Append-only log per channel key.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append fields to `key`, returning the assigned entry id.
    ///
    /// When `max_len` is set the stream is trimmed approximately
    /// (Redis `MAXLEN ~`).
    async fn append(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String>;

    /// Forward read of up to `count` entries with ids strictly after
    /// `after`. Pass `"0"` to read from the beginning.
    async fn read(&self, key: &str, after: &str, count: usize) -> Result<Vec<LogEntry>>;

    /// Competing-consumer read. Un-acked entries previously delivered to
    /// this consumer are re-delivered first, then new entries. Blocks up
    /// to `block_ms` when nothing is available.
    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>>;

    /// Acknowledge an entry for a group.
    async fn ack(&self, key: &str, group: &str, entry_id: &str) -> Result<()>;

    /// Create a consumer group starting at `start_id`. Idempotent: an
    /// already-existing group is not an error.
    async fn create_group(&self, key: &str, group: &str, start_id: &str) -> Result<()>;

    /// Current entry count for `key`.
    async fn len(&self, key: &str) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_key_convention() {
        let channel = ChannelName::parse("org:o1:chat").unwrap();
        assert_eq!(stream_key(&OrgId::new("o1"), &channel), "events:o1:org:o1:chat");
    }

    #[test]
    fn entry_ids_parse_and_order() {
        assert_eq!(parse_entry_id("123-4").unwrap(), (123, 4));
        assert_eq!(parse_entry_id("123").unwrap(), (123, 0));
        assert!(parse_entry_id("x-1").is_err());

        assert!(entry_id_after("2-0", "1-9"));
        assert!(entry_id_after("1-10", "1-9"));
        assert!(!entry_id_after("1-9", "1-9"));
        assert!(entry_id_after("1-0", "0"));
    }
}
