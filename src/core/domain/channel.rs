//! Tenant-scoped channel names.
//!
//! Channel names carry the isolation token as a prefix: `org:<orgId>:<rest>`.
//! The prefix check is enforced everywhere a channel is touched.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::OrgId;
use crate::error::{Error, Result};

/// A validated channel name of the form `org:<orgId>:<rest>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    /// Parse and validate a raw channel name.
    ///
    /// The accepted grammar is `^org:[A-Za-z0-9_-]+:[^\s]+$`.
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix("org:")
            .ok_or_else(|| Error::Validation(format!("channel '{raw}' missing org prefix")))?;

        let (org, suffix) = rest
            .split_once(':')
            .ok_or_else(|| Error::Validation(format!("channel '{raw}' missing topic segment")))?;

        if org.is_empty()
            || !org
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::Validation(format!(
                "channel '{raw}' has invalid org segment"
            )));
        }
        if suffix.is_empty() || suffix.chars().any(char::is_whitespace) {
            return Err(Error::Validation(format!(
                "channel '{raw}' has invalid topic segment"
            )));
        }

        Ok(Self(raw.to_string()))
    }

    /// The org segment of the name.
    #[must_use]
    pub fn org_id(&self) -> OrgId {
        // Validated at construction: org: prefix and a second ':' both exist.
        let rest = &self.0["org:".len()..];
        let end = rest.find(':').unwrap_or(rest.len());
        OrgId::new(&rest[..end])
    }

    /// True when the channel is scoped to the given org.
    #[must_use]
    pub fn belongs_to(&self, org: &OrgId) -> bool {
        self.0.starts_with(&format!("org:{org}:"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered channel row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub name: ChannelName,
    pub organization_id: OrgId,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(name: ChannelName) -> Self {
        let organization_id = name.org_id();
        Self {
            name,
            organization_id,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_names() {
        let c = ChannelName::parse("org:o1:chat").unwrap();
        assert_eq!(c.org_id(), OrgId::new("o1"));
        assert!(c.belongs_to(&OrgId::new("o1")));
        assert!(!c.belongs_to(&OrgId::new("o2")));
    }

    #[test]
    fn accepts_nested_topics() {
        let c = ChannelName::parse("org:acme-prod:rooms/42/presence").unwrap();
        assert_eq!(c.org_id(), OrgId::new("acme-prod"));
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(ChannelName::parse("chat").is_err());
        assert!(ChannelName::parse("user:u1:chat").is_err());
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(ChannelName::parse("org::chat").is_err());
        assert!(ChannelName::parse("org:o1:").is_err());
        assert!(ChannelName::parse("org:o1").is_err());
    }

    #[test]
    fn rejects_whitespace_and_bad_org_chars() {
        assert!(ChannelName::parse("org:o1:ch at").is_err());
        assert!(ChannelName::parse("org:o 1:chat").is_err());
        assert!(ChannelName::parse("org:o#1:chat").is_err());
    }

    #[test]
    fn org_prefix_match_is_exact_not_substring() {
        // "o1" must not match a channel scoped to "o10".
        let c = ChannelName::parse("org:o10:chat").unwrap();
        assert!(!c.belongs_to(&OrgId::new("o1")));
    }
}
