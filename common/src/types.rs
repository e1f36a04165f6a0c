use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the collection holding settled posts.
pub const POSTS: &str = "posts";
/// Name of the collection holding settled followers.
pub const FOLLOWERS: &str = "followers";

/// One of the two tracked partitions. Each maps to exactly one collection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Statuses carrying the tracked hashtag. Action: reblog.
    Posts,
    /// Accounts following the bot. Action: follow back.
    Followers,
}

impl Domain {
    /// Scheduling order of one driver pass.
    pub const ALL: [Domain; 2] = [Domain::Posts, Domain::Followers];

    pub fn collection(self) -> &'static str {
        match self {
            Domain::Posts => POSTS,
            Domain::Followers => FOLLOWERS,
        }
    }

    /// Whether snapshots of this domain are ordered by remote id, so that a
    /// "newer than" cursor can bound the next fetch.
    pub fn uses_cursor(self) -> bool {
        matches!(self, Domain::Posts)
    }

    /// Key of this domain's cursor in the store's default keyspace.
    pub fn cursor_key(self) -> String {
        format!("cursor/{}", self.collection())
    }

    /// Prefix of this domain's parked items in the store's default keyspace.
    /// The item's marker follows it.
    pub fn retry_prefix(self) -> String {
        format!("retry/{}/", self.collection())
    }

    pub fn action(self) -> &'static str {
        match self {
            Domain::Posts => "reblog",
            Domain::Followers => "follow",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown domain '{0}' (expected posts or followers)")]
pub struct UnknownDomain(pub String);

impl FromStr for Domain {
    type Err = UnknownDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            POSTS => Ok(Domain::Posts),
            FOLLOWERS => Ok(Domain::Followers),
            other => Err(UnknownDomain(other.to_string())),
        }
    }
}

/// A remote entity subject to dedup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrackedItem {
    /// Canonical URL. The dedup key.
    pub key: String,
    /// Remote-assigned id. Stored as the collection value and passed to the
    /// action call, never compared.
    pub marker: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl TrackedItem {
    pub fn new(key: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            marker: marker.into(),
            created_at: None,
        }
    }
}

/// Result of one fetch. Unordered and only meaningful within one cycle.
pub type Snapshot = Vec<TrackedItem>;

/// Orders remote ids. Mastodon ids are decimal strings of varying length, so
/// a longer id is always the newer one.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_round_trips_through_its_collection_name() {
        for domain in Domain::ALL {
            assert_eq!(domain.collection().parse::<Domain>(), Ok(domain));
        }
        assert_eq!(" Followers ".parse::<Domain>(), Ok(Domain::Followers));
        assert!("boosts".parse::<Domain>().is_err());
    }

    #[test]
    fn only_posts_carry_a_cursor() {
        assert!(Domain::Posts.uses_cursor());
        assert!(!Domain::Followers.uses_cursor());
        assert_eq!(Domain::Posts.cursor_key(), "cursor/posts");
        assert_eq!(Domain::Posts.retry_prefix(), "retry/posts/");
    }

    #[test]
    fn unknown_domain_names_the_input() {
        let err = "boosts".parse::<Domain>().unwrap_err();
        assert_eq!(err, UnknownDomain("boosts".into()));
        assert_eq!(
            err.to_string(),
            "unknown domain 'boosts' (expected posts or followers)"
        );
    }

    #[test]
    fn ids_compare_numerically() {
        assert_eq!(compare_ids("9", "10"), Ordering::Less);
        assert_eq!(compare_ids("109876", "109875"), Ordering::Greater);
        assert_eq!(compare_ids("42", "42"), Ordering::Equal);
    }

    #[test]
    fn domain_serializes_lowercase() {
        let json = serde_json::to_string(&Domain::Followers).unwrap();
        assert_eq!(json, "\"followers\"");
    }
}
