use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Calendar-day key for aggregate documents, rendered `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DayKey(NaiveDate);

impl DayKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn as_date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // NaiveDate renders ISO `YYYY-MM-DD`, the canonical document key.
        write!(f, "{}", self.0)
    }
}

impl FromStr for DayKey {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(NaiveDate::from_str(s)?))
    }
}

/// Sanitized route token, safe to use as a counter field key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RouteKey(String);

impl RouteKey {
    /// Collapses a URL path into a flat field key: lowercase, `/` separators
    /// become `_`, anything outside `[a-z0-9_-]` is dropped. An empty result
    /// (e.g. `/`) becomes `root`.
    pub fn sanitize(path: &str) -> Self {
        let mut out = String::with_capacity(path.len());
        for segment in path.trim().to_lowercase().split('/') {
            let mut cleaned = String::with_capacity(segment.len());
            for ch in segment.chars() {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    cleaned.push(ch);
                }
            }
            if cleaned.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('_');
            }
            out.push_str(&cleaned);
        }

        if out.is_empty() {
            out.push_str("root");
        }
        Self(out)
    }

    pub(crate) fn raw(key: String) -> Self {
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque per-device identity. The unit of uniqueness for visit counting;
/// anonymous devices carry one too.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct VisitorId(String);

impl VisitorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VisitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-browsing-session identity. Diagnostic only, never used for dedup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which collection an aggregate document belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Visitor(VisitorId),
}

impl Scope {
    /// Stable string form used by keyed storage backends.
    pub fn as_token(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Visitor(id) => format!("visitor:{}", id.as_str()),
        }
    }
}

/// Address of one aggregate document: a scope plus a calendar day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DocKey {
    pub scope: Scope,
    pub day: DayKey,
}

impl DocKey {
    pub fn global(day: DayKey) -> Self {
        Self {
            scope: Scope::Global,
            day,
        }
    }

    pub fn visitor(id: VisitorId, day: DayKey) -> Self {
        Self {
            scope: Scope::Visitor(id),
            day,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_key_renders_iso_date() {
        let day: DayKey = "2025-01-01".parse().unwrap();
        assert_eq!(day.to_string(), "2025-01-01");
    }

    #[test]
    fn day_key_rejects_garbage() {
        assert!("not-a-date".parse::<DayKey>().is_err());
        assert!("2025-13-40".parse::<DayKey>().is_err());
    }

    #[test]
    fn sanitize_keeps_plain_routes() {
        assert_eq!(RouteKey::sanitize("/generate").as_str(), "generate");
        assert_eq!(RouteKey::sanitize("/blog/post-1").as_str(), "blog_post-1");
    }

    #[test]
    fn sanitize_collapses_empty_to_root() {
        assert_eq!(RouteKey::sanitize("/").as_str(), "root");
        assert_eq!(RouteKey::sanitize("").as_str(), "root");
        assert_eq!(RouteKey::sanitize("///").as_str(), "root");
    }

    #[test]
    fn sanitize_drops_illegal_characters() {
        assert_eq!(RouteKey::sanitize("/Blog/Post?id=1").as_str(), "blog_postid1");
        assert_eq!(RouteKey::sanitize("/a b/c.d").as_str(), "ab_cd");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = RouteKey::sanitize("/Blog/Post-1");
        let twice = RouteKey::sanitize(once.as_str());
        assert_eq!(once, twice);
    }

    #[test]
    fn scope_tokens_are_distinct() {
        let a = Scope::Global.as_token();
        let b = Scope::Visitor(VisitorId::new("v1")).as_token();
        assert_ne!(a, b);
        assert_eq!(b, "visitor:v1");
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(VisitorId::random(), VisitorId::random());
    }
}
