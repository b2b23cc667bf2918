use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// The four record collections the admin dashboard reconciles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Users,
    Posts,
    Analytics,
    Seo,
}

impl Domain {
    pub const ALL: [Domain; 4] = [Domain::Users, Domain::Posts, Domain::Analytics, Domain::Seo];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Users => "users",
            Domain::Posts => "posts",
            Domain::Analytics => "analytics",
            Domain::Seo => "seo",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dashboard row. The engine treats record fields as opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminRecord {
    pub id: String,
    #[serde(default)]
    pub fields: serde_json::Value,
}

impl AdminRecord {
    pub fn new(id: impl Into<String>, fields: serde_json::Value) -> Self {
        Self { id: id.into(), fields }
    }
}

/// Per-domain slice: last-good data, in-flight flag, last error, and ids
/// removed optimistically but not yet confirmed by a server read.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DomainState {
    pub data: Option<Vec<AdminRecord>>,
    pub loading: bool,
    pub error: Option<String>,
    pub pending_removals: HashSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DashboardState {
    pub users: DomainState,
    pub posts: DomainState,
    pub analytics: DomainState,
    pub seo: DomainState,
    pub refreshing: bool,
    pub last_refresh_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum DashboardEvent {
    FetchStarted { domain: Domain },
    FetchSucceeded { domain: Domain, records: Vec<AdminRecord> },
    FetchFailed { domain: Domain, message: String },
    RecordRemoved { domain: Domain, id: String },
    PushReplaced { domain: Domain, records: Vec<AdminRecord> },
    SubscriptionLost { domain: Domain, message: String },
    RefreshAllStarted,
    RefreshAllSettled { at_ms: i64 },
    Reset,
}

impl DashboardState {
    pub fn domain(&self, domain: Domain) -> &DomainState {
        match domain {
            Domain::Users => &self.users,
            Domain::Posts => &self.posts,
            Domain::Analytics => &self.analytics,
            Domain::Seo => &self.seo,
        }
    }

    fn domain_mut(&mut self, domain: Domain) -> &mut DomainState {
        match domain {
            Domain::Users => &mut self.users,
            Domain::Posts => &mut self.posts,
            Domain::Analytics => &mut self.analytics,
            Domain::Seo => &mut self.seo,
        }
    }

    /// The whole transition function. A failure in one domain only ever
    /// touches that domain's slice; fresh server data (fetch or push)
    /// clears the optimistic-removal tags for its domain.
    pub fn apply(&mut self, event: DashboardEvent) {
        match event {
            DashboardEvent::FetchStarted { domain } => {
                let slice = self.domain_mut(domain);
                slice.loading = true;
                slice.error = None;
            }
            DashboardEvent::FetchSucceeded { domain, records } => {
                let slice = self.domain_mut(domain);
                slice.data = Some(records);
                slice.loading = false;
                slice.error = None;
                slice.pending_removals.clear();
            }
            DashboardEvent::FetchFailed { domain, message } => {
                let slice = self.domain_mut(domain);
                slice.loading = false;
                slice.error = Some(message);
            }
            DashboardEvent::RecordRemoved { domain, id } => {
                let slice = self.domain_mut(domain);
                if let Some(data) = slice.data.as_mut() {
                    data.retain(|record| record.id != id);
                }
                slice.pending_removals.insert(id);
            }
            DashboardEvent::PushReplaced { domain, records } => {
                // Last write wins by arrival order. No staleness comparison.
                let slice = self.domain_mut(domain);
                slice.data = Some(records);
                slice.pending_removals.clear();
            }
            DashboardEvent::SubscriptionLost { domain, message } => {
                let slice = self.domain_mut(domain);
                slice.error = Some(message);
            }
            DashboardEvent::RefreshAllStarted => {
                self.refreshing = true;
            }
            DashboardEvent::RefreshAllSettled { at_ms } => {
                self.refreshing = false;
                self.last_refresh_ms = Some(at_ms);
            }
            DashboardEvent::Reset => {
                *self = DashboardState::default();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(ids: &[&str]) -> Vec<AdminRecord> {
        ids.iter().map(|id| AdminRecord::new(*id, json!({}))).collect()
    }

    #[test]
    fn fetch_failure_keeps_last_good_data() {
        let mut state = DashboardState::default();
        state.apply(DashboardEvent::FetchSucceeded {
            domain: Domain::Posts,
            records: records(&["p1", "p2"]),
        });
        state.apply(DashboardEvent::FetchFailed {
            domain: Domain::Posts,
            message: "backend down".to_string(),
        });

        let posts = state.domain(Domain::Posts);
        assert_eq!(posts.data.as_ref().map(|d| d.len()), Some(2));
        assert_eq!(posts.error.as_deref(), Some("backend down"));
        assert!(!posts.loading);
    }

    #[test]
    fn fetch_failure_never_touches_other_domains() {
        let mut state = DashboardState::default();
        state.apply(DashboardEvent::FetchSucceeded {
            domain: Domain::Users,
            records: records(&["u1"]),
        });
        state.apply(DashboardEvent::FetchFailed {
            domain: Domain::Seo,
            message: "timeout".to_string(),
        });

        assert_eq!(state.domain(Domain::Users).data.as_ref().map(|d| d.len()), Some(1));
        assert!(state.domain(Domain::Users).error.is_none());
    }

    #[test]
    fn record_removed_is_synchronous_and_tagged() {
        let mut state = DashboardState::default();
        state.apply(DashboardEvent::FetchSucceeded {
            domain: Domain::Posts,
            records: records(&["p1", "p2"]),
        });
        state.apply(DashboardEvent::RecordRemoved {
            domain: Domain::Posts,
            id: "p1".to_string(),
        });

        let posts = state.domain(Domain::Posts);
        assert_eq!(posts.data.as_ref().map(|d| d.len()), Some(1));
        assert!(posts.pending_removals.contains("p1"));
    }

    #[test]
    fn fresh_fetch_clears_pending_removals() {
        let mut state = DashboardState::default();
        state.apply(DashboardEvent::FetchSucceeded {
            domain: Domain::Posts,
            records: records(&["p1"]),
        });
        state.apply(DashboardEvent::RecordRemoved {
            domain: Domain::Posts,
            id: "p1".to_string(),
        });
        // Server never saw the delete; the next read brings the row back.
        state.apply(DashboardEvent::FetchSucceeded {
            domain: Domain::Posts,
            records: records(&["p1"]),
        });

        let posts = state.domain(Domain::Posts);
        assert_eq!(posts.data.as_ref().map(|d| d.len()), Some(1));
        assert!(posts.pending_removals.is_empty());
    }

    #[test]
    fn push_replaces_wholesale() {
        let mut state = DashboardState::default();
        state.apply(DashboardEvent::PushReplaced {
            domain: Domain::Analytics,
            records: records(&["2025-01-01"]),
        });
        state.apply(DashboardEvent::PushReplaced {
            domain: Domain::Analytics,
            records: records(&["2025-01-02"]),
        });

        let analytics = state.domain(Domain::Analytics);
        let ids: Vec<&str> = analytics
            .data
            .as_ref()
            .map(|d| d.iter().map(|r| r.id.as_str()).collect())
            .unwrap_or_default();
        assert_eq!(ids, vec!["2025-01-02"]);
    }

    #[test]
    fn refresh_cycle_stamps_last_refresh() {
        let mut state = DashboardState::default();
        state.apply(DashboardEvent::RefreshAllStarted);
        assert!(state.refreshing);

        state.apply(DashboardEvent::RefreshAllSettled { at_ms: 1_700_000_000_000 });
        assert!(!state.refreshing);
        assert_eq!(state.last_refresh_ms, Some(1_700_000_000_000));
    }

    #[test]
    fn reset_returns_to_default() {
        let mut state = DashboardState::default();
        state.apply(DashboardEvent::FetchSucceeded {
            domain: Domain::Users,
            records: records(&["u1"]),
        });
        state.apply(DashboardEvent::Reset);
        assert_eq!(state, DashboardState::default());
    }
}
