use super::keys::{RouteKey, SessionId, VisitorId};
use serde::{Deserialize, Serialize};

/// An interaction as the embedding application hands it over, before
/// classification.
#[derive(Debug, Clone)]
pub struct RawInteraction {
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub kind: RawKind,
}

#[derive(Debug, Clone)]
pub enum RawKind {
    PageView { path: String },
    QrGenerated { category: String },
    Custom { name: String, properties: serde_json::Value },
}

impl RawInteraction {
    pub fn page_view(host: Option<&str>, user_agent: Option<&str>, path: &str) -> Self {
        Self {
            host: host.map(|v| v.to_string()),
            user_agent: user_agent.map(|v| v.to_string()),
            kind: RawKind::PageView { path: path.to_string() },
        }
    }

    pub fn qr_generated(host: Option<&str>, user_agent: Option<&str>, category: &str) -> Self {
        Self {
            host: host.map(|v| v.to_string()),
            user_agent: user_agent.map(|v| v.to_string()),
            kind: RawKind::QrGenerated { category: category.to_string() },
        }
    }

    pub fn custom(
        host: Option<&str>,
        user_agent: Option<&str>,
        name: &str,
        properties: serde_json::Value,
    ) -> Self {
        Self {
            host: host.map(|v| v.to_string()),
            user_agent: user_agent.map(|v| v.to_string()),
            kind: RawKind::Custom { name: name.to_string(), properties },
        }
    }
}

/// Why an event was refused by policy. Suppressed events are a normal
/// outcome, not an error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    OperatorOptOut,
    LoopbackHost,
    BotUserAgent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    RouteView { route: RouteKey },
    Generation { category: String },
    Custom { name: String, properties: serde_json::Value },
}

/// Classifier output: identity stamped, suppression decided, route
/// sanitized. Ephemeral; never persisted as-is.
#[derive(Debug, Clone)]
pub struct ClassifiedEvent {
    pub visitor_id: Option<VisitorId>,
    pub session_id: Option<SessionId>,
    pub kind: EventKind,
    pub suppression: Option<SuppressReason>,
}

impl ClassifiedEvent {
    pub fn is_suppressed(&self) -> bool {
        self.suppression.is_some()
    }
}

/// One item of a grouped write. Carries the raw route path; the writer
/// sanitizes on ingest just as it does for single events.
#[derive(Debug, Clone)]
pub struct BatchEvent {
    pub kind: BatchKind,
    pub visitor: Option<VisitorId>,
    pub suppression: Option<SuppressReason>,
}

#[derive(Debug, Clone)]
pub enum BatchKind {
    RouteView { path: String },
    Generation { category: String },
}

impl BatchEvent {
    pub fn route_view(path: &str, visitor: Option<VisitorId>) -> Self {
        Self {
            kind: BatchKind::RouteView { path: path.to_string() },
            visitor,
            suppression: None,
        }
    }

    pub fn generation(category: &str, visitor: Option<VisitorId>) -> Self {
        Self {
            kind: BatchKind::Generation { category: category.to_string() },
            visitor,
            suppression: None,
        }
    }

    pub fn suppressed(mut self, reason: SuppressReason) -> Self {
        self.suppression = Some(reason);
        self
    }
}
