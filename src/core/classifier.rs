use crate::config::{AnalyticsConfig, RuntimeEnv};
use crate::core::client_storage::{ClientStorage, StorageScope};
use crate::models::event::{ClassifiedEvent, EventKind, RawInteraction, RawKind, SuppressReason};
use crate::models::keys::{RouteKey, SessionId, VisitorId};
use std::sync::Arc;
use tracing::debug;

const VISITOR_ID_KEY: &str = "qr_visitor_id";
const SESSION_ID_KEY: &str = "qr_session_id";
const OPT_OUT_KEY: &str = "qr_analytics_opt_out";

const BOT_MARKERS: [&str; 6] = ["bot", "crawler", "spider", "headless", "lighthouse", "prerender"];

/// Decides whether an interaction counts and stamps it with identity.
/// Classification never fails; a degraded client storage only costs id
/// stability, never the event.
pub struct EventClassifier {
    storage: Arc<dyn ClientStorage>,
    env: RuntimeEnv,
    extra_bot_markers: Vec<String>,
}

impl EventClassifier {
    pub fn new(storage: Arc<dyn ClientStorage>, config: &AnalyticsConfig) -> Self {
        Self {
            storage,
            env: config.env,
            extra_bot_markers: config
                .extra_bot_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
        }
    }

    pub fn classify(&self, raw: &RawInteraction) -> ClassifiedEvent {
        let suppression = self.suppression_for(raw);
        if let Some(reason) = suppression {
            debug!(?reason, "event suppressed");
        }

        let kind = match &raw.kind {
            RawKind::PageView { path } => EventKind::RouteView {
                route: RouteKey::sanitize(path),
            },
            RawKind::QrGenerated { category } => EventKind::Generation {
                category: category.trim().to_string(),
            },
            RawKind::Custom { name, properties } => EventKind::Custom {
                name: name.clone(),
                properties: properties.clone(),
            },
        };

        ClassifiedEvent {
            visitor_id: Some(self.visitor_id()),
            session_id: Some(self.session_id()),
            kind,
            suppression,
        }
    }

    /// Flags the operating device so its traffic is excluded from
    /// production aggregates.
    pub fn set_operator_opt_out(&self, opt_out: bool) {
        if opt_out {
            self.storage.put(StorageScope::Durable, OPT_OUT_KEY, "true");
        } else {
            self.storage.remove(StorageScope::Durable, OPT_OUT_KEY);
        }
    }

    // First matching reason wins: operator flag, then host, then agent.
    fn suppression_for(&self, raw: &RawInteraction) -> Option<SuppressReason> {
        if self.env == RuntimeEnv::Production && self.operator_opted_out() {
            return Some(SuppressReason::OperatorOptOut);
        }

        if raw
            .host
            .as_deref()
            .map(is_loopback_host)
            .unwrap_or(false)
        {
            return Some(SuppressReason::LoopbackHost);
        }

        if raw
            .user_agent
            .as_deref()
            .map(|ua| self.is_bot(ua))
            .unwrap_or(false)
        {
            return Some(SuppressReason::BotUserAgent);
        }

        None
    }

    fn operator_opted_out(&self) -> bool {
        matches!(
            self.storage
                .get(StorageScope::Durable, OPT_OUT_KEY)
                .as_deref(),
            Some("true") | Some("1")
        )
    }

    fn is_bot(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_lowercase();
        BOT_MARKERS.iter().any(|marker| ua.contains(marker))
            || self
                .extra_bot_markers
                .iter()
                .any(|marker| ua.contains(marker.as_str()))
    }

    fn visitor_id(&self) -> VisitorId {
        if let Some(existing) = self.storage.get(StorageScope::Durable, VISITOR_ID_KEY) {
            return VisitorId::new(existing);
        }

        let id = VisitorId::random();
        if !self.storage.put(StorageScope::Durable, VISITOR_ID_KEY, id.as_str()) {
            // Ephemeral id: the event still lands, but the next call gets a
            // fresh one, so unique counts can run high while degraded.
            debug!("client storage unavailable, visitor id is ephemeral");
        }
        id
    }

    fn session_id(&self) -> SessionId {
        if let Some(existing) = self.storage.get(StorageScope::Session, SESSION_ID_KEY) {
            return SessionId::new(existing);
        }

        let id = SessionId::random();
        self.storage.put(StorageScope::Session, SESSION_ID_KEY, id.as_str());
        id
    }
}

fn is_loopback_host(host: &str) -> bool {
    let h = host.trim().to_lowercase();
    if h == "localhost" || h == "127.0.0.1" || h == "::1" {
        return true;
    }
    if let Some(rest) = h.strip_prefix("[::1]") {
        return rest.is_empty() || rest.starts_with(':');
    }

    let without_port = h.split(':').next().unwrap_or("");
    without_port == "localhost" || without_port == "127.0.0.1"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client_storage::MemoryClientStorage;

    fn classifier(env: RuntimeEnv) -> (Arc<MemoryClientStorage>, EventClassifier) {
        let storage = Arc::new(MemoryClientStorage::new());
        let config = AnalyticsConfig {
            env,
            ..AnalyticsConfig::default()
        };
        let classifier = EventClassifier::new(storage.clone(), &config);
        (storage, classifier)
    }

    fn page_view(host: Option<&str>, user_agent: Option<&str>) -> RawInteraction {
        RawInteraction::page_view(host, user_agent, "/generate")
    }

    #[test]
    fn clean_traffic_is_not_suppressed() {
        let (_, classifier) = classifier(RuntimeEnv::Production);
        let event = classifier.classify(&page_view(Some("qr.example.com"), Some("Mozilla/5.0")));
        assert!(!event.is_suppressed());
        assert!(event.visitor_id.is_some());
        assert!(event.session_id.is_some());
    }

    #[test]
    fn loopback_hosts_are_suppressed() {
        let (_, classifier) = classifier(RuntimeEnv::Production);
        for host in ["localhost", "localhost:3000", "127.0.0.1", "127.0.0.1:8080", "::1", "[::1]:3000"] {
            let event = classifier.classify(&page_view(Some(host), Some("Mozilla/5.0")));
            assert_eq!(event.suppression, Some(SuppressReason::LoopbackHost), "host {}", host);
        }
    }

    #[test]
    fn bot_agents_are_suppressed_case_insensitively() {
        let (_, classifier) = classifier(RuntimeEnv::Production);
        for ua in ["Googlebot/2.1", "my-CRAWLER", "HeadlessChrome", "Chrome-Lighthouse"] {
            let event = classifier.classify(&page_view(Some("qr.example.com"), Some(ua)));
            assert_eq!(event.suppression, Some(SuppressReason::BotUserAgent), "ua {}", ua);
        }
    }

    #[test]
    fn extra_bot_markers_extend_the_builtin_list() {
        let storage = Arc::new(MemoryClientStorage::new());
        let config = AnalyticsConfig {
            env: RuntimeEnv::Production,
            extra_bot_markers: vec!["Uptime-Check".to_string()],
            ..AnalyticsConfig::default()
        };
        let classifier = EventClassifier::new(storage, &config);

        let event = classifier.classify(&page_view(Some("qr.example.com"), Some("uptime-check/1.0")));
        assert_eq!(event.suppression, Some(SuppressReason::BotUserAgent));
    }

    #[test]
    fn operator_opt_out_wins_over_other_reasons_in_production() {
        let (_, classifier) = classifier(RuntimeEnv::Production);
        classifier.set_operator_opt_out(true);

        let event = classifier.classify(&page_view(Some("localhost"), Some("Googlebot")));
        assert_eq!(event.suppression, Some(SuppressReason::OperatorOptOut));

        classifier.set_operator_opt_out(false);
        let event = classifier.classify(&page_view(Some("qr.example.com"), Some("Mozilla/5.0")));
        assert!(!event.is_suppressed());
    }

    #[test]
    fn operator_opt_out_is_ignored_in_development() {
        let (_, classifier) = classifier(RuntimeEnv::Development);
        classifier.set_operator_opt_out(true);

        let event = classifier.classify(&page_view(Some("qr.example.com"), Some("Mozilla/5.0")));
        assert!(!event.is_suppressed());
    }

    #[test]
    fn visitor_id_is_stable_across_calls() {
        let (_, classifier) = classifier(RuntimeEnv::Production);
        let first = classifier.classify(&page_view(Some("qr.example.com"), None));
        let second = classifier.classify(&page_view(Some("qr.example.com"), None));
        assert_eq!(first.visitor_id, second.visitor_id);
    }

    #[test]
    fn unavailable_storage_still_yields_an_id() {
        let (storage, classifier) = classifier(RuntimeEnv::Production);
        storage.set_available(false);

        let first = classifier.classify(&page_view(Some("qr.example.com"), None));
        let second = classifier.classify(&page_view(Some("qr.example.com"), None));
        assert!(first.visitor_id.is_some());
        assert!(second.visitor_id.is_some());
        // No persistence, so the ids do not correlate.
        assert_ne!(first.visitor_id, second.visitor_id);
    }

    #[test]
    fn session_id_regenerates_after_session_clear() {
        let (storage, classifier) = classifier(RuntimeEnv::Production);
        let first = classifier.classify(&page_view(Some("qr.example.com"), None));
        storage.clear_session();
        let second = classifier.classify(&page_view(Some("qr.example.com"), None));

        assert_ne!(first.session_id, second.session_id);
        // Visitor identity is durable and unaffected.
        assert_eq!(first.visitor_id, second.visitor_id);
    }

    #[test]
    fn page_view_routes_are_sanitized() {
        let (_, classifier) = classifier(RuntimeEnv::Production);
        let raw = RawInteraction::page_view(Some("qr.example.com"), None, "/Blog/Post-1");
        let event = classifier.classify(&raw);
        match event.kind {
            EventKind::RouteView { route } => assert_eq!(route.as_str(), "blog_post-1"),
            other => panic!("unexpected kind: {:?}", other),
        }
    }
}
