use crate::core::clock::Clock;
use crate::core::store::AggregateFeed;
use crate::models::admin::{AdminRecord, DashboardEvent, DashboardState, Domain};
use crate::models::keys::Scope;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Loads the authoritative record set for one dashboard domain.
#[async_trait]
pub trait DomainFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Vec<AdminRecord>, String>;
}

/// Async driver around the pure `DashboardState` reducer. The lock guards
/// only the dispatch itself and is never held across an await.
pub struct DashboardController {
    state: Mutex<DashboardState>,
    fetchers: HashMap<Domain, Arc<dyn DomainFetcher>>,
    clock: Arc<dyn Clock>,
}

impl DashboardController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(DashboardState::default()),
            fetchers: HashMap::new(),
            clock,
        }
    }

    pub fn with_fetcher(mut self, domain: Domain, fetcher: Arc<dyn DomainFetcher>) -> Self {
        self.fetchers.insert(domain, fetcher);
        self
    }

    pub fn state(&self) -> DashboardState {
        self.state.lock().clone()
    }

    pub fn dispatch(&self, event: DashboardEvent) {
        self.state.lock().apply(event);
    }

    pub async fn refresh(&self, domain: Domain) {
        self.dispatch(DashboardEvent::FetchStarted { domain });
        let result = match self.fetchers.get(&domain) {
            Some(fetcher) => fetcher.fetch().await,
            None => Err(format!("no fetcher registered for {domain}")),
        };
        match result {
            Ok(records) => {
                debug!(%domain, count = records.len(), "domain refreshed");
                self.dispatch(DashboardEvent::FetchSucceeded { domain, records });
            }
            Err(message) => {
                warn!(%domain, %message, "domain refresh failed");
                self.dispatch(DashboardEvent::FetchFailed { domain, message });
            }
        }
    }

    /// Refreshes every registered domain concurrently and waits for all of
    /// them to settle. One failing domain never blocks the others, and the
    /// stamp lands regardless of outcomes.
    pub async fn refresh_all(&self) {
        self.dispatch(DashboardEvent::RefreshAllStarted);
        join_all(self.fetchers.keys().map(|domain| self.refresh(*domain))).await;
        self.dispatch(DashboardEvent::RefreshAllSettled { at_ms: self.clock.now_ms() });
    }

    /// Optimistic removal. The record disappears immediately; the caller
    /// issues the server-side delete and a corrective `refresh` afterwards.
    /// A failed server delete resurfaces the record only at that refresh.
    pub fn apply_local_delete(&self, domain: Domain, id: &str) {
        self.dispatch(DashboardEvent::RecordRemoved { domain, id: id.to_string() });
    }

    /// Drives a change feed into `PushReplaced` events until the feed dies,
    /// then reports the loss once and returns. Reconnecting is the caller's
    /// decision.
    pub async fn pump_feed(&self, domain: Domain, mut feed: AggregateFeed) {
        loop {
            match feed.next().await {
                Some(Ok(change)) => {
                    // Visitor-scoped rollups also ride the feed; the
                    // dashboard shows the global document only.
                    if change.scope != Scope::Global {
                        continue;
                    }
                    let fields =
                        serde_json::to_value(&change.snapshot).unwrap_or(serde_json::Value::Null);
                    let record = AdminRecord::new(change.day.to_string(), fields);
                    self.dispatch(DashboardEvent::PushReplaced { domain, records: vec![record] });
                }
                Some(Err(e)) => {
                    warn!(%domain, error = %e, "dashboard feed lost");
                    self.dispatch(DashboardEvent::SubscriptionLost {
                        domain,
                        message: e.to_string(),
                    });
                    return;
                }
                None => return,
            }
        }
    }
}
