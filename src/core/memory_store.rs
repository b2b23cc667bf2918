use crate::config::AnalyticsConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::core::store::{AggregateChange, AggregateFeed, AggregateStore};
use crate::error::StoreError;
use crate::models::aggregate::{AggregateDelta, DailyAggregate};
use crate::models::keys::{DayKey, DocKey, RouteKey, Scope, VisitorId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Map-backed store. The reference semantics for every other backend, and
/// the store of choice for tests and single-process embedding.
pub struct MemoryAggregateStore {
    docs: RwLock<HashMap<DocKey, DailyAggregate>>,
    clock: Arc<dyn Clock>,
    tx: broadcast::Sender<AggregateChange>,
    max_routes_per_day: usize,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::with_config(&AnalyticsConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(&AnalyticsConfig::default(), clock)
    }

    pub fn with_config(config: &AnalyticsConfig, clock: Arc<dyn Clock>) -> Self {
        let (tx, _) = broadcast::channel(config.feed_capacity.max(1));
        Self {
            docs: RwLock::new(HashMap::new()),
            clock,
            tx,
            max_routes_per_day: config.max_routes_per_day,
        }
    }

    fn change_for(key: &DocKey, doc: &DailyAggregate) -> AggregateChange {
        AggregateChange {
            scope: key.scope.clone(),
            day: key.day,
            snapshot: doc.lite(),
        }
    }

    fn publish(&self, change: AggregateChange) {
        // No subscribers is the normal case on the write path.
        let _ = self.tx.send(change);
    }
}

impl Default for MemoryAggregateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn fetch(&self, key: &DocKey) -> Result<Option<DailyAggregate>, StoreError> {
        Ok(self.docs.read().get(key).cloned())
    }

    async fn apply(&self, key: &DocKey, delta: &AggregateDelta) -> Result<(), StoreError> {
        if delta.is_empty() {
            return Ok(());
        }

        let now = self.clock.now_ms();
        let change = {
            let mut docs = self.docs.write();
            let doc = docs
                .entry(key.clone())
                .or_insert_with(|| DailyAggregate::empty(key.day));
            doc.apply(delta);
            if self.max_routes_per_day > 0 {
                let touched: Vec<RouteKey> = delta.route_views.keys().cloned().collect();
                doc.prune_routes(self.max_routes_per_day, &touched);
            }
            doc.last_updated_ms = doc.last_updated_ms.max(now);
            Self::change_for(key, doc)
        };

        self.publish(change);
        Ok(())
    }

    async fn mark_unique(
        &self,
        key: &DocKey,
        route: &RouteKey,
        visitor: &VisitorId,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let change = {
            let mut docs = self.docs.write();
            let doc = docs
                .entry(key.clone())
                .or_insert_with(|| DailyAggregate::empty(key.day));
            if !doc.mark_unique(route, visitor.as_str()) {
                return Ok(false);
            }
            doc.last_updated_ms = doc.last_updated_ms.max(now);
            Self::change_for(key, doc)
        };

        self.publish(change);
        Ok(true)
    }

    async fn replace(&self, key: &DocKey, mut doc: DailyAggregate) -> Result<(), StoreError> {
        if doc.date != key.day {
            return Err(StoreError::InvalidKey(format!(
                "document date {} does not match key day {}",
                doc.date, key.day
            )));
        }

        let now = self.clock.now_ms();
        let change = {
            let mut docs = self.docs.write();
            let prev_stamp = docs.get(key).map(|d| d.last_updated_ms).unwrap_or(0);
            doc.last_updated_ms = prev_stamp.max(now);
            let change = Self::change_for(key, &doc);
            docs.insert(key.clone(), doc);
            change
        };

        self.publish(change);
        Ok(())
    }

    async fn list_days(&self) -> Result<Vec<DayKey>, StoreError> {
        let mut days: Vec<DayKey> = self
            .docs
            .read()
            .keys()
            .filter(|key| key.scope == Scope::Global)
            .map(|key| key.day)
            .collect();
        // Newest first, matching the durable store's listing order.
        days.sort_unstable_by(|a, b| b.cmp(a));
        Ok(days)
    }

    async fn delete_day(&self, day: &DayKey) -> Result<(), StoreError> {
        let removed = {
            let mut docs = self.docs.write();
            let before = docs.len();
            // The day's per-visitor rollups go with it.
            docs.retain(|key, _| key.day != *day);
            before != docs.len()
        };
        if removed {
            // Observers of a deleted day see the zero-default shape.
            self.publish(Self::change_for(
                &DocKey::global(*day),
                &DailyAggregate::empty(*day),
            ));
        }
        Ok(())
    }

    fn subscribe(&self) -> AggregateFeed {
        AggregateFeed::new(self.tx.subscribe())
    }
}
