use crate::core::clock::Clock;
use crate::core::store::{AggregateFeed, AggregateStore};
use crate::error::StoreError;
use crate::models::aggregate::{DailyAggregate, DailyAggregateLite};
use crate::models::keys::{DayKey, DocKey};
use futures::future::join_all;
use std::sync::Arc;

/// Read side for the admin surface. Absent days read as the zero-default
/// shape, so callers render counters without special-casing "missing".
pub struct AdminReader {
    store: Arc<dyn AggregateStore>,
    clock: Arc<dyn Clock>,
}

impl AdminReader {
    pub fn new(store: Arc<dyn AggregateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn current_snapshot(&self) -> Result<DailyAggregateLite, StoreError> {
        self.day_snapshot(self.clock.today()).await
    }

    pub async fn day_snapshot(&self, day: DayKey) -> Result<DailyAggregateLite, StoreError> {
        let doc = self.store.fetch(&DocKey::global(day)).await?;
        Ok(doc
            .map(|d| d.lite())
            .unwrap_or_else(|| DailyAggregate::empty(day).lite()))
    }

    /// Snapshots for the most recent `n` days that exist in the store,
    /// newest first. Days never written are not padded in.
    pub async fn recent_days(&self, n: usize) -> Result<Vec<DailyAggregateLite>, StoreError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut days = self.store.list_days().await?;
        days.truncate(n);
        join_all(days.into_iter().map(|day| self.day_snapshot(day)))
            .await
            .into_iter()
            .collect()
    }

    pub fn subscribe(&self) -> AggregateFeed {
        self.store.subscribe()
    }
}
