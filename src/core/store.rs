use crate::error::{StoreError, SubscriptionError};
use crate::models::aggregate::{AggregateDelta, DailyAggregate, DailyAggregateLite};
use crate::models::keys::{DayKey, DocKey, RouteKey, Scope, VisitorId};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

/// One pushed change: the full replacement snapshot of the document that
/// moved, not a diff.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateChange {
    pub scope: Scope,
    pub day: DayKey,
    pub snapshot: DailyAggregateLite,
}

/// The backing document store for aggregates.
///
/// `apply` and `mark_unique` are the only mutation primitives the write
/// path uses: both are increments against named fields, never a
/// read-modify-write of the whole document, so concurrent writers cannot
/// lose updates. `mark_unique` must decide membership and bump the paired
/// counter in one atomic step.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn fetch(&self, key: &DocKey) -> Result<Option<DailyAggregate>, StoreError>;

    /// Applies a pure-increment delta, creating the document lazily.
    async fn apply(&self, key: &DocKey, delta: &AggregateDelta) -> Result<(), StoreError>;

    /// Adds the visitor to the route's dedup set if absent, bumping the
    /// unique counter in the same step. `Ok(true)` iff newly credited.
    async fn mark_unique(
        &self,
        key: &DocKey,
        route: &RouteKey,
        visitor: &VisitorId,
    ) -> Result<bool, StoreError>;

    /// Whole-document overwrite. The document's `date` must match the key.
    async fn replace(&self, key: &DocKey, doc: DailyAggregate) -> Result<(), StoreError>;

    /// Days with a global document, newest first.
    async fn list_days(&self) -> Result<Vec<DayKey>, StoreError>;

    /// Removes every document for a day, the per-visitor rollups included.
    /// Deleting an absent day is a successful no-op.
    async fn delete_day(&self, day: &DayKey) -> Result<(), StoreError>;

    fn subscribe(&self) -> AggregateFeed;
}

/// A live subscription to store changes.
///
/// The first channel failure (overrun or close) is surfaced once as a
/// terminal error; after that the feed only yields `None`. There is no
/// internal retry: a consumer that wants the stream back subscribes again.
pub struct AggregateFeed {
    rx: Option<broadcast::Receiver<AggregateChange>>,
}

impl AggregateFeed {
    pub fn new(rx: broadcast::Receiver<AggregateChange>) -> Self {
        Self { rx: Some(rx) }
    }

    pub async fn next(&mut self) -> Option<Result<AggregateChange, SubscriptionError>> {
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Ok(change) => Some(Ok(change)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                self.rx = None;
                Some(Err(SubscriptionError::Lagged(missed)))
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.rx = None;
                Some(Err(SubscriptionError::Closed))
            }
        }
    }

    /// Tears the subscription down. Safe to call any number of times;
    /// `next` yields `None` afterwards.
    pub fn unsubscribe(&mut self) {
        self.rx.take();
    }

    pub fn is_live(&self) -> bool {
        self.rx.is_some()
    }
}
