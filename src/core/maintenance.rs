use crate::core::clock::Clock;
use crate::core::store::AggregateStore;
use crate::error::{ClearError, StoreError};
use crate::models::aggregate::DailyAggregate;
use crate::models::keys::{DayKey, DocKey};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

/// Destructive admin operations. Authorization happens outside this crate;
/// callers gate access before reaching here.
pub struct Maintenance {
    store: Arc<dyn AggregateStore>,
    clock: Arc<dyn Clock>,
}

impl Maintenance {
    pub fn new(store: Arc<dyn AggregateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Overwrites one day (default today) with the zero-default document.
    /// Reads immediately after see zeros, not a missing day. Idempotent.
    pub async fn reset_day(&self, day: Option<DayKey>) -> Result<(), StoreError> {
        let day = day.unwrap_or_else(|| self.clock.today());
        self.store
            .replace(&DocKey::global(day), DailyAggregate::empty(day))
            .await?;
        info!(%day, "aggregate day reset to zeros");
        Ok(())
    }

    /// Deletes every stored day, all deletes in flight concurrently.
    /// Successful deletes are not rolled back when others fail; rerunning
    /// removes whatever remains.
    pub async fn clear_all(&self) -> Result<usize, ClearError> {
        let days = self.store.list_days().await?;
        if days.is_empty() {
            return Ok(0);
        }

        let results = join_all(
            days.iter()
                .map(|day| async move { (*day, self.store.delete_day(day).await) }),
        )
        .await;

        let mut deleted = 0usize;
        let mut failed: Vec<(DayKey, StoreError)> = Vec::new();
        for (day, result) in results {
            match result {
                Ok(()) => deleted += 1,
                Err(e) => failed.push((day, e)),
            }
        }

        if failed.is_empty() {
            info!(deleted, "aggregate history cleared");
            Ok(deleted)
        } else {
            warn!(deleted, failures = failed.len(), "aggregate clear finished partially");
            Err(ClearError::Partial { deleted, failed })
        }
    }
}
