use crate::models::keys::DayKey;
use crate::models::event::SuppressReason;
use thiserror::Error;

/// Failures of the backing document store.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("invalid document key: {0}")]
    InvalidKey(String),
    #[error("store closed")]
    Closed,
}

/// Result of clearing all aggregate history. Successful deletes are not
/// rolled back when later ones fail; rerunning deletes whatever remains.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClearError {
    #[error("cleared {deleted} day(s), {} delete(s) failed", failed.len())]
    Partial {
        deleted: usize,
        failed: Vec<(DayKey, StoreError)>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Terminal change-feed failures. A feed that yields one of these is dead;
/// the subscriber must establish a new one.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubscriptionError {
    #[error("subscriber lagged, {0} update(s) missed")]
    Lagged(u64),
    #[error("change feed closed")]
    Closed,
}

/// What became of one tracked event. The write path never returns `Err`:
/// a store failure is logged, swallowed, and reported here so callers and
/// tests can still see that it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Recorded,
    Suppressed(SuppressReason),
    Dropped(StoreError),
}

impl WriteOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, WriteOutcome::Recorded)
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, WriteOutcome::Suppressed(_))
    }

    pub fn dropped(&self) -> Option<&StoreError> {
        match self {
            WriteOutcome::Dropped(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_error_reports_counts() {
        let day: DayKey = "2025-01-03".parse().unwrap();
        let err = ClearError::Partial {
            deleted: 4,
            failed: vec![(day, StoreError::Unavailable("offline".to_string()))],
        };
        assert_eq!(err.to_string(), "cleared 4 day(s), 1 delete(s) failed");
    }

    #[test]
    fn store_error_converts_into_clear_error() {
        let err: ClearError = StoreError::Closed.into();
        assert!(matches!(err, ClearError::Store(StoreError::Closed)));
    }

    #[test]
    fn write_outcome_accessors() {
        assert!(WriteOutcome::Recorded.is_recorded());
        assert!(WriteOutcome::Suppressed(SuppressReason::BotUserAgent).is_suppressed());
        let dropped = WriteOutcome::Dropped(StoreError::Closed);
        assert_eq!(dropped.dropped(), Some(&StoreError::Closed));
    }
}
