//! Usage-analytics aggregation engine for a QR generation service.
//!
//! The crate covers the write path and the admin read path:
//! - classification of raw interactions (bot, loopback and operator
//!   opt-out suppression, visitor identity, route sanitizing)
//! - day-keyed aggregate documents mutated by commutative deltas
//! - pluggable stores (in-memory and SQLite) behind one async trait
//! - live snapshots, change feeds and dashboard state reconciliation
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use qrsight::{
//!     AggregationWriter, AnalyticsConfig, AnalyticsPipeline, EventClassifier,
//!     MemoryAggregateStore, MemoryClientStorage, SystemClock,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let clock = Arc::new(SystemClock);
//!     let store = Arc::new(MemoryAggregateStore::new());
//!     let classifier = EventClassifier::new(
//!         Arc::new(MemoryClientStorage::new()),
//!         &AnalyticsConfig::default(),
//!     );
//!     let pipeline = AnalyticsPipeline::new(
//!         classifier,
//!         AggregationWriter::new(store, clock),
//!     );
//!     pipeline
//!         .track_page_view(Some("qr.example.com"), Some("Mozilla/5.0"), "/generate")
//!         .await;
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod models;

pub use config::{AnalyticsConfig, RuntimeEnv};
pub use core::{
    AdminReader, AggregateChange, AggregateFeed, AggregateStore, AggregationWriter,
    AnalyticsPipeline, BatchOutcome, ClientStorage, Clock, CustomEventSink, DashboardController,
    DomainFetcher, EventBatcher, EventClassifier, FixedClock, Maintenance, MemoryAggregateStore,
    MemoryClientStorage, ProfileHook, SqliteAggregateStore, StorageScope, SystemClock,
};
pub use error::{ClearError, StoreError, SubscriptionError, WriteOutcome};
pub use models::{
    AdminRecord, AggregateDelta, BatchEvent, BatchKind, ClassifiedEvent, DailyAggregate,
    DailyAggregateLite, DashboardEvent, DashboardState, DayKey, DocKey, Domain, DomainState,
    EventKind, RawInteraction, RawKind, RouteKey, Scope, SessionId, SuppressReason, VisitorId,
};
