pub mod batcher;
pub mod classifier;
pub mod client_storage;
pub mod clock;
pub mod maintenance;
pub mod memory_store;
pub mod reconcile;
pub mod snapshot;
pub mod sqlite_store;
pub mod store;
pub mod writer;

pub use batcher::EventBatcher;
pub use classifier::EventClassifier;
pub use client_storage::{ClientStorage, MemoryClientStorage, StorageScope};
pub use clock::{Clock, FixedClock, SystemClock};
pub use maintenance::Maintenance;
pub use memory_store::MemoryAggregateStore;
pub use reconcile::{DashboardController, DomainFetcher};
pub use snapshot::AdminReader;
pub use sqlite_store::SqliteAggregateStore;
pub use store::{AggregateChange, AggregateFeed, AggregateStore};
pub use writer::{AggregationWriter, AnalyticsPipeline, BatchOutcome, CustomEventSink, ProfileHook};
