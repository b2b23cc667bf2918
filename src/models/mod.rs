pub mod admin;
pub mod aggregate;
pub mod event;
pub mod keys;

pub use admin::{AdminRecord, DashboardEvent, DashboardState, Domain, DomainState};
pub use aggregate::{AggregateDelta, DailyAggregate, DailyAggregateLite};
pub use event::{BatchEvent, BatchKind, ClassifiedEvent, EventKind, RawInteraction, RawKind, SuppressReason};
pub use keys::{DayKey, DocKey, RouteKey, Scope, SessionId, VisitorId};
