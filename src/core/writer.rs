use crate::core::classifier::EventClassifier;
use crate::core::clock::Clock;
use crate::core::store::AggregateStore;
use crate::error::{StoreError, WriteOutcome};
use crate::models::aggregate::AggregateDelta;
use crate::models::event::{BatchEvent, BatchKind, ClassifiedEvent, EventKind, RawInteraction};
use crate::models::keys::{DayKey, DocKey, RouteKey, VisitorId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Called after a generation was counted, so a user profile can mirror the
/// event. The counters are already committed when this runs; a hook failure
/// is logged and does not undo or fail the write.
#[async_trait]
pub trait ProfileHook: Send + Sync {
    async fn generation_recorded(
        &self,
        visitor: &VisitorId,
        category: &str,
        day: DayKey,
    ) -> Result<(), StoreError>;
}

/// Receiver for named custom events. These bypass aggregation entirely.
pub trait CustomEventSink: Send + Sync {
    fn record(&self, name: &str, properties: &serde_json::Value);
}

/// Tally of one grouped write. `recorded` counts the events folded into the
/// batch deltas; `dropped` holds the first store failure, after which the
/// remaining writes of the batch were abandoned.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub recorded: usize,
    pub suppressed: usize,
    pub dropped: Option<StoreError>,
}

/// Applies classified events to the aggregate store as pure increments.
/// Never returns `Err`: failures become `WriteOutcome::Dropped` and the
/// caller's flow continues.
pub struct AggregationWriter {
    store: Arc<dyn AggregateStore>,
    clock: Arc<dyn Clock>,
    profile_hook: Option<Arc<dyn ProfileHook>>,
}

impl AggregationWriter {
    pub fn new(store: Arc<dyn AggregateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, profile_hook: None }
    }

    pub fn with_profile_hook(mut self, hook: Arc<dyn ProfileHook>) -> Self {
        self.profile_hook = Some(hook);
        self
    }

    /// Dispatch on an already-classified event. Suppressed events return
    /// without touching the store.
    pub async fn record_event(&self, event: &ClassifiedEvent) -> WriteOutcome {
        if let Some(reason) = event.suppression {
            debug!(?reason, "event suppressed");
            return WriteOutcome::Suppressed(reason);
        }
        match &event.kind {
            EventKind::RouteView { route } => {
                self.record_route_view(event.visitor_id.as_ref(), route).await
            }
            EventKind::Generation { category } => {
                self.record_generation(event.visitor_id.as_ref(), category).await
            }
            // Custom events are never aggregated; the pipeline routes them
            // to its sink before the writer is involved.
            EventKind::Custom { .. } => WriteOutcome::Recorded,
        }
    }

    pub async fn record_route_view(
        &self,
        visitor: Option<&VisitorId>,
        route: &RouteKey,
    ) -> WriteOutcome {
        let day = self.clock.today();
        let global = DocKey::global(day);
        let delta = AggregateDelta::route_view(route.clone());

        // Total before unique, so unique <= total holds at every point.
        if let Err(e) = self.store.apply(&global, &delta).await {
            warn!(error = %e, route = route.as_str(), "route view dropped");
            return WriteOutcome::Dropped(e);
        }
        if let Some(visitor) = visitor {
            if let Err(e) = self.store.mark_unique(&global, route, visitor).await {
                warn!(error = %e, route = route.as_str(), "unique credit dropped");
                return WriteOutcome::Dropped(e);
            }
            let user = DocKey::visitor(visitor.clone(), day);
            if let Err(e) = self.store.apply(&user, &delta).await {
                warn!(error = %e, route = route.as_str(), "visitor rollup dropped");
                return WriteOutcome::Dropped(e);
            }
        }
        WriteOutcome::Recorded
    }

    pub async fn record_generation(
        &self,
        visitor: Option<&VisitorId>,
        category: &str,
    ) -> WriteOutcome {
        let day = self.clock.today();
        let category = normalize_category(category);
        let global = DocKey::global(day);
        let delta = AggregateDelta::generation(&category);

        if let Err(e) = self.store.apply(&global, &delta).await {
            warn!(error = %e, category = %category, "generation dropped");
            return WriteOutcome::Dropped(e);
        }
        if let Some(visitor) = visitor {
            let user = DocKey::visitor(visitor.clone(), day);
            if let Err(e) = self.store.apply(&user, &delta).await {
                warn!(error = %e, category = %category, "visitor rollup dropped");
                return WriteOutcome::Dropped(e);
            }
            if let Some(hook) = &self.profile_hook {
                if let Err(e) = hook.generation_recorded(visitor, &category, day).await {
                    // The counters are committed; the profile will catch up
                    // elsewhere.
                    warn!(error = %e, "profile hook failed after generation was counted");
                }
            }
        }
        WriteOutcome::Recorded
    }

    /// Fold a flushed client batch into per-document deltas before writing,
    /// so each touched document takes one `apply` instead of one per event.
    /// Unique credit is deduplicated to the first occurrence of each
    /// (route, visitor) pair.
    pub async fn record_batch(&self, events: &[BatchEvent]) -> BatchOutcome {
        let day = self.clock.today();
        let global = DocKey::global(day);

        let mut outcome = BatchOutcome::default();
        let mut global_delta = AggregateDelta::default();
        let mut user_deltas: HashMap<VisitorId, AggregateDelta> = HashMap::new();
        let mut unique_marks: Vec<(RouteKey, VisitorId)> = Vec::new();
        let mut seen_pairs: HashSet<(RouteKey, VisitorId)> = HashSet::new();
        let mut hook_calls: Vec<(VisitorId, String)> = Vec::new();

        for event in events {
            if event.suppression.is_some() {
                outcome.suppressed += 1;
                continue;
            }
            match &event.kind {
                BatchKind::RouteView { path } => {
                    let route = RouteKey::sanitize(path);
                    global_delta.add_route_view(route.clone(), 1);
                    if let Some(visitor) = &event.visitor {
                        user_deltas
                            .entry(visitor.clone())
                            .or_default()
                            .add_route_view(route.clone(), 1);
                        if seen_pairs.insert((route.clone(), visitor.clone())) {
                            unique_marks.push((route, visitor.clone()));
                        }
                    }
                }
                BatchKind::Generation { category } => {
                    let category = normalize_category(category);
                    global_delta.add_generation(&category, 1);
                    if let Some(visitor) = &event.visitor {
                        user_deltas
                            .entry(visitor.clone())
                            .or_default()
                            .add_generation(&category, 1);
                        hook_calls.push((visitor.clone(), category));
                    }
                }
            }
            outcome.recorded += 1;
        }

        if let Err(e) = self.store.apply(&global, &global_delta).await {
            warn!(error = %e, "batch dropped before any write landed");
            outcome.dropped = Some(e);
            return outcome;
        }
        for (route, visitor) in &unique_marks {
            if let Err(e) = self.store.mark_unique(&global, route, visitor).await {
                warn!(error = %e, "batch abandoned mid-way through unique credits");
                outcome.dropped = Some(e);
                return outcome;
            }
        }
        for (visitor, delta) in &user_deltas {
            let user = DocKey::visitor(visitor.clone(), day);
            if let Err(e) = self.store.apply(&user, delta).await {
                warn!(error = %e, "batch abandoned mid-way through visitor rollups");
                outcome.dropped = Some(e);
                return outcome;
            }
        }
        if let Some(hook) = &self.profile_hook {
            for (visitor, category) in &hook_calls {
                if let Err(e) = hook.generation_recorded(visitor, category, day).await {
                    warn!(error = %e, "profile hook failed after batch was counted");
                }
            }
        }
        outcome
    }
}

/// Classify-then-write front door. One of these per embedding application.
pub struct AnalyticsPipeline {
    classifier: EventClassifier,
    writer: AggregationWriter,
    custom_sink: Option<Arc<dyn CustomEventSink>>,
}

impl AnalyticsPipeline {
    pub fn new(classifier: EventClassifier, writer: AggregationWriter) -> Self {
        Self { classifier, writer, custom_sink: None }
    }

    pub fn with_custom_sink(mut self, sink: Arc<dyn CustomEventSink>) -> Self {
        self.custom_sink = Some(sink);
        self
    }

    pub fn classifier(&self) -> &EventClassifier {
        &self.classifier
    }

    pub async fn track(&self, raw: RawInteraction) -> WriteOutcome {
        let event = self.classifier.classify(&raw);
        if let EventKind::Custom { name, properties } = &event.kind {
            if let Some(reason) = event.suppression {
                debug!(?reason, name = %name, "custom event suppressed");
                return WriteOutcome::Suppressed(reason);
            }
            if let Some(sink) = &self.custom_sink {
                sink.record(name, properties);
            }
            return WriteOutcome::Recorded;
        }
        self.writer.record_event(&event).await
    }

    pub async fn track_page_view(
        &self,
        host: Option<&str>,
        user_agent: Option<&str>,
        path: &str,
    ) -> WriteOutcome {
        self.track(RawInteraction::page_view(host, user_agent, path)).await
    }

    pub async fn track_generation(
        &self,
        host: Option<&str>,
        user_agent: Option<&str>,
        category: &str,
    ) -> WriteOutcome {
        self.track(RawInteraction::qr_generated(host, user_agent, category)).await
    }

    pub async fn track_custom(
        &self,
        host: Option<&str>,
        user_agent: Option<&str>,
        name: &str,
        properties: serde_json::Value,
    ) -> WriteOutcome {
        self.track(RawInteraction::custom(host, user_agent, name, properties)).await
    }
}

fn normalize_category(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        "uncategorized".to_string()
    } else {
        trimmed.to_string()
    }
}
