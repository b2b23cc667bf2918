use super::keys::{DayKey, RouteKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One day's usage counters. Stored per `DocKey`; the `date` field always
/// matches the day component of the key it is stored under.
///
/// Invariants, per route `r`:
///   `unique_route_counters[r] == unique_visitor_sets[r].len()`
///   `unique_route_counters[r] <= route_counters[r]`
/// and `total_generations` equals the sum of `category_counters`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyAggregate {
    pub date: DayKey,
    #[serde(default)]
    pub route_counters: HashMap<RouteKey, u64>,
    #[serde(default)]
    pub unique_route_counters: HashMap<RouteKey, u64>,
    #[serde(default)]
    pub unique_visitor_sets: HashMap<RouteKey, HashSet<String>>,
    #[serde(default)]
    pub category_counters: HashMap<String, u64>,
    #[serde(default)]
    pub total_generations: u64,
    #[serde(default)]
    pub last_updated_ms: i64,
}

/// The shape pushed to dashboards: everything except the dedup sets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyAggregateLite {
    pub date: DayKey,
    #[serde(default)]
    pub route_counters: HashMap<RouteKey, u64>,
    #[serde(default)]
    pub unique_route_counters: HashMap<RouteKey, u64>,
    #[serde(default)]
    pub category_counters: HashMap<String, u64>,
    #[serde(default)]
    pub total_generations: u64,
    #[serde(default)]
    pub last_updated_ms: i64,
}

impl DailyAggregate {
    /// The zero-default document readers see for a day with no traffic yet.
    pub fn empty(day: DayKey) -> Self {
        Self {
            date: day,
            route_counters: HashMap::new(),
            unique_route_counters: HashMap::new(),
            unique_visitor_sets: HashMap::new(),
            category_counters: HashMap::new(),
            total_generations: 0,
            last_updated_ms: 0,
        }
    }

    pub fn lite(&self) -> DailyAggregateLite {
        DailyAggregateLite {
            date: self.date,
            route_counters: self.route_counters.clone(),
            unique_route_counters: self.unique_route_counters.clone(),
            category_counters: self.category_counters.clone(),
            total_generations: self.total_generations,
            last_updated_ms: self.last_updated_ms,
        }
    }

    pub fn apply(&mut self, delta: &AggregateDelta) {
        for (route, count) in &delta.route_views {
            if *count == 0 {
                continue;
            }
            self.route_counters
                .entry(route.clone())
                .and_modify(|v| *v = v.saturating_add(*count))
                .or_insert(*count);
        }

        for (category, count) in &delta.categories {
            if *count == 0 {
                continue;
            }
            self.category_counters
                .entry(category.clone())
                .and_modify(|v| *v = v.saturating_add(*count))
                .or_insert(*count);
        }

        self.total_generations = self.total_generations.saturating_add(delta.generations);
    }

    /// Credits a visitor as unique for a route. The set insert and the
    /// counter bump happen together so the two stay in lockstep.
    /// Returns false when the visitor was already credited today.
    pub fn mark_unique(&mut self, route: &RouteKey, visitor: &str) -> bool {
        let set = self.unique_visitor_sets.entry(route.clone()).or_default();
        if !set.insert(visitor.to_string()) {
            return false;
        }

        let counter = self.unique_route_counters.entry(route.clone()).or_insert(0);
        *counter = counter.saturating_add(1);
        true
    }

    /// Drops the lowest-traffic routes once the per-day key count exceeds
    /// `max_routes`, keeping any route named in `keep_routes`. All three
    /// route-keyed maps are pruned with the same key set.
    pub fn prune_routes(&mut self, max_routes: usize, keep_routes: &[RouteKey]) {
        if max_routes == 0 || self.route_counters.len() <= max_routes {
            return;
        }

        let mut entries: Vec<(RouteKey, u64)> = self
            .route_counters
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));

        let mut keep: HashSet<RouteKey> =
            entries.into_iter().take(max_routes).map(|(k, _)| k).collect();
        for route in keep_routes {
            keep.insert(route.clone());
        }

        self.route_counters.retain(|k, _| keep.contains(k));
        self.unique_route_counters.retain(|k, _| keep.contains(k));
        self.unique_visitor_sets.retain(|k, _| keep.contains(k));
    }

    /// Test support: verifies the documented invariants hold.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (route, set) in &self.unique_visitor_sets {
            let counter = self.unique_route_counters.get(route).copied().unwrap_or(0);
            if counter != set.len() as u64 {
                return Err(format!(
                    "route {}: unique counter {} != set size {}",
                    route,
                    counter,
                    set.len()
                ));
            }
        }

        for (route, unique) in &self.unique_route_counters {
            let total = self.route_counters.get(route).copied().unwrap_or(0);
            if *unique > total {
                return Err(format!(
                    "route {}: unique {} exceeds total {}",
                    route, unique, total
                ));
            }
        }

        let category_sum = self
            .category_counters
            .values()
            .fold(0u64, |acc, v| acc.saturating_add(*v));
        if self.total_generations != category_sum {
            return Err(format!(
                "total generations {} != category sum {}",
                self.total_generations, category_sum
            ));
        }

        Ok(())
    }
}

/// A pure increment against one document. Commutative: deltas can land in
/// any order and the resulting counters agree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateDelta {
    pub route_views: HashMap<RouteKey, u64>,
    pub categories: HashMap<String, u64>,
    pub generations: u64,
}

impl AggregateDelta {
    pub fn route_view(route: RouteKey) -> Self {
        let mut delta = Self::default();
        delta.add_route_view(route, 1);
        delta
    }

    pub fn generation(category: &str) -> Self {
        let mut delta = Self::default();
        delta.add_generation(category, 1);
        delta
    }

    pub fn add_route_view(&mut self, route: RouteKey, count: u64) {
        if count == 0 {
            return;
        }
        self.route_views
            .entry(route)
            .and_modify(|v| *v = v.saturating_add(count))
            .or_insert(count);
    }

    /// Bumps the category counter and the generation total together, so any
    /// delta built through this keeps totals equal to the category sum.
    pub fn add_generation(&mut self, category: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.categories
            .entry(category.to_string())
            .and_modify(|v| *v = v.saturating_add(count))
            .or_insert(count);
        self.generations = self.generations.saturating_add(count);
    }

    pub fn merge(&mut self, other: &AggregateDelta) {
        for (route, count) in &other.route_views {
            self.add_route_view(route.clone(), *count);
        }
        for (category, count) in &other.categories {
            if *count == 0 {
                continue;
            }
            self.categories
                .entry(category.clone())
                .and_modify(|v| *v = v.saturating_add(*count))
                .or_insert(*count);
        }
        self.generations = self.generations.saturating_add(other.generations);
    }

    pub fn is_empty(&self) -> bool {
        self.route_views.is_empty() && self.categories.is_empty() && self.generations == 0
    }
}
