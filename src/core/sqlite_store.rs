use crate::config::AnalyticsConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::core::store::{AggregateChange, AggregateFeed, AggregateStore};
use crate::error::StoreError;
use crate::models::aggregate::{AggregateDelta, DailyAggregate};
use crate::models::keys::{DayKey, DocKey, RouteKey, Scope, VisitorId};
use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::warn;

enum DbOp {
    Fetch {
        key: DocKey,
        reply: oneshot::Sender<Result<Option<DailyAggregate>, StoreError>>,
    },
    Apply {
        key: DocKey,
        delta: AggregateDelta,
        now_ms: i64,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    MarkUnique {
        key: DocKey,
        route: RouteKey,
        visitor: VisitorId,
        now_ms: i64,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    Replace {
        key: DocKey,
        doc: Box<DailyAggregate>,
        now_ms: i64,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    ListDays {
        reply: oneshot::Sender<Result<Vec<DayKey>, StoreError>>,
    },
    DeleteDay {
        day: DayKey,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// Durable store over SQLite. One worker thread owns the connection; async
/// callers enqueue ops and await their reply. Counter mutations are pure
/// UPSERT increments, and uniqueness rides on a dedup table with a
/// composite primary key, so the check-and-credit is atomic in one
/// transaction.
pub struct SqliteAggregateStore {
    tx: Sender<DbOp>,
    feed_tx: broadcast::Sender<AggregateChange>,
    clock: Arc<dyn Clock>,
}

impl SqliteAggregateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_config(path, &AnalyticsConfig::default(), Arc::new(SystemClock))
    }

    pub fn open_with_config(
        path: impl AsRef<Path>,
        config: &AnalyticsConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!(
                    "Failed to create db dir {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        // Open and migrate eagerly to fail fast if the filesystem/db is broken.
        {
            let conn = open_write_conn(&path)?;
            migrate(&conn)?;
        }

        let (tx, rx) = mpsc::channel::<DbOp>();
        let (feed_tx, _) = broadcast::channel(config.feed_capacity.max(1));

        let worker_path = path.clone();
        let worker_feed = feed_tx.clone();
        let busy_retries = config.sqlite_busy_retries;
        std::thread::spawn(move || {
            let mut conn = match open_write_conn(&worker_path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "aggregate db worker failed to open connection");
                    return;
                }
            };
            if let Err(e) = migrate(&conn) {
                warn!(error = %e, "aggregate db worker failed to migrate schema");
                return;
            }

            let mut rng = SmallRng::from_entropy();
            while let Ok(op) = rx.recv() {
                handle_op(&mut conn, &worker_feed, busy_retries, &mut rng, op);
            }
            // Channel disconnected: the store was dropped, drain is done.
        });

        Ok(Self { tx, feed_tx, clock })
    }

    fn enqueue(&self, op: DbOp) -> Result<(), StoreError> {
        self.tx.send(op).map_err(|_| StoreError::Closed)
    }
}

#[async_trait]
impl AggregateStore for SqliteAggregateStore {
    async fn fetch(&self, key: &DocKey) -> Result<Option<DailyAggregate>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(DbOp::Fetch { key: key.clone(), reply })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn apply(&self, key: &DocKey, delta: &AggregateDelta) -> Result<(), StoreError> {
        if delta.is_empty() {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        self.enqueue(DbOp::Apply {
            key: key.clone(),
            delta: delta.clone(),
            now_ms: self.clock.now_ms(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn mark_unique(
        &self,
        key: &DocKey,
        route: &RouteKey,
        visitor: &VisitorId,
    ) -> Result<bool, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(DbOp::MarkUnique {
            key: key.clone(),
            route: route.clone(),
            visitor: visitor.clone(),
            now_ms: self.clock.now_ms(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn replace(&self, key: &DocKey, doc: DailyAggregate) -> Result<(), StoreError> {
        if doc.date != key.day {
            return Err(StoreError::InvalidKey(format!(
                "document date {} does not match key day {}",
                doc.date, key.day
            )));
        }
        let (reply, rx) = oneshot::channel();
        self.enqueue(DbOp::Replace {
            key: key.clone(),
            doc: Box::new(doc),
            now_ms: self.clock.now_ms(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn list_days(&self) -> Result<Vec<DayKey>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(DbOp::ListDays { reply })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn delete_day(&self, day: &DayKey) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(DbOp::DeleteDay { day: *day, reply })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    fn subscribe(&self) -> AggregateFeed {
        AggregateFeed::new(self.feed_tx.subscribe())
    }
}

fn open_write_conn(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)
        .map_err(|e| StoreError::Unavailable(format!("Failed to open sqlite db: {}", e)))?;
    let _ = conn.busy_timeout(Duration::from_secs(2));
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| StoreError::Backend(format!("Failed to set journal_mode=WAL: {}", e)))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| StoreError::Backend(format!("Failed to set synchronous=NORMAL: {}", e)))?;
    conn.pragma_update(None, "temp_store", "MEMORY")
        .map_err(|e| StoreError::Backend(format!("Failed to set temp_store=MEMORY: {}", e)))?;
    Ok(conn)
}

const SCHEMA_VERSION: i64 = 1;

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS daily_meta (
  scope TEXT NOT NULL,
  date_key TEXT NOT NULL,
  total_generations INTEGER NOT NULL DEFAULT 0,
  updated_at_ms INTEGER NOT NULL,
  PRIMARY KEY(scope, date_key)
);
CREATE INDEX IF NOT EXISTS idx_daily_meta_date ON daily_meta(date_key DESC);

CREATE TABLE IF NOT EXISTS daily_route_counts (
  scope TEXT NOT NULL,
  date_key TEXT NOT NULL,
  route TEXT NOT NULL,
  views INTEGER NOT NULL DEFAULT 0,
  uniques INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY(scope, date_key, route)
);
CREATE INDEX IF NOT EXISTS idx_daily_route_counts_date ON daily_route_counts(date_key);

CREATE TABLE IF NOT EXISTS daily_category_counts (
  scope TEXT NOT NULL,
  date_key TEXT NOT NULL,
  category TEXT NOT NULL,
  count INTEGER NOT NULL,
  PRIMARY KEY(scope, date_key, category)
);
CREATE INDEX IF NOT EXISTS idx_daily_category_counts_date ON daily_category_counts(date_key);

CREATE TABLE IF NOT EXISTS daily_unique_visitors (
  scope TEXT NOT NULL,
  date_key TEXT NOT NULL,
  route TEXT NOT NULL,
  visitor TEXT NOT NULL,
  PRIMARY KEY(scope, date_key, route, visitor)
);
"#,
    )
    .map_err(|e| StoreError::Backend(format!("Failed to migrate sqlite schema: {}", e)))?;

    match schema_version(conn)? {
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) if v > SCHEMA_VERSION => {
            return Err(StoreError::Backend(format!(
                "database schema version {} is newer than this build supports ({})",
                v, SCHEMA_VERSION
            )));
        }
        _ => set_schema_version(conn, SCHEMA_VERSION)?,
    }

    Ok(())
}

fn schema_version(conn: &Connection) -> Result<Option<i64>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::Backend(format!("Failed to read schema version: {}", e)))?;
    Ok(raw.and_then(|v| v.trim().parse().ok()))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO schema_meta(key, value) VALUES('schema_version', ?1) ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        params![version.to_string()],
    )
    .map_err(|e| StoreError::Backend(format!("Failed to stamp schema version: {}", e)))?;
    Ok(())
}

fn handle_op(
    conn: &mut Connection,
    feed: &broadcast::Sender<AggregateChange>,
    busy_retries: u32,
    rng: &mut SmallRng,
    op: DbOp,
) {
    match op {
        DbOp::Fetch { key, reply } => {
            let _ = reply.send(load_doc(conn, &key));
        }
        DbOp::Apply { key, delta, now_ms, reply } => {
            let res = with_busy_retry(busy_retries, rng, || apply_delta(conn, &key, &delta, now_ms));
            if res.is_ok() {
                publish_doc(conn, feed, &key);
            }
            let _ = reply.send(res);
        }
        DbOp::MarkUnique { key, route, visitor, now_ms, reply } => {
            let res =
                with_busy_retry(busy_retries, rng, || mark_unique(conn, &key, &route, &visitor, now_ms));
            if matches!(res, Ok(true)) {
                publish_doc(conn, feed, &key);
            }
            let _ = reply.send(res);
        }
        DbOp::Replace { key, doc, now_ms, reply } => {
            let res = with_busy_retry(busy_retries, rng, || replace_doc(conn, &key, &doc, now_ms));
            if res.is_ok() {
                publish_doc(conn, feed, &key);
            }
            let _ = reply.send(res);
        }
        DbOp::ListDays { reply } => {
            let _ = reply.send(list_days(conn));
        }
        DbOp::DeleteDay { day, reply } => {
            let res = with_busy_retry(busy_retries, rng, || delete_day(conn, &day));
            if let Ok(true) = res {
                let key = DocKey::global(day);
                let _ = feed.send(AggregateChange {
                    scope: key.scope.clone(),
                    day,
                    snapshot: DailyAggregate::empty(day).lite(),
                });
            }
            let _ = reply.send(res.map(|_| ()));
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

fn with_busy_retry<T>(
    retries: u32,
    rng: &mut SmallRng,
    mut f: impl FnMut() -> Result<T, rusqlite::Error>,
) -> Result<T, StoreError> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy(&e) && attempt < retries => {
                attempt += 1;
                let jitter: u64 = rng.gen_range(0..25);
                std::thread::sleep(Duration::from_millis(10 * attempt as u64 + jitter));
            }
            Err(e) if is_busy(&e) => {
                return Err(StoreError::Unavailable(format!("sqlite busy: {}", e)));
            }
            Err(e) => return Err(StoreError::Backend(format!("sqlite failure: {}", e))),
        }
    }
}

fn upsert_meta(
    conn: &Connection,
    scope: &str,
    date_key: &str,
    generations: u64,
    now_ms: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        r#"
INSERT INTO daily_meta(scope, date_key, total_generations, updated_at_ms)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(scope, date_key) DO UPDATE SET
  total_generations = total_generations + excluded.total_generations,
  updated_at_ms = MAX(updated_at_ms, excluded.updated_at_ms)
"#,
        params![scope, date_key, i64::try_from(generations).unwrap_or(i64::MAX), now_ms],
    )?;
    Ok(())
}

fn apply_delta(
    conn: &mut Connection,
    key: &DocKey,
    delta: &AggregateDelta,
    now_ms: i64,
) -> Result<(), rusqlite::Error> {
    let scope = key.scope.as_token();
    let date_key = key.day.to_string();

    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            r#"
INSERT INTO daily_route_counts(scope, date_key, route, views, uniques)
VALUES (?1, ?2, ?3, ?4, 0)
ON CONFLICT(scope, date_key, route) DO UPDATE SET views = views + excluded.views
"#,
        )?;
        for (route, count) in &delta.route_views {
            if *count == 0 {
                continue;
            }
            stmt.execute(params![
                scope,
                date_key,
                route.as_str(),
                i64::try_from(*count).unwrap_or(i64::MAX)
            ])?;
        }
    }
    {
        let mut stmt = tx.prepare(
            r#"
INSERT INTO daily_category_counts(scope, date_key, category, count)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(scope, date_key, category) DO UPDATE SET count = count + excluded.count
"#,
        )?;
        for (category, count) in &delta.categories {
            if *count == 0 {
                continue;
            }
            stmt.execute(params![
                scope,
                date_key,
                category,
                i64::try_from(*count).unwrap_or(i64::MAX)
            ])?;
        }
    }
    upsert_meta(&tx, &scope, &date_key, delta.generations, now_ms)?;
    tx.commit()
}

fn mark_unique(
    conn: &mut Connection,
    key: &DocKey,
    route: &RouteKey,
    visitor: &VisitorId,
    now_ms: i64,
) -> Result<bool, rusqlite::Error> {
    let scope = key.scope.as_token();
    let date_key = key.day.to_string();

    let tx = conn.transaction()?;
    let inserted = tx.execute(
        r#"
INSERT OR IGNORE INTO daily_unique_visitors(scope, date_key, route, visitor)
VALUES (?1, ?2, ?3, ?4)
"#,
        params![scope, date_key, route.as_str(), visitor.as_str()],
    )?;
    if inserted == 0 {
        // Already credited today; nothing to write.
        tx.commit()?;
        return Ok(false);
    }

    tx.execute(
        r#"
INSERT INTO daily_route_counts(scope, date_key, route, views, uniques)
VALUES (?1, ?2, ?3, 0, 1)
ON CONFLICT(scope, date_key, route) DO UPDATE SET uniques = uniques + 1
"#,
        params![scope, date_key, route.as_str()],
    )?;
    upsert_meta(&tx, &scope, &date_key, 0, now_ms)?;
    tx.commit()?;
    Ok(true)
}

fn replace_doc(
    conn: &mut Connection,
    key: &DocKey,
    doc: &DailyAggregate,
    now_ms: i64,
) -> Result<(), rusqlite::Error> {
    let scope = key.scope.as_token();
    let date_key = key.day.to_string();

    let tx = conn.transaction()?;
    let prev_stamp: i64 = tx
        .query_row(
            "SELECT updated_at_ms FROM daily_meta WHERE scope=?1 AND date_key=?2",
            params![scope, date_key],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    tx.execute(
        "DELETE FROM daily_route_counts WHERE scope=?1 AND date_key=?2",
        params![scope, date_key],
    )?;
    tx.execute(
        "DELETE FROM daily_category_counts WHERE scope=?1 AND date_key=?2",
        params![scope, date_key],
    )?;
    tx.execute(
        "DELETE FROM daily_unique_visitors WHERE scope=?1 AND date_key=?2",
        params![scope, date_key],
    )?;
    tx.execute(
        "DELETE FROM daily_meta WHERE scope=?1 AND date_key=?2",
        params![scope, date_key],
    )?;

    // An explicit meta row even for an all-zero document: readers must see
    // zeros, not a missing day.
    tx.execute(
        "INSERT INTO daily_meta(scope, date_key, total_generations, updated_at_ms) VALUES (?1, ?2, ?3, ?4)",
        params![
            scope,
            date_key,
            i64::try_from(doc.total_generations).unwrap_or(i64::MAX),
            prev_stamp.max(now_ms)
        ],
    )?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO daily_route_counts(scope, date_key, route, views, uniques) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (route, views) in &doc.route_counters {
            let uniques = doc.unique_route_counters.get(route).copied().unwrap_or(0);
            stmt.execute(params![
                scope,
                date_key,
                route.as_str(),
                i64::try_from(*views).unwrap_or(i64::MAX),
                i64::try_from(uniques).unwrap_or(i64::MAX)
            ])?;
        }
    }
    {
        let mut stmt = tx.prepare(
            "INSERT INTO daily_category_counts(scope, date_key, category, count) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (category, count) in &doc.category_counters {
            if *count == 0 {
                continue;
            }
            stmt.execute(params![
                scope,
                date_key,
                category,
                i64::try_from(*count).unwrap_or(i64::MAX)
            ])?;
        }
    }
    {
        let mut stmt = tx.prepare(
            "INSERT INTO daily_unique_visitors(scope, date_key, route, visitor) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (route, visitors) in &doc.unique_visitor_sets {
            for visitor in visitors {
                stmt.execute(params![scope, date_key, route.as_str(), visitor])?;
            }
        }
    }

    tx.commit()
}

fn list_days(conn: &Connection) -> Result<Vec<DayKey>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT date_key FROM daily_meta WHERE scope=?1 ORDER BY date_key DESC")
        .map_err(|e| StoreError::Backend(format!("Failed to prepare day listing: {}", e)))?;
    let rows = stmt
        .query_map(params![Scope::Global.as_token()], |row| row.get::<_, String>(0))
        .map_err(|e| StoreError::Backend(format!("Failed to list days: {}", e)))?;

    let mut out = Vec::new();
    for row in rows {
        let raw = row.map_err(|e| StoreError::Backend(format!("Failed to read day row: {}", e)))?;
        match raw.parse::<DayKey>() {
            Ok(day) => out.push(day),
            Err(_) => warn!(date_key = %raw, "skipping unparseable day key"),
        }
    }
    Ok(out)
}

// Deletes across every scope: the admin wipe must take the per-visitor
// rollup rows with the day, not just the global document.
fn delete_day(conn: &mut Connection, day: &DayKey) -> Result<bool, rusqlite::Error> {
    let date_key = day.to_string();

    let tx = conn.transaction()?;
    let mut removed = 0usize;
    removed += tx.execute(
        "DELETE FROM daily_route_counts WHERE date_key=?1",
        params![date_key],
    )?;
    removed += tx.execute(
        "DELETE FROM daily_category_counts WHERE date_key=?1",
        params![date_key],
    )?;
    removed += tx.execute(
        "DELETE FROM daily_unique_visitors WHERE date_key=?1",
        params![date_key],
    )?;
    removed += tx.execute(
        "DELETE FROM daily_meta WHERE date_key=?1",
        params![date_key],
    )?;
    tx.commit()?;
    Ok(removed > 0)
}

fn load_doc(conn: &Connection, key: &DocKey) -> Result<Option<DailyAggregate>, StoreError> {
    let scope = key.scope.as_token();
    let date_key = key.day.to_string();

    let meta: Option<(i64, i64)> = conn
        .query_row(
            "SELECT total_generations, updated_at_ms FROM daily_meta WHERE scope=?1 AND date_key=?2",
            params![scope, date_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| StoreError::Backend(format!("Failed to read daily_meta: {}", e)))?;

    let Some((generations, updated_at_ms)) = meta else {
        return Ok(None);
    };

    let mut doc = DailyAggregate::empty(key.day);
    doc.total_generations = u64::try_from(generations).unwrap_or(0);
    doc.last_updated_ms = updated_at_ms;

    {
        let mut stmt = conn
            .prepare(
                "SELECT route, views, uniques FROM daily_route_counts WHERE scope=?1 AND date_key=?2",
            )
            .map_err(|e| StoreError::Backend(format!("Failed to prepare route query: {}", e)))?;
        let rows = stmt
            .query_map(params![scope, date_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(|e| StoreError::Backend(format!("Failed to query routes: {}", e)))?;
        for row in rows {
            let (route, views, uniques) =
                row.map_err(|e| StoreError::Backend(format!("Failed to read route row: {}", e)))?;
            let route = RouteKey::raw(route);
            let views = u64::try_from(views).unwrap_or(0);
            let uniques = u64::try_from(uniques).unwrap_or(0);
            if views > 0 {
                doc.route_counters.insert(route.clone(), views);
            }
            if uniques > 0 {
                doc.unique_route_counters.insert(route, uniques);
            }
        }
    }

    {
        let mut stmt = conn
            .prepare(
                "SELECT category, count FROM daily_category_counts WHERE scope=?1 AND date_key=?2",
            )
            .map_err(|e| StoreError::Backend(format!("Failed to prepare category query: {}", e)))?;
        let rows = stmt
            .query_map(params![scope, date_key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| StoreError::Backend(format!("Failed to query categories: {}", e)))?;
        for row in rows {
            let (category, count) = row
                .map_err(|e| StoreError::Backend(format!("Failed to read category row: {}", e)))?;
            let count = u64::try_from(count).unwrap_or(0);
            if count > 0 {
                doc.category_counters.insert(category, count);
            }
        }
    }

    {
        let mut stmt = conn
            .prepare(
                "SELECT route, visitor FROM daily_unique_visitors WHERE scope=?1 AND date_key=?2",
            )
            .map_err(|e| StoreError::Backend(format!("Failed to prepare visitor query: {}", e)))?;
        let rows = stmt
            .query_map(params![scope, date_key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| StoreError::Backend(format!("Failed to query visitors: {}", e)))?;
        for row in rows {
            let (route, visitor) = row
                .map_err(|e| StoreError::Backend(format!("Failed to read visitor row: {}", e)))?;
            doc.unique_visitor_sets
                .entry(RouteKey::raw(route))
                .or_default()
                .insert(visitor);
        }
    }

    Ok(Some(doc))
}

fn publish_doc(conn: &Connection, feed: &broadcast::Sender<AggregateChange>, key: &DocKey) {
    match load_doc(conn, key) {
        Ok(Some(doc)) => {
            let _ = feed.send(AggregateChange {
                scope: key.scope.clone(),
                day: key.day,
                snapshot: doc.lite(),
            });
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to load document for change feed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day() -> DayKey {
        "2025-01-01".parse().unwrap()
    }

    fn route() -> RouteKey {
        RouteKey::sanitize("/generate")
    }

    fn open_store(dir: &TempDir) -> SqliteAggregateStore {
        SqliteAggregateStore::open(dir.path().join("aggregates.db"))
            .expect("Failed to open sqlite store")
    }

    #[tokio::test]
    async fn apply_then_fetch_roundtrips() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(&dir);
        let key = DocKey::global(day());

        let mut delta = AggregateDelta::default();
        delta.add_route_view(route(), 2);
        delta.add_generation("wifi", 3);
        store.apply(&key, &delta).await.unwrap();

        let doc = store.fetch(&key).await.unwrap().unwrap();
        assert_eq!(doc.route_counters.get(&route()), Some(&2));
        assert_eq!(doc.category_counters.get("wifi"), Some(&3));
        assert_eq!(doc.total_generations, 3);
        assert!(doc.last_updated_ms > 0);
        doc.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn deltas_accumulate_across_calls() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(&dir);
        let key = DocKey::global(day());

        store.apply(&key, &AggregateDelta::generation("wifi")).await.unwrap();
        store.apply(&key, &AggregateDelta::generation("wifi")).await.unwrap();
        store.apply(&key, &AggregateDelta::generation("url")).await.unwrap();

        let doc = store.fetch(&key).await.unwrap().unwrap();
        assert_eq!(doc.category_counters.get("wifi"), Some(&2));
        assert_eq!(doc.category_counters.get("url"), Some(&1));
        assert_eq!(doc.total_generations, 3);
    }

    #[tokio::test]
    async fn mark_unique_is_atomic_and_idempotent() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(&dir);
        let key = DocKey::global(day());
        let visitor = VisitorId::new("v1");

        store.apply(&key, &AggregateDelta::route_view(route())).await.unwrap();
        assert!(store.mark_unique(&key, &route(), &visitor).await.unwrap());
        assert!(!store.mark_unique(&key, &route(), &visitor).await.unwrap());

        let doc = store.fetch(&key).await.unwrap().unwrap();
        assert_eq!(doc.unique_route_counters.get(&route()), Some(&1));
        assert_eq!(doc.unique_visitor_sets.get(&route()).map(|s| s.len()), Some(1));
        doc.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn replace_with_empty_doc_reads_back_as_zeros() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(&dir);
        let key = DocKey::global(day());

        store.apply(&key, &AggregateDelta::route_view(route())).await.unwrap();
        store.mark_unique(&key, &route(), &VisitorId::new("v1")).await.unwrap();
        store.replace(&key, DailyAggregate::empty(day())).await.unwrap();

        let doc = store.fetch(&key).await.unwrap().unwrap();
        assert!(doc.route_counters.is_empty());
        assert!(doc.unique_visitor_sets.is_empty());
        assert_eq!(doc.total_generations, 0);
    }

    #[tokio::test]
    async fn delete_day_removes_every_table_row() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(&dir);
        let key = DocKey::global(day());

        let mut delta = AggregateDelta::route_view(route());
        delta.add_generation("wifi", 1);
        store.apply(&key, &delta).await.unwrap();
        store.mark_unique(&key, &route(), &VisitorId::new("v1")).await.unwrap();

        store.delete_day(&day()).await.unwrap();
        assert!(store.fetch(&key).await.unwrap().is_none());
        assert!(store.list_days().await.unwrap().is_empty());

        // Idempotent.
        store.delete_day(&day()).await.unwrap();
    }

    #[tokio::test]
    async fn delete_day_takes_visitor_rollups_with_it() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(&dir);
        let visitor_key = DocKey::visitor(VisitorId::new("v1"), day());

        store
            .apply(&DocKey::global(day()), &AggregateDelta::route_view(route()))
            .await
            .unwrap();
        store
            .apply(&visitor_key, &AggregateDelta::route_view(route()))
            .await
            .unwrap();

        store.delete_day(&day()).await.unwrap();

        assert!(store.fetch(&DocKey::global(day())).await.unwrap().is_none());
        assert!(store.fetch(&visitor_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_days_excludes_visitor_documents() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(&dir);
        let other: DayKey = "2025-01-02".parse().unwrap();

        store
            .apply(&DocKey::global(day()), &AggregateDelta::route_view(route()))
            .await
            .unwrap();
        store
            .apply(&DocKey::global(other), &AggregateDelta::route_view(route()))
            .await
            .unwrap();
        store
            .apply(
                &DocKey::visitor(VisitorId::new("v1"), day()),
                &AggregateDelta::route_view(route()),
            )
            .await
            .unwrap();

        let days = store.list_days().await.unwrap();
        assert_eq!(days, vec![other, day()]);
    }

    #[tokio::test]
    async fn open_stamps_the_schema_version() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("aggregates.db");
        {
            let _store =
                SqliteAggregateStore::open(&path).expect("Failed to open sqlite store");
        }

        let conn = Connection::open(&path).expect("Failed to open raw connection");
        let version: String = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key='schema_version'",
                [],
                |row| row.get(0),
            )
            .expect("schema version row missing");
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[tokio::test]
    async fn open_refuses_a_newer_schema_version() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("aggregates.db");
        {
            let _store =
                SqliteAggregateStore::open(&path).expect("Failed to open sqlite store");
        }
        {
            let conn = Connection::open(&path).expect("Failed to open raw connection");
            conn.execute(
                "UPDATE schema_meta SET value='99' WHERE key='schema_version'",
                [],
            )
            .expect("Failed to bump schema version");
        }

        let err = SqliteAggregateStore::open(&path)
            .err()
            .expect("open should refuse a newer schema version");
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn documents_survive_reopen() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("aggregates.db");
        let key = DocKey::global(day());

        {
            let store = SqliteAggregateStore::open(&path).expect("Failed to open sqlite store");
            store.apply(&key, &AggregateDelta::generation("wifi")).await.unwrap();
        }

        let store = SqliteAggregateStore::open(&path).expect("Failed to reopen sqlite store");
        let doc = store.fetch(&key).await.unwrap().unwrap();
        assert_eq!(doc.category_counters.get("wifi"), Some(&1));
    }

    #[tokio::test]
    async fn mutations_push_full_snapshots() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(&dir);
        let mut feed = store.subscribe();
        let key = DocKey::global(day());

        store.apply(&key, &AggregateDelta::route_view(route())).await.unwrap();

        let change = feed.next().await.unwrap().unwrap();
        assert_eq!(change.day, day());
        assert_eq!(change.snapshot.route_counters.get(&route()), Some(&1));
    }
}
