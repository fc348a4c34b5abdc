//! SQLite-backed event store.
//!
//! One writer connection behind a mutex serializes every mutation, which is
//! what keeps "newest wins" for replaceable keys under concurrent publishers.
//! Readers come from a small pool so queries never wait on the writer. All
//! database work runs on the blocking pool.

use crate::error::Error;
use crate::kinds::{KindClass, KIND_DELETION_5};
use futures::stream::{self, Stream, TryStreamExt};
use nostr::{Event, Filter, Timestamp};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tracing::{debug, info, warn};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    pubkey TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    d_tag TEXT,
    raw TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    deleted_by TEXT,
    first_seen INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_pubkey_kind ON events(pubkey, kind, created_at);
CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind, created_at);
CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);
CREATE INDEX IF NOT EXISTS idx_events_replacement ON events(pubkey, kind, d_tag);

CREATE TABLE IF NOT EXISTS event_tags (
    event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_tags_name_value ON event_tags(name, value);
CREATE INDEX IF NOT EXISTS idx_event_tags_event_id ON event_tags(event_id);

CREATE TABLE IF NOT EXISTS applied_commands (
    event_id TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS whitelist (
    pubkey TEXT PRIMARY KEY,
    cohorts TEXT NOT NULL,
    expires_at INTEGER,
    updated_at INTEGER NOT NULL
);
";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryLimits {
    /// Applied when a filter carries no limit.
    pub default_limit: usize,
    /// Hard cap regardless of what the filter asks for.
    pub max_limit: usize,
    pub max_filters: usize,
    pub max_subscriptions: usize,
    /// Rows fetched per round trip while streaming a historical query.
    pub page_size: usize,
    pub max_readers: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_limit: 500,
            max_limit: 5000,
            max_filters: 10,
            max_subscriptions: 20,
            page_size: 200,
            max_readers: 4,
        }
    }
}

impl QueryLimits {
    pub fn effective_limit(&self, filter: &Filter) -> usize {
        filter
            .limit
            .unwrap_or(self.default_limit)
            .min(self.max_limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StoreOutcome {
    Stored,
    /// Already had an event with this id.
    Duplicate,
    /// A replaceable event at least as new is already stored.
    Superseded,
    /// Ephemeral kinds are delivered but never written.
    NotPersisted,
}

impl StoreOutcome {
    /// Whether live subscribers should see the event.
    pub fn should_broadcast(self) -> bool {
        matches!(self, StoreOutcome::Stored | StoreOutcome::NotPersisted)
    }
}

/// Something a deletion event points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionTarget {
    Event(String),
    Address {
        kind: u16,
        pubkey: String,
        identifier: String,
    },
}

/// Reads `e` and `a` references from a deletion or moderated-delete event.
/// Malformed references are skipped.
pub fn deletion_targets(event: &Event) -> Vec<DeletionTarget> {
    event
        .tags
        .iter()
        .filter_map(|tag| {
            let values = tag.as_slice();
            match (values.first().map(String::as_str), values.get(1)) {
                (Some("e"), Some(id)) if is_hex_id(id) => Some(DeletionTarget::Event(id.clone())),
                (Some("a"), Some(address)) => parse_address(address),
                _ => None,
            }
        })
        .collect()
}

fn is_hex_id(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn parse_address(address: &str) -> Option<DeletionTarget> {
    let mut parts = address.splitn(3, ':');
    let kind = parts.next()?.parse::<u16>().ok()?;
    let pubkey = parts.next()?;
    if !is_hex_id(pubkey) {
        return None;
    }
    let identifier = parts.next().unwrap_or_default();
    Some(DeletionTarget::Address {
        kind,
        pubkey: pubkey.to_string(),
        identifier: identifier.to_string(),
    })
}

/// Value of the first `d` tag, empty when the tag is missing.
pub fn identifier(event: &Event) -> String {
    event
        .tags
        .iter()
        .map(|tag| tag.as_slice())
        .find(|values| values.first().map(String::as_str) == Some("d"))
        .and_then(|values| values.get(1).cloned())
        .unwrap_or_default()
}

/// Single-letter tags with a value are indexed for `#x` filters.
fn indexed_tags(event: &Event) -> Vec<(String, String)> {
    event
        .tags
        .iter()
        .filter_map(|tag| {
            let values = tag.as_slice();
            let name = values.first()?;
            let value = values.get(1)?;
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => Some((name.clone(), value.clone())),
                _ => None,
            }
        })
        .collect()
}

fn open_connection(path: &Path) -> Result<Connection, Error> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Clamps a unix timestamp into SQLite's integer range.
pub(crate) fn sql_timestamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn with_retry<T>(mut op: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!(
                    target: "storage",
                    "Transient storage error (attempt {}/{}): {}", attempt, MAX_ATTEMPTS, e
                );
                std::thread::sleep(RETRY_BACKOFF * attempt);
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[derive(Debug)]
struct DatabaseInner {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    limits: QueryLimits,
}

impl DatabaseInner {
    fn take_reader(&self) -> Result<Connection, Error> {
        let pooled = self.readers.lock().pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => open_connection(&self.path),
        }
    }

    fn return_reader(&self, conn: Connection) {
        let mut readers = self.readers.lock();
        if readers.len() < self.limits.max_readers {
            readers.push(conn);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayDatabase {
    inner: Arc<DatabaseInner>,
}

impl RelayDatabase {
    pub fn open<P: AsRef<Path>>(path: P, limits: QueryLimits) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::storage(format!("Cannot create {}: {e}", parent.display()), false)
                })?;
            }
        }

        let writer = open_connection(&path)?;
        writer.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        writer.execute_batch(SCHEMA)?;
        info!(target: "storage", "Database opened at {:?}", path);

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                path,
                writer: Mutex::new(writer),
                readers: Mutex::new(Vec::new()),
                limits,
            }),
        })
    }

    pub fn limits(&self) -> &QueryLimits {
        &self.inner.limits
    }

    /// Runs `op` against the writer connection on the blocking pool, retrying
    /// transient failures.
    pub(crate) async fn write<T, F>(&self, op: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, Error> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            with_retry(|| {
                let mut conn = inner.writer.lock();
                op(&mut conn)
            })
        })
        .await?
    }

    pub(crate) async fn read<T, F>(&self, op: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> Result<T, Error> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            with_retry(|| {
                let conn = inner.take_reader()?;
                let result = op(&conn);
                inner.return_reader(conn);
                result
            })
        })
        .await?
    }

    pub async fn save_event(&self, event: &Event) -> Result<StoreOutcome, Error> {
        let class = KindClass::of(event.kind);
        if !class.is_persisted() {
            return Ok(StoreOutcome::NotPersisted);
        }

        let event = Arc::new(event.clone());
        let raw = serde_json::to_string(event.as_ref())?;
        let outcome = self
            .write(move |conn| {
                let tx = conn.transaction()?;
                let outcome = store_in_tx(&tx, &event, class, &raw)?;
                tx.commit()?;
                Ok(outcome)
            })
            .await?;

        Ok(outcome)
    }

    /// Marks the targets as deleted. When `author` is set only events by that
    /// pubkey are affected. Returns the number of rows tombstoned.
    pub async fn tombstone(
        &self,
        targets: Vec<DeletionTarget>,
        author: Option<String>,
        deleted_by: String,
        before: Timestamp,
    ) -> Result<usize, Error> {
        if targets.is_empty() {
            return Ok(0);
        }
        self.write(move |conn| {
            let tx = conn.transaction()?;
            let count = tombstone_in_tx(
                &tx,
                &targets,
                author.as_deref(),
                &deleted_by,
                before.as_u64(),
            )?;
            tx.commit()?;
            Ok(count)
        })
        .await
    }

    /// Historical events for `filter`, newest first, fetched page by page as
    /// the stream is polled.
    pub fn query_stream(&self, filter: Filter) -> impl Stream<Item = Result<Event, Error>> + Send {
        let remaining = self.inner.limits.effective_limit(&filter);
        let state = PageState {
            db: self.clone(),
            filter: Arc::new(filter),
            after: None,
            remaining,
        };

        stream::try_unfold(state, |mut state| async move {
            if state.remaining == 0 {
                return Ok(None);
            }
            let page_len = state.remaining.min(state.db.inner.limits.page_size.max(1));
            let page = state
                .db
                .query_page(state.filter.clone(), state.after.clone(), page_len)
                .await?;

            if page.len() < page_len {
                state.remaining = 0;
            } else {
                state.remaining -= page.len();
            }
            let Some(last) = page.last() else {
                return Ok(None);
            };
            state.after = Some(PageCursor {
                created_at: last.created_at.as_u64(),
                id: last.id.to_hex(),
            });
            Ok::<_, Error>(Some((stream::iter(page.into_iter().map(Ok)), state)))
        })
        .try_flatten()
    }

    pub async fn query(&self, filter: Filter) -> Result<Vec<Event>, Error> {
        let events: Vec<Event> = self.query_stream(filter).try_collect().await?;
        debug!(target: "storage", "Fetched {} events", events.len());
        Ok(events)
    }

    async fn query_page(
        &self,
        filter: Arc<Filter>,
        after: Option<PageCursor>,
        page_len: usize,
    ) -> Result<Vec<Event>, Error> {
        let Some((sql, values)) = build_query(&filter, after.as_ref(), page_len) else {
            return Ok(Vec::new());
        };
        self.read(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                row.get::<_, String>(0)
            })?;

            let mut events = Vec::new();
            for row in rows {
                let event: Event = serde_json::from_str(&row?)?;
                events.push(event);
            }
            Ok(events)
        })
        .await
    }

    /// Includes tombstoned rows.
    pub async fn get_event(&self, id: String) -> Result<Option<(Event, bool)>, Error> {
        self.read(move |conn| {
            let row = conn
                .query_row(
                    "SELECT raw, deleted FROM events WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
                )
                .optional()?;
            match row {
                Some((raw, deleted)) => Ok(Some((serde_json::from_str(&raw)?, deleted))),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn is_command_applied(&self, id: String) -> Result<bool, Error> {
        self.read(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM applied_commands WHERE event_id = ?1",
                    params![id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
        .await
    }

    pub async fn mark_command_applied(&self, id: String) -> Result<(), Error> {
        self.write(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO applied_commands (event_id, applied_at) VALUES (?1, ?2)",
                params![id, sql_timestamp(Timestamp::now().as_u64())],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn count_events(&self) -> Result<u64, Error> {
        self.read(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM events WHERE deleted = 0", [], |row| {
                    row.get(0)
                })?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

fn store_in_tx(
    tx: &Transaction<'_>,
    event: &Event,
    class: KindClass,
    raw: &str,
) -> Result<StoreOutcome, Error> {
    let id = event.id.to_hex();
    let pubkey = event.pubkey.to_hex();
    let created_at = sql_timestamp(event.created_at.as_u64());
    let kind = event.kind.as_u16() as i64;

    let exists = tx
        .query_row("SELECT 1 FROM events WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?
        .is_some();
    if exists {
        return Ok(StoreOutcome::Duplicate);
    }

    let d_tag = match class {
        KindClass::ParameterizedReplaceable => Some(identifier(event)),
        _ => None,
    };

    if class.is_replaceable() {
        let newest: Option<i64> = tx.query_row(
            "SELECT MAX(created_at) FROM events WHERE pubkey = ?1 AND kind = ?2 AND d_tag IS ?3",
            params![pubkey, kind, d_tag],
            |row| row.get(0),
        )?;
        if newest.is_some_and(|newest| newest >= created_at) {
            debug!(
                target: "storage",
                "Event {} superseded by stored event at {}", id, newest.unwrap_or_default()
            );
            return Ok(StoreOutcome::Superseded);
        }
        let replaced = tx.execute(
            "DELETE FROM events WHERE pubkey = ?1 AND kind = ?2 AND d_tag IS ?3",
            params![pubkey, kind, d_tag],
        )?;
        if replaced > 0 {
            debug!(target: "storage", "Event {} replaced {} older version(s)", id, replaced);
        }
    }

    tx.execute(
        "INSERT INTO events (id, pubkey, created_at, kind, d_tag, raw, first_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            pubkey,
            created_at,
            kind,
            d_tag,
            raw,
            sql_timestamp(Timestamp::now().as_u64())
        ],
    )?;

    {
        let mut insert_tag =
            tx.prepare_cached("INSERT INTO event_tags (event_id, name, value) VALUES (?1, ?2, ?3)")?;
        for (name, value) in indexed_tags(event) {
            insert_tag.execute(params![id, name, value])?;
        }
    }

    if event.kind == KIND_DELETION_5 {
        let targets = deletion_targets(event);
        let count = tombstone_in_tx(
            tx,
            &targets,
            Some(&pubkey),
            &id,
            event.created_at.as_u64(),
        )?;
        debug!(target: "storage", "Deletion {} tombstoned {} event(s)", id, count);
    }

    Ok(StoreOutcome::Stored)
}

fn tombstone_in_tx(
    tx: &Transaction<'_>,
    targets: &[DeletionTarget],
    author: Option<&str>,
    deleted_by: &str,
    before: u64,
) -> Result<usize, Error> {
    let deletion_kind = KIND_DELETION_5.as_u16() as i64;
    let mut count = 0;
    for target in targets {
        count += match target {
            DeletionTarget::Event(id) => tx.execute(
                "UPDATE events SET deleted = 1, deleted_by = ?1
                 WHERE id = ?2 AND deleted = 0 AND kind != ?3 AND (?4 IS NULL OR pubkey = ?4)",
                params![deleted_by, id, deletion_kind, author],
            )?,
            DeletionTarget::Address {
                kind,
                pubkey,
                identifier,
            } => tx.execute(
                "UPDATE events SET deleted = 1, deleted_by = ?1
                 WHERE kind = ?2 AND pubkey = ?3 AND IFNULL(d_tag, '') = ?4
                   AND created_at <= ?5 AND deleted = 0 AND (?6 IS NULL OR pubkey = ?6)",
                params![
                    deleted_by,
                    *kind as i64,
                    pubkey,
                    identifier,
                    sql_timestamp(before),
                    author
                ],
            )?,
        };
    }
    Ok(count)
}

#[derive(Debug, Clone)]
struct PageCursor {
    created_at: u64,
    id: String,
}

struct PageState {
    db: RelayDatabase,
    filter: Arc<Filter>,
    after: Option<PageCursor>,
    remaining: usize,
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// Builds the SQL for one page. Returns `None` when a field holds an empty
/// set, since such a filter can never match.
fn build_query(
    filter: &Filter,
    after: Option<&PageCursor>,
    limit: usize,
) -> Option<(String, Vec<SqlValue>)> {
    let mut sql = String::from("SELECT e.raw FROM events e WHERE e.deleted = 0");
    let mut values: Vec<SqlValue> = Vec::new();

    if let Some(ids) = &filter.ids {
        if ids.is_empty() {
            return None;
        }
        sql.push_str(&format!(" AND e.id IN ({})", placeholders(ids.len())));
        values.extend(ids.iter().map(|id| SqlValue::Text(id.to_hex())));
    }

    if let Some(authors) = &filter.authors {
        if authors.is_empty() {
            return None;
        }
        sql.push_str(&format!(" AND e.pubkey IN ({})", placeholders(authors.len())));
        values.extend(authors.iter().map(|pk| SqlValue::Text(pk.to_hex())));
    }

    if let Some(kinds) = &filter.kinds {
        if kinds.is_empty() {
            return None;
        }
        sql.push_str(&format!(" AND e.kind IN ({})", placeholders(kinds.len())));
        values.extend(
            kinds
                .iter()
                .map(|kind| SqlValue::Integer(kind.as_u16() as i64)),
        );
    }

    if let Some(since) = filter.since {
        sql.push_str(" AND e.created_at >= ?");
        values.push(SqlValue::Integer(sql_timestamp(since.as_u64())));
    }

    if let Some(until) = filter.until {
        sql.push_str(" AND e.created_at <= ?");
        values.push(SqlValue::Integer(sql_timestamp(until.as_u64())));
    }

    for (tag, tag_values) in filter.generic_tags.iter() {
        if tag_values.is_empty() {
            return None;
        }
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM event_tags t WHERE t.event_id = e.id AND t.name = ? AND t.value IN ({}))",
            placeholders(tag_values.len())
        ));
        values.push(SqlValue::Text(tag.as_char().to_string()));
        values.extend(tag_values.iter().map(|value| SqlValue::Text(value.clone())));
    }

    if let Some(cursor) = after {
        sql.push_str(" AND (e.created_at < ? OR (e.created_at = ? AND e.id > ?))");
        values.push(SqlValue::Integer(sql_timestamp(cursor.created_at)));
        values.push(SqlValue::Integer(sql_timestamp(cursor.created_at)));
        values.push(SqlValue::Text(cursor.id.clone()));
    }

    sql.push_str(" ORDER BY e.created_at DESC, e.id ASC LIMIT ?");
    values.push(SqlValue::Integer(limit as i64));

    Some((sql, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{setup_test, signed_event, signed_event_at, tag};
    use nostr::{Alphabet, Keys, Kind, SingleLetterTag};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_regular_event_is_stored_once() {
        let (_tmp_dir, database, keys) = setup_test().await;
        let event = signed_event(&keys, Kind::TextNote, "hello", vec![]);

        assert_eq!(database.save_event(&event).await.unwrap(), StoreOutcome::Stored);
        assert_eq!(
            database.save_event(&event).await.unwrap(),
            StoreOutcome::Duplicate
        );

        let events = database
            .query(Filter::new().id(event.id))
            .await
            .unwrap();
        assert_eq!(events, vec![event]);
    }

    #[tokio::test]
    async fn test_replaceable_keeps_newest() {
        let (_tmp_dir, database, keys) = setup_test().await;
        let newer = signed_event_at(&keys, Kind::Metadata, "{\"name\":\"new\"}", vec![], 100);
        let older = signed_event_at(&keys, Kind::Metadata, "{\"name\":\"old\"}", vec![], 50);

        assert_eq!(database.save_event(&newer).await.unwrap(), StoreOutcome::Stored);
        assert_eq!(
            database.save_event(&older).await.unwrap(),
            StoreOutcome::Superseded
        );

        let events = database
            .query(Filter::new().author(keys.public_key()).kind(Kind::Metadata))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, newer.id);

        let newest = signed_event_at(&keys, Kind::Metadata, "{\"name\":\"newest\"}", vec![], 200);
        assert_eq!(database.save_event(&newest).await.unwrap(), StoreOutcome::Stored);
        let events = database
            .query(Filter::new().author(keys.public_key()).kind(Kind::Metadata))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, newest.id);
    }

    #[tokio::test]
    async fn test_parameterized_replaceable_is_keyed_by_identifier() {
        let (_tmp_dir, database, keys) = setup_test().await;
        let kind = Kind::Custom(30_023);
        let first = signed_event_at(&keys, kind, "a1", vec![tag(&["d", "a"])], 100);
        let other = signed_event_at(&keys, kind, "b1", vec![tag(&["d", "b"])], 100);
        let second = signed_event_at(&keys, kind, "a2", vec![tag(&["d", "a"])], 150);

        for event in [&first, &other, &second] {
            assert_eq!(database.save_event(event).await.unwrap(), StoreOutcome::Stored);
        }

        let events = database.query(Filter::new().kind(kind)).await.unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![second.id, other.id]);
    }

    #[tokio::test]
    async fn test_ephemeral_is_not_persisted() {
        let (_tmp_dir, database, keys) = setup_test().await;
        let event = signed_event(&keys, Kind::Custom(20_001), "typing", vec![]);
        assert_eq!(
            database.save_event(&event).await.unwrap(),
            StoreOutcome::NotPersisted
        );
        assert_eq!(database.count_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_author_and_kind_filter_ordering() {
        let (_tmp_dir, database, keys) = setup_test().await;
        let other = Keys::generate();
        for (created_at, author, kind) in [
            (10, &keys, Kind::TextNote),
            (30, &keys, Kind::TextNote),
            (20, &keys, Kind::TextNote),
            (40, &keys, Kind::Reaction),
            (50, &other, Kind::TextNote),
        ] {
            let event = signed_event_at(author, kind, "x", vec![], created_at);
            database.save_event(&event).await.unwrap();
        }

        let events = database
            .query(Filter::new().author(keys.public_key()).kind(Kind::TextNote))
            .await
            .unwrap();
        let timestamps: Vec<u64> = events.iter().map(|e| e.created_at.as_u64()).collect();
        assert_eq!(timestamps, vec![30, 20, 10]);
        assert!(events
            .iter()
            .all(|e| e.pubkey == keys.public_key() && e.kind == Kind::TextNote));
    }

    #[tokio::test]
    async fn test_tag_filter_uses_index() {
        let (_tmp_dir, database, keys) = setup_test().await;
        let general = signed_event(&keys, Kind::TextNote, "a", vec![tag(&["h", "general"])]);
        let private = signed_event(&keys, Kind::TextNote, "b", vec![tag(&["h", "private"])]);
        database.save_event(&general).await.unwrap();
        database.save_event(&private).await.unwrap();

        let filter = Filter::new().custom_tag(SingleLetterTag::lowercase(Alphabet::H), "general");
        let events = database.query(filter).await.unwrap();
        assert_eq!(events, vec![general]);
    }

    #[tokio::test]
    async fn test_limit_and_paging() {
        let (tmp_dir, _, keys) = setup_test().await;
        let database = RelayDatabase::open(
            tmp_dir.path().join("paged.db"),
            QueryLimits {
                page_size: 3,
                default_limit: 7,
                ..QueryLimits::default()
            },
        )
        .unwrap();
        for created_at in 0..10 {
            let event = signed_event_at(&keys, Kind::TextNote, "x", vec![], 1000 + created_at);
            database.save_event(&event).await.unwrap();
        }

        let events = database.query(Filter::new()).await.unwrap();
        assert_eq!(events.len(), 7);
        assert_eq!(events[0].created_at.as_u64(), 1009);
        assert_eq!(events[6].created_at.as_u64(), 1003);

        let events = database.query(Filter::new().limit(2)).await.unwrap();
        assert_eq!(events.len(), 2);

        let events = database.query(Filter::new().limit(0)).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_author_deletion_tombstones() {
        let (_tmp_dir, database, keys) = setup_test().await;
        let stranger = Keys::generate();
        let note = signed_event(&keys, Kind::TextNote, "oops", vec![]);
        database.save_event(&note).await.unwrap();

        let forged = signed_event(
            &stranger,
            Kind::EventDeletion,
            "",
            vec![tag(&["e", &note.id.to_hex()])],
        );
        database.save_event(&forged).await.unwrap();
        assert_eq!(database.query(Filter::new().id(note.id)).await.unwrap().len(), 1);

        let deletion = signed_event(
            &keys,
            Kind::EventDeletion,
            "",
            vec![tag(&["e", &note.id.to_hex()])],
        );
        assert_eq!(
            database.save_event(&deletion).await.unwrap(),
            StoreOutcome::Stored
        );
        assert!(database.query(Filter::new().id(note.id)).await.unwrap().is_empty());

        let (stored, deleted) = database.get_event(note.id.to_hex()).await.unwrap().unwrap();
        assert_eq!(stored.id, note.id);
        assert!(deleted);
    }

    #[tokio::test]
    async fn test_moderated_tombstone_by_address() {
        let (_tmp_dir, database, keys) = setup_test().await;
        let kind = Kind::Custom(30_023);
        let article = signed_event_at(&keys, kind, "post", vec![tag(&["d", "intro"])], 100);
        database.save_event(&article).await.unwrap();

        let address = format!("30023:{}:intro", keys.public_key().to_hex());
        let targets = deletion_targets(&signed_event(
            &Keys::generate(),
            Kind::Custom(9005),
            "",
            vec![tag(&["a", &address])],
        ));
        let count = database
            .tombstone(targets, None, "moderator".to_string(), Timestamp::from(200))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(database.query(Filter::new().kind(kind)).await.unwrap().is_empty());
    }

    #[test]
    fn test_deletion_targets_skip_malformed() {
        let keys = Keys::generate();
        let event = signed_event(
            &keys,
            Kind::EventDeletion,
            "",
            vec![
                tag(&["e", "not-hex"]),
                tag(&["a", "abc:def"]),
                tag(&["e", &"ab".repeat(32)]),
            ],
        );
        assert_eq!(
            deletion_targets(&event),
            vec![DeletionTarget::Event("ab".repeat(32))]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_bounds_agree_with_live_matching() {
        let (_tmp_dir, database, keys) = setup_test().await;
        let note = signed_event_at(&keys, Kind::TextNote, "x", vec![], 1_000);
        database.save_event(&note).await.unwrap();

        let far_since = Filter::new().since(Timestamp::from(u64::MAX));
        assert!(!crate::filter::matches(&far_since, &note));
        assert!(database.query(far_since).await.unwrap().is_empty());

        let far_until = Filter::new().until(Timestamp::from(u64::MAX));
        assert!(crate::filter::matches(&far_until, &note));
        assert_eq!(database.query(far_until).await.unwrap(), vec![note]);
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let mut attempts = 0;
        let result = with_retry(|| {
            attempts += 1;
            if attempts < MAX_ATTEMPTS {
                Err(Error::storage("database is locked", true))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), MAX_ATTEMPTS);

        let mut attempts = 0;
        let error = with_retry(|| -> Result<(), Error> {
            attempts += 1;
            Err(Error::storage("database is locked", true))
        })
        .unwrap_err();
        assert_eq!(attempts, MAX_ATTEMPTS);
        assert_eq!(error.client_reason(), "error: storage unavailable");

        let mut attempts = 0;
        let error = with_retry(|| -> Result<(), Error> {
            attempts += 1;
            Err(Error::storage("disk image is malformed", false))
        })
        .unwrap_err();
        assert_eq!(attempts, 1);
        assert!(!error.is_transient());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_replaceable_publishers_keep_newest() {
        let (_tmp_dir, database, keys) = setup_test().await;
        let events: Vec<Event> = (0..20u64)
            .map(|i| {
                signed_event_at(
                    &keys,
                    Kind::Metadata,
                    &format!("{{\"name\":\"v{i}\"}}"),
                    vec![],
                    100 + (i * 7) % 20,
                )
            })
            .collect();
        let newest = events
            .iter()
            .max_by_key(|event| event.created_at)
            .map(|event| event.id)
            .unwrap();

        let tasks: Vec<_> = events
            .into_iter()
            .map(|event| {
                let database = database.clone();
                tokio::spawn(async move { database.save_event(&event).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = database
            .query(Filter::new().author(keys.public_key()).kind(Kind::Metadata))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, newest);
        assert_eq!(database.count_events().await.unwrap(), 1);
    }
}
