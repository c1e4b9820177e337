//! SQLite activity store.
//!
//! Records live in one `activity_logs` table whose `data` column holds the
//! payload as a JSON document. The payload predicate strategy is chosen once
//! at construction: with JSON functions available conditions render natively,
//! otherwise they fall back to substring matches. A query whose payload
//! conditions are not rendered exactly is narrowed in SQL and then re-checked
//! row by row, so both strategies return the same rows.
//!
//! Keyword search folds ASCII letters only, matching SQLite's `lower()`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::DateTime;
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Deserialize;

use super::predicate::{json_path, JsonPredicates, PatternPredicates, PayloadPredicates, SqlFragment};
use super::{ActivityQuery, ActivityStore, MergePatch, StoreFeatures};
use crate::activity::{ActivityRecord, Payload};
use crate::error::{StoreError, StoreErrorKind};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS activity_logs (
    id          TEXT PRIMARY KEY NOT NULL,
    user_id     TEXT NOT NULL DEFAULT '',
    actor_id    TEXT NOT NULL DEFAULT '',
    tenant_id   TEXT NOT NULL DEFAULT '',
    org_id      TEXT NOT NULL DEFAULT '',
    verb        TEXT NOT NULL,
    object_type TEXT NOT NULL DEFAULT '',
    object_id   TEXT NOT NULL DEFAULT '',
    channel     TEXT NOT NULL DEFAULT '',
    ip          TEXT NOT NULL DEFAULT '',
    data        TEXT NOT NULL DEFAULT '{}',
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activity_logs_cursor
    ON activity_logs (created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_activity_logs_scope
    ON activity_logs (tenant_id, org_id, created_at DESC);
";

const COLUMNS: &str =
    "id, user_id, actor_id, tenant_id, org_id, verb, object_type, object_id, channel, ip, data, created_at";

/// Whether payload predicates may use SQLite's JSON functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonSupport {
    /// Probe the linked SQLite at construction.
    #[default]
    Auto,
    /// Require JSON functions; construction fails without them.
    Enabled,
    /// Use substring predicates even when JSON functions exist.
    Disabled,
}

/// Construction options for [`SqliteStore`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SqliteOptions {
    /// Payload predicate capability
    pub json: JsonSupport,
    /// How long a writer waits on a locked database, in milliseconds
    pub busy_timeout_ms: Option<u64>,
}

/// Activity store on a SQLite database.
///
/// The connection is serialized behind a mutex. Payload merges are a single
/// `UPDATE` in JSON mode and an `IMMEDIATE` transaction otherwise, so they
/// stay atomic across connections to the same file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    predicates: Box<dyn PayloadPredicates>,
    features: StoreFeatures,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (and if needed creates) a database file.
    pub fn open(path: impl AsRef<Path>, options: SqliteOptions) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?, options)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(options: SqliteOptions) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, options)
    }

    /// Wraps an existing connection, creating the schema when absent.
    ///
    /// # Errors
    ///
    /// `Backend` when `JsonSupport::Enabled` is requested but the linked
    /// SQLite lacks JSON functions.
    pub fn from_connection(conn: Connection, options: SqliteOptions) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms.unwrap_or(5_000)))?;
        conn.execute_batch(SCHEMA)?;

        let json_available = probe_json(&conn);
        let json_payload = match options.json {
            JsonSupport::Auto => json_available,
            JsonSupport::Enabled if !json_available => {
                return Err(StoreError::with_message(
                    StoreErrorKind::Backend,
                    "JSON functions are not available in this SQLite build",
                ));
            }
            JsonSupport::Enabled => true,
            JsonSupport::Disabled => false,
        };
        let predicates: Box<dyn PayloadPredicates> = if json_payload {
            Box::new(JsonPredicates::new())
        } else {
            Box::new(PatternPredicates::new())
        };
        tracing::debug!(target: "activity_store", json_payload, "sqlite store ready");

        Ok(Self {
            conn: Mutex::new(conn),
            predicates,
            features: StoreFeatures { json_payload },
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::with_message(StoreErrorKind::Backend, "connection lock poisoned"))
    }

    fn where_clause(&self, query: &ActivityQuery, with_cursor: bool) -> SqlFragment {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(tenant) = &query.tenant_id {
            clauses.push("tenant_id = ?".into());
            params.push(SqlValue::Text(tenant.clone()));
        }
        if let Some(org) = &query.org_id {
            clauses.push("org_id = ?".into());
            params.push(SqlValue::Text(org.clone()));
        }
        match (&query.user_id, &query.actor_id) {
            (Some(user), Some(actor)) => {
                clauses.push("(user_id = ? OR actor_id = ?)".into());
                params.push(SqlValue::Text(user.clone()));
                params.push(SqlValue::Text(actor.clone()));
            }
            (Some(user), None) => {
                clauses.push("user_id = ?".into());
                params.push(SqlValue::Text(user.clone()));
            }
            (None, Some(actor)) => {
                clauses.push("actor_id = ?".into());
                params.push(SqlValue::Text(actor.clone()));
            }
            (None, None) => {}
        }
        if !query.verbs.is_empty() {
            clauses.push(format!("verb IN ({})", placeholders(query.verbs.len())));
            params.extend(query.verbs.iter().cloned().map(SqlValue::Text));
        }
        if let Some(object_type) = &query.object_type {
            clauses.push("object_type = ?".into());
            params.push(SqlValue::Text(object_type.clone()));
        }
        if let Some(object_id) = &query.object_id {
            clauses.push("object_id = ?".into());
            params.push(SqlValue::Text(object_id.clone()));
        }
        if let Some(channels) = &query.channels {
            if channels.is_empty() {
                clauses.push("0".into());
            } else {
                clauses.push(format!("channel IN ({})", placeholders(channels.len())));
                params.extend(channels.iter().cloned().map(SqlValue::Text));
            }
        }
        if !query.exclude_channels.is_empty() {
            clauses.push(format!(
                "channel NOT IN ({})",
                placeholders(query.exclude_channels.len())
            ));
            params.extend(query.exclude_channels.iter().cloned().map(SqlValue::Text));
        }
        if let Some(since) = query.since {
            clauses.push("created_at >= ?".into());
            params.push(SqlValue::Integer(since.timestamp_micros()));
        }
        if let Some(until) = query.until {
            clauses.push("created_at < ?".into());
            params.push(SqlValue::Integer(until.timestamp_micros()));
        }
        if let Some(keyword) = &query.keyword {
            clauses.push(
                "(instr(lower(verb), ?) > 0 OR instr(lower(object_type), ?) > 0 OR instr(lower(object_id), ?) > 0)"
                    .into(),
            );
            for _ in 0..3 {
                params.push(SqlValue::Text(keyword.clone()));
            }
        }
        if !query.require_any.is_empty() {
            let fragment = SqlFragment::any(
                query
                    .require_any
                    .iter()
                    .map(|c| self.predicates.select(c))
                    .collect(),
            );
            clauses.push(format!("({})", fragment.sql));
            params.extend(fragment.params);
        }
        for condition in &query.exclude_any {
            let fragment = self.predicates.reject(condition);
            clauses.push(fragment.sql);
            params.extend(fragment.params);
        }
        if with_cursor {
            if let Some(cursor) = &query.cursor {
                let micros = cursor.created_at.timestamp_micros();
                clauses.push("(created_at < ? OR (created_at = ? AND id < ?))".into());
                params.push(SqlValue::Integer(micros));
                params.push(SqlValue::Integer(micros));
                params.push(SqlValue::Text(cursor.id.clone()));
            }
        }

        if clauses.is_empty() {
            SqlFragment::new("", params)
        } else {
            SqlFragment::new(format!("WHERE {}", clauses.join(" AND ")), params)
        }
    }

    fn needs_recheck(&self, query: &ActivityQuery) -> bool {
        query
            .require_any
            .iter()
            .chain(&query.exclude_any)
            .any(|c| !self.predicates.is_exact(c))
    }

    /// Every row matching the query, ignoring cursor and limit, re-checked in process.
    fn scan_rechecked(&self, query: &ActivityQuery) -> Result<Vec<ActivityRecord>, StoreError> {
        self.list(&query.without_pagination())
    }

    fn merge_in_statement(conn: &Connection, id: &str, patch: &MergePatch) -> Result<usize, StoreError> {
        let mut expr = String::from("CASE WHEN json_valid(data) THEN data ELSE '{}' END");
        let mut params: Vec<SqlValue> = Vec::new();

        for (func, entries) in [("json_insert", &patch.set_if_missing), ("json_set", &patch.force)] {
            if entries.is_empty() {
                continue;
            }
            let mut call = format!("{}({}", func, expr);
            for (key, value) in entries {
                // Callers route unsafe keys to the transactional path.
                let path = json_path(key).unwrap_or_default();
                call.push_str(", ?, json(?)");
                params.push(SqlValue::Text(path));
                params.push(SqlValue::Text(value.to_string()));
            }
            call.push(')');
            expr = call;
        }
        params.push(SqlValue::Text(id.to_string()));

        let sql = format!("UPDATE activity_logs SET data = {} WHERE id = ?", expr);
        Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
    }

    fn merge_in_transaction(conn: &mut Connection, id: &str, patch: &MergePatch) -> Result<usize, StoreError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw: Option<String> = tx
            .query_row("SELECT data FROM activity_logs WHERE id = ?", [id], |row| row.get(0))
            .optional()?;
        let Some(raw) = raw else {
            return Ok(0);
        };
        let mut data: Payload = serde_json::from_str(&raw)?;
        if patch.apply(&mut data) {
            tx.execute(
                "UPDATE activity_logs SET data = ? WHERE id = ?",
                params![serde_json::to_string(&data)?, id],
            )?;
        }
        tx.commit()?;
        Ok(1)
    }
}

impl ActivityStore for SqliteStore {
    fn features(&self) -> StoreFeatures {
        self.features
    }

    fn insert(&self, record: &ActivityRecord) -> Result<(), StoreError> {
        let data = serde_json::to_string(&record.data)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO activity_logs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                COLUMNS
            ),
            params![
                record.id,
                record.user_id,
                record.actor_id,
                record.tenant_id,
                record.org_id,
                record.verb,
                record.object_type,
                record.object_id,
                record.channel,
                record.ip,
                data,
                record.created_at.timestamp_micros(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ActivityRecord>, StoreError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM activity_logs WHERE id = ?", COLUMNS),
                [id],
                read_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list(&self, query: &ActivityQuery) -> Result<Vec<ActivityRecord>, StoreError> {
        let recheck = self.needs_recheck(query);
        let mut filter = self.where_clause(query, true);
        // Over-selected rows are filtered below, so the limit moves out of SQL.
        let limit = match query.limit {
            Some(l) if !recheck => i64::try_from(l).unwrap_or(i64::MAX),
            _ => -1,
        };
        filter.params.push(SqlValue::Integer(limit));

        let sql = format!(
            "SELECT {} FROM activity_logs {} ORDER BY created_at DESC, id DESC LIMIT ?",
            COLUMNS, filter.sql
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(filter.params.iter()), read_record)?;

        let mut records = Vec::new();
        for row in rows {
            if query.limit.map_or(false, |l| records.len() >= l) {
                break;
            }
            let record = row?;
            if recheck && !query.matches(&record) {
                continue;
            }
            records.push(record);
        }
        Ok(records)
    }

    fn count(&self, query: &ActivityQuery) -> Result<u64, StoreError> {
        if self.needs_recheck(query) {
            return Ok(self.scan_rechecked(query)?.len() as u64);
        }
        let filter = self.where_clause(query, false);
        let sql = format!("SELECT COUNT(*) FROM activity_logs {}", filter.sql);
        let conn = self.lock()?;
        let count: i64 = conn.query_row(&sql, params_from_iter(filter.params.iter()), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn count_by_verb(&self, query: &ActivityQuery) -> Result<BTreeMap<String, u64>, StoreError> {
        if self.needs_recheck(query) {
            let mut counts = BTreeMap::new();
            for record in self.scan_rechecked(query)? {
                *counts.entry(record.verb).or_insert(0) += 1;
            }
            return Ok(counts);
        }
        let filter = self.where_clause(query, false);
        let sql = format!(
            "SELECT verb, COUNT(*) FROM activity_logs {} GROUP BY verb",
            filter.sql
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(filter.params.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (verb, count) = row?;
            counts.insert(verb, count.max(0) as u64);
        }
        Ok(counts)
    }

    fn merge_data(&self, id: &str, patch: &MergePatch) -> Result<(), StoreError> {
        let single_statement = self.features.json_payload
            && patch
                .set_if_missing
                .keys()
                .chain(patch.force.keys())
                .all(|k| json_path(k).is_some());

        let mut conn = self.lock()?;
        let touched = if patch.is_empty() {
            conn.query_row("SELECT COUNT(*) FROM activity_logs WHERE id = ?", [id], |row| {
                row.get::<_, i64>(0)
            })? as usize
        } else if single_statement {
            Self::merge_in_statement(&conn, id, patch)?
        } else {
            Self::merge_in_transaction(&mut conn, id, patch)?
        };

        if touched == 0 {
            return Err(StoreError::with_message(StoreErrorKind::NotFound, id.to_string()));
        }
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn probe_json(conn: &Connection) -> bool {
    conn.query_row("SELECT json_valid('{}')", [], |row| row.get::<_, i64>(0))
        .map(|v| v == 1)
        .unwrap_or(false)
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<ActivityRecord> {
    let raw: String = row.get(10)?;
    let data: Payload = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;
    let micros: i64 = row.get(11)?;
    let created_at = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            11,
            Type::Integer,
            Box::new(StoreError::with_message(
                StoreErrorKind::Serialization,
                format!("timestamp {} out of range", micros),
            )),
        )
    })?;

    Ok(ActivityRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        actor_id: row.get(2)?,
        tenant_id: row.get(3)?,
        org_id: row.get(4)?,
        verb: row.get(5)?,
        object_type: row.get(6)?,
        object_id: row.get(7)?,
        channel: row.get(8)?,
        ip: row.get(9)?,
        data,
        created_at,
    })
}
