// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-based statistics storage.
//!
//! One `<prefix>stats_group` row per snapshot and one `<prefix>stats_stat`
//! row per top-level stat, with the stat's children serialized as JSON.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use super::{Filters, Histogram, StatDetails, Storage, StorageResult, StatsFilter};
use crate::core::{Stat, Stats};
use crate::error::StorageError;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Snapshots returned per histogram call before paging kicks in.
pub const DEFAULT_HISTOGRAM_PAGE_SIZE: usize = 1000;

const GROUP_FIELDS: &str =
    "id, start_date, end_date, stats_left, lost, fatal_error, app_instance, app_type";

// ?1 from, ?2 to, ?3 instance, ?4 type; NULL disables a condition
const GROUP_FILTER: &str = "(?1 IS NULL OR end_date IS NULL OR end_date >= ?1) \
     AND (?2 IS NULL OR start_date IS NULL OR start_date <= ?2) \
     AND (?3 IS NULL OR app_instance = ?3) \
     AND (?4 IS NULL OR app_type = ?4)";

/// One `stats_group` row.
#[derive(Debug, Clone)]
struct Group {
    id: String,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    stats_left: u64,
    lost: u64,
    fatal_error: Option<String>,
}

impl Group {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            start_date: row.get::<_, Option<i64>>(1)?.and_then(DateTime::<Utc>::from_timestamp_millis),
            end_date: row.get::<_, Option<i64>>(2)?.and_then(DateTime::<Utc>::from_timestamp_millis),
            stats_left: row.get::<_, i64>(3)?.max(0) as u64,
            lost: row.get::<_, i64>(4)?.max(0) as u64,
            fatal_error: row.get(5)?,
        })
    }

    fn into_stats(self) -> Stats {
        let mut stats = Stats::empty();
        stats.stats_left = self.stats_left;
        stats.lost = self.lost;
        stats.fatal_error = self.fatal_error;
        stats.start_date = self.start_date;
        stats.end_date = self.end_date;
        stats
    }
}

fn millis(date: Option<DateTime<Utc>>) -> Option<i64> {
    date.map(|d| d.timestamp_millis())
}

/// Read `name, hits, err, max, min, avg, has_children[, children]` starting
/// at column `offset`.
fn read_stat(row: &Row<'_>, offset: usize, with_children: bool) -> rusqlite::Result<(String, Stat)> {
    let name: String = row.get(offset)?;
    let has_children: bool = row.get(offset + 6)?;
    let children = if !has_children {
        None
    } else if with_children {
        let json: Option<String> = row.get(offset + 7)?;
        match json {
            Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(offset + 7, Type::Text, Box::new(e))
            })?),
            None => Some(HashMap::new()),
        }
    } else {
        Some(HashMap::new())
    };

    let stat = Stat {
        hits: row.get::<_, i64>(offset + 1)?.max(0) as u64,
        err: row.get::<_, i64>(offset + 2)?.max(0) as u64,
        max: row.get(offset + 3)?,
        min: row.get(offset + 4)?,
        avg: row.get(offset + 5)?,
        children,
    };
    Ok((name, stat))
}

/// Statistics storage using SQLite.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    prefix: String,
    histogram_page_size: usize,
}

impl SqliteStorage {
    /// Open or create a database file, using tables named `<prefix>stats_*`.
    pub fn open(db_path: &Path, prefix: &str) -> StorageResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).map_err(|e| {
            StorageError::Database(format!("Failed to open stats database: {}", e))
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StorageError::Database(format!("Failed to set pragmas: {}", e)))?;

        Self::with_connection(conn, prefix)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(prefix: &str) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, prefix)
    }

    fn with_connection(conn: Connection, prefix: &str) -> StorageResult<Self> {
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StorageError::InvalidArgument(format!(
                "table prefix may only contain letters, digits and '_': {}",
                prefix
            )));
        }
        conn.busy_timeout(StdDuration::from_secs(5))?;

        let storage = Self {
            conn: Mutex::new(conn),
            prefix: prefix.to_string(),
            histogram_page_size: DEFAULT_HISTOGRAM_PAGE_SIZE,
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Limit how many snapshots one histogram call walks.
    pub fn with_histogram_page_size(mut self, size: usize) -> Self {
        self.histogram_page_size = size.max(1);
        self
    }

    /// Table name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn group_table(&self) -> String {
        format!("{}stats_group", self.prefix)
    }

    fn stat_table(&self) -> String {
        format!("{}stats_stat", self.prefix)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let groups = self.group_table();
        let stats = self.stat_table();
        let conn = self.conn.lock();

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS {groups} (
                id TEXT PRIMARY KEY,
                start_date INTEGER,
                end_date INTEGER,
                stats_left INTEGER NOT NULL,
                lost INTEGER NOT NULL,
                fatal_error TEXT,
                app_instance TEXT,
                app_type TEXT
            );

            CREATE TABLE IF NOT EXISTS {stats} (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                name TEXT NOT NULL,
                hits INTEGER NOT NULL,
                err INTEGER NOT NULL,
                max INTEGER NOT NULL,
                min INTEGER NOT NULL,
                avg REAL NOT NULL,
                has_children INTEGER NOT NULL,
                children TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_{groups}_dates ON {groups}(start_date, end_date);
            CREATE INDEX IF NOT EXISTS idx_{stats}_group ON {stats}(group_id, name);
            "#
        ))
        .map_err(|e| StorageError::Database(format!("Failed to create schema: {}", e)))?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        if current_version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                params![SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }

    fn insert(
        &self,
        conn: &Connection,
        stats: &Stats,
        instance: Option<&str>,
        app_type: Option<&str>,
    ) -> StorageResult<String> {
        let group_id = Uuid::new_v4().to_string();
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                self.group_table(),
                GROUP_FIELDS
            ),
            params![
                group_id,
                millis(stats.start_date),
                millis(stats.end_date),
                stats.stats_left as i64,
                stats.lost as i64,
                stats.fatal_error,
                instance,
                app_type,
            ],
        )?;

        let mut stmt = conn.prepare(&format!(
            "INSERT INTO {} (id, group_id, name, hits, err, max, min, avg, has_children, children) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.stat_table()
        ))?;
        for (name, stat) in &stats.map {
            let children = match &stat.children {
                Some(children) if !children.is_empty() => Some(serde_json::to_string(children)?),
                _ => None,
            };
            stmt.execute(params![
                Uuid::new_v4().to_string(),
                group_id,
                name,
                stat.hits as i64,
                stat.err as i64,
                stat.max,
                stat.min,
                stat.avg,
                stat.children.is_some(),
                children,
            ])?;
        }
        Ok(group_id)
    }

    fn delete_group(&self, conn: &Connection, id: &str) -> StorageResult<()> {
        conn.execute(
            &format!("DELETE FROM {} WHERE group_id = ?", self.stat_table()),
            params![id],
        )?;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?", self.group_table()),
            params![id],
        )?;
        Ok(())
    }

    fn find_groups(&self, conn: &Connection, filter: &StatsFilter) -> StorageResult<Vec<Group>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE {} ORDER BY start_date, id",
            GROUP_FIELDS,
            self.group_table(),
            GROUP_FILTER
        ))?;
        let groups = stmt
            .query_map(
                params![
                    millis(filter.from),
                    millis(filter.to),
                    filter.instance,
                    filter.app_type
                ],
                Group::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    /// Stat rows of every matching group, optionally restricted to one name.
    fn find_stats(
        &self,
        conn: &Connection,
        filter: &StatsFilter,
        name: Option<&str>,
        with_children: bool,
    ) -> StorageResult<Vec<(String, String, Stat)>> {
        let children_column = if with_children { ", s.children" } else { "" };
        let mut stmt = conn.prepare(&format!(
            "SELECT s.group_id, s.name, s.hits, s.err, s.max, s.min, s.avg, s.has_children{} \
             FROM {} s \
             WHERE (?5 IS NULL OR s.name = ?5) AND s.group_id IN (SELECT id FROM {} WHERE {})",
            children_column,
            self.stat_table(),
            self.group_table(),
            GROUP_FILTER
        ))?;
        let rows = stmt
            .query_map(
                params![
                    millis(filter.from),
                    millis(filter.to),
                    filter.instance,
                    filter.app_type,
                    name
                ],
                |row| {
                    let group_id: String = row.get(0)?;
                    let (name, stat) = read_stat(row, 1, with_children)?;
                    Ok((group_id, name, stat))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn distinct(&self, conn: &Connection, column: &str, filter: &StatsFilter) -> StorageResult<Vec<String>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT {column} FROM {} WHERE {column} IS NOT NULL AND {} ORDER BY {column}",
            self.group_table(),
            GROUP_FILTER
        ))?;
        let values = stmt
            .query_map(
                params![
                    millis(filter.from),
                    millis(filter.to),
                    filter.instance,
                    filter.app_type
                ],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<BTreeSet<String>>>()?;
        Ok(values.into_iter().collect())
    }
}

impl Storage for SqliteStorage {
    fn save(
        &self,
        stats: &Stats,
        instance: Option<&str>,
        app_type: Option<&str>,
    ) -> StorageResult<String> {
        let start = Instant::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = self.insert(&tx, stats, instance, app_type)?;
        tx.commit()?;
        debug!(
            table = %self.group_table(),
            stats = stats.map.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Saved stats group"
        );
        Ok(id)
    }

    fn replace(
        &self,
        id: Option<&str>,
        stats: &Stats,
        instance: Option<&str>,
        app_type: Option<&str>,
    ) -> StorageResult<String> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if let Some(old) = id {
            self.delete_group(&tx, old)?;
        }
        let new_id = self.insert(&tx, stats, instance, app_type)?;
        tx.commit()?;
        Ok(new_id)
    }

    fn load(&self, id: &str) -> StorageResult<Option<Stats>> {
        let conn = self.conn.lock();
        let group = conn
            .query_row(
                &format!("SELECT {} FROM {} WHERE id = ?", GROUP_FIELDS, self.group_table()),
                params![id],
                Group::from_row,
            )
            .optional()?;
        let Some(group) = group else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(&format!(
            "SELECT name, hits, err, max, min, avg, has_children, children FROM {} WHERE group_id = ?",
            self.stat_table()
        ))?;
        let map = stmt
            .query_map(params![id], |row| read_stat(row, 0, true))?
            .collect::<rusqlite::Result<HashMap<String, Stat>>>()?;

        let mut stats = group.into_stats();
        stats.map = map;
        stats.info = Some(format!("sqlite {}", self.group_table()));
        Ok(Some(stats))
    }

    fn find(&self, filter: &StatsFilter) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock();
        Ok(self
            .find_groups(&conn, filter)?
            .into_iter()
            .map(|g| g.id)
            .collect())
    }

    fn find_filters(&self, filter: &StatsFilter) -> StorageResult<Filters> {
        let conn = self.conn.lock();
        let instances = self.distinct(&conn, "app_instance", &filter.without_instance())?;
        let any_type = StatsFilter {
            instance: None,
            app_type: None,
            ..filter.clone()
        };
        let types = self.distinct(&conn, "app_type", &any_type)?;
        Ok(Filters { instances, types })
    }

    fn load_details(&self, id: &str, filter: &StatsFilter) -> StorageResult<StatDetails> {
        let start = Instant::now();
        let conn = self.conn.lock();
        let rows = self.find_stats(&conn, filter, Some(id), true)?;

        let mut details = StatDetails::new(id);
        for (_, _, stat) in &rows {
            details.add(stat);
        }
        details.info = Some(format!(
            "sqlite {}: {} rows in {}ms",
            self.stat_table(),
            rows.len(),
            start.elapsed().as_millis()
        ));
        Ok(details.finish())
    }

    fn load_details_by_ids(&self, id: &str, snapshot_ids: &[String]) -> StorageResult<StatDetails> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT name, hits, err, max, min, avg, has_children, children FROM {} \
             WHERE group_id = ? AND name = ?",
            self.stat_table()
        ))?;

        let mut details = StatDetails::new(id);
        for group_id in snapshot_ids {
            let rows = stmt
                .query_map(params![group_id, id], |row| read_stat(row, 0, true))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (_, stat) in &rows {
                details.add(stat);
            }
        }
        Ok(details.finish())
    }

    fn load_aggregated(&self, top_level_only: bool, filter: &StatsFilter) -> StorageResult<Stats> {
        let start = Instant::now();
        let conn = self.conn.lock();
        let groups = self.find_groups(&conn, filter)?;
        let rows = self.find_stats(&conn, filter, None, !top_level_only)?;

        let mut by_group: HashMap<String, Stats> = groups
            .into_iter()
            .map(|g| (g.id.clone(), g.into_stats()))
            .collect();
        for (group_id, name, stat) in rows {
            if let Some(stats) = by_group.get_mut(&group_id) {
                stats.map.insert(name, stat);
            }
        }

        let group_count = by_group.len();
        let mut aggregated = Stats::empty();
        for stats in by_group.values() {
            aggregated.merge(stats, !top_level_only);
        }
        aggregated.info = Some(format!(
            "sqlite {}: {} groups in {}ms",
            self.group_table(),
            group_count,
            start.elapsed().as_millis()
        ));
        Ok(aggregated)
    }

    fn load_histogram(
        &self,
        id: &str,
        filter: &StatsFilter,
        last_group_id: Option<&str>,
    ) -> StorageResult<Histogram> {
        let conn = self.conn.lock();
        let mut groups = self.find_groups(&conn, filter)?;
        if let Some(last) = last_group_id {
            let pos = groups.iter().position(|g| g.id == last).ok_or_else(|| {
                StorageError::NotFound(format!("histogram cursor {} is no longer in range", last))
            })?;
            groups.drain(..=pos);
        }

        let has_more = groups.len() > self.histogram_page_size;
        groups.truncate(self.histogram_page_size);

        let stats: HashMap<String, Stat> = self
            .find_stats(&conn, filter, Some(id), false)?
            .into_iter()
            .map(|(group_id, _, stat)| (group_id, stat))
            .collect();

        let mut histogram = Histogram::new(id);
        for group in &groups {
            if let Some(stat) = stats.get(&group.id) {
                histogram.add(stat, group.start_date, group.end_date);
            }
        }
        if has_more {
            histogram.last_group_id = groups.last().map(|g| g.id.clone());
        }
        histogram.info = Some(format!("sqlite {}", self.group_table()));
        Ok(histogram)
    }

    fn cleanup(&self, days_to_keep: u32, app_type: Option<&str>) -> StorageResult<usize> {
        let cutoff = (Utc::now() - Duration::days(i64::from(days_to_keep))).timestamp_millis();
        let expired = "end_date < ?1 AND (?2 IS NULL OR app_type = ?2)";

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE group_id IN (SELECT id FROM {} WHERE {})",
                self.stat_table(),
                self.group_table(),
                expired
            ),
            params![cutoff, app_type],
        )?;
        let removed = tx.execute(
            &format!("DELETE FROM {} WHERE {}", self.group_table(), expired),
            params![cutoff, app_type],
        )?;
        tx.commit()?;
        Ok(removed)
    }
}
