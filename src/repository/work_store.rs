//! Work store: durable per-key download state, page scrape log, and the
//! enumerator checkpoint.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{connect, parse_datetime, parse_datetime_opt, with_busy_retry, Result};
use crate::models::{PageRecord, StoreStats, WorkItem, WorkState};

/// SQLite-backed store for work items, pages, and enumeration progress.
///
/// Opens a fresh connection per operation; the WAL journal keeps readers
/// from blocking each other while writes serialize inside SQLite.
pub struct WorkStore {
    db_path: PathBuf,
}

impl WorkStore {
    /// Open (creating if needed) the store and ensure the schema exists.
    pub fn new(db_path: &Path) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.initialize()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    /// Create tables and indices. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS work_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data_set INTEGER NOT NULL,
                file_key TEXT NOT NULL,
                url TEXT NOT NULL,
                local_path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                size_bytes INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(data_set, file_key)
            );

            CREATE INDEX IF NOT EXISTS idx_work_items_status
                ON work_items(data_set, status);
            CREATE INDEX IF NOT EXISTS idx_work_items_key
                ON work_items(file_key);

            CREATE TABLE IF NOT EXISTS pages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data_set INTEGER NOT NULL,
                page_number INTEGER NOT NULL,
                scraped INTEGER NOT NULL DEFAULT 0,
                pdf_count INTEGER NOT NULL DEFAULT 0,
                scraped_at TEXT,
                UNIQUE(data_set, page_number)
            );

            CREATE INDEX IF NOT EXISTS idx_pages_scraped
                ON pages(data_set, scraped);

            CREATE TABLE IF NOT EXISTS enumerator_progress (
                data_set INTEGER PRIMARY KEY,
                current_id INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Work items
    // -------------------------------------------------------------------

    /// Insert a batch of items inside one transaction, ignoring keys that
    /// already exist. Returns the number of rows actually inserted.
    /// All-or-nothing: any failure rolls the whole batch back.
    pub fn add_items_batch(&self, items: &[WorkItem]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        with_busy_retry(|| {
            let conn = self.connect()?;
            conn.execute("BEGIN IMMEDIATE", [])?;

            let result: Result<usize> = (|| {
                let now = Utc::now().to_rfc3339();
                let mut stmt = conn.prepare(
                    r#"
                    INSERT OR IGNORE INTO work_items
                        (data_set, file_key, url, local_path, status,
                         size_bytes, retry_count, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?6)
                    "#,
                )?;
                let mut inserted = 0;
                for item in items {
                    inserted += stmt.execute(params![
                        item.data_set_id,
                        item.key,
                        item.source_url,
                        item.local_path.to_string_lossy(),
                        item.state.as_str(),
                        now,
                    ])?;
                }
                Ok(inserted)
            })();

            if result.is_ok() {
                conn.execute("COMMIT", [])?;
            } else {
                let _ = conn.execute("ROLLBACK", []);
            }
            result
        })
    }

    /// Update an item's state by store id, optionally recording an error
    /// message and the downloaded size.
    pub fn set_state(
        &self,
        storage_id: i64,
        state: WorkState,
        error: Option<&str>,
        size: Option<i64>,
    ) -> Result<()> {
        with_busy_retry(|| {
            let conn = self.connect()?;
            conn.execute(
                r#"
                UPDATE work_items
                SET status = ?1,
                    last_error = ?2,
                    size_bytes = COALESCE(?3, size_bytes),
                    updated_at = ?4
                WHERE id = ?5
                "#,
                params![state.as_str(), error, size, Utc::now().to_rfc3339(), storage_id],
            )?;
            Ok(())
        })
    }

    /// Update an item's state by `(key, data_set)` for callers that never
    /// saw the store id (an external producer, for example).
    pub fn set_state_by_key(
        &self,
        key: &str,
        data_set_id: u32,
        state: WorkState,
        error: Option<&str>,
        size: Option<i64>,
    ) -> Result<()> {
        with_busy_retry(|| {
            let conn = self.connect()?;
            conn.execute(
                r#"
                UPDATE work_items
                SET status = ?1,
                    last_error = ?2,
                    size_bytes = COALESCE(?3, size_bytes),
                    updated_at = ?4
                WHERE file_key = ?5 AND data_set = ?6
                "#,
                params![
                    state.as_str(),
                    error,
                    size,
                    Utc::now().to_rfc3339(),
                    key,
                    data_set_id
                ],
            )?;
            Ok(())
        })
    }

    pub fn increment_retry(&self, storage_id: i64) -> Result<()> {
        with_busy_retry(|| {
            let conn = self.connect()?;
            conn.execute(
                "UPDATE work_items SET retry_count = retry_count + 1 WHERE id = ?1",
                params![storage_id],
            )?;
            Ok(())
        })
    }

    /// Read up to `limit` pending items in key order. Does not transition
    /// state; the dispatcher marks each item in progress as it claims it.
    pub fn take_pending(&self, data_set_id: u32, limit: usize) -> Result<Vec<WorkItem>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM work_items
            WHERE data_set = ?1 AND status = 'PENDING'
            ORDER BY file_key ASC
            LIMIT ?2
            "#,
        )?;
        let items = stmt
            .query_map(params![data_set_id, limit as i64], row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Read failed items that still have retries left. Backoff eligibility
    /// is the dispatcher's policy, not the store's.
    pub fn take_retryable_failed(
        &self,
        data_set_id: u32,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<WorkItem>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM work_items
            WHERE data_set = ?1 AND status = 'FAILED' AND retry_count < ?2
            ORDER BY updated_at ASC
            LIMIT ?3
            "#,
        )?;
        let items = stmt
            .query_map(params![data_set_id, max_retries, limit as i64], row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Crash recovery: everything left in progress goes back to pending.
    /// Returns the number of rows reset.
    ///
    /// This runs on every start, so it only flips the status: an
    /// interrupted retry keeps its accumulated `retry_count` and
    /// `last_error` instead of getting a fresh retry budget.
    pub fn reset_in_progress(&self, data_set_id: u32) -> Result<usize> {
        with_busy_retry(|| {
            let conn = self.connect()?;
            let changed = conn.execute(
                "UPDATE work_items SET status = 'PENDING', updated_at = ?1
                 WHERE data_set = ?2 AND status = 'IN_PROGRESS'",
                params![Utc::now().to_rfc3339(), data_set_id],
            )?;
            Ok(changed)
        })
    }

    /// Return failed items to pending and zero their retry counters.
    pub fn reset_failed(&self, data_set_id: u32) -> Result<usize> {
        self.bulk_reset(data_set_id, "status = 'FAILED'")
    }

    /// Return every item to pending, including completed ones.
    pub fn reset_all(&self, data_set_id: u32) -> Result<usize> {
        self.bulk_reset(data_set_id, "1 = 1")
    }

    /// Operator-initiated resets give items a fresh attempt budget.
    fn bulk_reset(&self, data_set_id: u32, predicate: &str) -> Result<usize> {
        with_busy_retry(|| {
            let conn = self.connect()?;
            let sql = format!(
                "UPDATE work_items
                 SET status = 'PENDING', retry_count = 0, last_error = NULL, updated_at = ?1
                 WHERE data_set = ?2 AND {predicate}"
            );
            let changed = conn.execute(&sql, params![Utc::now().to_rfc3339(), data_set_id])?;
            Ok(changed)
        })
    }

    pub fn exists(&self, key: &str, data_set_id: u32) -> Result<bool> {
        let conn = self.connect()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM work_items WHERE file_key = ?1 AND data_set = ?2 LIMIT 1",
                params![key, data_set_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_item(&self, storage_id: i64) -> Result<Option<WorkItem>> {
        let conn = self.connect()?;
        let item = conn
            .query_row(
                "SELECT * FROM work_items WHERE id = ?1",
                params![storage_id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    pub fn get_item_by_key(&self, key: &str, data_set_id: u32) -> Result<Option<WorkItem>> {
        let conn = self.connect()?;
        let item = conn
            .query_row(
                "SELECT * FROM work_items WHERE file_key = ?1 AND data_set = ?2",
                params![key, data_set_id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Pending, in-progress, or retryable work left for this data set.
    pub fn has_pending_work(&self, data_set_id: u32) -> Result<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM work_items
             WHERE data_set = ?1 AND status IN ('PENDING', 'IN_PROGRESS', 'FAILED')",
            params![data_set_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete every record (items, pages, checkpoint) for a data set.
    /// Returns the number of work items removed.
    pub fn clear_data_set(&self, data_set_id: u32) -> Result<usize> {
        with_busy_retry(|| {
            let conn = self.connect()?;
            conn.execute("BEGIN IMMEDIATE", [])?;
            let result: Result<usize> = (|| {
                let removed = conn.execute(
                    "DELETE FROM work_items WHERE data_set = ?1",
                    params![data_set_id],
                )?;
                conn.execute("DELETE FROM pages WHERE data_set = ?1", params![data_set_id])?;
                conn.execute(
                    "DELETE FROM enumerator_progress WHERE data_set = ?1",
                    params![data_set_id],
                )?;
                Ok(removed)
            })();
            if result.is_ok() {
                conn.execute("COMMIT", [])?;
            } else {
                let _ = conn.execute("ROLLBACK", []);
            }
            result
        })
    }

    // -------------------------------------------------------------------
    // Pages
    // -------------------------------------------------------------------

    /// Materialize page rows `start..=end` in one transaction, skipping
    /// rows that already exist.
    pub fn add_pages_batch(&self, data_set_id: u32, start: u32, end: u32) -> Result<()> {
        with_busy_retry(|| {
            let conn = self.connect()?;
            conn.execute("BEGIN IMMEDIATE", [])?;
            let result: Result<()> = (|| {
                let mut stmt = conn.prepare(
                    "INSERT OR IGNORE INTO pages (data_set, page_number) VALUES (?1, ?2)",
                )?;
                for page in start..=end {
                    stmt.execute(params![data_set_id, page])?;
                }
                Ok(())
            })();
            if result.is_ok() {
                conn.execute("COMMIT", [])?;
            } else {
                let _ = conn.execute("ROLLBACK", []);
            }
            result
        })
    }

    pub fn mark_scraped(&self, data_set_id: u32, page_number: u32, pdf_count: u32) -> Result<()> {
        with_busy_retry(|| {
            let conn = self.connect()?;
            conn.execute(
                r#"
                UPDATE pages SET scraped = 1, pdf_count = ?1, scraped_at = ?2
                WHERE data_set = ?3 AND page_number = ?4
                "#,
                params![pdf_count, Utc::now().to_rfc3339(), data_set_id, page_number],
            )?;
            Ok(())
        })
    }

    pub fn unscraped_pages(&self, data_set_id: u32, limit: usize) -> Result<Vec<u32>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT page_number FROM pages
            WHERE data_set = ?1 AND scraped = 0
            ORDER BY page_number
            LIMIT ?2
            "#,
        )?;
        let pages = stmt
            .query_map(params![data_set_id, limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<u32>, _>>()?;
        Ok(pages)
    }

    /// Number of page rows materialized for this data set. A non-zero
    /// count means the page universe is already known and probing can be
    /// skipped.
    pub fn page_count(&self, data_set_id: u32) -> Result<i64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pages WHERE data_set = ?1",
            params![data_set_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn get_page(&self, data_set_id: u32, page_number: u32) -> Result<Option<PageRecord>> {
        let conn = self.connect()?;
        let page = conn
            .query_row(
                "SELECT data_set, page_number, scraped, pdf_count, scraped_at
                 FROM pages WHERE data_set = ?1 AND page_number = ?2",
                params![data_set_id, page_number],
                |row| {
                    Ok(PageRecord {
                        data_set_id: row.get(0)?,
                        page_number: row.get(1)?,
                        scraped: row.get::<_, i64>(2)? != 0,
                        pdf_count: row.get(3)?,
                        scraped_at: parse_datetime_opt(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(page)
    }

    // -------------------------------------------------------------------
    // Enumerator checkpoint
    // -------------------------------------------------------------------

    pub fn get_enumerator(&self, data_set_id: u32) -> Result<u64> {
        let conn = self.connect()?;
        let current: Option<i64> = conn
            .query_row(
                "SELECT current_id FROM enumerator_progress WHERE data_set = ?1",
                params![data_set_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(current.unwrap_or(0).max(0) as u64)
    }

    pub fn set_enumerator(&self, data_set_id: u32, current_id: u64) -> Result<()> {
        with_busy_retry(|| {
            let conn = self.connect()?;
            conn.execute(
                r#"
                INSERT INTO enumerator_progress (data_set, current_id, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(data_set) DO UPDATE SET
                    current_id = excluded.current_id,
                    updated_at = excluded.updated_at
                "#,
                params![data_set_id, current_id as i64, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    // -------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------

    /// All counts in one consistent read (a single read transaction).
    pub fn stats(&self, data_set_id: u32) -> Result<StoreStats> {
        let conn = self.connect()?;
        conn.execute("BEGIN", [])?;

        let result: Result<StoreStats> = (|| {
            let mut stats = StoreStats::default();

            {
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM work_items WHERE data_set = ?1 GROUP BY status",
                )?;
                let rows = stmt.query_map(params![data_set_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (status, count) = row?;
                    match WorkState::from_str(&status) {
                        Some(WorkState::Pending) => stats.pending = count,
                        Some(WorkState::InProgress) => stats.in_progress = count,
                        Some(WorkState::Completed) => stats.completed = count,
                        Some(WorkState::Failed) => stats.failed = count,
                        Some(WorkState::NotFound) => stats.not_found = count,
                        Some(WorkState::Skipped) => stats.skipped = count,
                        None => {}
                    }
                }
            }

            let (total_pages, pages_scraped, keys_found): (i64, Option<i64>, Option<i64>) = conn
                .query_row(
                    r#"
                    SELECT COUNT(*),
                           SUM(CASE WHEN scraped = 1 THEN 1 ELSE 0 END),
                           SUM(pdf_count)
                    FROM pages WHERE data_set = ?1
                    "#,
                    params![data_set_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
            stats.total_pages = total_pages;
            stats.pages_scraped = pages_scraped.unwrap_or(0);
            stats.keys_found = keys_found.unwrap_or(0);

            let current: Option<i64> = conn
                .query_row(
                    "SELECT current_id FROM enumerator_progress WHERE data_set = ?1",
                    params![data_set_id],
                    |row| row.get(0),
                )
                .optional()?;
            stats.enumerator_current = current.unwrap_or(0).max(0) as u64;

            Ok(stats)
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }
        result
    }
}

fn row_to_item(row: &Row) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        storage_id: row.get("id")?,
        data_set_id: row.get("data_set")?,
        key: row.get("file_key")?,
        source_url: row.get("url")?,
        local_path: PathBuf::from(row.get::<_, String>("local_path")?),
        state: WorkState::from_str(&row.get::<_, String>("status")?)
            .unwrap_or(WorkState::Pending),
        size_bytes: row.get("size_bytes")?,
        retry_count: row.get::<_, i64>("retry_count")?.max(0) as u32,
        last_error: row.get("last_error")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}
