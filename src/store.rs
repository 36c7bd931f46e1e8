// 💾 SQLite Store - Canonical events, entity registry, and the run ledger
// One writer per database. Events upsert on (source, source_record_id) so
// re-ingesting a window converges instead of duplicating.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

use crate::fetcher::RawPage;
use crate::resolver::{CompanyEntity, EntityRegistry, EventRef};
use crate::schema::{CanonicalFundingEvent, DateWindow, FundingType, Identifier, IdentifierKind};
use crate::sources::SourceId;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Run ledger misuse: finalizing a run that already reached a
    /// terminal status.
    #[error("run {run_id} is already finished")]
    RunAlreadyFinished { run_id: String },

    #[error("unknown run {run_id}")]
    UnknownRun { run_id: String },
}

// ============================================================================
// RUN LEDGER TYPES
// ============================================================================

/// Lifecycle of one per-source ingest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    /// Finished, but some pages or records were lost along the way
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "partial" => Some(RunStatus::Partial),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Counters accumulated over one run and frozen into the ledger at the end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub pages_fetched: i64,
    pub records_fetched: i64,
    pub records_mapped: i64,
    pub mapping_failures: i64,
    pub entities_created: i64,
    pub entities_merged: i64,
}

/// One row of the run ledger.
#[derive(Debug, Clone)]
pub struct IngestRun {
    pub id: String,
    pub source: SourceId,
    pub window: DateWindow,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub error: Option<String>,
}

/// One canonical event as persisted, joined back to its entity.
///
/// Identifiers are not stored per event row; they live on the entity in
/// `company_identifiers`, so `event.identifiers` is always empty here.
/// Read them via the entity (`load_registry` / `CompanyEntity`).
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub company_id: String,
    pub event: CanonicalFundingEvent,
}

// ============================================================================
// STORE
// ============================================================================

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database file. WAL mode for crash recovery.
    pub fn open(path: &Path) -> Result<Store, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        setup_schema(&conn)?;
        Ok(Store { conn })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Store, StoreError> {
        let conn = Connection::open_in_memory()?;
        setup_schema(&conn)?;
        Ok(Store { conn })
    }

    // ========================================================================
    // RUN LEDGER
    // ========================================================================

    /// Open a new run in `running` state and return it.
    pub fn start_run(
        &self,
        source: SourceId,
        window: DateWindow,
    ) -> Result<IngestRun, StoreError> {
        let run = IngestRun {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            window,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            counts: RunCounts::default(),
            error: None,
        };

        self.conn.execute(
            "INSERT INTO ingest_runs (
                id, source, window_start, window_end, started_at, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.id,
                run.source.as_str(),
                run.window.start.to_string(),
                run.window.end.to_string(),
                run.started_at.to_rfc3339(),
                run.status.as_str(),
            ],
        )?;

        Ok(run)
    }

    /// Freeze a run into a terminal status with its final counters.
    /// A run can be finalized exactly once.
    pub fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        counts: &RunCounts,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let current: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM ingest_runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;

        match current.as_deref().and_then(RunStatus::parse) {
            None => {
                return Err(StoreError::UnknownRun {
                    run_id: run_id.to_string(),
                })
            }
            Some(s) if s.is_terminal() => {
                return Err(StoreError::RunAlreadyFinished {
                    run_id: run_id.to_string(),
                })
            }
            Some(_) => {}
        }

        self.conn.execute(
            "UPDATE ingest_runs SET
                finished_at = ?2,
                status = ?3,
                pages_fetched = ?4,
                records_fetched = ?5,
                records_mapped = ?6,
                mapping_failures = ?7,
                entities_created = ?8,
                entities_merged = ?9,
                error = ?10
             WHERE id = ?1",
            params![
                run_id,
                Utc::now().to_rfc3339(),
                status.as_str(),
                counts.pages_fetched,
                counts.records_fetched,
                counts.records_mapped,
                counts.mapping_failures,
                counts.entities_created,
                counts.entities_merged,
                error,
            ],
        )?;

        Ok(())
    }

    /// Mark runs left in `running` state by a crashed process as failed.
    /// Called once at startup, before any new run begins.
    pub fn reconcile_stale_runs(&self) -> Result<usize, StoreError> {
        let updated = self.conn.execute(
            "UPDATE ingest_runs SET
                status = 'failed',
                finished_at = ?1,
                error = 'interrupted: found in running state at startup'
             WHERE status = 'running'",
            params![Utc::now().to_rfc3339()],
        )?;

        if updated > 0 {
            tracing::warn!(count = updated, "reconciled stale running runs to failed");
        }
        Ok(updated)
    }

    pub fn get_run(&self, run_id: &str) -> Result<IngestRun, StoreError> {
        let run = self
            .conn
            .query_row(
                "SELECT id, source, window_start, window_end, started_at, finished_at,
                        status, pages_fetched, records_fetched, records_mapped,
                        mapping_failures, entities_created, entities_merged, error
                 FROM ingest_runs WHERE id = ?1",
                params![run_id],
                row_to_run,
            )
            .optional()?;

        run.ok_or_else(|| StoreError::UnknownRun {
            run_id: run_id.to_string(),
        })
    }

    /// Most recent runs, newest first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<IngestRun>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source, window_start, window_end, started_at, finished_at,
                    status, pages_fetched, records_fetched, records_mapped,
                    mapping_failures, entities_created, entities_merged, error
             FROM ingest_runs
             ORDER BY started_at DESC
             LIMIT ?1",
        )?;

        let runs = stmt
            .query_map(params![limit as i64], row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    // ========================================================================
    // RAW PAGES
    // ========================================================================

    /// Archive a fetched page exactly as received, tied to its run.
    pub fn insert_raw_page(&self, run_id: &str, page: &RawPage) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO raw_pages (
                run_id, source, page_index, body, content_hash, received_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                page.source.as_str(),
                page.page_index as i64,
                page.body,
                page.content_hash,
                page.received_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn raw_page_count(&self, run_id: &str) -> Result<i64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM raw_pages WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // FUNDING EVENTS
    // ========================================================================

    /// Insert or refresh one canonical event. Natural key is
    /// (source, source_record_id) so the same disclosure converges to
    /// one row no matter how many runs see it.
    pub fn upsert_event(
        &self,
        company_id: &str,
        event: &CanonicalFundingEvent,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO funding_events (
                source, source_record_id, company_id, company_name, normalized_name,
                funding_type, source_label, amount_usd, original_amount,
                original_currency, event_date, industry, country
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(source, source_record_id) DO UPDATE SET
                company_id = excluded.company_id,
                company_name = excluded.company_name,
                normalized_name = excluded.normalized_name,
                funding_type = excluded.funding_type,
                source_label = excluded.source_label,
                amount_usd = excluded.amount_usd,
                original_amount = excluded.original_amount,
                original_currency = excluded.original_currency,
                event_date = excluded.event_date,
                industry = excluded.industry,
                country = excluded.country,
                updated_at = CURRENT_TIMESTAMP",
            params![
                event.source.as_str(),
                event.source_record_id,
                company_id,
                event.company_name,
                event.normalized_name,
                event.funding_type.as_str(),
                event.source_label,
                event.amount_usd,
                event.original_amount,
                event.original_currency,
                event.event_date.to_string(),
                event.industry,
                event.country,
            ],
        )?;
        Ok(())
    }

    pub fn event_count(&self) -> Result<i64, StoreError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM funding_events", [], |row| row.get(0))?;
        Ok(count)
    }

    /// All events attached to one entity, oldest first.
    pub fn events_for_company(&self, company_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT source, source_record_id, company_id, company_name, normalized_name,
                    funding_type, source_label, amount_usd, original_amount,
                    original_currency, event_date, industry, country
             FROM funding_events
             WHERE company_id = ?1
             ORDER BY event_date ASC, source_record_id ASC",
        )?;

        let events = stmt
            .query_map(params![company_id], row_to_stored_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ========================================================================
    // ENTITY REGISTRY
    // ========================================================================

    /// Persist the registry snapshot. Companies replace their previous
    /// row; identifier rows keep their first owner (INSERT OR IGNORE),
    /// mirroring the resolver's first-writer-wins rule.
    pub fn save_registry(&mut self, registry: &EntityRegistry) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;

        for entity in registry.entities() {
            tx.execute(
                "INSERT OR REPLACE INTO companies (
                    id, canonical_name, normalized_name, country, industry,
                    first_seen, last_seen
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entity.id,
                    entity.canonical_name,
                    entity.normalized_name,
                    entity.country,
                    entity.industry,
                    entity.first_seen.to_string(),
                    entity.last_seen.to_string(),
                ],
            )?;

            for ident in &entity.identifiers {
                tx.execute(
                    "INSERT OR IGNORE INTO company_identifiers (kind, value, company_id)
                     VALUES (?1, ?2, ?3)",
                    params![ident.kind.as_str(), ident.value, entity.id],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Rebuild the registry from disk, in original creation order so
    /// identifier ownership and heuristic tie-breaks replay identically.
    pub fn load_registry(&self) -> Result<EntityRegistry, StoreError> {
        let mut registry = EntityRegistry::new();

        let mut stmt = self.conn.prepare(
            "SELECT id, canonical_name, normalized_name, country, industry,
                    first_seen, last_seen
             FROM companies
             ORDER BY rowid ASC",
        )?;

        let companies = stmt
            .query_map([], |row| {
                let first_seen: String = row.get(5)?;
                let last_seen: String = row.get(6)?;
                Ok(CompanyEntity {
                    id: row.get(0)?,
                    canonical_name: row.get(1)?,
                    normalized_name: row.get(2)?,
                    country: row.get(3)?,
                    industry: row.get(4)?,
                    first_seen: parse_date(&first_seen)?,
                    last_seen: parse_date(&last_seen)?,
                    identifiers: BTreeSet::new(),
                    events: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for mut entity in companies {
            entity.identifiers = self.load_identifiers(&entity.id)?;
            entity.events = self.load_event_refs(&entity.id)?;
            registry.insert_existing(entity);
        }

        Ok(registry)
    }

    fn load_identifiers(&self, company_id: &str) -> Result<BTreeSet<Identifier>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, value FROM company_identifiers WHERE company_id = ?1",
        )?;

        let identifiers = stmt
            .query_map(params![company_id], |row| {
                let kind: String = row.get(0)?;
                let value: String = row.get(1)?;
                let kind = IdentifierKind::parse(&kind).ok_or(rusqlite::Error::InvalidQuery)?;
                Ok(Identifier::new(kind, value))
            })?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(identifiers)
    }

    fn load_event_refs(&self, company_id: &str) -> Result<Vec<EventRef>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT source, source_record_id FROM funding_events
             WHERE company_id = ?1
             ORDER BY rowid ASC",
        )?;

        let refs = stmt
            .query_map(params![company_id], |row| {
                let source: String = row.get(0)?;
                let source = SourceId::parse(&source).ok_or(rusqlite::Error::InvalidQuery)?;
                Ok(EventRef {
                    source,
                    source_record_id: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(refs)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

fn setup_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS companies (
            id TEXT PRIMARY KEY,
            canonical_name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            country TEXT,
            industry TEXT,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS company_identifiers (
            kind TEXT NOT NULL,
            value TEXT NOT NULL,
            company_id TEXT NOT NULL,
            UNIQUE(kind, value)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS funding_events (
            source TEXT NOT NULL,
            source_record_id TEXT NOT NULL,
            company_id TEXT NOT NULL,
            company_name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            funding_type TEXT NOT NULL,
            source_label TEXT NOT NULL,
            amount_usd REAL NOT NULL,
            original_amount REAL NOT NULL,
            original_currency TEXT NOT NULL,
            event_date TEXT NOT NULL,
            industry TEXT,
            country TEXT,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (source, source_record_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS raw_pages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            source TEXT NOT NULL,
            page_index INTEGER NOT NULL,
            body TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            received_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ingest_runs (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            status TEXT NOT NULL,
            pages_fetched INTEGER DEFAULT 0,
            records_fetched INTEGER DEFAULT 0,
            records_mapped INTEGER DEFAULT 0,
            mapping_failures INTEGER DEFAULT 0,
            entities_created INTEGER DEFAULT 0,
            entities_merged INTEGER DEFAULT 0,
            error TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_company ON funding_events(company_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_identifiers_company ON company_identifiers(company_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_raw_pages_run ON raw_pages(run_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_runs_source ON ingest_runs(source, started_at)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPERS
// ============================================================================

fn parse_date(s: &str) -> Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| rusqlite::Error::InvalidQuery)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<IngestRun, rusqlite::Error> {
    let source: String = row.get(1)?;
    let window_start: String = row.get(2)?;
    let window_end: String = row.get(3)?;
    let started_at: String = row.get(4)?;
    let finished_at: Option<String> = row.get(5)?;
    let status: String = row.get(6)?;

    Ok(IngestRun {
        id: row.get(0)?,
        source: SourceId::parse(&source).ok_or(rusqlite::Error::InvalidQuery)?,
        window: DateWindow::new(parse_date(&window_start)?, parse_date(&window_end)?),
        started_at: parse_timestamp(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
        status: RunStatus::parse(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        counts: RunCounts {
            pages_fetched: row.get(7)?,
            records_fetched: row.get(8)?,
            records_mapped: row.get(9)?,
            mapping_failures: row.get(10)?,
            entities_created: row.get(11)?,
            entities_merged: row.get(12)?,
        },
        error: row.get(13)?,
    })
}

fn row_to_stored_event(row: &rusqlite::Row<'_>) -> Result<StoredEvent, rusqlite::Error> {
    let source: String = row.get(0)?;
    let funding_type: String = row.get(5)?;
    let event_date: String = row.get(10)?;

    Ok(StoredEvent {
        company_id: row.get(2)?,
        event: CanonicalFundingEvent {
            source: SourceId::parse(&source).ok_or(rusqlite::Error::InvalidQuery)?,
            source_record_id: row.get(1)?,
            company_name: row.get(3)?,
            normalized_name: row.get(4)?,
            funding_type: FundingType::parse(&funding_type)
                .ok_or(rusqlite::Error::InvalidQuery)?,
            source_label: row.get(6)?,
            amount_usd: row.get(7)?,
            original_amount: row.get(8)?,
            original_currency: row.get(9)?,
            event_date: parse_date(&event_date)?,
            industry: row.get(11)?,
            country: row.get(12)?,
            // Identifiers live on the entity, not the persisted event row
            identifiers: Vec::new(),
        },
    })
}

// ============================================================================
// TESTS
// ============================================================================
