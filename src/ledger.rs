use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::models::{ApplicationRecord, ApplicationState, ErrorKind, Tier};

/// Durable application store. Records are never deleted; every state change
/// appends one row to `transitions`, so the table is a complete audit trail.
///
/// Multiple workers share one ledger; the connection is behind a mutex and
/// every mutation runs in a single transaction.
pub struct Ledger {
    conn: Mutex<Connection>,
    path: PathBuf,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TransitionRow {
    pub id: i64,
    pub application_id: i64,
    pub from_state: ApplicationState,
    pub to_state: ApplicationState,
    pub error_kind: Option<ErrorKind>,
    pub note: Option<String>,
    pub at: String,
}

impl Ledger {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobpilot") {
            Ok(proj_dirs.data_dir().join("jobpilot.db"))
        } else {
            Ok(PathBuf::from("jobpilot.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS fingerprints (
                fingerprint TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                first_seen TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                profile_id TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                source_id TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                organization TEXT NOT NULL,
                score REAL NOT NULL,
                tier TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'discovered',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                confirmation_id TEXT,
                screenshot TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (profile_id, fingerprint)
            );

            CREATE TABLE IF NOT EXISTS transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                application_id INTEGER NOT NULL REFERENCES applications(id),
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                error_kind TEXT,
                note TEXT,
                at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS daily_counters (
                source_id TEXT NOT NULL,
                day TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (source_id, day)
            );

            CREATE INDEX IF NOT EXISTS idx_applications_profile ON applications(profile_id);
            CREATE INDEX IF NOT EXISTS idx_applications_state ON applications(state);
            CREATE INDEX IF NOT EXISTS idx_transitions_application ON transitions(application_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let conn = self.lock();
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='applications'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Ledger not initialized. Run 'jobpilot init' first."));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // The ledger never panics while holding the lock.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Fingerprint index ---

    /// Atomic insert-if-absent. Returns true if the fingerprint was new.
    /// No side effects on a duplicate, so registration is idempotent.
    pub fn register_fingerprint(&self, fingerprint: &str, source_id: &str) -> Result<bool> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO fingerprints (fingerprint, source_id) VALUES (?1, ?2)",
            params![fingerprint, source_id],
        )?;
        Ok(inserted > 0)
    }

    pub fn fingerprint_count(&self) -> Result<i64> {
        let conn = self.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM fingerprints", [], |row| row.get(0))?;
        Ok(n)
    }

    // --- Application records ---

    /// Creates a record in `discovered` state. Returns None when a record for
    /// this (profile, fingerprint) pair already exists.
    #[allow(clippy::too_many_arguments)]
    pub fn create_record(
        &self,
        profile_id: &str,
        fingerprint: &str,
        source_id: &str,
        url: &str,
        title: &str,
        organization: &str,
        score: f64,
        tier: Tier,
    ) -> Result<Option<i64>> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO applications
                 (profile_id, fingerprint, source_id, url, title, organization, score, tier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                profile_id,
                fingerprint,
                source_id,
                url,
                title,
                organization,
                score,
                tier.as_str()
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn get_record(&self, id: i64) -> Result<Option<ApplicationRecord>> {
        let conn = self.lock();
        let result = conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_RECORD),
            [id],
            row_to_record,
        );
        match result {
            Ok(rec) => Ok(Some(rec)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_record(&self, profile_id: &str, fingerprint: &str) -> Result<Option<ApplicationRecord>> {
        let conn = self.lock();
        let result = conn.query_row(
            &format!("{} WHERE profile_id = ?1 AND fingerprint = ?2", SELECT_RECORD),
            params![profile_id, fingerprint],
            row_to_record,
        );
        match result {
            Ok(rec) => Ok(Some(rec)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_records(&self, profile_id: &str) -> Result<Vec<ApplicationRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE profile_id = ?1 ORDER BY score DESC, id",
            SELECT_RECORD
        ))?;
        let rows = stmt.query_map([profile_id], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list application records")
    }

    pub fn records_in_state(
        &self,
        profile_id: &str,
        state: ApplicationState,
    ) -> Result<Vec<ApplicationRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE profile_id = ?1 AND state = ?2 ORDER BY score DESC, id",
            SELECT_RECORD
        ))?;
        let rows = stmt.query_map(params![profile_id, state.as_str()], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list application records by state")
    }

    /// Applies one state transition and appends its audit row atomically.
    /// Rejects edges that are not part of the state graph.
    pub fn transition(
        &self,
        id: i64,
        to: ApplicationState,
        error: Option<ErrorKind>,
        note: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current: String = tx
            .query_row("SELECT state FROM applications WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .with_context(|| format!("Application record #{id} not found"))?;
        let from = ApplicationState::parse(&current)
            .ok_or_else(|| anyhow!("Corrupt state '{current}' on record #{id}"))?;
        if !from.allows(to) {
            bail!(
                "Illegal transition {} -> {} on record #{id}",
                from.as_str(),
                to.as_str()
            );
        }
        tx.execute(
            "UPDATE applications
                 SET state = ?1, last_error = ?2, updated_at = datetime('now')
             WHERE id = ?3",
            params![to.as_str(), error.map(|e| e.as_str()), id],
        )?;
        tx.execute(
            "INSERT INTO transitions (application_id, from_state, to_state, error_kind, note)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, from.as_str(), to.as_str(), error.map(|e| e.as_str()), note],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Counted once per real submission attempt. Gate denials and rate-limit
    /// requeues never call this.
    pub fn increment_attempts(&self, id: i64) -> Result<u32> {
        let conn = self.lock();
        conn.execute(
            "UPDATE applications SET attempts = attempts + 1, updated_at = datetime('now')
             WHERE id = ?1",
            [id],
        )?;
        let attempts: u32 =
            conn.query_row("SELECT attempts FROM applications WHERE id = ?1", [id], |row| {
                row.get(0)
            })?;
        Ok(attempts)
    }

    pub fn set_submission_artifacts(
        &self,
        id: i64,
        confirmation_id: &str,
        screenshot: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE applications
                 SET confirmation_id = ?1, screenshot = ?2, updated_at = datetime('now')
             WHERE id = ?3",
            params![confirmation_id, screenshot, id],
        )?;
        Ok(())
    }

    /// Crash recovery: resets records left `in_progress` by a prior run back
    /// to `queued`, with one audit row each. Returns the reset records.
    pub fn reconcile_in_progress(&self, profile_id: &str) -> Result<Vec<ApplicationRecord>> {
        let stale = self.records_in_state(profile_id, ApplicationState::InProgress)?;
        for rec in &stale {
            self.transition(rec.id, ApplicationState::Queued, None, Some("crash recovery"))?;
        }
        Ok(stale)
    }

    // --- Daily submission counters ---

    /// Rate-limit bookkeeping that must survive a restart. One row per
    /// source per day at the configured reset offset.
    pub fn daily_counter(&self, source_id: &str, day: NaiveDate) -> Result<u32> {
        let conn = self.lock();
        let result = conn.query_row(
            "SELECT used FROM daily_counters WHERE source_id = ?1 AND day = ?2",
            params![source_id, day.to_string()],
            |row| row.get(0),
        );
        match result {
            Ok(used) => Ok(used),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_daily_counter(&self, source_id: &str, day: NaiveDate, used: u32) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO daily_counters (source_id, day, used) VALUES (?1, ?2, ?3)
             ON CONFLICT (source_id, day) DO UPDATE SET used = excluded.used",
            params![source_id, day.to_string(), used],
        )?;
        Ok(())
    }

    // --- Audit export ---

    pub fn transitions_for_profile(&self, profile_id: &str) -> Result<Vec<TransitionRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.application_id, t.from_state, t.to_state, t.error_kind, t.note, t.at
             FROM transitions t
             JOIN applications a ON a.id = t.application_id
             WHERE a.profile_id = ?1
             ORDER BY t.id",
        )?;
        let rows = stmt.query_map([profile_id], row_to_transition)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to export transitions")
    }

    pub fn transitions_for_record(&self, application_id: i64) -> Result<Vec<TransitionRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, application_id, from_state, to_state, error_kind, note, at
             FROM transitions WHERE application_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([application_id], row_to_transition)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read record transitions")
    }
}

const SELECT_RECORD: &str = "SELECT id, profile_id, fingerprint, source_id, url, title, \
     organization, score, tier, state, attempts, last_error, confirmation_id, screenshot, \
     created_at, updated_at FROM applications";

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ApplicationRecord> {
    let tier: String = row.get(8)?;
    let state: String = row.get(9)?;
    let last_error: Option<String> = row.get(11)?;
    Ok(ApplicationRecord {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        fingerprint: row.get(2)?,
        source_id: row.get(3)?,
        url: row.get(4)?,
        title: row.get(5)?,
        organization: row.get(6)?,
        score: row.get(7)?,
        tier: Tier::parse(&tier).unwrap_or(Tier::Reject),
        state: ApplicationState::parse(&state).unwrap_or(ApplicationState::Discovered),
        attempts: row.get(10)?,
        last_error: last_error.as_deref().and_then(ErrorKind::parse),
        confirmation_id: row.get(12)?,
        screenshot: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn row_to_transition(row: &rusqlite::Row) -> rusqlite::Result<TransitionRow> {
    let from: String = row.get(2)?;
    let to: String = row.get(3)?;
    let err: Option<String> = row.get(4)?;
    Ok(TransitionRow {
        id: row.get(0)?,
        application_id: row.get(1)?,
        from_state: ApplicationState::parse(&from).unwrap_or(ApplicationState::Discovered),
        to_state: ApplicationState::parse(&to).unwrap_or(ApplicationState::Discovered),
        error_kind: err.as_deref().and_then(ErrorKind::parse),
        note: row.get(5)?,
        at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_ledger() -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(Some(&dir.path().join("test.db"))).unwrap();
        ledger.init().unwrap();
        (dir, ledger)
    }

    fn create(ledger: &Ledger, profile: &str, fp: &str) -> i64 {
        ledger
            .create_record(
                profile,
                fp,
                "feedco",
                "https://jobs.example.com/1",
                "Platform Engineer",
                "Example Corp",
                82.0,
                Tier::Strong,
            )
            .unwrap()
            .expect("record should be new")
    }

    #[test]
    fn record_unique_per_profile_and_fingerprint() {
        let (_dir, ledger) = temp_ledger();
        let id = create(&ledger, "profile-1", "f00d");
        assert!(id > 0);
        // Same pair again: no second record.
        let dup = ledger
            .create_record(
                "profile-1",
                "f00d",
                "feedco",
                "u",
                "t",
                "o",
                10.0,
                Tier::Weak,
            )
            .unwrap();
        assert!(dup.is_none());
        // Different profile, same fingerprint: its own record.
        assert!(create(&ledger, "profile-2", "f00d") > id);
    }

    #[test]
    fn transition_appends_audit_rows_and_rejects_illegal_edges() {
        let (_dir, ledger) = temp_ledger();
        let id = create(&ledger, "p", "aa");

        ledger.transition(id, ApplicationState::Scored, None, None).unwrap();
        ledger.transition(id, ApplicationState::Queued, None, None).unwrap();
        ledger.transition(id, ApplicationState::InProgress, None, None).unwrap();
        ledger
            .transition(
                id,
                ApplicationState::Failed,
                Some(ErrorKind::TransientNetwork),
                Some("connection reset"),
            )
            .unwrap();

        // queued straight to submitted is not an edge
        assert!(ledger.transition(id, ApplicationState::Submitted, None, None).is_err());

        let rows = ledger.transitions_for_record(id).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].from_state, ApplicationState::Discovered);
        assert_eq!(rows[3].to_state, ApplicationState::Failed);
        assert_eq!(rows[3].error_kind, Some(ErrorKind::TransientNetwork));

        let rec = ledger.get_record(id).unwrap().unwrap();
        assert_eq!(rec.state, ApplicationState::Failed);
        assert_eq!(rec.last_error, Some(ErrorKind::TransientNetwork));
    }

    #[test]
    fn terminal_states_accept_no_further_transitions() {
        let (_dir, ledger) = temp_ledger();
        let id = create(&ledger, "p", "bb");
        for to in [
            ApplicationState::Scored,
            ApplicationState::Queued,
            ApplicationState::InProgress,
            ApplicationState::Submitted,
        ] {
            ledger.transition(id, to, None, None).unwrap();
        }
        assert!(ledger.transition(id, ApplicationState::Queued, None, None).is_err());
        assert!(ledger.transition(id, ApplicationState::Failed, None, None).is_err());
    }

    #[test]
    fn reconcile_resets_only_in_progress_records() {
        let (_dir, ledger) = temp_ledger();
        let stuck = create(&ledger, "p", "cc");
        let fine = create(&ledger, "p", "dd");
        for to in [
            ApplicationState::Scored,
            ApplicationState::Queued,
            ApplicationState::InProgress,
        ] {
            ledger.transition(stuck, to, None, None).unwrap();
        }
        ledger.transition(fine, ApplicationState::Scored, None, None).unwrap();

        let reset = ledger.reconcile_in_progress("p").unwrap();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].id, stuck);
        assert_eq!(
            ledger.get_record(stuck).unwrap().unwrap().state,
            ApplicationState::Queued
        );
        assert_eq!(
            ledger.get_record(fine).unwrap().unwrap().state,
            ApplicationState::Scored
        );
    }

    #[test]
    fn fingerprint_registration_is_idempotent_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        {
            let ledger = Ledger::open(Some(&path)).unwrap();
            ledger.init().unwrap();
            assert!(ledger.register_fingerprint("abc", "feedco").unwrap());
            assert!(!ledger.register_fingerprint("abc", "feedco").unwrap());
        }
        // A later session over the same file still sees the fingerprint.
        let ledger = Ledger::open(Some(&path)).unwrap();
        ledger.init().unwrap();
        assert!(!ledger.register_fingerprint("abc", "other").unwrap());
        assert_eq!(ledger.fingerprint_count().unwrap(), 1);
    }

    #[test]
    fn daily_counters_upsert_per_source_and_day() {
        let (_dir, ledger) = temp_ledger();
        let d1 = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();

        assert_eq!(ledger.daily_counter("feedco", d1).unwrap(), 0);
        ledger.set_daily_counter("feedco", d1, 1).unwrap();
        ledger.set_daily_counter("feedco", d1, 2).unwrap();
        assert_eq!(ledger.daily_counter("feedco", d1).unwrap(), 2);
        // Days and sources keep separate rows.
        assert_eq!(ledger.daily_counter("feedco", d2).unwrap(), 0);
        assert_eq!(ledger.daily_counter("boardx", d1).unwrap(), 0);
    }

    #[test]
    fn attempts_counter_and_artifacts() {
        let (_dir, ledger) = temp_ledger();
        let id = create(&ledger, "p", "ee");
        assert_eq!(ledger.increment_attempts(id).unwrap(), 1);
        assert_eq!(ledger.increment_attempts(id).unwrap(), 2);
        ledger
            .set_submission_artifacts(id, "CONF-42", Some("shots/ee.png"))
            .unwrap();
        let rec = ledger.get_record(id).unwrap().unwrap();
        assert_eq!(rec.attempts, 2);
        assert_eq!(rec.confirmation_id.as_deref(), Some("CONF-42"));
        assert_eq!(rec.screenshot.as_deref(), Some("shots/ee.png"));
    }
}
