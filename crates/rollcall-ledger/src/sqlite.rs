//! SQLite-backed attendance ledger.
//!
//! Each date with at least one append has a row in `segments`; its records
//! live in `attendance`, ordered by a per-date sequence number. Appends run
//! in one IMMEDIATE transaction, so a batch is either fully visible or not
//! at all, and concurrent writers (threads or processes) are serialized.

use crate::error::LedgerError;
use crate::record::{AttendanceRecord, Status};
use crate::Ledger;
use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::TIMESTAMP_FORMAT;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const DATE_FORMAT: &str = "%Y-%m-%d";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS segments (
        date        TEXT PRIMARY KEY,
        created_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS attendance (
        date        TEXT NOT NULL REFERENCES segments(date),
        seq         INTEGER NOT NULL,
        roll        TEXT NOT NULL CHECK (length(roll) > 0),
        name        TEXT NOT NULL,
        status      TEXT NOT NULL CHECK (status IN ('Present', 'Unknown')),
        confidence  REAL NOT NULL,
        time        TEXT NOT NULL,
        face_index  INTEGER NOT NULL CHECK (face_index >= 0),
        PRIMARY KEY (date, seq)
    );
";

/// Attendance ledger stored in a single SQLite database.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open or create the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        tracing::info!(path = %path.display(), "opened attendance ledger");
        Self::init(conn)
    }

    /// In-memory ledger, discarded on drop.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }
}

impl Ledger for SqliteLedger {
    fn append_records(&self, date: NaiveDate, records: &[AttendanceRecord]) -> Result<usize, LedgerError> {
        let key = date.format(DATE_FORMAT).to_string();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute("INSERT OR IGNORE INTO segments (date) VALUES (?1)", params![key])?;
        let last_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM attendance WHERE date = ?1",
            params![key],
            |row| row.get(0),
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO attendance (date, seq, roll, name, status, confidence, time, face_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (offset, record) in records.iter().enumerate() {
                let face_index = i64::try_from(record.face_index)
                    .map_err(|_| LedgerError::InvalidRecord(format!("face index {}", record.face_index)))?;
                stmt.execute(params![
                    key,
                    last_seq + 1 + offset as i64,
                    record.roll,
                    record.name,
                    record.status.as_str(),
                    f64::from(record.confidence),
                    record.time.format(TIMESTAMP_FORMAT).to_string(),
                    face_index,
                ])?;
            }
        }

        // Dropping `tx` without commit rolls the whole batch back.
        tx.commit()?;
        tracing::debug!(date = %key, rows = records.len(), "appended attendance");
        Ok(records.len())
    }

    fn query(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let key = date.format(DATE_FORMAT).to_string();
        let conn = self.lock()?;

        let exists = conn
            .query_row("SELECT 1 FROM segments WHERE date = ?1", params![key], |_| Ok(()))
            .optional()?;
        if exists.is_none() {
            return Err(LedgerError::NotFound(date));
        }

        let mut stmt = conn.prepare(
            "SELECT roll, name, status, confidence, time, face_index
             FROM attendance WHERE date = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (roll, name, status, confidence, time, face_index) = row?;
            let corrupt = |reason: String| LedgerError::Corrupt { date, reason };
            records.push(AttendanceRecord {
                roll,
                name,
                status: status.parse::<Status>().map_err(corrupt)?,
                confidence: confidence as f32,
                time: NaiveDateTime::parse_from_str(&time, TIMESTAMP_FORMAT)
                    .map_err(|e| corrupt(format!("time {time:?}: {e}")))?,
                face_index: usize::try_from(face_index)
                    .map_err(|_| corrupt(format!("face index {face_index}")))?,
            });
        }
        Ok(records)
    }

    fn dates(&self) -> Result<Vec<NaiveDate>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT date FROM segments ORDER BY date")?;
        let keys = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut dates = Vec::new();
        for key in keys {
            let key = key?;
            let date = NaiveDate::parse_from_str(&key, DATE_FORMAT).map_err(|e| LedgerError::Corrupt {
                date: NaiveDate::MIN,
                reason: format!("segment key {key:?}: {e}"),
            })?;
            dates.push(date);
        }
        Ok(dates)
    }
}
