use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("no attendance records found for {0}")]
    NotFound(NaiveDate),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("corrupt ledger row for {date}: {reason}")]
    Corrupt { date: NaiveDate, reason: String },
    #[error("ledger lock poisoned")]
    Poisoned,
}
