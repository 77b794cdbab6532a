//! rollcall-ledger — Date-partitioned attendance ledger.
//!
//! One segment per calendar date. Appends add a whole batch of rows after
//! the existing ones, atomically; queries return a segment in append order.

pub mod error;
pub mod record;
pub mod sqlite;

pub use error::LedgerError;
pub use record::{AttendanceRecord, Status};
pub use sqlite::SqliteLedger;

use chrono::NaiveDate;
use rollcall_core::MatchResult;

/// Append/read access to the attendance ledger.
pub trait Ledger: Send + Sync {
    /// Append `records` to the segment for `date`, creating it if absent.
    ///
    /// Either every record is persisted or none is. Returns the number appended.
    fn append_records(&self, date: NaiveDate, records: &[AttendanceRecord]) -> Result<usize, LedgerError>;

    /// All records for `date` in append order; [`LedgerError::NotFound`] if no segment exists.
    fn query(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError>;

    /// Dates that have a segment, ascending.
    fn dates(&self) -> Result<Vec<NaiveDate>, LedgerError>;

    /// Record one row per match result.
    fn append(&self, date: NaiveDate, results: &[MatchResult]) -> Result<usize, LedgerError> {
        let records: Vec<AttendanceRecord> = results.iter().map(AttendanceRecord::from).collect();
        self.append_records(date, &records)
    }
}
