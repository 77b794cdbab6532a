use chrono::NaiveDateTime;
use rollcall_core::types::timestamp;
use rollcall_core::{MatchResult, UNKNOWN_NAME};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Attendance status of one recorded face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Present,
    Unknown,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Present => "Present",
            Status::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Present" => Ok(Status::Present),
            "Unknown" => Ok(Status::Unknown),
            other => Err(format!("unknown attendance status {other:?}")),
        }
    }
}

/// One ledger row. Field order matches the stored column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub roll: String,
    pub name: String,
    pub status: Status,
    pub confidence: f32,
    #[serde(with = "timestamp")]
    pub time: NaiveDateTime,
    pub face_index: usize,
}

impl From<&MatchResult> for AttendanceRecord {
    fn from(result: &MatchResult) -> Self {
        if result.is_match() {
            AttendanceRecord {
                roll: result.roll.clone(),
                name: result.display_name.clone(),
                status: Status::Present,
                confidence: result.confidence,
                time: result.timestamp,
                face_index: result.face_index,
            }
        } else {
            AttendanceRecord {
                roll: UNKNOWN_NAME.to_string(),
                name: UNKNOWN_NAME.to_string(),
                status: Status::Unknown,
                confidence: 0.0,
                time: result.timestamp,
                face_index: result.face_index,
            }
        }
    }
}
