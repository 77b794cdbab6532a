use crate::types::MatchResult;
use serde::{Deserialize, Serialize};

/// Caller-facing outcome of one mark-attendance request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttendanceReport {
    #[serde(rename_all = "camelCase")]
    Recorded {
        total_faces: usize,
        present_count: usize,
        attendance: Vec<MatchResult>,
        success: bool,
    },
    Failed { success: bool, error: String },
}

impl AttendanceReport {
    pub fn recorded(attendance: Vec<MatchResult>) -> Self {
        AttendanceReport::Recorded {
            total_faces: attendance.len(),
            present_count: attendance.iter().filter(|r| r.is_match()).count(),
            attendance,
            success: true,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        AttendanceReport::Failed {
            success: false,
            error: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttendanceReport::Recorded { .. })
    }
}
