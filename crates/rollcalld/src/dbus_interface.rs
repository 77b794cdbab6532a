use crate::config::Config;
use crate::engine::{local_now, EngineError, EngineHandle, IdentitySummary};
use chrono::NaiveDate;
use rollcall_core::{AttendanceReport, EnrollError, EnrollRequest, Enrolled, Pose};
use rollcall_ledger::{AttendanceRecord, LedgerError};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    status: Value,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, config: &Config) -> Self {
        let status = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "enroll_dir": config.enroll_dir.display().to_string(),
            "ledger": config.ledger_path.display().to_string(),
            "match_threshold": config.match_threshold,
            "embedder": config.embedder_command,
        });
        Self { engine, status }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Match every face in the image at `image_path` and record attendance.
    async fn mark_attendance(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, "mark_attendance requested");
        let report = self
            .engine
            .mark(PathBuf::from(image_path))
            .await
            .unwrap_or_else(AttendanceReport::failed);
        to_json(&report)
    }

    /// Register a new identity from three base64 (or data URL) pose photos.
    async fn register(
        &self,
        name: &str,
        roll: &str,
        front: &str,
        left: &str,
        right: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, roll, "register requested");
        let photos = [(Pose::Front, front), (Pose::Left, left), (Pose::Right, right)];
        let result = match build_request(name, roll, photos) {
            Ok(request) => self.engine.register(request).await,
            Err(e) => Err(e.into()),
        };
        to_json(&register_response(result, "Identity registered successfully"))
    }

    /// Re-enroll an existing identity, replacing all three pose photos.
    async fn replace(
        &self,
        name: &str,
        roll: &str,
        front: &str,
        left: &str,
        right: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, roll, "replace requested");
        let photos = [(Pose::Front, front), (Pose::Left, left), (Pose::Right, right)];
        let result = match build_request(name, roll, photos) {
            Ok(request) => self.engine.replace(request).await,
            Err(e) => Err(e.into()),
        };
        to_json(&register_response(result, "Identity re-enrolled successfully"))
    }

    /// Attendance records for `date` (`YYYY-MM-DD`; empty means today).
    async fn get_records(&self, date: &str) -> zbus::fdo::Result<String> {
        tracing::info!(date, "get_records requested");
        let response = match parse_date(date, local_now().date()) {
            Ok(date) => records_response(date, self.engine.records(date).await),
            Err(message) => json!({ "success": false, "message": message }),
        };
        to_json(&response)
    }

    /// Dates that have attendance records, ascending.
    async fn list_dates(&self) -> zbus::fdo::Result<String> {
        to_json(&dates_response(self.engine.dates().await))
    }

    /// List enrolled identities.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        to_json(&identities_response(self.engine.identities().await))
    }

    /// Remove an enrolled identity.
    async fn remove_identity(&self, id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(id, "remove_identity requested");
        to_json(&remove_response(id, self.engine.remove(id.to_string()).await))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.status)
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Empty photo strings are left out so enrollment reports the missing pose.
fn build_request(name: &str, roll: &str, photos: [(Pose, &str); 3]) -> Result<EnrollRequest, EnrollError> {
    photos
        .into_iter()
        .filter(|(_, encoded)| !encoded.trim().is_empty())
        .try_fold(EnrollRequest::new(name, roll), |req, (pose, encoded)| {
            req.with_encoded_photo(pose, encoded)
        })
}

fn parse_date(raw: &str, today: NaiveDate) -> Result<NaiveDate, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(today);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("invalid date {raw:?}: {e}"))
}

fn register_response(result: Result<Enrolled, EngineError>, message: &str) -> Value {
    match result {
        Ok(enrolled) => json!({
            "success": true,
            "message": message,
            "id": enrolled.id,
        }),
        Err(e) => {
            tracing::warn!(error = %e, "registration failed");
            json!({ "success": false, "message": e.to_string() })
        }
    }
}

fn identities_response(result: Result<Vec<IdentitySummary>, EngineError>) -> Value {
    match result {
        Ok(identities) => json!({ "success": true, "identities": identities }),
        Err(e) => {
            tracing::warn!(error = %e, "listing identities failed");
            json!({ "success": false, "message": e.to_string() })
        }
    }
}

fn remove_response(id: &str, result: Result<(), EngineError>) -> Value {
    match result {
        Ok(()) => json!({ "success": true, "message": format!("Removed {id}") }),
        Err(EngineError::Enroll(EnrollError::NotFound(_))) => {
            json!({ "success": false, "message": format!("No such identity: {id}") })
        }
        Err(e) => {
            tracing::warn!(id, error = %e, "remove failed");
            json!({ "success": false, "message": e.to_string() })
        }
    }
}

fn dates_response(result: Result<Vec<NaiveDate>, EngineError>) -> Value {
    match result {
        Ok(dates) => {
            let dates: Vec<String> = dates.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect();
            json!({ "success": true, "dates": dates })
        }
        Err(e) => json!({ "success": false, "error": e.to_string() }),
    }
}

fn records_response(date: NaiveDate, result: Result<Vec<AttendanceRecord>, EngineError>) -> Value {
    match result {
        Ok(records) => json!({
            "success": true,
            "date": date.format("%Y-%m-%d").to_string(),
            "records": records,
        }),
        Err(EngineError::Ledger(LedgerError::NotFound(_))) => json!({
            "success": false,
            "message": "No attendance records found for this date",
        }),
        Err(e) => json!({ "success": false, "error": e.to_string() }),
    }
}
