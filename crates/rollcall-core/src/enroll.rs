//! Identity registration.
//!
//! All three pose photos are written to a hidden staging directory and
//! checked there. The directory is renamed into place only when every pose
//! decodes and yields a face; any failure removes it.

use crate::catalog::{IdentityInfo, INFO_FILE};
use crate::embedder::FaceEmbedder;
use crate::types::Pose;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("identity already registered: {0}")]
    AlreadyRegistered(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("missing {0} photo")]
    MissingPose(Pose),
    #[error("invalid {pose} photo: {reason}")]
    InvalidPhoto { pose: Pose, reason: String },
    #[error("no face detected in {0} photo")]
    NoFace(Pose),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Registration request for one identity.
#[derive(Debug, Clone, Default)]
pub struct EnrollRequest {
    pub name: String,
    pub roll: String,
    pub photos: HashMap<Pose, Vec<u8>>,
}

impl EnrollRequest {
    pub fn new(name: impl Into<String>, roll: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roll: roll.into(),
            photos: HashMap::new(),
        }
    }

    pub fn with_photo(mut self, pose: Pose, bytes: Vec<u8>) -> Self {
        self.photos.insert(pose, bytes);
        self
    }

    /// Attach a photo given as base64, with or without a `data:image/...;base64,` prefix.
    pub fn with_encoded_photo(self, pose: Pose, encoded: &str) -> Result<Self, EnrollError> {
        let bytes = decode_photo(encoded).map_err(|reason| EnrollError::InvalidPhoto { pose, reason })?;
        Ok(self.with_photo(pose, bytes))
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrolled {
    pub id: String,
    pub name: String,
}

/// Decode a base64 photo payload, stripping any data URL header.
pub fn decode_photo(encoded: &str) -> Result<Vec<u8>, String> {
    let payload = match encoded.split_once("base64,") {
        Some((_, rest)) => rest,
        None => encoded,
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|e| format!("base64: {e}"))
}

/// Reduce a roll number to ASCII alphanumerics so it is safe as a directory name.
pub fn sanitize_roll(roll: &str) -> String {
    roll.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// Writes identity directories under the enrollment root.
pub struct Enrollment {
    root: PathBuf,
}

impl Enrollment {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Register a new identity. Fails if the id is already taken.
    pub fn register<E: FaceEmbedder + ?Sized>(
        &self,
        request: &EnrollRequest,
        embedder: &mut E,
    ) -> Result<Enrolled, EnrollError> {
        let (id, name) = validate(request)?;
        let target = self.root.join(&id);
        if target.exists() {
            return Err(EnrollError::AlreadyRegistered(id));
        }

        let staging = self.stage(&id, &name, request, embedder)?;
        if let Err(e) = std::fs::rename(&staging, &target) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        tracing::info!(id = %id, name = %name, "identity registered");
        Ok(Enrolled { id, name })
    }

    /// Re-enroll an existing identity, replacing all of its poses.
    pub fn replace<E: FaceEmbedder + ?Sized>(
        &self,
        request: &EnrollRequest,
        embedder: &mut E,
    ) -> Result<Enrolled, EnrollError> {
        let (id, name) = validate(request)?;
        let target = self.root.join(&id);
        if !target.is_dir() {
            return Err(EnrollError::NotFound(id));
        }

        let staging = self.stage(&id, &name, request, embedder)?;
        let retired = self.root.join(format!(".retired-{id}"));
        let _ = std::fs::remove_dir_all(&retired);

        if let Err(e) = std::fs::rename(&target, &retired) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        if let Err(e) = std::fs::rename(&staging, &target) {
            restore_retired(&id, &retired, &target);
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        if let Err(e) = std::fs::remove_dir_all(&retired) {
            tracing::warn!(id = %id, error = %e, "failed to remove retired enrollment");
        }

        tracing::info!(id = %id, name = %name, "identity re-enrolled");
        Ok(Enrolled { id, name })
    }

    /// Delete an identity and all of its pose photos.
    pub fn remove(&self, id: &str) -> Result<(), EnrollError> {
        let id = sanitize_roll(id);
        let target = self.root.join(&id);
        if id.is_empty() || !target.is_dir() {
            return Err(EnrollError::NotFound(id));
        }
        std::fs::remove_dir_all(&target)?;
        tracing::info!(id = %id, "identity removed");
        Ok(())
    }

    /// Write and check every pose in a staging directory, returning its path.
    fn stage<E: FaceEmbedder + ?Sized>(
        &self,
        id: &str,
        name: &str,
        request: &EnrollRequest,
        embedder: &mut E,
    ) -> Result<PathBuf, EnrollError> {
        std::fs::create_dir_all(&self.root)?;
        let staging = self.root.join(format!(".staging-{id}"));
        let _ = std::fs::remove_dir_all(&staging);
        std::fs::create_dir(&staging)?;

        match write_staged(&staging, id, name, request, embedder) {
            Ok(()) => Ok(staging),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "enrollment rolled back");
                let _ = std::fs::remove_dir_all(&staging);
                Err(e)
            }
        }
    }
}

/// Move a retired enrollment back into place. Returns false, with the
/// identity left under `retired`, if the rename fails.
fn restore_retired(id: &str, retired: &Path, target: &Path) -> bool {
    match std::fs::rename(retired, target) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(
                id = %id,
                retired = %retired.display(),
                error = %e,
                "failed to restore previous enrollment"
            );
            false
        }
    }
}

fn validate(request: &EnrollRequest) -> Result<(String, String), EnrollError> {
    let name = request.name.trim();
    if name.is_empty() || request.roll.trim().is_empty() {
        return Err(EnrollError::InvalidInput("name and roll number are required".into()));
    }
    let id = sanitize_roll(&request.roll);
    if id.is_empty() {
        return Err(EnrollError::InvalidInput(format!(
            "roll number {:?} has no alphanumeric characters",
            request.roll
        )));
    }
    Ok((id, name.to_string()))
}

fn write_staged<E: FaceEmbedder + ?Sized>(
    dir: &Path,
    id: &str,
    name: &str,
    request: &EnrollRequest,
    embedder: &mut E,
) -> Result<(), EnrollError> {
    let info = IdentityInfo {
        name: name.to_string(),
        roll: id.to_string(),
    };
    let json = serde_json::to_vec_pretty(&info)
        .map_err(|e| EnrollError::InvalidInput(e.to_string()))?;
    std::fs::write(dir.join(INFO_FILE), json)?;

    for pose in Pose::ALL {
        let bytes = request.photos.get(&pose).ok_or(EnrollError::MissingPose(pose))?;
        image::load_from_memory(bytes).map_err(|e| EnrollError::InvalidPhoto {
            pose,
            reason: e.to_string(),
        })?;

        let path = dir.join(pose.file_name());
        std::fs::write(&path, bytes)?;

        let faces = embedder.extract(&path).map_err(|e| EnrollError::InvalidPhoto {
            pose,
            reason: e.to_string(),
        })?;
        if faces.is_empty() {
            return Err(EnrollError::NoFace(pose));
        }
        tracing::debug!(id = %id, pose = %pose, faces = faces.len(), "pose accepted");
    }
    Ok(())
}
