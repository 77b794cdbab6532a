//! Enrolled identity catalog.
//!
//! On-disk layout, one directory per identity under the enrollment root:
//!
//! ```text
//! <root>/<id>/info.json    {"name": "...", "roll": "..."}
//! <root>/<id>/front.jpg
//! <root>/<id>/left.jpg
//! <root>/<id>/right.jpg
//! ```

use crate::embedder::FaceEmbedder;
use crate::types::{Identity, Pose};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const INFO_FILE: &str = "info.json";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("cannot read enrollment root {path}: {source}")]
    Root {
        path: String,
        source: std::io::Error,
    },
    #[error("missing metadata for identity {0}")]
    MissingMetadata(String),
    #[error("corrupt metadata for identity {id}: {reason}")]
    CorruptMetadata { id: String, reason: String },
}

/// Contents of `info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub name: String,
    pub roll: String,
}

/// Identities keyed by id. Iteration order (ascending id) is the tie-break order.
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    identities: BTreeMap<String, Identity>,
    /// Identity directories left out of the catalog, with the reason.
    skipped: Vec<(String, String)>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an identity.
    pub fn insert(&mut self, identity: Identity) {
        self.identities.insert(identity.id.clone(), identity);
    }

    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.identities.get(id)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    /// Identities with at least one embedding, in catalog order.
    pub fn matchable(&self) -> impl Iterator<Item = &Identity> {
        self.iter().filter(|identity| identity.is_matchable())
    }

    pub fn skipped(&self) -> &[(String, String)] {
        &self.skipped
    }
}

impl FromIterator<Identity> for Catalog {
    fn from_iter<I: IntoIterator<Item = Identity>>(iter: I) -> Self {
        let mut catalog = Catalog::new();
        for identity in iter {
            catalog.insert(identity);
        }
        catalog
    }
}

/// Read-only loader for the enrollment directory.
pub struct EmbeddingStore {
    root: PathBuf,
}

impl EmbeddingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load every identity and derive its pose embeddings.
    ///
    /// Only failing to list the root is an error. Bad metadata skips the
    /// identity; a pose that is missing, undecodable, or faceless is skipped.
    pub fn load<E: FaceEmbedder + ?Sized>(&self, embedder: &mut E) -> Result<Catalog, CatalogError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| CatalogError::Root {
            path: self.root.display().to_string(),
            source,
        })?;

        let mut dirs: Vec<(String, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                (!name.starts_with('.')).then(|| (name, entry.path()))
            })
            .collect();
        dirs.sort();

        let mut catalog = Catalog::new();
        for (id, dir) in dirs {
            let info = match read_info(&id, &dir) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "skipping identity");
                    catalog.skipped.push((id, e.to_string()));
                    continue;
                }
            };

            let mut embeddings = Vec::new();
            let mut poses = Vec::new();
            for pose in Pose::ALL {
                let path = dir.join(pose.file_name());
                if !path.exists() {
                    tracing::debug!(id = %id, pose = %pose, "pose image missing");
                    continue;
                }
                match embedder.extract(&path) {
                    Ok(faces) => match faces.into_iter().next() {
                        Some(face) => {
                            embeddings.push(face.embedding);
                            poses.push(pose);
                        }
                        None => tracing::warn!(id = %id, pose = %pose, "no face in pose image"),
                    },
                    Err(e) => {
                        tracing::warn!(id = %id, pose = %pose, error = %e, "pose embedding failed")
                    }
                }
            }

            if embeddings.is_empty() {
                tracing::warn!(id = %id, "identity has no usable pose embeddings");
            }

            catalog.insert(Identity {
                id,
                display_name: info.name,
                roll: info.roll,
                embeddings,
                poses,
            });
        }

        tracing::info!(
            identities = catalog.len(),
            matchable = catalog.matchable().count(),
            skipped = catalog.skipped.len(),
            "loaded catalog"
        );
        Ok(catalog)
    }

    /// List identity metadata without running the extractor.
    pub fn list(&self) -> Result<Vec<(String, IdentityInfo, Vec<Pose>)>, CatalogError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| CatalogError::Root {
            path: self.root.display().to_string(),
            source,
        })?;

        let mut out = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if id.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match read_info(&id, &entry.path()) {
                Ok(info) => {
                    let poses = Pose::ALL
                        .into_iter()
                        .filter(|p| entry.path().join(p.file_name()).exists())
                        .collect();
                    out.push((id, info, poses));
                }
                Err(e) => tracing::warn!(id = %id, error = %e, "skipping identity"),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

fn read_info(id: &str, dir: &Path) -> Result<IdentityInfo, CatalogError> {
    let raw = std::fs::read(dir.join(INFO_FILE))
        .map_err(|_| CatalogError::MissingMetadata(id.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| CatalogError::CorruptMetadata {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embedder::{DetectedFace, EmbedError};
    use crate::types::{BoundingBox, Embedding};
    use std::collections::HashMap;

    /// Extractor stub keyed by file path. Unlisted paths yield no faces.
    #[derive(Default)]
    pub struct MockEmbedder {
        pub faces: HashMap<PathBuf, Vec<Vec<f32>>>,
        pub failing: Vec<PathBuf>,
        pub calls: usize,
    }

    impl MockEmbedder {
        pub fn with_face(mut self, path: impl Into<PathBuf>, values: Vec<f32>) -> Self {
            self.faces.entry(path.into()).or_default().push(values);
            self
        }
    }

    impl FaceEmbedder for MockEmbedder {
        fn extract(&mut self, image_path: &Path) -> Result<Vec<DetectedFace>, EmbedError> {
            self.calls += 1;
            if self.failing.iter().any(|p| p == image_path) {
                return Err(EmbedError::ExtractorFailed("mock failure".into()));
            }
            Ok(self
                .faces
                .get(image_path)
                .map(|faces| {
                    faces
                        .iter()
                        .map(|values| DetectedFace {
                            bbox: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0, confidence: 1.0 },
                            embedding: Embedding::new(values.clone()),
                        })
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn write_identity(root: &Path, id: &str, name: &str, poses: &[Pose]) -> PathBuf {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        let info = IdentityInfo { name: name.into(), roll: id.into() };
        std::fs::write(dir.join(INFO_FILE), serde_json::to_vec(&info).unwrap()).unwrap();
        for pose in poses {
            std::fs::write(dir.join(pose.file_name()), b"jpeg").unwrap();
        }
        dir
    }

    #[test]
    fn test_load_all_poses() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_identity(tmp.path(), "S1", "Ada", &Pose::ALL);
        let mut embedder = MockEmbedder::default()
            .with_face(dir.join("front.jpg"), vec![0.1])
            .with_face(dir.join("left.jpg"), vec![0.2])
            .with_face(dir.join("right.jpg"), vec![0.3]);

        let catalog = EmbeddingStore::new(tmp.path()).load(&mut embedder).unwrap();
        let s1 = catalog.get("S1").unwrap();
        assert_eq!(s1.display_name, "Ada");
        assert_eq!(s1.embeddings.len(), 3);
        assert_eq!(s1.poses, Pose::ALL.to_vec());
        assert_eq!(embedder.calls, 3);
    }

    #[test]
    fn test_load_takes_roll_from_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("CS101");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(INFO_FILE), br#"{"name": "Ada", "roll": "CS-101"}"#).unwrap();

        let catalog = EmbeddingStore::new(tmp.path()).load(&mut MockEmbedder::default()).unwrap();
        let identity = catalog.get("CS101").unwrap();
        assert_eq!(identity.id, "CS101");
        assert_eq!(identity.roll, "CS-101");
    }

    #[test]
    fn test_load_uses_first_face_per_pose() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_identity(tmp.path(), "S1", "Ada", &[Pose::Front]);
        let mut embedder = MockEmbedder::default()
            .with_face(dir.join("front.jpg"), vec![0.1])
            .with_face(dir.join("front.jpg"), vec![0.9]);

        let catalog = EmbeddingStore::new(tmp.path()).load(&mut embedder).unwrap();
        assert_eq!(catalog.get("S1").unwrap().embeddings, vec![Embedding::new(vec![0.1])]);
    }

    #[test]
    fn test_failed_and_faceless_poses_contribute_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_identity(tmp.path(), "S1", "Ada", &Pose::ALL);
        let mut embedder = MockEmbedder::default().with_face(dir.join("left.jpg"), vec![0.2]);
        embedder.failing.push(dir.join("front.jpg"));

        let catalog = EmbeddingStore::new(tmp.path()).load(&mut embedder).unwrap();
        let s1 = catalog.get("S1").unwrap();
        assert_eq!(s1.poses, vec![Pose::Left]);
        assert_eq!(s1.embeddings.len(), 1);
    }

    #[test]
    fn test_identity_without_embeddings_kept_but_not_matchable() {
        let tmp = tempfile::tempdir().unwrap();
        write_identity(tmp.path(), "S1", "Ada", &[]);
        let mut embedder = MockEmbedder::default();

        let catalog = EmbeddingStore::new(tmp.path()).load(&mut embedder).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.matchable().count(), 0);
        assert_eq!(embedder.calls, 0);
    }

    #[test]
    fn test_bad_metadata_skipped_and_reported() {
        let tmp = tempfile::tempdir().unwrap();
        write_identity(tmp.path(), "S1", "Ada", &[]);
        std::fs::create_dir_all(tmp.path().join("S2")).unwrap();
        let s3 = tmp.path().join("S3");
        std::fs::create_dir_all(&s3).unwrap();
        std::fs::write(s3.join(INFO_FILE), b"{not json").unwrap();

        let catalog = EmbeddingStore::new(tmp.path()).load(&mut MockEmbedder::default()).unwrap();
        assert_eq!(catalog.len(), 1);
        let skipped: Vec<&str> = catalog.skipped().iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(skipped, vec!["S2", "S3"]);
    }

    #[test]
    fn test_hidden_and_plain_files_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        write_identity(tmp.path(), ".staging-S9", "Ghost", &[]);
        std::fs::write(tmp.path().join("README"), b"x").unwrap();

        let catalog = EmbeddingStore::new(tmp.path()).load(&mut MockEmbedder::default()).unwrap();
        assert!(catalog.is_empty());
        assert!(catalog.skipped().is_empty());
    }

    #[test]
    fn test_missing_root_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::new(tmp.path().join("absent"));
        assert!(matches!(
            store.load(&mut MockEmbedder::default()),
            Err(CatalogError::Root { .. })
        ));
    }

    #[test]
    fn test_catalog_iterates_in_id_order() {
        let tmp = tempfile::tempdir().unwrap();
        for id in ["C3", "A1", "B2"] {
            write_identity(tmp.path(), id, id, &[]);
        }
        let catalog = EmbeddingStore::new(tmp.path()).load(&mut MockEmbedder::default()).unwrap();
        let ids: Vec<&str> = catalog.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["A1", "B2", "C3"]);
    }

    #[test]
    fn test_list_reports_poses_without_extracting() {
        let tmp = tempfile::tempdir().unwrap();
        write_identity(tmp.path(), "S1", "Ada", &[Pose::Front, Pose::Right]);
        let listed = EmbeddingStore::new(tmp.path()).list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.name, "Ada");
        assert_eq!(listed[0].2, vec![Pose::Front, Pose::Right]);
    }
}
