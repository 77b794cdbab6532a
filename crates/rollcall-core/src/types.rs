use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity id reported for a face that matched nobody.
pub const UNKNOWN_ID: &str = "unknown";
/// Display name reported for a face that matched nobody.
pub const UNKNOWN_NAME: &str = "Unknown";
/// Default maximum Euclidean distance for an accepted match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;
/// Timestamp format shared by match results and ledger rows (second precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Bounding box for a detected face, as reported by the embedding extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub confidence: f32,
}

/// Face embedding vector (128-dimensional for dlib-style extractors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers must ensure both embeddings have the same dimension; extra
    /// trailing values on the longer side are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One of the three canonical enrollment poses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pose {
    Front,
    Left,
    Right,
}

impl Pose {
    pub const ALL: [Pose; 3] = [Pose::Front, Pose::Left, Pose::Right];

    pub fn as_str(self) -> &'static str {
        match self {
            Pose::Front => "front",
            Pose::Left => "left",
            Pose::Right => "right",
        }
    }

    /// Image file name inside an identity directory.
    pub fn file_name(self) -> String {
        format!("{}.jpg", self.as_str())
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enrolled person and the embeddings derived from their pose images.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    /// Roll number as recorded in the identity's metadata.
    pub roll: String,
    /// One embedding per successfully processed pose, in [`Pose::ALL`] order.
    pub embeddings: Vec<Embedding>,
    /// Poses that produced the embeddings above.
    pub poses: Vec<Pose>,
}

impl Identity {
    /// An identity without embeddings is kept in the catalog but never matched.
    pub fn is_matchable(&self) -> bool {
        !self.embeddings.is_empty()
    }
}

/// A face found in the submitted image.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFace {
    /// 0-based position of the face in the extractor's output.
    pub index: usize,
    pub embedding: Embedding,
}

/// Outcome of matching one query face against the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub face_index: usize,
    pub identity_id: String,
    pub display_name: String,
    pub roll: String,
    /// Distance to the matched identity; `None` when unmatched.
    pub distance: Option<f32>,
    /// `1 - distance` when matched, 0 otherwise.
    pub confidence: f32,
    #[serde(with = "timestamp")]
    pub timestamp: NaiveDateTime,
}

impl MatchResult {
    pub fn matched(face_index: usize, identity: &Identity, distance: f32, at: NaiveDateTime) -> Self {
        Self {
            face_index,
            identity_id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            roll: identity.roll.clone(),
            distance: Some(distance),
            confidence: 1.0 - distance,
            timestamp: at,
        }
    }

    pub fn unknown(face_index: usize, at: NaiveDateTime) -> Self {
        Self {
            face_index,
            identity_id: UNKNOWN_ID.to_string(),
            display_name: UNKNOWN_NAME.to_string(),
            roll: UNKNOWN_NAME.to_string(),
            distance: None,
            confidence: 0.0,
            timestamp: at,
        }
    }

    pub fn is_match(&self) -> bool {
        self.distance.is_some()
    }
}

/// Serde adapter for [`TIMESTAMP_FORMAT`] timestamps.
pub mod timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&ts.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(D::Error::custom)
    }
}
