//! rollcall-core — Identity catalog, face matching, and enrollment.
//!
//! Embeddings come from an external extractor behind [`FaceEmbedder`];
//! matching is a Euclidean nearest-identity scan over each identity's
//! canonical pose embeddings.

pub mod catalog;
pub mod embedder;
pub mod enroll;
pub mod matcher;
pub mod report;
pub mod types;

pub use catalog::{Catalog, CatalogError, EmbeddingStore, IdentityInfo};
pub use embedder::{CommandEmbedder, DetectedFace, EmbedError, FaceEmbedder};
pub use enroll::{EnrollError, EnrollRequest, Enrolled, Enrollment};
pub use matcher::{match_faces, EuclideanMatcher, Matcher};
pub use report::AttendanceReport;
pub use types::{
    BoundingBox, Embedding, Identity, MatchResult, Pose, QueryFace, DEFAULT_MATCH_THRESHOLD,
    TIMESTAMP_FORMAT, UNKNOWN_ID, UNKNOWN_NAME,
};
