//! Assign query faces to enrolled identities.

use crate::catalog::Catalog;
use crate::types::{Embedding, Identity, MatchResult, QueryFace};
use chrono::NaiveDateTime;

/// Best identity for one query, before thresholding.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub identity: &'a Identity,
    pub distance: f32,
}

/// Strategy for comparing a query embedding against the catalog.
pub trait Matcher {
    /// Closest identity whose distance is below `threshold`, if any.
    fn compare<'a>(&self, query: &Embedding, catalog: &'a Catalog, threshold: f32) -> Option<Candidate<'a>>;
}

/// Euclidean nearest-identity matcher.
///
/// An identity's score is the minimum distance over its pose embeddings.
/// Scores are compared with strict `<`, so on an exact tie the identity
/// reached first in catalog order keeps the match.
pub struct EuclideanMatcher;

impl EuclideanMatcher {
    /// Minimum distance from `query` to any comparable embedding of `identity`.
    pub fn identity_distance(query: &Embedding, identity: &Identity) -> Option<f32> {
        identity
            .embeddings
            .iter()
            .filter(|e| e.dim() == query.dim())
            .map(|e| query.euclidean_distance(e))
            .filter(|d| !d.is_nan())
            .reduce(f32::min)
    }
}

impl Matcher for EuclideanMatcher {
    fn compare<'a>(&self, query: &Embedding, catalog: &'a Catalog, threshold: f32) -> Option<Candidate<'a>> {
        let mut best: Option<Candidate<'a>> = None;

        for identity in catalog.matchable() {
            let Some(distance) = Self::identity_distance(query, identity) else {
                continue;
            };
            let is_better = match &best {
                None => true,
                Some(prev) => distance < prev.distance,
            };
            if is_better {
                best = Some(Candidate { identity, distance });
            }
        }

        best.filter(|c| c.distance < threshold)
    }
}

/// Match every query face independently, preserving input order.
///
/// Two faces may resolve to the same identity; both results are kept.
pub fn match_faces<M: Matcher + ?Sized>(
    matcher: &M,
    catalog: &Catalog,
    faces: &[QueryFace],
    threshold: f32,
    at: NaiveDateTime,
) -> Vec<MatchResult> {
    faces
        .iter()
        .map(|face| match matcher.compare(&face.embedding, catalog, threshold) {
            Some(c) => {
                tracing::debug!(
                    face = face.index,
                    identity = %c.identity.id,
                    distance = c.distance,
                    "face matched"
                );
                MatchResult::matched(face.index, c.identity, c.distance, at)
            }
            None => {
                tracing::debug!(face = face.index, "face not matched");
                MatchResult::unknown(face.index, at)
            }
        })
        .collect()
}
