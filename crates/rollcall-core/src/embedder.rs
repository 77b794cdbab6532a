//! Face embedding extraction.
//!
//! The recognition model is an external collaborator: Rollcall only consumes
//! the `(bounding box, embedding)` pairs it produces. [`CommandEmbedder`]
//! adapts any extractor program that prints those pairs as JSON.

use crate::types::{BoundingBox, Embedding};
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("extractor failed: {0}")]
    ExtractorFailed(String),
    #[error("extractor output invalid: {0}")]
    InvalidOutput(String),
}

/// A face located by the extractor, with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Image-to-embedding oracle.
///
/// Returns one entry per face found, in the extractor's order. An image with
/// no faces yields an empty vector, not an error.
pub trait FaceEmbedder {
    fn extract(&mut self, image_path: &Path) -> Result<Vec<DetectedFace>, EmbedError>;
}

impl<T: FaceEmbedder + ?Sized> FaceEmbedder for Box<T> {
    fn extract(&mut self, image_path: &Path) -> Result<Vec<DetectedFace>, EmbedError> {
        (**self).extract(image_path)
    }
}

/// Wire format of one face in the extractor's stdout.
#[derive(Debug, Deserialize)]
struct ExtractorFace {
    bbox: BoundingBox,
    embedding: Vec<f32>,
}

/// Runs an external extractor program once per image.
///
/// The image path is appended as the last argument. The program must exit
/// with status 0 and print a JSON array of `{"bbox": {...}, "embedding": [...]}`.
pub struct CommandEmbedder {
    program: String,
    args: Vec<String>,
}

impl CommandEmbedder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a whitespace-separated command line, e.g. `"python3 embed.py --cnn"`.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn parse_output(stdout: &[u8]) -> Result<Vec<DetectedFace>, EmbedError> {
        let faces: Vec<ExtractorFace> = serde_json::from_slice(stdout)
            .map_err(|e| EmbedError::InvalidOutput(e.to_string()))?;

        let dim = faces.first().map(|f| f.embedding.len()).unwrap_or(0);
        faces
            .into_iter()
            .enumerate()
            .map(|(i, face)| {
                if face.embedding.is_empty() {
                    return Err(EmbedError::InvalidOutput(format!("face {i}: empty embedding")));
                }
                if face.embedding.len() != dim {
                    return Err(EmbedError::InvalidOutput(format!(
                        "face {i}: expected {dim}-dim embedding, got {}",
                        face.embedding.len()
                    )));
                }
                Ok(DetectedFace {
                    bbox: face.bbox,
                    embedding: Embedding::new(face.embedding),
                })
            })
            .collect()
    }
}

impl FaceEmbedder for CommandEmbedder {
    fn extract(&mut self, image_path: &Path) -> Result<Vec<DetectedFace>, EmbedError> {
        if !image_path.exists() {
            return Err(EmbedError::ImageNotFound(image_path.display().to_string()));
        }

        // Reject undecodable files before paying for the extractor.
        image::load_from_memory(&std::fs::read(image_path)?)?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EmbedError::ExtractorFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let faces = Self::parse_output(&output.stdout)?;
        tracing::debug!(
            image = %image_path.display(),
            faces = faces.len(),
            "extracted embeddings"
        );
        Ok(faces)
    }
}
