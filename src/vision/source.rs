//! Input image decoding
//!
//! The harness decodes each selected file once into an immutable
//! [`SourceImage`]. Adapters and the overlay renderer share it through an
//! `Arc`; a new selection replaces the `Arc` rather than mutating pixels.

use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Input file could not be turned into an image
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {name}: {source}")]
    Image {
        name: String,
        #[source]
        source: image::ImageError,
    },
    #[error("{name} has zero width or height")]
    Empty { name: String },
    #[error("decode task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A decoded input image
#[derive(Debug)]
pub struct SourceImage {
    /// Unique per selection, used to correlate log lines
    id: Uuid,
    /// Display name (file name for file selections)
    name: String,
    image: DynamicImage,
}

impl SourceImage {
    /// Wrap an already decoded image
    pub fn new(name: impl Into<String>, image: DynamicImage) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            image,
        }
    }

    /// Decode raw file bytes on the blocking pool
    pub async fn decode(name: impl Into<String>, bytes: Vec<u8>) -> Result<Arc<Self>, DecodeError> {
        let name = name.into();
        let image = {
            let name = name.clone();
            tokio::task::spawn_blocking(move || {
                image::load_from_memory(&bytes).map_err(|source| DecodeError::Image { name, source })
            })
            .await??
        };

        if image.width() == 0 || image.height() == 0 {
            return Err(DecodeError::Empty { name });
        }

        let source = Self::new(name, image);
        debug!(
            "Decoded {} ({}x{}) as {}",
            source.name,
            source.width(),
            source.height(),
            source.id
        );
        Ok(Arc::new(source))
    }

    /// Read and decode a file
    pub async fn open(path: &Path) -> Result<Arc<Self>, DecodeError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| DecodeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::decode(name, bytes).await
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    /// Get image dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
