//! Model management for the PaddleOCR backend
//!
//! Handles downloading and caching of the ONNX models and the character
//! dictionary, tracked by a JSON manifest next to the files. The manifest
//! records each file's SHA-256 for reference; the mirror publishes no
//! checksums, so downloads are only checked against a plausible size range.

use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Model host (Hugging Face mirror of the PaddleOCR ONNX exports)
const MODEL_BASE_URL: &str = "https://huggingface.co/monkt/paddleocr-onnx/resolve/main";

/// Set to skip all network access; missing models then fail initialization
pub const OFFLINE_ENV: &str = "OCR_BENCH_OFFLINE";

const MANIFEST_FILE: &str = "manifest.json";

/// PaddleOCR components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Text detection model (DBNet)
    Detection,
    /// Text recognition model (CRNN)
    Recognition,
    /// Character dictionary for recognition
    Dictionary,
}

impl ModelType {
    pub const ALL: [ModelType; 3] = [
        ModelType::Detection,
        ModelType::Recognition,
        ModelType::Dictionary,
    ];

    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::Detection => "det.onnx",
            ModelType::Recognition => "rec.onnx",
            ModelType::Dictionary => "dict.txt",
        }
    }

    /// Path of this file relative to the models directory. Recognition files
    /// are per language; detection is shared.
    pub fn relative_path(&self, language: &str) -> PathBuf {
        match self {
            ModelType::Detection => PathBuf::from("detection").join(self.filename()),
            ModelType::Recognition | ModelType::Dictionary => {
                PathBuf::from("languages").join(language).join(self.filename())
            }
        }
    }

    pub fn download_url(&self, language: &str) -> String {
        match self {
            ModelType::Detection => format!("{MODEL_BASE_URL}/detection/v3/det.onnx"),
            ModelType::Recognition | ModelType::Dictionary => {
                format!("{MODEL_BASE_URL}/languages/{language}/{}", self.filename())
            }
        }
    }

    /// Plausible file size range, used to reject truncated downloads
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelType::Detection => (1_000_000, 20_000_000),
            ModelType::Recognition => (1_000_000, 30_000_000),
            ModelType::Dictionary => (100, 200_000),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::Detection => "Text Detection",
            ModelType::Recognition => "Text Recognition",
            ModelType::Dictionary => "Character Dictionary",
        }
    }
}

/// Model manifest tracking downloaded files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    /// Relative to the models directory
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
    /// Seconds since the Unix epoch
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Local paths of a complete model set
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detection: PathBuf,
    pub recognition: PathBuf,
    pub dictionary: PathBuf,
}

/// Downloads and caches the models for one recognition language
pub struct ModelManager {
    models_dir: PathBuf,
    language: String,
}

impl ModelManager {
    pub fn new(models_dir: PathBuf, language: impl Into<String>) -> Self {
        Self {
            models_dir,
            language: language.into(),
        }
    }

    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.relative_path(&self.language))
    }

    /// Check if a model is already downloaded and plausibly complete
    pub async fn is_model_available(&self, model_type: ModelType) -> bool {
        match tokio::fs::metadata(self.model_path(model_type)).await {
            Ok(metadata) => {
                let (min, max) = model_type.expected_size_range();
                (min..=max).contains(&metadata.len())
            }
            Err(_) => false,
        }
    }

    /// Make sure every file exists locally, downloading missing ones
    pub async fn ensure_all(&self) -> Result<ModelPaths> {
        for model_type in ModelType::ALL {
            self.ensure_model(model_type).await?;
        }

        Ok(ModelPaths {
            detection: self.model_path(ModelType::Detection),
            recognition: self.model_path(ModelType::Recognition),
            dictionary: self.model_path(ModelType::Dictionary),
        })
    }

    /// Download a model if not already available. Returns its path.
    pub async fn ensure_model(&self, model_type: ModelType) -> Result<PathBuf> {
        let path = self.model_path(model_type);

        if self.is_model_available(model_type).await {
            debug!("Model {:?} already available at {:?}", model_type, path);
            return Ok(path);
        }

        let url = model_type.download_url(&self.language);
        if std::env::var_os(OFFLINE_ENV).is_some() {
            anyhow::bail!(
                "Offline mode: cannot download {}. Download it manually from {} and place it at {:?}",
                model_type.display_name(),
                url,
                path
            );
        }

        info!("Downloading {} model from {}", model_type.display_name(), url);
        let (size, hash) = download_file(&url, &path).await?;

        let (min, max) = model_type.expected_size_range();
        if !(min..=max).contains(&size) {
            tokio::fs::remove_file(&path).await.ok();
            anyhow::bail!(
                "Downloaded {} has unexpected size {} bytes",
                model_type.display_name(),
                size
            );
        }

        self.record_download(model_type, size, hash).await?;
        info!("Successfully downloaded {} model", model_type.display_name());
        Ok(path)
    }

    async fn record_download(&self, model_type: ModelType, size_bytes: u64, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().await.unwrap_or_default();

        let info = ModelInfo {
            model_type: format!("{:?}", model_type),
            path: model_type.relative_path(&self.language),
            size_bytes,
            sha256,
            downloaded_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        if let Some(existing) = manifest.models.iter_mut().find(|m| m.path == info.path) {
            *existing = info;
        } else {
            manifest.models.push(info);
        }

        self.save_manifest(&manifest).await
    }

    pub async fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join(MANIFEST_FILE);
        match tokio::fs::read_to_string(&manifest_path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ModelManifest::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        tokio::fs::create_dir_all(&self.models_dir).await?;
        let content = serde_json::to_string_pretty(manifest)?;
        tokio::fs::write(self.models_dir.join(MANIFEST_FILE), content).await?;
        Ok(())
    }
}

/// Stream `url` into `path` through a temp file. Returns (size, sha256 hex).
async fn download_file(url: &str, path: &Path) -> Result<(u64, String)> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    let total_size = response.content_length();
    debug!("Download size: {:?} bytes", total_size);

    write_stream(response.bytes_stream(), path).await
}

/// Write `stream` to a temp file beside `path`, then move it into place.
/// The temp file is removed if the stream or a write fails.
async fn write_stream<S, B, E>(stream: S, path: &Path) -> Result<(u64, String)>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let temp_path = path.with_extension("tmp");
    match write_temp(stream, &temp_path).await {
        Ok(written) => {
            tokio::fs::rename(&temp_path, path)
                .await
                .context("Failed to move downloaded file to final location")?;
            Ok(written)
        }
        Err(e) => {
            tokio::fs::remove_file(&temp_path).await.ok();
            Err(e)
        }
    }
}

async fn write_temp<S, B, E>(stream: S, temp_path: &Path) -> Result<(u64, String)>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut file = tokio::fs::File::create(temp_path)
        .await
        .context("Failed to create temp file")?;

    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut stream = std::pin::pin!(stream);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading download stream")?;
        let chunk = chunk.as_ref();
        file.write_all(chunk)
            .await
            .context("Failed to write to temp file")?;
        hasher.update(chunk);
        downloaded += chunk.len() as u64;
    }

    file.flush().await.context("Failed to flush temp file")?;
    Ok((downloaded, format!("{:x}", hasher.finalize())))
}
