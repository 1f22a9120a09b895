//! Tesseract backend driven through the `tesseract` command-line program
//!
//! The native boundary is [`TesseractBackend`] / [`TesseractWorker`]; the CLI
//! implementation pipes a PNG to `tesseract stdin stdout ... tsv` and folds
//! the TSV rows into line-level results. [`TesseractAdapter`] turns those
//! lines into [`Annotation`]s.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::TesseractSettings;

use super::adapter::{AdapterError, AdapterState, EngineLost, Lifecycle, OcrAdapter};
use super::annotation::{Annotation, Point, Polygon, RecognitionResult, ValidationError};
use super::source::SourceImage;

/// Two-corner line box as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

/// One recognized text line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TesseractLine {
    pub bbox: BBox,
    /// Mean word confidence in [0, 100]; negative when no word reported one
    pub confidence: f32,
    pub text: String,
}

/// Native result of one recognition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TesseractPage {
    pub lines: Vec<TesseractLine>,
}

/// Creates recognition workers
#[async_trait]
pub trait TesseractBackend: Send + Sync {
    async fn create_worker(&self) -> Result<Arc<dyn TesseractWorker>>;
}

/// A ready-to-use recognizer. Released when the last reference drops.
#[async_trait]
pub trait TesseractWorker: Send + Sync {
    async fn recognize(&self, image: Arc<SourceImage>) -> Result<TesseractPage>;
}

/// Backend that shells out to the `tesseract` binary
pub struct TesseractCli {
    settings: TesseractSettings,
}

impl TesseractCli {
    pub fn new(settings: TesseractSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TesseractBackend for TesseractCli {
    async fn create_worker(&self) -> Result<Arc<dyn TesseractWorker>> {
        let binary = &self.settings.binary;

        let version = run_capture(binary, &["--version"])
            .await
            .with_context(|| format!("tesseract binary not usable: {}", binary.display()))?;
        let version = version.lines().next().unwrap_or_default().trim().to_string();
        info!("Found {}", version);

        // `--list-langs` prints a header line, then one language per line
        let listing = run_capture(binary, &["--list-langs"]).await?;
        let installed = parse_language_list(&listing);
        let language = &self.settings.language;
        for wanted in language.split('+') {
            if !installed.iter().any(|l| l == wanted) {
                bail!(
                    "tesseract language '{}' is not installed (available: {})",
                    wanted,
                    installed.join(", ")
                );
            }
        }
        debug!("Tesseract languages available: {:?}", installed);

        Ok(Arc::new(CliWorker {
            binary: binary.clone(),
            args: recognize_args(&self.settings),
        }))
    }
}

/// Run the binary and return its stdout. A missing binary is reported as [`EngineLost`].
async fn run_capture(binary: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| spawn_error(binary, e))?;

    if !output.status.success() {
        bail!(
            "{} {} exited with {}: {}",
            binary.display(),
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    // Older releases print --version to stderr
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if text.trim().is_empty() {
        text = String::from_utf8_lossy(&output.stderr).into_owned();
    }
    Ok(text)
}

fn spawn_error(binary: &Path, e: std::io::Error) -> anyhow::Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        anyhow::Error::new(EngineLost(format!(
            "tesseract binary not found: {}",
            binary.display()
        )))
    } else {
        anyhow::Error::new(e).context(format!("failed to run {}", binary.display()))
    }
}

fn parse_language_list(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("List of available languages"))
        .map(str::to_string)
        .collect()
}

fn recognize_args(settings: &TesseractSettings) -> Vec<String> {
    let mut args = vec![
        "stdin".to_string(),
        "stdout".to_string(),
        "-l".to_string(),
        settings.language.clone(),
        "--psm".to_string(),
        settings.page_seg_mode.to_string(),
    ];
    for (name, value) in &settings.variables {
        args.push("-c".to_string());
        args.push(format!("{name}={value}"));
    }
    args.push("tsv".to_string());
    args
}

struct CliWorker {
    binary: PathBuf,
    args: Vec<String>,
}

#[async_trait]
impl TesseractWorker for CliWorker {
    async fn recognize(&self, image: Arc<SourceImage>) -> Result<TesseractPage> {
        let png = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut buf = Cursor::new(Vec::new());
            image.image().write_to(&mut buf, ImageFormat::Png)?;
            Ok(buf.into_inner())
        })
        .await??;

        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&png)
                .await
                .context("failed to pipe image to tesseract")?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let page = parse_tsv(&tsv)?;
        debug!("tesseract returned {} lines", page.lines.len());
        Ok(page)
    }
}

#[derive(Default)]
struct LineAccumulator {
    bbox: Option<BBox>,
    words: Vec<String>,
    confidences: Vec<f32>,
}

/// Fold tesseract TSV output into line results.
///
/// Level-4 rows carry line boxes, level-5 rows carry words. Lines end up in
/// the order their level-4 row appeared; lines without words are dropped.
pub fn parse_tsv(tsv: &str) -> Result<TesseractPage> {
    let mut order: Vec<(u32, u32, u32, u32)> = Vec::new();
    let mut lines: HashMap<(u32, u32, u32, u32), LineAccumulator> = HashMap::new();

    for (row, raw) in tsv.lines().enumerate() {
        if raw.starts_with("level") || raw.trim().is_empty() {
            continue;
        }

        let cols: Vec<&str> = raw.split('\t').collect();
        if cols.len() < 11 {
            bail!("malformed tsv row {}: {:?}", row + 1, raw);
        }

        let num = |i: usize| -> Result<u32> {
            cols[i]
                .trim()
                .parse::<u32>()
                .with_context(|| format!("bad column {} in tsv row {}", i + 1, row + 1))
        };
        let level = num(0)?;
        let key = (num(1)?, num(2)?, num(3)?, num(4)?);

        match level {
            4 => {
                let (left, top, width, height) = (num(6)?, num(7)?, num(8)?, num(9)?);
                if !lines.contains_key(&key) {
                    order.push(key);
                }
                lines.entry(key).or_default().bbox = Some(BBox {
                    x0: left as f32,
                    y0: top as f32,
                    x1: (left + width) as f32,
                    y1: (top + height) as f32,
                });
            }
            5 => {
                let text = cols.get(11).map(|t| t.trim()).unwrap_or_default();
                if text.is_empty() {
                    continue;
                }
                let conf: f32 = cols[10]
                    .trim()
                    .parse()
                    .with_context(|| format!("bad confidence in tsv row {}", row + 1))?;

                if !lines.contains_key(&key) {
                    order.push(key);
                }
                let line = lines.entry(key).or_default();
                line.words.push(text.to_string());
                if conf >= 0.0 {
                    line.confidences.push(conf);
                }
            }
            _ => {}
        }
    }

    let lines = order
        .into_iter()
        .filter_map(|key| {
            let acc = lines.remove(&key)?;
            let bbox = acc.bbox?;
            if acc.words.is_empty() {
                return None;
            }
            let confidence = if acc.confidences.is_empty() {
                -1.0
            } else {
                acc.confidences.iter().sum::<f32>() / acc.confidences.len() as f32
            };
            Some(TesseractLine {
                bbox,
                confidence,
                text: acc.words.join(" "),
            })
        })
        .collect();

    Ok(TesseractPage { lines })
}

/// Convert native lines into annotations: each two-corner box becomes a
/// TL/TR/BR/BL polygon and negative confidences become `None`.
pub fn normalize_page(page: &TesseractPage) -> Result<Vec<Annotation>, ValidationError> {
    page.lines
        .iter()
        .map(|line| {
            let polygon = Polygon::from_corners(
                Point::new(line.bbox.x0, line.bbox.y0),
                Point::new(line.bbox.x1, line.bbox.y1),
            )?;
            let confidence = (line.confidence >= 0.0).then_some(line.confidence);
            Annotation::new(polygon, &line.text, confidence)
        })
        .collect()
}

/// Adapter over any [`TesseractBackend`]
pub struct TesseractAdapter {
    lifecycle: Lifecycle<dyn TesseractWorker>,
    backend: Box<dyn TesseractBackend>,
}

impl TesseractAdapter {
    pub fn new(backend: impl TesseractBackend + 'static) -> Self {
        Self {
            lifecycle: Lifecycle::new("Tesseract"),
            backend: Box::new(backend),
        }
    }

    /// Adapter over the command-line engine
    pub fn cli(settings: TesseractSettings) -> Self {
        Self::new(TesseractCli::new(settings))
    }
}

#[async_trait]
impl OcrAdapter for TesseractAdapter {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn state(&self) -> AdapterState {
        self.lifecycle.state()
    }

    async fn initialize(&self) -> Result<Option<Duration>, AdapterError> {
        self.lifecycle
            .initialize_with(|| self.backend.create_worker())
            .await
    }

    async fn recognize(&self, image: Arc<SourceImage>) -> Result<RecognitionResult, AdapterError> {
        let page = self
            .lifecycle
            .recognize_with(|worker| async move { worker.recognize(image).await })
            .await?;

        let annotations = normalize_page(&page)?;
        let raw = serde_json::to_value(&page).unwrap_or_default();
        Ok(RecognitionResult { annotations, raw })
    }

    fn dispose(&self) {
        drop(self.lifecycle.dispose());
    }
}
