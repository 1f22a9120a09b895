//! Application Configuration
//!
//! User settings stored in TOML format.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Tesseract engine settings
    pub tesseract: TesseractSettings,
    /// PaddleOCR engine settings
    pub paddle: PaddleSettings,
    /// Overlay drawing settings
    pub overlay: OverlaySettings,
    /// Harness behavior
    pub harness: HarnessSettings,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
    /// Directory overlay PNGs are written to
    pub output_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            output_dir: PathBuf::from("ocr-bench-out"),
        }
    }
}

/// Tesseract command-line engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseractSettings {
    /// Path or name of the tesseract executable
    pub binary: PathBuf,
    /// Traineddata language code (e.g. "eng", "chi_sim")
    pub language: String,
    /// Page segmentation mode passed as --psm
    pub page_seg_mode: u8,
    /// Extra `-c name=value` variables
    pub variables: BTreeMap<String, String>,
}

impl Default for TesseractSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            language: "eng".to_string(),
            page_seg_mode: 3,
            variables: BTreeMap::new(),
        }
    }
}

/// PaddleOCR (ONNX Runtime) engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaddleSettings {
    /// Model cache directory; defaults to `<data_dir>/models`
    pub models_dir: Option<PathBuf>,
    /// Recognition model language folder on the model host
    pub language: String,
    /// Intra-op threads per ONNX session
    pub threads: usize,
    /// Longest side fed to the detector
    pub limit_side_len: u32,
    /// Probability threshold for the detection bitmap
    pub det_threshold: f32,
    /// Minimum mean probability for a detected box
    pub box_threshold: f32,
    /// Box expansion ratio
    pub unclip_ratio: f32,
    /// Maximum contours examined per image
    pub max_candidates: usize,
    /// Recognition batch size
    pub rec_batch_size: usize,
    /// Recognition input height
    pub rec_image_height: u32,
}

impl Default for PaddleSettings {
    fn default() -> Self {
        Self {
            models_dir: None,
            language: "english".to_string(),
            threads: 4,
            limit_side_len: 960,
            det_threshold: 0.3,
            box_threshold: 0.6,
            unclip_ratio: 1.5,
            max_candidates: 1000,
            rec_batch_size: 6,
            rec_image_height: 48,
        }
    }
}

/// Overlay drawing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    /// TrueType font for labels; system fonts are tried when unset
    pub font_path: Option<PathBuf>,
    /// Label font size in pixels
    pub font_scale: f32,
    /// Outline thickness in pixels
    pub stroke_width: u32,
    pub stroke_color: [u8; 4],
    pub fill_color: [u8; 4],
    pub label_color: [u8; 4],
    pub label_background: [u8; 4],
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            font_path: None,
            font_scale: 16.0,
            stroke_width: 2,
            stroke_color: [0, 200, 0, 255],
            fill_color: [0, 200, 0, 48],
            label_color: [255, 255, 255, 255],
            label_background: [0, 0, 0, 160],
        }
    }
}

/// Harness behavior settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    /// Abandon a recognition after this many milliseconds. Unbounded when unset.
    pub recognize_timeout_ms: Option<u64>,
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
