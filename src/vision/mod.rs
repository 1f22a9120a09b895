//! Vision/OCR Layer
//!
//! Canonical annotation model, the adapter contract, and the two engine
//! backends:
//! - Tesseract via its command-line program
//! - PaddleOCR via ONNX Runtime

pub mod adapter;
pub mod annotation;
pub mod paddle;
pub mod source;
pub mod tesseract;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::overlay::SharedSurface;

pub use adapter::{AdapterError, AdapterState, EngineLost, OcrAdapter};
pub use annotation::{
    Annotation, Point, Polygon, RecognitionResult, ValidationError, BOTTOM_LEFT, BOTTOM_RIGHT,
    TOP_LEFT, TOP_RIGHT,
};
pub use paddle::PaddleAdapter;
pub use source::{DecodeError, SourceImage};
pub use tesseract::TesseractAdapter;

/// OCR backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrBackend {
    /// Tesseract command-line engine
    Tesseract,
    /// PaddleOCR via ONNX Runtime
    Paddle,
}

impl OcrBackend {
    pub const ALL: [OcrBackend; 2] = [OcrBackend::Tesseract, OcrBackend::Paddle];
}

impl fmt::Display for OcrBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrBackend::Tesseract => f.write_str("tesseract"),
            OcrBackend::Paddle => f.write_str("paddle"),
        }
    }
}

/// Closed set of engine adapters the harness knows how to build
pub enum EngineAdapter {
    Tesseract(TesseractAdapter),
    Paddle(PaddleAdapter),
}

impl EngineAdapter {
    pub fn backend(&self) -> OcrBackend {
        match self {
            EngineAdapter::Tesseract(_) => OcrBackend::Tesseract,
            EngineAdapter::Paddle(_) => OcrBackend::Paddle,
        }
    }

    fn inner(&self) -> &dyn OcrAdapter {
        match self {
            EngineAdapter::Tesseract(adapter) => adapter,
            EngineAdapter::Paddle(adapter) => adapter,
        }
    }
}

impl From<TesseractAdapter> for EngineAdapter {
    fn from(adapter: TesseractAdapter) -> Self {
        EngineAdapter::Tesseract(adapter)
    }
}

impl From<PaddleAdapter> for EngineAdapter {
    fn from(adapter: PaddleAdapter) -> Self {
        EngineAdapter::Paddle(adapter)
    }
}

#[async_trait]
impl OcrAdapter for EngineAdapter {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn state(&self) -> AdapterState {
        self.inner().state()
    }

    async fn initialize(&self) -> Result<Option<Duration>, AdapterError> {
        self.inner().initialize().await
    }

    async fn recognize(&self, image: Arc<SourceImage>) -> Result<RecognitionResult, AdapterError> {
        self.inner().recognize(image).await
    }

    fn dispose(&self) {
        self.inner().dispose()
    }

    fn diagnostics(&self) -> Option<SharedSurface> {
        self.inner().diagnostics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PaddleSettings, TesseractSettings};
    use std::path::PathBuf;

    #[test]
    fn test_backend_serde_names() {
        assert_eq!(serde_json::to_string(&OcrBackend::Paddle).unwrap(), "\"paddle\"");
        let parsed: OcrBackend = serde_json::from_str("\"tesseract\"").unwrap();
        assert_eq!(parsed, OcrBackend::Tesseract);
    }

    #[test]
    fn test_engine_adapter_delegates() {
        let tesseract = EngineAdapter::from(TesseractAdapter::cli(TesseractSettings::default()));
        assert_eq!(tesseract.backend(), OcrBackend::Tesseract);
        assert_eq!(tesseract.name(), "Tesseract");
        assert_eq!(tesseract.state(), AdapterState::Uninitialized);
        assert!(tesseract.diagnostics().is_none());

        let paddle = EngineAdapter::from(PaddleAdapter::onnx(
            PaddleSettings::default(),
            PathBuf::from("/nonexistent/models"),
        ));
        assert_eq!(paddle.backend(), OcrBackend::Paddle);
        assert_eq!(paddle.name(), "Paddle");
        assert!(paddle.diagnostics().is_some());
    }
}
