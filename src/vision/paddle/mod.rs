//! PaddleOCR backend
//!
//! The native boundary is [`PaddleBackend`] (loads a model set) and
//! [`PaddleSession`] (runs detection plus recognition). Native output is two
//! parallel sequences, quads and strings, with no per-line score.

pub mod engine;
pub mod models;
pub mod postprocess;
pub mod preprocess;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::PaddleSettings;
use crate::overlay::{SharedSurface, Surface};

use super::adapter::{AdapterError, AdapterState, Lifecycle, OcrAdapter};
use super::annotation::{Annotation, Polygon, RecognitionResult, ValidationError};
use super::source::SourceImage;

pub use engine::OnnxPaddle;

/// Native result of one recognition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaddleOutput {
    /// One polygon per detected region
    pub points: Vec<Vec<[f32; 2]>>,
    /// Recognized strings, index-aligned with `points`
    pub text: Vec<String>,
}

/// Loads a model set
#[async_trait]
pub trait PaddleBackend: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn PaddleSession>>;
}

/// A loaded model set. Released when the last reference drops.
#[async_trait]
pub trait PaddleSession: Send + Sync {
    /// Recognize `image`, drawing the engine's own detection output onto `diagnostics`
    async fn recognize(&self, image: Arc<SourceImage>, diagnostics: SharedSurface) -> Result<PaddleOutput>;
}

/// Zip polygons and strings by index into annotations without confidence.
///
/// The shorter sequence wins when the lengths differ.
pub fn normalize_output(output: &PaddleOutput) -> Result<Vec<Annotation>, ValidationError> {
    if output.points.len() != output.text.len() {
        warn!(
            "Paddle returned {} polygons but {} strings, keeping {}",
            output.points.len(),
            output.text.len(),
            output.points.len().min(output.text.len())
        );
    }

    output
        .points
        .iter()
        .zip(&output.text)
        .map(|(points, text)| {
            let polygon = Polygon::try_from_points(points.iter().copied())?;
            Annotation::new(polygon, text, None)
        })
        .collect()
}

/// Adapter over any [`PaddleBackend`]
pub struct PaddleAdapter {
    lifecycle: Lifecycle<dyn PaddleSession>,
    backend: Box<dyn PaddleBackend>,
    diagnostics: SharedSurface,
}

impl PaddleAdapter {
    /// `diagnostics` receives the engine's own drawing on every recognition
    pub fn new(backend: impl PaddleBackend + 'static, diagnostics: SharedSurface) -> Self {
        Self {
            lifecycle: Lifecycle::new("Paddle"),
            backend: Box::new(backend),
            diagnostics,
        }
    }

    /// Adapter over the ONNX Runtime engine
    pub fn onnx(settings: PaddleSettings, models_dir: PathBuf) -> Self {
        Self::new(OnnxPaddle::new(settings, models_dir), Surface::shared())
    }

    pub fn diagnostic_surface(&self) -> &SharedSurface {
        &self.diagnostics
    }
}

#[async_trait]
impl OcrAdapter for PaddleAdapter {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn state(&self) -> AdapterState {
        self.lifecycle.state()
    }

    async fn initialize(&self) -> Result<Option<Duration>, AdapterError> {
        self.lifecycle.initialize_with(|| self.backend.load()).await
    }

    async fn recognize(&self, image: Arc<SourceImage>) -> Result<RecognitionResult, AdapterError> {
        let diagnostics = self.diagnostics.clone();
        let output = self
            .lifecycle
            .recognize_with(|session| async move { session.recognize(image, diagnostics).await })
            .await?;

        let annotations = normalize_output(&output)?;
        let raw = serde_json::to_value(&output).unwrap_or_default();
        Ok(RecognitionResult { annotations, raw })
    }

    fn dispose(&self) {
        drop(self.lifecycle.dispose());
    }

    fn diagnostics(&self) -> Option<SharedSurface> {
        Some(self.diagnostics.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::annotation::{Point, TOP_LEFT};
    use crate::vision::source::tests::png_bytes;
    use image::Rgba;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quad(x: f32, y: f32) -> Vec<[f32; 2]> {
        vec![[x, y], [x + 50.0, y], [x + 50.0, y + 10.0], [x, y + 10.0]]
    }

    #[test]
    fn test_normalize_zips_with_no_confidence() {
        let output = PaddleOutput {
            points: vec![quad(0.0, 0.0), quad(0.0, 20.0)],
            text: vec!["first".into(), " second ".into()],
        };

        let annotations = normalize_output(&output).unwrap();
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[1].text(), "second");
        assert_eq!(annotations[1].polygon().points()[TOP_LEFT], Point::new(0.0, 20.0));
        assert!(annotations.iter().all(|a| a.confidence().is_none()));
    }

    #[test]
    fn test_normalize_uses_shorter_length() {
        let output = PaddleOutput {
            points: vec![quad(0.0, 0.0), quad(0.0, 20.0), quad(0.0, 40.0)],
            text: vec!["a".into(), "b".into()],
        };
        assert_eq!(normalize_output(&output).unwrap().len(), 2);

        let output = PaddleOutput {
            points: vec![quad(0.0, 0.0)],
            text: vec!["a".into(), "b".into()],
        };
        assert_eq!(normalize_output(&output).unwrap().len(), 1);
    }

    #[test]
    fn test_normalize_rejects_malformed_polygon() {
        let output = PaddleOutput {
            points: vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]],
            text: vec!["a".into()],
        };
        assert_eq!(
            normalize_output(&output),
            Err(ValidationError::PointCount(3))
        );
    }

    struct FakeBackend {
        output: PaddleOutput,
        loads: Arc<AtomicUsize>,
        fail_first: bool,
    }

    struct FakeSession {
        output: PaddleOutput,
    }

    #[async_trait]
    impl PaddleBackend for FakeBackend {
        async fn load(&self) -> Result<Arc<dyn PaddleSession>> {
            let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && attempt == 0 {
                anyhow::bail!("model download failed");
            }
            Ok(Arc::new(FakeSession {
                output: self.output.clone(),
            }))
        }
    }

    #[async_trait]
    impl PaddleSession for FakeSession {
        async fn recognize(&self, image: Arc<SourceImage>, diagnostics: SharedSurface) -> Result<PaddleOutput> {
            {
                let mut surface = diagnostics.lock();
                surface.load(image.image());
                surface.pixels_mut().put_pixel(0, 0, Rgba([255, 0, 0, 255]));
            }
            Ok(self.output.clone())
        }
    }

    fn adapter(output: PaddleOutput, fail_first: bool) -> (PaddleAdapter, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let adapter = PaddleAdapter::new(
            FakeBackend {
                output,
                loads: loads.clone(),
                fail_first,
            },
            Surface::shared(),
        );
        (adapter, loads)
    }

    #[tokio::test]
    async fn test_recognize_draws_diagnostics() {
        let output = PaddleOutput {
            points: vec![quad(5.0, 5.0)],
            text: vec!["hello".into()],
        };
        let (adapter, _) = adapter(output, false);
        adapter.initialize().await.unwrap();

        let image = SourceImage::decode("page.png", png_bytes(64, 32)).await.unwrap();
        let result = adapter.recognize(image).await.unwrap();

        assert_eq!(result.annotations.len(), 1);
        assert_eq!(result.raw["text"][0], "hello");

        let surface = adapter.diagnostic_surface().lock();
        assert_eq!(surface.dimensions(), (64, 32));
        assert_eq!(*surface.pixels().get_pixel(0, 0), Rgba([255, 0, 0, 255]));
    }

    #[tokio::test]
    async fn test_failed_load_then_retry() {
        let (adapter, loads) = adapter(PaddleOutput::default(), true);

        let err = adapter.initialize().await.unwrap_err();
        assert!(matches!(err, AdapterError::Initialization { .. }));
        assert_eq!(adapter.state(), AdapterState::Uninitialized);

        let image = SourceImage::decode("page.png", png_bytes(8, 8)).await.unwrap();
        assert!(matches!(
            adapter.recognize(image.clone()).await,
            Err(AdapterError::NotReady { .. })
        ));

        assert!(adapter.initialize().await.unwrap().is_some());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(adapter.recognize(image).await.unwrap().annotations.is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_adapter_ready() {
        let output = PaddleOutput {
            points: vec![vec![[0.0, 0.0]]],
            text: vec!["x".into()],
        };
        let (adapter, _) = adapter(output, false);
        adapter.initialize().await.unwrap();

        let image = SourceImage::decode("page.png", png_bytes(8, 8)).await.unwrap();
        assert!(matches!(
            adapter.recognize(image).await,
            Err(AdapterError::Validation(_))
        ));
        assert_eq!(adapter.state(), AdapterState::Ready);
    }
}
