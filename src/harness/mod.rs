//! Harness Controller
//!
//! Holds the current input image and the injected adapters, drives their
//! initialization, and runs recognize-and-render cycles on demand.

pub mod timing;

use futures_util::future::join_all;
use parking_lot::RwLock;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::overlay::{OverlayRenderer, RenderReport, SharedSurface, Surface};
use crate::vision::{AdapterError, DecodeError, OcrAdapter, RecognitionResult, SourceImage};

pub use timing::{OperationKind, TimingHarness, TimingSample};

/// Handle returned by [`HarnessController::add_adapter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterId(pub(crate) usize);

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adapter#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("no image selected")]
    NoImage,
    #[error("unknown {0}")]
    UnknownAdapter(AdapterId),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// One line of the timing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingRow {
    pub id: AdapterId,
    pub name: String,
    pub init_ms: Option<u64>,
    pub recognize_ms: Option<u64>,
}

impl fmt::Display for TimingRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = |v: Option<u64>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
        write!(
            f,
            "[{} cost] init: {}ms / recognize: {}ms",
            self.name,
            ms(self.init_ms),
            ms(self.recognize_ms)
        )
    }
}

/// What one successful recognize-and-render cycle produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: RecognitionResult,
    pub report: RenderReport,
    pub elapsed: Duration,
    /// Name of the image the cycle ran against
    pub image: String,
}

struct AdapterSlot {
    adapter: Arc<dyn OcrAdapter>,
    surface: SharedSurface,
}

pub struct HarnessController {
    adapters: Vec<AdapterSlot>,
    image: RwLock<Option<Arc<SourceImage>>>,
    renderer: OverlayRenderer,
    timings: TimingHarness,
    recognize_timeout: Option<Duration>,
}

impl HarnessController {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            adapters: Vec::new(),
            image: RwLock::new(None),
            renderer: OverlayRenderer::from_settings(&config.overlay),
            timings: TimingHarness::new(),
            recognize_timeout: config.harness.recognize_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn with_renderer(mut self, renderer: OverlayRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Register an adapter. Each one gets its own overlay surface.
    pub fn add_adapter(&mut self, adapter: Arc<dyn OcrAdapter>) -> AdapterId {
        let id = AdapterId(self.adapters.len());
        debug!("Registered {} as {}", adapter.name(), id);
        self.adapters.push(AdapterSlot {
            adapter,
            surface: Surface::shared(),
        });
        id
    }

    pub fn ids(&self) -> impl Iterator<Item = AdapterId> {
        (0..self.adapters.len()).map(AdapterId)
    }

    pub fn adapter(&self, id: AdapterId) -> Option<&Arc<dyn OcrAdapter>> {
        self.adapters.get(id.0).map(|slot| &slot.adapter)
    }

    fn slot(&self, id: AdapterId) -> Result<&AdapterSlot, HarnessError> {
        self.adapters.get(id.0).ok_or(HarnessError::UnknownAdapter(id))
    }

    /// Decode `path` and make it the current image. On failure the previous
    /// image stays selected.
    pub async fn select_file(&self, path: &Path) -> Result<Arc<SourceImage>, DecodeError> {
        let image = SourceImage::open(path).await?;
        Ok(self.replace_image(image))
    }

    pub async fn select_bytes(
        &self,
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<Arc<SourceImage>, DecodeError> {
        let image = SourceImage::decode(name, bytes).await?;
        Ok(self.replace_image(image))
    }

    fn replace_image(&self, image: Arc<SourceImage>) -> Arc<SourceImage> {
        let (width, height) = image.dimensions();
        info!("Selected {} ({}x{})", image.name(), width, height);
        *self.image.write() = Some(image.clone());
        image
    }

    pub fn current_image(&self) -> Option<Arc<SourceImage>> {
        self.image.read().clone()
    }

    /// Initialize every adapter concurrently
    pub async fn initialize_all(&self) -> Vec<(AdapterId, Result<Option<Duration>, AdapterError>)> {
        let timings = &self.timings;
        let tasks = self.adapters.iter().enumerate().map(|(index, slot)| async move {
            let id = AdapterId(index);
            let outcome = timings.time_initialize(id, slot.adapter.as_ref()).await;
            if let Err(e) = &outcome {
                warn!("{}", e);
            }
            (id, outcome)
        });
        join_all(tasks).await
    }

    /// Recognize the current image with one adapter and render the result onto
    /// its surface. A failed cycle leaves the surface and timings as they were.
    pub async fn run(&self, id: AdapterId) -> Result<RunOutcome, HarnessError> {
        let slot = self.slot(id)?;
        let image = self.current_image().ok_or(HarnessError::NoImage)?;
        let adapter = &slot.adapter;

        debug!("{} recognizing {} ({})", adapter.name(), image.name(), image.id());
        let start = tokio::time::Instant::now();
        let result = self
            .timings
            .time(id, OperationKind::Recognize, self.recognize(adapter, image.clone()))
            .await?;
        let elapsed = start.elapsed();

        let report = {
            let mut surface = slot.surface.lock();
            self.renderer.render(&mut surface, image.image(), &result.annotations)
        };
        info!(
            "{} found {} regions in {} ({:?})",
            adapter.name(),
            result.annotations.len(),
            image.name(),
            elapsed
        );

        Ok(RunOutcome {
            result,
            report,
            elapsed,
            image: image.name().to_string(),
        })
    }

    /// With a timeout the call runs in its own task. Expiry only stops the
    /// wait: the adapter stays `Recognizing` until the native work finishes,
    /// so later calls see `Busy` instead of overlapping it.
    async fn recognize(
        &self,
        adapter: &Arc<dyn OcrAdapter>,
        image: Arc<SourceImage>,
    ) -> Result<RecognitionResult, AdapterError> {
        let Some(after) = self.recognize_timeout else {
            return adapter.recognize(image).await;
        };

        let task = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.recognize(image).await })
        };

        match tokio::time::timeout(after, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(AdapterError::Recognition {
                adapter: adapter.name().to_string(),
                source: anyhow::Error::new(join),
            }),
            Err(_) => {
                warn!(
                    "{} did not finish within {:?}, it stays busy until the engine returns",
                    adapter.name(),
                    after
                );
                Err(AdapterError::Timeout {
                    adapter: adapter.name().to_string(),
                    after,
                })
            }
        }
    }

    /// Run every adapter concurrently against the current image
    pub async fn run_all(&self) -> Vec<(AdapterId, Result<RunOutcome, HarnessError>)> {
        let tasks = self.ids().map(|id| async move { (id, self.run(id).await) });
        join_all(tasks).await
    }

    pub fn timings(&self) -> Vec<TimingRow> {
        self.adapters
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let id = AdapterId(index);
                let sample = self.timings.sample(id);
                TimingRow {
                    id,
                    name: slot.adapter.name().to_string(),
                    init_ms: sample.init_ms,
                    recognize_ms: sample.recognize_ms,
                }
            })
            .collect()
    }

    /// Overlay surface the harness renders `id`'s results onto
    pub fn surface(&self, id: AdapterId) -> Option<SharedSurface> {
        self.adapters.get(id.0).map(|slot| slot.surface.clone())
    }

    /// Surface the engine itself draws onto, for engines that have one
    pub fn diagnostics(&self, id: AdapterId) -> Option<SharedSurface> {
        self.adapters.get(id.0).and_then(|slot| slot.adapter.diagnostics())
    }

    pub fn dispose_all(&self) {
        for slot in &self.adapters {
            slot.adapter.dispose();
        }
        info!("Disposed {} adapters", self.adapters.len());
    }
}
