//! Uniform adapter contract over heterogeneous OCR engines
//!
//! Every backend exposes the same lifecycle: `initialize` once (idempotent),
//! `recognize` any number of times (one call in flight per adapter), and
//! `dispose` from any state. [`Lifecycle`] holds the state machine and the
//! native handle; adapters compose it instead of sharing a base type.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::overlay::SharedSurface;

use super::annotation::{RecognitionResult, ValidationError};
use super::source::SourceImage;

/// Lifecycle of one adapter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Uninitialized,
    Initializing,
    Ready,
    Recognizing,
    /// The native engine reported its handle is unusable. Re-initialize to recover.
    Failed,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterState::Uninitialized => "uninitialized",
            AdapterState::Initializing => "initializing",
            AdapterState::Ready => "ready",
            AdapterState::Recognizing => "recognizing",
            AdapterState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by adapters
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{adapter}: initialization failed: {source:#}")]
    Initialization {
        adapter: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{adapter}: not ready (state: {state})")]
    NotReady { adapter: String, state: AdapterState },
    #[error("{adapter}: a recognition is already in flight")]
    Busy { adapter: String },
    #[error("invalid annotation: {0}")]
    Validation(#[from] ValidationError),
    #[error("{adapter}: recognition failed: {source:#}")]
    Recognition {
        adapter: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{adapter}: engine handle lost: {source:#}")]
    EngineLost {
        adapter: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{adapter}: disposed while the operation was in flight")]
    Disposed { adapter: String },
    #[error("{adapter}: recognition timed out after {after:?}")]
    Timeout { adapter: String, after: Duration },
}

/// Marker a native engine returns (inside `anyhow::Error`) when its handle can
/// no longer be used and the adapter must be re-initialized.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EngineLost(pub String);

/// Capability contract every OCR backend satisfies
#[async_trait]
pub trait OcrAdapter: Send + Sync {
    /// Display name, e.g. "Tesseract"
    fn name(&self) -> &str;

    fn state(&self) -> AdapterState;

    /// One-time setup. Returns the setup duration, or `None` when the adapter
    /// was already initialized or initializing and nothing ran.
    async fn initialize(&self) -> Result<Option<Duration>, AdapterError>;

    /// Recognize text in `image`. Only valid in [`AdapterState::Ready`].
    async fn recognize(&self, image: Arc<SourceImage>) -> Result<RecognitionResult, AdapterError>;

    /// Release the native handle. Safe from any state.
    fn dispose(&self);

    /// Surface the engine draws its own output onto, if it has one
    fn diagnostics(&self) -> Option<SharedSurface> {
        None
    }
}

struct Slot<H: ?Sized> {
    state: AdapterState,
    handle: Option<Arc<H>>,
    /// Bumped on dispose so in-flight work started before it cannot
    /// overwrite the state that follows.
    generation: u64,
}

/// State machine plus native handle for one adapter
pub struct Lifecycle<H: ?Sized> {
    name: String,
    slot: Mutex<Slot<H>>,
}

impl<H: ?Sized + Send + Sync> Lifecycle<H> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: Mutex::new(Slot {
                state: AdapterState::Uninitialized,
                handle: None,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AdapterState {
        self.slot.lock().state
    }

    /// Claim the right to initialize. `None` if another call already did.
    fn begin_init(&self) -> Option<InitGuard<'_, H>> {
        let mut slot = self.slot.lock();
        match slot.state {
            AdapterState::Uninitialized | AdapterState::Failed => {
                slot.state = AdapterState::Initializing;
                Some(InitGuard {
                    lifecycle: self,
                    generation: slot.generation,
                    settled: false,
                })
            }
            _ => None,
        }
    }

    /// Run `setup` unless the adapter is already initialized or initializing.
    ///
    /// The returned duration covers `setup` only.
    pub async fn initialize_with<F, Fut>(&self, setup: F) -> Result<Option<Duration>, AdapterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<H>>>,
    {
        let Some(guard) = self.begin_init() else {
            debug!("{}: initialize skipped (state: {})", self.name, self.state());
            return Ok(None);
        };

        info!("Initializing {}", self.name);
        let start = Instant::now();
        let outcome = setup().await;
        let elapsed = start.elapsed();

        guard.settle(outcome)?;
        info!("{} initialized in {:?}", self.name, elapsed);
        Ok(Some(elapsed))
    }

    fn begin_recognize(&self) -> Result<RecognizeGuard<'_, H>, AdapterError> {
        let mut slot = self.slot.lock();
        match slot.state {
            AdapterState::Ready => {
                let Some(handle) = slot.handle.clone() else {
                    return Err(AdapterError::NotReady {
                        adapter: self.name.clone(),
                        state: slot.state,
                    });
                };
                slot.state = AdapterState::Recognizing;
                Ok(RecognizeGuard {
                    lifecycle: self,
                    generation: slot.generation,
                    handle,
                })
            }
            AdapterState::Recognizing => Err(AdapterError::Busy {
                adapter: self.name.clone(),
            }),
            state => Err(AdapterError::NotReady {
                adapter: self.name.clone(),
                state,
            }),
        }
    }

    /// Run `call` against the native handle while holding the `Recognizing` state.
    ///
    /// Native errors carrying [`EngineLost`] move the adapter to `Failed`;
    /// every other outcome returns it to `Ready`.
    pub async fn recognize_with<F, Fut, T>(&self, call: F) -> Result<T, AdapterError>
    where
        F: FnOnce(Arc<H>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let guard = self.begin_recognize()?;
        match call(guard.handle.clone()).await {
            Ok(value) => Ok(value),
            Err(source) if source.downcast_ref::<EngineLost>().is_some() => {
                guard.lose();
                Err(AdapterError::EngineLost {
                    adapter: self.name.clone(),
                    source,
                })
            }
            Err(source) => Err(AdapterError::Recognition {
                adapter: self.name.clone(),
                source,
            }),
        }
    }

    /// Drop the native handle and return to `Uninitialized`.
    ///
    /// Returns the handle so the caller decides where the last reference dies.
    pub fn dispose(&self) -> Option<Arc<H>> {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        let previous = slot.state;
        slot.state = AdapterState::Uninitialized;
        let handle = slot.handle.take();
        debug!("{}: disposed (was {})", self.name, previous);
        handle
    }
}

/// Holds the `Initializing` state; reverts to `Uninitialized` if dropped unsettled
struct InitGuard<'a, H: ?Sized> {
    lifecycle: &'a Lifecycle<H>,
    generation: u64,
    settled: bool,
}

impl<H: ?Sized> InitGuard<'_, H> {
    fn settle(mut self, outcome: anyhow::Result<Arc<H>>) -> Result<(), AdapterError> {
        self.settled = true;
        let name = &self.lifecycle.name;
        let mut slot = self.lifecycle.slot.lock();

        if slot.generation != self.generation {
            // Disposed mid-setup: the fresh handle (if any) is dropped here.
            warn!("{}: initialization finished after dispose, discarding", name);
            return Err(AdapterError::Disposed {
                adapter: name.clone(),
            });
        }

        match outcome {
            Ok(handle) => {
                slot.handle = Some(handle);
                slot.state = AdapterState::Ready;
                Ok(())
            }
            Err(source) => {
                slot.state = AdapterState::Uninitialized;
                Err(AdapterError::Initialization {
                    adapter: name.clone(),
                    source,
                })
            }
        }
    }
}

impl<H: ?Sized> Drop for InitGuard<'_, H> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut slot = self.lifecycle.slot.lock();
        if slot.generation == self.generation && slot.state == AdapterState::Initializing {
            slot.state = AdapterState::Uninitialized;
        }
    }
}

/// Holds the `Recognizing` state; returns to `Ready` on drop
struct RecognizeGuard<'a, H: ?Sized> {
    lifecycle: &'a Lifecycle<H>,
    generation: u64,
    handle: Arc<H>,
}

impl<H: ?Sized> RecognizeGuard<'_, H> {
    fn lose(self) {
        let mut slot = self.lifecycle.slot.lock();
        if slot.generation == self.generation {
            warn!("{}: native engine lost, adapter marked failed", self.lifecycle.name);
            slot.state = AdapterState::Failed;
            slot.handle = None;
        }
    }
}

impl<H: ?Sized> Drop for RecognizeGuard<'_, H> {
    fn drop(&mut self) {
        let mut slot = self.lifecycle.slot.lock();
        if slot.generation == self.generation && slot.state == AdapterState::Recognizing {
            slot.state = AdapterState::Ready;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Handle;

    fn lifecycle() -> Lifecycle<Handle> {
        Lifecycle::new("test")
    }

    async fn ready(lc: &Lifecycle<Handle>) {
        lc.initialize_with(|| async { Ok(Arc::new(Handle)) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_initialize_transitions_to_ready() {
        let lc = lifecycle();
        assert_eq!(lc.state(), AdapterState::Uninitialized);

        let elapsed = lc
            .initialize_with(|| async { Ok(Arc::new(Handle)) })
            .await
            .unwrap();
        assert!(elapsed.is_some());
        assert_eq!(lc.state(), AdapterState::Ready);
    }

    #[tokio::test]
    async fn test_second_initialize_is_noop() {
        let lc = lifecycle();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let setup = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Handle))
        };

        assert!(lc.initialize_with(setup).await.unwrap().is_some());
        assert!(lc.initialize_with(setup).await.unwrap().is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_initialize_runs_setup_once() {
        let lc = lifecycle();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let setup = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Arc::new(Handle))
        };

        let (a, b) = tokio::join!(lc.initialize_with(setup), lc.initialize_with(setup));
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(a.is_some() ^ b.is_some());
        assert_eq!(lc.state(), AdapterState::Ready);
    }

    #[tokio::test]
    async fn test_failed_initialize_allows_retry() {
        let lc = lifecycle();

        let err = lc
            .initialize_with(|| async { Err::<Arc<Handle>, _>(anyhow::anyhow!("no models")) })
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Initialization { .. }));
        assert_eq!(lc.state(), AdapterState::Uninitialized);

        ready(&lc).await;
        assert_eq!(lc.state(), AdapterState::Ready);
    }

    #[tokio::test]
    async fn test_recognize_requires_ready() {
        let lc = lifecycle();
        let err = lc
            .recognize_with(|_h| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::NotReady {
                state: AdapterState::Uninitialized,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_recognize_while_initializing_is_not_ready() {
        let lc = lifecycle();
        let notify = Notify::new();
        let gate = &notify;

        let init = lc.initialize_with(|| async move {
            gate.notified().await;
            Ok(Arc::new(Handle))
        });
        let early_call = async {
            tokio::task::yield_now().await;
            let err = lc.recognize_with(|_h| async { Ok(()) }).await.unwrap_err();
            gate.notify_one();
            err
        };

        let (init, err) = tokio::join!(init, early_call);
        assert!(init.unwrap().is_some());
        assert!(matches!(
            err,
            AdapterError::NotReady {
                state: AdapterState::Initializing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_reentrant_recognize_is_busy() {
        let lc = lifecycle();
        ready(&lc).await;
        let notify = Notify::new();
        let gate = &notify;

        let first = lc.recognize_with(|_h| async move {
            gate.notified().await;
            Ok(42)
        });
        let second = async {
            tokio::task::yield_now().await;
            let result = lc.recognize_with(|_h| async { Ok(0) }).await;
            gate.notify_one();
            result
        };

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap(), 42);
        assert!(matches!(second, Err(AdapterError::Busy { .. })));
        assert_eq!(lc.state(), AdapterState::Ready);
    }

    #[tokio::test]
    async fn test_failed_recognize_returns_to_ready() {
        let lc = lifecycle();
        ready(&lc).await;

        let err = lc
            .recognize_with(|_h| async { Err::<(), _>(anyhow::anyhow!("bad input")) })
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Recognition { .. }));
        assert_eq!(lc.state(), AdapterState::Ready);
    }

    #[tokio::test]
    async fn test_engine_lost_marks_failed() {
        let lc = lifecycle();
        ready(&lc).await;

        let err = lc
            .recognize_with(|_h| async {
                Err::<(), _>(anyhow::Error::new(EngineLost("worker exited".into())))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::EngineLost { .. }));
        assert_eq!(lc.state(), AdapterState::Failed);

        // Recovers through a fresh initialize
        ready(&lc).await;
        assert_eq!(lc.state(), AdapterState::Ready);
    }

    #[tokio::test]
    async fn test_dropped_recognize_releases_state() {
        let lc = lifecycle();
        ready(&lc).await;

        let pending = lc.recognize_with(|_h| std::future::pending::<anyhow::Result<()>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(5), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(lc.state(), AdapterState::Ready);
    }

    #[tokio::test]
    async fn test_dispose_then_reinitialize() {
        let lc = lifecycle();
        ready(&lc).await;

        assert!(lc.dispose().is_some());
        assert_eq!(lc.state(), AdapterState::Uninitialized);
        assert!(lc.dispose().is_none());

        ready(&lc).await;
        assert_eq!(lc.state(), AdapterState::Ready);
    }

    #[tokio::test]
    async fn test_dispose_during_initialize_discards_handle() {
        let lc = lifecycle();
        let notify = Notify::new();
        let gate = &notify;

        let init = lc.initialize_with(|| async move {
            gate.notified().await;
            Ok(Arc::new(Handle))
        });
        let disposer = async {
            tokio::task::yield_now().await;
            lc.dispose();
            gate.notify_one();
        };

        let (init, ()) = tokio::join!(init, disposer);
        assert!(matches!(init, Err(AdapterError::Disposed { .. })));
        assert_eq!(lc.state(), AdapterState::Uninitialized);
    }

    #[tokio::test]
    async fn test_dispose_during_recognize_keeps_uninitialized() {
        let lc = lifecycle();
        ready(&lc).await;
        let notify = Notify::new();
        let gate = &notify;

        let call = lc.recognize_with(|_h| async move {
            gate.notified().await;
            Ok("done")
        });
        let disposer = async {
            tokio::task::yield_now().await;
            lc.dispose();
            gate.notify_one();
        };

        let (result, ()) = tokio::join!(call, disposer);
        assert_eq!(result.unwrap(), "done");
        assert_eq!(lc.state(), AdapterState::Uninitialized);
    }
}
