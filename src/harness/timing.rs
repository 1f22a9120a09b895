//! Per-adapter timing of initialize and recognize calls
//!
//! A sample is only written after an operation succeeds. Failed calls and
//! initialize no-ops leave the previous figure in place.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::vision::{AdapterError, OcrAdapter};

use super::AdapterId;

/// Which lifecycle operation a duration belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Init,
    Recognize,
}

/// Latest figures for one adapter, `None` until the operation first succeeds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingSample {
    pub init_ms: Option<u64>,
    pub recognize_ms: Option<u64>,
}

impl TimingSample {
    fn record(&mut self, kind: OperationKind, elapsed: Duration) {
        let ms = Some(elapsed.as_millis() as u64);
        match kind {
            OperationKind::Init => self.init_ms = ms,
            OperationKind::Recognize => self.recognize_ms = ms,
        }
    }
}

/// Records wall-clock durations per adapter and operation kind
#[derive(Debug, Default)]
pub struct TimingHarness {
    samples: Mutex<HashMap<AdapterId, TimingSample>>,
}

impl TimingHarness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: AdapterId, kind: OperationKind, elapsed: Duration) {
        debug!("{} {:?} took {:?}", id, kind, elapsed);
        self.samples.lock().entry(id).or_default().record(kind, elapsed);
    }

    pub fn sample(&self, id: AdapterId) -> TimingSample {
        self.samples.lock().get(&id).copied().unwrap_or_default()
    }

    /// Await `operation`, recording its duration under `kind` if it succeeds
    pub async fn time<T, E, Fut>(&self, id: AdapterId, kind: OperationKind, operation: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let value = operation.await?;
        self.record(id, kind, start.elapsed());
        Ok(value)
    }

    /// Initialize `adapter`. Only a setup that actually ran is recorded.
    pub async fn time_initialize(
        &self,
        id: AdapterId,
        adapter: &dyn OcrAdapter,
    ) -> Result<Option<Duration>, AdapterError> {
        let start = Instant::now();
        let outcome = adapter.initialize().await?;
        if outcome.is_some() {
            self.record(id, OperationKind::Init, start.elapsed());
        }
        Ok(outcome)
    }
}
