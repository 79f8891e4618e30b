use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wastecam_common::prediction::ClassificationResult;

use crate::arbiter::{CaptureArbiter, Requester};
use crate::classify::ClassificationStage;
use crate::indicator::Indicator;
use crate::reporter::BackendReporter;

/// Best entry of the most recent successful classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastPrediction {
    pub label: String,
    pub score: f32,
    /// Capture time of the classified frame, Unix millis.
    pub captured_at_ms: i64,
}

/// Gate for classification cycles.
///
/// `enabled` and `interval` belong to the command controller; `last_run` and
/// `last_prediction` belong to the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerState {
    pub enabled: bool,
    pub interval: Duration,
    last_run: Option<Instant>,
    last_prediction: Option<LastPrediction>,
}

impl SchedulerState {
    pub fn new(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval,
            last_run: None,
            last_prediction: None,
        }
    }

    /// True once `interval` has passed since the last cycle started.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Move `last_run` forward to `now`. Never moves it back.
    fn advance(&mut self, now: Instant) {
        self.last_run = Some(match self.last_run {
            Some(last) if last > now => last,
            _ => now,
        });
    }

    pub fn last_run(&self) -> Option<Instant> {
        self.last_run
    }

    pub fn last_prediction(&self) -> Option<&LastPrediction> {
        self.last_prediction.as_ref()
    }
}

pub type SharedState = Arc<Mutex<SchedulerState>>;

/// Lock the shared state. A panic elsewhere never leaves it half-written,
/// so a poisoned lock is still usable.
pub fn lock(state: &SharedState) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What one call to [`InferenceScheduler::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Paused,
    NotDue,
    /// Capture or classification failed; the interval is still consumed.
    Aborted,
    NoDetection,
    Reported,
    ReportFailed,
}

impl CycleOutcome {
    /// Whether a classification cycle actually started.
    pub fn ran(self) -> bool {
        !matches!(self, CycleOutcome::Paused | CycleOutcome::NotDue)
    }
}

pub struct InferenceScheduler {
    state: SharedState,
    arbiter: Arc<CaptureArbiter>,
    stage: ClassificationStage,
    reporter: BackendReporter,
    indicator: Arc<dyn Indicator>,
    threshold: f32,
}

impl InferenceScheduler {
    pub fn new(
        state: SharedState,
        arbiter: Arc<CaptureArbiter>,
        stage: ClassificationStage,
        reporter: BackendReporter,
        indicator: Arc<dyn Indicator>,
        threshold: f32,
    ) -> Self {
        Self {
            state,
            arbiter,
            stage,
            reporter,
            indicator,
            threshold,
        }
    }

    /// Run at most one classification cycle if the gate is open.
    pub async fn tick(&self) -> CycleOutcome {
        {
            let state = lock(&self.state);
            if !state.enabled {
                return CycleOutcome::Paused;
            }
            if !state.is_due(Instant::now()) {
                return CycleOutcome::NotDue;
            }
        }

        // The interval is claimed once the camera is ours and before it
        // captures: a cycle that queued behind another one finds the
        // interval consumed and leaves the hardware alone.
        let claim = || {
            let mut state = lock(&self.state);
            let now = Instant::now();
            if !state.enabled || !state.is_due(now) {
                return false;
            }
            state.advance(now);
            true
        };
        let classified = self
            .arbiter
            .with_frame_if(Requester::Inference, claim, |frame| {
                let captured_at_ms = frame.captured_at_ms();
                self.stage
                    .classify(frame)
                    .map(|result| (result, captured_at_ms))
            })
            .await;

        let (result, captured_at_ms) = match classified {
            Ok(Some(Ok(classified))) => classified,
            Ok(Some(Err(e))) => {
                warn!(error = %e, "classification failed, skipping cycle");
                return CycleOutcome::Aborted;
            }
            Ok(None) => {
                debug!("interval consumed while waiting for the camera");
                return CycleOutcome::NotDue;
            }
            Err(e) => {
                lock(&self.state).advance(Instant::now());
                warn!(error = %e, "capture failed, skipping cycle");
                return CycleOutcome::Aborted;
            }
        };

        info!(
            label = result.best_label,
            score = format!("{:.2}", result.best_score),
            "prediction"
        );
        lock(&self.state).last_prediction = Some(LastPrediction {
            label: result.best_label.clone(),
            score: result.best_score,
            captured_at_ms,
        });

        if !result.is_detection(self.threshold) {
            info!(
                score = format!("{:.2}", result.best_score),
                threshold = self.threshold,
                "no detection"
            );
            return CycleOutcome::NoDetection;
        }

        self.indicator.acknowledge();
        self.report(&result).await
    }

    async fn report(&self, result: &ClassificationResult) -> CycleOutcome {
        match self.reporter.report(result).await {
            Ok(()) => CycleOutcome::Reported,
            Err(e) => {
                warn!(error = %e, url = self.reporter.url(), "backend report failed");
                CycleOutcome::ReportFailed
            }
        }
    }
}
