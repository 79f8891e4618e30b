use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::camera::{CaptureError, Frame, FrameSource};

/// Which call path is asking for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    /// The periodic classification cycle in the main loop. May wait.
    Inference,
    /// The live stream, driven by the network stack. Must not stall.
    Stream,
}

impl Requester {
    pub fn as_str(self) -> &'static str {
        match self {
            Requester::Inference => "inference",
            Requester::Stream => "stream",
        }
    }
}

/// A single capture request, alive only for the duration of one capture.
#[derive(Debug, Clone, Copy)]
pub struct ArbiterRequest {
    pub requester: Requester,
    /// How long this request may queue for the camera before giving up.
    pub max_wait: Duration,
}

/// Lock-free counters, readable from the status paths.
#[derive(Default)]
struct ArbiterCounters {
    inference_granted: AtomicU64,
    inference_contended: AtomicU64,
    stream_granted: AtomicU64,
    stream_contended: AtomicU64,
    faults: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArbiterStats {
    pub inference_granted: u64,
    pub inference_contended: u64,
    pub stream_granted: u64,
    pub stream_contended: u64,
    pub faults: u64,
}

impl ArbiterCounters {
    fn granted(&self, requester: Requester) -> &AtomicU64 {
        match requester {
            Requester::Inference => &self.inference_granted,
            Requester::Stream => &self.stream_granted,
        }
    }

    fn contended(&self, requester: Requester) -> &AtomicU64 {
        match requester {
            Requester::Inference => &self.inference_contended,
            Requester::Stream => &self.stream_contended,
        }
    }

    fn snapshot(&self) -> ArbiterStats {
        ArbiterStats {
            inference_granted: self.inference_granted.load(Ordering::Relaxed),
            inference_contended: self.inference_contended.load(Ordering::Relaxed),
            stream_granted: self.stream_granted.load(Ordering::Relaxed),
            stream_contended: self.stream_contended.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Serializes the inference and stream paths onto the one frame source.
///
/// Each requester role has its own wait bound. The lock is FIFO, so whoever
/// queued first runs first; a request that cannot get in within its bound
/// fails with [`CaptureError::DeviceBusy`] and the caller retries on its own
/// schedule.
pub struct CaptureArbiter {
    source: Mutex<FrameSource>,
    inference_wait: Duration,
    stream_wait: Duration,
    counters: ArbiterCounters,
}

impl CaptureArbiter {
    pub fn new(source: FrameSource, inference_wait: Duration, stream_wait: Duration) -> Self {
        Self {
            source: Mutex::new(source),
            inference_wait,
            stream_wait,
            counters: ArbiterCounters::default(),
        }
    }

    pub fn request(&self, requester: Requester) -> ArbiterRequest {
        let max_wait = match requester {
            Requester::Inference => self.inference_wait,
            Requester::Stream => self.stream_wait,
        };
        ArbiterRequest {
            requester,
            max_wait,
        }
    }

    /// Rent a frame for `requester` and run `f` on it inside the critical
    /// section. The frame is back in the source before this returns.
    pub async fn with_frame<T, F>(&self, requester: Requester, f: F) -> Result<T, CaptureError>
    where
        F: FnOnce(Frame<'_>) -> T,
    {
        self.run(self.request(requester), f).await
    }

    /// Like [`with_frame`](Self::with_frame), but asks `admit` once the camera
    /// is held and before anything is captured. A refusal returns `Ok(None)`
    /// without touching the hardware.
    pub async fn with_frame_if<T, G, F>(
        &self,
        requester: Requester,
        admit: G,
        f: F,
    ) -> Result<Option<T>, CaptureError>
    where
        G: FnOnce() -> bool,
        F: FnOnce(Frame<'_>) -> T,
    {
        let request = self.request(requester);
        let mut source = self.lock_source(request).await?;
        if !admit() {
            debug!(requester = requester.as_str(), "capture declined after acquiring camera");
            return Ok(None);
        }
        self.rent(&mut source, requester, f).map(Some)
    }

    pub async fn run<T, F>(&self, request: ArbiterRequest, f: F) -> Result<T, CaptureError>
    where
        F: FnOnce(Frame<'_>) -> T,
    {
        let mut source = self.lock_source(request).await?;
        self.rent(&mut source, request.requester, f)
    }

    async fn lock_source(
        &self,
        request: ArbiterRequest,
    ) -> Result<MutexGuard<'_, FrameSource>, CaptureError> {
        match tokio::time::timeout(request.max_wait, self.source.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                self.counters
                    .contended(request.requester)
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    requester = request.requester.as_str(),
                    waited_ms = request.max_wait.as_millis() as u64,
                    "camera contended, giving up"
                );
                Err(CaptureError::DeviceBusy)
            }
        }
    }

    fn rent<T, F>(
        &self,
        source: &mut FrameSource,
        requester: Requester,
        f: F,
    ) -> Result<T, CaptureError>
    where
        F: FnOnce(Frame<'_>) -> T,
    {
        let frame = match source.acquire() {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.faults.fetch_add(1, Ordering::Relaxed);
                warn!(requester = requester.as_str(), error = %e, "frame acquire failed");
                return Err(e);
            }
        };
        self.counters.granted(requester).fetch_add(1, Ordering::Relaxed);

        Ok(f(frame))
    }

    pub fn stats(&self) -> ArbiterStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::testing::StaticCamera;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use std::time::Instant;

    fn arbiter_with(
        camera: StaticCamera,
        inference_wait: Duration,
        stream_wait: Duration,
    ) -> Arc<CaptureArbiter> {
        let source = FrameSource::new(Box::new(camera), 1024);
        Arc::new(CaptureArbiter::new(source, inference_wait, stream_wait))
    }

    #[tokio::test]
    async fn runs_closure_on_frame() {
        let arbiter = arbiter_with(
            StaticCamera::jpeg(vec![0xFF, 0xD8, 0x01]),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
        let len = arbiter
            .with_frame(Requester::Stream, |frame| frame.len())
            .await
            .unwrap();
        assert_eq!(len, 3);
        assert_eq!(arbiter.stats().stream_granted, 1);
    }

    #[tokio::test]
    async fn capture_fault_is_reported() {
        let camera = StaticCamera::jpeg(vec![1]);
        camera.fail.store(true, Ordering::SeqCst);
        let arbiter = arbiter_with(camera, Duration::from_millis(100), Duration::from_millis(10));
        let result = arbiter.with_frame(Requester::Inference, |_| ()).await;
        assert!(matches!(result, Err(CaptureError::HardwareFault(_))));
        assert_eq!(arbiter.stats().faults, 1);

        // The failed capture left nothing outstanding.
        let outstanding = arbiter.source.lock().await.is_outstanding();
        assert!(!outstanding);
    }

    #[tokio::test]
    async fn declined_request_never_captures() {
        let camera = StaticCamera::jpeg(vec![1, 2, 3]);
        let captures = Arc::clone(&camera.captures);
        let arbiter = arbiter_with(camera, Duration::from_millis(100), Duration::from_millis(10));

        let declined = arbiter
            .with_frame_if(Requester::Inference, || false, |frame| frame.len())
            .await
            .unwrap();
        assert_eq!(declined, None);
        assert_eq!(captures.load(Ordering::SeqCst), 0);
        assert_eq!(arbiter.stats().inference_granted, 0);

        let admitted = arbiter
            .with_frame_if(Requester::Inference, || true, |frame| frame.len())
            .await
            .unwrap();
        assert_eq!(admitted, Some(3));
        assert_eq!(captures.load(Ordering::SeqCst), 1);
        assert_eq!(arbiter.stats().inference_granted, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_fails_fast_while_inference_holds_camera() {
        let arbiter = arbiter_with(
            StaticCamera::jpeg(vec![7; 8]),
            Duration::from_millis(500),
            Duration::from_millis(20),
        );

        let holder = Arc::clone(&arbiter);
        let hold = tokio::spawn(async move {
            holder
                .with_frame(Requester::Inference, |_frame| {
                    std::thread::sleep(Duration::from_millis(300));
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let result = arbiter.with_frame(Requester::Stream, |frame| frame.len()).await;
        let waited = started.elapsed();

        assert!(matches!(result, Err(CaptureError::DeviceBusy)));
        assert!(waited < Duration::from_millis(200), "stream waited {waited:?}");
        assert_eq!(arbiter.stats().stream_contended, 1);
        hold.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inference_waits_out_a_short_stream_capture() {
        let arbiter = arbiter_with(
            StaticCamera::jpeg(vec![7; 8]),
            Duration::from_millis(500),
            Duration::from_millis(20),
        );

        let holder = Arc::clone(&arbiter);
        let hold = tokio::spawn(async move {
            holder
                .with_frame(Requester::Stream, |_frame| {
                    std::thread::sleep(Duration::from_millis(60));
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = arbiter.with_frame(Requester::Inference, |frame| frame.seq()).await;
        assert_eq!(result.unwrap(), 2);
        hold.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_requesters_never_share_a_frame() {
        let camera = StaticCamera::jpeg(vec![0xAB; 32]).with_delay(Duration::from_micros(200));
        let captures = Arc::clone(&camera.captures);
        let arbiter = arbiter_with(camera, Duration::from_millis(200), Duration::from_millis(2));

        let held = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for worker in 0..16 {
            let arbiter = Arc::clone(&arbiter);
            let held = Arc::clone(&held);
            let completed = Arc::clone(&completed);
            let requester = if worker % 4 == 0 {
                Requester::Inference
            } else {
                Requester::Stream
            };
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let result = arbiter
                        .with_frame(requester, |frame| {
                            assert!(!held.swap(true, Ordering::SeqCst), "two frames outstanding");
                            assert!(frame.data().iter().all(|&b| b == 0xAB));
                            std::hint::spin_loop();
                            held.store(false, Ordering::SeqCst);
                        })
                        .await;
                    match result {
                        Ok(()) => {
                            completed.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(CaptureError::DeviceBusy) => tokio::task::yield_now().await,
                        Err(e) => panic!("unexpected capture error: {e}"),
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = arbiter.stats();
        let completed = completed.load(Ordering::SeqCst) as u64;
        assert!(completed > 0);
        assert_eq!(stats.inference_granted + stats.stream_granted, completed);
        assert_eq!(captures.load(Ordering::SeqCst) as u64, completed);
        assert_eq!(
            completed + stats.inference_contended + stats.stream_contended,
            16 * 50
        );
        assert!(!arbiter.source.lock().await.is_outstanding());
    }
}
