use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;
use wastecam_common::prediction::NO_LABEL;

use crate::reporter::LinkStatus;
use crate::scheduler::{lock, SharedState};
use crate::stream::{StreamProducer, STREAM_CONTENT_TYPE};

// ---------------------------------------------------------------------------
// Viewer slots
// ---------------------------------------------------------------------------

/// Caps the number of concurrent stream viewers.
pub struct ViewerSlots {
    active: AtomicUsize,
    max: usize,
}

/// One occupied slot; frees itself when the viewer's body is dropped.
pub struct ViewerSlot {
    slots: Arc<ViewerSlots>,
}

impl ViewerSlots {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max,
        })
    }

    pub fn try_enter(self: &Arc<Self>) -> Option<ViewerSlot> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| ViewerSlot {
                slots: Arc::clone(self),
            })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for ViewerSlot {
    fn drop(&mut self) {
        let left = self.slots.active.fetch_sub(1, Ordering::AcqRel) - 1;
        info!(viewers = left, "stream viewer disconnected");
    }
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub producer: Arc<StreamProducer>,
    pub scheduler: SharedState,
    pub link: LinkStatus,
    pub viewers: Arc<ViewerSlots>,
    pub dashboard_url: String,
    /// Capacity of the per-viewer chunk buffer.
    pub chunk_bytes: usize,
    pub retry: Duration,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    inference_enabled: bool,
    last_category: String,
    last_confidence: f32,
    network_connected: bool,
    stream_viewers: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /: redirect to the collector dashboard
async fn index(State(state): State<Arc<AppState>>) -> Redirect {
    Redirect::temporary(&state.dashboard_url)
}

/// GET /status
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let scheduler = lock(&state.scheduler);
    let (last_category, last_confidence) = scheduler
        .last_prediction()
        .map(|p| (p.label.clone(), p.score))
        .unwrap_or_else(|| (NO_LABEL.to_string(), 0.0));

    Json(StatusResponse {
        status: "online",
        inference_enabled: scheduler.enabled,
        last_category,
        last_confidence,
        network_connected: state.link.is_connected(),
        stream_viewers: state.viewers.active(),
    })
}

/// GET /stream: multipart MJPEG, one part per produced chunk
async fn stream(State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = state.viewers.try_enter() else {
        info!(max = state.viewers.max, "stream viewer refused, all slots taken");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many stream viewers").into_response();
    };
    info!(viewers = state.viewers.active(), "stream viewer connected");

    let body = mjpeg_body(
        Arc::clone(&state.producer),
        slot,
        state.chunk_bytes,
        state.retry,
    );
    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Drive the producer for one viewer. A zero-byte call is retried after
/// `retry`; the connection itself stays open.
fn mjpeg_body(
    producer: Arc<StreamProducer>,
    slot: ViewerSlot,
    chunk_bytes: usize,
    retry: Duration,
) -> Body {
    let buf = BytesMut::zeroed(chunk_bytes);
    let parts = futures_util::stream::unfold(
        (producer, slot, buf),
        move |(producer, slot, mut buf)| async move {
            loop {
                let n = producer.produce_chunk(&mut buf).await;
                if n > 0 {
                    let part = Bytes::copy_from_slice(&buf[..n]);
                    return Some((Ok::<_, Infallible>(part), (producer, slot, buf)));
                }
                tokio::time::sleep(retry).await;
            }
        },
    );
    Body::from_stream(parts)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(stream))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::CaptureArbiter;
    use crate::camera::testing::StaticCamera;
    use crate::camera::FrameSource;
    use crate::scheduler::SchedulerState;
    use crate::stream::part_len;
    use std::sync::Mutex;

    async fn spawn_device(max_viewers: usize) -> (String, Arc<AppState>) {
        let source = FrameSource::new(Box::new(StaticCamera::jpeg(vec![0xFF, 0xD8, 0xAA, 0xFF, 0xD9])), 1024);
        let arbiter = Arc::new(CaptureArbiter::new(
            source,
            Duration::from_millis(100),
            Duration::from_millis(10),
        ));
        let state = Arc::new(AppState {
            producer: Arc::new(StreamProducer::new(arbiter)),
            scheduler: Arc::new(Mutex::new(SchedulerState::new(Duration::from_secs(2)))),
            link: LinkStatus::new(true),
            viewers: ViewerSlots::new(max_viewers),
            dashboard_url: "http://192.168.1.100:5000".into(),
            chunk_bytes: 4096,
            retry: Duration::from_millis(5),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    #[test]
    fn slots_are_capped_and_freed() {
        let slots = ViewerSlots::new(2);
        let a = slots.try_enter().unwrap();
        let _b = slots.try_enter().unwrap();
        assert!(slots.try_enter().is_none());
        assert_eq!(slots.active(), 2);
        drop(a);
        assert_eq!(slots.active(), 1);
        assert!(slots.try_enter().is_some());
    }

    #[tokio::test]
    async fn status_reports_scheduler_and_link() {
        let (base, state) = spawn_device(1).await;
        lock(&state.scheduler).enabled = false;

        let text = reqwest::get(format!("{base}/status"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["status"], "online");
        assert_eq!(body["inference_enabled"], false);
        assert_eq!(body["last_category"], "none");
        assert_eq!(body["network_connected"], true);
    }

    #[tokio::test]
    async fn stream_serves_multipart_parts_and_caps_viewers() {
        let (base, _state) = spawn_device(1).await;

        let mut first = reqwest::get(format!("{base}/stream")).await.unwrap();
        assert_eq!(first.status(), 200);
        assert_eq!(
            first.headers()[reqwest::header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let mut received = Vec::new();
        while received.len() < part_len(5) {
            let chunk = first.chunk().await.unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
        let expected = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 5\r\n\r\n\xFF\xD8\xAA\xFF\xD9\r\n";
        assert_eq!(&received[..expected.len()], expected);

        let second = reqwest::get(format!("{base}/stream")).await.unwrap();
        assert_eq!(second.status(), 503);
    }

    #[tokio::test]
    async fn root_redirects_to_dashboard() {
        let (base, _state) = spawn_device(1).await;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        let response = client.get(format!("{base}/")).send().await.unwrap();
        assert_eq!(response.status(), 307);
        assert_eq!(
            response.headers()[reqwest::header::LOCATION],
            "http://192.168.1.100:5000"
        );
    }
}
