use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info};
use wastecam_common::config::BackendConfig;
use wastecam_common::prediction::{ClassificationResult, PredictionReport};

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("collector did not answer within {0:?}")]
    Timeout(Duration),
    #[error("collector rejected report with HTTP {0}")]
    RemoteRejected(u16),
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Whether the device currently has a network link. Shared between the
/// reporter, the status endpoint and whoever owns the link.
#[derive(Debug, Clone)]
pub struct LinkStatus(Arc<AtomicBool>);

impl LinkStatus {
    pub fn new(connected: bool) -> Self {
        Self(Arc::new(AtomicBool::new(connected)))
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::Relaxed);
    }
}

/// Best-effort, single-attempt delivery of detections to the collector.
pub struct BackendReporter {
    client: reqwest::Client,
    url: String,
    device_id: String,
    timeout: Duration,
    link: LinkStatus,
}

impl BackendReporter {
    pub fn new(
        url: String,
        device_id: String,
        timeout: Duration,
        link: LinkStatus,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url,
            device_id,
            timeout,
            link,
        })
    }

    pub fn from_config(
        config: &BackendConfig,
        device_id: &str,
        link: LinkStatus,
    ) -> Result<Self, reqwest::Error> {
        Self::new(
            config.report_url(),
            device_id.to_string(),
            config.timeout(),
            link,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST one result. Never retries; the next cycle is the retry point.
    pub async fn report(&self, result: &ClassificationResult) -> Result<(), ReportError> {
        if !self.link.is_connected() {
            return Err(ReportError::NetworkUnavailable("link down".into()));
        }

        let report = PredictionReport::new(result, &self.device_id, Utc::now().timestamp_millis());
        let body = serde_json::to_vec(&report)?;

        let send = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send();

        let response = match tokio::time::timeout(self.timeout, send).await {
            Err(_) => return Err(ReportError::Timeout(self.timeout)),
            Ok(Err(e)) if e.is_timeout() => return Err(ReportError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(ReportError::NetworkUnavailable(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ReportError::RemoteRejected(status.as_u16()));
        }

        info!(
            category = report.category,
            confidence = report.confidence,
            url = self.url,
            "sent to backend"
        );
        debug!(status = %status, "collector response");
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// How the fake collector answers.
    #[derive(Clone, Copy)]
    pub enum Behaviour {
        Respond(u16),
        /// Accept the connection and never answer.
        Hang,
    }

    pub struct FakeCollector {
        pub url: String,
        pub requests: Arc<AtomicUsize>,
        pub bodies: Arc<Mutex<Vec<String>>>,
    }

    pub async fn spawn_collector(behaviour: Behaviour) -> FakeCollector {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&requests);
        let seen = Arc::clone(&bodies);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let counter = Arc::clone(&counter);
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    match behaviour {
                        Behaviour::Hang => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                            drop(stream);
                        }
                        Behaviour::Respond(code) => {
                            let body = read_request_body(&mut stream).await;
                            counter.fetch_add(1, Ordering::SeqCst);
                            seen.lock().unwrap().push(body);
                            let reply = format!(
                                "HTTP/1.1 {code} Status\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                            );
                            let _ = stream.write_all(reply.as_bytes()).await;
                            let _ = stream.shutdown().await;
                        }
                    }
                });
            }
        });

        FakeCollector {
            url: format!("http://{addr}/api/prediction"),
            requests,
            bodies,
        }
    }

    async fn read_request_body(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return String::from_utf8_lossy(&buf[header_end + 4..header_end + 4 + content_length])
                        .into_owned();
                }
            }
        }
        String::new()
    }
}
