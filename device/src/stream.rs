use std::io::Write;
use std::sync::Arc;

use tracing::{debug, warn};
use wastecam_common::frame::PixelFormat;

use crate::arbiter::{CaptureArbiter, Requester};

/// `Content-Type` of the stream response.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_PREFIX: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ";
const HEADER_END: &[u8] = b"\r\n\r\n";
const TRAILER: &[u8] = b"\r\n";

/// Length of the part header for a payload of `payload_len` bytes.
pub fn part_header_len(payload_len: usize) -> usize {
    PART_PREFIX.len() + decimal_len(payload_len) + HEADER_END.len()
}

/// Total bytes one multipart part occupies on the wire.
pub fn part_len(payload_len: usize) -> usize {
    part_header_len(payload_len) + payload_len + TRAILER.len()
}

/// Largest payload whose part still fits a chunk of `chunk_bytes`.
pub fn max_payload(chunk_bytes: usize) -> usize {
    let fixed = PART_PREFIX.len() + HEADER_END.len() + TRAILER.len();
    let mut payload = chunk_bytes.saturating_sub(fixed + 1);
    while payload > 0 && part_len(payload) > chunk_bytes {
        payload -= 1;
    }
    payload
}

fn decimal_len(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Write one complete multipart part into `dest`.
///
/// Returns `None` without touching `dest` when the part does not fit.
pub fn write_part(payload: &[u8], dest: &mut [u8]) -> Option<usize> {
    let total = part_len(payload.len());
    if total > dest.len() {
        return None;
    }

    let header_len = part_header_len(payload.len());
    let (header, rest) = dest.split_at_mut(header_len);
    let mut cursor = header;
    cursor.write_all(PART_PREFIX).ok()?;
    write!(cursor, "{}", payload.len()).ok()?;
    cursor.write_all(HEADER_END).ok()?;

    rest[..payload.len()].copy_from_slice(payload);
    rest[payload.len()..payload.len() + TRAILER.len()].copy_from_slice(TRAILER);
    Some(total)
}

/// Pull adapter between the network layer and the arbiter.
///
/// Holds no per-connection state; every call is one attempt at one part.
pub struct StreamProducer {
    arbiter: Arc<CaptureArbiter>,
}

impl StreamProducer {
    pub fn new(arbiter: Arc<CaptureArbiter>) -> Self {
        Self { arbiter }
    }

    /// Fill `dest` with one multipart part and return its length, or return 0
    /// when there is nothing to send this time.
    pub async fn produce_chunk(&self, dest: &mut [u8]) -> usize {
        let capacity = dest.len();
        let written = self
            .arbiter
            .with_frame(Requester::Stream, |frame| {
                if frame.format() != PixelFormat::Jpeg {
                    debug!(format = %frame.format(), "stream skips non-JPEG frame");
                    return 0;
                }
                match write_part(frame.data(), dest) {
                    Some(n) => n,
                    None => {
                        warn!(
                            seq = frame.seq(),
                            needed = part_len(frame.len()),
                            capacity,
                            "frame does not fit stream chunk, dropped"
                        );
                        0
                    }
                }
            })
            .await;

        match written {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "no stream frame this call");
                0
            }
        }
    }
}
