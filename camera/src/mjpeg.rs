use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use dropwatch_common::frame::Frame;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::source::{DimensionGuard, FrameSource, SourceError};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental `multipart/x-mixed-replace` parser.
///
/// Feed arbitrary chunks with [`push`](Self::push) and drain complete JPEG
/// bodies with [`next_jpeg`](Self::next_jpeg).
pub struct MjpegParser {
    boundary: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` already scanned for the closing boundary.
    jpeg_start: usize,
}

impl MjpegParser {
    pub fn new(boundary: &str) -> Self {
        let name = boundary.trim().trim_start_matches("--");
        let name = if name.is_empty() { DEFAULT_BOUNDARY } else { name };
        Self {
            boundary: format!("--{name}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    /// Extract the boundary parameter from a multipart `Content-Type` value.
    pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
        content_type.split(';').find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"').to_string())
        })
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete JPEG body, or `None` if more input is needed.
    pub fn next_jpeg(&mut self) -> Option<Vec<u8>> {
        let blen = self.boundary.len();
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                        let _ = self.buffer.split_to(pos + blen);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > blen {
                            let _ = self.buffer.split_to(self.buffer.len() - blen);
                        }
                        return None;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    // A part with no headers goes straight to the body
                    if self.buffer.starts_with(b"\r\n") {
                        let _ = self.buffer.split_to(2);
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        return None;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) =
                        find_subsequence(&self.buffer[self.jpeg_start..], &self.boundary)
                    else {
                        self.jpeg_start = self.buffer.len().saturating_sub(blen);
                        return None;
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    // Strip the CRLF that precedes the boundary
                    let end = if jpeg_end >= 2 && &self.buffer[jpeg_end - 2..jpeg_end] == b"\r\n"
                    {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    let jpeg = self.buffer[..end].to_vec();
                    let _ = self.buffer.split_to(jpeg_end + blen);
                    self.state = ParseState::SeekingHeaderEnd;
                    if !jpeg.is_empty() {
                        return Some(jpeg);
                    }
                }
            }
        }
    }

    /// Drop any partial data, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParseState::SeekingBoundary;
        self.jpeg_start = 0;
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Doubles the reconnect delay, capped at `MAX_BACKOFF`.
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Frames pulled from an HTTP MJPEG endpoint.
///
/// The first connection happens in [`open`](Self::open) and any failure there
/// is permanent. Later stream errors surface as `Unavailable` and the source
/// reconnects with exponential backoff on subsequent calls.
pub struct MjpegSource {
    url: String,
    client: reqwest::Client,
    stream: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    parser: MjpegParser,
    guard: DimensionGuard,
    seq: u64,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl MjpegSource {
    pub async fn open(url: &str, connect_timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SourceError::Fatal(e.to_string()))?;
        let mut source = Self {
            url: url.to_string(),
            client,
            stream: None,
            parser: MjpegParser::new(DEFAULT_BOUNDARY),
            guard: DimensionGuard::default(),
            seq: 0,
            backoff: INITIAL_BACKOFF,
            retry_at: None,
        };
        source
            .connect()
            .await
            .map_err(|e| SourceError::Fatal(format!("cannot open {url}: {e}")))?;
        Ok(source)
    }

    async fn connect(&mut self) -> Result<(), SourceError> {
        info!(url = self.url, "connecting to MJPEG stream");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(SourceError::Fatal(format!("HTTP status {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!(
                "HTTP status {}",
                status.as_u16()
            )));
        }

        let boundary = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(MjpegParser::boundary_from_content_type)
            .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());

        info!(status = %status, boundary, "connected to MJPEG stream");
        self.parser = MjpegParser::new(&boundary);
        self.stream = Some(response.bytes_stream().boxed());
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), SourceError> {
        if let Some(at) = self.retry_at {
            if Instant::now() < at {
                return Err(SourceError::Unavailable("reconnect pending".into()));
            }
        }
        match self.connect().await {
            Ok(()) => {
                self.backoff = INITIAL_BACKOFF;
                self.retry_at = None;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, url = self.url, "reconnect failed, retrying in {:?}", self.backoff);
                self.retry_at = Some(Instant::now() + self.backoff);
                self.backoff = next_backoff(self.backoff);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn drop_stream(&mut self, reason: String) -> SourceError {
        self.stream = None;
        self.parser.reset();
        self.retry_at = Some(Instant::now() + self.backoff);
        SourceError::Unavailable(reason)
    }
}

#[async_trait]
impl FrameSource for MjpegSource {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        if self.stream.is_none() {
            self.reconnect().await?;
        }

        loop {
            if let Some(jpeg) = self.parser.next_jpeg() {
                let seq = self.seq;
                self.seq += 1;
                let frame = Frame::from_jpeg(&jpeg, Utc::now().timestamp_millis(), seq)
                    .map_err(|e| SourceError::Unavailable(e.to_string()))?;
                self.guard.check(&frame)?;
                debug!(seq, bytes = jpeg.len(), "decoded MJPEG frame");
                return Ok(frame);
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(SourceError::Unavailable("not connected".into()));
            };
            match stream.next().await {
                Some(Ok(chunk)) => self.parser.push(&chunk),
                Some(Err(e)) => {
                    warn!(error = %e, "MJPEG stream error, will reconnect");
                    return Err(self.drop_stream(e.to_string()));
                }
                None => {
                    info!("MJPEG stream ended, will reconnect");
                    return Err(self.drop_stream("stream ended".into()));
                }
            }
        }
    }

    fn name(&self) -> &str {
        "mjpeg"
    }
}
