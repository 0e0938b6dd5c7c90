//! Ranged `GET` fetch of a single byte-range segment, with pacing and a stall watchdog.
//!
//! See SPEC_FULL.md §4.5. The `Arc`-shared atomic/notify state and `#[instrument]`
//! logging are grounded on `download/rate_limiter.rs`'s `RateLimiter` (async-safe shared
//! timing state designed to be cloned across spawned tasks); the chunked streaming loop
//! is grounded on `download/client.rs::stream_to_file`. The token-bucket pacing and
//! pause/cancel/stall-watchdog machinery are new, built to the spec in that idiom.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONNECTION, RANGE, REFERER, RETRY_AFTER, USER_AGENT};
use reqwest::Client;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, instrument, warn};

use crate::error::DownloadError;
use crate::file_arena::FileArena;
use crate::retry::{classify_error, parse_retry_after, RetryDecision, RetryPolicy};
use crate::token_bucket::TokenBucket;
use crate::user_agent::default_user_agent;

/// Default idle time before a stalled connection is torn down (§4.5).
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(45);

/// Progress/lifecycle events emitted by a running [`SegmentFetcher`].
#[derive(Debug, Clone)]
pub enum SegmentEvent {
    Progress {
        index: usize,
        downloaded_bytes: u64,
        chunk_len: usize,
    },
    Completed {
        index: usize,
    },
    Paused {
        index: usize,
    },
}

enum Outcome {
    Completed,
    Paused,
    Cancelled,
}

/// Fetches `[start_byte, end_byte]` (inclusive) of `url` into `file` at matching offsets.
pub struct SegmentFetcher {
    index: usize,
    url: String,
    referer: Option<String>,
    file: FileArena,
    start_byte: u64,
    end_byte: u64,
    sole_segment: bool,
    downloaded_bytes: Arc<AtomicU64>,
    client: Client,
    retry_policy: RetryPolicy,
    token_bucket: Option<Arc<TokenBucket>>,
    stall_timeout: Duration,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
    events: mpsc::UnboundedSender<SegmentEvent>,
}

impl SegmentFetcher {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        index: usize,
        url: impl Into<String>,
        referer: Option<String>,
        file: FileArena,
        start_byte: u64,
        end_byte: u64,
        already_downloaded: u64,
        sole_segment: bool,
        client: Client,
        retry_policy: RetryPolicy,
        token_bucket: Option<Arc<TokenBucket>>,
        events: mpsc::UnboundedSender<SegmentEvent>,
    ) -> Self {
        Self {
            index,
            url: url.into(),
            referer,
            file,
            start_byte,
            end_byte,
            sole_segment,
            downloaded_bytes: Arc::new(AtomicU64::new(already_downloaded)),
            client,
            retry_policy,
            token_bucket,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            paused: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            events,
        }
    }

    #[must_use]
    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Signals the fetcher to stop after the current chunk and emit `Paused`.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Signals the fetcher to abandon the segment immediately.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Runs the retry-wrapped fetch loop to completion, pause, or error.
    #[instrument(skip(self), fields(index = self.index, url = %self.url))]
    pub async fn start(&self) -> Result<(), DownloadError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(DownloadError::Cancelled);
        }

        let mut attempt = 0u32;
        loop {
            match self.attempt_once().await {
                Ok(Outcome::Completed) => {
                    let _ = self.events.send(SegmentEvent::Completed { index: self.index });
                    return Ok(());
                }
                Ok(Outcome::Paused) => {
                    let _ = self.events.send(SegmentEvent::Paused { index: self.index });
                    return Ok(());
                }
                Ok(Outcome::Cancelled) => return Err(DownloadError::Cancelled),
                Err(err) => {
                    let failure = classify_error(&err);
                    let retry_after = retry_after_of(&err);
                    match self.retry_policy.should_retry(attempt, failure, retry_after) {
                        RetryDecision::Retry { delay, attempt: next } => {
                            debug!(attempt = next, delay_ms = delay.as_millis(), "retrying segment");
                            attempt = next;
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            warn!(reason = %reason, "segment fetch exhausted retries");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    async fn attempt_once(&self) -> Result<Outcome, DownloadError> {
        let mut offset = self.start_byte + self.downloaded_bytes.load(Ordering::SeqCst);
        if offset > self.end_byte {
            return Ok(Outcome::Completed);
        }

        let range = format!("bytes={offset}-{}", self.end_byte);
        let mut request = self
            .client
            .get(&self.url)
            .header(RANGE, range)
            .header(ACCEPT, "*/*")
            .header(ACCEPT_ENCODING, "identity")
            .header(CONNECTION, "keep-alive")
            .header(USER_AGENT, default_user_agent());
        if let Some(referer) = &self.referer {
            request = request.header(REFERER, referer.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::network(&self.url, e))?;
        let status = response.status();

        if status.as_u16() == 200 {
            if !self.sole_segment {
                return Err(DownloadError::HttpRangeNotSupported { url: self.url.clone() });
            }
            // Server ignored our Range header; it is sending the whole body from byte 0.
            offset = self.start_byte;
            self.downloaded_bytes.store(0, Ordering::SeqCst);
        } else if status.as_u16() != 206 {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(if status.is_server_error() {
                DownloadError::HttpServerStatus {
                    url: self.url.clone(),
                    status: status.as_u16(),
                    retry_after,
                }
            } else {
                DownloadError::HttpClientStatus {
                    url: self.url.clone(),
                    status: status.as_u16(),
                    retry_after,
                }
            });
        }

        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                biased;
                () = self.notify.notified() => {
                    if self.cancelled.load(Ordering::SeqCst) {
                        return Ok(Outcome::Cancelled);
                    }
                    if self.paused.load(Ordering::SeqCst) {
                        return Ok(Outcome::Paused);
                    }
                }
                chunk = tokio::time::timeout(self.stall_timeout, stream.next()) => {
                    match chunk {
                        Err(_elapsed) => {
                            return Err(DownloadError::StallTimeout {
                                url: self.url.clone(),
                                idle_secs: self.stall_timeout.as_secs(),
                            });
                        }
                        Ok(None) => return Ok(Outcome::Completed),
                        Ok(Some(Err(e))) => return Err(DownloadError::network(&self.url, e)),
                        Ok(Some(Ok(bytes))) => {
                            if let Some(bucket) = &self.token_bucket {
                                bucket.acquire(bytes.len() as u64).await;
                            }
                            self.file.write_at(bytes.to_vec(), offset).await?;
                            offset += bytes.len() as u64;
                            let total = self.downloaded_bytes.fetch_add(bytes.len() as u64, Ordering::SeqCst)
                                + bytes.len() as u64;
                            let _ = self.events.send(SegmentEvent::Progress {
                                index: self.index,
                                downloaded_bytes: total,
                                chunk_len: bytes.len(),
                            });
                        }
                    }
                }
            }
        }
    }
}

fn retry_after_of(err: &DownloadError) -> Option<Duration> {
    match err {
        DownloadError::HttpClientStatus { retry_after, .. }
        | DownloadError::HttpServerStatus { retry_after, .. } => {
            retry_after.as_deref().and_then(parse_retry_after)
        }
        _ => None,
    }
}
