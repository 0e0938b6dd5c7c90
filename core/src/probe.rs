//! Pre-flight metadata discovery: size, range support, filename, and final URL.
//!
//! See SPEC_FULL.md §4.4. Grounded on the HEAD/redirect and header-parsing portions of
//! `download/client.rs::determine_resume_state`/`extract_filename`, restructured into a
//! standalone fail-open probe rather than a resume-detection side effect (see DESIGN.md).

use std::time::Duration;

use reqwest::header::{ACCEPT, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, REFERER, USER_AGENT};
use reqwest::Client;
use tracing::{debug, instrument};

use crate::filename::parse_content_disposition;
use crate::user_agent::default_user_agent;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of probing a URL. Always returned — probing never fails the caller; on any
/// network/redirect error this degrades to the fail-open tuple described in the spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub total_size: u64,
    pub supports_range: bool,
    pub filename: Option<String>,
    pub mime: Option<String>,
    pub final_url: String,
}

impl ProbeResult {
    fn fail_open(url: &str) -> Self {
        Self {
            total_size: 0,
            supports_range: false,
            filename: None,
            mime: None,
            final_url: url.to_string(),
        }
    }
}

/// Issues a `HEAD` against a URL to discover size, range support, filename, and mime.
#[derive(Debug, Clone)]
pub struct Probe {
    client: Client,
}

impl Probe {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Follows redirects (handled by the underlying client's redirect policy, capped at
    /// 10) and fails open to `{total_size: 0, supports_range: false}` on any error,
    /// including a redirect-limit-exceeded error.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn probe(&self, url: &str, referer: Option<&str>) -> ProbeResult {
        let mut request = self
            .client
            .head(url)
            .timeout(PROBE_TIMEOUT)
            .header(USER_AGENT, default_user_agent())
            .header(ACCEPT, "*/*");
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                debug!(%error, "probe request failed, failing open");
                return ProbeResult::fail_open(url);
            }
        };

        let final_url = response.url().to_string();
        let headers = response.headers();

        let total_size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let accept_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);
        let supports_range = match accept_ranges.as_deref() {
            Some("bytes") => true,
            Some("none") => false,
            _ => total_size > 0,
        };

        let filename = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition);

        let mime = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        ProbeResult {
            total_size,
            supports_range,
            filename,
            mime,
            final_url,
        }
    }
}
