//! Shared User-Agent string for all outgoing HTTP traffic.
//!
//! Single source so `Probe` and `SegmentFetcher` requests look identical to the origin
//! server, as required by SPEC_FULL.md §4.6 ("realistic browser-like User-Agent").
//! Grounded on `user_agent.rs`'s single-source-of-truth shape, with the identifying
//! comment string replaced by a browser UA (see DESIGN.md).

const CHROME_VERSION: &str = "124.0.0.0";

/// Default User-Agent for probe and segment-fetch requests.
#[must_use]
pub fn default_user_agent() -> String {
    format!(
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
         Chrome/{CHROME_VERSION} Safari/537.36"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_looks_like_a_browser() {
        let ua = default_user_agent();
        assert!(ua.starts_with("Mozilla/5.0"));
        assert!(ua.contains("Chrome/"));
        assert!(!ua.contains("downloader"));
    }
}
