//! Filename extraction, sanitization, and unique-path resolution.
//!
//! Grounded on `download/filename.rs`: header parsing and sanitization logic carried
//! over near-verbatim (see DESIGN.md), with the academic-metadata-driven naming helpers
//! dropped since SPEC_FULL.md's filename precedence is request > disposition > URL tail
//! > timestamp, with no bibliographic metadata input.

use std::path::{Component, Path, PathBuf};

use url::Url;

/// Guess file extension from Content-Type header.
#[must_use]
pub fn extension_from_content_type(content_type: &str) -> &'static str {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    match mime.as_str() {
        "text/html" => ".html",
        "text/plain" => ".txt",
        "application/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "application/pdf" => ".pdf",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/svg+xml" => ".svg",
        "application/zip" => ".zip",
        "application/gzip" => ".gz",
        "text/css" => ".css",
        "text/javascript" | "application/javascript" => ".js",
        "video/mp4" => ".mp4",
        "audio/mpeg" => ".mp3",
        _ => ".bin",
    }
}

/// Parses a Content-Disposition header: `filename*=UTF-8''...` (RFC 5987) first,
/// then plain `filename="..."` / `filename=...`.
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let start = pos + 10;
        let value = header[start..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded_name = encoded[..end].trim();
            if let Ok(decoded) = urlencoding::decode(encoded_name) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let start = pos + 9;
        let value = header[start..].trim();
        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Sanitizes a filename for filesystem safety, replacing invalid/control characters.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.chars().map(|c| if c == '.' { '_' } else { c }).collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Fallback filename derived from the URL's last path segment, or `download_<ts>.bin`.
#[must_use]
pub fn fallback_filename_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments() {
        if let Some(last) = segments.next_back() {
            if !last.is_empty() {
                let decoded = urlencoding::decode(last).unwrap_or_else(|_| last.into());
                return sanitize_filename(&decoded);
            }
        }
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("download_{timestamp}.bin")
}

/// Resolves a unique file path under `dir`, appending a numeric suffix on collision:
/// `file.pdf`, `file_1.pdf`, `file_2.pdf`, ...
#[must_use]
pub fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let filename = {
        let sanitized = sanitize_filename(filename);
        if sanitized.contains('/') || sanitized.contains('\\') || sanitized.trim_matches('_').is_empty() {
            "download.bin".to_string()
        } else {
            sanitized
        }
    };
    let base_path = dir.join(&filename);
    if !base_path.exists() {
        return base_path;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) => (&filename[..pos], &filename[pos..]),
        None => (filename.as_str(), ""),
    };

    for i in 1..1000 {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    dir.join(format!("{stem}_{timestamp}{ext}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_removes_invalid_chars() {
        assert_eq!(sanitize_filename("file/name.pdf"), "file_name.pdf");
        assert_eq!(sanitize_filename("file:name.pdf"), "file_name.pdf");
    }

    #[test]
    fn test_sanitize_filename_rewrites_dot_segments() {
        assert_eq!(sanitize_filename(".."), "__");
    }

    #[test]
    fn test_parse_content_disposition_rfc5987() {
        let header = "attachment; filename*=UTF-8''example%20file.pdf";
        assert_eq!(
            parse_content_disposition(header),
            Some("example file.pdf".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_quoted() {
        let header = r#"attachment; filename="example.pdf""#;
        assert_eq!(parse_content_disposition(header), Some("example.pdf".to_string()));
    }

    #[test]
    fn test_parse_content_disposition_missing_returns_none() {
        assert_eq!(parse_content_disposition("attachment"), None);
    }

    #[test]
    fn test_resolve_unique_path_no_conflict() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = resolve_unique_path(dir.path(), "test.pdf");
        assert_eq!(path, dir.path().join("test.pdf"));
    }

    #[test]
    fn test_resolve_unique_path_with_conflict_appends_suffix() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("test.pdf"), b"existing").unwrap();
        let path = resolve_unique_path(dir.path(), "test.pdf");
        assert_eq!(path, dir.path().join("test_1.pdf"));
    }

    #[test]
    fn test_resolve_unique_path_protects_against_traversal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = resolve_unique_path(dir.path(), "../../etc/passwd");
        assert!(path.starts_with(dir.path()));
        assert!(!path.components().any(|c| c == Component::ParentDir));
    }

    #[test]
    fn test_fallback_filename_from_url_uses_last_segment() {
        let url = Url::parse("https://example.com/papers/thesis.pdf").unwrap();
        assert_eq!(fallback_filename_from_url(&url), "thesis.pdf");
    }

    #[test]
    fn test_fallback_filename_from_url_empty_path_uses_timestamp() {
        let url = Url::parse("https://example.com/").unwrap();
        let result = fallback_filename_from_url(&url);
        assert!(result.starts_with("download_"));
        assert!(result.ends_with(".bin"));
    }
}
