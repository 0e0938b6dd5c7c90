//! Whole-file checksum verification, post-transfer.
//!
//! See SPEC_FULL.md §4.6 ("if checksum given, transition `verifying`, compute full-file
//! hash ... compare case-insensitively"). Grounded on DESIGN.md Open Question 5: the
//! `RustCrypto` family (`md-5`/`sha1`/`sha2`) is the idiomatic choice here, the same
//! family the teacher already depends on elsewhere for key derivation.

use std::io::Read;
use std::path::Path;

use tokio::task;

use crate::error::DownloadError;
use crate::storage::ChecksumType;

/// Computes the hex-encoded digest of the file at `path` using `checksum_type`, off the
/// async executor (this can read an arbitrarily large file).
pub async fn compute_checksum(path: &Path, checksum_type: ChecksumType) -> Result<String, DownloadError> {
    let path = path.to_path_buf();
    let path_for_err = path.clone();
    task::spawn_blocking(move || hash_file_blocking(&path, checksum_type))
        .await
        .map_err(|e| DownloadError::internal(format!("checksum task panicked: {e}")))?
        .map_err(|e| DownloadError::fs_io(path_for_err, e))
}

fn hash_file_blocking(path: &Path, checksum_type: ChecksumType) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; 64 * 1024];

    macro_rules! digest_loop {
        ($hasher:expr) => {{
            let mut hasher = $hasher;
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hex::encode(hasher.finalize())
        }};
    }

    let digest = match checksum_type {
        ChecksumType::Md5 => {
            use md5::{Digest, Md5};
            digest_loop!(Md5::new())
        }
        ChecksumType::Sha1 => {
            use sha1::{Digest, Sha1};
            digest_loop!(Sha1::new())
        }
        ChecksumType::Sha256 => {
            use sha2::{Digest, Sha256};
            digest_loop!(Sha256::new())
        }
        ChecksumType::Sha512 => {
            use sha2::{Digest, Sha512};
            digest_loop!(Sha512::new())
        }
    };
    Ok(digest)
}

/// Case-insensitive digest comparison, per SPEC_FULL.md §4.6.
#[must_use]
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sha256_matches_known_vector() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let digest = compute_checksum(&path, ChecksumType::Sha256).await.unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_md5_of_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.bin");
        tokio::fs::write(&path, b"").await.unwrap();

        let digest = compute_checksum(&path, ChecksumType::Md5).await.unwrap();
        assert_eq!(digest, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_digests_match_is_case_insensitive() {
        assert!(digests_match("ABCDEF", "abcdef"));
        assert!(!digests_match("abcdef", "abcde0"));
    }
}
