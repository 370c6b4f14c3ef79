//! Single-file downloads verified by sha256.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::FetchError;
use crate::util::fs::remove_dir_if_exists;

/// Download `url` into `target_dir`, replacing its contents.
///
/// The body is verified before anything is written. HTTP 5xx and transport
/// errors are retryable; other statuses and checksum mismatches are not.
pub(super) async fn download(name: &str, url: &str, expected_sha256: &str, target_dir: &Path) -> Result<(), FetchError> {
  info!(name, url, "downloading source");

  let response = reqwest::get(url).await.map_err(|e| FetchError::unavailable(name, e))?;
  let status = response.status();
  if status.is_server_error() {
    return Err(FetchError::unavailable(name, format!("HTTP {}", status)));
  }
  if !status.is_success() {
    return Err(FetchError::RevisionNotFound {
      name: name.to_string(),
      rev: format!("{} (HTTP {})", url, status),
    });
  }

  let bytes = response.bytes().await.map_err(|e| FetchError::unavailable(name, e))?;

  let actual = hex::encode(Sha256::digest(&bytes));
  if !actual.eq_ignore_ascii_case(expected_sha256) {
    return Err(FetchError::ChecksumMismatch {
      url: url.to_string(),
      expected: expected_sha256.to_string(),
      actual,
    });
  }

  remove_dir_if_exists(target_dir).map_err(|e| FetchError::io(target_dir, e))?;
  fs::create_dir_all(target_dir)
    .await
    .map_err(|e| FetchError::io(target_dir, e))?;

  let dest = target_dir.join(url_to_filename(url));
  let mut file = fs::File::create(&dest).await.map_err(|e| FetchError::io(&dest, e))?;
  file.write_all(&bytes).await.map_err(|e| FetchError::io(&dest, e))?;
  file.flush().await.map_err(|e| FetchError::io(&dest, e))?;

  debug!(path = %dest.display(), size = bytes.len(), "download complete");
  Ok(())
}

/// Convert a URL to a safe filename.
///
/// Takes the last path component and sanitizes it. Falls back to a hash of
/// the URL if no suitable filename can be extracted.
pub fn url_to_filename(url: &str) -> String {
  let last = url.rsplit('/').next().unwrap_or("");
  let last = last.split(['?', '#']).next().unwrap_or(last);

  let sanitized: String = last
    .chars()
    .map(|c| {
      if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
        c
      } else {
        '_'
      }
    })
    .collect();

  if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
    return sanitized;
  }

  format!("download_{}", &hex::encode(Sha256::digest(url.as_bytes()))[..16])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn filename_from_path() {
    assert_eq!(
      url_to_filename("https://ftp.openssl.org/source/openssl-3.0.13.tar.gz"),
      "openssl-3.0.13.tar.gz"
    );
  }

  #[test]
  fn filename_strips_query_and_fragment() {
    assert_eq!(url_to_filename("https://example.com/zlib.tar.xz?download=1"), "zlib.tar.xz");
    assert_eq!(url_to_filename("https://example.com/zlib.tar.xz#sha"), "zlib.tar.xz");
  }

  #[test]
  fn filename_sanitizes_odd_characters() {
    assert_eq!(url_to_filename("https://example.com/a%20b.zip"), "a_20b.zip");
  }

  #[test]
  fn filename_falls_back_to_hash() {
    let name = url_to_filename("https://example.com/");
    assert!(name.starts_with("download_"));
    assert_eq!(name.len(), "download_".len() + 16);
  }

  #[tokio::test]
  async fn unreachable_host_is_retryable() {
    let temp = tempfile::TempDir::new().unwrap();
    let err = download("zlib", "http://127.0.0.1:9/zlib.tar.gz", &"0".repeat(64), temp.path())
      .await
      .unwrap_err();
    assert!(err.is_retryable(), "{}", err);
  }
}
