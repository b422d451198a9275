//! The downloader: fetch URLs to disk with streaming hash+size
//! verification, retry/back-off, and the `Ota-File-Cache-Control` header
//! the upstream caching proxy consumes. See spec.md §4.B.

use std::path::Path;
use std::sync::Arc;

use reqwest::StatusCode;
use sha2::{Digest, Sha256 as Sha256Hasher};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

use crate::error::{OtaError, Result};
use crate::manifest::Sha256;
use otaclient_utils::BackoffPolicy;

/// Value of the `Ota-File-Cache-Control` request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheControl {
    /// Default: let the caching proxy serve from cache if present.
    UseCache,
    /// Manifest/certificate fetches must bypass the cache entirely.
    NoCache,
    /// A second-chance fetch when the proxy cache is suspected stale.
    RetryCaching,
}

impl CacheControl {
    /// The exact header value string.
    pub fn as_header_value(self) -> &'static str {
        match self {
            Self::UseCache => "use_cache",
            Self::NoCache => "no_cache",
            Self::RetryCaching => "retry_caching",
        }
    }
}

/// Name of the custom cache-control header consumed by the caching proxy.
pub const CACHE_CONTROL_HEADER: &str = "Ota-File-Cache-Control";

/// Outcome of a successful [`Downloader::download`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Number of attempts beyond the first that were needed.
    pub retry_count: u32,
    /// Total bytes written to `dst`.
    pub bytes_downloaded: u64,
}

/// Fetches URLs to disk with verification, retry, and bounded concurrency.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    semaphore: Arc<Semaphore>,
}

impl Downloader {
    /// Build a downloader with `max_concurrent` in-flight HTTP requests and
    /// the given retry/back-off policy.
    pub fn new(max_concurrent: usize, backoff: BackoffPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            backoff,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Fetch `url` to `dst`, verifying streaming hash and (if given) size.
    /// Retries per the configured back-off policy; on final failure the
    /// destination is left absent.
    pub async fn download(
        &self,
        url: &str,
        dst: &Path,
        expected_hash: Sha256,
        expected_size: Option<u64>,
        cache_control: CacheControl,
        cookies: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Result<DownloadOutcome> {
        self.download_inner(url, dst, Some(expected_hash), expected_size, cache_control, cookies, headers)
            .await
    }

    /// Fetch `url` to `dst` with retry but no content-hash check, for
    /// callers that verify integrity a different way (the manifest
    /// envelope's own meta-stream hashes are checked by the caller once all
    /// four streams are in hand, rather than per-file here).
    pub async fn download_unverified(&self, url: &str, dst: &Path, cache_control: CacheControl) -> Result<DownloadOutcome> {
        self.download_inner(url, dst, None, None, cache_control, None, &[]).await
    }

    async fn download_inner(
        &self,
        url: &str,
        dst: &Path,
        expected_hash: Option<Sha256>,
        expected_size: Option<u64>,
        cache_control: CacheControl,
        cookies: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Result<DownloadOutcome> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        let mut attempt = 1u32;
        loop {
            match self
                .try_once(url, dst, expected_hash, expected_size, cache_control, cookies, headers)
                .await
            {
                Ok(bytes_downloaded) => {
                    return Ok(DownloadOutcome {
                        retry_count: attempt - 1,
                        bytes_downloaded,
                    })
                }
                Err(e) if e.retryable && self.backoff.should_retry(attempt) => {
                    let delay = self.backoff.delay_before(attempt + 1);
                    tracing::warn!(url, attempt, ?delay, error = %e.source, "download failed, retrying");
                    let _ = tokio::fs::remove_file(dst).await;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(dst).await;
                    return Err(OtaError::DownloadExhausted {
                        url: url.to_string(),
                        attempts: attempt,
                        source: e.source,
                    });
                }
            }
        }
    }

    async fn try_once(
        &self,
        url: &str,
        dst: &Path,
        expected_hash: Option<Sha256>,
        expected_size: Option<u64>,
        cache_control: CacheControl,
        cookies: Option<&str>,
        headers: &[(&str, &str)],
    ) -> std::result::Result<u64, Attempt> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Attempt::unretryable(e.into()))?;
        }

        let mut req = self.client.get(url).header(CACHE_CONTROL_HEADER, cache_control.as_header_value());
        if let Some(c) = cookies {
            req = req.header(reqwest::header::COOKIE, c);
        }
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req.send().await.map_err(Attempt::from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err(Attempt {
                retryable,
                source: anyhow::anyhow!("unexpected HTTP status {status}"),
            });
        }

        let mut file = tokio::fs::File::create(dst)
            .await
            .map_err(|e| Attempt::unretryable(e.into()))?;
        let mut hasher = Sha256Hasher::new();
        let mut total: u64 = 0;
        let mut resp = resp;
        while let Some(chunk) = resp.chunk().await.map_err(Attempt::from_reqwest)? {
            hasher.update(&chunk);
            total += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(|e| Attempt::unretryable(e.into()))?;
        }
        file.flush().await.map_err(|e| Attempt::unretryable(e.into()))?;

        if let Some(expected) = expected_size {
            if total != expected {
                return Err(Attempt {
                    retryable: true,
                    source: anyhow::anyhow!("size mismatch: expected {expected}, got {total}"),
                });
            }
        }
        if let Some(expected_hash) = expected_hash {
            let digest: [u8; 32] = hasher.finalize().into();
            if digest != expected_hash.0 {
                return Err(Attempt {
                    retryable: true,
                    source: anyhow::anyhow!(
                        "hash mismatch: expected {expected_hash}, got {}",
                        Sha256(digest)
                    ),
                });
            }
        }
        Ok(total)
    }
}

struct Attempt {
    retryable: bool,
    source: anyhow::Error,
}

impl Attempt {
    fn unretryable(source: anyhow::Error) -> Self {
        Self { retryable: false, source }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        let retryable = e.is_timeout() || e.is_connect() || e.status().map(|s| s.is_server_error()).unwrap_or(true);
        Self { retryable, source: e.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_control_header_values() {
        assert_eq!(CacheControl::UseCache.as_header_value(), "use_cache");
        assert_eq!(CacheControl::NoCache.as_header_value(), "no_cache");
        assert_eq!(CacheControl::RetryCaching.as_header_value(), "retry_caching");
    }
}
