//! Shared HTTP client construction and single-request byte fetching.
//
// All segment and manifest requests in a download flow through one reqwest Client so that its
// connection pool is reused across workers. Media segments are already compressed, so transfer
// compression is left disabled (the gzip/brotli reqwest features are not enabled).

use std::collections::HashMap;
use std::time::{Duration, Instant};
use backoff::ExponentialBackoff;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use crate::{ByteRange, Result, VodlError};

/// Burst capacity of the bandwidth token bucket.
const RATE_LIMIT_BURST: f64 = 64.0 * 1024.0;

/// Settings for the shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Ceiling on pooled connections kept per host.
    pub max_idle_per_host: usize,
    pub connect_timeout: Duration,
    /// Timeout covering the wait for response headers and gaps between body reads. There is no
    /// whole-request timeout; callers enforce per-segment deadlines via cancellation.
    pub read_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            max_idle_per_host: 100,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Build the shared connection-pooling HTTP client used for all manifest, key and segment
/// requests.
pub fn build_client(settings: &HttpSettings) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(settings.max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30))
        .connect_timeout(settings.connect_timeout)
        .read_timeout(settings.read_timeout)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .build()
        .map_err(|e| VodlError::Network(format!("building HTTP client: {e}")))
}

/// Token-bucket bandwidth limiter shared by all workers. Each response-body read awaits the
/// bucket before accepting its chunk, so aggregate throughput converges on `bytes_per_sec` with
/// bursts of up to 64 KiB.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> RateLimiter {
        RateLimiter {
            bytes_per_sec: bytes_per_sec as f64,
            state: Mutex::new(BucketState {
                tokens: RATE_LIMIT_BURST,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Debit `n` bytes from the bucket, sleeping until the deficit is repaid. Reads never exceed
    /// the granted tokens on average, though a single oversized chunk is granted in full.
    pub async fn acquire(&self, n: usize) {
        let wait = {
            let mut st = self.state.lock().await;
            let elapsed = st.last_refill.elapsed().as_secs_f64();
            st.last_refill = Instant::now();
            st.tokens = (st.tokens + elapsed * self.bytes_per_sec).min(RATE_LIMIT_BURST);
            st.tokens -= n as f64;
            if st.tokens < 0.0 {
                Duration::from_secs_f64(-st.tokens / self.bytes_per_sec)
            } else {
                Duration::ZERO
            }
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Fetch a resource with a single GET request, optionally scoped to a byte range. Success is
/// strictly 200 OK, or 206 Partial Content for ranged requests; any other status maps to
/// [`VodlError::HttpStatus`]. The body is read chunkwise so that cancellation and the bandwidth
/// limiter are honored mid-transfer.
pub async fn fetch_bytes(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    byte_range: Option<&ByteRange>,
    limiter: Option<&RateLimiter>,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let mut req = client.get(url);
    for (k, v) in headers {
        req = req.header(k.as_str(), v.as_str());
    }
    if let Some(r) = byte_range {
        req = req.header(reqwest::header::RANGE, format!("bytes={}-{}", r.start, r.end));
    }
    let mut response = tokio::select! {
        _ = cancel.cancelled() => return Err(VodlError::Cancelled),
        r = req.send() => r.map_err(|e| VodlError::Network(e.to_string()))?,
    };
    let status = response.status();
    if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
        return Err(VodlError::HttpStatus(status.as_u16()));
    }
    let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(VodlError::Cancelled),
            c = response.chunk() => c.map_err(|e| VodlError::Network(e.to_string()))?,
        };
        let Some(chunk) = chunk else { break };
        if let Some(limiter) = limiter {
            tokio::select! {
                _ = cancel.cancelled() => return Err(VodlError::Cancelled),
                _ = limiter.acquire(chunk.len()) => {},
            }
        }
        body.extend_from_slice(&chunk);
    }
    debug!("fetched {} octets from {url}", body.len());
    Ok(body)
}

fn reqwest_error_transient(e: &reqwest::Error) -> bool {
    if e.is_timeout() || e.is_connect() {
        return true;
    }
    if let Some(s) = e.status() {
        return s == StatusCode::REQUEST_TIMEOUT
            || s == StatusCode::TOO_MANY_REQUESTS
            || s == StatusCode::SERVICE_UNAVAILABLE
            || s == StatusCode::GATEWAY_TIMEOUT;
    }
    false
}

/// Fetch the text of a manifest, retrying transient failures with exponential backoff. Manifest
/// responses must be 200 OK.
pub async fn fetch_manifest_text(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<String> {
    let fetch = || async {
        let mut req = client.get(url);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let response = req
            .send()
            .await
            .map_err(|e| {
                if reqwest_error_transient(&e) {
                    backoff::Error::transient(VodlError::Network(e.to_string()))
                } else {
                    backoff::Error::permanent(VodlError::Network(e.to_string()))
                }
            })?;
        let status = response.status();
        if status != StatusCode::OK {
            let err = VodlError::HttpStatus(status.as_u16());
            return if status.is_server_error() {
                Err(backoff::Error::transient(err))
            } else {
                Err(backoff::Error::permanent(err))
            };
        }
        response
            .text()
            .await
            .map_err(|e| backoff::Error::permanent(VodlError::Network(e.to_string())))
    };
    info!("fetching manifest {url}");
    let backoff = ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(VodlError::Cancelled),
        r = backoff::future::retry(backoff, fetch) => r,
    }
}
