//! Support for downloading media content from HLS or DASH streaming manifests.
//
// The `Downloader` wires the components together: manifest parsing, track selection, lazy
// segment hydration, init segment fetching, the concurrent download pool with checkpointed
// resume, decryption strategy resolution, and the final hand-off to the external muxer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use sanitise_file_name::sanitise;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use crate::checkpoint::{checkpoint_path, Checkpoint};
use crate::client::{build_client, fetch_bytes, HttpSettings, RateLimiter};
use crate::decrypt::{DecryptionStrategy, Decryptor};
use crate::mux::{mux_tracks, ContainerFormat};
use crate::pool::{progress_channel, PoolConfig, ProgressEvent, SegmentTask, WorkerPool};
use crate::select::select_tracks;
use crate::{hls, parse_manifest, Encryption, KeyPair, Result, Track, VodlError};

/// A `Client` from the `reqwest` crate, used for all HTTP requests of a download.
pub type HttpClient = reqwest::Client;

const DEFAULT_WORKERS: usize = 16;

/// The Downloader turns a manifest URL into a single muxed media file on disk. It follows the
/// builder pattern for the optional arguments of a download.
///
/// ```no_run
/// use vodl::fetch::Downloader;
///
/// # async fn run() -> vodl::Result<()> {
/// let out = Downloader::new("https://example.com/stream/master.m3u8")
///     .select("v:-1080p+a:en")
///     .worker_count(24)
///     .download().await?;
/// println!("Downloaded to {}", out.display());
/// # Ok(())
/// # }
/// ```
pub struct Downloader {
    manifest_url: String,
    headers: HashMap<String, String>,
    decryption_keys: Vec<KeyPair>,
    selector: String,
    workers: usize,
    /// Maximum download bandwidth in bytes per second; 0 means unlimited.
    max_bandwidth: u64,
    output_dir: Option<PathBuf>,
    filename: Option<String>,
    format: ContainerFormat,
    http_client: Option<HttpClient>,
    cancel: CancellationToken,
    progress_tx: Option<tokio::sync::mpsc::Sender<ProgressEvent>>,
}

impl Downloader {
    /// Create a `Downloader` for the given manifest URL.
    pub fn new(manifest_url: &str) -> Downloader {
        Downloader {
            manifest_url: String::from(manifest_url),
            headers: HashMap::new(),
            decryption_keys: Vec::new(),
            selector: String::from("best"),
            workers: DEFAULT_WORKERS,
            max_bandwidth: 0,
            output_dir: None,
            filename: None,
            format: ContainerFormat::Mp4,
            http_client: None,
            cancel: CancellationToken::new(),
            progress_tx: None,
        }
    }

    /// Use a preconfigured reqwest Client (proxy, user agent, timeouts, ...).
    pub fn with_http_client(mut self, client: HttpClient) -> Downloader {
        self.http_client = Some(client);
        self
    }

    /// Add an HTTP header sent with every request of this download.
    pub fn header(mut self, key: &str, value: &str) -> Downloader {
        self.headers.insert(String::from(key), String::from(value));
        self
    }

    /// Replace the whole header map.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Downloader {
        self.headers = headers;
        self
    }

    /// Register a CENC decryption key (parsed from a `KID:KEY` pair).
    pub fn add_decryption_key(mut self, key: KeyPair) -> Downloader {
        self.decryption_keys.push(key);
        self
    }

    /// Track selector expression (defaults to "best").
    pub fn select(mut self, selector: &str) -> Downloader {
        self.selector = String::from(selector);
        self
    }

    /// Number of concurrent download workers, clamped to [1, 128].
    pub fn worker_count(mut self, workers: usize) -> Downloader {
        self.workers = workers;
        self
    }

    /// Cap aggregate download bandwidth, in bytes per second (0 = unlimited).
    pub fn max_bandwidth(mut self, bytes_per_sec: u64) -> Downloader {
        self.max_bandwidth = bytes_per_sec;
        self
    }

    pub fn output_dir<P: Into<PathBuf>>(mut self, dir: P) -> Downloader {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn filename(mut self, name: &str) -> Downloader {
        self.filename = Some(String::from(name));
        self
    }

    pub fn container_format(mut self, format: ContainerFormat) -> Downloader {
        self.format = format;
        self
    }

    /// Share a cancellation token with the caller; cancelling it aborts the download promptly,
    /// including in-flight HTTP transfers.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Downloader {
        self.cancel = cancel;
        self
    }

    /// Obtain the advisory progress stream for this download. Events are dropped rather than
    /// produced when this receiver lags behind.
    pub fn progress(&mut self) -> tokio::sync::mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = progress_channel();
        self.progress_tx = Some(tx);
        rx
    }

    /// Run the download: parse, select, fetch, decrypt, spool, and mux. Returns the path of the
    /// muxed output file.
    pub async fn download(mut self) -> Result<PathBuf> {
        let client = match self.http_client.take() {
            Some(client) => client,
            None => build_client(&HttpSettings::default())?,
        };
        let limiter = (self.max_bandwidth > 0)
            .then(|| Arc::new(RateLimiter::new(self.max_bandwidth)));
        let cancel = self.cancel.clone();

        let manifest = parse_manifest(&client, &self.manifest_url, &self.headers, &cancel).await?;
        info!("{} manifest with {} tracks", manifest.kind, manifest.tracks.len());

        let selected = select_tracks(&manifest.tracks, &self.selector)?;
        let mut tracks: Vec<Track> =
            selected.iter().map(|&i| manifest.tracks[i].clone()).collect();

        // Lazy hydration: alternate renditions recorded from a master playlist carry only their
        // media playlist URL until selected.
        for track in &mut tracks {
            if track.media_playlist_url.is_some() && track.segments.is_empty() {
                hls::load_track_segments(&client, track, &self.headers, &cancel).await?;
            }
        }

        for track in &mut tracks {
            track.decryption =
                resolve_strategy(&track.encryption, &self.decryption_keys, &track.id);
        }

        // Init segments are fetched synchronously; they are small and every protected segment
        // needs them before any worker can make progress.
        for track in &mut tracks {
            if let Some(init) = &mut track.init_segment {
                if !init.url.is_empty() {
                    let data = fetch_bytes(
                        &client, &init.url, &self.headers,
                        init.byte_range.as_ref(), limiter.as_deref(), &cancel,
                    ).await?;
                    info!("fetched init segment for {}: {} octets", track.id, data.len());
                    init.payload = Some(data);
                }
            }
        }

        let filename = self.filename.clone()
            .unwrap_or_else(|| filename_from_url(&self.manifest_url, self.format));
        let output_dir = self.output_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| VodlError::Io(e, String::from("creating output directory")))?;
        let output_path = output_dir.join(filename);
        let sidecar = checkpoint_path(&output_path);

        let (spool_dir, checkpoint) = match Checkpoint::load(&sidecar)? {
            Some(cp) if cp.matches(&self.manifest_url) => {
                info!("resuming download from checkpoint ({} segments done)", cp.completed_count());
                (cp.temp_dir(), Arc::new(cp))
            }
            _ => {
                let dir = tempfile::Builder::new()
                    .prefix("vodl-")
                    .tempdir()
                    .map_err(|e| VodlError::Io(e, String::from("creating spool directory")))?
                    .keep();
                (dir.clone(), Arc::new(Checkpoint::new(&self.manifest_url, &dir)))
            }
        };
        std::fs::create_dir_all(&spool_dir)
            .map_err(|e| VodlError::Io(e, String::from("creating spool directory")))?;

        let decryptor = Arc::new(Decryptor::new(client.clone(), self.headers.clone()));
        let checkpoint_cb = Arc::clone(&checkpoint);
        let mut pool = WorkerPool::new(PoolConfig {
            workers: self.workers,
            client: client.clone(),
            headers: self.headers.clone(),
            limiter,
            decryptor,
            spool_dir: Some(spool_dir.clone()),
            cancel: cancel.clone(),
            progress_tx: self.progress_tx.take(),
            on_segment_done: Some(Box::new(move |track_id, index| {
                checkpoint_cb.mark_done(track_id, index);
            })),
        });
        pool.start();

        let mut total = 0u64;
        let mut skipped = 0u64;
        for track in &tracks {
            let init_payload = track
                .init_segment
                .as_ref()
                .and_then(|i| i.payload.clone())
                .map(Arc::new);
            for segment in &track.segments {
                total += 1;
                if checkpoint.is_done(&track.id, segment.index) {
                    skipped += 1;
                    continue;
                }
                let task = SegmentTask {
                    track_id: track.id.clone(),
                    segment: segment.clone(),
                    init_payload: init_payload.clone(),
                    strategy: track.decryption.clone(),
                };
                if let Err(e) = pool.submit(task).await {
                    pool.stop();
                    let _ = pool.wait().await;
                    checkpoint.save(&sidecar)?;
                    return Err(e);
                }
            }
        }
        if skipped > 0 {
            info!("resume: skipped {skipped}/{total} already-completed segments");
        }

        if let Err(e) = pool.wait().await {
            // Persist what completed so a later run can pick up from here.
            if let Err(save_err) = checkpoint.save(&sidecar) {
                warn!("persisting checkpoint: {save_err}");
            }
            return Err(e);
        }

        // Everything is on disk; point the track model at the spooled files so the muxer can
        // assemble each track in declared index order. A segment that stayed below the failure
        // tolerance has no spool file and is skipped by the muxer.
        for track in &mut tracks {
            for segment in &mut track.segments {
                segment.payload = None;
                if checkpoint.is_done(&track.id, segment.index) {
                    segment.file_path = Some(checkpoint.segment_path(&track.id, segment.index));
                }
            }
        }
        mux_tracks(&tracks, &output_path, self.format).await?;

        Checkpoint::delete(&sidecar)?;
        if let Err(e) = std::fs::remove_dir_all(&spool_dir) {
            warn!("removing spool directory {}: {e}", spool_dir.display());
        }
        Ok(output_path)
    }
}

// Resolve the manifest's encryption descriptor against the configured keys into the strategy
// the pipeline will apply.
fn resolve_strategy(
    encryption: &Encryption,
    keys: &[KeyPair],
    track_id: &str,
) -> DecryptionStrategy {
    match encryption {
        Encryption::None => DecryptionStrategy::None,
        Encryption::WholeSegmentCbc { key_uri, iv } => DecryptionStrategy::WholeSegmentCbc {
            key_uri: key_uri.clone(),
            iv: *iv,
        },
        Encryption::SampleCtr { default_kid } => {
            let chosen = if default_kid.is_empty() {
                keys.first()
            } else {
                keys.iter().find(|k| hex::encode(k.kid) == *default_kid)
            };
            match chosen {
                Some(pair) => DecryptionStrategy::SampleCtr { kid: pair.kid, key: pair.key },
                None => {
                    // Content that signals protection but carries no tenc box still plays; truly
                    // encrypted segments will fail KID validation downstream.
                    warn!("track {track_id} is protected but no matching decryption key is configured");
                    DecryptionStrategy::None
                }
            }
        }
    }
}

// Derive an output file name from the manifest URL.
fn filename_from_url(url: &str, format: ContainerFormat) -> String {
    let mut path = url;
    for prefix in ["http://", "https://", "file://"] {
        if let Some(p) = path.strip_prefix(prefix) {
            path = p;
        }
    }
    for prefix in ["www.", "ftp."] {
        if let Some(p) = path.strip_prefix(prefix) {
            path = p;
        }
    }
    // Drop a query string and the manifest extension.
    if let Some((p, _)) = path.split_once('?') {
        path = p;
    }
    for suffix in [".m3u8", ".mpd"] {
        if let Some(p) = path.strip_suffix(suffix) {
            path = p;
        }
    }
    format!("{}.{}", sanitise(path), format.extension())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_url() {
        let name = filename_from_url(
            "https://www.example.com/movies/feature/master.m3u8",
            ContainerFormat::Mp4,
        );
        assert!(name.ends_with(".mp4"));
        assert!(!name.contains("://"));
        assert!(!name.contains(".m3u8"));

        let name = filename_from_url(
            "https://cdn.example.com/p/manifest.mpd?token=abc",
            ContainerFormat::Mkv,
        );
        assert!(name.ends_with(".mkv"));
        assert!(!name.contains("token"));
    }

    #[test]
    fn test_resolve_strategy_matches_kid() {
        let key = KeyPair::parse(
            "112233445566778899aabbccddeeff00:00112233445566778899aabbccddeeff").unwrap();
        let strategy = resolve_strategy(
            &Encryption::SampleCtr {
                default_kid: String::from("112233445566778899aabbccddeeff00"),
            },
            &[key],
            "v1",
        );
        assert_eq!(strategy, DecryptionStrategy::SampleCtr { kid: key.kid, key: key.key });

        // A mismatched KID leaves the track without a strategy.
        let strategy = resolve_strategy(
            &Encryption::SampleCtr { default_kid: String::from("ff".repeat(16)) },
            &[key],
            "v1",
        );
        assert_eq!(strategy, DecryptionStrategy::None);

        // An empty manifest KID falls back to the first configured key.
        let strategy = resolve_strategy(
            &Encryption::SampleCtr { default_kid: String::new() },
            &[key],
            "v1",
        );
        assert!(matches!(strategy, DecryptionStrategy::SampleCtr { .. }));
    }

    #[test]
    fn test_resolve_strategy_cbc_passthrough() {
        let strategy = resolve_strategy(
            &Encryption::WholeSegmentCbc {
                key_uri: String::from("https://example.com/k"),
                iv: None,
            },
            &[],
            "v1",
        );
        assert!(matches!(strategy, DecryptionStrategy::WholeSegmentCbc { .. }));
        assert_eq!(resolve_strategy(&Encryption::None, &[], "v1"), DecryptionStrategy::None);
    }
}
