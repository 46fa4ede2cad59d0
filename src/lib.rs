//! A Rust library for downloading VOD media content described by an adaptive bitrate streaming
//! manifest, in either HLS (m3u8 playlist) or DASH (MPD presentation) form. The library fetches
//! and parses the manifest into a normalized track model, selects tracks using a small selector
//! language, downloads all media segments concurrently with checkpointed resume support, decrypts
//! protected content (whole-segment AES-128-CBC for HLS, sample-level AES-CTR for CENC-protected
//! DASH), and hands the reassembled per-track byte streams to an external muxer (ffmpeg as a
//! subprocess) to produce a single output file.
//!
//! ## Features supported
//!
//! - HLS master and media playlists, including alternate renditions (audio/subtitle groups) with
//!   lazy media-playlist hydration, `#EXT-X-KEY`, `#EXT-X-MAP` and `#EXT-X-BYTERANGE`
//! - DASH static manifests with SegmentTemplate (+SegmentTimeline), SegmentList and
//!   single-BaseURL addressing, multi-period presentations
//! - Track selection expressions such as `best`, `v:-1080p[<5M]+a:en,ar!`
//! - AES-128-CBC segment decryption with key fetching, and CENC AES-CTR sample decryption with
//!   sub-sample partitioning read from the ISO-BMFF box structure
//! - Concurrent downloads over a shared connection pool, bounded retries with exponential
//!   backoff, bandwidth throttling, and resume from a JSON checkpoint sidecar
//!
//! ## Limitations / unsupported features
//!
//! - Live/dynamic manifests (sliding windows, manifest refresh)
//! - DRM license acquisition: CENC keys must be supplied as `KID:KEY` pairs

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use regex::Regex;
use tokio_util::sync::CancellationToken;

pub mod cenc;
pub mod checkpoint;
pub mod client;
pub mod decrypt;
pub mod fetch;
pub mod hls;
pub mod mpd;
pub mod mux;
pub mod pool;
pub mod select;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum VodlError {
    #[error("parse error {0}")]
    Parsing(String),
    #[error("unsupported manifest {0}")]
    UnsupportedManifest(String),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("network error {0}")]
    Network(String),
    #[error("cancelled")]
    Cancelled,
    #[error("invalid decryption key: {0}")]
    BadKeyFormat(String),
    #[error("decryption key identifier does not match the init segment KID")]
    KidMismatch,
    #[error("bad ciphertext: {0}")]
    BadCiphertext(String),
    #[error("required tracks not found: {0}")]
    RequiredNotFound(String),
    #[error("no tracks available")]
    NoTracks,
    #[error("no tracks matched selector {0}")]
    SelectorEmpty(String),
    #[error("{failed}/{total} segments failed ({percent:.1}%)")]
    TooManyFailures { failed: u64, total: u64, percent: f64 },
    #[error("I/O error {1}")]
    Io(#[source] std::io::Error, String),
    #[error("muxing error {0}")]
    Muxing(String),
}

impl VodlError {
    /// Errors that abort a segment task without further retry attempts.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, VodlError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, VodlError>;

/// The two manifest families understood by the parser registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Hls,
    Dash,
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestKind::Hls => write!(f, "HLS"),
            ManifestKind::Dash => write!(f, "DASH"),
        }
    }
}

/// A parsed streaming manifest: the normalized model shared by both parsers.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub url: String,
    pub kind: ManifestKind,
    pub tracks: Vec<Track>,
    /// Total presentation duration, when the manifest declares or implies one.
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Subtitle => write!(f, "subtitle"),
        }
    }
}

/// Video dimensions in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl Resolution {
    /// Human-readable quality label ("1080p", "4K", ...).
    pub fn quality_label(&self) -> String {
        match self.height {
            h if h >= 2160 => String::from("4K"),
            h if h >= 1440 => String::from("1440p"),
            h if h >= 1080 => String::from("1080p"),
            h if h >= 720 => String::from("720p"),
            h if h >= 480 => String::from("480p"),
            h if h >= 360 => String::from("360p"),
            h if h > 0 => format!("{h}p"),
            _ => String::new(),
        }
    }
}

/// An inclusive HTTP byte range, normalized from both the `length@offset` (HLS) and `start-end`
/// (DASH) wire forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// One media chunk of a track. The initialization segment carries index -1; media segments are
/// numbered contiguously from zero in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub index: i64,
    pub url: String,
    pub duration: Option<Duration>,
    pub byte_range: Option<ByteRange>,
    /// In-memory payload; released once the segment has been decrypted and spooled.
    pub payload: Option<Vec<u8>>,
    /// Final on-disk location once spooled. Mutually exclusive with `payload` at rest.
    pub file_path: Option<PathBuf>,
}

/// Encryption description attached to a track by manifest parsing. Immutable thereafter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Encryption {
    #[default]
    None,
    /// HLS whole-segment AES-128-CBC: the key lives at `key_uri`, the IV is either declared in
    /// the playlist or derived from the segment sequence number.
    WholeSegmentCbc {
        key_uri: String,
        iv: Option<[u8; 16]>,
    },
    /// CENC sample-level AES-CTR. The manifest names the default KID; IV sizes and sub-sample
    /// layout come from the init and media segments themselves.
    SampleCtr {
        /// Hyphen-stripped lowercase hex of the default key identifier.
        default_kid: String,
    },
}

/// One selectable stream within a manifest.
#[derive(Debug, Clone)]
pub struct Track {
    /// Stable identifier, unique within the manifest.
    pub id: String,
    pub kind: TrackKind,
    pub codec: String,
    /// Declared bandwidth in bits per second.
    pub bandwidth: Option<u64>,
    /// Only meaningful for video tracks.
    pub resolution: Option<Resolution>,
    /// BCP-47-ish language tag; three-letter codes are normalized at selection time.
    pub language: Option<String>,
    pub name: Option<String>,
    pub segments: Vec<Segment>,
    pub init_segment: Option<Segment>,
    /// Media playlist URL recorded for lazy segment hydration (HLS alternate renditions).
    pub media_playlist_url: Option<String>,
    pub encryption: Encryption,
    /// Decryption strategy resolved by the orchestrator from `encryption` and the configured
    /// keys. Carried here so the pipeline needs no closures attached to data.
    pub decryption: decrypt::DecryptionStrategy,
}

impl Default for Track {
    fn default() -> Self {
        Track {
            id: String::new(),
            kind: TrackKind::Video,
            codec: String::new(),
            bandwidth: None,
            resolution: None,
            language: None,
            name: None,
            segments: Vec::new(),
            init_segment: None,
            media_playlist_url: None,
            encryption: Encryption::None,
            decryption: decrypt::DecryptionStrategy::None,
        }
    }
}

// Codec substring tables shared by the model helpers and the selector.
pub(crate) const AUDIO_CODECS: &[&str] =
    &["mp4a", "aac", "ac-3", "ec-3", "opus", "vorbis", "flac", "mp3"];
pub(crate) const VIDEO_CODECS: &[&str] =
    &["avc", "h264", "hevc", "h265", "hvc1", "hev1", "vp9", "vp8", "av01", "av1"];
pub(crate) const SUBTITLE_CODECS: &[&str] =
    &["stpp", "wvtt", "ttml", "webvtt", "vtt", "srt"];

fn codec_matches(codec: &str, table: &[&str]) -> bool {
    let codec = codec.to_lowercase();
    table.iter().any(|c| codec.contains(c))
}

impl Track {
    /// True when the declared kind, resolution or codec descriptor identify video content.
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
            || self.resolution.is_some_and(|r| r.height > 0)
            || codec_matches(&self.codec, VIDEO_CODECS)
    }

    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio || codec_matches(&self.codec, AUDIO_CODECS)
    }

    pub fn is_subtitle(&self) -> bool {
        self.kind == TrackKind::Subtitle || codec_matches(&self.codec, SUBTITLE_CODECS)
    }
}

/// A CENC decryption key pair, configured externally as `KID:KEY` with both halves being 32 hex
/// characters (128 bits each).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub kid: [u8; 16],
    pub key: [u8; 16],
}

impl KeyPair {
    pub fn parse(s: &str) -> Result<KeyPair> {
        let (kid, key) = s
            .split_once(':')
            .ok_or_else(|| VodlError::BadKeyFormat(String::from("expected KID:KEY")))?;
        if kid.len() != 32 || key.len() != 32 {
            return Err(VodlError::BadKeyFormat(String::from(
                "expected 32 hex characters for both KID and KEY",
            )));
        }
        let mut pair = KeyPair { kid: [0; 16], key: [0; 16] };
        hex::decode_to_slice(kid, &mut pair.kid)
            .map_err(|e| VodlError::BadKeyFormat(format!("KID: {e}")))?;
        hex::decode_to_slice(key, &mut pair.key)
            .map_err(|e| VodlError::BadKeyFormat(format!("KEY: {e}")))?;
        Ok(pair)
    }
}

// Parse an XML duration string, as per https://www.w3.org/TR/xmlschema-2/#duration
//
// Durations in manifests are commonly of the restricted PnDTnHnMnS form ("PT3M30S",
// "PT0H9M56.46S"). Fractional parts are only accepted on the seconds component.
pub(crate) fn parse_xs_duration(s: &str) -> Result<Duration> {
    let re = Regex::new(concat!(
        r"^(?:[+-])?P",
        r"(?:(?P<days>\d+)D)?",
        r"(?:T",
        r"(?:(?P<hours>\d+)H)?",
        r"(?:(?P<minutes>\d+)M)?",
        r"(?:(?P<seconds>\d+)(?:(?P<fraction>[.,]\d+)?)S)?",
        r")?$"
    ))
    .unwrap();
    let m = re
        .captures(s)
        .ok_or_else(|| VodlError::Parsing(format!("invalid duration {s}")))?;
    if m.name("days").is_none()
        && m.name("hours").is_none()
        && m.name("minutes").is_none()
        && m.name("seconds").is_none()
    {
        return Err(VodlError::Parsing(format!("empty duration {s}")));
    }
    let mut secs: u64 = 0;
    let mut nanos: u32 = 0;
    if let Some(f) = m.name("fraction") {
        let mut digits = &f.as_str()[1..];
        if digits.len() > 9 {
            digits = &digits[..9];
        }
        nanos = format!("{digits:0<9}").parse::<u32>().unwrap();
    }
    if let Some(v) = m.name("seconds") {
        secs += v.as_str().parse::<u64>().unwrap();
    }
    if let Some(v) = m.name("minutes") {
        secs += v.as_str().parse::<u64>().unwrap() * 60;
    }
    if let Some(v) = m.name("hours") {
        secs += v.as_str().parse::<u64>().unwrap() * 3600;
    }
    if let Some(v) = m.name("days") {
        secs += v.as_str().parse::<u64>().unwrap() * 86400;
    }
    Ok(Duration::new(secs, nanos))
}

/// Parse a byte-range attribute in either of its two wire forms: `length@offset` as used by HLS
/// playlists (a missing offset meaning "right after the previous range"), or `start-end` as used
/// by DASH manifests. Returns the normalized inclusive range.
pub(crate) fn parse_byte_range(s: &str, previous_end: Option<u64>) -> Option<ByteRange> {
    let s = s.trim().trim_matches('"');
    if let Some((length, offset)) = s.split_once('@') {
        let length = length.parse::<u64>().ok()?;
        let start = offset.parse::<u64>().ok()?;
        return Some(ByteRange { start, end: start + length.checked_sub(1)? });
    }
    if let Ok(length) = s.parse::<u64>() {
        // BYTERANGE without an offset continues from the previous sub-range of the same resource.
        let start = previous_end.map_or(0, |e| e + 1);
        return Some(ByteRange { start, end: start + length.checked_sub(1)? });
    }
    let (start, end) = s.split_once('-')?;
    Some(ByteRange {
        start: start.parse::<u64>().ok()?,
        end: end.parse::<u64>().ok()?,
    })
}

/// Parse a hex string with an optional `0x` prefix into bytes. Trailing odd characters are
/// ignored, matching tolerant playlist parsing.
pub(crate) fn parse_hex_bytes(s: &str) -> Vec<u8> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let mut out = Vec::with_capacity(s.len() / 2);
    let mut i = 0;
    while i + 1 < s.len() {
        if let Ok(b) = u8::from_str_radix(&s[i..i + 2], 16) {
            out.push(b);
        }
        i += 2;
    }
    out
}

pub(crate) fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("file://")
}

/// Resolve a possibly-relative URL reference against a base URL.
pub(crate) fn resolve_url(base: &url::Url, reference: &str) -> String {
    if is_absolute_url(reference) {
        return reference.to_string();
    }
    match base.join(reference) {
        Ok(u) => u.to_string(),
        Err(_) => reference.to_string(),
    }
}

/// Parse a manifest by URL. Dispatches on a case-insensitive URL substring: `.m3u8` or
/// `format=m3u8` selects the HLS parser, `.mpd` or `format=mpd` the DASH parser; the first match
/// wins and no content sniffing is attempted.
pub async fn parse_manifest(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<Manifest> {
    let lower = url.to_lowercase();
    if lower.contains(".m3u8") || lower.contains("format=m3u8") {
        hls::parse(client, url, headers, cancel).await
    } else if lower.contains(".mpd") || lower.contains("format=mpd") {
        mpd::parse(client, url, headers, cancel).await
    } else {
        Err(VodlError::UnsupportedManifest(url.to_string()))
    }
}
