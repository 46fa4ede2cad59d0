//! Parsing support for HLS (m3u8) master and media playlists.
//
// The playlist format is line oriented: tag lines starting with '#EXT', comment lines starting
// with '#', and URI lines. A master playlist enumerates variant streams (#EXT-X-STREAM-INF
// followed by a URI) and alternate renditions (#EXT-X-MEDIA); a media playlist enumerates
// segments (#EXTINF followed by a URI). We parse tolerantly, ignoring unknown tags and
// attributes, in line with how widely deployed playlists diverge from RFC 8216.

use std::collections::HashMap;
use std::time::Duration;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use crate::client::fetch_manifest_text;
use crate::{
    parse_byte_range, parse_hex_bytes, resolve_url, Encryption, Manifest, ManifestKind, Result,
    Segment, Track, TrackKind, VodlError,
};

/// Everything a media playlist contributes to a track.
#[derive(Debug, Default)]
pub(crate) struct MediaPlaylist {
    pub segments: Vec<Segment>,
    pub init_segment: Option<Segment>,
    pub encryption: Encryption,
    pub total_duration: Duration,
}

/// Parse an HLS manifest from `url`. The content decides whether this is a master playlist
/// (variants are then hydrated by fetching their media playlists) or a media playlist (a single
/// track is produced).
pub async fn parse(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<Manifest> {
    let content = fetch_manifest_text(client, url, headers, cancel).await?;
    let base = Url::parse(url).map_err(|e| VodlError::Parsing(format!("manifest URL: {e}")))?;
    if content.contains("#EXT-X-STREAM-INF") {
        parse_master(client, &content, &base, headers, cancel).await
    } else {
        let media = parse_media_playlist(&content, &base);
        let track = Track {
            id: String::from("0"),
            kind: TrackKind::Video,
            segments: media.segments,
            init_segment: media.init_segment,
            encryption: media.encryption,
            ..Default::default()
        };
        Ok(Manifest {
            url: base.to_string(),
            kind: ManifestKind::Hls,
            tracks: vec![track],
            duration: Some(media.total_duration).filter(|d| !d.is_zero()),
        })
    }
}

async fn parse_master(
    client: &reqwest::Client,
    content: &str,
    base: &Url,
    headers: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<Manifest> {
    let mut tracks = Vec::new();
    let mut pending_variant: Option<HashMap<String, String>> = None;
    let mut rendition_counter = 0usize;

    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending_variant = Some(parse_attributes(rest));
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA:") {
            let attrs = parse_attributes(rest);
            // Renditions without a URI are muxed inside a variant and are not selectable
            // on their own.
            if let Some(uri) = attrs.get("URI") {
                let media_url = resolve_url(base, unquote(uri));
                tracks.push(rendition_track(&attrs, media_url, &mut rendition_counter));
            }
        } else if !line.starts_with('#') && !line.is_empty() {
            if let Some(attrs) = pending_variant.take() {
                let media_url = resolve_url(base, line);
                let mut track = variant_track(&attrs, &media_url);
                // Hydrate the variant from its media playlist. A variant whose playlist cannot
                // be fetched is kept without segments so that selection can still see it.
                match fetch_manifest_text(client, &media_url, headers, cancel).await {
                    Ok(media_content) => {
                        let media_base = Url::parse(&media_url)
                            .map_err(|e| VodlError::Parsing(format!("variant URL: {e}")))?;
                        let media = parse_media_playlist(&media_content, &media_base);
                        track.segments = media.segments;
                        track.init_segment = media.init_segment;
                        track.encryption = media.encryption;
                    }
                    Err(VodlError::Cancelled) => return Err(VodlError::Cancelled),
                    Err(e) => warn!("fetching variant media playlist {media_url}: {e}"),
                }
                tracks.push(track);
            }
        }
    }
    debug!("parsed HLS master playlist with {} tracks", tracks.len());
    Ok(Manifest {
        url: base.to_string(),
        kind: ManifestKind::Hls,
        tracks,
        duration: None,
    })
}

/// Fetch a lazily-hydrated track's media playlist and attach its segments. Alternate renditions
/// in a master playlist are recorded with only their media playlist URL; their segments are
/// hydrated here once the track has actually been selected.
pub(crate) async fn load_track_segments(
    client: &reqwest::Client,
    track: &mut Track,
    headers: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(playlist_url) = track.media_playlist_url.clone() else {
        return Ok(());
    };
    let content = fetch_manifest_text(client, &playlist_url, headers, cancel).await?;
    let base = Url::parse(&playlist_url)
        .map_err(|e| VodlError::Parsing(format!("media playlist URL: {e}")))?;
    let media = parse_media_playlist(&content, &base);
    track.segments = media.segments;
    if media.init_segment.is_some() {
        track.init_segment = media.init_segment;
    }
    if track.encryption == Encryption::None {
        track.encryption = media.encryption;
    }
    debug!("hydrated {} segments for track {}", track.segments.len(), track.id);
    Ok(())
}

/// Parse a media playlist into segments, an optional init segment and the encryption descriptor
/// in effect. Segment indices are allocated in encounter order starting at zero.
pub(crate) fn parse_media_playlist(content: &str, base: &Url) -> MediaPlaylist {
    let mut media = MediaPlaylist::default();
    let mut segment_duration: Option<Duration> = None;
    let mut pending_range = None;
    let mut previous_range_end = None;
    let mut index = 0i64;

    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration_field = rest.split(',').next().unwrap_or("");
            segment_duration = duration_field
                .trim()
                .parse::<f64>()
                .ok()
                .map(Duration::from_secs_f64);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            let attrs = parse_attributes(rest);
            if let Some(uri) = attrs.get("URI") {
                let iv = attrs.get("IV").map(|v| normalize_iv(unquote(v)));
                media.encryption = Encryption::WholeSegmentCbc {
                    key_uri: resolve_url(base, unquote(uri)),
                    iv,
                };
            }
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MAP:") {
            let attrs = parse_attributes(rest);
            if let Some(uri) = attrs.get("URI") {
                let mut init = Segment {
                    index: -1,
                    url: resolve_url(base, unquote(uri)),
                    ..Default::default()
                };
                if let Some(br) = attrs.get("BYTERANGE") {
                    init.byte_range = parse_byte_range(unquote(br), None);
                }
                media.init_segment = Some(init);
            }
        } else if let Some(rest) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            pending_range = parse_byte_range(rest, previous_range_end);
        } else if !line.starts_with('#') && !line.is_empty() {
            let byte_range = pending_range.take();
            previous_range_end = byte_range.map(|r| r.end);
            media.segments.push(Segment {
                index,
                url: resolve_url(base, line),
                duration: segment_duration,
                byte_range,
                ..Default::default()
            });
            if let Some(d) = segment_duration {
                media.total_duration += d;
            }
            index += 1;
        }
    }
    media
}

fn variant_track(attrs: &HashMap<String, String>, media_url: &str) -> Track {
    let mut track = Track {
        kind: TrackKind::Video,
        media_playlist_url: Some(media_url.to_string()),
        ..Default::default()
    };
    if let Some(bw) = attrs.get("BANDWIDTH") {
        track.bandwidth = bw.parse::<u64>().ok();
    }
    if let Some(res) = attrs.get("RESOLUTION") {
        if let Some((w, h)) = res.split_once('x') {
            if let (Ok(width), Ok(height)) = (w.parse(), h.parse()) {
                track.resolution = Some(crate::Resolution { width, height });
            }
        }
    }
    if let Some(codecs) = attrs.get("CODECS") {
        track.codec = unquote(codecs).to_string();
    }
    let height = track.resolution.map_or(0, |r| r.height);
    track.id = format!("video_{}_{}", height, track.bandwidth.unwrap_or(0));
    track
}

fn rendition_track(
    attrs: &HashMap<String, String>,
    media_url: String,
    counter: &mut usize,
) -> Track {
    let kind = match attrs.get("TYPE").map(|t| t.to_uppercase()).as_deref() {
        Some("AUDIO") => TrackKind::Audio,
        Some("SUBTITLES") | Some("CLOSED-CAPTIONS") => TrackKind::Subtitle,
        _ => TrackKind::Video,
    };
    let name = attrs.get("NAME").map(|v| unquote(v).to_string());
    let language = attrs.get("LANGUAGE").map(|v| unquote(v).to_string());
    let group = attrs.get("GROUP-ID").map(|v| unquote(v).to_string());
    let id = format!(
        "{}_{}_{}",
        group.as_deref().unwrap_or(""),
        language.as_deref().unwrap_or(""),
        name.as_deref().unwrap_or("")
    );
    let id = if id == "__" {
        *counter += 1;
        format!("media_{counter}")
    } else {
        id
    };
    Track {
        id,
        kind,
        name,
        language,
        media_playlist_url: Some(media_url),
        ..Default::default()
    }
}

// Attributes are KEY=VALUE pairs, comma separated, where VALUE may be quoted (and may then
// contain commas). Unknown keys are retained but ignored by callers; quotes are stripped at the
// point of use.
fn parse_attributes(s: &str) -> HashMap<String, String> {
    let re = Regex::new(r#"([A-Z0-9-]+)=("[^"]*"|[^,]*)"#).unwrap();
    re.captures_iter(s)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

fn unquote(s: &str) -> &str {
    s.trim_matches('"')
}

// Playlist IVs are hex strings of up to 128 bits; shorter values are left-padded with zeros.
fn normalize_iv(s: &str) -> [u8; 16] {
    let bytes = parse_hex_bytes(s);
    let mut iv = [0u8; 16];
    let n = bytes.len().min(16);
    iv[16 - n..].copy_from_slice(&bytes[..n]);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/streams/main.m3u8").unwrap()
    }

    #[test]
    fn test_media_playlist_segments_are_contiguous() {
        let content = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXTINF:6.006,
seg0.ts
#EXTINF:6.006,
seg1.ts
#EXTINF:3.2,title with comma, sort of
seg2.ts
#EXT-X-ENDLIST
";
        let media = parse_media_playlist(content, &base());
        assert_eq!(media.segments.len(), 3);
        for (i, seg) in media.segments.iter().enumerate() {
            assert_eq!(seg.index, i as i64);
        }
        assert_eq!(media.segments[0].url, "https://example.com/streams/seg0.ts");
        assert_eq!(media.segments[2].duration, Some(Duration::from_secs_f64(3.2)));
        assert!((media.total_duration.as_secs_f64() - 15.212).abs() < 1e-9);
    }

    #[test]
    fn test_media_playlist_key_and_map() {
        let content = "\
#EXTM3U
#EXT-X-KEY:METHOD=AES-128,URI=\"keys/k1.bin\",IV=0x00000000000000000000000000000042
#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"
#EXTINF:4.0,
seg0.ts
";
        let media = parse_media_playlist(content, &base());
        match &media.encryption {
            Encryption::WholeSegmentCbc { key_uri, iv } => {
                assert_eq!(key_uri, "https://example.com/streams/keys/k1.bin");
                let iv = iv.unwrap();
                assert_eq!(iv[15], 0x42);
                assert_eq!(iv[0], 0);
            }
            other => panic!("expected CBC encryption, got {other:?}"),
        }
        let init = media.init_segment.expect("init segment");
        assert_eq!(init.index, -1);
        assert_eq!(init.byte_range, Some(crate::ByteRange { start: 0, end: 719 }));
    }

    #[test]
    fn test_media_playlist_byteranges_chain() {
        let content = "\
#EXTM3U
#EXTINF:2.0,
#EXT-X-BYTERANGE:1000@0
all.ts
#EXTINF:2.0,
#EXT-X-BYTERANGE:500
all.ts
";
        let media = parse_media_playlist(content, &base());
        assert_eq!(media.segments.len(), 2);
        assert_eq!(media.segments[0].byte_range, Some(crate::ByteRange { start: 0, end: 999 }));
        assert_eq!(media.segments[1].byte_range, Some(crate::ByteRange { start: 1000, end: 1499 }));
    }

    #[test]
    fn test_attribute_parsing_tolerance() {
        let attrs = parse_attributes(
            r#"BANDWIDTH=1280000,RESOLUTION=1280x720,CODECS="avc1.4d401f,mp4a.40.2",UNKNOWN-KEY=x"#,
        );
        assert_eq!(attrs["BANDWIDTH"], "1280000");
        assert_eq!(attrs["RESOLUTION"], "1280x720");
        assert_eq!(unquote(&attrs["CODECS"]), "avc1.4d401f,mp4a.40.2");
        assert_eq!(attrs["UNKNOWN-KEY"], "x");
    }

    #[test]
    fn test_variant_track_identifier() {
        let attrs = parse_attributes(r#"BANDWIDTH=5000000,RESOLUTION=1920x1080,CODECS="avc1""#);
        let track = variant_track(&attrs, "https://example.com/v/hi.m3u8");
        assert_eq!(track.id, "video_1080_5000000");
        assert_eq!(track.bandwidth, Some(5000000));
        assert_eq!(track.resolution.unwrap().height, 1080);
    }

    #[test]
    fn test_rendition_track_without_attrs_gets_generated_id() {
        let mut counter = 0;
        let attrs = parse_attributes(r#"TYPE=AUDIO,URI="aud.m3u8""#);
        let track = rendition_track(&attrs, String::from("https://example.com/aud.m3u8"), &mut counter);
        assert_eq!(track.id, "media_1");
        assert_eq!(track.kind, TrackKind::Audio);
    }
}
