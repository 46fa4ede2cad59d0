// End-to-end download tests against a local fixture server.
//
// To run tests while enabling printing to stdout/stderr
//
//    cargo test --test fetching -- --show-output
//
// What happens in these tests: an axum HTTP server serves a manifest and media segments, and we
// drive the full pipeline (parse -> select -> fetch -> spool -> assemble) against it, checking
// the assembled output byte for byte. Output is requested as single-track MPEG-TS so that no
// external muxer is needed.

pub mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use vodl::fetch::Downloader;
use vodl::mux::ContainerFormat;
use common::{serve, setup_logging};

fn segment_payload(index: usize) -> Vec<u8> {
    format!("SEGMENT-{index:03}-").into_bytes().repeat(37)
}

#[tokio::test]
async fn test_hls_download_assembles_in_order() -> Result<()> {
    setup_logging();
    async fn playlist() -> impl IntoResponse {
        let mut m3u8 = String::from("#EXTM3U\n#EXT-X-VERSION:6\n#EXT-X-TARGETDURATION:4\n");
        m3u8.push_str("#EXT-X-MAP:URI=\"init.bin\"\n");
        for i in 0..3 {
            m3u8.push_str(&format!("#EXTINF:4.0,\nseg/{i}\n"));
        }
        m3u8.push_str("#EXT-X-ENDLIST\n");
        ([(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")], m3u8)
    }
    let app = Router::new()
        .route("/media.m3u8", get(playlist))
        .route("/init.bin", get(|| async { b"INITBYTES".to_vec() }))
        .route("/seg/{index}", get(|Path(index): Path<usize>| async move {
            segment_payload(index)
        }));
    let base = serve(app).await;

    let outdir = tempfile::tempdir()?;
    let out = Downloader::new(&format!("{base}/media.m3u8"))
        .output_dir(outdir.path())
        .filename("out.ts")
        .container_format(ContainerFormat::Ts)
        .worker_count(4)
        .download().await?;

    let mut expected = b"INITBYTES".to_vec();
    for i in 0..3 {
        expected.extend_from_slice(&segment_payload(i));
    }
    assert_eq!(std::fs::read(&out)?, expected);
    // Full success removes the checkpoint sidecar.
    assert!(!out.with_file_name("out.ts.vodl.json").exists());
    Ok(())
}

#[tokio::test]
async fn test_dash_download_via_segment_list() -> Result<()> {
    setup_logging();
    async fn manifest() -> impl IntoResponse {
        let mpd = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD type="static" mediaPresentationDuration="PT12S">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <Representation id="v1" bandwidth="500000" width="640" height="360" codecs="avc1.42c01e">
        <SegmentList>
          <Initialization sourceURL="init.bin"/>
          <SegmentURL media="seg/0"/>
          <SegmentURL media="seg/1"/>
        </SegmentList>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
        ([(header::CONTENT_TYPE, "application/dash+xml")], mpd)
    }
    let app = Router::new()
        .route("/manifest.mpd", get(manifest))
        .route("/init.bin", get(|| async { b"DASHINIT".to_vec() }))
        .route("/seg/{index}", get(|Path(index): Path<usize>| async move {
            segment_payload(index)
        }));
    let base = serve(app).await;

    let outdir = tempfile::tempdir()?;
    let out = Downloader::new(&format!("{base}/manifest.mpd"))
        .output_dir(outdir.path())
        .filename("dash.ts")
        .container_format(ContainerFormat::Ts)
        .download().await?;

    let mut expected = b"DASHINIT".to_vec();
    expected.extend_from_slice(&segment_payload(0));
    expected.extend_from_slice(&segment_payload(1));
    assert_eq!(std::fs::read(&out)?, expected);
    Ok(())
}

#[tokio::test]
async fn test_byte_range_segment_maps_to_range_header() -> Result<()> {
    setup_logging();
    #[derive(Default)]
    struct AppState {
        ranges: Mutex<Vec<String>>,
    }

    async fn resource(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
        let range = headers
            .get(header::RANGE)
            .map(|v| v.to_str().unwrap_or("").to_string())
            .unwrap_or_default();
        state.ranges.lock().unwrap().push(range.clone());
        // "bytes=<start>-<end>"
        let spec = range.trim_start_matches("bytes=");
        let (start, end) = spec.split_once('-').unwrap_or(("0", "0"));
        let (start, end): (usize, usize) = (start.parse().unwrap(), end.parse().unwrap());
        let full: Vec<u8> = (0..200u8).cycle().take(4096).collect();
        (StatusCode::PARTIAL_CONTENT, full[start..=end].to_vec())
    }

    async fn playlist() -> impl IntoResponse {
        // length@offset form: 100 bytes at offset 50 -> Range: bytes=50-149
        let m3u8 = "#EXTM3U\n#EXTINF:4.0,\n#EXT-X-BYTERANGE:100@50\nall.bin\n#EXT-X-ENDLIST\n";
        ([(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")], m3u8)
    }

    let state = Arc::new(AppState::default());
    let app = Router::new()
        .route("/media.m3u8", get(playlist))
        .route("/all.bin", get(resource))
        .with_state(Arc::clone(&state));
    let base = serve(app).await;

    let outdir = tempfile::tempdir()?;
    let out = Downloader::new(&format!("{base}/media.m3u8"))
        .output_dir(outdir.path())
        .filename("ranged.ts")
        .container_format(ContainerFormat::Ts)
        .download().await?;

    assert_eq!(std::fs::read(&out)?.len(), 100);
    let ranges = state.ranges.lock().unwrap().clone();
    assert_eq!(ranges, vec![String::from("bytes=50-149")]);
    Ok(())
}

#[tokio::test]
async fn test_one_persistent_failure_in_hundred_is_tolerated() -> Result<()> {
    setup_logging();
    tokio::time::pause();

    #[derive(Default)]
    struct AppState {
        requests: AtomicUsize,
    }

    async fn segment(
        State(state): State<Arc<AppState>>,
        Path(index): Path<usize>,
    ) -> impl IntoResponse {
        state.requests.fetch_add(1, Ordering::SeqCst);
        if index == 13 {
            // This segment never succeeds; with 100 segments that is exactly the tolerated
            // failure ratio.
            return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
        }
        (StatusCode::OK, segment_payload(index))
    }

    async fn playlist() -> impl IntoResponse {
        let mut m3u8 = String::from("#EXTM3U\n");
        for i in 0..100 {
            m3u8.push_str(&format!("#EXTINF:2.0,\nseg/{i}\n"));
        }
        m3u8.push_str("#EXT-X-ENDLIST\n");
        ([(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")], m3u8)
    }

    let state = Arc::new(AppState::default());
    let app = Router::new()
        .route("/media.m3u8", get(playlist))
        .route("/seg/{index}", get(segment))
        .with_state(Arc::clone(&state));
    let base = serve(app).await;

    let outdir = tempfile::tempdir()?;
    // A plain client without request timeouts: under the paused clock, a pending timeout timer
    // would be auto-advanced into firing before the (real) localhost I/O completes.
    let out = Downloader::new(&format!("{base}/media.m3u8"))
        .with_http_client(reqwest::Client::new())
        .output_dir(outdir.path())
        .filename("tolerant.ts")
        .container_format(ContainerFormat::Ts)
        .worker_count(8)
        .download().await?;

    // 99 segments assembled; the permanently failing one is absent from the output.
    let data = std::fs::read(&out)?;
    assert_eq!(data.len(), 99 * segment_payload(0).len());
    assert!(!String::from_utf8_lossy(&data).contains("SEGMENT-013"));
    // The failed segment was attempted five times.
    assert_eq!(state.requests.load(Ordering::SeqCst), 99 + 5);
    Ok(())
}
