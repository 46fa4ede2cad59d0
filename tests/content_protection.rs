// Tests for downloading encrypted content: whole-segment AES-128-CBC as used by HLS playlists,
// with the key fetched over HTTP.
//
//    cargo test --test content_protection -- --show-output

pub mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use aes::Aes128;
use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use vodl::fetch::Downloader;
use vodl::mux::ContainerFormat;
use common::{serve, setup_logging};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;

const KEY: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
    0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
];

fn plaintext(index: usize) -> Vec<u8> {
    format!("CLEARTEXT-{index}-").into_bytes().repeat(11)
}

fn encrypt(data: &[u8], iv: &[u8; 16]) -> Vec<u8> {
    let padded_len = data.len() + (16 - data.len() % 16);
    let mut buf = vec![0u8; padded_len];
    buf[..data.len()].copy_from_slice(data);
    let enc = Aes128CbcEnc::new((&KEY).into(), iv.into());
    enc.encrypt_padded_mut::<Pkcs7>(&mut buf, data.len()).unwrap();
    buf
}

// The IV the CBC scheme derives from a segment's sequence number when the playlist does not
// declare one.
fn sequence_iv(index: usize) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&(index as u64).to_be_bytes());
    iv
}

#[derive(Default)]
struct AppState {
    key_requests: AtomicUsize,
}

#[tokio::test]
async fn test_aes128_cbc_with_declared_iv() -> Result<()> {
    setup_logging();
    const IV: [u8; 16] = [0x42; 16];

    async fn playlist() -> impl IntoResponse {
        let mut m3u8 = String::from("#EXTM3U\n");
        m3u8.push_str(&format!(
            "#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x{}\n",
            "42".repeat(16)
        ));
        for i in 0..3 {
            m3u8.push_str(&format!("#EXTINF:4.0,\nseg/{i}\n"));
        }
        m3u8.push_str("#EXT-X-ENDLIST\n");
        ([(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")], m3u8)
    }

    async fn key(State(state): State<Arc<AppState>>) -> impl IntoResponse {
        state.key_requests.fetch_add(1, Ordering::SeqCst);
        KEY.to_vec()
    }

    let state = Arc::new(AppState::default());
    let app = Router::new()
        .route("/media.m3u8", get(playlist))
        .route("/key.bin", get(key))
        .route("/seg/{index}", get(|Path(index): Path<usize>| async move {
            encrypt(&plaintext(index), &IV)
        }))
        .with_state(Arc::clone(&state));
    let base = serve(app).await;

    let outdir = tempfile::tempdir()?;
    // A single worker makes the key-cache assertion deterministic: concurrent workers may each
    // miss the cache before the first fetch lands.
    let out = Downloader::new(&format!("{base}/media.m3u8"))
        .output_dir(outdir.path())
        .filename("clear.ts")
        .container_format(ContainerFormat::Ts)
        .worker_count(1)
        .download().await?;

    let mut expected = Vec::new();
    for i in 0..3 {
        expected.extend_from_slice(&plaintext(i));
    }
    assert_eq!(std::fs::read(&out)?, expected);
    // The key is fetched once and cached per URI, not re-fetched per segment.
    assert_eq!(state.key_requests.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_aes128_cbc_sequence_number_iv_fallback() -> Result<()> {
    setup_logging();
    async fn playlist() -> impl IntoResponse {
        let mut m3u8 = String::from("#EXTM3U\n");
        // No IV attribute: each segment is encrypted with its sequence number as IV.
        m3u8.push_str("#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n");
        for i in 0..4 {
            m3u8.push_str(&format!("#EXTINF:4.0,\nseg/{i}\n"));
        }
        m3u8.push_str("#EXT-X-ENDLIST\n");
        ([(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")], m3u8)
    }

    let app = Router::new()
        .route("/media.m3u8", get(playlist))
        .route("/key.bin", get(|| async { KEY.to_vec() }))
        .route("/seg/{index}", get(|Path(index): Path<usize>| async move {
            encrypt(&plaintext(index), &sequence_iv(index))
        }));
    let base = serve(app).await;

    let outdir = tempfile::tempdir()?;
    let out = Downloader::new(&format!("{base}/media.m3u8"))
        .output_dir(outdir.path())
        .filename("seqiv.ts")
        .container_format(ContainerFormat::Ts)
        .download().await?;

    let mut expected = Vec::new();
    for i in 0..4 {
        expected.extend_from_slice(&plaintext(i));
    }
    assert_eq!(std::fs::read(&out)?, expected);
    Ok(())
}
