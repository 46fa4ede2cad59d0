//! Hand-off to the external muxer.
//
// The core's output contract is an ordered byte stream per selected track: the init segment
// bytes first, then every media segment in index order. Those streams are concatenated into
// temporary files and passed to ffmpeg as a subprocess ("-c copy", one "-map" per input) to
// produce the final container. Subtitle tracks are not muxed; they are written next to the
// output file with a language suffix. When ffmpeg is unavailable, a single track (or an MPEG-TS
// target, which tolerates plain concatenation) falls back to a byte copy.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use crate::{Result, Track, VodlError};

/// Output container formats supported by the ffmpeg hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerFormat {
    #[default]
    Mp4,
    Mkv,
    Ts,
    Webm,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mkv => "mkv",
            ContainerFormat::Ts => "ts",
            ContainerFormat::Webm => "webm",
        }
    }

    pub fn from_extension(s: &str) -> Option<ContainerFormat> {
        match s.to_lowercase().as_str() {
            "mp4" => Some(ContainerFormat::Mp4),
            "mkv" => Some(ContainerFormat::Mkv),
            "ts" => Some(ContainerFormat::Ts),
            "webm" => Some(ContainerFormat::Webm),
            _ => None,
        }
    }
}

/// Combine the selected tracks into `output_path`. Media tracks are concatenated to per-track
/// temporary files and muxed; subtitle tracks are saved as sibling files.
pub async fn mux_tracks(
    tracks: &[Track],
    output_path: &Path,
    format: ContainerFormat,
) -> Result<()> {
    if tracks.is_empty() {
        return Err(VodlError::Muxing(String::from("no tracks to mux")));
    }
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VodlError::Io(e, String::from("creating output directory")))?;
        }
    }

    let (subtitles, media): (Vec<&Track>, Vec<&Track>) =
        tracks.iter().partition(|t| t.is_subtitle());

    for subtitle in &subtitles {
        let path = subtitle_path(output_path, subtitle);
        match write_track_bytes(subtitle, &path).await {
            Ok(n) if n > 0 => info!("subtitle saved: {}", path.display()),
            Ok(_) => warn!("subtitle track {} produced no data", subtitle.id),
            Err(e) => warn!("saving subtitle {}: {e}", subtitle.id),
        }
    }
    if media.is_empty() {
        return Ok(());
    }

    // Concatenate each media track into a temp file that lives until ffmpeg has run.
    let mut track_files = Vec::with_capacity(media.len());
    for track in &media {
        let tmp = tempfile::Builder::new()
            .prefix("vodl-track-")
            .suffix(".dat")
            .tempfile()
            .map_err(|e| VodlError::Io(e, String::from("creating track temp file")))?;
        let written = write_track_bytes(track, tmp.path()).await?;
        if written == 0 {
            return Err(VodlError::Muxing(format!("no data for track {}", track.id)));
        }
        debug!("track {} assembled: {} octets", track.id, written);
        track_files.push(tmp);
    }

    // A single track destined for MPEG-TS is already in its output form; remuxing would be a
    // no-op subprocess invocation.
    if track_files.len() == 1 && format == ContainerFormat::Ts {
        tokio::fs::copy(track_files[0].path(), output_path)
            .await
            .map_err(|e| VodlError::Io(e, String::from("copying track to output")))?;
        return Ok(());
    }
    if ffmpeg_available().await {
        return mux_with_ffmpeg(&track_files, output_path, format).await;
    }
    if track_files.len() == 1 || format == ContainerFormat::Ts {
        tokio::fs::copy(track_files[0].path(), output_path)
            .await
            .map_err(|e| VodlError::Io(e, String::from("copying track to output")))?;
        return Ok(());
    }
    Err(VodlError::Muxing(format!(
        "ffmpeg is required to mux {} tracks into {}",
        track_files.len(),
        format.extension()
    )))
}

/// Write one track's ordered byte stream (init bytes first, then segments by index) to `path`.
/// Returns the number of bytes written.
async fn write_track_bytes(track: &Track, path: &Path) -> Result<u64> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VodlError::Io(e, String::from("creating track file")))?;
    let mut writer = tokio::io::BufWriter::new(file);
    let mut written = 0u64;

    if let Some(init) = &track.init_segment {
        if let Some(payload) = &init.payload {
            writer
                .write_all(payload)
                .await
                .map_err(|e| VodlError::Io(e, String::from("writing init segment")))?;
            written += payload.len() as u64;
        }
    }
    for segment in &track.segments {
        let data = match (&segment.payload, &segment.file_path) {
            (Some(payload), _) => payload.clone(),
            (None, Some(path)) => tokio::fs::read(path)
                .await
                .map_err(|e| VodlError::Io(e, String::from("reading spooled segment")))?,
            (None, None) => {
                warn!("segment {} of track {} has no data", segment.index, track.id);
                continue;
            }
        };
        writer
            .write_all(&data)
            .await
            .map_err(|e| VodlError::Io(e, String::from("writing segment")))?;
        written += data.len() as u64;
    }
    writer
        .flush()
        .await
        .map_err(|e| VodlError::Io(e, String::from("flushing track file")))?;
    Ok(written)
}

fn subtitle_path(output_path: &Path, track: &Track) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| String::from("output"));
    let lang = track.language.as_deref().filter(|l| !l.is_empty()).unwrap_or("sub");
    let ext = subtitle_extension(&track.codec);
    output_path
        .with_file_name(format!("{stem}.{lang}{ext}"))
}

fn subtitle_extension(codec: &str) -> &'static str {
    let codec = codec.to_lowercase();
    if codec.contains("ttml") || codec.contains("stpp") {
        ".ttml"
    } else if codec.contains("srt") {
        ".srt"
    } else {
        ".vtt"
    }
}

async fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn mux_with_ffmpeg(
    inputs: &[tempfile::NamedTempFile],
    output_path: &Path,
    format: ContainerFormat,
) -> Result<()> {
    let mut args: Vec<String> = vec![
        String::from("-hide_banner"),
        String::from("-nostats"),
        String::from("-loglevel"), String::from("error"),
        String::from("-y"),
        String::from("-nostdin"),
    ];
    for input in inputs {
        args.push(String::from("-i"));
        args.push(input.path().to_string_lossy().to_string());
    }
    args.push(String::from("-c"));
    args.push(String::from("copy"));
    // Map every stream of every input, not just stream 0, so that multiplexed variants keep
    // their embedded audio.
    for i in 0..inputs.len() {
        args.push(String::from("-map"));
        args.push(i.to_string());
    }
    if format == ContainerFormat::Mp4 {
        args.push(String::from("-movflags"));
        args.push(String::from("+faststart"));
    }
    args.push(output_path.to_string_lossy().to_string());

    info!("muxing {} tracks with ffmpeg into {}", inputs.len(), output_path.display());
    let out = Command::new("ffmpeg")
        .args(&args)
        .output()
        .await
        .map_err(|e| VodlError::Io(e, String::from("spawning ffmpeg")))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(VodlError::Muxing(format!("ffmpeg failed: {}", stderr.trim())));
    }
    Ok(())
}
