//! Track selection from a parsed manifest.
//
// A selector string picks a subset of tracks. The legacy forms ("best", "bv+ba", "all-audio",
// ...) are kept for compatibility; beyond those, a small expression language is supported:
//
//   selector   = expression ( "+" expression )*
//   expression = [ kind ":" ] body [ "[" bw-range "]" ] { modifier }
//   kind       = "v" | "video" | "a" | "audio" | "s" | "sub" | "subtitle"
//   body       = "-" resolution | resolution "-" resolution | value ( "," value )*
//   modifier   = "!" (required) | "?" (include undefined language) | "*" (select all matches)
//
// Values are resolutions ("720p", "fhd"), codec names ("hevc", "aac") or language codes, the
// latter normalized through a fixed alias table so that "eng", "english" and "en" all match.
// A bandwidth range in brackets ("[>2M]", "[128k-256k]") filters every match of the expression.

use std::collections::HashSet;
use regex::Regex;
use tracing::debug;
use crate::{Result, Track, TrackKind, VodlError};

// ISO 639-2/B codes and common English names, normalized to ISO 639-1.
const LANG_ALIASES: &[(&str, &str)] = &[
    ("eng", "en"), ("english", "en"),
    ("ara", "ar"), ("arb", "ar"), ("arabic", "ar"),
    ("jpn", "ja"), ("japanese", "ja"),
    ("zho", "zh"), ("chi", "zh"), ("cmn", "zh"), ("chinese", "zh"),
    ("spa", "es"), ("spanish", "es"),
    ("fra", "fr"), ("fre", "fr"), ("french", "fr"),
    ("deu", "de"), ("ger", "de"), ("german", "de"),
    ("por", "pt"), ("portuguese", "pt"),
    ("rus", "ru"), ("russian", "ru"),
    ("kor", "ko"), ("korean", "ko"),
    ("ita", "it"), ("italian", "it"),
    ("tur", "tr"), ("turkish", "tr"),
    ("hin", "hi"), ("hindi", "hi"),
    ("nld", "nl"), ("dut", "nl"), ("dutch", "nl"),
    ("pol", "pl"), ("polish", "pl"),
    ("vie", "vi"), ("vietnamese", "vi"),
    ("tha", "th"), ("thai", "th"),
    ("ind", "id"), ("indonesian", "id"),
    ("heb", "he"), ("hebrew", "he"),
    ("ell", "el"), ("gre", "el"), ("greek", "el"),
    ("ces", "cs"), ("cze", "cs"), ("czech", "cs"),
    ("ron", "ro"), ("rum", "ro"), ("romanian", "ro"),
    ("hun", "hu"), ("hungarian", "hu"),
    ("swe", "sv"), ("swedish", "sv"),
    ("dan", "da"), ("danish", "da"),
    ("fin", "fi"), ("finnish", "fi"),
    ("nor", "no"), ("norwegian", "no"), ("nob", "no"), ("nno", "no"),
    ("ukr", "uk"), ("ukrainian", "uk"),
    ("msa", "ms"), ("may", "ms"), ("malay", "ms"),
    ("fil", "tl"), ("tgl", "tl"), ("tagalog", "tl"), ("filipino", "tl"),
    ("fas", "fa"), ("per", "fa"), ("persian", "fa"), ("farsi", "fa"),
];

fn normalize_language(lang: &str) -> String {
    let lang = lang.trim().to_lowercase();
    for (alias, canonical) in LANG_ALIASES {
        if lang == *alias {
            return (*canonical).to_string();
        }
    }
    lang
}

fn language_matches(track_lang: &str, wanted: &str) -> bool {
    normalize_language(track_lang) == normalize_language(wanted)
}

fn language_undefined(lang: &str) -> bool {
    matches!(normalize_language(lang).as_str(), "" | "und" | "undefined" | "unknown")
}

/// A parsed selection expression such as `a:en,ar!` or `v:-1080p[128k-256k]`.
#[derive(Debug, Default, Clone)]
struct TrackExpr {
    kind: Option<TrackKind>,
    values: Vec<String>,
    /// `!`: selection fails if this expression matches nothing.
    required: bool,
    /// `?`: also include tracks whose language is empty or undefined.
    include_und: bool,
    /// `*`: keep every matching track instead of the first.
    select_all: bool,
    res_min: u32,
    res_max: u32,
    /// `-720p` form: best quality up to the bound.
    res_up_to: bool,
    bw_min: u64,
    bw_max: u64,
}

fn parse_expression(expr: &str) -> TrackExpr {
    let mut te = TrackExpr::default();
    let mut expr = expr.trim().to_string();

    if let Some((prefix, rest)) = expr.split_once(':') {
        let kind = match prefix.to_lowercase().as_str() {
            "v" | "video" => Some(TrackKind::Video),
            "a" | "audio" => Some(TrackKind::Audio),
            "s" | "sub" | "subtitle" => Some(TrackKind::Subtitle),
            _ => None,
        };
        if kind.is_some() {
            te.kind = kind;
            expr = rest.to_string();
        }
    }

    // Bandwidth range in brackets is cut out before modifier handling, so that a trailing
    // "[...]!" still parses.
    if let (Some(open), Some(close)) = (expr.find('['), expr.find(']')) {
        if close > open {
            let (min, max) = parse_bandwidth_range(&expr[open + 1..close]);
            te.bw_min = min;
            te.bw_max = max;
            expr = format!("{}{}", &expr[..open], &expr[close + 1..]);
        }
    }

    loop {
        match expr.chars().last() {
            Some('!') => te.required = true,
            Some('?') => te.include_und = true,
            Some('*') => te.select_all = true,
            _ => break,
        }
        expr.pop();
    }

    if let Some(rest) = expr.strip_prefix('-') {
        if !rest.is_empty() {
            te.res_up_to = true;
            te.res_max = parse_resolution(rest);
            return te;
        }
    }
    if !expr.starts_with('-') && expr.contains('-') {
        if let Some((lo, hi)) = expr.split_once('-') {
            let (lo, hi) = (parse_resolution(lo), parse_resolution(hi));
            if lo > 0 && hi > 0 {
                te.res_min = lo;
                te.res_max = hi;
                return te;
            }
        }
    }

    if !expr.is_empty() {
        for value in expr.split(',') {
            // Modifiers are also accepted on individual values ("a:ar!,ja!"); they apply to the
            // whole expression.
            let mut value = value.trim().to_string();
            loop {
                match value.chars().last() {
                    Some('!') => te.required = true,
                    Some('?') => te.include_und = true,
                    Some('*') => te.select_all = true,
                    _ => break,
                }
                value.pop();
            }
            if !value.is_empty() {
                te.values.push(value);
            }
        }
    }
    te
}

/// Convert resolution names to a height in pixels. Returns 0 when the string is not a
/// resolution.
fn parse_resolution(s: &str) -> u32 {
    match s.trim().to_lowercase().as_str() {
        "4k" | "2160p" | "uhd" => 2160,
        "1440p" | "2k" | "qhd" => 1440,
        "1080p" | "fhd" => 1080,
        "720p" | "hd" => 720,
        "480p" | "sd" => 480,
        "360p" => 360,
        "240p" => 240,
        "144p" => 144,
        other => other
            .strip_suffix('p')
            .and_then(|h| h.parse::<u32>().ok())
            .unwrap_or(0),
    }
}

// Bandwidth range forms: "128k", ">128k", ">=128k", "<5M", "<=5M", "128k-256k".
fn parse_bandwidth_range(s: &str) -> (u64, u64) {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix(">=") {
        return (parse_bandwidth(rest), 0);
    }
    if let Some(rest) = s.strip_prefix("<=") {
        return (0, parse_bandwidth(rest));
    }
    if let Some(rest) = s.strip_prefix('>') {
        return (parse_bandwidth(rest), 0);
    }
    if let Some(rest) = s.strip_prefix('<') {
        return (0, parse_bandwidth(rest));
    }
    if let Some((lo, hi)) = s.split_once('-') {
        return (parse_bandwidth(lo), parse_bandwidth(hi));
    }
    let bw = parse_bandwidth(s);
    (bw, bw)
}

/// Parse "128k", "2M", "5000000" into bits per second.
fn parse_bandwidth(s: &str) -> u64 {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return 0;
    }
    let (digits, multiplier) = match s.as_bytes()[s.len() - 1] {
        b'k' => (&s[..s.len() - 1], 1_000),
        b'm' => (&s[..s.len() - 1], 1_000_000),
        b'g' => (&s[..s.len() - 1], 1_000_000_000),
        _ => (s.as_str(), 1),
    };
    digits.parse::<u64>().unwrap_or(0) * multiplier
}

fn matches_bandwidth(bandwidth: u64, min: u64, max: u64) -> bool {
    if min == 0 && max == 0 {
        return true;
    }
    if min > 0 && bandwidth < min {
        return false;
    }
    if max > 0 && bandwidth > max {
        return false;
    }
    true
}

fn is_resolution_selector(s: &str) -> bool {
    let s = s.to_lowercase();
    if Regex::new(r"^\d+p$").unwrap().is_match(&s) {
        return true;
    }
    matches!(s.as_str(), "4k" | "2k" | "hd" | "fhd" | "sd" | "uhd" | "qhd")
}

fn is_codec_selector(s: &str) -> bool {
    let codecs = [
        "aac", "mp4a", "ac3", "ec3", "opus", "vorbis", "flac", "mp3",
        "h264", "avc", "hevc", "h265", "hvc1", "vp9", "vp8", "av1",
    ];
    codecs.contains(&s.to_lowercase().as_str())
}

/// Tracks categorized by kind and sorted so that the best (highest bandwidth) candidate of each
/// pool comes first. Selection operates on indices into the original track slice.
pub struct TrackSelector<'a> {
    tracks: &'a [Track],
    videos: Vec<usize>,
    audios: Vec<usize>,
    subtitles: Vec<usize>,
}

impl<'a> TrackSelector<'a> {
    pub fn new(tracks: &'a [Track]) -> TrackSelector<'a> {
        let mut videos = Vec::new();
        let mut audios = Vec::new();
        let mut subtitles = Vec::new();
        for (i, t) in tracks.iter().enumerate() {
            // Video is tested before audio: an HLS variant with muxed audio carries both codec
            // families in its CODECS attribute and must land in the video pool.
            if t.is_subtitle() {
                subtitles.push(i);
            } else if t.is_video() {
                videos.push(i);
            } else {
                audios.push(i);
            }
        }
        // Highest bandwidth first; the sort is stable so equal-bandwidth tracks keep their
        // manifest order (which for video reflects the declared quality ladder).
        let by_bandwidth = |indices: &mut Vec<usize>| {
            indices.sort_by(|&a, &b| tracks[b].bandwidth.unwrap_or(0)
                            .cmp(&tracks[a].bandwidth.unwrap_or(0)));
        };
        by_bandwidth(&mut videos);
        by_bandwidth(&mut audios);
        TrackSelector { tracks, videos, audios, subtitles }
    }

    /// Select tracks by selector string, returning indices into the track slice in selection
    /// order.
    pub fn select(&self, selector: &str) -> Result<Vec<usize>> {
        let selector = selector.trim();
        let selector = if selector.is_empty() { "best" } else { selector };

        match selector.to_lowercase().as_str() {
            "all" => {
                let mut all = self.videos.clone();
                all.extend(&self.audios);
                all.extend(&self.subtitles);
                return Ok(all);
            }
            "all-video" => return Ok(self.videos.clone()),
            "all-audio" => return Ok(self.audios.clone()),
            "all-subs" | "all-subtitles" => return Ok(self.subtitles.clone()),
            "best" | "bv+ba" | "best-video+best-audio" => {
                let mut selected = Vec::new();
                selected.extend(self.videos.first());
                selected.extend(self.audios.first());
                return Ok(selected);
            }
            "best-video" | "bv" => return Ok(self.videos.first().copied().into_iter().collect()),
            "best-audio" | "ba" => return Ok(self.audios.first().copied().into_iter().collect()),
            _ => {}
        }

        let mut selected: Vec<usize> = Vec::new();
        let mut seen: HashSet<usize> = HashSet::new();
        let mut required_failures: Vec<String> = Vec::new();

        for part in split_expressions(selector) {
            let expr = parse_expression(&part);
            match self.select_by_expression(&expr) {
                Ok(matched) => {
                    for i in matched {
                        if seen.insert(i) {
                            selected.push(i);
                        }
                    }
                }
                Err(e) => {
                    if expr.required {
                        required_failures.push(e.to_string());
                    }
                    // Non-required expressions that match nothing are silently skipped.
                }
            }
        }

        if !required_failures.is_empty() {
            return Err(VodlError::RequiredNotFound(required_failures.join("; ")));
        }

        if selected.is_empty() {
            selected.extend(self.videos.first());
            selected.extend(self.audios.first());
        }

        // A selection with video but no audio would produce a silent movie; append the best
        // audio when one exists.
        let has_video = selected.iter().any(|&i| self.tracks[i].is_video());
        let has_audio = selected.iter().any(|&i| self.tracks[i].is_audio());
        if has_video && !has_audio {
            if let Some(&best_audio) = self.audios.first() {
                if !selected.contains(&best_audio) {
                    selected.push(best_audio);
                }
            }
        }
        debug!("selector {selector:?} matched {} tracks", selected.len());
        Ok(selected)
    }

    fn pool_for(&self, expr: &TrackExpr) -> (&[usize], TrackKind) {
        match expr.kind {
            Some(TrackKind::Video) => (&self.videos, TrackKind::Video),
            Some(TrackKind::Audio) => (&self.audios, TrackKind::Audio),
            Some(TrackKind::Subtitle) => (&self.subtitles, TrackKind::Subtitle),
            None => {
                // Infer the pool from the expression content: resolution-shaped expressions
                // select video; otherwise values are assumed to be language codes, so audio.
                if expr.res_up_to || expr.res_min > 0 || expr.res_max > 0 {
                    (&self.videos, TrackKind::Video)
                } else if let Some(first) = expr.values.first() {
                    if is_resolution_selector(first) {
                        (&self.videos, TrackKind::Video)
                    } else {
                        (&self.audios, TrackKind::Audio)
                    }
                } else {
                    (&self.videos, TrackKind::Video)
                }
            }
        }
    }

    fn select_by_expression(&self, expr: &TrackExpr) -> Result<Vec<usize>> {
        let (pool, pool_kind) = self.pool_for(expr);
        if pool.is_empty() {
            return Err(VodlError::SelectorEmpty(format!("no {pool_kind} tracks available")));
        }

        let mut selected: Vec<usize>;
        if expr.res_up_to || expr.res_min > 0 || expr.res_max > 0 {
            selected = self.select_by_resolution_range(pool, expr);
            if selected.is_empty() {
                selected = vec![pool[0]];
            }
        } else if !expr.values.is_empty() {
            selected = self.select_by_values(pool, expr);
        } else {
            selected = Vec::new();
            for &i in pool {
                if matches_bandwidth(self.tracks[i].bandwidth.unwrap_or(0), expr.bw_min, expr.bw_max) {
                    selected.push(i);
                    if !expr.select_all {
                        break;
                    }
                }
            }
            if selected.is_empty() {
                selected.push(pool[0]);
            }
        }

        if expr.include_und {
            for &i in pool {
                let lang = self.tracks[i].language.as_deref().unwrap_or("");
                if language_undefined(lang) && !selected.contains(&i) {
                    selected.push(i);
                }
            }
        }

        if selected.is_empty() {
            return Err(VodlError::SelectorEmpty(format!("no matching tracks for {:?}", expr.values)));
        }
        Ok(selected)
    }

    fn select_by_resolution_range(&self, pool: &[usize], expr: &TrackExpr) -> Vec<usize> {
        let mut candidates: Vec<usize> = pool
            .iter()
            .copied()
            .filter(|&i| {
                let t = &self.tracks[i];
                let height = t.resolution.map_or(0, |r| r.height);
                if expr.res_up_to && height > expr.res_max {
                    return false;
                }
                if expr.res_min > 0 && height < expr.res_min {
                    return false;
                }
                if expr.res_max > 0 && !expr.res_up_to && height > expr.res_max {
                    return false;
                }
                matches_bandwidth(t.bandwidth.unwrap_or(0), expr.bw_min, expr.bw_max)
            })
            .collect();
        // Best quality first within the range: height descending, bandwidth breaking ties.
        candidates.sort_by(|&a, &b| {
            let (ta, tb) = (&self.tracks[a], &self.tracks[b]);
            let ha = ta.resolution.map_or(0, |r| r.height);
            let hb = tb.resolution.map_or(0, |r| r.height);
            hb.cmp(&ha).then(tb.bandwidth.unwrap_or(0).cmp(&ta.bandwidth.unwrap_or(0)))
        });
        if expr.select_all {
            candidates
        } else {
            candidates.truncate(1);
            candidates
        }
    }

    fn select_by_values(&self, pool: &[usize], expr: &TrackExpr) -> Vec<usize> {
        let mut selected = Vec::new();
        let mut used: HashSet<usize> = HashSet::new();

        for value in &expr.values {
            if is_resolution_selector(value) {
                let target = parse_resolution(value);
                if let Some(i) = self.closest_resolution(pool, target, expr) {
                    if used.insert(i) {
                        selected.push(i);
                    }
                }
                continue;
            }
            if is_codec_selector(value) {
                for &i in pool {
                    let t = &self.tracks[i];
                    if t.codec.to_lowercase().contains(&value.to_lowercase())
                        && matches_bandwidth(t.bandwidth.unwrap_or(0), expr.bw_min, expr.bw_max)
                        && used.insert(i)
                    {
                        selected.push(i);
                        if !expr.select_all {
                            break;
                        }
                    }
                }
                continue;
            }
            // Otherwise a language code.
            for &i in pool {
                let t = &self.tracks[i];
                if language_matches(t.language.as_deref().unwrap_or(""), value)
                    && matches_bandwidth(t.bandwidth.unwrap_or(0), expr.bw_min, expr.bw_max)
                    && used.insert(i)
                {
                    selected.push(i);
                    if !expr.select_all {
                        break;
                    }
                }
            }
        }

        // Nothing matched: a non-required expression falls back to the best candidate that
        // satisfies the bandwidth filter, or failing that the best of the pool.
        if selected.is_empty() && !expr.required {
            for &i in pool {
                if matches_bandwidth(self.tracks[i].bandwidth.unwrap_or(0), expr.bw_min, expr.bw_max) {
                    return vec![i];
                }
            }
            return vec![pool[0]];
        }
        selected
    }

    fn closest_resolution(&self, pool: &[usize], target: u32, expr: &TrackExpr) -> Option<usize> {
        pool.iter()
            .copied()
            .filter(|&i| {
                matches_bandwidth(self.tracks[i].bandwidth.unwrap_or(0), expr.bw_min, expr.bw_max)
            })
            .min_by_key(|&i| {
                let height = self.tracks[i].resolution.map_or(0, |r| r.height);
                (height as i64 - target as i64).abs()
            })
    }
}

// Split on top-level '+' only: a '+' inside a bandwidth range bracket belongs to the range.
fn split_expressions(selector: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_bracket = false;
    for ch in selector.chars() {
        match ch {
            '[' => {
                in_bracket = true;
                current.push(ch);
            }
            ']' => {
                in_bracket = false;
                current.push(ch);
            }
            '+' if !in_bracket => {
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Select tracks from a manifest's track list. Returns indices into `tracks` in selection
/// order, or a kind-specific error.
pub fn select_tracks(tracks: &[Track], selector: &str) -> Result<Vec<usize>> {
    if tracks.is_empty() {
        return Err(VodlError::NoTracks);
    }
    let selected = TrackSelector::new(tracks).select(selector)?;
    if selected.is_empty() {
        return Err(VodlError::SelectorEmpty(selector.to_string()));
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;

    fn video(id: &str, height: u32, bandwidth: u64) -> Track {
        Track {
            id: id.to_string(),
            kind: TrackKind::Video,
            codec: String::from("avc1.640028"),
            bandwidth: Some(bandwidth),
            resolution: Some(Resolution { width: height * 16 / 9, height }),
            ..Default::default()
        }
    }

    fn audio(id: &str, lang: &str, bandwidth: u64) -> Track {
        Track {
            id: id.to_string(),
            kind: TrackKind::Audio,
            codec: String::from("mp4a.40.2"),
            bandwidth: Some(bandwidth),
            language: if lang.is_empty() { None } else { Some(lang.to_string()) },
            ..Default::default()
        }
    }

    fn fixture() -> Vec<Track> {
        vec![
            video("v2160", 2160, 12_000_000),
            video("v1080", 1080, 5_000_000),
            video("v720", 720, 2_800_000),
            video("v690", 690, 2_000_000),
            audio("a_en", "en", 128_000),
            audio("a_eng", "eng", 96_000),
            audio("a_tr", "tr", 128_000),
        ]
    }

    fn ids(tracks: &[Track], indices: &[usize]) -> Vec<String> {
        indices.iter().map(|&i| tracks[i].id.clone()).collect()
    }

    #[test]
    fn test_best_selects_one_video_one_audio() {
        let tracks = fixture();
        let sel = select_tracks(&tracks, "best").unwrap();
        assert_eq!(ids(&tracks, &sel), vec!["v2160", "a_en"]);
        // Equivalent spellings
        assert_eq!(select_tracks(&tracks, "bv+ba").unwrap(), sel);
        assert_eq!(select_tracks(&tracks, "BEST").unwrap(), sel);
    }

    #[test]
    fn test_language_normalization_picks_first_match() {
        // "a:eng" against en/eng/tr matches the first bandwidth-sorted en-equivalent track.
        let tracks = fixture();
        let sel = select_tracks(&tracks, "a:eng").unwrap();
        assert_eq!(ids(&tracks, &sel), vec!["a_en"]);
    }

    #[test]
    fn test_required_language_not_found_fails() {
        let tracks = fixture();
        let err = select_tracks(&tracks, "a:ar!,ja!").unwrap_err();
        assert!(matches!(err, VodlError::RequiredNotFound(_)));
    }

    #[test]
    fn test_missing_language_without_required_falls_back() {
        let tracks = fixture();
        let sel = select_tracks(&tracks, "a:ar").unwrap();
        // Falls back to the best audio.
        assert_eq!(ids(&tracks, &sel), vec!["a_en"]);
    }

    #[test]
    fn test_resolution_up_to_range() {
        let tracks = fixture();
        let sel = select_tracks(&tracks, "v:-720p").unwrap();
        assert_eq!(ids(&tracks, &sel)[0], "v720");
    }

    #[test]
    fn test_resolution_closed_range_select_all() {
        let tracks = fixture();
        let sel = select_tracks(&tracks, "v:700p-1100p*").unwrap();
        assert_eq!(ids(&tracks, &sel)[..2], ["v1080", "v720"]);
    }

    #[test]
    fn test_bandwidth_range_filter() {
        let tracks = fixture();
        let sel = select_tracks(&tracks, "v:[<3M]").unwrap();
        assert_eq!(ids(&tracks, &sel)[0], "v720");
        let sel = select_tracks(&tracks, "v:[>=5M]").unwrap();
        assert_eq!(ids(&tracks, &sel)[0], "v2160");
        let sel = select_tracks(&tracks, "v:[2M-3M]*").unwrap();
        assert_eq!(ids(&tracks, &sel)[..2], ["v720", "v690"]);
    }

    #[test]
    fn test_closest_resolution_value() {
        let tracks = fixture();
        let sel = select_tracks(&tracks, "v:700p").unwrap();
        assert_eq!(ids(&tracks, &sel)[0], "v690");
    }

    #[test]
    fn test_kind_inference() {
        let tracks = fixture();
        // Resolution-shaped without kind prefix selects from the video pool.
        let sel = select_tracks(&tracks, "-1080p").unwrap();
        assert_eq!(ids(&tracks, &sel)[0], "v1080");
        // Language-shaped selects audio (plus the auto-appended nothing since no video picked).
        let sel = select_tracks(&tracks, "tr").unwrap();
        assert_eq!(ids(&tracks, &sel), vec!["a_tr"]);
    }

    #[test]
    fn test_include_undefined_modifier() {
        let mut tracks = fixture();
        tracks.push(audio("a_und", "", 64_000));
        let sel = select_tracks(&tracks, "a:tr?").unwrap();
        let got = ids(&tracks, &sel);
        assert!(got.contains(&String::from("a_tr")));
        assert!(got.contains(&String::from("a_und")));
    }

    #[test]
    fn test_all_and_legacy_paths() {
        let tracks = fixture();
        assert_eq!(select_tracks(&tracks, "all").unwrap().len(), 7);
        assert_eq!(ids(&tracks, &select_tracks(&tracks, "best-video").unwrap()), vec!["v2160"]);
        assert_eq!(ids(&tracks, &select_tracks(&tracks, "ba").unwrap()), vec!["a_en"]);
        assert_eq!(select_tracks(&tracks, "all-audio").unwrap().len(), 3);
    }

    #[test]
    fn test_video_selection_auto_appends_audio() {
        let tracks = fixture();
        let sel = select_tracks(&tracks, "v:-1080p").unwrap();
        let got = ids(&tracks, &sel);
        assert_eq!(got, vec!["v1080", "a_en"]);
    }

    #[test]
    fn test_combined_expressions_deduplicate() {
        let tracks = fixture();
        let sel = select_tracks(&tracks, "v:-1080p + a:en + a:eng").unwrap();
        let got = ids(&tracks, &sel);
        assert_eq!(got, vec!["v1080", "a_en"]);
    }

    #[test]
    fn test_empty_track_list() {
        assert!(matches!(select_tracks(&[], "best"), Err(VodlError::NoTracks)));
    }

    #[test]
    fn test_codec_value() {
        let tracks = fixture();
        let sel = select_tracks(&tracks, "a:aac").unwrap();
        assert_eq!(ids(&tracks, &sel)[0], "a_en");
    }

    #[test]
    fn test_bandwidth_parsing() {
        assert_eq!(parse_bandwidth("128k"), 128_000);
        assert_eq!(parse_bandwidth("2M"), 2_000_000);
        assert_eq!(parse_bandwidth("1g"), 1_000_000_000);
        assert_eq!(parse_bandwidth("5000000"), 5_000_000);
        assert_eq!(parse_bandwidth_range(">2m"), (2_000_000, 0));
        assert_eq!(parse_bandwidth_range("<=256k"), (0, 256_000));
        assert_eq!(parse_bandwidth_range("128k-256k"), (128_000, 256_000));
    }

    #[test]
    fn test_expression_parsing() {
        let e = parse_expression("a:en,ar!");
        assert_eq!(e.kind, Some(TrackKind::Audio));
        assert_eq!(e.values, vec!["en", "ar"]);
        assert!(e.required);

        let e = parse_expression("v:-1080p[128k-256k]");
        assert_eq!(e.kind, Some(TrackKind::Video));
        assert!(e.res_up_to);
        assert_eq!(e.res_max, 1080);
        assert_eq!((e.bw_min, e.bw_max), (128_000, 256_000));

        let e = parse_expression("video:720p-1080p*");
        assert_eq!(e.kind, Some(TrackKind::Video));
        assert_eq!((e.res_min, e.res_max), (720, 1080));
        assert!(e.select_all);

        let e = parse_expression("a:en,?");
        assert!(e.include_und);
        assert_eq!(e.values, vec!["en"]);
    }

    #[test]
    fn test_split_expressions_respects_brackets() {
        // A "+" can legitimately appear inside a bracketed bandwidth range.
        assert_eq!(split_expressions("v:-720p + a:en"), vec!["v:-720p", "a:en"]);
        assert_eq!(split_expressions("v:[1M-2M]+a:en"), vec!["v:[1M-2M]", "a:en"]);
    }
}
