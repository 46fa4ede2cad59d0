//! Parsing support for DASH MPD manifests.
//
// The MPD (Media Presentation Description) is an XML document, deserialized here with serde via
// quick-xml into the subset of the schema needed for VOD downloading: Periods containing
// AdaptationSets containing Representations, addressed through SegmentTemplate (with or without
// a SegmentTimeline), SegmentList, or a bare BaseURL. Where manifests in practical use diverge
// from ISO/IEC 23009-1, we prefer to interoperate with existing practice.

use std::collections::HashMap;
use std::time::Duration;
use regex::Regex;
use serde::Deserialize;
use serde::de;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use crate::client::fetch_manifest_text;
use crate::{
    parse_byte_range, parse_xs_duration, resolve_url, Encryption, Manifest, ManifestKind,
    Resolution, Result, Segment, Track, TrackKind, VodlError,
};

// An xs:duration attribute such as mediaPresentationDuration="PT0H9M56.46S".
fn deserialize_xs_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where D: de::Deserializer<'de> {
    match <Option<String>>::deserialize(deserializer)? {
        Some(s) => parse_xs_duration(&s).map(Some).map_err(de::Error::custom),
        None => Ok(None),
    }
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct MPD {
    #[serde(rename = "@type")]
    pub mpdtype: Option<String>,
    #[serde(rename = "@mediaPresentationDuration", deserialize_with = "deserialize_xs_duration")]
    pub mediaPresentationDuration: Option<Duration>,
    #[serde(rename = "BaseURL")]
    pub base_url: Vec<BaseURL>,
    #[serde(rename = "Period")]
    pub periods: Vec<Period>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct BaseURL {
    #[serde(rename = "$text")]
    pub base: String,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Period {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@duration", deserialize_with = "deserialize_xs_duration")]
    pub duration: Option<Duration>,
    #[serde(rename = "BaseURL")]
    pub base_url: Vec<BaseURL>,
    #[serde(rename = "AdaptationSet")]
    pub adaptations: Vec<AdaptationSet>,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct AdaptationSet {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@width")]
    pub width: Option<u32>,
    #[serde(rename = "@height")]
    pub height: Option<u32>,
    #[serde(rename = "BaseURL")]
    pub base_url: Vec<BaseURL>,
    #[serde(rename = "ContentProtection")]
    pub content_protection: Vec<ContentProtection>,
    #[serde(rename = "SegmentTemplate")]
    pub SegmentTemplate: Option<SegmentTemplate>,
    #[serde(rename = "Representation")]
    pub representations: Vec<Representation>,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "@width")]
    pub width: Option<u32>,
    #[serde(rename = "@height")]
    pub height: Option<u32>,
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    #[serde(rename = "BaseURL")]
    pub base_url: Vec<BaseURL>,
    #[serde(rename = "ContentProtection")]
    pub content_protection: Vec<ContentProtection>,
    #[serde(rename = "SegmentTemplate")]
    pub SegmentTemplate: Option<SegmentTemplate>,
    #[serde(rename = "SegmentList")]
    pub SegmentList: Option<SegmentList>,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct SegmentTemplate {
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    // The spec says this is an unsigned int, but some manifests in the wild carry a floating
    // point value here.
    #[serde(rename = "@duration")]
    pub duration: Option<f64>,
    #[serde(rename = "@startNumber")]
    pub startNumber: Option<u64>,
    #[serde(rename = "SegmentTimeline")]
    pub SegmentTimeline: Option<SegmentTimeline>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct SegmentTimeline {
    #[serde(rename = "S")]
    pub segments: Vec<S>,
}

/// One entry of a SegmentTimeline: a run of `r`+1 contiguous segments of duration `d` (in
/// timescale units), starting at time `t` when specified.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct S {
    #[serde(rename = "@t")]
    pub t: Option<u64>,
    #[serde(rename = "@d")]
    pub d: u64,
    #[serde(rename = "@r")]
    pub r: Option<i64>,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct SegmentList {
    #[serde(rename = "Initialization")]
    pub Initialization: Option<Initialization>,
    #[serde(rename = "SegmentURL")]
    pub segment_urls: Vec<SegmentURL>,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Initialization {
    #[serde(rename = "@sourceURL")]
    pub sourceURL: Option<String>,
    #[serde(rename = "@range")]
    pub range: Option<String>,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct SegmentURL {
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@mediaRange", alias = "@range")]
    pub mediaRange: Option<String>,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct ContentProtection {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
    /// The DRM key identifier.
    #[serde(rename = "@cenc:default_KID", alias = "@default_KID")]
    pub default_KID: Option<String>,
}

/// Fetch and parse a DASH manifest into the normalized track model.
pub async fn parse(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<Manifest> {
    let xml = fetch_manifest_text(client, url, headers, cancel).await?;
    parse_mpd_text(&xml, url)
}

/// Parse MPD XML that has already been fetched.
pub(crate) fn parse_mpd_text(xml: &str, url: &str) -> Result<Manifest> {
    let mpd: MPD = quick_xml::de::from_str(xml)
        .map_err(|e| VodlError::Parsing(format!("MPD XML: {e}")))?;
    if mpd.mpdtype.as_deref() == Some("dynamic") {
        return Err(VodlError::UnsupportedManifest(String::from("dynamic MPD")));
    }
    let manifest_url = Url::parse(url).map_err(|e| VodlError::Parsing(format!("manifest URL: {e}")))?;
    convert_mpd(&mpd, &manifest_url)
}

fn convert_mpd(mpd: &MPD, manifest_url: &Url) -> Result<Manifest> {
    let mut tracks = Vec::new();
    let toplevel_base = resolve_base(manifest_url, &mpd.base_url);

    for period in &mpd.periods {
        let period_base = resolve_base(&toplevel_base, &period.base_url);
        // The presentation duration is specified either by the Period duration attribute or by
        // the mediaPresentationDuration of the top-level MPD node.
        let presentation_duration = period.duration.or(mpd.mediaPresentationDuration);

        for adaptation in &period.adaptations {
            let adaptation_base = resolve_base(&period_base, &adaptation.base_url);
            let kind = detect_track_kind(
                adaptation.mimeType.as_deref().unwrap_or(""),
                adaptation.contentType.as_deref().unwrap_or(""),
            );

            for (rep_position, rep) in adaptation.representations.iter().enumerate() {
                let rep_base = resolve_base(&adaptation_base, &rep.base_url);
                let encryption = protection_descriptor(adaptation, rep);
                let id = match &rep.id {
                    Some(id) => id.clone(),
                    None => format!("{kind}_{}_{rep_position}", tracks.len()),
                };
                let mut track = Track {
                    id,
                    kind,
                    bandwidth: rep.bandwidth,
                    codec: rep
                        .codecs
                        .clone()
                        .or_else(|| adaptation.codecs.clone())
                        .unwrap_or_default(),
                    language: adaptation.lang.clone(),
                    resolution: resolution_of(rep, adaptation),
                    encryption,
                    ..Default::default()
                };
                // Addressing modes, in priority order: SegmentTemplate (on the Representation or
                // inherited from the AdaptationSet), SegmentList, then a bare BaseURL for
                // non-segmented content such as a single subtitle file.
                let template = rep.SegmentTemplate.as_ref().or(adaptation.SegmentTemplate.as_ref());
                if let Some(template) = template {
                    let (segments, init) = build_segments_from_template(
                        template, rep, &rep_base, presentation_duration)?;
                    track.segments = segments;
                    track.init_segment = init;
                } else if let Some(list) = &rep.SegmentList {
                    let (segments, init) = build_segments_from_list(list, &rep_base);
                    track.segments = segments;
                    track.init_segment = init;
                } else if !rep.base_url.is_empty() {
                    track.segments = vec![Segment {
                        index: 0,
                        url: rep_base.to_string(),
                        ..Default::default()
                    }];
                }
                tracks.push(track);
            }
        }
    }
    debug!("parsed MPD with {} Periods, {} tracks", mpd.periods.len(), tracks.len());
    Ok(Manifest {
        url: manifest_url.to_string(),
        kind: ManifestKind::Dash,
        tracks,
        duration: mpd.mediaPresentationDuration,
    })
}

// The effective base URL is the outermost URL resolved sequentially against each nested BaseURL
// element. Only the first BaseURL at each level is considered (no failover).
fn resolve_base(parent: &Url, bases: &[BaseURL]) -> Url {
    match bases.first() {
        Some(b) if !b.base.is_empty() => match Url::parse(&resolve_url(parent, &b.base)) {
            Ok(u) => u,
            Err(_) => parent.clone(),
        },
        _ => parent.clone(),
    }
}

fn detect_track_kind(mime_type: &str, content_type: &str) -> TrackKind {
    let check = format!("{mime_type}{content_type}").to_lowercase();
    if check.contains("video") {
        TrackKind::Video
    } else if check.contains("audio") {
        TrackKind::Audio
    } else if check.contains("text") || check.contains("subtitle") {
        TrackKind::Subtitle
    } else {
        TrackKind::Video
    }
}

fn resolution_of(rep: &Representation, adaptation: &AdaptationSet) -> Option<Resolution> {
    let width = rep.width.or(adaptation.width).unwrap_or(0);
    let height = rep.height.or(adaptation.height).unwrap_or(0);
    if width == 0 && height == 0 {
        return None;
    }
    Some(Resolution { width, height })
}

// A protection descriptor on either level flags the track; the default KID is recorded with
// hyphens stripped so it can be compared against configured KID:KEY pairs.
fn protection_descriptor(adaptation: &AdaptationSet, rep: &Representation) -> Encryption {
    let descriptors = adaptation.content_protection.iter().chain(&rep.content_protection);
    let mut protected = false;
    let mut kid = String::new();
    for cp in descriptors {
        protected = true;
        if let Some(k) = &cp.default_KID {
            kid = k.replace('-', "").to_lowercase();
        }
    }
    if protected {
        Encryption::SampleCtr { default_kid: kid }
    } else {
        Encryption::None
    }
}

fn build_segments_from_template(
    template: &SegmentTemplate,
    rep: &Representation,
    base: &Url,
    presentation_duration: Option<Duration>,
) -> Result<(Vec<Segment>, Option<Segment>)> {
    let rid = rep.id.clone().unwrap_or_default();
    let mut params = HashMap::from([("RepresentationID", rid)]);
    if let Some(bw) = rep.bandwidth {
        params.insert("Bandwidth", bw.to_string());
    }

    let init_segment = template.initialization.as_ref().map(|init| {
        let mut p = params.clone();
        p.insert("Number", String::from("0"));
        p.insert("Time", String::from("0"));
        Segment {
            index: -1,
            url: resolve_url(base, &resolve_url_template(init, &p)),
            ..Default::default()
        }
    });

    let Some(media) = &template.media else {
        return Ok((Vec::new(), init_segment));
    };
    let timescale = template.timescale.filter(|ts| *ts > 0).unwrap_or(1);
    let start_number = template.startNumber.unwrap_or(1);
    let mut segments = Vec::new();

    if let Some(timeline) = &template.SegmentTimeline {
        let mut number = start_number;
        let mut current_time: u64 = 0;
        for s in &timeline.segments {
            if let Some(t) = s.t {
                current_time = t;
            }
            let repeat = if s.r.unwrap_or(0) < 0 { 1 } else { s.r.unwrap_or(0) + 1 };
            for _ in 0..repeat {
                let mut p = params.clone();
                p.insert("Number", number.to_string());
                p.insert("Time", current_time.to_string());
                segments.push(Segment {
                    index: segments.len() as i64,
                    url: resolve_url(base, &resolve_url_template(media, &p)),
                    duration: Some(Duration::from_secs_f64(s.d as f64 / timescale as f64)),
                    ..Default::default()
                });
                number += 1;
                current_time += s.d;
            }
        }
    } else if let Some(d) = template.duration {
        if d <= 0.0 {
            return Err(VodlError::Parsing(String::from("SegmentTemplate@duration must be positive")));
        }
        let segment_duration = d / timescale as f64;
        // Without a timeline the total count is not signalled directly; derive it from the
        // presentation duration when one is declared. The historical fallback of 100 segments
        // covers manifests that declare no duration at all.
        let count = match presentation_duration {
            Some(total) => (total.as_secs_f64() / segment_duration).ceil().max(1.0) as u64,
            None => 100,
        };
        for i in 0..count {
            let mut p = params.clone();
            p.insert("Number", (start_number + i).to_string());
            p.insert("Time", ((i as f64 * d) as u64).to_string());
            segments.push(Segment {
                index: i as i64,
                url: resolve_url(base, &resolve_url_template(media, &p)),
                duration: Some(Duration::from_secs_f64(segment_duration)),
                ..Default::default()
            });
        }
    }
    Ok((segments, init_segment))
}

fn build_segments_from_list(list: &SegmentList, base: &Url) -> (Vec<Segment>, Option<Segment>) {
    let init_segment = list.Initialization.as_ref().and_then(|init| {
        let source = init.sourceURL.as_ref()?;
        Some(Segment {
            index: -1,
            url: resolve_url(base, source),
            byte_range: init.range.as_deref().and_then(|r| parse_byte_range(r, None)),
            ..Default::default()
        })
    });
    let segments = list
        .segment_urls
        .iter()
        .enumerate()
        .filter_map(|(i, su)| {
            let media = su.media.as_ref()?;
            Some(Segment {
                index: i as i64,
                url: resolve_url(base, media),
                byte_range: su.mediaRange.as_deref().and_then(|r| parse_byte_range(r, None)),
                ..Default::default()
            })
        })
        .collect();
    (segments, init_segment)
}

// From DASH-IF-IOP: only the $RepresentationID$, $Number$, $Time$ and $Bandwidth$ identifiers
// are substituted, plus the $Number%0Nd$ width-formatted variant. Reimplemented directly rather
// than pulling in a printf-compatible formatter.
fn resolve_url_template(template: &str, params: &HashMap<&str, String>) -> String {
    let mut result = template.to_string();
    for k in ["RepresentationID", "Number", "Time", "Bandwidth"] {
        let ident = format!("${k}$");
        if result.contains(&ident) {
            if let Some(value) = params.get(k) {
                result = result.replace(&ident, value);
            }
        }
        let re = Regex::new(&format!(r"\${k}%0(\d+)d\$")).unwrap();
        if let Some(cap) = re.captures(&result) {
            if let Some(value) = params.get(k) {
                let width: usize = cap[1].parse().unwrap();
                let padded = format!("{value:0>width$}");
                let m = re.find(&result).unwrap();
                result = result[..m.start()].to_owned() + &padded + &result[m.end()..];
            }
        }
    }
    result
}
