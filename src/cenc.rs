//! CENC sample-level decryption driven by the ISO base media file format box structure.
//
// We parse just enough of ISO/IEC 14496-12 to decrypt: the `tenc` box inside the initialization
// segment (default protection flag, per-sample IV size, default KID, optional constant IV), and
// per media segment the `moof/traf/trun` sample sizes, the `moof/traf/senc` per-sample IVs with
// optional sub-sample partitions, and the `mdat` payload. Boxes are length-prefixed: a 4-byte
// big-endian size (1 = 64-bit size follows the type) and a 4-character type code.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use tracing::{debug, trace};
use crate::{Result, VodlError};

type Aes128Ctr = Ctr128BE<Aes128>;

#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    kind: [u8; 4],
    /// Offset of the box payload relative to the box start (8, or 16 with a 64-bit size).
    header_len: usize,
    /// Total box size including the header.
    total_len: usize,
}

// Read the box header at `offset`. Returns None at end of data or on a malformed size field.
fn read_box(data: &[u8], offset: usize) -> Option<BoxHeader> {
    let rest = data.get(offset..)?;
    if rest.len() < 8 {
        return None;
    }
    let size32 = u32::from_be_bytes(rest[..4].try_into().unwrap());
    let kind: [u8; 4] = rest[4..8].try_into().unwrap();
    let (header_len, total_len) = match size32 {
        0 => (8, rest.len()), // box extends to the end of the enclosing container
        1 => {
            if rest.len() < 16 {
                return None;
            }
            let size64 = u64::from_be_bytes(rest[8..16].try_into().unwrap());
            (16, size64 as usize)
        }
        n => (8, n as usize),
    };
    if total_len < header_len || total_len > rest.len() {
        return None;
    }
    Some(BoxHeader { kind, header_len, total_len })
}

// Iterate sibling boxes within `data`, yielding (payload offset, header).
fn boxes(data: &[u8]) -> impl Iterator<Item = (usize, BoxHeader)> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        let header = read_box(data, offset)?;
        let at = offset;
        offset += header.total_len;
        Some((at, header))
    })
}

fn find_child<'a>(data: &'a [u8], kind: &[u8; 4]) -> Option<&'a [u8]> {
    boxes(data).find_map(|(at, h)| {
        (&h.kind == kind).then(|| &data[at + h.header_len..at + h.total_len])
    })
}

/// Default encryption parameters from the `tenc` (track encryption) box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TencInfo {
    pub is_protected: bool,
    pub per_sample_iv_size: u8,
    pub default_kid: [u8; 16],
    pub constant_iv: Option<Vec<u8>>,
}

// Locate the track encryption description in an init segment:
// moov/trak/mdia/minf/stbl/stsd/<sample entry>/sinf/schi/tenc.
pub(crate) fn extract_tenc(init: &[u8]) -> Option<TencInfo> {
    let moov = find_child(init, b"moov")?;
    for (at, h) in boxes(moov) {
        if &h.kind != b"trak" {
            continue;
        }
        let trak = &moov[at + h.header_len..at + h.total_len];
        let stsd = find_child(trak, b"mdia")
            .and_then(|mdia| find_child(mdia, b"minf"))
            .and_then(|minf| find_child(minf, b"stbl"))
            .and_then(|stbl| find_child(stbl, b"stsd"));
        let Some(stsd) = stsd else { continue };
        if stsd.len() < 8 {
            continue;
        }
        // stsd is a FullBox: 4 bytes version/flags, 4 bytes entry count, then sample entries.
        let entries = &stsd[8..];
        for (at, h) in boxes(entries) {
            let entry = &entries[at..at + h.total_len];
            if let Some(tenc) = tenc_of_sample_entry(entry, &h.kind) {
                return Some(tenc);
            }
        }
    }
    None
}

// Children of a sample entry begin after its type-specific fixed fields: 78 bytes for visual
// entries, 28 for audio entries (both counted from the end of the 8-byte box header).
fn tenc_of_sample_entry(entry: &[u8], kind: &[u8; 4]) -> Option<TencInfo> {
    const VISUAL: &[&[u8; 4]] = &[b"encv", b"avc1", b"avc3", b"hvc1", b"hev1", b"vp09", b"av01"];
    const AUDIO: &[&[u8; 4]] = &[b"enca", b"mp4a", b"ac-3", b"ec-3", b"opus", b"fLaC"];
    let offsets: &[usize] = if VISUAL.contains(&kind) {
        &[8 + 78]
    } else if AUDIO.contains(&kind) {
        &[8 + 28]
    } else {
        // Unknown entry type: try both layouts.
        &[8 + 78, 8 + 28]
    };
    for &children_at in offsets {
        if children_at > entry.len() {
            continue;
        }
        let tenc = find_child(&entry[children_at..], b"sinf")
            .and_then(|sinf| find_child(sinf, b"schi"))
            .and_then(|schi| find_child(schi, b"tenc"))
            .and_then(parse_tenc);
        if tenc.is_some() {
            return tenc;
        }
    }
    None
}

// tenc payload: version(1) flags(3) reserved(1) reserved-or-pattern(1) isProtected(1)
// perSampleIVSize(1) KID(16) [constantIVSize(1) constantIV(n)].
fn parse_tenc(payload: &[u8]) -> Option<TencInfo> {
    if payload.len() < 24 {
        return None;
    }
    let is_protected = payload[6] != 0;
    let per_sample_iv_size = payload[7];
    let default_kid: [u8; 16] = payload[8..24].try_into().unwrap();
    let mut constant_iv = None;
    if is_protected && per_sample_iv_size == 0 && payload.len() > 24 {
        let n = payload[24] as usize;
        if payload.len() >= 25 + n {
            constant_iv = Some(payload[25..25 + n].to_vec());
        }
    }
    Some(TencInfo { is_protected, per_sample_iv_size, default_kid, constant_iv })
}

#[derive(Debug, Default)]
struct SampleLayout {
    /// Per-sample sizes from `trun`.
    sizes: Vec<u32>,
    /// Per-sample IVs from `senc`.
    ivs: Vec<Vec<u8>>,
    /// Per-sample sub-sample partitions from `senc` (empty when full-sample encryption).
    subsamples: Vec<Vec<SubSample>>,
}

#[derive(Debug, Clone, Copy)]
struct SubSample {
    clear_bytes: u16,
    protected_bytes: u32,
}

// Walk moof/traf for the last trun and senc boxes. Multiple trafs are not expected in the
// single-track fragments we download; the last one found wins.
fn parse_moof(moof_payload: &[u8], default_iv_size: u8) -> SampleLayout {
    let mut layout = SampleLayout::default();
    for (at, h) in boxes(moof_payload) {
        if &h.kind != b"traf" {
            continue;
        }
        let traf = &moof_payload[at + h.header_len..at + h.total_len];
        for (tat, th) in boxes(traf) {
            let payload = &traf[tat + th.header_len..tat + th.total_len];
            match &th.kind {
                b"trun" => layout.sizes = parse_trun(payload),
                b"senc" => {
                    let (ivs, subsamples) = parse_senc(payload, default_iv_size);
                    layout.ivs = ivs;
                    layout.subsamples = subsamples;
                }
                _ => {}
            }
        }
    }
    layout
}

// trun payload: version(1) flags(3) sample_count(4), then optional data-offset and
// first-sample-flags, then per sample the fields selected by the flag bits. Only the sample
// size (bit 0x200) is retained; the other per-sample fields are skipped.
fn parse_trun(payload: &[u8]) -> Vec<u32> {
    if payload.len() < 8 {
        return Vec::new();
    }
    let flags = u32::from_be_bytes(payload[..4].try_into().unwrap()) & 0x00ff_ffff;
    let sample_count = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    let mut offset = 8;
    if flags & 0x001 != 0 {
        offset += 4; // data offset
    }
    if flags & 0x004 != 0 {
        offset += 4; // first sample flags
    }
    let mut sizes = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        if offset >= payload.len() {
            break;
        }
        let mut size = 0u32;
        if flags & 0x100 != 0 {
            offset += 4; // duration
        }
        if flags & 0x200 != 0 {
            if offset + 4 <= payload.len() {
                size = u32::from_be_bytes(payload[offset..offset + 4].try_into().unwrap());
            }
            offset += 4;
        }
        if flags & 0x400 != 0 {
            offset += 4; // sample flags
        }
        if flags & 0x800 != 0 {
            offset += 4; // composition time offset
        }
        sizes.push(size);
    }
    sizes
}

// senc payload: version(1) flags(3) sample_count(4), then per sample an IV of the tenc-declared
// size (8 when the tenc declares zero) and, when flag 0x2 is set, a 16-bit sub-sample count
// followed by (16-bit clear, 32-bit protected) pairs.
fn parse_senc(payload: &[u8], default_iv_size: u8) -> (Vec<Vec<u8>>, Vec<Vec<SubSample>>) {
    let mut ivs = Vec::new();
    let mut subsamples = Vec::new();
    if payload.len() < 8 {
        return (ivs, subsamples);
    }
    let flags = u32::from_be_bytes(payload[..4].try_into().unwrap()) & 0x00ff_ffff;
    let sample_count = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    let has_subsamples = flags & 0x2 != 0;
    let iv_size = if default_iv_size == 0 { 8 } else { default_iv_size as usize };

    let mut offset = 8;
    for _ in 0..sample_count {
        if offset + iv_size > payload.len() {
            break;
        }
        ivs.push(payload[offset..offset + iv_size].to_vec());
        offset += iv_size;

        let mut subs = Vec::new();
        if has_subsamples && offset + 2 <= payload.len() {
            let count = u16::from_be_bytes(payload[offset..offset + 2].try_into().unwrap());
            offset += 2;
            for _ in 0..count {
                if offset + 6 > payload.len() {
                    break;
                }
                subs.push(SubSample {
                    clear_bytes: u16::from_be_bytes(payload[offset..offset + 2].try_into().unwrap()),
                    protected_bytes: u32::from_be_bytes(
                        payload[offset + 2..offset + 6].try_into().unwrap(),
                    ),
                });
                offset += 6;
            }
        }
        subsamples.push(subs);
    }
    (ivs, subsamples)
}

/// Where the media section begins in combined init+media data: the offset of the first `styp`,
/// `moof`, `sidx` or `emsg` box occurring after the `moov` box.
pub(crate) fn split_point(data: &[u8]) -> Option<usize> {
    let mut moov_seen = false;
    for (at, h) in boxes(data) {
        if &h.kind == b"moov" {
            moov_seen = true;
            continue;
        }
        if moov_seen && matches!(&h.kind, b"styp" | b"moof" | b"sidx" | b"emsg") {
            return Some(at);
        }
    }
    None
}

// Advance a CTR counter by `blocks`: big-endian addition over the full 16 bytes, carrying
// through every byte.
fn increment_iv(iv: &mut [u8; 16], blocks: u64) {
    let v = u128::from_be_bytes(*iv).wrapping_add(blocks as u128);
    *iv = v.to_be_bytes();
}

// Decrypt one sample in place. Without a sub-sample partition the whole sample is one CTR
// stream; with one, clear runs are skipped and each protected run is decrypted with the current
// counter, which then advances by the number of AES blocks the run covered.
fn decrypt_sample(sample: &mut [u8], iv: &[u8; 16], subsamples: &[SubSample], key: &[u8; 16]) {
    if sample.is_empty() {
        return;
    }
    let mut counter = *iv;
    if subsamples.is_empty() {
        let mut cipher = Aes128Ctr::new(key.into(), (&counter).into());
        cipher.apply_keystream(sample);
        return;
    }
    let mut offset = 0usize;
    for sub in subsamples {
        offset += sub.clear_bytes as usize;
        let protected = sub.protected_bytes as usize;
        if offset + protected > sample.len() {
            break;
        }
        let mut cipher = Aes128Ctr::new(key.into(), (&counter).into());
        cipher.apply_keystream(&mut sample[offset..offset + protected]);
        increment_iv(&mut counter, protected.div_ceil(16) as u64);
        offset += protected;
    }
}

/// Decrypt a CENC-protected media segment. `init` is the track's initialization segment (it may
/// also carry leading media boxes; everything before the split point is treated as init).
/// Returns the decrypted media bytes. Segments whose init carries no `tenc` box, or which carry
/// no `moof`/`mdat` pair, are passed through unchanged.
pub(crate) fn decrypt_segment(
    init: &[u8],
    media: Vec<u8>,
    kid: &[u8; 16],
    key: &[u8; 16],
) -> Result<Vec<u8>> {
    let Some(tenc) = extract_tenc(init) else {
        trace!("no tenc box in init segment, passing media through");
        return Ok(media);
    };
    if tenc.default_kid != [0u8; 16] && tenc.default_kid != *kid {
        return Err(VodlError::KidMismatch);
    }
    decrypt_media(media, &tenc, key)
}

/// Decrypt combined init+media data, as assembled by concatenating the initialization segment
/// and one media segment. The output is the init bytes followed by the decrypted media bytes.
pub fn decrypt_combined(
    combined: Vec<u8>,
    kid: &[u8; 16],
    key: &[u8; 16],
) -> Result<Vec<u8>> {
    let Some(split) = split_point(&combined) else {
        return Err(VodlError::BadCiphertext(String::from(
            "no media segment found in combined data",
        )));
    };
    let mut combined = combined;
    let media = combined.split_off(split);
    let mut out = combined;
    let decrypted = decrypt_segment(&out, media, kid, key)?;
    out.extend_from_slice(&decrypted);
    Ok(out)
}

fn decrypt_media(mut media: Vec<u8>, tenc: &TencInfo, key: &[u8; 16]) -> Result<Vec<u8>> {
    // Locate moof and mdat among the top-level boxes of the media section.
    let mut moof: Option<(usize, BoxHeader)> = None;
    let mut mdat: Option<(usize, BoxHeader)> = None;
    for (at, h) in boxes(&media) {
        match &h.kind {
            b"moof" => moof = Some((at, h)),
            b"mdat" => mdat = Some((at, h)),
            _ => {}
        }
    }
    let (Some((moof_at, moof_h)), Some((mdat_at, mdat_h))) = (moof, mdat) else {
        trace!("media section has no moof/mdat pair, passing through");
        return Ok(media);
    };

    let layout = parse_moof(
        &media[moof_at + moof_h.header_len..moof_at + moof_h.total_len],
        tenc.per_sample_iv_size,
    );
    if layout.ivs.is_empty() && tenc.constant_iv.is_none() {
        return Ok(media);
    }

    let mdat_start = mdat_at + mdat_h.header_len;
    let mdat_end = mdat_at + mdat_h.total_len;
    let mut sample_offset = 0usize;
    for (i, &size) in layout.sizes.iter().enumerate() {
        let size = size as usize;
        if mdat_start + sample_offset + size > mdat_end {
            break;
        }
        let iv_bytes = layout
            .ivs
            .get(i)
            .filter(|iv| !iv.is_empty())
            .cloned()
            .or_else(|| tenc.constant_iv.clone());
        let Some(iv_bytes) = iv_bytes else {
            sample_offset += size;
            continue;
        };
        // An 8-byte IV is right-extended with zeros to the full AES block.
        let mut iv = [0u8; 16];
        let n = iv_bytes.len().min(16);
        iv[..n].copy_from_slice(&iv_bytes[..n]);

        let no_subs = Vec::new();
        let subs = layout.subsamples.get(i).unwrap_or(&no_subs);
        let sample = &mut media[mdat_start + sample_offset..mdat_start + sample_offset + size];
        decrypt_sample(sample, &iv, subs, key);
        sample_offset += size;
    }
    debug!("decrypted {} samples", layout.sizes.len());
    Ok(media)
}
