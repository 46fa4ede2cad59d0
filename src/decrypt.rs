//! Segment decryption: strategy dispatch, whole-segment AES-128-CBC, and the key cache.
//
// Two schemes are supported. HLS playlists carry `#EXT-X-KEY` with a key URI: each segment is
// independently encrypted with AES-128-CBC and PKCS#7 padding. CENC-protected DASH content is
// encrypted per sample with AES-CTR; that path lives in the `cenc` module and is dispatched from
// here.

use std::collections::HashMap;
use std::sync::RwLock;
use aes::Aes128;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use crate::client::fetch_bytes;
use crate::{cenc, Result, VodlError};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// How a track's segments are decrypted. Resolved once by the orchestrator from the manifest's
/// encryption descriptor and the configured keys, then carried on the track; the pipeline
/// invokes [`Decryptor::apply`] rather than storing closures on data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DecryptionStrategy {
    #[default]
    None,
    /// Whole-segment AES-128-CBC with the key fetched from `key_uri`. When the playlist declared
    /// no IV, the segment sequence number provides one.
    WholeSegmentCbc {
        key_uri: String,
        iv: Option<[u8; 16]>,
    },
    /// CENC sample-level AES-CTR with an externally supplied key.
    SampleCtr {
        kid: [u8; 16],
        key: [u8; 16],
    },
}

/// Shared decryption context: one per download, used concurrently by all workers. Keys fetched
/// over HTTP are cached per URI; reads vastly outnumber the single write per key.
pub struct Decryptor {
    client: reqwest::Client,
    headers: HashMap<String, String>,
    key_cache: RwLock<HashMap<String, [u8; 16]>>,
}

impl Decryptor {
    pub fn new(client: reqwest::Client, headers: HashMap<String, String>) -> Decryptor {
        Decryptor {
            client,
            headers,
            key_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Decrypt a segment payload according to `strategy`. `init` is the track's initialization
    /// segment, required by the CTR path to locate the `tenc` box; `segment_index` provides the
    /// fallback IV for CBC. `DecryptionStrategy::None` passes the payload through unchanged.
    pub async fn apply(
        &self,
        strategy: &DecryptionStrategy,
        init: Option<&[u8]>,
        payload: Vec<u8>,
        segment_index: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        match strategy {
            DecryptionStrategy::None => Ok(payload),
            DecryptionStrategy::WholeSegmentCbc { key_uri, iv } => {
                let key = self.fetch_key(key_uri, cancel).await?;
                let iv = iv.unwrap_or_else(|| segment_iv(segment_index));
                decrypt_cbc(payload, &key, &iv)
            }
            DecryptionStrategy::SampleCtr { kid, key } => {
                cenc::decrypt_segment(init.unwrap_or_default(), payload, kid, key)
            }
        }
    }

    /// Retrieve the AES key at `key_uri`, consulting the per-URI cache first.
    pub async fn fetch_key(&self, key_uri: &str, cancel: &CancellationToken) -> Result<[u8; 16]> {
        if let Some(key) = self.key_cache.read().expect("key cache lock").get(key_uri) {
            return Ok(*key);
        }
        let bytes = fetch_bytes(&self.client, key_uri, &self.headers, None, None, cancel).await?;
        let key: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
            VodlError::BadKeyFormat(format!("key at {key_uri} is {} bytes, expected 16", bytes.len()))
        })?;
        debug!("fetched AES key from {key_uri}");
        self.key_cache
            .write()
            .expect("key cache lock")
            .insert(key_uri.to_string(), key);
        Ok(key)
    }
}

/// Decrypt one whole segment with AES-128-CBC and strip PKCS#7 padding. The ciphertext length
/// must be a multiple of the cipher block size.
pub(crate) fn decrypt_cbc(mut data: Vec<u8>, key: &[u8; 16], iv: &[u8; 16]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(data);
    }
    if data.len() % 16 != 0 {
        return Err(VodlError::BadCiphertext(format!(
            "length {} is not a multiple of the AES block size",
            data.len()
        )));
    }
    let decryptor = Aes128CbcDec::new(key.into(), iv.into());
    decryptor
        .decrypt_padded_mut::<NoPadding>(&mut data)
        .map_err(|e| VodlError::BadCiphertext(e.to_string()))?;
    strip_pkcs7(&mut data);
    Ok(data)
}

// Tolerant PKCS#7 strip: segments in the wild are sometimes encrypted without padding, so an
// implausible final byte means "no padding" rather than an error.
fn strip_pkcs7(data: &mut Vec<u8>) {
    let Some(&last) = data.last() else { return };
    let pad = last as usize;
    if pad == 0 || pad > 16 || pad > data.len() {
        return;
    }
    if data[data.len() - pad..].iter().all(|&b| b == last) {
        data.truncate(data.len() - pad);
    }
}

/// Fallback IV when the playlist declares none: the segment sequence number as a big-endian
/// 128-bit value.
pub(crate) fn segment_iv(sequence_number: i64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&(sequence_number as u64).to_be_bytes());
    iv
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut};

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let padded_len = plaintext.len() + (16 - plaintext.len() % 16);
        let mut buf = vec![0u8; padded_len];
        buf[..plaintext.len()].copy_from_slice(plaintext);
        let encryptor = Aes128CbcEnc::new(key.into(), iv.into());
        encryptor
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
            .unwrap();
        buf
    }

    #[test]
    fn test_cbc_round_trip() {
        let key = [0x42u8; 16];
        let iv = [0x13u8; 16];
        let plaintext = b"an fMP4 segment would go here; length deliberately unaligned";
        let ciphertext = encrypt(plaintext, &key, &iv);
        let decrypted = decrypt_cbc(ciphertext.clone(), &key, &iv).unwrap();
        assert_eq!(decrypted, plaintext);
        // The padding strip removes at most one block.
        assert!(ciphertext.len() - decrypted.len() <= 16);
    }

    #[test]
    fn test_cbc_rejects_unaligned_input() {
        let err = decrypt_cbc(vec![0u8; 15], &[0u8; 16], &[0u8; 16]).unwrap_err();
        assert!(matches!(err, VodlError::BadCiphertext(_)));
    }

    #[test]
    fn test_unpadded_data_passes_through() {
        // Decrypting data whose final byte is implausible as a pad length keeps every byte.
        let key = [1u8; 16];
        let iv = [2u8; 16];
        // Encrypt a full block with NoPadding so the plaintext tail is not a valid pad.
        use cbc::cipher::block_padding::NoPadding as Np;
        let mut buf = vec![0xAAu8; 32];
        buf[31] = 0x77; // 0x77 > 16, not a plausible pad
        let encryptor = Aes128CbcEnc::new((&key).into(), (&iv).into());
        encryptor.encrypt_padded_mut::<Np>(&mut buf, 32).unwrap();
        let decrypted = decrypt_cbc(buf, &key, &iv).unwrap();
        assert_eq!(decrypted.len(), 32);
        assert_eq!(decrypted[31], 0x77);
    }

    #[test]
    fn test_segment_iv_is_big_endian_sequence_number() {
        let iv = segment_iv(0x0102);
        assert_eq!(iv[14], 0x01);
        assert_eq!(iv[15], 0x02);
        assert!(iv[..14].iter().all(|&b| b == 0));
        assert_eq!(segment_iv(0), [0u8; 16]);
    }

    #[test]
    fn test_strip_pkcs7_edge_cases() {
        let mut exact = vec![4u8, 4, 4, 4];
        strip_pkcs7(&mut exact);
        assert!(exact.is_empty());

        let mut mismatched = vec![1u8, 2, 3, 4, 3];
        strip_pkcs7(&mut mismatched);
        assert_eq!(mismatched.len(), 5);

        let mut oversized = vec![0u8; 4];
        oversized[3] = 200;
        strip_pkcs7(&mut oversized);
        assert_eq!(oversized.len(), 4);
    }
}
