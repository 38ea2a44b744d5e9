use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

/// AES-256 key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;
/// GCM nonce size (96 bits / 12 bytes).
pub const GCM_IV_SIZE: usize = 12;
/// GCM authentication tag size (128 bits / 16 bytes).
pub const GCM_TAG_SIZE: usize = 16;

/// PBKDF2-HMAC-SHA256 iteration count used when saving a database.
///
/// Debug builds use a small count so the test suite stays fast; release
/// builds pay the full cost once per load/save.
#[cfg(debug_assertions)]
pub const PBKDF2_ITERATIONS: u32 = 2048;
#[cfg(not(debug_assertions))]
pub const PBKDF2_ITERATIONS: u32 = 600_000;

/// Length of a canonical ASCII UUID ("8-4-4-4-12").
pub const ASCII_UUID_LEN: usize = 36;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// GCM tag mismatch: wrong key or tampered ciphertext.
    #[error("authentication failed")]
    AuthFailure,
    #[error("encryption failed")]
    SealFailure,
}

/// Fill `out` with CSPRNG output.
///
/// A failing OS RNG aborts the process; there is no meaningful way to
/// continue generating key material without it.
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

/// Generate a fresh 256-bit secret (TLS PSK or raw LUKS passphrase).
pub fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    random_bytes(&mut key);
    key
}

/// Derive a 256-bit key from a passphrase via PBKDF2-HMAC-SHA256.
pub fn derive_key(passphrase: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, key.as_mut());
    key
}

/// Encrypt with AES-256-GCM. Returns `(ciphertext, tag)` separately, matching
/// the on-disk database record layout.
pub fn aead_seal(
    key: &[u8; KEY_SIZE],
    iv: &[u8; GCM_IV_SIZE],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; GCM_TAG_SIZE]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::SealFailure)?;
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| CryptoError::SealFailure)?;

    let tag_offset = sealed.len() - GCM_TAG_SIZE;
    let mut tag = [0u8; GCM_TAG_SIZE];
    tag.copy_from_slice(&sealed[tag_offset..]);
    sealed.truncate(tag_offset);
    Ok((sealed, tag))
}

/// Decrypt and authenticate AES-256-GCM. Any tag mismatch (wrong passphrase
/// or tampered file) surfaces as `AuthFailure`.
pub fn aead_open(
    key: &[u8; KEY_SIZE],
    iv: &[u8; GCM_IV_SIZE],
    ciphertext: &[u8],
    tag: &[u8; GCM_TAG_SIZE],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AuthFailure)?;
    let mut sealed = Vec::with_capacity(ciphertext.len() + GCM_TAG_SIZE);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(iv), sealed.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::AuthFailure)
}

/// Transcribe a raw 256-bit secret into the printable passphrase form handed
/// to cryptsetup: base64-url without padding, 43 characters, no whitespace.
pub fn ascii_encode(raw: &[u8]) -> Zeroizing<String> {
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    Zeroizing::new(URL_SAFE_NO_PAD.encode(raw))
}

/// Constant-time equality; `false` on length mismatch.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Format a binary UUID in canonical lowercase 8-4-4-4-12 form.
pub fn format_uuid(uuid: &Uuid) -> String {
    uuid.hyphenated().to_string()
}

/// Parse a UUID, accepting only the canonical 36-character hyphenated form.
///
/// `Uuid::parse_str` also accepts braced, URN and simple forms; the TLS-PSK
/// identity and all user input must be the canonical form, nothing else.
pub fn parse_uuid(s: &str) -> Option<Uuid> {
    if !is_valid_uuid(s) {
        return None;
    }
    Uuid::parse_str(s).ok()
}

/// Check for canonical 8-4-4-4-12 UUID form: hyphens at positions 8, 13, 18
/// and 23, hex digits everywhere else.
pub fn is_valid_uuid(s: &str) -> bool {
    if s.len() != ASCII_UUID_LEN || !s.is_ascii() {
        return false;
    }
    s.bytes().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        key
    }

    #[test]
    fn test_random_bytes_nonzero() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        random_bytes(&mut a);
        random_bytes(&mut b);
        assert_ne!(a, [0u8; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_key_deterministic() {
        let salt = [7u8; 16];
        let a = derive_key(b"passphrase", &salt, 1000);
        let b = derive_key(b"passphrase", &salt, 1000);
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_derive_key_sensitive_to_inputs() {
        let salt = [7u8; 16];
        let base = derive_key(b"passphrase", &salt, 1000);
        assert_ne!(*base, *derive_key(b"Passphrase", &salt, 1000));
        assert_ne!(*base, *derive_key(b"passphrase", &[8u8; 16], 1000));
        assert_ne!(*base, *derive_key(b"passphrase", &salt, 1001));
    }

    #[test]
    fn test_aead_roundtrip() {
        let key = test_key();
        let iv = [3u8; GCM_IV_SIZE];
        let (ct, tag) = aead_seal(&key, &iv, b"secret payload").unwrap();
        assert_ne!(&ct[..], b"secret payload");
        let pt = aead_open(&key, &iv, &ct, &tag).unwrap();
        assert_eq!(&pt[..], b"secret payload");
    }

    #[test]
    fn test_aead_tamper_fails() {
        let key = test_key();
        let iv = [3u8; GCM_IV_SIZE];
        let (mut ct, tag) = aead_seal(&key, &iv, b"secret payload").unwrap();
        ct[0] ^= 0x01;
        assert_eq!(
            aead_open(&key, &iv, &ct, &tag).unwrap_err(),
            CryptoError::AuthFailure
        );
    }

    #[test]
    fn test_aead_wrong_key_fails() {
        let key = test_key();
        let mut wrong = test_key();
        wrong[0] ^= 0xff;
        let iv = [3u8; GCM_IV_SIZE];
        let (ct, tag) = aead_seal(&key, &iv, b"secret payload").unwrap();
        assert!(aead_open(&wrong, &iv, &ct, &tag).is_err());
    }

    #[test]
    fn test_aead_tag_tamper_fails() {
        let key = test_key();
        let iv = [3u8; GCM_IV_SIZE];
        let (ct, mut tag) = aead_seal(&key, &iv, b"secret payload").unwrap();
        tag[15] ^= 0x80;
        assert!(aead_open(&key, &iv, &ct, &tag).is_err());
    }

    #[test]
    fn test_ascii_encode_shape() {
        let text = ascii_encode(&[0x42u8; 32]);
        // 32 bytes -> ceil(256 / 6) = 43 base64 characters, fits the 46-byte
        // passphrase buffer with NUL to spare.
        assert_eq!(text.len(), 43);
        assert!(
            text.chars()
                .all(|c| c.is_ascii_graphic() && !c.is_whitespace())
        );
    }

    #[test]
    fn test_ascii_encode_deterministic_and_injective() {
        let a = ascii_encode(&[0x42u8; 32]);
        assert_eq!(*a, *ascii_encode(&[0x42u8; 32]));

        let mut raw = [0x42u8; 32];
        for i in 0..raw.len() {
            raw[i] ^= 0x01;
            assert_ne!(*a, *ascii_encode(&raw));
            raw[i] ^= 0x01;
        }
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abcd", b"abcd"));
        assert!(!ct_eq(b"abcd", b"abce"));
        assert!(!ct_eq(b"abcd", b"abc"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn test_uuid_roundtrip() {
        let uuid = Uuid::new_v4();
        let text = format_uuid(&uuid);
        assert_eq!(parse_uuid(&text), Some(uuid));
    }

    #[test]
    fn test_uuid_canonical_form_enforced() {
        assert!(is_valid_uuid("3f2504e0-4f89-11d3-9a0c-0305e82c3301"));
        assert!(is_valid_uuid("3F2504E0-4F89-11D3-9A0C-0305E82C3301"));
        // Non-canonical forms the uuid crate would otherwise accept.
        assert!(parse_uuid("3f2504e04f8911d39a0c0305e82c3301").is_none());
        assert!(parse_uuid("{3f2504e0-4f89-11d3-9a0c-0305e82c3301}").is_none());
        assert!(parse_uuid("urn:uuid:3f2504e0-4f89-11d3-9a0c-0305e82c3301").is_none());
    }

    #[test]
    fn test_uuid_rejects_mutations() {
        let canonical = "3f2504e0-4f89-11d3-9a0c-0305e82c3301";
        // Truncation, extension, broken hyphen, non-hex digit.
        assert!(!is_valid_uuid(&canonical[..35]));
        assert!(!is_valid_uuid(&format!("{canonical}0")));
        let mut broken = canonical.to_string();
        broken.replace_range(8..9, "0");
        assert!(!is_valid_uuid(&broken));
        let mut nonhex = canonical.to_string();
        nonhex.replace_range(0..1, "g");
        assert!(!is_valid_uuid(&nonhex));
    }
}
