//! Transport and at-rest crypto primitives.
//!
//! Three layers, deliberately kept separate:
//!
//! - **Session establishment** — ephemeral ECDH over P-256; the SHA-256 of
//!   the shared secret becomes the AES-256 session key.
//! - **In-flight sealing** — AES-256-GCM with a fresh 12-byte nonce per
//!   message. Authenticated; a flipped bit fails open().
//! - **At-rest sealing** — AES-256-CBC with PKCS7 for client key files
//!   (`iv(16) ‖ ciphertext`). Unauthenticated by design of the file format;
//!   padding errors are rejected.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use aes_gcm::aead::rand_core::RngCore as AeadRngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::rand_core::OsRng as EcOsRng;
use p256::PublicKey;
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// AES block size (CBC IV length).
const BLOCK_LEN: usize = 16;
/// Session/once/API key length in bytes.
const KEY_LEN: usize = 32;

/// Errors from the crypto primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("peer public key is not valid base64")]
    BadPeerEncoding,
    #[error("peer public key is not a valid P-256 point")]
    BadPeerKey,
    #[error("payload is not valid base64")]
    BadPayloadEncoding,
    #[error("nonce has wrong length: expected {NONCE_LEN} bytes")]
    BadNonce,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("ciphertext too short")]
    CiphertextTooShort,
    #[error("invalid padding")]
    BadPadding,
}

// ============================================================
// ECDH session establishment
// ============================================================

/// Server half of an ECDH P-256 key agreement.
pub struct EcdhKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EcdhKeyPair {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut EcOsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// This side's public key as base64 SEC1 bytes, ready for the wire.
    pub fn public_key_base64(&self) -> String {
        B64.encode(self.public.to_sec1_bytes())
    }

    /// Derive the 32-byte session key from the peer's base64 public key.
    ///
    /// The raw ECDH shared secret is hashed with SHA-256 so the session key
    /// is uniformly distributed regardless of point encoding.
    pub fn compute_shared(&self, peer_pub_base64: &str) -> Result<[u8; KEY_LEN], CryptoError> {
        let peer_bytes = B64
            .decode(peer_pub_base64)
            .map_err(|_| CryptoError::BadPeerEncoding)?;
        let peer = PublicKey::from_sec1_bytes(&peer_bytes).map_err(|_| CryptoError::BadPeerKey)?;
        let shared = self.secret.diffie_hellman(&peer);

        let mut hasher = Sha256::new();
        hasher.update(shared.raw_secret_bytes());
        Ok(hasher.finalize().into())
    }
}

// ============================================================
// In-flight sealing (AES-256-GCM)
// ============================================================

/// Symmetric sealer/opener installed on a connection after the handshake.
#[derive(Clone)]
pub struct Encryptor {
    key: [u8; KEY_LEN],
}

impl Encryptor {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Seal a plaintext, returning base64 `(ciphertext, nonce)`.
    pub fn seal(&self, plain: &[u8]) -> Result<(String, String), CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, plain)
            .map_err(|_| CryptoError::EncryptFailed)?;

        Ok((B64.encode(sealed), B64.encode(nonce_bytes)))
    }

    /// Open a base64 `(ciphertext, nonce)` pair back into plaintext.
    pub fn open(&self, payload_b64: &str, nonce_b64: &str) -> Result<Vec<u8>, CryptoError> {
        let sealed = B64
            .decode(payload_b64)
            .map_err(|_| CryptoError::BadPayloadEncoding)?;
        let nonce_bytes = B64
            .decode(nonce_b64)
            .map_err(|_| CryptoError::BadPayloadEncoding)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::BadNonce);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_ref())
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

// ============================================================
// At-rest sealing (AES-256-CBC + PKCS7)
// ============================================================

/// Seal data for at-rest storage: `iv(16) ‖ AES-256-CBC(PKCS7(plain))`.
pub fn seal_cbc(key: &[u8; KEY_LEN], plain: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; BLOCK_LEN];
    rand::rng().fill_bytes(&mut iv);

    let cipher_text =
        Aes256CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain);

    let mut out = Vec::with_capacity(BLOCK_LEN + cipher_text.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&cipher_text);
    out
}

/// Open an at-rest blob produced by [`seal_cbc`]. Fails on truncated input,
/// misaligned ciphertext, or wrong PKCS7 padding.
pub fn open_cbc(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < BLOCK_LEN * 2 {
        return Err(CryptoError::CiphertextTooShort);
    }
    let (iv, cipher_text) = data.split_at(BLOCK_LEN);
    if cipher_text.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::CiphertextTooShort);
    }

    let iv: [u8; BLOCK_LEN] = iv.try_into().expect("split_at guarantees length");
    Aes256CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(cipher_text)
        .map_err(|_| CryptoError::BadPadding)
}

// ============================================================
// Signatures & key material
// ============================================================

/// HMAC-SHA256 over `msg`, hex-encoded lowercase.
pub fn hmac_sha256_hex(key: &[u8], msg: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    hex::encode(mac.finalize().into_bytes())
}

/// Generate a fresh rolling credential: 32 random bytes, lowercase hex.
pub fn generate_once_key() -> String {
    let mut bytes = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a high-entropy API key: 32 random bytes, lowercase hex.
pub fn generate_api_key() -> String {
    generate_once_key()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_both_sides_agree() {
        let server = EcdhKeyPair::generate();
        let client = EcdhKeyPair::generate();

        let k1 = server.compute_shared(&client.public_key_base64()).unwrap();
        let k2 = client.compute_shared(&server.public_key_base64()).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn ecdh_rejects_garbage_peer() {
        let server = EcdhKeyPair::generate();
        assert!(server.compute_shared("not base64 !!!").is_err());
        assert!(server.compute_shared(&B64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn gcm_roundtrip() {
        let enc = Encryptor::new([7u8; 32]);
        let (payload, nonce) = enc.seal(b"hello device").unwrap();
        let plain = enc.open(&payload, &nonce).unwrap();
        assert_eq!(plain, b"hello device");
    }

    #[test]
    fn gcm_detects_tampering() {
        let enc = Encryptor::new([7u8; 32]);
        let (payload, nonce) = enc.seal(b"hello device").unwrap();

        let mut raw = B64.decode(&payload).unwrap();
        raw[0] ^= 0xff;
        assert!(enc.open(&B64.encode(raw), &nonce).is_err());
    }

    #[test]
    fn gcm_rejects_wrong_key() {
        let enc = Encryptor::new([7u8; 32]);
        let other = Encryptor::new([8u8; 32]);
        let (payload, nonce) = enc.seal(b"secret").unwrap();
        assert!(other.open(&payload, &nonce).is_err());
    }

    #[test]
    fn cbc_roundtrip() {
        let key = [3u8; 32];
        let sealed = seal_cbc(&key, b"totp secret payload");
        assert_eq!(sealed.len() % 16, 0);
        assert_eq!(open_cbc(&key, &sealed).unwrap(), b"totp secret payload");
    }

    #[test]
    fn cbc_rejects_wrong_key_padding() {
        let sealed = seal_cbc(&[3u8; 32], b"totp secret payload");
        // Wrong key produces garbage padding virtually always
        assert!(open_cbc(&[4u8; 32], &sealed).is_err());
    }

    #[test]
    fn cbc_rejects_truncated_input() {
        assert!(matches!(
            open_cbc(&[0u8; 32], &[0u8; 8]),
            Err(CryptoError::CiphertextTooShort)
        ));
    }

    #[test]
    fn hmac_is_deterministic() {
        let a = hmac_sha256_hex(b"secret", b"payload");
        let b = hmac_sha256_hex(b"secret", b"payload");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hmac_sha256_hex(b"other", b"payload"));
    }

    #[test]
    fn once_keys_are_64_hex_chars() {
        let key = generate_once_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, generate_once_key());
    }
}
