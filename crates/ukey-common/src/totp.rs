//! RFC 6238 time-based one-time passwords.
//!
//! Implemented directly over HMAC so both the verification window and the
//! URI defaults stay under our control: 6 digits, 30-second period, SHA-1
//! unless the URI says otherwise, and a ±1-step skew on verification to
//! tolerate clock drift.

use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use url::Url;

/// Accepted verification skew, in periods either side of "now".
const SKEW: i64 = 1;
/// Secret length for newly generated credentials, in bytes.
const SECRET_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum TotpError {
    #[error("invalid TOTP URI scheme")]
    BadScheme,
    #[error("malformed TOTP URI: {0}")]
    BadUri(String),
    #[error("missing secret in URI")]
    MissingSecret,
    #[error("secret is not valid base32")]
    BadSecret,
}

/// Hash algorithm for the HOTP inner HMAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotpAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

/// Parsed `otpauth://totp/…` parameters.
#[derive(Debug, Clone)]
pub struct TotpConfig {
    /// Base32-encoded shared secret.
    pub secret: String,
    pub issuer: String,
    pub account: String,
    /// Step length in seconds.
    pub period: u64,
    /// Code length.
    pub digits: u32,
    pub algorithm: TotpAlgorithm,
}

/// Parse an `otpauth://totp/` URI, applying the RFC defaults for any
/// parameter the URI omits.
pub fn parse_totp_uri(uri: &str) -> Result<TotpConfig, TotpError> {
    if !uri.starts_with("otpauth://totp/") {
        return Err(TotpError::BadScheme);
    }

    let url = Url::parse(uri).map_err(|e| TotpError::BadUri(e.to_string()))?;

    let label = url.path().trim_start_matches('/');
    let label = percent_decode(label);
    let (issuer_from_label, account) = match label.split_once(':') {
        Some((issuer, account)) => (issuer.to_owned(), account.to_owned()),
        None => (String::new(), label),
    };

    let mut secret = None;
    let mut issuer = issuer_from_label;
    let mut period = 30u64;
    let mut digits = 6u32;
    let mut algorithm = TotpAlgorithm::Sha1;

    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "secret" => secret = Some(v.into_owned()),
            "issuer" => issuer = v.into_owned(),
            "period" => {
                if let Ok(p) = v.parse::<u64>() {
                    if p > 0 {
                        period = p;
                    }
                }
            }
            "digits" => {
                if v.as_ref() == "8" {
                    digits = 8;
                }
            }
            "algorithm" => {
                algorithm = match v.to_ascii_uppercase().as_str() {
                    "SHA256" => TotpAlgorithm::Sha256,
                    "SHA512" => TotpAlgorithm::Sha512,
                    _ => TotpAlgorithm::Sha1,
                }
            }
            _ => {}
        }
    }

    let secret = secret.ok_or(TotpError::MissingSecret)?;
    decode_secret(&secret)?;

    Ok(TotpConfig {
        secret,
        issuer,
        account,
        period,
        digits,
        algorithm,
    })
}

/// Generate the code for the step containing `at`.
pub fn generate_at(cfg: &TotpConfig, at: DateTime<Utc>) -> Result<String, TotpError> {
    let counter = (at.timestamp().max(0) as u64) / cfg.period;
    generate_for_counter(cfg, counter)
}

/// Verify a code against the step containing `at`, accepting ±1 step of
/// clock drift. Comparison is length-checked and digit-exact.
pub fn verify(cfg: &TotpConfig, code: &str, at: DateTime<Utc>) -> Result<bool, TotpError> {
    if code.len() != cfg.digits as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(false);
    }

    let counter = (at.timestamp().max(0) as u64) / cfg.period;
    for offset in -SKEW..=SKEW {
        let c = counter.checked_add_signed(offset).unwrap_or(0);
        if generate_for_counter(cfg, c)? == code {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Mint a fresh secret and return it as an `otpauth://totp/` URI.
pub fn generate_secret_uri(issuer: &str, account: &str) -> String {
    let mut secret_bytes = [0u8; SECRET_LEN];
    rand::rng().fill_bytes(&mut secret_bytes);
    let secret = BASE32_NOPAD.encode(&secret_bytes);

    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&period=30&digits=6&algorithm=SHA1",
        percent_encode(issuer),
        percent_encode(account),
        secret,
        percent_encode(issuer),
    )
}

fn decode_secret(secret: &str) -> Result<Vec<u8>, TotpError> {
    let normalized = secret.trim_end_matches('=').to_ascii_uppercase();
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| TotpError::BadSecret)
}

fn generate_for_counter(cfg: &TotpConfig, counter: u64) -> Result<String, TotpError> {
    let key = decode_secret(&cfg.secret)?;
    let msg = counter.to_be_bytes();

    let digest = match cfg.algorithm {
        TotpAlgorithm::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(&key).expect("HMAC accepts any key length");
            mac.update(&msg);
            mac.finalize().into_bytes().to_vec()
        }
        TotpAlgorithm::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(&key).expect("HMAC accepts any key length");
            mac.update(&msg);
            mac.finalize().into_bytes().to_vec()
        }
        TotpAlgorithm::Sha512 => {
            let mut mac =
                Hmac::<Sha512>::new_from_slice(&key).expect("HMAC accepts any key length");
            mac.update(&msg);
            mac.finalize().into_bytes().to_vec()
        }
    };

    // RFC 4226 dynamic truncation
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    let modulo = 10u32.pow(cfg.digits);
    Ok(format!(
        "{:0width$}",
        binary % modulo,
        width = cfg.digits as usize
    ))
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
