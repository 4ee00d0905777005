//! Steam Guard derivations: login codes, mobile confirmation codes and the
//! identifiers that accompany them.
//!
//! Everything here is a pure function of its inputs so the engines above can
//! pin the clock in tests.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// Alphabet used for login codes, chosen by Valve to avoid ambiguous glyphs.
const CODE_CHARS: &[u8; 26] = b"23456789BCDFGHJKMNPQRTVWXY";

/// Seconds per code window.
pub const CODE_WINDOW_SECONDS: u64 = 30;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("secret is not valid base64: {0}")]
    MalformedSecret(#[from] base64::DecodeError),
}

pub type Result<T, E = GuardError> = std::result::Result<T, E>;

fn hmac_secret(secret: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Generate the 5 character Steam Guard login code for a unix timestamp.
///
/// The code only changes every [`CODE_WINDOW_SECONDS`].
pub fn one_time_code(shared_secret: &str, timestamp: u64) -> Result<String> {
    let secret = BASE64_STANDARD.decode(shared_secret)?;
    let counter = (timestamp / CODE_WINDOW_SECONDS).to_be_bytes();
    let mac = hmac_secret(&secret, &counter);

    let begin = (mac[19] & 0xF) as usize;
    let slice: [u8; 4] = mac[begin..begin + 4].try_into().expect("4 byte window");
    let mut full = u32::from_be_bytes(slice) & 0x7FFF_FFFF;

    let mut code = String::with_capacity(5);
    for _ in 0..5 {
        code.push(CODE_CHARS[full as usize % CODE_CHARS.len()] as char);
        full /= CODE_CHARS.len() as u32;
    }
    Ok(code)
}

/// Generate the base64 confirmation key for a mobileconf operation.
///
/// `tag` is the operation being keyed: `conf`, `details`, `allow` or `cancel`.
pub fn confirmation_code(identity_secret: &str, tag: &str, timestamp: u64) -> Result<String> {
    let secret = BASE64_STANDARD.decode(identity_secret)?;
    let mut buffer = Vec::with_capacity(8 + tag.len());
    buffer.extend_from_slice(&timestamp.to_be_bytes());
    buffer.extend_from_slice(tag.as_bytes());
    Ok(BASE64_STANDARD.encode(hmac_secret(&secret, &buffer)))
}

/// Derive the `android:` device id the confirmation endpoints expect.
pub fn device_id(steam_id64: u64) -> String {
    let mut hasher = Sha1::new();
    hasher.update(steam_id64.to_string().as_bytes());
    let hash = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    format!(
        "android:{}-{}-{}-{}-{}",
        &hash[0..8],
        &hash[8..12],
        &hash[12..16],
        &hash[16..20],
        &hash[20..32]
    )
}

/// SHA-1 of a sentry blob, as submitted in the machine-auth response.
pub fn sentry_hash(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHARED_SECRET: &str = "cnNyY25yY25yY25yY25yY25yY25yY24=";
    const IDENTITY_SECRET: &str = "aWRlbnRpdHkgc2VjcmV0IDEyMzQ=";

    #[test]
    fn known_login_codes() {
        assert_eq!(one_time_code(SHARED_SECRET, 1_700_000_000).unwrap(), "X56KF");
        assert_eq!(one_time_code(SHARED_SECRET, 1_700_000_010).unwrap(), "PT2JC");
        assert_eq!(one_time_code(SHARED_SECRET, 1_700_000_040).unwrap(), "R3XWT");
    }

    #[test]
    fn code_stable_within_window() {
        let base = one_time_code(SHARED_SECRET, 1_699_999_980).unwrap();
        for offset in 0..CODE_WINDOW_SECONDS {
            assert_eq!(
                one_time_code(SHARED_SECRET, 1_699_999_980 + offset).unwrap(),
                base
            );
        }
        assert_ne!(
            one_time_code(SHARED_SECRET, 1_699_999_980 + CODE_WINDOW_SECONDS).unwrap(),
            base
        );
    }

    #[test]
    fn code_alphabet() {
        let code = one_time_code(SHARED_SECRET, 1_234_567_890).unwrap();
        assert_eq!(code.len(), 5);
        assert!(code.bytes().all(|b| CODE_CHARS.contains(&b)));
    }

    #[test]
    fn malformed_secret_is_rejected() {
        assert!(one_time_code("not base64!!", 0).is_err());
        assert!(confirmation_code("not base64!!", "conf", 0).is_err());
    }

    #[test]
    fn known_confirmation_codes() {
        assert_eq!(
            confirmation_code(IDENTITY_SECRET, "conf", 1_700_000_000).unwrap(),
            "20LTtoaV2wOPbrAfkc2udrHKMwI="
        );
        assert_eq!(
            confirmation_code(IDENTITY_SECRET, "allow", 1_700_000_000).unwrap(),
            "/hLVbYW+0cEytWd5oTLOQp5kacs="
        );
        assert_eq!(
            confirmation_code(IDENTITY_SECRET, "cancel", 1_700_000_000).unwrap(),
            "uYFcV2LEJXsLTxmHCtN6CuhUs2E="
        );
    }

    #[test]
    fn confirmation_tags_separate() {
        let allow = confirmation_code(IDENTITY_SECRET, "allow", 1_700_000_000).unwrap();
        let cancel = confirmation_code(IDENTITY_SECRET, "cancel", 1_700_000_000).unwrap();
        assert_ne!(allow, cancel);
    }

    #[test]
    fn known_device_id() {
        assert_eq!(
            device_id(76561198020145915),
            "android:e948c7eb-87fe-680e-1602-83a832c59a35"
        );
    }

    #[test]
    fn known_sentry_hash() {
        let hash = sentry_hash(b"sentry blob bytes");
        let hex = hash.iter().map(|b| format!("{b:02x}")).collect::<String>();
        assert_eq!(hex, "0d5c2a456b9637685cf885bfddae50d2af8e42a9");
    }
}
