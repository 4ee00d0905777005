//! Credential handling: RSA password wrap, guard codes, the machine-auth
//! challenge and web-session minting.

mod sentry;
mod web;

use crate::session::{ConnectionError, LoginError, LogonDetails};
use crate::web::{WebClient, COMMUNITY_HOST};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use num_bigint_dig::BigUint;
use num_traits::Num;
use rsa::RsaPublicKey;
use serde::Deserialize;
pub use sentry::{FileSentryStore, NullSentryStore, SentryStore, SentryStoreError};
use std::time::{SystemTime, UNIX_EPOCH};
use steam_flue_crypto::{encrypt_with_key_pkcs1, guard};
use tracing::{debug, instrument};
pub(crate) use web::mint_web_session;
pub use web::WebSession;

/// Login material for one account.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub account: String,
    pub password: String,
    /// Base64 shared secret from the mobile authenticator; enables automatic
    /// TOTP codes.
    pub shared_secret: Option<String>,
    /// Email Steam-Guard code, supplied after a login failed with
    /// [`LoginError::EmailCodeRequired`](crate::session::LoginError).
    pub email_code: Option<String>,
    pub machine_name: String,
}

impl Credentials {
    pub fn new(account: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            account: account.into(),
            password: password.into(),
            shared_secret: None,
            email_code: None,
            machine_name: format!("FLUE-{}", std::process::id()),
        }
    }

    pub fn with_shared_secret(mut self, shared_secret: impl Into<String>) -> Self {
        self.shared_secret = Some(shared_secret.into());
        self
    }

    pub fn with_email_code(mut self, email_code: impl Into<String>) -> Self {
        self.email_code = Some(email_code.into());
        self
    }

    /// Compute the current TOTP code when a shared secret is configured.
    pub fn guard_code(&self, timestamp: u64) -> Result<Option<String>, ConnectionError> {
        self.shared_secret
            .as_deref()
            .map(|secret| {
                guard::one_time_code(secret, timestamp)
                    .map_err(|_| LoginError::InvalidCredentials.into())
            })
            .transpose()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct RsaKeyResponse {
    success: bool,
    publickey_mod: Option<String>,
    publickey_exp: Option<String>,
    #[allow(dead_code)]
    timestamp: Option<String>,
}

/// Fetch the RSA public key steam expects the password wrapped under.
///
/// An unknown account name comes back as `success: false`.
#[instrument(skip(web))]
pub(crate) async fn fetch_password_key(
    web: &WebClient,
    account: &str,
) -> Result<RsaPublicKey, ConnectionError> {
    debug!("fetching password rsa key");
    let response: RsaKeyResponse = web
        .post_form(
            &format!("{COMMUNITY_HOST}/login/getrsakey/"),
            &[("username", account.to_string())],
        )
        .await?;

    if !response.success {
        return Err(LoginError::InvalidCredentials.into());
    }

    let key_mod = BigUint::from_str_radix(response.publickey_mod.as_deref().unwrap_or_default(), 16)
        .map_err(|_| LoginError::InvalidCredentials)?;
    let key_exp = BigUint::from_str_radix(response.publickey_exp.as_deref().unwrap_or_default(), 16)
        .map_err(|_| LoginError::InvalidCredentials)?;
    let key = RsaPublicKey::new(key_mod, key_exp).map_err(LoginError::InvalidPubKey)?;
    Ok(key)
}

/// Assemble the `ClientLogOn` payload: wrapped password, guard material and
/// the stored sentry hash.
pub(crate) fn prepare_logon(
    credentials: &Credentials,
    key: &RsaPublicKey,
    sha_sentry: Option<Vec<u8>>,
    timestamp: u64,
) -> Result<LogonDetails, ConnectionError> {
    let encrypted = encrypt_with_key_pkcs1(key, credentials.password.as_bytes())
        .map_err(|_| LoginError::InvalidCredentials)?;
    Ok(LogonDetails {
        account: credentials.account.clone(),
        encrypted_password: BASE64_STANDARD.encode(encrypted),
        auth_code: credentials.email_code.clone(),
        two_factor_code: credentials.guard_code(timestamp)?,
        sha_sentry,
        machine_name: credentials.machine_name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};

    fn test_credentials() -> Credentials {
        Credentials::new("user", "pw").with_shared_secret("cnNyY25yY25yY25yY25yY25yY25yY24=")
    }

    #[test]
    fn guard_code_matches_clock_window() {
        let creds = test_credentials();
        assert_eq!(creds.guard_code(1_700_000_000).unwrap().as_deref(), Some("X56KF"));
        assert_eq!(creds.guard_code(1_700_000_009).unwrap().as_deref(), Some("X56KF"));
        assert_eq!(creds.guard_code(1_700_000_010).unwrap().as_deref(), Some("PT2JC"));
    }

    #[test]
    fn guard_code_absent_without_secret() {
        let creds = Credentials::new("user", "pw");
        assert!(creds.guard_code(1_700_000_000).unwrap().is_none());
    }

    #[test]
    fn prepared_logon_wraps_password() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let creds = test_credentials();

        let details =
            prepare_logon(&creds, &private.to_public_key(), Some(vec![1, 2, 3]), 1_700_000_000)
                .unwrap();
        assert_eq!(details.account, "user");
        assert_eq!(details.two_factor_code.as_deref(), Some("X56KF"));
        assert_eq!(details.sha_sentry.as_deref(), Some(&[1u8, 2, 3][..]));

        let wrapped = BASE64_STANDARD.decode(details.encrypted_password).unwrap();
        let plain = private.decrypt(Pkcs1v15Encrypt, &wrapped).unwrap();
        assert_eq!(plain, b"pw");
    }
}
