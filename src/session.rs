use crate::connection::raw::RawConnection;
use crate::message::NetMessage;
use crate::net::{JobId, JobIdCounter, NetMessageHeader, NetworkError, RawNetMessage};
use crate::serverlist::ServerDiscoveryError;
use crate::steam_id::{AccountType, Instance, SteamId, Universe};
use crate::web::WebError;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use steam_flue_proto::base::CMsgIPAddress;
use steam_flue_proto::login::{CMsgClientLogon, CMsgClientLogonResponse};
use steam_flue_proto::EResult;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info};

pub(crate) const PROTOCOL_VERSION: u32 = 65580;
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(9);

type Result<T, E = ConnectionError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Network error: {0:#}")]
    Network(#[from] NetworkError),
    #[error("Login failed: {0:#}")]
    Login(#[from] LoginError),
    #[error(transparent)]
    Discovery(#[from] ServerDiscoveryError),
    #[error("Web request failed: {0:#}")]
    Web(#[from] WebError),
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account is banned")]
    Banned,
    #[error("logins are rate limited, try again later")]
    RateLimited,
    #[error("steam guard email code required{}", .domain.as_deref().map(|d| format!(" (sent to {d})")).unwrap_or_default())]
    EmailCodeRequired { domain: Option<String> },
    #[error("two factor code required")]
    TwoFactorRequired,
    #[error("two factor code was rejected")]
    TwoFactorMismatch,
    #[error("logged in elsewhere")]
    LoggedInElsewhere,
    #[error("server asked to try another cm")]
    TryAnotherCM,
    #[error("malformed rsa key: {0}")]
    InvalidPubKey(rsa::Error),
    #[error("login failed: {0:?}")]
    Unknown(EResult),
}

impl LoginError {
    pub(crate) fn from_eresult(result: EResult, email_domain: Option<String>) -> Option<Self> {
        match result {
            EResult::OK => None,
            EResult::InvalidPassword => Some(LoginError::InvalidCredentials),
            EResult::Banned | EResult::AccountDisabled => Some(LoginError::Banned),
            EResult::RateLimitExceeded | EResult::AccountLoginDeniedThrottle => {
                Some(LoginError::RateLimited)
            }
            EResult::AccountLogonDenied | EResult::AccountLogonDeniedNoMail
            | EResult::InvalidLoginAuthCode => Some(LoginError::EmailCodeRequired {
                domain: email_domain,
            }),
            EResult::AccountLoginDeniedNeedTwoFactor => Some(LoginError::TwoFactorRequired),
            EResult::TwoFactorCodeMismatch => Some(LoginError::TwoFactorMismatch),
            EResult::LoggedInElsewhere | EResult::LogonSessionReplaced => {
                Some(LoginError::LoggedInElsewhere)
            }
            EResult::TryAnotherCM => Some(LoginError::TryAnotherCM),
            other => Some(LoginError::Unknown(other)),
        }
    }

    /// Errors that no amount of reconnecting will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LoginError::InvalidCredentials
                | LoginError::Banned
                | LoginError::InvalidPubKey(_)
                | LoginError::TwoFactorMismatch
        )
    }
}

/// State of one logged-on connection.
///
/// A new session (with a fresh session id and job counter) is created for
/// every reconnect.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: i32,
    pub steam_id: SteamId,
    pub cell_id: u32,
    pub heartbeat_interval: Duration,
    pub public_ip: Option<IpAddr>,
    pub ip_country_code: Option<String>,
    pub(crate) web_nonce: Option<String>,
    job_ids: Arc<JobIdCounter>,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            session_id: 0,
            steam_id: SteamId::default(),
            cell_id: 0,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            public_ip: None,
            ip_country_code: None,
            web_nonce: None,
            job_ids: Arc::new(JobIdCounter::default()),
        }
    }
}

impl Session {
    /// Header for the next outgoing message, allocating a source job id when
    /// a reply is expected.
    pub fn header(&self, with_job: bool) -> NetMessageHeader {
        NetMessageHeader {
            session_id: self.session_id,
            source_job_id: if with_job {
                self.job_ids.next()
            } else {
                JobId::NONE
            },
            target_job_id: JobId::NONE,
            steam_id: self.steam_id,
            target_job_name: None,
            eresult: None,
        }
    }
}

/// Credentials as sent in `ClientLogOn`, password already wrapped.
#[derive(Debug, Clone)]
pub struct LogonDetails {
    pub account: String,
    /// Base64 of the PKCS#1 v1.5 wrapped password.
    pub encrypted_password: String,
    /// Email Steam-Guard code, if the server previously asked for one.
    pub auth_code: Option<String>,
    /// TOTP code from the shared secret.
    pub two_factor_code: Option<String>,
    /// SHA-1 of the stored sentry blob, when this machine is known.
    pub sha_sentry: Option<Vec<u8>>,
    pub machine_name: String,
}

fn base_logon() -> CMsgClientLogon {
    CMsgClientLogon {
        protocol_version: Some(PROTOCOL_VERSION),
        client_os_type: Some(203),
        client_language: Some(String::new()),
        should_remember_password: Some(false),
        supports_rate_limit_response: Some(true),
        obfuscated_private_ip: Some(CMsgIPAddress {
            v4: Some(0),
            v6: None,
        }),
        chat_mode: Some(2),
        ..CMsgClientLogon::default()
    }
}

async fn send_logon(
    connection: &RawConnection,
    steam_id: SteamId,
    logon: CMsgClientLogon,
) -> Result<Session> {
    let header = NetMessageHeader {
        session_id: 0,
        source_job_id: JobId::NONE,
        target_job_id: JobId::NONE,
        steam_id,
        target_job_name: None,
        eresult: None,
    };

    let recv = connection.filter.one_kind(CMsgClientLogonResponse::KIND);
    let msg = RawNetMessage::from_message(header, logon)?;
    connection.sender.send_raw(msg).await?;

    let raw = timeout(connection.timeout, recv)
        .await
        .map_err(|_| NetworkError::Timeout)?
        .map_err(|_| NetworkError::Disconnected)?;
    let session_id = raw.header.session_id;
    let steam_id = raw.header.steam_id;
    let response: CMsgClientLogonResponse = raw.into_message()?;

    let eresult = EResult::from(response.eresult.unwrap_or_default());
    if let Some(err) = LoginError::from_eresult(eresult, response.email_domain.clone()) {
        return Err(err.into());
    }

    let heartbeat_interval = response
        .out_of_game_heartbeat_seconds
        .filter(|&secs| secs > 0)
        .map(|secs| Duration::from_secs(secs as u64))
        .unwrap_or(DEFAULT_HEARTBEAT);

    info!(steam_id = u64::from(steam_id), session_id, "logged on");
    Ok(Session {
        session_id,
        steam_id,
        cell_id: response.cell_id.unwrap_or_default(),
        heartbeat_interval,
        public_ip: response
            .public_ip
            .and_then(|ip| ip.v4)
            .map(|v4| IpAddr::V4(Ipv4Addr::from(v4))),
        ip_country_code: response.ip_country_code,
        web_nonce: response.webapi_authenticate_user_nonce,
        job_ids: Arc::new(JobIdCounter::default()),
    })
}

/// Log on anonymously, without credentials or guard material.
pub(crate) async fn anonymous(connection: &RawConnection) -> Result<Session> {
    debug!("starting anonymous logon");
    let mut logon = base_logon();
    logon.anon_user_target_account_name = Some("anonymous".into());
    let steam_id = SteamId::new(0, Instance::All, AccountType::AnonUser, Universe::Public);
    send_logon(connection, steam_id, logon).await
}

/// Log on with prepared credentials.
pub(crate) async fn login(connection: &RawConnection, details: LogonDetails) -> Result<Session> {
    debug!(account = details.account.as_str(), "starting credentials logon");
    let mut logon = base_logon();
    logon.account_name = Some(details.account);
    logon.password = Some(details.encrypted_password);
    logon.auth_code = details.auth_code;
    logon.two_factor_code = details.two_factor_code;
    logon.sha_sentryfile = details.sha_sentry;
    logon.machine_name = Some(details.machine_name);
    logon.steamguard_dont_remember_computer = Some(false);
    let steam_id = SteamId::new(0, Instance::Desktop, AccountType::Individual, Universe::Public);
    send_logon(connection, steam_id, logon).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eresult_mapping() {
        assert!(LoginError::from_eresult(EResult::OK, None).is_none());
        assert!(matches!(
            LoginError::from_eresult(EResult::InvalidPassword, None),
            Some(LoginError::InvalidCredentials)
        ));
        assert!(matches!(
            LoginError::from_eresult(EResult::AccountLogonDenied, Some("mail.example".into())),
            Some(LoginError::EmailCodeRequired { domain: Some(d) }) if d == "mail.example"
        ));
        assert!(matches!(
            LoginError::from_eresult(EResult::AccountLoginDeniedNeedTwoFactor, None),
            Some(LoginError::TwoFactorRequired)
        ));
        assert!(matches!(
            LoginError::from_eresult(EResult::TryAnotherCM, None),
            Some(LoginError::TryAnotherCM)
        ));
    }

    #[test]
    fn fatal_classification() {
        assert!(LoginError::InvalidCredentials.is_fatal());
        assert!(LoginError::Banned.is_fatal());
        assert!(!LoginError::RateLimited.is_fatal());
        assert!(!LoginError::TwoFactorRequired.is_fatal());
        assert!(!LoginError::TryAnotherCM.is_fatal());
    }

    #[test]
    fn header_allocates_job_ids_monotonically() {
        let session = Session::default();
        let first = session.header(true).source_job_id;
        let second = session.header(true).source_job_id;
        assert!(second.0 > first.0);
        assert!(session.header(false).source_job_id.is_none());
    }

    #[test]
    fn cloned_sessions_share_the_job_counter() {
        let session = Session::default();
        let clone = session.clone();
        let first = session.header(true).source_job_id;
        let second = clone.header(true).source_job_id;
        assert_ne!(first, second);
    }
}
