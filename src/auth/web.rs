use crate::connection::{ConnectionImpl, ConnectionSender};
use crate::net::NetworkError;
use crate::session::ConnectionError;
use crate::steam_id::SteamId;
use crate::web::{WebClient, API_HOST};
use bytes::BytesMut;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use rand::Rng;
use serde::Deserialize;
use steam_flue_crypto::{encrypt_with_system_key, symmetric_encrypt};
use steam_flue_proto::web_nonce::{
    CMsgClientRequestWebAPIAuthenticateUserNonce, CMsgClientRequestWebAPIAuthenticateUserNonceResponse,
};
use steam_flue_proto::EResult;
use tracing::{debug, instrument, warn};

/// Cookies minted for the community and api hosts after a successful logon.
#[derive(Debug, Clone)]
pub struct WebSession {
    pub session_id: String,
    pub steam_login: String,
    pub steam_login_secure: String,
}

#[derive(Debug, Deserialize)]
struct AuthenticateUserResponse {
    authenticateuser: AuthenticateUserTokens,
}

#[derive(Debug, Deserialize)]
struct AuthenticateUserTokens {
    token: String,
    tokensecure: String,
}

async fn fetch_nonce<C: ConnectionImpl>(connection: &C) -> Result<String, ConnectionError> {
    let response: CMsgClientRequestWebAPIAuthenticateUserNonceResponse = connection
        .job(CMsgClientRequestWebAPIAuthenticateUserNonce::default())
        .await?;
    let eresult = EResult::from(response.eresult.unwrap_or_default());
    if !eresult.is_ok() {
        return Err(NetworkError::Result(eresult).into());
    }
    response
        .webapi_authenticate_user_nonce
        .filter(|nonce| !nonce.is_empty())
        .ok_or_else(|| NetworkError::Result(EResult::Invalid).into())
}

async fn authenticate(
    web: &WebClient,
    steam_id: SteamId,
    nonce: &str,
) -> Result<AuthenticateUserTokens, ConnectionError> {
    // the nonce is single use; it travels AES-wrapped under a fresh session
    // key which in turn is RSA-wrapped for the steam system key
    let session_key: [u8; 32] = rand::thread_rng().gen();
    let encrypted_session_key =
        encrypt_with_system_key(&session_key).map_err(NetworkError::CryptoError)?;
    let encrypted_login_key =
        symmetric_encrypt(BytesMut::from(nonce.as_bytes()), &session_key);

    let body = format!(
        "steamid={}&sessionkey={}&encrypted_loginkey={}",
        u64::from(steam_id),
        percent_encode(&encrypted_session_key, NON_ALPHANUMERIC),
        percent_encode(&encrypted_login_key, NON_ALPHANUMERIC),
    );

    let response: AuthenticateUserResponse = web
        .post_raw_form(&format!("{API_HOST}/ISteamUserAuth/AuthenticateUser/v1/"), body)
        .await?;
    Ok(response.authenticateuser)
}

/// Exchange the logon nonce for `steamLogin`/`steamLoginSecure` cookies and
/// mint a `sessionid`.
///
/// The nonce from the logon response is consumed on first use; if steam
/// rejects it a fresh one is requested over the CM once.
#[instrument(skip_all)]
pub(crate) async fn mint_web_session<C: ConnectionImpl>(
    connection: &C,
    web: &WebClient,
) -> Result<WebSession, ConnectionError> {
    let steam_id = connection.session().steam_id;
    let nonce = match connection.session().web_nonce.clone() {
        Some(nonce) => nonce,
        None => fetch_nonce(connection).await?,
    };

    let tokens = match authenticate(web, steam_id, &nonce).await {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!(error = %e, "authenticate with logon nonce failed, requesting a fresh one");
            let nonce = fetch_nonce(connection).await?;
            authenticate(web, steam_id, &nonce).await?
        }
    };

    let session_id: String = {
        let bytes: [u8; 12] = rand::thread_rng().gen();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    };

    debug!("minted web session cookies");
    web.set_session(
        &session_id,
        &[
            format!("steamLogin={}", tokens.token),
            format!("steamLoginSecure={}", tokens.tokensecure),
        ],
    );

    Ok(WebSession {
        session_id,
        steam_login: tokens.token,
        steam_login_secure: tokens.tokensecure,
    })
}
