//! Mobile confirmations: listing, matching and resolving the second factor
//! steam requires before trades and market listings go through.

use crate::serializers::string;
use crate::steam_id::SteamId;
use crate::web::{WebClient, WebError, API_HOST, COMMUNITY_HOST};
use serde::Deserialize;
use std::time::Duration;
use steam_flue_crypto::guard;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

const MOBILE_CLIENT_HEADER: (&str, &str) = (
    "X-Requested-With",
    "com.valvesoftware.android.steam.community",
);

#[derive(Debug, Error)]
pub enum ConfirmationError {
    #[error("web request failed: {0}")]
    Web(#[from] WebError),
    #[error("no identity secret configured")]
    NoIdentitySecret,
    #[error("identity secret is not valid base64")]
    MalformedSecret,
    #[error("no confirmation found for {0}")]
    NotFound(u64),
    #[error("confirmation failed{}", .0.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Unsuccessful(Option<String>),
}

pub type Result<T, E = ConfirmationError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationType {
    Trade,
    MarketListing,
    Other(u32),
}

impl From<u32> for ConfirmationType {
    fn from(value: u32) -> Self {
        match value {
            2 => ConfirmationType::Trade,
            3 => ConfirmationType::MarketListing,
            other => ConfirmationType::Other(other),
        }
    }
}

/// One pending mobile confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub id: u64,
    /// The nonce steam calls a "key"; both id and nonce are needed to act.
    pub nonce: u64,
    /// Trade offer id or market listing id this confirmation gates.
    pub creator_id: u64,
    pub conf_type: ConfirmationType,
    pub creation_time: i64,
}

impl Confirmation {
    pub fn is_trade(&self) -> bool {
        self.conf_type == ConfirmationType::Trade
    }
}

#[derive(Debug, Deserialize)]
struct RawConfirmation {
    #[serde(rename = "type")]
    conf_type: u32,
    #[serde(with = "string")]
    id: u64,
    #[serde(with = "string")]
    nonce: u64,
    #[serde(with = "string")]
    creator_id: u64,
    #[serde(default)]
    creation_time: i64,
}

#[derive(Debug, Deserialize)]
struct GetListResponse {
    success: bool,
    #[serde(default)]
    conf: Vec<RawConfirmation>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AjaxOpResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Lists and resolves mobile confirmations using the identity secret.
///
/// The engine holds no long-lived state beyond that secret; every call
/// derives fresh per-tag keys for the current TOTP window.
#[derive(Clone)]
pub struct ConfirmationEngine {
    web: WebClient,
    steam_id: SteamId,
    identity_secret: String,
    device_id: String,
    /// Offset between our clock and steam's, in seconds.
    time_offset: i64,
}

impl ConfirmationEngine {
    pub fn new(web: WebClient, steam_id: SteamId, identity_secret: impl Into<String>) -> Self {
        let identity_secret = identity_secret.into();
        ConfirmationEngine {
            web,
            device_id: guard::device_id(steam_id.into()),
            steam_id,
            identity_secret,
            time_offset: 0,
        }
    }

    pub fn with_time_offset(mut self, offset: i64) -> Self {
        self.time_offset = offset;
        self
    }

    /// Ask steam for its clock and remember the offset from ours, keeping
    /// confirmation keys inside the right TOTP window on skewed machines.
    pub async fn sync_time(&mut self) -> Result<i64> {
        #[derive(Debug, Deserialize)]
        struct ServerTime {
            #[serde(with = "string")]
            server_time: i64,
        }

        #[derive(Debug, Deserialize)]
        struct Response {
            response: ServerTime,
        }

        let response: Response = self
            .web
            .post_raw_form(
                &format!("{API_HOST}/ITwoFactorService/QueryTime/v1/"),
                "steamid=0".to_string(),
            )
            .await?;
        let local = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        self.time_offset = response.response.server_time - local;
        debug!(offset = self.time_offset, "synced clock with steam");
        Ok(self.time_offset)
    }

    fn now(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        (now + self.time_offset).max(0) as u64
    }

    /// Query parameters every confirmation call carries, keyed for `tag` at
    /// `time`.
    fn params(&self, tag: &str, time: u64) -> Result<Vec<(&'static str, String)>> {
        let key = guard::confirmation_code(&self.identity_secret, tag, time)
            .map_err(|_| ConfirmationError::MalformedSecret)?;
        Ok(vec![
            ("p", self.device_id.clone()),
            ("a", u64::from(self.steam_id).to_string()),
            ("k", key),
            ("t", time.to_string()),
            ("m", "android".into()),
            ("tag", tag.into()),
        ])
    }

    /// List the pending confirmations.
    pub async fn list(&self) -> Result<Vec<Confirmation>> {
        let params = self.params("conf", self.now())?;
        let response: GetListResponse = self
            .web
            .get_with_headers(
                &format!("{COMMUNITY_HOST}/mobileconf/getlist"),
                &params,
                &[MOBILE_CLIENT_HEADER],
            )
            .await?;
        if !response.success {
            return Err(ConfirmationError::Unsuccessful(response.message));
        }
        Ok(response
            .conf
            .into_iter()
            .map(|raw| Confirmation {
                id: raw.id,
                nonce: raw.nonce,
                creator_id: raw.creator_id,
                conf_type: raw.conf_type.into(),
                creation_time: raw.creation_time,
            })
            .collect())
    }

    /// Find the pending confirmation for a trade offer, if any.
    pub async fn match_for_trade(&self, trade_id: u64) -> Result<Option<Confirmation>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|conf| conf.creator_id == trade_id))
    }

    async fn send_op(&self, confirmation: &Confirmation, op: &str) -> Result<AjaxOpResponse> {
        let time = self.now();
        let mut params = self.params(op, time)?;
        params.push(("op", op.to_string()));
        params.push(("cid", confirmation.id.to_string()));
        params.push(("ck", confirmation.nonce.to_string()));
        self.web
            .get_with_headers(
                &format!("{COMMUNITY_HOST}/mobileconf/ajaxop"),
                &params,
                &[MOBILE_CLIENT_HEADER],
            )
            .await
            .map_err(Into::into)
    }

    /// Accept or deny one confirmation.
    ///
    /// A key can only be used inside the TOTP window it was computed for;
    /// when steam reports a replayed key the call sleeps one window and
    /// retries once.
    pub async fn resolve(&self, confirmation: &Confirmation, allow: bool) -> Result<()> {
        let op = if allow { "allow" } else { "cancel" };
        let response = self.send_op(confirmation, op).await?;
        if response.success {
            return Ok(());
        }

        let replayed = response
            .message
            .as_deref()
            .map(|m| m.to_ascii_lowercase().contains("replay"))
            .unwrap_or(false);
        if !replayed {
            return Err(ConfirmationError::Unsuccessful(response.message));
        }

        warn!(id = confirmation.id, "confirmation key replayed, waiting out the window");
        sleep(Duration::from_secs(guard::CODE_WINDOW_SECONDS)).await;
        let response = self.send_op(confirmation, op).await?;
        if response.success {
            Ok(())
        } else {
            Err(ConfirmationError::Unsuccessful(response.message))
        }
    }

    /// Resolve a batch in one request.
    pub async fn resolve_many(&self, confirmations: &[Confirmation], allow: bool) -> Result<()> {
        if confirmations.is_empty() {
            return Ok(());
        }
        let op = if allow { "allow" } else { "cancel" };
        let time = self.now();
        let mut body = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in self.params(op, time)? {
            body.append_pair(key, &value);
        }
        body.append_pair("op", op);
        for confirmation in confirmations {
            body.append_pair("cid[]", &confirmation.id.to_string());
            body.append_pair("ck[]", &confirmation.nonce.to_string());
        }
        let body = body.finish();
        let response: AjaxOpResponse = self
            .web
            .post_raw_form(&format!("{COMMUNITY_HOST}/mobileconf/multiajaxop"), body)
            .await?;
        if response.success {
            Ok(())
        } else {
            Err(ConfirmationError::Unsuccessful(response.message))
        }
    }

    /// Find and accept the confirmation gating `trade_id`.
    pub async fn confirm_trade(&self, trade_id: u64) -> Result<()> {
        debug!(trade_id, "looking for trade confirmation");
        let confirmation = self
            .match_for_trade(trade_id)
            .await?
            .ok_or(ConfirmationError::NotFound(trade_id))?;
        self.resolve(&confirmation, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY_SECRET: &str = "aWRlbnRpdHkgc2VjcmV0IDEyMzQ=";

    fn engine() -> ConfirmationEngine {
        ConfirmationEngine::new(
            WebClient::new(),
            SteamId::from(76561198020145915),
            IDENTITY_SECRET,
        )
    }

    #[test]
    fn params_carry_the_expected_key() {
        let params = engine().params("conf", 1_700_000_000).unwrap();
        let lookup = |name: &str| {
            params
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(lookup("p"), "android:e948c7eb-87fe-680e-1602-83a832c59a35");
        assert_eq!(lookup("a"), "76561198020145915");
        assert_eq!(lookup("k"), "20LTtoaV2wOPbrAfkc2udrHKMwI=");
        assert_eq!(lookup("t"), "1700000000");
        assert_eq!(lookup("m"), "android");
        assert_eq!(lookup("tag"), "conf");
    }

    #[test]
    fn op_tags_key_differently() {
        let engine = engine();
        let allow = engine.params("allow", 1_700_000_000).unwrap();
        let cancel = engine.params("cancel", 1_700_000_000).unwrap();
        let key = |params: &Vec<(&'static str, String)>| {
            params
                .iter()
                .find(|(k, _)| *k == "k")
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_ne!(key(&allow), key(&cancel));
    }

    #[test]
    fn malformed_secret_is_surfaced() {
        let engine = ConfirmationEngine::new(
            WebClient::new(),
            SteamId::from(76561198020145915),
            "!!not base64!!",
        );
        assert!(matches!(
            engine.params("conf", 0),
            Err(ConfirmationError::MalformedSecret)
        ));
    }

    #[test]
    fn parses_getlist_payload() {
        let raw = r#"{
            "success": true,
            "conf": [{
                "type": 2,
                "type_name": "Trade",
                "id": "13377331",
                "creator_id": "4001",
                "nonce": "9982113377",
                "creation_time": 1700000100,
                "cancel": "Cancel",
                "accept": "Accept",
                "multi": false,
                "headline": "user",
                "summary": ["You will receive 1 item"]
            }]
        }"#;
        let parsed: GetListResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.conf.len(), 1);
        let conf = &parsed.conf[0];
        assert_eq!(conf.id, 13377331);
        assert_eq!(conf.nonce, 9982113377);
        assert_eq!(conf.creator_id, 4001);
        assert_eq!(ConfirmationType::from(conf.conf_type), ConfirmationType::Trade);
    }

    #[test]
    fn time_offset_applies() {
        let engine = engine().with_time_offset(-30);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(engine.now() <= now - 29);
    }
}
