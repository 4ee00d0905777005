use crate::serializers::{option_string, string};
use crate::steam_id::SteamId;
use chrono::{DateTime, TimeZone, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;
use strum::{Display, EnumString};

/// Timestamps in trade payloads are unix seconds UTC.
pub type ServerTime = DateTime<Utc>;

pub(crate) fn server_time(unix: i64) -> ServerTime {
    Utc.timestamp_opt(unix, 0).single().unwrap_or_default()
}

#[derive(
    Serialize_repr,
    Deserialize_repr,
    Display,
    EnumString,
    Debug,
    PartialEq,
    Eq,
    TryFromPrimitive,
    IntoPrimitive,
    Clone,
    Copy,
    Hash,
)]
#[repr(u8)]
pub enum TradeOfferState {
    Invalid = 1,
    Active = 2,
    Accepted = 3,
    Countered = 4,
    Expired = 5,
    Canceled = 6,
    Declined = 7,
    InvalidItems = 8,
    CreatedNeedsConfirmation = 9,
    CanceledBySecondFactor = 10,
    InEscrow = 11,
}

impl TradeOfferState {
    /// Whether an offer in this state can never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeOfferState::Accepted
                | TradeOfferState::Declined
                | TradeOfferState::Canceled
                | TradeOfferState::CanceledBySecondFactor
                | TradeOfferState::Expired
                | TradeOfferState::Invalid
                | TradeOfferState::InvalidItems
        )
    }
}

#[derive(Serialize_repr, Deserialize_repr, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[repr(u8)]
pub enum ConfirmationMethod {
    #[default]
    None = 0,
    Email = 1,
    MobileApp = 2,
}

/// One item reference inside an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub appid: u32,
    #[serde(with = "string")]
    pub contextid: u64,
    #[serde(with = "string")]
    pub assetid: u64,
    #[serde(with = "string")]
    pub classid: u64,
    #[serde(with = "option_string", default)]
    pub instanceid: Option<u64>,
    #[serde(with = "string")]
    pub amount: u64,
}

/// Offer as returned by `IEconService/GetTradeOffers`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawTradeOffer {
    #[serde(with = "string")]
    pub tradeofferid: u64,
    pub accountid_other: u32,
    #[serde(default)]
    pub message: Option<String>,
    pub expiration_time: i64,
    pub trade_offer_state: TradeOfferState,
    #[serde(default)]
    pub items_to_give: Vec<Asset>,
    #[serde(default)]
    pub items_to_receive: Vec<Asset>,
    pub is_our_offer: bool,
    pub time_created: i64,
    pub time_updated: i64,
    #[serde(default)]
    pub from_real_time_trade: bool,
    #[serde(default)]
    pub escrow_end_date: i64,
    #[serde(default)]
    pub confirmation_method: ConfirmationMethod,
    #[serde(with = "option_string", default)]
    pub trade_offer_id_countered: Option<u64>,
}

impl RawTradeOffer {
    pub(crate) fn into_offer(self) -> TradeOffer {
        TradeOffer {
            id: self.tradeofferid,
            partner: SteamId::from_account_id(self.accountid_other),
            message: self.message.filter(|m| !m.is_empty()),
            items_to_give: self.items_to_give,
            items_to_receive: self.items_to_receive,
            is_our_offer: self.is_our_offer,
            state: self.trade_offer_state,
            expires_at: server_time(self.expiration_time),
            created_at: server_time(self.time_created),
            updated_at: server_time(self.time_updated),
            escrow_ends_at: (self.escrow_end_date > 0).then(|| server_time(self.escrow_end_date)),
            confirmation_method: self.confirmation_method,
            from_real_time_trade: self.from_real_time_trade,
            countered_offer_id: self.trade_offer_id_countered,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeOffer {
    pub id: u64,
    pub partner: SteamId,
    pub message: Option<String>,
    pub items_to_give: Vec<Asset>,
    pub items_to_receive: Vec<Asset>,
    pub is_our_offer: bool,
    pub state: TradeOfferState,
    pub expires_at: ServerTime,
    pub created_at: ServerTime,
    pub updated_at: ServerTime,
    pub escrow_ends_at: Option<ServerTime>,
    pub confirmation_method: ConfirmationMethod,
    pub from_real_time_trade: bool,
    /// Id of the offer this one counters, when present.
    pub countered_offer_id: Option<u64>,
}

impl fmt::Display for TradeOffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}:{}]", u64::from(self.partner), self.id)
    }
}

impl TradeOffer {
    /// An offer asking for nothing on one side.
    pub fn is_gift(&self) -> bool {
        self.items_to_give.is_empty() != self.items_to_receive.is_empty()
    }

    /// Both sides empty; these show up during item-server hiccups and are
    /// skipped by the poller.
    pub fn is_glitched(&self) -> bool {
        self.items_to_give.is_empty() && self.items_to_receive.is_empty()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct GetTradeOffersResponse {
    pub response: GetTradeOffersBody,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct GetTradeOffersBody {
    #[serde(default)]
    pub trade_offers_sent: Vec<RawTradeOffer>,
    #[serde(default)]
    pub trade_offers_received: Vec<RawTradeOffer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER_JSON: &str = r#"{
        "tradeofferid": "4001",
        "accountid_other": 59880187,
        "message": "for the hat",
        "expiration_time": 1701209600,
        "trade_offer_state": 2,
        "items_to_receive": [{
            "appid": 440,
            "contextid": "2",
            "assetid": "11488502242",
            "classid": "313",
            "instanceid": "11040578",
            "amount": "1"
        }],
        "is_our_offer": false,
        "time_created": 1700000000,
        "time_updated": 1700000060,
        "from_real_time_trade": false,
        "escrow_end_date": 0,
        "confirmation_method": 0
    }"#;

    #[test]
    fn deserializes_raw_offer() {
        let raw: RawTradeOffer = serde_json::from_str(OFFER_JSON).unwrap();
        let offer = raw.into_offer();
        assert_eq!(offer.id, 4001);
        assert_eq!(offer.partner.account_id(), 59880187);
        assert_eq!(offer.state, TradeOfferState::Active);
        assert!(!offer.is_our_offer);
        assert_eq!(offer.items_to_receive.len(), 1);
        assert_eq!(offer.items_to_receive[0].assetid, 11488502242);
        assert_eq!(offer.updated_at, server_time(1700000060));
        assert_eq!(offer.escrow_ends_at, None);
        assert_eq!(offer.message.as_deref(), Some("for the hat"));
    }

    #[test]
    fn gift_detection() {
        let raw: RawTradeOffer = serde_json::from_str(OFFER_JSON).unwrap();
        let offer = raw.into_offer();
        // one sided: we receive and give nothing
        assert!(offer.is_gift());
        assert!(!offer.is_glitched());

        let mut two_sided = offer.clone();
        two_sided.items_to_give = two_sided.items_to_receive.clone();
        assert!(!two_sided.is_gift());

        let mut empty = offer;
        empty.items_to_receive.clear();
        assert!(empty.is_glitched());
    }

    #[test]
    fn terminal_states() {
        for state in [
            TradeOfferState::Accepted,
            TradeOfferState::Declined,
            TradeOfferState::Canceled,
            TradeOfferState::Expired,
            TradeOfferState::Invalid,
        ] {
            assert!(state.is_terminal());
        }
        for state in [
            TradeOfferState::Active,
            TradeOfferState::Countered,
            TradeOfferState::InEscrow,
            TradeOfferState::CreatedNeedsConfirmation,
        ] {
            assert!(!state.is_terminal());
        }
    }

    #[test]
    fn state_parses_from_wire_value() {
        assert_eq!(TradeOfferState::try_from(3u8), Ok(TradeOfferState::Accepted));
        assert!(TradeOfferState::try_from(99u8).is_err());
    }
}
