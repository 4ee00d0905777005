//! Logon, heartbeat and logoff messages.

use crate::base::CMsgIPAddress;
use crate::emsg::EMsg;
use crate::ClientMessage;
use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientLogon {
    #[prost(uint32, optional, tag = "1")]
    pub protocol_version: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub cell_id: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub client_package_version: Option<u32>,
    #[prost(string, optional, tag = "6")]
    pub client_language: Option<String>,
    #[prost(uint32, optional, tag = "7")]
    pub client_os_type: Option<u32>,
    #[prost(bool, optional, tag = "8")]
    pub should_remember_password: Option<bool>,
    #[prost(message, optional, tag = "11")]
    pub obfuscated_private_ip: Option<CMsgIPAddress>,
    #[prost(fixed64, optional, tag = "14")]
    pub client_supplied_steam_id: Option<u64>,
    #[prost(bool, optional, tag = "16")]
    pub supports_rate_limit_response: Option<bool>,
    #[prost(string, optional, tag = "50")]
    pub account_name: Option<String>,
    /// Base64 of the RSA-wrapped password, never the plain text.
    #[prost(string, optional, tag = "51")]
    pub password: Option<String>,
    #[prost(bytes = "vec", optional, tag = "71")]
    pub sha_sentryfile: Option<Vec<u8>>,
    /// Email Steam-Guard code, when the server asked for one.
    #[prost(string, optional, tag = "72")]
    pub auth_code: Option<String>,
    #[prost(bool, optional, tag = "78")]
    pub steamguard_dont_remember_computer: Option<bool>,
    /// Mobile-authenticator TOTP code.
    #[prost(string, optional, tag = "84")]
    pub two_factor_code: Option<String>,
    #[prost(string, optional, tag = "91")]
    pub machine_name: Option<String>,
    #[prost(string, optional, tag = "100")]
    pub anon_user_target_account_name: Option<String>,
    #[prost(uint32, optional, tag = "101")]
    pub chat_mode: Option<u32>,
}

impl ClientMessage for CMsgClientLogon {
    const KIND: EMsg = EMsg::ClientLogOn;
}

#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientLogonResponse {
    #[prost(int32, optional, tag = "1")]
    pub eresult: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub out_of_game_heartbeat_seconds: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub in_game_heartbeat_seconds: Option<i32>,
    #[prost(uint32, optional, tag = "5")]
    pub rtime32_server_time: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub account_flags: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub cell_id: Option<u32>,
    #[prost(string, optional, tag = "8")]
    pub email_domain: Option<String>,
    #[prost(int32, optional, tag = "10")]
    pub eresult_extended: Option<i32>,
    #[prost(string, optional, tag = "11")]
    pub webapi_authenticate_user_nonce: Option<String>,
    #[prost(message, optional, tag = "20")]
    pub public_ip: Option<CMsgIPAddress>,
    #[prost(string, optional, tag = "28")]
    pub ip_country_code: Option<String>,
}

impl ClientMessage for CMsgClientLogonResponse {
    const KIND: EMsg = EMsg::ClientLogOnResponse;
}

#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientHeartBeat {
    #[prost(bool, optional, tag = "1")]
    pub send_reply: Option<bool>,
}

impl ClientMessage for CMsgClientHeartBeat {
    const KIND: EMsg = EMsg::ClientHeartBeat;
}

#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientLogOff {}

impl ClientMessage for CMsgClientLogOff {
    const KIND: EMsg = EMsg::ClientLogOff;
}

/// Sent by the server when it terminates the session.
#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientLoggedOff {
    #[prost(int32, optional, tag = "1")]
    pub eresult: Option<i32>,
}

impl ClientMessage for CMsgClientLoggedOff {
    const KIND: EMsg = EMsg::ClientLoggedOff;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logon_roundtrip() {
        let logon = CMsgClientLogon {
            protocol_version: Some(65580),
            account_name: Some("user".into()),
            password: Some("d2hhdGV2ZXI=".into()),
            two_factor_code: Some("X56KF".into()),
            sha_sentryfile: Some(vec![0xde, 0xad]),
            ..CMsgClientLogon::default()
        };
        let decoded = CMsgClientLogon::decode(logon.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, logon);
    }
}
