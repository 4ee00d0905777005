//! Web-API nonce exchange used to mint community cookies after logon.

use crate::emsg::EMsg;
use crate::ClientMessage;
use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientRequestWebAPIAuthenticateUserNonce {}

impl ClientMessage for CMsgClientRequestWebAPIAuthenticateUserNonce {
    const KIND: EMsg = EMsg::ClientRequestWebAPIAuthenticateUserNonce;
}

#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientRequestWebAPIAuthenticateUserNonceResponse {
    #[prost(int32, optional, tag = "1")]
    pub eresult: Option<i32>,
    #[prost(string, optional, tag = "11")]
    pub webapi_authenticate_user_nonce: Option<String>,
}

impl ClientMessage for CMsgClientRequestWebAPIAuthenticateUserNonceResponse {
    const KIND: EMsg = EMsg::ClientRequestWebAPIAuthenticateUserNonceResponse;
}
