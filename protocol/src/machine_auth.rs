//! Machine-auth (sentry) challenge pair.

use crate::emsg::EMsg;
use crate::ClientMessage;
use prost::Message;

/// Server-initiated request to write a sentry blob to disk.
#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientUpdateMachineAuth {
    #[prost(string, optional, tag = "1")]
    pub filename: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub offset: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub cubtowrite: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub bytes: Option<Vec<u8>>,
}

impl ClientMessage for CMsgClientUpdateMachineAuth {
    const KIND: EMsg = EMsg::ClientUpdateMachineAuth;
}

/// Client reply carrying the SHA-1 of the stored blob.
#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientUpdateMachineAuthResponse {
    #[prost(string, optional, tag = "1")]
    pub filename: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub eresult: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub filesize: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub sha_file: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "6")]
    pub offset: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub cubwrote: Option<u32>,
}

impl ClientMessage for CMsgClientUpdateMachineAuthResponse {
    const KIND: EMsg = EMsg::ClientUpdateMachineAuthResponse;
}
