//! Header and envelope messages shared by every protobuf-framed kind.

use crate::emsg::EMsg;
use crate::ClientMessage;
use prost::Message;

/// The protobuf header following the masked `EMsg` u32 on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct CMsgProtoBufHeader {
    #[prost(fixed64, optional, tag = "1")]
    pub steamid: Option<u64>,
    #[prost(int32, optional, tag = "2")]
    pub client_sessionid: Option<i32>,
    #[prost(uint32, optional, tag = "3")]
    pub routing_appid: Option<u32>,
    #[prost(fixed64, optional, tag = "10")]
    pub jobid_source: Option<u64>,
    #[prost(fixed64, optional, tag = "11")]
    pub jobid_target: Option<u64>,
    #[prost(string, optional, tag = "12")]
    pub target_job_name: Option<String>,
    #[prost(int32, optional, tag = "13")]
    pub eresult: Option<i32>,
    #[prost(string, optional, tag = "14")]
    pub error_message: Option<String>,
}

/// Bundle of smaller messages, optionally gzip-compressed.
#[derive(Clone, PartialEq, Message)]
pub struct CMsgMulti {
    #[prost(uint32, optional, tag = "1")]
    pub size_unzipped: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub message_body: Option<Vec<u8>>,
}

impl ClientMessage for CMsgMulti {
    const KIND: EMsg = EMsg::Multi;
}

#[derive(Clone, PartialEq, Message)]
pub struct CMsgIPAddress {
    #[prost(fixed32, optional, tag = "1")]
    pub v4: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub v6: Option<Vec<u8>>,
}

/// Endpoint list pushed by the CM after logon.
#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientCMList {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub cm_addresses: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub cm_ports: Vec<u32>,
    #[prost(string, repeated, tag = "3")]
    pub cm_websocket_addresses: Vec<String>,
}

impl ClientMessage for CMsgClientCMList {
    const KIND: EMsg = EMsg::ClientCMList;
}
