//! Message definitions for the subset of the Steam client protocol spoken by
//! `steam-flue`.
//!
//! Valve distributes these schemas as `.proto` dumps; the handful of messages
//! needed here are maintained by hand as `prost` structs instead of carrying a
//! codegen pipeline. Field numbers follow the published dumps.

pub mod base;
pub mod emsg;
pub mod eresult;
pub mod friends;
pub mod login;
pub mod machine_auth;
pub mod web_nonce;

pub use emsg::EMsg;
pub use eresult::EResult;
pub use prost;

use std::fmt::Debug;

/// High bit of the leading `EMsg` u32, set when the header is protobuf framed.
pub const PROTO_MASK: u32 = 0x8000_0000;

/// A message kind as found on the wire.
///
/// Known kinds map onto [`EMsg`]; everything else is carried and routed by
/// value so unrecognised traffic still reaches `raw` subscribers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct MsgKind(pub i32);

impl MsgKind {
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl From<MsgKind> for i32 {
    fn from(value: MsgKind) -> Self {
        value.0
    }
}

/// Enums usable as a message kind (`EMsg` and per-title GC variants).
pub trait MsgKindEnum: Debug + Clone + Copy {
    fn enum_value(&self) -> i32;

    fn encode_kind(&self, is_protobuf: bool) -> u32 {
        if is_protobuf {
            self.enum_value() as u32 | PROTO_MASK
        } else {
            self.enum_value() as u32
        }
    }
}

impl<T: MsgKindEnum> From<T> for MsgKind {
    fn from(value: T) -> Self {
        MsgKind(value.enum_value())
    }
}

impl<T: MsgKindEnum> PartialEq<T> for MsgKind {
    fn eq(&self, other: &T) -> bool {
        self.0.eq(&other.enum_value())
    }
}

/// A protobuf-framed client message with a fixed wire kind.
pub trait ClientMessage: prost::Message + Default {
    const KIND: EMsg;
}

/// A unified-service request, tied to its job name and response type.
///
/// The job name is carried in the protobuf header as
/// `I<Service>.<Method>#1`; the message body is the bare serialized request.
pub trait RpcMethod: prost::Message + Default {
    const METHOD_NAME: &'static str;
    type Response: prost::Message + Default;
}

/// A unified-service notification, delivered without a paired response.
pub trait RpcNotification: prost::Message + Default {
    const NOTIFICATION_NAME: &'static str;
}
