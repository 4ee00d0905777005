use crate::MsgKindEnum;
use num_enum::TryFromPrimitive;

/// Message kinds the client consumes or produces by name.
///
/// The wire carries plenty of other values; those are routed as raw
/// [`MsgKind`](crate::MsgKind)s without appearing here.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive)]
#[repr(i32)]
pub enum EMsg {
    Invalid = 0,
    Multi = 1,
    ServiceMethod = 146,
    ServiceMethodResponse = 147,
    ClientHeartBeat = 703,
    ClientLogOnResponse = 751,
    ClientLoggedOff = 757,
    ClientPersonaState = 766,
    ClientFriendsList = 767,
    ClientCMList = 783,
    ClientChatMsg = 799,
    ClientUpdateMachineAuth = 1216,
    ClientUpdateMachineAuthResponse = 1217,
    ChannelEncryptRequest = 1303,
    ChannelEncryptResponse = 1304,
    ChannelEncryptResult = 1305,
    ClientLogOff = 5502,
    ClientLogOn = 5514,
    ClientRequestWebAPIAuthenticateUserNonce = 5585,
    ClientRequestWebAPIAuthenticateUserNonceResponse = 5586,
}

impl MsgKindEnum for EMsg {
    fn enum_value(&self) -> i32 {
        *self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MsgKind, PROTO_MASK};

    #[test]
    fn roundtrip_known_kinds() {
        for kind in [
            EMsg::ChannelEncryptRequest,
            EMsg::ClientLogOn,
            EMsg::ServiceMethodResponse,
        ] {
            assert_eq!(EMsg::try_from(kind.enum_value()).unwrap(), kind);
        }
    }

    #[test]
    fn proto_mask_encoding() {
        assert_eq!(
            EMsg::ClientLogOn.encode_kind(true),
            5514 | PROTO_MASK
        );
        assert_eq!(EMsg::ChannelEncryptResponse.encode_kind(false), 1304);
    }

    #[test]
    fn msg_kind_compares_against_emsg() {
        let kind = MsgKind(751);
        assert_eq!(kind, EMsg::ClientLogOnResponse);
        assert_ne!(MsgKind(752), EMsg::ClientLogOnResponse);
    }
}
