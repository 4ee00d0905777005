//! Persona, friends-list and chat-message payloads for the event streams.

use crate::emsg::EMsg;
use crate::{ClientMessage, RpcNotification};
use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientPersonaState {
    #[prost(uint32, optional, tag = "1")]
    pub status_flags: Option<u32>,
    #[prost(message, repeated, tag = "2")]
    pub friends: Vec<PersonaStateFriend>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PersonaStateFriend {
    #[prost(fixed64, optional, tag = "1")]
    pub friendid: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub persona_state: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub game_played_app_id: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub persona_state_flags: Option<u32>,
    #[prost(string, optional, tag = "15")]
    pub player_name: Option<String>,
    #[prost(uint32, optional, tag = "45")]
    pub last_logoff: Option<u32>,
    #[prost(uint32, optional, tag = "46")]
    pub last_logon: Option<u32>,
    #[prost(string, optional, tag = "55")]
    pub game_name: Option<String>,
}

impl ClientMessage for CMsgClientPersonaState {
    const KIND: EMsg = EMsg::ClientPersonaState;
}

#[derive(Clone, PartialEq, Message)]
pub struct CMsgClientFriendsList {
    #[prost(bool, optional, tag = "1")]
    pub bincremental: Option<bool>,
    #[prost(message, repeated, tag = "2")]
    pub friends: Vec<FriendsListFriend>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FriendsListFriend {
    #[prost(fixed64, optional, tag = "1")]
    pub ulfriendid: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub efriendrelationship: Option<u32>,
}

impl ClientMessage for CMsgClientFriendsList {
    const KIND: EMsg = EMsg::ClientFriendsList;
}

/// Incoming friend message, delivered as a unified-service notification.
#[derive(Clone, PartialEq, Message)]
pub struct FriendMessageIncoming {
    #[prost(fixed64, optional, tag = "1")]
    pub steamid_friend: Option<u64>,
    #[prost(int32, optional, tag = "2")]
    pub chat_entry_type: Option<i32>,
    #[prost(string, optional, tag = "4")]
    pub message: Option<String>,
    #[prost(fixed32, optional, tag = "5")]
    pub rtime32_server_timestamp: Option<u32>,
    #[prost(string, optional, tag = "8")]
    pub message_no_bbcode: Option<String>,
}

impl RpcNotification for FriendMessageIncoming {
    const NOTIFICATION_NAME: &'static str = "IFriendMessages.IncomingMessage#1";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_state_roundtrip() {
        let state = CMsgClientPersonaState {
            status_flags: Some(0x7),
            friends: vec![PersonaStateFriend {
                friendid: Some(76561198020145915),
                persona_state: Some(1),
                player_name: Some("rossnomann".into()),
                ..PersonaStateFriend::default()
            }],
        };
        let decoded = CMsgClientPersonaState::decode(state.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, state);
    }
}
