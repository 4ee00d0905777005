//! A client for the steam CM network: authenticated sessions, the message
//! multiplexer, unified-service RPCs and the trade and confirmation engines.

pub mod auth;
pub mod client;
pub mod config;
pub mod confirmation;
pub mod connection;
pub mod message;
pub mod net;
mod serializers;
pub mod serverlist;
pub mod session;
pub mod steam_id;
pub mod trade;
pub mod transport;
pub mod web;

pub use client::{Event, SteamClient};
pub use config::{Intents, NetConfig};
pub use connection::reconnect::{AutoReconnectSession, ConnectionEvent};
pub use connection::{Connection, ConnectionListener, ConnectionSender, UnAuthenticatedConnection};
pub use message::NetMessage;
pub use net::NetworkError;
pub use serverlist::ServerList;
pub use session::{ConnectionError, LoginError};
pub use steam_id::SteamId;
pub use web::WebClient;

pub use steam_flue_proto as proto;
