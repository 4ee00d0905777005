//! High level client: one handle owning the reconnecting session, the web
//! client and the typed event stream.

use crate::auth::{Credentials, FileSentryStore, SentryStore};
use crate::config::{Intents, NetConfig};
use crate::confirmation::ConfirmationEngine;
use crate::connection::reconnect::{AutoReconnectSession, ConnectionEvent};
use crate::connection::{Connection, ConnectionListener};
use crate::serverlist::ServerList;
use crate::session::ConnectionError;
use crate::steam_id::SteamId;
use crate::trade::{PollOptions, TradeEngine, TradeEvent};
use crate::web::WebClient;
use steam_flue_proto::friends::{
    CMsgClientFriendsList, CMsgClientPersonaState, FriendMessageIncoming,
};
use tokio::spawn;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tracing::debug;

/// Discriminated union of everything the client can hand the application.
#[derive(Debug, Clone)]
pub enum Event {
    /// Session lifecycle; `Disconnected` strictly precedes the next `Ready`.
    Connection(ConnectionEvent),
    Persona(PersonaUpdate),
    Friend(FriendUpdate),
    ChatMessage(ChatMessage),
    Trade(TradeEvent),
}

#[derive(Debug, Clone)]
pub struct PersonaUpdate {
    pub steam_id: SteamId,
    pub persona_state: u32,
    pub player_name: Option<String>,
    pub game_name: Option<String>,
    pub game_app_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FriendUpdate {
    pub steam_id: SteamId,
    pub relationship: u32,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub from: SteamId,
    pub message: String,
    pub server_timestamp: u32,
}

/// A connected steam user account.
pub struct SteamClient<S: SentryStore + Clone + Sync = FileSentryStore> {
    session: AutoReconnectSession<S>,
    web: WebClient,
    config: NetConfig,
    events_tx: mpsc::Sender<Event>,
}

impl SteamClient<FileSentryStore> {
    /// Log in and start the event pump.
    pub async fn login(
        credentials: Credentials,
        config: NetConfig,
    ) -> Result<(Self, mpsc::Receiver<Event>), ConnectionError> {
        let config = config.normalized();
        let sentry_store = FileSentryStore::new(&config.sentry_path);
        Self::login_with_sentry_store(credentials, config, sentry_store).await
    }
}

impl<S: SentryStore + Clone + Sync> SteamClient<S> {
    /// Log in with a custom sentry store.
    pub async fn login_with_sentry_store(
        credentials: Credentials,
        config: NetConfig,
        sentry_store: S,
    ) -> Result<(Self, mpsc::Receiver<Event>), ConnectionError> {
        let config = config.normalized();
        let server_list = match &config.cm_cache_path {
            Some(path) => ServerList::with_cache(path),
            None => ServerList::discover().await?,
        };
        let web = WebClient::new();
        let session = AutoReconnectSession::login(
            server_list,
            web.clone(),
            credentials,
            sentry_store,
            config.reconnect,
        )
        .await?;

        let (events_tx, events_rx) = mpsc::channel(64);
        let client = SteamClient {
            session,
            web,
            config,
            events_tx,
        };
        client.spawn_pump();
        Ok((client, events_rx))
    }

    fn spawn_pump(&self) {
        let session = self.session.clone();
        let intents = self.config.intents;
        let tx = self.events_tx.clone();

        if let Some(connection) = session.connection() {
            spawn_stream_forwarders(&connection, intents, tx.clone());
        }

        spawn(async move {
            let mut connection_events = session.events();
            loop {
                let event = match connection_events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if event == ConnectionEvent::Ready {
                    if let Some(connection) = session.connection() {
                        spawn_stream_forwarders(&connection, intents, tx.clone());
                    }
                }
                if tx.send(Event::Connection(event)).await.is_err() {
                    break;
                }
            }
            debug!("event pump stopping");
        });
    }

    /// The live connection, absent while reconnecting.
    pub fn connection(&self) -> Option<Connection> {
        self.session.connection()
    }

    pub fn web(&self) -> &WebClient {
        &self.web
    }

    pub fn steam_id(&self) -> Option<SteamId> {
        self.connection().map(|connection| connection.steam_id())
    }

    /// Build the confirmation engine for this account.
    pub fn confirmations(&self, identity_secret: impl Into<String>) -> Option<ConfirmationEngine> {
        self.steam_id()
            .map(|steam_id| ConfirmationEngine::new(self.web.clone(), steam_id, identity_secret))
    }

    /// Build and start the trade engine, forwarding its events into the
    /// client stream when the trades intent is enabled.
    pub fn start_trades(
        &self,
        api_key: impl Into<String>,
        identity_secret: Option<String>,
    ) -> TradeEngine {
        let options = PollOptions {
            poll_interval: self.config.poll_interval,
            poll_interval_max: self.config.poll_interval_max,
            replay_historical: self.config.replay_historical_trades,
        };
        let mut engine = TradeEngine::new(self.web.clone(), api_key, options);
        if let Some(confirmations) = identity_secret.and_then(|secret| self.confirmations(secret)) {
            engine = engine.with_confirmations(confirmations);
        }

        if self.config.intents.contains(Intents::TRADES) {
            let (mut rx, _handle) = engine.start();
            let tx = self.events_tx.clone();
            spawn(async move {
                while let Some(event) = rx.recv().await {
                    if tx.send(Event::Trade(event)).await.is_err() {
                        break;
                    }
                }
            });
        }
        engine
    }

    /// Log off and stop the pump.
    pub async fn close(&self) {
        self.session.close().await;
    }
}

/// Attach per-session message forwarders; they end when the session dies and
/// are re-attached on the next `Ready`.
fn spawn_stream_forwarders(connection: &Connection, intents: Intents, tx: mpsc::Sender<Event>) {
    if intents.contains(Intents::PERSONA) {
        let mut stream = Box::pin(connection.on::<CMsgClientPersonaState>());
        let tx = tx.clone();
        spawn(async move {
            while let Some(Ok(state)) = stream.next().await {
                for friend in state.friends {
                    let update = PersonaUpdate {
                        steam_id: friend.friendid.unwrap_or_default().into(),
                        persona_state: friend.persona_state.unwrap_or_default(),
                        player_name: friend.player_name,
                        game_name: friend.game_name,
                        game_app_id: friend.game_played_app_id,
                    };
                    if tx.send(Event::Persona(update)).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    if intents.contains(Intents::FRIENDS) {
        let mut stream = Box::pin(connection.on::<CMsgClientFriendsList>());
        let tx = tx.clone();
        spawn(async move {
            while let Some(Ok(list)) = stream.next().await {
                for friend in list.friends {
                    let update = FriendUpdate {
                        steam_id: friend.ulfriendid.unwrap_or_default().into(),
                        relationship: friend.efriendrelationship.unwrap_or_default(),
                    };
                    if tx.send(Event::Friend(update)).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    if intents.contains(Intents::CHAT) {
        let mut stream = Box::pin(connection.on_notification::<FriendMessageIncoming>());
        let tx = tx.clone();
        spawn(async move {
            while let Some(Ok(incoming)) = stream.next().await {
                let message = ChatMessage {
                    from: incoming.steamid_friend.unwrap_or_default().into(),
                    message: incoming
                        .message_no_bbcode
                        .or(incoming.message)
                        .unwrap_or_default(),
                    server_timestamp: incoming.rtime32_server_timestamp.unwrap_or_default(),
                };
                if tx.send(Event::ChatMessage(message)).await.is_err() {
                    return;
                }
            }
        });
    }
}
