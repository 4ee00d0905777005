mod filter;
pub mod raw;
pub mod reconnect;
pub mod unauthenticated;

use crate::auth::{Credentials, SentryStore};
use crate::message::{
    EncodableMessage, NetMessage, ServiceMethodMessage, ServiceMethodResponseMessage,
};
use crate::net::{NetMessageHeader, NetworkError, RawNetMessage};
use crate::serverlist::ServerList;
use crate::session::{ConnectionError, Session};
use crate::steam_id::SteamId;
use crate::web::WebClient;
pub use filter::MessageFilter;
use futures_util::FutureExt;
use raw::RawConnection;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use steam_flue_proto::{EResult, MsgKindEnum, RpcMethod, RpcNotification};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::instrument;
pub use unauthenticated::UnAuthenticatedConnection;

pub(crate) type Result<T, E = NetworkError> = std::result::Result<T, E>;

/// Send raw messages to steam through the bounded write queue.
#[derive(Clone)]
pub struct MessageSender {
    pub(crate) tx: mpsc::Sender<RawNetMessage>,
}

impl MessageSender {
    /// Queue a message for the writer task, suspending while the queue is
    /// full.
    pub async fn send_raw(&self, raw_message: RawNetMessage) -> Result<()> {
        self.tx
            .send(raw_message)
            .await
            .map_err(|_| NetworkError::Disconnected)
    }
}

/// A logged-on connection to a steam CM.
#[derive(Clone)]
pub struct Connection(RawConnection);

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(raw: RawConnection) -> Self {
        Self(raw)
    }

    /// Connect and start an anonymous session.
    pub async fn anonymous(server_list: &ServerList) -> Result<Self, ConnectionError> {
        UnAuthenticatedConnection::connect(server_list)
            .await?
            .anonymous()
            .await
    }

    /// Connect and log in with credentials, minting web cookies on the way.
    pub async fn login<S: SentryStore>(
        server_list: &ServerList,
        credentials: &Credentials,
        sentry_store: S,
        web: &WebClient,
    ) -> Result<Self, ConnectionError> {
        UnAuthenticatedConnection::connect(server_list)
            .await?
            .login(credentials, sentry_store, web)
            .await
    }

    pub fn steam_id(&self) -> SteamId {
        self.session().steam_id
    }

    pub fn session_id(&self) -> i32 {
        self.session().session_id
    }

    pub fn cell_id(&self) -> u32 {
        self.session().cell_id
    }

    pub fn public_ip(&self) -> Option<IpAddr> {
        self.session().public_ip
    }

    pub fn ip_country_code(&self) -> Option<String> {
        self.session().ip_country_code.clone()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.0.timeout = timeout;
    }

    pub(crate) fn sender(&self) -> &MessageSender {
        &self.0.sender
    }

    pub(crate) fn raw(&self) -> &RawConnection {
        &self.0
    }

    /// Whether the underlying transport is still alive.
    pub fn is_closed(&self) -> bool {
        self.0.filter.is_closed()
    }

    /// Resolves when the underlying transport dies.
    pub async fn closed(&self) {
        self.0.filter.closed().await
    }

    /// Log off and close the transport.
    ///
    /// The CM side goes first; web cookie invalidation is the caller's
    /// best-effort follow-up.
    pub async fn logoff(&self) -> Result<()> {
        let header = self.session().header(false);
        self.0
            .raw_send_with_kind(
                header,
                steam_flue_proto::login::CMsgClientLogOff::default(),
                steam_flue_proto::EMsg::ClientLogOff,
                true,
            )
            .await?;
        self.0.close();
        Ok(())
    }

    /// Get all messages that haven't been matched by any filter.
    ///
    /// Note that at most 32 unprocessed messages are stored and calling
    /// this method clears the buffer.
    pub fn take_unprocessed(&self) -> Vec<RawNetMessage> {
        self.0.filter.unprocessed()
    }
}

pub(crate) trait ConnectionImpl: Sync + Debug {
    fn timeout(&self) -> Duration;
    fn filter(&self) -> &MessageFilter;
    fn session(&self) -> &Session;

    fn raw_send_with_kind<Msg: EncodableMessage + Send, K: MsgKindEnum + Send>(
        &self,
        header: NetMessageHeader,
        msg: Msg,
        kind: K,
        is_protobuf: bool,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// A trait for listening for messages coming from steam
pub trait ConnectionListener {
    /// Listen to unified-service notifications of a specific job name
    fn on_notification<T: RpcNotification>(&self) -> impl Stream<Item = Result<T>> + 'static;

    /// Wait for one message of a specific kind, also returning the header
    fn one_with_header<T: NetMessage + 'static>(
        &self,
    ) -> impl Future<Output = Result<(NetMessageHeader, T)>> + 'static;

    /// Wait for one message of a specific kind
    fn one<T: NetMessage + 'static>(&self) -> impl Future<Output = Result<T>> + 'static;

    /// Listen to messages of a specific kind, also returning the header
    fn on_with_header<T: NetMessage + 'static>(
        &self,
    ) -> impl Stream<Item = Result<(NetMessageHeader, T)>> + 'static;

    /// Listen to messages of a specific kind
    fn on<T: NetMessage + 'static>(&self) -> impl Stream<Item = Result<T>> + 'static;

    /// One-shot filtered subscription: the next message of the kind that
    /// matches `predicate`, or `Timeout` once the deadline passes.
    fn wait_for<T: NetMessage + Send + 'static, F: FnMut(&T) -> bool + Send + 'static>(
        &self,
        predicate: F,
        deadline: Duration,
    ) -> impl Future<Output = Result<T>> + Send + 'static;
}

/// A trait for sending messages to steam
pub trait ConnectionSender {
    /// Send a rpc-request to steam, waiting for the matching rpc-response
    fn service_method<Msg: RpcMethod + Send + Debug>(
        &self,
        msg: Msg,
    ) -> impl Future<Output = Result<Msg::Response>> + Send;

    /// Send a message to steam, waiting for a response with the same job id
    fn job<Msg: NetMessage + Send, Rsp: NetMessage + Send>(
        &self,
        msg: Msg,
    ) -> impl Future<Output = Result<Rsp>> + Send;

    /// Send a message to steam without waiting for a response
    fn send<Msg: NetMessage + Send>(&self, msg: Msg) -> impl Future<Output = Result<()>> + Send;

    /// Send a message to steam without waiting for a response, overwriting the kind of the message
    fn send_with_kind<Msg: NetMessage + Send, K: MsgKindEnum + Send>(
        &self,
        msg: Msg,
        kind: K,
    ) -> impl Future<Output = Result<()>> + Send;

    fn raw_send<Msg: NetMessage + Send>(
        &self,
        header: NetMessageHeader,
        msg: Msg,
    ) -> impl Future<Output = Result<()>> + Send;
}

impl ConnectionImpl for Connection {
    fn timeout(&self) -> Duration {
        self.0.timeout
    }

    fn filter(&self) -> &MessageFilter {
        &self.0.filter
    }

    fn session(&self) -> &Session {
        &self.0.session
    }

    async fn raw_send_with_kind<Msg: EncodableMessage + Send, K: MsgKindEnum + Send>(
        &self,
        header: NetMessageHeader,
        msg: Msg,
        kind: K,
        is_protobuf: bool,
    ) -> Result<()> {
        <RawConnection as ConnectionImpl>::raw_send_with_kind(&self.0, header, msg, kind, is_protobuf)
            .await
    }
}

impl<C: ConnectionImpl> ConnectionListener for C {
    fn on_notification<T: RpcNotification>(&self) -> impl Stream<Item = Result<T>> + 'static {
        BroadcastStream::new(self.filter().on_notification(T::NOTIFICATION_NAME))
            .filter_map(|res| res.ok())
            .map(|raw| raw.into_notification())
    }

    fn one_with_header<T: NetMessage + 'static>(
        &self,
    ) -> impl Future<Output = Result<(NetMessageHeader, T)>> + 'static {
        // async block instead of async fn, so we don't have to tie the lifetime of the returned future
        // to the lifetime of &self
        let fut = self.filter().one_kind(T::KIND);
        async move {
            let raw = fut.await.map_err(|_| NetworkError::Disconnected)?;
            raw.into_header_and_message()
        }
    }

    fn one<T: NetMessage + 'static>(&self) -> impl Future<Output = Result<T>> + 'static {
        self.one_with_header::<T>()
            .map(|res| res.map(|(_, msg)| msg))
    }

    fn on_with_header<T: NetMessage + 'static>(
        &self,
    ) -> impl Stream<Item = Result<(NetMessageHeader, T)>> + 'static {
        BroadcastStream::new(self.filter().on_kind(T::KIND)).map(|raw| {
            let raw = raw.map_err(|_| NetworkError::Disconnected)?;
            raw.into_header_and_message()
        })
    }

    fn on<T: NetMessage + 'static>(&self) -> impl Stream<Item = Result<T>> + 'static {
        self.on_with_header::<T>()
            .map(|res| res.map(|(_, msg)| msg))
    }

    fn wait_for<T: NetMessage + Send + 'static, F: FnMut(&T) -> bool + Send + 'static>(
        &self,
        mut predicate: F,
        deadline: Duration,
    ) -> impl Future<Output = Result<T>> + Send + 'static {
        let stream = BroadcastStream::new(self.filter().on_kind(T::KIND));
        async move {
            let matching = stream
                .filter_map(|raw| raw.ok())
                .filter_map(|raw| raw.into_message::<T>().ok())
                .filter(|msg| predicate(msg));
            let mut matching = std::pin::pin!(matching);
            match timeout(deadline, matching.next()).await {
                Ok(Some(msg)) => Ok(msg),
                Ok(None) => Err(NetworkError::Disconnected),
                Err(_) => Err(NetworkError::Timeout),
            }
        }
    }
}

impl<C: ConnectionImpl> ConnectionSender for C {
    async fn service_method<Msg: RpcMethod + Send + Debug>(&self, msg: Msg) -> Result<Msg::Response> {
        let mut header = self.session().header(true);
        header.target_job_name = Some(Msg::METHOD_NAME.into());
        let job_id = header.source_job_id;
        let recv = self.filter().on_job_id(job_id);
        self.raw_send(header, ServiceMethodMessage(msg)).await?;
        let raw = match timeout(self.timeout(), recv).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(_)) => return Err(NetworkError::Disconnected),
            Err(_) => {
                // forget the slot so a late response is dropped
                self.filter().cancel_job_id(job_id);
                return Err(NetworkError::Timeout);
            }
        };
        let eresult = raw.header.eresult();
        if !eresult.is_ok() && eresult != EResult::Invalid {
            return Err(NetworkError::Result(eresult));
        }
        raw.into_message::<ServiceMethodResponseMessage>()?
            .into_response::<Msg>()
    }

    async fn job<Msg: NetMessage + Send, Rsp: NetMessage + Send>(&self, msg: Msg) -> Result<Rsp> {
        let header = self.session().header(true);
        let job_id = header.source_job_id;
        let recv = self.filter().on_job_id(job_id);
        self.raw_send(header, msg).await?;
        match timeout(self.timeout(), recv).await {
            Ok(Ok(raw)) => raw.into_message(),
            Ok(Err(_)) => Err(NetworkError::Disconnected),
            Err(_) => {
                self.filter().cancel_job_id(job_id);
                Err(NetworkError::Timeout)
            }
        }
    }

    #[instrument(skip(self, msg), fields(kind = ?Msg::KIND))]
    fn send<Msg: NetMessage + Send>(&self, msg: Msg) -> impl Future<Output = Result<()>> + Send {
        self.raw_send(self.session().header(false), msg)
    }

    #[instrument(skip(self, msg, kind), fields(kind = ?kind))]
    fn send_with_kind<Msg: NetMessage + Send, K: MsgKindEnum + Send>(
        &self,
        msg: Msg,
        kind: K,
    ) -> impl Future<Output = Result<()>> + Send {
        let header = self.session().header(false);
        self.raw_send_with_kind(header, msg, kind, Msg::IS_PROTOBUF)
    }

    fn raw_send<Msg: NetMessage + Send>(
        &self,
        header: NetMessageHeader,
        msg: Msg,
    ) -> impl Future<Output = Result<()>> + Send {
        self.raw_send_with_kind(header, msg, Msg::KIND, Msg::IS_PROTOBUF)
    }
}
