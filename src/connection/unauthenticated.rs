use super::raw::RawConnection;
use super::Result;
use crate::auth::{
    fetch_password_key, mint_web_session, prepare_logon, unix_now, Credentials, SentryStore,
};
use crate::serverlist::ServerList;
use crate::session::{self, ConnectionError, LoginError};
use crate::{Connection, WebClient};
use steam_flue_crypto::guard;
use steam_flue_proto::machine_auth::{
    CMsgClientUpdateMachineAuth, CMsgClientUpdateMachineAuthResponse,
};
use steam_flue_proto::EMsg;
use tokio::sync::broadcast::error::RecvError;
use tokio::{select, spawn};
use tracing::{debug, error, warn};

/// A connection that has completed the channel handshake but not logged on.
pub struct UnAuthenticatedConnection(RawConnection);

impl UnAuthenticatedConnection {
    /// Connect to an endpoint picked from the server list.
    ///
    /// A failed endpoint is blacklisted for this session before the error is
    /// surfaced, so the next attempt tries elsewhere.
    pub async fn connect(server_list: &ServerList) -> Result<Self, ConnectionError> {
        let endpoint = server_list.pick().await?;
        match Self::connect_endpoint(&endpoint).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                server_list.mark_bad(&endpoint);
                Err(e)
            }
        }
    }

    /// Connect to one specific endpoint.
    pub async fn connect_endpoint(
        endpoint: &crate::serverlist::CmEndpoint,
    ) -> Result<Self, ConnectionError> {
        debug!(endpoint = %endpoint, "connecting");
        Ok(UnAuthenticatedConnection(
            RawConnection::connect(endpoint).await?,
        ))
    }

    /// Create a connection from a sender, receiver pair.
    ///
    /// This allows customizing the transport used by the connection, and is
    /// the seam tests inject in-memory transports through.
    pub fn from_sender_receiver<Sender, Receiver>(
        sender: Sender,
        receiver: Receiver,
    ) -> Result<Self, ConnectionError>
    where
        Sender: futures_sink::Sink<crate::net::RawNetMessage, Error = crate::net::NetworkError>
            + Send
            + Unpin
            + 'static,
        Receiver: tokio_stream::Stream<Item = Result<crate::net::RawNetMessage>>
            + Send
            + Unpin
            + 'static,
    {
        Ok(UnAuthenticatedConnection(RawConnection::from_sender_receiver(
            sender, receiver,
        )?))
    }

    /// Start an anonymous session with this connection.
    pub async fn anonymous(self) -> Result<Connection, ConnectionError> {
        let mut raw = self.0;
        raw.session = session::anonymous(&raw).await?;
        raw.setup_heartbeat();
        Ok(Connection::new(raw))
    }

    /// Run the credentials pipeline: RSA key fetch, wrapped-password logon
    /// with guard material, machine-auth handling and web-cookie minting.
    pub async fn login<S: SentryStore>(
        self,
        credentials: &Credentials,
        mut sentry_store: S,
        web: &WebClient,
    ) -> Result<Connection, ConnectionError> {
        let mut raw = self.0;

        let key = fetch_password_key(web, &credentials.account).await?;
        let sentry = sentry_store
            .load(&credentials.account)
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "failed to load sentry hash");
                None
            });
        if sentry.is_some() {
            debug!(account = credentials.account.as_str(), "found stored sentry hash");
        }

        let details = prepare_logon(credentials, &key, sentry.map(|h| h.to_vec()), unix_now())?;
        let session = match session::login(&raw, details).await {
            Ok(session) => session,
            Err(ConnectionError::Login(LoginError::TwoFactorRequired))
                if credentials.shared_secret.is_some() =>
            {
                // the server wants a code even though we sent one computed
                // from a possibly stale clock; compute a fresh one and retry
                warn!("two factor code rejected, retrying with a fresh code");
                let details =
                    prepare_logon(credentials, &key, sentry.map(|h| h.to_vec()), unix_now())?;
                session::login(&raw, details).await?
            }
            Err(e) => return Err(e),
        };
        raw.session = session;

        spawn_machine_auth_handler(&raw, credentials.account.clone(), sentry_store);
        raw.setup_heartbeat();

        let connection = Connection::new(raw);
        mint_web_session(&connection, web).await?;
        Ok(connection)
    }
}

/// Answer `ClientUpdateMachineAuth` challenges for the lifetime of the
/// connection, persisting the sentry hash as we go.
fn spawn_machine_auth_handler<S: SentryStore>(
    connection: &RawConnection,
    account: String,
    mut store: S,
) {
    let mut incoming = connection.filter.on_kind(EMsg::ClientUpdateMachineAuth);
    let sender = connection.sender.clone();
    let session = connection.session.clone();
    let closed = connection.filter.closed_token();

    spawn(async move {
        loop {
            let raw = select! {
                _ = closed.cancelled() => break,
                msg = incoming.recv() => match msg {
                    Ok(raw) => raw,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            };

            let source_job = raw.header.source_job_id;
            let request: CMsgClientUpdateMachineAuth = match raw.into_message() {
                Ok(request) => request,
                Err(e) => {
                    error!(error = %e, "malformed machine auth request");
                    continue;
                }
            };

            let bytes = request.bytes.unwrap_or_default();
            let hash = guard::sentry_hash(&bytes);
            debug!(len = bytes.len(), "answering machine auth challenge");
            if let Err(e) = store.store(&account, hash).await {
                error!(error = %e, "failed to persist sentry hash");
            }

            let mut header = session.header(false);
            header.target_job_id = source_job;
            let response = CMsgClientUpdateMachineAuthResponse {
                filename: request.filename,
                eresult: Some(1),
                filesize: Some(bytes.len() as u32),
                sha_file: Some(hash.to_vec()),
                offset: request.offset,
                cubwrote: request.cubtowrite,
            };
            match crate::net::RawNetMessage::from_message(header, response) {
                Ok(msg) => {
                    if let Err(e) = sender.send_raw(msg).await {
                        error!(error = %e, "failed to send machine auth response");
                    }
                }
                Err(e) => error!(error = %e, "failed to encode machine auth response"),
            }
        }
        debug!("machine auth handler stopping");
    });
}
