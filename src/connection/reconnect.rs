use crate::auth::{Credentials, SentryStore};
use crate::config::ReconnectConfig;
use crate::connection::unauthenticated::UnAuthenticatedConnection;
use crate::connection::{Connection, ConnectionImpl};
use crate::serverlist::{CmEndpoint, ServerList};
use crate::session::{ConnectionError, LoginError};
use crate::web::WebClient;
use rand::Rng;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use steam_flue_proto::base::CMsgClientCMList;
use steam_flue_proto::login::CMsgClientLoggedOff;
use steam_flue_proto::{EMsg, EResult};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection lifecycle events, in guaranteed order: every `Ready` after the
/// first is preceded by exactly one `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Ready,
    Disconnected { reason: Option<EResult> },
}

#[derive(Clone)]
enum AuthMode<S: SentryStore + Clone> {
    Anonymous,
    Credentials {
        credentials: Credentials,
        sentry_store: S,
    },
}

/// A connection handle that survives transport failures.
///
/// Each reconnect produces a brand new session behind the same handle;
/// consumers resubscribe their message filters on `Ready`.
#[derive(Clone)]
pub struct AutoReconnectSession<S: SentryStore + Clone + Sync> {
    server_list: ServerList,
    web: WebClient,
    auth: AuthMode<S>,
    config: ReconnectConfig,
    current: Arc<RwLock<Option<Connection>>>,
    events: broadcast::Sender<ConnectionEvent>,
    cancellation: CancellationToken,
}

impl<S: SentryStore + Clone + Sync> AutoReconnectSession<S> {
    /// Connect anonymously and keep the session alive.
    pub async fn anonymous(
        server_list: ServerList,
        web: WebClient,
        config: ReconnectConfig,
    ) -> Result<Self, ConnectionError>
    where
        S: Default,
    {
        Self::start(server_list, web, AuthMode::Anonymous, config).await
    }

    /// Log in with credentials and keep the session alive.
    ///
    /// The first login surfaces its errors directly so the caller can react
    /// to guard prompts; only established sessions are reconnected.
    pub async fn login(
        server_list: ServerList,
        web: WebClient,
        credentials: Credentials,
        sentry_store: S,
        config: ReconnectConfig,
    ) -> Result<Self, ConnectionError> {
        Self::start(
            server_list,
            web,
            AuthMode::Credentials {
                credentials,
                sentry_store,
            },
            config,
        )
        .await
    }

    async fn start(
        server_list: ServerList,
        web: WebClient,
        auth: AuthMode<S>,
        config: ReconnectConfig,
    ) -> Result<Self, ConnectionError> {
        let (events, _) = broadcast::channel(16);
        let this = AutoReconnectSession {
            server_list,
            web,
            auth,
            config,
            current: Arc::new(RwLock::new(None)),
            events,
            cancellation: CancellationToken::new(),
        };

        let endpoint = this.server_list.pick().await?;
        let connection = this.connect_once(&endpoint).await?;
        this.install(connection.clone());
        this.events.send(ConnectionEvent::Ready).ok();

        let monitor = this.clone();
        spawn(async move { monitor.run(connection).await });
        Ok(this)
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.current.read().expect("not poisoned").clone()
    }

    /// Subscribe to `Ready`/`Disconnected` events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Log off cleanly and stop reconnecting.
    pub async fn close(&self) {
        self.cancellation.cancel();
        if let Some(connection) = self.connection() {
            connection.logoff().await.ok();
        }
    }

    fn install(&self, connection: Connection) {
        *self.current.write().expect("not poisoned") = Some(connection);
    }

    async fn connect_once(&self, endpoint: &CmEndpoint) -> Result<Connection, ConnectionError> {
        let unauth = match UnAuthenticatedConnection::connect_endpoint(endpoint).await {
            Ok(unauth) => unauth,
            Err(e) => {
                self.server_list.mark_bad(endpoint);
                return Err(e);
            }
        };
        match &self.auth {
            AuthMode::Anonymous => unauth.anonymous().await,
            AuthMode::Credentials {
                credentials,
                sentry_store,
            } => {
                unauth
                    .login(credentials, sentry_store.clone(), &self.web)
                    .await
            }
        }
    }

    async fn run(self, mut connection: Connection) {
        loop {
            let reason = self.watch(&connection).await;
            if self.cancellation.is_cancelled() {
                return;
            }
            info!(?reason, "session lost, reconnecting");
            self.events
                .send(ConnectionEvent::Disconnected { reason })
                .ok();

            connection = match self.reconnect(reason).await {
                Some(connection) => connection,
                None => return,
            };
            self.install(connection.clone());
            self.events.send(ConnectionEvent::Ready).ok();
        }
    }

    /// Watch one connection until it dies, feeding pushed CM lists into the
    /// directory along the way.
    async fn watch(&self, connection: &Connection) -> Option<EResult> {
        let mut logged_off = connection.filter().on_kind(EMsg::ClientLoggedOff);
        let mut cm_lists = connection.filter().on_kind(EMsg::ClientCMList);
        loop {
            select! {
                _ = self.cancellation.cancelled() => return None,
                _ = connection.closed() => return None,
                msg = logged_off.recv() => {
                    if let Ok(raw) = msg {
                        let reason = raw
                            .into_message::<CMsgClientLoggedOff>()
                            .ok()
                            .and_then(|m| m.eresult)
                            .map(EResult::from);
                        connection.raw().close();
                        return reason;
                    }
                }
                msg = cm_lists.recv() => {
                    if let Ok(raw) = msg {
                        if let Ok(list) = raw.into_message::<CMsgClientCMList>() {
                            self.merge_cm_list(list);
                        }
                    }
                }
            }
        }
    }

    fn merge_cm_list(&self, list: CMsgClientCMList) {
        let mut endpoints: Vec<CmEndpoint> = list
            .cm_addresses
            .iter()
            .zip(list.cm_ports.iter())
            .map(|(addr, port)| {
                let ip = std::net::Ipv4Addr::from(*addr);
                CmEndpoint::tcp(ip.to_string(), *port as u16)
            })
            .collect();
        endpoints.extend(
            list.cm_websocket_addresses
                .iter()
                .filter_map(|entry| entry.rsplit_once(':'))
                .filter_map(|(host, port)| Some(CmEndpoint::websocket(host, port.parse().ok()?))),
        );
        debug!(count = endpoints.len(), "merging pushed cm list");
        self.server_list.merge(endpoints);
    }

    /// Reconnect with decorrelated-jitter backoff until a session is
    /// established or the failure is fatal.
    async fn reconnect(&self, disconnect_reason: Option<EResult>) -> Option<Connection> {
        let base = self.config.base;
        let cap = self.config.cap;
        let mut previous = base;
        let mut kicked_others = false;

        if disconnect_reason == Some(EResult::LoggedInElsewhere)
            || disconnect_reason == Some(EResult::LogonSessionReplaced)
        {
            if !self.config.kick_others_on_reconnect {
                warn!("logged in elsewhere, yielding the session");
                return None;
            }
            kicked_others = true;
        }

        loop {
            if self.cancellation.is_cancelled() {
                return None;
            }

            let endpoint = match self.server_list.pick().await {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    error!(error = %e, "no endpoints available, giving up");
                    return None;
                }
            };

            match self.connect_once(&endpoint).await {
                Ok(connection) => {
                    self.server_list.clear_blacklist();
                    return Some(connection);
                }
                Err(ConnectionError::Login(LoginError::TryAnotherCM)) => {
                    // blacklist and go again without waiting
                    debug!(endpoint = %endpoint, "cm asked us to go elsewhere");
                    self.server_list.mark_bad(&endpoint);
                    continue;
                }
                Err(ConnectionError::Login(LoginError::LoggedInElsewhere)) => {
                    if self.config.kick_others_on_reconnect && !kicked_others {
                        kicked_others = true;
                        continue;
                    }
                    warn!("still logged in elsewhere, surrendering");
                    return None;
                }
                Err(ConnectionError::Login(e)) if e.is_fatal() => {
                    error!(error = %e, "fatal login failure, not reconnecting");
                    return None;
                }
                Err(e) => {
                    let wait = decorrelated_jitter(base, previous, cap);
                    warn!(error = %e, ?wait, "reconnect failed, backing off");
                    previous = wait;
                    select! {
                        _ = sleep(wait) => {}
                        _ = self.cancellation.cancelled() => return None,
                    }
                }
            }
        }
    }
}

/// Decorrelated jitter: sleep between `base` and three times the previous
/// sleep, capped.
fn decorrelated_jitter(base: Duration, previous: Duration, cap: Duration) -> Duration {
    let upper = (previous * 3).max(base);
    let wait = rand::thread_rng().gen_range(base..=upper);
    wait.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        let mut previous = base;
        for _ in 0..100 {
            let wait = decorrelated_jitter(base, previous, cap);
            assert!(wait >= base.min(cap));
            assert!(wait <= cap);
            previous = wait;
        }
    }

    #[test]
    fn jitter_grows_from_base() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        // with previous == base the wait is in [base, 3 * base]
        for _ in 0..100 {
            let wait = decorrelated_jitter(base, base, cap);
            assert!(wait <= base * 3);
        }
    }
}
