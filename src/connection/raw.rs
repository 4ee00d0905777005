use super::Result;
use crate::connection::{ConnectionImpl, MessageFilter, MessageSender};
use crate::message::{flatten_multi, EncodableMessage};
use crate::net::{NetMessageHeader, NetworkError, RawNetMessage};
use crate::serverlist::{CmEndpoint, CmScheme};
use crate::session::{ConnectionError, Session};
use crate::transport;
use futures_util::{Sink, SinkExt, Stream};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use steam_flue_proto::login::CMsgClientHeartBeat;
use steam_flue_proto::MsgKindEnum;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio::{select, spawn};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, warn};

/// Outgoing messages queued towards the writer task; senders suspend once
/// this fills up.
const SEND_QUEUE_LIMIT: usize = 64;

/// Missed-heartbeat multiple after which the connection is declared dead.
const WATCHDOG_MULTIPLE: u32 = 3;

#[derive(Clone)]
pub(crate) struct RawConnection {
    pub session: Session,
    pub filter: MessageFilter,
    pub timeout: Duration,
    pub sender: MessageSender,
    background_cancellation_token: CancellationToken,
    _background_drop_guard: Arc<DropGuard>,
}

impl Debug for RawConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection").finish_non_exhaustive()
    }
}

impl RawConnection {
    pub async fn connect(endpoint: &CmEndpoint) -> Result<Self, ConnectionError> {
        match endpoint.scheme {
            CmScheme::Tcp => {
                let (receiver, sender) = transport::tcp::connect(endpoint.addr()).await?;
                Self::from_sender_receiver(sender, receiver)
            }
            CmScheme::WebSocket => {
                let (receiver, sender) = transport::websocket::connect(&endpoint.ws_url()).await?;
                Self::from_sender_receiver(sender, receiver)
            }
        }
    }

    /// Assemble a connection from a transport pair.
    ///
    /// This is the seam tests and custom transports plug into; the receiver
    /// is expected to yield fully decoded messages.
    pub fn from_sender_receiver<
        Sender: Sink<RawNetMessage, Error = NetworkError> + Send + Unpin + 'static,
        Receiver: Stream<Item = Result<RawNetMessage>> + Send + Unpin + 'static,
    >(
        mut sender: Sender,
        receiver: Receiver,
    ) -> Result<Self, ConnectionError> {
        let filter = MessageFilter::new(flatten_multi(receiver));
        let background_cancellation_token = CancellationToken::new();

        // single writer task drains the bounded queue
        let (tx, mut rx) = mpsc::channel::<RawNetMessage>(SEND_QUEUE_LIMIT);
        let write_cancellation = filter.closed_token();
        spawn(async move {
            loop {
                select! {
                    _ = write_cancellation.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = sender.send(msg).await {
                                error!(error = ?e, "failed to write message, closing connection");
                                write_cancellation.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("writer task stopping");
        });

        Ok(RawConnection {
            session: Session::default(),
            filter,
            sender: MessageSender { tx },
            timeout: Duration::from_secs(10),
            background_cancellation_token: background_cancellation_token.clone(),
            // dropping the last clone of the connection stops the heartbeat
            // and watchdog tasks
            _background_drop_guard: Arc::new(background_cancellation_token.drop_guard()),
        })
    }

    /// Start the heartbeat and the 3x-interval read watchdog.
    pub fn setup_heartbeat(&self) {
        let sender = self.sender.clone();
        let interval = self.session.heartbeat_interval;
        let header = self.session.header(false);
        debug!("Setting up heartbeat with interval {:?}", interval);
        let token = self.background_cancellation_token.clone();
        let closed = self.filter.closed_token();
        spawn(async move {
            loop {
                select! {
                    _ = sleep(interval) => {},
                    _ = token.cancelled() => break,
                    _ = closed.cancelled() => break,
                };
                debug!("Sending heartbeat message");
                match RawNetMessage::from_message(header.clone(), CMsgClientHeartBeat::default()) {
                    Ok(msg) => {
                        if let Err(e) = sender.send_raw(msg).await {
                            error!(error = ?e, "Failed to send heartbeat message");
                        }
                    }
                    Err(e) => {
                        error!(error = ?e, "Failed to prepare heartbeat message")
                    }
                }
            }
            debug!("Heartbeat task stopping");
        });

        let filter = self.filter.clone();
        let token = self.background_cancellation_token.clone();
        spawn(async move {
            let limit = interval * WATCHDOG_MULTIPLE;
            loop {
                select! {
                    _ = sleep(interval) => {},
                    _ = token.cancelled() => break,
                    _ = filter.closed() => break,
                };
                let silence = filter.last_received().elapsed();
                if silence > limit {
                    warn!(?silence, "no server frames within the watchdog window");
                    filter.close();
                    break;
                }
            }
            debug!("Watchdog task stopping");
        });
    }

    /// Tear the connection down, cancelling every pending slot.
    pub fn close(&self) {
        self.filter.close();
    }
}

impl ConnectionImpl for RawConnection {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn filter(&self) -> &MessageFilter {
        &self.filter
    }

    fn session(&self) -> &Session {
        &self.session
    }

    async fn raw_send_with_kind<Msg: EncodableMessage + Send, K: MsgKindEnum + Send>(
        &self,
        header: NetMessageHeader,
        msg: Msg,
        kind: K,
        is_protobuf: bool,
    ) -> Result<()> {
        let msg = RawNetMessage::from_message_with_kind(header, msg, kind, is_protobuf)?;
        self.sender.send_raw(msg).await
    }
}
