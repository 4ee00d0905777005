use crate::message::ServiceMethodNotification;
use crate::net::{JobId, RawNetMessage};
use dashmap::DashMap;
use futures_util::Stream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use steam_flue_proto::{EMsg, MsgKind};
use tokio::time::Instant;
use tokio::spawn;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Most recent unrouted messages kept for [`MessageFilter::unprocessed`].
const UNPROCESSED_LIMIT: usize = 32;

/// Routes incoming messages to whoever asked for them.
///
/// Messages with a target job id wake the pending slot registered for that
/// id and are never fanned out; everything else goes to kind and
/// notification subscribers, each of which sees every matching message in
/// wire-arrival order.
#[derive(Clone)]
pub struct MessageFilter {
    job_id_filters: Arc<DashMap<JobId, oneshot::Sender<RawNetMessage>>>,
    notification_filters: Arc<DashMap<&'static str, broadcast::Sender<ServiceMethodNotification>>>,
    kind_filters: Arc<DashMap<MsgKind, broadcast::Sender<RawNetMessage>>>,
    oneshot_kind_filters: Arc<DashMap<MsgKind, oneshot::Sender<RawNetMessage>>>,
    unprocessed: Arc<Mutex<VecDeque<RawNetMessage>>>,
    last_received: Arc<Mutex<Instant>>,
    closed: CancellationToken,
}

impl MessageFilter {
    pub fn new<
        Input: Stream<Item = crate::connection::Result<RawNetMessage>> + Send + Unpin + 'static,
    >(
        mut source: Input,
    ) -> Self {
        let filter = MessageFilter {
            job_id_filters: Default::default(),
            notification_filters: Default::default(),
            kind_filters: Default::default(),
            oneshot_kind_filters: Default::default(),
            unprocessed: Arc::new(Mutex::new(VecDeque::new())),
            last_received: Arc::new(Mutex::new(Instant::now())),
            closed: CancellationToken::new(),
        };

        let filter_send = filter.clone();
        spawn(async move {
            loop {
                tokio::select! {
                    _ = filter_send.closed.cancelled() => break,
                    res = source.next() => match res {
                        Some(Ok(message)) => filter_send.dispatch(message),
                        Some(Err(err)) => {
                            error!(error = ?err, "Error while reading message");
                        }
                        None => break,
                    },
                }
            }
            debug!("message stream ended, closing filter");
            filter_send.close();
        });
        filter
    }

    fn dispatch(&self, message: RawNetMessage) {
        *self.last_received.lock().expect("not poisoned") = Instant::now();
        debug!(job_id = message.header.target_job_id.0, kind = ?message.kind, "processing message");
        if !message.header.target_job_id.is_none() {
            if let Some((_, tx)) = self.job_id_filters.remove(&message.header.target_job_id) {
                tx.send(message).ok();
                return;
            }
        }
        if let Some((_, tx)) = self.oneshot_kind_filters.remove(&message.kind) {
            tx.send(message).ok();
        } else if message.kind == EMsg::ServiceMethod {
            let notification = ServiceMethodNotification::from_raw(message);
            debug!(
                job_name = notification.job_name.as_str(),
                "processing notification"
            );
            if let Some(tx) = self
                .notification_filters
                .get(notification.job_name.as_str())
            {
                tx.send(notification).ok();
            }
        } else if let Some(tx) = self.kind_filters.get(&message.kind) {
            tx.send(message).ok();
        } else {
            debug!(kind = ?message.kind, "Unhandled message");
            let mut unprocessed = self.unprocessed.lock().expect("not poisoned");
            if unprocessed.len() == UNPROCESSED_LIMIT {
                unprocessed.pop_front();
            }
            unprocessed.push_back(message);
        }
    }

    /// Cancel every pending slot and detach all subscribers.
    ///
    /// Pending `on_job_id`/`one_kind` receivers resolve with a recv error
    /// which callers surface as `Disconnected`; broadcast subscribers see
    /// their stream end.
    pub fn close(&self) {
        self.job_id_filters.clear();
        self.oneshot_kind_filters.clear();
        self.notification_filters.clear();
        self.kind_filters.clear();
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the read loop has stopped.
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Token mirroring [`MessageFilter::closed`], for tasks that outlive a
    /// borrow of the filter.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Instant of the last message received, whatever its kind.
    pub fn last_received(&self) -> Instant {
        *self.last_received.lock().expect("not poisoned")
    }

    pub fn on_job_id(&self, id: JobId) -> oneshot::Receiver<RawNetMessage> {
        let (tx, rx) = oneshot::channel();
        if self.is_closed() {
            // leave tx to drop so the receiver resolves immediately
            return rx;
        }
        self.job_id_filters.insert(id, tx);
        rx
    }

    /// Forget a pending slot, dropping any late-arriving response.
    pub fn cancel_job_id(&self, id: JobId) {
        self.job_id_filters.remove(&id);
    }

    pub fn on_notification(
        &self,
        job_name: &'static str,
    ) -> broadcast::Receiver<ServiceMethodNotification> {
        let tx = self
            .notification_filters
            .entry(job_name)
            .or_insert_with(|| broadcast::channel(16).0);
        tx.subscribe()
    }

    pub fn on_kind<K: Into<MsgKind>>(&self, kind: K) -> broadcast::Receiver<RawNetMessage> {
        let tx = self
            .kind_filters
            .entry(kind.into())
            .or_insert_with(|| broadcast::channel(16).0);
        tx.subscribe()
    }

    pub fn one_kind<K: Into<MsgKind>>(&self, kind: K) -> oneshot::Receiver<RawNetMessage> {
        let (tx, rx) = oneshot::channel();
        if self.is_closed() {
            return rx;
        }
        self.oneshot_kind_filters.insert(kind.into(), tx);
        rx
    }

    /// Drain the buffer of messages no filter matched.
    pub fn unprocessed(&self) -> Vec<RawNetMessage> {
        self.unprocessed
            .lock()
            .expect("not poisoned")
            .drain(..)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetMessageHeader;
    use bytes::BytesMut;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    fn raw(kind: i32, target_job: JobId) -> RawNetMessage {
        RawNetMessage {
            kind: MsgKind(kind),
            is_protobuf: true,
            header: NetMessageHeader {
                target_job_id: target_job,
                ..NetMessageHeader::default()
            },
            data: BytesMut::new(),
        }
    }

    fn notification(job_name: &str) -> RawNetMessage {
        RawNetMessage {
            kind: EMsg::ServiceMethod.into(),
            is_protobuf: true,
            header: NetMessageHeader {
                target_job_name: Some(job_name.into()),
                ..NetMessageHeader::default()
            },
            data: BytesMut::new(),
        }
    }

    fn filter_with_source() -> (MessageFilter, mpsc::Sender<crate::connection::Result<RawNetMessage>>) {
        let (tx, rx) = mpsc::channel(32);
        (MessageFilter::new(ReceiverStream::new(rx)), tx)
    }

    #[tokio::test]
    async fn routes_by_job_id() {
        let (filter, tx) = filter_with_source();
        let waiting = filter.on_job_id(JobId(5));
        tx.send(Ok(raw(147, JobId(5)))).await.unwrap();
        let msg = waiting.await.unwrap();
        assert_eq!(msg.header.target_job_id, JobId(5));
    }

    #[tokio::test]
    async fn job_reply_not_fanned_out() {
        let (filter, tx) = filter_with_source();
        let mut on_kind = filter.on_kind(MsgKind(147));
        let waiting = filter.on_job_id(JobId(5));
        tx.send(Ok(raw(147, JobId(5)))).await.unwrap();
        waiting.await.unwrap();
        // subscriber saw nothing, the slot consumed the message
        assert!(matches!(
            on_kind.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn fan_out_to_all_subscribers_in_order() {
        let (filter, tx) = filter_with_source();
        let mut first = filter.on_kind(MsgKind(766));
        let mut second = filter.on_kind(MsgKind(766));
        for job in [1u64, 2, 3] {
            let mut msg = raw(766, JobId::NONE);
            msg.header.source_job_id = JobId(job);
            tx.send(Ok(msg)).await.unwrap();
        }
        for expected in [1u64, 2, 3] {
            assert_eq!(first.recv().await.unwrap().header.source_job_id.0, expected);
            assert_eq!(second.recv().await.unwrap().header.source_job_id.0, expected);
        }
    }

    #[tokio::test]
    async fn routes_notifications_by_job_name() {
        let (filter, tx) = filter_with_source();
        let mut rx = filter.on_notification("IFriendMessages.IncomingMessage#1");
        tx.send(Ok(notification("IFriendMessages.IncomingMessage#1")))
            .await
            .unwrap();
        tx.send(Ok(notification("ISomethingElse.Event#1")))
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.job_name, "IFriendMessages.IncomingMessage#1");
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn close_cancels_pending_slots() {
        let (filter, tx) = filter_with_source();
        let waiting = filter.on_job_id(JobId(9));
        drop(tx);
        // reader task drains and closes
        filter.closed().await;
        assert!(waiting.await.is_err());
        // registration after close resolves immediately
        assert!(filter.on_job_id(JobId(10)).await.is_err());
    }

    #[tokio::test]
    async fn unmatched_messages_buffered_up_to_limit() {
        let (filter, tx) = filter_with_source();
        for i in 0..40u64 {
            let mut msg = raw(9999, JobId::NONE);
            msg.header.source_job_id = JobId(i);
            tx.send(Ok(msg)).await.unwrap();
        }
        drop(tx);
        filter.closed().await;
        let unprocessed = filter.unprocessed();
        assert_eq!(unprocessed.len(), UNPROCESSED_LIMIT);
        // oldest entries were evicted
        assert_eq!(unprocessed[0].header.source_job_id.0, 8);
    }
}
