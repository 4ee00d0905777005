use super::event::TradeEvent;
use super::offer::{
    GetTradeOffersResponse, ServerTime, TradeOffer, TradeOfferState,
};
use crate::confirmation::{ConfirmationEngine, ConfirmationError};
use crate::web::{WebClient, WebError, API_HOST, COMMUNITY_HOST};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backdated updates show up after their `time_updated`; the cutoff is
/// pulled back by this much to catch them.
const POLL_CUTOFF_BUFFER_SECONDS: i64 = 60 * 30;

/// Fixed sleep after a server error on the poll endpoint; server errors do
/// not count toward the empty-poll backoff.
const SERVER_ERROR_RETRY: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("Invalid parameter: {0}")]
    Parameter(#[from] ParameterError),
    #[error("web request failed: {0}")]
    Web(#[from] WebError),
    #[error("offer is already closed in state {0}")]
    AlreadyClosed(TradeOfferState),
    #[error("{0}")]
    Confirmation(#[from] ConfirmationError),
    #[error("steam rejected the operation: {0}")]
    Response(String),
}

#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("Cannot accept an offer that is ours.")]
    CannotAcceptOfferThatIsOurs,
    #[error("Cannot accept an offer that is not active. Offer state: {0}")]
    CannotAcceptOfferThatIsNotActive(TradeOfferState),
    #[error("Cannot cancel an offer we did not create.")]
    CannotCancelOfferWeDidNotCreate,
    #[error("Cannot decline an offer we created.")]
    CannotDeclineOfferWeCreated,
    #[error("Cannot counter an offer we created.")]
    CannotCounterOfferWeCreated,
    #[error("Offer is empty.")]
    EmptyOffer,
    #[error("Not logged in")]
    NotLoggedIn,
}

pub type Result<T, E = TradeError> = std::result::Result<T, E>;

/// Poll cadence configuration.
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// Interval between polls; doubled on consecutive empty polls.
    pub poll_interval: Duration,
    /// Ceiling the interval backs off to.
    pub poll_interval_max: Duration,
    /// Emit events for offers already settled when the engine starts.
    pub replay_historical: bool,
}

impl Default for PollOptions {
    fn default() -> Self {
        PollOptions {
            poll_interval: Duration::from_secs(5),
            poll_interval_max: Duration::from_secs(30),
            replay_historical: false,
        }
    }
}

#[derive(Debug, Default)]
struct PollState {
    snapshot: HashMap<u64, TradeOffer>,
    last_poll_time: i64,
    emitted_terminal: HashMap<u64, TradeOfferState>,
    bootstrapped: bool,
}

/// Diff one poll response against the snapshot, emitting each lifecycle
/// transition exactly once.
fn diff_offers(
    state: &mut PollState,
    offers: Vec<TradeOffer>,
    now: ServerTime,
    replay_historical: bool,
) -> Vec<TradeEvent> {
    let mut events = Vec::new();
    let bootstrap = !state.bootstrapped;
    state.bootstrapped = true;
    let suppress = bootstrap && !replay_historical;

    let mut next: HashMap<u64, TradeOffer> = HashMap::with_capacity(offers.len());
    // offers that moved to Countered this poll, awaiting their replacement
    let mut countered_now: HashMap<u64, TradeOffer> = HashMap::new();
    let mut new_offers: Vec<TradeOffer> = Vec::new();

    for offer in offers {
        if offer.is_glitched() {
            continue;
        }
        if offer.updated_at.timestamp() > state.last_poll_time {
            state.last_poll_time = offer.updated_at.timestamp();
        }

        let previous_state = state.snapshot.get(&offer.id).map(|previous| previous.state);
        match previous_state {
            Some(previous) if previous != offer.state => {
                if offer.state == TradeOfferState::Countered {
                    countered_now.insert(offer.id, offer.clone());
                } else if let Some(event) = transition_event(state, &offer) {
                    events.push(event);
                }
                next.insert(offer.id, offer);
            }
            Some(_) => {
                // nothing changed
                next.insert(offer.id, offer);
            }
            None => {
                if suppress {
                    if offer.state.is_terminal() {
                        state.emitted_terminal.insert(offer.id, offer.state);
                    }
                    next.insert(offer.id, offer);
                } else {
                    new_offers.push(offer);
                }
            }
        }
    }

    // new offers second, so a counter pair sees the Countered predecessor
    for offer in new_offers {
        if let Some(before_id) = offer.countered_offer_id {
            let before = countered_now
                .remove(&before_id)
                .or_else(|| {
                    state
                        .snapshot
                        .get(&before_id)
                        .filter(|before| before.state == TradeOfferState::Countered)
                        .cloned()
                });
            if let Some(before) = before {
                events.push(TradeEvent::Counter {
                    before: Box::new(before),
                    after: Box::new(offer.clone()),
                });
            }
        }
        events.push(if offer.is_our_offer {
            TradeEvent::Send(offer.clone())
        } else {
            TradeEvent::Receive(offer.clone())
        });
        // an offer first seen in a terminal state never had an observed
        // non-terminal predecessor, so no transition event fires for it
        if offer.state.is_terminal() {
            if replay_historical && bootstrap {
                if let Some(event) = transition_event(state, &offer) {
                    events.push(event);
                }
            }
        }
        next.insert(offer.id, offer);
    }

    // offers that fell out of the response window
    for (id, old) in &state.snapshot {
        if next.contains_key(id) || countered_now.contains_key(id) {
            continue;
        }
        if old.state.is_terminal() {
            continue;
        }
        if old.expires_at <= now {
            let mut expired = old.clone();
            expired.state = TradeOfferState::Expired;
            if !state.emitted_terminal.contains_key(id) {
                state
                    .emitted_terminal
                    .insert(*id, TradeOfferState::Expired);
                events.push(TradeEvent::Expire(expired));
            }
        } else {
            // poll window artifact, keep it around
            next.insert(*id, old.clone());
        }
    }
    // unpaired countered offers stay in the snapshot for later pairing
    for (id, offer) in countered_now {
        next.insert(id, offer);
    }

    state.snapshot = next;
    events
}

fn transition_event(state: &mut PollState, offer: &TradeOffer) -> Option<TradeEvent> {
    if offer.state.is_terminal() {
        if state.emitted_terminal.contains_key(&offer.id) {
            return None;
        }
        state.emitted_terminal.insert(offer.id, offer.state);
    }
    match offer.state {
        TradeOfferState::Accepted => Some(TradeEvent::Accept(offer.clone())),
        TradeOfferState::Declined => Some(TradeEvent::Decline(offer.clone())),
        TradeOfferState::Canceled | TradeOfferState::CanceledBySecondFactor => {
            Some(TradeEvent::Cancel(offer.clone()))
        }
        TradeOfferState::Expired => Some(TradeEvent::Expire(offer.clone())),
        // Active, InEscrow, CreatedNeedsConfirmation, Invalid and friends
        // have no dedicated event
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct AcceptResponse {
    #[serde(default)]
    tradeid: Option<String>,
    #[serde(default)]
    needs_mobile_confirmation: bool,
    #[serde(rename = "strError", default)]
    str_error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendOfferResponse {
    #[serde(default)]
    tradeofferid: Option<String>,
    #[serde(default)]
    needs_mobile_confirmation: bool,
    #[serde(rename = "strError", default)]
    str_error: Option<String>,
}

/// Polls the trade-offer feed and turns state changes into exactly-once
/// events; also hosts the accept/decline/cancel/counter operations.
///
/// The snapshot lives above the CM session and survives reconnects.
#[derive(Clone)]
pub struct TradeEngine {
    web: WebClient,
    api_key: String,
    options: PollOptions,
    confirmations: Option<ConfirmationEngine>,
    state: Arc<Mutex<PollState>>,
    cancellation: CancellationToken,
}

impl TradeEngine {
    pub fn new(web: WebClient, api_key: impl Into<String>, options: PollOptions) -> Self {
        TradeEngine {
            web,
            api_key: api_key.into(),
            options,
            confirmations: None,
            state: Arc::new(Mutex::new(PollState::default())),
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach the confirmation engine used to finalize accepted trades.
    pub fn with_confirmations(mut self, confirmations: ConfirmationEngine) -> Self {
        self.confirmations = Some(confirmations);
        self
    }

    /// Stop the poll loop.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    /// Fetch the feed once and emit whatever changed.
    pub async fn poll_once(&self) -> Result<Vec<TradeEvent>> {
        let cutoff = {
            let state = self.state.lock().expect("not poisoned");
            (state.last_poll_time - POLL_CUTOFF_BUFFER_SECONDS).max(1)
        };
        let offers = self.fetch_offers(cutoff).await?;
        let mut state = self.state.lock().expect("not poisoned");
        Ok(diff_offers(
            &mut state,
            offers,
            Utc::now(),
            self.options.replay_historical,
        ))
    }

    /// Spawn the poll loop; events arrive on the returned channel until the
    /// engine is stopped or the receiver is dropped.
    pub fn start(&self) -> (mpsc::Receiver<TradeEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = engine.options.poll_interval;
            loop {
                tokio::select! {
                    _ = engine.cancellation.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                match engine.poll_once().await {
                    Ok(events) => {
                        interval = if events.is_empty() {
                            (interval * 2).min(engine.options.poll_interval_max)
                        } else {
                            engine.options.poll_interval
                        };
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(TradeError::Web(WebError::StatusCode(status)))
                        if status.is_server_error() =>
                    {
                        // transient on steam's side; wait out a fixed delay
                        // without touching the backoff
                        warn!(%status, "trade poll hit a server error");
                        sleep(SERVER_ERROR_RETRY).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "trade poll failed");
                    }
                }
            }
            debug!("trade poll loop stopping");
        });
        (rx, handle)
    }

    async fn fetch_offers(&self, historical_cutoff: i64) -> Result<Vec<TradeOffer>> {
        let response: GetTradeOffersResponse = self
            .web
            .get_json(
                &format!("{API_HOST}/IEconService/GetTradeOffers/v1/"),
                &[
                    ("key", self.api_key.clone()),
                    ("active_only", "0".into()),
                    ("get_sent_offers", "1".into()),
                    ("get_received_offers", "1".into()),
                    ("get_descriptions", "0".into()),
                    ("time_historical_cutoff", historical_cutoff.to_string()),
                ],
            )
            .await?;
        let body = response.response;
        Ok(body
            .trade_offers_sent
            .into_iter()
            .chain(body.trade_offers_received)
            .map(|raw| raw.into_offer())
            .collect())
    }

    /// The engine's last known state for an offer.
    fn known_state(&self, offer: &TradeOffer) -> TradeOfferState {
        self.state
            .lock()
            .expect("not poisoned")
            .snapshot
            .get(&offer.id)
            .map(|known| known.state)
            .unwrap_or(offer.state)
    }

    fn session_id(&self) -> Result<String> {
        self.web
            .session_id()
            .ok_or_else(|| ParameterError::NotLoggedIn.into())
    }

    /// Accept an incoming offer, resolving the mobile confirmation when one
    /// is required.
    pub async fn accept(&self, offer: &TradeOffer) -> Result<()> {
        if offer.is_our_offer {
            return Err(ParameterError::CannotAcceptOfferThatIsOurs.into());
        }
        let state = self.known_state(offer);
        if state.is_terminal() {
            return Err(TradeError::AlreadyClosed(state));
        }
        if state != TradeOfferState::Active {
            return Err(ParameterError::CannotAcceptOfferThatIsNotActive(state).into());
        }

        let url = format!("{COMMUNITY_HOST}/tradeoffer/{}/accept", offer.id);
        let response: AcceptResponse = self
            .web
            .post_form(
                &url,
                &[
                    ("sessionid", self.session_id()?),
                    ("serverid", "1".into()),
                    ("tradeofferid", offer.id.to_string()),
                    ("partner", u64::from(offer.partner).to_string()),
                    ("captcha", String::new()),
                ],
            )
            .await?;
        if let Some(message) = response.str_error {
            return Err(TradeError::Response(message));
        }
        debug!(offer = %offer, tradeid = ?response.tradeid, "accepted offer");

        if response.needs_mobile_confirmation {
            if let Some(confirmations) = &self.confirmations {
                confirmations.confirm_trade(offer.id).await?;
            }
        }
        Ok(())
    }

    /// Decline an incoming offer.
    pub async fn decline(&self, offer: &TradeOffer) -> Result<()> {
        if offer.is_our_offer {
            return Err(ParameterError::CannotDeclineOfferWeCreated.into());
        }
        let state = self.known_state(offer);
        if state.is_terminal() {
            return Err(TradeError::AlreadyClosed(state));
        }
        self.simple_op(offer, "decline").await
    }

    /// Cancel an offer we sent.
    pub async fn cancel(&self, offer: &TradeOffer) -> Result<()> {
        if !offer.is_our_offer {
            return Err(ParameterError::CannotCancelOfferWeDidNotCreate.into());
        }
        let state = self.known_state(offer);
        if state.is_terminal() {
            return Err(TradeError::AlreadyClosed(state));
        }
        self.simple_op(offer, "cancel").await
    }

    async fn simple_op(&self, offer: &TradeOffer, op: &str) -> Result<()> {
        let url = format!("{COMMUNITY_HOST}/tradeoffer/{}/{op}", offer.id);
        let _: serde_json::Value = self
            .web
            .post_form(&url, &[("sessionid", self.session_id()?)])
            .await?;
        debug!(offer = %offer, op, "offer resolved");
        Ok(())
    }

    /// Answer an incoming offer with different items.
    pub async fn counter(
        &self,
        offer: &TradeOffer,
        items_to_give: Vec<super::offer::Asset>,
        items_to_receive: Vec<super::offer::Asset>,
        message: Option<String>,
    ) -> Result<u64> {
        if offer.is_our_offer {
            return Err(ParameterError::CannotCounterOfferWeCreated.into());
        }
        let state = self.known_state(offer);
        if state.is_terminal() {
            return Err(TradeError::AlreadyClosed(state));
        }
        if items_to_give.is_empty() && items_to_receive.is_empty() {
            return Err(ParameterError::EmptyOffer.into());
        }

        let payload = serde_json::json!({
            "newversion": true,
            "version": 2,
            "me": { "assets": items_to_give, "currency": [], "ready": false },
            "them": { "assets": items_to_receive, "currency": [], "ready": false },
        });
        let response: SendOfferResponse = self
            .web
            .post_form(
                &format!("{COMMUNITY_HOST}/tradeoffer/new/send"),
                &[
                    ("sessionid", self.session_id()?),
                    ("serverid", "1".into()),
                    ("partner", u64::from(offer.partner).to_string()),
                    ("tradeoffermessage", message.unwrap_or_default()),
                    ("json_tradeoffer", payload.to_string()),
                    ("tradeofferid_countered", offer.id.to_string()),
                    ("captcha", String::new()),
                ],
            )
            .await?;
        if let Some(message) = response.str_error {
            return Err(TradeError::Response(message));
        }
        let new_id = response
            .tradeofferid
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| TradeError::Response("missing tradeofferid".into()))?;

        if response.needs_mobile_confirmation {
            if let Some(confirmations) = &self.confirmations {
                confirmations.confirm_trade(new_id).await?;
            }
        }
        Ok(new_id)
    }
}
