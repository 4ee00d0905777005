//! Trade offers: the polling engine, its events and the offer model.

mod engine;
mod event;
mod offer;

pub use engine::{ParameterError, PollOptions, TradeEngine, TradeError};
pub use event::TradeEvent;
pub use offer::{Asset, ConfirmationMethod, ServerTime, TradeOffer, TradeOfferState};
