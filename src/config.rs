use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::time::Duration;

/// Backoff parameters for the reconnect loop.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Whether a `LoggedInElsewhere` kick is answered with one re-login
    /// (displacing the other session) before surrendering.
    pub kick_others_on_reconnect: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            kick_others_on_reconnect: true,
        }
    }
}

/// Which event streams the client populates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intents(u32);

impl Intents {
    pub const NONE: Intents = Intents(0);
    pub const PERSONA: Intents = Intents(1);
    pub const FRIENDS: Intents = Intents(1 << 1);
    pub const CHAT: Intents = Intents(1 << 2);
    pub const TRADES: Intents = Intents(1 << 3);

    pub const ALL: Intents = Intents(0b1111);

    pub fn contains(&self, other: Intents) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for Intents {
    fn default() -> Self {
        Intents::ALL
    }
}

impl BitOr for Intents {
    type Output = Intents;

    fn bitor(self, rhs: Intents) -> Intents {
        Intents(self.0 | rhs.0)
    }
}

impl BitOrAssign for Intents {
    fn bitor_assign(&mut self, rhs: Intents) {
        self.0 |= rhs.0;
    }
}

/// Client-wide configuration.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Base trade poll interval; floored at one second.
    pub poll_interval: Duration,
    /// Upper bound the poll interval backs off to on consecutive empty
    /// polls.
    pub poll_interval_max: Duration,
    pub reconnect: ReconnectConfig,
    /// Emit events for offers already in a terminal state on the first
    /// poll after startup.
    pub replay_historical_trades: bool,
    /// Where to persist the CM endpoint cache; `None` keeps it in memory.
    pub cm_cache_path: Option<PathBuf>,
    /// Where sentry hashes are persisted.
    pub sentry_path: PathBuf,
    pub intents: Intents,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            poll_interval: Duration::from_secs(5),
            poll_interval_max: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
            replay_historical_trades: false,
            cm_cache_path: None,
            sentry_path: PathBuf::from("sentry.json"),
            intents: Intents::default(),
        }
    }
}

impl NetConfig {
    /// Clamp the configured intervals into their valid ranges.
    pub fn normalized(mut self) -> Self {
        if self.poll_interval < Duration::from_secs(1) {
            self.poll_interval = Duration::from_secs(1);
        }
        if self.poll_interval_max < self.poll_interval {
            self.poll_interval_max = self.poll_interval;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intents_composition() {
        let intents = Intents::PERSONA | Intents::TRADES;
        assert!(intents.contains(Intents::PERSONA));
        assert!(intents.contains(Intents::TRADES));
        assert!(!intents.contains(Intents::CHAT));
        assert!(Intents::ALL.contains(intents));
    }

    #[test]
    fn normalization_clamps_intervals() {
        let config = NetConfig {
            poll_interval: Duration::from_millis(100),
            poll_interval_max: Duration::from_millis(200),
            ..NetConfig::default()
        }
        .normalized();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.poll_interval_max, Duration::from_secs(1));
    }
}
