//! The 64 bit Steam identifier and its textual renderings.
//!
//! Layout, high bits first: 8 bit universe, 4 bit account type, 20 bit
//! instance, 32 bit account id. The all-zero id is reserved and treated as
//! invalid everywhere.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SteamIdError {
    #[error("the zero steam id is reserved")]
    Zero,
    #[error("malformed steam2 id: {0}")]
    MalformedSteam2(String),
    #[error("malformed steam3 id: {0}")]
    MalformedSteam3(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::FromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum Universe {
    #[num_enum(default)]
    Invalid = 0,
    Public = 1,
    Beta = 2,
    Internal = 3,
    Dev = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::FromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum AccountType {
    #[num_enum(default)]
    Invalid = 0,
    Individual = 1,
    Multiseat = 2,
    GameServer = 3,
    AnonGameServer = 4,
    Pending = 5,
    ContentServer = 6,
    Clan = 7,
    Chat = 8,
    ConsoleUser = 9,
    AnonUser = 10,
}

impl AccountType {
    /// Character used in steam3 bracket form, `[U:1:1234]`.
    fn steam3_char(&self) -> char {
        match self {
            AccountType::Invalid => 'I',
            AccountType::Individual => 'U',
            AccountType::Multiseat => 'M',
            AccountType::GameServer => 'G',
            AccountType::AnonGameServer => 'A',
            AccountType::Pending => 'P',
            AccountType::ContentServer => 'C',
            AccountType::Clan => 'g',
            AccountType::Chat => 'T',
            AccountType::ConsoleUser => 'c',
            AccountType::AnonUser => 'a',
        }
    }

    fn from_steam3_char(c: char) -> Option<Self> {
        Some(match c {
            'I' => AccountType::Invalid,
            'U' => AccountType::Individual,
            'M' => AccountType::Multiseat,
            'G' => AccountType::GameServer,
            'A' => AccountType::AnonGameServer,
            'P' => AccountType::Pending,
            'C' => AccountType::ContentServer,
            'g' => AccountType::Clan,
            'T' => AccountType::Chat,
            'c' => AccountType::ConsoleUser,
            'a' => AccountType::AnonUser,
            _ => return None,
        })
    }
}

/// Instance bits for individual accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instance {
    All = 0,
    Desktop = 1,
    Console = 2,
    Web = 4,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SteamId(u64);

impl SteamId {
    pub fn new(account_id: u32, instance: Instance, account_type: AccountType, universe: Universe) -> Self {
        SteamId(
            (u8::from(universe) as u64) << 56
                | (u8::from(account_type) as u64) << 52
                | (instance as u64) << 32
                | account_id as u64,
        )
    }

    /// A public-universe desktop individual account, the common case.
    pub fn from_account_id(account_id: u32) -> Self {
        SteamId::new(account_id, Instance::Desktop, AccountType::Individual, Universe::Public)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    pub fn account_id(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn instance(&self) -> u32 {
        ((self.0 >> 32) & 0xF_FFFF) as u32
    }

    pub fn account_type(&self) -> AccountType {
        AccountType::from(((self.0 >> 52) & 0xF) as u8)
    }

    pub fn universe(&self) -> Universe {
        Universe::from(((self.0 >> 56) & 0xFF) as u8)
    }

    /// Render as legacy `STEAM_X:Y:Z`.
    pub fn steam2(&self) -> String {
        format!(
            "STEAM_{}:{}:{}",
            u8::from(self.universe()),
            self.account_id() & 1,
            self.account_id() >> 1
        )
    }

    /// Render as bracketed steam3, e.g. `[U:1:59880187]`.
    pub fn steam3(&self) -> String {
        format!(
            "[{}:{}:{}]",
            self.account_type().steam3_char(),
            u8::from(self.universe()),
            self.account_id()
        )
    }

    /// Path segment for `steamcommunity.com/profiles/<id>`.
    pub fn community_path(&self) -> String {
        format!("profiles/{}", self.0)
    }

    /// Parse `STEAM_X:Y:Z`. The legacy form only describes individual
    /// accounts; universe 0 is read as public, matching community pages.
    pub fn from_steam2(value: &str) -> Result<Self, SteamIdError> {
        let rest = value
            .strip_prefix("STEAM_")
            .ok_or_else(|| SteamIdError::MalformedSteam2(value.into()))?;
        let mut parts = rest.splitn(3, ':');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse::<u64>().ok())
                .ok_or_else(|| SteamIdError::MalformedSteam2(value.into()))
        };
        let universe = next()?;
        let low = next()?;
        let half = next()?;
        if low > 1 || half > u32::MAX as u64 / 2 {
            return Err(SteamIdError::MalformedSteam2(value.into()));
        }
        let universe = match universe {
            0 => Universe::Public,
            u => Universe::from(u as u8),
        };
        let account_id = (half << 1 | low) as u32;
        if account_id == 0 {
            return Err(SteamIdError::Zero);
        }
        Ok(SteamId::new(account_id, Instance::Desktop, AccountType::Individual, universe))
    }

    /// Parse bracketed steam3, e.g. `[U:1:59880187]`.
    pub fn from_steam3(value: &str) -> Result<Self, SteamIdError> {
        let inner = value
            .strip_prefix('[')
            .and_then(|v| v.strip_suffix(']'))
            .ok_or_else(|| SteamIdError::MalformedSteam3(value.into()))?;
        let mut parts = inner.splitn(3, ':');
        let type_char = parts
            .next()
            .and_then(|p| p.chars().next())
            .ok_or_else(|| SteamIdError::MalformedSteam3(value.into()))?;
        let account_type = AccountType::from_steam3_char(type_char)
            .ok_or_else(|| SteamIdError::MalformedSteam3(value.into()))?;
        let universe = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(|| SteamIdError::MalformedSteam3(value.into()))?;
        let account_id = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| SteamIdError::MalformedSteam3(value.into()))?;
        if account_id == 0 {
            return Err(SteamIdError::Zero);
        }
        let instance = match account_type {
            AccountType::Individual => Instance::Desktop,
            _ => Instance::All,
        };
        Ok(SteamId::new(account_id, instance, account_type, Universe::from(universe)))
    }
}

impl From<u64> for SteamId {
    fn from(value: u64) -> Self {
        SteamId(value)
    }
}

impl From<SteamId> for u64 {
    fn from(value: SteamId) -> Self {
        value.0
    }
}

impl fmt::Display for SteamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SteamId {
    type Err = SteamIdError;

    /// Accepts the 64 bit decimal form, `STEAM_X:Y:Z` or `[T:U:A]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id64) = s.parse::<u64>() {
            return if id64 == 0 {
                Err(SteamIdError::Zero)
            } else {
                Ok(SteamId(id64))
            };
        }
        if s.starts_with("STEAM_") {
            SteamId::from_steam2(s)
        } else {
            SteamId::from_steam3(s)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID64: u64 = 76561198020145915;

    #[test]
    fn field_extraction() {
        let id = SteamId::from(ID64);
        assert_eq!(id.account_id(), 59880187);
        assert_eq!(id.universe(), Universe::Public);
        assert_eq!(id.account_type(), AccountType::Individual);
        assert_eq!(id.instance(), Instance::Desktop as u32);
    }

    #[test]
    fn steam2_round_trip() {
        let id = SteamId::from(ID64);
        assert_eq!(id.steam2(), "STEAM_1:1:29940093");
        assert_eq!(SteamId::from_steam2("STEAM_1:1:29940093").unwrap(), id);
        // universe 0 reads as public
        assert_eq!(SteamId::from_steam2("STEAM_0:1:29940093").unwrap(), id);
    }

    #[test]
    fn steam3_round_trip() {
        let id = SteamId::from(ID64);
        assert_eq!(id.steam3(), "[U:1:59880187]");
        assert_eq!(SteamId::from_steam3("[U:1:59880187]").unwrap(), id);
    }

    #[test]
    fn parse_round_trip_preserves_bits() {
        for id64 in [ID64, 76561197960265729, 76561199999999999] {
            let id = SteamId::from(id64);
            let reparsed: SteamId = id.steam2().parse().unwrap();
            assert_eq!(u64::from(reparsed), id64);
            let reparsed: SteamId = id.steam3().parse().unwrap();
            assert_eq!(u64::from(reparsed), id64);
        }
    }

    #[test]
    fn rebuild_from_parts() {
        let id = SteamId::from(ID64);
        let rebuilt = SteamId::new(
            id.account_id(),
            Instance::Desktop,
            id.account_type(),
            id.universe(),
        );
        assert_eq!(rebuilt, id);
    }

    #[test]
    fn zero_is_invalid() {
        assert!(!SteamId::default().is_valid());
        assert_eq!("0".parse::<SteamId>(), Err(SteamIdError::Zero));
        assert_eq!(SteamId::from_steam2("STEAM_1:0:0"), Err(SteamIdError::Zero));
    }

    #[test]
    fn malformed_input() {
        assert!(SteamId::from_steam2("STEAM_1:2:3").is_err());
        assert!(SteamId::from_steam2("STEAM_1:1").is_err());
        assert!(SteamId::from_steam3("[Z:1:1]").is_err());
        assert!("not an id".parse::<SteamId>().is_err());
    }

    #[test]
    fn anon_user_type() {
        let id = SteamId::new(0x1234, Instance::All, AccountType::AnonUser, Universe::Public);
        assert_eq!(id.account_type(), AccountType::AnonUser);
        assert_eq!(id.steam3(), "[a:1:4660]");
    }
}
