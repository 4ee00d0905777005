use num_enum::{FromPrimitive, IntoPrimitive};

/// Steam's shared result code, carried in protobuf headers and response
/// bodies alike.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum EResult {
    #[num_enum(default)]
    Invalid = 0,
    OK = 1,
    Fail = 2,
    NoConnection = 3,
    InvalidPassword = 5,
    LoggedInElsewhere = 6,
    InvalidProtocolVer = 7,
    InvalidParam = 8,
    FileNotFound = 9,
    Busy = 10,
    InvalidState = 11,
    InvalidName = 12,
    InvalidEmail = 13,
    DuplicateName = 14,
    AccessDenied = 15,
    Timeout = 16,
    Banned = 17,
    AccountNotFound = 18,
    InvalidSteamID = 19,
    ServiceUnavailable = 20,
    NotLoggedOn = 21,
    Pending = 22,
    EncryptionFailure = 23,
    InsufficientPrivilege = 24,
    LimitExceeded = 25,
    Revoked = 26,
    Expired = 27,
    AlreadyRedeemed = 28,
    DuplicateRequest = 29,
    IPNotFound = 31,
    PersistFailed = 32,
    LockingFailed = 33,
    LogonSessionReplaced = 34,
    ConnectFailed = 35,
    HandshakeFailed = 36,
    IOFailure = 37,
    RemoteDisconnect = 38,
    Blocked = 40,
    Ignored = 41,
    NoMatch = 42,
    AccountDisabled = 43,
    ServiceReadOnly = 44,
    AccountLogonDenied = 63,
    CannotUseOldPassword = 64,
    InvalidLoginAuthCode = 65,
    AccountLogonDeniedNoMail = 66,
    RateLimitExceeded = 84,
    AccountLoginDeniedNeedTwoFactor = 85,
    ItemDeleted = 86,
    AccountLoginDeniedThrottle = 87,
    TwoFactorCodeMismatch = 88,
    TwoFactorActivationCodeMismatch = 89,
    NotModified = 91,
    TooManyPending = 108,
    TryAnotherCM = 110,
}

impl EResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, EResult::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_value() {
        assert_eq!(EResult::from(1), EResult::OK);
        assert_eq!(EResult::from(63), EResult::AccountLogonDenied);
        assert_eq!(EResult::from(85), EResult::AccountLoginDeniedNeedTwoFactor);
        // unmapped values collapse to Invalid rather than panicking
        assert_eq!(EResult::from(-7), EResult::Invalid);
    }
}
