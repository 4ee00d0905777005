use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::error::Error;
use std::fs::{create_dir_all, read_to_string, write};
use std::path::PathBuf;
use thiserror::Error;

/// Trait for persisting machine-auth sentry hashes per account.
///
/// The server challenges unknown machines with `ClientUpdateMachineAuth`;
/// the stored SHA-1 is submitted on later logins so email codes are only
/// asked for once.
pub trait SentryStore: Send + 'static {
    type Err: Error + Send + Sync;

    /// Store the sentry hash for an account
    fn store(
        &mut self,
        account: &str,
        sentry_hash: [u8; 20],
    ) -> impl std::future::Future<Output = Result<(), Self::Err>> + Send;

    /// Retrieve the stored sentry hash for an account
    fn load(
        &mut self,
        account: &str,
    ) -> impl std::future::Future<Output = Result<Option<[u8; 20]>, Self::Err>> + Send;
}

/// Error while storing or loading sentry data from a json file
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SentryStoreError {
    /// Error while reading the json file
    #[error("error while reading sentries from {}: {:#}", path.display(), err)]
    Read { err: std::io::Error, path: PathBuf },
    /// Error while writing the json file
    #[error("error while writing sentries to {}: {:#}", path.display(), err)]
    Write { err: std::io::Error, path: PathBuf },
    /// Error when encoding or decoding the stored hashes
    #[error("error while parsing sentries from {}: {:#}", path.display(), err)]
    Json {
        err: serde_json::error::Error,
        path: PathBuf,
    },
    /// Error while creating the parent directory of the file
    #[error("error while creating directory {} for sentries: {:#}", path.display(), err)]
    DirCreation { err: std::io::Error, path: PathBuf },
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSentry {
    sha: String,
}

/// Store sentry hashes in a json file keyed by account name.
#[derive(Debug, Clone)]
pub struct FileSentryStore {
    path: PathBuf,
}

impl FileSentryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSentryStore { path: path.into() }
    }

    fn all(&self) -> Result<HashMap<String, StoredSentry>, SentryStoreError> {
        if !self.path.exists() {
            return Ok(HashMap::default());
        }
        let raw = read_to_string(&self.path).map_err(|err| SentryStoreError::Read {
            err,
            path: self.path.clone(),
        })?;
        serde_json::from_str(&raw).map_err(|err| SentryStoreError::Json {
            err,
            path: self.path.clone(),
        })
    }

    fn save(&self, sentries: HashMap<String, StoredSentry>) -> Result<(), SentryStoreError> {
        if let Some(parent) = self.path.parent() {
            create_dir_all(parent).map_err(|err| SentryStoreError::DirCreation {
                err,
                path: parent.into(),
            })?;
        }

        let raw = serde_json::to_string(&sentries).map_err(|err| SentryStoreError::Json {
            err,
            path: self.path.clone(),
        })?;
        write(&self.path, raw).map_err(|err| SentryStoreError::Write {
            err,
            path: self.path.clone(),
        })?;
        Ok(())
    }
}

fn decode_sha(raw: &str) -> Option<[u8; 20]> {
    if raw.len() != 40 {
        return None;
    }
    let mut out = [0; 20];
    for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
        let hex = std::str::from_utf8(chunk).ok()?;
        out[i] = u8::from_str_radix(hex, 16).ok()?;
    }
    Some(out)
}

fn encode_sha(sha: &[u8; 20]) -> String {
    sha.iter().map(|b| format!("{b:02x}")).collect()
}

impl SentryStore for FileSentryStore {
    type Err = SentryStoreError;

    async fn store(&mut self, account: &str, sentry_hash: [u8; 20]) -> Result<(), Self::Err> {
        let mut sentries = self.all()?;
        sentries.insert(
            account.into(),
            StoredSentry {
                sha: encode_sha(&sentry_hash),
            },
        );
        self.save(sentries)
    }

    async fn load(&mut self, account: &str) -> Result<Option<[u8; 20]>, Self::Err> {
        let sentries = self.all()?;
        Ok(sentries
            .get(account)
            .and_then(|stored| decode_sha(&stored.sha)))
    }
}

/// Don't persist sentry data; every login starts from an unknown machine.
#[derive(Debug, Clone, Default)]
pub struct NullSentryStore;

impl SentryStore for NullSentryStore {
    type Err = Infallible;

    async fn store(&mut self, _account: &str, _sentry_hash: [u8; 20]) -> Result<(), Self::Err> {
        Ok(())
    }

    async fn load(&mut self, _account: &str) -> Result<Option<[u8; 20]>, Self::Err> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_round_trip() {
        let path = std::env::temp_dir().join(format!("steam-flue-sentry-{}.json", std::process::id()));
        let mut store = FileSentryStore::new(&path);

        let hash = steam_flue_crypto::guard::sentry_hash(b"sentry blob bytes");
        store.store("user", hash).await.unwrap();

        let loaded = store.load("user").await.unwrap();
        assert_eq!(loaded, Some(hash));
        assert_eq!(store.load("other").await.unwrap(), None);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn sha_hex_round_trip() {
        let sha = [0xAB; 20];
        assert_eq!(decode_sha(&encode_sha(&sha)), Some(sha));
        assert_eq!(decode_sha("not hex"), None);
    }

    #[tokio::test]
    async fn null_store_remembers_nothing() {
        let mut store = NullSentryStore;
        store.store("user", [1; 20]).await.unwrap();
        assert_eq!(store.load("user").await.unwrap(), None);
    }
}
