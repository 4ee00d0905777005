use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

const DISCOVERY_URL: &str = "https://api.steampowered.com/ISteamDirectory/GetCMList/v1/?cellid=0";

/// Endpoints compiled in for when discovery is unreachable.
const FALLBACK_CMS: &[(&str, u16, CmScheme)] = &[
    ("cm2-ord1.cm.steampowered.com", 27017, CmScheme::Tcp),
    ("cm2-iad1.cm.steampowered.com", 27017, CmScheme::Tcp),
    ("cm2-lax1.cm.steampowered.com", 27017, CmScheme::Tcp),
    ("cm2-fra2.cm.steampowered.com", 27017, CmScheme::Tcp),
    ("ext1-ord1.steamserver.net", 443, CmScheme::WebSocket),
    ("ext1-fra1.steamserver.net", 443, CmScheme::WebSocket),
];

fn cache_max_age() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, Error)]
pub enum ServerDiscoveryError {
    #[error("Failed to send discovery request: {0:#}")]
    Network(#[from] reqwest::Error),
    #[error("steam returned an empty server list")]
    NoServers,
    #[error("no usable endpoints remain")]
    NoEndpointsAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmScheme {
    Tcp,
    WebSocket,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CmEndpoint {
    pub host: String,
    pub port: u16,
    pub scheme: CmScheme,
}

impl CmEndpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        CmEndpoint {
            host: host.into(),
            port,
            scheme: CmScheme::Tcp,
        }
    }

    pub fn websocket(host: impl Into<String>, port: u16) -> Self {
        CmEndpoint {
            host: host.into(),
            port,
            scheme: CmScheme::WebSocket,
        }
    }

    /// Url for the websocket transport.
    pub fn ws_url(&self) -> String {
        format!("wss://{}:{}/cmsocket/", self.host, self.port)
    }

    /// Address tuple for the tcp transport.
    pub fn addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

impl fmt::Display for CmEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedList {
    fetched_at: DateTime<Utc>,
    endpoints: Vec<CmEndpoint>,
}

#[derive(Debug, Default)]
struct Inner {
    endpoints: Vec<CmEndpoint>,
    fetched_at: Option<DateTime<Utc>>,
    blacklist: HashSet<CmEndpoint>,
}

impl Inner {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.fetched_at
            .map(|at| now - at < cache_max_age())
            .unwrap_or(false)
    }

    fn eligible(&self) -> Vec<CmEndpoint> {
        self.endpoints
            .iter()
            .filter(|ep| !self.blacklist.contains(ep))
            .cloned()
            .collect()
    }
}

/// Directory of CM endpoints with ageing, per-session blacklisting and a
/// pinned fallback list.
#[derive(Debug, Clone)]
pub struct ServerList {
    inner: Arc<Mutex<Inner>>,
    cache_path: Option<PathBuf>,
    client: reqwest::Client,
}

impl ServerList {
    /// Fetch a fresh list from the discovery endpoint.
    pub async fn discover() -> Result<ServerList, ServerDiscoveryError> {
        let list = ServerList::new(None);
        list.refresh().await?;
        Ok(list)
    }

    /// Load the persisted list from `path` when present, deferring discovery
    /// until the cache goes stale.
    pub fn with_cache(path: impl AsRef<Path>) -> ServerList {
        let list = ServerList::new(Some(path.as_ref().to_path_buf()));
        if let Some(cached) = list.load_cache() {
            let mut inner = list.inner.lock().expect("not poisoned");
            inner.endpoints = cached.endpoints;
            inner.fetched_at = Some(cached.fetched_at);
        }
        list
    }

    /// Build a list from known endpoints, e.g. a pushed `ClientCMList`.
    pub fn from_endpoints(endpoints: Vec<CmEndpoint>) -> ServerList {
        let list = ServerList::new(None);
        {
            let mut inner = list.inner.lock().expect("not poisoned");
            inner.endpoints = endpoints;
            inner.fetched_at = Some(Utc::now());
        }
        list
    }

    fn new(cache_path: Option<PathBuf>) -> ServerList {
        ServerList {
            inner: Arc::new(Mutex::new(Inner::default())),
            cache_path,
            client: reqwest::Client::new(),
        }
    }

    /// Pick an endpoint for the next connect attempt.
    ///
    /// A stale or exhausted cache triggers re-discovery first; if discovery
    /// fails too, the pinned fallback list is consulted.
    pub async fn pick(&self) -> Result<CmEndpoint, ServerDiscoveryError> {
        let (fresh, eligible) = {
            let inner = self.inner.lock().expect("not poisoned");
            (inner.is_fresh(Utc::now()), inner.eligible())
        };

        if fresh {
            if let Some(endpoint) = eligible.choose(&mut rand::thread_rng()) {
                return Ok(endpoint.clone());
            }
        }

        match self.refresh().await {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "discovery failed, falling back");
                return self.pick_fallback();
            }
        }

        let eligible = self.inner.lock().expect("not poisoned").eligible();
        eligible
            .choose(&mut rand::thread_rng())
            .cloned()
            .map_or_else(|| self.pick_fallback(), Ok)
    }

    fn pick_fallback(&self) -> Result<CmEndpoint, ServerDiscoveryError> {
        let inner = self.inner.lock().expect("not poisoned");
        let fallback: Vec<CmEndpoint> = FALLBACK_CMS
            .iter()
            .map(|(host, port, scheme)| CmEndpoint {
                host: (*host).into(),
                port: *port,
                scheme: *scheme,
            })
            .filter(|ep| !inner.blacklist.contains(ep))
            .collect();
        fallback
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ServerDiscoveryError::NoEndpointsAvailable)
    }

    /// Blacklist an endpoint for the rest of this session, e.g. after
    /// `TryAnotherCM` or a failed connect.
    pub fn mark_bad(&self, endpoint: &CmEndpoint) {
        debug!(endpoint = %endpoint, "blacklisting endpoint");
        self.inner
            .lock()
            .expect("not poisoned")
            .blacklist
            .insert(endpoint.clone());
    }

    /// Forget session blacklisting, typically when a new session starts.
    pub fn clear_blacklist(&self) {
        self.inner.lock().expect("not poisoned").blacklist.clear();
    }

    /// Merge endpoints pushed by the CM into the cache.
    pub fn merge(&self, endpoints: Vec<CmEndpoint>) {
        let mut inner = self.inner.lock().expect("not poisoned");
        for endpoint in endpoints {
            if !inner.endpoints.contains(&endpoint) {
                inner.endpoints.push(endpoint);
            }
        }
        inner.fetched_at = Some(Utc::now());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("not poisoned").endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn refresh(&self) -> Result<(), ServerDiscoveryError> {
        let response: ServerListResponse = self
            .client
            .get(DISCOVERY_URL)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut endpoints = Vec::new();
        for entry in &response.response.server_list {
            if let Some((host, port)) = split_host_port(entry) {
                endpoints.push(CmEndpoint::tcp(host, port));
            }
        }
        for entry in &response.response.server_list_websockets {
            if let Some((host, port)) = split_host_port(entry) {
                endpoints.push(CmEndpoint::websocket(host, port));
            }
        }
        if endpoints.is_empty() {
            return Err(ServerDiscoveryError::NoServers);
        }

        debug!(count = endpoints.len(), "discovered cm endpoints");
        let now = Utc::now();
        {
            let mut inner = self.inner.lock().expect("not poisoned");
            inner.endpoints = endpoints;
            inner.fetched_at = Some(now);
        }
        self.store_cache();
        Ok(())
    }

    fn load_cache(&self) -> Option<CachedList> {
        let path = self.cache_path.as_ref()?;
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<CachedList>(&raw) {
            Ok(cached) if Utc::now() - cached.fetched_at < cache_max_age() => Some(cached),
            Ok(_) => {
                debug!(path = %path.display(), "cm cache is stale");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable cm cache");
                None
            }
        }
    }

    fn store_cache(&self) {
        let Some(path) = self.cache_path.as_ref() else {
            return;
        };
        let cached = {
            let inner = self.inner.lock().expect("not poisoned");
            CachedList {
                fetched_at: inner.fetched_at.unwrap_or_else(Utc::now),
                endpoints: inner.endpoints.clone(),
            }
        };
        let write = serde_json::to_string(&cached)
            .map_err(std::io::Error::other)
            .and_then(|raw| std::fs::write(path, raw));
        if let Err(e) = write {
            warn!(path = %path.display(), error = %e, "failed to persist cm cache");
        }
    }
}

fn split_host_port(value: &str) -> Option<(&str, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

#[derive(Debug, Deserialize)]
struct ServerListResponse {
    response: ServerListResponseInner,
}

#[derive(Debug, Deserialize)]
struct ServerListResponseInner {
    #[serde(rename = "serverlist", default)]
    server_list: Vec<String>,
    #[serde(rename = "serverlist_websockets", default)]
    server_list_websockets: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<CmEndpoint> {
        vec![
            CmEndpoint::tcp("10.0.0.1", 27017),
            CmEndpoint::tcp("10.0.0.2", 27017),
            CmEndpoint::websocket("cm.example.com", 443),
        ]
    }

    #[tokio::test]
    async fn pick_skips_blacklisted() {
        let list = ServerList::from_endpoints(endpoints());
        list.mark_bad(&CmEndpoint::tcp("10.0.0.1", 27017));
        list.mark_bad(&CmEndpoint::websocket("cm.example.com", 443));
        for _ in 0..16 {
            let picked = list.pick().await.unwrap();
            assert_eq!(picked, CmEndpoint::tcp("10.0.0.2", 27017));
        }
    }

    #[test]
    fn fallback_when_everything_blacklisted() {
        let list = ServerList::from_endpoints(endpoints());
        for ep in endpoints() {
            list.mark_bad(&ep);
        }
        // cache exhausted, fallback still usable
        let picked = list.pick_fallback().unwrap();
        assert!(FALLBACK_CMS.iter().any(|(host, ..)| *host == picked.host));

        for (host, port, scheme) in FALLBACK_CMS {
            list.mark_bad(&CmEndpoint {
                host: (*host).into(),
                port: *port,
                scheme: *scheme,
            });
        }
        assert!(matches!(
            list.pick_fallback(),
            Err(ServerDiscoveryError::NoEndpointsAvailable)
        ));
    }

    #[test]
    fn merge_deduplicates() {
        let list = ServerList::from_endpoints(endpoints());
        list.merge(vec![
            CmEndpoint::tcp("10.0.0.1", 27017),
            CmEndpoint::tcp("10.0.0.9", 27017),
        ]);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn blacklist_clears() {
        let list = ServerList::from_endpoints(vec![CmEndpoint::tcp("10.0.0.1", 27017)]);
        list.mark_bad(&CmEndpoint::tcp("10.0.0.1", 27017));
        assert!(list.inner.lock().unwrap().eligible().is_empty());
        list.clear_blacklist();
        assert_eq!(list.inner.lock().unwrap().eligible().len(), 1);
    }

    #[test]
    fn staleness_window() {
        let list = ServerList::from_endpoints(endpoints());
        {
            let inner = list.inner.lock().unwrap();
            assert!(inner.is_fresh(Utc::now()));
            assert!(!inner.is_fresh(Utc::now() + Duration::hours(25)));
        }
    }

    #[test]
    fn cache_round_trip() {
        let path = std::env::temp_dir().join(format!("steam-flue-cm-cache-{}.json", std::process::id()));
        let list = ServerList {
            cache_path: Some(path.clone()),
            ..ServerList::from_endpoints(endpoints())
        };
        list.store_cache();

        let reloaded = ServerList::with_cache(&path);
        assert_eq!(reloaded.len(), 3);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(split_host_port("1.2.3.4:27017"), Some(("1.2.3.4", 27017)));
        assert_eq!(split_host_port("no-port"), None);
        assert_eq!(split_host_port("bad:port"), None);
    }
}
