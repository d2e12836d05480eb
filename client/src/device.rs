//! Device identification.
//!
//! Resolves a best-effort stable fingerprint and the public IP of the
//! current device. Resolution never fails: every external step (stored
//! value, fingerprint agent, IP echo services) has a timeout and a fallback,
//! and the whole resolution sits under an outer deadline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Utc};
use dashmap::DashMap;
use futures::future::select_ok;
use murmur_core::hash::{self, FingerprintComponents, FALLBACK_SUFFIX_LEN};
use murmur_core::validate::is_valid_ip;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::timeout::with_timeout;

// ============================================================================
// Local key/value storage
// ============================================================================

/// Persistent key/value storage (the browser's local storage).
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> std::io::Result<()>;
}

/// Volatile storage, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.clone())
    }

    fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Storage backed by a JSON object on disk.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: DashMap<String, String>,
}

impl FileStorage {
    /// Open `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = DashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<std::collections::HashMap<String, String>>(&raw) {
                Ok(map) => {
                    for (k, v) in map {
                        entries.insert(k, v);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring corrupt storage file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Storage file unreadable"),
        }

        Self { path, entries }
    }

    fn flush(&self) -> std::io::Result<()> {
        let map: std::collections::BTreeMap<String, String> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let raw = serde_json::to_string_pretty(&map)?;
        std::fs::write(&self.path, raw)
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.clone())
    }

    fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        self.flush()
    }
}

// ============================================================================
// External collaborators
// ============================================================================

/// Third-party fingerprinting library.
#[async_trait]
pub trait FingerprintAgent: Send + Sync {
    async fn load(&self) -> Result<(), DeviceError>;

    async fn visitor_id(&self) -> Result<String, DeviceError>;
}

/// Public IP discovery.
#[async_trait]
pub trait IpLookup: Send + Sync {
    /// The device's public IP, or `None` if it could not be determined.
    async fn lookup(&self) -> Option<String>;
}

/// Races a list of JSON IP echo services; the first valid answer wins.
pub struct HttpIpLookup {
    client: reqwest::Client,
    services: Vec<String>,
    timeout: Duration,
}

impl HttpIpLookup {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(config.ip_lookup_timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            services: config.ip_services.clone(),
            timeout: config.ip_lookup_timeout,
        }
    }

    async fn fetch(&self, url: &str) -> Result<String, DeviceError> {
        let body: serde_json::Value = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DeviceError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| DeviceError::Http(e.to_string()))?;

        body.get("ip")
            .and_then(serde_json::Value::as_str)
            .filter(|ip| is_valid_ip(ip))
            .map(String::from)
            .ok_or(DeviceError::InvalidIp)
    }
}

#[async_trait]
impl IpLookup for HttpIpLookup {
    async fn lookup(&self) -> Option<String> {
        if self.services.is_empty() {
            return None;
        }
        let attempts = self
            .services
            .iter()
            .map(|url| Box::pin(self.fetch(url)));

        let ip = with_timeout(
            "ip lookup",
            self.timeout,
            async { select_ok(attempts).await.ok().map(|(ip, _)| ip) },
            || None,
        )
        .await;

        if ip.is_none() {
            warn!("Could not retrieve IP address");
        }
        ip
    }
}

/// IP lookup that never finds anything (offline runs, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIpLookup;

#[async_trait]
impl IpLookup for NoIpLookup {
    async fn lookup(&self) -> Option<String> {
        None
    }
}

// ============================================================================
// Device description
// ============================================================================

/// Platform attributes reported alongside the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformInfo {
    pub components: FingerprintComponents,
    /// IANA zone name when known, otherwise a `UTC±HH:MM` label.
    pub timezone: String,
}

impl PlatformInfo {
    /// Describe the host the client runs on.
    pub fn detect() -> Self {
        let offset_east_secs = Local::now().offset().local_minus_utc();
        let language = std::env::var("LANG")
            .ok()
            .and_then(|l| l.split('.').next().map(|s| s.replace('_', "-")))
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "en-US".to_string());
        let timezone = std::env::var("TZ").unwrap_or_else(|_| {
            let minutes = offset_east_secs / 60;
            let sign = if minutes < 0 { '-' } else { '+' };
            format!("UTC{}{:02}:{:02}", sign, minutes.abs() / 60, minutes.abs() % 60)
        });

        Self {
            components: FingerprintComponents {
                user_agent: format!(
                    "murmur/{} ({}; {})",
                    crate::VERSION,
                    std::env::consts::OS,
                    std::env::consts::ARCH
                ),
                language,
                screen_width: 0,
                screen_height: 0,
                color_depth: 24,
                timezone_offset_minutes: -(offset_east_secs / 60),
                hardware_concurrency: std::thread::available_parallelism()
                    .ok()
                    .map(|n| n.get() as u32),
                device_memory_gb: None,
                platform: std::env::consts::OS.to_string(),
            },
            timezone,
        }
    }
}

/// Where the fingerprint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintSource {
    Stored,
    Agent,
    Fallback,
}

/// Resolved device descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub fingerprint: String,
    pub source: FingerprintSource,
    pub ip_address: Option<String>,
    pub ip_hash: Option<String>,
    pub user_agent: String,
    pub language: String,
    pub timezone: String,
    pub screen_resolution: String,
    pub platform: String,
}

impl DeviceInfo {
    pub fn new(
        platform: &PlatformInfo,
        fingerprint: String,
        source: FingerprintSource,
        ip_address: Option<String>,
    ) -> Self {
        let c = &platform.components;
        Self {
            fingerprint,
            source,
            ip_hash: ip_address.as_deref().map(hash::hash_ip),
            ip_address,
            user_agent: c.user_agent.clone(),
            language: c.language.clone(),
            timezone: platform.timezone.clone(),
            screen_resolution: c.screen_resolution(),
            platform: c.platform.clone(),
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolves [`DeviceInfo`] from storage, an optional agent and IP lookup.
pub struct DeviceIdentifier {
    storage: Arc<dyn KeyValueStorage>,
    agent: Option<Arc<dyn FingerprintAgent>>,
    ip_lookup: Arc<dyn IpLookup>,
    platform: PlatformInfo,
    storage_key: String,
    load_timeout: Duration,
    get_timeout: Duration,
    overall_timeout: Duration,
}

impl DeviceIdentifier {
    pub fn new(
        config: &Config,
        storage: Arc<dyn KeyValueStorage>,
        ip_lookup: Arc<dyn IpLookup>,
        platform: PlatformInfo,
    ) -> Self {
        Self {
            storage,
            agent: None,
            ip_lookup,
            platform,
            storage_key: config.fingerprint_storage_key.clone(),
            load_timeout: config.fingerprint_load_timeout,
            get_timeout: config.fingerprint_get_timeout,
            overall_timeout: config.device_info_timeout,
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn FingerprintAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Resolve the device descriptor. Always succeeds.
    pub async fn resolve(&self) -> DeviceInfo {
        let work = async {
            let ((fingerprint, source), ip) =
                tokio::join!(self.resolve_fingerprint(), self.ip_lookup.lookup());
            DeviceInfo::new(&self.platform, fingerprint, source, ip)
        };

        let info = with_timeout("device identification", self.overall_timeout, work, || {
            warn!("Device identification timed out, using fallback");
            let (fingerprint, source) = self.stable_fallback();
            DeviceInfo::new(&self.platform, fingerprint, source, None)
        })
        .await;

        info!(
            source = ?info.source,
            has_ip = info.ip_address.is_some(),
            "Device identified"
        );
        info
    }

    /// Stored value, then the agent, then a generated fallback.
    pub async fn resolve_fingerprint(&self) -> (String, FingerprintSource) {
        if let Some(stored) = self.stored() {
            debug!("Using stored fingerprint");
            return (stored, FingerprintSource::Stored);
        }

        if let Some(agent) = &self.agent {
            match self.agent_fingerprint(agent.as_ref()).await {
                Ok(id) => {
                    self.persist(&id);
                    return (id, FingerprintSource::Agent);
                }
                Err(e) => warn!(error = %e, "Fingerprint agent failed, using fallback"),
            }
        }

        self.stable_fallback()
    }

    async fn agent_fingerprint(&self, agent: &dyn FingerprintAgent) -> Result<String, DeviceError> {
        with_timeout("fingerprint load", self.load_timeout, agent.load(), || {
            Err(DeviceError::Timeout)
        })
        .await?;

        let id = with_timeout("fingerprint get", self.get_timeout, agent.visitor_id(), || {
            Err(DeviceError::Timeout)
        })
        .await?;

        if id.is_empty() {
            return Err(DeviceError::Agent("empty visitor id".into()));
        }
        Ok(id)
    }

    /// The stored fingerprint, or a freshly generated and persisted one.
    fn stable_fallback(&self) -> (String, FingerprintSource) {
        if let Some(stored) = self.stored() {
            return (stored, FingerprintSource::Stored);
        }
        let id = hash::fallback_fingerprint(&self.platform.components, &random_suffix());
        self.persist(&id);
        info!("Fallback fingerprint created");
        (id, FingerprintSource::Fallback)
    }

    fn stored(&self) -> Option<String> {
        self.storage
            .get(&self.storage_key)
            .filter(|fp| !fp.is_empty())
    }

    fn persist(&self, fingerprint: &str) {
        if let Err(e) = self.storage.set(&self.storage_key, fingerprint) {
            warn!(error = %e, "Could not persist fingerprint");
        }
    }
}

/// Suffix for fallback fingerprints from the system RNG, with a
/// clock-seeded generator if the RNG is unavailable.
fn random_suffix() -> String {
    let mut bytes = [0u8; FALLBACK_SUFFIX_LEN];
    if SystemRandom::new().fill(&mut bytes).is_err() {
        let mut state = (Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64) | 1;
        for byte in bytes.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *byte = (state >> 24) as u8;
        }
    }
    hash::random_suffix(&bytes)
}

/// Device identification errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("operation timed out")]
    Timeout,

    #[error("fingerprint agent error: {0}")]
    Agent(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("service returned no valid IP")]
    InvalidIp,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedIp(&'static str);

    #[async_trait]
    impl IpLookup for FixedIp {
        async fn lookup(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    struct HangingIp;

    #[async_trait]
    impl IpLookup for HangingIp {
        async fn lookup(&self) -> Option<String> {
            std::future::pending().await
        }
    }

    struct Agent(Result<&'static str, DeviceError>);

    #[async_trait]
    impl FingerprintAgent for Agent {
        async fn load(&self) -> Result<(), DeviceError> {
            Ok(())
        }

        async fn visitor_id(&self) -> Result<String, DeviceError> {
            self.0.clone().map(String::from)
        }
    }

    fn identifier(storage: Arc<MemoryStorage>, ip: Arc<dyn IpLookup>) -> DeviceIdentifier {
        DeviceIdentifier::new(&Config::from_env(), storage, ip, PlatformInfo::default())
    }

    #[tokio::test]
    async fn stored_fingerprint_wins() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set("konvo_device_fp", "stored-fp").unwrap();

        let info = identifier(storage, Arc::new(FixedIp("1.2.3.4")))
            .with_agent(Arc::new(Agent(Ok("agent-fp"))))
            .resolve()
            .await;

        assert_eq!(info.fingerprint, "stored-fp");
        assert_eq!(info.source, FingerprintSource::Stored);
        assert_eq!(info.ip_hash.as_deref(), Some(hash::hash_ip("1.2.3.4").as_str()));
    }

    #[tokio::test]
    async fn agent_fingerprint_is_persisted() {
        let storage = Arc::new(MemoryStorage::new());
        let info = identifier(storage.clone(), Arc::new(NoIpLookup))
            .with_agent(Arc::new(Agent(Ok("agent-fp"))))
            .resolve()
            .await;

        assert_eq!(info.source, FingerprintSource::Agent);
        assert_eq!(storage.get("konvo_device_fp").as_deref(), Some("agent-fp"));
        assert!(info.ip_address.is_none());
    }

    #[tokio::test]
    async fn failing_agent_falls_back_and_stays_stable() {
        let storage = Arc::new(MemoryStorage::new());
        let id = identifier(storage.clone(), Arc::new(NoIpLookup))
            .with_agent(Arc::new(Agent(Err(DeviceError::Agent("blocked".into())))));

        let first = id.resolve().await;
        assert_eq!(first.source, FingerprintSource::Fallback);
        assert!(first.fingerprint.starts_with("fb_"));
        let suffix = first.fingerprint.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), FALLBACK_SUFFIX_LEN);

        let second = id.resolve().await;
        assert_eq!(second.fingerprint, first.fingerprint);
        assert_eq!(second.source, FingerprintSource::Stored);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_ip_lookup_hits_outer_deadline() {
        let storage = Arc::new(MemoryStorage::new());
        let info = identifier(storage, Arc::new(HangingIp)).resolve().await;

        assert!(info.fingerprint.starts_with("fb_"));
        assert!(info.ip_address.is_none());
        assert!(info.ip_hash.is_none());
    }

    #[test]
    fn file_storage_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!("murmur-storage-{}.json", uuid::Uuid::new_v4()));
        {
            let storage = FileStorage::open(&path);
            assert!(storage.get("k").is_none());
            storage.set("k", "v").unwrap();
        }
        let reopened = FileStorage::open(&path);
        assert_eq!(reopened.get("k").as_deref(), Some("v"));
        let _ = std::fs::remove_file(&path);
    }
}
