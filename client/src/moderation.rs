//! Moderation service: ban checks, ban subscriptions, device registration,
//! admin ban/unban and the spam auto-ban.
//!
//! Decisions live in [`murmur_core::moderation`]; this module performs the
//! reads and atomic batches around them. The session's [`BanMonitor`]
//! (held by the app) consumes the [`BanCheck`]s and [`BanEvent`]s produced
//! here.
//!
//! [`BanMonitor`]: murmur_core::moderation::BanMonitor

use std::sync::Arc;
use std::time::Duration;

use futures::future::ready;
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use murmur_core::hash::raw_ip_key;
use murmur_core::moderation::{
    can_ban, plan_auto_ban, plan_ban_propagation, AutoBanPlan, BanCheck, BanKind, IpBanPolicy,
    KnownDevice,
};
use murmur_core::validate::truncate_chars;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::DeviceInfo;
use crate::error::{ClientError, Result};
use crate::models::{
    collections, DeviceRecord, UserProfile, ADMIN_BAN_REASON, AUTO_BAN_DEVICE_REASON,
    AUTO_BAN_REASON, SYSTEM_AUTO_BAN,
};
use crate::store::{DocPath, DocumentStore, Fields, Query, StoreError, WriteBatch};
use crate::timeout::with_timeout;

/// Name recorded on admin bans when the target has none.
const UNKNOWN_USERNAME: &str = "Unknown";

/// Keys the current session can be banned under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionKeys {
    pub user_id: String,
    pub fingerprint: Option<String>,
    pub ip_hash: Option<String>,
    /// Legacy `banned_ips` key: the raw IP with dots replaced.
    pub raw_ip_key: Option<String>,
}

impl SessionKeys {
    pub fn new(user_id: impl Into<String>, device: Option<&DeviceInfo>) -> Self {
        Self {
            user_id: user_id.into(),
            fingerprint: device
                .map(|d| d.fingerprint.clone())
                .filter(|fp| !fp.is_empty()),
            ip_hash: device.and_then(|d| d.ip_hash.clone()),
            raw_ip_key: device.and_then(|d| d.ip_address.as_deref().map(raw_ip_key)),
        }
    }
}

/// A ban record appeared or disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanEvent {
    pub kind: BanKind,
    pub exists: bool,
}

/// Merged subscriptions on the session's ban records.
pub struct BanWatch {
    events: SelectAll<BoxStream<'static, BanEvent>>,
}

impl BanWatch {
    /// Next ban record change. `None` once every subscription has closed.
    pub async fn next(&mut self) -> Option<BanEvent> {
        self.events.next().await
    }
}

/// Result of an admin ban or unban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanOutcome {
    pub banned: bool,
    pub devices: usize,
    pub ips: usize,
}

impl BanOutcome {
    /// Toast shown to the admin.
    pub fn message(&self) -> String {
        if self.banned {
            format!(
                "🚫 User BANNED. Added {} device ban(s) and {} IP ban(s).",
                self.devices, self.ips
            )
        } else {
            format!(
                "✅ User UNBANNED. Removed {} device ban(s) and {} IP ban(s).",
                self.devices, self.ips
            )
        }
    }
}

/// Moderation operations against the document store.
#[derive(Clone)]
pub struct Moderation {
    store: Arc<dyn DocumentStore>,
    ban_check_timeout: Duration,
}

impl Moderation {
    pub fn new(store: Arc<dyn DocumentStore>, config: &Config) -> Self {
        Self {
            store,
            ban_check_timeout: config.ban_check_timeout,
        }
    }

    // === Checks ===

    /// Look up every ban key of the session. Read failures count as not
    /// banned, and so does running out of time.
    pub async fn check_bans(&self, keys: &SessionKeys) -> BanCheck {
        let check = async {
            let user = self
                .probe(&DocPath::new(collections::BANNED_USERS, &keys.user_id))
                .await;

            let device = match &keys.fingerprint {
                Some(fp) => {
                    self.probe(&DocPath::new(collections::BANNED_DEVICES, fp))
                        .await
                }
                None => false,
            };

            let mut ip = false;
            for key in keys.ip_hash.iter().chain(keys.raw_ip_key.iter()) {
                if self
                    .probe(&DocPath::new(collections::BANNED_IPS, key))
                    .await
                {
                    ip = true;
                    break;
                }
            }

            BanCheck { user, device, ip }
        };

        let result = with_timeout("ban check", self.ban_check_timeout, check, || {
            warn!("Ban check timed out, continuing");
            BanCheck::default()
        })
        .await;

        debug!(
            user = result.user,
            device = result.device,
            ip = result.ip,
            "Ban check complete"
        );
        result
    }

    async fn probe(&self, path: &DocPath) -> bool {
        match self.store.exists(path).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(collection = %path.collection, error = %e, "Ban lookup failed");
                false
            }
        }
    }

    /// Subscribe to the session's user, device and IP-hash ban records.
    pub async fn watch_bans(&self, keys: &SessionKeys) -> BanWatch {
        let mut targets = vec![(
            BanKind::User,
            DocPath::new(collections::BANNED_USERS, &keys.user_id),
        )];
        if let Some(fp) = &keys.fingerprint {
            targets.push((BanKind::Device, DocPath::new(collections::BANNED_DEVICES, fp)));
        }
        if let Some(hash) = &keys.ip_hash {
            targets.push((BanKind::Ip, DocPath::new(collections::BANNED_IPS, hash)));
        }

        let mut streams = Vec::with_capacity(targets.len());
        for (kind, path) in targets {
            let sub = self.store.watch_doc(&path).await;
            streams.push(
                sub.filter_map(move |snapshot| {
                    ready(match snapshot {
                        Ok(snapshot) => Some(BanEvent {
                            kind,
                            exists: snapshot.exists(),
                        }),
                        Err(e) => {
                            warn!(?kind, error = %e, "Ban subscription error");
                            None
                        }
                    })
                })
                .boxed(),
            );
        }

        BanWatch {
            events: stream::select_all(streams),
        }
    }

    /// Whether `admins/{uid}` exists.
    pub async fn is_admin(&self, user_id: &str) -> bool {
        match self
            .store
            .exists(&DocPath::new(collections::ADMINS, user_id))
            .await
        {
            Ok(admin) => admin,
            Err(e) => {
                debug!(error = %e, "Admin lookup failed");
                false
            }
        }
    }

    // === Devices ===

    /// Record this device for the user, refreshing last-seen and network
    /// fields if it is already known.
    pub async fn register_device(&self, user_id: &str, device: &DeviceInfo) -> Result<()> {
        if user_id.is_empty() || device.fingerprint.is_empty() {
            return Ok(());
        }
        let path = DocPath::new(
            collections::USER_DEVICES,
            DeviceRecord::doc_id(user_id, &device.fingerprint),
        );

        if self.store.exists(&path).await? {
            self.store
                .update(
                    &path,
                    Fields::new()
                        .server_timestamp("lastSeen")
                        .set("ipAddress", device.ip_address.clone())
                        .set("ipHash", device.ip_hash.clone())
                        .set("userAgent", device.user_agent.clone()),
                )
                .await?;
        } else {
            self.store
                .set(
                    &path,
                    Fields::new()
                        .set("userId", user_id)
                        .set("fingerprint", device.fingerprint.clone())
                        .set("ipAddress", device.ip_address.clone())
                        .set("ipHash", device.ip_hash.clone())
                        .set("userAgent", device.user_agent.clone())
                        .set("language", device.language.clone())
                        .set("timezone", device.timezone.clone())
                        .set("screenResolution", device.screen_resolution.clone())
                        .set("platform", device.platform.clone())
                        .server_timestamp("firstSeen")
                        .server_timestamp("lastSeen"),
                )
                .await?;
        }

        info!("Device registered");
        Ok(())
    }

    // === Admin ===

    /// Whether `banned_users/{uid}` exists. Decides ban vs unban.
    pub async fn is_user_banned(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .store
            .exists(&DocPath::new(collections::BANNED_USERS, user_id))
            .await?)
    }

    /// Ban the target if not banned, otherwise lift the ban.
    pub async fn toggle_ban(
        &self,
        admin_id: &str,
        target_id: &str,
        username: Option<&str>,
    ) -> Result<BanOutcome> {
        let banned = self.is_user_banned(target_id).await?;
        self.set_user_ban(admin_id, target_id, username, !banned).await
    }

    /// Ban or unban a user together with every device and IP hash they
    /// were seen with, in one atomic batch.
    pub async fn set_user_ban(
        &self,
        admin_id: &str,
        target_id: &str,
        username: Option<&str>,
        ban: bool,
    ) -> Result<BanOutcome> {
        if !can_ban(admin_id, target_id) {
            return Err(ClientError::NotAllowed("You cannot ban yourself."));
        }

        let display_name = username
            .map(|u| truncate_chars(u, 30))
            .filter(|u| !u.is_empty())
            .unwrap_or(UNKNOWN_USERNAME)
            .to_string();

        let devices = self.devices_of(target_id).await;
        let known: Vec<KnownDevice> = devices.iter().map(DeviceRecord::known_device).collect();
        let plan = plan_ban_propagation(&known, &IpBanPolicy::AllKnown);

        let mut batch = WriteBatch::new();
        let user_path = DocPath::new(collections::USERS, target_id);
        let ban_path = DocPath::new(collections::BANNED_USERS, target_id);

        if ban {
            batch.merge(user_path, Fields::new().set("banned", true));
            batch.set(
                ban_path,
                Fields::new()
                    .set("bannedBy", admin_id)
                    .server_timestamp("timestamp")
                    .set("reason", ADMIN_BAN_REASON)
                    .set("username", display_name.clone()),
            );
        } else {
            batch.update(user_path, Fields::new().set("banned", false));
            batch.delete(ban_path);
        }

        for fp in &plan.fingerprints {
            let path = DocPath::new(collections::BANNED_DEVICES, fp);
            if !ban {
                batch.delete(path);
                continue;
            }
            let record = devices.iter().find(|d| &d.fingerprint == fp);
            batch.set(
                path,
                Fields::new()
                    .set("fingerprint", fp.clone())
                    .set("userId", target_id)
                    .set("username", display_name.clone())
                    .set("bannedBy", admin_id)
                    .server_timestamp("timestamp")
                    .set("reason", ADMIN_BAN_REASON)
                    .set("userAgent", record.and_then(|d| d.user_agent.clone()))
                    .set("platform", record.and_then(|d| d.platform.clone())),
            );
        }

        for hash in &plan.ip_hashes {
            let path = DocPath::new(collections::BANNED_IPS, hash);
            if !ban {
                batch.delete(path);
                continue;
            }
            batch.set(
                path,
                Fields::new()
                    .set("ipHash", hash.clone())
                    .set("userId", target_id)
                    .set("username", display_name.clone())
                    .set("bannedBy", admin_id)
                    .server_timestamp("timestamp")
                    .set("reason", ADMIN_BAN_REASON),
            );
        }

        self.store.commit(batch).await?;

        let outcome = BanOutcome {
            banned: ban,
            devices: plan.fingerprints.len(),
            ips: plan.ip_hashes.len(),
        };
        info!(
            banned = outcome.banned,
            devices = outcome.devices,
            ips = outcome.ips,
            "Ban state updated"
        );
        Ok(outcome)
    }

    async fn devices_of(&self, user_id: &str) -> Vec<DeviceRecord> {
        let query = Query::collection(collections::USER_DEVICES).where_eq("userId", user_id);
        match self.store.query(&query).await {
            Ok(docs) => docs
                .iter()
                .filter_map(|doc| doc.decode::<DeviceRecord>().ok())
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not fetch user devices");
                Vec::new()
            }
        }
    }

    // === Spam ===

    /// Ban the current session for spamming.
    ///
    /// The device is registered first if unknown. The device ban is only
    /// written for a registered device, and the IP ban only when the stored
    /// IP hash matches the one observed now.
    pub async fn auto_ban(
        &self,
        user_id: &str,
        device: Option<&DeviceInfo>,
    ) -> std::result::Result<AutoBanPlan, StoreError> {
        info!("Auto-banning session for spam");

        let username = match self
            .store
            .get(&DocPath::new(collections::USERS, user_id))
            .await
        {
            Ok(Some(doc)) => doc
                .decode::<UserProfile>()
                .map(|p| p.username)
                .unwrap_or_default(),
            Ok(None) => String::new(),
            Err(e) => {
                warn!(error = %e, "Could not fetch username for ban");
                String::new()
            }
        };

        let fingerprint = device
            .map(|d| d.fingerprint.as_str())
            .filter(|fp| !fp.is_empty());
        let observed_hash = device.and_then(|d| d.ip_hash.as_deref());

        let (registered, stored_hash) = match (fingerprint, device) {
            (Some(fp), Some(device)) => self.ensure_device(user_id, fp, device).await,
            _ => (false, None),
        };

        let plan = plan_auto_ban(fingerprint, registered, stored_hash.as_deref(), observed_hash);

        let mut batch = WriteBatch::new();
        batch.merge(
            DocPath::new(collections::USERS, user_id),
            Fields::new().set("banned", true),
        );
        batch.set(
            DocPath::new(collections::BANNED_USERS, user_id),
            Fields::new()
                .set("bannedBy", SYSTEM_AUTO_BAN)
                .server_timestamp("timestamp")
                .set("reason", AUTO_BAN_REASON)
                .set("username", username.clone()),
        );

        if let Some(fp) = &plan.device {
            batch.set(
                DocPath::new(collections::BANNED_DEVICES, fp),
                Fields::new()
                    .set("fingerprint", fp.clone())
                    .set("userId", user_id)
                    .set("username", username.clone())
                    .set("bannedBy", SYSTEM_AUTO_BAN)
                    .server_timestamp("timestamp")
                    .set("reason", AUTO_BAN_DEVICE_REASON)
                    .set("userAgent", device.map(|d| d.user_agent.clone()))
                    .set("platform", device.map(|d| d.platform.clone())),
            );
        }

        match &plan.ip_hash {
            Some(hash) => {
                batch.set(
                    DocPath::new(collections::BANNED_IPS, hash),
                    Fields::new()
                        .set("ipHash", hash.clone())
                        .set("fingerprint", fingerprint.map(str::to_string))
                        .set("userId", user_id)
                        .set("username", username)
                        .set("bannedBy", SYSTEM_AUTO_BAN)
                        .server_timestamp("timestamp")
                        .set("reason", AUTO_BAN_DEVICE_REASON),
                );
            }
            None => debug!("IP ban skipped, hash mismatch or not available"),
        }

        self.store.commit(batch).await?;
        info!(
            device = plan.device.is_some(),
            ip = plan.ip_hash.is_some(),
            "Session auto-banned"
        );
        Ok(plan)
    }

    /// Returns whether the device is registered under the user and the IP
    /// hash stored on its record.
    async fn ensure_device(
        &self,
        user_id: &str,
        fingerprint: &str,
        device: &DeviceInfo,
    ) -> (bool, Option<String>) {
        let path = DocPath::new(
            collections::USER_DEVICES,
            DeviceRecord::doc_id(user_id, fingerprint),
        );

        match self.store.get(&path).await {
            Ok(Some(doc)) => {
                let stored = doc
                    .decode::<DeviceRecord>()
                    .ok()
                    .and_then(|record| record.ip_hash);
                (true, stored)
            }
            Ok(None) => {
                let registered = self
                    .store
                    .set(
                        &path,
                        Fields::new()
                            .set("userId", user_id)
                            .set("fingerprint", fingerprint)
                            .set("ipHash", device.ip_hash.clone())
                            .set("ipAddress", device.ip_address.clone())
                            .server_timestamp("firstSeen")
                            .server_timestamp("lastSeen")
                            .set("userAgent", device.user_agent.clone())
                            .set("platform", device.platform.clone()),
                    )
                    .await;
                match registered {
                    Ok(()) => (true, device.ip_hash.clone()),
                    Err(e) => {
                        warn!(error = %e, "Device registration for ban failed");
                        (false, None)
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Device lookup for ban failed");
                (false, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FingerprintSource, PlatformInfo};
    use crate::memory::MemoryStore;

    fn device(fp: &str, ip: Option<&str>) -> DeviceInfo {
        DeviceInfo::new(
            &PlatformInfo::default(),
            fp.to_string(),
            FingerprintSource::Stored,
            ip.map(String::from),
        )
    }

    fn service(store: &MemoryStore) -> Moderation {
        Moderation::new(Arc::new(store.clone()), &Config::from_env())
    }

    #[tokio::test]
    async fn clear_session_checks_clear() {
        let store = MemoryStore::new();
        let keys = SessionKeys::new("u1", Some(&device("fp1", Some("1.2.3.4"))));
        assert!(service(&store).check_bans(&keys).await.is_clear());
    }

    #[tokio::test]
    async fn legacy_raw_ip_key_counts_as_ip_ban() {
        let store = MemoryStore::new();
        store
            .set(
                &DocPath::new(collections::BANNED_IPS, "1_2_3_4"),
                Fields::new().set("reason", "legacy"),
            )
            .await
            .unwrap();

        let keys = SessionKeys::new("u1", Some(&device("fp1", Some("1.2.3.4"))));
        assert_eq!(keys.raw_ip_key.as_deref(), Some("1_2_3_4"));
        let check = service(&store).check_bans(&keys).await;
        assert_eq!(check.kind(), Some(BanKind::Ip));
    }

    #[tokio::test]
    async fn register_device_creates_then_refreshes() {
        let store = MemoryStore::new();
        let moderation = service(&store);
        let path = DocPath::new(collections::USER_DEVICES, "u1_fp1");

        moderation
            .register_device("u1", &device("fp1", None))
            .await
            .unwrap();
        let created = store.peek(&path).await.unwrap();
        assert!(created["firstSeen"].is_number());
        assert!(created["ipHash"].is_null());

        moderation
            .register_device("u1", &device("fp1", Some("9.9.9.9")))
            .await
            .unwrap();
        let refreshed = store.peek(&path).await.unwrap();
        assert_eq!(refreshed["ipAddress"], "9.9.9.9");
        assert_eq!(refreshed["firstSeen"], created["firstSeen"]);
    }

    #[tokio::test]
    async fn self_ban_is_refused() {
        let store = MemoryStore::new();
        let err = service(&store)
            .set_user_ban("admin", "admin", Some("me"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotAllowed(_)));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn auto_ban_registers_unknown_device_and_bans_ip() {
        let store = MemoryStore::new();
        let info = device("fp1", Some("5.6.7.8"));

        let plan = service(&store).auto_ban("u1", Some(&info)).await.unwrap();

        assert_eq!(plan.device.as_deref(), Some("fp1"));
        assert_eq!(plan.ip_hash, info.ip_hash);
        assert!(store
            .peek(&DocPath::new(collections::USER_DEVICES, "u1_fp1"))
            .await
            .is_some());
        let user_ban = store
            .peek(&DocPath::new(collections::BANNED_USERS, "u1"))
            .await
            .unwrap();
        assert_eq!(user_ban["bannedBy"], SYSTEM_AUTO_BAN);
        assert_eq!(
            store
                .peek(&DocPath::new(collections::USERS, "u1"))
                .await
                .unwrap()["banned"],
            true
        );
    }

    #[tokio::test]
    async fn auto_ban_skips_ip_when_network_changed() {
        let store = MemoryStore::new();
        let moderation = service(&store);
        moderation
            .register_device("u1", &device("fp1", Some("1.1.1.1")))
            .await
            .unwrap();

        let plan = moderation
            .auto_ban("u1", Some(&device("fp1", Some("2.2.2.2"))))
            .await
            .unwrap();

        assert_eq!(plan.device.as_deref(), Some("fp1"));
        assert_eq!(plan.ip_hash, None);
        assert_eq!(store.count(collections::BANNED_IPS).await, 0);
    }

    #[tokio::test]
    async fn ban_watch_reports_record_changes() {
        let store = MemoryStore::new();
        let moderation = service(&store);
        let keys = SessionKeys::new("u1", Some(&device("fp1", None)));
        let mut watch = moderation.watch_bans(&keys).await;

        // Initial states for user and device.
        for _ in 0..2 {
            assert!(!watch.next().await.unwrap().exists);
        }

        store
            .set(
                &DocPath::new(collections::BANNED_DEVICES, "fp1"),
                Fields::new().set("reason", "x"),
            )
            .await
            .unwrap();
        assert_eq!(
            watch.next().await,
            Some(BanEvent {
                kind: BanKind::Device,
                exists: true
            })
        );
    }

    #[test]
    fn outcome_messages() {
        let outcome = BanOutcome {
            banned: true,
            devices: 2,
            ips: 1,
        };
        assert_eq!(
            outcome.message(),
            "🚫 User BANNED. Added 2 device ban(s) and 1 IP ban(s)."
        );
    }
}
