//! Ban state machine and ban propagation planning.
//!
//! ```text
//!             initial check
//! Unchecked ──────────────────▶ Clear ◀─────────────┐
//!     │                          │                  │ recheck: all clear
//!     │ initial check            │ record appears   │
//!     ▼                          ▼                  │
//! Banned(kind) ◀──────────── Banned(kind) ──────────┘
//!                                record removed ⇒ RecheckRequired
//! ```
//!
//! Three independent ban collections feed the machine (user id, device
//! fingerprint, IP hash). Entering a banned state tells the caller to tear
//! down every non-ban subscription. Leaving it never resumes silently: the
//! caller re-checks every key and, when all are clear, shows an "access
//! restored" screen that requires a reload.

/// Which ban collection a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BanKind {
    /// `banned_users/{uid}`
    User,
    /// `banned_devices/{fingerprint}`
    Device,
    /// `banned_ips/{ipHash}` (or the legacy raw-IP key)
    Ip,
}

impl BanKind {
    /// Reason text shown on the block screen.
    pub fn reason(self) -> &'static str {
        match self {
            BanKind::User => "You have been banned.",
            BanKind::Device => "Device fingerprint banned",
            BanKind::Ip => "IP address banned",
        }
    }
}

/// Current moderation status of this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanStatus {
    /// No check has completed yet.
    Unchecked,
    /// Checked and not banned.
    Clear,
    /// Banned; the kind is the first ban observed.
    Banned(BanKind),
}

/// Result of probing all ban keys at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BanCheck {
    pub user: bool,
    pub device: bool,
    pub ip: bool,
}

impl BanCheck {
    /// First matching kind in priority order user, device, IP.
    pub fn kind(&self) -> Option<BanKind> {
        if self.user {
            Some(BanKind::User)
        } else if self.device {
            Some(BanKind::Device)
        } else if self.ip {
            Some(BanKind::Ip)
        } else {
            None
        }
    }

    /// True when no key is banned.
    pub fn is_clear(&self) -> bool {
        self.kind().is_none()
    }
}

/// What the caller must do after feeding an observation into the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanTransition {
    /// Nothing changed.
    None,
    /// Session just became banned: tear down listeners and block the UI.
    Entered(BanKind),
    /// A ban record disappeared; probe every key and call
    /// [`BanMonitor::apply_recheck`].
    RecheckRequired,
    /// All bans lifted: show the access-restored screen.
    Restored,
}

/// Session ban state machine.
#[derive(Debug, Clone)]
pub struct BanMonitor {
    status: BanStatus,
    live: BanCheck,
}

impl Default for BanMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl BanMonitor {
    /// Start in [`BanStatus::Unchecked`].
    pub fn new() -> Self {
        Self {
            status: BanStatus::Unchecked,
            live: BanCheck::default(),
        }
    }

    /// Current status.
    pub fn status(&self) -> BanStatus {
        self.status
    }

    /// Whether the session is currently banned.
    pub fn is_banned(&self) -> bool {
        matches!(self.status, BanStatus::Banned(_))
    }

    /// Posting is only allowed from [`BanStatus::Clear`].
    pub fn can_post(&self) -> bool {
        self.status == BanStatus::Clear
    }

    /// Apply the one-time post-authentication check.
    pub fn apply_initial_check(&mut self, check: BanCheck) -> BanTransition {
        self.live = check;
        match check.kind() {
            Some(kind) => self.enter(kind),
            None => {
                self.status = BanStatus::Clear;
                BanTransition::None
            }
        }
    }

    /// Feed a live subscription update for one ban record.
    pub fn observe(&mut self, kind: BanKind, exists: bool) -> BanTransition {
        let flag = match kind {
            BanKind::User => &mut self.live.user,
            BanKind::Device => &mut self.live.device,
            BanKind::Ip => &mut self.live.ip,
        };
        let was = std::mem::replace(flag, exists);

        if exists {
            return if self.is_banned() {
                BanTransition::None
            } else {
                self.enter(kind)
            };
        }

        if was && self.is_banned() {
            match self.live.kind() {
                Some(remaining) => {
                    self.status = BanStatus::Banned(remaining);
                    BanTransition::None
                }
                None => BanTransition::RecheckRequired,
            }
        } else {
            BanTransition::None
        }
    }

    /// Apply a full re-check triggered by [`BanTransition::RecheckRequired`].
    pub fn apply_recheck(&mut self, check: BanCheck) -> BanTransition {
        self.live = check;
        match check.kind() {
            Some(kind) => {
                if !self.is_banned() {
                    return self.enter(kind);
                }
                self.status = BanStatus::Banned(kind);
                BanTransition::None
            }
            None if self.is_banned() => {
                self.status = BanStatus::Clear;
                BanTransition::Restored
            }
            None => BanTransition::None,
        }
    }

    /// Mark the session banned locally (automatic spam ban).
    pub fn force_ban(&mut self, kind: BanKind) -> BanTransition {
        match kind {
            BanKind::User => self.live.user = true,
            BanKind::Device => self.live.device = true,
            BanKind::Ip => self.live.ip = true,
        }
        if self.is_banned() {
            BanTransition::None
        } else {
            self.enter(kind)
        }
    }

    fn enter(&mut self, kind: BanKind) -> BanTransition {
        self.status = BanStatus::Banned(kind);
        BanTransition::Entered(kind)
    }
}

/// A known device of the ban target, as stored in `user_devices`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownDevice {
    pub fingerprint: Option<String>,
    pub ip_hash: Option<String>,
}

/// Ban records to create (or remove) for every device of a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BanPlan {
    /// Distinct fingerprints, in first-seen order.
    pub fingerprints: Vec<String>,
    /// Distinct IP hashes, in first-seen order.
    pub ip_hashes: Vec<String>,
}

/// Which stored IP hashes may be turned into IP bans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpBanPolicy {
    /// Ban every non-empty stored hash.
    AllKnown,
    /// Only ban a stored hash equal to the given observed one. Avoids banning
    /// an egress IP that merely collided with or was shared by the target.
    MatchObserved(Option<String>),
}

impl IpBanPolicy {
    fn admits(&self, stored: &str) -> bool {
        match self {
            IpBanPolicy::AllKnown => true,
            IpBanPolicy::MatchObserved(Some(observed)) => observed == stored,
            IpBanPolicy::MatchObserved(None) => false,
        }
    }
}

/// Compute the device and IP ban records implied by banning a user.
///
/// Unbanning uses the same plan so exactly the records a ban created are
/// removed.
pub fn plan_ban_propagation(devices: &[KnownDevice], policy: &IpBanPolicy) -> BanPlan {
    let mut plan = BanPlan::default();

    for device in devices {
        if let Some(fp) = device.fingerprint.as_deref().filter(|fp| !fp.is_empty()) {
            if !plan.fingerprints.iter().any(|known| known == fp) {
                plan.fingerprints.push(fp.to_string());
            }
        }
        if let Some(hash) = device.ip_hash.as_deref().filter(|h| !h.is_empty()) {
            if policy.admits(hash) && !plan.ip_hashes.iter().any(|known| known == hash) {
                plan.ip_hashes.push(hash.to_string());
            }
        }
    }

    plan
}

/// Plan for the automatic spam ban of the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoBanPlan {
    /// Fingerprint to ban, if the device is durably registered to this user.
    pub device: Option<String>,
    /// IP hash to ban, if it matches what the device record stored.
    pub ip_hash: Option<String>,
}

/// Decide which device-level records the automatic ban may write.
///
/// The user record is always written. The device ban needs a device record
/// registered under this exact user; the IP ban additionally needs the stored
/// IP hash to equal the currently observed one.
pub fn plan_auto_ban(
    fingerprint: Option<&str>,
    device_registered: bool,
    stored_ip_hash: Option<&str>,
    observed_ip_hash: Option<&str>,
) -> AutoBanPlan {
    let fingerprint = fingerprint.filter(|fp| !fp.is_empty());
    let device = fingerprint
        .filter(|_| device_registered)
        .map(str::to_string);

    let ip_hash = match (stored_ip_hash, observed_ip_hash) {
        (Some(stored), Some(observed))
            if device_registered && fingerprint.is_some() && !observed.is_empty() && stored == observed =>
        {
            Some(observed.to_string())
        }
        _ => None,
    };

    AutoBanPlan { device, ip_hash }
}

/// A user may never ban themselves.
pub fn can_ban(actor_id: &str, target_id: &str) -> bool {
    !target_id.is_empty() && actor_id != target_id
}
