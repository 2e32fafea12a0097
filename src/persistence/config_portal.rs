//! # Configuration Portal
//!
//! Thread-safe access to application settings, profiles and wheel
//! calibrations. Device engine threads reach it through the [`ProfileStore`]
//! and [`CalibrationStore`] collaborator traits; everything else goes through
//! [`ConfigPortal::execute_portal_action`].
//!
//! ```text
//! engine threads ──► ProfileStore / CalibrationStore ──┐
//!                                                       ▼
//! main / autosave ──► PortalAction ──────────────► ConfigPortal ──► ConfigRepository
//! ```
//!
//! Each section sits behind its own `Arc<RwLock<_>>`. Locks are only ever
//! taken with `try_read`/`try_write` through the `try_lock!` macro, which
//! retries a bounded number of times and then fails with
//! [`Error::LockTimeout`] instead of blocking a report thread.

use crate::config::AppConfig;
use crate::controller::report::DeviceIndex;
use crate::mapping::wheel::{CalibrationStore, WheelAnchors};
use crate::mapping::{MappingError, Profile, ProfileStore};
use crate::try_lock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{CalibrationBook, ProfileConfig};

#[derive(Default, Debug)]
pub struct ConfigPortal {
    /// Application settings
    pub app_config: Arc<RwLock<AppConfig>>,

    /// Persisted profiles, keyed by profile name
    pub profiles: Arc<RwLock<HashMap<String, ProfileConfig>>>,

    /// Wheel calibrations per device slot
    pub calibrations: Arc<RwLock<CalibrationBook>>,
}

impl ConfigPortal {
    pub fn new(
        app_config: AppConfig,
        profiles: Vec<ProfileConfig>,
        calibrations: CalibrationBook,
    ) -> Self {
        let profiles = profiles
            .into_iter()
            .map(|profile| (profile.name.clone(), profile))
            .collect();
        Self {
            app_config: Arc::new(RwLock::new(app_config)),
            profiles: Arc::new(RwLock::new(profiles)),
            calibrations: Arc::new(RwLock::new(calibrations)),
        }
    }

    /// Executes a configuration operation under the retrying lock macro
    ///
    /// ```rust,ignore
    /// let names = match portal.execute_portal_action(PortalAction::ListProfiles) {
    ///     ConfigResult::ProfileNames(names) => names,
    ///     ConfigResult::Failed(e) => return Err(e.into()),
    ///     _ => Vec::new(),
    /// };
    /// ```
    pub fn execute_portal_action(&self, action: PortalAction) -> ConfigResult {
        self.execute_with_budget(action, LockBudget::BACKGROUND)
    }

    /// Same as [`Self::execute_portal_action`] with an explicit lock budget
    pub fn execute_with_budget(&self, action: PortalAction, budget: LockBudget) -> ConfigResult {
        let result = match action {
            // Application settings
            PortalAction::GetAppConfig => {
                try_lock!(@read_lock_retry, budget, self.app_config, |guard: &AppConfig| {
                    ConfigResult::AppConfig(guard.clone())
                })
            }
            PortalAction::WriteAppConfig(app_config) => {
                try_lock!(@write_lock_retry, budget, self.app_config, |guard: &mut AppConfig| {
                    *guard = app_config;
                    ConfigResult::Success
                })
            }

            // Profiles
            PortalAction::GetProfile(name) => {
                try_lock!(@read_lock_retry, budget, self.profiles, |guard: &HashMap<String, ProfileConfig>| {
                    ConfigResult::Profile(guard.get(&name).cloned())
                })
            }
            PortalAction::ListProfiles => {
                try_lock!(@read_lock_retry, budget, self.profiles, |guard: &HashMap<String, ProfileConfig>| {
                    let mut names: Vec<String> = guard.keys().cloned().collect();
                    names.sort();
                    ConfigResult::ProfileNames(names)
                })
            }
            PortalAction::WriteProfile(profile) => {
                try_lock!(@write_lock_retry, budget, self.profiles, |guard: &mut HashMap<String, ProfileConfig>| {
                    guard.insert(profile.name.clone(), profile);
                    ConfigResult::Success
                })
            }
            PortalAction::RemoveProfile(name) => {
                try_lock!(@write_lock_retry, budget, self.profiles, |guard: &mut HashMap<String, ProfileConfig>| {
                    match guard.remove(&name) {
                        Some(_) => ConfigResult::Success,
                        None => ConfigResult::Failed(Error::ProfileNotFound(name)),
                    }
                })
            }

            // Wheel calibrations
            PortalAction::GetCalibration(device) => {
                try_lock!(@read_lock_retry, budget, self.calibrations, |guard: &CalibrationBook| {
                    ConfigResult::Calibration(guard.get(device))
                })
            }
            PortalAction::GetCalibrations => {
                try_lock!(@read_lock_retry, budget, self.calibrations, |guard: &CalibrationBook| {
                    ConfigResult::Calibrations(guard.clone())
                })
            }
            PortalAction::WriteCalibration(device, anchors) => {
                try_lock!(@write_lock_retry, budget, self.calibrations, |guard: &mut CalibrationBook| {
                    guard.insert(device, anchors);
                    ConfigResult::Success
                })
            }
            PortalAction::TakeUnsavedCalibrations => {
                try_lock!(@write_lock_retry, budget, self.calibrations, |guard: &mut CalibrationBook| {
                    if guard.dirty {
                        guard.dirty = false;
                        ConfigResult::UnsavedCalibrations(Some(guard.clone()))
                    } else {
                        ConfigResult::UnsavedCalibrations(None)
                    }
                })
            }
            PortalAction::MarkCalibrationsUnsaved => {
                try_lock!(@write_lock_retry, budget, self.calibrations, |guard: &mut CalibrationBook| {
                    guard.dirty = true;
                    ConfigResult::Success
                })
            }
        };

        match result {
            Ok(res) => res,
            Err(e) => ConfigResult::Failed(e),
        }
    }
}

impl ProfileStore for ConfigPortal {
    fn load_profile(&self, name: &str) -> Result<Profile, MappingError> {
        match self.execute_with_budget(PortalAction::GetProfile(name.to_string()), LockBudget::REPORT_THREAD) {
            ConfigResult::Profile(Some(config)) => Ok(config.resolve()),
            ConfigResult::Profile(None) => Err(MappingError::ProfileNotFound(name.to_string())),
            ConfigResult::Failed(e) => Err(MappingError::ConfigError(format!(
                "Failed to read profile '{}': {}",
                name, e
            ))),
            _ => Err(MappingError::ConfigError(format!(
                "Unexpected portal result for profile '{}'",
                name
            ))),
        }
    }
}

impl CalibrationStore for ConfigPortal {
    fn load_calibration(&self, device: DeviceIndex) -> Option<WheelAnchors> {
        match self.execute_with_budget(PortalAction::GetCalibration(device), LockBudget::REPORT_THREAD) {
            ConfigResult::Calibration(anchors) => anchors,
            ConfigResult::Failed(e) => {
                warn!("Unable to read calibration for {}: {}", device, e);
                None
            }
            _ => None,
        }
    }

    fn save_calibration(&self, device: DeviceIndex, anchors: WheelAnchors) -> Result<(), MappingError> {
        match self.execute_with_budget(
            PortalAction::WriteCalibration(device, anchors),
            LockBudget::REPORT_THREAD,
        ) {
            ConfigResult::Failed(e) => Err(MappingError::CalibrationError(format!(
                "Failed to store calibration for {}: {}",
                device, e
            ))),
            _ => {
                debug!("Calibration for {} queued for autosave", device);
                Ok(())
            }
        }
    }
}

/// Configuration operations
///
/// - **Get{Thing}**: read operations that return cloned data
/// - **Write{Thing}**: write operations that take owned data
#[derive(Debug)]
pub enum PortalAction {
    GetAppConfig,
    WriteAppConfig(AppConfig),

    GetProfile(String),
    ListProfiles,
    WriteProfile(ProfileConfig),
    RemoveProfile(String),

    GetCalibration(DeviceIndex),
    GetCalibrations,
    WriteCalibration(DeviceIndex, WheelAnchors),
    /// Snapshot for saving; clears the dirty flag under the same lock
    TakeUnsavedCalibrations,
    /// Re-flags calibrations after a failed save
    MarkCalibrationsUnsaved,
}

/// Return values of [`ConfigPortal::execute_portal_action`]
#[derive(Debug)]
pub enum ConfigResult {
    Success,
    AppConfig(AppConfig),
    Profile(Option<ProfileConfig>),
    ProfileNames(Vec<String>),
    Calibration(Option<WheelAnchors>),
    Calibrations(CalibrationBook),
    UnsavedCalibrations(Option<CalibrationBook>),
    Failed(Error),
}

/// Retry budget of one portal call
///
/// Engine report threads read profiles and calibrations through the store
/// traits and get the short budget so a contended portal never stalls a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockBudget {
    pub attempts: usize,
    pub delay: std::time::Duration,
}

impl LockBudget {
    pub const BACKGROUND: Self = Self {
        attempts: 5,
        delay: std::time::Duration::from_millis(10),
    };

    pub const REPORT_THREAD: Self = Self {
        attempts: 5,
        delay: std::time::Duration::from_millis(1),
    };

    /// Longest total sleep before the call gives up
    pub fn max_wait(&self) -> std::time::Duration {
        self.delay * self.attempts.saturating_sub(1) as u32
    }
}

/// Lock retry macro with bounded attempts
///
/// Tries the lock `budget.attempts` times, `budget.delay` apart, and yields
/// `Err(Error::LockTimeout)` once the attempts are used up. The operation's
/// return value is passed through on success.
#[macro_export]
macro_rules! try_lock {
    (@write_lock_retry, $budget:expr, $accessor:expr, $operation:expr) => {{
        let budget: $crate::persistence::config_portal::LockBudget = $budget;
        let mut attempts = 0;

        loop {
            match $accessor.try_write() {
                Ok(mut guard) => {
                    break Ok($operation(&mut *guard));
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        "Write lock blocked: {} (attempt {}/{})",
                        e,
                        attempts,
                        budget.attempts
                    );

                    if attempts >= budget.attempts {
                        break Err($crate::persistence::config_portal::Error::LockTimeout);
                    }

                    std::thread::sleep(budget.delay);
                }
            }
        }
    }};

    (@read_lock_retry, $budget:expr, $accessor:expr, $operation:expr) => {{
        let budget: $crate::persistence::config_portal::LockBudget = $budget;
        let mut attempts = 0;

        loop {
            match $accessor.try_read() {
                Ok(guard) => {
                    break Ok($operation(&*guard));
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        "Read lock blocked: {} (attempt {}/{})",
                        e,
                        attempts,
                        budget.attempts
                    );

                    if attempts >= budget.attempts {
                        break Err($crate::persistence::config_portal::Error::LockTimeout);
                    }

                    std::thread::sleep(budget.delay);
                }
            }
        }
    }};
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not acquire lock after maximum retry attempts")]
    LockTimeout,

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),
}
