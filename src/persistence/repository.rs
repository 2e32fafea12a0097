use super::config_portal::{ConfigPortal, ConfigResult, PortalAction};
use super::{CalibrationBook, ProfileConfig};
use crate::config::{AppConfig, CALIBRATIONS_FILE, CONFIG_FILE, PROFILES_DIR};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const PROFILE_EXTENSION: &str = "toml";

/// File layout of the configuration root
#[derive(Debug, Clone)]
pub struct ConfigRepository {
    root: PathBuf,
}

impl ConfigRepository {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join(PROFILES_DIR)
    }

    pub fn calibrations_path(&self) -> PathBuf {
        self.root.join(CALIBRATIONS_FILE)
    }

    fn profile_path(&self, name: &str) -> PathBuf {
        self.profiles_dir().join(format!("{}.{}", name, PROFILE_EXTENSION))
    }

    /// Creates the config root with an application config and the default
    /// profile when they are missing
    pub async fn ensure_default_config(&self, default_profile: &str) -> Result<()> {
        let profiles_dir = self.profiles_dir();
        tokio::fs::create_dir_all(&profiles_dir)
            .await
            .map_err(|e| eyre!("Failed to create profile directory: {}", e))?;

        let profile_path = self.profile_path(default_profile);
        if !tokio::fs::try_exists(&profile_path)
            .await
            .map_err(|e| eyre!("Failed to check if default profile exists: {}", e))?
        {
            info!("Creating default profile '{}'", default_profile);
            self.save_profile(&ProfileConfig::named(default_profile)).await?;
        }
        Ok(())
    }

    pub async fn load_app_config(&self) -> Result<AppConfig> {
        AppConfig::load_or_create(&self.config_path()).await
    }

    /// Loads every profile file; unreadable files are skipped with a warning
    pub async fn load_profiles(&self) -> Result<Vec<ProfileConfig>> {
        let dir = self.profiles_dir();
        if !tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| eyre!("Failed to check if profile directory exists: {}", e))?
        {
            debug!("Profile directory does not exist, no profiles available");
            return Ok(Vec::new());
        }

        let mut profiles = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| eyre!("Failed to read profile directory: {}", e))?;

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| eyre!("Failed to read directory entry: {}", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PROFILE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|n| n.to_str()) else {
                continue;
            };
            match load_profile_file(&path, stem).await {
                Ok(profile) => {
                    debug!("Found profile: {}", profile.name);
                    profiles.push(profile);
                }
                Err(e) => warn!("Failed to load profile {}: {}", path.display(), e),
            }
        }

        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }

    pub async fn save_profile(&self, profile: &ProfileConfig) -> Result<()> {
        let content = toml::to_string_pretty(profile)
            .map_err(|e| eyre!("Failed to serialize profile '{}': {}", profile.name, e))?;
        tokio::fs::write(self.profile_path(&profile.name), content)
            .await
            .map_err(|e| eyre!("Failed to write profile '{}': {}", profile.name, e))?;
        info!("Profile {} saved successfully", profile.name);
        Ok(())
    }

    pub async fn load_calibrations(&self) -> Result<CalibrationBook> {
        let path = self.calibrations_path();
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check if calibration file exists: {}", e))?
        {
            debug!("No calibration file, starting uncalibrated");
            return Ok(CalibrationBook::default());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read calibration file: {}", e))?;
        toml::from_str(&content).map_err(|e| eyre!("Failed to parse calibration file: {}", e))
    }

    pub async fn save_calibrations(&self, book: &CalibrationBook) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        let content = toml::to_string_pretty(book)
            .map_err(|e| eyre!("Failed to serialize calibrations: {}", e))?;
        tokio::fs::write(self.calibrations_path(), content)
            .await
            .map_err(|e| eyre!("Failed to write calibration file: {}", e))
    }

    /// Loads everything into a new portal
    pub async fn load_portal(&self) -> Result<ConfigPortal> {
        let app_config = self.load_app_config().await?;
        self.ensure_default_config(&app_config.default_profile).await?;
        let profiles = self.load_profiles().await?;
        let calibrations = self.load_calibrations().await?;
        info!(
            "Loaded {} profiles and {} calibrations from {}",
            profiles.len(),
            calibrations.devices.len(),
            self.root.display()
        );
        Ok(ConfigPortal::new(app_config, profiles, calibrations))
    }

    /// Writes calibrations captured since the last save
    pub async fn flush_calibrations(&self, portal: &ConfigPortal) -> Result<bool> {
        let book = match portal.execute_portal_action(PortalAction::TakeUnsavedCalibrations) {
            ConfigResult::UnsavedCalibrations(Some(book)) => book,
            ConfigResult::UnsavedCalibrations(None) => return Ok(false),
            ConfigResult::Failed(e) => return Err(eyre!("Failed to read calibrations: {}", e)),
            _ => return Err(eyre!("Unexpected portal result for calibrations")),
        };

        if let Err(e) = self.save_calibrations(&book).await {
            if let ConfigResult::Failed(mark_err) =
                portal.execute_portal_action(PortalAction::MarkCalibrationsUnsaved)
            {
                warn!("Calibrations not saved and not re-flagged: {}", mark_err);
            }
            return Err(e);
        }
        Ok(true)
    }

    pub fn start_autosave_task(
        self: Arc<Self>,
        portal: Arc<ConfigPortal>,
        interval_seconds: u64,
    ) -> JoinHandle<()> {
        info!("Starting autosave task with interval: {}s", interval_seconds);

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

            loop {
                interval.tick().await;

                match self.flush_calibrations(&portal).await {
                    Ok(true) => debug!("Calibrations autosaved successfully"),
                    Ok(false) => {}
                    Err(e) => error!("Failed to autosave calibrations: {}", e),
                }
            }
        })
    }
}

async fn load_profile_file(path: &Path, stem: &str) -> Result<ProfileConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| eyre!("Failed to read profile file: {}", e))?;
    let mut profile: ProfileConfig =
        toml::from_str(&content).map_err(|e| eyre!("Failed to parse profile file: {}", e))?;
    if profile.name != stem {
        if !profile.name.is_empty() {
            warn!(
                "Profile name '{}' does not match file name '{}', using file name",
                profile.name, stem
            );
        }
        profile.name = stem.to_string();
    }
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::report::DeviceIndex;
    use crate::mapping::wheel::{CalibrationStore, Point, WheelAnchors};
    use crate::mapping::ProfileStore;

    fn scratch_root(test: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("padremap-{}-{}-{}", test, std::process::id(), nanos))
    }

    #[tokio::test]
    async fn fresh_root_gets_defaults() {
        let repo = ConfigRepository::new(scratch_root("fresh"));
        let portal = repo.load_portal().await.unwrap();

        assert!(repo.config_path().exists());
        assert!(repo.profiles_dir().join("default.toml").exists());
        assert_eq!(portal.load_profile("default").unwrap().name, "default");

        let _ = tokio::fs::remove_dir_all(repo.root()).await;
    }

    #[tokio::test]
    async fn profile_name_follows_file_name() {
        let repo = ConfigRepository::new(scratch_root("names"));
        repo.ensure_default_config("default").await.unwrap();
        tokio::fs::write(repo.profiles_dir().join("racing.toml"), "name = \"other\"\n")
            .await
            .unwrap();
        tokio::fs::write(repo.profiles_dir().join("broken.toml"), "name = [")
            .await
            .unwrap();

        let names: Vec<String> = repo
            .load_profiles()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["default", "racing"]);

        let _ = tokio::fs::remove_dir_all(repo.root()).await;
    }

    #[tokio::test]
    async fn dirty_calibrations_are_flushed_once() {
        let repo = ConfigRepository::new(scratch_root("calib"));
        let portal = repo.load_portal().await.unwrap();
        let device = DeviceIndex::new(0).unwrap();

        assert!(!repo.flush_calibrations(&portal).await.unwrap());
        portal
            .save_calibration(device, WheelAnchors::estimated(Point { x: 0, y: 120 }))
            .unwrap();
        assert!(repo.flush_calibrations(&portal).await.unwrap());
        assert!(!repo.flush_calibrations(&portal).await.unwrap());

        let reloaded = repo.load_calibrations().await.unwrap();
        assert_eq!(reloaded.get(device).map(|a| a.center), Some(Point { x: 0, y: 120 }));

        let _ = tokio::fs::remove_dir_all(repo.root()).await;
    }

    #[tokio::test]
    async fn calibration_written_during_flush_stays_unsaved() {
        let repo = ConfigRepository::new(scratch_root("race"));
        let portal = repo.load_portal().await.unwrap();
        let first = DeviceIndex::new(0).unwrap();
        let second = DeviceIndex::new(1).unwrap();

        portal
            .save_calibration(first, WheelAnchors::estimated(Point { x: 0, y: 100 }))
            .unwrap();
        let taken = match portal.execute_portal_action(PortalAction::TakeUnsavedCalibrations) {
            ConfigResult::UnsavedCalibrations(Some(book)) => book,
            other => panic!("unexpected result {:?}", other),
        };
        assert!(taken.get(second).is_none());

        // an engine stores a calibration while the snapshot is being written
        portal
            .save_calibration(second, WheelAnchors::estimated(Point { x: 5, y: 90 }))
            .unwrap();
        repo.save_calibrations(&taken).await.unwrap();

        assert!(repo.flush_calibrations(&portal).await.unwrap());
        let reloaded = repo.load_calibrations().await.unwrap();
        assert!(reloaded.get(first).is_some());
        assert!(reloaded.get(second).is_some());

        let _ = tokio::fs::remove_dir_all(repo.root()).await;
    }

    #[tokio::test]
    async fn failed_save_keeps_calibrations_unsaved() {
        let base = scratch_root("failed");
        tokio::fs::create_dir_all(&base).await.unwrap();
        let blocker = base.join("not-a-dir");
        tokio::fs::write(&blocker, "").await.unwrap();

        let portal = ConfigPortal::default();
        let device = DeviceIndex::new(2).unwrap();
        portal
            .save_calibration(device, WheelAnchors::estimated(Point { x: 1, y: 1 }))
            .unwrap();

        let repo = ConfigRepository::new(blocker);
        assert!(repo.flush_calibrations(&portal).await.is_err());
        match portal.execute_portal_action(PortalAction::GetCalibrations) {
            ConfigResult::Calibrations(book) => assert!(book.dirty),
            other => panic!("unexpected result {:?}", other),
        }

        let _ = tokio::fs::remove_dir_all(&base).await;
    }
}
