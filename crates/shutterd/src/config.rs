//! Configuration management for shutterd.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "shutterd";

/// Default upload token file name.
const TOKEN_FILE_NAME: &str = "upload-token.json";

/// Default upload queue journal file name.
const JOURNAL_FILE_NAME: &str = "upload-queue.json";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `SHUTTERD_`, sections separated
///    by a double underscore: `SHUTTERD_STORAGE__LOW_WATER_MB=750`)
/// 2. TOML config file at `~/.config/shutterd/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Camera tool configuration.
    pub camera: CameraConfig,
    /// Output storage configuration.
    pub storage: StorageConfig,
    /// Upload worker configuration.
    pub upload: UploadConfig,
    /// Daemon runtime configuration.
    pub daemon: DaemonConfig,
}

/// Camera capture tool configuration.
///
/// The capture tools are opaque external commands invoked with a small
/// argument contract: resolution, quality or bitrate, duration, output path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Command used for still photos and preview.
    pub photo_tool: String,
    /// Command used for video recording.
    pub video_tool: String,
    /// Capture width in pixels.
    pub width: u32,
    /// Capture height in pixels.
    pub height: u32,
    /// JPEG quality for photos (1-100).
    pub photo_quality: u8,
    /// Video bitrate in bits per second.
    pub video_bitrate: u32,
    /// Photo exposure/settle time passed to the tool, in milliseconds.
    pub photo_timeout_ms: u64,
    /// Show the preview fullscreen.
    pub fullscreen_preview: bool,
}

/// Output storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding `photos/` and `videos/`.
    /// Defaults to `~/.local/share/shutterd`.
    pub output_dir: Option<PathBuf>,
    /// Free-space low watermark in megabytes. Below this a warning is
    /// emitted each monitor tick.
    pub low_water_mb: u64,
    /// Free-space critical watermark in megabytes. Below this new captures
    /// are vetoed and cleanup runs.
    pub critical_water_mb: u64,
    /// Seconds between disk monitor ticks.
    pub check_interval_secs: u64,
    /// Maximum photos retained by cleanup. 0 for unlimited.
    pub max_photos: usize,
    /// Maximum videos retained by cleanup. 0 for unlimited.
    pub max_videos: usize,
}

/// Upload worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Enable the upload worker.
    pub enabled: bool,
    /// Remote folder id that receives uploads.
    pub remote_folder_id: String,
    /// External uploader command.
    pub uploader_tool: String,
    /// Remote name the uploader tool is configured with.
    pub remote_name: String,
    /// Path to the persisted access token.
    /// Defaults to `~/.local/share/shutterd/upload-token.json`.
    pub token_path: Option<PathBuf>,
    /// Path to the pending-upload journal.
    /// Defaults to `~/.local/share/shutterd/upload-queue.json`.
    pub journal_path: Option<PathBuf>,
    /// Maximum attempts per task before it is marked failed.
    pub max_attempts: u32,
    /// Base retry delay in milliseconds.
    pub base_delay_ms: u64,
    /// Retry delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Seconds between re-authentication attempts while paused.
    pub auth_retry_secs: u64,
}

/// Daemon runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Capacity of the keyboard command channel. Commands arriving while
    /// the channel is full are dropped with a warning.
    pub command_channel_capacity: usize,
    /// Seconds to wait for graceful process termination before killing.
    pub stop_grace_secs: u64,
    /// Seconds to wait for the preview process to terminate.
    pub preview_grace_secs: u64,
    /// Upper bound in seconds for the whole shutdown sequence.
    pub shutdown_timeout_secs: u64,
    /// Shell launched by the `Shell` command.
    pub shell: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            photo_tool: "raspistill".to_string(),
            video_tool: "raspivid".to_string(),
            width: 1920,
            height: 1080,
            photo_quality: 85,
            video_bitrate: 8_000_000,
            photo_timeout_ms: 2000,
            fullscreen_preview: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: None, // Resolved to default at runtime
            low_water_mb: 500,
            critical_water_mb: 100,
            check_interval_secs: 30,
            max_photos: 100,
            max_videos: 20,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remote_folder_id: "camera-uploads".to_string(),
            uploader_tool: "rclone".to_string(),
            remote_name: "remote".to_string(),
            token_path: None,
            journal_path: None,
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            auth_retry_secs: 300,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            command_channel_capacity: 8,
            stop_grace_secs: 5,
            preview_grace_secs: 2,
            shutdown_timeout_secs: 10,
            shell: "/bin/bash".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file).nested())
            // Double-underscore separator so multi-word keys stay
            // addressable: SHUTTERD_STORAGE__LOW_WATER_MB.
            .merge(Env::prefixed("SHUTTERD_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.storage.critical_water_mb >= self.storage.low_water_mb {
            return Err(Error::ConfigValidation {
                message: format!(
                    "critical_water_mb ({}) must be below low_water_mb ({})",
                    self.storage.critical_water_mb, self.storage.low_water_mb
                ),
            });
        }

        if self.storage.check_interval_secs == 0 {
            return Err(Error::ConfigValidation {
                message: "check_interval_secs must be greater than 0".to_string(),
            });
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(Error::ConfigValidation {
                message: "capture resolution must be non-zero".to_string(),
            });
        }

        if self.camera.photo_quality == 0 || self.camera.photo_quality > 100 {
            return Err(Error::ConfigValidation {
                message: format!(
                    "photo_quality ({}) must be between 1 and 100",
                    self.camera.photo_quality
                ),
            });
        }

        if self.upload.max_attempts == 0 {
            return Err(Error::ConfigValidation {
                message: "max_attempts must be at least 1".to_string(),
            });
        }

        if self.daemon.command_channel_capacity == 0 {
            return Err(Error::ConfigValidation {
                message: "command_channel_capacity must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Get the output root directory, resolving defaults if not set.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.storage
            .output_dir
            .clone()
            .unwrap_or_else(Self::default_data_dir)
    }

    /// Directory that receives photos.
    #[must_use]
    pub fn photos_dir(&self) -> PathBuf {
        self.output_dir().join("photos")
    }

    /// Directory that receives videos.
    #[must_use]
    pub fn videos_dir(&self) -> PathBuf {
        self.output_dir().join("videos")
    }

    /// Get the token path, resolving defaults if not set.
    #[must_use]
    pub fn token_path(&self) -> PathBuf {
        self.upload
            .token_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(TOKEN_FILE_NAME))
    }

    /// Get the journal path, resolving defaults if not set.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.upload
            .journal_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(JOURNAL_FILE_NAME))
    }

    /// Low watermark in bytes.
    #[must_use]
    pub fn low_water_bytes(&self) -> u64 {
        self.storage.low_water_mb * 1024 * 1024
    }

    /// Critical watermark in bytes.
    #[must_use]
    pub fn critical_water_bytes(&self) -> u64 {
        self.storage.critical_water_mb * 1024 * 1024
    }

    /// Disk monitor tick interval.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.storage.check_interval_secs)
    }

    /// Grace timeout for stopping a recording.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.daemon.stop_grace_secs)
    }

    /// Grace timeout for stopping the preview.
    #[must_use]
    pub fn preview_grace(&self) -> Duration {
        Duration::from_secs(self.daemon.preview_grace_secs)
    }

    /// Upper bound for the shutdown sequence.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.camera.photo_tool, "raspistill");
        assert_eq!(config.camera.video_tool, "raspivid");
        assert!(config.upload.enabled);
        assert_eq!(config.daemon.shell, "/bin/bash");
    }

    #[test]
    fn test_default_storage_config() {
        let storage = StorageConfig::default();

        assert!(storage.output_dir.is_none());
        assert_eq!(storage.low_water_mb, 500);
        assert_eq!(storage.critical_water_mb, 100);
        assert_eq!(storage.check_interval_secs, 30);
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_inverted_watermarks() {
        let mut config = Config::default();
        config.storage.critical_water_mb = 600;
        config.storage.low_water_mb = 500;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("critical_water_mb"));
    }

    #[test]
    fn test_validate_zero_check_interval() {
        let mut config = Config::default();
        config.storage.check_interval_secs = 0;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("check_interval_secs"));
    }

    #[test]
    fn test_validate_zero_resolution() {
        let mut config = Config::default();
        config.camera.width = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_photo_quality_range() {
        let mut config = Config::default();
        config.camera.photo_quality = 0;
        assert!(config.validate().is_err());

        config.camera.photo_quality = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_max_attempts() {
        let mut config = Config::default();
        config.upload.max_attempts = 0;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("max_attempts"));
    }

    #[test]
    fn test_validate_zero_channel_capacity() {
        let mut config = Config::default();
        config.daemon.command_channel_capacity = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_output_dirs() {
        let mut config = Config::default();
        config.storage.output_dir = Some(PathBuf::from("/srv/camera"));

        assert_eq!(config.photos_dir(), PathBuf::from("/srv/camera/photos"));
        assert_eq!(config.videos_dir(), PathBuf::from("/srv/camera/videos"));
    }

    #[test]
    fn test_output_dir_default() {
        let config = Config::default();
        assert!(config.output_dir().to_string_lossy().contains("shutterd"));
    }

    #[test]
    fn test_token_path_default() {
        let config = Config::default();
        assert!(config
            .token_path()
            .to_string_lossy()
            .contains("upload-token.json"));
    }

    #[test]
    fn test_journal_path_custom() {
        let mut config = Config::default();
        config.upload.journal_path = Some(PathBuf::from("/tmp/queue.json"));
        assert_eq!(config.journal_path(), PathBuf::from("/tmp/queue.json"));
    }

    #[test]
    fn test_watermark_bytes() {
        let config = Config::default();
        assert_eq!(config.low_water_bytes(), 500 * 1024 * 1024);
        assert_eq!(config.critical_water_bytes(), 100 * 1024 * 1024);
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.check_interval(), Duration::from_secs(30));
        assert_eq!(config.stop_grace(), Duration::from_secs(5));
        assert_eq!(config.preview_grace(), Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_nonexistent_config() {
        // Loading from a nonexistent path should work (uses defaults)
        let result = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml")));
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), Config::default());
    }

    #[test]
    fn test_env_overrides_multi_word_keys() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SHUTTERD_STORAGE__LOW_WATER_MB", "750");
            jail.set_env("SHUTTERD_CAMERA__PHOTO_TOOL", "libcamera-still");

            let config = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml")))
                .expect("config loads from env");
            assert_eq!(config.storage.low_water_mb, 750);
            assert_eq!(config.camera.photo_tool, "libcamera-still");
            Ok(())
        });
    }

    #[test]
    fn test_env_override_section_nesting() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SHUTTERD_UPLOAD__MAX_ATTEMPTS", "9");

            let config = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml")))
                .expect("config loads from env");
            assert_eq!(config.upload.max_attempts, 9);
            Ok(())
        });
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("shutterd"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_config_serialize_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
