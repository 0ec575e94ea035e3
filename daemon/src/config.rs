use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::validate_enum;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub source: SourceSettings,

    #[serde(default)]
    pub gpu: GpuSettings,
}

/// General daemon settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Map a layer shell background surface on the compositor. When off,
    /// surfaces only arrive over IPC and frames are rendered offscreen.
    #[serde(default = "default_true")]
    pub layer_shell: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            layer_shell: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Playback and draw loop settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackConfig {
    /// Leave the audio track unlinked
    #[serde(default = "default_true")]
    pub muted: bool,

    /// Only used when not muted
    #[serde(default)]
    pub volume: f64,

    #[serde(default = "default_max_fps")]
    pub max_fps: u32,

    /// Follow home screen paging with a parallax offset
    #[serde(default)]
    pub allow_parallax: bool,

    /// Preview contexts never apply parallax
    #[serde(default)]
    pub preview: bool,

    #[serde(default = "default_prepare_timeout")]
    pub prepare_timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            muted: true,
            volume: 0.0,
            max_fps: default_max_fps(),
            allow_parallax: false,
            preview: false,
            prepare_timeout_ms: default_prepare_timeout(),
        }
    }
}

impl PlaybackConfig {
    /// Parallax applies only when allowed and not in a preview.
    pub fn parallax_enabled(&self) -> bool {
        self.allow_parallax && !self.preview
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.max_fps.max(1) as f64)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}
fn default_max_fps() -> u32 {
    60
}
fn default_prepare_timeout() -> u64 {
    5000
}

/// Where videos come from
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceSettings {
    /// Bundled video used when nothing else is playable
    #[serde(default = "default_wallpaper")]
    pub default_wallpaper: PathBuf,

    /// Persisted selection, defaults to the XDG state directory
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            default_wallpaper: default_wallpaper(),
            state_file: None,
        }
    }
}

fn default_wallpaper() -> PathBuf {
    PathBuf::from("/usr/share/vidwall/default.mp4")
}

impl SourceSettings {
    pub fn state_file_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.state_file {
            return Ok(path.clone());
        }

        let state_dir = dirs::state_dir()
            .or_else(dirs::data_dir)
            .context("Failed to get state directory")?
            .join("vidwall");

        Ok(state_dir.join("selection.json"))
    }
}

/// GPU capability floor
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GpuSettings {
    #[serde(default = "default_min_texture_size")]
    pub min_texture_size: u32,

    #[serde(default = "default_power_preference")]
    pub power_preference: String,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            min_texture_size: default_min_texture_size(),
            power_preference: default_power_preference(),
        }
    }
}

fn default_min_texture_size() -> u32 {
    2048
}
fn default_power_preference() -> String {
    "low-power".to_string()
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "Config file not found at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded configuration from {}", path.display());
        config.validate()?;

        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("vidwall");

        Ok(config_dir.join("config.toml"))
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        self.validate_log_level(&self.general.log_level)?;
        self.validate_power_preference(&self.gpu.power_preference)?;

        let playback = &self.playback;
        if !(1..=240).contains(&playback.max_fps) {
            anyhow::bail!("Invalid max_fps (must be 1-240): {}", playback.max_fps);
        }
        if !(0.0..=1.0).contains(&playback.volume) {
            anyhow::bail!("Invalid volume (must be 0.0-1.0): {}", playback.volume);
        }
        if playback.prepare_timeout_ms == 0 {
            anyhow::bail!("prepare_timeout_ms must be positive");
        }
        if self.gpu.min_texture_size == 0 {
            anyhow::bail!("min_texture_size must be positive");
        }

        Ok(())
    }

    fn validate_log_level(&self, level: &str) -> Result<()> {
        validate_enum!(level, "trace", "debug", "info", "warn", "error")
    }

    fn validate_power_preference(&self, preference: &str) -> Result<()> {
        validate_enum!(preference, "high-performance", "low-power")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert!(config.general.layer_shell);
        assert!(config.playback.muted);
        assert_eq!(config.playback.volume, 0.0);
        assert_eq!(config.playback.max_fps, 60);
        assert!(!config.playback.parallax_enabled());
        assert_eq!(config.gpu.min_texture_size, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parallax_disabled_in_preview() {
        let mut playback = PlaybackConfig {
            allow_parallax: true,
            ..Default::default()
        };
        assert!(playback.parallax_enabled());
        playback.preview = true;
        assert!(!playback.parallax_enabled());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml = r#"
[playback]
allow_parallax = true
max_fps = 30

[source]
default_wallpaper = "/opt/vidwall/loop.mp4"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.playback.allow_parallax);
        assert_eq!(config.playback.max_fps, 30);
        assert!(config.playback.muted);
        assert_eq!(
            config.source.default_wallpaper,
            PathBuf::from("/opt/vidwall/loop.mp4")
        );
        assert_eq!(config.general.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_layer_shell_can_be_disabled() {
        let toml = r#"
[general]
layer_shell = false
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(!config.general.layer_shell);
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.general.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.playback.max_fps = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.playback.volume = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gpu.power_preference = "turbo".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.playback.max_fps, 60);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gpu]\nmin_texture_size = 4096\npower_preference = \"high-performance\"").unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.gpu.min_texture_size, 4096);
        assert_eq!(config.gpu.power_preference, "high-performance");
    }

    #[test]
    fn test_explicit_state_file_wins() {
        let settings = SourceSettings {
            state_file: Some(PathBuf::from("/tmp/selection.json")),
            ..Default::default()
        };
        assert_eq!(
            settings.state_file_path().unwrap(),
            PathBuf::from("/tmp/selection.json")
        );
    }
}
