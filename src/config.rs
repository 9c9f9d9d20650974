// Configuration management module
// Handles loading, saving, and validating configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_LISTENBRAINZ_URL: &str = "https://api.listenbrainz.org";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Scrobble after playing this percentage of the track (50% default, capped at 4 minutes)
    pub scrobble_threshold: u8,

    /// Text cleanup configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Last.fm configuration
    pub lastfm: Option<LastFmConfig>,

    /// ListenBrainz configurations (can have multiple instances)
    #[serde(default)]
    pub listenbrainz: Vec<ListenBrainzConfig>,

    /// Rich presence configuration
    #[serde(default)]
    pub presence: PresenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanupConfig {
    /// Enable text cleanup
    pub enabled: bool,

    /// Regex patterns to remove from track/album/artist names
    /// Applied in order, each pattern is removed from the text
    pub patterns: Vec<String>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: vec![
                r"\s*\[Explicit\]".to_string(),
                r"\s*\[Clean\]".to_string(),
                r"\s*\(Explicit\)".to_string(),
                r"\s*\(Clean\)".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LastFmConfig {
    pub enabled: bool,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub session_key: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenBrainzConfig {
    pub enabled: bool,
    pub name: String,
    pub token: String,
    pub api_url: String,
}

impl Default for ListenBrainzConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: "Primary".to_string(),
            token: String::new(),
            api_url: DEFAULT_LISTENBRAINZ_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceConfig {
    pub enabled: bool,

    /// Application id registered with the presence service
    pub client_id: String,

    /// Shown when the sample does not name a known service
    pub app_name: String,

    /// Asset key used when a track has no artwork, and as the small icon
    pub fallback_icon: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            client_id: String::new(),
            app_name: "Playback Relay".to_string(),
            fallback_icon: "app_icon".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scrobble_threshold: 50,
            cleanup: CleanupConfig::default(),
            lastfm: Some(LastFmConfig::default()),
            listenbrainz: vec![ListenBrainzConfig::default()],
            presence: PresenceConfig::default(),
        }
    }
}

impl Config {
    /// Get the default path to the configuration file
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to get config directory")?;

        Ok(config_dir.join("playback_relay.conf"))
    }

    /// Load configuration from file, or create default if it doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("Config file not found, creating default at {:?}", path);
            let default_config = Self::default();
            default_config.save(path)?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content).context("Failed to write config file")?;

        log::info!("Config saved to {:?}", path);

        Ok(())
    }

    /// Copy with every credential masked, for display
    pub fn redacted(&self) -> Self {
        fn mask(secret: &mut String) {
            if !secret.is_empty() {
                *secret = "********".to_string();
            }
        }

        let mut copy = self.clone();
        if let Some(lastfm) = copy.lastfm.as_mut() {
            mask(&mut lastfm.api_secret);
            mask(&mut lastfm.session_key);
        }
        for lb in &mut copy.listenbrainz {
            mask(&mut lb.token);
        }
        copy
    }

    pub fn lastfm_enabled(&self) -> bool {
        self.lastfm.as_ref().map(|l| l.enabled).unwrap_or(false)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.scrobble_threshold == 0 || self.scrobble_threshold > 100 {
            anyhow::bail!("scrobble_threshold must be between 1 and 100");
        }

        let listenbrainz_enabled = self.listenbrainz.iter().any(|l| l.enabled);
        if !self.lastfm_enabled() && !listenbrainz_enabled {
            log::warn!("No scrobbling services are enabled");
        }

        if let Some(lastfm) = &self.lastfm {
            if lastfm.enabled {
                if lastfm.api_key.is_empty() {
                    anyhow::bail!("Last.fm api_key is required when Last.fm is enabled");
                }
                if lastfm.api_secret.is_empty() {
                    anyhow::bail!("Last.fm api_secret is required when Last.fm is enabled");
                }
                if lastfm.session_key.is_empty() {
                    anyhow::bail!("Last.fm is enabled but not authorized; run `auth lastfm`");
                }
            }
        }

        for lb in &self.listenbrainz {
            if lb.enabled {
                if lb.token.is_empty() {
                    anyhow::bail!(
                        "ListenBrainz token is required when enabled (instance: {})",
                        lb.name
                    );
                }
                if lb.api_url.is_empty() {
                    anyhow::bail!("ListenBrainz api_url is required (instance: {})", lb.name);
                }
            }
        }

        if self.presence.enabled && self.presence.client_id.is_empty() {
            anyhow::bail!("presence client_id is required when presence is enabled");
        }

        Ok(())
    }
}
