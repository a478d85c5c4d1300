//! TOML configuration for the voxwire runner.
//!
//! The config file lives at `$VOXWIRE_CONFIG` (tilde-expanded) or the
//! platform config directory (`…/voxwire/voxwire.toml`). A missing default
//! file yields built-in defaults; a missing explicit path is an error.
//! Unknown keys are rejected so typos fail loudly instead of silently
//! running with defaults.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::transport::TransportConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub agent: AgentConfig,
    pub audio: AudioConfig,
    pub transport: TransportSection,
}

/// The `[agent]` section: which agent to talk to and how.
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Identifier of the remote conversational agent.
    pub agent_id: String,
    /// API credential. Sensitive: redacted from Debug output, never logged.
    pub api_key: Option<String>,
    /// Message the agent speaks at session start.
    pub initial_message: Option<String>,
    /// Activity timeout in whole seconds; 0 or absent disables it.
    pub timeout_secs: Option<u64>,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("agent_id", &self.agent_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("initial_message", &self.initial_message)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// The `[audio]` section: device names understood by the audio backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioConfig {
    pub input: String,
    pub agent_output: String,
    /// Optional cue output; omit to disable start/end cues.
    pub activation_output: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input: "default-mic".into(),
            agent_output: "default-speaker".into(),
            activation_output: None,
        }
    }
}

/// The `[transport]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSection {
    pub api_base: String,
    pub connect_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub signed_url_ttl_secs: u64,
    pub outbound_capacity: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            api_base: defaults.api_base,
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
            keepalive_secs: defaults.keepalive_interval.as_secs(),
            signed_url_ttl_secs: defaults.signed_url_ttl.as_secs(),
            outbound_capacity: defaults.outbound_capacity,
        }
    }
}

impl TransportSection {
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            api_base: self.api_base.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_secs),
            signed_url_ttl: Duration::from_secs(self.signed_url_ttl_secs),
            outbound_capacity: self.outbound_capacity,
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    tracing::debug!(path = %path.display(), "No config file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// `$VOXWIRE_CONFIG` (tilde-expanded) or the platform config dir.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        if let Ok(path) = std::env::var("VOXWIRE_CONFIG") {
            return Ok(PathBuf::from(shellexpand::tilde(&path).into_owned()));
        }
        let dirs = directories::ProjectDirs::from("dev", "voxwire", "voxwire")
            .context("cannot determine a config directory for this platform")?;
        Ok(dirs.config_dir().join("voxwire.toml"))
    }

    /// The configured activity timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.agent
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_full_config() {
        let file = write_config(
            r#"
            [agent]
            agent_id = "agent-42"
            api_key = "k-secret"
            initial_message = "battery is low"
            timeout_secs = 30

            [audio]
            input = "mic-array"
            agent_output = "main-speaker"
            activation_output = "chime"

            [transport]
            api_base = "https://agents.example.com"
            connect_timeout_secs = 5
            "#,
        );

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.agent.agent_id, "agent-42");
        assert_eq!(config.agent.api_key.as_deref(), Some("k-secret"));
        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.audio.activation_output.as_deref(), Some("chime"));

        let transport = config.transport.to_transport_config();
        assert_eq!(transport.api_base, "https://agents.example.com");
        assert_eq!(transport.connect_timeout, Duration::from_secs(5));
        // Unspecified transport keys keep their defaults.
        assert_eq!(transport.outbound_capacity, 256);
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let file = write_config("[agent]\nagent_id = \"a\"\n");
        let config = Config::load(Some(file.path())).unwrap();

        assert_eq!(config.agent.agent_id, "a");
        assert_eq!(config.audio.input, "default-mic");
        assert_eq!(config.timeout(), None);
        assert_eq!(
            config.transport.to_transport_config().keepalive_interval,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn zero_timeout_means_disabled() {
        let file = write_config("[agent]\nagent_id = \"a\"\ntimeout_secs = 0\n");
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config("[agent]\nagent_id = \"a\"\nagnt_key = \"typo\"\n");
        assert!(Config::load(Some(file.path())).is_err());
    }

    #[test]
    fn missing_explicit_path_errors() {
        assert!(Config::load(Some(Path::new("/nonexistent/voxwire.toml"))).is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = AgentConfig {
            agent_id: "a".into(),
            api_key: Some("super-secret".into()),
            initial_message: None,
            timeout_secs: None,
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
