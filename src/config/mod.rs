//! TOML configuration with environment overrides.
//!
//! Resolution order, later wins:
//!
//! 1. built-in defaults
//! 2. `config.toml` (explicit `--config` path, or the platform config dir)
//! 3. `VOXBRIDGE_HOST`, `VOXBRIDGE_PORT`, and the upstream key variable
//!    named by `upstream.api_key_env` (default `OPENAI_API_KEY`)

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::voice::direction::{build_system_prompt, Direction, DirectionProfile, DirectionTable};
use crate::voice::engine::EngineConfig;
use crate::voice::protocol::SessionSettings;
use crate::voice::transport::TransportConfig;

pub const ENV_HOST: &str = "VOXBRIDGE_HOST";
pub const ENV_PORT: &str = "VOXBRIDGE_PORT";

/// Realtime API temperature bounds.
const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.6..=1.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionSettings,
    pub voices: VoicesConfig,
    pub prompts: PromptsConfig,
    pub client: ClientConfig,
}

/// `voxbridge serve` listener and admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Concurrent relay pairs; further `/ws` upgrades get 503.
    pub max_sessions: usize,
    /// Direction configured on each fresh upstream before any `set_direction`.
    pub initial_direction: Direction,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            max_sessions: 32,
            initial_direction: Direction::EnToTh,
        }
    }
}

/// Hosted realtime model endpoint. The key never leaves the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    pub model: String,
    /// Inline key. Prefer the environment variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the key.
    pub api_key_env: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".into(),
            model: "gpt-4o-realtime-preview".into(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".into(),
        }
    }
}

/// Default output voice per direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct VoicesConfig {
    pub en_th: String,
    pub th_en: String,
}

impl Default for VoicesConfig {
    fn default() -> Self {
        Self {
            en_th: "shimmer".into(),
            th_en: "alloy".into(),
        }
    }
}

/// Optional replacements for the built-in interpreter prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct PromptsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub en_th: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub th_en: Option<String>,
}

/// `voxbridge talk` client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ClientConfig {
    pub relay_url: String,
    /// Pause after cancel/clear before reconfiguring the session.
    pub settle_delay_ms: u64,
    /// Capture chunk length.
    pub chunk_ms: u64,
    /// Buffering before the first batch of a response plays.
    pub prebuffer_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8787/ws".into(),
            settle_delay_ms: 150,
            chunk_ms: 100,
            prebuffer_ms: 120,
        }
    }
}

impl Config {
    /// `<platform config dir>/voxbridge/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "voxbridge", "voxbridge")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load, apply process environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// [`Self::load`] with an injectable environment.
    pub fn load_with_env(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = env(ENV_HOST).filter(|v| !v.trim().is_empty()) {
            self.relay.host = host.trim().to_string();
        }
        if let Some(port) = env(ENV_PORT).filter(|v| !v.trim().is_empty()) {
            self.relay.port = port
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PORT} must be a port number, got {port:?}"))?;
        }
        if let Some(key) = env(&self.upstream.api_key_env).filter(|v| !v.trim().is_empty()) {
            self.upstream.api_key = Some(key.trim().to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay.port == 0 {
            anyhow::bail!("relay.port must be non-zero");
        }
        if self.relay.max_sessions == 0 {
            anyhow::bail!("relay.max_sessions must be at least 1");
        }
        if self.upstream.url.trim().is_empty() || self.upstream.model.trim().is_empty() {
            anyhow::bail!("upstream.url and upstream.model must be set");
        }
        let threshold = self.session.turn_detection.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("session.turn_detection.threshold must be within 0.0..=1.0, got {threshold}");
        }
        let temperature = self.session.temperature;
        if !TEMPERATURE_RANGE.contains(&temperature) {
            anyhow::bail!("session.temperature must be within 0.6..=1.2, got {temperature}");
        }
        if self.voices.en_th.trim().is_empty() || self.voices.th_en.trim().is_empty() {
            anyhow::bail!("voices.en_th and voices.th_en must be set");
        }
        Ok(())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.upstream.api_key.as_deref().filter(|k| !k.is_empty())
    }

    /// Handshake config for connecting to the model.
    pub fn upstream_transport(&self) -> Result<TransportConfig> {
        let key = self.api_key().with_context(|| {
            format!(
                "No upstream API key: set {} or upstream.api_key",
                self.upstream.api_key_env
            )
        })?;
        Ok(TransportConfig::direct(&self.upstream.url, &self.upstream.model, key))
    }

    /// Immutable prompt/voice table, built once and shared.
    pub fn direction_table(&self) -> DirectionTable {
        let profile = |direction: Direction, prompt: &Option<String>, voice: &str| DirectionProfile {
            instructions: prompt
                .clone()
                .unwrap_or_else(|| build_system_prompt(direction)),
            default_voice: voice.to_string(),
        };
        DirectionTable::new(
            profile(Direction::EnToTh, &self.prompts.en_th, &self.voices.en_th),
            profile(Direction::ThToEn, &self.prompts.th_en, &self.voices.th_en),
        )
    }

    pub fn engine_config(&self, initial_direction: Direction) -> EngineConfig {
        EngineConfig {
            initial_direction,
            settings: self.session.clone(),
            settle_delay: Duration::from_millis(self.client.settle_delay_ms),
            prebuffer: Duration::from_millis(self.client.prebuffer_ms),
        }
    }

    /// Copy safe to print: the inline key is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.upstream.api_key.is_some() {
            copy.upstream.api_key = Some("***".into());
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// JSON schema of the config file.
    pub fn schema_json() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.relay.port, 8787);
        assert_eq!(config.relay.initial_direction, Direction::EnToTh);
        assert_eq!(config.upstream.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.voices.en_th, "shimmer");
        assert_eq!(config.client.chunk_ms, 100);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [relay]
            port = 9000
            initial_direction = "B-A"

            [session.turn_detection]
            silence_duration_ms = 800

            [voices]
            th_en = "echo"
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.host, "127.0.0.1");
        assert_eq!(config.relay.initial_direction, Direction::ThToEn);
        assert_eq!(config.session.turn_detection.silence_duration_ms, 800);
        assert_eq!(config.session.turn_detection.prefix_padding_ms, 300);
        assert_eq!(config.voices.th_en, "echo");
        assert_eq!(config.voices.en_th, "shimmer");
    }

    #[test]
    fn load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay]\nmax_sessions = 4\n").unwrap();

        let config = Config::load_with_env(Some(path.as_path()), no_env).unwrap();
        assert_eq!(config.relay.max_sessions, 4);
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_with_env(Some(dir.path().join("missing.toml").as_path()), no_env).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay\nport = ").unwrap();
        let err = Config::load_with_env(Some(path.as_path()), no_env).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn env_overrides_host_port_and_key() {
        let mut config = Config::default();
        config
            .apply_env_overrides(env_of(&[
                (ENV_HOST, "0.0.0.0"),
                (ENV_PORT, " 9100 "),
                ("OPENAI_API_KEY", "sk-env"),
            ]))
            .unwrap();
        assert_eq!(config.relay.host, "0.0.0.0");
        assert_eq!(config.relay.port, 9100);
        assert_eq!(config.api_key(), Some("sk-env"));

        let mut config = Config::default();
        config.upstream.api_key_env = "MY_KEY".into();
        config
            .apply_env_overrides(env_of(&[("OPENAI_API_KEY", "ignored"), ("MY_KEY", "sk-mine")]))
            .unwrap();
        assert_eq!(config.api_key(), Some("sk-mine"));

        let mut config = Config::default();
        assert!(config
            .apply_env_overrides(env_of(&[(ENV_PORT, "http")]))
            .is_err());
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let cases: Vec<(fn(&mut Config), &str)> = vec![
            (|c| c.relay.port = 0, "relay.port"),
            (|c| c.relay.max_sessions = 0, "max_sessions"),
            (|c| c.session.turn_detection.threshold = 1.5, "threshold"),
            (|c| c.session.temperature = 0.2, "temperature"),
            (|c| c.session.temperature = 1.3, "temperature"),
            (|c| c.voices.en_th = " ".into(), "voices"),
        ];
        for (mutate, needle) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            let err = config.validate().unwrap_err().to_string();
            assert!(err.contains(needle), "{err} should mention {needle}");
        }
    }

    #[test]
    fn upstream_transport_requires_key() {
        let mut config = Config::default();
        let err = config.upstream_transport().unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));

        config.upstream.api_key = Some("sk-file".into());
        let transport = config.upstream_transport().unwrap();
        assert!(transport.url.ends_with("?model=gpt-4o-realtime-preview"));
    }

    #[test]
    fn direction_table_uses_prompt_overrides() {
        let mut config = Config::default();
        config.prompts.th_en = Some("Custom Thai to English prompt".into());
        config.voices.en_th = "coral".into();

        let table = config.direction_table();
        assert_eq!(table.instructions(Direction::ThToEn), "Custom Thai to English prompt");
        assert_eq!(
            table.instructions(Direction::EnToTh),
            build_system_prompt(Direction::EnToTh)
        );
        assert_eq!(table.default_voice(Direction::EnToTh), "coral");
    }

    #[test]
    fn redacted_masks_key_and_round_trips() {
        let mut config = Config::default();
        config.upstream.api_key = Some("sk-secret".into());
        let printed = config.redacted().to_toml().unwrap();
        assert!(!printed.contains("sk-secret"));

        let parsed = Config::from_toml_str(&Config::default().to_toml().unwrap()).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn schema_lists_sections() {
        let schema = Config::schema_json().unwrap();
        for section in ["relay", "upstream", "session", "voices", "prompts", "client"] {
            assert!(schema.contains(section), "schema missing {section}");
        }
    }

    #[test]
    fn engine_config_maps_client_section() {
        let config = Config::default();
        let engine = config.engine_config(Direction::ThToEn);
        assert_eq!(engine.initial_direction, Direction::ThToEn);
        assert_eq!(engine.settle_delay, Duration::from_millis(150));
        assert_eq!(engine.settings, config.session);
    }
}
