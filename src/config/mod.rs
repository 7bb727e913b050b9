//! Application and agent configuration.
//!
//! A single `config.json` in the data directory holds the remote API
//! settings, global timeouts, and the per-agent wake-word definitions.
//! The file is reloaded when a `ConfigChanged` event is published.

pub mod paths;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use paths::get_data_dir;

/// Per-plugin enable flags carried by each agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolFlags {
    pub calculator: bool,
    pub date_time: bool,
    pub geo_ip: bool,
    pub weather: bool,
    pub memory: bool,
    pub system: bool,
    pub eyes: bool,
}

impl Default for ToolFlags {
    fn default() -> Self {
        Self {
            calculator: true,
            date_time: true,
            geo_ip: true,
            weather: true,
            memory: true,
            system: true,
            eyes: true,
        }
    }
}

/// One conversational agent, keyed by its wake-word model.
/// Immutable during a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
    /// Wake-word model identifier (classifier file stem in the model dir).
    pub wake_word_model: String,
    /// Activation threshold, clamped to [0.1, 0.9] on load.
    pub wake_word_threshold: f32,
    /// Successive above-threshold frames required to fire, clamped to [1, 10].
    pub wake_word_trigger_level: u32,
    pub voice: String,
    pub disabled: bool,
    pub tools: ToolFlags,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "assistant".to_string(),
            instructions: None,
            temperature: None,
            wake_word_model: "alexa_v0.1".to_string(),
            wake_word_threshold: 0.5,
            wake_word_trigger_level: 4,
            voice: "alloy".to_string(),
            disabled: false,
            tools: ToolFlags::default(),
        }
    }
}

impl AgentConfig {
    /// Clamp out-of-range wake parameters instead of rejecting the file.
    fn sanitize(&mut self) {
        let t = self.wake_word_threshold;
        self.wake_word_threshold = t.clamp(0.1, 0.9);
        if (t - self.wake_word_threshold).abs() > f32::EPSILON {
            warn!(agent = %self.name, threshold = t, "wake word threshold clamped");
        }
        let l = self.wake_word_trigger_level;
        self.wake_word_trigger_level = l.clamp(1, 10);
        if l != self.wake_word_trigger_level {
            warn!(agent = %self.name, level = l, "wake word trigger level clamped");
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Remote realtime service API key. Required before the first session.
    pub api_key: String,
    /// Optional service endpoint; when set, the Azure-style connection
    /// path is used instead of the direct one.
    pub endpoint: Option<String>,
    /// Remote realtime model identifier.
    pub model: String,
    /// Instructions prepended to every agent's own instructions.
    pub instructions: String,
    /// Remote session lifetime; expired sessions are recreated on wake.
    pub session_timeout_minutes: u64,
    /// Conversation ends after this much inactivity.
    pub conversation_inactivity_timeout_seconds: u64,
    /// Maximum number of persisted memory items.
    pub memory_cap: usize,
    /// Startup playback volume, logical 0-10.
    pub startup_volume: u8,
    /// Frame amplitude below which the wake stage treats audio as silent.
    /// Zero or negative disables the noise gate.
    pub wake_word_silence_threshold: i32,
    /// Optional embedding service model; semantic memory search is
    /// disabled when empty.
    pub embedding_model: Option<String>,
    pub agents: Vec<AgentConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: None,
            model: "gpt-4o-realtime-preview".to_string(),
            instructions: "You are a helpful voice assistant. Keep replies short and conversational."
                .to_string(),
            session_timeout_minutes: 30,
            conversation_inactivity_timeout_seconds: 20,
            memory_cap: 200,
            startup_volume: 6,
            wake_word_silence_threshold: 300,
            embedding_model: Some("text-embedding-3-small".to_string()),
            agents: vec![AgentConfig::default()],
        }
    }
}

impl AppConfig {
    /// Find the agent whose wake-word model matches a detection.
    pub fn agent_for_wake_word(&self, model: &str) -> Option<&AgentConfig> {
        self.agents
            .iter()
            .find(|a| !a.disabled && a.wake_word_model == model)
    }

    /// First enabled agent, used for manual (hangup-button) wake.
    pub fn first_enabled_agent(&self) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| !a.disabled)
    }
}

/// Path to config.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.json")
}

/// Read config.json, falling back to defaults when absent or malformed.
/// Out-of-range wake parameters are clamped.
pub fn load() -> AppConfig {
    let path = get_config_path();
    let mut config: AppConfig = match std::fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => val,
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                AppConfig::default()
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            AppConfig::default()
        }
    };
    for agent in &mut config.agents {
        agent.sanitize();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_parameters_are_clamped() {
        let mut agent = AgentConfig {
            wake_word_threshold: 0.95,
            wake_word_trigger_level: 0,
            ..AgentConfig::default()
        };
        agent.sanitize();
        assert_eq!(agent.wake_word_threshold, 0.9);
        assert_eq!(agent.wake_word_trigger_level, 1);
    }

    #[test]
    fn agent_lookup_skips_disabled() {
        let config = AppConfig {
            agents: vec![
                AgentConfig {
                    name: "off".into(),
                    wake_word_model: "hey_jarvis".into(),
                    disabled: true,
                    ..AgentConfig::default()
                },
                AgentConfig {
                    name: "on".into(),
                    wake_word_model: "hey_jarvis".into(),
                    ..AgentConfig::default()
                },
            ],
            ..AppConfig::default()
        };

        assert_eq!(config.agent_for_wake_word("hey_jarvis").unwrap().name, "on");
        assert_eq!(config.first_enabled_agent().unwrap().name, "on");
        assert!(config.agent_for_wake_word("missing").is_none());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{"api_key":"sk-test"}"#).unwrap();
        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.memory_cap, 200);
        assert_eq!(config.agents.len(), 1);
    }
}
