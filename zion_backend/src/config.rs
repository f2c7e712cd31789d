use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Which model backend the gateway talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    OpenAi,
    Cerebras,
}

impl Provider {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Provider::Ollama),
            "openai" | "open_ai" => Some(Provider::OpenAi),
            "cerebras" => Some(Provider::Cerebras),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ollama => "ollama",
            Provider::OpenAi => "openai",
            Provider::Cerebras => "cerebras",
        }
    }
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Ollama
    }
}

/// Thresholds used by the loop detector and the repetition guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetectionConfig {
    /// Identical consecutive calls before the "you have the data" nudge.
    #[serde(default = "default_identical_call_threshold")]
    pub identical_call_threshold: usize,
    /// How many recent calls are scanned for same-file churn.
    #[serde(default = "default_file_window")]
    pub file_window: usize,
    /// File operations on one path inside the window before the "stop touching" nudge.
    #[serde(default = "default_file_touch_threshold")]
    pub file_touch_threshold: usize,
    /// Responses with more non-blank lines than this are checked for repetition.
    #[serde(default = "default_repetition_min_lines")]
    pub repetition_min_lines: usize,
    /// Unique-line ratio below which a long response counts as a breakdown.
    #[serde(default = "default_repetition_min_unique_ratio")]
    pub repetition_min_unique_ratio: f64,
    /// Size of the call-record ring.
    #[serde(default = "default_call_history_len")]
    pub call_history_len: usize,
}

fn default_identical_call_threshold() -> usize {
    3
}

fn default_file_window() -> usize {
    6
}

fn default_file_touch_threshold() -> usize {
    4
}

fn default_repetition_min_lines() -> usize {
    30
}

fn default_repetition_min_unique_ratio() -> f64 {
    0.2
}

fn default_call_history_len() -> usize {
    10
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            identical_call_threshold: default_identical_call_threshold(),
            file_window: default_file_window(),
            file_touch_threshold: default_file_touch_threshold(),
            repetition_min_lines: default_repetition_min_lines(),
            repetition_min_unique_ratio: default_repetition_min_unique_ratio(),
            call_history_len: default_call_history_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Model gateway
    #[serde(default)]
    pub provider: Provider,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_ollama_url")]
    pub ollama_base_url: String,
    #[serde(default = "default_openai_url")]
    pub openai_base_url: String,
    #[serde(default = "default_cerebras_url")]
    pub cerebras_base_url: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub cerebras_api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_gateway_retries")]
    pub gateway_retries: usize,

    // Control loop
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_safe_tools")]
    pub safe_tools: Vec<String>,
    #[serde(default)]
    pub auto_approve: bool,

    // Actions
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_command_timeout_secs")]
    pub max_command_timeout_secs: u64,
    #[serde(default = "default_interactive_patterns")]
    pub interactive_patterns: Vec<String>,
    #[serde(default = "default_focus_line_limit")]
    pub focus_line_limit: usize,

    // Version store
    #[serde(default = "default_backup_dir_name")]
    pub backup_dir_name: String,
    #[serde(default = "default_retained_tasks")]
    pub retained_tasks: usize,

    // Analytics
    #[serde(default = "default_enable_analytics")]
    pub enable_analytics: bool,
    #[serde(default)]
    pub analytics_db_path: Option<String>,

    #[serde(default)]
    pub loop_detection: LoopDetectionConfig,
}

fn default_model() -> String {
    "qwen2.5-coder:7b".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_cerebras_url() -> String {
    "https://api.cerebras.ai/v1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_gateway_retries() -> usize {
    3
}

fn default_max_iterations() -> usize {
    30
}

fn default_safe_tools() -> Vec<String> {
    ["read_file", "list_dir", "search_files", "focus_file", "unfocus_file"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_max_command_timeout_secs() -> u64 {
    600
}

fn default_interactive_patterns() -> Vec<String> {
    [
        "create-next-app",
        "create-react-app",
        "create-vite",
        "npm init",
        "npx create",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_focus_line_limit() -> usize {
    200
}

fn default_backup_dir_name() -> String {
    ".zion_backups".to_string()
}

fn default_retained_tasks() -> usize {
    100
}

fn default_enable_analytics() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: default_model(),
            ollama_base_url: default_ollama_url(),
            openai_base_url: default_openai_url(),
            cerebras_base_url: default_cerebras_url(),
            openai_api_key: None,
            cerebras_api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            gateway_retries: default_gateway_retries(),
            max_iterations: default_max_iterations(),
            safe_tools: default_safe_tools(),
            auto_approve: false,
            command_timeout_secs: default_command_timeout_secs(),
            max_command_timeout_secs: default_max_command_timeout_secs(),
            interactive_patterns: default_interactive_patterns(),
            focus_line_limit: default_focus_line_limit(),
            backup_dir_name: default_backup_dir_name(),
            retained_tasks: default_retained_tasks(),
            enable_analytics: default_enable_analytics(),
            analytics_db_path: None,
            loop_detection: LoopDetectionConfig::default(),
        }
    }
}

impl AgentConfig {
    /// `<config_dir>/zion/config.toml`, falling back to the working directory.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("zion")
            .join("config.toml")
    }

    /// Load config from the config file, then apply environment overrides.
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        let mut config = match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AgentConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::debug!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        config.apply_env();
        config
    }

    /// Save config to the config file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir {:?}", parent))?;
        }

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Command-line flags win over both the file and the environment.
    pub fn apply_overrides(
        &mut self,
        provider: Option<&str>,
        model: Option<&str>,
        auto_approve: bool,
    ) -> Result<()> {
        if let Some(raw) = provider {
            self.provider = Provider::parse(raw).ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown provider '{}'. Expected 'ollama', 'openai' or 'cerebras'",
                    raw
                )
            })?;
        }
        if let Some(model) = model.map(str::trim).filter(|m| !m.is_empty()) {
            self.model = model.to_string();
        }
        if auto_approve {
            self.auto_approve = true;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(provider) = env::var("AI_PROVIDER") {
            match Provider::parse(&provider) {
                Some(provider) => self.provider = provider,
                None => tracing::warn!("Ignoring unknown AI_PROVIDER '{}'", provider),
            }
        }

        if let Ok(model) = env::var("AGENT_MODEL") {
            if !model.trim().is_empty() {
                self.model = model;
            }
        }

        if let Ok(url) = env::var("OLLAMA_BASE_URL") {
            self.ollama_base_url = url;
        }

        if let Ok(url) = env::var("OPENAI_BASE_URL") {
            self.openai_base_url = url;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                self.openai_api_key = Some(key);
            }
        }

        if let Ok(key) = env::var("CEREBRAS_API_KEY") {
            if !key.trim().is_empty() {
                self.cerebras_api_key = Some(key);
            }
        }

        if let Ok(secs) = env::var("ZION_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.request_timeout_secs = secs;
            }
        }

        if let Ok(max) = env::var("ZION_MAX_ITERATIONS") {
            if let Ok(max) = max.parse() {
                self.max_iterations = max;
            }
        }

        if let Ok(enabled) = env::var("ZION_AUTO_APPROVE") {
            self.auto_approve = parse_flag(&enabled);
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = AgentConfig::default();
        assert_eq!(config.max_iterations, 30);
        assert_eq!(config.gateway_retries, 3);
        assert_eq!(config.loop_detection.identical_call_threshold, 3);
        assert_eq!(config.loop_detection.file_window, 6);
        assert_eq!(config.loop_detection.file_touch_threshold, 4);
        assert_eq!(config.loop_detection.call_history_len, 10);
        assert_eq!(config.retained_tasks, 100);
        assert!(config.safe_tools.contains(&"read_file".to_string()));
        assert!(!config.safe_tools.contains(&"write_file".to_string()));
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            provider = "cerebras"
            model = "llama-3.3-70b"

            [loop_detection]
            identical_call_threshold = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.provider, Provider::Cerebras);
        assert_eq!(config.model, "llama-3.3-70b");
        assert_eq!(config.loop_detection.identical_call_threshold, 5);
        assert_eq!(config.loop_detection.file_window, 6);
        assert_eq!(config.command_timeout_secs, 120);
    }

    #[test]
    fn cli_overrides_win() {
        let mut config = AgentConfig::default();
        config
            .apply_overrides(Some("openai"), Some("gpt-4o-mini"), true)
            .unwrap();
        assert_eq!(config.provider, Provider::OpenAi);
        assert_eq!(config.model, "gpt-4o-mini");
        assert!(config.auto_approve);

        assert!(config.apply_overrides(Some("gemini"), None, false).is_err());
        config.apply_overrides(None, Some("  "), false).unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
    }

    #[test]
    fn provider_parse_is_case_insensitive() {
        assert_eq!(Provider::parse("OLLAMA"), Some(Provider::Ollama));
        assert_eq!(Provider::parse(" openai "), Some(Provider::OpenAi));
        assert_eq!(Provider::parse("gemini"), None);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zion").join("config.toml");
        let mut config = AgentConfig::default();
        config.focus_line_limit = 80;
        config.safe_tools = vec!["read_file".into()];
        config.save_to(&path).unwrap();

        let loaded = AgentConfig::load_from(&path);
        assert_eq!(loaded.focus_line_limit, 80);
        assert_eq!(loaded.safe_tools, vec!["read_file".to_string()]);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = AgentConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AgentConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.model, config.model);
        assert_eq!(parsed.interactive_patterns, config.interactive_patterns);
    }
}
