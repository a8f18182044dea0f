use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result, anyhow};
use tracing::warn;

use crate::assembler::{AssemblerOptions, ReplyMode};
use crate::backend::BackendKind;
use crate::transcript::Transcript;

pub const DEFAULT_MODEL: &str = "llama3.2";
pub const DEFAULT_HISTORY_TURNS: usize = 10;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HOST: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_BIN: &str = "ollama";

pub const ENV_MODEL: &str = "OLLAMA_MODEL";
pub const ENV_SYSTEM_PROMPT: &str = "OLLAMA_SYSTEM_PROMPT";
pub const ENV_HISTORY_TURNS: &str = "OLLAMA_HISTORY_TURNS";
pub const ENV_TIMEOUT: &str = "OLLAMA_TIMEOUT";
pub const ENV_BACKEND: &str = "OLLAMA_CHAT_BACKEND";
pub const ENV_STREAM: &str = "OLLAMA_CHAT_STREAM";
pub const ENV_HOST: &str = "OLLAMA_HOST";
pub const ENV_OLLAMA_BIN: &str = "OLLAMA_BIN";

/// Optional settings file at `<config dir>/ollama-chat/config.json`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub default_model: Option<String>,
    pub system_prompt: Option<String>,
    pub history_turns: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub backend: Option<BackendKind>,
    pub stream: Option<bool>,
    pub host: Option<String>,
    pub ollama_bin: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let config_content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&config_content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(path, config_content)?;
        Ok(())
    }

    pub fn save_default_model(model: &str) -> Result<()> {
        Self::save_default_model_to(&Self::get_config_path()?, model)
    }

    /// Update only `default_model`; an unreadable file is left untouched.
    pub fn save_default_model_to(path: &Path, model: &str) -> Result<()> {
        let mut config = Self::load_from(path)
            .with_context(|| format!("not overwriting unreadable config {}", path.display()))?;
        config.default_model = Some(model.to_string());
        config.save_to(path)
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("ollama-chat").join("config.json"))
    }
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub history_turns: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub backend: Option<BackendKind>,
    pub atomic: bool,
    pub host: Option<String>,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub model: String,
    pub system_prompt: Option<String>,
    /// Retained user/assistant pairs; `None` keeps everything.
    pub history_turns: Option<usize>,
    pub timeout: Duration,
    pub backend: BackendKind,
    pub mode: ReplyMode,
    pub host: String,
    pub ollama_bin: String,
}

impl Settings {
    /// Defaults, then the config file, then the environment, then `overrides`.
    pub fn resolve<F>(file: &Config, env: F, overrides: &Overrides) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Blank variables count as unset.
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let model = overrides
            .model
            .clone()
            .or_else(|| env(ENV_MODEL))
            .or_else(|| file.default_model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let system_prompt = overrides
            .system_prompt
            .clone()
            .or_else(|| env(ENV_SYSTEM_PROMPT))
            .or_else(|| file.system_prompt.clone())
            .filter(|p| !p.trim().is_empty());

        let history_turns = overrides
            .history_turns
            .or_else(|| env(ENV_HISTORY_TURNS).and_then(|v| parse_or_warn(ENV_HISTORY_TURNS, &v)))
            .or(file.history_turns)
            .unwrap_or(DEFAULT_HISTORY_TURNS);

        let timeout_secs = overrides
            .timeout_secs
            .or_else(|| env(ENV_TIMEOUT).and_then(|v| parse_or_warn(ENV_TIMEOUT, &v)))
            .or(file.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let backend = overrides
            .backend
            .or_else(|| env(ENV_BACKEND).and_then(|v| backend_or_warn(&v)))
            .or(file.backend)
            .unwrap_or_default();

        let stream = if overrides.atomic {
            false
        } else {
            env(ENV_STREAM)
                .and_then(|v| bool_or_warn(ENV_STREAM, &v))
                .or(file.stream)
                .unwrap_or(true)
        };

        let host = overrides
            .host
            .clone()
            .or_else(|| env(ENV_HOST))
            .or_else(|| file.host.clone())
            .map(|h| normalize_host(&h))
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let ollama_bin = env(ENV_OLLAMA_BIN)
            .or_else(|| file.ollama_bin.clone())
            .unwrap_or_else(|| DEFAULT_OLLAMA_BIN.to_string());

        Self {
            model,
            system_prompt,
            history_turns: Some(history_turns).filter(|n| *n > 0),
            timeout: Duration::from_secs(timeout_secs),
            backend,
            mode: if stream { ReplyMode::Streaming } else { ReplyMode::Atomic },
            host,
            ollama_bin,
        }
    }

    pub fn from_environment(file: &Config, overrides: &Overrides) -> Self {
        Self::resolve(file, |key| std::env::var(key).ok(), overrides)
    }

    pub fn assembler_options(&self) -> AssemblerOptions {
        AssemblerOptions {
            system_prompt: self.system_prompt.clone(),
            mode: self.mode,
            timeout: self.timeout,
        }
    }

    pub fn transcript(&self) -> Transcript {
        Transcript::with_retention(self.history_turns)
    }
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "ignoring unparseable setting");
            None
        }
    }
}

fn bool_or_warn(key: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = raw, "ignoring unparseable setting");
            None
        }
    }
}

fn backend_or_warn(raw: &str) -> Option<BackendKind> {
    let backend = BackendKind::from_name(raw);
    if backend.is_none() {
        warn!(key = ENV_BACKEND, value = raw, "unknown backend, expected 'http' or 'cli'");
    }
    backend
}

/// `OLLAMA_HOST` is often given as `host:port` without a scheme.
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let settings = Settings::resolve(&Config::default(), env_of(&[]), &Overrides::default());

        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.system_prompt, None);
        assert_eq!(settings.history_turns, Some(DEFAULT_HISTORY_TURNS));
        assert_eq!(settings.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(settings.backend, BackendKind::Http);
        assert_eq!(settings.mode, ReplyMode::Streaming);
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.ollama_bin, DEFAULT_OLLAMA_BIN);
    }

    #[test]
    fn test_environment_values_applied() {
        let env = env_of(&[
            (ENV_MODEL, "mistral"),
            (ENV_SYSTEM_PROMPT, "Answer in Spanish."),
            (ENV_HISTORY_TURNS, "6"),
            (ENV_TIMEOUT, "15"),
            (ENV_BACKEND, "cli"),
            (ENV_STREAM, "false"),
            (ENV_HOST, "127.0.0.1:11435"),
        ]);
        let settings = Settings::resolve(&Config::default(), env, &Overrides::default());

        assert_eq!(settings.model, "mistral");
        assert_eq!(settings.system_prompt.as_deref(), Some("Answer in Spanish."));
        assert_eq!(settings.history_turns, Some(6));
        assert_eq!(settings.timeout, Duration::from_secs(15));
        assert_eq!(settings.backend, BackendKind::Cli);
        assert_eq!(settings.mode, ReplyMode::Atomic);
        assert_eq!(settings.host, "http://127.0.0.1:11435");
    }

    #[test]
    fn test_unparseable_values_fall_back_to_defaults() {
        let env = env_of(&[
            (ENV_HISTORY_TURNS, "lots"),
            (ENV_TIMEOUT, "-3"),
            (ENV_BACKEND, "carrier pigeon"),
            (ENV_STREAM, "maybe"),
            (ENV_MODEL, "   "),
        ]);
        let settings = Settings::resolve(&Config::default(), env, &Overrides::default());

        assert_eq!(settings.history_turns, Some(DEFAULT_HISTORY_TURNS));
        assert_eq!(settings.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(settings.backend, BackendKind::Http);
        assert_eq!(settings.mode, ReplyMode::Streaming);
        assert_eq!(settings.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_zero_history_means_unbounded() {
        let env = env_of(&[(ENV_HISTORY_TURNS, "0")]);
        let settings = Settings::resolve(&Config::default(), env, &Overrides::default());
        assert_eq!(settings.history_turns, None);
        assert_eq!(settings.transcript().max_turns(), None);
    }

    #[test]
    fn test_precedence_file_env_overrides() {
        let file = Config {
            default_model: Some("from-file".to_string()),
            timeout_secs: Some(30),
            history_turns: Some(4),
            ..Config::default()
        };
        let env = env_of(&[(ENV_MODEL, "from-env"), (ENV_TIMEOUT, "45")]);
        let overrides = Overrides {
            model: Some("from-flag".to_string()),
            atomic: true,
            ..Overrides::default()
        };

        let settings = Settings::resolve(&file, env, &overrides);
        assert_eq!(settings.model, "from-flag");
        assert_eq!(settings.timeout, Duration::from_secs(45));
        assert_eq!(settings.history_turns, Some(4));
        assert_eq!(settings.mode, ReplyMode::Atomic);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        assert_eq!(Config::load_from(&path).unwrap(), Config::default());

        let config = Config {
            default_model: Some("qwen2.5".to_string()),
            backend: Some(BackendKind::Cli),
            stream: Some(false),
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(fs::read_to_string(&path).unwrap().contains("\"backend\": \"cli\""));
    }

    #[test]
    fn test_malformed_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_save_default_model_keeps_other_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            system_prompt: Some("Be brief.".to_string()),
            host: Some("http://gpu-box:11434".to_string()),
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        Config::save_default_model_to(&path, "mistral").unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.default_model.as_deref(), Some("mistral"));
        assert_eq!(loaded.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(loaded.host.as_deref(), Some("http://gpu-box:11434"));
    }

    #[test]
    fn test_save_default_model_refuses_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(Config::save_default_model_to(&path, "mistral").is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }
}
