use std::path::PathBuf;

use crate::error::ChatError;

pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
const EXTRA_MODELS: [&str; 2] = ["llama3-8b-8192", "mixtral-8x7b-32768"];

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub api_key: Option<String>,
    pub base_url: String,
    /// First entry is the default model.
    pub models: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let data_dir = non_empty("DATA_DIR").unwrap_or_else(|| "./data".into());
        let default_model = non_empty("GROQ_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into());
        let mut models = vec![default_model];
        models.extend(EXTRA_MODELS.iter().map(|m| m.to_string()));
        Self {
            data_dir: PathBuf::from(data_dir),
            api_key: non_empty("GROQ_API_KEY"),
            base_url: non_empty("GROQ_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            models,
        }
    }

    pub fn default_model(&self) -> &str {
        self.models.first().map(String::as_str).unwrap_or(DEFAULT_MODEL)
    }

    /// `false` means replies come from the local echo streamer.
    pub fn has_provider(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn model_by_index(&self, index: usize) -> Result<&str, ChatError> {
        self.models
            .get(index)
            .map(String::as_str)
            .ok_or(ChatError::InvalidModelIndex(index))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestOverrides {
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveSettings {
    pub model: String,
    pub temperature: f32,
}

pub fn resolve_effective_settings(
    config: &AppConfig,
    request: &RequestOverrides,
) -> EffectiveSettings {
    let model = request
        .model
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| config.default_model().to_string());
    EffectiveSettings {
        model,
        temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> AppConfig {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config_with(&[]);
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert!(!cfg.has_provider());
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.models, vec![DEFAULT_MODEL, "llama3-8b-8192", "mixtral-8x7b-32768"]);
    }

    #[test]
    fn env_overrides_and_blank_key_means_fallback() {
        let cfg = config_with(&[
            ("DATA_DIR", "/srv/chats"),
            ("GROQ_MODEL", "m-custom"),
            ("GROQ_API_KEY", "  "),
        ]);
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/chats"));
        assert_eq!(cfg.default_model(), "m-custom");
        assert!(!cfg.has_provider());

        let cfg = config_with(&[("GROQ_API_KEY", "gsk_test")]);
        assert!(cfg.has_provider());
    }

    #[test]
    fn request_over_config_defaults() {
        let cfg = config_with(&[]);
        let eff = resolve_effective_settings(&cfg, &RequestOverrides::default());
        assert_eq!(eff.model, DEFAULT_MODEL);
        assert_eq!(eff.temperature, DEFAULT_TEMPERATURE);

        let eff = resolve_effective_settings(
            &cfg,
            &RequestOverrides { model: Some("mixtral-8x7b-32768".into()), temperature: Some(1.5) },
        );
        assert_eq!(eff.model, "mixtral-8x7b-32768");
        assert_eq!(eff.temperature, 1.5);
    }

    #[test]
    fn model_by_index_bounds() {
        let cfg = config_with(&[]);
        assert_eq!(cfg.model_by_index(1).unwrap(), "llama3-8b-8192");
        assert!(matches!(cfg.model_by_index(3), Err(ChatError::InvalidModelIndex(3))));
    }
}
