use std::path::Path;
use std::time::Duration;

use chatgpt_core::{TokenBudget, DEFAULT_MAX_MODEL_TOKENS, DEFAULT_MAX_RESPONSE_TOKENS};
use serde::{Deserialize, Serialize};

use crate::error::{ChatGptError, Result};

const CONFIG_FILE_PATH: &str = "config.toml";

pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_key: Option<String>,
    pub api_org: Option<String>,
    pub api_base_url: String,
    pub model: Option<String>,
    pub max_model_tokens: u32,
    pub max_response_tokens: u32,
    pub system_message: Option<String>,
    pub timeout_ms: Option<u64>,
    pub debug: bool,
    pub http_proxy: String,
    pub https_proxy: String,
    /// Browser-session token for the reverse-proxy client.
    pub access_token: Option<String>,
    pub api_reverse_proxy_url: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_org: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            model: None,
            max_model_tokens: DEFAULT_MAX_MODEL_TOKENS,
            max_response_tokens: DEFAULT_MAX_RESPONSE_TOKENS,
            system_message: None,
            timeout_ms: None,
            debug: false,
            http_proxy: String::new(),
            https_proxy: String::new(),
            access_token: None,
            api_reverse_proxy_url: None,
        }
    }
}

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl ClientConfig {
    /// Load `config.toml` from the working directory when present, then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config = if Path::new(CONFIG_FILE_PATH).exists() {
            Self::from_file(CONFIG_FILE_PATH)?
        } else {
            Self::default()
        };
        config.apply_env_with(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ChatGptError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| ChatGptError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Override fields from variables resolved through `lookup`.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(api_key) = lookup("OPENAI_API_KEY") {
            self.api_key = Some(api_key);
        }
        if let Some(api_org) = lookup("OPENAI_API_ORG") {
            self.api_org = Some(api_org);
        }
        if let Some(api_base_url) = lookup("OPENAI_API_BASE_URL") {
            self.api_base_url = api_base_url;
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            self.model = Some(model);
        }
        if let Some(access_token) = lookup("CHATGPT_ACCESS_TOKEN") {
            self.access_token = Some(access_token);
        }
        if let Some(url) = lookup("CHATGPT_REVERSE_PROXY_URL") {
            self.api_reverse_proxy_url = Some(url);
        }
        if let Some(timeout) = lookup("CHATGPT_TIMEOUT_MS") {
            let timeout_ms = timeout.trim().parse::<u64>().map_err(|e| {
                ChatGptError::Config(format!("CHATGPT_TIMEOUT_MS must be an integer: {e}"))
            })?;
            self.timeout_ms = Some(timeout_ms);
        }
        if let Some(debug) = lookup("CHATGPT_DEBUG") {
            self.debug = parse_bool_env(&debug);
        }
        if let Some(http_proxy) = lookup("HTTP_PROXY") {
            self.http_proxy = http_proxy;
        }
        if let Some(https_proxy) = lookup("HTTPS_PROXY") {
            self.https_proxy = https_proxy;
        }
        Ok(self)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn budget(&self) -> TokenBudget {
        TokenBudget::new(self.max_model_tokens, self.max_response_tokens)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn parse_bool_env_true_values() {
        for value in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert!(parse_bool_env(value), "value {value:?} should be true");
        }
    }

    #[test]
    fn parse_bool_env_false_values() {
        for value in ["0", "false", "no", "off", "", "  "] {
            assert!(!parse_bool_env(value), "value {value:?} should be false");
        }
    }

    #[test]
    fn defaults_match_model_limits() {
        let config = ClientConfig::default();

        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.budget(), TokenBudget::new(4000, 1000));
        assert!(config.timeout().is_none());
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_API_KEY", "sk-env"),
            ("CHATGPT_TIMEOUT_MS", "2500"),
            ("CHATGPT_DEBUG", "yes"),
        ]);
        let config = ClientConfig {
            api_key: Some("sk-file".to_string()),
            ..ClientConfig::default()
        };

        let config = config
            .apply_env_with(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.timeout(), Some(Duration::from_millis(2500)));
        assert!(config.debug);
    }

    #[test]
    fn invalid_timeout_is_rejected() {
        let result = ClientConfig::default().apply_env_with(|key| {
            (key == "CHATGPT_TIMEOUT_MS").then(|| "soon".to_string())
        });

        assert!(matches!(result, Err(ChatGptError::Config(_))));
    }

    #[test]
    fn reads_partial_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "api_key = \"sk-file\"\nmax_model_tokens = 8000\nsystem_message = \"be terse\""
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();

        assert_eq!(config.api_key.as_deref(), Some("sk-file"));
        assert_eq!(config.max_model_tokens, 8000);
        assert_eq!(config.max_response_tokens, 1000);
        assert_eq!(config.system_message.as_deref(), Some("be terse"));
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }
}
