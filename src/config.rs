use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default)]
    pub upstreams: Upstreams,
    #[serde(default)]
    pub allow_target_override: bool,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub redact: RedactConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_host: default_bind_host(),
            upstreams: Upstreams::default(),
            allow_target_override: false,
            logging: Logging::default(),
            metrics: Metrics::default(),
            redact: RedactConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    4040
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

/// Base URLs for each upstream. Startup-immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstreams {
    #[serde(default = "default_openai_upstream")]
    pub openai: String,
    #[serde(default = "default_anthropic_upstream")]
    pub anthropic: String,
    #[serde(default = "default_chatgpt_upstream")]
    pub chatgpt: String,
    #[serde(default = "default_gemini_upstream")]
    pub gemini: String,
    #[serde(default = "default_gemini_code_assist_upstream")]
    pub gemini_code_assist: String,
}

fn default_openai_upstream() -> String {
    "https://api.openai.com".to_string()
}
fn default_anthropic_upstream() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_chatgpt_upstream() -> String {
    "https://chatgpt.com".to_string()
}
fn default_gemini_upstream() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_gemini_code_assist_upstream() -> String {
    "https://cloudcode-pa.googleapis.com".to_string()
}

impl Default for Upstreams {
    fn default() -> Self {
        Self {
            openai: default_openai_upstream(),
            anthropic: default_anthropic_upstream(),
            chatgpt: default_chatgpt_upstream(),
            gemini: default_gemini_upstream(),
            gemini_code_assist: default_gemini_code_assist_upstream(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> Option<String> {
    None
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
            path: default_metrics_path(),
        }
    }
}

/// Preset catalogue honored by the redaction engine. `Custom` defers entirely
/// to `policy_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Secrets,
    Pii,
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactConfig {
    #[serde(default = "default_preset")]
    pub preset: Preset,
    /// Path to a JSON-with-comments policy file extending `preset`.
    #[serde(default)]
    pub policy_file: Option<String>,
    #[serde(default)]
    pub reversible: bool,
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    #[serde(default)]
    pub verbose: bool,
}

fn default_preset() -> Preset {
    Preset::Secrets
}

fn default_session_ttl_ms() -> u64 {
    1_800_000
}

impl Default for RedactConfig {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            policy_file: None,
            reversible: false,
            session_ttl_ms: default_session_ttl_ms(),
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_capture_dir")]
    pub capture_dir: String,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_sessions: usize,
}

fn default_capture_dir() -> String {
    dirs::data_dir()
        .map(|d| d.join("apex-redact-proxy").join("captures"))
        .unwrap_or_else(|| Path::new("./captures").to_path_buf())
        .to_string_lossy()
        .to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            capture_dir: default_capture_dir(),
            max_sessions: 0,
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)?;
    let config = serde_json::from_str::<Config>(&content)?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &Config) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}
