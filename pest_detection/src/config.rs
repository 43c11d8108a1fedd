use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub custom_vision: CustomVisionConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Credentials and location of the Custom Vision prediction resource.
#[derive(Clone, Deserialize)]
pub struct CustomVisionConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub prediction_key: String,
    #[serde(default)]
    pub project_id: String,
    /// Published iteration name.
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

impl Default for CustomVisionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            prediction_key: String::new(),
            project_id: String::new(),
            model_name: String::new(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

// Keeps the prediction key out of logs.
impl std::fmt::Debug for CustomVisionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomVisionConfig")
            .field("endpoint", &self.endpoint)
            .field("prediction_key", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("model_name", &self.model_name)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl Validatable for CustomVisionConfig {
    fn validate(&self) -> Result<(), String> {
        let missing: Vec<&str> = [
            ("endpoint", &self.endpoint),
            ("prediction_key", &self.prediction_key),
            ("project_id", &self.project_id),
            ("model_name", &self.model_name),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(format!(
                "Missing custom_vision settings: {}",
                missing.join(", ")
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub static_dir: PathBuf,
    /// Uploads and annotated images older than this are deleted. Kept
    /// forever when unset.
    #[serde(default)]
    pub retention_secs: Option<u64>,
}

impl Validatable for StorageConfig {
    fn validate(&self) -> Result<(), String> {
        if self.retention_secs == Some(0) {
            return Err("storage.retention_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OverlayConfig {
    /// Font used for labels; the bundled DejaVu Sans when unset.
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default = "default_label_scale")]
    pub label_scale: f32,
}

fn default_label_scale() -> f32 {
    16.0
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            label_scale: default_label_scale(),
        }
    }
}

impl Validatable for OverlayConfig {
    fn validate(&self) -> Result<(), String> {
        if self.label_scale.is_nan() || self.label_scale <= 0.0 {
            return Err(format!(
                "overlay.label_scale must be positive, got {}",
                self.label_scale
            ));
        }
        if let Some(path) = &self.font_path {
            if !path.exists() {
                return Err(format!("Font file not found: {:?}", path));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("No current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let builder = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("PD")
                .prefix_separator("_")
                .separator("__"),
        );

    load_configuration(builder)
}

fn load_configuration(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<Config, config::ConfigError> {
    let settings: Config = builder.build()?.try_deserialize::<Config>()?;

    let checks = [
        settings.custom_vision.validate(),
        settings.storage.validate(),
        settings.overlay.validate(),
    ];
    for check in checks {
        if let Err(e) = check {
            tracing::error!("Configuration validation failed: {}", e);
            return Err(config::ConfigError::Message(e));
        }
    }

    Ok(settings)
}
