use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod tracing_init;

pub use tracing_init::init_tracing;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    #[serde(default)]
    pub sandbox: Sandbox,
    pub store: Store,
    #[serde(default)]
    pub tables: Tables,
    pub queue: Queue,
    pub auth: Auth,
    pub completion: Completion,
    pub crm: Crm,
    #[serde(default)]
    pub watermark: Watermark,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

/// Local emulation switch. When enabled, tables are provisioned on first
/// access, the service credential check is relaxed (unless `auth.strict_auth`
/// says otherwise) and outbound HTTP goes to `endpoint` when one is given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sandbox {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default = "default_customers_table")]
    pub customers: String,
    #[serde(default = "default_queries_table")]
    pub queries: String,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            customers: default_customers_table(),
            queries: default_queries_table(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a received, undeleted message stays hidden before it is
    /// handed out again.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default)]
    pub api_key: String,
    /// Overrides the sandbox-derived default when set.
    #[serde(default)]
    pub strict_auth: Option<bool>,
    pub jwt: Jwt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwt {
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_jwt_exp_seconds")]
    pub exp_seconds: u64,
    #[serde(default = "default_groups_claim")]
    pub groups_claim: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crm {
    pub auth_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_crm_api_version")]
    pub api_version: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watermark {
    #[serde(default = "default_watermark_parameter")]
    pub parameter_name: String,
    #[serde(default = "default_lookback_hours")]
    pub default_lookback_hours: u32,
}

impl Default for Watermark {
    fn default() -> Self {
        Self {
            parameter_name: default_watermark_parameter(),
            default_lookback_hours: default_lookback_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Whether the service credential check is enforced.
    pub fn strict_auth(&self) -> bool {
        self.auth.strict_auth.unwrap_or(!self.sandbox.enabled)
    }

    pub fn completion_endpoint(&self) -> String {
        match self.sandbox_endpoint() {
            Some(base) => format!("{base}/v1/chat/completions"),
            None => self.completion.endpoint.clone(),
        }
    }

    pub fn crm_auth_url(&self) -> String {
        match self.sandbox_endpoint() {
            Some(base) => format!("{base}/services/oauth2/token"),
            None => self.crm.auth_url.clone(),
        }
    }

    fn sandbox_endpoint(&self) -> Option<&str> {
        if !self.sandbox.enabled {
            return None;
        }
        self.sandbox
            .endpoint
            .as_deref()
            .map(|v| v.trim_end_matches('/'))
            .filter(|v| !v.is_empty())
    }
}

fn default_customers_table() -> String {
    "Customers".to_string()
}

fn default_queries_table() -> String {
    "AIQueries".to_string()
}

fn default_batch_size() -> usize {
    10
}

/// Upper bound for `queue.visibility_timeout_secs` (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

fn default_jwt_exp_seconds() -> u64 {
    3600
}

fn default_groups_claim() -> String {
    "cognito:groups".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant for our SaaS platform. Analyze user queries and the provided data to give customer insight.".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_crm_api_version() -> String {
    "v58.0".to_string()
}

fn default_watermark_parameter() -> String {
    "/AISAAS/LastSalesforcePollTime".to_string()
}

fn default_lookback_hours() -> u32 {
    24
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Loads the file, applies environment overrides (after a best-effort `.env`
/// load) and checks the result.
pub fn load(path: &str) -> Result<Config, ConfigError> {
    let _ = dotenvy::dotenv();
    let mut cfg = read_config(path)?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

/// Loads the file only; the process environment is not consulted.
pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let cfg = read_config(path)?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

/// Overlays secrets and the sandbox flag from `lookup`. Empty values are
/// ignored.
pub fn apply_env_overrides<F>(cfg: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("INSIGHT_API_KEY") {
        cfg.auth.api_key = v;
    }
    if let Some(v) = get("JWT_SECRET") {
        cfg.auth.jwt.secret = v;
    }
    if let Some(v) = get("OPENAI_API_KEY") {
        cfg.completion.api_key = v;
    }
    if let Some(v) = get("SF_AUTH_URL") {
        cfg.crm.auth_url = v;
    }
    if let Some(v) = get("SF_CLIENT_ID") {
        cfg.crm.client_id = v;
    }
    if let Some(v) = get("SF_CLIENT_SECRET") {
        cfg.crm.client_secret = v;
    }
    if let Some(v) = get("SF_USERNAME") {
        cfg.crm.username = v;
    }
    if let Some(v) = get("SF_PASSWORD") {
        cfg.crm.password = v;
    }
    if let Some(v) = get("MOCK_AWS") {
        cfg.sandbox.enabled = v.eq_ignore_ascii_case("true");
    }
}

fn read_config(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.queue.kind != "memory" && cfg.queue.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "queue.type={} is not implemented; supported: memory, sqlite",
            cfg.queue.kind
        )));
    }
    if !cfg.sandbox.enabled && (cfg.store.kind == "memory" || cfg.queue.kind == "memory") {
        return Err(ConfigError::UnsupportedConfig(
            "store.type=memory and queue.type=memory require sandbox.enabled=true".to_string(),
        ));
    }
    if cfg.queue.kind == "sqlite" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(
            "queue.type=sqlite requires store.type=sqlite".to_string(),
        ));
    }
    if cfg.queue.name.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "queue.name must not be empty".to_string(),
        ));
    }
    if cfg.queue.batch_size == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "queue.batch_size must be >= 1".to_string(),
        ));
    }
    if cfg.queue.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS {
        return Err(ConfigError::UnsupportedConfig(format!(
            "queue.visibility_timeout_secs must be <= {MAX_VISIBILITY_TIMEOUT_SECS}"
        )));
    }
    if cfg.tables.customers.trim().is_empty() || cfg.tables.queries.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "tables.customers and tables.queries must not be empty".to_string(),
        ));
    }
    if cfg.tables.customers == cfg.tables.queries {
        return Err(ConfigError::UnsupportedConfig(
            "tables.customers and tables.queries must differ".to_string(),
        ));
    }
    if !matches!(cfg.auth.jwt.algorithm.as_str(), "HS256" | "HS384" | "HS512") {
        return Err(ConfigError::UnsupportedConfig(format!(
            "auth.jwt.algorithm={} is not implemented; supported: HS256, HS384, HS512",
            cfg.auth.jwt.algorithm
        )));
    }
    if cfg.auth.jwt.secret.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "auth.jwt.secret is required (or set JWT_SECRET)".to_string(),
        ));
    }
    if cfg.auth.jwt.exp_seconds == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "auth.jwt.exp_seconds must be >= 1".to_string(),
        ));
    }
    if cfg.strict_auth() && cfg.auth.api_key.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "auth.api_key is required when strict auth is on (or set INSIGHT_API_KEY)"
                .to_string(),
        ));
    }
    if cfg.completion.timeout_ms == 0 || cfg.crm.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "completion.timeout_ms and crm.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.watermark.parameter_name.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "watermark.parameter_name must not be empty".to_string(),
        ));
    }
    if cfg.watermark.default_lookback_hours == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "watermark.default_lookback_hours must be >= 1".to_string(),
        ));
    }
    if let Some(endpoint) = cfg.sandbox.endpoint.as_deref() {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::UnsupportedConfig(format!(
                "sandbox.endpoint={endpoint} must be an http(s) URL"
            )));
        }
    }
    Ok(())
}
