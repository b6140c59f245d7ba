use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "usd";
const DEFAULT_REWARD_THRESHOLD_CENTS: i64 = 20_000;
const DEFAULT_REWARD_DISCOUNT_PERCENTAGE: i32 = 10;
const DEFAULT_REWARD_VALIDITY_DAYS: i64 = 30;
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;
const DEFAULT_JWT_ISSUER: &str = "storefront-auth";
const DEFAULT_JWT_AUDIENCE: &str = "storefront-api";

pub const PROVIDER_STRIPE: &str = "stripe";
pub const PROVIDER_SANDBOX: &str = "sandbox";

/// Checkout pipeline settings, injected into the services that need them.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CheckoutConfig {
    /// ISO 4217 code sent to the payment provider
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Pre-discount total at or above which a reward coupon is issued
    #[serde(default = "default_reward_threshold_cents")]
    #[validate(range(min = 0))]
    pub reward_threshold_cents: i64,

    #[serde(default = "default_reward_discount_percentage")]
    #[validate(range(min = 0, max = 100))]
    pub reward_discount_percentage: i32,

    #[serde(default = "default_reward_validity_days")]
    #[validate(range(min = 1))]
    pub reward_validity_days: i64,

    /// Redirect after payment; `{CHECKOUT_SESSION_ID}` is filled in by the provider
    #[validate(custom = "validate_redirect_url")]
    pub success_url: String,

    #[validate(custom = "validate_redirect_url")]
    pub cancel_url: String,

    /// "stripe" or "sandbox"
    #[serde(default = "default_payment_provider")]
    #[validate(custom = "validate_payment_provider")]
    pub payment_provider: String,

    #[serde(default)]
    pub stripe_secret_key: Option<String>,

    #[serde(default)]
    pub stripe_api_base: Option<String>,

    #[serde(default = "default_provider_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub provider_timeout_secs: u64,

    /// Shared secret for webhook signatures; unsigned webhooks are accepted when unset
    #[serde(default)]
    pub webhook_secret: Option<String>,

    #[serde(default = "default_webhook_tolerance_secs")]
    #[validate(range(min = 1))]
    pub webhook_tolerance_secs: i64,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            reward_threshold_cents: DEFAULT_REWARD_THRESHOLD_CENTS,
            reward_discount_percentage: DEFAULT_REWARD_DISCOUNT_PERCENTAGE,
            reward_validity_days: DEFAULT_REWARD_VALIDITY_DAYS,
            success_url: "http://localhost:3000/purchase-success?session_id={CHECKOUT_SESSION_ID}"
                .to_string(),
            cancel_url: "http://localhost:3000/purchase-cancel".to_string(),
            payment_provider: default_payment_provider(),
            stripe_secret_key: None,
            stripe_api_base: None,
            provider_timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
            webhook_secret: None,
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
        }
    }
}

impl CheckoutConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn uses_sandbox(&self) -> bool {
        self.payment_provider.eq_ignore_ascii_case(PROVIDER_SANDBOX)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// HS256 secret shared with the auth service
    #[validate(length(min = 32), custom = "validate_jwt_secret")]
    pub jwt_secret: String,

    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,

    #[serde(default = "default_jwt_audience")]
    pub jwt_audience: String,

    #[serde(default)]
    #[validate]
    pub checkout: CheckoutConfig,
}

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case(DEFAULT_ENV)
    }

    /// Socket address string the server binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let stripe_key_missing = self
            .checkout
            .stripe_secret_key
            .as_deref()
            .map_or(true, |key| key.trim().is_empty());
        if !self.checkout.uses_sandbox() && stripe_key_missing {
            let mut err = ValidationError::new("stripe_secret_key_required");
            err.message = Some(
                "Set APP__CHECKOUT__STRIPE_SECRET_KEY or switch APP__CHECKOUT__PAYMENT_PROVIDER to sandbox".into(),
            );
            errors.add("stripe_secret_key", err);
        }

        if !self.is_development() && self.checkout.uses_sandbox() {
            let mut err = ValidationError::new("sandbox_provider_outside_development");
            err.message = Some("The sandbox payment provider is only allowed in development".into());
            errors.add("payment_provider", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_reward_threshold_cents() -> i64 {
    DEFAULT_REWARD_THRESHOLD_CENTS
}

fn default_reward_discount_percentage() -> i32 {
    DEFAULT_REWARD_DISCOUNT_PERCENTAGE
}

fn default_reward_validity_days() -> i64 {
    DEFAULT_REWARD_VALIDITY_DAYS
}

fn default_payment_provider() -> String {
    PROVIDER_STRIPE.to_string()
}

fn default_provider_timeout_secs() -> u64 {
    DEFAULT_PROVIDER_TIMEOUT_SECS
}

fn default_webhook_tolerance_secs() -> i64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}

fn default_jwt_issuer() -> String {
    DEFAULT_JWT_ISSUER.to_string()
}

fn default_jwt_audience() -> String {
    DEFAULT_JWT_AUDIENCE.to_string()
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();

    if let Some(first) = trimmed.chars().next() {
        if trimmed.chars().all(|c| c == first) {
            let mut err = ValidationError::new("jwt_secret");
            err.message = Some("JWT secret cannot be a repeated character sequence".into());
            return Err(err);
        }
    }

    let lower = trimmed.to_ascii_lowercase();
    let weak_fragments = ["changeme", "password", "your-secret-key"];
    if weak_fragments.iter().any(|pattern| lower.contains(pattern)) {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some(
            "JWT secret appears to be weak; use a cryptographically strong random string".into(),
        );
        return Err(err);
    }

    Ok(())
}

fn validate_payment_provider(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        PROVIDER_STRIPE | PROVIDER_SANDBOX => Ok(()),
        _ => {
            let mut err = ValidationError::new("payment_provider");
            err.message = Some("Must be one of: stripe, sandbox".into());
            Err(err)
        }
    }
}

fn validate_redirect_url(url: &str) -> Result<(), ValidationError> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        let mut err = ValidationError::new("redirect_url");
        err.message = Some("Redirect URLs must be absolute http(s) URLs".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_checkout={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

pub fn load_config_from(config_dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let defaults = CheckoutConfig::default();
    // jwt_secret has no default; it must come from a file or APP__JWT_SECRET.
    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("checkout.success_url", defaults.success_url)?
        .set_default("checkout.cancel_url", defaults.cancel_url)?
        .add_source(File::with_name(&config_dir.join("default").to_string_lossy()).required(false))
        .add_source(File::with_name(&config_dir.join(run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to the secret shared with the auth service.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
