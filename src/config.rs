use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
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
const DEFAULT_GATEWAY_BASE_URL: &str = "https://api.paystack.co";

/// One purchasable ticket type. Prices are in the canonical currency.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TicketTypeConfig {
    pub name: String,
    pub price: Decimal,
}

impl TicketTypeConfig {
    pub fn new(name: impl Into<String>, price: Decimal) -> Self {
        Self {
            name: name.into(),
            price,
        }
    }
}

/// Payment gateway connection settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentGatewayConfig {
    /// Base URL of the gateway REST API
    #[serde(default = "default_gateway_base_url")]
    #[validate(url)]
    pub base_url: String,

    /// Secret key sent as a bearer token on server-side calls
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Public key handed to the client-side payment widget
    #[serde(default)]
    pub public_key: Option<String>,

    /// Shared secret for verifying webhook signatures
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Where the gateway redirects the buyer after an off-site payment
    #[serde(default)]
    pub callback_url: Option<String>,

    /// Bound on gateway readiness plus `initialize` (seconds)
    #[serde(default = "default_gateway_init_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub init_timeout_secs: u64,

    /// Bound on a single verification call (seconds)
    #[serde(default = "default_gateway_verify_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub verify_timeout_secs: u64,
}

impl Default for PaymentGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            secret_key: None,
            public_key: None,
            webhook_secret: None,
            callback_url: None,
            init_timeout_secs: default_gateway_init_timeout_secs(),
            verify_timeout_secs: default_gateway_verify_timeout_secs(),
        }
    }
}

impl PaymentGatewayConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

/// Outbound confirmation delivery
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    /// Mail relay endpoint; confirmations are only logged when unset
    #[serde(default)]
    pub relay_url: Option<String>,

    /// HMAC key for signing relay payloads
    #[serde(default)]
    pub signing_secret: Option<String>,

    #[serde(default = "default_notification_max_retries")]
    pub max_retries: u32,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Application environment
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

    /// Comma-separated origins allowed to call the API from a browser
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,
    /// Statement timeout (seconds), 0 = disabled
    #[serde(default)]
    pub db_statement_timeout_secs: Option<u64>,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Currency every purchase amount is stored in
    #[serde(default = "default_canonical_currency")]
    #[validate(length(equal = 3))]
    pub canonical_currency: String,

    /// Currency charged for mobile-money payments
    #[serde(default = "default_settlement_currency")]
    #[validate(length(equal = 3))]
    pub settlement_currency: String,

    /// Units of settlement currency per unit of canonical currency
    #[serde(default = "default_settlement_exchange_rate")]
    #[validate(custom = "validate_exchange_rate")]
    pub settlement_exchange_rate: Decimal,

    /// Tax rate applied to the discounted subtotal (e.g. 0.08 for 8%)
    #[serde(default)]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: Decimal,

    /// How long a captured lead lets the buyer skip the contact step (hours)
    #[serde(default = "default_lead_skip_window_hours")]
    #[validate(range(min = 1, max = 720))]
    pub lead_skip_window_hours: i64,

    /// Event identifier promo-code filters may target
    #[serde(default = "default_event_id")]
    pub event_id: String,

    /// Ticket catalog; the only source of ticket prices
    #[serde(default = "default_ticket_catalog")]
    pub tickets: Vec<TicketTypeConfig>,

    #[serde(default)]
    #[validate]
    pub payment_gateway: PaymentGatewayConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl AppConfig {
    /// Creates a configuration with every optional setting at its default.
    pub fn new(database_url: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            host: "0.0.0.0".to_string(),
            port: default_port(),
            environment: environment.into(),
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            db_statement_timeout_secs: None,
            event_channel_capacity: default_event_channel_capacity(),
            canonical_currency: default_canonical_currency(),
            settlement_currency: default_settlement_currency(),
            settlement_exchange_rate: default_settlement_exchange_rate(),
            tax_rate: Decimal::ZERO,
            lead_skip_window_hours: default_lead_skip_window_hours(),
            event_id: default_event_id(),
            tickets: default_ticket_catalog(),
            payment_gateway: PaymentGatewayConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn lead_skip_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lead_skip_window_hours)
    }

    /// Looks up a ticket type by name, ignoring case and surrounding whitespace.
    pub fn find_ticket(&self, name: &str) -> Option<&TicketTypeConfig> {
        let name = name.trim();
        self.tickets
            .iter()
            .find(|ticket| ticket.name.eq_ignore_ascii_case(name))
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.tickets.is_empty() {
            let mut err = ValidationError::new("tickets_empty");
            err.message = Some("At least one ticket type must be configured".into());
            errors.add("tickets", err);
        }

        let mut seen = HashSet::new();
        for ticket in &self.tickets {
            if ticket.name.trim().is_empty() || ticket.price < Decimal::ZERO {
                let mut err = ValidationError::new("ticket_invalid");
                err.message =
                    Some("Ticket types need a name and a non-negative price".into());
                errors.add("tickets", err);
                break;
            }
            if !seen.insert(ticket.name.to_ascii_lowercase()) {
                let mut err = ValidationError::new("ticket_duplicate");
                err.message = Some(format!("Ticket type '{}' is listed twice", ticket.name).into());
                errors.add("tickets", err);
                break;
            }
        }

        if self.is_production() && self.payment_gateway.secret_key.is_none() {
            let mut err = ValidationError::new("gateway_secret_required");
            err.message = Some(
                "Set APP__PAYMENT_GATEWAY__SECRET_KEY outside development environments".into(),
            );
            errors.add("payment_gateway", err);
        }

        if self.is_production() && self.payment_gateway.webhook_secret.is_none() {
            let mut err = ValidationError::new("webhook_secret_required");
            err.message = Some(
                "Set APP__PAYMENT_GATEWAY__WEBHOOK_SECRET so webhook signatures are checked"
                    .into(),
            );
            errors.add("payment_gateway", err);
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

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_canonical_currency() -> String {
    "USD".to_string()
}

fn default_settlement_currency() -> String {
    "KES".to_string()
}

fn default_settlement_exchange_rate() -> Decimal {
    Decimal::from(130)
}

fn default_lead_skip_window_hours() -> i64 {
    24
}

fn default_event_id() -> String {
    "main-event".to_string()
}

fn default_ticket_catalog() -> Vec<TicketTypeConfig> {
    vec![
        TicketTypeConfig::new("General Admission", Decimal::from(95)),
        TicketTypeConfig::new("VIP", Decimal::from(250)),
    ]
}

fn default_gateway_base_url() -> String {
    DEFAULT_GATEWAY_BASE_URL.to_string()
}

fn default_gateway_init_timeout_secs() -> u64 {
    30
}

fn default_gateway_verify_timeout_secs() -> u64 {
    10
}

fn default_notification_max_retries() -> u32 {
    3
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

fn validate_tax_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if *rate < Decimal::ZERO || *rate > Decimal::ONE {
        let mut err = ValidationError::new("tax_rate");
        err.message = Some("tax_rate must be between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_exchange_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if *rate <= Decimal::ZERO {
        let mut err = ValidationError::new("settlement_exchange_rate");
        err.message = Some("settlement_exchange_rate must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("ticket_checkout={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
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
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://tickets.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
