//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use checkout::{CartSettings, SchedulerSettings, SettlementSettings, TrackingSettings};
use domain::{CommissionRule, Money, SplitPolicy};
use queue::{RetryPolicy, Topic, WebhookSettings};

/// Secret used when `CART_TOKEN_SECRET` is unset. Development only.
pub const DEV_TOKEN_SECRET: &str = "dev-cart-token-secret";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json`
/// - `DATABASE_URL`: PostgreSQL; in-memory stores when unset
/// - `FRONTEND_URL`, `CART_TOKEN_SECRET`, `CART_TOKEN_TTL_HOURS`
/// - `CART_SWEEP_INTERVAL_SECS`, `CART_WARNING_INTERVAL_SECS`
/// - `SHIPMENT_TRACKING_INTERVAL_SECS` (0 disables), `SHIPMENT_TRACKING_BATCH`
/// - `QUEUE_*` and `WEBHOOK_*` for the delivery queue
/// - `MINIMUM_CHARGE`, `CURRENCY`, `SPLIT_*` for settlement
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,

    pub frontend_url: String,
    pub token_secret: String,
    pub token_ttl_hours: i64,
    pub sweep_interval: Duration,
    pub warning_interval: Duration,
    pub tracking_interval: Duration,
    pub tracking_batch: usize,

    pub queue_poll_interval: Duration,
    pub queue_max_attempts: u32,
    pub queue_base_delay: Duration,
    pub queue_message_ttl: Duration,
    pub webhook_timeout: Duration,
    pub webhook_cart_item_added_url: Option<String>,
    pub webhook_cart_expired_url: Option<String>,
    pub webhook_cart_expiring_url: Option<String>,
    pub webhook_shipment_url: Option<String>,
    pub webhook_comment_url: Option<String>,

    pub minimum_charge: i64,
    pub currency: String,
    pub split_enabled: bool,
    pub split_minimum: i64,
    pub split_commission: i64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: parsed("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parsed("LOG_FORMAT", defaults.log_format),
            database_url: optional("DATABASE_URL"),

            frontend_url: std::env::var("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            token_secret: std::env::var("CART_TOKEN_SECRET").unwrap_or(defaults.token_secret),
            token_ttl_hours: parsed("CART_TOKEN_TTL_HOURS", defaults.token_ttl_hours),
            sweep_interval: Duration::from_secs(parsed("CART_SWEEP_INTERVAL_SECS", 300)),
            warning_interval: Duration::from_secs(parsed("CART_WARNING_INTERVAL_SECS", 3600)),
            tracking_interval: Duration::from_secs(parsed("SHIPMENT_TRACKING_INTERVAL_SECS", 1800)),
            tracking_batch: parsed("SHIPMENT_TRACKING_BATCH", defaults.tracking_batch),

            queue_poll_interval: Duration::from_millis(parsed("QUEUE_POLL_INTERVAL_MS", 500)),
            queue_max_attempts: parsed("QUEUE_MAX_ATTEMPTS", defaults.queue_max_attempts),
            queue_base_delay: Duration::from_millis(parsed("QUEUE_BASE_DELAY_MS", 1000)),
            queue_message_ttl: Duration::from_secs(
                parsed::<u64>("QUEUE_MESSAGE_TTL_HOURS", 24) * 3600,
            ),
            webhook_timeout: Duration::from_secs(parsed("WEBHOOK_TIMEOUT_SECS", 10)),
            webhook_cart_item_added_url: optional("WEBHOOK_CART_ITEM_ADDED_URL"),
            webhook_cart_expired_url: optional("WEBHOOK_CART_EXPIRED_URL"),
            webhook_cart_expiring_url: optional("WEBHOOK_CART_EXPIRING_URL"),
            webhook_shipment_url: optional("WEBHOOK_SHIPMENT_URL"),
            webhook_comment_url: optional("WEBHOOK_COMMENT_URL"),

            minimum_charge: parsed("MINIMUM_CHARGE", defaults.minimum_charge),
            currency: std::env::var("CURRENCY").unwrap_or(defaults.currency),
            split_enabled: parsed("SPLIT_ENABLED", defaults.split_enabled),
            split_minimum: parsed("SPLIT_MINIMUM", defaults.split_minimum),
            split_commission: parsed("SPLIT_COMMISSION", defaults.split_commission),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true when the token secret is the built-in development one.
    pub fn uses_dev_secret(&self) -> bool {
        self.token_secret == DEV_TOKEN_SECRET
    }

    pub fn cart_settings(&self) -> CartSettings {
        CartSettings {
            frontend_url: self.frontend_url.clone(),
            ..CartSettings::default()
        }
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.token_ttl_hours)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            sweep_interval: self.sweep_interval,
            warning_interval: self.warning_interval,
        }
    }

    pub fn tracking_settings(&self) -> TrackingSettings {
        TrackingSettings {
            interval: self.tracking_interval,
            batch_limit: self.tracking_batch,
            ..TrackingSettings::default()
        }
    }

    pub fn settlement_settings(&self) -> SettlementSettings {
        SettlementSettings {
            minimum_charge: Money::new(self.minimum_charge),
            currency: self.currency.clone(),
            split: SplitPolicy {
                enabled: self.split_enabled,
                minimum_amount: Money::new(self.split_minimum),
                commission: CommissionRule::Fixed(Money::new(self.split_commission)),
            },
            ..SettlementSettings::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.queue_max_attempts,
            base_delay: self.queue_base_delay,
            message_ttl: self.queue_message_ttl,
            poll_interval: self.queue_poll_interval,
        }
    }

    /// Webhook endpoints; topics without a URL are skipped on delivery.
    pub fn webhook_settings(&self) -> WebhookSettings {
        let endpoints = [
            (Topic::cart_item_added(), &self.webhook_cart_item_added_url),
            (Topic::cart_expired(), &self.webhook_cart_expired_url),
            (Topic::cart_expiring(), &self.webhook_cart_expiring_url),
            (Topic::shipment_status_changed(), &self.webhook_shipment_url),
            (Topic::comment(), &self.webhook_comment_url),
        ];

        endpoints.into_iter().fold(
            WebhookSettings {
                timeout: self.webhook_timeout,
                ..WebhookSettings::default()
            },
            |settings, (topic, url)| match url {
                Some(url) => settings.with_endpoint(topic, url.clone()),
                None => settings,
            },
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,

            frontend_url: "http://localhost:3000".to_string(),
            token_secret: DEV_TOKEN_SECRET.to_string(),
            token_ttl_hours: checkout::token::DEFAULT_TOKEN_TTL_HOURS,
            sweep_interval: Duration::from_secs(300),
            warning_interval: Duration::from_secs(3600),
            tracking_interval: Duration::from_secs(1800),
            tracking_batch: 50,

            queue_poll_interval: Duration::from_millis(500),
            queue_max_attempts: 3,
            queue_base_delay: Duration::from_secs(1),
            queue_message_ttl: Duration::from_secs(24 * 3600),
            webhook_timeout: Duration::from_secs(10),
            webhook_cart_item_added_url: None,
            webhook_cart_expired_url: None,
            webhook_cart_expiring_url: None,
            webhook_shipment_url: None,
            webhook_comment_url: None,

            minimum_charge: 300,
            currency: "COP".to_string(),
            split_enabled: false,
            split_minimum: 1000,
            split_commission: 1000,
        }
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert!(config.uses_dev_secret());
        assert_eq!(config.token_ttl_hours, 168);
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_addr_default() {
        let config = Config::default();
        assert_eq!(config.addr(), "0.0.0.0:3000");
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_component_settings() {
        let config = Config {
            queue_max_attempts: 5,
            split_enabled: true,
            minimum_charge: 500,
            ..Config::default()
        };

        assert_eq!(config.retry_policy().max_attempts, 5);
        let settlement = config.settlement_settings();
        assert_eq!(settlement.minimum_charge, Money::new(500));
        assert!(settlement.split.enabled);
        assert_eq!(config.scheduler_settings().sweep_interval, Duration::from_secs(300));
        let tracking = config.tracking_settings();
        assert_eq!(tracking.interval, Duration::from_secs(1800));
        assert_eq!(tracking.batch_limit, 50);
    }

    #[test]
    fn test_webhook_endpoints_only_for_configured_topics() {
        let config = Config {
            webhook_cart_expired_url: Some("https://hooks.test/expired".to_string()),
            ..Config::default()
        };

        let settings = config.webhook_settings();
        assert_eq!(settings.endpoints.len(), 1);
        assert_eq!(
            settings.endpoints.get(&Topic::cart_expired()).map(String::as_str),
            Some("https://hooks.test/expired")
        );
    }
}
