use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use url::Url;

use crate::error::{AdapterError, Result};

pub const DEFAULT_WS_URL: &str = "wss://api.bitfinex.com/ws/2";
pub const DEFAULT_REST_URL: &str = "https://api.bitfinex.com";

/// Dead man switch value that activates auto-cancel on disconnect
pub const DMS_ACTIVE: u8 = 4;

/// Adapter configuration
#[derive(Clone, Deserialize)]
pub struct AdapterConfig {
    /// WebSocket API endpoint
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// REST API endpoint
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// HTTP CONNECT proxy used for all sockets (falls back to HTTPS_PROXY & co.)
    #[serde(default)]
    pub proxy: Option<String>,
    /// Dead man switch flag sent with auth, `4` = active
    #[serde(default)]
    pub dms: Option<u8>,
    /// Enables the periodic keep-alive packet
    #[serde(default)]
    pub with_heartbeat: bool,
    /// Attribution code attached to every submitted order
    #[serde(default)]
    pub affiliate_code: Option<String>,
    /// Number of sockets in the pool
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Force a reconnect if no packet arrives within this window
    #[serde(default = "default_packet_watchdog_ms")]
    pub packet_watchdog_ms: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

fn default_rest_url() -> String {
    DEFAULT_REST_URL.to_string()
}

fn default_connections() -> usize {
    1
}

fn default_packet_watchdog_ms() -> u64 {
    30_000
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            api_key: String::new(),
            api_secret: String::new(),
            proxy: None,
            dms: None,
            with_heartbeat: false,
            affiliate_code: None,
            connections: default_connections(),
            packet_watchdog_ms: default_packet_watchdog_ms(),
            logging: LoggingConfig::default(),
        }
    }
}

// api_secret must never end up in logs
impl std::fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterConfig")
            .field("ws_url", &self.ws_url)
            .field("rest_url", &self.rest_url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("proxy", &self.proxy)
            .field("dms", &self.dms)
            .field("with_heartbeat", &self.with_heartbeat)
            .field("affiliate_code", &self.affiliate_code)
            .field("connections", &self.connections)
            .field("packet_watchdog_ms", &self.packet_watchdog_ms)
            .field("logging", &self.logging)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rotating log file (console only when unset)
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AdapterConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("ws_url", DEFAULT_WS_URL)?
            .set_default("rest_url", DEFAULT_REST_URL)?
            .set_default("connections", 1)?
            .set_default("with_heartbeat", false)?
            .set_default("packet_watchdog_ms", 30_000)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("VENUE_ADAPTER_ENV")
                        .unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // VENUE_ADAPTER__API_KEY, VENUE_ADAPTER__LOGGING__LEVEL, ...
            .add_source(
                Environment::with_prefix("VENUE_ADAPTER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a config with credentials and defaults for everything else
    pub fn with_credentials(api_key: &str, api_secret: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            ..Self::default()
        }
    }

    /// Whether credentials were supplied at all
    pub fn has_credentials(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.api_secret.trim().is_empty()
    }

    /// Affiliate code, if configured and non-empty
    pub fn affiliate_code(&self) -> Option<&str> {
        self.affiliate_code
            .as_deref()
            .filter(|code| !code.is_empty())
    }

    /// Validate everything that can be checked without credentials
    pub fn validate(&self) -> Result<()> {
        let ws = Url::parse(&self.ws_url)?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(AdapterError::Validation(format!(
                "ws_url must use ws:// or wss://, got {}",
                self.ws_url
            )));
        }

        let rest = Url::parse(&self.rest_url)?;
        if !matches!(rest.scheme(), "http" | "https") {
            return Err(AdapterError::Validation(format!(
                "rest_url must use http:// or https://, got {}",
                self.rest_url
            )));
        }

        if let Some(proxy) = &self.proxy {
            if proxy.trim().is_empty() {
                return Err(AdapterError::Validation(
                    "proxy must not be empty when set".to_string(),
                ));
            }
        }

        if self.connections == 0 {
            return Err(AdapterError::Validation(
                "connections must be at least 1".to_string(),
            ));
        }

        if self.packet_watchdog_ms == 0 {
            return Err(AdapterError::Validation(
                "packet_watchdog_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Credentials check performed when connecting
    pub fn require_credentials(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(AdapterError::MissingCredential("api_key"));
        }
        if self.api_secret.trim().is_empty() {
            return Err(AdapterError::MissingCredential("api_secret"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AdapterConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ws_url, DEFAULT_WS_URL);
        assert_eq!(cfg.connections, 1);
        assert!(!cfg.with_heartbeat);
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let cfg = AdapterConfig::default();
        assert!(matches!(
            cfg.require_credentials(),
            Err(AdapterError::MissingCredential("api_key"))
        ));

        let cfg = AdapterConfig::with_credentials("key", "  ");
        assert!(matches!(
            cfg.require_credentials(),
            Err(AdapterError::MissingCredential("api_secret"))
        ));

        let cfg = AdapterConfig::with_credentials("key", "secret");
        assert!(cfg.require_credentials().is_ok());
    }

    #[test]
    fn rejects_wrong_url_schemes() {
        let cfg = AdapterConfig {
            ws_url: "https://api.bitfinex.com/ws/2".to_string(),
            ..AdapterConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(AdapterError::Validation(_))));

        let cfg = AdapterConfig {
            rest_url: "not a url".to_string(),
            ..AdapterConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(AdapterError::InvalidUrl(_))));
    }

    #[test]
    fn empty_affiliate_code_is_treated_as_absent() {
        let mut cfg = AdapterConfig::default();
        assert_eq!(cfg.affiliate_code(), None);

        cfg.affiliate_code = Some(String::new());
        assert_eq!(cfg.affiliate_code(), None);

        cfg.affiliate_code = Some("ref-123".to_string());
        assert_eq!(cfg.affiliate_code(), Some("ref-123"));
    }

    #[test]
    fn debug_output_redacts_secret() {
        let cfg = AdapterConfig::with_credentials("key", "super-secret");
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
