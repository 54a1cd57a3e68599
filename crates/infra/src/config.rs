//! Application configuration, loaded once at startup.
//!
//! Values come from `MEDCART_*` environment variables. Loading goes through a
//! lookup closure so tests can build configs without touching the process
//! environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use medcart_core::Currency;

pub const ENV_BIND_ADDR: &str = "MEDCART_BIND_ADDR";
pub const ENV_JWT_SECRET: &str = "MEDCART_JWT_SECRET";
pub const ENV_GATEWAY_KEY_ID: &str = "MEDCART_GATEWAY_KEY_ID";
pub const ENV_GATEWAY_KEY_SECRET: &str = "MEDCART_GATEWAY_KEY_SECRET";
pub const ENV_CURRENCY: &str = "MEDCART_CURRENCY";
pub const ENV_PAYMENT_TIMEOUT_SECS: &str = "MEDCART_PAYMENT_TIMEOUT_SECS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "MEDCART_SWEEP_INTERVAL_SECS";
pub const ENV_PRESCRIPTION_POLICY: &str = "MEDCART_PRESCRIPTION_POLICY";
pub const ENV_DATABASE_URL: &str = "MEDCART_DATABASE_URL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// What to do with a prescription-only item when the buyer supplies no
/// prescription reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrescriptionPolicy {
    /// Accept the order, flag the item and log a warning.
    #[default]
    Advisory,
    /// Reject the order with `PrescriptionRequired`.
    Enforced,
}

impl FromStr for PrescriptionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "advisory" => Ok(Self::Advisory),
            "enforced" => Ok(Self::Enforced),
            other => Err(format!("expected advisory|enforced, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    /// Postgres connection string for the stock ledger; in-memory when unset.
    pub database_url: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub key_id: String,
    pub key_secret: String,
}

impl core::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("key_id", &self.key_id)
            .field("key_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementConfig {
    pub currency: Currency,
    /// How long a checkout may hold stock before the sweeper releases it.
    pub payment_timeout: Duration,
    pub sweep_interval: Duration,
    pub prescription_policy: PrescriptionPolicy,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            currency: Currency::default(),
            payment_timeout: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            prescription_policy: PrescriptionPolicy::Advisory,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub settlement: SettlementConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = match get(ENV_BIND_ADDR) {
            Some(raw) => raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: ENV_BIND_ADDR,
                reason: e.to_string(),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let jwt_secret = get(ENV_JWT_SECRET).ok_or(ConfigError::Missing(ENV_JWT_SECRET))?;
        if jwt_secret.len() < 16 {
            return Err(ConfigError::Invalid {
                key: ENV_JWT_SECRET,
                reason: "must be at least 16 bytes".to_string(),
            });
        }

        let key_id = get(ENV_GATEWAY_KEY_ID).ok_or(ConfigError::Missing(ENV_GATEWAY_KEY_ID))?;
        let key_secret =
            get(ENV_GATEWAY_KEY_SECRET).ok_or(ConfigError::Missing(ENV_GATEWAY_KEY_SECRET))?;

        let defaults = SettlementConfig::default();
        let currency = match get(ENV_CURRENCY) {
            Some(raw) => Currency::parse(&raw).map_err(|e| ConfigError::Invalid {
                key: ENV_CURRENCY,
                reason: e.to_string(),
            })?,
            None => defaults.currency,
        };
        let payment_timeout =
            seconds(&get, ENV_PAYMENT_TIMEOUT_SECS)?.unwrap_or(defaults.payment_timeout);
        let sweep_interval =
            seconds(&get, ENV_SWEEP_INTERVAL_SECS)?.unwrap_or(defaults.sweep_interval);
        let prescription_policy = match get(ENV_PRESCRIPTION_POLICY) {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                key: ENV_PRESCRIPTION_POLICY,
                reason,
            })?,
            None => defaults.prescription_policy,
        };

        Ok(Self {
            server: ServerConfig {
                bind_addr,
                jwt_secret,
                database_url: get(ENV_DATABASE_URL),
            },
            gateway: GatewayConfig { key_id, key_secret },
            settlement: SettlementConfig {
                currency,
                payment_timeout,
                sweep_interval,
                prescription_policy,
            },
        })
    }
}

fn seconds<G>(get: &G, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(None);
    };
    let secs: u64 = raw.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Some(Duration::from_secs(secs)))
}
