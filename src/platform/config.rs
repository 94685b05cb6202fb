//! Service configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `DATABASE_URL` - `PostgreSQL` connection string
//! - `AUTH_JWT_SECRET` - HS256 secret shared with the identity provider
//! - `AUTH_WEBHOOK_SECRET` - HMAC secret for identity provider webhooks
//!
//! ## Optional
//! - `HOST` / `PORT` - bind address (default `0.0.0.0:3000`)
//! - `DATABASE_MAX_CONNECTIONS` - pool size (default 10)
//! - `SMS_GATEWAY_URL`, `SMS_GATEWAY_API_KEY`, `SMS_SENDER_ID`
//! - `NOTIFICATION_CHANNEL` - `sms` or `whatsapp` (default `sms`)
//! - `PAYMENT_GATEWAY_URL`, `PAYMENT_GATEWAY_API_KEY`, `PAYMENT_WEBHOOK_SECRET`
//! - `IMAGE_CDN_URL`, `IMAGE_CDN_API_KEY`
//! - `CURRENCY` (default `INR`), `DELIVERY_FEE` (default `40.00`)
//! - `LOYALTY_POINTS_PER_UNIT` (default 1)
//! - `OUTBOX_POLL_INTERVAL_SECS` (default 2)

use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use rust_decimal::Decimal;
use thiserror::Error;

use crate::api::notifications::Channel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub notifications: NotificationConfig,
    pub payments: PaymentConfig,
    pub image_cdn: ImageCdnConfig,
    pub ordering: OrderingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub webhook_secret: String,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub gateway_url: Option<String>,
    pub api_key: Option<String>,
    pub sender_id: String,
    pub channel: Channel,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub gateway_url: Option<String>,
    pub api_key: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageCdnConfig {
    pub upload_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrderingConfig {
    pub currency: String,
    pub delivery_fee: Decimal,
    pub loyalty_points_per_unit: i32,
}

/// Builds the configuration from the process environment.
pub fn load() -> Result<AppConfig, ConfigError> {
    load_from(|key| std::env::var(key).ok())
}

/// Builds the configuration from an arbitrary lookup, so tests never touch the real environment.
pub fn load_from<F>(lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
    let required = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.into()));

    Ok(AppConfig {
        server: ServerConfig {
            host: parse_or(get("HOST"), "HOST", IpAddr::from([0, 0, 0, 0]))?,
            port: parse_or(get("PORT"), "PORT", 3000)?,
        },
        database: DatabaseConfig {
            url: required("DATABASE_URL")?,
            max_connections: non_zero(
                parse_or(get("DATABASE_MAX_CONNECTIONS"), "DATABASE_MAX_CONNECTIONS", 10)?,
                "DATABASE_MAX_CONNECTIONS",
            )?,
        },
        auth: AuthConfig {
            jwt_secret: required("AUTH_JWT_SECRET")?,
            webhook_secret: required("AUTH_WEBHOOK_SECRET")?,
        },
        notifications: NotificationConfig {
            gateway_url: get("SMS_GATEWAY_URL"),
            api_key: get("SMS_GATEWAY_API_KEY"),
            sender_id: get("SMS_SENDER_ID").unwrap_or_else(|| "TASTEBUD".into()),
            channel: parse_or(get("NOTIFICATION_CHANNEL"), "NOTIFICATION_CHANNEL", Channel::Sms)?,
            poll_interval: Duration::from_secs(non_zero(
                parse_or(get("OUTBOX_POLL_INTERVAL_SECS"), "OUTBOX_POLL_INTERVAL_SECS", 2)?,
                "OUTBOX_POLL_INTERVAL_SECS",
            )?),
        },
        payments: PaymentConfig {
            gateway_url: get("PAYMENT_GATEWAY_URL"),
            api_key: get("PAYMENT_GATEWAY_API_KEY"),
            webhook_secret: get("PAYMENT_WEBHOOK_SECRET"),
        },
        image_cdn: ImageCdnConfig {
            upload_url: get("IMAGE_CDN_URL"),
            api_key: get("IMAGE_CDN_API_KEY"),
        },
        ordering: OrderingConfig {
            currency: get("CURRENCY").unwrap_or_else(|| "INR".into()),
            delivery_fee: parse_or(get("DELIVERY_FEE"), "DELIVERY_FEE", Decimal::new(4000, 2))?,
            loyalty_points_per_unit: parse_or(
                get("LOYALTY_POINTS_PER_UNIT"),
                "LOYALTY_POINTS_PER_UNIT",
                1,
            )?,
        },
    })
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err: T::Err| ConfigError::InvalidEnvVar(key.into(), err.to_string())),
        None => Ok(default),
    }
}

fn non_zero<T>(value: T, key: &str) -> Result<T, ConfigError>
where
    T: Default + PartialEq,
{
    if value == T::default() {
        return Err(ConfigError::InvalidEnvVar(key.into(), "must be greater than zero".into()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("DATABASE_URL", "postgres://localhost/tastebud"),
        ("AUTH_JWT_SECRET", "jwt-secret"),
        ("AUTH_WEBHOOK_SECRET", "webhook-secret"),
    ];

    #[test]
    fn applies_defaults() {
        let config = load_from(env(REQUIRED)).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.ordering.delivery_fee, Decimal::new(4000, 2));
        assert_eq!(config.ordering.currency, "INR");
        assert_eq!(config.notifications.channel, Channel::Sms);
        assert!(config.payments.gateway_url.is_none());
    }

    #[test]
    fn missing_required_variable_is_reported() {
        let err = load_from(env(&REQUIRED[..2])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "AUTH_WEBHOOK_SECRET"));
    }

    #[test]
    fn blank_values_count_as_missing() {
        let mut pairs = REQUIRED.to_vec();
        pairs[0] = ("DATABASE_URL", "   ");
        assert!(load_from(env(&pairs)).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("PORT", "eighty"));
        let err = load_from(env(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar(key, _) if key == "PORT"));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("NOTIFICATION_CHANNEL", "pigeon"));
        assert!(load_from(env(&pairs)).is_err());
    }

    #[test]
    fn zero_pool_size_and_poll_interval_are_rejected() {
        for key in ["DATABASE_MAX_CONNECTIONS", "OUTBOX_POLL_INTERVAL_SECS"] {
            let mut pairs = REQUIRED.to_vec();
            pairs.push((key, "0"));
            let err = load_from(env(&pairs)).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidEnvVar(ref k, _) if k == key));
        }
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("PORT", "8080"),
            ("DELIVERY_FEE", "25.50"),
            ("NOTIFICATION_CHANNEL", "whatsapp"),
            ("LOYALTY_POINTS_PER_UNIT", "2"),
        ]);
        let config = load_from(env(&pairs)).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.ordering.delivery_fee, Decimal::new(2550, 2));
        assert_eq!(config.notifications.channel, Channel::Whatsapp);
        assert_eq!(config.ordering.loyalty_points_per_unit, 2);
    }
}
