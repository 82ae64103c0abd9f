//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if the log connection string is
//! missing. The connection string carries credentials, so it is wrapped in
//! `secrecy::SecretString` to keep it out of logs.

pub mod secrets;

use crate::consumer::control::DEFAULT_GROUP;
use crate::error::{Error, Result};
use crate::store::DEFAULT_STREAM_PREFIX;
use crate::telemetry::TelemetryConfig;
use secrecy::SecretString;

/// Port used when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug)]
pub struct Config {
    /// Event log connection string (`postgres://…` or `memory://`).
    pub event_log_url: SecretString,
    pub port: u16,
    pub subscription_group: String,
    /// Prefix applied to project ids to form stream names. Empty keeps the
    /// raw project id.
    pub stream_prefix: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(raw) if !raw.is_empty() => raw
                .parse()
                .map_err(|_| Error::Config(format!("PORT is not a valid port: {raw}")))?,
            _ => DEFAULT_PORT,
        };

        Ok(Self {
            event_log_url: SecretString::from(required_var("EVENT_LOG_URL")?),
            port,
            subscription_group: std::env::var("SUBSCRIPTION_GROUP")
                .ok()
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            stream_prefix: std::env::var("STREAM_PREFIX")
                .unwrap_or_else(|_| DEFAULT_STREAM_PREFIX.to_string()),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok().filter(|e| !e.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

impl Config {
    /// Telemetry settings for a process reporting as `service_name`.
    pub fn telemetry(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: self.log_level.clone(),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::Config(format!(
            "required environment variable {name} is not set"
        ))),
    }
}
