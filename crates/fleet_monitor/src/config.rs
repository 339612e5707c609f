//! Environment configuration for the fleet monitor.

use anyhow::{Context, Result};
use connection::ConnectionConfig;
use merge::MergeConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use subscription::Scope;
use tracing::info;

const DEFAULT_HTTP_PORT: u16 = 8090;
const DEFAULT_METRICS_PORT: u16 = 9095;

/// Everything the binary reads from the environment.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub connection: ConnectionConfig,
    pub merge: MergeConfig,
    /// Base URL of the paged baseline API; no baseline is loaded when unset.
    pub baseline_url: Option<String>,
    /// Entities to subscribe to on every topic.
    pub scope: Scope,
    pub http_port: u16,
    pub metrics_port: u16,
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut connection = ConnectionConfig::default();
        if let Some(url) = var("FLEET_WS_URL") {
            connection.url = url;
        }
        connection.auth_token = var("FLEET_AUTH_TOKEN");
        if let Some(flag) = var("FLEET_AUTO_CONNECT") {
            connection.auto_connect = parse_flag("FLEET_AUTO_CONNECT", &flag)?;
        }
        if let Some(flag) = var("FLEET_AUTO_RECONNECT") {
            connection.auto_reconnect = parse_flag("FLEET_AUTO_RECONNECT", &flag)?;
        }
        if let Some(ms) = parse_var::<u64>(&var, "FLEET_RECONNECT_DELAY_MS")? {
            connection.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&var, "FLEET_MAX_RECONNECT_DELAY_MS")? {
            connection.max_reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&var, "FLEET_MAX_RECONNECT_ATTEMPTS")? {
            connection.max_reconnect_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(&var, "FLEET_CONNECT_TIMEOUT_MS")? {
            connection.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&var, "FLEET_HEARTBEAT_INTERVAL_MS")? {
            connection.heartbeat_interval = Duration::from_millis(ms);
        }

        let mut merge = MergeConfig::default();
        if let Some(ms) = parse_var::<u64>(&var, "FLEET_THROTTLE_MS")? {
            merge.throttle = Duration::from_millis(ms);
        }
        merge.max_record_age =
            parse_var::<u64>(&var, "FLEET_MAX_RECORD_AGE_MS")?.map(Duration::from_millis);

        let scope = match var("FLEET_SUBSCRIBE_ENTITIES") {
            None => Scope::All,
            Some(list) if list.trim() == "*" || list.trim().eq_ignore_ascii_case("all") => Scope::All,
            Some(list) => Scope::entities(
                list.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string),
            ),
        };

        Ok(Self {
            connection,
            merge,
            baseline_url: var("FLEET_BASELINE_URL"),
            scope,
            http_port: parse_var(&var, "HTTP_PORT")?.unwrap_or(DEFAULT_HTTP_PORT),
            metrics_port: parse_var(&var, "METRICS_PORT")?.unwrap_or(DEFAULT_METRICS_PORT),
        })
    }

    pub fn log(&self) {
        info!("Configuration:");
        info!("  FLEET_WS_URL: {}", self.connection.url);
        info!(
            "  FLEET_AUTH_TOKEN: {}",
            if self.connection.auth_token.is_some() { "set" } else { "unset" }
        );
        info!("  FLEET_AUTO_CONNECT: {}", self.connection.auto_connect);
        info!("  FLEET_AUTO_RECONNECT: {}", self.connection.auto_reconnect);
        info!("  FLEET_RECONNECT_DELAY_MS: {}", self.connection.reconnect_delay.as_millis());
        info!(
            "  FLEET_MAX_RECONNECT_DELAY_MS: {}",
            self.connection.max_reconnect_delay.as_millis()
        );
        info!(
            "  FLEET_MAX_RECONNECT_ATTEMPTS: {}",
            self.connection.max_reconnect_attempts
        );
        info!("  FLEET_CONNECT_TIMEOUT_MS: {}", self.connection.timeout.as_millis());
        info!(
            "  FLEET_HEARTBEAT_INTERVAL_MS: {}",
            self.connection.heartbeat_interval.as_millis()
        );
        info!("  FLEET_THROTTLE_MS: {}", self.merge.throttle.as_millis());
        info!("  FLEET_MAX_RECORD_AGE_MS: {:?}", self.merge.max_record_age.map(|d| d.as_millis()));
        info!("  FLEET_BASELINE_URL: {:?}", self.baseline_url);
        info!("  FLEET_SUBSCRIBE_ENTITIES: {}", self.scope);
        info!("  HTTP_PORT: {}", self.http_port);
        info!("  METRICS_PORT: {}", self.metrics_port);
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{} must be a number, got {:?}", key, raw))
        })
        .transpose()
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{} must be a boolean, got {:?}", key, other),
    }
}
