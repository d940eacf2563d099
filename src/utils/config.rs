//! `MCP_*` environment overrides applied on top of the TOML file.

use super::toml_config::{ConfigError, HubConfig};
use crate::dispatch::LoadBalanceStrategy;
use crate::types::AgentType;
use std::env;
use std::str::FromStr;

/// Environment variables recognised by the hub.
pub const ENV_VARS: &[&str] = &[
    "MCP_HOST",
    "MCP_PORT",
    "MCP_MAX_CONNECTIONS",
    "MCP_LOG_LEVEL",
    "MCP_HEARTBEAT_INTERVAL",
    "MCP_HEARTBEAT_TIMEOUT",
    "MCP_TASK_TIMEOUT",
    "MCP_RETRY_ATTEMPTS",
    "MCP_LOAD_BALANCE_STRATEGY",
    "MCP_CIRCUIT_BREAKER_ENABLED",
    "MCP_CIRCUIT_BREAKER_THRESHOLD",
    "MCP_ALLOWED_AGENT_TYPES",
];

/// Apply overrides from the process environment (after `.env` is loaded).
pub fn apply_env_overrides(config: &mut HubConfig) -> Result<(), ConfigError> {
    apply_overrides_from(config, |key| env::var(key).ok())
}

fn parsed<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvVar(key.to_string(), raw.to_string()))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvVar(key.to_string(), raw.to_string())),
    }
}

/// Apply overrides using an arbitrary lookup.
pub fn apply_overrides_from<F>(config: &mut HubConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("MCP_HOST") {
        config.server.host = v;
    }
    if let Some(v) = lookup("MCP_PORT") {
        config.server.port = parsed("MCP_PORT", &v)?;
    }
    if let Some(v) = lookup("MCP_MAX_CONNECTIONS") {
        config.server.max_connections = parsed("MCP_MAX_CONNECTIONS", &v)?;
    }
    if let Some(v) = lookup("MCP_LOG_LEVEL") {
        config.server.log_level = v;
    }
    if let Some(v) = lookup("MCP_HEARTBEAT_INTERVAL") {
        config.heartbeat.interval_secs = parsed("MCP_HEARTBEAT_INTERVAL", &v)?;
    }
    if let Some(v) = lookup("MCP_HEARTBEAT_TIMEOUT") {
        config.heartbeat.ttl_secs = parsed("MCP_HEARTBEAT_TIMEOUT", &v)?;
    }
    if let Some(v) = lookup("MCP_TASK_TIMEOUT") {
        config.dispatch.task_timeout_secs = parsed("MCP_TASK_TIMEOUT", &v)?;
    }
    if let Some(v) = lookup("MCP_RETRY_ATTEMPTS") {
        config.dispatch.retry_attempts = parsed("MCP_RETRY_ATTEMPTS", &v)?;
    }
    if let Some(v) = lookup("MCP_LOAD_BALANCE_STRATEGY") {
        config.dispatch.strategy = v
            .parse::<LoadBalanceStrategy>()
            .map_err(|_| ConfigError::InvalidEnvVar("MCP_LOAD_BALANCE_STRATEGY".into(), v))?;
    }
    if let Some(v) = lookup("MCP_CIRCUIT_BREAKER_ENABLED") {
        config.circuit_breaker.enabled = parse_bool("MCP_CIRCUIT_BREAKER_ENABLED", &v)?;
    }
    if let Some(v) = lookup("MCP_CIRCUIT_BREAKER_THRESHOLD") {
        config.circuit_breaker.failure_threshold = parsed("MCP_CIRCUIT_BREAKER_THRESHOLD", &v)?;
    }
    if let Some(v) = lookup("MCP_ALLOWED_AGENT_TYPES") {
        config.agents.allowed_types = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<AgentType>().map_err(|_| {
                    ConfigError::InvalidEnvVar("MCP_ALLOWED_AGENT_TYPES".into(), s.to_string())
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = HubConfig::default();
        apply_overrides_from(
            &mut config,
            lookup(&[
                ("MCP_PORT", "9100"),
                ("MCP_HEARTBEAT_INTERVAL", "5"),
                ("MCP_RETRY_ATTEMPTS", "0"),
                ("MCP_LOAD_BALANCE_STRATEGY", "round_robin"),
                ("MCP_CIRCUIT_BREAKER_ENABLED", "false"),
                ("MCP_ALLOWED_AGENT_TYPES", "planning, writer"),
            ]),
        )
        .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.heartbeat.interval_secs, 5);
        assert_eq!(config.dispatch.retry_attempts, 0);
        assert_eq!(config.dispatch.strategy, LoadBalanceStrategy::RoundRobin);
        assert!(!config.circuit_breaker.enabled);
        assert_eq!(
            config.agents.allowed_types,
            vec![AgentType::Planning, AgentType::Writer]
        );
    }

    #[test]
    fn test_missing_vars_leave_config_untouched() {
        let mut config = HubConfig::default();
        apply_overrides_from(&mut config, |_| None).unwrap();
        assert_eq!(config.server.port, HubConfig::default().server.port);
    }

    #[test]
    fn test_bad_value_names_variable() {
        let mut config = HubConfig::default();
        let err = apply_overrides_from(&mut config, lookup(&[("MCP_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("MCP_PORT"));

        let err = apply_overrides_from(
            &mut config,
            lookup(&[("MCP_ALLOWED_AGENT_TYPES", "planning,oracle")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("oracle"));
    }
}
