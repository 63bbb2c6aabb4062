use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::envelope::{parse_offset, DEFAULT_OFFSET};
use crate::{BusError, Result};

const DEFAULT_CLIENT_ID: &str = "market-rest";
const DEFAULT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_DISPATCH_CAPACITY: usize = 1024;

/// Broker and correlation settings for one bridge instance.
///
/// The reply topic is always explicit: it is never derived from the client id,
/// and it must differ from the command topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Broker addresses (`host:port`)
    pub brokers: Vec<String>,
    /// Consumer group of the reply subscriber, for brokers with group
    /// semantics. The MQTT transport has none and ignores it.
    pub group_id: String,
    /// Client identity; also the default `sourceId` of outbound envelopes
    pub client_id: String,
    /// Topic every command is published to
    pub command_topic: String,
    /// Topic this instance consumes replies from
    pub reply_topic: String,
    pub default_timeout_ms: u64,
    /// Offset used to stamp envelope timestamps, e.g. `+07:00`
    pub timestamp_offset: String,
    /// Queue depth between the transport and the dispatch loop
    pub dispatch_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            group_id: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            command_topic: String::new(),
            reply_topic: String::new(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            timestamp_offset: DEFAULT_OFFSET.to_string(),
            dispatch_capacity: DEFAULT_DISPATCH_CAPACITY,
        }
    }
}

/// Partial configuration as written in a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BridgeToml {
    brokers: Option<Vec<String>>,
    group_id: Option<String>,
    client_id: Option<String>,
    command_topic: Option<String>,
    reply_topic: Option<String>,
    default_timeout_ms: Option<u64>,
    timestamp_offset: Option<String>,
    dispatch_capacity: Option<usize>,
}

impl BridgeToml {
    fn overlay(self, mut base: BridgeConfig) -> BridgeConfig {
        if let Some(v) = self.brokers {
            base.brokers = v;
        }
        if let Some(v) = self.group_id {
            base.group_id = v;
        }
        if let Some(v) = self.client_id {
            base.client_id = v;
        }
        if let Some(v) = self.command_topic {
            base.command_topic = v;
        }
        if let Some(v) = self.reply_topic {
            base.reply_topic = v;
        }
        if let Some(v) = self.default_timeout_ms {
            base.default_timeout_ms = v;
        }
        if let Some(v) = self.timestamp_offset {
            base.timestamp_offset = v;
        }
        if let Some(v) = self.dispatch_capacity {
            base.dispatch_capacity = v;
        }
        base
    }
}

impl BridgeConfig {
    /// Loads defaults, then the TOML file named by `MARKET_BUS_CONFIG`
    /// (default `./market_bus.toml`, skipped when absent), then environment
    /// variables, and validates the result.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("MARKET_BUS_CONFIG").unwrap_or_else(|_| "market_bus.toml".into());
        let base = if Path::new(&path).exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| BusError::Config(format!("failed to read {path}: {e}")))?;
            Self::from_toml_str(&raw)?
        } else {
            tracing::info!(target: "config", path = %path, "No TOML config found; using defaults/env");
            Self::default()
        };
        let config = base.with_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document over the defaults. Does not validate.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let parsed: BridgeToml =
            toml::from_str(raw).map_err(|e| BusError::Config(format!("invalid TOML: {e}")))?;
        Ok(parsed.overlay(Self::default()))
    }

    /// Applies `BROKER_URLS`, `BROKER_GROUP_ID`, `BROKER_CLIENT_ID`,
    /// `COMMAND_TOPIC`, `REPLY_TOPIC`, `REQUEST_TIMEOUT_MS`,
    /// `TIMESTAMP_OFFSET` and `DISPATCH_CAPACITY` as read through `lookup`.
    /// Empty values are ignored.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(urls) = get("BROKER_URLS") {
            self.brokers = urls
                .split(',')
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
        }
        if let Some(v) = get("BROKER_GROUP_ID") {
            self.group_id = v;
        }
        if let Some(v) = get("BROKER_CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = get("COMMAND_TOPIC") {
            self.command_topic = v;
        }
        if let Some(v) = get("REPLY_TOPIC") {
            self.reply_topic = v;
        }
        if let Some(v) = get("REQUEST_TIMEOUT_MS") {
            self.default_timeout_ms = v.trim().parse().map_err(|_| {
                BusError::Config(format!("REQUEST_TIMEOUT_MS is not a number: {v}"))
            })?;
        }
        if let Some(v) = get("TIMESTAMP_OFFSET") {
            self.timestamp_offset = v;
        }
        if let Some(v) = get("DISPATCH_CAPACITY") {
            self.dispatch_capacity = v.trim().parse().map_err(|_| {
                BusError::Config(format!("DISPATCH_CAPACITY is not a number: {v}"))
            })?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(BusError::Config("at least one broker address is required".into()));
        }
        if self.group_id.trim().is_empty() {
            return Err(BusError::Config("consumer group id is required".into()));
        }
        if self.client_id.trim().is_empty() {
            return Err(BusError::Config("client id is required".into()));
        }
        if self.command_topic.trim().is_empty() {
            return Err(BusError::Config("command topic is required".into()));
        }
        if self.reply_topic.trim().is_empty() {
            return Err(BusError::Config("reply topic is required".into()));
        }
        if self.reply_topic == self.command_topic {
            return Err(BusError::Config(format!(
                "reply topic must differ from command topic ({})",
                self.command_topic
            )));
        }
        if self.default_timeout_ms == 0 {
            return Err(BusError::Config("default timeout must be greater than 0".into()));
        }
        if self.dispatch_capacity == 0 {
            return Err(BusError::Config("dispatch capacity must be greater than 0".into()));
        }
        self.offset()?;
        Ok(())
    }

    pub fn offset(&self) -> Result<FixedOffset> {
        parse_offset(&self.timestamp_offset).ok_or_else(|| {
            BusError::Config(format!("invalid timestamp offset: {}", self.timestamp_offset))
        })
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> BridgeConfig {
        BridgeConfig {
            brokers: vec!["localhost:9092".into()],
            group_id: "market-rest-group".into(),
            command_topic: "market.commands".into(),
            reply_topic: "market.replies.rest-1".into(),
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn defaults_match_deployment_conventions() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.client_id, "market-rest");
        assert_eq!(cfg.default_timeout_ms, 15_000);
        assert_eq!(cfg.timestamp_offset, "+07:00");
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn env_overrides_are_applied() {
        let env: HashMap<&str, &str> = [
            ("BROKER_URLS", "a:9092, b:9092 ,"),
            ("BROKER_GROUP_ID", "g1"),
            ("COMMAND_TOPIC", "cmds"),
            ("REPLY_TOPIC", "replies"),
            ("REQUEST_TIMEOUT_MS", "2500"),
            ("TIMESTAMP_OFFSET", "+00:00"),
            ("BROKER_CLIENT_ID", ""),
        ]
        .into_iter()
        .collect();
        let cfg = BridgeConfig::default()
            .with_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.brokers, vec!["a:9092".to_string(), "b:9092".to_string()]);
        assert_eq!(cfg.group_id, "g1");
        assert_eq!(cfg.client_id, "market-rest", "empty value keeps default");
        assert_eq!(cfg.default_timeout(), Duration::from_millis(2500));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_timeout_env_is_an_error() {
        let res = BridgeConfig::default().with_env_overrides(|k| {
            (k == "REQUEST_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(matches!(res, Err(BusError::Config(_))));
    }

    #[test]
    fn reply_topic_must_be_explicit_and_distinct() {
        let mut cfg = valid();
        cfg.reply_topic = String::new();
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.reply_topic = cfg.command_topic.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_offset_and_zero_timeout_are_rejected() {
        let mut cfg = valid();
        cfg.timestamp_offset = "UTC+7".into();
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.default_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_overlays_defaults() {
        let cfg = BridgeConfig::from_toml_str(
            r#"
            brokers = ["kafka-1:9092"]
            group_id = "rest"
            command_topic = "commands"
            reply_topic = "replies"
            default_timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.brokers, vec!["kafka-1:9092".to_string()]);
        assert_eq!(cfg.default_timeout_ms, 5000);
        assert_eq!(cfg.client_id, "market-rest");
        assert!(cfg.validate().is_ok());

        assert!(BridgeConfig::from_toml_str("unknown_key = 1").is_err());
    }
}
