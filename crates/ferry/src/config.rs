use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::FerryError;
use crate::protocol::BUFFER_HIGH_WATER_MARK;

pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];
pub const DEFAULT_CANDIDATE_POOL_SIZE: u8 = 10;
pub const DEFAULT_BACKPRESSURE_POLL_MS: u64 = 100;

const ENV_ICE_SERVERS: &str = "FERRY_ICE_SERVERS";
const ENV_CANDIDATE_POOL_SIZE: &str = "FERRY_ICE_CANDIDATE_POOL_SIZE";
const ENV_AUTO_REPLY: &str = "FERRY_AUTO_REPLY";
const ENV_BACKPRESSURE_POLL_MS: &str = "FERRY_BACKPRESSURE_POLL_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }
}

/// Peer transport settings. Only honoured for calls started after they are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServer::new(DEFAULT_STUN_URLS)],
            candidate_pool_size: DEFAULT_CANDIDATE_POOL_SIZE,
        }
    }
}

/// Sender-side pacing for file channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes allowed to sit in the channel's outbound buffer before the
    /// sender stops handing it chunks.
    pub high_water_mark: usize,
    /// Re-check interval while the buffer is above the mark.
    pub poll_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            high_water_mark: BUFFER_HIGH_WATER_MARK,
            poll_interval_ms: DEFAULT_BACKPRESSURE_POLL_MS,
        }
    }
}

impl TransferConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub ice: IceConfig,
    /// Answer incoming offers without asking the collaborator first.
    pub auto_reply: bool,
    pub transfer: TransferConfig,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            ice: IceConfig::default(),
            auto_reply: true,
            transfer: TransferConfig::default(),
        }
    }
}

impl FerryConfig {
    /// Defaults overridden by `FERRY_*` environment variables. Unparseable
    /// values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var(ENV_ICE_SERVERS) {
            let urls: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
            // An explicitly empty list means host candidates only.
            config.ice.servers = if urls.is_empty() {
                Vec::new()
            } else {
                vec![IceServer::new(urls)]
            };
        }
        config.ice.candidate_pool_size =
            parse_env(ENV_CANDIDATE_POOL_SIZE, config.ice.candidate_pool_size);
        config.auto_reply = parse_bool_env(ENV_AUTO_REPLY, config.auto_reply);
        config.transfer.poll_interval_ms =
            parse_env(ENV_BACKPRESSURE_POLL_MS, config.transfer.poll_interval_ms);
        config
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, FerryError> {
        toml::from_str(raw).map_err(|err| FerryError::Config(err.to_string()))
    }
}

fn parse_env<T>(var: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(value) => match value.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    target = "ferry::config",
                    var,
                    value = %value,
                    error = %err,
                    default = ?default,
                    "failed to parse config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_bool_env(var: &str, default: bool) -> bool {
    match env::var(var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!(
                    target = "ferry::config",
                    var,
                    value = other,
                    default,
                    "unrecognised boolean in env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment is process-global; keep env tests from interleaving.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn clear_env() {
        unsafe {
            env::remove_var(ENV_ICE_SERVERS);
            env::remove_var(ENV_CANDIDATE_POOL_SIZE);
            env::remove_var(ENV_AUTO_REPLY);
            env::remove_var(ENV_BACKPRESSURE_POLL_MS);
        }
    }

    #[test]
    fn defaults_use_public_stun_pair() {
        let config = FerryConfig::default();
        assert_eq!(config.ice.servers.len(), 1);
        assert_eq!(config.ice.servers[0].urls, DEFAULT_STUN_URLS.to_vec());
        assert_eq!(config.ice.candidate_pool_size, 10);
        assert!(config.auto_reply);
        assert_eq!(config.transfer.high_water_mark, 65_536);
    }

    #[test]
    fn env_overrides_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(ENV_ICE_SERVERS, "stun:a.example:3478, turn:b.example:3478");
            env::set_var(ENV_CANDIDATE_POOL_SIZE, "4");
            env::set_var(ENV_AUTO_REPLY, "off");
            env::set_var(ENV_BACKPRESSURE_POLL_MS, "25");
        }
        let config = FerryConfig::from_env();
        clear_env();

        assert_eq!(
            config.ice.servers,
            vec![IceServer::new(["stun:a.example:3478", "turn:b.example:3478"])]
        );
        assert_eq!(config.ice.candidate_pool_size, 4);
        assert!(!config.auto_reply);
        assert_eq!(config.transfer.poll_interval(), Duration::from_millis(25));
    }

    #[test]
    fn invalid_env_values_fall_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(ENV_CANDIDATE_POOL_SIZE, "lots");
            env::set_var(ENV_AUTO_REPLY, "maybe");
        }
        let config = FerryConfig::from_env();
        clear_env();

        assert_eq!(config.ice.candidate_pool_size, DEFAULT_CANDIDATE_POOL_SIZE);
        assert!(config.auto_reply);
    }

    #[test]
    fn toml_fills_missing_sections_with_defaults() {
        let config = FerryConfig::from_toml_str(
            r#"
            auto_reply = false

            [[ice.servers]]
            urls = ["turn:relay.example:3478"]
            username = "ferry"
            credential = "secret"
            "#,
        )
        .expect("parse toml");

        assert!(!config.auto_reply);
        assert_eq!(
            config.ice.servers,
            vec![IceServer::new(["turn:relay.example:3478"]).with_credentials("ferry", "secret")]
        );
        assert_eq!(config.ice.candidate_pool_size, DEFAULT_CANDIDATE_POOL_SIZE);
        assert_eq!(config.transfer, TransferConfig::default());
    }

    #[test]
    fn toml_errors_surface_as_config_errors() {
        let err = FerryConfig::from_toml_str("auto_reply = \"sometimes\"").unwrap_err();
        assert!(matches!(err, FerryError::Config(_)));
    }
}
