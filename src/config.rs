use crate::{muted_error, weak_error};
use log::error;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::Path;
use std::time::Duration;

/// Bounded retry with a fixed sleep between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub const fn new(retries: u32, backoff_ms: u64) -> Self {
        Self {
            retries,
            backoff_ms,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Reconnection policy after device reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RebootConfig {
    /// CLR-only restart.
    pub soft: RetryPolicy,
    /// Full power-on restart.
    pub hard: RetryPolicy,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            soft: RetryPolicy::new(20, 100),
            hard: RetryPolicy::new(40, 500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcConfig {
    /// Size of worker pool that serves inbound calls.
    pub workers: usize,
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeployConfig {
    /// Max bytes per write memory command.
    pub chunk_size: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self { chunk_size: 1024 }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Default retry count for requests.
    pub retries: u32,
    /// Default per-retry timeout for requests.
    pub timeout_ms: u64,
    /// Raise [`crate::Error::CommunicationFailure`] instead of returning no reply.
    pub throw_on_communication_failure: bool,
    pub reboot: RebootConfig,
    /// Polling of the device initialize state after reboot.
    pub initialize_state: RetryPolicy,
    pub stop_timeout_ms: u64,
    pub eval_timeout_ms: u64,
    pub rpc: RpcConfig,
    pub deploy: DeployConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout_ms: 500,
            throw_on_communication_failure: false,
            reboot: RebootConfig::default(),
            initialize_state: RetryPolicy::new(20, 250),
            stop_timeout_ms: 5000,
            eval_timeout_ms: 10000,
            rpc: RpcConfig::default(),
            deploy: DeployConfig::default(),
        }
    }
}

impl EngineConfig {
    const DEFAULT_PATH: &'static str = ".config/mfdbg/config.toml";

    pub fn parse(data: &str) -> Result<Self, crate::Error> {
        Ok(toml::de::from_str(data)?)
    }

    /// Load config from file, if `path` is `None` then default location is used.
    /// Defaults are returned when file is missing or malformed.
    pub fn load(path: Option<&Path>) -> Self {
        let data = match path {
            None => {
                let Some(home) = home::home_dir() else {
                    return Self::default();
                };
                match muted_error!(read_to_string(home.join(Self::DEFAULT_PATH))) {
                    Some(data) => data,
                    None => return Self::default(),
                }
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    error!("Error while load config file: {err}");
                    return Self::default();
                }
            },
        };

        weak_error!(Self::parse(&data), "config:").unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.eval_timeout_ms)
    }
}
