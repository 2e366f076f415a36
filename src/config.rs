//! Endpoint configuration.
//!
//! Settings are read from TOML with camelCase keys. Every key is optional:
//!
//! ```toml
//! callTimeoutMs = 10000
//!
//! [peer]
//! terminateGraceMs = 2000
//! stderr = "log"   # or "inherit", "discard"
//! ```

pub mod user;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Default deadline for an outbound call.
///
/// Always non-zero. Serialized as whole milliseconds. A call that should wait
/// indefinitely opts out per call instead of configuring a zero timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct CallTimeout(Duration);

impl CallTimeout {
    /// Default timeout: 10 seconds
    const DEFAULT_SECS: u64 = 10;

    const ZERO_REJECTED: &'static str = "call timeout must be greater than zero";

    /// Create a new CallTimeout, rejecting a zero duration.
    pub fn new(duration: Duration) -> BridgeResult<Self> {
        if duration.is_zero() {
            return Err(BridgeError::config(Self::ZERO_REJECTED));
        }
        Ok(Self(duration))
    }

    pub fn from_millis(millis: u64) -> BridgeResult<Self> {
        Self::new(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for CallTimeout {
    fn default() -> Self {
        Self(Duration::from_secs(Self::DEFAULT_SECS))
    }
}

impl TryFrom<u64> for CallTimeout {
    type Error = String;

    fn try_from(millis: u64) -> Result<Self, Self::Error> {
        if millis == 0 {
            return Err(Self::ZERO_REJECTED.to_string());
        }
        Ok(Self(Duration::from_millis(millis)))
    }
}

impl From<CallTimeout> for u64 {
    fn from(timeout: CallTimeout) -> Self {
        u64::try_from(timeout.0.as_millis()).unwrap_or(u64::MAX)
    }
}

/// What happens to the peer process's stderr in connect mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Forward each line to the `crosspulse::peer_stderr` log target
    #[default]
    Log,
    /// Share this process's stderr
    Inherit,
    /// Send to the null device
    Discard,
}

/// Settings for the spawned peer in connect mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PeerSettings {
    /// How long to wait after SIGTERM before killing the peer.
    pub terminate_grace_ms: u64,
    pub stderr: StderrMode,
}

impl PeerSettings {
    const DEFAULT_TERMINATE_GRACE_MS: u64 = 2000;

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            terminate_grace_ms: Self::DEFAULT_TERMINATE_GRACE_MS,
            stderr: StderrMode::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct EndpointConfig {
    #[serde(rename = "callTimeoutMs")]
    pub call_timeout: CallTimeout,
    pub peer: PeerSettings,
}

impl EndpointConfig {
    pub fn from_toml_str(content: &str) -> BridgeResult<Self> {
        toml::from_str(content).map_err(|e| BridgeError::config(e.to_string()))
    }

    pub fn load(path: &Path) -> BridgeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            BridgeError::Config { message } => {
                BridgeError::config(format!("{}: {}", path.display(), message))
            }
            other => other,
        })
    }

    /// Load the user config file if one exists, otherwise use defaults.
    pub fn discover() -> BridgeResult<Self> {
        match user::user_config_path() {
            Some(path) if path.is_file() => {
                log::debug!(
                    target: "crosspulse::config",
                    "Loading user config from {}",
                    path.display()
                );
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> BridgeResult<Self> {
        self.call_timeout = CallTimeout::new(timeout)?;
        Ok(self)
    }
}
