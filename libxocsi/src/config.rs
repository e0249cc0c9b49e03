//! Driver configuration.
//!
//! The configuration is a YAML document, typically mounted from a secret:
//!
//! ```yaml
//! driver_name: csi.xenorchestra.vates.tech
//! listen: 0.0.0.0:10000
//! tls:
//!   cert: /etc/xocsi/tls.crt
//!   key: /etc/xocsi/tls.key
//! xo:
//!   url: https://xo.example.org
//!   token: <authentication token>
//!   insecure: false
//! attach_poll:
//!   interval_secs: 1
//!   timeout_secs: 120
//! ```
//!
//! Environment variables override the file:
//! - `XOCSI_XO_URL`: Xen Orchestra base URL.
//! - `XOCSI_XO_TOKEN`: Xen Orchestra authentication token.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::xo::AttachPoll;

/// Default plugin name reported by `GetPluginInfo`.
pub const DEFAULT_DRIVER_NAME: &str = "csi.xenorchestra.vates.tech";

pub const ENV_XO_URL: &str = "XOCSI_XO_URL";
pub const ENV_XO_TOKEN: &str = "XOCSI_XO_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Connection settings for Xen Orchestra.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct XoConfig {
    /// Base URL, e.g. `https://xo.example.org`.
    #[serde(default)]
    pub url: String,
    /// Authentication token.
    #[serde(default)]
    pub token: String,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for XoConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            insecure: false,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Certificate and key for the QUIC listener.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Top-level plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_driver_name")]
    pub driver_name: String,
    /// VM UUID of this node. Read from DMI when unset.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub xo: XoConfig,
    #[serde(default)]
    pub attach_poll: AttachPoll,
    /// Reported by `NodeGetInfo`; `0` means no limit.
    #[serde(default)]
    pub max_volumes_per_node: u64,
    #[serde(default = "default_dmi_path")]
    pub dmi_product_uuid_path: PathBuf,
}

fn default_driver_name() -> String {
    DEFAULT_DRIVER_NAME.to_owned()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 10000))
}

fn default_dmi_path() -> PathBuf {
    PathBuf::from("/sys/class/dmi/id/product_uuid")
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: default_driver_name(),
            node_id: None,
            listen: default_listen(),
            tls: TlsConfig::default(),
            xo: XoConfig::default(),
            attach_poll: AttachPoll::default(),
            max_volumes_per_node: 0,
            dmi_product_uuid_path: default_dmi_path(),
        }
    }
}

impl DriverConfig {
    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::from_yaml(&raw)?;
        cfg.apply_overrides(|k| std::env::var(k).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `XOCSI_*` overrides, looking each key up with `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_XO_URL).filter(|v| !v.is_empty()) {
            self.xo.url = url;
        }
        if let Some(token) = lookup(ENV_XO_TOKEN).filter(|v| !v.is_empty()) {
            self.xo.token = token;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver_name.is_empty() {
            return Err(ConfigError::Missing("driver_name"));
        }
        if self.xo.url.is_empty() {
            return Err(ConfigError::Missing("xo.url"));
        }
        if self.xo.token.is_empty() {
            return Err(ConfigError::Missing("xo.token"));
        }

        let poll = &self.attach_poll;
        if poll.interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "attach_poll.interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        if poll.timeout < poll.interval {
            return Err(ConfigError::Invalid {
                field: "attach_poll.timeout_secs",
                reason: format!(
                    "{}s is shorter than the poll interval of {}s",
                    poll.timeout.as_secs(),
                    poll.interval.as_secs()
                ),
            });
        }
        Ok(())
    }
}
