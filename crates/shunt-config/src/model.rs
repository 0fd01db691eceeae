//! Forwarding-rule data model and YAML document format
//!
//! A document looks like:
//!
//! ```yaml
//! ports:
//!   - name: web
//!     listen: { net: tcp, addr: ":8080" }
//!     connect: { net: tcp, addr: "10.0.0.5:80" }
//! ```
//!
//! `net` defaults to `tcp` and `name` defaults to the canonical listen address.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Transport family used when a document leaves `net` empty
pub const DEFAULT_FAMILY: &str = "tcp";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(String),
}

/// A transport endpoint, e.g. `tcp://127.0.0.1:9000` or `unix:///run/app.sock`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Address {
    /// Transport family (tcp, tcp4, tcp6, unix)
    #[serde(rename = "net", default, skip_serializing_if = "String::is_empty")]
    pub family: String,

    /// Family-specific location (host:port, socket path)
    #[serde(rename = "addr")]
    pub location: String,
}

impl Address {
    pub fn new(family: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            location: location.into(),
        }
    }

    /// Shorthand for a TCP address
    pub fn tcp(location: impl Into<String>) -> Self {
        Self::new(DEFAULT_FAMILY, location)
    }

    /// Canonical `family://location` form, used as the identity of a listen address
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    fn apply_defaults(&mut self) {
        if self.family.is_empty() {
            self.family = DEFAULT_FAMILY.to_string();
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.family, self.location)
    }
}

/// One listen address forwarded to one connect address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    #[serde(default)]
    pub name: String,
    pub listen: Address,
    pub connect: Address,
}

impl ForwardingRule {
    pub fn new(name: impl Into<String>, listen: Address, connect: Address) -> Self {
        let mut rule = Self {
            name: name.into(),
            listen,
            connect,
        };
        rule.apply_defaults();
        rule
    }

    fn apply_defaults(&mut self) {
        self.listen.apply_defaults();
        self.connect.apply_defaults();
        if self.name.is_empty() {
            self.name = self.listen.canonical();
        }
    }
}

/// A complete configuration: an ordered list of forwarding rules
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ports: Vec<ForwardingRule>,
}

impl Config {
    pub fn new(ports: Vec<ForwardingRule>) -> Self {
        let mut config = Self { ports };
        config.apply_defaults();
        config
    }

    /// Parse a YAML document and apply defaults
    pub fn parse(raw: &[u8]) -> Result<Self, ConfigError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let parsed: Option<Config> = serde_yaml::from_slice(raw)?;
        let mut config = parsed.unwrap_or_default();
        config.apply_defaults();
        Ok(config)
    }

    /// Read and parse a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    /// Serialize to a YAML document
    pub fn serialize(&self) -> Result<Vec<u8>, ConfigError> {
        serde_yaml::to_string(self)
            .map(String::into_bytes)
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Fill in `net` and `name` where they were left empty
    pub fn apply_defaults(&mut self) {
        for rule in &mut self.ports {
            rule.apply_defaults();
        }
    }
}
