//! Broker address parsing.

use std::fmt;

use url::Url;

use crate::error::{Result, TransportError};

/// A parsed broker URI such as `tcp://10.0.0.5:61616`.
///
/// The scheme is kept for diagnostics only; transports decide how to interpret
/// it. The host must be present and non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    uri: String,
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl BrokerAddress {
    /// Parse a broker URI of the form `scheme://host[:port][/...]`.
    pub fn parse(input: &str) -> Result<Self> {
        let uri = input.trim();
        let url = Url::parse(uri)
            .map_err(|e| TransportError::InvalidAddress(format!("{uri}: {e}")))?;

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidAddress(format!("{uri}: missing host")))?;

        Ok(Self {
            uri: uri.to_string(),
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port: url.port(),
        })
    }

    /// The address exactly as configured (trimmed).
    pub fn as_str(&self) -> &str {
        &self.uri
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The explicit port, if the URI carried one.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The explicit port, or `default` when the URI omitted it.
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl std::str::FromStr for BrokerAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
