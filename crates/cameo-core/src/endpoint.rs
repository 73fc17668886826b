//! Network endpoints (`tcp://host:port`)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

const SCHEME: &str = "tcp";

/// Address of a responder or publisher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same host, different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }

    /// `host:port`, as accepted by socket APIs.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", SCHEME, self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|e| Error::config(format!("invalid endpoint '{s}': {e}")))?;
        if url.scheme() != SCHEME {
            return Err(Error::config(format!(
                "invalid endpoint '{s}': scheme must be '{SCHEME}'"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::config(format!("invalid endpoint '{s}': missing host")))?;
        let port = url
            .port()
            .ok_or_else(|| Error::config(format!("invalid endpoint '{s}': missing port")))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let ep: Endpoint = "tcp://localhost:7000".parse().unwrap();
        assert_eq!(ep.host(), "localhost");
        assert_eq!(ep.port(), 7000);
        assert_eq!(ep.to_string(), "tcp://localhost:7000");
        assert_eq!(ep.socket_addr(), "localhost:7000");
    }

    #[test]
    fn test_parse_rejects_bad_endpoints() {
        assert!("http://localhost:7000".parse::<Endpoint>().is_err());
        assert!("tcp://localhost".parse::<Endpoint>().is_err());
        assert!("localhost:7000".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_with_port() {
        let ep = Endpoint::new("10.0.0.1", 7000).with_port(7001);
        assert_eq!(ep.to_string(), "tcp://10.0.0.1:7001");
    }

    #[test]
    fn test_endpoint_serializes_as_string() {
        let ep = Endpoint::new("localhost", 7000);
        assert_eq!(serde_json::to_string(&ep).unwrap(), "\"tcp://localhost:7000\"");
    }
}
