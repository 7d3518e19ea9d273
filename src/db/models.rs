//! Data model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// URL scheme used to reach a monitoring server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// How a poll authenticates against the monitoring server.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Token(String),
    Password { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Token(<redacted>)"),
            Credentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// One configured monitoring server. Immutable once built from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Unique name of the endpoint, taken from its configuration section.
    pub alias: String,
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    pub credentials: Credentials,
    pub verify_tls: bool,
    /// Always non-zero.
    pub interval: Duration,
}

impl EndpointDescriptor {
    /// Base URL of the server, without path or credentials.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// A single sensor row returned by a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorItem {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub status_code: Option<i64>,
    pub message: String,
    pub last_value: String,
    pub priority: Option<i64>,
}

/// The outcome of one successful fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResult {
    pub alias: String,
    pub items: Vec<SensorItem>,
    pub captured_at: DateTime<Utc>,
}

impl PollResult {
    pub fn new(alias: impl Into<String>, items: Vec<SensorItem>) -> Self {
        Self {
            alias: alias.into(),
            items,
            captured_at: Utc::now(),
        }
    }
}

/// A stored sensor row as read back from the replace-set table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReading {
    pub alias: String,
    pub item: SensorItem,
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let token = Credentials::Token("s3cr3t".to_string());
        assert!(!format!("{:?}", token).contains("s3cr3t"));

        let password = Credentials::Password {
            username: "prtgadmin".to_string(),
            password: "hunter2".to_string(),
        };
        let out = format!("{:?}", password);
        assert!(out.contains("prtgadmin"));
        assert!(!out.contains("hunter2"));
    }

    #[test]
    fn test_base_url() {
        let desc = EndpointDescriptor {
            alias: "alpha".to_string(),
            host: "10.0.0.5".to_string(),
            port: 8443,
            scheme: Scheme::Https,
            credentials: Credentials::Token("t".to_string()),
            verify_tls: true,
            interval: Duration::from_secs(60),
        };
        assert_eq!(desc.base_url(), "https://10.0.0.5:8443");
    }
}
