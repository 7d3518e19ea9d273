//! PRTG table API fetcher.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;

use super::{FetchError, Fetcher};
use crate::db::{Credentials, EndpointDescriptor, PollResult, SensorItem};

const TABLE_PATH: &str = "/api/table.json";
const COLUMNS: &str = "objid,sensor,status,message,lastvalue,priority";

/// Fetches sensors in a Down state from the PRTG table API.
#[derive(Clone)]
pub struct PrtgFetcher {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
}

impl PrtgFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let insecure_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(Self {
            client,
            insecure_client,
        })
    }

    fn request(&self, endpoint: &EndpointDescriptor, timeout: Duration) -> reqwest::RequestBuilder {
        let client = if endpoint.verify_tls {
            &self.client
        } else {
            &self.insecure_client
        };

        let url = format!("{}{}", endpoint.base_url(), TABLE_PATH);
        let request = client.get(url).timeout(timeout).query(&[
            ("content", "sensors"),
            ("columns", COLUMNS),
            ("filter_status", "4"),
            ("filter_status", "5"),
        ]);

        match &endpoint.credentials {
            Credentials::Token(token) => request.query(&[("apitoken", token.as_str())]),
            Credentials::Password { username, password } => request.query(&[
                ("username", username.as_str()),
                ("password", password.as_str()),
            ]),
        }
    }
}

#[async_trait]
impl Fetcher for PrtgFetcher {
    async fn fetch(
        &self,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<PollResult, FetchError> {
        // Errors are stripped of their URL: it carries credentials.
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout(timeout)
            } else {
                FetchError::Network(e.without_url().to_string())
            }
        };

        let response = self.request(endpoint, timeout).send().await.map_err(map_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Protocol {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(map_err)?;
        let items = decode_table(&body)?;

        Ok(PollResult::new(endpoint.alias.clone(), items))
    }
}

#[derive(Deserialize)]
struct TableResponse {
    #[serde(default)]
    sensors: Vec<RawSensor>,
}

#[derive(Deserialize)]
struct RawSensor {
    objid: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    sensor: String,
    #[serde(default, deserialize_with = "lenient_string")]
    status: String,
    #[serde(default)]
    status_raw: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    message: String,
    #[serde(default)]
    message_raw: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    lastvalue: String,
    #[serde(default)]
    priority: Value,
    #[serde(default)]
    priority_raw: Option<i64>,
}

impl From<RawSensor> for SensorItem {
    fn from(raw: RawSensor) -> Self {
        let priority = raw.priority_raw.or_else(|| parse_priority(&raw.priority));
        SensorItem {
            id: raw.objid,
            name: raw.sensor,
            status: raw.status,
            status_code: raw.status_raw,
            message: raw.message_raw.unwrap_or(raw.message),
            last_value: raw.lastvalue,
            priority,
        }
    }
}

/// Decode a table.json body into sensor items.
pub fn decode_table(body: &str) -> Result<Vec<SensorItem>, FetchError> {
    let table: TableResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    Ok(table.sensors.into_iter().map(SensorItem::from).collect())
}

/// PRTG renders priority either as a number or as a run of stars.
fn parse_priority(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let s = s.trim();
            s.parse().ok().or_else(|| {
                let stars = s.chars().filter(|c| *c == '*').count();
                (stars > 0).then_some(stars as i64)
            })
        }
        _ => None,
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}
