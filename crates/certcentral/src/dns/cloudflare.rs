//! Cloudflare DNS driver.
//!
//! Talks to the v4 REST API with a zone-scoped API token
//! (Zone:Read + DNS:Edit). Zone ids are looked up by name on every call;
//! challenge records are short-lived, so a cache buys nothing.

use std::collections::BTreeMap;

use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{DnsDriver, DnsError};

const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

#[derive(Debug)]
pub struct CloudflareDriver {
    http: HttpClient,
    api_token: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    #[serde(default)]
    name_servers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Record {
    id: String,
}

impl CloudflareDriver {
    pub fn new(credentials: &BTreeMap<String, String>) -> Result<Self, DnsError> {
        let api_token = credentials
            .get("api_token")
            .cloned()
            .ok_or_else(|| DnsError::Credentials("cloudflare driver needs api_token".into()))?;
        let api_base = credentials
            .get("api_base")
            .cloned()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let http = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| DnsError::Driver(format!("http client: {e}")))?;
        Ok(Self {
            http,
            api_token,
            api_base,
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, DnsError> {
        let resp = request
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| DnsError::Driver(format!("cloudflare request: {e}")))?;
        let status = resp.status();
        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| DnsError::Driver(format!("cloudflare response (HTTP {status}): {e}")))?;
        if !envelope.success {
            let detail = envelope
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DnsError::Driver(format!("cloudflare API: {detail}")));
        }
        envelope
            .result
            .ok_or_else(|| DnsError::Driver("cloudflare API returned no result".into()))
    }

    async fn zone(&self, zone: &str) -> Result<Zone, DnsError> {
        let url = format!("{}/zones?name={zone}", self.api_base);
        let zones: Vec<Zone> = self.call(self.http.get(&url)).await?;
        zones
            .into_iter()
            .next()
            .ok_or_else(|| DnsError::Driver(format!("zone {zone} not found in cloudflare account")))
    }
}

#[async_trait::async_trait]
impl DnsDriver for CloudflareDriver {
    async fn add_txt(
        &self,
        zone: &str,
        rrname: &str,
        value: &str,
        ttl: u32,
    ) -> Result<(), DnsError> {
        let zone_obj = self.zone(zone).await?;
        let url = format!("{}/zones/{}/dns_records", self.api_base, zone_obj.id);
        let body = serde_json::json!({
            "type": "TXT",
            "name": rrname,
            "content": value,
            "ttl": ttl,
        });
        let record: Record = self.call(self.http.post(&url).json(&body)).await?;
        debug!(zone, rrname, record = %record.id, "TXT record created");
        Ok(())
    }

    async fn remove_txt(&self, zone: &str, rrname: &str, value: &str) -> Result<(), DnsError> {
        let zone_obj = self.zone(zone).await?;
        let url = format!(
            "{}/zones/{}/dns_records?type=TXT&name={rrname}&content={value}",
            self.api_base, zone_obj.id
        );
        let records: Vec<Record> = self.call(self.http.get(&url)).await?;
        if records.is_empty() {
            warn!(zone, rrname, "no TXT record to remove");
            return Ok(());
        }
        for record in records {
            let url = format!(
                "{}/zones/{}/dns_records/{}",
                self.api_base, zone_obj.id, record.id
            );
            let _: Record = self.call(self.http.delete(&url)).await?;
            debug!(zone, rrname, record = %record.id, "TXT record removed");
        }
        Ok(())
    }

    async fn list_ns(&self, zone: &str) -> Result<Vec<String>, DnsError> {
        let zone_obj = self.zone(zone).await?;
        Ok(zone_obj.name_servers)
    }
}
