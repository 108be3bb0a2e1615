//! The ACME protocol client proper.
//!
//! One client per account. All requests funnel through [`AcmeClient::post`],
//! which owns nonce handling (lazy fetch, Replay-Nonce refresh, one
//! transparent retry on `badNonce`), bounded retry with backoff on 5xx and
//! transport faults, and problem-document classification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER};
use reqwest::{Client as HttpClient, Response};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::crypto::{jws, AccountKey};

use super::types::{Authorization, AuthorizationStatus, Challenge, Directory, Order, OrderStatus, Problem};
use super::{AcmeError, NonceCache};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const JOSE_CONTENT_TYPE: &str = "application/jose+json";

/// Bounded in-call retries for 5xx and transport faults.
const MAX_SERVER_RETRIES: u32 = 3;

/// Polling starts here and doubles per attempt.
const POLL_INITIAL: Duration = Duration::from_secs(1);
const POLL_CAP: Duration = Duration::from_secs(30);

/// The protocol surface the scheduler drives.
///
/// Implemented by [`AcmeClient`] for real authorities and by in-memory
/// fakes in the scenario tests.
#[async_trait]
pub trait AcmeApi: Send + Sync {
    /// `token || '.' || thumbprint(account key)`.
    fn key_authorization(&self, token: &str) -> String;

    /// Create an order for the SAN set; returns the order URL and body.
    async fn new_order(&self, sans: &[String]) -> Result<(String, Order), AcmeError>;

    async fn get_authorization(&self, url: &str) -> Result<Authorization, AcmeError>;

    /// Tell the server the challenge is ready to be validated.
    async fn respond_to_challenge(&self, url: &str) -> Result<Challenge, AcmeError>;

    /// Poll until the authorization is terminal or `deadline` passes.
    async fn poll_authorization(
        &self,
        url: &str,
        deadline: Instant,
    ) -> Result<AuthorizationStatus, AcmeError>;

    async fn finalize_order(&self, finalize_url: &str, csr_der: &[u8])
        -> Result<Order, AcmeError>;

    /// Poll until the order is `valid` or `invalid`, or `deadline` passes.
    async fn poll_order(&self, order_url: &str, deadline: Instant) -> Result<Order, AcmeError>;

    /// One-shot order fetch, used when resuming an interrupted order.
    async fn fetch_order(&self, order_url: &str) -> Result<Order, AcmeError>;

    async fn download_certificate(&self, certificate_url: &str) -> Result<String, AcmeError>;

    /// Administrative revocation; not on the renewal happy path.
    async fn revoke(&self, cert_der: &[u8], reason: u8) -> Result<(), AcmeError>;
}

/// Headers the caller may need alongside a response body.
struct ResponseMeta {
    location: Option<String>,
    retry_after: Option<Duration>,
}

impl ResponseMeta {
    fn from_response(resp: &Response) -> Self {
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        Self {
            location,
            retry_after,
        }
    }
}

/// RFC 8555 client bound to one account.
pub struct AcmeClient {
    http: HttpClient,
    key: Arc<AccountKey>,
    directory: Directory,
    /// Account URL assigned at registration; the `kid` of every
    /// authenticated request.
    kid: String,
    nonces: NonceCache,
}

impl AcmeClient {
    /// Fetch a directory object.
    pub async fn load_directory(
        http: &HttpClient,
        directory_url: &str,
    ) -> Result<Directory, AcmeError> {
        let resp = http.get(directory_url).send().await?;
        if !resp.status().is_success() {
            return Err(AcmeError::InvalidResponse(format!(
                "directory fetch returned HTTP {}",
                resp.status()
            )));
        }
        let directory: Directory = resp
            .json()
            .await
            .map_err(|e| AcmeError::InvalidResponse(format!("directory body: {e}")))?;
        trace!(new_order = %directory.new_order, "ACME directory loaded");
        Ok(directory)
    }

    /// Resolve the directory and register (or recover) the account for
    /// `key`. `newAccount` is idempotent on the server side: a key the CA
    /// already knows comes back with the existing account URL.
    pub async fn connect(
        directory_url: &str,
        key: Arc<AccountKey>,
        contact: &[String],
    ) -> Result<Self, AcmeError> {
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(AcmeError::Transport)?;
        let directory = Self::load_directory(&http, directory_url).await?;

        let mut client = Self {
            http,
            key,
            directory,
            kid: String::new(),
            nonces: NonceCache::new(),
        };

        let payload = serde_json::json!({
            "termsOfServiceAgreed": true,
            "contact": contact,
        })
        .to_string();

        let (resp, meta) = client
            .post(&client.directory.new_account.clone(), &payload, true)
            .await?;
        let created = resp.status() == reqwest::StatusCode::CREATED;
        let account_url = meta.location.ok_or_else(|| {
            AcmeError::InvalidResponse("newAccount response lacks Location".into())
        })?;

        info!(
            account = %account_url,
            created,
            "ACME account ready"
        );
        client.kid = account_url;
        Ok(client)
    }

    pub fn account_url(&self) -> &str {
        &self.kid
    }

    /// Fetch a fresh anti-replay nonce from `newNonce`.
    async fn fetch_nonce(&self) -> Result<String, AcmeError> {
        let resp = self.http.head(&self.directory.new_nonce).send().await?;
        nonce_of(&resp)
            .ok_or_else(|| AcmeError::InvalidResponse("newNonce response lacks Replay-Nonce".into()))
    }

    /// Signed POST with the full retry policy. An empty payload is
    /// POST-as-GET.
    async fn post(
        &self,
        url: &str,
        payload: &str,
        use_jwk: bool,
    ) -> Result<(Response, ResponseMeta), AcmeError> {
        let mut bad_nonce_retried = false;
        let mut server_retries = 0u32;

        loop {
            let nonce = match self.nonces.take() {
                Some(nonce) => nonce,
                None => self.fetch_nonce().await?,
            };
            let kid = (!use_jwk).then_some(self.kid.as_str());
            let body = jws::sign_flattened(&self.key, url, &nonce, kid, payload)?;

            let resp = match self
                .http
                .post(url)
                .header(CONTENT_TYPE, JOSE_CONTENT_TYPE)
                .body(body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) if server_retries < MAX_SERVER_RETRIES => {
                    server_retries += 1;
                    let wait = retry_backoff(server_retries);
                    warn!(url, error = %err, retry_in = ?wait, "ACME transport fault, retrying");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if let Some(nonce) = nonce_of(&resp) {
                self.nonces.store(nonce);
            }

            let status = resp.status();
            let meta = ResponseMeta::from_response(&resp);
            if status.is_success() {
                return Ok((resp, meta));
            }

            let retry_after = meta.retry_after;
            let mut problem: Problem = resp.json().await.unwrap_or_default();
            if problem.status.is_none() {
                problem.status = Some(status.as_u16());
            }

            match problem.into_error(retry_after) {
                AcmeError::BadNonce if !bad_nonce_retried => {
                    bad_nonce_retried = true;
                    debug!(url, "badNonce from server, retrying with fresh nonce");
                    continue;
                }
                AcmeError::ServerInternal(detail) if server_retries < MAX_SERVER_RETRIES => {
                    server_retries += 1;
                    let wait = retry_backoff(server_retries);
                    warn!(url, detail = %detail, retry_in = ?wait, "ACME server error, retrying");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                err => return Err(err),
            }
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        payload: &str,
    ) -> Result<(T, ResponseMeta), AcmeError> {
        let (resp, meta) = self.post(url, payload, false).await?;
        let value = resp
            .json()
            .await
            .map_err(|e| AcmeError::InvalidResponse(format!("{url}: {e}")))?;
        Ok((value, meta))
    }

    /// Administrative account key rotation (RFC 8555 §7.3.5). Never called
    /// automatically.
    pub async fn key_change(&self, new_key: &AccountKey) -> Result<(), AcmeError> {
        let url = self
            .directory
            .key_change
            .clone()
            .ok_or_else(|| AcmeError::Malformed("server does not advertise keyChange".into()))?;
        let inner = jws::sign_key_change_inner(new_key, &self.key, &self.kid, &url)?;
        self.post(&url, &inner, false).await?;
        info!(account = %self.kid, "account key rotated");
        Ok(())
    }
}

#[async_trait]
impl AcmeApi for AcmeClient {
    fn key_authorization(&self, token: &str) -> String {
        self.key.key_authorization(token)
    }

    async fn new_order(&self, sans: &[String]) -> Result<(String, Order), AcmeError> {
        let identifiers: Vec<serde_json::Value> = sans
            .iter()
            .map(|san| serde_json::json!({"type": "dns", "value": san}))
            .collect();
        let payload = serde_json::json!({ "identifiers": identifiers }).to_string();

        let (order, meta): (Order, _) = self
            .post_json(&self.directory.new_order.clone(), &payload)
            .await?;
        let order_url = meta
            .location
            .ok_or_else(|| AcmeError::InvalidResponse("newOrder response lacks Location".into()))?;

        debug!(
            order = %order_url,
            authorizations = order.authorizations.len(),
            "order created"
        );
        Ok((order_url, order))
    }

    async fn get_authorization(&self, url: &str) -> Result<Authorization, AcmeError> {
        let (authz, _) = self.post_json(url, "").await?;
        Ok(authz)
    }

    async fn respond_to_challenge(&self, url: &str) -> Result<Challenge, AcmeError> {
        let (challenge, _) = self.post_json(url, "{}").await?;
        Ok(challenge)
    }

    async fn poll_authorization(
        &self,
        url: &str,
        deadline: Instant,
    ) -> Result<AuthorizationStatus, AcmeError> {
        let mut interval = POLL_INITIAL;
        loop {
            let (authz, meta): (Authorization, _) = self.post_json(url, "").await?;
            if authz.status.is_terminal() {
                return Ok(authz.status);
            }

            let wait = meta.retry_after.unwrap_or(interval);
            if Instant::now() + wait >= deadline {
                return Err(AcmeError::Timeout {
                    operation: "authorization poll",
                });
            }
            tokio::time::sleep(wait).await;
            interval = next_interval(interval);
        }
    }

    async fn finalize_order(
        &self,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<Order, AcmeError> {
        let payload =
            serde_json::json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) }).to_string();
        let (order, _) = self.post_json(finalize_url, &payload).await?;
        Ok(order)
    }

    async fn poll_order(&self, order_url: &str, deadline: Instant) -> Result<Order, AcmeError> {
        let mut interval = POLL_INITIAL;
        loop {
            let (order, meta): (Order, _) = self.post_json(order_url, "").await?;
            if matches!(order.status, OrderStatus::Valid | OrderStatus::Invalid) {
                return Ok(order);
            }

            let wait = meta.retry_after.unwrap_or(interval);
            if Instant::now() + wait >= deadline {
                return Err(AcmeError::Timeout {
                    operation: "order poll",
                });
            }
            tokio::time::sleep(wait).await;
            interval = next_interval(interval);
        }
    }

    async fn fetch_order(&self, order_url: &str) -> Result<Order, AcmeError> {
        let (order, _) = self.post_json(order_url, "").await?;
        Ok(order)
    }

    async fn download_certificate(&self, certificate_url: &str) -> Result<String, AcmeError> {
        let (resp, _) = self.post(certificate_url, "", false).await?;
        let pem_chain = resp.text().await.map_err(AcmeError::Transport)?;
        if !pem_chain.contains("BEGIN CERTIFICATE") {
            return Err(AcmeError::InvalidResponse(
                "certificate download is not PEM".into(),
            ));
        }
        Ok(pem_chain)
    }

    async fn revoke(&self, cert_der: &[u8], reason: u8) -> Result<(), AcmeError> {
        let url = self
            .directory
            .revoke_cert
            .clone()
            .ok_or_else(|| AcmeError::Malformed("server does not advertise revokeCert".into()))?;
        let payload = serde_json::json!({
            "certificate": URL_SAFE_NO_PAD.encode(cert_der),
            "reason": reason,
        })
        .to_string();
        self.post(&url, &payload, false).await?;
        Ok(())
    }
}

fn nonce_of(resp: &Response) -> Option<String> {
    resp.headers()
        .get("replay-nonce")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Doubling poll interval, capped at 30 s.
fn next_interval(current: Duration) -> Duration {
    (current * 2).min(POLL_CAP)
}

/// In-call retry backoff for 5xx/transport: 2 s, 4 s, 8 s.
fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(6))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_interval_doubles_to_cap() {
        let mut interval = POLL_INITIAL;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(interval.as_secs());
            interval = next_interval(interval);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_retry_backoff_bounded() {
        assert_eq!(retry_backoff(1), Duration::from_secs(2));
        assert_eq!(retry_backoff(2), Duration::from_secs(4));
        assert_eq!(retry_backoff(3), Duration::from_secs(8));
        // Clamped even if retry accounting ever grew.
        assert_eq!(retry_backoff(40), Duration::from_secs(64));
    }

    #[test]
    fn test_client_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AcmeClient>();
    }
}
