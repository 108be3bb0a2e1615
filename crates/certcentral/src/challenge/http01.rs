//! http-01 fulfiller.
//!
//! Writes the key authorization under `<challenges_dir>/<token>`, the
//! directory edge HTTP servers expose as `/.well-known/acme-challenge/`.
//! Mirroring that directory across the fleet (or routing the well-known
//! path back to this host) is an operational contract, not an engine
//! concern. When vantage URLs are configured, `provision` returns only
//! after at least one of them serves the token back.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ChallengeJob, Fulfiller, FulfillError};

/// Self-check probes before giving up.
const SELF_CHECK_ATTEMPTS: u32 = 10;
const SELF_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Cleanup retries before logging and giving up.
const CLEANUP_ATTEMPTS: u32 = 3;

pub struct Http01Fulfiller {
    challenges_dir: PathBuf,
    self_check_urls: Vec<String>,
    http: reqwest::Client,
}

impl Http01Fulfiller {
    pub fn new(challenges_dir: PathBuf, self_check_urls: Vec<String>) -> std::io::Result<Self> {
        std::fs::create_dir_all(&challenges_dir)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(std::io::Error::other)?;
        Ok(Self {
            challenges_dir,
            self_check_urls,
            http,
        })
    }

    fn token_path(&self, token: &str) -> PathBuf {
        self.challenges_dir.join(token)
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn write_token(&self, job: &ChallengeJob) -> Result<(), FulfillError> {
        if job.token.is_empty() || job.token.contains('/') || job.token.contains("..") {
            return Err(FulfillError::Provision(format!(
                "challenge token for {} is not a safe file name",
                job.identifier
            )));
        }
        let final_path = self.token_path(&job.token);
        let tmp_path = self.challenges_dir.join(format!(".{}.tmp", job.token));
        std::fs::write(&tmp_path, &job.key_authorization)
            .and_then(|()| std::fs::rename(&tmp_path, &final_path))
            .map_err(|e| {
                FulfillError::Provision(format!(
                    "writing challenge file {}: {e}",
                    final_path.display()
                ))
            })
    }

    /// True once any vantage serves the key authorization.
    async fn self_check_once(&self, job: &ChallengeJob) -> bool {
        for base in &self.self_check_urls {
            let url = format!(
                "{}/.well-known/acme-challenge/{}",
                base.trim_end_matches('/'),
                job.token
            );
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    if let Ok(body) = resp.text().await {
                        if body.trim() == job.key_authorization {
                            debug!(identifier = %job.identifier, vantage = %url, "self-check passed");
                            return true;
                        }
                    }
                }
                Ok(resp) => {
                    debug!(vantage = %url, status = %resp.status(), "self-check miss");
                }
                Err(err) => {
                    debug!(vantage = %url, error = %err, "self-check unreachable");
                }
            }
        }
        false
    }
}

#[async_trait]
impl Fulfiller for Http01Fulfiller {
    async fn provision(&self, job: &ChallengeJob) -> Result<(), FulfillError> {
        self.write_token(job)?;
        debug!(
            identifier = %job.identifier,
            token = %job.token,
            "http-01 challenge file written"
        );

        if self.self_check_urls.is_empty() {
            return Ok(());
        }

        for attempt in 1..=SELF_CHECK_ATTEMPTS {
            if self.self_check_once(job).await {
                return Ok(());
            }
            if attempt < SELF_CHECK_ATTEMPTS {
                tokio::time::sleep(SELF_CHECK_INTERVAL).await;
            }
        }
        Err(FulfillError::Provision(format!(
            "challenge file for {} not visible from any vantage",
            job.identifier
        )))
    }

    async fn cleanup(&self, job: &ChallengeJob) {
        let path = self.token_path(&job.token);
        for attempt in 1..=CLEANUP_ATTEMPTS {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(token = %job.token, "http-01 challenge file removed");
                    return;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
                Err(err) => {
                    warn!(
                        token = %job.token,
                        attempt,
                        error = %err,
                        "http-01 cleanup failed"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
