//! Zone-update-command DNS driver.
//!
//! For deployments where DNS is pushed by site tooling rather than a REST
//! API: record changes are delegated to a configured executable, invoked as
//!
//! ```text
//! <command> add    <zone> <rrname> <value> <ttl>
//! <command> remove <zone> <rrname> <value>
//! ```
//!
//! A non-zero exit or a timeout is a driver error. The zone's authoritative
//! nameservers cannot be discovered through a command, so they are supplied
//! in the credentials map (`nameservers`, comma-separated).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error};

use super::{DnsDriver, DnsError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct ExecDriver {
    command: PathBuf,
    nameservers: Vec<String>,
    timeout: Duration,
}

impl ExecDriver {
    pub fn new(credentials: &BTreeMap<String, String>) -> Result<Self, DnsError> {
        let command = credentials
            .get("command")
            .map(PathBuf::from)
            .ok_or_else(|| DnsError::Credentials("exec driver needs command".into()))?;
        let nameservers: Vec<String> = credentials
            .get("nameservers")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if nameservers.is_empty() {
            return Err(DnsError::Credentials(
                "exec driver needs nameservers (comma-separated)".into(),
            ));
        }
        let timeout = credentials
            .get("timeout_secs")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        Ok(Self {
            command,
            nameservers,
            timeout,
        })
    }

    async fn run(&self, args: &[&str]) -> Result<(), DnsError> {
        debug!(command = %self.command.display(), ?args, "running zone update command");
        let child = Command::new(&self.command)
            .args(args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();

        let status = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                error!(command = %self.command.display(), timeout = ?self.timeout, "zone update command timed out");
                DnsError::Driver(format!(
                    "zone update command timed out after {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| DnsError::Driver(format!("spawning zone update command: {e}")))?;

        if !status.success() {
            return Err(DnsError::Driver(format!(
                "zone update command exited with {status}"
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DnsDriver for ExecDriver {
    async fn add_txt(
        &self,
        zone: &str,
        rrname: &str,
        value: &str,
        ttl: u32,
    ) -> Result<(), DnsError> {
        self.run(&["add", zone, rrname, value, &ttl.to_string()])
            .await
    }

    async fn remove_txt(&self, zone: &str, rrname: &str, value: &str) -> Result<(), DnsError> {
        self.run(&["remove", zone, rrname, value]).await
    }

    async fn list_ns(&self, _zone: &str) -> Result<Vec<String>, DnsError> {
        Ok(self.nameservers.clone())
    }
}
