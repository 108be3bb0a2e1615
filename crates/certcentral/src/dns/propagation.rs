//! Authoritative TXT propagation checks.
//!
//! After a driver places a challenge record, the dns-01 fulfiller refuses
//! to tell the CA "go validate" until every authoritative nameserver of the
//! zone serves the value. The lookup itself sits behind [`TxtLookup`] so
//! scenario tests run without a resolver.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{
    NameServerConfigGroup, ResolverConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::DnsError;

/// Interval between propagation probes.
const PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// TXT record lookup against one specific nameserver.
#[async_trait]
pub trait TxtLookup: Send + Sync {
    async fn txt_records(&self, nameserver: &str, rrname: &str) -> Result<Vec<String>, DnsError>;
}

/// Production lookup: resolves the nameserver host with the system
/// resolver, then queries it directly (recursion not desired).
pub struct AuthoritativeLookup {
    system: TokioAsyncResolver,
}

impl AuthoritativeLookup {
    pub fn new() -> Self {
        Self {
            system: TokioAsyncResolver::tokio(
                ResolverConfig::default(),
                ResolverOpts::default(),
            ),
        }
    }

    async fn nameserver_ip(&self, nameserver: &str) -> Result<IpAddr, DnsError> {
        if let Ok(ip) = nameserver.parse::<IpAddr>() {
            return Ok(ip);
        }
        let lookup = self
            .system
            .lookup_ip(nameserver)
            .await
            .map_err(|e| DnsError::Lookup(format!("resolving nameserver {nameserver}: {e}")))?;
        lookup
            .iter()
            .next()
            .ok_or_else(|| DnsError::Lookup(format!("nameserver {nameserver} has no address")))
    }
}

impl Default for AuthoritativeLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxtLookup for AuthoritativeLookup {
    async fn txt_records(&self, nameserver: &str, rrname: &str) -> Result<Vec<String>, DnsError> {
        let ip = self.nameserver_ip(nameserver).await?;

        let group = NameServerConfigGroup::from_ips_clear(&[ip], 53, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        let mut opts = ResolverOpts::default();
        opts.recursion_desired = false;
        opts.use_hosts_file = false;
        let resolver = TokioAsyncResolver::tokio(config, opts);

        let lookup = resolver
            .txt_lookup(rrname)
            .await
            .map_err(|e| DnsError::Lookup(format!("TXT {rrname} @ {nameserver}: {e}")))?;

        let mut values = Vec::new();
        for record in lookup.iter() {
            let joined: String = record
                .txt_data()
                .iter()
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect();
            values.push(joined);
        }
        trace!(nameserver, rrname, count = values.len(), "TXT probe");
        Ok(values)
    }
}

/// Poll until every nameserver returns `value` for `rrname`, or the
/// deadline passes.
///
/// A nameserver that errors (NXDOMAIN before propagation, transient
/// transport) counts as "not yet", not as failure.
pub async fn wait_for_txt(
    lookup: &dyn TxtLookup,
    nameservers: &[String],
    rrname: &str,
    value: &str,
    deadline: Instant,
) -> Result<(), DnsError> {
    loop {
        let mut missing = 0usize;
        for nameserver in nameservers {
            match lookup.txt_records(nameserver, rrname).await {
                Ok(values) if values.iter().any(|v| v == value) => {}
                Ok(_) | Err(_) => missing += 1,
            }
        }
        if missing == 0 {
            debug!(rrname, nameservers = nameservers.len(), "TXT record propagated");
            return Ok(());
        }

        if Instant::now() + PROBE_INTERVAL >= deadline {
            return Err(DnsError::PropagationTimeout {
                rrname: rrname.to_string(),
            });
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Lookup fake: per-nameserver TXT tables, optionally appearing only
    /// after a number of probes.
    struct FakeLookup {
        tables: Mutex<HashMap<String, Vec<String>>>,
        visible_after: Mutex<u32>,
    }

    impl FakeLookup {
        fn new() -> Self {
            Self {
                tables: Mutex::new(HashMap::new()),
                visible_after: Mutex::new(0),
            }
        }

        fn set(&self, nameserver: &str, values: Vec<String>) {
            self.tables.lock().insert(nameserver.to_string(), values);
        }
    }

    #[async_trait]
    impl TxtLookup for FakeLookup {
        async fn txt_records(
            &self,
            nameserver: &str,
            _rrname: &str,
        ) -> Result<Vec<String>, DnsError> {
            let mut gate = self.visible_after.lock();
            if *gate > 0 {
                *gate -= 1;
                return Ok(Vec::new());
            }
            Ok(self
                .tables
                .lock()
                .get(nameserver)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn ns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_wait_succeeds_when_all_serve_value() {
        let lookup = FakeLookup::new();
        lookup.set("ns1", vec!["token-digest".to_string()]);
        lookup.set("ns2", vec!["other".to_string(), "token-digest".to_string()]);

        wait_for_txt(
            &lookup,
            &ns(&["ns1", "ns2"]),
            "_acme-challenge.example.org",
            "token-digest",
            Instant::now() + Duration::from_secs(5),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out_when_one_ns_lags() {
        let lookup = FakeLookup::new();
        lookup.set("ns1", vec!["token-digest".to_string()]);
        lookup.set("ns2", Vec::new());

        let err = wait_for_txt(
            &lookup,
            &ns(&["ns1", "ns2"]),
            "_acme-challenge.example.org",
            "token-digest",
            Instant::now() + Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DnsError::PropagationTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_recovers_after_delayed_visibility() {
        let lookup = FakeLookup::new();
        lookup.set("ns1", vec!["v".to_string()]);
        *lookup.visible_after.lock() = 2;

        wait_for_txt(
            &lookup,
            &ns(&["ns1"]),
            "_acme-challenge.example.org",
            "v",
            Instant::now() + Duration::from_secs(60),
        )
        .await
        .unwrap();
    }
}
