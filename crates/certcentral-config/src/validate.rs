//! Cross-field configuration validation.
//!
//! Structural problems are caught by serde; this pass catches documents that
//! parse but declare something the engine cannot run: certificates bound to
//! missing accounts, dns-01 names with no matching zone, senseless tuning
//! values.

use tracing::warn;

use certcentral_common::ChallengeKind;

use crate::{Config, ConfigError};

/// Validate a parsed configuration.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.accounts.is_empty() {
        return Err(invalid("at least one ACME account must be configured"));
    }

    for (id, account) in &config.accounts {
        if !account.directory.starts_with("https://") && !account.directory.starts_with("http://") {
            return Err(invalid(format!(
                "account '{id}': directory must be an http(s) URL, got '{}'",
                account.directory
            )));
        }
        for contact in &account.contact {
            if !contact.contains(':') {
                return Err(invalid(format!(
                    "account '{id}': contact '{contact}' must be a URL (e.g. mailto:...)"
                )));
            }
        }
    }

    if config.certificates.is_empty() {
        warn!("no certificates configured; the engine will idle");
    }

    for (name, cert) in &config.certificates {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(invalid(format!(
                "certificate name '{name}' is not a safe path component"
            )));
        }
        if cert.san.is_empty() {
            return Err(invalid(format!("certificate '{name}': SAN list is empty")));
        }
        if !cert
            .san
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&cert.cn))
        {
            return Err(invalid(format!(
                "certificate '{name}': CN '{}' must appear in the SAN list",
                cert.cn
            )));
        }
        if !config.accounts.contains_key(&cert.account) {
            return Err(invalid(format!(
                "certificate '{name}': unknown account '{}'",
                cert.account
            )));
        }

        match cert.challenge {
            ChallengeKind::Http01 => {
                if config.challenges.http01.is_none() {
                    return Err(invalid(format!(
                        "certificate '{name}' uses http-01 but challenges.http01 is not configured"
                    )));
                }
            }
            ChallengeKind::Dns01 => {
                let Some(dns01) = &config.challenges.dns01 else {
                    return Err(invalid(format!(
                        "certificate '{name}' uses dns-01 but challenges.dns01 is not configured"
                    )));
                };
                for san in &cert.san {
                    let bare = san.trim_start_matches("*.");
                    let covered = dns01.providers.values().any(|provider| {
                        provider
                            .zones
                            .iter()
                            .any(|zone| zone_matches(bare, zone))
                    });
                    if !covered {
                        return Err(invalid(format!(
                            "certificate '{name}': no dns-01 provider zone covers '{san}'"
                        )));
                    }
                }
            }
        }
    }

    if let Some(dns01) = &config.challenges.dns01 {
        for (id, provider) in &dns01.providers {
            if provider.zones.is_empty() {
                return Err(invalid(format!("dns-01 provider '{id}': zone list is empty")));
            }
        }
    }

    let scheduler = &config.scheduler;
    if scheduler.workers == 0 {
        return Err(invalid("scheduler.workers must be at least 1"));
    }
    if scheduler.concurrent_orders == 0 {
        return Err(invalid("scheduler.concurrent_orders must be at least 1"));
    }
    if !(scheduler.renewal_ratio > 0.0 && scheduler.renewal_ratio <= 1.0) {
        return Err(invalid(format!(
            "scheduler.renewal_ratio must be in (0, 1], got {}",
            scheduler.renewal_ratio
        )));
    }
    if scheduler.backoff_base == 0 || scheduler.backoff_cap < scheduler.backoff_base {
        return Err(invalid(
            "scheduler backoff: base must be > 0 and cap >= base",
        ));
    }

    if config.store.archive_keep == 0 {
        return Err(invalid("store.archive_keep must be at least 1"));
    }

    Ok(())
}

/// True if `name` equals `zone` or is a subdomain of it.
pub fn zone_matches(name: &str, zone: &str) -> bool {
    let name = name.to_ascii_lowercase();
    let zone = zone.to_ascii_lowercase();
    name == zone || name.ends_with(&format!(".{zone}"))
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::*;
    use certcentral_common::KeyKind;
    use std::collections::BTreeMap;

    fn base_config() -> Config {
        let mut accounts = BTreeMap::new();
        accounts.insert(
            "main".to_string(),
            AccountConfig {
                directory: "https://acme.test/directory".to_string(),
                contact: vec!["mailto:ops@example.org".to_string()],
                key_path: "/tmp/account.pem".into(),
            },
        );
        let mut certificates = BTreeMap::new();
        certificates.insert(
            "www".to_string(),
            CertificateConfig {
                cn: "www.example.org".to_string(),
                san: vec!["www.example.org".to_string()],
                key_type: KeyKind::EcdsaP256,
                challenge: ChallengeKind::Http01,
                account: "main".to_string(),
                staging: false,
            },
        );
        Config {
            accounts,
            challenges: ChallengesConfig {
                http01: Some(Http01Config {
                    challenges_dir: "/tmp/challenges".into(),
                    self_check_urls: Vec::new(),
                }),
                dns01: None,
            },
            certificates,
            scheduler: SchedulerConfig::default(),
            store: StoreConfig {
                base_path: "/tmp/certs".into(),
                archive_keep: 5,
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn test_unknown_account_rejected() {
        let mut config = base_config();
        config.certificates.get_mut("www").unwrap().account = "missing".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("unknown account"));
    }

    #[test]
    fn test_cn_must_be_in_san() {
        let mut config = base_config();
        config.certificates.get_mut("www").unwrap().cn = "other.example.org".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_empty_san_rejected() {
        let mut config = base_config();
        config.certificates.get_mut("www").unwrap().san.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unsafe_name_rejected() {
        let mut config = base_config();
        let cert = config.certificates.remove("www").unwrap();
        config.certificates.insert("../etc".to_string(), cert);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_dns01_requires_zone_coverage() {
        let mut config = base_config();
        {
            let cert = config.certificates.get_mut("www").unwrap();
            cert.challenge = ChallengeKind::Dns01;
        }
        let mut providers = BTreeMap::new();
        providers.insert(
            "primary".to_string(),
            DnsProviderConfig {
                driver: DnsDriverKind::Exec,
                credentials: BTreeMap::new(),
                zones: vec!["other.net".to_string()],
            },
        );
        config.challenges.dns01 = Some(Dns01Config { providers });
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("no dns-01 provider zone"));

        config
            .challenges
            .dns01
            .as_mut()
            .unwrap()
            .providers
            .get_mut("primary")
            .unwrap()
            .zones = vec!["example.org".to_string()];
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_http01_requires_challenges_dir() {
        let mut config = base_config();
        config.challenges.http01 = None;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_renewal_ratio_bounds() {
        let mut config = base_config();
        config.scheduler.renewal_ratio = 0.0;
        assert!(validate(&config).is_err());
        config.scheduler.renewal_ratio = 1.5;
        assert!(validate(&config).is_err());
        config.scheduler.renewal_ratio = 1.0;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zone_matches() {
        assert!(zone_matches("example.org", "example.org"));
        assert!(zone_matches("api.example.org", "example.org"));
        assert!(zone_matches("API.EXAMPLE.ORG", "example.org"));
        assert!(!zone_matches("badexample.org", "example.org"));
        assert!(!zone_matches("example.org", "api.example.org"));
    }
}
