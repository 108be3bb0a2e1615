//! Certcentral backend daemon.
//!
//! Long-lived process: loads configuration, registers ACME accounts,
//! bootstraps the scheduler from the on-disk store, then runs until a
//! termination signal. SIGHUP re-reads configuration and reconciles the
//! certificate set without restarting in-flight orders.
//!
//! Exit codes: 0 clean shutdown, 64 configuration invalid, 69 store path
//! unwritable, 70 unexpected internal error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use certcentral::acme::{AcmeApi, AcmeClient};
use certcentral::challenge::{Dns01Fulfiller, Fulfiller, Http01Fulfiller, ZoneBinding};
use certcentral::crypto::AccountKey;
use certcentral::dns::{self, AuthoritativeLookup};
use certcentral::signals::{SignalBridge, SignalEvent};
use certcentral::store::CertStore;
use certcentral::Scheduler;
use certcentral_common::ChallengeKind;
use certcentral_config::{Config, CONFIG_ENV};

const DEFAULT_CONFIG_PATH: &str = "/etc/certcentral/config.yaml";

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 64;
const EXIT_STORE: i32 = 69;
const EXIT_INTERNAL: i32 = 70;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = PathBuf::from(
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    info!(config = %config_path.display(), "starting certcentral backend");

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration invalid");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start async runtime");
            std::process::exit(EXIT_INTERNAL);
        }
    };

    let code = runtime.block_on(run(config_path, config));
    std::process::exit(code);
}

async fn run(config_path: PathBuf, config: Config) -> i32 {
    let store = match CertStore::open(&config.store.base_path, config.store.archive_keep) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, "store path unusable");
            return EXIT_STORE;
        }
    };

    let acme = match connect_accounts(&config).await {
        Ok(acme) => acme,
        Err(code) => return code,
    };

    let fulfillers = match build_fulfillers(&config) {
        Ok(fulfillers) => fulfillers,
        Err(code) => return code,
    };

    let scheduler = Scheduler::new(store, acme, fulfillers, &config.scheduler);
    if let Err(err) = scheduler.bootstrap(&config.certificates) {
        error!(error = %err, "store bootstrap failed");
        return EXIT_STORE;
    }

    let signals = match SignalBridge::install() {
        Ok(signals) => signals,
        Err(err) => {
            error!(error = %err, "failed to install signal handlers");
            return EXIT_INTERNAL;
        }
    };

    let run_handle = tokio::spawn(Arc::clone(&scheduler).run());

    loop {
        match signals.recv().await {
            Some(SignalEvent::Reload) => match Config::load(&config_path) {
                Ok(new_config) => {
                    if new_config.store.base_path != config.store.base_path {
                        warn!("store.base_path changes require a restart; keeping old path");
                    }
                    if new_config.accounts != config.accounts {
                        warn!("account changes require a restart; keeping registered accounts");
                    }
                    scheduler.reconcile(&new_config.certificates).await;
                }
                Err(err) => {
                    error!(error = %err, "reload failed, keeping previous configuration");
                }
            },
            Some(SignalEvent::Shutdown) | None => {
                info!("shutdown requested");
                scheduler.request_shutdown();
                break;
            }
        }
    }

    if run_handle.await.is_err() {
        error!("scheduler task panicked");
        return EXIT_INTERNAL;
    }
    EXIT_OK
}

/// Load every account key and register (or recover) the account with its
/// CA.
async fn connect_accounts(config: &Config) -> Result<HashMap<String, Arc<dyn AcmeApi>>, i32> {
    let mut acme: HashMap<String, Arc<dyn AcmeApi>> = HashMap::new();
    for (id, account) in &config.accounts {
        let key = match AccountKey::load_or_create(&account.key_path) {
            Ok(key) => Arc::new(key),
            Err(err) => {
                error!(account = %id, error = %err, "account key unusable");
                return Err(EXIT_CONFIG);
            }
        };
        match AcmeClient::connect(&account.directory, key, &account.contact).await {
            Ok(client) => {
                info!(account = %id, url = client.account_url(), "account registered");
                acme.insert(id.clone(), Arc::new(client));
            }
            Err(err) => {
                error!(account = %id, error = %err, "ACME account registration failed");
                return Err(EXIT_INTERNAL);
            }
        }
    }
    Ok(acme)
}

fn build_fulfillers(
    config: &Config,
) -> Result<HashMap<ChallengeKind, Arc<dyn Fulfiller>>, i32> {
    let mut fulfillers: HashMap<ChallengeKind, Arc<dyn Fulfiller>> = HashMap::new();

    if let Some(http01) = &config.challenges.http01 {
        match Http01Fulfiller::new(http01.challenges_dir.clone(), http01.self_check_urls.clone())
        {
            Ok(fulfiller) => {
                fulfillers.insert(ChallengeKind::Http01, Arc::new(fulfiller));
            }
            Err(err) => {
                error!(
                    dir = %http01.challenges_dir.display(),
                    error = %err,
                    "challenges directory unusable"
                );
                return Err(EXIT_STORE);
            }
        }
    }

    if let Some(dns01) = &config.challenges.dns01 {
        let mut bindings = Vec::new();
        for (id, provider) in &dns01.providers {
            match dns::build_driver(provider) {
                Ok(driver) => bindings.push(ZoneBinding {
                    provider_id: id.clone(),
                    zones: provider.zones.clone(),
                    driver,
                }),
                Err(err) => {
                    error!(provider = %id, error = %err, "DNS driver misconfigured");
                    return Err(EXIT_CONFIG);
                }
            }
        }
        fulfillers.insert(
            ChallengeKind::Dns01,
            Arc::new(Dns01Fulfiller::new(
                bindings,
                Arc::new(AuthoritativeLookup::new()),
            )),
        );
    }

    Ok(fulfillers)
}
