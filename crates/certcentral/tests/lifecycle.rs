//! End-to-end lifecycle scenarios.
//!
//! The scheduler is driven against an in-memory ACME authority that signs
//! real certificates for the submitted CSRs, so the crypto, store and
//! state-machine paths all run for real; only the wire is faked.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

use certcentral::acme::{
    AcmeApi, AcmeError, Authorization, AuthorizationStatus, Challenge, ChallengeStatus,
    Identifier, Order, OrderStatus,
};
use certcentral::challenge::{Dns01Fulfiller, Fulfiller, Http01Fulfiller, ZoneBinding};
use certcentral::crypto::{build_csr, CertKey};
use certcentral::dns::{DnsDriver, DnsError, TxtLookup};
use certcentral::scheduler::{CertStatus, PendingOrder, Scheduler};
use certcentral::store::CertStore;
use certcentral_common::{ChallengeKind, KeyKind};
use certcentral_config::{CertificateConfig, SchedulerConfig};

const TEST_THUMBPRINT: &str = "test-thumbprint";

// ============================================================================
// Fake ACME authority
// ============================================================================

struct FakeAuthz {
    identifier: String,
    status: AuthorizationStatus,
    token: String,
    challenge_url: String,
}

struct FakeOrder {
    status: OrderStatus,
    authz_urls: Vec<String>,
    finalize_url: String,
    certificate_url: Option<String>,
    cert_pem: Option<String>,
}

#[derive(Default)]
struct FakeState {
    orders: HashMap<String, FakeOrder>,
    authzs: HashMap<String, FakeAuthz>,
    counter: u64,
    issued: u64,
    revoked: u64,
    rate_limit: Option<Duration>,
    active_orders: usize,
    max_active_orders: usize,
}

struct FakeAcme {
    challenge_kind: &'static str,
    /// When set, `respond_to_challenge` verifies the token file the
    /// http-01 fulfiller should have written.
    http_dir: Option<PathBuf>,
    /// notBefore offset into the past, in days.
    backdate_days: i64,
    /// notAfter = now + lifetime + one extra day per prior issuance, so
    /// renewals always outlive their predecessors.
    lifetime_days: i64,
    issuer_key: rcgen::KeyPair,
    issuer_cert: rcgen::Certificate,
    state: Mutex<FakeState>,
}

impl FakeAcme {
    fn new(challenge_kind: &'static str) -> Arc<Self> {
        Self::build(challenge_kind, None, 0, 90)
    }

    fn with_validity(
        challenge_kind: &'static str,
        backdate_days: i64,
        lifetime_days: i64,
    ) -> Arc<Self> {
        Self::build(challenge_kind, None, backdate_days, lifetime_days)
    }

    fn with_http_dir(challenge_kind: &'static str, dir: PathBuf) -> Arc<Self> {
        Self::build(challenge_kind, Some(dir), 0, 90)
    }

    fn build(
        challenge_kind: &'static str,
        http_dir: Option<PathBuf>,
        backdate_days: i64,
        lifetime_days: i64,
    ) -> Arc<Self> {
        let issuer_key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, "certcentral test CA");
        params.distinguished_name = dn;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let issuer_cert = params.self_signed(&issuer_key).unwrap();

        Arc::new(Self {
            challenge_kind,
            http_dir,
            backdate_days,
            lifetime_days,
            issuer_key,
            issuer_cert,
            state: Mutex::new(FakeState::default()),
        })
    }

    fn set_rate_limit(&self, wait: Option<Duration>) {
        self.state.lock().rate_limit = wait;
    }

    fn orders_created(&self) -> u64 {
        self.state.lock().counter
    }

    fn issued(&self) -> u64 {
        self.state.lock().issued
    }

    fn revoked(&self) -> u64 {
        self.state.lock().revoked
    }

    fn max_active_orders(&self) -> usize {
        self.state.lock().max_active_orders
    }

    fn issue(&self, csr_der: &[u8], issued_before: u64) -> String {
        let mut csr = rcgen::CertificateSigningRequestParams::from_der(
            &csr_der.to_vec().into(),
        )
        .expect("scheduler submitted an unparseable CSR");
        let now = time::OffsetDateTime::now_utc();
        csr.params.not_before = now - time::Duration::days(self.backdate_days);
        csr.params.not_after =
            now + time::Duration::days(self.lifetime_days + issued_before as i64);
        let cert = csr
            .signed_by(&self.issuer_cert, &self.issuer_key)
            .expect("issuance failed");
        cert.pem()
    }
}

#[async_trait]
impl AcmeApi for FakeAcme {
    fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{TEST_THUMBPRINT}")
    }

    async fn new_order(&self, sans: &[String]) -> Result<(String, Order), AcmeError> {
        let mut state = self.state.lock();
        if let Some(wait) = state.rate_limit {
            return Err(AcmeError::RateLimited {
                retry_after: Some(wait),
            });
        }
        state.counter += 1;
        state.active_orders += 1;
        state.max_active_orders = state.max_active_orders.max(state.active_orders);
        let id = state.counter;

        let order_url = format!("https://fake.acme/order/{id}");
        let finalize_url = format!("https://fake.acme/finalize/{id}");
        let mut authz_urls = Vec::new();
        for (i, san) in sans.iter().enumerate() {
            let authz_url = format!("https://fake.acme/authz/{id}/{i}");
            state.authzs.insert(
                authz_url.clone(),
                FakeAuthz {
                    identifier: san.clone(),
                    status: AuthorizationStatus::Pending,
                    token: format!("token-{id}-{i}"),
                    challenge_url: format!("https://fake.acme/chall/{id}/{i}"),
                },
            );
            authz_urls.push(authz_url);
        }
        state.orders.insert(
            order_url.clone(),
            FakeOrder {
                status: OrderStatus::Pending,
                authz_urls: authz_urls.clone(),
                finalize_url: finalize_url.clone(),
                certificate_url: None,
                cert_pem: None,
            },
        );

        Ok((
            order_url,
            Order {
                status: OrderStatus::Pending,
                authorizations: authz_urls,
                finalize: finalize_url,
                certificate: None,
            },
        ))
    }

    async fn get_authorization(&self, url: &str) -> Result<Authorization, AcmeError> {
        let state = self.state.lock();
        let authz = state
            .authzs
            .get(url)
            .ok_or_else(|| AcmeError::Malformed(format!("unknown authorization {url}")))?;
        Ok(Authorization {
            identifier: Identifier {
                kind: "dns".to_string(),
                value: authz.identifier.clone(),
            },
            status: authz.status,
            challenges: vec![Challenge {
                kind: self.challenge_kind.to_string(),
                url: authz.challenge_url.clone(),
                token: authz.token.clone(),
                status: ChallengeStatus::Pending,
            }],
            wildcard: false,
        })
    }

    async fn respond_to_challenge(&self, url: &str) -> Result<Challenge, AcmeError> {
        let mut state = self.state.lock();
        let authz = state
            .authzs
            .values_mut()
            .find(|a| a.challenge_url == url)
            .ok_or_else(|| AcmeError::Malformed(format!("unknown challenge {url}")))?;

        authz.status = match &self.http_dir {
            Some(dir) => {
                let content = std::fs::read_to_string(dir.join(&authz.token)).unwrap_or_default();
                if content == format!("{}.{TEST_THUMBPRINT}", authz.token) {
                    AuthorizationStatus::Valid
                } else {
                    AuthorizationStatus::Invalid
                }
            }
            None => AuthorizationStatus::Valid,
        };

        Ok(Challenge {
            kind: self.challenge_kind.to_string(),
            url: url.to_string(),
            token: authz.token.clone(),
            status: ChallengeStatus::Processing,
        })
    }

    async fn poll_authorization(
        &self,
        url: &str,
        _deadline: Instant,
    ) -> Result<AuthorizationStatus, AcmeError> {
        let state = self.state.lock();
        state
            .authzs
            .get(url)
            .map(|a| a.status)
            .ok_or_else(|| AcmeError::Malformed(format!("unknown authorization {url}")))
    }

    async fn finalize_order(
        &self,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<Order, AcmeError> {
        let mut state = self.state.lock();
        let issued_before = state.issued;
        let order_url = state
            .orders
            .iter()
            .find(|(_, o)| o.finalize_url == finalize_url)
            .map(|(url, _)| url.clone())
            .ok_or_else(|| AcmeError::Malformed(format!("unknown finalize {finalize_url}")))?;

        let all_valid = {
            let order = &state.orders[&order_url];
            order
                .authz_urls
                .iter()
                .all(|u| state.authzs[u].status == AuthorizationStatus::Valid)
        };
        if !all_valid {
            return Err(AcmeError::Malformed(
                "finalize before authorizations validated".to_string(),
            ));
        }

        let cert_pem = self.issue(csr_der, issued_before);
        state.issued += 1;

        let certificate_url = format!("{order_url}/certificate");
        let order = state.orders.get_mut(&order_url).unwrap();
        order.status = OrderStatus::Valid;
        order.certificate_url = Some(certificate_url.clone());
        order.cert_pem = Some(cert_pem);
        Ok(Order {
            status: OrderStatus::Valid,
            authorizations: order.authz_urls.clone(),
            finalize: order.finalize_url.clone(),
            certificate: Some(certificate_url),
        })
    }

    async fn poll_order(&self, order_url: &str, _deadline: Instant) -> Result<Order, AcmeError> {
        self.fetch_order(order_url).await
    }

    async fn fetch_order(&self, order_url: &str) -> Result<Order, AcmeError> {
        let state = self.state.lock();
        let order = state
            .orders
            .get(order_url)
            .ok_or_else(|| AcmeError::Malformed(format!("unknown order {order_url}")))?;
        Ok(Order {
            status: order.status,
            authorizations: order.authz_urls.clone(),
            finalize: order.finalize_url.clone(),
            certificate: order.certificate_url.clone(),
        })
    }

    async fn download_certificate(&self, certificate_url: &str) -> Result<String, AcmeError> {
        let mut state = self.state.lock();
        state.active_orders = state.active_orders.saturating_sub(1);
        let order = state
            .orders
            .values()
            .find(|o| o.certificate_url.as_deref() == Some(certificate_url))
            .ok_or_else(|| AcmeError::Malformed(format!("unknown certificate {certificate_url}")))?;
        let leaf = order
            .cert_pem
            .clone()
            .ok_or_else(|| AcmeError::Malformed("certificate not issued".to_string()))?;
        Ok(format!("{leaf}{}", self.issuer_cert.pem()))
    }

    async fn revoke(&self, _cert_der: &[u8], _reason: u8) -> Result<(), AcmeError> {
        self.state.lock().revoked += 1;
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

struct Fixture {
    _tmp: tempfile::TempDir,
    store: Arc<CertStore>,
    fake: Arc<FakeAcme>,
    scheduler: Arc<Scheduler>,
    challenges_dir: PathBuf,
    certificates: BTreeMap<String, CertificateConfig>,
}

fn cert_spec(cn: &str, sans: &[&str], challenge: ChallengeKind) -> CertificateConfig {
    CertificateConfig {
        cn: cn.to_string(),
        san: sans.iter().map(|s| s.to_string()).collect(),
        key_type: KeyKind::EcdsaP256,
        challenge,
        account: "main".to_string(),
        staging: false,
    }
}

fn scheduler_config(concurrent_orders: usize) -> SchedulerConfig {
    SchedulerConfig {
        workers: 2,
        renewal_ratio: 2.0 / 3.0,
        backoff_base: 30,
        backoff_cap: 3600,
        concurrent_orders,
    }
}

fn http_fixture(fake: Arc<FakeAcme>, certificates: BTreeMap<String, CertificateConfig>) -> Fixture {
    http_fixture_with(fake, certificates, 1)
}

fn http_fixture_with(
    fake: Arc<FakeAcme>,
    certificates: BTreeMap<String, CertificateConfig>,
    concurrent_orders: usize,
) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let challenges_dir = tmp.path().join("challenges");
    let store = Arc::new(CertStore::open(&tmp.path().join("certs"), 3).unwrap());

    let mut acme: HashMap<String, Arc<dyn AcmeApi>> = HashMap::new();
    acme.insert("main".to_string(), fake.clone());

    let mut fulfillers: HashMap<ChallengeKind, Arc<dyn Fulfiller>> = HashMap::new();
    fulfillers.insert(
        ChallengeKind::Http01,
        Arc::new(Http01Fulfiller::new(challenges_dir.clone(), Vec::new()).unwrap()),
    );

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        acme,
        fulfillers,
        &scheduler_config(concurrent_orders),
    );

    Fixture {
        _tmp: tmp,
        store,
        fake,
        scheduler,
        challenges_dir,
        certificates,
    }
}

async fn drive_to_live(fixture: &Fixture, name: &str) {
    // First pass publishes the placeholder, second runs the full order.
    fixture.scheduler.process_one(name).await;
    assert_eq!(
        fixture.scheduler.status_of(name).await,
        Some(CertStatus::SelfSigned)
    );
    fixture.scheduler.process_one(name).await;
    assert_eq!(
        fixture.scheduler.status_of(name).await,
        Some(CertStatus::Live)
    );
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn cold_start_http01_single_certificate() {
    let mut certificates = BTreeMap::new();
    certificates.insert(
        "www.example.org".to_string(),
        cert_spec("www.example.org", &["www.example.org"], ChallengeKind::Http01),
    );

    let tmp_challenges = tempfile::tempdir().unwrap();
    let fake = FakeAcme::with_http_dir("http-01", tmp_challenges.path().to_path_buf());
    // Point the fulfiller at the directory the fake inspects.
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CertStore::open(&tmp.path().join("certs"), 3).unwrap());
    let mut acme: HashMap<String, Arc<dyn AcmeApi>> = HashMap::new();
    acme.insert("main".to_string(), fake.clone());
    let mut fulfillers: HashMap<ChallengeKind, Arc<dyn Fulfiller>> = HashMap::new();
    fulfillers.insert(
        ChallengeKind::Http01,
        Arc::new(
            Http01Fulfiller::new(tmp_challenges.path().to_path_buf(), Vec::new()).unwrap(),
        ),
    );
    let scheduler = Scheduler::new(Arc::clone(&store), acme, fulfillers, &scheduler_config(4));

    scheduler.bootstrap(&certificates).unwrap();
    assert_eq!(
        scheduler.status_of("www.example.org").await,
        Some(CertStatus::Initial)
    );

    // Tick one: the placeholder, so the distribution API has something to
    // serve immediately.
    scheduler.process_one("www.example.org").await;
    let placeholder = store.load_live("www.example.org").unwrap().unwrap();
    assert!(placeholder.meta.self_signed);
    let meta_raw =
        std::fs::read_to_string(tmp.path().join("certs/live/www.example.org/meta.json")).unwrap();
    assert!(meta_raw.contains("self_signed"));

    // Tick two: the real order end to end.
    scheduler.process_one("www.example.org").await;
    assert_eq!(
        scheduler.status_of("www.example.org").await,
        Some(CertStatus::Live)
    );

    let live = store.load_live("www.example.org").unwrap().unwrap();
    assert!(!live.meta.self_signed);
    let meta_raw =
        std::fs::read_to_string(tmp.path().join("certs/live/www.example.org/meta.json")).unwrap();
    assert!(!meta_raw.contains("self_signed"));

    let days_out = (live.meta.not_after - Utc::now()).num_days();
    assert!((88..=91).contains(&days_out), "not_after {days_out} days out");
    assert!(!live.chain_pem.is_empty());

    // Exactly one order reached the authority.
    assert_eq!(fake.orders_created(), 1);
    assert_eq!(fake.issued(), 1);

    // Challenge files are cleaned up in the background.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let leftover = std::fs::read_dir(tmp_challenges.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .count();
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn dns01_routes_records_across_providers() {
    // Shared TXT table: drivers write into it, the lookup reads from it.
    #[derive(Default)]
    struct Table {
        records: Mutex<HashMap<String, Vec<String>>>,
    }

    struct TableDriver {
        table: Arc<Table>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DnsDriver for TableDriver {
        async fn add_txt(
            &self,
            zone: &str,
            rrname: &str,
            value: &str,
            _ttl: u32,
        ) -> Result<(), DnsError> {
            self.calls.lock().push(format!("add {zone} {rrname}"));
            self.table
                .records
                .lock()
                .entry(rrname.to_string())
                .or_default()
                .push(value.to_string());
            Ok(())
        }

        async fn remove_txt(
            &self,
            _zone: &str,
            rrname: &str,
            _value: &str,
        ) -> Result<(), DnsError> {
            self.table.records.lock().remove(rrname);
            Ok(())
        }

        async fn list_ns(&self, _zone: &str) -> Result<Vec<String>, DnsError> {
            Ok(vec!["ns1.test".to_string(), "ns2.test".to_string()])
        }
    }

    struct TableLookup {
        table: Arc<Table>,
    }

    #[async_trait]
    impl TxtLookup for TableLookup {
        async fn txt_records(
            &self,
            _nameserver: &str,
            rrname: &str,
        ) -> Result<Vec<String>, DnsError> {
            Ok(self
                .table
                .records
                .lock()
                .get(rrname)
                .cloned()
                .unwrap_or_default())
        }
    }

    let table = Arc::new(Table::default());
    let driver_foo = Arc::new(TableDriver {
        table: Arc::clone(&table),
        calls: Mutex::new(Vec::new()),
    });
    let driver_bar = Arc::new(TableDriver {
        table: Arc::clone(&table),
        calls: Mutex::new(Vec::new()),
    });

    let fulfiller = Dns01Fulfiller::new(
        vec![
            ZoneBinding {
                provider_id: "foo".to_string(),
                zones: vec!["foo.net".to_string()],
                driver: driver_foo.clone(),
            },
            ZoneBinding {
                provider_id: "bar".to_string(),
                zones: vec!["bar.net".to_string()],
                driver: driver_bar.clone(),
            },
        ],
        Arc::new(TableLookup {
            table: Arc::clone(&table),
        }),
    )
    .with_propagation_timeout(Duration::from_secs(5));

    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CertStore::open(&tmp.path().join("certs"), 3).unwrap());
    let fake = FakeAcme::new("dns-01");
    let mut acme: HashMap<String, Arc<dyn AcmeApi>> = HashMap::new();
    acme.insert("main".to_string(), fake.clone());
    let mut fulfillers: HashMap<ChallengeKind, Arc<dyn Fulfiller>> = HashMap::new();
    fulfillers.insert(ChallengeKind::Dns01, Arc::new(fulfiller));
    let scheduler = Scheduler::new(Arc::clone(&store), acme, fulfillers, &scheduler_config(4));

    let mut certificates = BTreeMap::new();
    certificates.insert(
        "api".to_string(),
        cert_spec(
            "api.foo.net",
            &["api.foo.net", "api.bar.net"],
            ChallengeKind::Dns01,
        ),
    );
    scheduler.bootstrap(&certificates).unwrap();

    scheduler.process_one("api").await;
    scheduler.process_one("api").await;
    assert_eq!(scheduler.status_of("api").await, Some(CertStatus::Live));

    // Each TXT record went through the provider owning its zone.
    assert_eq!(
        driver_foo.calls.lock().as_slice(),
        ["add foo.net _acme-challenge.api.foo.net"]
    );
    assert_eq!(
        driver_bar.calls.lock().as_slice(),
        ["add bar.net _acme-challenge.api.bar.net"]
    );

    // One publish: the live material covers both names.
    let live = store.load_live("api").unwrap().unwrap();
    assert_eq!(live.meta.san, vec!["api.bar.net", "api.foo.net"]);
    assert_eq!(fake.issued(), 1);
}

#[tokio::test]
async fn rate_limit_parks_record_until_retry_after() {
    let fake = FakeAcme::new("http-01");
    let mut certificates = BTreeMap::new();
    certificates.insert(
        "www".to_string(),
        cert_spec("www.example.org", &["www.example.org"], ChallengeKind::Http01),
    );
    let fixture = http_fixture(fake, certificates);
    fixture.scheduler.bootstrap(&fixture.certificates).unwrap();

    fixture.scheduler.process_one("www").await; // placeholder
    fixture.fake.set_rate_limit(Some(Duration::from_secs(60)));
    fixture.scheduler.process_one("www").await; // order attempt, 429

    assert_eq!(
        fixture.scheduler.status_of("www").await,
        Some(CertStatus::Failed)
    );
    let health = fixture.scheduler.health_snapshot().await;
    let record = &health.records["www"];
    let wait = (record.next_attempt - Utc::now()).num_seconds();
    assert!(
        (50..=70).contains(&wait),
        "next attempt {wait}s away, wanted ~60s"
    );
    assert_eq!(fixture.fake.orders_created(), 0);

    // Still parked: nothing happens before the retry-after elapses.
    fixture.fake.set_rate_limit(None);
    fixture.scheduler.process_one("www").await;
    assert_eq!(fixture.fake.orders_created(), 0);
    assert_eq!(
        fixture.scheduler.status_of("www").await,
        Some(CertStatus::Failed)
    );
}

#[tokio::test]
async fn renewal_reissues_and_archives_previous_material() {
    // Issued certs are 61 days into a 90-day window: past the 2/3 renewal
    // point the moment they go live.
    let fake = FakeAcme::with_validity("http-01", 61, 29);
    let mut certificates = BTreeMap::new();
    certificates.insert(
        "www".to_string(),
        cert_spec("www.example.org", &["www.example.org"], ChallengeKind::Http01),
    );
    let fixture = http_fixture(fake, certificates);
    fixture.scheduler.bootstrap(&fixture.certificates).unwrap();

    drive_to_live(&fixture, "www").await;
    let first = fixture.store.load_live("www").unwrap().unwrap();

    // Renewal is already due; one more pass renews.
    assert!(fixture
        .scheduler
        .due_records()
        .await
        .contains(&"www".to_string()));
    fixture.scheduler.process_one("www").await;
    assert_eq!(
        fixture.scheduler.status_of("www").await,
        Some(CertStatus::Live)
    );

    let second = fixture.store.load_live("www").unwrap().unwrap();
    assert_ne!(second.meta.serial, first.meta.serial);
    assert!(second.meta.not_after > first.meta.not_after);

    // The superseded version is in the archive.
    let archived = fixture
        .store
        .base_path()
        .join("archive/www")
        .join(&first.meta.serial);
    assert!(archived.join("cert.pem").exists());
    assert_eq!(fixture.fake.issued(), 2);
}

#[tokio::test]
async fn restart_resumes_from_published_state() {
    let fake = FakeAcme::new("http-01");
    let mut certificates = BTreeMap::new();
    certificates.insert(
        "www".to_string(),
        cert_spec("www.example.org", &["www.example.org"], ChallengeKind::Http01),
    );
    let fixture = http_fixture(Arc::clone(&fake), certificates.clone());
    fixture.scheduler.bootstrap(&fixture.certificates).unwrap();
    drive_to_live(&fixture, "www").await;
    assert_eq!(fake.orders_created(), 1);

    // A second engine over the same store comes back LIVE without
    // ordering again.
    let mut acme: HashMap<String, Arc<dyn AcmeApi>> = HashMap::new();
    acme.insert("main".to_string(), fake.clone());
    let mut fulfillers: HashMap<ChallengeKind, Arc<dyn Fulfiller>> = HashMap::new();
    fulfillers.insert(
        ChallengeKind::Http01,
        Arc::new(Http01Fulfiller::new(fixture.challenges_dir.clone(), Vec::new()).unwrap()),
    );
    let restarted = Scheduler::new(
        Arc::clone(&fixture.store),
        acme,
        fulfillers,
        &scheduler_config(4),
    );
    restarted.bootstrap(&certificates).unwrap();

    assert_eq!(restarted.status_of("www").await, Some(CertStatus::Live));
    assert!(restarted.due_records().await.is_empty());
    assert_eq!(fake.orders_created(), 1);
}

#[tokio::test]
async fn persisted_order_resumes_after_restart() {
    let fake = FakeAcme::new("http-01");
    let mut certificates = BTreeMap::new();
    certificates.insert(
        "www".to_string(),
        cert_spec("www.example.org", &["www.example.org"], ChallengeKind::Http01),
    );
    let fixture = http_fixture(Arc::clone(&fake), certificates);

    // An order was created and persisted, then the engine died.
    let sans = vec!["www.example.org".to_string()];
    let key = CertKey::generate(KeyKind::EcdsaP256).unwrap();
    let csr_der = build_csr(&key, "www.example.org", &sans).unwrap();
    let (order_url, order) = fake.new_order(&sans).await.unwrap();
    let pending = PendingOrder {
        order_url,
        authorizations: order.authorizations,
        finalize_url: order.finalize,
        key_pem: key.to_pem(),
        csr_der,
        challenges: Vec::new(),
    };
    fixture
        .store
        .save_order_state("www", &serde_json::to_string(&pending).unwrap())
        .unwrap();

    fixture.scheduler.bootstrap(&fixture.certificates).unwrap();
    assert_eq!(
        fixture.scheduler.status_of("www").await,
        Some(CertStatus::Ordering)
    );

    fixture.scheduler.process_one("www").await;
    assert_eq!(
        fixture.scheduler.status_of("www").await,
        Some(CertStatus::Live)
    );

    // The resumed order was completed, not replaced.
    assert_eq!(fake.orders_created(), 1);
    let live = fixture.store.load_live("www").unwrap().unwrap();
    assert_eq!(
        live.meta.fingerprint,
        key.fingerprint(),
        "live material must use the persisted order's key"
    );
    assert!(fixture.store.load_order_state("www").unwrap().is_none());
}

#[tokio::test]
async fn concurrent_orders_respect_the_permit_cap() {
    let fake = FakeAcme::new("http-01");
    let mut certificates = BTreeMap::new();
    for name in ["a", "b", "c"] {
        let fqdn = format!("{name}.example.org");
        certificates.insert(name.to_string(), cert_spec(&fqdn, &[&fqdn], ChallengeKind::Http01));
    }
    let fixture = http_fixture_with(Arc::clone(&fake), certificates, 1);
    fixture.scheduler.bootstrap(&fixture.certificates).unwrap();

    for name in ["a", "b", "c"] {
        fixture.scheduler.process_one(name).await; // placeholders
    }
    tokio::join!(
        fixture.scheduler.process_one("a"),
        fixture.scheduler.process_one("b"),
        fixture.scheduler.process_one("c"),
    );

    for name in ["a", "b", "c"] {
        assert_eq!(
            fixture.scheduler.status_of(name).await,
            Some(CertStatus::Live)
        );
    }
    assert_eq!(fake.issued(), 3);
    assert_eq!(
        fake.max_active_orders(),
        1,
        "permit cap of 1 must serialize in-flight orders"
    );
}

#[tokio::test]
async fn revocation_reissues_immediately() {
    let fake = FakeAcme::new("http-01");
    let mut certificates = BTreeMap::new();
    certificates.insert(
        "www".to_string(),
        cert_spec("www.example.org", &["www.example.org"], ChallengeKind::Http01),
    );
    let fixture = http_fixture(Arc::clone(&fake), certificates);
    fixture.scheduler.bootstrap(&fixture.certificates).unwrap();
    drive_to_live(&fixture, "www").await;
    let first = fixture.store.load_live("www").unwrap().unwrap();

    fixture.scheduler.revoke("www", 0).await.unwrap();
    assert_eq!(fake.revoked(), 1);
    assert_eq!(
        fixture.scheduler.status_of("www").await,
        Some(CertStatus::Revoking)
    );

    fixture.scheduler.process_one("www").await;
    assert_eq!(
        fixture.scheduler.status_of("www").await,
        Some(CertStatus::Live)
    );
    let reissued = fixture.store.load_live("www").unwrap().unwrap();
    assert_ne!(reissued.meta.serial, first.meta.serial);
}

#[tokio::test]
async fn san_change_forces_reissue_with_new_subjects() {
    let fake = FakeAcme::new("http-01");
    let mut certificates = BTreeMap::new();
    certificates.insert(
        "www".to_string(),
        cert_spec("www.example.org", &["www.example.org"], ChallengeKind::Http01),
    );
    let fixture = http_fixture(Arc::clone(&fake), certificates);
    fixture.scheduler.bootstrap(&fixture.certificates).unwrap();
    drive_to_live(&fixture, "www").await;

    // Reload adds a SAN to the same certificate name.
    let mut updated = BTreeMap::new();
    updated.insert(
        "www".to_string(),
        cert_spec(
            "www.example.org",
            &["www.example.org", "alt.example.org"],
            ChallengeKind::Http01,
        ),
    );
    fixture.scheduler.reconcile(&updated).await;

    assert!(fixture
        .scheduler
        .due_records()
        .await
        .contains(&"www".to_string()));
    fixture.scheduler.process_one("www").await;

    let live = fixture.store.load_live("www").unwrap().unwrap();
    assert_eq!(live.meta.san, vec!["alt.example.org", "www.example.org"]);
    assert_eq!(fake.issued(), 2);
}

#[tokio::test]
async fn reconcile_retires_removed_certificates() {
    let fake = FakeAcme::new("http-01");
    let mut certificates = BTreeMap::new();
    certificates.insert(
        "www".to_string(),
        cert_spec("www.example.org", &["www.example.org"], ChallengeKind::Http01),
    );
    let fixture = http_fixture(Arc::clone(&fake), certificates);
    fixture.scheduler.bootstrap(&fixture.certificates).unwrap();
    drive_to_live(&fixture, "www").await;
    let serial = fixture
        .store
        .load_live("www")
        .unwrap()
        .unwrap()
        .meta
        .serial;

    fixture.scheduler.reconcile(&BTreeMap::new()).await;

    assert_eq!(fixture.scheduler.status_of("www").await, None);
    assert!(fixture.store.load_live("www").unwrap().is_none());
    // Archived for the reader grace window, not deleted.
    assert!(fixture
        .store
        .base_path()
        .join("archive/www")
        .join(&serial)
        .join("fullchain.pem")
        .exists());
}
