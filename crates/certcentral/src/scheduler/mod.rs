//! The certificate scheduler.
//!
//! Owns one [`CertRecord`] per configured certificate and drives each
//! through the lifecycle: placeholder, ACME order, challenge solving,
//! finalize, download, publish, renewal. A small worker pool drains a
//! deadline-ordered ready queue; at most `concurrent_orders` records hold
//! in-flight ACME orders at once; every transition of a record happens
//! under its own async mutex, which is the only lock held across
//! suspensions.
//!
//! In-flight orders are persisted beside the store, so a shutdown in the
//! middle of an order resumes on the next start instead of starting over.

mod record;

pub use record::{renewal_deadline, CertRecord, CertStatus, PendingChallenge, PendingOrder};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use certcentral_common::{BackoffPolicy, ChallengeKind};
use certcentral_config::{CertificateConfig, SchedulerConfig};

use crate::acme::{AcmeApi, AcmeError, AuthorizationStatus, Order, OrderStatus};
use crate::challenge::{ChallengeJob, FulfillError, Fulfiller};
use crate::crypto::{self, CertKey, CryptoError};
use crate::health::{HealthReport, RecordHealth};
use crate::store::{CertStore, Material, StoreError};

/// Wall-clock limit for one authorization to validate.
const AUTHZ_DEADLINE: Duration = Duration::from_secs(120);

/// Wall-clock limit for a finalized order to turn valid.
const ORDER_DEADLINE: Duration = Duration::from_secs(180);

/// Ready-queue scan interval.
const TICK: Duration = Duration::from_secs(1);

/// Health document rewrite interval.
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for in-flight orders at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Failure of one lifecycle step for one record.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Fulfill(#[from] FulfillError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("certificate references unknown account '{0}'")]
    UnknownAccount(String),

    #[error("no fulfiller configured for {0} challenges")]
    UnconfiguredChallenge(ChallengeKind),

    #[error("order failed: {0}")]
    OrderFailed(String),

    /// The CA handed back a certificate no fresher than the live one.
    #[error("issued certificate does not outlive the current material")]
    StaleIssuance,
}

impl StepError {
    /// Failures only a configuration change can fix; the record parks in
    /// FAILED instead of burning retries.
    fn permanent(&self) -> bool {
        matches!(
            self,
            StepError::Crypto(_)
                | StepError::UnknownAccount(_)
                | StepError::UnconfiguredChallenge(_)
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            StepError::Acme(err) => err.retry_after(),
            _ => None,
        }
    }
}

struct RecordSlot {
    record: AsyncMutex<CertRecord>,
}

/// The engine's beating heart; shared behind an `Arc`.
pub struct Scheduler {
    store: Arc<CertStore>,
    acme: HashMap<String, Arc<dyn AcmeApi>>,
    fulfillers: HashMap<ChallengeKind, Arc<dyn Fulfiller>>,
    records: DashMap<String, Arc<RecordSlot>>,
    in_flight: Arc<DashSet<String>>,
    order_permits: Arc<Semaphore>,
    backoff: BackoffPolicy,
    renewal_ratio: f64,
    workers: usize,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<CertStore>,
        acme: HashMap<String, Arc<dyn AcmeApi>>,
        fulfillers: HashMap<ChallengeKind, Arc<dyn Fulfiller>>,
        config: &SchedulerConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            store,
            acme,
            fulfillers,
            records: DashMap::new(),
            in_flight: Arc::new(DashSet::new()),
            order_permits: Arc::new(Semaphore::new(config.concurrent_orders)),
            backoff: config.backoff_policy(),
            renewal_ratio: config.renewal_ratio,
            workers: config.workers,
            shutdown_tx,
        })
    }

    // =========================================================================
    // Bootstrap & reconcile
    // =========================================================================

    /// Materialize records from configuration and whatever the store
    /// already holds: completes interrupted publishes, resumes persisted
    /// orders, retires deconfigured names.
    pub fn bootstrap(
        &self,
        certificates: &BTreeMap<String, CertificateConfig>,
    ) -> Result<(), StoreError> {
        let recovered = self.store.recover()?;
        for name in &recovered {
            info!(cert = %name, "completed interrupted publish during startup");
        }

        let now = Utc::now();
        for (name, spec) in certificates {
            let meta = match self.store.load_live(name) {
                Ok(material) => material.map(|m| m.meta),
                Err(err) => {
                    warn!(cert = %name, error = %err, "unreadable live material, treating as absent");
                    None
                }
            };
            let pending = self.load_persisted_order(name);
            let record = CertRecord::from_startup(
                name.clone(),
                spec.clone(),
                meta,
                pending,
                self.renewal_ratio,
                now,
            );
            info!(cert = %name, status = %record.status, "certificate record created");
            self.records.insert(
                name.clone(),
                Arc::new(RecordSlot {
                    record: AsyncMutex::new(record),
                }),
            );
        }

        for name in self.store.list_live()? {
            if !certificates.contains_key(&name) {
                let _ = self.store.clear_order_state(&name);
                if let Err(err) = self.store.retire(&name) {
                    warn!(cert = %name, error = %err, "failed to retire deconfigured certificate");
                }
            }
        }
        Ok(())
    }

    /// Apply a reloaded configuration: add new records, retire removed
    /// ones, refresh specs. In-flight orders are never restarted; a
    /// removed record with an order in flight is retired once it settles.
    pub async fn reconcile(&self, certificates: &BTreeMap<String, CertificateConfig>) {
        let now = Utc::now();

        let existing: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
        for name in existing {
            if certificates.contains_key(&name) {
                continue;
            }
            if self.in_flight.contains(&name) {
                if let Some(slot) = self.records.get(&name).map(|e| Arc::clone(e.value())) {
                    slot.record.lock().await.removed = true;
                }
                info!(cert = %name, "removal deferred until in-flight order settles");
            } else {
                self.records.remove(&name);
                let _ = self.store.clear_order_state(&name);
                if let Err(err) = self.store.retire(&name) {
                    warn!(cert = %name, error = %err, "failed to retire removed certificate");
                }
                info!(cert = %name, "certificate record removed");
            }
        }

        for (name, spec) in certificates {
            match self.records.get(name).map(|e| Arc::clone(e.value())) {
                Some(slot) => {
                    let mut record = slot.record.lock().await;
                    record.spec = spec.clone();
                    record.removed = false;
                    if record.permanent_failure {
                        // Configuration changed; give the record another chance.
                        record.permanent_failure = false;
                        record.next_attempt = now;
                    }
                }
                None => {
                    let meta = self
                        .store
                        .load_live(name)
                        .ok()
                        .flatten()
                        .map(|m| m.meta);
                    let record = CertRecord::from_startup(
                        name.clone(),
                        spec.clone(),
                        meta,
                        None,
                        self.renewal_ratio,
                        now,
                    );
                    info!(cert = %name, status = %record.status, "certificate record added");
                    self.records.insert(
                        name.clone(),
                        Arc::new(RecordSlot {
                            record: AsyncMutex::new(record),
                        }),
                    );
                }
            }
        }
        info!(records = self.records.len(), "configuration reconciled");
    }

    fn load_persisted_order(&self, name: &str) -> Option<PendingOrder> {
        match self.store.load_order_state(name) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(pending) => Some(pending),
                Err(err) => {
                    warn!(cert = name, error = %err, "discarding unreadable order state");
                    let _ = self.store.clear_order_state(name);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(cert = name, error = %err, "failed to read order state");
                None
            }
        }
    }

    // =========================================================================
    // Run loop
    // =========================================================================

    /// Run tick loop and worker pool until shutdown is requested, then
    /// drain in-flight work within the grace period.
    pub async fn run(self: Arc<Self>) {
        let (tx, rx) = mpsc::channel::<String>((self.records.len() + 1).max(16));
        let rx = Arc::new(AsyncMutex::new(rx));

        let mut workers = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let scheduler = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            let mut shutdown = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                loop {
                    let name = {
                        let mut queue = rx.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            name = queue.recv() => match name {
                                Some(name) => name,
                                None => break,
                            },
                        }
                    };
                    scheduler.process_one(&name).await;
                    scheduler.in_flight.remove(&name);
                }
                debug!(worker_id, "worker stopped");
            }));
        }

        info!(workers = self.workers, "scheduler running");
        self.write_health().await;
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(TICK);
        let mut last_health = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    for name in self.due_records().await {
                        if self.in_flight.insert(name.clone()) && tx.send(name).await.is_err() {
                            break;
                        }
                    }
                    if last_health.elapsed() >= HEALTH_INTERVAL {
                        self.write_health().await;
                        last_health = Instant::now();
                    }
                }
            }
        }

        info!("scheduler stopping, waiting for in-flight orders");
        drop(tx);
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.in_flight.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for worker in &workers {
            worker.abort();
        }
        self.write_health().await;
        info!("scheduler stopped");
    }

    /// Ask the run loop to stop admitting work and wind down.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Names ready for a worker, ordered by next-attempt deadline. Also
    /// performs the cheap per-tick sweeps: expiry detection and
    /// subjects-changed promotion.
    pub async fn due_records(&self) -> Vec<String> {
        let now = Utc::now();
        let mut due: Vec<(chrono::DateTime<Utc>, String)> = Vec::new();
        for entry in self.records.iter() {
            if self.in_flight.contains(entry.key()) {
                continue;
            }
            let Ok(mut record) = entry.value().record.try_lock() else {
                continue;
            };
            if record.status == CertStatus::Live {
                if let Some(meta) = record.meta.clone() {
                    if meta.expired_at(now) {
                        warn!(
                            cert = %record.name,
                            not_after = %meta.not_after,
                            "live certificate expired"
                        );
                        record.transition(CertStatus::Expired, now);
                        record.next_attempt = now;
                    }
                }
            }
            if record.due(now) {
                due.push((record.next_attempt, entry.key().clone()));
            }
        }
        due.sort();
        due.into_iter().map(|(_, name)| name).collect()
    }

    // =========================================================================
    // Record driving
    // =========================================================================

    /// Run the due step(s) for one record. The record's mutex is held for
    /// the whole call, serializing its transitions.
    pub async fn process_one(&self, name: &str) {
        let Some(slot) = self.records.get(name).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let mut record = slot.record.lock().await;
        let now = Utc::now();
        if !record.due(now) {
            return;
        }

        let result = match record.status {
            CertStatus::Initial => self.create_placeholder(&mut record),
            CertStatus::Ordering
            | CertStatus::Authorizing
            | CertStatus::Finalizing
            | CertStatus::Downloading => self.resume_order(&mut record).await,
            CertStatus::SelfSigned
            | CertStatus::Live
            | CertStatus::Failed
            | CertStatus::Expired
            | CertStatus::Revoking => self.start_order(&mut record).await,
        };

        if let Err(err) = result {
            self.handle_step_error(&mut record, err);
        }

        if record.removed && !record.status.has_order_in_flight() {
            let name = record.name.clone();
            drop(record);
            self.records.remove(&name);
            let _ = self.store.clear_order_state(&name);
            if let Err(err) = self.store.retire(&name) {
                warn!(cert = %name, error = %err, "failed to retire removed certificate");
            }
        }
    }

    /// INITIAL: publish the self-signed placeholder so the distribution
    /// API has something to serve, then order for real next tick.
    fn create_placeholder(&self, record: &mut CertRecord) -> Result<(), StepError> {
        let sans = record.spec.canonical_sans();
        let key = CertKey::generate(record.spec.key_type)?;
        let cert_pem = crypto::self_signed_placeholder(&key, &record.spec.cn, &sans)?;
        let material = Material::assemble(&record.name, key.to_pem(), cert_pem, String::new(), true)?;
        self.store.publish(&record.name, &material)?;

        let now = Utc::now();
        record.meta = Some(material.meta);
        record.transition(CertStatus::SelfSigned, now);
        record.next_attempt = now;
        info!(cert = %record.name, "self-signed placeholder published");
        Ok(())
    }

    /// Begin a fresh ACME order and drive it to completion.
    async fn start_order(&self, record: &mut CertRecord) -> Result<(), StepError> {
        let acme = self.acme_for(&record.spec.account)?;
        let Ok(_permit) = Arc::clone(&self.order_permits).acquire_owned().await else {
            return Ok(());
        };

        let sans = record.spec.canonical_sans();
        let key = CertKey::generate(record.spec.key_type)?;
        let csr_der = crypto::build_csr(&key, &record.spec.cn, &sans)?;

        let (order_url, order) = acme.new_order(&sans).await?;
        record.pending = Some(PendingOrder {
            order_url,
            authorizations: order.authorizations.clone(),
            finalize_url: order.finalize.clone(),
            key_pem: key.to_pem(),
            csr_der,
            challenges: Vec::new(),
        });
        record.transition(CertStatus::Ordering, Utc::now());
        self.persist_pending(record);

        self.advance_order(record, &acme, order).await
    }

    /// Pick an interrupted order back up from wherever the CA says it is.
    async fn resume_order(&self, record: &mut CertRecord) -> Result<(), StepError> {
        let Some(pending) = record.pending.clone() else {
            // In-flight status without order state; fall back to a fresh
            // order next tick.
            let now = Utc::now();
            record.transition(CertStatus::Failed, now);
            record.next_attempt = now;
            return Ok(());
        };

        let acme = self.acme_for(&record.spec.account)?;
        let Ok(_permit) = Arc::clone(&self.order_permits).acquire_owned().await else {
            return Ok(());
        };

        let order = acme.fetch_order(&pending.order_url).await?;
        info!(
            cert = %record.name,
            order_status = ?order.status,
            "resuming in-flight order"
        );
        self.advance_order(record, &acme, order).await
    }

    /// Drive an order from its current server-side status to LIVE.
    async fn advance_order(
        &self,
        record: &mut CertRecord,
        acme: &Arc<dyn AcmeApi>,
        mut order: Order,
    ) -> Result<(), StepError> {
        if order.status == OrderStatus::Invalid {
            return Err(StepError::OrderFailed("order reported invalid".into()));
        }

        if order.status == OrderStatus::Pending {
            record.transition(CertStatus::Authorizing, Utc::now());
            self.solve_authorizations(record, acme).await?;
            order.status = OrderStatus::Ready;
        }

        if order.status == OrderStatus::Ready {
            record.transition(CertStatus::Finalizing, Utc::now());
            self.persist_pending(record);
            let Some(pending) = record.pending.as_ref() else {
                return Err(StepError::OrderFailed("pending order state lost".into()));
            };
            order = acme
                .finalize_order(&pending.finalize_url, &pending.csr_der)
                .await?;
        }

        if order.status == OrderStatus::Processing
            || (order.status == OrderStatus::Valid && order.certificate.is_none())
        {
            let Some(pending) = record.pending.as_ref() else {
                return Err(StepError::OrderFailed("pending order state lost".into()));
            };
            order = acme
                .poll_order(&pending.order_url, Instant::now() + ORDER_DEADLINE)
                .await?;
        }

        if order.status == OrderStatus::Invalid {
            return Err(StepError::OrderFailed(
                "order turned invalid after finalize".into(),
            ));
        }

        record.transition(CertStatus::Downloading, Utc::now());
        self.persist_pending(record);
        let certificate_url = order.certificate.ok_or_else(|| {
            StepError::OrderFailed("valid order carries no certificate URL".into())
        })?;
        let chain_pem = acme.download_certificate(&certificate_url).await?;
        self.install(record, &chain_pem)
    }

    /// Prove control of every identifier in the pending order.
    async fn solve_authorizations(
        &self,
        record: &mut CertRecord,
        acme: &Arc<dyn AcmeApi>,
    ) -> Result<(), StepError> {
        let kind = record.spec.challenge;
        let fulfiller = self.fulfiller_for(kind)?;
        let authz_urls = record
            .pending
            .as_ref()
            .map(|p| p.authorizations.clone())
            .unwrap_or_default();

        for url in authz_urls {
            let authz = acme.get_authorization(&url).await?;
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            if authz.status != AuthorizationStatus::Pending {
                return Err(StepError::OrderFailed(format!(
                    "authorization for {} is {:?}",
                    authz.identifier.value, authz.status
                )));
            }

            let challenge = authz.challenge(kind.as_str()).ok_or_else(|| {
                StepError::OrderFailed(format!(
                    "server offered no {kind} challenge for {}",
                    authz.identifier.value
                ))
            })?;
            let identifier = if authz.wildcard {
                format!("*.{}", authz.identifier.value)
            } else {
                authz.identifier.value.clone()
            };
            let job = ChallengeJob {
                identifier,
                token: challenge.token.clone(),
                key_authorization: acme.key_authorization(&challenge.token),
            };
            let challenge_url = challenge.url.clone();

            if let Some(pending) = record.pending.as_mut() {
                if !pending.challenges.iter().any(|c| c.token == job.token) {
                    pending.challenges.push((&job).into());
                }
            }
            self.persist_pending(record);

            fulfiller.provision(&job).await?;
            acme.respond_to_challenge(&challenge_url).await?;

            let status = acme
                .poll_authorization(&url, Instant::now() + AUTHZ_DEADLINE)
                .await?;
            if status != AuthorizationStatus::Valid {
                return Err(StepError::OrderFailed(format!(
                    "authorization for {} finished {:?}",
                    authz.identifier.value, status
                )));
            }
        }
        Ok(())
    }

    /// Publish downloaded material and move the record to LIVE.
    fn install(&self, record: &mut CertRecord, chain_pem: &str) -> Result<(), StepError> {
        let Some(pending) = record.pending.clone() else {
            return Err(StepError::OrderFailed("pending order state lost".into()));
        };

        let (leaf_pem, intermediates) = crypto::x509::split_chain(chain_pem)?;
        let material = Material::assemble(
            &record.name,
            pending.key_pem.clone(),
            leaf_pem,
            intermediates,
            false,
        )?;

        // Monotone freshness: never supersede live material with a cert
        // that does not outlive it, unless the live one is already gone.
        if let Some(current) = &record.meta {
            if !current.self_signed
                && !current.expired_at(Utc::now())
                && material.meta.not_after <= current.not_after
            {
                return Err(StepError::StaleIssuance);
            }
        }

        self.store.publish(&record.name, &material)?;
        let _ = self.store.clear_order_state(&record.name);
        self.spawn_cleanup(record.spec.challenge, &pending.challenges);

        info!(
            cert = %record.name,
            serial = %material.meta.serial,
            not_after = %material.meta.not_after,
            "certificate issued and live"
        );
        record.record_success(material.meta, self.renewal_ratio, Utc::now());
        Ok(())
    }

    /// Administrative revocation: revoke the live leaf, then re-enter
    /// issuance immediately.
    pub async fn revoke(&self, name: &str, reason: u8) -> Result<(), StepError> {
        let Some(slot) = self.records.get(name).map(|e| Arc::clone(e.value())) else {
            return Err(StepError::OrderFailed(format!(
                "unknown certificate '{name}'"
            )));
        };
        let mut record = slot.record.lock().await;
        let acme = self.acme_for(&record.spec.account)?;
        let Some(material) = self.store.load_live(name)? else {
            return Err(StepError::OrderFailed(format!(
                "no live material for '{name}'"
            )));
        };
        let leaf_der = pem::parse(&material.cert_pem)
            .map_err(|e| CryptoError::Params(format!("live leaf unparseable: {e}")))?
            .contents()
            .to_vec();

        let now = Utc::now();
        record.transition(CertStatus::Revoking, now);
        acme.revoke(&leaf_der, reason).await?;
        record.next_attempt = now;
        info!(cert = name, reason, "certificate revoked, reissuing");
        Ok(())
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn handle_step_error(&self, record: &mut CertRecord, err: StepError) {
        let permanent = err.permanent();
        error!(
            cert = %record.name,
            state = %record.status,
            error = %err,
            permanent,
            "certificate step failed"
        );
        if let Some(pending) = record.pending.take() {
            self.spawn_cleanup(record.spec.challenge, &pending.challenges);
        }
        let _ = self.store.clear_order_state(&record.name);
        record.record_failure(&self.backoff, err.retry_after(), permanent, Utc::now());
    }

    fn acme_for(&self, account: &str) -> Result<Arc<dyn AcmeApi>, StepError> {
        self.acme
            .get(account)
            .cloned()
            .ok_or_else(|| StepError::UnknownAccount(account.to_string()))
    }

    fn fulfiller_for(&self, kind: ChallengeKind) -> Result<Arc<dyn Fulfiller>, StepError> {
        self.fulfillers
            .get(&kind)
            .cloned()
            .ok_or(StepError::UnconfiguredChallenge(kind))
    }

    /// Challenge cleanup never blocks the success path: fire and forget,
    /// the fulfiller retries internally.
    fn spawn_cleanup(&self, kind: ChallengeKind, challenges: &[PendingChallenge]) {
        if challenges.is_empty() {
            return;
        }
        let Some(fulfiller) = self.fulfillers.get(&kind).cloned() else {
            return;
        };
        let jobs: Vec<ChallengeJob> = challenges.iter().map(|c| c.to_job()).collect();
        tokio::spawn(async move {
            for job in jobs {
                fulfiller.cleanup(&job).await;
            }
        });
    }

    fn persist_pending(&self, record: &CertRecord) {
        let Some(pending) = &record.pending else {
            return;
        };
        match serde_json::to_string(pending) {
            Ok(json) => {
                if let Err(err) = self.store.save_order_state(&record.name, &json) {
                    warn!(cert = %record.name, error = %err, "failed to persist order state");
                }
            }
            Err(err) => {
                warn!(cert = %record.name, error = %err, "failed to encode order state");
            }
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub async fn health_snapshot(&self) -> HealthReport {
        let mut records = BTreeMap::new();
        for entry in self.records.iter() {
            let Ok(record) = entry.value().record.try_lock() else {
                continue;
            };
            records.insert(
                record.name.clone(),
                RecordHealth {
                    status: record.status,
                    consecutive_failures: record.consecutive_failures,
                    next_attempt: record.next_attempt,
                    not_after: record.meta.as_ref().map(|m| m.not_after),
                    self_signed: record.meta.as_ref().is_some_and(|m| m.self_signed),
                },
            );
        }
        HealthReport {
            updated_at: Utc::now(),
            records,
        }
    }

    async fn write_health(&self) {
        let report = self.health_snapshot().await;
        if let Err(err) = crate::health::write_report(self.store.base_path(), &report) {
            warn!(error = %err, "failed to write health report");
        }
    }

    /// Current status of one record, mainly for tests and the health
    /// surface.
    pub async fn status_of(&self, name: &str) -> Option<CertStatus> {
        let slot = self.records.get(name).map(|e| Arc::clone(e.value()))?;
        let record = slot.record.lock().await;
        Some(record.status)
    }
}
