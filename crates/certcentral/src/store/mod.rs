//! On-disk certificate store.
//!
//! Layout under the configured base path:
//!
//! ```text
//! <base>/live/<name>/privkey.pem     # mode 0600
//! <base>/live/<name>/cert.pem        # leaf only
//! <base>/live/<name>/chain.pem       # intermediates
//! <base>/live/<name>/fullchain.pem   # leaf + intermediates
//! <base>/live/<name>/meta.json       # serial, validity, fingerprint, SANs
//! <base>/new/<name>/...              # staging area during publish
//! <base>/archive/<name>/<serial>/    # superseded versions, newest N kept
//! ```
//!
//! Publishing stages the full set under `new/`, fsyncs, then renames
//! `live/<name>` into the archive and `new/<name>` into place. The two
//! renames are not one atomic operation, so readers go meta-first: accept
//! the set iff `meta.json`'s fingerprint matches the private key's public
//! component and its serial matches the leaf, retrying once on mismatch.
//! The writer is this engine alone; the distribution API only reads.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use chrono::{DateTime, Utc};

use crate::crypto::keys::fingerprint_of_key_pem;
use crate::crypto::{CryptoError, LeafInfo};

const PRIVKEY_FILE: &str = "privkey.pem";
const CERT_FILE: &str = "cert.pem";
const CHAIN_FILE: &str = "chain.pem";
const FULLCHAIN_FILE: &str = "fullchain.pem";
const META_FILE: &str = "meta.json";

/// Store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A set that remained mismatched after the reader retry.
    #[error("inconsistent material for '{name}': {reason}")]
    Inconsistent { name: String, reason: String },

    #[error("metadata encoding error: {0}")]
    Meta(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Published metadata, readable by the distribution API before it touches
/// the PEMs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub serial: String,
    /// Hex SHA-256 of the key's SubjectPublicKeyInfo.
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub san: Vec<String>,
    /// Present (true) only for the placeholder issued before ACME first
    /// succeeds, so consumers can skip advertising it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub self_signed: bool,
}

impl Meta {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }
}

/// A complete, internally consistent material set.
#[derive(Debug, Clone)]
pub struct Material {
    pub privkey_pem: String,
    pub cert_pem: String,
    pub chain_pem: String,
    pub meta: Meta,
}

impl Material {
    /// Pair a private key with a leaf (+ optional chain), deriving the
    /// metadata and refusing mismatched inputs up front.
    pub fn assemble(
        name: &str,
        privkey_pem: String,
        cert_pem: String,
        chain_pem: String,
        self_signed: bool,
    ) -> Result<Self, StoreError> {
        let leaf = LeafInfo::from_pem(&cert_pem)?;
        let fingerprint = fingerprint_of_key_pem(&privkey_pem)?;
        if leaf.spki_fingerprint != fingerprint {
            return Err(StoreError::Inconsistent {
                name: name.to_string(),
                reason: "private key does not match certificate public key".to_string(),
            });
        }
        Ok(Self {
            privkey_pem,
            cert_pem,
            chain_pem,
            meta: Meta {
                serial: leaf.serial,
                fingerprint,
                not_before: leaf.not_before,
                not_after: leaf.not_after,
                san: leaf.san,
                self_signed,
            },
        })
    }

    pub fn fullchain_pem(&self) -> String {
        format!("{}{}", self.cert_pem, self.chain_pem)
    }
}

/// The single writer of the on-disk layout.
pub struct CertStore {
    base: PathBuf,
    archive_keep: usize,
}

impl CertStore {
    /// Open (creating directories as needed) the store at `base`.
    pub fn open(base: &Path, archive_keep: usize) -> Result<Self, StoreError> {
        for sub in ["live", "new", "archive", "orders"] {
            let dir = base.join(sub);
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        info!(base = %base.display(), "certificate store opened");
        Ok(Self {
            base: base.to_path_buf(),
            archive_keep,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    fn live_dir(&self, name: &str) -> PathBuf {
        self.base.join("live").join(name)
    }

    fn new_dir(&self, name: &str) -> PathBuf {
        self.base.join("new").join(name)
    }

    fn archive_dir(&self, name: &str) -> PathBuf {
        self.base.join("archive").join(name)
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Stage a material set under `new/<name>`, fsynced, not yet visible.
    pub fn stage(&self, name: &str, material: &Material) -> Result<(), StoreError> {
        let dir = self.new_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        write_file(&dir.join(PRIVKEY_FILE), &material.privkey_pem, 0o600)?;
        write_file(&dir.join(CERT_FILE), &material.cert_pem, 0o640)?;
        write_file(&dir.join(CHAIN_FILE), &material.chain_pem, 0o640)?;
        write_file(&dir.join(FULLCHAIN_FILE), &material.fullchain_pem(), 0o640)?;
        write_file(
            &dir.join(META_FILE),
            &serde_json::to_string_pretty(&material.meta)?,
            0o640,
        )?;
        sync_dir(&dir)?;
        Ok(())
    }

    /// Atomically replace the live set with a staged one. The current live
    /// material moves into the archive first, so a failure before the
    /// second rename never loses it.
    pub fn publish(&self, name: &str, material: &Material) -> Result<(), StoreError> {
        self.stage(name, material)?;
        self.promote_staged(name)?;
        info!(
            cert = name,
            serial = %material.meta.serial,
            not_after = %material.meta.not_after,
            self_signed = material.meta.self_signed,
            "certificate material published"
        );
        Ok(())
    }

    fn promote_staged(&self, name: &str) -> Result<(), StoreError> {
        let live = self.live_dir(name);
        let staged = self.new_dir(name);

        if live.exists() {
            let old_serial = self
                .read_meta(&live)
                .map(|m| m.serial)
                .unwrap_or_else(|_| format!("unknown-{}", Utc::now().timestamp()));
            let archive_parent = self.archive_dir(name);
            fs::create_dir_all(&archive_parent).map_err(|e| io_err(&archive_parent, e))?;
            let mut archived = archive_parent.join(&old_serial);
            if archived.exists() {
                archived = archive_parent.join(format!(
                    "{old_serial}-{}",
                    Utc::now().timestamp_millis()
                ));
            }
            fs::rename(&live, &archived).map_err(|e| io_err(&live, e))?;
            debug!(cert = name, archived = %archived.display(), "previous material archived");
        }

        fs::rename(&staged, &live).map_err(|e| io_err(&staged, e))?;
        sync_dir(&self.base.join("live"))?;
        sync_dir(&self.base.join("new"))?;
        self.prune_archive(name)?;
        Ok(())
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Meta-first validated read of the live set.
    ///
    /// On mismatch (a reader racing the rename pair) the read is retried
    /// once; a second mismatch is surfaced.
    pub fn load_live(&self, name: &str) -> Result<Option<Material>, StoreError> {
        match self.load_validated(&self.live_dir(name), name) {
            Err(StoreError::Inconsistent { .. }) => {
                warn!(cert = name, "live set mismatched, retrying read");
                self.load_validated(&self.live_dir(name), name)
            }
            other => other,
        }
    }

    fn read_meta(&self, dir: &Path) -> Result<Meta, StoreError> {
        let path = dir.join(META_FILE);
        let raw = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn load_validated(&self, dir: &Path, name: &str) -> Result<Option<Material>, StoreError> {
        if !dir.join(META_FILE).exists() {
            return Ok(None);
        }
        let meta = self.read_meta(dir)?;

        let read = |file: &str| -> Result<String, StoreError> {
            let path = dir.join(file);
            fs::read_to_string(&path).map_err(|e| io_err(&path, e))
        };
        let privkey_pem = read(PRIVKEY_FILE)?;
        let cert_pem = read(CERT_FILE)?;
        let chain_pem = read(CHAIN_FILE)?;

        let fingerprint = fingerprint_of_key_pem(&privkey_pem)?;
        if fingerprint != meta.fingerprint {
            return Err(StoreError::Inconsistent {
                name: name.to_string(),
                reason: "meta fingerprint does not match private key".to_string(),
            });
        }
        let leaf = LeafInfo::from_pem(&cert_pem)?;
        if leaf.serial != meta.serial {
            return Err(StoreError::Inconsistent {
                name: name.to_string(),
                reason: "meta serial does not match certificate".to_string(),
            });
        }

        Ok(Some(Material {
            privkey_pem,
            cert_pem,
            chain_pem,
            meta,
        }))
    }

    /// Names that currently have a live set.
    pub fn list_live(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.base.join("live");
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    // =========================================================================
    // Recovery & retirement
    // =========================================================================

    /// Finish publishes interrupted between the two renames: a consistent
    /// `new/<name>` with no `live/<name>` is promoted; stale staging next
    /// to an intact live set is discarded.
    pub fn recover(&self) -> Result<Vec<String>, StoreError> {
        let new_root = self.base.join("new");
        let mut recovered = Vec::new();
        for entry in fs::read_dir(&new_root).map_err(|e| io_err(&new_root, e))? {
            let entry = entry.map_err(|e| io_err(&new_root, e))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };

            if self.live_dir(&name).exists() {
                let staged = self.new_dir(&name);
                warn!(cert = %name, "discarding stale staging directory");
                fs::remove_dir_all(&staged).map_err(|e| io_err(&staged, e))?;
                continue;
            }

            match self.load_validated(&self.new_dir(&name), &name) {
                Ok(Some(_)) => {
                    info!(cert = %name, "completing interrupted publish");
                    self.promote_staged(&name)?;
                    recovered.push(name);
                }
                Ok(None) | Err(_) => {
                    let staged = self.new_dir(&name);
                    warn!(cert = %name, "discarding unusable staging directory");
                    fs::remove_dir_all(&staged).map_err(|e| io_err(&staged, e))?;
                }
            }
        }
        Ok(recovered)
    }

    /// Move a deconfigured certificate's live set into the archive; readers
    /// get a grace window instead of an abrupt delete.
    pub fn retire(&self, name: &str) -> Result<(), StoreError> {
        let live = self.live_dir(name);
        if !live.exists() {
            return Ok(());
        }
        let serial = self
            .read_meta(&live)
            .map(|m| m.serial)
            .unwrap_or_else(|_| format!("retired-{}", Utc::now().timestamp()));
        let archive_parent = self.archive_dir(name);
        fs::create_dir_all(&archive_parent).map_err(|e| io_err(&archive_parent, e))?;
        let target = archive_parent.join(&serial);
        fs::rename(&live, &target).map_err(|e| io_err(&live, e))?;
        info!(cert = name, archived = %target.display(), "certificate retired");
        Ok(())
    }

    // =========================================================================
    // In-flight order state
    // =========================================================================

    fn order_state_path(&self, name: &str) -> PathBuf {
        self.base.join("orders").join(format!("{name}.json"))
    }

    /// Persist a record's in-flight order so a restart resumes it instead
    /// of abandoning it. The blob contains the order's fresh private key,
    /// so it gets key permissions.
    pub fn save_order_state(&self, name: &str, json: &str) -> Result<(), StoreError> {
        write_file(&self.order_state_path(name), json, 0o600)
    }

    pub fn load_order_state(&self, name: &str) -> Result<Option<String>, StoreError> {
        let path = self.order_state_path(name);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path).map(Some).map_err(|e| io_err(&path, e))
    }

    pub fn clear_order_state(&self, name: &str) -> Result<(), StoreError> {
        let path = self.order_state_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    fn prune_archive(&self, name: &str) -> Result<(), StoreError> {
        let dir = self.archive_dir(name);
        if !dir.exists() {
            return Ok(());
        }
        let mut versions: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let path = entry.path();
            if path.is_dir() {
                let mtime = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                versions.push((mtime, path));
            }
        }
        if versions.len() <= self.archive_keep {
            return Ok(());
        }
        versions.sort_by_key(|(mtime, _)| *mtime);
        let excess = versions.len() - self.archive_keep;
        for (_, path) in versions.into_iter().take(excess) {
            debug!(removed = %path.display(), "pruning archived version");
            fs::remove_dir_all(&path).map_err(|e| io_err(&path, e))?;
        }
        Ok(())
    }
}

/// Write + fsync with the given mode.
fn write_file(path: &Path, contents: &str, mode: u32) -> Result<(), StoreError> {
    fs::write(path, contents).map_err(|e| io_err(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| io_err(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    let file = fs::File::open(path).map_err(|e| io_err(path, e))?;
    file.sync_all().map_err(|e| io_err(path, e))?;
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        let handle = fs::File::open(dir).map_err(|e| io_err(dir, e))?;
        handle.sync_all().map_err(|e| io_err(dir, e))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self_signed_placeholder, CertKey};
    use certcentral_common::KeyKind;

    fn material_for(name: &str, self_signed: bool) -> Material {
        let key = CertKey::generate(KeyKind::EcdsaP256).unwrap();
        let san = vec![format!("{name}.example.org")];
        let cert = self_signed_placeholder(&key, &san[0], &san).unwrap();
        Material::assemble(name, key.to_pem(), cert, String::new(), self_signed).unwrap()
    }

    fn open_store(dir: &Path) -> CertStore {
        CertStore::open(dir, 2).unwrap()
    }

    #[test]
    fn test_publish_then_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let material = material_for("www", true);

        store.publish("www", &material).unwrap();

        let loaded = store.load_live("www").unwrap().unwrap();
        assert_eq!(loaded.meta, material.meta);
        assert_eq!(loaded.privkey_pem, material.privkey_pem);
        assert!(loaded.meta.self_signed);
    }

    #[test]
    fn test_meta_self_signed_absent_for_issued_material() {
        let material = material_for("www", false);
        let json = serde_json::to_string(&material.meta).unwrap();
        assert!(!json.contains("self_signed"));

        let placeholder = material_for("www", true);
        let json = serde_json::to_string(&placeholder.meta).unwrap();
        assert!(json.contains("\"self_signed\": true") || json.contains("\"self_signed\":true"));
    }

    #[test]
    fn test_load_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        assert!(store.load_live("absent").unwrap().is_none());
    }

    #[test]
    fn test_assemble_rejects_foreign_key() {
        let key_a = CertKey::generate(KeyKind::EcdsaP256).unwrap();
        let key_b = CertKey::generate(KeyKind::EcdsaP256).unwrap();
        let san = vec!["www.example.org".to_string()];
        let cert = self_signed_placeholder(&key_a, &san[0], &san).unwrap();
        let err = Material::assemble("www", key_b.to_pem(), cert, String::new(), false)
            .unwrap_err();
        assert!(matches!(err, StoreError::Inconsistent { .. }));
    }

    #[test]
    fn test_publish_archives_previous_version() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let first = material_for("www", true);
        let second = material_for("www", false);
        store.publish("www", &first).unwrap();
        store.publish("www", &second).unwrap();

        let live = store.load_live("www").unwrap().unwrap();
        assert_eq!(live.meta.serial, second.meta.serial);

        let archived = tmp
            .path()
            .join("archive/www")
            .join(&first.meta.serial);
        assert!(archived.join("cert.pem").exists());
    }

    #[test]
    fn test_archive_pruned_to_keep_count() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()); // keep 2

        for _ in 0..4 {
            store.publish("www", &material_for("www", false)).unwrap();
        }

        let versions = fs::read_dir(tmp.path().join("archive/www"))
            .unwrap()
            .count();
        assert_eq!(versions, 2);
    }

    #[test]
    fn test_tampered_meta_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let material = material_for("www", false);
        store.publish("www", &material).unwrap();

        let meta_path = tmp.path().join("live/www/meta.json");
        let mut meta: Meta =
            serde_json::from_str(&fs::read_to_string(&meta_path).unwrap()).unwrap();
        meta.fingerprint = "00".repeat(32);
        fs::write(&meta_path, serde_json::to_string(&meta).unwrap()).unwrap();

        let err = store.load_live("www").unwrap_err();
        assert!(matches!(err, StoreError::Inconsistent { .. }));
    }

    #[test]
    fn test_recover_completes_interrupted_publish() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let v1 = material_for("www", true);
        let v2 = material_for("www", false);
        store.publish("www", &v1).unwrap();

        // Simulate a crash between the two renames: live moved to archive,
        // staged set still waiting under new/.
        store.stage("www", &v2).unwrap();
        let live = tmp.path().join("live/www");
        let archived = tmp.path().join("archive/www").join(&v1.meta.serial);
        fs::create_dir_all(archived.parent().unwrap()).unwrap();
        fs::rename(&live, &archived).unwrap();

        let recovered = store.recover().unwrap();
        assert_eq!(recovered, vec!["www".to_string()]);

        let loaded = store.load_live("www").unwrap().unwrap();
        assert_eq!(loaded.meta.serial, v2.meta.serial);
    }

    #[test]
    fn test_recover_discards_stale_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let live = material_for("www", false);
        store.publish("www", &live).unwrap();
        store.stage("www", &material_for("www", false)).unwrap();

        let recovered = store.recover().unwrap();
        assert!(recovered.is_empty());
        assert!(!tmp.path().join("new/www").exists());
        // Live untouched.
        assert_eq!(
            store.load_live("www").unwrap().unwrap().meta.serial,
            live.meta.serial
        );
    }

    #[test]
    fn test_retire_moves_live_to_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let material = material_for("www", false);
        store.publish("www", &material).unwrap();

        store.retire("www").unwrap();

        assert!(store.load_live("www").unwrap().is_none());
        assert!(tmp
            .path()
            .join("archive/www")
            .join(&material.meta.serial)
            .join("privkey.pem")
            .exists());
    }

    #[test]
    fn test_list_live() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        store.publish("alpha", &material_for("alpha", false)).unwrap();
        store.publish("beta", &material_for("beta", false)).unwrap();
        assert_eq!(store.list_live().unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_order_state_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        assert!(store.load_order_state("www").unwrap().is_none());
        store.save_order_state("www", r#"{"order_url":"u"}"#).unwrap();
        assert_eq!(
            store.load_order_state("www").unwrap().unwrap(),
            r#"{"order_url":"u"}"#
        );
        store.clear_order_state("www").unwrap();
        assert!(store.load_order_state("www").unwrap().is_none());
        // Clearing twice is fine.
        store.clear_order_state("www").unwrap();
    }

    #[test]
    fn test_privkey_mode_0600() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let tmp = tempfile::tempdir().unwrap();
            let store = open_store(tmp.path());
            store.publish("www", &material_for("www", false)).unwrap();
            let mode = fs::metadata(tmp.path().join("live/www/privkey.pem"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
            let mode = fs::metadata(tmp.path().join("live/www/cert.pem"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o640);
        }
    }
}
