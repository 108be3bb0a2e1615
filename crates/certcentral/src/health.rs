//! Health surface.
//!
//! The engine exposes no ABI beyond the filesystem, so health is a JSON
//! document in the store base path, atomically rewritten by the scheduler.
//! The distribution API reads it to decide what to advertise; operators
//! read it to see where each record stands.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::scheduler::CertStatus;

pub const HEALTH_FILE: &str = "health.json";

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub updated_at: DateTime<Utc>,
    pub records: BTreeMap<String, RecordHealth>,
}

#[derive(Debug, Serialize)]
pub struct RecordHealth {
    pub status: CertStatus,
    pub consecutive_failures: u32,
    pub next_attempt: DateTime<Utc>,
    pub not_after: Option<DateTime<Utc>>,
    pub self_signed: bool,
}

/// Write the report next to the certificate layout, atomically
/// (temp + rename) so readers never see a torn document.
pub fn write_report(base: &Path, report: &HealthReport) -> io::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    let tmp = base.join(".health.json.tmp");
    let target = base.join(HEALTH_FILE);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_report_atomic_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = BTreeMap::new();
        records.insert(
            "www".to_string(),
            RecordHealth {
                status: CertStatus::Live,
                consecutive_failures: 0,
                next_attempt: Utc::now(),
                not_after: Some(Utc::now()),
                self_signed: false,
            },
        );
        let report = HealthReport {
            updated_at: Utc::now(),
            records,
        };

        write_report(dir.path(), &report).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(HEALTH_FILE)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["records"]["www"]["status"], "LIVE");
        assert!(!dir.path().join(".health.json.tmp").exists());
    }

    #[test]
    fn test_status_spelling_matches_state_table() {
        let json = serde_json::to_string(&CertStatus::SelfSigned).unwrap();
        assert_eq!(json, "\"SELF_SIGNED\"");
    }
}
