use std::path::{Path, PathBuf};

use chrono::Utc;
use log::debug;
use sled::IVec;

use super::{
    sms_key, SimFilter, SimRecord, SimStore, SimUpdate, SmsRecord, SmsStore, StoreError,
    SIM_SCHEMA_VERSION, SMS_SCHEMA_VERSION,
};

const TREE_SIMS: &str = "sims";
const TREE_SMS: &str = "sms";

/// Sled-backed registry holding both SIM and SMS records.
pub struct SledStore {
    db: sled::Db,
    sims: sled::Tree,
    sms: sled::Tree,
}

impl SledStore {
    /// Open (or create) the registry rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let sims = db.open_tree(TREE_SIMS)?;
        let sms = db.open_tree(TREE_SMS)?;
        debug!("Registry opened at {}", path_ref.display());
        Ok(Self { db, sims, sms })
    }

    /// Registry directory under the configured data dir.
    pub fn path_in(data_dir: &str) -> PathBuf {
        Path::new(data_dir).join("registry")
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn sim_key(iccid: &str) -> Vec<u8> {
        format!("sims:{}", iccid).into_bytes()
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize_sim(bytes: &[u8]) -> Result<SimRecord, StoreError> {
        let record: SimRecord = bincode::deserialize(bytes)?;
        if record.schema_version != SIM_SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                entity: "sim",
                expected: SIM_SCHEMA_VERSION,
                found: record.schema_version,
            });
        }
        Ok(record)
    }

    fn deserialize_sms(bytes: &[u8]) -> Result<SmsRecord, StoreError> {
        let record: SmsRecord = bincode::deserialize(bytes)?;
        if record.schema_version != SMS_SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                entity: "sms",
                expected: SMS_SCHEMA_VERSION,
                found: record.schema_version,
            });
        }
        Ok(record)
    }

    /// Compare-and-swap loop over one SIM key. `edit` returns false to leave the record
    /// untouched; a decode or encode failure aborts without writing.
    fn modify_sim<F>(&self, iccid: &str, mut edit: F) -> Result<Option<SimRecord>, StoreError>
    where
        F: FnMut(Option<SimRecord>) -> Option<SimRecord>,
    {
        let key = Self::sim_key(iccid);
        let mut failure: Option<StoreError> = None;
        let stored: Option<IVec> = self.sims.update_and_fetch(&key, |old| {
            failure = None;
            let current = match old.map(Self::deserialize_sim).transpose() {
                Ok(c) => c,
                Err(e) => {
                    failure = Some(e);
                    return old.map(|b| b.to_vec());
                }
            };
            match edit(current) {
                Some(next) => match Self::serialize(&next) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        failure = Some(e);
                        old.map(|b| b.to_vec())
                    }
                },
                None => old.map(|b| b.to_vec()),
            }
        })?;
        if let Some(e) = failure {
            return Err(e);
        }
        stored.map(|b| Self::deserialize_sim(&b)).transpose()
    }

    fn scan_sims(&self) -> impl Iterator<Item = Result<SimRecord, StoreError>> + '_ {
        self.sims.iter().values().map(|v| match v {
            Ok(bytes) => Self::deserialize_sim(&bytes),
            Err(e) => Err(StoreError::from(e)),
        })
    }
}

impl SimStore for SledStore {
    fn find_one(&self, iccid: &str) -> Result<Option<SimRecord>, StoreError> {
        self.sims
            .get(Self::sim_key(iccid))?
            .map(|b| Self::deserialize_sim(&b))
            .transpose()
    }

    fn find(&self, filter: &SimFilter, skip: usize, limit: usize) -> Result<Vec<SimRecord>, StoreError> {
        let mut out = Vec::new();
        let mut skipped = 0;
        for record in self.scan_sims() {
            let record = record?;
            if !filter.matches(&record) {
                continue;
            }
            if skipped < skip {
                skipped += 1;
                continue;
            }
            if out.len() >= limit {
                break;
            }
            out.push(record);
        }
        Ok(out)
    }

    fn count(&self, filter: &SimFilter) -> Result<usize, StoreError> {
        let mut n = 0;
        for record in self.scan_sims() {
            if filter.matches(&record?) {
                n += 1;
            }
        }
        Ok(n)
    }

    fn upsert(&self, iccid: &str, update: &SimUpdate) -> Result<SimRecord, StoreError> {
        let stored = self.modify_sim(iccid, |current| {
            let now = Utc::now();
            let mut record = current.unwrap_or_else(|| SimRecord::new(iccid, now));
            record.apply(update, now);
            Some(record)
        })?;
        stored.ok_or_else(|| StoreError::Unavailable(format!("upsert of {} left no record", iccid)))
    }

    fn release_port(&self, iccid: &str, port: &str) -> Result<bool, StoreError> {
        let mut released = false;
        self.modify_sim(iccid, |current| {
            released = false;
            let mut record = current?;
            if record.release_port(port, Utc::now()) {
                released = true;
                Some(record)
            } else {
                None
            }
        })?;
        Ok(released)
    }
}

impl SmsStore for SledStore {
    fn upsert_sms(&self, record: &SmsRecord) -> Result<bool, StoreError> {
        let key = record.key();
        let mut created = false;
        let mut failure: Option<StoreError> = None;
        self.sms.update_and_fetch(&key, |old| {
            failure = None;
            let now = Utc::now();
            let mut next = record.clone();
            next.schema_version = SMS_SCHEMA_VERSION;
            next.updated_at = now;
            match old.map(Self::deserialize_sms).transpose() {
                Ok(Some(prev)) => {
                    created = false;
                    next.first_seen_at = prev.first_seen_at;
                }
                Ok(None) => created = true,
                Err(e) => {
                    failure = Some(e);
                    return old.map(|b| b.to_vec());
                }
            }
            match Self::serialize(&next) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    failure = Some(e);
                    old.map(|b| b.to_vec())
                }
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    fn list_sms(&self, identity: &str) -> Result<Vec<SmsRecord>, StoreError> {
        let mut prefix = sms_key(identity, "", "");
        // Keep "<identity>\0", drop the empty sender/time parts.
        prefix.truncate(prefix.len() - 1);
        let mut out = Vec::new();
        for item in self.sms.scan_prefix(prefix) {
            let (_, bytes) = item?;
            out.push(Self::deserialize_sms(&bytes)?);
        }
        Ok(out)
    }

    fn count_sms(&self) -> Result<usize, StoreError> {
        Ok(self.sms.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::decode::RegistrationStatus;
    use crate::storage::TelemetrySnapshot;
    use tempfile::TempDir;

    fn store() -> (TempDir, SledStore) {
        let dir = TempDir::new().unwrap();
        let store = SledStore::open(dir.path().join("registry")).unwrap();
        (dir, store)
    }

    fn telemetry(port: &str, status: RegistrationStatus) -> SimUpdate {
        SimUpdate {
            telemetry: Some(TelemetrySnapshot {
                registration_status: status,
                signal_quality: Some(18),
                ..TelemetrySnapshot::default()
            }),
            bind_port: Some(port.into()),
            balance: None,
        }
    }

    #[test]
    fn repeated_upsert_keeps_one_record() {
        let (_dir, store) = store();
        let update = telemetry("/dev/ttyUSB0", RegistrationStatus::Home);
        store.upsert("8984A", &update).unwrap();
        let second = store.upsert("8984A", &update).unwrap();
        assert_eq!(store.count(&SimFilter::default()).unwrap(), 1);
        assert_eq!(second.com_port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(second.signal_quality, Some(18));
        assert!(second.port_history.is_empty());
    }

    #[test]
    fn release_port_is_conditional() {
        let (_dir, store) = store();
        store.upsert("8984A", &telemetry("/dev/ttyUSB0", RegistrationStatus::Home)).unwrap();
        assert!(!store.release_port("8984A", "/dev/ttyUSB9").unwrap());
        assert!(store.release_port("8984A", "/dev/ttyUSB0").unwrap());
        assert!(!store.release_port("missing", "/dev/ttyUSB0").unwrap());
        let r = store.find_one("8984A").unwrap().unwrap();
        assert_eq!(r.com_port, None);
        assert_eq!(r.port_history, vec!["/dev/ttyUSB0"]);
    }

    #[test]
    fn find_filters_and_paginates_in_iccid_order() {
        let (_dir, store) = store();
        for (i, port) in ["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"].iter().enumerate() {
            store.upsert(&format!("8984{}", i), &telemetry(port, RegistrationStatus::Home)).unwrap();
        }
        let page = store.find(&SimFilter::default(), 1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].iccid, "89841");
        let by_port = store.find(&SimFilter::by_port("/dev/ttyUSB2"), 0, 10).unwrap();
        assert_eq!(by_port.len(), 1);
        assert_eq!(by_port[0].iccid, "89842");
    }

    #[test]
    fn sms_upsert_is_idempotent() {
        let (_dir, store) = store();
        let now = Utc::now();
        let sms = SmsRecord {
            schema_version: SMS_SCHEMA_VERSION,
            sim_identity: "452040123456789".into(),
            iccid: "8984A".into(),
            sender: "Hello".into(),
            time: "26/10/16,09:12:44+28".into(),
            content: "hi".into(),
            status: "REC UNREAD".into(),
            modem_index: "1".into(),
            first_seen_at: now,
            updated_at: now,
        };
        assert!(store.upsert_sms(&sms).unwrap());
        let mut reread = sms.clone();
        reread.status = "REC READ".into();
        reread.modem_index = "7".into();
        assert!(!store.upsert_sms(&reread).unwrap());
        assert_eq!(store.count_sms().unwrap(), 1);
        let listed = store.list_sms("452040123456789").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, "REC READ");
        assert!(store.list_sms("45204012345678").unwrap().is_empty());
    }
}
