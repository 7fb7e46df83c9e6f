use chrono::Utc;

use crate::err::Result;
use crate::io::{load_collection, save_collection, Sequence, SharedStorage};
use crate::models::{AccessRecord, NewAccess};

pub const ACCESS_LOG_KEY: &str = "escola_qr_access_logs";

/// Append-only access log.
#[derive(Clone)]
pub struct Ledger {
    storage: SharedStorage,
    sequence: Sequence,
}

impl Ledger {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            sequence: Sequence::for_collection(ACCESS_LOG_KEY),
        }
    }

    pub fn list(&self) -> Result<Vec<AccessRecord>> {
        load_collection(&*self.storage, ACCESS_LOG_KEY)
    }

    pub fn list_by_student(&self, student_id: &str) -> Result<Vec<AccessRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|record| record.student_id == student_id)
            .collect())
    }

    /// Newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<AccessRecord>> {
        let mut records = self.list()?;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        Ok(records)
    }

    pub fn append(&self, access: NewAccess) -> Result<AccessRecord> {
        let mut records = self.list()?;
        let id = self
            .sequence
            .next(&*self.storage, records.iter().map(|r| r.id.as_str()))?;
        let record = AccessRecord {
            id,
            student_id: access.student_id,
            student_name: access.student_name,
            timestamp: Utc::now(),
            access_type: access.access_type,
            authorized: access.authorized,
        };
        records.push(record.clone());
        save_collection(&*self.storage, ACCESS_LOG_KEY, &records)?;
        log::info!(
            "Recorded {} for student {} (authorized: {})",
            record.access_type,
            record.student_id,
            record.authorized
        );
        Ok(record)
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let records = self.list()?;
        let before = records.len();
        let remaining: Vec<AccessRecord> =
            records.into_iter().filter(|record| record.id != id).collect();
        if remaining.len() == before {
            return Ok(false);
        }
        save_collection(&*self.storage, ACCESS_LOG_KEY, &remaining)?;
        log::info!("Removed access record {}", id);
        Ok(true)
    }

    /// Drops every record. The id sequence survives so ids stay unique.
    pub fn clear(&self) -> Result<()> {
        self.storage.remove(ACCESS_LOG_KEY)?;
        log::info!("Cleared access log");
        Ok(())
    }
}
