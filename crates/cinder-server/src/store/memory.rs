use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use tracing::{debug, info};
use uuid::Uuid;

use super::model::SecretRecord;
use super::SecretStore;

#[derive(Default)]
struct Inner {
    next_seq: u64,
    records: BTreeMap<u64, SecretRecord>,
    public_ids: HashMap<Uuid, u64>,
}

/// In-process store. Nothing survives a restart; records are still only ever
/// held encrypted.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    pub(crate) fn insert_with_id(
        &self,
        public_id: Uuid,
        payload: &[u8],
        created_at: i64,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.public_ids.contains_key(&public_id) {
            anyhow::bail!("public id collision: {public_id}");
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.records.insert(
            seq,
            SecretRecord {
                seq,
                public_id,
                payload: payload.to_vec(),
                created_at,
                expires_at,
            },
        );
        inner.public_ids.insert(public_id, seq);
        debug!(id = %public_id, "stored secret");
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.records.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl SecretStore for MemoryStore {
    fn insert(&self, payload: &[u8], created_at: i64, expires_at: Option<i64>) -> Result<Uuid> {
        let public_id = Uuid::new_v4();
        self.insert_with_id(public_id, payload, created_at, expires_at)?;
        Ok(public_id)
    }

    fn find_live(&self, public_id: &Uuid, now: i64) -> Result<Option<SecretRecord>> {
        let inner = self.lock()?;
        let record = inner
            .public_ids
            .get(public_id)
            .and_then(|seq| inner.records.get(seq))
            .filter(|r| r.is_live(now))
            .cloned();
        Ok(record)
    }

    fn delete_if_present(&self, public_id: &Uuid) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(seq) = inner.public_ids.remove(public_id) else {
            return Ok(false);
        };
        if inner.records.remove(&seq).is_none() {
            anyhow::bail!("public id {public_id} points at missing record {seq}");
        }
        debug!(id = %public_id, "deleted secret");
        Ok(true)
    }

    fn delete_expired(&self, now: i64) -> Result<usize> {
        let mut inner = self.lock()?;
        let due: Vec<(u64, Uuid)> = inner
            .records
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| (r.seq, r.public_id))
            .collect();

        for (seq, public_id) in &due {
            inner.records.remove(seq);
            inner.public_ids.remove(public_id);
        }

        let removed = due.len();
        if removed > 0 {
            info!(removed, "deleted expired secrets");
        }
        Ok(removed)
    }
}
