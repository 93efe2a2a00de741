use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::SecretRecord;
use super::SecretStore;

/// Records keyed by internal sequence number.
const SECRETS: TableDefinition<u64, &[u8]> = TableDefinition::new("secrets");
/// Public id (as u128) → internal sequence number.
const PUBLIC_IDS: TableDefinition<u128, u64> = TableDefinition::new("public_ids");
/// (expires_at, seq) for every record with an expiry, scanned by the cleanup sweep.
const EXPIRY: TableDefinition<(i64, u64), ()> = TableDefinition::new("expiry");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const SECRET_SEQ_KEY: &str = "secret_seq";

/// Leading byte of every stored record. Bumped if the layout ever changes.
const RECORD_V1_MARKER: u8 = 0x01;

/// Thread-safe handle to the redb store.
///
/// redb serialises write transactions, so every mutation below runs in its own
/// write transaction and is atomic with respect to the others.
#[derive(Clone)]
pub struct RedbStore {
    pub(crate) db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(PUBLIC_IDS)?;
        write_txn.open_table(EXPIRY)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert a record under a caller-chosen public id.
    pub(crate) fn insert_with_id(
        &self,
        public_id: Uuid,
        payload: &[u8],
        created_at: i64,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut ids = write_txn.open_table(PUBLIC_IDS)?;
            if ids.get(public_id.as_u128())?.is_some() {
                anyhow::bail!("public id collision: {public_id}");
            }

            let mut counters = write_txn.open_table(COUNTERS)?;
            let seq = counters
                .get(SECRET_SEQ_KEY)?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            counters.insert(SECRET_SEQ_KEY, seq)?;

            let record = SecretRecord {
                seq,
                public_id,
                payload: payload.to_vec(),
                created_at,
                expires_at,
            };
            let bytes = encode(&record)?;

            let mut secrets = write_txn.open_table(SECRETS)?;
            secrets.insert(seq, bytes.as_slice())?;
            ids.insert(public_id.as_u128(), seq)?;
            if let Some(exp) = expires_at {
                let mut expiry = write_txn.open_table(EXPIRY)?;
                expiry.insert((exp, seq), ())?;
            }
        }
        write_txn.commit()?;

        debug!(id = %public_id, "stored secret");
        Ok(())
    }

    /// Number of records currently stored, live or not.
    pub fn len(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl SecretStore for RedbStore {
    fn insert(&self, payload: &[u8], created_at: i64, expires_at: Option<i64>) -> Result<Uuid> {
        let public_id = Uuid::new_v4();
        self.insert_with_id(public_id, payload, created_at, expires_at)?;
        Ok(public_id)
    }

    fn find_live(&self, public_id: &Uuid, now: i64) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let ids = read_txn.open_table(PUBLIC_IDS)?;
        let Some(seq) = ids.get(public_id.as_u128())?.map(|g| g.value()) else {
            return Ok(None);
        };

        let secrets = read_txn.open_table(SECRETS)?;
        let raw_bytes: Option<Vec<u8>> = secrets.get(seq)?.map(|guard| guard.value().to_vec());
        let Some(bytes) = raw_bytes else {
            anyhow::bail!("public id {public_id} points at missing record {seq}");
        };

        let record = decode(&bytes)?;
        if record.is_expired(now) {
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn delete_if_present(&self, public_id: &Uuid) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut ids = write_txn.open_table(PUBLIC_IDS)?;
            // Copy the value out so the guard's borrow of `ids` ends here.
            let seq = ids.remove(public_id.as_u128())?.map(|g| g.value());
            match seq {
                None => false,
                Some(seq) => {
                    let mut secrets = write_txn.open_table(SECRETS)?;
                    let raw_bytes: Option<Vec<u8>> =
                        secrets.remove(seq)?.map(|guard| guard.value().to_vec());
                    let bytes = raw_bytes.with_context(|| {
                        format!("public id {public_id} points at missing record {seq}")
                    })?;
                    let record = decode(&bytes)?;
                    if let Some(exp) = record.expires_at {
                        let mut expiry = write_txn.open_table(EXPIRY)?;
                        expiry.remove((exp, seq))?;
                    }
                    true
                }
            }
        };
        write_txn.commit()?;

        if existed {
            debug!(id = %public_id, "deleted secret");
        }
        Ok(existed)
    }

    fn delete_expired(&self, now: i64) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut expiry = write_txn.open_table(EXPIRY)?;

            // Collect the due entries first so the range iterator's borrow ends
            // before any mutation.
            let due: Vec<(i64, u64)> = {
                let mut due = Vec::new();
                for item in expiry.range(..=(now, u64::MAX))? {
                    let (k, _v) = item?;
                    due.push(k.value());
                }
                due
            };

            let mut secrets = write_txn.open_table(SECRETS)?;
            let mut ids = write_txn.open_table(PUBLIC_IDS)?;
            let mut undecodable = Vec::new();
            for (exp, seq) in &due {
                expiry.remove((*exp, *seq))?;
                let raw_bytes: Option<Vec<u8>> =
                    secrets.remove(*seq)?.map(|guard| guard.value().to_vec());
                let Some(bytes) = raw_bytes else { continue };
                match decode(&bytes) {
                    Ok(record) => {
                        ids.remove(record.public_id.as_u128())?;
                    }
                    Err(e) => {
                        warn!(seq, error = %e, "dropping undecodable expired record");
                        undecodable.push(*seq);
                    }
                }
            }

            // The public id of a record we could not decode is only reachable
            // through a reverse scan of the index.
            if !undecodable.is_empty() {
                let mut stale = Vec::new();
                for item in ids.iter()? {
                    let (k, v) = item?;
                    if undecodable.contains(&v.value()) {
                        stale.push(k.value());
                    }
                }
                for key in stale {
                    ids.remove(key)?;
                }
            }
            due.len()
        };
        write_txn.commit()?;

        if removed > 0 {
            info!(removed, "deleted expired secrets");
        }
        Ok(removed)
    }
}

/// Encode a record as `[RECORD_V1_MARKER] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        None => anyhow::bail!("empty record"),
        Some((&RECORD_V1_MARKER, rest)) if !rest.is_empty() => {
            let (record, _) = bincode::serde::decode_from_slice(rest, bincode::config::standard())
                .context("bincode decode")?;
            Ok(record)
        }
        Some((&RECORD_V1_MARKER, _)) => anyhow::bail!("truncated record"),
        Some((marker, _)) => anyhow::bail!("unknown record format marker {marker:#04x}"),
    }
}
