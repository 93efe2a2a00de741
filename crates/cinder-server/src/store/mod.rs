pub mod crypto;
pub mod db;
pub mod memory;
pub mod model;

use anyhow::Result;
use uuid::Uuid;

pub use db::RedbStore;
pub use memory::MemoryStore;
pub use model::SecretRecord;

/// Durable keyed storage for encrypted secret records.
///
/// Every method is a short, synchronous unit of work. Implementations must make
/// `delete_if_present` atomic: of any number of concurrent calls for the same id,
/// exactly one observes `true`. The lifecycle service relies on this to guarantee
/// that a secret is handed out at most once.
pub trait SecretStore: Send + Sync {
    /// Persist a new record under a freshly generated public id.
    /// Errors rather than overwriting if the id is already taken.
    fn insert(&self, payload: &[u8], created_at: i64, expires_at: Option<i64>) -> Result<Uuid>;

    /// Look up a record that exists and has not expired at `now`.
    fn find_live(&self, public_id: &Uuid, now: i64) -> Result<Option<SecretRecord>>;

    /// Remove a record. Returns whether this call removed it.
    fn delete_if_present(&self, public_id: &Uuid) -> Result<bool>;

    /// Remove every record whose expiry is at or before `now`. Returns how many were removed.
    fn delete_expired(&self, now: i64) -> Result<usize>;
}
