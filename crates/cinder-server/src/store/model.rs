use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::ZeroizeOnDrop;

/// Stored in redb as bincode-encoded bytes.
/// `payload` is a nonce-prefixed ChaCha20Poly1305 ciphertext over the secret content.
/// Timestamps are plaintext so the background sweep can evict without decrypting.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    /// Internal, monotonically increasing key. Never leaves the server.
    pub seq: u64,
    /// The only external handle to the record.
    #[zeroize(skip)]
    pub public_id: Uuid,
    /// `nonce ‖ ciphertext ‖ tag`.
    pub payload: Vec<u8>,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
    /// Optional Unix timestamp (seconds) from which the record is expired.
    pub expires_at: Option<i64>,
}

impl SecretRecord {
    /// Returns true if this record has passed its expiry at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    pub fn is_live(&self, now: i64) -> bool {
        !self.is_expired(now)
    }
}
