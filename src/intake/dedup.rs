//! Dedup keys that collapse repeated deliveries of one webhook into one lead.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::intake::payload::NormalizedLead;

/// Compute the tenant-scoped dedup key for a payload.
///
/// With a caller hint the key depends on the hint alone. Without one it hashes
/// the identifying fields plus the arrival time bucketed to `bucket`, so
/// retries landing in the same bucket collapse. Retries straddling a bucket
/// boundary still produce two leads.
pub fn dedup_key(
    tenant_id: Uuid,
    lead: &NormalizedLead,
    hint: Option<&str>,
    received_at: DateTime<Utc>,
    bucket: Duration,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());

    match hint.map(str::trim).filter(|h| !h.is_empty()) {
        Some(hint) => {
            hasher.update(b"hint");
            update_field(&mut hasher, Some(hint));
        }
        None => {
            hasher.update(b"content");
            update_field(&mut hasher, Some(&lead.name));
            update_field(&mut hasher, lead.email.as_deref());
            update_field(&mut hasher, lead.phone.as_deref());
            update_field(&mut hasher, lead.message.as_deref());
            let bucket_secs = bucket.as_secs().max(1) as i64;
            hasher.update(received_at.timestamp().div_euclid(bucket_secs).to_le_bytes());
        }
    }

    format!("{:x}", hasher.finalize())
}

/// Length-prefixed so adjacent fields cannot run together.
fn update_field(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        Some(v) => {
            hasher.update([1u8]);
            hasher.update((v.len() as u64).to_le_bytes());
            hasher.update(v.as_bytes());
        }
        None => hasher.update([0u8]),
    }
}
