//! Capture ids: the idempotency knob
//!
//! A capture identifies a physical snapshot of a partition on a specific
//! calendar day. Same source content + same partition + same day produce the
//! same capture id, so re-runs overwrite in place; a new day (or a forced
//! re-capture) produces a new id and historical snapshots coexist.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::partition::PartitionKey;

/// Length of the hex prefix kept from the SHA-256 content digest
const CONTENT_HASH_LEN: usize = 16;

/// Deterministic capture id: `{domain}:{canonical-partition}:{YYYYMMDD}`
pub fn capture_id(domain: &str, partition: &PartitionKey, capture_date: NaiveDate) -> String {
    format!(
        "{domain}:{}:{}",
        partition.canonical(),
        capture_date.format("%Y%m%d")
    )
}

/// Stable content hash used by revision detection
///
/// First 16 hex characters of SHA-256 over the raw payload bytes.
pub fn content_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    hex::encode(digest)[..CONTENT_HASH_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_id_format() {
        let partition = PartitionKey::week_tier(
            NaiveDate::from_ymd_opt(2025, 12, 22).unwrap(),
            "NMS_TIER_1",
        );
        let id = capture_id(
            "finra",
            &partition,
            NaiveDate::from_ymd_opt(2025, 12, 29).unwrap(),
        );

        assert_eq!(
            id,
            r#"finra:{"tier":"NMS_TIER_1","week_ending":"2025-12-22"}:20251229"#
        );
    }

    #[test]
    fn test_same_day_same_id() {
        let partition = PartitionKey::symbol("AAPL");
        let day = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();

        assert_eq!(
            capture_id("prices", &partition, day),
            capture_id("prices", &partition, day)
        );
    }

    #[test]
    fn test_next_day_new_id() {
        let partition = PartitionKey::symbol("AAPL");
        let mon = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let tue = NaiveDate::from_ymd_opt(2025, 6, 3).unwrap();

        assert_ne!(
            capture_id("prices", &partition, mon),
            capture_id("prices", &partition, tue)
        );
    }

    #[test]
    fn test_content_hash_stable_and_short() {
        let a = content_hash(b"hello world");
        let b = content_hash(b"hello world");
        let c = content_hash(b"hello worlds");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
