use chrono::{DateTime, Utc};
use std::fmt;

/// Width of an audit time bucket
pub const BUCKET_SECS: i64 = 3600;

/// Direction of audited traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Traffic {
    /// Bytes published by clients (ingress)
    Publish,
    /// Bytes delivered to subscribers (egress)
    Deliver,
}

impl fmt::Display for Traffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish => f.write_str("publish"),
            Self::Deliver => f.write_str("deliver"),
        }
    }
}

/// Counter key: traffic direction, object, optional source and time bucket
///
/// The object is a node id, or a user id for coarse egress totals without a
/// source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuditKey {
    pub traffic: Traffic,
    pub object_id: i64,
    pub source_id: Option<String>,
    pub bucket: DateTime<Utc>,
}

impl AuditKey {
    /// Key for an event at `at`, truncated to its bucket
    pub fn new(
        traffic: Traffic,
        object_id: i64,
        source_id: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            traffic,
            object_id,
            source_id,
            bucket: bucket_start(at),
        }
    }
}

/// Start of the bucket containing `at`
pub fn bucket_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(BUCKET_SECS), 0).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bucket_truncates_to_hour() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 34, 56).unwrap();
        assert_eq!(
            bucket_start(at),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
        );

        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(bucket_start(start), start);
    }

    #[test]
    fn test_keys_in_same_hour_collapse() {
        let a = AuditKey::new(
            Traffic::Publish,
            1,
            Some("a".to_string()),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 1, 0).unwrap(),
        );
        let b = AuditKey::new(
            Traffic::Publish,
            1,
            Some("a".to_string()),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 59, 59).unwrap(),
        );
        let c = AuditKey::new(
            Traffic::Deliver,
            1,
            Some("a".to_string()),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 1, 0).unwrap(),
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
