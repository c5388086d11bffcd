//! Service records stored in the registry

use std::time::Duration;
use tokio::time::Instant;

/// Location of a launched instance
///
/// Immutable once inserted. The ttl is not part of the record; the registry
/// supplies it when asking how much time is left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub address: String,
    pub port: u16,
    pub created_at: Instant,
}

impl ServiceRecord {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            created_at: Instant::now(),
        }
    }

    /// Time left before this record expires, or `None` once it has expired
    ///
    /// A record expires as soon as its age reaches `ttl`.
    pub fn remaining(&self, ttl: Duration, now: Instant) -> Option<Duration> {
        let age = now.saturating_duration_since(self.created_at);
        ttl.checked_sub(age).filter(|left| !left.is_zero())
    }

    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        self.remaining(ttl, now).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_remaining_counts_down() {
        let ttl = Duration::from_secs(30);
        let record = ServiceRecord::new("host1", 9090);

        assert_eq!(record.remaining(ttl, Instant::now()), Some(ttl));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            record.remaining(ttl, Instant::now()),
            Some(Duration::from_secs(20))
        );

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(record.remaining(ttl, Instant::now()), None);
        assert!(record.is_expired(ttl, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_is_always_expired() {
        let record = ServiceRecord::new("host1", 9090);
        assert!(record.is_expired(Duration::ZERO, Instant::now()));
    }
}
