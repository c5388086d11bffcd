//! Token registry with ttl-based expiry
//!
//! Records live in a sharded concurrent map. Inserts and removals take the
//! write lock of a single shard; lookups of different tokens proceed in
//! parallel and lookups of the same shard only share a read lock.

use crate::record::ServiceRecord;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pim_proto::Token;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Upper bound on token generation attempts for one insert
const MAX_INSERT_ATTEMPTS: usize = 8;

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Could not mint a unique token after {attempts} attempts")]
    ResourceExhausted { attempts: usize },
}

/// Why a token could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("Token not found")]
    NotFound,

    #[error("Token has expired")]
    Expired,
}

/// Successful lookup result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub record: ServiceRecord,
    pub remaining: Duration,
}

impl Lookup {
    /// Remaining lifetime rounded up to whole seconds
    pub fn remaining_secs(&self) -> u64 {
        self.remaining.as_secs() + u64::from(self.remaining.subsec_nanos() > 0)
    }
}

/// Concurrent map from tokens to service records
pub struct Registry {
    records: DashMap<Token, ServiceRecord>,
    ttl: Duration,
}

impl Registry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a record under a freshly generated token
    pub fn add(&self, record: ServiceRecord) -> Result<Token, RegistryError> {
        self.insert_unique(record, Token::generate)
    }

    /// Insert under the first generated token that is not already present.
    /// An existing key is never overwritten, expired or not.
    pub(crate) fn insert_unique(
        &self,
        record: ServiceRecord,
        mut generate: impl FnMut() -> Token,
    ) -> Result<Token, RegistryError> {
        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            let token = generate();
            match self.records.entry(token) {
                Entry::Occupied(_) => {
                    warn!(%token, attempt, "Token collision, regenerating");
                }
                Entry::Vacant(vacant) => {
                    debug!(
                        %token,
                        address = %record.address,
                        port = record.port,
                        "Registered service"
                    );
                    vacant.insert(record);
                    return Ok(token);
                }
            }
        }

        Err(RegistryError::ResourceExhausted {
            attempts: MAX_INSERT_ATTEMPTS,
        })
    }

    /// Resolve a token
    ///
    /// Expiry is decided here from the record's age, independently of the
    /// sweeper. An expired record is removed on the way out, so a later
    /// lookup of the same token reports `NotFound`; it never succeeds again.
    pub fn lookup(&self, token: &Token) -> Result<Lookup, LookupError> {
        let now = Instant::now();
        let record = match self.records.get(token) {
            Some(entry) => entry.value().clone(),
            None => {
                trace!(%token, "Lookup miss");
                return Err(LookupError::NotFound);
            }
        };

        match record.remaining(self.ttl, now) {
            Some(remaining) => Ok(Lookup { record, remaining }),
            None => {
                self.records
                    .remove_if(token, |_, r| r.is_expired(self.ttl, now));
                debug!(%token, "Lookup of expired token");
                Err(LookupError::Expired)
            }
        }
    }

    /// Remove every expired record, returning how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.records.retain(|token, record| {
            if record.is_expired(self.ttl, now) {
                trace!(%token, "Sweeping expired record");
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
