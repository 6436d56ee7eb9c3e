//! Read-decide-write with bounded retry.

use std::fmt::Display;

use hive_proto::HiveEvent;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::events::EventSink;
use crate::record::{RecordStore, Versioned};

/// How many times a decision is re-run after losing a version race.
pub const DEFAULT_UPDATE_ATTEMPTS: u32 = 3;

/// Outcome of deciding on a freshly read record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<V> {
    /// Nothing to change.
    Keep,
    /// Write `record` and publish `events` in order as part of the commit.
    Write {
        /// New record.
        record: V,
        /// One event per transition the write performs.
        events: Vec<HiveEvent>,
    },
}

impl<V> Decision<V> {
    /// Write with the given events.
    #[must_use]
    pub const fn write(record: V, events: Vec<HiveEvent>) -> Self {
        Self::Write { record, events }
    }
}

/// Record before and after a successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<V> {
    /// Version the final decision was made on.
    pub before: Versioned<V>,
    /// Stored version. Equal to `before` when the decision was `Keep`.
    pub after: Versioned<V>,
}

impl<V> Committed<V> {
    /// Whether a write happened.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.before.version != self.after.version
    }
}

/// Failure of [`update_with_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateError<E> {
    /// The record does not exist.
    NotFound(String),
    /// Every attempt lost a version race.
    Conflict {
        /// Contended key.
        key: String,
        /// Attempts made.
        attempts: u32,
    },
    /// The decision refused the change.
    Rejected(E),
}

/// Optimistically update one record.
///
/// Reads the record, asks `decide` what to do, and writes conditioned on the
/// version read. When another writer got there first the record is re-read
/// and `decide` runs again, up to `attempts` times.
///
/// # Errors
///
/// `NotFound` if the record is absent, `Rejected` if `decide` fails, and
/// `Conflict` once the attempts are exhausted.
pub fn update_with_retry<K, V, E, F>(
    store: &dyn RecordStore<K, V>,
    key: &K,
    attempts: u32,
    sink: &dyn EventSink,
    mut decide: F,
) -> Result<Committed<V>, UpdateError<E>>
where
    K: Display,
    V: Clone,
    F: FnMut(&Versioned<V>) -> Result<Decision<V>, E>,
{
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        let Some(current) = store.get(key) else {
            return Err(UpdateError::NotFound(key.to_string()));
        };

        let (record, events) = match decide(&current).map_err(UpdateError::Rejected)? {
            Decision::Keep => {
                return Ok(Committed {
                    before: current.clone(),
                    after: current,
                });
            }
            Decision::Write { record, events } => (record, events),
        };

        let publish = |stored: &Versioned<V>| {
            for event in &events {
                sink.publish(stored.version, event.clone());
            }
        };

        match store.replace(key, current.version, record, &publish) {
            Ok(after) => {
                return Ok(Committed {
                    before: current,
                    after,
                });
            }
            Err(StoreError::VersionMismatch { actual, .. }) => {
                debug!(key = %key, attempt, actual, "version conflict, re-deciding");
            }
            Err(StoreError::NotFound { key }) => return Err(UpdateError::NotFound(key)),
            Err(StoreError::AlreadyExists { key }) => {
                return Err(UpdateError::Conflict { key, attempts: attempt });
            }
        }
    }

    warn!(key = %key, attempts, "update abandoned after repeated conflicts");
    Err(UpdateError::Conflict {
        key: key.to_string(),
        attempts,
    })
}

/// Insert a new record and publish its creation events with the commit.
///
/// # Errors
///
/// Returns `AlreadyExists` if the key is taken.
pub fn insert_record<K, V>(
    store: &dyn RecordStore<K, V>,
    key: K,
    record: V,
    sink: &dyn EventSink,
    events: Vec<HiveEvent>,
) -> Result<Versioned<V>, StoreError> {
    let publish = |stored: &Versioned<V>| {
        for event in &events {
            sink.publish(stored.version, event.clone());
        }
    };
    store.insert(key, record, &publish)
}
