//! # hive-store
//!
//! Record storage with optimistic concurrency for ComputeHive.
//!
//! Every shared record lives in a [`RecordStore`] as a [`Versioned`] value.
//! Writers read a version, decide, and write back only if the version is
//! unchanged; [`update_with_retry`] re-runs the decision on conflict a
//! bounded number of times. Events describing a change are handed to an
//! [`EventSink`] while the write is being committed, so events for one
//! record come out in the order its transitions happened.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod record;
pub mod update;

pub use error::StoreError;
pub use events::{EventBus, EventSink, NullSink};
pub use record::{MemoryStore, RecordStore, Versioned};
pub use update::{Committed, DEFAULT_UPDATE_ATTEMPTS, Decision, UpdateError, insert_record, update_with_retry};
