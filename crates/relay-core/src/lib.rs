//! Core contracts for the Relay messaging substrate.
//!
//! This crate defines the cross-crate contracts shared by the stores and the
//! dispatch machinery: identifiers, row models, the capability traits
//! (`OutboxStore`, `InboxStore`, `JoinStore`, `WorkQueue`, `Handler`,
//! `LeaseFactory`), error kinds, and the retry backoff policy.
//!
//! # API notes
//! `relay-core` is an internal crate (`publish = false`). Its public API uses
//! a few third-party types (`uuid::Uuid`, `chrono::DateTime<Utc>`,
//! `tokio_util::sync::CancellationToken`) as part of the Relay contract.

pub mod backoff;
pub mod error;
pub mod handler;
pub mod ids;
pub mod join;
pub mod lease;
pub mod message;
pub mod store;

pub use backoff::BackoffPolicy;
pub use error::{Error, HandlerError, Result};
pub use handler::Handler;
pub use ids::{JoinId, MessageId, OwnerToken, WorkItemId};
pub use join::{
    JoinApi, JoinMember, JoinRecord, JoinStatus, JoinStore, JoinWaitCommand, JOIN_WAIT_TOPIC,
};
pub use lease::{Lease, LeaseFactory};
pub use message::{
    Delivery, InboxMessage, InboxStatus, OutboxMessage, OutboxStatus, MAX_KEY_LEN, MAX_TOPIC_LEN,
};
pub use store::{
    Enqueued, FailKind, InboxStore, NewInboxMessage, NewOutboxMessage, OutboxStore, QueueCounts,
    WorkQueue,
};
