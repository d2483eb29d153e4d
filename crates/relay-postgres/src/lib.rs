//! Postgres-backed Relay stores.
//!
//! One [`sqlx::PgPool`] per database. Claims use `FOR UPDATE SKIP LOCKED`
//! so concurrent claimers neither collide nor block; ack/abandon/fail are
//! fenced on the claiming owner token inside the SQL predicates; join
//! counter updates ride in the same transaction as the outbox transition.

pub mod inbox;
pub mod join;
pub mod lease;
mod migrate;
pub mod outbox;

pub use inbox::PgInbox;
pub use join::PgJoinStore;
pub use lease::PgLeaseFactory;
pub use migrate::run_migrations;
pub use outbox::PgOutbox;

use relay_core::Error;

/// Milliseconds of a duration, clamped into `i64` for interval binds.
pub(crate) fn duration_millis(d: std::time::Duration) -> i64 {
    let ms = d.as_millis();
    if ms > i64::MAX as u128 {
        i64::MAX
    } else {
        ms as i64
    }
}

pub(crate) fn foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23503")
}

pub(crate) fn storage(err: sqlx::Error, what: &'static str) -> Error {
    Error::Storage(anyhow::Error::from(err).context(what))
}
