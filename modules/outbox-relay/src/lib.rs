//! Outbox relay service
//!
//! Runs the delivery side of the transactional outbox against a shared
//! Postgres database: the publisher worker pool, the reconciliation sweep
//! and ledger retention.

pub mod bus;
pub mod config;
pub mod db;
pub mod relay;

pub use relay::Relay;
