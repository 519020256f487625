//! Failed-message outbox: durable storage plus retry coordination.

pub mod retry;
pub mod store;
