//! `EduDash` courier: local reliability layer for school messaging.
//!
//! Keeps failed sends durable and retryable ([`outbox`]), shows messages
//! optimistically while they are in flight ([`send`]), and folds realtime
//! changes into the local thread views ([`realtime`], [`view`]).

pub mod backend;
pub mod config;
pub mod outbox;
pub mod persist;
pub mod realtime;
pub mod send;
pub mod view;
