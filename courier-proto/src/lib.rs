//! Shared data model for the EduDash message delivery layer.

pub mod connection;
pub mod event;
pub mod failed;
pub mod message;
pub mod reaction;
