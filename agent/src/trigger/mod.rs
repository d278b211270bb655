//! Trigger receiving

pub mod receiver;
pub mod webhook;
