//! Rollout Library
//!
//! Continuous-deployment agent: validates push, manual and scheduled
//! triggers, runs a fixed deployment sequence on the target host over SSH,
//! and records every attempt in a durable ledger.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod ledger;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod trigger;
pub mod utils;
pub mod workers;
