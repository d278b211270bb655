//! Deployment ledger

pub mod filter;
pub mod store;
