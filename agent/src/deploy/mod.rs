//! Remote execution of the deployment step sequence

pub mod executor;
pub mod fsm;
pub mod locks;
pub mod probe;
pub mod session;
pub mod ssh;
pub mod steps;
