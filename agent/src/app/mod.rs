//! Application composition and daemon lifecycle

pub mod options;
pub mod pipeline;
pub mod run;
pub mod state;
