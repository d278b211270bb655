//! HTTP trigger and history server

pub mod handlers;
pub mod serve;
pub mod state;
