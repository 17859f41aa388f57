//! Watches live-coding environments (Sonic Pi, TidalCycles) for code
//! executions and turns each one into a commit.

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod manager;
pub mod paths;
pub mod service;
pub mod status;
pub mod store;
pub mod template;
pub mod watchers;
