//! WebPilot — browser-automation task orchestration core.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod failures;
pub mod info;
pub mod orchestrator;
pub mod protocol;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod tasks;

pub use error::{Error, Result};
