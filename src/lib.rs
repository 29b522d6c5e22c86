//! Ratchet: a durable work queue of tasks driven through bounded
//! worker → verify iterations, with checkpointed resume and human
//! escalation when a task blocks or runs out of budget.

pub mod audit;
pub mod config;
pub mod controller;
pub mod db;
pub mod driver;
pub mod errors;
pub mod escalation;
pub mod logging;
pub mod queue;
pub mod ratchet_config;
pub mod session;
pub mod signals;
pub mod status;
pub mod tracker;
pub mod ui;
pub mod verify;
pub mod worker;

#[cfg(test)]
mod testing;

pub use ratchet_common as common;
