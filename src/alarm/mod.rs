//! Alarm escalation engine and its trigger-history window.

pub mod engine;
pub mod history;

pub use engine::{AlarmConfig, AlarmEngine, AlarmSnapshot};
pub use history::AlarmHistory;
