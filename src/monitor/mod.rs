//! Market monitoring: history, classification, the cycle engine and its loops

pub mod classifier;
pub mod engine;
pub mod history;
pub mod reminder;
pub mod runner;

pub use classifier::{classify, Spike};
pub use engine::{CycleReport, EngineConfig, MonitorEngine};
pub use history::HistoryStore;
pub use reminder::{NotifyRecord, NotifyStore, ReminderService, ReminderSummary};
pub use runner::MonitorRunner;
