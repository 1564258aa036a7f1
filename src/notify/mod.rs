pub mod dispatcher;
pub mod messages;

pub use dispatcher::{DispatchSummary, Dispatcher, DispatcherConfig, SpikeAlert};
