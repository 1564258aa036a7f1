pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod persistence;
pub mod services;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tiers;
pub mod tracking;

pub use config::AppConfig;
pub use coordination::{boot, App, BootReport, GracefulShutdown, RestartRecovery, ShutdownSignal};
pub use domain::{Tier, Tracking, User, UserId};
pub use error::{Result, SpikeError};
pub use monitor::{MonitorEngine, MonitorRunner};
pub use persistence::{Cache, DocumentStore, MemoryStore};
pub use tiers::{ExpiryScheduler, TierEngine};
pub use tracking::TrackingService;
