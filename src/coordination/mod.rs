//! Process coordination
//!
//! - `bootstrap`: assembles the service and runs the boot sequence
//! - `recovery`: restart capture and restore
//! - `shutdown`: phased graceful shutdown

pub mod bootstrap;
pub mod recovery;
pub mod shutdown;

pub use bootstrap::{boot, App, BootReport};
pub use recovery::RestartRecovery;
pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownSignal, ShutdownToken,
};
