//! Graceful Shutdown Handler
//!
//! Background loops hold a [`ShutdownToken`] and stop at their next await
//! point once shutdown is requested. [`GracefulShutdown::execute`] then runs
//! the phased teardown: capture restart state, stop tasks, flush state.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown - reduce timeouts
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for capturing the active-user set
    pub mark_timeout_secs: u64,
    /// Time allowed for background tasks to stop (includes the monitor's final flush)
    pub task_stop_timeout_secs: u64,
    /// Time allowed for the notify-record flush
    pub flush_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            mark_timeout_secs: 15,
            task_stop_timeout_secs: 60,
            flush_timeout_secs: 15,
        }
    }
}

impl ShutdownConfig {
    fn scaled(&self, signal: ShutdownSignal) -> Self {
        match signal {
            ShutdownSignal::Graceful => self.clone(),
            ShutdownSignal::Urgent => Self {
                mark_timeout_secs: (self.mark_timeout_secs / 3).max(1),
                task_stop_timeout_secs: (self.task_stop_timeout_secs / 3).max(1),
                flush_timeout_secs: (self.flush_timeout_secs / 3).max(1),
            },
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    MarkingRestart,
    StoppingTasks,
    FlushingState,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::MarkingRestart => write!(f, "marking_restart"),
            ShutdownPhase::StoppingTasks => write!(f, "stopping_tasks"),
            ShutdownPhase::FlushingState => write!(f, "flushing_state"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
    phase_tx: watch::Sender<ShutdownPhase>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (signal_tx, _) = watch::channel(None);
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            signal_tx,
            phase_tx,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    /// Token for background tasks
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal_tx.subscribe(),
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    /// Request shutdown; duplicate requests are ignored
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        self.signal_tx.send_replace(Some(signal));
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase_tx.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Run the shutdown sequence.
    ///
    /// 1. Capture the active-user set for restart recovery
    /// 2. Stop background tasks (tokens are cancelled here if not already)
    /// 3. Flush in-memory state
    ///
    /// Every phase runs under its own timeout; a failed or slow phase is
    /// logged and the sequence continues.
    pub async fn execute<'a>(
        &self,
        mark_restart: BoxFuture<'a, Result<(), String>>,
        stop_tasks: BoxFuture<'a, ()>,
        flush_state: BoxFuture<'a, Result<(), String>>,
    ) {
        let start = std::time::Instant::now();
        let signal = (*self.signal_tx.borrow()).unwrap_or(ShutdownSignal::Graceful);
        let config = self.config.scaled(signal);

        // Restart state must be captured before tasks stop touching users
        self.set_phase(ShutdownPhase::MarkingRestart);
        match tokio::time::timeout(Duration::from_secs(config.mark_timeout_secs), mark_restart).await {
            Ok(Ok(())) => debug!("Restart state captured"),
            Ok(Err(e)) => warn!("Restart marking failed: {}", e),
            Err(_) => error!("Restart marking timed out after {}s", config.mark_timeout_secs),
        }

        self.set_phase(ShutdownPhase::StoppingTasks);
        if !self.is_shutdown_requested() {
            self.request_shutdown(signal);
        }
        if tokio::time::timeout(Duration::from_secs(config.task_stop_timeout_secs), stop_tasks)
            .await
            .is_err()
        {
            warn!(
                "Background tasks did not stop within {}s, proceeding anyway",
                config.task_stop_timeout_secs
            );
        }

        self.set_phase(ShutdownPhase::FlushingState);
        match tokio::time::timeout(Duration::from_secs(config.flush_timeout_secs), flush_state).await {
            Ok(Ok(())) => debug!("State flushed"),
            Ok(Err(e)) => warn!("State flush error: {}", e),
            Err(_) => warn!("State flush timeout after {}s", config.flush_timeout_secs),
        }

        self.set_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown completed in {:?}", start.elapsed());
    }
}

/// Cancellation handle for background tasks
#[derive(Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    /// Resolves once shutdown is requested (or the coordinator is dropped)
    pub async fn cancelled(&mut self) {
        loop {
            if self.signal_rx.borrow_and_update().is_some() {
                return;
            }
            if self.signal_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Install OS signal handlers that request a graceful shutdown
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C"),
            _ = terminate => info!("Received SIGTERM"),
        }
        shutdown.request_shutdown(ShutdownSignal::Graceful);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex;

    #[test]
    fn test_shutdown_display() {
        assert_eq!(ShutdownSignal::Graceful.to_string(), "graceful");
        assert_eq!(ShutdownPhase::StoppingTasks.to_string(), "stopping_tasks");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[tokio::test]
    async fn test_token_observes_request() {
        let shutdown = GracefulShutdown::with_defaults();
        let mut token = shutdown.token();
        assert!(!token.is_cancelled());

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        shutdown.request_shutdown(ShutdownSignal::Urgent);

        token.cancelled().await;
        assert!(token.is_cancelled());
        assert!(shutdown.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_execute_runs_phases_in_order() {
        let shutdown = GracefulShutdown::with_defaults();
        let order = Arc::new(Mutex::new(Vec::new()));
        let token = shutdown.token();

        let (o1, o2, o3) = (order.clone(), order.clone(), order.clone());
        shutdown
            .execute(
                async move {
                    o1.lock().unwrap().push("mark");
                    Ok(())
                }
                .boxed(),
                async move {
                    // tasks see the cancellation by the time they are stopped
                    assert!(token.is_cancelled());
                    o2.lock().unwrap().push("stop");
                }
                .boxed(),
                async move {
                    o3.lock().unwrap().push("flush");
                    Err("disk full".to_string())
                }
                .boxed(),
            )
            .await;

        assert_eq!(*order.lock().unwrap(), vec!["mark", "stop", "flush"]);
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }
}
