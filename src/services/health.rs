//! Health check HTTP server
//!
//! Liveness and readiness checks for process supervision plus a Prometheus
//! metrics endpoint.

use crate::coordination::shutdown::ShutdownToken;
use crate::services::Metrics;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

/// Overall service health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
    pub monitor_running: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub cycle_errors: u64,
    pub notifications_sent: u64,
}

/// Shared state for health server
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    pub store_connected: AtomicBool,
    pub last_store_check: RwLock<Option<DateTime<Utc>>>,
    /// Running flag of the monitor loop
    pub monitor_running: Option<Arc<AtomicBool>>,
    pub metrics: Option<Arc<Metrics>>,
    /// A running monitor whose last cycle is older than this is degraded
    pub cycle_staleness_threshold: u64,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            store_connected: AtomicBool::new(false),
            last_store_check: RwLock::new(None),
            monitor_running: None,
            metrics: None,
            cycle_staleness_threshold: 300,
        }
    }

    pub fn with_metrics(mut self, m: Arc<Metrics>) -> Self {
        self.metrics = Some(m);
        self
    }

    pub fn with_monitor_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.monitor_running = Some(flag);
        self
    }

    /// Derive the staleness threshold from the poll interval
    pub fn with_poll_interval(mut self, poll_interval_secs: u64) -> Self {
        self.cycle_staleness_threshold = poll_interval_secs.saturating_mul(5).max(60);
        self
    }

    pub async fn record_store_check(&self, success: bool) {
        *self.last_store_check.write().await = Some(Utc::now());
        self.store_connected.store(success, Ordering::SeqCst);
    }

    fn is_monitor_running(&self) -> bool {
        self.monitor_running
            .as_ref()
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn last_cycle_at(&self) -> Option<DateTime<Utc>> {
        self.metrics.as_ref().and_then(|m| m.last_cycle_at())
    }

    /// Get overall health status
    pub async fn get_health(&self) -> HealthResponse {
        let mut components = Vec::new();
        let mut overall_status = HealthStatus::Healthy;
        let now = Utc::now();

        // Store health
        let store_connected = self.store_connected.load(Ordering::SeqCst);
        let store_status = if store_connected {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        if !store_connected {
            overall_status = HealthStatus::Unhealthy;
        }
        components.push(ComponentHealth {
            name: "store".to_string(),
            status: store_status,
            message: if store_connected {
                None
            } else {
                Some("Disconnected".to_string())
            },
            last_check: *self.last_store_check.read().await,
        });

        // Monitor health; an idle monitor is fine, it starts with the first active user
        let running = self.is_monitor_running();
        let last_cycle = self.last_cycle_at();
        let (monitor_status, message) = match (running, last_cycle) {
            (false, _) => (HealthStatus::Healthy, Some("Idle".to_string())),
            (true, None) => (HealthStatus::Healthy, Some("Waiting for first cycle".to_string())),
            (true, Some(at)) => {
                let age = (now - at).num_seconds().max(0) as u64;
                if age > self.cycle_staleness_threshold {
                    (HealthStatus::Degraded, Some(format!("Last cycle {}s ago", age)))
                } else {
                    (HealthStatus::Healthy, None)
                }
            }
        };
        if monitor_status == HealthStatus::Degraded && overall_status == HealthStatus::Healthy {
            overall_status = HealthStatus::Degraded;
        }
        components.push(ComponentHealth {
            name: "monitor".to_string(),
            status: monitor_status,
            message,
            last_check: last_cycle,
        });

        let counter = |f: fn(&Metrics) -> u64| self.metrics.as_deref().map(f).unwrap_or(0);

        HealthResponse {
            status: overall_status,
            timestamp: now,
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
            components,
            monitor_running: running,
            last_cycle_at: last_cycle,
            cycles: counter(|m| Metrics::get(&m.cycles)),
            cycle_errors: counter(|m| Metrics::get(&m.cycle_errors)),
            notifications_sent: counter(|m| Metrics::get(&m.notifications_sent)),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes served by the health server
pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Serve until shutdown is requested
    pub async fn run(&self, mut shutdown: ShutdownToken) -> crate::Result<()> {
        let app = router(Arc::clone(&self.state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| crate::SpikeError::Internal(format!("Health server error: {}", e)))?;

        info!("Health server stopped");
        Ok(())
    }

    /// Get shared state for updating from other components
    pub fn state(&self) -> Arc<HealthState> {
        Arc::clone(&self.state)
    }
}

/// Full health check endpoint
async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// Liveness: is the process alive?
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness: is the store reachable?
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let health_status = match health.status {
        HealthStatus::Healthy => 1,
        HealthStatus::Degraded => 0,
        HealthStatus::Unhealthy => -1,
    };

    let mut body = format!(
        r#"# HELP spikewatch_up Health status (1=healthy, 0=degraded, -1=unhealthy)
# TYPE spikewatch_up gauge
spikewatch_up {}

# HELP spikewatch_uptime_seconds Uptime in seconds
# TYPE spikewatch_uptime_seconds counter
spikewatch_uptime_seconds {}

# HELP spikewatch_store_connected Document store connection status
# TYPE spikewatch_store_connected gauge
spikewatch_store_connected {}

# HELP spikewatch_monitor_running Monitor loop running
# TYPE spikewatch_monitor_running gauge
spikewatch_monitor_running {}

"#,
        health_status,
        health.uptime_seconds,
        u8::from(state.store_connected.load(Ordering::SeqCst)),
        u8::from(health.monitor_running),
    );
    if let Some(ref m) = state.metrics {
        body.push_str(&m.prometheus());
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        body,
    )
}
