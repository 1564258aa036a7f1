pub mod health;
pub mod metrics;

pub use health::{ComponentHealth, HealthResponse, HealthServer, HealthState, HealthStatus};
pub use metrics::Metrics;
