//! Health check module
//! Provides health status for the application and its dependencies

use serde::Serialize;
use std::collections::HashMap;
#[cfg(feature = "database")]
use std::time::{Duration, Instant};
#[cfg(feature = "database")]
use tokio::time::timeout;
#[cfg(feature = "database")]
use tracing::{error, info};

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }

    /// Worst component wins
    fn settle(&mut self) {
        let mut state = HealthState::Healthy;
        for check in self.checks.values() {
            match check.status {
                ComponentState::Down => {
                    state = HealthState::Unhealthy;
                    break;
                }
                ComponentState::Warning => state = HealthState::Degraded,
                ComponentState::Up => {}
            }
        }
        self.status = state;
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Health checker for the application
#[derive(Clone, Default)]
pub struct HealthChecker {
    #[cfg(feature = "database")]
    db_pool: Option<sqlx::PgPool>,
    providers: Vec<String>,
}

impl HealthChecker {
    /// Checker for a gateway running on the in-memory store
    pub fn new(providers: Vec<String>) -> Self {
        Self {
            providers,
            ..Default::default()
        }
    }

    #[cfg(feature = "database")]
    pub fn with_database(mut self, db_pool: sqlx::PgPool) -> Self {
        self.db_pool = Some(db_pool);
        self
    }

    /// Perform comprehensive health check
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();

        health_status
            .checks
            .insert("database".to_string(), self.database_component().await);

        let providers = if self.providers.is_empty() {
            ComponentHealth::down(Some("no payment providers registered".to_string()))
        } else {
            ComponentHealth {
                details: Some(self.providers.join(",")),
                ..ComponentHealth::up(None)
            }
        };
        health_status
            .checks
            .insert("providers".to_string(), providers);

        health_status.settle();
        health_status
    }

    #[cfg(feature = "database")]
    async fn database_component(&self) -> ComponentHealth {
        let pool = match &self.db_pool {
            Some(pool) => pool,
            None => return in_memory_component(),
        };

        match timeout(Duration::from_secs(5), check_database_health(pool)).await {
            Ok(Ok(response_time)) => {
                info!("Database health check: OK ({}ms)", response_time);
                ComponentHealth::up(Some(response_time))
            }
            Ok(Err(e)) => {
                error!("Database health check failed: {}", e);
                ComponentHealth::down(Some(e.to_string()))
            }
            Err(_) => {
                error!("Database health check timed out");
                ComponentHealth::down(Some("Timeout".to_string()))
            }
        }
    }

    #[cfg(not(feature = "database"))]
    async fn database_component(&self) -> ComponentHealth {
        in_memory_component()
    }
}

fn in_memory_component() -> ComponentHealth {
    ComponentHealth::warning(None, Some("running on the in-memory store".to_string()))
}

#[cfg(feature = "database")]
pub async fn check_database_health(
    pool: &sqlx::PgPool,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();

    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => Ok(start.elapsed().as_millis()),
        Err(e) => Err(Box::new(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));

        let warning_health = ComponentHealth::warning(Some(500), Some("Slow response".to_string()));
        assert!(matches!(warning_health.status, ComponentState::Warning));
        assert_eq!(warning_health.response_time_ms, Some(500));
        assert_eq!(warning_health.details, Some("Slow response".to_string()));
    }

    #[tokio::test]
    async fn test_in_memory_gateway_is_degraded() {
        let checker = HealthChecker::new(vec!["cash".to_string()]);
        let status = checker.check_health().await;
        assert!(matches!(status.status, HealthState::Degraded));
        assert!(matches!(status.checks["providers"].status, ComponentState::Up));
    }

    #[tokio::test]
    async fn test_no_providers_is_unhealthy() {
        let status = HealthChecker::new(Vec::new()).check_health().await;
        assert!(!status.is_healthy());
        assert!(matches!(status.status, HealthState::Unhealthy));
    }
}
