//! System health derived from the state of every PLC link.
use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use crate::plc::{self, ConnectionManager, ConnectionState, PlcStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Degraded,
    Down,
}

impl ComponentStatus {
    /// A PLC is up while its connection is established and its breaker closed.
    pub fn of(status: &PlcStatus) -> Self {
        match (status.connected, status.circuit_open) {
            (true, false) => ComponentStatus::Up,
            (true, true) => ComponentStatus::Degraded,
            (false, _) => ComponentStatus::Down,
        }
    }
}

impl ServiceHealth {
    pub fn from_counts(healthy: usize, total: usize) -> Self {
        if total == 0 {
            return ServiceHealth::Unhealthy;
        }
        let ratio = healthy as f64 / total as f64;
        if ratio >= 1.0 {
            ServiceHealth::Healthy
        } else if ratio >= 0.5 {
            ServiceHealth::Degraded
        } else {
            ServiceHealth::Unhealthy
        }
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct PlcHealth {
    pub plc_id: String,
    pub status: ComponentStatus,
    pub state: ConnectionState,
    pub circuit_open: bool,
    pub host: String,
    pub port: u16,
    /// Absent until a request has succeeded.
    pub response_time_ms: Option<f64>,
    pub success_rate: f64,
    pub uptime_seconds: f64,
    pub last_error: Option<String>,
    pub last_error_time: Option<jiff::Timestamp>,
}

impl From<PlcStatus> for PlcHealth {
    fn from(status: PlcStatus) -> Self {
        let response_time_ms = (status.metrics.successful_requests > 0)
            .then_some(status.metrics.average_response_time_ms);
        Self {
            status: ComponentStatus::of(&status),
            success_rate: status.metrics.success_rate(),
            response_time_ms,
            plc_id: status.plc_id,
            state: status.state,
            circuit_open: status.circuit_open,
            host: status.host,
            port: status.port,
            uptime_seconds: status.uptime_seconds,
            last_error: status.metrics.last_error,
            last_error_time: status.metrics.last_error_time,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct Performance {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    /// Mean of the per-PLC averages, over PLCs that have answered at least once.
    pub average_response_time_ms: f64,
}

impl Performance {
    pub fn summarize(statuses: &[PlcStatus]) -> Self {
        let mut summary = Performance::default();
        let mut answered = 0;
        let mut response_time_total = 0.0;
        for status in statuses {
            summary.total_requests += status.metrics.total_requests;
            summary.successful_requests += status.metrics.successful_requests;
            summary.failed_requests += status.metrics.failed_requests;
            if status.metrics.successful_requests > 0 {
                answered += 1;
                response_time_total += status.metrics.average_response_time_ms;
            }
        }
        if summary.total_requests > 0 {
            summary.success_rate =
                summary.successful_requests as f64 / summary.total_requests as f64;
        }
        if answered > 0 {
            summary.average_response_time_ms = response_time_total / f64::from(answered);
        }
        summary
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct SystemHealth {
    pub overall_status: ServiceHealth,
    pub service_uptime_seconds: f64,
    pub total_plcs: usize,
    pub healthy_plcs: usize,
    pub degraded_plcs: usize,
    pub unhealthy_plcs: usize,
    pub plcs: Vec<PlcHealth>,
    pub performance: Performance,
    pub timestamp: jiff::Timestamp,
}

impl SystemHealth {
    pub fn from_statuses(statuses: Vec<PlcStatus>, service_uptime_seconds: f64) -> Self {
        let performance = Performance::summarize(&statuses);
        let plcs = statuses.into_iter().map(PlcHealth::from).collect::<Vec<_>>();
        let count = |s| plcs.iter().filter(|p| p.status == s).count();
        let healthy_plcs = count(ComponentStatus::Up);
        let degraded_plcs = count(ComponentStatus::Degraded);
        let unhealthy_plcs = count(ComponentStatus::Down);
        Self {
            overall_status: ServiceHealth::from_counts(healthy_plcs, plcs.len()),
            service_uptime_seconds,
            total_plcs: plcs.len(),
            healthy_plcs,
            degraded_plcs,
            unhealthy_plcs,
            plcs,
            performance,
            timestamp: jiff::Timestamp::now(),
        }
    }
}

pub struct HealthService {
    manager: Arc<ConnectionManager>,
    started: Instant,
}

impl HealthService {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager, started: Instant::now() }
    }

    pub fn plc_health(&self, plc_id: &str) -> Result<PlcHealth, plc::Error> {
        Ok(self.manager.status(plc_id)?.into())
    }

    /// Health as of the last requests made, without contacting any PLC.
    pub fn system_health(&self) -> SystemHealth {
        let health = SystemHealth::from_statuses(
            self.manager.statuses(),
            self.started.elapsed().as_secs_f64(),
        );
        debug!(
            message = "system health",
            overall = %health.overall_status,
            healthy = health.healthy_plcs,
            total = health.total_plcs,
        );
        health
    }

    /// Ping every PLC, then report.
    pub async fn check(&self) -> SystemHealth {
        self.manager.ping_all().await;
        self.system_health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plc::Metrics;

    fn status(connected: bool, circuit_open: bool) -> PlcStatus {
        PlcStatus {
            plc_id: "r4".to_string(),
            host: "127.0.0.1".to_string(),
            port: 502,
            state: if connected { ConnectionState::Connected } else { ConnectionState::Error },
            connected,
            circuit_open,
            failure_count: 0,
            uptime_seconds: 1.0,
            metrics: Metrics::default(),
        }
    }

    #[test]
    fn component_status() {
        assert_eq!(ComponentStatus::of(&status(true, false)), ComponentStatus::Up);
        assert_eq!(ComponentStatus::of(&status(true, true)), ComponentStatus::Degraded);
        assert_eq!(ComponentStatus::of(&status(false, false)), ComponentStatus::Down);
        assert_eq!(ComponentStatus::of(&status(false, true)), ComponentStatus::Down);
    }

    #[test]
    fn overall_health_by_ratio() {
        assert_eq!(ServiceHealth::from_counts(0, 0), ServiceHealth::Unhealthy);
        assert_eq!(ServiceHealth::from_counts(3, 3), ServiceHealth::Healthy);
        assert_eq!(ServiceHealth::from_counts(1, 2), ServiceHealth::Degraded);
        assert_eq!(ServiceHealth::from_counts(1, 3), ServiceHealth::Unhealthy);
    }

    #[test]
    fn summarizes_statuses() {
        let mut up = status(true, false);
        up.metrics.total_requests = 4;
        up.metrics.successful_requests = 3;
        up.metrics.failed_requests = 1;
        up.metrics.average_response_time_ms = 12.0;
        let mut down = status(false, true);
        down.metrics.total_requests = 4;
        down.metrics.failed_requests = 4;
        let health = SystemHealth::from_statuses(vec![up, down, status(true, true)], 5.0);
        assert_eq!(health.total_plcs, 3);
        assert_eq!((health.healthy_plcs, health.degraded_plcs, health.unhealthy_plcs), (1, 1, 1));
        assert_eq!(health.overall_status, ServiceHealth::Unhealthy);
        assert_eq!(health.performance.total_requests, 8);
        assert_eq!(health.performance.success_rate, 3.0 / 8.0);
        assert_eq!(health.performance.average_response_time_ms, 12.0);
        assert_eq!(health.plcs[0].response_time_ms, Some(12.0));
        assert_eq!(health.plcs[1].response_time_ms, None);
    }
}
