use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use parcel_types::{HealthResponse, HealthStatus};

/// Requests needed before the error rate alone can make the server critical.
const MIN_REQUESTS_FOR_CRITICAL: u64 = 20;
const CRITICAL_ERROR_RATE: f64 = 0.5;
const WARNING_ERROR_RATE: f64 = 0.1;
const WARNING_LOAD: f64 = 0.8;

pub const HEALTH_PATH: &str = "/api/health";

/// Request counters feeding `/api/health`.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    requests: AtomicU64,
    errors: AtomicU64,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, status: u16) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if status >= 400 {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn error_rate(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        self.errors.load(Ordering::Relaxed) as f64 / requests as f64
    }

    pub fn report(&self, active: u64, total: u64, max_active: u64) -> HealthResponse {
        let error_rate = self.error_rate();
        HealthResponse {
            status: classify(active, max_active, self.requests.load(Ordering::Relaxed), error_rate),
            active_uploads: active,
            total_uploads: total,
            error_rate,
        }
    }
}

fn classify(active: u64, max_active: u64, requests: u64, error_rate: f64) -> HealthStatus {
    if active >= max_active
        || (requests >= MIN_REQUESTS_FOR_CRITICAL && error_rate > CRITICAL_ERROR_RATE)
    {
        HealthStatus::Critical
    } else if active as f64 >= max_active as f64 * WARNING_LOAD || error_rate > WARNING_ERROR_RATE {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

/// Counts every response except health checks themselves.
pub async fn track(State(monitor): State<Arc<HealthMonitor>>, req: Request, next: Next) -> Response {
    let health_check = req.uri().path() == HEALTH_PATH;
    let response = next.run(req).await;
    if !health_check {
        monitor.record(response.status().as_u16());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_thresholds() {
        assert_eq!(classify(0, 10, 0, 0.0), HealthStatus::Healthy);
        assert_eq!(classify(8, 10, 0, 0.0), HealthStatus::Warning);
        assert_eq!(classify(10, 10, 0, 0.0), HealthStatus::Critical);
    }

    #[test]
    fn error_rate_needs_volume_before_critical() {
        assert_eq!(classify(0, 10, 5, 0.8), HealthStatus::Warning);
        assert_eq!(classify(0, 10, 20, 0.8), HealthStatus::Critical);
        assert_eq!(classify(0, 10, 100, 0.05), HealthStatus::Healthy);
    }

    #[test]
    fn monitor_counts_client_and_server_errors() {
        let monitor = HealthMonitor::new();
        monitor.record(200);
        monitor.record(404);
        monitor.record(500);
        monitor.record(201);
        assert!((monitor.error_rate() - 0.5).abs() < 1e-9);

        let report = monitor.report(1, 7, 1000);
        assert_eq!(report.status, HealthStatus::Warning);
        assert_eq!(report.total_uploads, 7);
    }
}
