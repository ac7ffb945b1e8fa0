//! Cloud telemetry forwarding (WiFi gateway).
//!
//! Each reading becomes one `POST {base_url}/api/v1/{token}/telemetry` with a
//! small `{si, pga, temp}` body. Delivery is best effort: failures are logged
//! and counted, never retried.
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use tokio::time::timeout;

use crate::errors::{QuakeError, QuakeResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetryPoint {
    pub si: f64,
    pub pga: f64,
    pub temp: f64,
}

pub trait TelemetrySink: Send {
    fn publish(&self, token: &str, point: TelemetryPoint) -> impl Future<Output = QuakeResult<()>> + Send;
}

pub struct HttpTelemetry {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTelemetry {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn url_for(&self, token: &str) -> String {
        format!(
            "{}/api/v1/{}/telemetry",
            self.base_url,
            urlencoding::encode(token)
        )
    }
}

impl TelemetrySink for HttpTelemetry {
    async fn publish(&self, token: &str, point: TelemetryPoint) -> QuakeResult<()> {
        let url = self.url_for(token);
        let request = self.client.post(&url).json(&point).send();
        let response = timeout(self.timeout, request)
            .await
            .map_err(|_| QuakeError::Transport(format!("telemetry timeout after {}s", self.timeout.as_secs())))??;
        if !response.status().is_success() {
            warn!("Telemetry rejected: status {}", response.status());
            return Err(QuakeError::Transport(format!(
                "telemetry status {}",
                response.status()
            )));
        }
        debug!("Telemetry delivered ({} bytes token)", token.len());
        Ok(())
    }
}

/// Collects published points in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryTelemetry {
    points: Arc<Mutex<Vec<(String, TelemetryPoint)>>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<(String, TelemetryPoint)> {
        self.points.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for MemoryTelemetry {
    async fn publish(&self, token: &str, point: TelemetryPoint) -> QuakeResult<()> {
        self.points
            .lock()
            .map_err(|_| QuakeError::Transport("telemetry store poisoned".into()))?
            .push((token.to_string(), point));
        Ok(())
    }
}

/// Telemetry disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTelemetry;

impl TelemetrySink for NoTelemetry {
    async fn publish(&self, _token: &str, _point: TelemetryPoint) -> QuakeResult<()> {
        Ok(())
    }
}
