use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{RelayError, Result};
use crate::health::HealthStore;

/// Performs exactly one HTTP round-trip and records its latency,
/// whatever the outcome. Slow failures must degrade health just like
/// slow successes.
pub(crate) struct AttemptExecutor {
    http: reqwest::Client,
    health: Arc<dyn HealthStore>,
}

impl AttemptExecutor {
    pub(crate) fn new(http: reqwest::Client, health: Arc<dyn HealthStore>) -> Self {
        Self { http, health }
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.http
    }

    /// The per-attempt deadline rides on the request itself, so hitting
    /// it cancels the transport and surfaces as a reqwest timeout error.
    pub(crate) async fn execute(
        &self,
        request: reqwest::Request,
        model: &str,
    ) -> Result<(reqwest::Response, Duration)> {
        let started = Instant::now();
        let outcome = self.http.execute(request).await;
        let elapsed = started.elapsed();
        if let Err(err) = self.health.record(model, elapsed.as_secs_f64()).await {
            tracing::warn!(model, error = %err, "failed to record attempt latency");
        }
        match outcome {
            Ok(response) => Ok((response, elapsed)),
            Err(err) => Err(RelayError::Http(err)),
        }
    }
}
