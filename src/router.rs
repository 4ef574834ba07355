use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;

use crate::config::{HealthConfig, RoutingPolicy};
use crate::health::HealthStore;

/// Yields the candidate models for one request. Single-shot: built per
/// call, never reused.
pub(crate) struct Router {
    candidates: Vec<String>,
    health: Arc<dyn HealthStore>,
    health_config: HealthConfig,
    position: usize,
    yielded_any: bool,
    ignore_health: bool,
}

impl Router {
    pub(crate) fn new(
        policy: &RoutingPolicy,
        health: Arc<dyn HealthStore>,
        health_config: HealthConfig,
    ) -> Self {
        let candidates = match policy {
            RoutingPolicy::Ordered(models) => models.clone(),
            RoutingPolicy::Weighted(weights) => weighted_permutation(weights),
        };
        Self {
            candidates,
            health,
            health_config,
            position: 0,
            yielded_any: false,
            ignore_health: false,
        }
    }

    /// The next candidate, skipping unhealthy models. When every
    /// candidate is unhealthy the sequence is replayed once ignoring
    /// health (fail-open).
    pub(crate) async fn next_candidate(&mut self) -> Option<String> {
        loop {
            while self.position < self.candidates.len() {
                let candidate = self.candidates[self.position].clone();
                self.position += 1;
                if self.ignore_health || !self.health_filtering_enabled() {
                    self.yielded_any = true;
                    return Some(candidate);
                }
                match self.health.is_healthy(&candidate, &self.health_config).await {
                    Ok(true) => {
                        self.yielded_any = true;
                        return Some(candidate);
                    }
                    Ok(false) => {
                        tracing::debug!(model = %candidate, "skipping unhealthy model");
                    }
                    Err(err) => {
                        tracing::warn!(
                            model = %candidate,
                            error = %err,
                            "health lookup failed, treating model as healthy"
                        );
                        self.yielded_any = true;
                        return Some(candidate);
                    }
                }
            }
            if self.yielded_any || self.ignore_health {
                return None;
            }
            tracing::warn!("all candidate models unhealthy, replaying sequence ignoring health");
            self.ignore_health = true;
            self.position = 0;
        }
    }

    fn health_filtering_enabled(&self) -> bool {
        self.health_config.avg_latency_threshold > 0.0
    }
}

/// Weighted sampling without replacement: every model appears exactly
/// once, and the probability of being drawn first equals its weight.
fn weighted_permutation(weights: &BTreeMap<String, f64>) -> Vec<String> {
    let mut rng = rand::thread_rng();
    let mut remaining: Vec<(&String, f64)> = weights.iter().map(|(m, w)| (m, *w)).collect();
    let mut out = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let total: f64 = remaining.iter().map(|(_, weight)| weight).sum();
        let chosen = if total > 0.0 {
            let mut pick = rng.gen_range(0.0..total);
            let mut index = remaining.len() - 1;
            for (i, (_, weight)) in remaining.iter().enumerate() {
                if pick < *weight {
                    index = i;
                    break;
                }
                pick -= weight;
            }
            index
        } else {
            0
        };
        let (model, _) = remaining.swap_remove(chosen);
        out.push(model.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::health::HealthStoreError;

    struct StubHealth {
        unhealthy: Mutex<Vec<String>>,
        failing: bool,
    }

    impl StubHealth {
        fn with_unhealthy(models: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                unhealthy: Mutex::new(models.iter().map(|m| m.to_string()).collect()),
                failing: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                unhealthy: Mutex::new(Vec::new()),
                failing: true,
            })
        }
    }

    #[async_trait]
    impl HealthStore for StubHealth {
        async fn record(&self, _model: &str, _latency: f64) -> Result<(), HealthStoreError> {
            Ok(())
        }

        async fn is_healthy(
            &self,
            model: &str,
            _config: &HealthConfig,
        ) -> Result<bool, HealthStoreError> {
            if self.failing {
                return Err(HealthStoreError::Closed);
            }
            let unhealthy = self.unhealthy.lock().expect("lock");
            Ok(!unhealthy.iter().any(|m| m == model))
        }
    }

    fn filtering_config() -> HealthConfig {
        HealthConfig {
            no_of_calls: 5,
            recovery_time: std::time::Duration::from_secs(60),
            avg_latency_threshold: 1.0,
        }
    }

    fn ordered(models: &[&str]) -> RoutingPolicy {
        RoutingPolicy::Ordered(models.iter().map(|m| m.to_string()).collect())
    }

    async fn drain(router: &mut Router) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(candidate) = router.next_candidate().await {
            out.push(candidate);
        }
        out
    }

    #[tokio::test]
    async fn ordered_policy_yields_declared_order() {
        let policy = ordered(&["openai/gpt-4", "azure/gpt-4"]);
        let mut router = Router::new(&policy, StubHealth::with_unhealthy(&[]), filtering_config());
        assert_eq!(drain(&mut router).await, vec!["openai/gpt-4", "azure/gpt-4"]);
    }

    #[tokio::test]
    async fn unhealthy_candidates_are_skipped() {
        let policy = ordered(&["openai/gpt-4", "azure/gpt-4"]);
        let health = StubHealth::with_unhealthy(&["openai/gpt-4"]);
        let mut router = Router::new(&policy, health, filtering_config());
        assert_eq!(drain(&mut router).await, vec!["azure/gpt-4"]);
    }

    #[tokio::test]
    async fn all_unhealthy_replays_sequence_ignoring_health() {
        let policy = ordered(&["openai/gpt-4", "azure/gpt-4"]);
        let health = StubHealth::with_unhealthy(&["openai/gpt-4", "azure/gpt-4"]);
        let mut router = Router::new(&policy, health, filtering_config());
        assert_eq!(drain(&mut router).await, vec!["openai/gpt-4", "azure/gpt-4"]);
    }

    #[tokio::test]
    async fn store_errors_fail_open() {
        let policy = ordered(&["openai/gpt-4", "azure/gpt-4"]);
        let mut router = Router::new(&policy, StubHealth::failing(), filtering_config());
        assert_eq!(drain(&mut router).await, vec!["openai/gpt-4", "azure/gpt-4"]);
    }

    #[tokio::test]
    async fn non_positive_threshold_disables_filtering() {
        let policy = ordered(&["openai/gpt-4"]);
        let health = StubHealth::with_unhealthy(&["openai/gpt-4"]);
        let mut config = filtering_config();
        config.avg_latency_threshold = 0.0;
        let mut router = Router::new(&policy, health, config);
        assert_eq!(drain(&mut router).await, vec!["openai/gpt-4"]);
    }

    #[test]
    fn weighted_permutation_draws_each_model_once() {
        let mut weights = BTreeMap::new();
        weights.insert("openai/gpt-4".to_string(), 0.6);
        weights.insert("azure/gpt-4".to_string(), 0.3);
        weights.insert("openai/gpt-4o-mini".to_string(), 0.1);
        for _ in 0..100 {
            let mut drawn = weighted_permutation(&weights);
            assert_eq!(drawn.len(), 3);
            drawn.sort();
            drawn.dedup();
            assert_eq!(drawn.len(), 3);
        }
    }

    #[test]
    fn weighted_permutation_first_position_tracks_weights() {
        let mut weights = BTreeMap::new();
        weights.insert("openai/gpt-4".to_string(), 0.7);
        weights.insert("azure/gpt-4".to_string(), 0.3);

        let rounds = 5000;
        let mut firsts: HashMap<String, usize> = HashMap::new();
        for _ in 0..rounds {
            let drawn = weighted_permutation(&weights);
            *firsts.entry(drawn[0].clone()).or_default() += 1;
        }
        let openai_share = firsts["openai/gpt-4"] as f64 / rounds as f64;
        assert!(
            (openai_share - 0.7).abs() < 0.05,
            "first-position share {openai_share} too far from weight 0.7"
        );
    }
}
