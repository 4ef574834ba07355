use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::message::Message;
use crate::provider::{ModelId, ProviderTemplate};

pub(crate) const DEFAULT_MAX_RETRIES: u32 = 1;
pub(crate) const DEFAULT_TIMEOUT_SECONDS: f64 = 100.0;
pub(crate) const DEFAULT_BACKOFF_SECONDS: f64 = 1.0;

/// Tolerance when checking that weighted-policy weights sum to 1.0.
const WEIGHT_EPSILON: f64 = 1e-6;

/// One upstream client template. The provider is inferred from the URL
/// host unless set explicitly.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("headers", &"<redacted>")
            .finish()
    }
}

/// How candidates are drawn for each request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "models", rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Try the declared models in order.
    Ordered(Vec<String>),
    /// Draw a weighted permutation; weights must sum to 1.0.
    Weighted(BTreeMap<String, f64>),
}

impl RoutingPolicy {
    pub fn len(&self) -> usize {
        match self {
            RoutingPolicy::Ordered(models) => models.len(),
            RoutingPolicy::Weighted(weights) => weights.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn model_ids(&self) -> Vec<&str> {
        match self {
            RoutingPolicy::Ordered(models) => models.iter().map(String::as_str).collect(),
            RoutingPolicy::Weighted(weights) => weights.keys().map(String::as_str).collect(),
        }
    }
}

/// Extra attempt budgets keyed by the HTTP status of the last failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "scope", content = "rules", rename_all = "snake_case")]
pub enum StatusCodePolicy {
    Global(BTreeMap<u16, u32>),
    PerModel(BTreeMap<String, BTreeMap<u16, u32>>),
}

/// Rolling-latency health window. Queries clamp `no_of_calls` to
/// [1, 10] and `recovery_time` to one hour regardless of what is
/// configured here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    pub no_of_calls: u32,
    pub recovery_time: Duration,
    /// Mean latency (seconds) at or above which a model is unhealthy.
    /// Non-positive disables health filtering in the router.
    pub avg_latency_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            no_of_calls: 10,
            recovery_time: Duration::from_secs(600),
            avg_latency_threshold: 0.0,
        }
    }
}

/// The full routing policy the engine is built from. Validated once at
/// construction, immutable afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    pub clients: Vec<ClientConfig>,
    pub models: RoutingPolicy,
    /// Max attempts per model; models absent from the map get 1.
    #[serde(default)]
    pub max_retries: BTreeMap<String, u32>,
    /// Per-attempt deadline in seconds; default 100.
    #[serde(default)]
    pub timeout: BTreeMap<String, f64>,
    /// Backoff base in seconds; attempt `k` sleeps `base * 2^(k-1)`.
    #[serde(default)]
    pub backoff: BTreeMap<String, f64>,
    /// Messages prepended to every call for a model.
    #[serde(default)]
    pub model_messages: BTreeMap<String, Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code_retry: Option<StatusCodePolicy>,
    #[serde(default)]
    pub health: HealthConfig,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        self.validate_clients()?;
        self.validate_models()?;
        self.validate_retry_budgets()?;
        self.validate_durations()?;
        self.validate_status_code_retry()
    }

    fn validate_clients(&self) -> Result<()> {
        if self.clients.is_empty() {
            return Err(RelayError::InvalidConfig(
                "at least one client must be provided".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for client in &self.clients {
            let template = ProviderTemplate::from_config(client)?;
            if !seen.insert(template.provider) {
                return Err(RelayError::InvalidConfig(format!(
                    "multiple clients registered for provider {}",
                    template.provider
                )));
            }
        }
        Ok(())
    }

    fn validate_models(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(RelayError::InvalidConfig(
                "at least one model must be provided".to_string(),
            ));
        }
        for model in self.models.model_ids() {
            ModelId::parse(model)?;
        }
        match &self.models {
            RoutingPolicy::Ordered(models) => {
                let mut seen = BTreeSet::new();
                for model in models {
                    if !seen.insert(model.as_str()) {
                        return Err(RelayError::InvalidConfig(format!(
                            "duplicate model in ordered policy: {model}"
                        )));
                    }
                }
            }
            RoutingPolicy::Weighted(weights) => {
                let mut total = 0.0;
                for (model, weight) in weights {
                    if !weight.is_finite() || *weight <= 0.0 {
                        return Err(RelayError::InvalidConfig(format!(
                            "model {model} has invalid weight: {weight} (must be positive)"
                        )));
                    }
                    total += weight;
                }
                if (total - 1.0).abs() > WEIGHT_EPSILON {
                    return Err(RelayError::InvalidConfig(format!(
                        "model weights must sum to 1.0, got {total}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_retry_budgets(&self) -> Result<()> {
        for (model, retries) in &self.max_retries {
            if *retries == 0 {
                return Err(RelayError::InvalidConfig(format!(
                    "max retries for {model} must be positive"
                )));
            }
        }
        Ok(())
    }

    fn validate_durations(&self) -> Result<()> {
        for (model, seconds) in &self.timeout {
            if !seconds.is_finite() || *seconds <= 0.0 {
                return Err(RelayError::InvalidConfig(format!(
                    "timeout for {model} must be a positive number of seconds, got {seconds}"
                )));
            }
        }
        for (model, seconds) in &self.backoff {
            if !seconds.is_finite() || *seconds < 0.0 {
                return Err(RelayError::InvalidConfig(format!(
                    "backoff for {model} must be a non-negative number of seconds, got {seconds}"
                )));
            }
        }
        Ok(())
    }

    fn validate_status_code_retry(&self) -> Result<()> {
        match &self.status_code_retry {
            None => Ok(()),
            Some(StatusCodePolicy::Global(codes)) => validate_status_codes(codes),
            Some(StatusCodePolicy::PerModel(rules)) => {
                for (model, codes) in rules {
                    ModelId::parse(model).map_err(|err| {
                        RelayError::InvalidConfig(format!(
                            "invalid model in status code retry: {err}"
                        ))
                    })?;
                    validate_status_codes(codes).map_err(|err| {
                        RelayError::InvalidConfig(format!(
                            "invalid status codes for model {model}: {err}"
                        ))
                    })?;
                }
                Ok(())
            }
        }
    }

    pub(crate) fn max_retries_for(&self, model: &str) -> u32 {
        self.max_retries
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub(crate) fn timeout_for(&self, model: &str) -> Duration {
        Duration::from_secs_f64(
            self.timeout
                .get(model)
                .copied()
                .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        )
    }

    pub(crate) fn backoff_for(&self, model: &str) -> f64 {
        self.backoff
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_BACKOFF_SECONDS)
    }

    pub(crate) fn model_messages_for(&self, model: &str) -> &[Message] {
        self.model_messages
            .get(model)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn validate_status_codes(codes: &BTreeMap<u16, u32>) -> Result<()> {
    for code in codes.keys() {
        if !(100..=599).contains(code) {
            return Err(RelayError::InvalidConfig(format!(
                "status code {code} out of valid range (100-599)"
            )));
        }
    }
    Ok(())
}
