use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::attempt::AttemptExecutor;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::health::{HealthStore, SqliteHealthStore};
use crate::message::{extract_envelope, extract_messages, extract_model, Message};
use crate::provider::{ModelId, Provider, ProviderTemplate};
use crate::retry::RetryLoop;
use crate::router::Router;

/// The reliability engine. Owns the validated policy, the provider
/// templates, one HTTP client, and the health store; safe to share and
/// call concurrently.
pub struct Relay {
    config: RelayConfig,
    templates: HashMap<Provider, ProviderTemplate>,
    executor: AttemptExecutor,
    health: Arc<dyn HealthStore>,
}

impl Relay {
    pub fn new(config: RelayConfig, health: Arc<dyn HealthStore>) -> Result<Self> {
        config.validate()?;
        let mut templates = HashMap::new();
        for client in &config.clients {
            let template = ProviderTemplate::from_config(client)?;
            templates.insert(template.provider, template);
        }
        let http = reqwest::Client::builder().build()?;
        let executor = AttemptExecutor::new(http, Arc::clone(&health));
        Ok(Self {
            config,
            templates,
            executor,
            health,
        })
    }

    /// Builds the engine with a sqlite health store in the directory
    /// named by `RELAY_LLM_DATA_DIR` (or the OS temp directory).
    pub fn with_default_store(config: RelayConfig) -> Result<Self> {
        let store = SqliteHealthStore::open_default()?;
        Self::new(config, Arc::new(store))
    }

    pub fn health_store(&self) -> Arc<dyn HealthStore> {
        Arc::clone(&self.health)
    }

    /// Executes the request against the policy's candidate sequence and
    /// returns the first successful upstream response.
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        self.execute_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Like [`Relay::execute`], aborting as soon as `cancel` fires. The
    /// in-flight attempt is cancelled at the transport level and no
    /// further attempts or candidates are tried.
    pub async fn execute_with_cancellation(
        &self,
        request: reqwest::Request,
        cancel: CancellationToken,
    ) -> Result<reqwest::Response> {
        let payload = buffer_body(&request)?;
        let declared_model = extract_model(&payload);
        let inbound_provider = Provider::infer_from_url(request.url());
        let span = tracing::info_span!(
            "relay.execute",
            url = %request.url(),
            inbound_provider = inbound_provider.map(|p| p.as_str()).unwrap_or(""),
            declared_model = declared_model.as_deref().unwrap_or(""),
        );

        let user_messages = extract_messages(&payload).unwrap_or_default();
        let envelope = extract_envelope(&payload);
        self.run(user_messages, envelope, cancel)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        user_messages: Vec<Message>,
        envelope: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<reqwest::Response> {
        let retry = RetryLoop {
            config: &self.config,
            executor: &self.executor,
        };
        let mut router = Router::new(
            &self.config.models,
            Arc::clone(&self.health),
            self.config.health.clone(),
        );
        let mut last_error: Option<RelayError> = None;

        while let Some(candidate) = router.next_candidate().await {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            let model = match ModelId::parse(&candidate) {
                Ok(model) => model,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };
            let Some(template) = self.templates.get(&model.provider) else {
                tracing::warn!(model = %candidate, "no client registered for provider");
                last_error = Some(RelayError::UnknownProvider(model.provider.to_string()));
                continue;
            };
            match retry
                .run(template, &model, &user_messages, &envelope, &cancel)
                .await
            {
                Ok(response) => {
                    tracing::info!(
                        model = %candidate,
                        status = response.status().as_u16(),
                        "request served"
                    );
                    return Ok(response);
                }
                Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
                Err(err) => {
                    tracing::warn!(model = %candidate, error = %err, "model exhausted");
                    last_error = Some(err);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| {
            RelayError::InvalidConfig("no candidate models available".to_string())
        });
        Err(RelayError::Exhausted {
            last: Box::new(last),
        })
    }
}

/// The inbound body, buffered once so every attempt can replay it.
fn buffer_body(request: &reqwest::Request) -> Result<Bytes> {
    match request.body() {
        None => Ok(Bytes::new()),
        Some(body) => match body.as_bytes() {
            Some(bytes) => Ok(Bytes::copy_from_slice(bytes)),
            None => Err(RelayError::InvalidRequest(
                "request body must be buffered, not streamed".to_string(),
            )),
        },
    }
}
