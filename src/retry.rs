use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::attempt::AttemptExecutor;
use crate::config::{RelayConfig, StatusCodePolicy};
use crate::error::{RelayError, Result};
use crate::message::{combine_messages, Message};
use crate::provider::{build_chat_request, ModelId, ProviderTemplate};

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Drives attempts against a single candidate model until success or
/// budget exhaustion.
pub(crate) struct RetryLoop<'a> {
    pub(crate) config: &'a RelayConfig,
    pub(crate) executor: &'a AttemptExecutor,
}

impl RetryLoop<'_> {
    pub(crate) async fn run(
        &self,
        template: &ProviderTemplate,
        model: &ModelId,
        user_messages: &[Message],
        envelope: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let full = model.to_string();
        let messages = combine_messages(self.config.model_messages_for(&full), user_messages);
        let timeout = self.config.timeout_for(&full);
        let backoff = self.config.backoff_for(&full);

        let mut attempt: u32 = 0;
        let mut last_status: Option<u16> = None;
        let mut last_error: Option<RelayError> = None;

        loop {
            // The first attempt runs under the model's own budget; once a
            // status is observed, its rule (if any) governs how many tries
            // this model gets in total.
            let max_attempts = status_budget(self.config, &full, last_status);
            if attempt >= max_attempts {
                let Some(err) = last_error else {
                    return Err(RelayError::InvalidConfig(format!(
                        "retry budget for {full} permits no attempts"
                    )));
                };
                return Err(err);
            }

            if attempt > 0 {
                let delay = Duration::from_secs_f64(backoff * 2f64.powi(attempt as i32 - 1));
                tracing::debug!(
                    model = %full,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let request = build_chat_request(
                self.executor.client(),
                template,
                model,
                &messages,
                envelope,
                timeout,
            )?;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                outcome = self.executor.execute(request, &full) => outcome,
            };

            match outcome {
                Ok((response, elapsed)) => {
                    let status = response.status();
                    if status.is_success() {
                        tracing::debug!(
                            model = %full,
                            attempt,
                            status = status.as_u16(),
                            elapsed_ms = elapsed.as_millis() as u64,
                            "attempt succeeded"
                        );
                        return Ok(response);
                    }
                    tracing::debug!(
                        model = %full,
                        attempt,
                        status = status.as_u16(),
                        "attempt returned error status"
                    );
                    last_status = Some(status.as_u16());
                    last_error = Some(RelayError::Api {
                        status,
                        body: excerpt(response).await,
                    });
                }
                Err(err) => {
                    tracing::debug!(model = %full, attempt, error = %err, "attempt failed");
                    last_error = Some(err);
                }
            }
            attempt += 1;
        }
    }
}

/// Budget for the next attempt: a per-model status rule wins, then a
/// global status rule, then the model's own retry budget (default 1).
pub(crate) fn status_budget(config: &RelayConfig, model: &str, last_status: Option<u16>) -> u32 {
    if let Some(status) = last_status {
        match config.status_code_retry.as_ref() {
            Some(StatusCodePolicy::PerModel(rules)) => {
                if let Some(limit) = rules.get(model).and_then(|codes| codes.get(&status)) {
                    return *limit;
                }
            }
            Some(StatusCodePolicy::Global(codes)) => {
                if let Some(limit) = codes.get(&status) {
                    return *limit;
                }
            }
            None => {}
        }
    }
    config.max_retries_for(model)
}

async fn excerpt(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) => {
            let len = bytes.len().min(MAX_ERROR_BODY_BYTES);
            String::from_utf8_lossy(&bytes[..len]).into_owned()
        }
        Err(_) => String::new(),
    }
}
