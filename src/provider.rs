use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde_json::{Map, Value};

use crate::config::ClientConfig;
use crate::error::{RelayError, Result};
use crate::message::Message;

/// API version pinned on every Azure deployment URL.
pub const AZURE_API_VERSION: &str = "2023-05-15";

const API_KEY_HEADER: &str = "api-key";

/// Upstream dialects the engine can speak.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Provider {
    OpenAi,
    Azure,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Azure => "azure",
        }
    }

    /// Guesses the provider from a request URL. Azure wins over OpenAI
    /// because Azure OpenAI hosts contain both markers.
    pub fn infer_from_url(url: &Url) -> Option<Self> {
        let host = url.host_str()?;
        if host.contains("azure") {
            return Some(Provider::Azure);
        }
        if host.contains("openai.com") {
            return Some(Provider::OpenAi);
        }
        None
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(Provider::OpenAi),
            "azure" => Ok(Provider::Azure),
            other => Err(RelayError::InvalidConfig(format!(
                "unknown provider: {other}"
            ))),
        }
    }
}

/// A `"<provider>/<model>"` pair, e.g. `openai/gpt-4`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelId {
    pub provider: Provider,
    pub name: String,
}

impl ModelId {
    pub fn parse(full: &str) -> Result<Self> {
        if full.is_empty() {
            return Err(RelayError::InvalidConfig(
                "empty model name not allowed".to_string(),
            ));
        }
        let invalid = || {
            RelayError::InvalidConfig(format!(
                "invalid model format: {full} (expected 'provider/model')"
            ))
        };
        let (provider, name) = full.split_once('/').ok_or_else(invalid)?;
        if name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        let provider = provider.parse().map_err(|err| {
            RelayError::InvalidConfig(format!("invalid provider in model {full}: {err}"))
        })?;
        Ok(Self {
            provider,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// A registered upstream: base URL, credential, and any extra headers.
/// Immutable once the engine is built.
#[derive(Clone)]
pub struct ProviderTemplate {
    pub provider: Provider,
    pub url: Url,
    pub api_key: String,
    pub headers: BTreeMap<String, String>,
}

impl fmt::Debug for ProviderTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderTemplate")
            .field("provider", &self.provider)
            .field("url", &self.url.as_str())
            .field("api_key", &"<redacted>")
            .field("headers", &"<redacted>")
            .finish()
    }
}

impl ProviderTemplate {
    pub(crate) fn from_config(client: &ClientConfig) -> Result<Self> {
        let url = Url::parse(&client.base_url).map_err(|err| {
            RelayError::InvalidConfig(format!("invalid client url {}: {err}", client.base_url))
        })?;
        let provider = match client.provider.as_deref() {
            Some(name) => name.parse()?,
            None => Provider::infer_from_url(&url).ok_or_else(|| {
                RelayError::InvalidConfig(format!("cannot infer provider from client url {url}"))
            })?,
        };
        Ok(Self {
            provider,
            url,
            api_key: client.api_key.clone(),
            headers: client.headers.clone(),
        })
    }
}

/// Materializes one outbound chat-completion request for a candidate
/// model: provider-specific URL and auth, combined messages spliced into
/// the caller's envelope, per-attempt deadline on the request itself.
pub(crate) fn build_chat_request(
    http: &reqwest::Client,
    template: &ProviderTemplate,
    model: &ModelId,
    messages: &[Message],
    envelope: &Map<String, Value>,
    timeout: Duration,
) -> Result<reqwest::Request> {
    let mut body = envelope.clone();
    body.remove("model");
    body.remove("messages");
    body.insert("messages".to_string(), serde_json::to_value(messages)?);

    let url = match template.provider {
        Provider::OpenAi => {
            body.insert("model".to_string(), Value::String(model.name.clone()));
            template.url.clone()
        }
        Provider::Azure => {
            let mut url = template.url.clone();
            url.set_path(&format!(
                "/openai/deployments/{}/chat/completions",
                model.name
            ));
            url.set_query(Some(&format!("api-version={AZURE_API_VERSION}")));
            url
        }
    };

    let mut builder = http.post(url).timeout(timeout);
    for (name, value) in &template.headers {
        // Credentials always come from the template's api_key, never
        // from pass-through headers.
        if name.eq_ignore_ascii_case(API_KEY_HEADER) || name.eq_ignore_ascii_case("authorization") {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(CONTENT_TYPE, "application/json");
    builder = match template.provider {
        Provider::OpenAi => builder.bearer_auth(&template.api_key),
        Provider::Azure => builder.header(API_KEY_HEADER, &template.api_key),
    };

    Ok(builder.json(&body).build()?)
}
