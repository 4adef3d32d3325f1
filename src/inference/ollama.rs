use super::CompletionService;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config;

/// Client for a local Ollama server.
#[derive(Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: Url,
    model: String,
}

impl fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OllamaClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

impl OllamaClient {
    pub fn from_config(cfg: &config::Inference) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url)
            .with_context(|| format!("invalid inference.base_url: {}", cfg.base_url))?;
        Self::with_base_url(base_url, cfg.model.clone(), cfg.request_timeout())
    }

    pub fn with_base_url(mut base_url: Url, model: String, timeout: Duration) -> Result<Self> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent("tender-scout/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn build_generate_request(&self, system: &str, prompt: &str) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("api/generate")
            .context("invalid Ollama base URL")?;
        self.http
            .post(endpoint)
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                system,
                stream: false,
            })
            .build()
            .context("failed to build Ollama request")
    }

    /// True when the server answers the model listing endpoint.
    pub async fn health_check(&self) -> bool {
        match self.list_models().await {
            Ok(_) => true,
            Err(err) => {
                warn!(?err, "ollama health check failed");
                false
            }
        }
    }

    /// Whether the configured model is installed. A missing model is logged,
    /// not treated as an error.
    pub async fn ensure_model_available(&self) -> Result<bool> {
        let models = self.list_models().await?;
        let tagged = format!("{}:latest", self.model);
        let present = models.iter().any(|m| *m == self.model || *m == tagged);
        if !present {
            warn!(model = %self.model, available = ?models, "configured model not found");
        }
        Ok(present)
    }
}

#[async_trait]
impl CompletionService for OllamaClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let request = self.build_generate_request(system, prompt)?;
        debug!(url = %request.url(), model = %self.model, "ollama generate");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach Ollama")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("ollama error {}: {}", status, body));
        }
        let payload: GenerateResponse = res.json().await.context("invalid Ollama response JSON")?;
        Ok(payload.response)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let endpoint = self
            .base_url
            .join("api/tags")
            .context("invalid Ollama base URL")?;
        let res = self
            .http
            .get(endpoint)
            .send()
            .await
            .context("failed to reach Ollama")?;
        if !res.status().is_success() {
            return Err(anyhow!("ollama error {}", res.status()));
        }
        let tags: TagsResponse = res.json().await.context("invalid Ollama tags JSON")?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn generate_request_targets_api_under_base_path() {
        let client = OllamaClient::with_base_url(
            Url::parse("http://gpu-box:11434/ollama").unwrap(),
            "llama2".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        let req = client.build_generate_request("sys", "hello").unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "http://gpu-box:11434/ollama/api/generate");

        let body = req.body().and_then(|b| b.as_bytes()).unwrap();
        let json: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["model"], "llama2");
        assert_eq!(json["system"], "sys");
        assert_eq!(json["prompt"], "hello");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn from_config_rejects_bad_url() {
        let mut cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
        cfg.inference.base_url = "not a url".into();
        assert!(OllamaClient::from_config(&cfg.inference).is_err());
    }
}
