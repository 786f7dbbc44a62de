use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tracing::debug;

use super::{Decision, Oracle, OracleRequest};
use crate::config::OracleConfig;
use crate::errors::OracleError;

const RESPONSE_CONTRACT: &str = r#"Reply with a single JSON object and nothing else. Either
{"action": "tool_call", "tool": "<tool name>", "args": {...}}
to run one tool, or
{"action": "stage_complete", "summary": "<text>", "vulnerabilities": [{"type": "...", "description": "...", "severity": "low|medium|high|critical", "location": "..."}], "fuzz_tasks": [{"target": "<url>", "payload_class": "...", "vulnerability": "..."}]}
when this stage is finished. Omit lists you have nothing to put in."#;

/// Oracle backed by an OpenAI-compatible chat completions endpoint.
pub struct OpenAiCompatOracle {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatOracle {
    pub fn new(config: &OracleConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build oracle HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: config.api_key(),
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn messages(request: &OracleRequest) -> Value {
        let tools = serde_json::to_string_pretty(&request.tools).unwrap_or_default();
        let system = format!(
            "{}\n\nAvailable tools:\n{}\n\n{}",
            request.instructions, tools, RESPONSE_CONTRACT
        );

        let mut user = format!("Current stage: {}\n\n{}", request.stage, request.state_summary);
        if !request.history.is_empty() {
            user.push_str("\n\nTool calls so far in this stage:\n");
            for (i, entry) in request.history.iter().enumerate() {
                user.push_str(&format!(
                    "{}. {} {} -> error: {}\n{}\n",
                    i + 1,
                    entry.tool,
                    entry.args,
                    entry.error,
                    entry.output
                ));
            }
        }

        json!([
            {"role": "system", "content": system},
            {"role": "user", "content": user},
        ])
    }
}

#[async_trait]
impl Oracle for OpenAiCompatOracle {
    async fn decide(&self, request: &OracleRequest) -> Result<Decision, OracleError> {
        let body = json!({
            "model": self.model,
            "messages": Self::messages(request),
            "temperature": 0.2,
            "response_format": {"type": "json_object"},
        });

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = response.status();
        let header_hint = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(Duration::from_secs_f64);
        let text = response
            .text()
            .await
            .map_err(|e| OracleError::Transport(format!("failed to read response: {}", e)))?;

        if status == StatusCode::TOO_MANY_REQUESTS || (!status.is_success() && is_quota_message(&text)) {
            return Err(OracleError::Quota {
                retry_after: header_hint.or_else(|| parse_retry_hint(&text)),
                message: preview(&text),
            });
        }
        if !status.is_success() {
            return Err(OracleError::Transport(format!(
                "HTTP {}: {}",
                status,
                preview(&text)
            )));
        }

        let data: Value = serde_json::from_str(&text)
            .map_err(|e| OracleError::Malformed(format!("response is not JSON: {}", e)))?;
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| OracleError::Malformed("response has no message content".to_string()))?;
        debug!(stage = %request.stage, content, "oracle decision");
        Decision::parse(content)
    }
}

static RETRY_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry in ([0-9]+(?:\.[0-9]+)?)\s*s").expect("retry hint pattern is a valid static regex")
});

static RETRY_DELAY_SECONDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"retry_?delay\W*\{?\W*seconds\W*([0-9]+)")
        .expect("retry delay pattern is a valid static regex")
});

/// Server-suggested delay embedded in an error body, such as
/// "Please retry in 12.5s" or `retry_delay { seconds: 30 }`.
pub fn parse_retry_hint(text: &str) -> Option<Duration> {
    if let Some(caps) = RETRY_IN.captures(text) {
        return caps[1].parse::<f64>().ok().map(Duration::from_secs_f64);
    }
    RETRY_DELAY_SECONDS
        .captures(text)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn is_quota_message(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("resource_exhausted") || lower.contains("rate limit") || lower.contains("quota")
}

fn preview(text: &str) -> String {
    text.chars().take(300).collect()
}
