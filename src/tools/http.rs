use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};

use super::{Tool, ToolDescriptor, required_str};
use crate::errors::ToolFailure;

const USER_AGENT: &str = concat!("flagforge/", env!("CARGO_PKG_VERSION"));
const ERROR_BODY_PREVIEW: usize = 2000;

/// `fetch_page`: one HTTP request, response rendered as text.
pub struct FetchPageTool {
    client: reqwest::Client,
    descriptor: ToolDescriptor,
}

impl FetchPageTool {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .danger_accept_invalid_certs(true)
            .build()
            .context("Failed to build HTTP client")?;

        let descriptor = ToolDescriptor::new(
            "fetch_page",
            "Send an HTTP request and return status, final URL, content type and body.",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "Absolute URL"},
                    "method": {"type": "string", "description": "HTTP method, default GET"},
                    "headers": {"type": "object", "additionalProperties": {"type": "string"}},
                    "data": {
                        "description": "Request body: a string is sent raw, an object is form-encoded"
                    }
                },
                "required": ["url"]
            }),
        );
        Ok(Self { client, descriptor })
    }
}

#[async_trait]
impl Tool for FetchPageTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, args: &Value) -> Result<String, ToolFailure> {
        let url = required_str(args, "url")?;
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ToolFailure::execution(format!("invalid HTTP method '{}'", method)))?;

        let mut request = self.client.request(method, url);
        if let Some(headers) = args.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }
        match args.get("data") {
            Some(Value::String(body)) => request = request.body(body.clone()),
            Some(Value::Object(fields)) => {
                let form: Vec<(String, String)> = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
                    .collect();
                request = request.form(&form);
            }
            _ => {}
        }

        let response = request.send().await.map_err(classify_send_error)?;
        let status = response.status();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| ToolFailure::transient(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
            let message = format!("HTTP {} for {}\n{}", status, final_url, preview);
            return Err(if is_transient_status(status) {
                ToolFailure::transient(message)
            } else {
                ToolFailure::execution(message)
            });
        }

        Ok(FetchedPage {
            status: status.as_u16(),
            url: final_url,
            content_type,
            body,
        }
        .render())
    }
}

fn classify_send_error(e: reqwest::Error) -> ToolFailure {
    if e.is_timeout() || e.is_connect() {
        ToolFailure::transient(format!("request failed: {}", e))
    } else {
        ToolFailure::execution(format!("request failed: {}", e))
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// A fetched response in the text form `fetch_page` returns.
///
/// ```text
/// Status Code: 200
/// URL: http://target/after-redirect
/// Content-Type: text/html
///
/// <body...>
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub status: u16,
    pub url: String,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedPage {
    pub fn render(&self) -> String {
        format!(
            "Status Code: {}\nURL: {}\nContent-Type: {}\n\n{}",
            self.status,
            self.url,
            self.content_type.as_deref().unwrap_or("unknown"),
            self.body
        )
    }

    /// Inverse of [`FetchedPage::render`]; tolerates a truncated body.
    pub fn parse(output: &str) -> Option<Self> {
        let (head, body) = output.split_once("\n\n")?;
        let mut status = None;
        let mut url = None;
        let mut content_type = None;
        for line in head.lines() {
            if let Some(v) = line.strip_prefix("Status Code: ") {
                status = v.trim().parse().ok();
            } else if let Some(v) = line.strip_prefix("URL: ") {
                url = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("Content-Type: ") {
                content_type = Some(v.trim().to_string()).filter(|v| v != "unknown");
            }
        }
        Some(Self {
            status: status?,
            url: url?,
            content_type,
            body: body.to_string(),
        })
    }

    pub fn is_html(&self) -> bool {
        match &self.content_type {
            Some(ct) => ct.contains("html"),
            None => self.body.trim_start().starts_with('<'),
        }
    }
}
