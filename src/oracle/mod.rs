//! The reasoning oracle boundary.
//!
//! The engine only ever asks one question: given the run so far and the
//! available tools, call a tool or declare the stage complete.

pub mod openai;
pub mod rate_limited;

use async_trait::async_trait;
use flagforge_common::Stage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::OracleError;
use crate::tools::ToolDescriptor;

pub use openai::OpenAiCompatOracle;
pub use rate_limited::{ClientSettings, RateLimitedClient};

/// Everything the oracle gets for one decision.
#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    pub stage: Stage,
    /// Stage-specific instructions
    pub instructions: String,
    /// Compact text summary of the run state
    pub state_summary: String,
    pub tools: Vec<ToolDescriptor>,
    /// Tool calls already made in this stage loop, oldest first
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub tool: String,
    pub args: Value,
    /// `none` or the normalized tool error
    pub error: String,
    pub output: String,
}

/// What the oracle decided.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    ToolCall {
        tool: String,
        #[serde(default)]
        args: Value,
    },
    StageComplete(StageReport),
}

/// Results a stage hands back when the oracle finishes it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StageReport {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub vulnerabilities: Vec<ReportedVulnerability>,
    #[serde(default)]
    pub fuzz_tasks: Vec<ReportedFuzzTask>,
}

/// Vulnerability as reported; severity is validated by the stage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReportedVulnerability {
    #[serde(rename = "type")]
    pub vuln_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReportedFuzzTask {
    pub target: String,
    pub payload_class: String,
    #[serde(default)]
    pub vulnerability: Option<String>,
}

impl Decision {
    /// Parse a decision from model text. Accepts bare JSON or JSON wrapped in
    /// a markdown code fence.
    pub fn parse(text: &str) -> Result<Self, OracleError> {
        let trimmed = strip_code_fence(text.trim());
        serde_json::from_str(trimmed).map_err(|e| {
            let preview: String = trimmed.chars().take(200).collect();
            OracleError::Malformed(format!("{} in {:?}", e, preview))
        })
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// The reasoning component. Implementations report throttling as
/// [`OracleError::Quota`]; retry policy lives in [`RateLimitedClient`].
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn decide(&self, request: &OracleRequest) -> Result<Decision, OracleError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tool_call() {
        let d = Decision::parse(r#"{"action":"tool_call","tool":"fetch_page","args":{"url":"http://x"}}"#)
            .unwrap();
        assert_eq!(
            d,
            Decision::ToolCall {
                tool: "fetch_page".into(),
                args: json!({"url": "http://x"})
            }
        );
    }

    #[test]
    fn test_parse_stage_complete_with_defaults() {
        let d = Decision::parse(r#"{"action":"stage_complete","summary":"login form only"}"#).unwrap();
        match d {
            Decision::StageComplete(report) => {
                assert_eq!(report.summary, "login form only");
                assert!(report.vulnerabilities.is_empty());
            }
            other => panic!("Expected StageComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_fenced_json() {
        let text = "```json\n{\"action\":\"stage_complete\",\"vulnerabilities\":[{\"type\":\"sqli\",\"severity\":\"High\"}]}\n```";
        match Decision::parse(text).unwrap() {
            Decision::StageComplete(report) => {
                assert_eq!(report.vulnerabilities[0].vuln_type, "sqli");
                assert_eq!(report.vulnerabilities[0].severity, "High");
            }
            other => panic!("Expected StageComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_garbage_is_malformed() {
        assert!(matches!(
            Decision::parse("I think we should try SQL injection"),
            Err(OracleError::Malformed(_))
        ));
        assert!(matches!(
            Decision::parse(r#"{"action":"dance"}"#),
            Err(OracleError::Malformed(_))
        ));
    }
}
