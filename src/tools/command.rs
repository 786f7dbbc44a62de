use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::process::Command;
use tracing::debug;

use super::{Tool, ToolDescriptor};
use crate::errors::ToolFailure;

const STDERR_TAIL: usize = 1500;

/// An external program exposed as a tool. Arguments are templates: `{name}`
/// is replaced by the string value of argument `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    /// `run_ffuf` and `run_sqlmap`.
    pub fn builtins() -> Vec<CommandSpec> {
        vec![
            CommandSpec {
                name: "run_ffuf".into(),
                program: "ffuf".into(),
                args: vec![
                    "-u".into(),
                    "{url}".into(),
                    "-w".into(),
                    "{wordlist}".into(),
                    "-ac".into(),
                    "-s".into(),
                ],
                description: "Content discovery with ffuf. Put FUZZ in the URL at the fuzzing point."
                    .into(),
                timeout_secs: Some(300),
            },
            CommandSpec {
                name: "run_sqlmap".into(),
                program: "sqlmap".into(),
                args: vec![
                    "-u".into(),
                    "{url}".into(),
                    "--batch".into(),
                    "--level=1".into(),
                    "--risk=1".into(),
                ],
                description: "Test a URL (including its parameters) for SQL injection with sqlmap."
                    .into(),
                timeout_secs: Some(600),
            },
        ]
    }
}

/// Runs a [`CommandSpec`]. The program is executed directly, never through a
/// shell, and the child is killed if the call is dropped (timeout).
pub struct CommandTool {
    spec: CommandSpec,
    descriptor: ToolDescriptor,
}

impl CommandTool {
    pub fn new(spec: CommandSpec) -> Self {
        let placeholders = placeholders(&spec.args);
        let mut properties = Map::new();
        for name in &placeholders {
            properties.insert(name.clone(), json!({"type": "string"}));
        }
        properties.insert(
            "options".into(),
            json!({"type": "string", "description": "Extra command-line arguments, whitespace separated"}),
        );
        let parameters = json!({
            "type": "object",
            "properties": properties,
            "required": placeholders,
        });

        let description = if spec.description.is_empty() {
            format!("Run the external program `{}`", spec.program)
        } else {
            spec.description.clone()
        };
        let mut descriptor = ToolDescriptor::new(spec.name.clone(), description, parameters);
        if let Some(secs) = spec.timeout_secs {
            descriptor = descriptor.with_timeout(Duration::from_secs(secs));
        }

        Self { spec, descriptor }
    }

    /// Final argv (without the program) for the given arguments.
    pub fn render_args(&self, args: &Value) -> Result<Vec<String>, ToolFailure> {
        let mut rendered = Vec::with_capacity(self.spec.args.len());
        for template in &self.spec.args {
            let mut missing = None;
            let arg = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
                let key = &caps[1];
                match args.get(key) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => {
                        if missing.is_none() {
                            missing = Some(key.to_string());
                        }
                        String::new()
                    }
                    Some(other) => other.to_string(),
                }
            });
            if let Some(key) = missing {
                return Err(ToolFailure::execution(format!(
                    "missing required argument '{}'",
                    key
                )));
            }
            rendered.push(arg.into_owned());
        }
        if let Some(options) = args.get("options").and_then(Value::as_str) {
            rendered.extend(options.split_whitespace().map(str::to_string));
        }
        Ok(rendered)
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, args: &Value) -> Result<String, ToolFailure> {
        let argv = self.render_args(args)?;
        debug!(program = %self.spec.program, ?argv, "spawning tool process");

        let output = Command::new(&self.spec.program)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ToolFailure::NotFound(format!(
                    "`{}` is not installed or not on PATH",
                    self.spec.program
                )),
                _ => ToolFailure::execution(format!("failed to run `{}`: {}", self.spec.program, e)),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(ToolFailure::execution(format!(
                "`{}` exited with {}: {}",
                self.spec.program,
                code,
                tail(stderr.trim(), STDERR_TAIL)
            )));
        }

        let text = stdout.trim();
        if text.is_empty() {
            let err = stderr.trim();
            if err.is_empty() {
                return Ok(format!("`{}` completed with no output", self.spec.program));
            }
            return Ok(err.to_string());
        }
        Ok(text.to_string())
    }
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is a valid static regex")
});

fn placeholders(templates: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for template in templates {
        for caps in PLACEHOLDER.captures_iter(template) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &text[start..]
}
