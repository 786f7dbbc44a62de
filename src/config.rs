//! Configuration for flagforge, read from `.flagforge/flagforge.toml`.
//!
//! Layering, lowest to highest: built-in defaults, the TOML file, environment
//! variables (a `.env` file is loaded first), then CLI flags applied by the
//! command handlers.
//!
//! ```toml
//! [engine]
//! crawl_max_pages = 25
//! crawl_max_depth = 2
//! probe_paths = ["/robots.txt", "/sitemap.xml", "/.git/HEAD", "/admin"]
//! summarize_max_iterations = 6
//! threat_model_max_iterations = 8
//! fuzz_max_attempts = 30
//! fuzz_iterations_per_task = 4
//! stop_on_flag = true
//! log_tail = 100
//!
//! [tools]
//! default_timeout_secs = 60
//! max_output_bytes = 16384
//! max_attempts = 2
//! files_dir = "files"
//!
//! [[tools.commands]]
//! name = "nikto"
//! program = "nikto"
//! args = ["-h", "{url}"]
//! timeout_secs = 300
//!
//! [oracle]
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! api_key_env = "FLAGFORGE_API_KEY"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//!
//! [logging]
//! level = "info"
//! json = false
//! file = ""
//! ```
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `FLAGFORGE_MODEL` | `oracle.model` |
//! | `FLAGFORGE_ORACLE_URL` | `oracle.base_url` |
//! | `FLAGFORGE_HOST` | `server.host` |
//! | `FLAGFORGE_PORT` | `server.port` |
//! | `FLAGFORGE_LOG` | `logging.level` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::EngineSettings;
use crate::oracle::ClientSettings;
use crate::retry::RetryPolicy;
use crate::tools::{CommandSpec, InvokerSettings};

pub const CONFIG_DIR: &str = ".flagforge";
pub const CONFIG_FILE: &str = "flagforge.toml";

/// Iteration caps and crawl bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_crawl_max_pages")]
    pub crawl_max_pages: usize,
    #[serde(default = "default_crawl_max_depth")]
    pub crawl_max_depth: usize,
    #[serde(default = "default_probe_paths")]
    pub probe_paths: Vec<String>,
    #[serde(default = "default_summarize_max_iterations")]
    pub summarize_max_iterations: u32,
    #[serde(default = "default_threat_model_max_iterations")]
    pub threat_model_max_iterations: u32,
    /// Global cap on tool calls in the fuzz stage
    #[serde(default = "default_fuzz_max_attempts")]
    pub fuzz_max_attempts: u32,
    #[serde(default = "default_fuzz_iterations_per_task")]
    pub fuzz_iterations_per_task: u32,
    /// Finish the run as soon as a flag is captured
    #[serde(default = "default_true")]
    pub stop_on_flag: bool,
    /// Log entries included in a status snapshot
    #[serde(default = "default_log_tail")]
    pub log_tail: usize,
}

fn default_crawl_max_pages() -> usize {
    25
}

fn default_crawl_max_depth() -> usize {
    2
}

fn default_probe_paths() -> Vec<String> {
    ["/robots.txt", "/sitemap.xml", "/.git/HEAD", "/admin"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_summarize_max_iterations() -> u32 {
    6
}

fn default_threat_model_max_iterations() -> u32 {
    8
}

fn default_fuzz_max_attempts() -> u32 {
    30
}

fn default_fuzz_iterations_per_task() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_log_tail() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            crawl_max_pages: default_crawl_max_pages(),
            crawl_max_depth: default_crawl_max_depth(),
            probe_paths: default_probe_paths(),
            summarize_max_iterations: default_summarize_max_iterations(),
            threat_model_max_iterations: default_threat_model_max_iterations(),
            fuzz_max_attempts: default_fuzz_max_attempts(),
            fuzz_iterations_per_task: default_fuzz_iterations_per_task(),
            stop_on_flag: true,
            log_tail: default_log_tail(),
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            crawl_max_pages: self.crawl_max_pages,
            crawl_max_depth: self.crawl_max_depth,
            probe_paths: self.probe_paths.clone(),
            summarize_max_iterations: self.summarize_max_iterations,
            threat_model_max_iterations: self.threat_model_max_iterations,
            fuzz_max_attempts: self.fuzz_max_attempts,
            fuzz_iterations_per_task: self.fuzz_iterations_per_task,
            stop_on_flag: self.stop_on_flag,
            tool_timeout: None,
        }
    }
}

/// Tool invocation limits and the extra command tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tool_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Attempts per call, for timeouts and transient failures
    #[serde(default = "default_tool_max_attempts")]
    pub max_attempts: u32,
    /// Directory `read_local_file` is confined to
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_max_output_bytes() -> usize {
    16 * 1024
}

fn default_tool_max_attempts() -> u32 {
    2
}

fn default_files_dir() -> PathBuf {
    PathBuf::from("files")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_tool_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_attempts: default_tool_max_attempts(),
            files_dir: default_files_dir(),
            commands: Vec::new(),
        }
    }
}

impl ToolsConfig {
    pub fn invoker_settings(&self) -> InvokerSettings {
        InvokerSettings {
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            max_output_bytes: self.max_output_bytes,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                jitter: 0.2,
                max_total_wait: Some(Duration::from_secs(30)),
            },
        }
    }
}

/// Reasoning oracle endpoint and its backoff schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Attempts under quota throttling, including the first
    #[serde(default = "default_oracle_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_total_wait_secs")]
    pub max_total_wait_secs: u64,
    /// Immediate retries for malformed responses and transport errors
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "FLAGFORGE_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_oracle_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_total_wait_secs() -> u64 {
    300
}

fn default_transient_retries() -> u32 {
    2
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_oracle_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_total_wait_secs: default_max_total_wait_secs(),
            transient_retries: default_transient_retries(),
        }
    }
}

impl OracleConfig {
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            quota: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                jitter: 0.25,
                max_total_wait: Some(Duration::from_secs(self.max_total_wait_secs)),
            },
            transient: RetryPolicy::immediate(self.transient_retries + 1),
        }
    }

    /// API key from the configured environment variable, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Daily-rolling log file; empty disables the file sink
    #[serde(default)]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: String::new(),
        }
    }
}

impl LoggingSection {
    pub fn file_path(&self) -> Option<PathBuf> {
        let file = self.file.trim();
        (!file.is_empty()).then(|| PathBuf::from(file))
    }
}

/// The complete flagforge.toml configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagforgeToml {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl FlagforgeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse flagforge.toml")
    }

    /// Load from `<dir>/flagforge.toml`, or defaults if the file does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the configuration for a process: explicit file if given
    /// (must exist), otherwise the default location, then the environment.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(Path::new(CONFIG_DIR))?,
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize flagforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `FLAGFORGE_*` overrides. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(model) = get("FLAGFORGE_MODEL") {
            self.oracle.model = model;
        }
        if let Some(url) = get("FLAGFORGE_ORACLE_URL") {
            self.oracle.base_url = url;
        }
        if let Some(host) = get("FLAGFORGE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = get("FLAGFORGE_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid FLAGFORGE_PORT '{}'", port))?;
        }
        if let Some(level) = get("FLAGFORGE_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let engine = &self.engine;

        if engine.crawl_max_pages == 0 {
            warnings.push("engine.crawl_max_pages is 0: only the target URL will be fetched".to_string());
        }
        for (name, value) in [
            ("summarize_max_iterations", engine.summarize_max_iterations),
            ("threat_model_max_iterations", engine.threat_model_max_iterations),
            ("fuzz_max_attempts", engine.fuzz_max_attempts),
            ("fuzz_iterations_per_task", engine.fuzz_iterations_per_task),
        ] {
            if value == 0 {
                warnings.push(format!("engine.{} is 0: the stage will do no work", name));
            }
        }
        if engine.log_tail == 0 {
            warnings.push("engine.log_tail is 0: status snapshots will carry no logs".to_string());
        }
        for path in &engine.probe_paths {
            if !path.starts_with('/') {
                warnings.push(format!("engine.probe_paths entry '{}' should start with '/'", path));
            }
        }

        if self.tools.default_timeout_secs == 0 {
            warnings.push("tools.default_timeout_secs is 0: every tool call will time out".to_string());
        }
        if self.tools.max_output_bytes > 1024 * 1024 {
            warnings.push(format!(
                "tools.max_output_bytes is {}: large outputs inflate oracle prompts",
                self.tools.max_output_bytes
            ));
        }
        if self.tools.max_attempts == 0 {
            warnings.push("tools.max_attempts is 0: treated as 1".to_string());
        }
        for cmd in &self.tools.commands {
            if cmd.name.trim().is_empty() || cmd.program.trim().is_empty() {
                warnings.push("tools.commands entry is missing a name or program".to_string());
            }
        }

        if self.oracle.max_attempts == 0 {
            warnings.push("oracle.max_attempts is 0: treated as 1".to_string());
        }
        if self.oracle.base_delay_ms > self.oracle.max_delay_ms {
            warnings.push(format!(
                "oracle.base_delay_ms ({}) exceeds oracle.max_delay_ms ({})",
                self.oracle.base_delay_ms, self.oracle.max_delay_ms
            ));
        }
        if url::Url::parse(&self.oracle.base_url).is_err() {
            warnings.push(format!("oracle.base_url '{}' is not a valid URL", self.oracle.base_url));
        }

        warnings
    }
}
