//! Fakes shared by the stage runner tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flagforge_common::{RunInput, Stage};
use serde_json::{Value, json};
use uuid::Uuid;

use super::{EngineSettings, StageContext, StageOutcome, StageRunner, progress_band};
use crate::errors::{OracleError, StageError, ToolFailure};
use crate::flags::FlagMatcher;
use crate::oracle::{
    ClientSettings, Decision, Oracle, OracleRequest, RateLimitedClient, ReportedFuzzTask, StageReport,
};
use crate::retry::RetryPolicy;
use crate::run::{RunState, RunWriter, new_run, normalize_url};
use crate::tools::{FetchedPage, InvokerSettings, Tool, ToolDescriptor, ToolInvoker, ToolRegistry, required_str};

/// In-memory website served through a `fetch_page` tool. Unknown URLs
/// answer with an HTTP 404 execution error.
pub struct FakeSite {
    descriptor: ToolDescriptor,
    pages: HashMap<String, FetchedPage>,
    hits: AtomicU32,
}

impl FakeSite {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new("fetch_page", "fake site", json!({"type": "object"})),
            pages: HashMap::new(),
            hits: AtomicU32::new(0),
        }
    }

    pub fn html(self, url: &str, body: &str) -> Self {
        self.page(url, "text/html; charset=utf-8", body)
    }

    pub fn text(self, url: &str, body: &str) -> Self {
        self.page(url, "text/plain", body)
    }

    fn page(mut self, url: &str, content_type: &str, body: &str) -> Self {
        self.pages.insert(
            normalize_url(url),
            FetchedPage {
                status: 200,
                url: url.to_string(),
                content_type: Some(content_type.to_string()),
                body: body.to_string(),
            },
        );
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FakeSite {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, args: &Value) -> Result<String, ToolFailure> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let url = required_str(args, "url")?;
        self.pages
            .get(&normalize_url(url))
            .map(FetchedPage::render)
            .ok_or_else(|| ToolFailure::execution(format!("HTTP 404 Not Found for {}", url)))
    }
}

/// Tool that never returns on its own.
pub struct HangingTool {
    descriptor: ToolDescriptor,
}

impl HangingTool {
    pub fn named(name: &str) -> Arc<Self> {
        Arc::new(Self {
            descriptor: ToolDescriptor::new(name, "hangs", json!({"type": "object"})),
        })
    }
}

#[async_trait]
impl Tool for HangingTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, _args: &Value) -> Result<String, ToolFailure> {
        std::future::pending::<()>().await;
        Ok(String::new())
    }
}

/// Replays decisions in order, then completes every stage with an empty report.
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Decision>>,
    pub requests: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new(decisions: Vec<Decision>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(decisions.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn decide(&self, request: &OracleRequest) -> Result<Decision, OracleError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Decision::StageComplete(StageReport::default())))
    }
}

/// Oracle that only ever asks for the same tool call.
pub struct LoopingOracle {
    tool: String,
    args: Value,
}

impl LoopingOracle {
    pub fn calling(tool: &str, args: Value) -> Arc<Self> {
        Arc::new(Self {
            tool: tool.to_string(),
            args,
        })
    }
}

#[async_trait]
impl Oracle for LoopingOracle {
    async fn decide(&self, _request: &OracleRequest) -> Result<Decision, OracleError> {
        Ok(Decision::ToolCall {
            tool: self.tool.clone(),
            args: self.args.clone(),
        })
    }
}

/// Completes every task at once and always asks for one more.
pub struct ChainingOracle {
    calls: AtomicUsize,
}

impl ChainingOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Oracle for ChainingOracle {
    async fn decide(&self, _request: &OracleRequest) -> Result<Decision, OracleError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Decision::StageComplete(StageReport {
            summary: format!("round {n} inconclusive"),
            fuzz_tasks: vec![ReportedFuzzTask {
                target: "/search".into(),
                payload_class: "xss".into(),
                vulnerability: None,
            }],
            ..Default::default()
        }))
    }
}

pub fn tool_call(tool: &str, args: Value) -> Decision {
    Decision::ToolCall {
        tool: tool.to_string(),
        args,
    }
}

/// A started run plus the handles a stage needs.
pub struct Harness {
    writer: RunWriter,
    tools: ToolInvoker,
    oracle: RateLimitedClient,
    pub settings: EngineSettings,
    flags: FlagMatcher,
    site: Option<Arc<FakeSite>>,
}

impl Harness {
    pub fn new(site: Arc<FakeSite>, oracle: Arc<dyn Oracle>) -> Self {
        let mut harness = Self::with_tools(vec![site.clone() as Arc<dyn Tool>], oracle);
        harness.site = Some(site);
        harness
    }

    pub fn without_tools(oracle: Arc<dyn Oracle>) -> Self {
        Self::with_tools(Vec::new(), oracle)
    }

    pub fn with_tools(tools: Vec<Arc<dyn Tool>>, oracle: Arc<dyn Oracle>) -> Self {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        let invoker = ToolInvoker::new(
            Arc::new(registry),
            InvokerSettings {
                default_timeout: Duration::from_millis(100),
                max_output_bytes: 16 * 1024,
                retry: RetryPolicy::none(),
            },
        );
        let client = RateLimitedClient::new(
            oracle,
            ClientSettings {
                quota: RetryPolicy::immediate(2),
                transient: RetryPolicy::immediate(2),
            },
        );

        let (writer, _reader) = new_run(Uuid::new_v4(), RunInput::new("http://ctf.local/"));
        writer.update(|s| s.start()).unwrap();

        Self {
            writer,
            tools: invoker,
            oracle: client,
            settings: EngineSettings {
                probe_paths: Vec::new(),
                ..EngineSettings::default()
            },
            flags: FlagMatcher::new(None),
            site: None,
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn run_stage(&self, runner: &dyn StageRunner, stage: Stage) -> Result<StageOutcome, StageError> {
        let index = Stage::PIPELINE.iter().position(|s| *s == stage).unwrap_or(0);
        let band = progress_band(index, Stage::PIPELINE.len());
        self.writer
            .update(|s| {
                s.enter_stage(stage)?;
                s.advance_progress(band.0)
            })
            .unwrap();
        let mut ctx = StageContext::new(
            stage,
            band,
            &self.writer,
            &self.tools,
            &self.oracle,
            &self.settings,
            &self.flags,
        );
        runner.run(&mut ctx).await
    }

    pub fn update(&self, f: impl FnOnce(&mut RunState) -> Result<(), crate::errors::StateError>) {
        self.writer.update(f).unwrap();
    }

    pub fn snapshot(&self) -> RunState {
        self.writer.read(|s| s.clone()).unwrap()
    }

    pub fn site_hits(&self) -> u32 {
        self.site.as_ref().map(|s| s.hits()).unwrap_or(0)
    }
}
