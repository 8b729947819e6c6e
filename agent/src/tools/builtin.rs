//! Built-in tools: thin, schema-checked wrappers over the filesystem, the
//! shell, HTTP, the background process manager and the operator.
//!
//! File tools are confined to the project directory. Every handler decodes its
//! input into a typed struct; the registry has already validated the schema.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use walkdir::WalkDir;

use crate::core::command_policy::check_command;
use crate::io::background::ProcessManager;
use crate::io::config::AgentConfig;
use crate::io::paths::write_atomic;
use crate::io::process::{ShellCommand, run_command_with_timeout};
use crate::tools::operator::Operator;
use crate::tools::{AbortError, ToolHandler, ToolRegistry, ToolSpec, handler_fn};

/// Upper bound on a single `wait_for_ready` call.
const MAX_READY_WAIT: Duration = Duration::from_secs(600);
/// Slack between a tool's own deadline and the executor's race.
const TIMEOUT_SLACK: Duration = Duration::from_secs(5);
const HTTP_BODY_LIMIT: usize = 4_000;
const LIST_LIMIT: usize = 500;
const DEFAULT_LOG_LINES: usize = 50;
const SKIPPED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    ".setup-agent",
    "__pycache__",
    ".venv",
];

/// Everything the built-in handlers share.
pub struct ToolContext {
    pub project_dir: PathBuf,
    pub processes: Arc<ProcessManager>,
    pub operator: Arc<dyn Operator>,
    pub http: reqwest::Client,
    /// Wall-clock bound for a foreground `run_command`.
    pub command_timeout: Duration,
    pub output_limit: usize,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
}

impl ToolContext {
    pub fn from_config(
        project_dir: impl Into<PathBuf>,
        processes: Arc<ProcessManager>,
        operator: Arc<dyn Operator>,
        config: &AgentConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("build http probe client")?;
        Ok(Self {
            project_dir: project_dir.into(),
            processes,
            operator,
            http,
            command_timeout: config.tool_timeout(),
            output_limit: config.command_output_limit_bytes,
            readiness_timeout: config.readiness_timeout(),
            readiness_interval: config.readiness_interval(),
        })
    }

    /// Resolve `raw` inside the project directory, rejecting escapes through
    /// `..` or through symlinks.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let resolved = resolve_within(&self.project_dir, raw)?;
        confine_links(&self.project_dir, &resolved, raw)?;
        Ok(resolved)
    }
}

/// The deepest existing ancestor of `resolved`, with links followed, must
/// still sit under the real project root. A dangling link fails to resolve.
fn confine_links(root: &Path, resolved: &Path, raw: &str) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("resolve project directory {}", root.display()))?;
    let existing = resolved
        .ancestors()
        .find(|path| path.symlink_metadata().is_ok())
        .unwrap_or(resolved);
    let real = existing
        .canonicalize()
        .with_context(|| format!("resolve path {raw}"))?;
    if !real.starts_with(&root) {
        bail!("path {raw} resolves outside the project directory");
    }
    Ok(())
}

fn resolve_within(root: &Path, raw: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw);
    let relative = if candidate.is_absolute() {
        candidate
            .strip_prefix(root)
            .map_err(|_| anyhow!("path {raw} is outside the project directory"))?
    } else {
        candidate
    };
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    bail!("path {raw} escapes the project directory");
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("path {raw} is outside the project directory");
            }
        }
    }
    Ok(resolved)
}

fn bind<F, Fut>(ctx: &Arc<ToolContext>, f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Arc<ToolContext>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    handler_fn(move |input| f(Arc::clone(&ctx), input))
}

fn decode<T: for<'de> Deserialize<'de>>(tool: &str, input: Value) -> Result<T> {
    serde_json::from_value(input).with_context(|| format!("decode {tool} input"))
}

/// Registry holding every built-in tool.
pub fn builtin_registry(ctx: Arc<ToolContext>) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    let command_timeout = ctx.command_timeout + TIMEOUT_SLACK;

    registry.register(ToolSpec::new(
        "read_file",
        "Read a text file inside the project directory.",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "minLength": 1}
            },
            "required": ["path"],
            "additionalProperties": false
        }),
        bind(&ctx, read_file),
    ))?;
    registry.register(
        ToolSpec::new(
            "write_file",
            "Create or overwrite a file inside the project directory.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "minLength": 1},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"],
                "additionalProperties": false
            }),
            bind(&ctx, write_file),
        )
        .confirm(),
    )?;
    registry.register(ToolSpec::new(
        "list_files",
        "List files under a project directory, skipping dependency and VCS folders.",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "max_depth": {"type": "integer", "minimum": 1, "maximum": 10}
            },
            "additionalProperties": false
        }),
        bind(&ctx, list_files),
    ))?;
    registry.register(
        ToolSpec::new(
            "run_command",
            "Run a shell command in the project directory and return its exit code and output.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "minLength": 1}
                },
                "required": ["command"],
                "additionalProperties": false
            }),
            bind(&ctx, run_command),
        )
        .confirm()
        .command_field("command")
        .with_timeout(command_timeout),
    )?;
    registry.register(ToolSpec::new(
        "http_request",
        "Send an HTTP request and return the status and a truncated body.",
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "minLength": 1},
                "method": {"type": "string", "enum": ["GET", "POST", "HEAD"]},
                "body": {"type": "string"},
                "headers": {
                    "type": "object",
                    "additionalProperties": {"type": "string"}
                }
            },
            "required": ["url"],
            "additionalProperties": false
        }),
        bind(&ctx, http_request),
    ))?;
    registry.register(
        ToolSpec::new(
            "start_background",
            "Start a long-running process (such as a dev server) and return its handle.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "minLength": 1},
                    "env": {
                        "type": "object",
                        "additionalProperties": {"type": "string"}
                    }
                },
                "required": ["command"],
                "additionalProperties": false
            }),
            bind(&ctx, start_background),
        )
        .confirm()
        .command_field("command"),
    )?;
    registry.register(ToolSpec::new(
        "stop_background",
        "Stop a background process by handle.",
        handle_schema(),
        bind(&ctx, stop_background),
    ))?;
    registry.register(ToolSpec::new(
        "get_logs",
        "Return the most recent stdout and stderr lines of a background process.",
        json!({
            "type": "object",
            "properties": {
                "handle": {"type": "string", "minLength": 1},
                "lines": {"type": "integer", "minimum": 1, "maximum": 1000}
            },
            "required": ["handle"],
            "additionalProperties": false
        }),
        bind(&ctx, get_logs),
    ))?;
    registry.register(ToolSpec::new(
        "list_background",
        "List background processes and whether they are still running.",
        json!({"type": "object", "additionalProperties": false}),
        bind(&ctx, list_background),
    ))?;
    registry.register(
        ToolSpec::new(
            "wait_for_ready",
            "Poll an HTTP endpoint until it answers 2xx/3xx or the timeout elapses.",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "minLength": 1},
                    "timeout_secs": {"type": "integer", "minimum": 1},
                    "interval_ms": {"type": "integer", "minimum": 50}
                },
                "required": ["url"],
                "additionalProperties": false
            }),
            bind(&ctx, wait_for_ready),
        )
        .with_timeout(MAX_READY_WAIT + TIMEOUT_SLACK),
    )?;
    registry.register(
        ToolSpec::new(
            "ask_user",
            "Ask the operator a question and wait for the answer.",
            json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string", "minLength": 1}
                },
                "required": ["question"],
                "additionalProperties": false
            }),
            bind(&ctx, ask_user),
        )
        .interactive(),
    )?;
    registry.register(ToolSpec::new(
        "abort_setup",
        "Stop the whole setup run when it cannot continue safely.",
        json!({
            "type": "object",
            "properties": {
                "reason": {"type": "string", "minLength": 1}
            },
            "required": ["reason"],
            "additionalProperties": false
        }),
        handler_fn(abort_setup),
    ))?;

    debug!(tools = registry.len(), "built-in tools registered");
    Ok(registry)
}

fn handle_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "handle": {"type": "string", "minLength": 1}
        },
        "required": ["handle"],
        "additionalProperties": false
    })
}

/// Truncate to at most `limit` bytes on a char boundary.
fn truncate_bytes(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n[truncated: {} of {} bytes shown]",
        &text[..cut],
        cut,
        text.len()
    )
}

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

async fn read_file(ctx: Arc<ToolContext>, input: Value) -> Result<String> {
    let args: PathArgs = decode("read_file", input)?;
    let path = ctx.resolve(&args.path)?;
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("read {}", args.path))?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(truncate_bytes(&text, ctx.output_limit))
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

async fn write_file(ctx: Arc<ToolContext>, input: Value) -> Result<String> {
    let args: WriteArgs = decode("write_file", input)?;
    let path = ctx.resolve(&args.path)?;
    let len = args.content.len();
    tokio::task::spawn_blocking(move || write_atomic(&path, &args.content))
        .await
        .context("join file writer")??;
    Ok(format!("wrote {len} bytes to {}", args.path))
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    max_depth: Option<usize>,
}

async fn list_files(ctx: Arc<ToolContext>, input: Value) -> Result<String> {
    let args: ListArgs = decode("list_files", input)?;
    let base = ctx.resolve(args.path.as_deref().unwrap_or("."))?;
    let max_depth = args.max_depth.unwrap_or(3);
    if !base.is_dir() {
        bail!("{} is not a directory", base.display());
    }
    let root = ctx.project_dir.clone();
    tokio::task::spawn_blocking(move || walk(&root, &base, max_depth))
        .await
        .context("join directory walk")?
}

fn walk(root: &Path, base: &Path, max_depth: usize) -> Result<String> {
    let mut entries = Vec::new();
    let mut truncated = false;
    let walker = WalkDir::new(base)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && SKIPPED_DIRS
                    .iter()
                    .any(|skip| entry.file_name() == std::ffi::OsStr::new(skip)))
        });
    for entry in walker {
        let entry = entry.context("walk project directory")?;
        if entries.len() >= LIST_LIMIT {
            truncated = true;
            break;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let mut line = relative.display().to_string();
        if entry.file_type().is_dir() {
            line.push('/');
        }
        entries.push(line);
    }
    if entries.is_empty() {
        return Ok("(empty)".to_string());
    }
    let mut out = entries.join("\n");
    if truncated {
        out.push_str(&format!("\n[listing stopped after {LIST_LIMIT} entries]"));
    }
    Ok(out)
}

#[derive(Deserialize)]
struct CommandArgs {
    command: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

async fn run_command(ctx: Arc<ToolContext>, input: Value) -> Result<String> {
    let args: CommandArgs = decode("run_command", input)?;
    check_command(&args.command)?;
    let shell = ShellCommand::new(args.command, ctx.project_dir.clone()).env(args.env);
    let timeout = ctx.command_timeout;
    let limit = ctx.output_limit;
    let output = tokio::task::spawn_blocking(move || run_command_with_timeout(&shell, timeout, limit))
        .await
        .context("join command runner")??;
    let rendered = output.render();
    if output.exit_code() == Some(0) {
        Ok(rendered)
    } else {
        Err(anyhow!(rendered))
    }
}

#[derive(Deserialize)]
struct HttpArgs {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

async fn http_request(ctx: Arc<ToolContext>, input: Value) -> Result<String> {
    let args: HttpArgs = decode("http_request", input)?;
    let method = args.method.as_deref().unwrap_or("GET");
    let mut request = match method {
        "GET" => ctx.http.get(&args.url),
        "POST" => ctx.http.post(&args.url),
        "HEAD" => ctx.http.head(&args.url),
        other => bail!("unsupported method {other}"),
    };
    for (name, value) in &args.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = args.body {
        request = request.body(body);
    }
    let response = request
        .timeout(ctx.command_timeout)
        .send()
        .await
        .with_context(|| format!("{method} {}", args.url))?;
    let status = response.status();
    let body = response.text().await.context("read response body")?;
    let mut out = format!("HTTP {}", status.as_u16());
    if !body.is_empty() {
        out.push('\n');
        out.push_str(&truncate_bytes(&body, HTTP_BODY_LIMIT));
    }
    Ok(out)
}

async fn start_background(ctx: Arc<ToolContext>, input: Value) -> Result<String> {
    let args: CommandArgs = decode("start_background", input)?;
    let handle = ctx.processes.start(&args.command, &args.env).await?;
    Ok(format!(
        "started {handle}. Use get_logs to inspect output and stop_background when done."
    ))
}

#[derive(Deserialize)]
struct HandleArgs {
    handle: String,
    #[serde(default)]
    lines: Option<usize>,
}

async fn stop_background(ctx: Arc<ToolContext>, input: Value) -> Result<String> {
    let args: HandleArgs = decode("stop_background", input)?;
    let report = ctx.processes.stop(&args.handle).await?;
    let exit = report
        .exit
        .map(|exit| exit.to_string())
        .unwrap_or_else(|| "exit status unknown".to_string());
    let how = if report.forced { "killed" } else { "stopped" };
    Ok(format!("{how} {} ({exit})", report.handle))
}

async fn get_logs(ctx: Arc<ToolContext>, input: Value) -> Result<String> {
    let args: HandleArgs = decode("get_logs", input)?;
    let logs = ctx
        .processes
        .logs(&args.handle, args.lines.unwrap_or(DEFAULT_LOG_LINES))?;
    Ok(truncate_bytes(&logs, ctx.output_limit))
}

async fn list_background(ctx: Arc<ToolContext>, _input: Value) -> Result<String> {
    let summaries = ctx.processes.list();
    if summaries.is_empty() {
        return Ok("no background processes".to_string());
    }
    let lines: Vec<String> = summaries
        .iter()
        .map(|summary| {
            let status = summary
                .exit
                .as_ref()
                .map(|exit| format!("exited, {exit}"))
                .unwrap_or_else(|| format!("running for {}s", summary.uptime.as_secs()));
            format!(
                "{} pid={} [{status}] {}",
                summary.handle, summary.pid, summary.command
            )
        })
        .collect();
    Ok(lines.join("\n"))
}

#[derive(Deserialize)]
struct ReadyArgs {
    url: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    interval_ms: Option<u64>,
}

async fn wait_for_ready(ctx: Arc<ToolContext>, input: Value) -> Result<String> {
    let args: ReadyArgs = decode("wait_for_ready", input)?;
    let timeout = args
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(ctx.readiness_timeout)
        .min(MAX_READY_WAIT);
    let interval = args
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or(ctx.readiness_interval);
    let report = ctx
        .processes
        .wait_for_ready(&args.url, timeout, interval)
        .await?;
    Ok(format!(
        "{} is ready (HTTP {} after {} attempt(s))",
        args.url, report.status, report.attempts
    ))
}

#[derive(Deserialize)]
struct AskArgs {
    question: String,
}

async fn ask_user(ctx: Arc<ToolContext>, input: Value) -> Result<String> {
    let args: AskArgs = decode("ask_user", input)?;
    let answer = ctx.operator.ask(&args.question).await?;
    if answer.trim().is_empty() {
        return Ok("(the user gave no answer)".to_string());
    }
    Ok(answer)
}

#[derive(Deserialize)]
struct AbortArgs {
    reason: String,
}

async fn abort_setup(input: Value) -> Result<String> {
    let args: AbortArgs = decode("abort_setup", input)?;
    Err(AbortError {
        reason: args.reason,
    }
    .into())
}
