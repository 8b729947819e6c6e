//! The human in the loop: confirmation gates and interactive questions.

use std::io::{BufRead, Write};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

/// A consequential tool call awaiting approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub tool: String,
    pub preview: String,
    /// Command prefixes an "always allow" answer would approve.
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmDecision {
    Allow,
    AllowAlways,
    Deny,
}

#[async_trait]
pub trait Operator: Send + Sync {
    async fn confirm(&self, request: &ConfirmRequest) -> Result<ConfirmDecision>;
    async fn ask(&self, question: &str) -> Result<String>;
}

/// Prompts on stderr and reads answers from stdin.
#[derive(Debug, Default)]
pub struct TerminalOperator;

fn read_line(prompt: String) -> Result<String> {
    let mut stderr = std::io::stderr().lock();
    stderr.write_all(prompt.as_bytes()).context("write prompt")?;
    stderr.flush().context("flush prompt")?;
    let mut line = String::new();
    let read = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read operator input")?;
    if read == 0 {
        bail!("stdin closed while waiting for operator input");
    }
    Ok(line.trim().to_string())
}

pub fn parse_decision(answer: &str) -> ConfirmDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ConfirmDecision::Allow,
        "a" | "always" => ConfirmDecision::AllowAlways,
        _ => ConfirmDecision::Deny,
    }
}

#[async_trait]
impl Operator for TerminalOperator {
    async fn confirm(&self, request: &ConfirmRequest) -> Result<ConfirmDecision> {
        let always = if request.prefixes.is_empty() {
            "always for this tool".to_string()
        } else {
            format!("always for {}", request.prefixes.join(", "))
        };
        let prompt = format!(
            "\n{} wants to run:\n  {}\nAllow? [y]es / [a] {} / [N]o: ",
            request.tool, request.preview, always
        );
        let answer = tokio::task::spawn_blocking(move || read_line(prompt))
            .await
            .context("join operator prompt")??;
        Ok(parse_decision(&answer))
    }

    async fn ask(&self, question: &str) -> Result<String> {
        let prompt = format!("\n{question}\n> ");
        tokio::task::spawn_blocking(move || read_line(prompt))
            .await
            .context("join operator prompt")?
    }
}

/// Approves everything; used with `--yes` and non-interactive runs.
#[derive(Debug, Default)]
pub struct AutoApproveOperator;

#[async_trait]
impl Operator for AutoApproveOperator {
    async fn confirm(&self, _request: &ConfirmRequest) -> Result<ConfirmDecision> {
        Ok(ConfirmDecision::Allow)
    }

    async fn ask(&self, question: &str) -> Result<String> {
        bail!("no operator available to answer: {question}; proceed with your best judgement")
    }
}
