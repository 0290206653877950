//! Task executor that runs one external process per trial.
//!
//! Protocol: the command receives a JSON object on stdin
//! (`{"agent_id", "parameters", "scenario": {"index", "seed"}}`) and must print
//! `{"success": bool, "metric": f64}` as the last non-empty line of stdout.
//! A non-zero exit status or unparsable output is a failed trial.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{SamplerError, SamplerResult, TaskExecutor, TrialOutcome};
use crate::domain::{Parameters, Scenario};

#[derive(Serialize)]
struct TrialInput<'a> {
    agent_id: &'a str,
    parameters: &'a Parameters,
    scenario: &'a Scenario,
}

/// Launches `program args...` for every trial.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a full command line already split into words.
    pub fn from_command(command: &[String]) -> SamplerResult<Self> {
        match command.split_first() {
            Some((program, args)) => Ok(Self::new(program.clone(), args.to_vec())),
            None => Err(SamplerError::Fatal("empty trial command".to_string())),
        }
    }
}

fn parse_outcome(stdout: &str) -> SamplerResult<TrialOutcome> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| SamplerError::Trial("trial command printed nothing".to_string()))?;
    serde_json::from_str(line)
        .map_err(|e| SamplerError::Trial(format!("unparsable trial output {line:?}: {e}")))
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    async fn execute(
        &self,
        agent_id: &str,
        parameters: &Parameters,
        scenario: &Scenario,
    ) -> SamplerResult<TrialOutcome> {
        let input = serde_json::to_vec(&TrialInput {
            agent_id,
            parameters,
            scenario,
        })
        .map_err(|e| SamplerError::Fatal(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SamplerError::Fatal(format!("cannot launch {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early; that is not a failure.
            let _ = stdin.write_all(&input).await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SamplerError::Trial(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SamplerError::Trial(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        parse_outcome(&String::from_utf8_lossy(&output.stdout))
    }
}
