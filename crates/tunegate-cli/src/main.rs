//! Tunegate CLI
//!
//! The `tunegate` command drives the enhancement validation engine against a
//! local store.
//!
//! ## Commands
//!
//! - `register`: Create an agent's first configuration
//! - `show`: Print an agent's committed configuration (and history)
//! - `propose`: Run one enhancement proposal to completion
//! - `demo`: Let the history-guided proposer tune a synthetic agent
//! - `records`, `approvals`, `stats`: Inspect lifecycle records
//! - `decide`, `cancel`: Resolve proposals awaiting a decision
//! - `recover`: Resume proposals interrupted by a crash
//! - `config`: Print the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};

use tunegate_core::metrics::METRICS;
use tunegate_core::{
    Decision, EngineConfig, EngineDeps, EnhancementRequest, ExecutorSampler, FleetCoordinator,
    HistoryGuidedProposer, LifecycleRecord, MemoryApprovalChannel, ParameterDelta, Parameters,
    ProcessExecutor, ProposalState, ProposalSummary, Sampler, StorageBackend, StorageConfig,
    SyntheticSampler,
};
use tunegate_state::fakes::MemoryKvStore;
use tunegate_state::{FsKvStore, KvStore, SurrealConfig, SurrealKvStore};

const DEMO_AGENT: &str = "demo-agent";

#[derive(Parser)]
#[command(name = "tunegate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Validate agent parameter changes before committing them", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "TUNEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory of the filesystem store (overrides `storage.path`)
    #[arg(long, global = true, env = "TUNEGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an agent with its initial parameters
    Register {
        agent: String,

        /// Parameter assignment, e.g. `--param temperature=0.7` (repeatable)
        #[arg(long = "param", value_parser = parse_assignment, required = true)]
        params: Vec<(String, f64)>,
    },

    /// Show the committed configuration of an agent
    Show {
        agent: String,

        /// Also list every previous version
        #[arg(long)]
        history: bool,
    },

    /// Propose a change and run it through baseline, evaluation and the gate
    Propose {
        agent: String,

        /// Additive change, e.g. `--delta temperature=-0.1` (repeatable).
        /// Without any, the history-guided proposer picks one.
        #[arg(long = "delta", value_parser = parse_assignment)]
        delta: Vec<(String, f64)>,

        /// Why this change is proposed
        #[arg(long, default_value = "")]
        reason: String,

        #[command(flatten)]
        sampler: SamplerArgs,
    },

    /// Tune a synthetic agent for a few rounds with the proposer
    Demo {
        /// Number of proposals to run
        #[arg(short, long, default_value = "5")]
        rounds: usize,

        #[command(flatten)]
        sampler: SamplerArgs,
    },

    /// List lifecycle records
    Records {
        /// Only records of this agent
        #[arg(long)]
        agent: Option<String>,

        /// Print one record in full (JSON)
        #[arg(long)]
        id: Option<String>,
    },

    /// List proposals awaiting a human decision
    Approvals,

    /// Approve or reject a pending approval request
    Decide {
        request_id: String,

        /// `approve` or `reject`
        #[arg(value_parser = parse_decision)]
        decision: Decision,
    },

    /// Cancel a proposal that has not committed
    Cancel { proposal_id: String },

    /// Resume proposals left unfinished by a previous run
    Recover,

    /// Show outcome counts across all proposals
    Stats,

    /// Print the effective configuration as TOML
    Config,
}

/// How trials are produced for `propose` and `demo`.
#[derive(Args, Clone, Default)]
struct SamplerArgs {
    /// External trial command (stdin: trial JSON, stdout: outcome JSON).
    /// Without it a synthetic response surface is used.
    #[arg(long)]
    command: Option<String>,

    /// Optimum of the synthetic surface, e.g. `--optimum temperature=1.5`
    #[arg(long = "optimum", value_parser = parse_assignment)]
    optimum: Vec<(String, f64)>,

    /// Metric at the synthetic optimum
    #[arg(long, default_value = "100.0")]
    peak: f64,

    /// Steepness of the synthetic surface
    #[arg(long, default_value = "100.0")]
    curvature: f64,

    /// Standard deviation of the synthetic noise
    #[arg(long, default_value = "1.0")]
    noise: f64,
}

/// Where the demo agent's synthetic surface peaks unless `--optimum` is given.
fn demo_optimum() -> Vec<(String, f64)> {
    vec![("temperature".to_string(), 1.5), ("top_p".to_string(), 0.8)]
}

fn parse_assignment(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {s:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing parameter name in {s:?}"));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid number in {s:?}: {e}"))?;
    if !value.is_finite() {
        return Err(format!("value in {s:?} must be finite"));
    }
    Ok((name.to_string(), value))
}

fn parse_decision(s: &str) -> Result<Decision, String> {
    s.parse().map_err(|e: tunegate_core::EngineError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tunegate_core::telemetry::init_tracing(cli.json, level);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.path = dir;
    }

    let result = match cli.command {
        Commands::Config => cmd_config(&config),
        command => {
            let sampler: Arc<dyn Sampler> = match &command {
                Commands::Propose { sampler, .. } => build_sampler(sampler, &config)?,
                Commands::Demo { sampler, .. } if sampler.optimum.is_empty() => {
                    let sampler = SamplerArgs {
                        optimum: demo_optimum(),
                        ..sampler.clone()
                    };
                    build_sampler(&sampler, &config)?
                }
                Commands::Demo { sampler, .. } => build_sampler(sampler, &config)?,
                _ => Arc::new(SyntheticSampler::new(Parameters::new(), 100.0)),
            };
            let kv = open_store(&config.storage).await?;
            let fleet = open_fleet(config, kv, sampler)?;
            dispatch(&fleet, command).await
        }
    };

    METRICS.flush();
    result
}

async fn dispatch(fleet: &FleetCoordinator, command: Commands) -> Result<()> {
    match command {
        Commands::Register { agent, params } => cmd_register(fleet, &agent, params).await,
        Commands::Show { agent, history } => cmd_show(fleet, &agent, history).await,
        Commands::Propose {
            agent,
            delta,
            reason,
            ..
        } => cmd_propose(fleet, &agent, delta, &reason).await,
        Commands::Demo { rounds, .. } => cmd_demo(fleet, rounds).await,
        Commands::Records { agent, id } => cmd_records(fleet, agent.as_deref(), id.as_deref()).await,
        Commands::Approvals => cmd_approvals(fleet).await,
        Commands::Decide {
            request_id,
            decision,
        } => cmd_decide(fleet, &request_id, decision).await,
        Commands::Cancel { proposal_id } => cmd_cancel(fleet, &proposal_id).await,
        Commands::Recover => cmd_recover(fleet).await,
        Commands::Stats => cmd_stats(fleet).await,
        Commands::Config => cmd_config(fleet.config()),
    }
}

// ========== Setup ==========

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn open_store(storage: &StorageConfig) -> Result<Arc<dyn KvStore>> {
    let kv: Arc<dyn KvStore> = match storage.backend {
        StorageBackend::Fs => Arc::new(
            FsKvStore::new(&storage.path)
                .with_context(|| format!("Failed to open store at {}", storage.path.display()))?,
        ),
        StorageBackend::Memory => Arc::new(MemoryKvStore::new()),
        StorageBackend::Surreal => Arc::new(
            SurrealKvStore::connect(SurrealConfig::new(&storage.url))
                .await
                .with_context(|| format!("Failed to connect to {}", storage.url))?,
        ),
    };
    Ok(kv)
}

fn build_sampler(args: &SamplerArgs, config: &EngineConfig) -> Result<Arc<dyn Sampler>> {
    if let Some(command) = &args.command {
        let words: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        let executor = ProcessExecutor::from_command(&words).context("Invalid trial command")?;
        let mut sampler = ExecutorSampler::new(executor, config.sampler.max_parallel_trials);
        if let Some(timeout) = config.sampler.trial_timeout() {
            sampler = sampler.with_trial_timeout(timeout);
        }
        return Ok(Arc::new(sampler));
    }
    let optimum: Parameters = args.optimum.iter().cloned().collect();
    Ok(Arc::new(
        SyntheticSampler::new(optimum, args.peak)
            .with_curvature(args.curvature)
            .with_noise(args.noise),
    ))
}

fn open_fleet(
    config: EngineConfig,
    kv: Arc<dyn KvStore>,
    sampler: Arc<dyn Sampler>,
) -> Result<FleetCoordinator> {
    let proposer = HistoryGuidedProposer::new(config.proposer.initial_step_pct);
    let deps = EngineDeps::new(kv, sampler)
        .with_approval(Arc::new(MemoryApprovalChannel::new()))
        .with_proposer(Arc::new(proposer));
    FleetCoordinator::new(config, deps).context("Failed to start fleet")
}

/// Resume anything a previous run left unfinished and wait for it, so new
/// proposals see the locks and versions it leaves behind.
async fn settle_previous_run(fleet: &FleetCoordinator) -> Result<()> {
    let report = fleet.recover().await.context("Recovery failed")?;
    if report.is_empty() {
        return Ok(());
    }
    info!(
        resumed = report.resumed.len(),
        awaiting = report.awaiting.len(),
        "resuming unfinished proposals"
    );
    for proposal_id in &report.resumed {
        let record = fleet.wait(proposal_id).await?;
        print_outcome(&record);
    }
    Ok(())
}

// ========== Agent Commands ==========

/// Register an agent
async fn cmd_register(fleet: &FleetCoordinator, agent: &str, params: Vec<(String, f64)>) -> Result<()> {
    ensure_unique(&params)?;
    let parameters: Parameters = params.into_iter().collect();
    let config = fleet
        .register_agent(agent, parameters)
        .await
        .with_context(|| format!("Failed to register agent '{}'", agent))?;
    println!(
        "Agent '{}' at version {} ({})",
        config.agent_id,
        config.version,
        render_parameters(&config.parameters)
    );
    Ok(())
}

/// Show an agent's configuration
async fn cmd_show(fleet: &FleetCoordinator, agent: &str, history: bool) -> Result<()> {
    let configs = if history {
        fleet.history(agent).await?
    } else {
        vec![fleet.configuration(agent).await?]
    };
    for config in configs {
        println!(
            "v{:<4} {}  {}",
            config.version,
            config.committed_at.format("%Y-%m-%d %H:%M:%S UTC"),
            render_parameters(&config.parameters)
        );
    }
    Ok(())
}

// ========== Proposal Commands ==========

/// Run one proposal to completion (or to a pending approval)
async fn cmd_propose(
    fleet: &FleetCoordinator,
    agent: &str,
    delta: Vec<(String, f64)>,
    reason: &str,
) -> Result<()> {
    ensure_unique(&delta)?;
    settle_previous_run(fleet).await?;

    let mut request = EnhancementRequest::new(agent).with_reason(reason);
    if !delta.is_empty() {
        let delta = delta
            .into_iter()
            .fold(ParameterDelta::new(), |d, (name, amount)| d.with(name, amount));
        request = request.with_delta(delta);
    }
    let record = fleet
        .run(request)
        .await
        .context("Failed to record the proposal")?;
    print_outcome(&record);
    Ok(())
}

/// Tune the demo agent with proposer-generated deltas
async fn cmd_demo(fleet: &FleetCoordinator, rounds: usize) -> Result<()> {
    settle_previous_run(fleet).await?;

    let initial: Parameters = [("temperature".to_string(), 1.0), ("top_p".to_string(), 0.5)]
        .into_iter()
        .collect();
    let start = fleet.register_agent(DEMO_AGENT, initial).await?;
    println!(
        "Tuning '{}' from v{} ({})",
        DEMO_AGENT,
        start.version,
        render_parameters(&start.parameters)
    );

    for round in 1..=rounds {
        let record = fleet
            .run(EnhancementRequest::new(DEMO_AGENT).with_reason(format!("demo round {round}")))
            .await?;
        print!("[{round}/{rounds}] ");
        print_outcome(&record);
        if record.state() == ProposalState::AwaitingApproval {
            println!("Stopping: decide the pending request first.");
            break;
        }
    }

    let end = fleet.configuration(DEMO_AGENT).await?;
    println!(
        "Finished at v{} ({})",
        end.version,
        render_parameters(&end.parameters)
    );
    Ok(())
}

/// List records, or print one in full
async fn cmd_records(fleet: &FleetCoordinator, agent: Option<&str>, id: Option<&str>) -> Result<()> {
    if let Some(id) = id {
        let record = fleet.record(id).await?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let records = match agent {
        Some(agent) => fleet.records_for_agent(agent).await?,
        None => fleet.orchestrator().records().list().await?,
    };
    if records.is_empty() {
        println!("No proposals recorded.");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {:<12} {:<18} {}",
            record.proposal.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.agent_id(),
            record.state().as_str(),
            record.proposal_id()
        );
    }
    Ok(())
}

// ========== Approval Commands ==========

/// List pending approvals with their summaries
async fn cmd_approvals(fleet: &FleetCoordinator) -> Result<()> {
    let pending = fleet.pending_approvals().await?;
    if pending.is_empty() {
        println!("No proposals awaiting approval.");
        return Ok(());
    }
    for record in pending {
        let request_id = record.approval_request_id.as_deref().unwrap_or("(not submitted)");
        let summary = record
            .impact_score
            .and_then(|impact| ProposalSummary::from_record(&record, impact, Utc::now()));
        match summary {
            Some(summary) => println!("{}  {}", request_id, summary.explanation),
            None => println!("{}  {}", request_id, record.proposal_id()),
        }
    }
    Ok(())
}

/// Apply a decision
async fn cmd_decide(fleet: &FleetCoordinator, request_id: &str, decision: Decision) -> Result<()> {
    let record = fleet
        .on_decision(request_id, decision)
        .await
        .with_context(|| format!("Failed to apply decision to '{}'", request_id))?;
    print_outcome(&record);
    Ok(())
}

/// Cancel a proposal
async fn cmd_cancel(fleet: &FleetCoordinator, proposal_id: &str) -> Result<()> {
    let record = fleet
        .cancel(proposal_id)
        .await
        .with_context(|| format!("Failed to cancel '{}'", proposal_id))?;
    print_outcome(&record);
    Ok(())
}

// ========== Maintenance Commands ==========

async fn cmd_recover(fleet: &FleetCoordinator) -> Result<()> {
    let report = fleet.recover().await.context("Recovery failed")?;
    if report.is_empty() {
        println!("Nothing to recover.");
        return Ok(());
    }
    for proposal_id in &report.resumed {
        let record = fleet.wait(proposal_id).await?;
        print_outcome(&record);
    }
    for proposal_id in report.awaiting.iter().chain(&report.resubmitted) {
        println!("{} is awaiting approval", proposal_id);
    }
    for proposal_id in &report.resolved {
        let record = fleet.record(proposal_id).await?;
        print_outcome(&record);
    }
    Ok(())
}

async fn cmd_stats(fleet: &FleetCoordinator) -> Result<()> {
    let stats = fleet.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!(
        "commit rate {:.1}%, rejection rate {:.1}%, mean improvement {:+.2}%",
        stats.commit_rate() * 100.0,
        stats.rejection_rate() * 100.0,
        stats.average_improvement() * 100.0
    );
    Ok(())
}

fn cmd_config(config: &EngineConfig) -> Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}

// ========== Output ==========

fn render_parameters(parameters: &Parameters) -> String {
    parameters
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_outcome(record: &LifecycleRecord) {
    let measured = record
        .comparison
        .as_ref()
        .map(|c| {
            format!(
                " mean {:+.2}% p={:.4} d={:.2}",
                c.improvement_pct * 100.0,
                c.p_value,
                c.effect_size
            )
        })
        .unwrap_or_default();

    match record.state() {
        ProposalState::Committed => println!(
            "{} committed as v{}{}",
            record.proposal_id(),
            record.committed_version.unwrap_or_default(),
            measured
        ),
        ProposalState::AwaitingApproval => {
            let request_id = record.approval_request_id.as_deref().unwrap_or("(not submitted)");
            println!(
                "{} awaiting approval{}; run `tunegate decide {} approve|reject`",
                record.proposal_id(),
                measured,
                request_id
            );
        }
        state => {
            let reason = record.terminal_reason.map(|r| r.as_str()).unwrap_or("-");
            let detail = record
                .detail
                .as_deref()
                .map(|d| format!(": {d}"))
                .unwrap_or_default();
            println!(
                "{} {} ({}){}{}",
                record.proposal_id(),
                state,
                reason,
                measured,
                detail
            );
        }
    }
}

/// Reject an assignment list that names a parameter twice.
fn ensure_unique(assignments: &[(String, f64)]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for (name, _) in assignments {
        if !seen.insert(name.as_str()) {
            bail!("parameter '{}' given more than once", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_fleet(sampler: Arc<dyn Sampler>) -> FleetCoordinator {
        let mut config = EngineConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config.commit.retry_backoff_ms = 1;
        open_fleet(config, Arc::new(MemoryKvStore::new()), sampler).unwrap()
    }

    fn surface() -> Arc<dyn Sampler> {
        let args = SamplerArgs {
            optimum: demo_optimum(),
            peak: 100.0,
            curvature: 100.0,
            noise: 1.0,
            command: None,
        };
        build_sampler(&args, &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("temperature=-0.25").unwrap(),
            ("temperature".to_string(), -0.25)
        );
        assert_eq!(parse_assignment(" top_k = 40 ").unwrap(), ("top_k".to_string(), 40.0));
        assert!(parse_assignment("temperature").is_err());
        assert!(parse_assignment("=1").is_err());
        assert!(parse_assignment("x=abc").is_err());
        assert!(parse_assignment("x=inf").is_err());
    }

    #[test]
    fn test_parse_decision() {
        assert_eq!(parse_decision("approve").unwrap(), Decision::Approved);
        assert_eq!(parse_decision("REJECT").unwrap(), Decision::Rejected);
        assert!(parse_decision("maybe").is_err());
    }

    #[test]
    fn test_cli_parses_propose() {
        let cli = Cli::try_parse_from([
            "tunegate",
            "--data-dir",
            "/tmp/tg",
            "propose",
            "scout",
            "--delta",
            "temperature=0.1",
            "--optimum",
            "temperature=1.5",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/tg")));
        match cli.command {
            Commands::Propose { agent, delta, sampler, .. } => {
                assert_eq!(agent, "scout");
                assert_eq!(delta, vec![("temperature".to_string(), 0.1)]);
                assert_eq!(sampler.optimum.len(), 1);
                assert!(sampler.command.is_none());
            }
            _ => panic!("expected propose"),
        }
    }

    #[test]
    fn test_ensure_unique() {
        let dup = vec![("a".to_string(), 1.0), ("a".to_string(), 2.0)];
        assert!(ensure_unique(&dup).is_err());
        assert!(ensure_unique(&dup[..1]).is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunegate.toml");
        std::fs::write(&path, "[fleet]\nmax_concurrent = 3\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.fleet.max_concurrent, 3);

        std::fs::write(&path, "[gate]\nalpha = 2.0\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[tokio::test]
    async fn test_register_and_propose_commits() {
        let fleet = memory_fleet(surface());
        cmd_register(&fleet, "scout", vec![("temperature".to_string(), 1.0)])
            .await
            .unwrap();
        cmd_propose(&fleet, "scout", vec![("temperature".to_string(), 0.1)], "warmer")
            .await
            .unwrap();

        let current = fleet.configuration("scout").await.unwrap();
        assert_eq!(current.version, 2);
        assert!((current.parameters["temperature"] - 1.1).abs() < 1e-12);
        cmd_show(&fleet, "scout", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_decide_approves_pending_proposal() {
        let fleet = memory_fleet(surface());
        cmd_register(&fleet, "scout", vec![("temperature".to_string(), 1.0)])
            .await
            .unwrap();
        cmd_propose(&fleet, "scout", vec![("temperature".to_string(), 0.6)], "")
            .await
            .unwrap();

        let pending = fleet.pending_approvals().await.unwrap();
        assert_eq!(pending.len(), 1);
        cmd_approvals(&fleet).await.unwrap();

        let request_id = pending[0].approval_request_id.clone().unwrap();
        cmd_decide(&fleet, &request_id, Decision::Approved).await.unwrap();
        assert_eq!(fleet.configuration("scout").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_demo_runs_requested_rounds() {
        let fleet = memory_fleet(surface());
        cmd_demo(&fleet, 3).await.unwrap();

        let records = fleet.records_for_agent(DEMO_AGENT).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.is_terminal()));
        cmd_records(&fleet, Some(DEMO_AGENT), None).await.unwrap();
        cmd_stats(&fleet).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_unknown_proposal_fails() {
        let fleet = memory_fleet(surface());
        assert!(cmd_cancel(&fleet, "prop-missing").await.is_err());
        cmd_recover(&fleet).await.unwrap();
    }
}
