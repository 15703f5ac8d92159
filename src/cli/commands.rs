//! CLI command definitions for harbor.
//!
//! Every command resolves a [`HarnessConfig`] the same way: defaults, then
//! `--config`, then `HARBOR_*` environment variables, then global flags.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::bundle::loader::TASK_FILE;
use crate::bundle::{list_bundles, load_bundle, TaskBundle};
use crate::harness::{
    summarize, AgentSource, Harness, HarnessConfig, HarnessSummary, RunMode, RunReport,
};
use crate::metrics::{export_metrics, init_metrics};
use crate::sandbox::{tree_digest, Isolation};

/// Sandboxed task verification harness.
#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "Run, verify and self-check sandboxed task bundles")]
#[command(version)]
#[command(
    long_about = "harbor loads task bundles, applies a reference solution or an agent's edits \
inside an isolated sandbox, and writes a binary reward to logs/verifier/reward.txt.\n\n\
Example usage:\n  harbor validate ./tasks --parallel 8\n  harbor run ./tasks/fix-port --mode agent --agent-cmd ./my-agent"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(short, long, global = true, env = "HARBOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Parent directory for per-run sandboxes.
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    /// Isolation backend (local, docker).
    #[arg(long, global = true)]
    pub isolation: Option<Isolation>,

    /// Maximum number of concurrent runs.
    #[arg(short, long, global = true)]
    pub parallel: Option<usize>,

    /// Keep run directories after teardown.
    #[arg(long, global = true)]
    pub keep_runs: bool,

    /// Write Prometheus metrics to this file when the command finishes.
    #[arg(long, global = true)]
    pub metrics_out: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// List bundle identifiers under a root directory.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Structurally validate one bundle or every bundle under a root.
    Check(CheckArgs),

    /// Execute a bundle (or every bundle under a root) in one mode.
    Run(RunArgs),

    /// Self-check bundles: the reference solution must pass and the
    /// unmodified tree must fail.
    Validate(ValidateArgs),

    /// Print the base-tree digest of a directory.
    Digest(DigestArgs),
}

/// Arguments for `harbor list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Directory containing task bundles.
    pub root: PathBuf,
}

/// Arguments for `harbor check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// A bundle directory or a root containing bundles.
    pub path: PathBuf,
}

/// Arguments for `harbor run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// A bundle directory or a root containing bundles.
    pub path: PathBuf,

    /// What to apply before verification (oracle, noop, agent).
    #[arg(short, long, default_value = "oracle")]
    pub mode: RunMode,

    /// Shell command that starts an agent speaking JSON lines (agent mode).
    #[arg(long, env = "HARBOR_AGENT_CMD", conflicts_with = "agent_script")]
    pub agent_cmd: Option<String>,

    /// YAML/JSON file with a fixed list of agent actions (agent mode).
    #[arg(long)]
    pub agent_script: Option<PathBuf>,

    /// Print reports as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `harbor validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// A bundle directory or a root containing bundles.
    pub path: PathBuf,

    /// Print results as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `harbor digest`.
#[derive(Parser, Debug)]
pub struct DigestArgs {
    /// Directory to digest, usually a bundle's `environment/`.
    pub dir: PathBuf,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;

    if config.metrics_out.is_some() {
        init_metrics()?;
    }

    let result = match cli.command {
        Commands::List(args) => run_list_command(args),
        Commands::Check(args) => run_check_command(args),
        Commands::Run(args) => run_run_command(args, config.clone()).await,
        Commands::Validate(args) => run_validate_command(args, config.clone()).await,
        Commands::Digest(args) => run_digest_command(args),
    };

    if let Some(path) = &config.metrics_out {
        if let Err(e) = std::fs::write(path, export_metrics()) {
            warn!("Failed to write metrics to {}: {}", path.display(), e);
        }
    }

    result
}

fn build_config(cli: &Cli) -> anyhow::Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::from_file(path)?,
        None => HarnessConfig::default(),
    }
    .with_env_overrides()?;

    if let Some(work_dir) = &cli.work_dir {
        config = config.with_work_dir(work_dir);
    }
    if let Some(isolation) = cli.isolation {
        config = config.with_isolation(isolation);
    }
    if let Some(parallel) = cli.parallel {
        config = config.with_parallelism(parallel);
    }
    if cli.keep_runs {
        config = config.with_keep_runs(true);
    }
    if let Some(path) = &cli.metrics_out {
        config.metrics_out = Some(path.clone());
    }

    config.validate()?;
    Ok(config)
}

fn is_bundle_dir(path: &Path) -> bool {
    path.join(TASK_FILE).is_file()
}

/// Loads one bundle or every bundle under a root.
///
/// Returns the loaded bundles and the `(id, error)` pairs of the ones that
/// failed structural validation.
fn load_all(path: &Path) -> anyhow::Result<(Vec<Arc<TaskBundle>>, Vec<(String, String)>)> {
    if is_bundle_dir(path) {
        let bundle = load_bundle(path)?;
        return Ok((vec![Arc::new(bundle)], Vec::new()));
    }

    let mut bundles = Vec::new();
    let mut malformed = Vec::new();
    for entry in &list_bundles(path)? {
        let entry = entry?;
        match load_bundle(&entry.path) {
            Ok(bundle) => bundles.push(Arc::new(bundle)),
            Err(e) => malformed.push((entry.id, e.to_string())),
        }
    }
    Ok((bundles, malformed))
}

// ============================================================================
// Command Implementations
// ============================================================================

fn run_list_command(args: ListArgs) -> anyhow::Result<()> {
    for entry in &list_bundles(&args.root)? {
        println!("{}", entry?.id);
    }
    Ok(())
}

fn run_check_command(args: CheckArgs) -> anyhow::Result<()> {
    let (bundles, malformed) = load_all(&args.path)?;

    for bundle in &bundles {
        println!("  ok      {}", bundle.id);
    }
    for (id, error) in &malformed {
        println!("  FAILED  {}: {}", id, error);
    }
    println!(
        "\n{} bundles checked, {} malformed",
        bundles.len() + malformed.len(),
        malformed.len()
    );

    if !malformed.is_empty() {
        anyhow::bail!("{} malformed bundle(s)", malformed.len());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    summary: HarnessSummary,
    reports: Vec<&'a RunReport>,
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorEntry {
    task_id: String,
    error: String,
}

async fn run_run_command(args: RunArgs, config: HarnessConfig) -> anyhow::Result<()> {
    let agent = match (args.agent_cmd, args.agent_script) {
        (Some(command), _) => Some(AgentSource::Command(command)),
        (None, Some(path)) => Some(AgentSource::ReplayFile(path)),
        (None, None) => None,
    };
    if args.mode == RunMode::Agent && agent.is_none() {
        anyhow::bail!("agent mode requires --agent-cmd or --agent-script");
    }

    let (bundles, malformed) = load_all(&args.path)?;
    for (id, error) in &malformed {
        warn!(task_id = %id, "Skipping malformed bundle: {}", error);
    }

    let mut harness = Harness::new(config);
    if let Some(agent) = agent {
        harness = harness.with_agent(agent);
    }

    info!(
        "Running {} bundle(s) in {} mode from {}",
        bundles.len(),
        args.mode,
        args.path.display()
    );
    let results = harness.run_many(&bundles, args.mode).await;
    let summary = summarize(&results);

    let reports: Vec<&RunReport> = results.iter().filter_map(|(_, r)| r.as_ref().ok()).collect();
    let errors: Vec<ErrorEntry> = results
        .iter()
        .filter_map(|(id, r)| {
            r.as_ref().err().map(|e| ErrorEntry {
                task_id: id.clone(),
                error: e.to_string(),
            })
        })
        .collect();

    if args.json {
        let output = RunOutput {
            summary: summary.clone(),
            reports,
            errors,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("\n=== Run Results ({}) ===", args.mode);
        for report in &reports {
            println!(
                "  {} reward={} [{}] checks {}/{} edits={} failures={} {:.1}s",
                report.task_id,
                report.reward,
                report.outcome,
                report.passed_checks,
                report.passed_checks + report.failed_checks,
                report.edits_applied,
                report.edit_failures,
                report.duration_ms as f64 / 1000.0,
            );
            for entry in report.log.failures() {
                println!("    [{}] {}", entry.phase, entry.message);
            }
        }
        for entry in &errors {
            println!("  {} error: {}", entry.task_id, entry.error);
        }
        println!("\n{}", summary);
    }

    if summary.errors > 0 {
        anyhow::bail!("{} run(s) could not be executed", summary.errors);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ValidateEntry {
    task_id: String,
    valid: bool,
    oracle_reward: Option<u8>,
    noop_reward: Option<u8>,
    problem: Option<String>,
}

async fn run_validate_command(args: ValidateArgs, config: HarnessConfig) -> anyhow::Result<()> {
    let (bundles, malformed) = load_all(&args.path)?;
    let harness = Harness::new(config);

    let mut entries: Vec<ValidateEntry> = malformed
        .into_iter()
        .map(|(task_id, error)| ValidateEntry {
            task_id,
            valid: false,
            oracle_reward: None,
            noop_reward: None,
            problem: Some(error),
        })
        .collect();

    for (task_id, result) in harness.self_check_many(&bundles).await {
        let entry = match result {
            Ok(report) => ValidateEntry {
                problem: report.problem(),
                task_id,
                valid: report.valid,
                oracle_reward: Some(report.oracle.reward),
                noop_reward: Some(report.noop.reward),
            },
            Err(e) => ValidateEntry {
                task_id,
                valid: false,
                oracle_reward: None,
                noop_reward: None,
                problem: Some(e.to_string()),
            },
        };
        entries.push(entry);
    }
    entries.sort_by(|a, b| a.task_id.cmp(&b.task_id));

    let invalid = entries.iter().filter(|e| !e.valid).count();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("\n=== Self-check Results ===");
        for entry in &entries {
            let rewards = match (entry.oracle_reward, entry.noop_reward) {
                (Some(oracle), Some(noop)) => format!("oracle={} noop={}", oracle, noop),
                _ => "not run".to_string(),
            };
            println!(
                "  {:<7} {} {}",
                if entry.valid { "ok" } else { "INVALID" },
                entry.task_id,
                rewards
            );
            if let Some(problem) = &entry.problem {
                println!("          {}", problem);
            }
        }
        println!("\n{} bundles, {} invalid", entries.len(), invalid);
    }

    if invalid > 0 {
        anyhow::bail!("{} invalid bundle(s)", invalid);
    }
    Ok(())
}

fn run_digest_command(args: DigestArgs) -> anyhow::Result<()> {
    if !args.dir.is_dir() {
        anyhow::bail!("Directory does not exist: {}", args.dir.display());
    }
    println!("{}", tree_digest(&args.dir)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_globals() {
        let cli = Cli::try_parse_from([
            "harbor",
            "run",
            "./tasks/fix-port",
            "--mode",
            "noop",
            "--isolation",
            "docker",
            "--parallel",
            "2",
            "--keep-runs",
        ])
        .unwrap();

        assert_eq!(cli.isolation, Some(Isolation::Docker));
        assert_eq!(cli.parallel, Some(2));
        assert!(cli.keep_runs);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.mode, RunMode::NoOp);
                assert_eq!(args.path, PathBuf::from("./tasks/fix-port"));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_agent_sources_conflict() {
        let result = Cli::try_parse_from([
            "harbor",
            "run",
            "t",
            "--agent-cmd",
            "agent",
            "--agent-script",
            "actions.yaml",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_build_config_applies_flags() {
        let cli = Cli::try_parse_from([
            "harbor",
            "--work-dir",
            "/tmp/harbor-runs",
            "--parallel",
            "3",
            "digest",
            ".",
        ])
        .unwrap();
        let config = build_config(&cli).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/tmp/harbor-runs"));
        assert_eq!(config.parallelism, 3);

        let cli = Cli::try_parse_from(["harbor", "--parallel", "0", "digest", "."]).unwrap();
        assert!(build_config(&cli).is_err());
    }
}
