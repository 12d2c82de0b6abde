use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mbench_core::{BlobRef, Ledger, Study, StudyError};
use mbench_runner::{
    collect_configs, discover_configs, request_stop, stages, AwsCliBlobStore, BlobStore,
    CancelToken, Connector, ExecuteOptions, FsBlobStore, PipelineRunner, Reconciler,
    RemoteSession, RunOutcome, RunnerConfig, RunnerConfigFile, SshConnector, SyncReport,
    DEFAULT_BUCKET, DEFAULT_RUNNER_CONFIG,
};
use mbench_runner::process::shell_quote;
use mbench_runner::remote::run_checked;
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mbench", version, about = "Micro-benchmark study orchestrator")]
struct Cli {
    /// Directory holding one JSON document per study.
    #[arg(long, global = true, env = "MBENCH_STUDIES_DIR", default_value = "./studies")]
    studies_dir: PathBuf,
    #[arg(long, global = true, value_enum, default_value = "s3")]
    blob_store: BlobStoreArg,
    /// Root directory for `--blob-store local`.
    #[arg(long, global = true, default_value = "./blobs")]
    blob_root: PathBuf,
    #[arg(long, global = true, env = "AWS_PROFILE")]
    profile: Option<String>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BlobStoreArg {
    #[value(name = "s3")]
    S3,
    #[value(name = "local")]
    Local,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage micro-benchmarking studies.
    Study {
        #[command(subcommand)]
        command: StudyCommands,
    },
    /// Drive single pipeline steps on a runner without touching the ledger.
    Runner {
        #[command(subcommand)]
        command: RunnerCommands,
    },
}

#[derive(Subcommand)]
enum StudyCommands {
    Create {
        name: String,
        #[arg(long, default_value = "latest")]
        core_version: String,
        #[arg(long, default_value = "latest")]
        runner_version: String,
        #[arg(long, default_value = "./infrastructure/generated/benchmark_key.pem")]
        key_path: String,
        #[arg(long, default_value = "")]
        notes: String,
    },
    Run {
        name: String,
        #[arg(long = "runner", default_value = DEFAULT_RUNNER_CONFIG)]
        runner_config: PathBuf,
        #[arg(short = 'c', long = "config")]
        config_files: Vec<PathBuf>,
        #[arg(long = "directory")]
        config_dir: Option<PathBuf>,
        #[arg(long = "bucket", alias = "s3-bucket", default_value = DEFAULT_BUCKET)]
        bucket: String,
        #[arg(long)]
        repo_url: Option<String>,
        #[arg(long)]
        repo_branch: Option<String>,
        #[arg(long)]
        skip_init: bool,
        #[arg(long)]
        skip_build: bool,
        /// Per remote command timeout in seconds.
        #[arg(long)]
        command_timeout: Option<u64>,
    },
    Sync {
        name: String,
        #[arg(long)]
        run_index: Option<usize>,
        #[arg(long, default_value = "./results")]
        output_dir: PathBuf,
    },
    List,
    Show {
        name: String,
    },
    /// Ask a running `study run` to stop after its current benchmark.
    Stop {
        name: String,
    },
}

#[derive(Args, Clone)]
struct ConnectionArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    key: Option<PathBuf>,
    /// Read when --host or --key is missing.
    #[arg(long = "runner", default_value = DEFAULT_RUNNER_CONFIG)]
    runner_config: PathBuf,
}

#[derive(Subcommand)]
enum RunnerCommands {
    Init {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[arg(long)]
        repo_url: Option<String>,
        #[arg(long)]
        repo_branch: Option<String>,
    },
    BuildCore {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[arg(long, default_value = "main")]
        repo_branch: String,
    },
    Bench {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[arg(short = 'c', long)]
        config_file: Option<PathBuf>,
        #[arg(short = 'd', long)]
        config_dir: Option<PathBuf>,
    },
    RetrieveResults {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[arg(long, default_value = DEFAULT_BUCKET)]
        s3_bucket: String,
        #[arg(long, default_value = "benchmark-artifacts.zip")]
        s3_key: String,
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = cli.json;
    match run_command(cli) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload["ok"] == json!(false) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<StudyError>()
                    .map(|e| e.code())
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let ledger = Ledger::new(&cli.studies_dir);
    let blobs = open_blob_store(&cli);
    match cli.command {
        Commands::Study { command } => run_study_command(command, &ledger, blobs.as_ref(), cli.json),
        Commands::Runner { command } => run_runner_command(command, blobs.as_ref(), cli.json),
    }
}

fn open_blob_store(cli: &Cli) -> Box<dyn BlobStore> {
    match cli.blob_store {
        BlobStoreArg::S3 => Box::new(AwsCliBlobStore::new(cli.profile.clone())),
        BlobStoreArg::Local => Box::new(FsBlobStore::new(&cli.blob_root)),
    }
}

fn run_study_command(
    command: StudyCommands,
    ledger: &Ledger,
    blobs: &dyn BlobStore,
    json: bool,
) -> Result<Option<Value>> {
    match command {
        StudyCommands::Create {
            name,
            core_version,
            runner_version,
            key_path,
            notes,
        } => {
            let study = Study::new(&name, core_version, runner_version, key_path).with_notes(notes);
            ledger.create(&study)?;
            let path = ledger.study_path(&name);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "study-create",
                    "study": name,
                    "path": path.display().to_string(),
                })));
            }
            println!("Created study '{}' at {}", name, path.display());
        }
        StudyCommands::Run {
            name,
            runner_config,
            config_files,
            config_dir,
            bucket,
            repo_url,
            repo_branch,
            skip_init,
            skip_build,
            command_timeout,
        } => {
            if config_files.is_empty() && config_dir.is_none() {
                return Err(anyhow!("either --config (-c) or --directory must be provided"));
            }
            let runner = RunnerConfigFile::load(&runner_config)?;
            let configs = collect_configs(&config_files, config_dir.as_deref())?;
            if configs.is_empty() {
                return Err(StudyError::InvalidInput("no benchmark configuration files found".into()).into());
            }
            if !json {
                println!("Running {} benchmark(s) for study '{}'", configs.len(), name);
            }
            let options = ExecuteOptions {
                skip_init,
                skip_build,
                repo_url,
                repo_branch,
                cancel: CancelToken::watching(ledger.stop_path(&name)),
            };
            let connector = SshConnector {
                command_timeout: command_timeout.filter(|s| *s > 0).map(Duration::from_secs),
            };
            let outcome = PipelineRunner::new(ledger, connector, blobs, bucket)
                .execute(&name, &runner, &configs, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "study-run",
                    "study": name,
                    "run": outcome_to_json(&outcome),
                })));
            }
            print_outcome(&outcome);
        }
        StudyCommands::Sync {
            name,
            run_index,
            output_dir,
        } => {
            let report = Reconciler::new(ledger, blobs).sync(&name, &output_dir, run_index.into())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "study-sync",
                    "study": name,
                    "sync": sync_report_to_json(&report),
                })));
            }
            print_sync_report(&report);
        }
        StudyCommands::List => {
            let names = ledger.list()?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "study-list", "studies": names})));
            }
            for name in names {
                println!("{}", name);
            }
        }
        StudyCommands::Show { name } => {
            let study = ledger.get(&name)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "study-show",
                    "study": serde_json::to_value(&study)?,
                })));
            }
            println!("study: {}", study.name);
            println!("core_version: {}", study.core_version);
            println!("runner_version: {}", study.runner_version);
            println!("created: {}", study.creation_date);
            println!("key_path: {}", study.shared_key_path);
            if !study.notes.is_empty() {
                println!("notes: {}", study.notes);
            }
            println!("runs: {}", study.runs.len());
            for (i, run) in study.runs.iter().enumerate() {
                println!(
                    "  [{}] {}  {}/{} successful",
                    i,
                    run.started_at,
                    run.success_count(),
                    run.benchmarks.len()
                );
            }
        }
        StudyCommands::Stop { name } => {
            if !ledger.exists(&name)? {
                return Err(StudyError::NotFound(format!("study '{}' not found", name)).into());
            }
            let path = ledger.stop_path(&name);
            request_stop(&path)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "study-stop",
                    "study": name,
                    "stop_file": path.display().to_string(),
                })));
            }
            println!("Stop requested for study '{}'; the current benchmark will finish first", name);
        }
    }
    Ok(None)
}

fn run_runner_command(command: RunnerCommands, blobs: &dyn BlobStore, json: bool) -> Result<Option<Value>> {
    match command {
        RunnerCommands::Init {
            conn,
            repo_url,
            repo_branch,
        } => {
            let runner = resolve_runner(&conn)?;
            let layout = runner
                .layout
                .clone()
                .with_repo(repo_url.as_deref(), repo_branch.as_deref());
            let mut session = SshConnector::default().connect(&runner)?;
            stages::init_harness(&mut session, &layout)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "runner-init",
                    "repo_url": layout.repo_url,
                    "repo_branch": layout.repo_branch,
                })));
            }
            println!("initialized: {} ({})", layout.checkout_path(), layout.repo_branch);
        }
        RunnerCommands::BuildCore { conn, repo_branch } => {
            let runner = resolve_runner(&conn)?;
            let mut session = SshConnector::default().connect(&runner)?;
            stages::build_core(&mut session, &runner.layout, &repo_branch)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "runner-build-core",
                    "core_ref": runner.layout.resolve_core_ref(&repo_branch),
                })));
            }
            println!("built: {} at {}", runner.layout.core_path(), runner.layout.resolve_core_ref(&repo_branch));
        }
        RunnerCommands::Bench {
            conn,
            config_file,
            config_dir,
        } => {
            if config_file.is_none() && config_dir.is_none() {
                return Err(anyhow!("either --config-file or --config-dir must be provided"));
            }
            let runner = resolve_runner(&conn)?;
            let mut paths: Vec<PathBuf> = config_file.into_iter().collect();
            if let Some(dir) = &config_dir {
                paths.extend(discover_configs(dir)?);
            }
            if paths.is_empty() {
                return Err(StudyError::InvalidInput("no benchmark configuration files found".into()).into());
            }
            let mut session = SshConnector::default().connect(&runner)?;
            let mut results = Vec::new();
            for path in &paths {
                // Harness chatter goes to stderr when stdout carries the JSON document.
                let outcome = if json {
                    bench_one(&mut session, &runner, path, &mut std::io::stderr())
                } else {
                    bench_one(&mut session, &runner, path, &mut std::io::stdout())
                };
                if !json {
                    match &outcome {
                        Ok(()) => println!("ok: {}", path.display()),
                        Err(e) => println!("failed: {}: {}", path.display(), e),
                    }
                }
                results.push(json!({
                    "config": path.display().to_string(),
                    "ok": outcome.is_ok(),
                    "error": outcome.err().map(|e| e.to_string()),
                }));
            }
            return bench_report(results, json);
        }
        RunnerCommands::RetrieveResults {
            conn,
            s3_bucket,
            s3_key,
            output_dir,
        } => {
            let runner = resolve_runner(&conn)?;
            let blob = BlobRef::new(s3_bucket, s3_key);
            let mut session = SshConnector::default().connect(&runner)?;
            let local = stages::retrieve_results(&mut session, blobs, &runner.layout, &blob, &output_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "runner-retrieve-results",
                    "blob": blob.uri(),
                    "local": local.display().to_string(),
                })));
            }
            println!("Results uploaded to {} and downloaded to {}", blob, local.display());
        }
    }
    Ok(None)
}

fn bench_one<S: RemoteSession, W: Write>(
    session: &mut S,
    runner: &RunnerConfig,
    path: &Path,
    echo: &mut W,
) -> mbench_core::Result<()> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| StudyError::InvalidInput(format!("invalid config path: {}", path.display())))?;
    let remote = runner.layout.scratch_path(name);
    session.upload(path, &remote)?;
    let output = stages::run_harness(session, &runner.layout, &remote, None);
    // Artifacts stay in place for a later `runner retrieve-results`.
    if let Err(e) = run_checked(session, &format!("rm -f {}", shell_quote(&remote))) {
        tracing::warn!(config = %name, error = %e, "remote cleanup failed");
    }
    let output = output?;
    echo.write_all(output.stdout.as_bytes())?;
    if !output.success() {
        return Err(StudyError::HarnessExit {
            status: output.exit_code,
            detail: output.tail().unwrap_or("no output").to_string(),
        });
    }
    Ok(())
}

/// Fails the command when any config failed. In JSON mode the per-config
/// results travel in the error envelope's `details`.
fn bench_report(results: Vec<Value>, json: bool) -> Result<Option<Value>> {
    let failed = results.iter().filter(|r| r["ok"] == json!(false)).count();
    if failed == 0 {
        if json {
            return Ok(Some(json!({"ok": true, "command": "runner-bench", "results": results})));
        }
        return Ok(None);
    }
    let message = format!("{} of {} benchmark(s) failed", failed, results.len());
    if json {
        let mut envelope = json_error("harness_failed", message, json!({ "results": results }));
        envelope["command"] = json!("runner-bench");
        return Ok(Some(envelope));
    }
    Err(anyhow!(message))
}

/// Flags win; whatever is missing comes from the runner config file.
fn resolve_runner(conn: &ConnectionArgs) -> Result<RunnerConfig> {
    if let (Some(host), Some(key)) = (&conn.host, &conn.key) {
        return Ok(RunnerConfig::new(host.clone(), key.clone())?);
    }
    tracing::info!(
        path = %conn.runner_config.display(),
        "runner host and key were not supplied, reading runner config"
    );
    let mut runner = RunnerConfigFile::load(&conn.runner_config)?.config;
    if let Some(host) = &conn.host {
        runner.host = host.clone();
    }
    if let Some(key) = &conn.key {
        runner.key = key.clone();
    }
    Ok(runner)
}

fn print_outcome(outcome: &RunOutcome) {
    for (name, result) in outcome.run.benchmarks.iter() {
        match &result.error {
            Some(err) => println!("{}: {} ({})", name, result.status.as_str(), err),
            None => println!("{}: {}", name, result.status.as_str()),
        }
    }
    if outcome.cancelled {
        println!("Stopped early: {} benchmark(s) not run", outcome.skipped);
    }
    println!(
        "Study run completed: {}/{} benchmarks successful (run index {})",
        outcome.succeeded, outcome.total, outcome.run_index
    );
}

fn outcome_to_json(outcome: &RunOutcome) -> Value {
    json!({
        "run_index": outcome.run_index,
        "succeeded": outcome.succeeded,
        "total": outcome.total,
        "skipped": outcome.skipped,
        "cancelled": outcome.cancelled,
        "benchmarks": outcome.run.benchmarks.iter().map(|(name, r)| json!({
            "name": name,
            "status": r.status.as_str(),
            "results": r.results_uri,
            "logs": r.logs_uri,
            "error": r.error,
        })).collect::<Vec<_>>(),
    })
}

fn print_sync_report(report: &SyncReport) {
    for run in &report.runs {
        println!("run {}: {}", run.index, run.dir.display());
        for bench in &run.benchmarks {
            for failure in &bench.failures {
                println!(
                    "  failed to download {} for {}: {}",
                    failure.artifact, bench.name, failure.message
                );
            }
        }
    }
    println!(
        "Sync completed: {} artifact(s) downloaded, {} failed. Results available in: {}",
        report.fetched_count(),
        report.failed_count(),
        report.study_dir.display()
    );
}

fn sync_report_to_json(report: &SyncReport) -> Value {
    json!({
        "study_dir": report.study_dir.display().to_string(),
        "fetched": report.fetched_count(),
        "failed": report.failed_count(),
        "runs": report.runs.iter().map(|run| json!({
            "index": run.index,
            "dir": run.dir.display().to_string(),
            "benchmarks": run.benchmarks.iter().map(|b| json!({
                "name": b.name,
                "dir": b.dir.display().to_string(),
                "fetched": b.fetched.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                "failures": b.failures.iter().map(|f| json!({
                    "artifact": f.artifact,
                    "uri": f.uri,
                    "message": f.message,
                })).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
