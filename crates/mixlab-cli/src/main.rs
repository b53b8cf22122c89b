use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mixlab_kube::{discover_requester, exec_in_pod, ExecOptions, KubeDriver};
use mixlab_runner::{
    build_workloads, canonical_json_digest, extract_metadata, read_events, DriveSpec, Experiment,
    ExperimentRunner, MetadataSpec, RunDir, RunOptions, RunOutcome, RunStatus,
};

#[derive(Parser)]
#[command(name = "mixlab", version = "0.3.0", about = "Overlay experiment control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy an experiment, drive traffic, record events and tear down.
    Run {
        experiment: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        kube_config: Option<PathBuf>,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print every workload descriptor as multi-document YAML.
    Render {
        experiment: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Recompute run metadata from an existing event log.
    Metadata {
        events: PathBuf,
        #[arg(long)]
        experiment: Option<PathBuf>,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run a command inside a pod and exit with its status.
    Exec {
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        pod: String,
        #[arg(long)]
        container: Option<String>,
        #[arg(long)]
        no_capture: bool,
        #[arg(long, default_value_t = 300)]
        timeout_seconds: u64,
        #[arg(long)]
        kube_config: Option<PathBuf>,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        json: bool,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

struct Finished {
    payload: Option<Value>,
    exit_code: i32,
}

impl Finished {
    fn done() -> Self {
        Self {
            payload: None,
            exit_code: 0,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command).await {
        Ok(finished) => {
            if let Some(payload) = &finished.payload {
                emit_json(payload);
            }
            if finished.exit_code != 0 {
                std::process::exit(finished.exit_code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_command(command: Commands) -> Result<Finished> {
    match command {
        Commands::Run {
            experiment,
            set_values,
            kube_config,
            context,
            output_dir,
            json,
        } => {
            let overrides = parse_set_bindings(&set_values)?;
            let exp = Experiment::load(&experiment, &overrides)?;
            let kube_config = kube_config.or_else(|| exp.spec.kube_config.clone());
            let context = context.or_else(|| exp.spec.context.clone());
            let driver = KubeDriver::connect(kube_config.as_deref(), context)
                .await?
                .with_poll_interval(Duration::from_secs(exp.spec.timing.poll_interval_secs.max(1)));
            info!(experiment = exp.name(), namespace = exp.namespace(), "connected");
            let requester = match &exp.spec.drive {
                DriveSpec::Requester { requester, .. } => {
                    let requester = discover_requester(driver.client().clone(), requester).await?;
                    info!(url = requester.url(), "using api requester");
                    Some(requester)
                }
                DriveSpec::Generator { .. } => None,
            };

            let output_dir = output_dir.unwrap_or_else(|| exp.spec.output_dir.clone());
            let run_dir = RunDir::create(&output_dir, exp.name())?;
            let options = RunOptions {
                command: Some(std::env::args().collect::<Vec<_>>().join(" ")),
                overrides,
            };
            let mut runner = ExperimentRunner::new(&exp, &driver, run_dir, options);
            if let Some(requester) = &requester {
                runner = runner.with_side_channel(requester);
            }
            let interrupt = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "cannot listen for interrupts");
                    std::future::pending::<()>().await;
                }
                info!("interrupt received, tearing down");
            };
            let outcome = runner.run_until(interrupt).await?;
            let exit_code = match outcome.status {
                RunStatus::Completed => 0,
                RunStatus::Failed => 1,
                RunStatus::Interrupted => 130,
            };
            if json {
                return Ok(Finished {
                    payload: Some(json!({
                        "ok": outcome.status == RunStatus::Completed,
                        "command": "run",
                        "experiment": exp.name(),
                        "run": outcome_to_json(&outcome),
                    })),
                    exit_code,
                });
            }
            println!("experiment: {}", exp.name());
            println!("status: {}", outcome.status.as_str());
            println!("run_dir: {}", outcome.run_dir.display());
            if let Some(error) = &outcome.error {
                println!("error: {}", error);
            }
            Ok(Finished {
                payload: None,
                exit_code,
            })
        }
        Commands::Render {
            experiment,
            set_values,
            json,
        } => {
            let overrides = parse_set_bindings(&set_values)?;
            let exp = Experiment::load(&experiment, &overrides)?;
            let workloads = build_workloads(&exp.spec)?;
            let docs = workloads
                .manifests()
                .into_iter()
                .map(|m| m.to_value())
                .collect::<serde_json::Result<Vec<_>>>()?;
            if json {
                return Ok(Finished {
                    payload: Some(json!({
                        "ok": true,
                        "command": "render",
                        "experiment": exp.name(),
                        "digest": canonical_json_digest(&exp.tree)?,
                        "manifests": docs,
                    })),
                    exit_code: 0,
                });
            }
            let mut out = String::new();
            for doc in &docs {
                out.push_str("---\n");
                out.push_str(&serde_yaml::to_string(doc)?);
            }
            print!("{}", out);
            Ok(Finished::done())
        }
        Commands::Metadata {
            events,
            experiment,
            set_values,
            json,
        } => {
            let spec = match experiment {
                Some(path) => {
                    Experiment::load(&path, &parse_set_bindings(&set_values)?)?
                        .spec
                        .metadata
                }
                None => MetadataSpec::default(),
            };
            let log = read_events(&events)?;
            let metadata = extract_metadata(&log, &spec)?;
            if json {
                return Ok(Finished {
                    payload: Some(json!({
                        "ok": true,
                        "command": "metadata",
                        "events": events.display().to_string(),
                        "metadata": metadata,
                    })),
                    exit_code: 0,
                });
            }
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            Ok(Finished::done())
        }
        Commands::Exec {
            namespace,
            pod,
            container,
            no_capture,
            timeout_seconds,
            kube_config,
            context,
            json,
            command,
        } => {
            let driver = KubeDriver::connect(kube_config.as_deref(), context).await?;
            let options = ExecOptions {
                container,
                capture_exit_code: !no_capture,
            };
            let mut channel =
                exec_in_pod(driver.client().clone(), &namespace, &pod, &command, &options).await?;
            let output = channel
                .collect_output(Duration::from_secs(timeout_seconds))
                .await?;
            let exit_code = channel.exit_code()?.unwrap_or(1);
            if json {
                return Ok(Finished {
                    payload: Some(json!({
                        "ok": exit_code == 0,
                        "command": "exec",
                        "pod": pod,
                        "namespace": namespace,
                        "exit_code": exit_code,
                        "stdout": output,
                        "stderr": channel.stderr(),
                    })),
                    exit_code,
                });
            }
            print!("{}", output);
            eprint!("{}", channel.stderr());
            Ok(Finished {
                payload: None,
                exit_code,
            })
        }
    }
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

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Render { json, .. }
        | Commands::Metadata { json, .. }
        | Commands::Exec { json, .. } => *json,
    }
}

fn outcome_to_json(outcome: &RunOutcome) -> Value {
    json!({
        "status": outcome.status.as_str(),
        "run_dir": outcome.run_dir.display().to_string(),
        "metadata": outcome.metadata,
        "error": outcome.error,
    })
}

/// `path=value` bindings in command-line order, so a later `--set` wins.
fn parse_set_bindings(values: &[String]) -> Result<Vec<(String, Value)>> {
    let mut out = Vec::with_capacity(values.len());
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid --set '{}': expected k=v", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "invalid --set '{}': key cannot be empty",
                raw
            ));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.push((key.trim().to_string(), parsed));
    }
    Ok(out)
}
