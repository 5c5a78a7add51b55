//! HyperShell client: pulls scheduled tasks from a server, runs them as
//! subprocesses, and reports completions and liveness back over the
//! bundle-queue transport.

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use shared::fsm::{HaltFlag, StateMachine};
use shared::template::Template;
use shared::ClientConfig;
use tracing::info;

mod collector;
mod executor;
mod heartbeat;
mod local;
mod queue;
mod scheduler;

use collector::ClientCollector;
use executor::{OutputTarget, TaskExecutor};
use heartbeat::ClientHeartbeat;
use local::LocalQueue;
use queue::{QueueClient, QueueConfig, QueueName};
use scheduler::ClientScheduler;

#[derive(Parser, Debug)]
#[command(name = "hypershell-client")]
#[command(about = "Distributed shell-command execution engine: worker client", long_about = None)]
struct Cli {
    /// Path to `client.toml`.
    config: PathBuf,

    #[arg(short = 'N', long = "num-tasks")]
    num_tasks: Option<usize>,
    #[arg(short = 'H', long)]
    host: Option<String>,
    #[arg(short = 'p', long)]
    port: Option<u16>,
    #[arg(short = 'k', long)]
    auth: Option<String>,
    #[arg(short = 't', long)]
    template: Option<String>,
    #[arg(short = 'b', long)]
    bundlesize: Option<usize>,
    #[arg(short = 'w', long)]
    bundlewait: Option<u64>,
    #[arg(short = 'd', long = "delay-start")]
    delay_start: Option<f64>,
    /// Overall idle timeout in seconds.
    #[arg(short = 'T', long)]
    timeout: Option<u64>,
    #[arg(short = 'W', long = "task-timeout")]
    task_timeout: Option<u64>,
    /// Seconds between SIGINT/SIGTERM/SIGKILL escalation steps.
    #[arg(short = 's', long)]
    signalwait: Option<u64>,
    #[arg(long = "no-confirm")]
    no_confirm: bool,
    /// Redirect every task's stdout here instead of inheriting the client's own.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
    /// Redirect every task's stderr here instead of inheriting the client's own.
    #[arg(short = 'e', long)]
    errors: Option<PathBuf>,
    /// Capture each task's stdout/stderr into `<id>.out`/`<id>.err` alongside
    /// its working directory, instead of a shared `--output`/`--errors` file.
    #[arg(short = 'c', long)]
    capture: bool,
}

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("./logs", "hypershell-client.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("client=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    guard
}

fn load_config(path: &PathBuf) -> Result<ClientConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let cfg: ClientConfig = shared::config::from_toml(&text)?;
    Ok(cfg)
}

fn apply_overrides(mut cfg: ClientConfig, args: &Cli) -> ClientConfig {
    if let Some(n) = args.num_tasks {
        cfg.num_tasks = n;
    }
    if let Some(host) = &args.host {
        cfg.host = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(auth) = &args.auth {
        cfg.auth = auth.clone();
    }
    if let Some(template) = &args.template {
        cfg.template = template.clone();
    }
    if let Some(bundlesize) = args.bundlesize {
        cfg.bundlesize = bundlesize;
    }
    if let Some(bundlewait) = args.bundlewait {
        cfg.bundlewait = bundlewait;
    }
    if let Some(delay) = args.delay_start {
        cfg.delay_start = delay;
    }
    if let Some(timeout) = args.timeout {
        cfg.client_timeout = Some(timeout);
    }
    if let Some(task_timeout) = args.task_timeout {
        cfg.task_timeout = Some(task_timeout);
    }
    if let Some(signalwait) = args.signalwait {
        cfg.signalwait = signalwait;
    }
    if args.no_confirm {
        cfg.confirm = false;
    }
    if args.capture {
        cfg.capture = true;
    }
    // Takes precedence over both the file and `--auth`: passing a secret on
    // the command line is observable via `ps`.
    if let Ok(auth) = std::env::var("HYPERSHELL_CLIENT_AUTH") {
        cfg.auth = auth;
    }
    cfg
}

fn check_args(args: &Cli) -> Result<()> {
    if args.capture && (args.output.is_some() || args.errors.is_some()) {
        anyhow::bail!("--capture cannot be combined with --output/--errors");
    }
    if let Some(timeout) = args.timeout {
        if timeout == 0 {
            anyhow::bail!("--timeout must be positive");
        }
    }
    if let Some(timeout) = args.task_timeout {
        if timeout == 0 {
            anyhow::bail!("--task-timeout must be positive");
        }
    }
    Ok(())
}

/// Waits the fixed or random startup delay the Python original supports:
/// a positive `delay_start` sleeps that many seconds; a negative one sleeps a
/// random duration in `[0, abs(delay_start)]`, so a fleet of clients staggers
/// rather than all dialing the server in the same instant.
async fn wait_start(delay_start: f64) {
    let seconds = if delay_start > 0.0 {
        delay_start
    } else if delay_start < 0.0 {
        rand::rng().random_range(0.0..=delay_start.abs())
    } else {
        return;
    };
    info!(seconds, "delaying client start");
    tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;
}

fn open_output_target(path: &Option<PathBuf>) -> Result<OutputTarget> {
    match path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            Ok(OutputTarget::File(Arc::new(file)))
        }
        None => Ok(OutputTarget::Inherit),
    }
}

async fn run_client(args: Cli) -> Result<()> {
    check_args(&args)?;
    let cfg = apply_overrides(load_config(&args.config)?, &args);
    cfg.validate()?;

    wait_start(cfg.delay_start).await;

    let client_id = uuid::Uuid::new_v4().to_string();
    let client_host = hostname();
    let template = Arc::new(Template::new(cfg.template.clone()));
    let queue_client = QueueClient::new(QueueConfig::new(cfg.host.clone(), cfg.port, cfg.auth.clone()));

    info!(%client_id, host = %cfg.host, port = cfg.port, num_tasks = cfg.num_tasks, "starting hypershell client");

    let scheduled = queue_client.connect_get(QueueName::Scheduled).await
        .context("failed to connect to scheduled queue")?;
    let confirmed = if cfg.confirm {
        Some(queue_client.connect_put(QueueName::Confirmed).await.context("failed to connect to confirmed queue")?)
    } else {
        None
    };
    let completed = queue_client.connect_put(QueueName::Completed).await
        .context("failed to connect to completed queue")?;
    let heartbeat_conn = queue_client.connect_put(QueueName::Heartbeat).await
        .context("failed to connect to heartbeat queue")?;

    // `halt`: the scheduler/collector/heartbeat treat it as "stop between
    // bundles" / "finished"; executors treat it as "stop pulling new tasks".
    // `interrupt`: executors additionally escalate the SIGINT/TERM/KILL
    // ladder against whatever task is currently running. Ctrl-C/SIGTERM trip
    // both (a hard kill means now); SIGUSR1 trips only `halt`, SIGUSR2 trips
    // both, matching the stand-alone client's signal contract.
    let halt = Arc::new(HaltFlag::new());
    let interrupt = Arc::new(HaltFlag::new());
    shared::signal::install(vec![halt.clone(), interrupt.clone()]);
    shared::signal::install_usr_signals(halt.clone(), interrupt.clone());

    let bound = cfg.bundlesize.max(1);
    let inbound = LocalQueue::new(bound);
    let outbound = LocalQueue::new(bound);

    let mut scheduler = ClientScheduler::new(
        scheduled,
        confirmed,
        inbound.sender(),
        cfg.client_timeout,
        client_id.clone(),
        client_host.clone(),
        halt.clone(),
    );
    let scheduler_task = tokio::spawn(async move {
        scheduler.run().await;
    });

    let mut collector = ClientCollector::new(completed, outbound.receiver(), cfg.bundlesize, cfg.bundlewait, halt.clone());
    let collector_task = tokio::spawn(async move {
        collector.run().await;
    });

    let stdout_target = open_output_target(&args.output)?;
    let stderr_target = open_output_target(&args.errors)?;

    let mut executor_tasks = Vec::with_capacity(cfg.num_tasks);
    for _ in 0..cfg.num_tasks {
        let mut executor = TaskExecutor::new(
            inbound.receiver(),
            outbound.sender(),
            template.clone(),
            client_id.clone(),
            client_host.clone(),
            cfg.task_timeout,
            cfg.signalwait,
            cfg.capture,
            cfg.directory.clone(),
            stdout_target.clone(),
            stderr_target.clone(),
            halt.clone(),
            interrupt.clone(),
        );
        executor_tasks.push(tokio::spawn(async move {
            executor.run().await;
        }));
    }

    let mut heart = ClientHeartbeat::new(heartbeat_conn, client_id.clone(), client_host.clone(), cfg.heartrate, halt.clone());
    let heartbeat_task = tokio::spawn(async move {
        heart.run().await;
    });

    scheduler_task.await.context("scheduler task panicked")?;

    let sender = inbound.sender();
    for _ in 0..cfg.num_tasks {
        let _ = sender.send(None, std::time::Duration::from_secs(5)).await;
    }
    for task in executor_tasks {
        task.await.context("executor task panicked")?;
    }

    let _ = outbound.sender().send(None, std::time::Duration::from_secs(5)).await;
    collector_task.await.context("collector task panicked")?;

    halt.trip();
    heartbeat_task.await.context("heartbeat task panicked")?;

    info!("hypershell client stopped");
    Ok(())
}

fn hostname() -> String {
    hostname_inner().unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(unix)]
fn hostname_inner() -> Option<String> {
    std::env::var("HOSTNAME").ok().or_else(|| {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .and_then(|out| String::from_utf8(out.stdout).ok())
            .map(|s| s.trim().to_string())
    })
}

#[cfg(not(unix))]
fn hostname_inner() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logging();
    let args = Cli::parse();

    if let Err(e) = run_client(args).await {
        tracing::error!(error = %e, "client exited with error");
        std::process::exit(1);
    }

    Ok(())
}
