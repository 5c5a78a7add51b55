//! HyperShell server: task store, scheduler, bundle-queue broker, and the
//! submission CLI used to load new tasks into it.

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use shared::fsm::{HaltFlag, StateMachine};
use shared::model::{TagMap, TagValue};
use shared::template::Template;
use shared::ServerConfig;
use tracing::{info, warn};

mod autoscaler;
mod confirm;
mod heartmonitor;
mod queue;
mod receiver;
mod scheduler;
mod store;
mod submit;

use autoscaler::{AutoScaler, AutoScalerPolicy};
use confirm::Confirm;
use heartmonitor::HeartMonitor;
use queue::QueueServer;
use receiver::Receiver;
use scheduler::Scheduler;
use store::Store;
use submit::{DatabaseCommitter, LiveQueueCommitter, Loader, TaskSink};

#[derive(Parser, Debug)]
#[command(name = "hypershell-server")]
#[command(about = "Distributed shell-command execution engine: server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bundle-queue broker and task scheduler, optionally loading an
    /// initial batch of tasks from a `source` file or stdin.
    Serve(ServeArgs),
    /// Load task argument lines into an already-initialized database, for a
    /// server that is (or will be) running against the same database file.
    Submit(SubmitArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Path to `server.toml`.
    config: PathBuf,

    #[arg(short = 'H', long)]
    bind: Option<String>,
    #[arg(short = 'p', long)]
    port: Option<u16>,
    #[arg(short = 'k', long)]
    auth: Option<String>,
    #[arg(long)]
    database: Option<String>,
    #[arg(long)]
    initdb: bool,
    /// Run without a database; tasks flow straight through the live queue.
    #[arg(long = "no-db")]
    no_db: bool,
    #[arg(long)]
    bundlesize: Option<usize>,
    #[arg(long)]
    bundlewait: Option<u64>,
    #[arg(long = "max-retries")]
    max_retries: Option<i32>,
    #[arg(long)]
    eager: bool,
    #[arg(long)]
    forever: bool,
    #[arg(long)]
    restart: bool,
    #[arg(long = "no-confirm")]
    no_confirm: bool,
    #[arg(long = "evict-after")]
    evict_after: Option<u64>,
    /// Redirect arg-lines of non-zero-exit tasks to this file as they land.
    #[arg(long)]
    failures: Option<PathBuf>,
    /// Task argument-line file to load at startup; `-` reads stdin. In
    /// `--no-db` mode this is the only way tasks reach the scheduler, since
    /// there is no store for a separate `submit` process to write into.
    source: Option<PathBuf>,
    /// `key:value` tag applied to every task loaded from `source`; may repeat.
    #[arg(long = "tag", value_parser = parse_tag_kv)]
    tag: Vec<(String, String)>,

    /// Launch and retire clients automatically against task pressure.
    #[arg(long)]
    autoscale: bool,
    /// `fixed` holds `autoscale-init-size` clients; `dynamic` scales against
    /// task pressure.
    #[arg(long = "autoscale-policy")]
    autoscale_policy: Option<String>,
    #[arg(long = "autoscale-factor")]
    autoscale_factor: Option<f64>,
    #[arg(long = "autoscale-period")]
    autoscale_period: Option<u64>,
    #[arg(long = "autoscale-init-size")]
    autoscale_init_size: Option<usize>,
    #[arg(long = "autoscale-min-size")]
    autoscale_min_size: Option<usize>,
    #[arg(long = "autoscale-max-size")]
    autoscale_max_size: Option<usize>,
    /// Shell command line used to launch one client; split with shell quoting
    /// rules. Required when `--autoscale` is set.
    #[arg(long = "autoscale-launcher")]
    autoscale_launcher: Option<String>,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Path to `server.toml` (for `database`/`bundlesize`).
    config: PathBuf,
    /// Task argument-line file; omit to read from stdin.
    file: Option<PathBuf>,
    /// `key:value` tag applied to every submitted task; may repeat.
    #[arg(long = "tag", value_parser = parse_tag_kv)]
    tag: Vec<(String, String)>,
}

fn parse_tag_kv(s: &str) -> Result<(String, String), String> {
    let (k, v) = s.split_once(':').ok_or_else(|| format!("expected key:value, got '{s}'"))?;
    Ok((k.to_string(), v.to_string()))
}

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("./logs", "hypershell-server.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    guard
}

fn load_config(path: &PathBuf) -> Result<ServerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let cfg: ServerConfig = shared::config::from_toml(&text)?;
    Ok(cfg)
}

fn apply_overrides(mut cfg: ServerConfig, args: &ServeArgs) -> ServerConfig {
    if let Some(bind) = &args.bind {
        cfg.bind = bind.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(auth) = &args.auth {
        cfg.auth = auth.clone();
    }
    if let Some(database) = &args.database {
        cfg.database = Some(database.clone());
    }
    if args.initdb {
        cfg.initdb = true;
    }
    if args.no_db {
        cfg.database = None;
    }
    if let Some(bundlesize) = args.bundlesize {
        cfg.bundlesize = bundlesize;
    }
    if let Some(bundlewait) = args.bundlewait {
        cfg.bundlewait = bundlewait;
    }
    if let Some(max_retries) = args.max_retries {
        cfg.max_retries = max_retries;
    }
    if args.eager {
        cfg.eager = true;
    }
    if args.forever {
        cfg.forever = true;
    }
    if args.restart {
        cfg.restart = true;
    }
    if args.no_confirm {
        cfg.confirm = false;
    }
    if let Some(evict_after) = args.evict_after {
        cfg.evict_after = evict_after;
    }
    if let Some(failures) = &args.failures {
        cfg.failures_path = Some(failures.display().to_string());
    }
    if args.autoscale {
        cfg.autoscale = true;
    }
    if let Some(policy) = &args.autoscale_policy {
        cfg.autoscale_policy = policy.clone();
    }
    if let Some(factor) = args.autoscale_factor {
        cfg.autoscale_factor = factor;
    }
    if let Some(period) = args.autoscale_period {
        cfg.autoscale_period = period;
    }
    if let Some(init_size) = args.autoscale_init_size {
        cfg.autoscale_init_size = init_size;
    }
    if let Some(min_size) = args.autoscale_min_size {
        cfg.autoscale_min_size = min_size;
    }
    if let Some(max_size) = args.autoscale_max_size {
        cfg.autoscale_max_size = max_size;
    }
    if let Some(launcher) = &args.autoscale_launcher {
        cfg.autoscale_launcher = launcher.clone();
    }
    // Takes precedence over both the file and `--auth`: passing a secret on
    // the command line is observable via `ps`.
    if let Ok(auth) = std::env::var("HYPERSHELL_SERVER_AUTH") {
        cfg.auth = auth;
    }
    cfg
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let cfg = apply_overrides(load_config(&args.config)?, &args);
    cfg.validate()?;

    let store = match &cfg.database {
        Some(path) => {
            let store = Store::open(path)?;
            if cfg.initdb {
                store.initdb()?;
            }
            store
        }
        None => Store::in_memory(),
    };
    let store = Arc::new(store);

    let server_id = uuid::Uuid::new_v4().to_string();
    let server_host = hostname();
    let queue = QueueServer::new(cfg.auth.clone(), cfg.bundlesize);

    let halt_queue = Arc::new(HaltFlag::new());
    let halt_scheduler = Arc::new(HaltFlag::new());
    let halt_receiver = Arc::new(HaltFlag::new());
    let halt_confirm = Arc::new(HaltFlag::new());
    let halt_heart = Arc::new(HaltFlag::new());
    let halt_autoscaler = Arc::new(HaltFlag::new());
    let scheduler_done = Arc::new(HaltFlag::new());

    shared::signal::install(vec![
        halt_queue.clone(),
        halt_scheduler.clone(),
        halt_receiver.clone(),
        halt_confirm.clone(),
        halt_heart.clone(),
        halt_autoscaler.clone(),
    ]);

    let addr: SocketAddr = format!("{}:{}", cfg.bind, cfg.port)
        .parse()
        .with_context(|| format!("invalid bind address '{}:{}'", cfg.bind, cfg.port))?;

    let failures = match &cfg.failures_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)
                .with_context(|| format!("failed to open failures file {path}"))?;
            Some(Box::new(file) as Box<dyn std::io::Write + Send>)
        }
        None => None,
    };

    info!(%addr, bundlesize = cfg.bundlesize, eager = cfg.eager, "starting hypershell server");

    if let Some(source) = &args.source {
        let mut extra_tag = TagMap::new();
        for (k, v) in &args.tag {
            extra_tag.insert(k.clone(), TagValue::String(v.clone()));
        }
        let submit_id = uuid::Uuid::new_v4().to_string();
        let submit_host = hostname();
        let loader = Loader::new(Template::default_template(), extra_tag, submit_id, submit_host);
        let submitted = if cfg.database.is_some() {
            let mut sink = DatabaseCommitter::new(&store);
            load_source(source, &loader, &mut sink, cfg.bundlesize)?
        } else {
            let mut sink = LiveQueueCommitter::new(queue.clone(), server_id.clone(), server_host.clone());
            load_source(source, &loader, &mut sink, cfg.bundlesize)?
        };
        info!(submitted, source = %source.display(), "loaded tasks at startup");
    }

    let queue_task = tokio::spawn(queue::serve(queue.clone(), addr, halt_queue));

    let mut scheduler = Scheduler::new(
        queue.clone(),
        store.clone(),
        cfg.bundlesize,
        cfg.max_retries,
        cfg.eager,
        cfg.forever,
        cfg.restart,
        halt_scheduler,
        server_id.clone(),
        server_host.clone(),
    );
    let scheduler_done_flag = scheduler_done.clone();
    let scheduler_task = tokio::spawn(async move {
        scheduler.run().await;
        scheduler_done_flag.trip();
    });

    let mut receiver = Receiver::new(queue.clone(), store.clone(), failures, halt_receiver);
    let receiver_task = tokio::spawn(async move { receiver.run().await });

    let confirm_task = if cfg.confirm {
        let mut confirm = Confirm::new(queue.clone(), store.clone(), halt_confirm);
        Some(tokio::spawn(async move { confirm.run().await }))
    } else {
        None
    };

    let mut heart = HeartMonitor::new(
        queue.clone(),
        store.clone(),
        cfg.evict_after as i64,
        scheduler_done,
        halt_heart,
        server_id,
        server_host,
    );
    let heart_task = tokio::spawn(async move { heart.run().await });

    let autoscaler_task = if cfg.autoscale {
        let policy = AutoScalerPolicy::from_name(&cfg.autoscale_policy)?;
        if cfg.autoscale_launcher.trim().is_empty() {
            anyhow::bail!("--autoscale requires --autoscale-launcher (no implicit client config to launch)");
        }
        let launcher = shlex::split(&cfg.autoscale_launcher)
            .with_context(|| format!("invalid autoscale launcher '{}'", cfg.autoscale_launcher))?;
        let mut scaler = AutoScaler::new(
            store.clone(),
            launcher,
            policy,
            cfg.autoscale_factor,
            cfg.autoscale_period as i64,
            cfg.autoscale_init_size,
            cfg.autoscale_min_size,
            cfg.autoscale_max_size,
            halt_autoscaler,
        );
        Some(tokio::spawn(async move { scaler.run().await }))
    } else {
        None
    };

    scheduler_task.await.context("scheduler task panicked")?;
    receiver_task.await.context("receiver task panicked")?;
    if let Some(task) = confirm_task {
        task.await.context("confirm task panicked")?;
    }
    heart_task.await.context("heartmonitor task panicked")?;
    if let Some(task) = autoscaler_task {
        task.await.context("autoscaler task panicked")?;
    }
    let _ = queue_task.await;

    info!("hypershell server stopped");
    Ok(())
}

/// Standalone submission against a server's database. This is the only
/// submission path that can run as a separate OS process: sqlite's WAL mode
/// lets it write concurrently with a running server's own connection. The
/// `--no-db` / live-queue path has no durable handoff point between
/// processes, so it is only available as the `source` argument to `serve`
/// (see `run_serve`), matching the embedded loader in the teacher.
fn run_submit(args: SubmitArgs) -> Result<()> {
    let cfg = load_config(&args.config)?;
    let Some(db_path) = &cfg.database else {
        anyhow::bail!("submit requires a `database` entry in {}", args.config.display());
    };
    let store = Store::open(db_path)?;

    let mut extra_tag = TagMap::new();
    for (k, v) in args.tag {
        extra_tag.insert(k, TagValue::String(v));
    }
    let submit_id = uuid::Uuid::new_v4().to_string();
    let submit_host = hostname();
    let loader = Loader::new(Template::default_template(), extra_tag, submit_id, submit_host);
    let mut sink = DatabaseCommitter::new(&store);

    let submitted = match &args.file {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            submit::run_submission(&loader, BufReader::new(file), &mut sink, cfg.bundlesize)?
        }
        None => {
            let stdin = std::io::stdin();
            submit::run_submission(&loader, stdin.lock(), &mut sink, cfg.bundlesize)?
        }
    };

    info!(submitted, "submission complete");
    Ok(())
}

fn load_source(
    path: &PathBuf,
    loader: &Loader,
    sink: &mut dyn TaskSink,
    bundlesize: usize,
) -> Result<usize> {
    if path.as_os_str() == "-" {
        let stdin = std::io::stdin();
        Ok(submit::run_submission(loader, stdin.lock(), sink, bundlesize)?)
    } else {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(submit::run_submission(loader, BufReader::new(file), sink, bundlesize)?)
    }
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
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            if let Err(e) = run_serve(args).await {
                tracing::error!(error = %e, "server exited with error");
                std::process::exit(1);
            }
        }
        Command::Submit(args) => {
            if let Err(e) = run_submit(args) {
                warn!(error = %e, "submit failed");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
