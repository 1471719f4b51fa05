//! dns-reflector - a DNS server that tells clients who they are

pub mod config;
pub mod control;
pub mod dns_server;
pub mod plugin;
pub mod shutdown;
pub mod types;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use config::{Config, ListenSpec};
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// Log timestamps in local time instead of UTC.
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "dns-reflector")]
#[command(about = "A DNS server that answers with the client's own address", long_about = None)]
struct Args {
    /// Compress replies
    #[arg(long)]
    compress: bool,

    /// Listeners per address sharing the port via SO_REUSEPORT (0 = off)
    #[arg(long, default_value_t = 0)]
    soreuseport: usize,

    /// Number of worker threads (0 = all CPUs)
    #[arg(long, default_value_t = 0)]
    cpu: usize,

    /// Listen on specific address(es): listen1,listen2,listenN
    #[arg(long, default_value = "[::]:53")]
    listen: String,

    /// Show app version
    #[arg(long)]
    version: bool,

    /// Send a message to the control socket of a running instance
    #[arg(long, default_value = "")]
    client: String,

    /// Management socket
    #[arg(long, default_value = "/dns.sock")]
    socket: PathBuf,

    /// Directory listed by the `ls` control command
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Seconds to wait for listeners to stop after a signal
    #[arg(long, default_value_t = 5)]
    shutdown_grace: u64,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics: Option<String>,

    /// Also log to this file, rotated daily
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Keep the guard alive so buffered file logs are flushed on return.
    let _guard = match init_logging(args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let appender = RollingFileAppender::new(path, RollingConditionBasic::new().daily(), 30)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(file_layer)
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();
    Ok(guard)
}

fn run(args: Args) -> Result<ExitCode> {
    // Client and version modes never start a listener, and exit non-zero.
    if !args.client.is_empty() {
        control::send(&args.socket, &args.client)?;
        return Ok(ExitCode::FAILURE);
    }
    if args.version {
        println!("{}", VERSION);
        return Ok(ExitCode::FAILURE);
    }

    let config = Config {
        compress: args.compress,
        reuse_port: args.soreuseport,
        cpu: args.cpu,
        listen: ListenSpec::parse_list(&args.listen).context("Unable to parse listen address")?,
        socket: args.socket,
        control_root: args.root,
        shutdown_grace: Duration::from_secs(args.shutdown_grace),
        metrics: args.metrics,
    };

    let cores = if config.cpu > 0 {
        config.cpu
    } else {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("reflector-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(Arc::new(config), cores))?;
    Ok(ExitCode::SUCCESS)
}

async fn async_main(config: Arc<Config>, cores: usize) -> Result<()> {
    info!("Starting dns-reflector version {}", VERSION);
    info!(">>> Utilizing {} worker threads", cores);

    let mut signals = shutdown::Signals::install()?;
    let (trigger, shutdown) = shutdown::channel();

    let server = dns_server::DnsServer::new(config.clone());
    let mut listeners = server.start(&config.listen, config.reuse_port, shutdown.clone()).await?;
    info!(">>> {} serving tasks started for {} listen address(es)", listeners.tasks().len(), config.listen.len());

    let metrics = match &config.metrics {
        Some(addr) => {
            let listener = plugin::prometheus::bind(addr).await?;
            Some(tokio::spawn(plugin::prometheus::serve(listener, shutdown.clone())))
        }
        None => None,
    };

    let control = control::ControlServer::bind(&config.socket, &config.control_root)?;
    let control_task = tokio::spawn(control.serve(shutdown.clone()));

    let signal = signals.recv().await;
    info!("Caught signal {}: shutting down.", signal);
    trigger.trigger();

    let drained = tokio::time::timeout(config.shutdown_grace, async {
        listeners.join().await;
        let _ = control_task.await;
        if let Some(task) = metrics {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Grace period of {:?} elapsed, exiting anyway", config.shutdown_grace);
    }

    info!("Bye... ({})", signal);
    Ok(())
}
