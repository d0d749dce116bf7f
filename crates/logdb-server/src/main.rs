//! LogDB - Main entry point

use clap::{Parser, Subcommand};
use logdb_common::logging::{init_logging, ConsoleStream, LogConfig, LogLevel};
use logdb_common::types::{Namespace, WorkerKind};
use std::path::Path;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use logdb_server::broker::{AmqpConnector, BrokerConnection, ConnectionMode, Publish, QueueSender};
use logdb_server::cleaner::run_cleaner;
use logdb_server::config::Config;
use logdb_server::liveness::StdoutLiveness;
use logdb_server::loader::run_loader;
use logdb_server::protocol::run_protocol;
use logdb_server::supervisor::{OpenConnectionLimit, ProcessSpec, Supervisor, Timing, WorkerClass};

const DEFAULT_FILTER: &str = "lapin=warn,sqlx=warn";

#[derive(Parser, Debug)]
#[command(name = "logdb")]
#[command(author, version, about = "Device log ingestion pipeline", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log verbosity (overrides LOG_LEVEL)
    #[arg(long, global = true)]
    loglevel: Option<LogLevel>,

    /// Use the isolated `_test` exchanges and queues
    #[arg(long = "test-queue", global = true)]
    test_queue: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the listener, the loader and (if enabled) the cleaner
    Run {
        /// Address devices connect to
        host: String,
        port: u16,
    },

    /// Run a single worker class; this is what `run` launches
    Worker {
        /// protocol, loader or cleaner
        kind: WorkerKind,
        host: String,
        port: u16,
    },

    /// Send each stdin line to a queue through the default exchange
    Inject {
        /// Target queue, defaults to the loader queue of the namespace
        #[arg(long)]
        queue: Option<String>,
    },
}

impl Cli {
    fn log_prefix(&self) -> String {
        match &self.command {
            Command::Run { .. } => "logdb".to_string(),
            Command::Worker { kind, .. } => format!("logdb-{kind}"),
            Command::Inject { .. } => "logdb-inject".to_string(),
        }
    }

    fn log_config(&self) -> anyhow::Result<LogConfig> {
        let mut config = LogConfig::builder()
            // A worker's stdout is its liveness pipe
            .console_stream(ConsoleStream::Stderr)
            .log_file_prefix(self.log_prefix())
            .filter_directives(DEFAULT_FILTER)
            .build()
            .merge_env()?;

        if let Some(level) = self.loglevel {
            config.level = level;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let guard = match cli.log_config().and_then(|config| init_logging(&config)) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            None
        },
    };

    if let Err(e) = execute(&cli).await {
        error!(error = %e, "LogDB process failed");
        drop(guard);
        process::exit(1);
    }
}

async fn execute(cli: &Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if cli.test_queue {
        config.namespace = Namespace::test();
    }

    match &cli.command {
        Command::Run { host, port } => {
            config.protocol.host = host.clone();
            config.protocol.port = *port;
            config.validate()?;
            supervise(cli, &config).await
        },
        Command::Worker { kind, host, port } => {
            config.protocol.host = host.clone();
            config.protocol.port = *port;
            config.validate()?;
            run_worker(*kind, &config).await
        },
        Command::Inject { queue } => {
            let queue = queue
                .clone()
                .unwrap_or_else(|| config.broker.loader_queue_in(config.namespace));
            inject(&config, &queue).await
        },
    }
}

async fn run_worker(kind: WorkerKind, config: &Config) -> anyhow::Result<()> {
    info!(
        worker = %kind,
        pid = process::id(),
        test_namespace = config.namespace.is_test(),
        "Starting worker"
    );

    match kind {
        WorkerKind::Protocol => run_protocol(config, StdoutLiveness).await?,
        WorkerKind::Loader => run_loader(config, StdoutLiveness).await?,
        WorkerKind::Cleaner => run_cleaner(config, StdoutLiveness).await?,
    }

    warn!(worker = %kind, "Worker loop returned");
    Ok(())
}

fn worker_spec(exe: &Path, cli: &Cli, kind: WorkerKind, config: &Config) -> ProcessSpec {
    let mut spec = ProcessSpec::new(exe).args([
        "worker".to_string(),
        kind.to_string(),
        config.protocol.host.clone(),
        config.protocol.port.to_string(),
    ]);

    if cli.test_queue {
        spec = spec.arg("--test-queue");
    }
    if let Some(level) = cli.loglevel {
        spec = spec.args(["--loglevel", level.as_str()]);
    }
    spec
}

async fn supervise(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    let mut supervisor = Supervisor::new(Timing::from(&config.supervisor));

    supervisor.register(
        WorkerClass::new(
            WorkerKind::Protocol.as_str(),
            worker_spec(&exe, cli, WorkerKind::Protocol, config),
        )
        .with_health(Arc::new(OpenConnectionLimit::new(config.protocol.max_open_connections))),
    );
    supervisor.register(WorkerClass::new(
        WorkerKind::Loader.as_str(),
        worker_spec(&exe, cli, WorkerKind::Loader, config),
    ));
    if config.cleaner.enabled {
        supervisor.register(WorkerClass::new(
            WorkerKind::Cleaner.as_str(),
            worker_spec(&exe, cli, WorkerKind::Cleaner, config),
        ));
    } else {
        info!("Cleaner is disabled (LOGDB_CLEANER_ENABLED=false)");
    }

    info!(
        host = %config.protocol.host,
        port = config.protocol.port,
        test_namespace = config.namespace.is_test(),
        "Starting LogDB supervisor"
    );

    let handle = supervisor.start();

    tokio::signal::ctrl_c().await?;
    info!(workers = ?handle.snapshot(), "Shutting down, killing workers");
    drop(handle);

    Ok(())
}

async fn inject(config: &Config, queue: &str) -> anyhow::Result<()> {
    let mode = ConnectionMode::Exclusive(AmqpConnector::new(&config.broker.url));
    let connection = BrokerConnection::open(&mode, config.broker.confirm_delivery).await?;
    let sender = QueueSender::new(connection, queue).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent = 0u64;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        sender.publish(line.as_bytes()).await?;
        sent += 1;
    }

    info!(queue = sender.queue(), sent, "Injection finished");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_worker_invocation() {
        let cli = Cli::try_parse_from(["logdb", "worker", "loader", "0.0.0.0", "9010", "--test-queue", "--loglevel", "debug"])
            .unwrap();

        assert!(cli.test_queue);
        assert_eq!(cli.loglevel, Some(LogLevel::Debug));
        assert!(matches!(cli.command, Command::Worker { kind: WorkerKind::Loader, port: 9010, .. }));
    }

    #[test]
    fn test_worker_spec_forwards_flags() {
        let cli = Cli::try_parse_from(["logdb", "run", "127.0.0.1", "9010", "--test-queue", "--loglevel", "warn"]).unwrap();
        let config = Config::default();

        let spec = worker_spec(Path::new("/usr/bin/logdb"), &cli, WorkerKind::Protocol, &config);
        let args: Vec<_> = spec.args.iter().map(|a| a.to_string_lossy().into_owned()).collect();

        assert_eq!(
            args,
            ["worker", "protocol", "0.0.0.0", "9010", "--test-queue", "--loglevel", "warn"]
        );
    }

    #[test]
    fn test_rejects_unknown_worker_kind() {
        assert!(Cli::try_parse_from(["logdb", "worker", "router", "h", "1"]).is_err());
    }
}
