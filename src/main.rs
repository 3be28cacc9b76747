use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use vmshift::{
    MigrationProtocol, ShiftError, Task, TaskExecutor, WorkCounter,
    config::{BackendKind, ShiftConfig},
    hypervisor::{DeviceBackend, HypervisorBackend},
    libvirt::VirshBackend,
    logger,
    sim::SimulatedCluster,
    transport::{Communicator, InMemoryBroker, QoS, Subscription},
};

#[derive(Parser)]
#[command(name = "vmshift")]
#[command(about = "Live VM migration orchestrator")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Hypervisor backend, overrides the configured one
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute task files in order
    Run {
        /// YAML task files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Read `---` separated tasks from stdin
    Serve,
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Libvirt,
    Simulated,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Libvirt => BackendKind::Libvirt,
            BackendArg::Simulated => BackendKind::Simulated,
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ShiftConfig> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => ShiftConfig::default_path().filter(|path| path.exists()),
    };
    let mut config = match path {
        Some(path) => ShiftConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            logger::debug!("No config file found, using defaults");
            ShiftConfig::default()
        }
    };
    if let Some(backend) = cli.backend {
        config.host.backend = backend.into();
    }
    Ok(config)
}

fn build_backends(
    config: &Arc<ShiftConfig>,
) -> anyhow::Result<(Arc<dyn HypervisorBackend>, Arc<dyn DeviceBackend>)> {
    match config.host.backend {
        BackendKind::Libvirt => {
            if !VirshBackend::is_available() {
                bail!("virsh not found; install libvirt or use --backend simulated");
            }
            let backend = Arc::new(VirshBackend::new(config.clone()));
            let hypervisor: Arc<dyn HypervisorBackend> = backend.clone();
            let devices: Arc<dyn DeviceBackend> = backend;
            Ok((hypervisor, devices))
        }
        BackendKind::Simulated => {
            let cluster = SimulatedCluster::new(&config.host.name);
            let hypervisor: Arc<dyn HypervisorBackend> = Arc::new(cluster.clone());
            let devices: Arc<dyn DeviceBackend> = Arc::new(cluster);
            Ok((hypervisor, devices))
        }
    }
}

/// Publish `---` separated YAML documents from `input` on `topic` as they
/// arrive and execute them until a quit task or the end of input.
async fn serve_stream<R>(
    executor: &TaskExecutor,
    comm: &dyn Communicator,
    topic: &str,
    input: R,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let tasks = comm.subscribe(topic, QoS::ExactlyOnce).await?;
    let mut server = tokio::spawn({
        let executor = executor.clone();
        async move { executor.serve(tasks).await }
    });

    let mut lines = input.lines();
    let mut document = String::new();
    loop {
        tokio::select! {
            served = &mut server => {
                served??;
                return Ok(());
            }
            line = lines.next_line() => match line.context("failed to read tasks")? {
                Some(line) if line.trim_end() == "---" => {
                    if !document.trim().is_empty() {
                        comm.publish(topic, &document, QoS::ExactlyOnce).await?;
                    }
                    document.clear();
                }
                Some(line) => {
                    document.push_str(&line);
                    document.push('\n');
                }
                None => break,
            }
        }
    }
    if !document.trim().is_empty() {
        comm.publish(topic, &document, QoS::ExactlyOnce).await?;
    }
    // End of input ends the stream like a quit task.
    comm.publish(topic, "operation: quit\n", QoS::ExactlyOnce).await?;
    server.await??;
    Ok(())
}

fn print_replies(replies: &mut Subscription) {
    while let Some(reply) = replies.try_recv() {
        println!("---\n{}", reply.trim_end());
    }
}

/// Execute `tasks` in order, stopping at the first quit task.
async fn execute_all(executor: &TaskExecutor, tasks: Vec<(String, String)>) -> anyhow::Result<()> {
    for (source, yaml) in tasks {
        let task = Task::from_yaml(&yaml).with_context(|| format!("invalid task in {}", source))?;
        if task.is_quit() {
            logger::info!("Quit task in {}, not reading further", source);
            break;
        }
        match executor.execute(task).await {
            Ok(()) => {}
            Err(ShiftError::UnhandledQuit) => bail!("quit task reached the executor"),
            Err(e) => return Err(e).with_context(|| format!("task from {} failed", source)),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        logger::init_verbose();
    } else {
        logger::init_logger();
    }

    let config = load_config(&cli)?;
    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let config = Arc::new(config);
    let (hypervisor, devices) = build_backends(&config)?;
    let broker = Arc::new(InMemoryBroker::new(&config.transport.result_topic));
    let mut replies = broker
        .subscribe(&config.transport.result_topic, QoS::ExactlyOnce)
        .await?;

    logger::info!(
        "vmshift on {} using the {} backend",
        config.host.name,
        config.host.backend.as_str()
    );
    let protocol = MigrationProtocol::new(hypervisor, devices, broker.clone(), config.clone());
    let executor = TaskExecutor::new(protocol, WorkCounter::new());

    let outcome = match &cli.command {
        Commands::Run { files } => {
            let mut tasks = Vec::new();
            for file in files {
                let contents = std::fs::read_to_string(file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                tasks.push((file.display().to_string(), contents));
            }
            execute_all(&executor, tasks).await
        }
        Commands::Serve => {
            let stdin = BufReader::new(tokio::io::stdin());
            serve_stream(&executor, broker.as_ref(), &config.transport.task_topic, stdin).await
        }
        Commands::Config => Ok(()),
    };

    executor.work().wait_idle().await;
    print_replies(&mut replies);
    outcome
}
