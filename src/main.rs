use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use foreman::client::{Client, ClientOptions, JobSpec};
use foreman::config::{SchedulerConfig, DEFAULT_MAX_WORKERS};
use foreman::notify::TracingNotifier;
use foreman::scheduler::Scheduler;
use foreman::shutdown::install_shutdown_handler;
use foreman::spawn::ProcessSpawner;
use foreman::worker::shell::{ShellArgs, ShellOutput, SHELL_JOB};
use foreman::worker::JobRegistry;

#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version)]
#[command(about = "A process-backed job scheduler with dependencies and futures")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduling engine over stdio (spawned by a client library)
    Host(HostArgs),

    /// Run a single-job worker over stdio (spawned by the scheduler)
    Worker,

    /// Launch a scheduler, run shell commands as jobs, print their output
    Demo(DemoArgs),
}

#[derive(Parser, Debug)]
struct HostArgs {
    /// Initial bound on simultaneously running jobs
    #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
    max_workers: usize,

    /// Milliseconds between retry polls while only failed jobs remain
    #[arg(long, default_value_t = 250)]
    retry_poll_ms: u64,
}

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Shell commands, one job each
    #[arg(required = true)]
    commands: Vec<String>,

    /// Bound on simultaneously running jobs
    #[arg(long)]
    max_workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Frames travel on stdout; logs must stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Host(host_args) => run_host(host_args).await,
        Commands::Worker => run_worker().await,
        Commands::Demo(demo_args) => run_demo(demo_args).await,
    }
}

// =============================================================================
// Host
// =============================================================================

async fn run_host(args: HostArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SchedulerConfig::new(args.max_workers)
        .with_retry_poll_interval(Duration::from_millis(args.retry_poll_ms));

    let spawner = ProcessSpawner::current_exe(vec!["worker".to_string()])?;
    let scheduler = Scheduler::new(
        config,
        spawner,
        tokio::io::stdin(),
        tokio::io::stdout(),
        Box::new(TracingNotifier),
    );

    tracing::info!(max_workers = args.max_workers, "Scheduler starting");

    let shutdown = install_shutdown_handler();
    tokio::select! {
        result = scheduler.run() => result?,
        _ = shutdown.cancelled() => {
            tracing::info!("Signal received; scheduler exiting");
        }
    }
    Ok(())
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker() -> Result<(), Box<dyn std::error::Error>> {
    let registry = Arc::new(JobRegistry::with_builtins());
    foreman::worker::run(tokio::io::stdin(), tokio::io::stdout(), registry).await?;
    Ok(())
}

// =============================================================================
// Demo
// =============================================================================

async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = ClientOptions::current_exe()?;
    if let Some(max_workers) = args.max_workers {
        options = options.with_max_workers(max_workers);
    }
    let client = Client::launch(options).await?;

    let mut handles = Vec::new();
    for command in &args.commands {
        let spec = JobSpec::call(SHELL_JOB)
            .name(command.clone())
            .args(&ShellArgs {
                command: command.clone(),
            })?;
        handles.push((command.clone(), client.submit(spec).await?));
    }

    for (command, handle) in handles {
        match handle.result_as::<ShellOutput>().await {
            Ok(output) => {
                println!("$ {command}");
                print!("{}", output.stdout);
            }
            Err(failure) => {
                eprintln!("$ {command}");
                eprintln!("failed: {failure}");
            }
        }
    }

    client.shutdown().await?;
    Ok(())
}
