use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use stagehand::config::{HostConfig, RunnerConfig};
use stagehand::dashboard::{
    run_dashboard, ActivityResponse, CancelJobResponse, DashboardState, InputReference,
    JobResponse, SubmitJobRequest, SubmitJobResponse,
};
use stagehand::notify::LogSink;
use stagehand::shutdown::install_shutdown_handler;
use stagehand::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version)]
#[command(about = "Runs external computation jobs one at a time and delivers their results")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Save the host settings required before jobs are accepted
    Setup(SetupArgs),

    /// Start the job runner and its HTTP intake
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Show what the runner is working on
    Activity {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Setup / Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SetupArgs {
    /// Host name or IP address of the compute host
    #[arg(long)]
    hostname: String,

    /// Directory on the compute host that stores job files
    #[arg(long)]
    mount_location: PathBuf,

    /// Largest archive (in MB) that will be delivered
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=1024))]
    max_archive_mb: u64,

    /// SSH port of the compute host (0 if no port)
    #[arg(long)]
    port: u16,

    /// Settings file to write
    #[arg(long, default_value = "stagehand.json")]
    config: PathBuf,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port for the HTTP intake
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Settings file written by `setup`
    #[arg(long, default_value = "stagehand.json")]
    config: PathBuf,

    /// External program to run; it receives the staged input file path
    #[arg(long, default_value = "/Orca/orca")]
    program: PathBuf,

    /// How often the output log is polled, in milliseconds
    #[arg(long, default_value = "5000", value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval_ms: u64,

    /// Kill a job after this many seconds (runs until exit when unset)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Keep at most this many jobs in the archive, evicting finished ones first
    #[arg(long)]
    archive_capacity: Option<usize>,

    /// Directory local input paths must lie in; without it only URLs are accepted
    #[arg(long)]
    upload_root: Option<PathBuf>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Runner address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job
    Submit {
        /// Name shown in notifications
        #[arg(long)]
        author: String,

        /// Primary input (path or http(s) URL)
        input: String,

        /// Auxiliary inputs (paths or URLs), at most 5
        #[arg(long = "aux")]
        aux: Vec<String>,
    },
    /// Get one job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List every job submitted since the runner started
    List,
    /// Cancel a queued or running job
    Cancel {
        /// The job ID (UUID)
        job_id: String,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

// =============================================================================
// Setup / Server
// =============================================================================

fn run_setup(args: SetupArgs) -> CliResult<()> {
    let host = HostConfig::new(args.hostname, args.mount_location, args.port, args.max_archive_mb);
    host.save(&args.config)?;

    println!("Settings saved to {}", args.config.display());
    println!("Host Name         : {}", host.hostname.as_deref().unwrap_or_default());
    if let Some(mount) = &host.mount_location {
        println!("Mount Location    : {}", mount.display());
    }
    println!("Max Archive Size  : {} MB", args.max_archive_mb);
    println!("Port              : {}", args.port);
    Ok(())
}

async fn run_server(args: ServerArgs) -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let host = HostConfig::load(&args.config)?;
    if !host.is_complete() {
        tracing::warn!(
            config = %args.config.display(),
            "Setup is incomplete, jobs will be rejected until `stagehand setup` writes this file"
        );
    }

    let mut config = RunnerConfig::new(host)
        .with_host_file(args.config.clone())
        .with_program(args.program)
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms));
    if let Some(secs) = args.timeout_secs {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    if let Some(capacity) = args.archive_capacity {
        config = config.with_archive_capacity(capacity);
    }
    if let Some(root) = args.upload_root {
        config = config.with_upload_root(root);
    }

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    tracing::info!(
        listen_addr = %listen_addr,
        program = %config.executor.program.display(),
        mount = %config.mount_root().display(),
        timeout = ?config.executor.timeout,
        "Starting stagehand"
    );

    let pipeline = Arc::new(Pipeline::new(config, Arc::new(LogSink)));
    let shutdown = install_shutdown_handler(Arc::clone(&pipeline))?;

    run_dashboard(listen_addr, DashboardState { pipeline }, shutdown).await;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn print_job_table(jobs: &[JobResponse]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!(
        "{:<38} {:<10} {:<20} {:<16} ELAPSED",
        "JOB ID", "STATE", "NAME", "AUTHOR"
    );
    println!("{}", "-".repeat(96));
    for job in jobs {
        let name = if job.name.len() > 20 {
            format!("{}...", &job.name[..17])
        } else {
            job.name.clone()
        };
        println!(
            "{:<38} {:<10} {:<20} {:<16} {}",
            job.id,
            job.state.to_string(),
            name,
            job.author,
            job.elapsed.as_deref().unwrap_or("-")
        );
    }
}

async fn handle_job_submit(
    http: &reqwest::Client,
    client: &ClientArgs,
    author: String,
    input: String,
    aux: Vec<String>,
) -> CliResult<()> {
    let inputs = std::iter::once(input)
        .chain(aux)
        .map(|source| InputReference {
            filename: None,
            source: absolutize(&source),
        })
        .collect();

    let response: SubmitJobResponse = http
        .post(format!("{}/api/jobs", client.addr))
        .json(&SubmitJobRequest { author, inputs })
        .send()
        .await?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Table => match (&response.job_id, &response.error) {
            (Some(id), _) => {
                println!("Job submitted successfully!");
                println!("Job ID: {}", id);
            }
            (None, error) => {
                eprintln!(
                    "Error: Job submission failed: {}",
                    error.as_deref().unwrap_or("unknown error")
                );
                std::process::exit(1);
            }
        },
    }
    Ok(())
}

/// Local paths are resolved before they are sent to the runner.
fn absolutize(source: &str) -> String {
    if source.starts_with("http://") || source.starts_with("https://") {
        return source.to_string();
    }
    std::path::absolute(source)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| source.to_string())
}

async fn handle_job_status(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
) -> CliResult<()> {
    let response = http
        .get(format!("{}/api/jobs/{}", client.addr, job_id))
        .send()
        .await?;
    if !response.status().is_success() {
        eprintln!("Error: {}", response.text().await?);
        std::process::exit(1);
    }
    let job: JobResponse = response.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job ID:      {}", job.id);
            println!("Name:        {}", job.name);
            println!("Author:      {}", job.author);
            println!("State:       {}", job.state);
            println!("Directory:   {}", job.working_directory);
            if let Some(success) = job.exit_outcome {
                println!("Succeeded:   {}", success);
            }
            if let Some(elapsed) = &job.elapsed {
                println!("Elapsed:     {}", elapsed);
            }
        }
    }
    Ok(())
}

async fn handle_job_list(http: &reqwest::Client, client: &ClientArgs) -> CliResult<()> {
    let jobs: Vec<JobResponse> = http
        .get(format!("{}/api/jobs", client.addr))
        .send()
        .await?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            print_job_table(&jobs);
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
) -> CliResult<()> {
    let response: CancelJobResponse = http
        .post(format!("{}/api/jobs/{}/cancel", client.addr, job_id))
        .send()
        .await?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Table => {
            if response.success {
                println!(
                    "Job {} cancelled ({})",
                    job_id,
                    response.outcome.as_deref().unwrap_or("done")
                );
            } else {
                eprintln!(
                    "Error: {}",
                    response.error.as_deref().unwrap_or("cancel failed")
                );
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn handle_activity(http: &reqwest::Client, client: &ClientArgs) -> CliResult<()> {
    let response: ActivityResponse = http
        .get(format!("{}/api/activity", client.addr))
        .send()
        .await?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Table => {
            println!("Activity: {}", response.activity);
            println!("Backlog:  {} job(s)", response.backlog);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> CliResult<()> {
    let args = Args::parse();
    let http = reqwest::Client::new();

    match args.command {
        Commands::Setup(setup_args) => run_setup(setup_args)?,
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Job { client, command } => match command {
            JobCommands::Submit { author, input, aux } => {
                handle_job_submit(&http, &client, author, input, aux).await?;
            }
            JobCommands::Status { job_id } => {
                handle_job_status(&http, &client, job_id).await?;
            }
            JobCommands::List => handle_job_list(&http, &client).await?,
            JobCommands::Cancel { job_id } => {
                handle_job_cancel(&http, &client, job_id).await?;
            }
        },
        Commands::Activity { client } => handle_activity(&http, &client).await?,
    }

    Ok(())
}
