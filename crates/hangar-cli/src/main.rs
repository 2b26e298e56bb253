//! Hangar daemon and operator CLI.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use hangar_core::ResourceId;
use hangar_core::job::JobStatus;
use hangar_core::project::{DeployOn, SourceHost};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "hangar")]
#[command(about = "Hangar CI capacity and scheduling", long_about = None)]
struct Cli {
    /// System configuration file
    #[arg(long, short, env = "HANGAR_CONFIG", default_value = "hangar.kdl", global = true)]
    config: PathBuf,

    /// PostgreSQL connection string; without it state lives in memory
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop and commit status notifier
    Serve,
    /// Validate the system configuration and optional build manifests
    Validate {
        /// Build manifests to check
        manifests: Vec<PathBuf>,
    },
    /// Inspect and control worker pools
    Pools {
        #[command(subcommand)]
        command: PoolCommands,
    },
    /// Manage projects
    Projects {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Create and inspect builds
    Builds {
        #[command(subcommand)]
        command: BuildCommands,
    },
    /// Report job status changes
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Subcommand)]
enum PoolCommands {
    /// Show units and slot counts per pool
    List,
    /// Apply a power action to a unit
    Power {
        /// Pool name
        pool: String,
        /// Provider server id
        unit: String,
        #[arg(value_enum)]
        action: commands::pools::PowerArg,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Register a repository
    Add {
        /// Source host tag (gh, gl, bb)
        #[arg(long)]
        host: SourceHost,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        /// Repository id on the source host
        #[arg(long)]
        remote_id: i64,
        /// Account whose host credential is used
        #[arg(long)]
        account: Option<ResourceId>,
        #[arg(long, default_value = "tag")]
        deploy_on: DeployOn,
        #[arg(long, default_value = "master")]
        deploy_branch: String,
        /// Secret variable as KEY=VALUE, withheld from pull requests
        #[arg(long = "secret")]
        secrets: Vec<String>,
    },
    /// Show a project and its latest build
    Show { id: ResourceId },
    /// Refresh metadata from the source host
    Sync {
        id: ResourceId,
        /// Access token to store for the project's account first
        #[arg(long, env = "HANGAR_HOST_TOKEN")]
        token: Option<String>,
    },
    /// Register a push webhook and start accepting builds
    Activate { id: ResourceId },
    /// Remove the webhook and stop accepting builds
    Deactivate { id: ResourceId },
}

#[derive(Subcommand)]
enum BuildCommands {
    /// Queue a build
    Create {
        #[arg(long)]
        project: ResourceId,
        #[arg(long)]
        branch: String,
        #[arg(long)]
        sha: String,
        #[arg(long, default_value = "")]
        author: String,
        #[arg(long)]
        tag: Option<String>,
        /// Pull request number
        #[arg(long)]
        pull_request: Option<u64>,
        /// Head branch of the pull request
        #[arg(long, requires = "pull_request")]
        pr_branch: Option<String>,
        /// Build manifest
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// List builds, newest first
    List {
        #[arg(long)]
        project: ResourceId,
        #[arg(long)]
        count: Option<String>,
        #[arg(long)]
        page: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        pull_request: Option<String>,
    },
    /// Show one build
    Show {
        #[arg(long)]
        project: ResourceId,
        number: u64,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Job booted on its unit
    Start { id: ResourceId },
    /// Job finished
    Finish {
        id: ResourceId,
        /// success, failure, error or canceled
        status: JobStatus,
    },
    /// Cancel a job
    Cancel { id: ResourceId },
    /// Print the environment a job runs with
    Env { id: ResourceId },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let database_url = cli.database_url.as_deref();
    match cli.command {
        Commands::Serve => {
            commands::serve::run(&cli.config, database_url).await?;
        }
        Commands::Validate { manifests } => {
            commands::validate(&cli.config, &manifests)?;
        }
        Commands::Pools { command } => match command {
            PoolCommands::List => {
                commands::pools::list(&cli.config, database_url).await?;
            }
            PoolCommands::Power { pool, unit, action } => {
                commands::pools::power(&cli.config, &pool, &unit, action).await?;
            }
        },
        Commands::Projects { command } => match command {
            ProjectCommands::Add {
                host,
                owner,
                name,
                remote_id,
                account,
                deploy_on,
                deploy_branch,
                secrets,
            } => {
                let project = commands::projects::NewProject {
                    host,
                    owner,
                    name,
                    remote_id,
                    account,
                    deploy_on,
                    deploy_branch,
                    secrets,
                };
                commands::projects::add(database_url, project).await?;
            }
            ProjectCommands::Show { id } => {
                commands::projects::show(database_url, id).await?;
            }
            ProjectCommands::Sync { id, token } => {
                commands::projects::sync(&cli.config, database_url, id, token).await?;
            }
            ProjectCommands::Activate { id } => {
                commands::projects::activate(&cli.config, database_url, id).await?;
            }
            ProjectCommands::Deactivate { id } => {
                commands::projects::deactivate(&cli.config, database_url, id).await?;
            }
        },
        Commands::Builds { command } => match command {
            BuildCommands::Create {
                project,
                branch,
                sha,
                author,
                tag,
                pull_request,
                pr_branch,
                manifest,
            } => {
                let request = commands::builds::NewBuild {
                    project,
                    branch,
                    sha,
                    author,
                    tag,
                    pull_request,
                    pr_branch,
                    manifest,
                };
                commands::builds::create(database_url, request).await?;
            }
            BuildCommands::List {
                project,
                count,
                page,
                branch,
                status,
                pull_request,
            } => {
                let query = hangar_core::query::BuildQuery::parse(
                    count.as_deref(),
                    page.as_deref(),
                    branch.as_deref(),
                    status.as_deref(),
                    pull_request.as_deref(),
                )?;
                commands::builds::list(database_url, project, &query).await?;
            }
            BuildCommands::Show { project, number } => {
                commands::builds::show(database_url, project, number).await?;
            }
        },
        Commands::Jobs { command } => match command {
            JobCommands::Start { id } => commands::jobs::start(database_url, id).await?,
            JobCommands::Finish { id, status } => {
                commands::jobs::finish(database_url, id, status).await?
            }
            JobCommands::Cancel { id } => commands::jobs::cancel(database_url, id).await?,
            JobCommands::Env { id } => commands::jobs::env(database_url, id).await?,
        },
    }

    Ok(())
}
