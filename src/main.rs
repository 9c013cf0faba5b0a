use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use trackio::cli;
use trackio::config::Config;
use trackio::error::TrackioError;
use trackio::server::{DashboardHints, ServerState};
use trackio::snapshot::Snapshotter;
use trackio::store::ProjectStore;

#[derive(Parser)]
#[command(name = "trackio", version, about = "Self-hosted experiment tracking")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch the dashboard server for local projects
    Show {
        #[arg(long)]
        project: Option<String>,
        /// Host to bind (defaults to localhost only)
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        theme: Option<String>,
        /// Comma-separated hex colors for plot lines
        #[arg(long)]
        color_palette: Option<String>,
        /// Expose the query surface as MCP tools
        #[arg(long)]
        mcp_server: bool,
    },
    /// Show sync status of all local projects
    Status,
    /// Reconcile the local durable buffer with the remote
    Sync {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        space_id: Option<String>,
        #[arg(long)]
        private: bool,
        #[arg(long)]
        force: bool,
    },
    /// List projects, runs, metrics, alerts, or reports
    List {
        #[command(subcommand)]
        what: ListCommand,
    },
    /// Point lookups against stored data
    Get {
        #[command(subcommand)]
        what: GetCommand,
    },
}

#[derive(Subcommand)]
enum ListCommand {
    Projects {
        #[arg(long)]
        json: bool,
    },
    Runs {
        #[arg(long)]
        project: String,
        #[arg(long)]
        json: bool,
    },
    Metrics {
        #[arg(long)]
        project: String,
        #[arg(long)]
        run: String,
        #[arg(long)]
        json: bool,
    },
    SystemMetrics {
        #[arg(long)]
        project: String,
        #[arg(long)]
        run: String,
        #[arg(long)]
        json: bool,
    },
    Alerts {
        #[arg(long)]
        project: String,
        #[arg(long)]
        run: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Reports {
        #[arg(long)]
        project: String,
        #[arg(long)]
        run: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum GetCommand {
    Project {
        #[arg(long)]
        project: String,
        #[arg(long)]
        json: bool,
    },
    Run {
        #[arg(long)]
        project: String,
        #[arg(long)]
        run: String,
        #[arg(long)]
        json: bool,
    },
    Metric {
        #[arg(long)]
        project: String,
        #[arg(long)]
        run: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        step: Option<i64>,
        /// Nearest point to this step
        #[arg(long)]
        around: Option<i64>,
        /// Nearest point to this RFC 3339 timestamp
        #[arg(long)]
        at_time: Option<String>,
        /// With --at-time: all points within this many seconds
        #[arg(long)]
        window: Option<f64>,
        #[arg(long)]
        json: bool,
    },
    SystemMetric {
        #[arg(long)]
        project: String,
        #[arg(long)]
        run: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        at_time: Option<String>,
        #[arg(long)]
        window: Option<f64>,
        #[arg(long)]
        json: bool,
    },
    Snapshot {
        #[arg(long)]
        project: String,
        #[arg(long)]
        json: bool,
    },
    Alerts {
        #[arg(long)]
        project: String,
        #[arg(long)]
        run: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Report {
        #[arg(long)]
        project: String,
        #[arg(long)]
        run: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("TRACKIO_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let args = Cli::parse();
    let cfg = Config::load();
    let store = Arc::new(ProjectStore::open_default());

    let result = dispatch(args.command, &cfg, &store).await;
    match result {
        Ok(()) => Ok(()),
        Err(e @ (TrackioError::NoRemote(_) | TrackioError::Other(_))) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn dispatch(
    command: Command,
    cfg: &Config,
    store: &Arc<ProjectStore>,
) -> Result<(), TrackioError> {
    match command {
        Command::Show {
            project,
            host,
            port,
            theme,
            color_palette,
            mcp_server,
        } => {
            // Pull any snapshots the mirror has that we don't
            if let Err(e) = Snapshotter::new(store.clone()).load().await {
                tracing::warn!(error = %e, "snapshot load failed, serving local data only");
            }
            if mcp_server {
                tracing::info!("MCP tool surface enabled over the query API");
            }
            if let Some(project) = &project {
                tracing::info!(project, "dashboard scoped to project");
            }
            let host = host.unwrap_or_else(|| "127.0.0.1".into());
            let port = port.unwrap_or(7860);
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .map_err(|e| TrackioError::Other(anyhow::anyhow!("invalid --host: {e}")))?;
            let state = ServerState {
                store: store.clone(),
                token: cfg.hf_token.clone(),
                hints: DashboardHints {
                    theme,
                    color_palette: color_palette.or_else(|| cfg.color_palette.clone()),
                    plot_order: cfg.plot_order.clone(),
                },
            };
            println!("* Dashboard server at: http://{addr}");
            trackio::server::serve(addr, state).await?;
            Ok(())
        }
        Command::Status => cli::status(store).await,
        Command::Sync {
            project,
            all,
            space_id,
            private,
            force,
        } => {
            cli::sync(
                store,
                cli::SyncArgs {
                    project,
                    all,
                    space_id,
                    private,
                    force,
                },
            )
            .await
        }
        Command::List { what } => match what {
            ListCommand::Projects { json } => {
                cli::list_projects(store, json);
                Ok(())
            }
            ListCommand::Runs { project, json } => cli::list_runs(store, &project, json).await,
            ListCommand::Metrics { project, run, json } => {
                cli::list_metrics(store, &project, &run, json).await
            }
            ListCommand::SystemMetrics { project, run, json } => {
                cli::list_system_metrics(store, &project, &run, json).await
            }
            ListCommand::Alerts { project, run, json } => {
                cli::list_alerts(store, &project, run.as_deref(), json).await
            }
            ListCommand::Reports { project, run, json } => {
                cli::list_reports(store, &project, run.as_deref(), json).await
            }
        },
        Command::Get { what } => match what {
            GetCommand::Project { project, json } => cli::get_project(store, &project, json).await,
            GetCommand::Run { project, run, json } => {
                cli::get_run(store, &project, &run, json).await
            }
            GetCommand::Metric {
                project,
                run,
                name,
                step,
                around,
                at_time,
                window,
                json,
            } => {
                cli::get_metric(
                    store,
                    &project,
                    &run,
                    &name,
                    cli::PointQuery {
                        step,
                        around,
                        at_time,
                        window,
                    },
                    json,
                )
                .await
            }
            GetCommand::SystemMetric {
                project,
                run,
                name,
                at_time,
                window,
                json,
            } => {
                cli::get_system_metric(
                    store,
                    &project,
                    &run,
                    &name,
                    cli::PointQuery {
                        step: None,
                        around: None,
                        at_time,
                        window,
                    },
                    json,
                )
                .await
            }
            GetCommand::Snapshot { project, json } => {
                cli::get_snapshot(store, &project, json).await
            }
            GetCommand::Alerts { project, run, json } => {
                cli::get_alerts(store, &project, run.as_deref(), json).await
            }
            GetCommand::Report {
                project,
                run,
                name,
                json,
            } => cli::get_report(store, &project, &run, name.as_deref(), json).await,
        },
    }
}
