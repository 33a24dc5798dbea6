use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use onedrive_gateway::api::drive::{ItemKind, RemoteItem};
use onedrive_gateway::session::RefreshOutcome;
use onedrive_gateway::upload_manager::{UploadProgressUpdate, UploadQueue, UploadStatus};
use onedrive_gateway::{Config, DriveError, DriveResult, Gateway};

#[derive(Parser)]
#[command(name = "onedrive-gateway", version, about = "OneDrive access from the command line")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, default_value = "onedrive-gateway.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in through the system browser.
    Login,
    /// Forget the stored session.
    Logout,
    /// Show the signed-in user.
    Whoami,
    /// List a folder.
    Ls { path: Option<String> },
    /// Show one item.
    Stat { path: String },
    /// Show the breadcrumb trail of a folder.
    Breadcrumbs { path: String },
    /// Print a short-lived download URL.
    DownloadUrl { path: String },
    /// Upload a local file.
    Upload {
        file: PathBuf,
        #[arg(default_value = "")]
        dest: String,
    },
    /// Copy a file from a public URL into the drive.
    UploadUrl {
        url: String,
        #[arg(default_value = "")]
        dest: String,
    },
    /// Resume uploads left unfinished by an earlier run.
    Resume,
    /// Refresh the session if it is close to expiry.
    Refresh {
        /// Keep running and refresh periodically.
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "onedrive_gateway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            if err.is_auth() {
                eprintln!("please run `onedrive-gateway login` to sign in");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> DriveResult<ExitCode> {
    let config = Config::load(Some(cli.config.as_path()))?;
    let gateway = Gateway::from_config(config)?;

    match cli.command {
        Command::Login => {
            let session = gateway.login_flow().run_with_browser().await?;
            println!(
                "signed in as {}",
                session.display_name().unwrap_or("unknown user")
            );
        }
        Command::Logout => {
            gateway.sessions().logout()?;
            println!("signed out");
        }
        Command::Whoami => {
            let session = gateway.sessions().require_auth().await?;
            println!("{}", session.display_name().unwrap_or("unknown user"));
            println!("token expires at {}", session.expires_at);
        }
        Command::Ls { path } => {
            let children = gateway
                .paths()
                .get_children_by_path(path.as_deref().unwrap_or(""))
                .await?;
            for item in &children {
                print_item(item);
            }
        }
        Command::Stat { path } => {
            let item = gateway.paths().get_item_by_path(&path).await?;
            print_item(&item);
            println!("id: {}", item.id);
            if let Some(modified) = item.last_modified {
                println!("modified: {modified}");
            }
            if let Some(web_url) = &item.web_url {
                println!("web: {web_url}");
            }
        }
        Command::Breadcrumbs { path } => {
            for crumb in gateway.paths().get_path_components(&path).await? {
                println!("{}\t{}\t{}", crumb.id, crumb.name, crumb.path);
            }
        }
        Command::DownloadUrl { path } => {
            let item = gateway.paths().get_item_by_path(&path).await?;
            println!("{}", gateway.items().get_download_url(&item.id).await?);
        }
        Command::Upload { file, dest } => {
            let queue = gateway.upload_queue();
            let mut updates = queue.subscribe();
            let task = queue.enqueue_file(&file, dest).await?;
            let ids = HashSet::from([task.task_id]);
            return Ok(wait_for_uploads(&queue, &mut updates, ids).await);
        }
        Command::UploadUrl { url, dest } => {
            let queue = gateway.upload_queue();
            let mut updates = queue.subscribe();
            let task = queue.enqueue_url(url, dest)?;
            let ids = HashSet::from([task.task_id]);
            return Ok(wait_for_uploads(&queue, &mut updates, ids).await);
        }
        Command::Resume => {
            let queue = gateway.upload_queue();
            let mut updates = queue.subscribe();
            let ids: HashSet<String> = queue
                .snapshot()
                .active
                .into_iter()
                .map(|task| task.task_id)
                .collect();
            let started = queue.resume_interrupted();
            println!("resuming {started} upload(s)");
            return Ok(wait_for_uploads(&queue, &mut updates, ids).await);
        }
        Command::Refresh { watch: false } => {
            let threshold = gateway.config().session.background_threshold();
            match gateway.sessions().refresh_if_expiring(threshold).await? {
                RefreshOutcome::NoSession => {
                    return Err(DriveError::Auth("no active session".to_string()))
                }
                RefreshOutcome::Fresh => println!("session is fresh"),
                RefreshOutcome::Refreshed(expires_at) => {
                    println!("refreshed; expires at {expires_at}")
                }
                RefreshOutcome::Revoked => {
                    return Err(DriveError::Auth("session was revoked".to_string()))
                }
                RefreshOutcome::Deferred(reason) => println!("refresh deferred: {reason}"),
            }
        }
        Command::Refresh { watch: true } => {
            let shutdown = CancellationToken::new();
            let refresher = gateway.spawn_refresher(shutdown.clone());
            tokio::signal::ctrl_c().await?;
            shutdown.cancel();
            if let Err(err) = refresher.await {
                tracing::error!(error = %err, "refresher task ended abnormally");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_item(item: &RemoteItem) {
    match &item.kind {
        ItemKind::Folder { child_count } => {
            println!("{}/\t{} items", item.name, child_count.unwrap_or_default())
        }
        ItemKind::File { .. } => println!("{}\t{} bytes", item.name, item.size.unwrap_or_default()),
    }
}

/// Prints progress until every task in `ids` has completed or failed.
async fn wait_for_uploads(
    queue: &UploadQueue,
    updates: &mut broadcast::Receiver<UploadProgressUpdate>,
    mut ids: HashSet<String>,
) -> ExitCode {
    let mut failed = 0usize;
    while !ids.is_empty() {
        match updates.recv().await {
            Ok(update) if ids.contains(&update.task_id) => {
                if let Some(total) = update.total_size.filter(|_| update.status == UploadStatus::Uploading) {
                    eprint!("\r{}: {}/{} bytes", update.task_id, update.bytes_sent, total);
                }
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
        ids.retain(|id| match queue.task(id) {
            Some(task) if task.status == UploadStatus::Completed => {
                eprintln!();
                println!("uploaded {} to /{}", task.file_name, task.dest_path.trim_start_matches('/'));
                false
            }
            Some(task) if task.status == UploadStatus::Failed => {
                eprintln!();
                eprintln!(
                    "upload of {} failed: {}",
                    task.file_name,
                    task.error_message.unwrap_or_default()
                );
                failed += 1;
                false
            }
            Some(_) => true,
            None => false,
        });
    }
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
