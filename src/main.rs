use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use dataviser::config::{EnvConfig, PREFIX, Settings};
use dataviser::group::{DEFAULT_GROUP, GroupParams, Orientation};
use dataviser::logger::{LogOutput, init_tracing};
use dataviser::script::builtin_catalogue;
use dataviser::worker::SUM_LABEL;
use dataviser::{Dataviser, HostConnection};
use dataviser_ipc::host::{FsHost, HostHandler, ScriptSource, Selection};
use dataviser_ipc::relay::serve_stdio;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "dataviser",
    about = "Ordered script pipeline and derived groups over tabular files",
    version = "0.1.0"
)]
struct Cli {
    /// `.env` file seeding the DATAVISER_* settings
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load files, derive one group and print it
    Run(RunArgs),

    /// Serve the privileged host on stdin/stdout
    Host(HostArgs),

    /// List the script catalogue
    Scripts(ScriptsArgs),
}

/// What the filesystem host answers to the pick dialogs.
#[derive(Args, Debug, Clone)]
struct HostArgs {
    #[arg(long = "file")]
    files: Vec<PathBuf>,

    #[arg(long = "dir")]
    dirs: Vec<PathBuf>,

    /// Directory of *.rhai scripts replacing the built-in catalogue
    #[arg(long)]
    scripts_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    host: HostArgs,

    #[arg(long, value_delimiter = ',')]
    ids: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    rows: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    cols: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// row, col or none
    #[arg(long, default_value = "none")]
    orient: Orientation,

    #[arg(long, default_value = DEFAULT_GROUP)]
    group: String,

    /// Run the host as a child process instead of in-process
    #[arg(long)]
    spawn_host: bool,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Args, Debug)]
struct ScriptsArgs {
    #[arg(long)]
    scripts_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&EnvConfig::new(Some(cli.env_file.as_path())))?;
    match cli.command {
        Commands::Run(args) => run(settings, args).await,
        Commands::Host(args) => host(settings, args).await,
        Commands::Scripts(args) => scripts(settings, args).await,
    }
}

fn script_source(settings: &Settings, scripts_dir: Option<&Path>) -> ScriptSource {
    match scripts_dir.or(settings.scripts_dir.as_deref()) {
        Some(dir) => ScriptSource::Dir(dir.to_path_buf()),
        None => ScriptSource::Inline(builtin_catalogue()),
    }
}

fn fs_host(settings: &Settings, args: &HostArgs) -> FsHost {
    FsHost::new(
        Selection {
            files: args.files.clone(),
            directories: args.dirs.clone(),
        },
        script_source(settings, args.scripts_dir.as_deref()),
    )
}

async fn run(mut settings: Settings, args: RunArgs) -> anyhow::Result<()> {
    if let Some(level) = &args.log_level {
        settings.log_level = level.clone();
    }
    init_tracing(&settings.log_config(None))?;

    let connection = if args.spawn_host {
        let mut command = Command::new(std::env::current_exe().context("cannot locate own executable")?);
        command.arg("host");
        for file in &args.host.files {
            command.arg("--file").arg(file);
        }
        for dir in &args.host.dirs {
            command.arg("--dir").arg(dir);
        }
        if let Some(dir) = &args.host.scripts_dir {
            command.arg("--scripts-dir").arg(dir);
        }
        command.env(format!("{PREFIX}LOG_LEVEL"), &settings.log_level);
        HostConnection::Process(command)
    } else {
        HostConnection::InProcess(Arc::new(fs_host(&settings, &args.host)))
    };

    let app = Dataviser::start(&settings, connection).await?;
    info!("dataviser ready");

    if !args.host.files.is_empty() {
        let ids = app.pick_and_load_files().await?;
        info!(frames = ids.len(), "files loaded");
    }
    if !args.host.dirs.is_empty() {
        let ids = app.pick_and_load_directories().await?;
        info!(frames = ids.len(), "directories loaded");
    }

    let mut failures = app.failures();
    let subscription = app.subscribe_group(GroupParams {
        group: args.group,
        ids: args.ids,
        exclude: args.exclude,
        rows: args.rows,
        cols: args.cols,
        orient: args.orient,
        ..Default::default()
    });
    app.pipeline().flush().await?;
    if app.group_version(subscription.group()) == 0 {
        // the failure report may trail the flush slightly
        let failure = tokio::time::timeout(Duration::from_secs(1), failures.recv()).await;
        let group = subscription.group().to_string();
        app.exit().await;
        match failure {
            Ok(Ok(failure)) => bail!("group `{group}` could not be derived: {}", failure.message),
            _ => bail!("group `{group}` was not derived"),
        }
    }

    let group = app.get_group(subscription.group()).unwrap_or(Value::Null);
    println!("{}", serde_json::to_string_pretty(&group)?);
    if let Some((labels, matrix)) = app.group_matrix(subscription.group(), SUM_LABEL) {
        println!("{}", serde_json::to_string_pretty(&json!({ "labels": labels, "matrix": matrix }))?);
    }

    subscription.unsubscribe();
    app.exit().await;
    Ok(())
}

async fn host(settings: Settings, args: HostArgs) -> anyhow::Result<()> {
    // stdout carries the envelopes
    init_tracing(&settings.log_config(Some(LogOutput::Stderr)))?;
    let handler = Arc::new(fs_host(&settings, &args));
    let shutdown = handler.shutdown_token();

    let interrupted = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted.cancel();
        }
    });

    info!("host serving on stdio");
    serve_stdio(handler, shutdown).await
}

async fn scripts(settings: Settings, args: ScriptsArgs) -> anyhow::Result<()> {
    let host = FsHost::new(
        Selection::default(),
        script_source(&settings, args.scripts_dir.as_deref()),
    );
    let catalogue = host.request_scripts().await?;
    for (name, source) in &catalogue {
        println!("{name}\t{} lines", source.lines().count());
    }
    Ok(())
}
