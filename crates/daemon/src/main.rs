//! AListLite supervisor
//!
//! Runs the AList engine as a managed child process and controls it from the
//! command line.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alistlite_daemon::config::Config;
use alistlite_daemon::ipc::{
    self, get_pid_file_path, get_socket_path, get_supervisor_pid, ControlHandler, IpcClient,
    IpcServer, PidFile,
};
use alistlite_daemon::protocol::{ControlResponse, ServerState, StatusEvent, UpdateInfo};
use alistlite_daemon::{
    permissions, systemd, ConfigAccessor, FlagStore, LogListener, ProcessEngine, Supervisor,
    SupervisorSettings, SystemdKeepAlive, UpdateChecker,
};
use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// AListLite supervisor - keeps the AList file server running.
#[derive(Parser, Debug)]
#[command(name = "alistlite")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the supervisor in the foreground
    Serve {
        /// Run as a systemd service (plain log output, sd_notify)
        #[arg(long)]
        systemd: bool,

        /// Start the engine as soon as the supervisor is up
        #[arg(long)]
        autostart: bool,
    },

    /// Start the engine
    Start,

    /// Stop the engine
    Stop {
        /// Graceful shutdown budget in milliseconds (default: from config)
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Start the engine if stopped, stop it if running
    Toggle,

    /// Show engine status
    Status,

    /// Print the address the engine is reachable at
    Address,

    /// Print status events as they happen
    Watch,

    /// Change the engine's admin password
    SetPassword {
        /// New password
        password: String,
    },

    /// Print the engine's admin username
    AdminUser,

    /// Stop the engine and shut the supervisor down
    Quit,

    /// Inspect or replace the engine's config.json
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Check for a newer AListLite release
    CheckUpdate {
        /// Version to compare against (default: this build's version)
        #[arg(long)]
        current: Option<String>,
    },

    /// Show which host permissions are available
    Permissions {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print a systemd unit file for the supervisor
    UnitFile {
        /// Path of the alistlite executable (default: this executable)
        #[arg(long, value_name = "PATH")]
        exec: Option<String>,
    },
}

/// Subcommands for the engine's config.json.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the whole file
    Show,

    /// Print one value by dotted path, e.g. `scheme.http_port`
    Get {
        path: String,
    },

    /// Replace the file with the contents of FILE (`-` for stdin)
    Write {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let overrides = config.apply_env_overrides();
    config.validate()?;

    let serve_mode = match &cli.command {
        Commands::Serve { systemd, .. } => Some(*systemd),
        _ => None,
    };
    let _log_guards = init_logging(&config, cli.verbose, serve_mode)?;
    for (variable, value) in &overrides {
        tracing::info!("Configuration overridden from environment: {}={}", variable, value);
    }

    match cli.command {
        Commands::Serve { autostart, .. } => {
            run_serve(config, autostart).await?;
        }
        Commands::Start => {
            let address = connect(&config).await?.start().await?;
            println!("Engine running at {}", address);
        }
        Commands::Stop { timeout_ms } => {
            connect(&config).await?.stop(timeout_ms).await?;
            println!("Engine stopped");
        }
        Commands::Toggle => match connect(&config).await?.toggle().await? {
            Some(address) => println!("Engine running at {}", address),
            None => println!("Engine stopped"),
        },
        Commands::Status => {
            let response = connect(&config).await?.status().await?;
            print_status(&response);
        }
        Commands::Address => match connect(&config).await?.status().await? {
            ControlResponse::Status {
                address: Some(address),
                ..
            } => println!("{}", address),
            _ => bail!("Engine is not running"),
        },
        Commands::Watch => {
            let mut events = connect(&config).await?.subscribe().await?;
            while let Some(event) = events.next().await? {
                println!("{}", describe_event(&event));
            }
        }
        Commands::SetPassword { password } => {
            connect(&config).await?.set_admin_password(&password).await?;
            println!("Admin password updated");
        }
        Commands::AdminUser => {
            println!("{}", connect(&config).await?.admin_user().await?);
        }
        Commands::Quit => {
            connect(&config).await?.quit().await?;
            println!("Supervisor is shutting down");
        }
        Commands::Config(cmd) => {
            let accessor = ConfigAccessor::new(&config.daemon.data_dir);
            match cmd {
                ConfigCommands::Show => println!("{}", accessor.read_or_placeholder()),
                ConfigCommands::Get { path } => println!("{}", accessor.value(&path)?),
                ConfigCommands::Write { file } => {
                    let text = read_input(&file)?;
                    accessor.write_raw(&text)?;
                    println!("Saved {}", accessor.path().display());
                }
            }
        }
        Commands::CheckUpdate { current } => {
            let current = current.unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
            let checker = UpdateChecker::new(&config.update)?;
            match checker.check(&current).await {
                Ok(Some(info)) => print_update(&info),
                Ok(None) => println!("AListLite v{} is the latest version", current),
                Err(e) => {
                    tracing::debug!("Update check failed: {}", e);
                    eprintln!("Couldn't check for updates right now. Try again later.");
                    std::process::exit(1);
                }
            }
        }
        Commands::Permissions { json } => {
            let items = permissions::inspect(&config);
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                for item in &items {
                    let mark = if item.granted { "granted" } else { "missing" };
                    println!("  {:<16} {:<8} {}", item.name, mark, item.description);
                }
            }
        }
        Commands::UnitFile { exec } => {
            let exec = match exec {
                Some(exec) => exec,
                None => std::env::current_exe()
                    .context("Failed to resolve the current executable")?
                    .display()
                    .to_string(),
            };
            print!("{}", systemd::generate_unit_file(Some(&exec)));
        }
    }

    Ok(())
}

/// Set up tracing. In serve mode an append-mode log file is written under the
/// state directory as well.
fn init_logging(
    config: &Config,
    verbose: bool,
    serve_mode: Option<bool>,
) -> anyhow::Result<Vec<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(&config.daemon.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    let systemd_mode = serve_mode == Some(true);
    // journald adds its own timestamps
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(stderr)
        .with_ansi(!systemd_mode);

    let Some(_) = serve_mode else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(vec![stderr_guard]);
    };

    let log_dir = config.state_dir().join("log");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    let log_path = log_dir.join("supervisor.log");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;
    let (file, file_guard) = tracing_appender::non_blocking(file);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(vec![stderr_guard, file_guard])
}

/// Run the supervisor until SIGTERM, Ctrl-C or a `quit` request.
async fn run_serve(config: Config, autostart: bool) -> anyhow::Result<()> {
    if let Some(pid) = get_supervisor_pid() {
        bail!(
            "Supervisor already running (PID: {}). Stop it with `alistlite quit`.",
            pid
        );
    }
    let _pidfile = PidFile::create(get_pid_file_path()).context("Failed to write PID file")?;

    let flags = FlagStore::open(config.state_dir()).context("Failed to open flag store")?;
    let supervisor = Supervisor::new(
        ProcessEngine::new(&config.engine),
        SupervisorSettings::from_config(&config),
        flags,
        Box::new(SystemdKeepAlive::new()),
    );
    let log_listener = supervisor.broadcaster().register(LogListener);

    let shutdown = CancellationToken::new();
    let socket_path = get_socket_path();
    let server = IpcServer::bind(&socket_path)
        .await
        .with_context(|| format!("Failed to bind control socket {}", socket_path.display()))?;
    let ipc_task = tokio::spawn(ipc::serve(
        server,
        ControlHandler::new(supervisor.clone(), shutdown.clone()),
    ));

    if config.update.check_on_start {
        let broadcaster = supervisor.broadcaster();
        let update_config = config.update.clone();
        tokio::spawn(async move {
            let checker = match UpdateChecker::new(&update_config) {
                Ok(checker) => checker,
                Err(e) => {
                    tracing::warn!("Update checker unavailable: {}", e);
                    return;
                }
            };
            if let Some(info) = checker.check_for_update(env!("CARGO_PKG_VERSION")).await {
                broadcaster.publish(StatusEvent::UpdateAvailable(info));
            }
        });
    }

    if autostart || config.daemon.autostart {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.start().await {
                tracing::error!("Autostart failed: {}", e);
            }
        });
    }

    // Fed until the engine is down so systemd never kills a live supervisor
    let watchdog_stop = CancellationToken::new();
    let watchdog = systemd::spawn_watchdog(watchdog_stop.clone());

    systemd::notify_ready();
    tracing::info!("Supervisor ready (PID {})", std::process::id());

    tokio::select! {
        _ = systemd::shutdown_signal() => {}
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    systemd::notify_stopping();
    supervisor.stop_default().await;

    watchdog_stop.cancel();
    if let Some(watchdog) = watchdog {
        let _ = watchdog.await;
    }

    if let Err(e) = ipc_task.await {
        tracing::warn!("Control socket task failed: {}", e);
    }
    log_listener.abort();
    tracing::info!("Supervisor stopped");
    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<IpcClient> {
    let client = IpcClient::connect(&get_socket_path())
        .await
        .map_err(|_| anyhow!("Supervisor is not running (start it with `alistlite serve`)"))?;
    Ok(client.with_lifecycle_timeout(config.engine.lifecycle_request_timeout()))
}

fn read_input(file: &Path) -> anyhow::Result<String> {
    if file == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))
    }
}

fn print_status(response: &ControlResponse) {
    let ControlResponse::Status {
        state,
        address,
        running,
        uptime_secs,
    } = response
    else {
        return;
    };

    println!("Engine: {}", state);
    if let Some(address) = address {
        println!("  Address:   {}", address);
    }
    println!(
        "  Listening: {}",
        if *running { "yes" } else { "no" }
    );
    if *state == ServerState::Running {
        println!("  Uptime:    {}", format_duration(*uptime_secs));
    }
}

fn print_update(info: &UpdateInfo) {
    println!("AListLite v{} is available", info.version);
    if let Some(engine) = &info.engine_version {
        println!("  Bundled AList: v{}", engine);
    }
    for url in &info.download_urls {
        println!("  Download: {}", url);
    }
    if !info.changelog.trim().is_empty() {
        println!();
        println!("{}", info.changelog.trim());
    }
}

fn describe_event(event: &StatusEvent) -> String {
    match event {
        StatusEvent::StateChanged {
            state,
            address: Some(address),
        } => format!("{} {}", state, address),
        StatusEvent::StateChanged { state, address: None } => state.to_string(),
        StatusEvent::UpdateAvailable(info) => format!("update v{}", info.version),
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let d = Duration::from_secs(secs);
    let hours = d.as_secs() / 3600;
    let minutes = (d.as_secs() % 3600) / 60;
    let seconds = d.as_secs() % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
