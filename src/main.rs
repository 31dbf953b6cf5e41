use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use zoekt_coordinator::auth::TokenHasher;
use zoekt_coordinator::config::{ServerConfig, Settings};
use zoekt_coordinator::coordinator::{Clock, Context, Maintenance, WallClock};
use zoekt_coordinator::server::{AppState, create_router};
use zoekt_coordinator::store::{SqliteStore, Store};

const NOT_INITIALIZED: &str =
    "Coordinator not initialized. Run 'zoekt-coordinator admin init' first.";

#[cfg(unix)]
fn set_restrictive_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to set permissions on {}: {e}", path.display());
    }
}

#[derive(Parser)]
#[command(name = "zoekt-coordinator")]
#[command(about = "Coordinates a fleet of Zoekt index nodes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the HTTP server and the maintenance loop
    Serve {
        /// TOML config file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long, short)]
        port: Option<u16>,

        /// Data directory holding the database
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create the database and the admin token
    Init {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Print only the token
        #[arg(long)]
        non_interactive: bool,
    },

    /// Show settings, or change them with --set
    Settings {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// `key=value`, may be repeated
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
}

fn open_store(data_dir: &Path) -> anyhow::Result<SqliteStore> {
    let config = ServerConfig {
        data_dir: data_dir.to_path_buf(),
        ..ServerConfig::default()
    };
    if !config.db_path().exists() {
        bail!(NOT_INITIALIZED);
    }
    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;
    Ok(store)
}

fn run_init(data_dir: PathBuf, non_interactive: bool) -> anyhow::Result<()> {
    let config = ServerConfig {
        data_dir,
        ..ServerConfig::default()
    };
    fs::create_dir_all(&config.data_dir)?;

    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;

    let token_file = config.admin_token_path();
    if store.has_admin_token()? {
        bail!(
            "Coordinator already initialized. Admin token exists at: {}",
            token_file.display()
        );
    }

    let issued = TokenHasher::new().issue(
        &store,
        true,
        Some("admin".to_string()),
        None,
        WallClock.now(),
    )?;
    fs::write(&token_file, &issued.raw)?;

    #[cfg(unix)]
    set_restrictive_permissions(&token_file);

    if non_interactive {
        println!("{}", issued.raw);
        return Ok(());
    }

    println!();
    println!("========================================");
    println!("Admin token (save this, it won't be shown again):");
    println!();
    println!("  {}", issued.raw);
    println!();
    println!("Token also written to: {}", token_file.display());
    println!("========================================");
    println!();

    Ok(())
}

fn run_settings(data_dir: &Path, assignments: &[String]) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;

    for assignment in assignments {
        let Some((key, value)) = assignment.split_once('=') else {
            bail!("expected KEY=VALUE, got '{assignment}'");
        };
        Settings::update(&store, key.trim(), value)?;
    }

    for (key, value) in Settings::raw_values(&store)? {
        println!("{key} = {value}");
    }
    Ok(())
}

fn load_config(
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<ServerConfig> {
    let mut config = match config {
        Some(path) => ServerConfig::from_file(&path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(data_dir) = data_dir {
        config.data_dir = data_dir;
    }
    Ok(config)
}

/// Runs one maintenance pass per tick, each with freshly loaded settings.
async fn maintenance_loop(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: ServerConfig) {
    let mut interval = tokio::time::interval(config.maintenance_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let store = Arc::clone(&store);
        let clock = Arc::clone(&clock);
        let batch_size = config.batch_size;
        let pass = tokio::task::spawn_blocking(move || {
            let settings = Settings::load(store.as_ref())?;
            let ctx = Context::new(store.as_ref(), &settings, clock.as_ref());
            Maintenance::new(ctx, batch_size).run_once()
        })
        .await;

        match pass {
            Ok(Ok(report)) => info!(?report, "Maintenance pass finished"),
            Ok(Err(e)) => tracing::error!(error = %e, "Maintenance pass failed"),
            Err(e) => tracing::error!(error = %e, "Maintenance task panicked"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");
}

async fn run_serve(config: ServerConfig) -> anyhow::Result<()> {
    if !config.db_path().exists() {
        bail!(NOT_INITIALIZED);
    }
    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;
    if !store.has_admin_token()? {
        bail!(NOT_INITIALIZED);
    }

    let store: Arc<dyn Store> = Arc::new(store);
    let clock: Arc<dyn Clock> = Arc::new(WallClock);

    tokio::spawn(maintenance_loop(
        Arc::clone(&store),
        Arc::clone(&clock),
        config.clone(),
    ));

    let app = create_router(Arc::new(AppState::new(store, clock)));
    let addr = config.socket_addr()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("zoekt_coordinator=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Admin { command } => match command {
            AdminCommands::Init {
                data_dir,
                non_interactive,
            } => run_init(data_dir, non_interactive)?,
            AdminCommands::Settings { data_dir, set } => run_settings(&data_dir, &set)?,
        },
        Commands::Serve {
            config,
            host,
            port,
            data_dir,
        } => run_serve(load_config(config, host, port, data_dir)?).await?,
    }

    Ok(())
}
