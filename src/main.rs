use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::json;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use komari::alerting::AlertEvaluator;
use komari::config::{ConfigStore, DEFAULT_CONFIG_PATH};
use komari::db;
use komari::db::services::accounts;
use komari::event::{Event, EventBus};
use komari::notifications::NotificationHub;
use komari::pipeline::RecordPipeline;
use komari::rpc::{methods, RpcRegistry};
use komari::scheduler::{self, ping::PingScheduler};
use komari::server::latest::LatestStateCache;
use komari::server::registry::AgentRegistry;
use komari::server::terminal::TerminalBridge;
use komari::server::{self, AppState};
use komari::version::VERSION;
use komari::web;

#[derive(Parser, Debug)]
#[command(name = "komari", version = VERSION, about = "Self-hosted fleet monitoring server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the monitoring server.
    Server,
    /// Force-reset the admin password and revoke every session.
    Chpasswd {
        #[arg(short, long)]
        password: String,
    },
    /// Re-enable password login after a lockout.
    PermitLogin,
}

fn init_logging() {
    let file_appender = rolling::daily("logs", "komari.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sea_orm=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();
    dotenv().ok();

    match cli.command.unwrap_or(Command::Server) {
        Command::Server => run_server().await,
        Command::Chpasswd { password } => run_chpasswd(&password).await,
        Command::PermitLogin => run_permit_login().await,
    }
}

fn config_path() -> String {
    std::env::var("KOMARI_CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned())
}

async fn open_stores() -> anyhow::Result<(Arc<EventBus>, Arc<ConfigStore>, sea_orm::DatabaseConnection)> {
    let bus = EventBus::new();
    let config = Arc::new(
        ConfigStore::open(config_path(), bus.clone())
            .await
            .context("loading configuration")?,
    );

    let snapshot = config.get();
    if snapshot.database.driver == "sqlite" {
        if let Some(parent) = Path::new(&snapshot.database.file).parent() {
            std::fs::create_dir_all(parent).context("creating the data directory")?;
        }
    }
    let db = db::connect(&snapshot.connection_url())
        .await
        .context("opening the database")?;
    db::migrate::run(&db, &config)
        .await
        .context("running schema migrations")?;
    Ok((bus, config, db))
}

async fn run_chpasswd(password: &str) -> anyhow::Result<()> {
    let (_bus, _config, db) = open_stores().await?;
    let Some(user) = accounts::first_user(&db).await? else {
        println!("No user exists yet; start the server once to create the admin account.");
        return Ok(());
    };
    println!("Changing password for user: {}", user.username);
    accounts::force_reset_password(&db, &user.username, password)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let revoked = accounts::delete_all_sessions(&db).await?;
    println!("Password changed; {revoked} session(s) revoked.");
    Ok(())
}

async fn run_permit_login() -> anyhow::Result<()> {
    let (_bus, config, _db) = open_stores().await?;
    config
        .save_partial(json!({"login": {"disable_password_login": false}}))
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("Password login re-enabled.");
    Ok(())
}

async fn run_server() -> anyhow::Result<()> {
    info!(version = VERSION, "starting komari server");
    let (bus, config, db) = open_stores().await?;

    bus.trigger(Event::ProcessStart)
        .await
        .map_err(|e| anyhow::anyhow!("process.start listener failed: {e}"))?;

    if let Some((username, password)) = accounts::ensure_default_admin(&db)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?
    {
        info!(username, password, "created the default admin account");
    }

    let shutdown = CancellationToken::new();
    let latest = LatestStateCache::new();
    let agents = AgentRegistry::new();
    let terminals = TerminalBridge::new();
    let ping = PingScheduler::new(db.clone(), agents.clone(), shutdown.clone());
    let notifier = NotificationHub::new(config.clone(), bus.clone()).await;
    notifier.register(&bus);

    let rpc = RpcRegistry::new();
    methods::register_all(&rpc);

    let state = Arc::new(AppState {
        db: db.clone(),
        bus: bus.clone(),
        config: config.clone(),
        agents,
        latest: latest.clone(),
        ping,
        notifier: notifier.clone(),
        rpc,
        terminals,
        shutdown: shutdown.clone(),
    });
    server::register_lifecycle_listeners(&state);

    let pipeline = RecordPipeline::new(db.clone(), latest.clone(), config.clone());
    pipeline.register(&bus);
    let evaluator = AlertEvaluator::new(db.clone(), latest, config.clone(), notifier);
    evaluator.register(&bus);
    scheduler::start_tickers(bus.clone(), shutdown.clone());

    bus.trigger(Event::ServerInitStart)
        .await
        .map_err(|e| anyhow::anyhow!("server.init.start listener failed: {e}"))?;

    let listen = std::env::var("KOMARI_LISTEN").unwrap_or_else(|_| "0.0.0.0:25774".to_owned());
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(address = %listen, "listening");

    let router = web::build_router(state.clone());
    bus.trigger(Event::ServerInitDone)
        .await
        .map_err(|e| anyhow::anyhow!("server.init.done listener failed: {e}"))?;

    let graceful = {
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_err() {
                error!("failed to install the signal handler");
            }
            info!("shutdown signal received");
            shutdown.cancel();
        }
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(graceful)
        .await
        .context("serving")?;

    // Stop workers, give in-flight handlers a bounded grace, then release
    // the pool.
    shutdown.cancel();
    state.ping.stop_all().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    bus.trigger_async(Event::ProcessExit);
    if let Err(e) = db.close().await {
        warn!(error = %e, "closing the database pool failed");
    }
    info!("bye");
    Ok(())
}
