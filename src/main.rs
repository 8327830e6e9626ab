use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use hyper::header::HeaderValue;
use log::{error, info, warn};

use convo_relay::directory::{Directory, DirectoryError, MemoryDirectory};
use convo_relay::inactivity::{self, InactivityJob, InactivityPolicy, LogMailer};
use convo_relay::{server, AppContext, Authenticator, Config, Realtime};

async fn open_directory(config: &Config) -> Result<Arc<dyn Directory>, DirectoryError> {
    #[cfg(feature = "postgres")]
    if let Some(db_url) = config.database_url.as_deref() {
        let dir = convo_relay::directory::PgDirectory::connect(db_url).await?;
        info!("Postgres directory enabled (DATABASE_URL set).");
        return Ok(Arc::new(dir));
    }
    #[cfg(not(feature = "postgres"))]
    if config.database_url.is_some() {
        warn!("DATABASE_URL is set but this build has no postgres support; ignoring it.");
    }

    match config.directory_seed.as_ref() {
        Some(path) => {
            let dir = MemoryDirectory::from_seed_file(path).await?;
            info!("In-memory directory seeded from {}", path.display());
            Ok(Arc::new(dir))
        }
        None => {
            warn!("No DATABASE_URL or DIRECTORY_SEED; starting with an empty directory.");
            Ok(Arc::new(MemoryDirectory::new()))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Healthcheck mode: exit 0 if server is running (port in use), exit 1 if not
    if std::env::args().any(|a| a == "--healthcheck") {
        use std::net::TcpListener;
        let port = std::env::var("PORT").unwrap_or_else(|_| convo_relay::config::DEFAULT_PORT.to_string());
        return match TcpListener::bind(format!("127.0.0.1:{}", port)) {
            Ok(_) => ExitCode::FAILURE, // Port free = server NOT running
            Err(_) => ExitCode::SUCCESS, // Port in use = server IS running (healthy)
        };
    }

    env_logger::init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let directory = match open_directory(&config).await {
        Ok(dir) => dir,
        Err(e) => {
            error!("Failed to open directory: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let job = Arc::new(InactivityJob::new(
        directory.clone(),
        Arc::new(LogMailer),
        InactivityPolicy::default(),
    ));

    if std::env::args().any(|a| a == "--run-inactivity-once") {
        info!("Manually running inactive user notifications job - {}", Utc::now());
        return match job.run_once(Utc::now()).await {
            Ok(report) => {
                info!("Inactive user notifications completed: {:?}", report);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Error running inactive user notifications job: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    if config.inactivity_enabled {
        inactivity::spawn_weekly(job);
    } else {
        info!("Inactive user notifications disabled (INACTIVITY_ENABLED=false).");
    }

    let cors_origin = match HeaderValue::from_str(&config.cors_origin) {
        Ok(v) => v,
        Err(e) => {
            error!("Invalid CORS_ORIGIN {:?}: {}", config.cors_origin, e);
            return ExitCode::FAILURE;
        }
    };

    let ctx = AppContext {
        realtime: Realtime::new(directory.clone()),
        auth: Authenticator::new(&config.access_token_secret, directory),
        cors_origin,
        idle_timeout: config.idle_timeout,
    };

    let (addr, server) = match server::bind(&config.addr, ctx) {
        Ok(bound) => bound,
        Err(e) => {
            error!("Failed to bind {}: {}", config.addr, e);
            return ExitCode::FAILURE;
        }
    };

    info!("Conversation relay listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}", addr);
    info!("Presence API: http://{}/api/presence/{{userId}}", addr);
    info!("Health check: http://{}/health", addr);

    if let Err(e) = server.await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
