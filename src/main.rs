use tracing_subscriber::EnvFilter;

use examsy_portal::api::{routes, AppContext};
use examsy_portal::cache::FileCache;
use examsy_portal::config::Config;
use examsy_portal::remote::HttpRemoteStore;
use examsy_portal::sync::{RefreshOutcome, SyncEngine};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(config.log_json);

    let remote = match HttpRemoteStore::new(config.remote.clone()) {
        Ok(remote) => remote,
        Err(e) => {
            tracing::error!(error = %e, "Cannot start without a remote store");
            std::process::exit(1);
        }
    };
    let cache = FileCache::new(&config.cache);
    tracing::info!(path = %cache.path().display(), "Using local cache");

    let engine = SyncEngine::new(remote, cache, config.sync.clone());
    match engine.bootstrap().await {
        RefreshOutcome::Accepted => {
            let counts = engine.current_dataset().counts();
            tracing::info!(
                students = counts.students,
                sessions = counts.sessions,
                rooms = counts.rooms,
                "Initial snapshot loaded"
            );
        }
        outcome => tracing::warn!(outcome = ?outcome, "Starting without a fresh snapshot"),
    }
    engine.start_polling();

    let ctx = AppContext {
        engine: engine.clone(),
        admin: config.admin.clone(),
        monitor: config.monitor.clone(),
    };
    let routes = routes::portal_routes(ctx);

    let (ip, port) = config.bind_address();
    tracing::info!(host = %config.server.host, port, "Examsy portal listening");

    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown((ip, port), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    });
    server.await;

    engine.stop_polling();
    tracing::info!("Examsy portal stopped");
}
